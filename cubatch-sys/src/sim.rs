//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Software device standing in for the native batch processor.
//!
//! Executes descriptor batches in order against a host-memory model so the
//! dispatcher can be exercised without GPU hardware. State is keyed by the
//! context handle, so independent contexts see independent devices.
//!
//! Device addresses come from a bump allocator with a LIFO free list:
//! freeing an allocation and allocating again inside the same batch reuses
//! the freed address, which makes free-before-allocate ordering observable
//! from the outside.

use std::collections::HashMap;
use std::ffi::c_int;
use std::sync::{Mutex, OnceLock};

use crate::{
    BatchOp, CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_OUT_OF_MEMORY, CUDA_SUCCESS, CUcontext,
    CUdeviceptr, CUresult, CallArgs,
};

const ADDR_BASE: CUdeviceptr = 0x1000_0000;
const ADDR_ALIGN: u64 = 256;

/// Grid, block and function handle of the most recent kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRecord {
    pub func: usize,
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
    pub stream: usize,
}

#[derive(Default)]
struct DeviceState {
    next_addr: CUdeviceptr,
    free_list: Vec<(CUdeviceptr, usize)>,
    allocs: HashMap<CUdeviceptr, Vec<u8>>,
    last_launch: Option<LaunchRecord>,
    batch_lengths: Vec<usize>,
}

static DEVICES: OnceLock<Mutex<HashMap<usize, DeviceState>>> = OnceLock::new();

fn with_device<R>(ctx: usize, f: impl FnOnce(&mut DeviceState) -> R) -> R {
    let mut map = DEVICES
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .expect("simulated device table lock");
    let dev = map.entry(ctx).or_default();
    if dev.next_addr == 0 {
        dev.next_addr = ADDR_BASE;
    }
    f(dev)
}

fn alloc_device(dev: &mut DeviceState, size: usize) -> Result<CUdeviceptr, CUresult> {
    if size == 0 {
        return Err(CUDA_ERROR_INVALID_VALUE);
    }
    // Most recently freed block that fits, otherwise bump.
    let addr = match dev.free_list.iter().rposition(|&(_, cap)| cap >= size) {
        Some(i) => dev.free_list.remove(i).0,
        None => {
            let addr = dev.next_addr;
            dev.next_addr += (size as u64).div_ceil(ADDR_ALIGN) * ADDR_ALIGN;
            addr
        }
    };
    dev.allocs.insert(addr, vec![0u8; size]);
    Ok(addr)
}

fn write_device(dev: &mut DeviceState, addr: CUdeviceptr, src: &[u8]) -> CUresult {
    match dev.allocs.get_mut(&addr) {
        Some(buf) if src.len() <= buf.len() => {
            buf[..src.len()].copy_from_slice(src);
            CUDA_SUCCESS
        }
        _ => CUDA_ERROR_INVALID_VALUE,
    }
}

/// Dispatch one descriptor. `args` may be mutated (output address fields).
fn exec(dev: &mut DeviceState, args: &mut CallArgs) -> CUresult {
    match args.op {
        BatchOp::SetCurrent | BatchOp::Sync => CUDA_SUCCESS,
        BatchOp::MallocDevice | BatchOp::MallocManaged => match alloc_device(dev, args.size) {
            Ok(addr) => {
                args.devptr0 = addr;
                CUDA_SUCCESS
            }
            Err(code) => code,
        },
        BatchOp::MallocHost => {
            if args.size == 0 {
                return CUDA_ERROR_INVALID_VALUE;
            }
            let p = unsafe { libc::malloc(args.size) };
            if p.is_null() {
                return CUDA_ERROR_OUT_OF_MEMORY;
            }
            args.ptr0 = p;
            CUDA_SUCCESS
        }
        BatchOp::FreeDevice => {
            if args.devptr0 == 0 {
                return CUDA_SUCCESS;
            }
            match dev.allocs.remove(&args.devptr0) {
                Some(buf) => {
                    dev.free_list.push((args.devptr0, buf.len()));
                    CUDA_SUCCESS
                }
                None => CUDA_ERROR_INVALID_VALUE,
            }
        }
        BatchOp::FreeHost => {
            unsafe { libc::free(args.ptr0) };
            CUDA_SUCCESS
        }
        BatchOp::MemcpyDtoD | BatchOp::MemcpyDtoDAsync => {
            let src = match dev.allocs.get(&args.devptr1) {
                Some(buf) if args.size <= buf.len() => buf[..args.size].to_vec(),
                _ => return CUDA_ERROR_INVALID_VALUE,
            };
            write_device(dev, args.devptr0, &src)
        }
        BatchOp::MemcpyHtoD | BatchOp::MemcpyHtoDAsync => {
            if args.ptr0.is_null() {
                return CUDA_ERROR_INVALID_VALUE;
            }
            let src =
                unsafe { std::slice::from_raw_parts(args.ptr0 as *const u8, args.size) };
            write_device(dev, args.devptr0, src)
        }
        BatchOp::MemcpyDtoH | BatchOp::MemcpyDtoHAsync => {
            if args.ptr0.is_null() {
                return CUDA_ERROR_INVALID_VALUE;
            }
            match dev.allocs.get(&args.devptr0) {
                Some(buf) if args.size <= buf.len() => {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            buf.as_ptr(),
                            args.ptr0 as *mut u8,
                            args.size,
                        );
                    }
                    CUDA_SUCCESS
                }
                _ => CUDA_ERROR_INVALID_VALUE,
            }
        }
        BatchOp::LaunchKernel | BatchOp::LaunchAndSync => {
            if args.func.is_null() {
                return CUDA_ERROR_INVALID_VALUE;
            }
            dev.last_launch = Some(LaunchRecord {
                func: args.func as usize,
                grid: (args.grid_dim_x, args.grid_dim_y, args.grid_dim_z),
                block: (args.block_dim_x, args.block_dim_y, args.block_dim_z),
                shared_mem_bytes: args.shared_mem_bytes,
                stream: args.stream as usize,
            });
            CUDA_SUCCESS
        }
        BatchOp::AllocAndCopy => {
            if args.ptr0.is_null() {
                return CUDA_ERROR_INVALID_VALUE;
            }
            let addr = match alloc_device(dev, args.size) {
                Ok(addr) => addr,
                Err(code) => return code,
            };
            args.devptr0 = addr;
            let src =
                unsafe { std::slice::from_raw_parts(args.ptr0 as *const u8, args.size) };
            write_device(dev, addr, src)
        }
    }
}

/// Software rendition of the native batch entry point.
///
/// Walks `count` descriptors strictly in order, writes one result code per
/// slot, and mutates allocate-style descriptors with their output address.
/// A failed slot does not stop later slots.
///
/// # Safety
/// Same contract as the native declaration: `calls` must point to `count`
/// valid descriptor pointers, `results` to `count` writable slots, and any
/// host pointers inside the descriptors must be valid for their operation.
pub unsafe extern "C" fn process(
    ctx: CUcontext,
    calls: *const *mut CallArgs,
    results: *mut CUresult,
    count: c_int,
) {
    let n = count.max(0) as usize;
    if n == 0 {
        return;
    }
    let call_ptrs = unsafe { std::slice::from_raw_parts(calls, n) };
    let out = unsafe { std::slice::from_raw_parts_mut(results, n) };
    with_device(ctx as usize, |dev| {
        dev.batch_lengths.push(n);
        for (slot, &args_ptr) in call_ptrs.iter().enumerate() {
            let args = unsafe { &mut *args_ptr };
            out[slot] = exec(dev, args);
        }
    });
}

/// Drop all state for `ctx`.
pub fn reset(ctx: CUcontext) {
    if let Some(map) = DEVICES.get() {
        map.lock().expect("simulated device table lock").remove(&(ctx as usize));
    }
}

/// How many times `process` ran for `ctx`.
pub fn process_invocations(ctx: CUcontext) -> usize {
    with_device(ctx as usize, |dev| dev.batch_lengths.len())
}

/// Descriptor count of every batch submitted for `ctx`, in order.
pub fn batch_lengths(ctx: CUcontext) -> Vec<usize> {
    with_device(ctx as usize, |dev| dev.batch_lengths.clone())
}

/// Number of live device allocations for `ctx`.
pub fn live_allocations(ctx: CUcontext) -> usize {
    with_device(ctx as usize, |dev| dev.allocs.len())
}

/// Contents of the allocation at `addr`, if live.
pub fn read_device(ctx: CUcontext, addr: CUdeviceptr) -> Option<Vec<u8>> {
    with_device(ctx as usize, |dev| dev.allocs.get(&addr).cloned())
}

/// The most recent kernel launch for `ctx`.
pub fn last_launch(ctx: CUcontext) -> Option<LaunchRecord> {
    with_device(ctx as usize, |dev| dev.last_launch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;

    fn ctx(tag: usize) -> CUcontext {
        tag as CUcontext
    }

    fn run(ctx_h: CUcontext, descs: &mut [CallArgs]) -> Vec<CUresult> {
        let mut ptrs: Vec<*mut CallArgs> = descs.iter_mut().map(|d| d as *mut _).collect();
        let mut results = vec![CUDA_SUCCESS; ptrs.len()];
        unsafe {
            process(
                ctx_h,
                ptrs.as_mut_ptr(),
                results.as_mut_ptr(),
                ptrs.len() as c_int,
            );
        }
        results
    }

    #[test]
    fn alloc_writes_address_back() {
        let c = ctx(0xA110);
        reset(c);
        let mut d = CallArgs::new(BatchOp::MallocDevice);
        d.size = 1024;
        let mut descs = [d];
        let results = run(c, &mut descs);
        assert_eq!(results, vec![CUDA_SUCCESS]);
        assert_ne!(descs[0].devptr0, 0);
        assert_eq!(live_allocations(c), 1);
    }

    #[test]
    fn zero_size_alloc_fails_per_slot() {
        let c = ctx(0xA111);
        reset(c);
        let mut descs = [CallArgs::new(BatchOp::MallocDevice)];
        let results = run(c, &mut descs);
        assert_eq!(results, vec![CUDA_ERROR_INVALID_VALUE]);
    }

    #[test]
    fn free_then_alloc_reuses_address_in_one_batch() {
        let c = ctx(0xA112);
        reset(c);
        let mut first = CallArgs::new(BatchOp::MallocDevice);
        first.size = 512;
        let mut descs = [first];
        run(c, &mut descs);
        let addr = descs[0].devptr0;

        let mut free = CallArgs::new(BatchOp::FreeDevice);
        free.devptr0 = addr;
        let mut realloc = CallArgs::new(BatchOp::MallocDevice);
        realloc.size = 512;
        let mut descs = [free, realloc];
        let results = run(c, &mut descs);
        assert_eq!(results, vec![CUDA_SUCCESS, CUDA_SUCCESS]);
        assert_eq!(descs[1].devptr0, addr);
    }

    #[test]
    fn failed_slot_does_not_stop_the_batch() {
        let c = ctx(0xA113);
        reset(c);
        let mut bad_free = CallArgs::new(BatchOp::FreeDevice);
        bad_free.devptr0 = 0xDEAD_0000;
        let mut alloc = CallArgs::new(BatchOp::MallocDevice);
        alloc.size = 64;
        let mut descs = [bad_free, alloc];
        let results = run(c, &mut descs);
        assert_eq!(results[0], CUDA_ERROR_INVALID_VALUE);
        assert_eq!(results[1], CUDA_SUCCESS);
        assert_ne!(descs[1].devptr0, 0);
    }

    #[test]
    fn htod_dtoh_round_trip() {
        let c = ctx(0xA114);
        reset(c);
        let payload: Vec<u8> = (0..64u8).collect();
        let mut alloc = CallArgs::new(BatchOp::MallocDevice);
        alloc.size = payload.len();
        let mut descs = [alloc];
        run(c, &mut descs);
        let addr = descs[0].devptr0;

        let mut up = CallArgs::new(BatchOp::MemcpyHtoD);
        up.devptr0 = addr;
        up.ptr0 = payload.as_ptr() as *mut c_void;
        up.size = payload.len();
        let mut back = vec![0u8; payload.len()];
        let mut down = CallArgs::new(BatchOp::MemcpyDtoH);
        down.devptr0 = addr;
        down.ptr0 = back.as_mut_ptr() as *mut c_void;
        down.size = payload.len();
        let mut descs = [up, down];
        let results = run(c, &mut descs);
        assert_eq!(results, vec![CUDA_SUCCESS, CUDA_SUCCESS]);
        assert_eq!(back, payload);
    }

    #[test]
    fn contexts_are_isolated() {
        let a = ctx(0xA115);
        let b = ctx(0xA116);
        reset(a);
        reset(b);
        let mut alloc = CallArgs::new(BatchOp::MallocDevice);
        alloc.size = 128;
        let mut descs = [alloc];
        run(a, &mut descs);
        assert_eq!(live_allocations(a), 1);
        assert_eq!(live_allocations(b), 0);
        assert_eq!(process_invocations(b), 0);
    }

    #[test]
    fn launch_records_dims() {
        let c = ctx(0xA117);
        reset(c);
        let mut launch = CallArgs::new(BatchOp::LaunchKernel);
        launch.func = 0x4242 as *mut c_void;
        launch.grid_dim_x = 4;
        launch.grid_dim_y = 2;
        launch.grid_dim_z = 1;
        launch.block_dim_x = 256;
        launch.block_dim_y = 1;
        launch.block_dim_z = 1;
        launch.shared_mem_bytes = 1024;
        let mut descs = [launch];
        let results = run(c, &mut descs);
        assert_eq!(results, vec![CUDA_SUCCESS]);
        let rec = last_launch(c).expect("launch recorded");
        assert_eq!(rec.func, 0x4242);
        assert_eq!(rec.grid, (4, 2, 1));
        assert_eq!(rec.block, (256, 1, 1));
        assert_eq!(rec.shared_mem_bytes, 1024);
    }
}
