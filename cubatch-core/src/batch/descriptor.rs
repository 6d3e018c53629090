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

//! Call descriptors: one heap-allocated `CallArgs` record per pending
//! operation, built by the per-operation constructors below. The box keeps
//! the record at a stable address so the reference array handed to the
//! native layer stays valid for the whole cycle.

use std::ffi::{c_uint, c_void};
use std::fmt;

use cubatch_sys::{BatchOp, CUdeviceptr, CallArgs};

use crate::batch::marshal::ArgBlock;
use crate::types::{Context, DevicePtr, Function, Stream};

/// A pending operation and its operands. Owned by the producer until
/// enqueued, then by the dispatcher until the batch containing it has been
/// submitted and its results consumed.
pub struct Descriptor {
    args: Box<CallArgs>,
}

// Safety: the raw pointers inside `CallArgs` are either owned by the
// dispatcher (marshaling blocks) or host buffers the enqueueing caller
// guarantees stay valid until its cycle completes; the descriptor itself is
// only ever touched by one thread at a time (producer, then the thread
// holding the submission lock).
unsafe impl Send for Descriptor {}

impl Descriptor {
    fn new(op: BatchOp) -> Self {
        Self { args: Box::new(CallArgs::new(op)) }
    }

    pub fn set_current(ctx: Context) -> Self {
        let mut d = Self::new(BatchOp::SetCurrent);
        d.args.ctx = ctx.as_raw();
        d
    }

    pub fn malloc_device(bytesize: usize) -> Self {
        let mut d = Self::new(BatchOp::MallocDevice);
        d.args.size = bytesize;
        d
    }

    pub fn malloc_host(bytesize: usize) -> Self {
        let mut d = Self::new(BatchOp::MallocHost);
        d.args.size = bytesize;
        d
    }

    pub fn malloc_managed(bytesize: usize) -> Self {
        let mut d = Self::new(BatchOp::MallocManaged);
        d.args.size = bytesize;
        d
    }

    pub fn free_device(mem: DevicePtr) -> Self {
        let mut d = Self::new(BatchOp::FreeDevice);
        d.args.devptr0 = mem.0;
        d
    }

    pub fn free_host(p: *mut c_void) -> Self {
        let mut d = Self::new(BatchOp::FreeHost);
        d.args.ptr0 = p;
        d
    }

    pub fn memcpy_dtod(dst: DevicePtr, src: DevicePtr, byte_count: usize) -> Self {
        let mut d = Self::new(BatchOp::MemcpyDtoD);
        d.args.devptr0 = dst.0;
        d.args.devptr1 = src.0;
        d.args.size = byte_count;
        d
    }

    pub fn memcpy_htod(dst: DevicePtr, src: *const c_void, byte_count: usize) -> Self {
        let mut d = Self::new(BatchOp::MemcpyHtoD);
        d.args.devptr0 = dst.0;
        d.args.ptr0 = src.cast_mut();
        d.args.size = byte_count;
        d
    }

    pub fn memcpy_dtoh(dst: *mut c_void, src: DevicePtr, byte_count: usize) -> Self {
        let mut d = Self::new(BatchOp::MemcpyDtoH);
        d.args.devptr0 = src.0;
        d.args.ptr0 = dst;
        d.args.size = byte_count;
        d
    }

    pub fn memcpy_htod_async(
        dst: DevicePtr,
        src: *const c_void,
        byte_count: usize,
        stream: Stream,
    ) -> Self {
        let mut d = Self::new(BatchOp::MemcpyHtoDAsync);
        d.args.devptr0 = dst.0;
        d.args.ptr0 = src.cast_mut();
        d.args.size = byte_count;
        d.args.stream = stream.as_raw();
        d
    }

    pub fn memcpy_dtoh_async(
        dst: *mut c_void,
        src: DevicePtr,
        byte_count: usize,
        stream: Stream,
    ) -> Self {
        let mut d = Self::new(BatchOp::MemcpyDtoHAsync);
        d.args.devptr0 = src.0;
        d.args.ptr0 = dst;
        d.args.size = byte_count;
        d.args.stream = stream.as_raw();
        d
    }

    pub fn memcpy_dtod_async(
        dst: DevicePtr,
        src: DevicePtr,
        byte_count: usize,
        stream: Stream,
    ) -> Self {
        let mut d = Self::new(BatchOp::MemcpyDtoDAsync);
        d.args.devptr0 = dst.0;
        d.args.devptr1 = src.0;
        d.args.size = byte_count;
        d.args.stream = stream.as_raw();
        d
    }

    pub fn launch_kernel(
        f: Function,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        shared_mem_bytes: u32,
        stream: Stream,
        params: &ArgBlock,
    ) -> Self {
        let mut d = Self::new(BatchOp::LaunchKernel);
        d.args.func = f.as_raw();
        d.args.grid_dim_x = grid.0 as c_uint;
        d.args.grid_dim_y = grid.1 as c_uint;
        d.args.grid_dim_z = grid.2 as c_uint;
        d.args.block_dim_x = block.0 as c_uint;
        d.args.block_dim_y = block.1 as c_uint;
        d.args.block_dim_z = block.2 as c_uint;
        d.args.shared_mem_bytes = shared_mem_bytes as c_uint;
        d.args.stream = stream.as_raw();
        d.args.kernel_params = params.params_ptr();
        d
    }

    pub fn synchronize() -> Self {
        Self::new(BatchOp::Sync)
    }

    pub fn alloc_and_copy(src: *const c_void, bytesize: usize) -> Self {
        let mut d = Self::new(BatchOp::AllocAndCopy);
        d.args.size = bytesize;
        d.args.ptr0 = src.cast_mut();
        d
    }

    pub fn op(&self) -> BatchOp {
        self.args.op
    }

    /// Stable address of the underlying record for the reference array.
    pub(crate) fn as_mut_ptr(&mut self) -> *mut CallArgs {
        &mut *self.args
    }

    /// The native-side-populated output address (allocate-style operations).
    pub(crate) fn device_out(&self) -> CUdeviceptr {
        self.args.devptr0
    }
}

pub(crate) fn op_name(op: BatchOp) -> &'static str {
    match op {
        BatchOp::SetCurrent => "setCurrent",
        BatchOp::MallocDevice => "mallocD",
        BatchOp::MallocHost => "mallocH",
        BatchOp::MallocManaged => "mallocManaged",
        BatchOp::FreeDevice => "memfreeD",
        BatchOp::FreeHost => "memfreeH",
        BatchOp::MemcpyDtoD => "memcpyDtoD",
        BatchOp::MemcpyHtoD => "memcpyHtoD",
        BatchOp::MemcpyDtoH => "memcpyDtoH",
        BatchOp::MemcpyHtoDAsync => "memcpyHtoDAsync",
        BatchOp::MemcpyDtoHAsync => "memcpyDtoHAsync",
        BatchOp::MemcpyDtoDAsync => "memcpyDtoDAsync",
        BatchOp::LaunchKernel => "launchKernel",
        BatchOp::Sync => "sync",
        BatchOp::LaunchAndSync => "launchAndSync",
        BatchOp::AllocAndCopy => "allocAndCopy",
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.args;
        write!(f, "{}. ", op_name(a.op))?;
        match a.op {
            BatchOp::SetCurrent => write!(f, "context 0x{:x}", a.ctx as usize),
            BatchOp::MallocDevice | BatchOp::MallocHost | BatchOp::MallocManaged => {
                write!(f, "size {}", a.size)
            }
            BatchOp::FreeDevice => write!(f, "mem: 0x{:x}", a.devptr0),
            BatchOp::FreeHost => write!(f, "ptr: {:p}", a.ptr0),
            BatchOp::MemcpyDtoD | BatchOp::MemcpyDtoDAsync => {
                write!(f, "dest: 0x{:x}, src: 0x{:x}, size {}", a.devptr0, a.devptr1, a.size)
            }
            BatchOp::MemcpyHtoD | BatchOp::MemcpyHtoDAsync => {
                write!(f, "dest: 0x{:x}, src: {:p}, size {}", a.devptr0, a.ptr0, a.size)
            }
            BatchOp::MemcpyDtoH | BatchOp::MemcpyDtoHAsync => {
                write!(f, "dest: {:p}, src: 0x{:x}, size {}", a.ptr0, a.devptr0, a.size)
            }
            BatchOp::LaunchKernel | BatchOp::LaunchAndSync => write!(
                f,
                "fn: {:p}, grid: ({}, {}, {}), block: ({}, {}, {}), params: {:p}",
                a.func,
                a.grid_dim_x,
                a.grid_dim_y,
                a.grid_dim_z,
                a.block_dim_x,
                a.block_dim_y,
                a.block_dim_z,
                a.kernel_params,
            ),
            BatchOp::Sync => Ok(()),
            BatchOp::AllocAndCopy => write!(f, "size: {}, src: {:p}", a.size, a.ptr0),
        }
    }
}

/// A descriptor paired with its blocking flag and, for kernel launches, the
/// marshaling block that must outlive the native call.
pub(crate) struct Call {
    pub desc: Descriptor,
    pub blocking: bool,
    pub marshal: Option<ArgBlock>,
}

impl Call {
    pub fn new(desc: Descriptor, blocking: bool) -> Self {
        Self { desc, blocking, marshal: None }
    }

    pub fn with_marshal(desc: Descriptor, marshal: ArgBlock) -> Self {
        Self { desc, blocking: false, marshal: Some(marshal) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_tag_the_right_operation() {
        assert_eq!(Descriptor::malloc_device(16).op(), BatchOp::MallocDevice);
        assert_eq!(Descriptor::free_device(DevicePtr(1)).op(), BatchOp::FreeDevice);
        assert_eq!(Descriptor::synchronize().op(), BatchOp::Sync);
        assert_eq!(
            Descriptor::memcpy_dtod(DevicePtr(2), DevicePtr(1), 8).op(),
            BatchOp::MemcpyDtoD
        );
    }

    #[test]
    fn unused_operands_stay_zeroed() {
        let d = Descriptor::malloc_device(1024);
        assert_eq!(d.args.devptr0, 0);
        assert_eq!(d.args.devptr1, 0);
        assert!(d.args.ptr0.is_null());
        assert!(d.args.kernel_params.is_null());
        assert_eq!(d.args.size, 1024);
    }

    #[test]
    fn display_renders_operands_per_operation() {
        let d = Descriptor::malloc_device(1024);
        assert_eq!(d.to_string(), "mallocD. size 1024");

        let d = Descriptor::free_device(DevicePtr(0xbeef));
        assert_eq!(d.to_string(), "memfreeD. mem: 0xbeef");

        let d = Descriptor::memcpy_dtod(DevicePtr(0x20), DevicePtr(0x10), 64);
        assert_eq!(d.to_string(), "memcpyDtoD. dest: 0x20, src: 0x10, size 64");
    }
}
