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

//! The batched dispatcher.
//!
//! Producers enqueue call descriptors into a bounded work channel; a drain
//! cycle moves them into an ordered queue, hands the whole queue to the
//! native batch processor in one crossing, and fans the per-call results
//! back out. Blocking calls drive their own drain cycle on the calling
//! thread; non-blocking calls ride along with whichever cycle flushes next.
//!
//! All drain state sits behind one mutex, so two submission cycles can
//! never overlap regardless of how many producers there are. A blocking
//! wrapper keeps holding that lock while it reads its cycle's errors and
//! return value, which is what guarantees it never observes a later cycle.

use std::ffi::{c_int, c_void};
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select};
use cubatch_sys::{BatchOp, CUDA_SUCCESS, CUresult, CallArgs, process};

use crate::batch::descriptor::{Call, Descriptor};
use crate::batch::marshal::ArgBlock;
use crate::diag;
use crate::error::{BatchErrors, CuError, DispatchError, Result};
use crate::types::{Context, Device, DevicePtr, Function, Stream};

/// Maximum calls per batch cycle; also the work channel capacity.
pub const BATCH_CAPACITY: usize = 15;

/// A blocking call's extracted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnValue {
    DevicePtr(DevicePtr),
}

/// Everything one drain cycle mutates: the in-flight queue, the reference
/// array passed to the native layer, the per-call results, the
/// pending-release list of marshaling blocks, and the single return slot.
struct DrainState {
    queue: Vec<Call>,
    refs: Vec<*mut CallArgs>,
    results: Vec<CUresult>,
    frees: Vec<ArgBlock>,
    ret_val: Option<ReturnValue>,
}

// Safety: the pointers in `refs` point into boxed descriptors owned by
// `queue`, and the state is only reachable through the submission mutex.
unsafe impl Send for DrainState {}

/// A CUDA context whose driver calls are accumulated and submitted to the
/// native layer in batches.
pub struct BatchedContext {
    ctx: Context,
    dev: Device,
    work_tx: Sender<Call>,
    work_rx: Receiver<Call>,
    work_available_tx: Sender<()>,
    work_available_rx: Receiver<()>,
    state: Mutex<DrainState>,
}

impl BatchedContext {
    pub fn new(ctx: Context, dev: Device) -> Self {
        let (work_tx, work_rx) = bounded(BATCH_CAPACITY);
        let (work_available_tx, work_available_rx) = bounded(1);
        Self {
            ctx,
            dev,
            work_tx,
            work_rx,
            work_available_tx,
            work_available_rx,
            state: Mutex::new(DrainState {
                queue: Vec::with_capacity(BATCH_CAPACITY),
                refs: Vec::with_capacity(BATCH_CAPACITY),
                results: Vec::with_capacity(BATCH_CAPACITY),
                frees: Vec::new(),
                ret_val: None,
            }),
        }
    }

    pub fn context(&self) -> Context {
        self.ctx
    }

    pub fn device(&self) -> Device {
        self.dev
    }

    /// Fires when work lands in an empty-ish channel. The signal means
    /// "check for work", not "N items arrived": a pending notification
    /// swallows new ones.
    pub fn work_available(&self) -> &Receiver<()> {
        &self.work_available_rx
    }

    fn lock_state(&self) -> MutexGuard<'_, DrainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, call: Call) -> Result<()> {
        self.work_tx
            .send(call)
            .map_err(|_| DispatchError::ChannelClosed("work channel send failed".to_string()))?;
        let _ = self.work_available_tx.try_send(());
        Ok(())
    }

    fn enqueue(&self, desc: Descriptor) -> Result<()> {
        self.push(Call::new(desc, false))
    }

    /// Enqueue a blocking call and drive drain cycles on the calling thread
    /// until the cycle containing it has been submitted. The submission lock
    /// is taken before the call enters the channel and stays held through
    /// the returned guard, so no other consumer can drain this call and the
    /// caller reads errors and the return slot before any later cycle runs.
    fn enqueue_blocking(&self, mut desc: Descriptor) -> Result<MutexGuard<'_, DrainState>> {
        let target = desc.as_mut_ptr().cast_const();
        let mut st = self.lock_state();
        let mut call = Call::new(desc, true);
        loop {
            match self.work_tx.try_send(call) {
                Ok(()) => break,
                Err(crossbeam_channel::TrySendError::Full(returned)) => {
                    call = returned;
                    // Full of earlier non-blocking work; drain a cycle to
                    // make room.
                    self.cycle(&mut st, None)?;
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                    return Err(DispatchError::ChannelClosed(
                        "work channel send failed".to_string(),
                    ));
                }
            }
        }
        let _ = self.work_available_tx.try_send(());
        loop {
            let (progressed, hit) = self.cycle(&mut st, Some(target))?;
            if hit {
                break;
            }
            if !progressed {
                // The lock was taken before the send, so the call cannot
                // have been drained elsewhere.
                break;
            }
        }
        Ok(st)
    }

    /// One drain cycle: take the first available call, grow the batch while
    /// calls are non-blocking and immediately available, submit once, then
    /// run the post-batch bookkeeping. Returns `(progressed, target_hit)`.
    fn cycle(
        &self,
        st: &mut DrainState,
        target: Option<*const CallArgs>,
    ) -> Result<(bool, bool)> {
        let first = match self.work_rx.try_recv() {
            Ok(call) => call,
            Err(TryRecvError::Empty) => return Ok((false, false)),
            Err(TryRecvError::Disconnected) => {
                return Err(DispatchError::ChannelClosed(
                    "work channel disconnected".to_string(),
                ));
            }
        };
        let _scope = diag::scope("batch cycle");
        let mut blocking = first.blocking;
        st.queue.push(first);
        while st.queue.len() < BATCH_CAPACITY && !blocking {
            match self.work_rx.try_recv() {
                Ok(call) => {
                    blocking = call.blocking;
                    st.queue.push(call);
                }
                Err(_) => break,
            }
        }

        // Queue order is execution order; the reference array must mirror it.
        for call in &mut st.queue {
            if let Some(block) = call.marshal.take() {
                st.frees.push(block);
            }
            st.refs.push(call.desc.as_mut_ptr());
        }
        diag::tracef(format_args!("{}", introspect_queue(&st.queue)));

        st.results.clear();
        st.results.resize(BATCH_CAPACITY, CUDA_SUCCESS);
        unsafe {
            process(
                self.ctx.as_raw(),
                st.refs.as_ptr(),
                st.results.as_mut_ptr(),
                st.queue.len() as c_int,
            );
        }
        st.results.truncate(st.queue.len());

        // The native call has consumed the marshaling buffers.
        st.frees.clear();

        let hit = match target {
            Some(t) => st.refs.iter().any(|&r| std::ptr::eq(r, t.cast_mut())),
            None => false,
        };

        if blocking
            && let Some(last) = st.queue.last()
        {
            match last.desc.op() {
                BatchOp::MallocDevice | BatchOp::AllocAndCopy => {
                    st.ret_val = Some(ReturnValue::DevicePtr(DevicePtr(last.desc.device_out())));
                    diag::tracef(format_args!("[ret] {:?}", st.ret_val));
                }
                _ => {}
            }
        }

        st.queue.clear();
        st.refs.clear();
        Ok((true, hit))
    }

    /// Drain every immediately available call, one batch cycle at a time,
    /// on the calling thread. Returns once the work channel is empty.
    pub fn do_work(&self) -> Result<()> {
        let mut st = self.lock_state();
        while self.cycle(&mut st, None)?.0 {}
        Ok(())
    }

    /// Dedicated consumer loop: waits on the work-available signal, drains,
    /// and repeats until `stop` fires, then drains any remaining work.
    pub fn serve(&self, stop: &Receiver<()>) -> Result<()> {
        loop {
            select! {
                recv(self.work_available_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    self.do_work()?;
                }
                recv(stop) -> _ => break,
            }
        }
        self.do_work()
    }

    /// True iff any slot of the most recent batch is not the success code.
    pub fn check_failures(&self) -> bool {
        self.lock_state().results.iter().any(|&r| r != CUDA_SUCCESS)
    }

    /// The most recent batch's failures, one entry per slot in submission
    /// order (`None` placeholders for successful slots), or `None` when the
    /// whole batch succeeded.
    pub fn collect_errors(&self) -> Option<BatchErrors> {
        BatchErrors::from_results(&self.lock_state().results)
    }

    /// Consuming scan for the first failure of the most recent batch. Every
    /// scanned slot, the failing one included, is reset to the success
    /// code, so a second call without an intervening batch returns `None`.
    pub fn first_error(&self) -> Option<CuError> {
        let mut st = self.lock_state();
        for slot in st.results.iter_mut() {
            let code = *slot;
            *slot = CUDA_SUCCESS;
            if let Some(err) = CuError::from_result(code) {
                return Some(err);
            }
        }
        None
    }

    /// Takes the return slot, clearing it. At most one value is outstanding
    /// at a time, written by the most recent blocking allocate-style call.
    pub fn take_return_value(&self) -> Option<ReturnValue> {
        self.lock_state().ret_val.take()
    }

    /// Renders the calls currently sitting in the in-flight queue. Debug
    /// aid only; the queue is populated within a cycle, so this is mostly
    /// interesting from the trace log.
    pub fn introspect(&self) -> String {
        introspect_queue(&self.lock_state().queue)
    }

    fn extract_device_ptr(st: &mut DrainState) -> Result<DevicePtr> {
        if let Some(errs) = BatchErrors::from_results(&st.results) {
            return Err(DispatchError::Batch(errs));
        }
        match st.ret_val.take() {
            Some(ReturnValue::DevicePtr(ptr)) => Ok(ptr),
            None => Err(DispatchError::ContractViolation(
                "expected a device pointer in the return slot, found none".to_string(),
            )),
        }
    }

    /* public operation surface */

    /// Make this context current on the native side.
    pub fn set_current(&self) -> Result<()> {
        self.enqueue(Descriptor::set_current(self.ctx))
    }

    /// Allocate `bytesize` bytes of device memory. Blocking: flushes the
    /// pending batch and returns the freshly allocated address.
    pub fn mem_alloc(&self, bytesize: usize) -> Result<DevicePtr> {
        let mut st = self.enqueue_blocking(Descriptor::malloc_device(bytesize))?;
        Self::extract_device_ptr(&mut st)
    }

    /// Allocate page-locked host memory. The pointer is only observable to
    /// the native layer; pair with [`BatchedContext::mem_free_host`].
    pub fn mem_alloc_host(&self, bytesize: usize) -> Result<()> {
        self.enqueue(Descriptor::malloc_host(bytesize))
    }

    /// Allocate managed memory visible to host and device.
    pub fn mem_alloc_managed(&self, bytesize: usize) -> Result<()> {
        self.enqueue(Descriptor::malloc_managed(bytesize))
    }

    /// Free a device allocation.
    pub fn mem_free(&self, mem: DevicePtr) -> Result<()> {
        diag::tracef(format_args!("memfree {mem}"));
        self.enqueue(Descriptor::free_device(mem))
    }

    /// Free host memory previously allocated through the batch.
    ///
    /// # Safety
    /// `p` must have been produced by a host allocation on this context and
    /// not freed already.
    pub unsafe fn mem_free_host(&self, p: *mut c_void) -> Result<()> {
        self.enqueue(Descriptor::free_host(p))
    }

    /// Device-to-device copy of `byte_count` bytes.
    pub fn memcpy(&self, dst: DevicePtr, src: DevicePtr, byte_count: usize) -> Result<()> {
        self.enqueue(Descriptor::memcpy_dtod(dst, src, byte_count))
    }

    /// Host-to-device copy.
    ///
    /// # Safety
    /// `src` must be readable for `byte_count` bytes and stay valid until
    /// the batch containing this call has been submitted.
    pub unsafe fn memcpy_htod(
        &self,
        dst: DevicePtr,
        src: *const c_void,
        byte_count: usize,
    ) -> Result<()> {
        self.enqueue(Descriptor::memcpy_htod(dst, src, byte_count))
    }

    /// Device-to-host copy.
    ///
    /// # Safety
    /// `dst` must be writable for `byte_count` bytes and stay valid until
    /// the batch containing this call has been submitted.
    pub unsafe fn memcpy_dtoh(
        &self,
        dst: *mut c_void,
        src: DevicePtr,
        byte_count: usize,
    ) -> Result<()> {
        self.enqueue(Descriptor::memcpy_dtoh(dst, src, byte_count))
    }

    /// Asynchronous host-to-device copy on `stream`.
    ///
    /// # Safety
    /// Same as [`BatchedContext::memcpy_htod`]; additionally `src` must stay
    /// valid until the stream has consumed it.
    pub unsafe fn memcpy_htod_async(
        &self,
        dst: DevicePtr,
        src: *const c_void,
        byte_count: usize,
        stream: Stream,
    ) -> Result<()> {
        self.enqueue(Descriptor::memcpy_htod_async(dst, src, byte_count, stream))
    }

    /// Asynchronous device-to-host copy on `stream`.
    ///
    /// # Safety
    /// Same as [`BatchedContext::memcpy_dtoh`]; additionally `dst` must stay
    /// valid until the stream has produced it.
    pub unsafe fn memcpy_dtoh_async(
        &self,
        dst: *mut c_void,
        src: DevicePtr,
        byte_count: usize,
        stream: Stream,
    ) -> Result<()> {
        self.enqueue(Descriptor::memcpy_dtoh_async(dst, src, byte_count, stream))
    }

    /// Asynchronous device-to-device copy on `stream`.
    pub fn memcpy_dtod_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        byte_count: usize,
        stream: Stream,
    ) -> Result<()> {
        self.enqueue(Descriptor::memcpy_dtod_async(dst, src, byte_count, stream))
    }

    /// Launch a kernel. The argument values are copied into marshaling
    /// buffers owned by the dispatcher, so the caller's parameter storage
    /// only needs to outlive this call.
    ///
    /// # Safety
    /// Every pointer in `kernel_params` must be readable for 8 bytes.
    pub unsafe fn launch_kernel(
        &self,
        f: Function,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        shared_mem_bytes: u32,
        stream: Stream,
        kernel_params: &[*mut c_void],
    ) -> Result<()> {
        let marshal = unsafe { ArgBlock::new(kernel_params) };
        let desc = Descriptor::launch_kernel(f, grid, block, shared_mem_bytes, stream, &marshal);
        self.push(Call::with_marshal(desc, marshal))
    }

    /// Wait for the device to finish all submitted work. Blocking: this is
    /// the call that actually flushes the pending batch.
    pub fn synchronize(&self) -> Result<()> {
        let st = self.enqueue_blocking(Descriptor::synchronize())?;
        match BatchErrors::from_results(&st.results) {
            Some(errs) => Err(DispatchError::Batch(errs)),
            None => Ok(()),
        }
    }

    /// Launch a kernel and immediately synchronize; the synchronize is what
    /// blocks and flushes.
    ///
    /// # Safety
    /// Same contract as [`BatchedContext::launch_kernel`].
    pub unsafe fn launch_and_sync(
        &self,
        f: Function,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        shared_mem_bytes: u32,
        stream: Stream,
        kernel_params: &[*mut c_void],
    ) -> Result<()> {
        unsafe {
            self.launch_kernel(f, grid, block, shared_mem_bytes, stream, kernel_params)?;
        }
        self.synchronize()
    }

    /// Allocate device memory and fill it from `src` in one operation.
    /// Blocking, like [`BatchedContext::mem_alloc`].
    ///
    /// # Safety
    /// `src` must be readable for `bytesize` bytes.
    pub unsafe fn alloc_and_copy(&self, src: *const c_void, bytesize: usize) -> Result<DevicePtr> {
        let mut st = self.enqueue_blocking(Descriptor::alloc_and_copy(src, bytesize))?;
        Self::extract_device_ptr(&mut st)
    }
}

fn introspect_queue(queue: &[Call]) -> String {
    use std::fmt::Write;
    let mut buf = format!("Queue: {}", queue.len());
    for call in queue {
        let _ = write!(buf, "\n\t[QUEUE] {}", call.desc);
    }
    buf
}
