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

//! Native boundary for the batched dispatcher.
//!
//! Declares the `#[repr(C)]` call descriptor the native batch processor
//! consumes, the operation tags, the opaque driver handle types, and the
//! `process` entry point itself. The struct layout here must stay in sync
//! with the C side; every field is present on every call and unused fields
//! are zero-valued so the flattened descriptor array has a uniform layout.
//!
//! With the `cuda` feature the `process` symbol is resolved at link time
//! against the native batch library. Without it (the default) a software
//! device in [`sim`] executes batches against host memory, which is what the
//! test suite runs on.

use std::ffi::{c_int, c_uint, c_void};
use std::ptr;

/// CUDA driver result code (CUresult).
pub type CUresult = c_int;

/// Device memory address.
pub type CUdeviceptr = u64;

/// Opaque driver handles, represented as pointers.
pub type CUcontext = *mut c_void;
pub type CUfunction = *mut c_void;
pub type CUstream = *mut c_void;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

/// Operation selector for one batched call.
///
/// Discriminant values are part of the native ABI; do not reorder.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp {
    SetCurrent = 0,
    MallocDevice,
    MallocHost,
    MallocManaged,
    FreeDevice,
    FreeHost,
    MemcpyDtoD,
    MemcpyHtoD,
    MemcpyDtoH,
    MemcpyHtoDAsync,
    MemcpyDtoHAsync,
    MemcpyDtoDAsync,
    LaunchKernel,
    Sync,
    LaunchAndSync,
    AllocAndCopy,
}

/// One batched call: the operation tag plus every operand field any
/// operation can take. The native layer walks an array of pointers to these
/// records, so the record must be a single flat struct rather than a
/// per-operation union of payloads.
///
/// For allocate-style operations the native side writes the resulting
/// address back into `devptr0` before `process` returns.
#[repr(C)]
#[derive(Debug)]
pub struct CallArgs {
    pub op: BatchOp,

    pub ctx: CUcontext,

    pub devptr0: CUdeviceptr,
    pub devptr1: CUdeviceptr,

    pub ptr0: *mut c_void,
    pub ptr1: *mut c_void,

    pub func: CUfunction,

    pub grid_dim_x: c_uint,
    pub grid_dim_y: c_uint,
    pub grid_dim_z: c_uint,
    pub block_dim_x: c_uint,
    pub block_dim_y: c_uint,
    pub block_dim_z: c_uint,
    pub shared_mem_bytes: c_uint,

    pub kernel_params: *mut *mut c_void,
    pub extra: *mut *mut c_void,

    pub size: usize,
    pub stream: CUstream,
}

impl CallArgs {
    /// A descriptor for `op` with every operand zeroed.
    pub fn new(op: BatchOp) -> Self {
        Self {
            op,
            ctx: ptr::null_mut(),
            devptr0: 0,
            devptr1: 0,
            ptr0: ptr::null_mut(),
            ptr1: ptr::null_mut(),
            func: ptr::null_mut(),
            grid_dim_x: 0,
            grid_dim_y: 0,
            grid_dim_z: 0,
            block_dim_x: 0,
            block_dim_y: 0,
            block_dim_z: 0,
            shared_mem_bytes: 0,
            kernel_params: ptr::null_mut(),
            extra: ptr::null_mut(),
            size: 0,
            stream: ptr::null_mut(),
        }
    }
}

#[cfg(feature = "cuda")]
unsafe extern "C" {
    /// Execute `count` descriptors strictly in array order and write one
    /// result code per slot. Invoked at most once per drain cycle; the call
    /// itself does not fail, individual operation failures land in
    /// `results`.
    ///
    /// # Safety
    /// `calls` must point to `count` valid descriptor pointers and `results`
    /// to `count` writable slots; both must stay valid for the duration of
    /// the call. Descriptors may be mutated (allocate-style operations write
    /// their output address back).
    pub fn process(
        ctx: CUcontext,
        calls: *const *mut CallArgs,
        results: *mut CUresult,
        count: c_int,
    );
}

#[cfg(not(feature = "cuda"))]
pub mod sim;

#[cfg(not(feature = "cuda"))]
pub use sim::process;
