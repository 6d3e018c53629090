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

//! Call-batching dispatcher for CUDA driver operations.
//!
//! Crossing the native boundary is expensive, so instead of issuing each
//! driver call individually, a [`BatchedContext`] accumulates pending calls
//! and submits them to the native batch processor in one crossing. Producers
//! enqueue from any thread; non-blocking calls are fire-and-forget until a
//! blocking call (an allocation that must return an address, or a
//! synchronize) flushes the batch and reads back per-call results.
//!
//! ```rust,ignore
//! use cubatch_core::{BatchedContext, Context, Device};
//!
//! let bc = BatchedContext::new(ctx, Device(0));
//! let dst = bc.mem_alloc(1 << 20)?;            // blocking, flushes
//! unsafe { bc.memcpy_htod(dst, host.as_ptr().cast(), 1 << 20)? };
//! unsafe { bc.launch_kernel(f, grid, block, 0, stream, &params)? };
//! bc.synchronize()?;                           // blocking, flushes
//! ```
//!
//! The native batch processor itself is an external collaborator; see
//! `cubatch-sys` for the boundary contract and the software device used
//! when the `cuda` feature is disabled.

pub mod batch;
pub mod diag;
pub mod error;
pub mod types;

pub use batch::{ArgBlock, BATCH_CAPACITY, BatchedContext, Descriptor, ReturnValue};
pub use error::{BatchErrors, CuError, DispatchError, Result, cu_result_to_str};
pub use types::{Context, Device, DevicePtr, Function, Stream};
