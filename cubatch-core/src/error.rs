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

//! Error types for the dispatcher.
//!
//! Per-call native failures are values in the results array, surfaced as a
//! [`BatchErrors`] collection that preserves slot order; nothing here is
//! fatal to the process.

use std::fmt;

use cubatch_sys::{CUDA_SUCCESS, CUresult};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// One batch cycle completed with at least one failed slot.
    #[error("batch completed with failures: {0}")]
    Batch(BatchErrors),

    /// A blocking call's return slot did not hold the expected shape.
    #[error("return value contract violated: {0}")]
    ContractViolation(String),

    /// The work channel was disconnected.
    #[error("work channel closed: {0}")]
    ChannelClosed(String),
}

/// A single native result code translated into an error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuError {
    pub code: CUresult,
}

impl CuError {
    pub fn from_result(code: CUresult) -> Option<Self> {
        (code != CUDA_SUCCESS).then_some(Self { code })
    }
}

impl fmt::Display for CuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CUDA error {} ({})", self.code, cu_result_to_str(self.code))
    }
}

impl std::error::Error for CuError {}

/// One error value per result slot of a batch, in submission order.
/// Success slots keep a `None` placeholder so index `i` always corresponds
/// to the `i`-th queued call of the cycle.
#[derive(Debug, Default)]
pub struct BatchErrors(Vec<Option<CuError>>);

impl BatchErrors {
    /// Builds the collection from raw result codes; `None` when every slot
    /// succeeded.
    pub(crate) fn from_results(results: &[CUresult]) -> Option<Self> {
        if results.iter().all(|&r| r == CUDA_SUCCESS) {
            return None;
        }
        Some(Self(results.iter().map(|&r| CuError::from_result(r)).collect()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The error for slot `i`, `None` if that call succeeded.
    pub fn get(&self, i: usize) -> Option<CuError> {
        self.0.get(i).copied().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<CuError>> + '_ {
        self.0.iter().copied()
    }

    fn first_failure(&self) -> Option<(usize, CuError)> {
        self.0.iter().enumerate().find_map(|(i, e)| e.map(|e| (i, e)))
    }
}

impl fmt::Display for BatchErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.0.iter().filter(|e| e.is_some()).count();
        match self.first_failure() {
            Some((slot, err)) => write!(
                f,
                "{} of {} calls failed, first at slot {}: {}",
                failed,
                self.0.len(),
                slot,
                err
            ),
            None => write!(f, "no failures"),
        }
    }
}

impl std::error::Error for BatchErrors {}

/// Static description for a driver result code.
pub fn cu_result_to_str(code: CUresult) -> &'static str {
    match code {
        0 => "CUDA_SUCCESS",
        1 => "CUDA_ERROR_INVALID_VALUE",
        2 => "CUDA_ERROR_OUT_OF_MEMORY",
        3 => "CUDA_ERROR_NOT_INITIALIZED",
        4 => "CUDA_ERROR_DEINITIALIZED",
        100 => "CUDA_ERROR_NO_DEVICE",
        101 => "CUDA_ERROR_INVALID_DEVICE",
        200 => "CUDA_ERROR_INVALID_IMAGE",
        201 => "CUDA_ERROR_INVALID_CONTEXT",
        400 => "CUDA_ERROR_INVALID_HANDLE",
        500 => "CUDA_ERROR_NOT_FOUND",
        600 => "CUDA_ERROR_NOT_READY",
        700 => "CUDA_ERROR_ILLEGAL_ADDRESS",
        701 => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
        702 => "CUDA_ERROR_LAUNCH_TIMEOUT",
        719 => "CUDA_ERROR_LAUNCH_FAILED",
        999 => "CUDA_ERROR_UNKNOWN",
        _ => "unrecognized CUDA error",
    }
}
