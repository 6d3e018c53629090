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

//! Opaque driver handle newtypes.
//!
//! Handles are integer-sized values passed through to the native layer
//! unchanged; acquiring them (device enumeration, context creation) happens
//! outside this crate. They are stored as plain integers so descriptors can
//! cross thread boundaries without carrying pointer types.

use std::ffi::c_void;
use std::fmt;

use cubatch_sys::{CUcontext, CUdeviceptr, CUfunction, CUstream};

/// A CUDA context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context(usize);

impl Context {
    pub fn from_raw(raw: CUcontext) -> Self {
        Self(raw as usize)
    }

    pub fn as_raw(self) -> CUcontext {
        self.0 as CUcontext
    }
}

/// A device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device(pub i32);

/// An address in device memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(pub CUdeviceptr);

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr(0x{:x})", self.0)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A loaded kernel function handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function(usize);

impl Function {
    pub fn from_raw(raw: CUfunction) -> Self {
        Self(raw as usize)
    }

    pub fn as_raw(self) -> CUfunction {
        self.0 as CUfunction
    }
}

/// A stream handle; the default stream is the zero value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stream(usize);

impl Stream {
    pub fn from_raw(raw: CUstream) -> Self {
        Self(raw as usize)
    }

    pub fn as_raw(self) -> CUstream {
        self.0 as *mut c_void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ptr_formats_as_hex() {
        let p = DevicePtr(0xdead_beef);
        assert_eq!(p.to_string(), "0xdeadbeef");
        assert_eq!(format!("{p:?}"), "DevicePtr(0xdeadbeef)");
    }

    #[test]
    fn handles_round_trip_raw_pointers() {
        let ctx = Context::from_raw(0x77 as CUcontext);
        assert_eq!(ctx.as_raw() as usize, 0x77);
        assert_eq!(Stream::default().as_raw(), std::ptr::null_mut());
    }
}
