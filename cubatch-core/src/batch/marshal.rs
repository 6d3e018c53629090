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

//! Kernel-launch argument marshaling.
//!
//! A launch crosses the native boundary with an array of pointers, each
//! referencing an 8-byte argument slot. [`ArgBlock`] owns the two temporary
//! native-memory buffers involved: a value buffer holding a copy of each
//! argument and a pointer-array buffer whose slot `i` holds the address of
//! value slot `i`. Both must stay valid only until the native call returns;
//! they sit on the pending-release list of the cycle that submits the
//! launch and are freed when that list is cleared.

use std::ffi::c_void;

/// Width of one argument slot and one pointer slot.
pub(crate) const POINTER_SIZE: usize = std::mem::size_of::<*mut c_void>();

/// The pair of marshaling buffers for one kernel launch. Dropping the block
/// releases both buffers, so release happens on every exit path.
pub struct ArgBlock {
    argv: *mut c_void,
    argp: *mut c_void,
    len: usize,
}

// Safety: both buffers are exclusively owned heap allocations; the block
// moves between threads but is never aliased.
unsafe impl Send for ArgBlock {}

impl ArgBlock {
    /// Copies 8 bytes from every parameter reference into the value buffer
    /// and records each slot's address in the pointer-array buffer.
    ///
    /// # Safety
    /// Every pointer in `params` must be readable for 8 bytes.
    pub unsafe fn new(params: &[*mut c_void]) -> Self {
        if params.is_empty() {
            return Self { argv: std::ptr::null_mut(), argp: std::ptr::null_mut(), len: 0 };
        }
        let bytes = params.len() * POINTER_SIZE;
        let argv = unsafe { libc::malloc(bytes) };
        let argp = unsafe { libc::malloc(bytes) };
        for (i, &param) in params.iter().enumerate() {
            unsafe {
                let value_slot = argv.add(i * POINTER_SIZE);
                *(argp as *mut *mut c_void).add(i) = value_slot;
                *(value_slot as *mut u64) = *(param as *const u64);
            }
        }
        Self { argv, argp, len: params.len() }
    }

    /// The pointer-array buffer, as the native launch expects it.
    pub fn params_ptr(&self) -> *mut *mut c_void {
        self.argp as *mut *mut c_void
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The marshaled argument values, read back through the pointer array.
    /// Diagnostic accessor; the native layer reads the buffers directly.
    pub fn values(&self) -> Vec<u64> {
        (0..self.len)
            .map(|i| unsafe {
                let slot = *(self.argp as *const *const u64).add(i);
                *slot
            })
            .collect()
    }
}

impl Drop for ArgBlock {
    fn drop(&mut self) {
        // libc::free is null-safe.
        unsafe {
            libc::free(self.argv);
            libc::free(self.argp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_three_values_through_the_pointer_array() {
        let mut p0: u64 = 0x1111_2222_3333_4444;
        let mut p1: u64 = 7;
        let mut p2: u64 = u64::MAX;
        let params = [
            &mut p0 as *mut u64 as *mut c_void,
            &mut p1 as *mut u64 as *mut c_void,
            &mut p2 as *mut u64 as *mut c_void,
        ];
        let block = unsafe { ArgBlock::new(&params) };
        assert_eq!(block.len(), 3);
        assert_eq!(block.values(), vec![p0, p1, p2]);
    }

    #[test]
    fn values_are_copies_not_references() {
        let mut p0: u64 = 42;
        let params = [&mut p0 as *mut u64 as *mut c_void];
        let block = unsafe { ArgBlock::new(&params) };
        p0 = 99;
        assert_eq!(block.values(), vec![42]);
        let _ = p0;
    }

    #[test]
    fn empty_parameter_list_allocates_nothing() {
        let block = unsafe { ArgBlock::new(&[]) };
        assert!(block.is_empty());
        assert!(block.params_ptr().is_null());
        assert!(block.values().is_empty());
    }
}
