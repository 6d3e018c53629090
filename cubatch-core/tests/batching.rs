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

//! End-to-end dispatcher scenarios against the software device.

#![cfg(not(feature = "cuda"))]

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cubatch_core::{BatchedContext, Context, Device, Function, Stream};
use cubatch_sys::sim;

fn fresh(tag: usize) -> BatchedContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = Context::from_raw(tag as cubatch_sys::CUcontext);
    sim::reset(ctx.as_raw());
    BatchedContext::new(ctx, Device(0))
}

#[test]
fn upload_launch_download_pipeline() {
    let bc = fresh(0xE2E_0001);
    let input: Vec<u8> = (0..128u8).collect();
    let mut output = vec![0u8; 128];

    let dev = bc.mem_alloc(input.len()).expect("device buffer");
    unsafe {
        bc.memcpy_htod(dev, input.as_ptr().cast(), input.len())
            .expect("upload");
    }
    let mut n: u64 = input.len() as u64;
    let mut ptr_arg: u64 = dev.0;
    let params = [
        &mut ptr_arg as *mut u64 as *mut c_void,
        &mut n as *mut u64 as *mut c_void,
    ];
    unsafe {
        bc.launch_kernel(
            Function::from_raw(0xF00 as cubatch_sys::CUfunction),
            (1, 1, 1),
            (128, 1, 1),
            0,
            Stream::default(),
            &params,
        )
        .expect("launch");
        bc.memcpy_dtoh(output.as_mut_ptr().cast(), dev, output.len())
            .expect("download");
    }
    bc.synchronize().expect("flush");

    assert_eq!(output, input);
    let rec = sim::last_launch(bc.context().as_raw()).expect("launch recorded");
    assert_eq!(rec.block, (128, 1, 1));
    // alloc cycle, then upload+launch+download+sync in one batch.
    assert_eq!(sim::batch_lengths(bc.context().as_raw()), vec![1, 4]);
}

#[test]
fn concurrent_blocking_producers_get_distinct_addresses() {
    let bc = Arc::new(fresh(0xE2E_0002));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let bc = Arc::clone(&bc);
        handles.push(thread::spawn(move || {
            (0..8)
                .map(|_| bc.mem_alloc(256).expect("alloc").0)
                .collect::<Vec<_>>()
        }));
    }
    let mut seen = HashSet::new();
    for handle in handles {
        for addr in handle.join().expect("producer thread") {
            assert_ne!(addr, 0);
            assert!(seen.insert(addr), "live allocations never share an address");
        }
    }
    assert_eq!(sim::live_allocations(bc.context().as_raw()), 32);
}

#[test]
fn dedicated_consumer_drains_non_blocking_work() {
    let bc = Arc::new(fresh(0xE2E_0003));
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let consumer = {
        let bc = Arc::clone(&bc);
        thread::spawn(move || bc.serve(&stop_rx))
    };

    for _ in 0..3 {
        bc.set_current().expect("enqueue");
    }
    let mut drained = false;
    for _ in 0..200 {
        if sim::process_invocations(bc.context().as_raw()) > 0 {
            drained = true;
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(drained, "consumer picked up the work-available signal");

    stop_tx.send(()).expect("stop consumer");
    consumer.join().expect("consumer thread").expect("serve exits cleanly");
    let total: usize = sim::batch_lengths(bc.context().as_raw()).iter().sum();
    assert_eq!(total, 3);
}

#[test]
fn errors_from_non_blocking_calls_stay_latent_until_polled() {
    let bc = fresh(0xE2E_0004);
    bc.mem_free(cubatch_core::DevicePtr(0xBAD0_0000)).expect("enqueue bogus free");
    bc.do_work().expect("explicit drain");

    assert!(bc.check_failures());
    let errs = bc.collect_errors().expect("one failing slot");
    assert_eq!(errs.len(), 1);
    assert!(errs.get(0).is_some());

    let first = bc.first_error().expect("consuming scan finds it");
    assert_eq!(first.code, cubatch_sys::CUDA_ERROR_INVALID_VALUE);
    assert!(bc.first_error().is_none());
}
