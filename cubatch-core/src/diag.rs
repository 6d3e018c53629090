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

//! Scoped diagnostic tracing.
//!
//! Trace lines are indented by the current scope depth so nested drain
//! activity reads as a tree. Depth is tracked per thread and lowered by the
//! [`LogScope`] guard on every exit path. Output goes through the `log`
//! facade at trace level; with no logger installed this is all inert.

use std::cell::Cell;
use std::fmt;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn depth() -> usize {
    DEPTH.with(Cell::get)
}

/// RAII guard for one diagnostic scope.
pub struct LogScope {
    _priv: (),
}

/// Open a scope: log `label` at the current depth, then indent everything
/// until the guard drops.
pub fn scope(label: &str) -> LogScope {
    tracef(format_args!("{label}"));
    DEPTH.with(|d| d.set(d.get() + 1));
    LogScope { _priv: () }
}

impl Drop for LogScope {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Emit one trace line at the current indentation.
pub(crate) fn tracef(args: fmt::Arguments<'_>) {
    if log::log_enabled!(log::Level::Trace) {
        let indent = "\t".repeat(depth());
        log::trace!("{indent}{args}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_and_unwind() {
        assert_eq!(depth(), 0);
        {
            let _a = scope("outer");
            assert_eq!(depth(), 1);
            {
                let _b = scope("inner");
                assert_eq!(depth(), 2);
            }
            assert_eq!(depth(), 1);
        }
        assert_eq!(depth(), 0);
    }

    #[test]
    fn depth_survives_a_panicking_scope() {
        let result = std::panic::catch_unwind(|| {
            let _guard = scope("doomed");
            panic!("mid-scope failure");
        });
        assert!(result.is_err());
        assert_eq!(depth(), 0);
    }
}
