// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unit tests with `tracing` output.
//!
//! Import the attribute in a test module with `use test_with_tracing::test;`
//! and every `#[test]` in it routes `tracing` events to the harness's
//! captured output. Filtering follows `RUST_LOG` and defaults to `debug`.

#![forbid(unsafe_code)]

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing_subscriber::EnvFilter;

#[doc(hidden)]
/// Installs the test subscriber. Subsequent calls do nothing.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        // Another harness may have installed a global subscriber already.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_thread_names(true)
            .with_test_writer()
            .try_init();
    });
}
