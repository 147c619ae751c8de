//! Test harness for bubble flows: an in-memory engine that speaks the real
//! wire format, and helpers to stand up a client against it.

pub mod harness;

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("bubble=debug,bubble_tests=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
