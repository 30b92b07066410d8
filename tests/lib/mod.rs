#![allow(dead_code)]
#![allow(unused_imports)]

mod limited;
pub use limited::Limited;

mod multipart;
pub use multipart::{random_bytes, Multipart};

/// Installs a subscriber once, `RUST_LOG=trace` shows the parser at work.
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
