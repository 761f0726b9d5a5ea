//! Shared helpers for the integration tests.
//!
//! # Running with tracing
//!
//! Use the TEST_LOG environment variable to control tracing verbosity:
//!
//! ```bash
//! TEST_LOG=1 cargo test --test echo -- --nocapture   # info
//! TEST_LOG=2 cargo test --test echo -- --nocapture   # debug
//! TEST_LOG=3 cargo test --test echo -- --nocapture   # trace
//! ```

#![allow(dead_code)]

use nbconn::Settings;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Initialize tracing based on the TEST_LOG environment variable.
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("nbconn={level}");
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

/// Small settings for tests.
pub fn test_settings(name: &str, dispatchers: usize) -> Settings {
    Settings {
        name: name.to_string(),
        dispatcher_pool_size: dispatchers,
        worker_pool_size: 2,
        read_buffer_preallocation_size: 4096,
        ..Settings::default()
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
