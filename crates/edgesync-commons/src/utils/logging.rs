use std::sync::Once;

use env_logger::Env;

static INIT: Once = Once::new();

/// Initialize the process-wide logger from `RUST_LOG`, defaulting to info.
/// Safe to call more than once.
pub fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .init();
    });
}
