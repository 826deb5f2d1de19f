use std::sync::Once;

use env_logger::{Builder, Env};
use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

/// Crate-specific level variable, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "DP100_LOG";

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// A level given on the command line wins, then `DP100_LOG`.
fn explicit_level(arg: Option<&str>) -> Option<LevelFilter> {
    parse_level(arg).or_else(|| parse_level(std::env::var(LOG_ENV).ok().as_deref()))
}

/// A fixed level ignores `RUST_LOG` entirely; without one, `RUST_LOG`
/// filters apply and default to `info`.
fn builder(level: Option<LevelFilter>) -> Builder {
    let mut builder = match level {
        Some(level) => {
            let mut b = Builder::new();
            b.filter_level(level);
            b
        }
        None => Builder::from_env(Env::default().default_filter_or("info")),
    };
    builder
        .format_timestamp_millis()
        .format_module_path(true)
        .format_target(true);
    builder
}

/// Initialize stderr logging from `DP100_LOG`, falling back to `RUST_LOG`.
/// Safe to call multiple times; only the first call installs the logger.
pub fn init_logging() {
    init_logging_with(None);
}

/// Like [`init_logging`], with an explicit level (`"debug"`, `"warn"`, ...)
/// overriding both environment variables.
pub fn init_logging_with(level: Option<&str>) {
    let level = explicit_level(level);
    LOG_ONCE.call_once(|| {
        if builder(level).try_init().is_err() {
            log::debug!("logger already installed by the host application");
        }
    });
}
