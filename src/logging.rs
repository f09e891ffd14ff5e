use std::sync::Once;

use env_logger::Env;
use log::{trace, LevelFilter};

static LOG_ONCE: Once = Once::new();

/// Target for bytes written to the board.
pub const WIRE_TX_TARGET: &str = "solenoid_link::wire::tx";
/// Target for bytes read from the board.
pub const WIRE_RX_TARGET: &str = "solenoid_link::wire::rx";

fn env_level() -> LevelFilter {
    std::env::var("SOLENOID_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn install(level: LevelFilter) {
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        // try_init: an embedding application may already own the global logger.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

/// Initialize stderr logging based on `SOLENOID_LOG` / `RUST_LOG` (default `info`).
pub fn init_logging() {
    install(env_level());
}

/// Initialize logging with an explicit level, e.g. from a `--log-level` flag.
///
/// Unparseable input falls back to the environment.
pub fn init_logging_with_level(level: &str) {
    let level = level.parse::<LevelFilter>().unwrap_or_else(|_| env_level());
    install(level);
    log::set_max_level(level);
}

/// Space-separated uppercase hex, the format used by the wire trace.
pub fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02X}"));
    }
    out
}

pub(crate) fn trace_tx(bytes: &[u8]) {
    if log::log_enabled!(target: WIRE_TX_TARGET, log::Level::Trace) {
        trace!(target: WIRE_TX_TARGET, "{}", hex_bytes(bytes));
    }
}

pub(crate) fn trace_rx(bytes: &[u8]) {
    if log::log_enabled!(target: WIRE_RX_TARGET, log::Level::Trace) {
        trace!(target: WIRE_RX_TARGET, "{}", hex_bytes(bytes));
    }
}
