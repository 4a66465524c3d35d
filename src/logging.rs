//! Severity-tagged logging, routed through both the `log` facade and an
//! optional embedder-supplied sink.
//!
//! Every message is prefixed `I:`, `W:`, or `E:` (matching the reference
//! implementation's `trfb_msg` convention) before being handed to the sink,
//! so an embedder parsing its own log stream can tell severities apart
//! without depending on the `log` crate's own formatting.

use std::sync::Arc;

/// A replaceable logging sink: a closure taking one already-prefixed message.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// The default sink: forwards to the `log` crate at the matching level so a
/// binary that only calls `env_logger::init()` still sees everything.
#[must_use]
pub fn default_sink() -> LogSink {
    Arc::new(|msg: &str| {
        if let Some(rest) = msg.strip_prefix("E:") {
            log::error!("{}", rest.trim_start());
        } else if let Some(rest) = msg.strip_prefix("W:") {
            log::warn!("{}", rest.trim_start());
        } else if let Some(rest) = msg.strip_prefix("I:") {
            log::info!("{}", rest.trim_start());
        } else {
            log::info!("{msg}");
        }
    })
}

pub(crate) fn emit(sink: &LogSink, level: char, args: std::fmt::Arguments<'_>) {
    let msg = format!("{level}: {args}");
    sink(&msg);
}

macro_rules! log_info {
    ($sink:expr, $($arg:tt)*) => {
        $crate::logging::emit($sink, 'I', format_args!($($arg)*))
    };
}

macro_rules! log_warn {
    ($sink:expr, $($arg:tt)*) => {
        $crate::logging::emit($sink, 'W', format_args!($($arg)*))
    };
}

macro_rules! log_error {
    ($sink:expr, $($arg:tt)*) => {
        $crate::logging::emit($sink, 'E', format_args!($($arg)*))
    };
}

pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
