//! Logging setup and identity-prefixed print macros.

use std::sync::OnceLock;

/// This process's identity string, used to prefix every log line. Set once
/// at startup via [`set_me`]; defaults to `"?"` if never set (e.g. in unit
/// tests that exercise a module in isolation).
static ME: OnceLock<String> = OnceLock::new();

/// Sets this process's identity string. Call once, early in `main()`.
pub fn set_me(identity: impl Into<String>) {
    // ignore failure: a second call (e.g. in tests running in the same
    // process) just keeps the first identity
    let _ = ME.set(identity.into());
}

/// Returns this process's identity string for log prefixing.
pub fn me() -> &'static str {
    ME.get().map(String::as_str).unwrap_or("?")
}

/// Initializes the `env_logger` backend. Safe to call more than once.
pub fn logger_init() {
    let _ = env_logger::try_init();
}

/// Logs at trace level, prefixed with this process's identity.
#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!("{} {}", $crate::utils::me(), format!($($arg)*))
    };
}

/// Logs at debug level, prefixed with this process's identity.
#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!("{} {}", $crate::utils::me(), format!($($arg)*))
    };
}

/// Logs at info level, prefixed with this process's identity.
#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!("{} {}", $crate::utils::me(), format!($($arg)*))
    };
}

/// Logs at warn level, prefixed with this process's identity.
#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!("{} {}", $crate::utils::me(), format!($($arg)*))
    };
}

/// Logs at error level, prefixed with this process's identity.
#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!("{} {}", $crate::utils::me(), format!($($arg)*))
    };
}

/// Logs a formatted message at error level and returns it wrapped in
/// `Err(BbsError::msg(..))`. Optionally takes a leading `"tag";` component
/// to prefix the message with a short context tag instead of the global
/// identity (mirrors call sites like `logged_err!("c"; "...")` in the
/// teacher's client code, used where the global identity isn't the relevant
/// context).
#[macro_export]
macro_rules! logged_err {
    ($tag:expr; $($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("[{}] {}", $tag, msg);
        Err($crate::utils::BbsError::msg(msg))
    }};
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("{} {}", $crate::utils::me(), msg);
        Err($crate::utils::BbsError::msg(msg))
    }};
}
