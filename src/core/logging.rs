//! Logging abstraction
//!
//! Provides unified logging macros that work across different targets:
//! - Embedded (`defmt` feature): formats into a bounded line and emits via defmt
//! - Host tests: Uses println!
//! - Host non-test: No-op (arguments are still type-checked)
//!
//! These macros are the device-local log. Remote log lines published on
//! `boards/<device>/log` go through [`crate::node::ParamNode::log`] instead.

/// Maximum formatted line length for the defmt backend
pub const LOG_LINE_LEN: usize = 192;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Format `args` and hand the line to defmt
#[cfg(feature = "defmt")]
pub fn emit(level: LogLevel, args: core::fmt::Arguments<'_>) {
    let mut line = heapless::String::<LOG_LINE_LEN>::new();
    // Truncated lines are still worth emitting
    let _ = core::fmt::write(&mut line, args);

    match level {
        LogLevel::Trace => defmt::trace!("{=str}", line.as_str()),
        LogLevel::Debug => defmt::debug!("{=str}", line.as_str()),
        LogLevel::Info => defmt::info!("{=str}", line.as_str()),
        LogLevel::Warn => defmt::warn!("{=str}", line.as_str()),
        LogLevel::Error => defmt::error!("{=str}", line.as_str()),
    }
}

/// Sink for builds without a log backend
#[inline(always)]
pub fn discard(_args: core::fmt::Arguments<'_>) {}

/// Log informational message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        $crate::core::logging::emit($crate::core::logging::LogLevel::Info, format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), test))]
        println!("[INFO] {}", format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), not(test)))]
        $crate::core::logging::discard(format_args!($($arg)*));
    }};
}

/// Log warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        $crate::core::logging::emit($crate::core::logging::LogLevel::Warn, format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), test))]
        println!("[WARN] {}", format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), not(test)))]
        $crate::core::logging::discard(format_args!($($arg)*));
    }};
}

/// Log error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        $crate::core::logging::emit($crate::core::logging::LogLevel::Error, format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), test))]
        eprintln!("[ERROR] {}", format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), not(test)))]
        $crate::core::logging::discard(format_args!($($arg)*));
    }};
}

/// Log debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        $crate::core::logging::emit($crate::core::logging::LogLevel::Debug, format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), test))]
        println!("[DEBUG] {}", format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), not(test)))]
        $crate::core::logging::discard(format_args!($($arg)*));
    }};
}

/// Log trace message
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        $crate::core::logging::emit($crate::core::logging::LogLevel::Trace, format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), test))]
        println!("[TRACE] {}", format_args!($($arg)*));

        #[cfg(all(not(feature = "defmt"), not(test)))]
        $crate::core::logging::discard(format_args!($($arg)*));
    }};
}
