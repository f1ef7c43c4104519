//! Logging macros that call the tracing crate underneath, so log levels can be
//! compiled out of builds through cargo features of this crate.
//! See similar: https://doc.rust-lang.org/src/std/macros.rs.html#138-145.

mod subscriber;

pub use subscriber::{init, open_log_file, LogOptions, LogTarget, TraceInitError};
pub use tracing;
pub use tracing::Level;

// Evaluated here rather than at the call site, so the features of this
// crate decide what gets logged.
#[doc(hidden)]
pub const INFO_ENABLED: bool = cfg!(feature = "log_info");
#[doc(hidden)]
pub const WARNINGS_ENABLED: bool = cfg!(feature = "log_warnings");
#[doc(hidden)]
pub const ERRORS_ENABLED: bool = cfg!(feature = "log_errors");
#[doc(hidden)]
pub const DEBUG_ENABLED: bool = cfg!(feature = "log_debug");

#[macro_export]
macro_rules! info {
    ($($t:tt)*) => {
        if $crate::INFO_ENABLED {
            $crate::tracing::info!($($t)*);
        }
    };
}

#[macro_export]
macro_rules! warn {
    ($($t:tt)*) => {
        if $crate::WARNINGS_ENABLED {
            $crate::tracing::warn!($($t)*);
        }
    };
}

#[macro_export]
macro_rules! debug {
    ($($t:tt)*) => {
        if $crate::DEBUG_ENABLED {
            $crate::tracing::debug!($($t)*);
        }
    };
}

#[macro_export]
macro_rules! error {
    ($($t:tt)*) => {
        if $crate::ERRORS_ENABLED {
            $crate::tracing::error!($($t)*);
        }
    };
}
