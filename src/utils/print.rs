//! Helper macros for logging (console printing).

use std::fmt;
use std::sync::Arc;

use env_logger::Env;

/// Identity handle passed to every component at construction and printed as
/// the parenthesized prefix of each of its log lines. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logger(Arc<str>);

impl Logger {
    /// Creates a root logging identity.
    pub fn new(name: impl AsRef<str>) -> Self {
        Logger(Arc::from(name.as_ref()))
    }

    /// Derives a nested identity, e.g. `group` -> `group/a3`.
    pub fn child(&self, name: impl fmt::Display) -> Self {
        Logger(Arc::from(format!("{}/{}", self.0, name)))
    }
}

impl fmt::Display for Logger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($me:expr; $($fmt_args:tt)*) => {
        log::trace!("({}) {}", $me, format!($($fmt_args)*))
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_debug!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($me:expr; $($fmt_args:tt)*) => {
        log::debug!("({}) {}", $me, format!($($fmt_args)*))
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_info!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($me:expr; $($fmt_args:tt)*) => {
        log::info!("({}) {}", $me, format!($($fmt_args)*))
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_warn!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($me:expr; $($fmt_args:tt)*) => {
        log::warn!("({}) {}", $me, format!($($fmt_args)*))
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_error!(me; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($me:expr; $($fmt_args:tt)*) => {
        log::error!("({}) {}", $me, format!($($fmt_args)*))
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return an `Err(VeelaError)`
/// containing the string. Kind defaults to `ErrorKind::Other`.
///
/// Example:
/// ```no_compile
/// let e = logged_err!(me; "got {} to print", msg);
/// let e = logged_err!(me, ErrorKind::CorruptState; "bad {}", what);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($me:expr, $kind:expr; $($fmt_args:tt)*) => {
        {
            pf_error!($me; $($fmt_args)*);
            Err($crate::VeelaError::new($kind, format!($($fmt_args)*)))
        }
    };

    ($me:expr; $($fmt_args:tt)*) => {
        {
            pf_error!($me; $($fmt_args)*);
            Err($crate::VeelaError::msg(format!($($fmt_args)*)))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use super::*;
    use crate::utils::{ErrorKind, VeelaError};

    #[test]
    fn error_no_args() {
        let me = Logger::new("t");
        assert_eq!(
            logged_err!(me; "interesting message"),
            Err::<(), VeelaError>(VeelaError::msg("interesting message"))
        );
    }

    #[test]
    fn error_with_kind() {
        let me = Logger::new("t");
        assert_eq!(
            logged_err!(me, ErrorKind::EmptyLog; "got {} to print", 777),
            Err::<(), VeelaError>(VeelaError::new(
                ErrorKind::EmptyLog,
                "got 777 to print"
            ))
        );
    }

    #[test]
    fn logger_child_prefix() {
        let me = Logger::new("grp").child("a3").child("logdb");
        assert_eq!(format!("{}", me), "grp/a3/logdb");
    }
}
