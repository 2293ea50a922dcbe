//! Leveled logging for the `gpr` runtime.
//!
//! Messages go to standard error, tagged with a colored level and the module
//! path of the call site. The global level starts at [`Level::Warn`] so that a
//! library embedding the runtime stays quiet unless asked otherwise; set it
//! with [`set_level`] or from the `GPR_LOG` environment variable through
//! [`init_from_env`].
//!
//! # Example
//!
//! ```
//! use gpr_log::{debug, error, info, trace, warn, Level};
//!
//! gpr_log::set_level(Level::Debug);
//!
//! let nodes = 3;
//! info!("arena grew to {} nodes", nodes);
//! debug!("scope sizes: {:?}", [1024, 2048]);
//! trace!("not shown at debug level");
//! warn!("ending a scope that is not open");
//! error!("allocation failed");
//! ```

use std::fmt::{self, Arguments};
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Environment variable read by [`init_from_env`].
pub const ENV_VAR: &str = "GPR_LOG";

/// Severity of a log message.
///
/// Ordered from most severe (`Error`) to least severe (`Trace`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Failures the runtime cannot recover from.
    Error = 0,
    /// Misuse that was turned into a no-op.
    Warn = 1,
    /// Coarse lifecycle events.
    Info = 2,
    /// Diagnostic detail.
    Debug = 3,
    /// Per-operation tracing.
    Trace = 4,
}

impl Level {
    const fn color_code(self) -> &'static str {
        match self {
            Level::Error => "\x1b[31m",
            Level::Warn => "\x1b[33m",
            Level::Info => "\x1b[32m",
            Level::Debug => "\x1b[36m",
            Level::Trace => "\x1b[35m",
        }
    }

    /// Returns the upper-case name of this level.
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Error,
            1 => Level::Warn,
            2 => Level::Info,
            3 => Level::Debug,
            _ => Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a [`Level`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError {
    input: String,
}

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid log level `{}` (expected error, warn, info, debug or trace)",
            self.input
        )
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Parses a level name, ignoring case and surrounding whitespace.
    ///
    /// ```
    /// use gpr_log::Level;
    ///
    /// assert_eq!("debug".parse::<Level>(), Ok(Level::Debug));
    /// assert_eq!(" WARN ".parse::<Level>(), Ok(Level::Warn));
    /// assert!("loud".parse::<Level>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Level::Error),
            "warn" | "warning" => Ok(Level::Warn),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            "trace" => Ok(Level::Trace),
            _ => Err(ParseLevelError {
                input: s.to_owned(),
            }),
        }
    }
}

/// Process-wide level filter.
pub struct Logger {
    level: AtomicU8,
}

impl Logger {
    const fn new(level: Level) -> Self {
        Logger {
            level: AtomicU8::new(level as u8),
        }
    }

    /// Sets the minimum level that gets written.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Returns the current minimum level.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Checks whether a message at `level` would be written.
    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }
}

static LOGGER: Logger = Logger::new(Level::Warn);

/// Returns the global logger.
#[inline]
pub fn get_logger() -> &'static Logger {
    &LOGGER
}

/// Sets the minimum level of the global logger.
pub fn set_level(level: Level) {
    LOGGER.set_level(level);
}

/// Sets the minimum level from a level name.
///
/// ```
/// gpr_log::set_level_from_str("trace").unwrap();
/// assert_eq!(gpr_log::get_logger().level(), gpr_log::Level::Trace);
/// ```
pub fn set_level_from_str(s: &str) -> Result<(), ParseLevelError> {
    set_level(s.parse()?);
    Ok(())
}

/// Configures the global level from the `GPR_LOG` environment variable.
///
/// Returns the level now in effect. An unset variable leaves the level
/// unchanged; a set but unparsable one is an error and also leaves it
/// unchanged.
pub fn init_from_env() -> Result<Level, ParseLevelError> {
    if let Ok(value) = std::env::var(ENV_VAR) {
        set_level_from_str(&value)?;
    }
    Ok(LOGGER.level())
}

#[doc(hidden)]
pub fn __log_with_target(level: Level, target: &str, args: Arguments) {
    const RESET: &str = "\x1b[0m";

    if !LOGGER.enabled(level) {
        return;
    }

    let color = level.color_code();
    // A failed write to stderr has nowhere else to be reported.
    let _ = writeln!(
        std::io::stderr().lock(),
        "{color}[{level}]{RESET} {target}: {args}"
    );
}

/// Logs a message at an explicit level.
///
/// ```
/// use gpr_log::{log, Level};
///
/// log!(level: Level::Info, "bytes in use: {}", 4096);
/// ```
#[macro_export]
macro_rules! log {
    (level: $level:expr, $($arg:tt)*) => {
        {
            if $crate::get_logger().enabled($level) {
                $crate::__log_with_target(
                    $level,
                    module_path!(),
                    format_args!($($arg)*)
                );
            }
        }
    };
}

/// Logs a message at the Error level.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Error, $($arg)*)
    };
}

/// Logs a message at the Warn level.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Warn, $($arg)*)
    };
}

/// Logs a message at the Info level.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Info, $($arg)*)
    };
}

/// Logs a message at the Debug level.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Debug, $($arg)*)
    };
}

/// Logs a message at the Trace level.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!(level: $crate::Level::Trace, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("error".parse(), Ok(Level::Error));
        assert_eq!("Warning".parse(), Ok(Level::Warn));
        assert_eq!("INFO".parse(), Ok(Level::Info));
        assert_eq!(" debug\n".parse(), Ok(Level::Debug));
        assert_eq!("trace".parse(), Ok(Level::Trace));

        let err = "verbose".parse::<Level>().unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_level_display_round_trips() {
        for level in [
            Level::Error,
            Level::Warn,
            Level::Info,
            Level::Debug,
            Level::Trace,
        ] {
            assert_eq!(level.to_string().parse(), Ok(level));
        }
    }

    #[test]
    fn test_logger_filtering() {
        let logger = Logger::new(Level::Info);

        assert!(logger.enabled(Level::Error));
        assert!(logger.enabled(Level::Info));
        assert!(!logger.enabled(Level::Debug));

        logger.set_level(Level::Error);
        assert!(!logger.enabled(Level::Warn));
        assert_eq!(logger.level(), Level::Error);

        logger.set_level(Level::Trace);
        assert!(logger.enabled(Level::Trace));
    }

    #[test]
    fn test_local_logger_does_not_touch_global() {
        let before = get_logger().level();
        let logger = Logger::new(Level::Trace);
        logger.set_level(Level::Error);
        assert_eq!(get_logger().level(), before);
    }

    #[test]
    fn test_macros_from_threads() {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                std::thread::spawn(move || {
                    warn!("thread {} warning", i);
                    trace!("thread {} trace", i);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
