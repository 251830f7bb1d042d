/// Structured logging for the traffic monitoring service
///
/// Provides context-rich logging with component and route identifiers,
/// timestamps, and severity levels. Supports both console output
/// and file-based logging for daemon operations.

use crate::model::DirectionsError;
use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Directions,
    Store,
    Ignition,
    Notify,
    Llm,
    System,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Directions => write!(f, "DIRECTIONS"),
            Component::Store => write!(f, "STORE"),
            Component::Ignition => write!(f, "IGNITION"),
            Component::Notify => write!(f, "NOTIFY"),
            Component::Llm => write!(f, "LLM"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the origin/destination pair has no drivable route
    Expected,
    /// Unexpected failure - indicates service degradation or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
    /// Whether to include timestamps in console output
    console_timestamps: bool,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>, console_timestamps: bool) {
        let logger = Logger {
            min_level,
            log_file,
            console_timestamps,
        };

        if let Ok(mut slot) = LOGGER.lock() {
            *slot = Some(logger);
        }
    }

    fn log(&self, level: LogLevel, component: Component, route: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let route_part = route.map(|r| format!(" [{}]", r)).unwrap_or_default();
        let log_entry = format_entry(level, component, route, message);

        if self.console_timestamps {
            match level {
                LogLevel::Error | LogLevel::Warning => eprintln!("{}", log_entry),
                LogLevel::Info | LogLevel::Debug => println!("{}", log_entry),
            }
        } else {
            match level {
                LogLevel::Error => eprintln!("   ✗ {}{}: {}", component, route_part, message),
                LogLevel::Warning => eprintln!("   ⚠ {}{}: {}", component, route_part, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}", message),
            }
        }

        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

/// Render one log line: `<timestamp> <LEVEL> <COMPONENT> [route]: message`.
fn format_entry(level: LogLevel, component: Component, route: Option<&str>, message: &str) -> String {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let route_part = route.map(|r| format!(" [{}]", r)).unwrap_or_default();
    format!("{} {} {}{}: {}", timestamp, level, component, route_part, message)
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) {
    Logger::init(min_level, log_file.map(String::from), console_timestamps);
}

fn emit(level: LogLevel, component: Component, route: Option<&str>, message: &str) {
    if let Ok(guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_ref() {
            logger.log(level, component, route, message);
        }
    }
}

/// Log a general informational message
pub fn info(component: Component, route: Option<&str>, message: &str) {
    emit(LogLevel::Info, component, route, message);
}

/// Log a warning message
pub fn warn(component: Component, route: Option<&str>, message: &str) {
    emit(LogLevel::Warning, component, route, message);
}

/// Log an error message
pub fn error(component: Component, route: Option<&str>, message: &str) {
    emit(LogLevel::Error, component, route, message);
}

/// Log a debug message
pub fn debug(component: Component, route: Option<&str>, message: &str) {
    emit(LogLevel::Debug, component, route, message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a directions lookup failure.
///
/// A pair of coordinates with no drivable route between them (sea, closed
/// border) is a configuration fact, not an outage; anything that suggests
/// the API or network misbehaved is unexpected.
pub fn classify_directions_failure(err: &DirectionsError) -> FailureType {
    match err {
        DirectionsError::NoRouteFound(msg) => {
            if msg.contains("unparseable") {
                FailureType::Unexpected
            } else if msg.contains("no routes") {
                FailureType::Expected
            } else {
                FailureType::Unknown
            }
        }
        DirectionsError::HttpError(_)
        | DirectionsError::ApiError(_)
        | DirectionsError::NotConfigured => FailureType::Unexpected,
        DirectionsError::Transport(msg) => {
            if msg.contains("timed out") || msg.contains("timeout") {
                FailureType::Unknown
            } else {
                FailureType::Unexpected
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a directions failure with automatic classification
pub fn log_directions_failure(route_name: &str, err: &DirectionsError) {
    let failure_type = classify_directions_failure(err);
    let message = format!("Directions lookup failed [{}]: {}", failure_type, err);

    match failure_type {
        FailureType::Expected => debug(Component::Directions, Some(route_name), &message),
        FailureType::Unexpected => error(Component::Directions, Some(route_name), &message),
        FailureType::Unknown => warn(Component::Directions, Some(route_name), &message),
    }
}

// ---------------------------------------------------------------------------
// Pass Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of one evaluation pass over all routes
pub fn log_pass_summary(total: usize, successful: usize, failed: usize) {
    let message = format!(
        "Evaluation pass complete: {}/{} successful, {} failed",
        successful, total, failed
    );

    if failed == 0 {
        info(Component::System, None, &message);
    } else if successful == 0 {
        error(Component::System, None, &message);
    } else {
        warn(Component::System, None, &message);
    }
}
