//! Structured log events.
//!
//! The driver reports what it does through an [`EventLog`] supplied by the
//! host. Each event has a stable category tag and a message that names the
//! product, so host logs can be filtered by either.

use std::sync::Arc;

use crate::PRODUCT;

/// Stable category tag of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    Discovery,
    Link,
    Units,
    Catchup,
    Poll,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Discovery => "discovery",
            LogCategory::Link => "link",
            LogCategory::Units => "units",
            LogCategory::Catchup => "catchup",
            LogCategory::Poll => "poll",
        }
    }

    /// `log` target for this category, e.g. `hp1000::catchup`
    pub fn target(&self) -> &'static str {
        match self {
            LogCategory::Discovery => "hp1000::discovery",
            LogCategory::Link => "hp1000::link",
            LogCategory::Units => "hp1000::units",
            LogCategory::Catchup => "hp1000::catchup",
            LogCategory::Poll => "hp1000::poll",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Host-supplied logger
pub trait EventLog: Send + Sync {
    fn log_info(&self, category: LogCategory, message: &str);
    fn log_error(&self, category: LogCategory, message: &str);
}

/// Forwards events to the `log` facade, one target per category
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventLog;

impl EventLog for LogEventLog {
    fn log_info(&self, category: LogCategory, message: &str) {
        log::info!(target: category.target(), "{}", message);
    }

    fn log_error(&self, category: LogCategory, message: &str) {
        log::error!(target: category.target(), "{}", message);
    }
}

/// Cheap handle the driver components share to emit events.
///
/// Prefixes every message with the product name.
#[derive(Clone)]
pub struct Events {
    log: Arc<dyn EventLog>,
}

impl Events {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Events { log }
    }

    pub fn info(&self, category: LogCategory, message: impl std::fmt::Display) {
        self.log
            .log_info(category, &format!("{}: {}", PRODUCT, message));
    }

    pub fn error(&self, category: LogCategory, message: impl std::fmt::Display) {
        self.log
            .log_error(category, &format!("{}: {}", PRODUCT, message));
    }
}

impl Default for Events {
    fn default() -> Self {
        Events::new(Arc::new(LogEventLog))
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events").finish_non_exhaustive()
    }
}

/// Severity of a recorded event
#[cfg(any(test, feature = "emulator"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Keeps every event in memory
#[cfg(any(test, feature = "emulator"))]
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    entries: std::sync::Mutex<Vec<(Severity, LogCategory, String)>>,
}

#[cfg(any(test, feature = "emulator"))]
impl MemoryEventLog {
    pub fn entries(&self) -> Vec<(Severity, LogCategory, String)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn errors(&self, category: LogCategory) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(severity, c, _)| *severity == Severity::Error && *c == category)
            .map(|(_, _, message)| message)
            .collect()
    }

    fn push(&self, severity: Severity, category: LogCategory, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((severity, category, message.to_string()));
        }
    }
}

#[cfg(any(test, feature = "emulator"))]
impl EventLog for MemoryEventLog {
    fn log_info(&self, category: LogCategory, message: &str) {
        self.push(Severity::Info, category, message);
    }

    fn log_error(&self, category: LogCategory, message: &str) {
        self.push(Severity::Error, category, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_product() {
        let memory = Arc::new(MemoryEventLog::default());
        let events = Events::new(memory.clone());
        events.info(LogCategory::Discovery, "found console");
        events.error(LogCategory::Link, format_args!("timeout after {}s", 5));

        let entries = memory.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            (Severity::Info, LogCategory::Discovery, "HP1000: found console".to_string())
        );
        assert_eq!(memory.errors(LogCategory::Link), vec!["HP1000: timeout after 5s"]);
    }

    #[test]
    fn test_category_tags_are_stable() {
        assert_eq!(LogCategory::Catchup.as_str(), "catchup");
        assert_eq!(LogCategory::Units.target(), "hp1000::units");
        assert_eq!(LogCategory::Poll.to_string(), "poll");
    }
}
