//! Resolution history and JSON output envelope.
//!
//! Every observable step of a resolution (graph creation, node addition,
//! conflict detection, combination extraction, downgrade, success/failure)
//! is appended to an `EventCollector` as an ordered action record. The
//! collector also gathers diagnostics and builds the envelope used for
//! `--format json` output:
//!
//! ```json
//! {
//!   "version": "1",
//!   "command": "wiz <command>",
//!   "status": "ok" | "error",
//!   "duration_ms": 123,
//!   "detail": { ... command-specific payload ... },
//!   "events": [ ... action records ... ],
//!   "diagnostics": [ ... diagnostic messages ... ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Schema version - bump when breaking changes occur
pub const SCHEMA_VERSION: &str = "1";

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
    Info,
    Hint,
}

/// A diagnostic message with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    /// Suggested fix or action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Additional context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            message: message.into(),
            suggestion: None,
            context: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
            suggestion: None,
            context: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            message: message.into(),
            suggestion: None,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Action record types, emitted at the resolver's defined hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Lifecycle events
    CommandStart,
    CommandEnd,

    // Registry events
    RegistryScanned,
    CommandOverridden,

    // Graph events
    GraphCreated,
    NodeAdded,
    NodeRemoved,
    NodeReplaced,
    ConditionDeferred,
    ConditionPromoted,

    // Resolution events
    ResolveStart,
    CombinationExtracted,
    ConflictDetected,
    VersionDowngraded,
    ResolveComplete,
    ResolveFailed,

    // Context events
    ContextExtracted,
}

/// An event in the resolution stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Milliseconds since the collector was created
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, timestamp_ms: u64) -> Self {
        Self {
            event_type,
            timestamp_ms,
            data: None,
            message: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The JSON response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEnvelope {
    pub version: String,
    pub command: String,
    pub status: Status,
    pub duration_ms: u64,
    pub detail: Value,
    pub events: Vec<Event>,
    pub diagnostics: Vec<Diagnostic>,
}

impl JsonEnvelope {
    pub fn new(
        command: impl Into<String>,
        status: Status,
        duration: Duration,
        detail: Value,
    ) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            command: command.into(),
            status,
            duration_ms: duration.as_millis() as u64,
            detail,
            events: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Append-only action log carried through a resolution.
#[derive(Debug)]
pub struct EventCollector {
    start: Instant,
    events: Vec<Event>,
    diagnostics: Vec<Diagnostic>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            events: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Record an event
    pub fn event(&mut self, event_type: EventType) -> &mut Event {
        let timestamp_ms = self.start.elapsed().as_millis() as u64;
        self.events.push(Event::new(event_type, timestamp_ms));
        self.events.last_mut().unwrap()
    }

    /// Record an event with a message and data payload
    pub fn event_with(&mut self, event_type: EventType, message: impl Into<String>, data: Value) {
        let timestamp_ms = self.start.elapsed().as_millis() as u64;
        self.events.push(
            Event::new(event_type, timestamp_ms)
                .with_message(message)
                .with_data(data),
        );
    }

    pub fn diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(message));
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::warning(message));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::info(message));
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Build the final envelope
    pub fn build_envelope(
        self,
        command: impl Into<String>,
        status: Status,
        detail: Value,
    ) -> JsonEnvelope {
        let duration = self.start.elapsed();
        let mut envelope = JsonEnvelope::new(command, status, duration, detail);
        envelope.events = self.events;
        envelope.diagnostics = self.diagnostics;
        envelope
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collector_records_events_in_order() {
        let mut collector = EventCollector::new();
        collector.event(EventType::CommandStart);
        collector.event_with(EventType::NodeAdded, "foo==1.0", json!({"node": "foo==1.0"}));
        collector.event(EventType::ResolveComplete);

        let types: Vec<_> = collector.events().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            [
                EventType::CommandStart,
                EventType::NodeAdded,
                EventType::ResolveComplete
            ]
        );
        assert_eq!(collector.events()[1].message.as_deref(), Some("foo==1.0"));
    }

    #[test]
    fn envelope_serialization() {
        let mut collector = EventCollector::new();
        collector.event(EventType::ResolveStart);
        collector.warning("unresolved reference ${MISSING}");

        let envelope =
            collector.build_envelope("wiz use", Status::Ok, json!({"packages": ["foo==1.0"]}));
        let parsed: Value = serde_json::from_str(&envelope.to_json_pretty()).unwrap();

        assert_eq!(parsed["version"], "1");
        assert_eq!(parsed["command"], "wiz use");
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["events"][0]["type"], "resolve_start");
        assert_eq!(parsed["diagnostics"][0]["level"], "warning");
    }

    #[test]
    fn diagnostic_builder() {
        let diagnostic = Diagnostic::error("conflict")
            .with_suggestion("loosen the request")
            .with_context(json!({"requirements": ["a >=2", "a <1"]}));
        assert_eq!(diagnostic.level, DiagnosticLevel::Error);
        assert!(diagnostic.suggestion.is_some());
        assert!(diagnostic.context.is_some());
    }
}
