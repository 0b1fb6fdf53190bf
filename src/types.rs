//! Core data types for ScriptFlow
//!
//! This module contains the fundamental data structures that flow through the
//! user node stage: timestamps, message events, pre-loaded blocks, topic and
//! datatype catalogs, user nodes, diagnostics and problems.
//!
//! # Main Types
//!
//! - [`Time`] - Receive timestamp (`sec` + `nsec`), totally ordered
//! - [`MessageEvent`] - A single message received on a topic
//! - [`MessageBlock`] - Immutable pre-loaded chunk of messages keyed by topic
//! - [`UserNode`] - User-authored script with a stable identity
//! - [`Diagnostic`] - Per-node compile/runtime diagnostic
//! - [`PlayerProblem`] - Standing problem surfaced in the player state
//!
//! Message payloads are plain data (`serde_json::Value`); the schema of a
//! derived message is carried as data alongside it, never as a Rust type.

use crate::pipeline::id::NodeId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Receive timestamp of a message.
///
/// Always normalized so that `nsec < 1e9`, which makes the derived ordering
/// (seconds first, then nanoseconds) a correct time ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(from = "RawTime")]
pub struct Time {
    pub sec: u32,
    pub nsec: u32,
}

/// Wire form of [`Time`], normalized on the way in.
#[derive(Deserialize)]
struct RawTime {
    sec: u32,
    #[serde(default)]
    nsec: u32,
}

impl From<RawTime> for Time {
    fn from(raw: RawTime) -> Self {
        Time::new(raw.sec, raw.nsec)
    }
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };

    /// Create a normalized time, carrying excess nanoseconds into seconds.
    pub fn new(sec: u32, nsec: u32) -> Self {
        Self::from_nanos(sec as u64 * NANOS_PER_SEC + nsec as u64)
    }

    pub fn from_secs(sec: u32) -> Self {
        Self { sec, nsec: 0 }
    }

    pub fn from_nanos(nanos: u64) -> Self {
        Self {
            sec: (nanos / NANOS_PER_SEC) as u32,
            nsec: (nanos % NANOS_PER_SEC) as u32,
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.sec as u64 * NANOS_PER_SEC + self.nsec as u64
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NANOS_PER_SEC as f64
    }

    /// Add a duration, saturating at the maximum representable time.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let nanos = self
            .as_nanos()
            .saturating_add(duration.as_nanos().min(u64::MAX as u128) as u64);
        Self::from_nanos(nanos.min(u32::MAX as u64 * NANOS_PER_SEC + (NANOS_PER_SEC - 1)))
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Time) -> Duration {
        Duration::from_nanos(self.as_nanos().saturating_sub(earlier.as_nanos()))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// A single message received on a topic. Derived events are new values,
/// never mutations of their source event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub topic: String,
    pub receive_time: Time,
    pub message: serde_json::Value,
    pub schema_name: String,
    /// Estimated when missing from hand-written recordings.
    #[serde(default)]
    pub size_in_bytes: usize,
}

impl MessageEvent {
    /// Create an event, estimating its size from the serialized payload.
    pub fn new(
        topic: impl Into<String>,
        receive_time: Time,
        message: serde_json::Value,
        schema_name: impl Into<String>,
    ) -> Self {
        let size_in_bytes = payload_size(&message);
        Self {
            topic: topic.into(),
            receive_time,
            message,
            schema_name: schema_name.into(),
            size_in_bytes,
        }
    }

    /// Estimate the size from the payload if none was recorded.
    pub fn fill_size(&mut self) {
        if self.size_in_bytes == 0 {
            self.size_in_bytes = payload_size(&self.message);
        }
    }
}

fn payload_size(message: &serde_json::Value) -> usize {
    serde_json::to_vec(message).map(|b| b.len()).unwrap_or(0)
}

/// Immutable snapshot of a contiguous time range of pre-loaded messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBlock {
    pub messages_by_topic: HashMap<String, Vec<MessageEvent>>,
    pub size_in_bytes: usize,
}

impl MessageBlock {
    /// Build a block from per-topic message lists, summing their sizes.
    pub fn from_messages(messages_by_topic: HashMap<String, Vec<MessageEvent>>) -> Self {
        let size_in_bytes = messages_by_topic
            .values()
            .flat_map(|messages| messages.iter())
            .map(|m| m.size_in_bytes)
            .sum();
        Self {
            messages_by_topic,
            size_in_bytes,
        }
    }
}

/// A topic advertised by the upstream source or synthesized by a user node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub schema_name: String,
}

impl Topic {
    pub fn new(name: impl Into<String>, schema_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_name: schema_name.into(),
        }
    }
}

/// A field within a message definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDefinitionField {
    pub name: String,
    /// Primitive type name (`bool`, `int32`, `float64`, `string`, ...) or the
    /// name of another datatype in the catalog.
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub is_complex: bool,
}

/// Definition of a single datatype.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDefinition {
    pub fields: Vec<MessageDefinitionField>,
}

/// Datatype catalog keyed by schema name, in declaration order.
pub type Datatypes = IndexMap<String, MessageDefinition>;

/// Global variables shared with every user node invocation.
pub type GlobalVariables = serde_json::Map<String, serde_json::Value>;

/// How much of a topic the subscriber wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadType {
    /// Only the current playback frame.
    #[default]
    Partial,
    /// Pre-loaded blocks covering the whole source, plus the current frame.
    Full,
}

/// A downstream request for messages on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub topic: String,
    #[serde(default)]
    pub preload_type: PreloadType,
}

impl SubscribePayload {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            preload_type: PreloadType::Partial,
        }
    }

    pub fn full(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            preload_type: PreloadType::Full,
        }
    }
}

/// A topic the consumer intends to publish on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseOptions {
    pub topic: String,
    pub schema_name: String,
}

/// A message published by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishPayload {
    pub topic: String,
    pub message: serde_json::Value,
}

/// A user-authored transformation script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserNode {
    pub id: NodeId,
    pub name: String,
    pub source_code: String,
}

impl UserNode {
    pub fn new(
        id: impl Into<NodeId>,
        name: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_code: source_code.into(),
        }
    }
}

/// The current node set, iterated in insertion order.
pub type UserNodes = IndexMap<NodeId, UserNode>;

/// Severity shared by diagnostics and player problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hint,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn display_name(&self) -> &'static str {
        match self {
            Severity::Hint => "hint",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

/// Which part of the system produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSource {
    /// Script parsing and validation.
    Compile,
    /// Input topic resolution against the upstream catalog.
    InputTopicsChecker,
    /// Output topic validation in the dataflow graph.
    OutputTopicChecker,
    /// Worker handshake.
    Registration,
    /// Per-message execution.
    Runtime,
}

/// Stable diagnostic codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    SyntaxError = 1,
    MissingProcessFunction = 2,
    NoInputs = 3,
    InputTopicUnavailable = 4,
    InvalidDeclaration = 5,
    MissingOutput = 6,
    OutputNotUnique = 7,
    OutputCollidesWithTopic = 8,
    RuntimeError = 9,
    RegistrationFailed = 10,
    GeneratedLibrary = 11,
}

impl DiagnosticCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A per-node diagnostic. Diagnostics for a node are replaced wholesale on
/// every recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub source: DiagnosticSource,
    pub code: DiagnosticCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        source: DiagnosticSource,
        code: DiagnosticCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            source,
            code,
            tip: None,
            line: None,
            column: None,
        }
    }

    pub fn error(
        source: DiagnosticSource,
        code: DiagnosticCode,
        message: impl Into<String>,
    ) -> Self {
        Self::new(Severity::Error, source, code, message)
    }

    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }

    /// Attach a source position, if one is known.
    pub fn at(mut self, line: Option<usize>, column: Option<usize>) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(
                f,
                "[{}] {} (line {}, column {})",
                self.severity.display_name(),
                self.message,
                line,
                column
            ),
            (Some(line), None) => write!(
                f,
                "[{}] {} (line {})",
                self.severity.display_name(),
                self.message,
                line
            ),
            _ => write!(f, "[{}] {}", self.severity.display_name(), self.message),
        }
    }
}

/// A standing problem surfaced to the consumer in the player state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProblem {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip: Option<String>,
}

impl PlayerProblem {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            error: None,
            tip: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }
}

/// Where a user node log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Registration,
    Processing,
}

/// A value logged by a user script via `log(...)` or `print(...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNodeLog {
    pub source: LogSource,
    pub value: serde_json::Value,
    pub logged_at: chrono::DateTime<chrono::Utc>,
}

impl UserNodeLog {
    pub fn new(source: LogSource, value: serde_json::Value) -> Self {
        Self {
            source,
            value,
            logged_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_time_normalization() {
        let t = Time::new(1, 1_500_000_000);
        assert_eq!(t, Time { sec: 2, nsec: 500_000_000 });
        assert_eq!(t.to_string(), "2.500000000");
    }

    #[test]
    fn test_time_deserialization_normalizes() {
        let raw = json!({ "sec": 1, "nsec": 1_500_000_000u32 });
        let t: Time = serde_json::from_value(raw).unwrap();
        assert_eq!(t, Time::new(2, 500_000_000));
        assert!(t > Time::from_secs(2));

        let whole: Time = serde_json::from_value(json!({ "sec": 3 })).unwrap();
        assert_eq!(whole, Time::from_secs(3));
    }

    #[test]
    fn test_time_ordering() {
        let mut times = vec![Time::new(3, 0), Time::new(1, 5), Time::new(1, 0), Time::new(2, 9)];
        times.sort();
        assert_eq!(
            times,
            vec![Time::new(1, 0), Time::new(1, 5), Time::new(2, 9), Time::new(3, 0)]
        );
    }

    #[test]
    fn test_time_arithmetic() {
        let t = Time::from_secs(1).saturating_add(Duration::from_millis(1500));
        assert_eq!(t, Time::new(2, 500_000_000));
        assert_eq!(t.duration_since(Time::from_secs(1)), Duration::from_millis(1500));
        assert_eq!(Time::from_secs(1).duration_since(t), Duration::ZERO);
    }

    #[test]
    fn test_message_event_size() {
        let event = MessageEvent::new("/a", Time::from_secs(1), json!({"v": 2}), "Num");
        assert_eq!(event.size_in_bytes, r#"{"v":2}"#.len());
    }

    #[test]
    fn test_block_size_is_sum_of_messages() {
        let mut by_topic = HashMap::new();
        by_topic.insert(
            "/a".to_string(),
            vec![
                MessageEvent::new("/a", Time::from_secs(1), json!(1), "Num"),
                MessageEvent::new("/a", Time::from_secs(2), json!(22), "Num"),
            ],
        );
        let block = MessageBlock::from_messages(by_topic);
        assert_eq!(block.size_in_bytes, 3);
    }

    #[test]
    fn test_diagnostic_display() {
        let diag = Diagnostic::error(
            DiagnosticSource::Compile,
            DiagnosticCode::SyntaxError,
            "unexpected token",
        )
        .at(Some(3), Some(7));
        assert_eq!(diag.to_string(), "[error] unexpected token (line 3, column 7)");
        assert_eq!(diag.code.as_u32(), 1);
    }

    #[test]
    fn test_user_node_equality_covers_all_fields() {
        let a = UserNode::new("n1", "double", "fn process(e, g) { () }");
        let mut b = a.clone();
        assert_eq!(a, b);
        b.name = "renamed".to_string();
        assert_ne!(a, b);
    }
}
