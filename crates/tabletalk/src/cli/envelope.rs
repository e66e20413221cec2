//! The JSON object every command prints on stdout, success or not.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::agent::{AgentError, TurnReport};
use crate::utils::time::now_utc_rfc3339;

pub const COMMAND_ENVELOPE_SCHEMA_VERSION: &str = "tabletalk.command-envelope.v1";

/// Who has to act for a failed command to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The caller: a different question, platform or session would work.
    Input,
    /// Nobody: the same command succeeds once the session's turn in flight finishes.
    Busy,
    /// The operator: schema files, stores or the journal need attention.
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeWarning {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub code: String,
    pub class: ErrorClass,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub ok: bool,
    pub command: String,
    pub generated_at_utc: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    pub meta: BTreeMap<String, Value>,
    pub warnings: Vec<EnvelopeWarning>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

impl CommandEnvelope {
    #[must_use]
    pub fn ok(command: impl Into<String>, data: Value) -> Self {
        let mut envelope = Self::base(command, true);
        envelope.data = Some(data);
        envelope
    }

    /// Error envelope for an agent failure; the code, class and details all follow the variant.
    #[must_use]
    pub fn from_agent_error(command: impl Into<String>, error: &AgentError) -> Self {
        let (class, details) = match error {
            AgentError::InvalidQuestion { reason } => (ErrorClass::Input, json!({ "reason": reason })),
            AgentError::InvalidPlatform { platform } | AgentError::UnknownPlatform { platform } => {
                (ErrorClass::Input, json!({ "platform": platform }))
            }
            AgentError::NoPlatformSelected { session_id } => {
                (ErrorClass::Input, json!({ "session_id": session_id }))
            }
            AgentError::SessionBusy { session_id } => (
                ErrorClass::Busy,
                json!({ "session_id": session_id, "retriable": true }),
            ),
            AgentError::SchemaLoad { platform, detail } => (
                ErrorClass::Runtime,
                json!({ "platform": platform, "cause": detail }),
            ),
            AgentError::Journal { detail } => (ErrorClass::Runtime, json!({ "cause": detail })),
        };
        Self::failed(command, error.code(), class, error.to_string(), Some(details))
    }

    /// Error envelope for anything outside the agent: config, paths, encoding.
    #[must_use]
    pub fn runtime_error(command: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::failed(
            command,
            "runtime_error",
            ErrorClass::Runtime,
            format!("{error:#}"),
            None,
        )
    }

    /// Meta and warnings describing a recorded turn.
    #[must_use]
    pub fn with_turn(mut self, report: &TurnReport) -> Self {
        let turn = &report.turn;
        self = self
            .with_meta("session_id", json!(report.session_id))
            .with_meta("platform", json!(report.platform))
            .with_meta("sequence", json!(turn.sequence))
            .with_meta("status", json!(turn.status.as_str()))
            .with_meta("attempts", json!(turn.attempts.len()));
        let cleared = report
            .platform_selection
            .as_ref()
            .filter(|selection| selection.cleared_turns > 0);
        if let Some(selection) = cleared {
            self = self.with_warning(
                "transcript_cleared",
                format!("switching platform cleared {} earlier turn(s)", selection.cleared_turns),
            );
        }
        if turn.response.truncated {
            self = self.with_warning(
                "rows_truncated",
                format!("only the first {} rows were returned", turn.response.row_count),
            );
        }
        if !turn.succeeded() {
            self = self.with_warning("turn_failed", turn.response.text.clone());
        }
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_warning(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.warnings.push(EnvelopeWarning {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    #[must_use]
    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|error| error.class)
    }

    fn failed(
        command: impl Into<String>,
        code: &str,
        class: ErrorClass,
        message: String,
        details: Option<Value>,
    ) -> Self {
        let mut envelope = Self::base(command, false);
        envelope.error = Some(EnvelopeError {
            code: code.to_string(),
            class,
            message,
            details,
        });
        envelope
    }

    fn base(command: impl Into<String>, ok: bool) -> Self {
        Self {
            ok,
            command: command.into(),
            generated_at_utc: now_utc_rfc3339(),
            data: None,
            meta: BTreeMap::from([(
                "schema_version".to_string(),
                json!(COMMAND_ENVELOPE_SCHEMA_VERSION),
            )]),
            warnings: Vec::new(),
            error: None,
        }
    }
}

/// A command that failed after deciding what to print; `main` prints the envelope as-is.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    envelope: CommandEnvelope,
}

impl CommandFailure {
    #[must_use]
    pub const fn new(envelope: CommandEnvelope) -> Self {
        Self { envelope }
    }

    #[must_use]
    pub const fn envelope(&self) -> &CommandEnvelope {
        &self.envelope
    }
}

impl Display for CommandFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.envelope) {
            Ok(encoded) => f.write_str(&encoded),
            Err(_) => f.write_str("command envelope serialization failure"),
        }
    }
}

impl std::error::Error for CommandFailure {}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{CommandEnvelope, CommandFailure, ErrorClass};
    use crate::agent::AgentError;

    #[test]
    fn agent_errors_carry_their_class_and_details() {
        let busy = CommandEnvelope::from_agent_error(
            "ask",
            &AgentError::SessionBusy {
                session_id: "s1".to_string(),
            },
        );
        assert!(!busy.ok);
        assert_eq!(busy.error_class(), Some(ErrorClass::Busy));
        let error = busy.error.as_ref().expect("busy envelope should carry an error");
        assert_eq!(error.code, "session_busy");
        assert_eq!(
            error.details.as_ref().and_then(|details| details.get("retriable")),
            Some(&Value::Bool(true))
        );

        let unset = CommandEnvelope::from_agent_error(
            "ask",
            &AgentError::NoPlatformSelected {
                session_id: "default".to_string(),
            },
        );
        assert_eq!(unset.error_class(), Some(ErrorClass::Input));

        let schema = CommandEnvelope::from_agent_error(
            "select",
            &AgentError::SchemaLoad {
                platform: "sevdesk".to_string(),
                detail: "missing file".to_string(),
            },
        );
        assert_eq!(schema.error_class(), Some(ErrorClass::Runtime));
    }

    #[test]
    fn failure_displays_as_the_encoded_envelope() {
        let envelope = CommandEnvelope::runtime_error("platforms", &anyhow::anyhow!("disk full"));
        let printed = CommandFailure::new(envelope).to_string();
        let decoded = serde_json::from_str::<Value>(&printed).expect("failure should print json");
        assert_eq!(decoded["error"]["code"], "runtime_error");
        assert_eq!(decoded["error"]["class"], "runtime");
        assert_eq!(decoded["meta"]["schema_version"], super::COMMAND_ENVELOPE_SCHEMA_VERSION);
        assert!(decoded.get("data").is_none());
    }
}
