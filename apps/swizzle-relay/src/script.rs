//! Script model: the ordered commands a session runs once both peers are bound.
//!
//! Scripts are data. They are built in code or loaded from a JSON file:
//!
//! ```json
//! { "commands": [
//!     { "target": "ui_driver", "verb": "launch", "payload": { "timeout": 0 },
//!       "wait": { "policy": "await_ack", "timeout_ms": 10000 } },
//!     { "target": "instrumentation", "verb": "userNotificationCenter.requestAuthorization.call",
//!       "wait": { "policy": "fixed_delay", "delay_ms": 2000 },
//!       "on_unbound": { "policy": "await_rebind", "timeout_ms": 30000 } }
//! ] }
//! ```

use std::{path::Path, time::Duration};

use relay_proto::{OutboundEnvelope, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// When the runner moves on after dispatching a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "WaitRepr", into = "WaitRepr")]
pub enum WaitPolicy {
    #[default]
    FireAndForget,
    FixedDelay(Duration),
    /// Wait for the target peer's execution result, or give up after `timeout`.
    AwaitAck { timeout: Option<Duration> },
}

impl WaitPolicy {
    pub fn fixed_delay(delay: Duration) -> Self {
        WaitPolicy::FixedDelay(delay)
    }

    pub fn await_ack(timeout: Duration) -> Self {
        WaitPolicy::AwaitAck {
            timeout: Some(timeout),
        }
    }

    pub fn await_ack_forever() -> Self {
        WaitPolicy::AwaitAck { timeout: None }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WaitPolicy::FireAndForget => "fire_and_forget",
            WaitPolicy::FixedDelay(_) => "fixed_delay",
            WaitPolicy::AwaitAck { .. } => "await_ack",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
enum WaitRepr {
    FireAndForget,
    FixedDelay {
        delay_ms: u64,
    },
    AwaitAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl From<WaitRepr> for WaitPolicy {
    fn from(repr: WaitRepr) -> Self {
        match repr {
            WaitRepr::FireAndForget => WaitPolicy::FireAndForget,
            WaitRepr::FixedDelay { delay_ms } => {
                WaitPolicy::FixedDelay(Duration::from_millis(delay_ms))
            }
            WaitRepr::AwaitAck { timeout_ms } => WaitPolicy::AwaitAck {
                timeout: timeout_ms.map(Duration::from_millis),
            },
        }
    }
}

impl From<WaitPolicy> for WaitRepr {
    fn from(policy: WaitPolicy) -> Self {
        match policy {
            WaitPolicy::FireAndForget => WaitRepr::FireAndForget,
            WaitPolicy::FixedDelay(delay) => WaitRepr::FixedDelay {
                delay_ms: delay.as_millis() as u64,
            },
            WaitPolicy::AwaitAck { timeout } => WaitRepr::AwaitAck {
                timeout_ms: timeout.map(|t| t.as_millis() as u64),
            },
        }
    }
}

/// What the runner does when the target role has no live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "UnboundRepr", into = "UnboundRepr")]
pub enum UnboundPolicy {
    /// Fail the run rather than execute the script out of order.
    #[default]
    Abort,
    /// Wait up to `timeout` for the role to be bound again, then retry.
    AwaitRebind { timeout: Duration },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
enum UnboundRepr {
    Abort,
    AwaitRebind { timeout_ms: u64 },
}

impl From<UnboundRepr> for UnboundPolicy {
    fn from(repr: UnboundRepr) -> Self {
        match repr {
            UnboundRepr::Abort => UnboundPolicy::Abort,
            UnboundRepr::AwaitRebind { timeout_ms } => UnboundPolicy::AwaitRebind {
                timeout: Duration::from_millis(timeout_ms),
            },
        }
    }
}

impl From<UnboundPolicy> for UnboundRepr {
    fn from(policy: UnboundPolicy) -> Self {
        match policy {
            UnboundPolicy::Abort => UnboundRepr::Abort,
            UnboundPolicy::AwaitRebind { timeout } => UnboundRepr::AwaitRebind {
                timeout_ms: timeout.as_millis() as u64,
            },
        }
    }
}

/// One script step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub target: Role,
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub wait: WaitPolicy,
    #[serde(default)]
    pub on_unbound: UnboundPolicy,
}

impl Command {
    pub fn new(target: Role, verb: impl Into<String>) -> Self {
        Self {
            target,
            verb: verb.into(),
            payload: None,
            wait: WaitPolicy::default(),
            on_unbound: UnboundPolicy::default(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_unbound(mut self, on_unbound: UnboundPolicy) -> Self {
        self.on_unbound = on_unbound;
        self
    }

    pub fn envelope(&self) -> OutboundEnvelope {
        OutboundEnvelope::post(self.verb.clone(), self.payload.clone())
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid script JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("command #{index} has an empty verb")]
    EmptyVerb { index: usize },
}

/// Ordered commands. Handing a script to the runner moves it, so a running
/// script can no longer be appended to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    commands: Vec<Command>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn with(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn from_json(text: &str) -> Result<Self, ScriptError> {
        let script: Script = serde_json::from_str(text)?;
        script.validate()?;
        Ok(script)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<(), ScriptError> {
        match self
            .commands
            .iter()
            .position(|command| command.verb.trim().is_empty())
        {
            Some(index) => Err(ScriptError::EmptyVerb { index }),
            None => Ok(()),
        }
    }
}

impl FromIterator<Command> for Script {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn parses_every_policy_shape() {
        let script = Script::from_json(
            r#"{ "commands": [
                { "target": "ui_driver", "verb": "launch", "payload": { "timeout": 0 } },
                { "target": "instrumentation", "verb": "setState",
                  "wait": { "policy": "fixed_delay", "delay_ms": 1500 } },
                { "target": "instrumentation", "verb": "call",
                  "wait": { "policy": "await_ack", "timeout_ms": 2000 },
                  "on_unbound": { "policy": "await_rebind", "timeout_ms": 5000 } },
                { "target": "ui_driver", "verb": "touch",
                  "wait": { "policy": "await_ack" } }
            ] }"#,
        )
        .unwrap();

        let commands = script.commands();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0].wait, WaitPolicy::FireAndForget);
        assert_eq!(commands[0].on_unbound, UnboundPolicy::Abort);
        assert_eq!(commands[0].payload, Some(json!({ "timeout": 0 })));
        assert_eq!(
            commands[1].wait,
            WaitPolicy::FixedDelay(Duration::from_millis(1500))
        );
        assert_eq!(
            commands[2].wait,
            WaitPolicy::await_ack(Duration::from_secs(2))
        );
        assert_eq!(
            commands[2].on_unbound,
            UnboundPolicy::AwaitRebind {
                timeout: Duration::from_secs(5)
            }
        );
        assert_eq!(commands[3].wait, WaitPolicy::await_ack_forever());
    }

    #[test_timeout::timeout]
    fn empty_verbs_are_rejected() {
        let err = Script::from_json(
            r#"{ "commands": [
                { "target": "ui_driver", "verb": "launch" },
                { "target": "ui_driver", "verb": "  " }
            ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::EmptyVerb { index: 1 }));
    }

    #[test_timeout::timeout]
    fn unknown_roles_are_rejected() {
        let err = Script::from_json(r#"{ "commands": [ { "target": "watch", "verb": "x" } ] }"#)
            .unwrap_err();
        assert!(matches!(err, ScriptError::Parse(_)));
    }

    #[test_timeout::timeout]
    fn bundled_sample_script_loads() {
        let path = concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/scripts/notification-authorization.json"
        );
        let script = Script::load(path).unwrap();
        assert!(!script.is_empty());
        assert_eq!(script.commands()[0].target, Role::UiDriver);
    }

    #[test_timeout::timeout]
    fn envelope_carries_verb_and_payload() {
        let command =
            Command::new(Role::UiDriver, "touch").with_payload(json!({ "value": "table_button" }));
        let envelope = command.envelope();
        assert_eq!(envelope.path, "touch");
        assert_eq!(envelope.data, Some(json!({ "value": "table_button" })));
    }
}
