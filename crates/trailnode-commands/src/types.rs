use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity assigned to a command when it is first persisted (UUIDv7, time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommandId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Persisted and waiting for dispatch.
    Pending,
    /// Claimed by a worker; `execute` is running or about to run.
    Started,
    Completed,
    /// Retry budget exhausted; `recover` has been invoked.
    Failed,
    /// Dispatched after its `deadline_at`; only `expired` ran.
    Expired,
    /// Re-armed after `period`; never reaches `Completed`.
    Repeating,
}

impl CommandStatus {
    /// Terminal states the cleaner is allowed to remove.
    pub const FINALIZED: [CommandStatus; 3] = [
        CommandStatus::Completed,
        CommandStatus::Failed,
        CommandStatus::Expired,
    ];

    /// States replay resumes after a restart.
    pub const RESUMABLE: [CommandStatus; 3] = [
        CommandStatus::Pending,
        CommandStatus::Started,
        CommandStatus::Repeating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Started => "STARTED",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Expired => "EXPIRED",
            CommandStatus::Repeating => "REPEATING",
        }
    }

    pub fn is_finalized(&self) -> bool {
        Self::FINALIZED.contains(self)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(CommandStatus::Pending),
            "STARTED" => Ok(CommandStatus::Started),
            "COMPLETED" => Ok(CommandStatus::Completed),
            "FAILED" => Ok(CommandStatus::Failed),
            "EXPIRED" => Ok(CommandStatus::Expired),
            "REPEATING" => Ok(CommandStatus::Repeating),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

/// A persisted unit of scheduled work.
///
/// All timestamps are epoch milliseconds; `delay` and `period` are
/// millisecond durations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Assigned on first insert, `None` while the command is transient.
    pub id: Option<CommandId>,
    /// Handler key. Left empty, the first `sequence` entry is used at insert.
    pub name: String,
    /// Payload as packed by the handler. Opaque to the executor.
    pub data: Option<String>,
    /// Command names still to run after this one completes.
    pub sequence: Vec<String>,
    /// The command that spawned this one. Used only to order replay.
    pub parent_id: Option<CommandId>,
    pub status: CommandStatus,
    /// Eligibility base; defaults to the insert time.
    pub ready_at: Option<i64>,
    pub delay: i64,
    /// Re-arm interval when `execute` asks to repeat.
    pub period: Option<i64>,
    /// After this instant the command is expired instead of executed.
    pub deadline_at: Option<i64>,
    pub transactional: bool,
    /// Remaining retry budget.
    pub retries: u32,
    pub message: Option<String>,
    pub started_at: Option<i64>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            data: None,
            sequence: Vec::new(),
            parent_id: None,
            status: CommandStatus::Pending,
            ready_at: None,
            delay: 0,
            period: None,
            deadline_at: None,
            transactional: false,
            retries: 0,
            message: None,
            started_at: None,
        }
    }

    /// A nameless command whose name is taken from the head of `sequence` at insert.
    pub fn from_sequence(sequence: Vec<String>) -> Self {
        Self::new("").with_sequence(sequence)
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_sequence(mut self, sequence: Vec<String>) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_delay(mut self, delay_ms: i64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn with_ready_at(mut self, ready_at_ms: i64) -> Self {
        self.ready_at = Some(ready_at_ms);
        self
    }

    pub fn with_period(mut self, period_ms: i64) -> Self {
        self.period = Some(period_ms);
        self
    }

    pub fn with_deadline_at(mut self, deadline_at_ms: i64) -> Self {
        self.deadline_at = Some(deadline_at_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    /// Instant at which the command becomes eligible for execution.
    /// Saturates at `i64::MAX` for effectively unbounded delays.
    pub fn eligible_at(&self, now_ms: i64) -> i64 {
        self.ready_at.unwrap_or(now_ms).saturating_add(self.delay)
    }

    /// Log-friendly ID, `-` while the command is transient.
    pub fn id_str(&self) -> &str {
        self.id.as_ref().map(CommandId::as_str).unwrap_or("-")
    }
}

/// Partial update applied both to the in-memory command and its row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandUpdate {
    pub status: Option<CommandStatus>,
    pub message: Option<String>,
    pub retries: Option<u32>,
    pub started_at: Option<i64>,
    pub ready_at: Option<i64>,
    pub data: Option<String>,
}

impl CommandUpdate {
    pub fn status(status: CommandStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn started_at(started_at_ms: i64) -> Self {
        Self {
            started_at: Some(started_at_ms),
            ..Default::default()
        }
    }

    pub fn ready_at(ready_at_ms: i64) -> Self {
        Self {
            ready_at: Some(ready_at_ms),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_data(mut self, data: Option<String>) -> Self {
        self.data = data;
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, command: &mut Command) {
        if let Some(status) = self.status {
            command.status = status;
        }
        if let Some(ref message) = self.message {
            command.message = Some(message.clone());
        }
        if let Some(retries) = self.retries {
            command.retries = retries;
        }
        if let Some(started_at) = self.started_at {
            command.started_at = Some(started_at);
        }
        if let Some(ready_at) = self.ready_at {
            command.ready_at = Some(ready_at);
        }
        if let Some(ref data) = self.data {
            command.data = Some(data.clone());
        }
    }
}

/// What a handler's `execute` asks the executor to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Done; persist and submit these follow-up commands (possibly none).
    Commands(Vec<Command>),
    /// Re-arm the same command after its `period`.
    Repeat,
    /// Run the same command again after `period + delay`, consuming one retry.
    Retry,
}

impl CommandOutcome {
    pub fn empty() -> Self {
        CommandOutcome::Commands(Vec::new())
    }

    pub fn repeat() -> Self {
        CommandOutcome::Repeat
    }

    pub fn retry() -> Self {
        CommandOutcome::Retry
    }
}

impl From<Vec<Command>> for CommandOutcome {
    fn from(commands: Vec<Command>) -> Self {
        CommandOutcome::Commands(commands)
    }
}

impl From<Command> for CommandOutcome {
    fn from(command: Command) -> Self {
        CommandOutcome::Commands(vec![command])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for status in [
            CommandStatus::Pending,
            CommandStatus::Started,
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Expired,
            CommandStatus::Repeating,
        ] {
            let parsed: CommandStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("RUNNING".parse::<CommandStatus>().is_err());
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&CommandStatus::Repeating).unwrap();
        assert_eq!(json, r#""REPEATING""#);
    }

    #[test]
    fn new_command_defaults() {
        let cmd = Command::new("echo");
        assert!(cmd.id.is_none());
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(cmd.delay, 0);
        assert_eq!(cmd.retries, 0);
        assert!(!cmd.transactional);
        assert_eq!(cmd.id_str(), "-");
    }

    #[test]
    fn eligible_at_falls_back_to_now() {
        let cmd = Command::new("echo").with_delay(250);
        assert_eq!(cmd.eligible_at(1_000), 1_250);
        let cmd = cmd.with_ready_at(5_000);
        assert_eq!(cmd.eligible_at(1_000), 5_250);
    }

    #[test]
    fn eligible_at_saturates_on_huge_delays() {
        let cmd = Command::new("echo").with_delay(i64::MAX);
        assert_eq!(cmd.eligible_at(1_000), i64::MAX);
        let cmd = Command::new("echo")
            .with_ready_at(i64::MAX - 10)
            .with_delay(1_000);
        assert_eq!(cmd.eligible_at(0), i64::MAX);
    }

    #[test]
    fn update_applies_only_set_fields() {
        let mut cmd = Command::new("echo").with_retries(3).with_data("{}");
        let update = CommandUpdate::status(CommandStatus::Failed).with_message("boom");
        update.apply(&mut cmd);
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert_eq!(cmd.message.as_deref(), Some("boom"));
        assert_eq!(cmd.retries, 3);
        assert_eq!(cmd.data.as_deref(), Some("{}"));
        assert!(CommandUpdate::default().is_empty());
    }

    #[test]
    fn finalized_states() {
        assert!(CommandStatus::Expired.is_finalized());
        assert!(!CommandStatus::Repeating.is_finalized());
    }
}
