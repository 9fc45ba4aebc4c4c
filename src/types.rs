use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// What to run: identity plus launch configuration for one supervised instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDef {
	pub instance: String,
	pub command: String,
	#[serde(default)]
	pub args: Vec<String>,
	pub dir: PathBuf,
	#[serde(default)]
	pub env: HashMap<String, String>,
}

/// Lifecycle state of a supervised process. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
	Stopped,
	Starting,
	Running,
	Stopping,
	Crashed,
}

impl ProcessState {
	pub fn is_running(&self) -> bool {
		matches!(self, ProcessState::Running)
	}

	/// `start()` is only accepted from a settled state.
	pub fn can_start(&self) -> bool {
		matches!(self, ProcessState::Stopped | ProcessState::Crashed)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ProcessState::Stopped => "stopped",
			ProcessState::Starting => "starting",
			ProcessState::Running => "running",
			ProcessState::Stopping => "stopping",
			ProcessState::Crashed => "crashed",
		}
	}
}

impl std::fmt::Display for ProcessState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Snapshot of one supervised instance. The supervisor replaces the whole
/// record on every lifecycle change; holders of a snapshot never see a
/// half-updated descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
	pub instance: String,
	pub command: String,
	pub args: Vec<String>,
	pub dir: PathBuf,
	pub pid: Option<u32>,
	pub exit_code: Option<i32>,
	pub signal: Option<i32>,
	pub started_at: Option<DateTime<Utc>>,
	pub ended_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub status: ProcessState,
}

impl ProcessRecord {
	pub fn new(def: &ProcessDef) -> Self {
		Self {
			instance: def.instance.clone(),
			command: def.command.clone(),
			args: def.args.clone(),
			dir: def.dir.clone(),
			pid: None,
			exit_code: None,
			signal: None,
			started_at: None,
			ended_at: None,
			last_error: None,
			status: ProcessState::Stopped,
		}
	}
}

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
	Stdout,
	Stderr,
	Monitor,
}

impl StreamKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			StreamKind::Stdout => "stdout",
			StreamKind::Stderr => "stderr",
			StreamKind::Monitor => "monitor",
		}
	}
}

/// One captured output line.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
	pub at: DateTime<Utc>,
	pub stream: StreamKind,
	pub content: String,
	pub instance: String,
}

/// Error level at which a JSON log line becomes a stored error record.
pub const ERROR_LEVEL: i64 = 50;
/// Error level at which a JSON log line triggers a graceful termination.
pub const FATAL_LEVEL: i64 = 60;

/// A detected fatal or error-level condition, handed to the storage sink.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
	pub at: DateTime<Utc>,
	pub level: i64,
	pub message: String,
	pub raw: String,
}

impl StructuredError {
	pub fn is_fatal(&self) -> bool {
		self.level >= FATAL_LEVEL
	}
}
