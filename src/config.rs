use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Monitoring policy for one supervised instance. Immutable after
/// construction; every field except the expected port has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
	#[serde(default = "default_true")]
	pub auto_restart: bool,
	#[serde(default = "default_max_restarts")]
	pub max_restarts: u32,
	#[serde(default = "default_restart_delay")]
	pub restart_delay_ms: u64,
	#[serde(default = "default_health_interval")]
	pub health_interval_ms: u64,
	#[serde(default = "default_kill_timeout")]
	pub kill_timeout_ms: u64,
	pub expected_port: Option<u16>,
	#[serde(default = "default_ring_capacity")]
	pub ring_capacity: usize,
	#[serde(default = "default_port_grace")]
	pub port_grace_ms: u64,
	#[serde(default = "default_port_failures")]
	pub port_failure_threshold: u32,
	#[serde(default = "default_stable_run")]
	pub stable_run_ms: u64,
	#[serde(default = "default_clean_exit_idle")]
	pub clean_exit_idle_ms: u64,
	#[serde(default)]
	pub env: HashMap<String, String>,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			auto_restart: true,
			max_restarts: default_max_restarts(),
			restart_delay_ms: default_restart_delay(),
			health_interval_ms: default_health_interval(),
			kill_timeout_ms: default_kill_timeout(),
			expected_port: None,
			ring_capacity: default_ring_capacity(),
			port_grace_ms: default_port_grace(),
			port_failure_threshold: default_port_failures(),
			stable_run_ms: default_stable_run(),
			clean_exit_idle_ms: default_clean_exit_idle(),
			env: HashMap::new(),
		}
	}
}

impl MonitorConfig {
	pub fn restart_delay(&self) -> Duration {
		Duration::from_millis(self.restart_delay_ms)
	}

	pub fn kill_timeout(&self) -> Duration {
		Duration::from_millis(self.kill_timeout_ms)
	}

	/// Health checks are disabled entirely when the interval is zero.
	pub fn health_interval(&self) -> Option<Duration> {
		if self.health_interval_ms == 0 {
			None
		} else {
			Some(Duration::from_millis(self.health_interval_ms))
		}
	}

	pub fn port_grace(&self) -> Duration {
		Duration::from_millis(self.port_grace_ms)
	}

	/// A run longer than this resets the restart counter on the next start.
	pub fn stable_run(&self) -> Duration {
		Duration::from_millis(self.stable_run_ms)
	}

	/// Silence longer than this turns a zero exit into a suspected hang.
	pub fn clean_exit_idle(&self) -> Duration {
		Duration::from_millis(self.clean_exit_idle_ms)
	}
}

fn default_true() -> bool {
	true
}
fn default_max_restarts() -> u32 {
	5
}
fn default_restart_delay() -> u64 {
	1000
}
fn default_health_interval() -> u64 {
	10_000
}
fn default_kill_timeout() -> u64 {
	5000
}
fn default_ring_capacity() -> usize {
	1000
}
fn default_port_grace() -> u64 {
	30_000
}
fn default_port_failures() -> u32 {
	3
}
fn default_stable_run() -> u64 {
	5 * 60 * 1000
}
fn default_clean_exit_idle() -> u64 {
	30_000
}

/// On-disk log settings for one instance.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
	pub dir: PathBuf,
	#[serde(default = "default_max_bytes")]
	pub max_bytes: u64,
	#[serde(default = "default_check_bytes")]
	pub check_bytes: u64,
	#[serde(default = "default_max_lines")]
	pub max_lines: usize,
	#[serde(default = "default_check_every")]
	pub check_every: u64,
}

impl LogConfig {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			max_bytes: default_max_bytes(),
			check_bytes: default_check_bytes(),
			max_lines: default_max_lines(),
			check_every: default_check_every(),
		}
	}
}

fn default_max_bytes() -> u64 {
	10 * 1024 * 1024
}
fn default_check_bytes() -> u64 {
	1024 * 1024
}
fn default_max_lines() -> usize {
	10_000
}
fn default_check_every() -> u64 {
	100
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monitor_defaults() {
		let config = MonitorConfig::default();
		assert!(config.auto_restart);
		assert_eq!(config.max_restarts, 5);
		assert_eq!(config.expected_port, None);
		assert_eq!(config.health_interval(), Some(Duration::from_secs(10)));
	}

	#[test]
	fn zero_interval_disables_health_checks() {
		let config = MonitorConfig {
			health_interval_ms: 0,
			..Default::default()
		};
		assert_eq!(config.health_interval(), None);
	}

	#[test]
	fn monitor_deserializes_with_partial_fields() {
		let config: MonitorConfig =
			serde_json::from_str(r#"{"expected_port": 4000, "max_restarts": 2}"#).unwrap();
		assert_eq!(config.expected_port, Some(4000));
		assert_eq!(config.max_restarts, 2);
		assert_eq!(config.restart_delay_ms, 1000);
	}
}
