use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::LogConfig;
use crate::lock::CrossProcessLock;
use crate::types::StreamKind;

/// Share of `max_lines` kept when the log is trimmed.
const TRIM_KEEP_NUM: usize = 7;
const TRIM_KEEP_DEN: usize = 10;

/// Append-only log writer for one supervised instance.
///
/// One line per entry, `[timestamp] [stream] content`. Every Nth append
/// schedules an asynchronous size check off the hot path; oversized files
/// are trimmed to the newest lines via a temp file and atomic rename.
/// Drain and cleanup coordinate with out-of-process readers through a
/// [`CrossProcessLock`].
pub struct LogManager {
	instance: String,
	config: LogConfig,
	path: PathBuf,
	lock: CrossProcessLock,
	appends: AtomicU64,
	writer: Mutex<()>,
	trim_gate: Mutex<()>,
}

impl LogManager {
	pub fn new(instance: &str, config: LogConfig) -> Arc<Self> {
		let _ = std::fs::create_dir_all(&config.dir);
		let path = config.dir.join(format!("{}.log", instance));
		let lock = CrossProcessLock::new(config.dir.join(format!("{}.log.lock", instance)));
		Arc::new(Self {
			instance: instance.to_string(),
			config,
			path,
			lock,
			appends: AtomicU64::new(0),
			writer: Mutex::new(()),
			trim_gate: Mutex::new(()),
		})
	}

	pub fn path(&self) -> &std::path::Path {
		&self.path
	}

	pub fn instance(&self) -> &str {
		&self.instance
	}

	pub async fn append(self: &Arc<Self>, stream: StreamKind, content: &str) -> Result<(), String> {
		let line = format!(
			"[{}] [{}] {}\n",
			Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
			stream.as_str(),
			content
		);

		{
			let _guard = self.writer.lock().await;
			let mut file = std::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(&self.path)
				.map_err(|e| format!("open {}: {}", self.path.display(), e))?;
			file.write_all(line.as_bytes())
				.map_err(|e| format!("append {}: {}", self.path.display(), e))?;
		}

		let count = self.appends.fetch_add(1, Ordering::Relaxed) + 1;
		if self.config.check_every > 0 && count % self.config.check_every == 0 {
			let manager = Arc::clone(self);
			tokio::spawn(async move {
				manager.maybe_trim().await;
			});
		}
		Ok(())
	}

	/// Internal supervisor notice. Failures must never reach the caller.
	pub async fn monitor(self: &Arc<Self>, message: &str) {
		let content = format!("[MONITOR] {}", message);
		if let Err(e) = self.append(StreamKind::Monitor, &content).await {
			tracing::warn!(instance = %self.instance, error = %e, "monitor log write failed");
		}
	}

	/// Size check and trim. Skipped outright if another trim is running.
	async fn maybe_trim(self: &Arc<Self>) {
		let Ok(_gate) = self.trim_gate.try_lock() else {
			return;
		};

		let size = match std::fs::metadata(&self.path) {
			Ok(meta) => meta.len(),
			Err(_) => return,
		};

		if size >= self.config.max_bytes {
			self.trim().await;
			return;
		}
		if size >= self.config.check_bytes {
			let lines = match std::fs::read_to_string(&self.path) {
				Ok(content) => content.lines().count(),
				Err(_) => return,
			};
			if lines > self.config.max_lines {
				self.trim().await;
			}
		}
	}

	async fn trim(&self) {
		let _guard = self.writer.lock().await;
		let content = match std::fs::read_to_string(&self.path) {
			Ok(c) => c,
			Err(e) => {
				tracing::warn!(instance = %self.instance, error = %e, "trim read failed");
				return;
			}
		};

		let keep = (self.config.max_lines * TRIM_KEEP_NUM / TRIM_KEEP_DEN).max(1);
		let lines: Vec<&str> = content.lines().collect();
		if lines.len() <= keep {
			return;
		}
		let tail = lines[lines.len() - keep..].join("\n");

		let tmp = self
			.config
			.dir
			.join(format!("{}.log.trim-{}", self.instance, std::process::id()));
		if let Err(e) = std::fs::write(&tmp, format!("{}\n", tail)) {
			tracing::warn!(instance = %self.instance, error = %e, "trim write failed");
			return;
		}
		if let Err(e) = std::fs::rename(&tmp, &self.path) {
			tracing::warn!(instance = %self.instance, error = %e, "trim rename failed");
			let _ = std::fs::remove_file(&tmp);
		}
	}

	/// Atomically takes everything written so far and resets the log.
	///
	/// The live file is renamed away under the cross-process lock, a fresh
	/// one is created, and the renamed file is read and deleted. A missing
	/// live file means there is nothing to drain. Lock contention degrades
	/// to an empty result rather than failing the caller.
	pub async fn drain(self: &Arc<Self>) -> Result<String, String> {
		let _lock = match self.lock.acquire().await {
			Ok(guard) => guard,
			Err(e) => {
				tracing::warn!(instance = %self.instance, error = %e, "drain skipped, lock busy");
				return Ok(String::new());
			}
		};

		let drained = self.config.dir.join(format!(
			"{}.log.drain-{}-{}",
			self.instance,
			std::process::id(),
			Utc::now().timestamp_millis()
		));

		match std::fs::rename(&self.path, &drained) {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
			Err(e) => return Err(format!("drain rename {}: {}", self.path.display(), e)),
		}

		// A concurrent append may already have recreated the live file;
		// AlreadyExists is the benign outcome of that race.
		match std::fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&self.path)
		{
			Ok(_) => {}
			Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
			Err(e) => {
				tracing::warn!(instance = %self.instance, error = %e, "drain recreate failed");
			}
		}

		let content = std::fs::read_to_string(&drained)
			.map_err(|e| format!("drain read {}: {}", drained.display(), e))?;
		let _ = std::fs::remove_file(&drained);
		Ok(content)
	}

	/// Deletes the log file under the same lock discipline as drain.
	pub async fn cleanup(self: &Arc<Self>) -> Result<(), String> {
		let _lock = match self.lock.acquire().await {
			Ok(guard) => guard,
			Err(e) => {
				tracing::warn!(instance = %self.instance, error = %e, "cleanup skipped, lock busy");
				return Ok(());
			}
		};
		match std::fs::remove_file(&self.path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(format!("cleanup {}: {}", self.path.display(), e)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicU32;

	static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

	fn test_manager(name: &str, max_lines: usize) -> Arc<LogManager> {
		let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir().join(format!("banken-logs-{}-{}", n, name));
		let _ = std::fs::create_dir_all(&dir);
		let config = LogConfig {
			dir,
			max_bytes: 1024 * 1024,
			check_bytes: 1,
			max_lines,
			check_every: 1000,
		};
		LogManager::new("web", config)
	}

	#[tokio::test]
	async fn append_writes_tagged_line() {
		let logs = test_manager("format", 100);
		logs.append(StreamKind::Stdout, "hello").await.unwrap();
		logs.append(StreamKind::Stderr, "oops").await.unwrap();
		logs.monitor("restarting").await;

		let content = std::fs::read_to_string(logs.path()).unwrap();
		let lines: Vec<&str> = content.lines().collect();
		assert_eq!(lines.len(), 3);
		assert!(lines[0].contains("] [stdout] hello"));
		assert!(lines[1].contains("] [stderr] oops"));
		assert!(lines[2].contains("] [monitor] [MONITOR] restarting"));
		assert!(lines[0].starts_with('['));
	}

	#[tokio::test]
	async fn trim_keeps_newest_lines() {
		let logs = test_manager("trim", 10);
		for i in 0..25 {
			logs.append(StreamKind::Stdout, &format!("line-{}", i))
				.await
				.unwrap();
		}
		logs.maybe_trim().await;

		let content = std::fs::read_to_string(logs.path()).unwrap();
		let lines: Vec<&str> = content.lines().collect();
		assert_eq!(lines.len(), 7);
		assert!(lines[0].contains("line-18"));
		assert!(lines[6].contains("line-24"));
	}

	#[tokio::test]
	async fn small_file_is_not_trimmed() {
		let logs = test_manager("notrim", 10);
		for i in 0..5 {
			logs.append(StreamKind::Stdout, &format!("line-{}", i))
				.await
				.unwrap();
		}
		logs.maybe_trim().await;
		let content = std::fs::read_to_string(logs.path()).unwrap();
		assert_eq!(content.lines().count(), 5);
	}

	#[tokio::test]
	async fn drain_returns_content_and_resets() {
		let logs = test_manager("drain", 100);
		logs.append(StreamKind::Stdout, "first").await.unwrap();
		logs.append(StreamKind::Stdout, "second").await.unwrap();

		let drained = logs.drain().await.unwrap();
		assert!(drained.contains("first"));
		assert!(drained.contains("second"));

		logs.append(StreamKind::Stdout, "third").await.unwrap();
		let again = logs.drain().await.unwrap();
		assert!(again.contains("third"));
		assert!(!again.contains("first"));
	}

	#[tokio::test]
	async fn drain_of_missing_file_is_empty() {
		let logs = test_manager("drain-empty", 100);
		let drained = logs.drain().await.unwrap();
		assert_eq!(drained, "");
	}

	#[tokio::test]
	async fn cleanup_removes_file() {
		let logs = test_manager("cleanup", 100);
		logs.append(StreamKind::Stdout, "bye").await.unwrap();
		assert!(logs.path().exists());
		logs.cleanup().await.unwrap();
		assert!(!logs.path().exists());
		// Idempotent.
		logs.cleanup().await.unwrap();
	}
}
