use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A marker held by a lock holder. The lock is advisory and cooperative;
/// a marker older than the staleness window is presumed abandoned.
#[derive(Debug, Serialize, Deserialize)]
struct LockMarker {
	pid: u32,
	acquired_at_ms: u64,
}

const STALE_AFTER: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 20;
const RETRY_BASE: Duration = Duration::from_millis(25);

/// File-based mutual exclusion usable by independent OS processes.
///
/// `acquire` creates `<name>.lock` exclusively; contenders retry with a
/// short jittered delay and reclaim stale markers. The returned guard
/// removes the marker on drop.
#[derive(Debug, Clone)]
pub struct CrossProcessLock {
	path: PathBuf,
}

pub struct LockGuard {
	path: PathBuf,
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		// Tolerates the marker already being gone.
		let _ = std::fs::remove_file(&self.path);
	}
}

impl CrossProcessLock {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub async fn acquire(&self) -> Result<LockGuard, String> {
		self.acquire_with(STALE_AFTER, MAX_ATTEMPTS).await
	}

	pub async fn acquire_with(
		&self,
		stale_after: Duration,
		max_attempts: u32,
	) -> Result<LockGuard, String> {
		let mut attempt = 0u32;
		while attempt < max_attempts {
			match self.try_create() {
				Ok(()) => {
					return Ok(LockGuard {
						path: self.path.clone(),
					})
				}
				Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
					attempt += 1;
					if self.marker_is_stale(stale_after) {
						// Reclaim and retry without waiting.
						let _ = std::fs::remove_file(&self.path);
						continue;
					}
					tokio::time::sleep(RETRY_BASE + jitter()).await;
				}
				Err(e) => {
					return Err(format!(
						"lock {}: {}",
						self.path.display(),
						e
					))
				}
			}
		}
		Err(format!(
			"lock {}: still held after {} attempts",
			self.path.display(),
			max_attempts
		))
	}

	fn try_create(&self) -> std::io::Result<()> {
		let mut file = std::fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&self.path)?;
		let marker = LockMarker {
			pid: std::process::id(),
			acquired_at_ms: epoch_ms(),
		};
		let payload = serde_json::to_vec(&marker).unwrap_or_default();
		file.write_all(&payload)?;
		Ok(())
	}

	fn marker_is_stale(&self, stale_after: Duration) -> bool {
		let age_ms = match std::fs::read(&self.path) {
			Ok(bytes) => match serde_json::from_slice::<LockMarker>(&bytes) {
				Ok(marker) => epoch_ms().saturating_sub(marker.acquired_at_ms),
				// Unreadable marker: fall back to the file's mtime.
				Err(_) => mtime_age_ms(&self.path),
			},
			// Holder may have released between our create attempt and here.
			Err(_) => return false,
		};
		Duration::from_millis(age_ms) > stale_after
	}
}

fn epoch_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

fn mtime_age_ms(path: &Path) -> u64 {
	std::fs::metadata(path)
		.and_then(|m| m.modified())
		.ok()
		.and_then(|t| SystemTime::now().duration_since(t).ok())
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

fn jitter() -> Duration {
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.subsec_nanos())
		.unwrap_or(0);
	Duration::from_millis(u64::from(nanos) % 25)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lock_path(name: &str) -> PathBuf {
		std::env::temp_dir().join(format!("banken-lock-{}-{}.lock", std::process::id(), name))
	}

	#[tokio::test]
	async fn acquire_and_release() {
		let path = lock_path("basic");
		let lock = CrossProcessLock::new(&path);
		let guard = lock.acquire().await.unwrap();
		assert!(path.exists());
		drop(guard);
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn second_acquirer_fails_while_held() {
		let path = lock_path("contended");
		let lock = CrossProcessLock::new(&path);
		let _guard = lock.acquire().await.unwrap();

		let contender = CrossProcessLock::new(&path);
		let result = contender
			.acquire_with(Duration::from_secs(30), 2)
			.await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn waiter_succeeds_after_release() {
		let path = lock_path("handoff");
		let lock = CrossProcessLock::new(&path);
		let guard = lock.acquire().await.unwrap();

		let contender = CrossProcessLock::new(&path);
		let waiter = tokio::spawn(async move {
			contender
				.acquire_with(Duration::from_secs(30), 20)
				.await
		});

		tokio::time::sleep(Duration::from_millis(60)).await;
		drop(guard);

		let result = waiter.await.unwrap();
		assert!(result.is_ok());
	}

	#[tokio::test]
	async fn stale_marker_is_reclaimed() {
		let path = lock_path("stale");
		let marker = LockMarker {
			pid: 1,
			acquired_at_ms: epoch_ms() - 60_000,
		};
		std::fs::write(&path, serde_json::to_vec(&marker).unwrap()).unwrap();

		let lock = CrossProcessLock::new(&path);
		let guard = lock
			.acquire_with(Duration::from_secs(30), 3)
			.await
			.unwrap();
		drop(guard);
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn fresh_marker_is_not_reclaimed() {
		let path = lock_path("fresh");
		let marker = LockMarker {
			pid: 1,
			acquired_at_ms: epoch_ms(),
		};
		std::fs::write(&path, serde_json::to_vec(&marker).unwrap()).unwrap();

		let lock = CrossProcessLock::new(&path);
		let result = lock.acquire_with(Duration::from_secs(30), 2).await;
		assert!(result.is_err());
		let _ = std::fs::remove_file(&path);
	}
}
