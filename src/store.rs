use async_trait::async_trait;

use crate::types::StructuredError;

/// External collaborator that persists detected error records. The
/// supervisor calls nothing else outward besides OS and network
/// primitives; store failures are logged and swallowed, never escalated.
#[async_trait]
pub trait StorageSink: Send + Sync {
	async fn store_error(
		&self,
		instance: &str,
		pid: Option<u32>,
		error: &StructuredError,
	) -> Result<(), String>;
}

/// Sink that accepts and discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl StorageSink for NullSink {
	async fn store_error(
		&self,
		_instance: &str,
		_pid: Option<u32>,
		_error: &StructuredError,
	) -> Result<(), String> {
		Ok(())
	}
}
