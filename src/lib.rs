//! # banken
//!
//! Process supervisor for app instances.
//!
//! Spawn a child process in its own process group, capture and rotate its
//! output, watch its health (PID liveness plus an optional HTTP port
//! probe), and keep it alive with a bounded restart policy.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use banken::{LogConfig, MonitorConfig, NullSink, ProcessDef, ProcessSupervisor};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let def = ProcessDef {
//!     instance: "web".into(),
//!     command: "npm".into(),
//!     args: vec!["run".into(), "dev".into()],
//!     dir: "/srv/app".into(),
//!     env: Default::default(),
//! };
//!
//! let config = MonitorConfig {
//!     expected_port: Some(3000),
//!     ..Default::default()
//! };
//!
//! let sup = ProcessSupervisor::new(
//!     def,
//!     config,
//!     LogConfig::new("/tmp/banken/logs"),
//!     Arc::new(NullSink),
//! )
//! .unwrap();
//!
//! let mut events = sup.subscribe();
//! sup.start().await.unwrap();
//! while let Ok(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event).unwrap());
//! }
//! # }
//! ```

pub mod config;
pub mod events;
pub mod lock;
pub mod logs;
pub mod procctl;
pub mod ring;
pub mod store;
pub mod supervisor;
pub mod types;

pub use config::{LogConfig, MonitorConfig};
pub use events::{Event, EventBus, EventKind};
pub use lock::{CrossProcessLock, LockGuard};
pub use logs::LogManager;
pub use procctl::{PosixControl, ProcessControl};
pub use ring::RingBuffer;
pub use store::{NullSink, StorageSink};
pub use supervisor::ProcessSupervisor;
pub use types::{
	LogLine, ProcessDef, ProcessRecord, ProcessState, StreamKind, StructuredError,
};
