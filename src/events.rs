use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{ProcessState, StructuredError};

/// A lifecycle event published by the supervisor. Ephemeral: delivered to
/// current subscribers, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
	pub instance: String,
	pub pid: Option<u32>,
	pub at: DateTime<Utc>,
	#[serde(flatten)]
	pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
	Started,
	Stopped {
		exit_code: Option<i32>,
		reason: Option<String>,
	},
	Crashed {
		exit_code: Option<i32>,
		signal: Option<i32>,
		will_restart: bool,
	},
	StateChanged {
		from: ProcessState,
		to: ProcessState,
	},
	ErrorDetected {
		error: StructuredError,
	},
	HealthCheckFailed {
		issues: Vec<String>,
		idle_ms: u64,
	},
	RestartFailed {
		attempt: u32,
		error: String,
	},
}

impl Event {
	pub fn new(instance: &str, pid: Option<u32>, kind: EventKind) -> Self {
		Self {
			instance: instance.to_string(),
			pid,
			at: Utc::now(),
			kind,
		}
	}
}

const BUS_CAPACITY: usize = 256;

/// Broadcast bus for lifecycle events. Subscribers hold a receiver;
/// dropping it unsubscribes. Emission never blocks and never fails the
/// emitter, even with no subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<Event>,
}

impl EventBus {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(BUS_CAPACITY);
		Self { sender }
	}

	pub fn emit(&self, event: Event) {
		let _ = self.sender.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn subscriber_receives_emitted_events() {
		let bus = EventBus::new();
		let mut rx = bus.subscribe();
		bus.emit(Event::new("web", Some(42), EventKind::Started));

		let event = rx.recv().await.unwrap();
		assert_eq!(event.instance, "web");
		assert_eq!(event.pid, Some(42));
		assert!(matches!(event.kind, EventKind::Started));
	}

	#[test]
	fn emit_without_subscribers_is_fine() {
		let bus = EventBus::new();
		bus.emit(Event::new("web", None, EventKind::Started));
	}

	#[test]
	fn events_serialize_tagged() {
		let event = Event::new(
			"web",
			Some(7),
			EventKind::Crashed {
				exit_code: Some(1),
				signal: None,
				will_restart: true,
			},
		);
		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(json["type"], "crashed");
		assert_eq!(json["will_restart"], true);
		assert_eq!(json["instance"], "web");
	}
}
