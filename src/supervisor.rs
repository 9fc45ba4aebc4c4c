use chrono::Utc;
use nix::sys::signal::Signal;
use regex::Regex;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{LogConfig, MonitorConfig};
use crate::events::{Event, EventBus, EventKind};
use crate::logs::LogManager;
use crate::procctl::{PosixControl, ProcessControl};
use crate::ring::RingBuffer;
use crate::store::StorageSink;
use crate::types::{
	LogLine, ProcessDef, ProcessRecord, ProcessState, StreamKind, StructuredError, ERROR_LEVEL,
	FATAL_LEVEL,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages that mean the child is beyond saving regardless of log level.
static FATAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
	vec![
		Regex::new(r"(?i)out of memory").unwrap(),
		Regex::new(r"(?i)segmentation fault").unwrap(),
		Regex::new(r"EADDRINUSE").unwrap(),
		Regex::new(r"(?i)address already in use").unwrap(),
		Regex::new(r"(?i)cannot find module").unwrap(),
		Regex::new(r"(?i)module not found").unwrap(),
		Regex::new(r"(?i)maximum call stack").unwrap(),
		Regex::new(r"(?i)stack overflow").unwrap(),
		Regex::new(r"(?i)failed to compile").unwrap(),
	]
});

fn is_fatal_message(message: &str) -> bool {
	FATAL_PATTERNS.iter().any(|p| p.is_match(message))
}

/// Stateful UTF-8 decoder. Bytes of a multi-byte character split across
/// chunks are carried over and reassembled; genuinely invalid bytes become
/// replacement characters.
#[derive(Default)]
struct Utf8Decoder {
	carry: Vec<u8>,
}

impl Utf8Decoder {
	fn feed(&mut self, bytes: &[u8]) -> String {
		let mut data = std::mem::take(&mut self.carry);
		data.extend_from_slice(bytes);

		let mut out = String::new();
		let mut rest: &[u8] = &data;
		loop {
			match std::str::from_utf8(rest) {
				Ok(s) => {
					out.push_str(s);
					break;
				}
				Err(e) => {
					let valid = e.valid_up_to();
					out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or(""));
					match e.error_len() {
						Some(n) => {
							out.push(char::REPLACEMENT_CHARACTER);
							rest = &rest[valid + n..];
						}
						None => {
							// Incomplete tail; finish it with the next chunk.
							self.carry = rest[valid..].to_vec();
							break;
						}
					}
				}
			}
		}
		out
	}
}

/// Splits buffered chunk text into complete trimmed lines, keeping the
/// final unterminated fragment as the new carry.
fn frame_lines(carry: &mut String, chunk: &str) -> Vec<String> {
	carry.push_str(chunk);
	if !carry.contains('\n') {
		return Vec::new();
	}
	let buffered = std::mem::take(carry);
	let mut parts: Vec<&str> = buffered.split('\n').collect();
	let rest = parts.pop().unwrap_or("");
	*carry = rest.to_string();
	parts
		.into_iter()
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(String::from)
		.collect()
}

fn json_level(value: &serde_json::Value) -> Option<i64> {
	value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

struct Core {
	state: ProcessState,
	record: Arc<ProcessRecord>,
	/// Incremented per spawn; tasks from older runs see a mismatch and quit.
	run_id: u64,
	child_pid: Option<i32>,
	exit_rx: Option<watch::Receiver<bool>>,
	restart_count: u32,
	restart_timer: Option<JoinHandle<()>>,
	health_timer: Option<JoinHandle<()>>,
	ring: RingBuffer<LogLine>,
	stdout_carry: String,
	stderr_carry: String,
	last_activity: Instant,
	run_started: Option<Instant>,
	last_run: Option<Duration>,
	port_confirmed: bool,
	port_failures: u32,
	restart_kill_sent: bool,
}

impl Core {
	fn new(def: &ProcessDef, ring_capacity: usize) -> Self {
		Self {
			state: ProcessState::Stopped,
			record: Arc::new(ProcessRecord::new(def)),
			run_id: 0,
			child_pid: None,
			exit_rx: None,
			restart_count: 0,
			restart_timer: None,
			health_timer: None,
			ring: RingBuffer::new(ring_capacity),
			stdout_carry: String::new(),
			stderr_carry: String::new(),
			last_activity: Instant::now(),
			run_started: None,
			last_run: None,
			port_confirmed: false,
			port_failures: 0,
			restart_kill_sent: false,
		}
	}

	fn patch(&mut self, f: impl FnOnce(&mut ProcessRecord)) {
		let mut record = (*self.record).clone();
		f(&mut record);
		self.record = Arc::new(record);
	}
}

/// Supervises one OS child process: spawns it in its own process group,
/// captures and frames its output, watches its health, and applies the
/// restart policy when it exits.
pub struct ProcessSupervisor {
	def: ProcessDef,
	config: MonitorConfig,
	events: EventBus,
	logs: Arc<LogManager>,
	sink: Arc<dyn StorageSink>,
	control: Arc<dyn ProcessControl>,
	probe: reqwest::Client,
	core: Mutex<Core>,
}

impl ProcessSupervisor {
	pub fn new(
		def: ProcessDef,
		config: MonitorConfig,
		log_config: LogConfig,
		sink: Arc<dyn StorageSink>,
	) -> Result<Arc<Self>, String> {
		Self::with_control(def, config, log_config, sink, Arc::new(PosixControl))
	}

	pub fn with_control(
		def: ProcessDef,
		config: MonitorConfig,
		log_config: LogConfig,
		sink: Arc<dyn StorageSink>,
		control: Arc<dyn ProcessControl>,
	) -> Result<Arc<Self>, String> {
		if def.instance.trim().is_empty() {
			return Err("instance id must not be empty".to_string());
		}
		if def.command.trim().is_empty() {
			return Err(format!("{}: command must not be empty", def.instance));
		}
		let probe = reqwest::Client::builder()
			.timeout(PROBE_TIMEOUT)
			.build()
			.map_err(|e| format!("http probe client: {}", e))?;
		let logs = LogManager::new(&def.instance, log_config);
		let core = Mutex::new(Core::new(&def, config.ring_capacity));
		Ok(Arc::new(Self {
			def,
			config,
			events: EventBus::new(),
			logs,
			sink,
			control,
			probe,
			core,
		}))
	}

	pub fn instance(&self) -> &str {
		&self.def.instance
	}

	pub fn logs(&self) -> &Arc<LogManager> {
		&self.logs
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.events.subscribe()
	}

	pub async fn state(&self) -> ProcessState {
		self.core.lock().await.state
	}

	/// Current descriptor snapshot. Replaced wholesale on lifecycle
	/// changes, so the snapshot is internally consistent.
	pub async fn record(&self) -> Arc<ProcessRecord> {
		Arc::clone(&self.core.lock().await.record)
	}

	pub async fn restart_count(&self) -> u32 {
		self.core.lock().await.restart_count
	}

	/// Newest `n` captured lines, oldest first.
	pub async fn recent_logs(&self, n: usize) -> Vec<LogLine> {
		self.core.lock().await.ring.tail(n)
	}

	pub async fn uptime(&self) -> Option<Duration> {
		let core = self.core.lock().await;
		if core.state.is_running() {
			core.run_started.map(|s| s.elapsed())
		} else {
			None
		}
	}

	/// Spawns the child and transitions to running.
	///
	/// Accepted only from `stopped` or `crashed`. Failures leave the
	/// supervisor stopped and are returned as messages, never panics.
	pub async fn start(self: &Arc<Self>) -> Result<(), String> {
		let mut core = self.core.lock().await;
		if !core.state.can_start() {
			return Err(format!(
				"{}: cannot start while {}",
				self.def.instance, core.state
			));
		}
		self.set_state(&mut core, ProcessState::Starting);

		// A manual start from `crashed` supersedes any scheduled restart.
		if let Some(timer) = core.restart_timer.take() {
			timer.abort();
		}

		core.stdout_carry.clear();
		core.stderr_carry.clear();
		core.ring.clear();
		core.port_confirmed = false;
		core.port_failures = 0;
		core.restart_kill_sent = false;

		// A long stable run earns back the full restart budget.
		if let Some(span) = core.last_run {
			if span >= self.config.stable_run() && core.restart_count > 0 {
				core.restart_count = 0;
			}
		}

		let mut cmd = Command::new(&self.def.command);
		cmd.args(&self.def.args)
			.current_dir(&self.def.dir)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);
		for (key, val) in self.config.env.iter().chain(self.def.env.iter()) {
			cmd.env(key, val);
		}

		let mut child = match cmd.spawn() {
			Ok(child) => child,
			Err(e) => {
				let msg = format!("{}: spawn {}: {}", self.def.instance, self.def.command, e);
				core.patch(|r| r.last_error = Some(msg.clone()));
				self.set_state(&mut core, ProcessState::Stopped);
				return Err(msg);
			}
		};
		let pid = match child.id() {
			Some(pid) => pid,
			None => {
				let _ = child.start_kill();
				let msg = format!("{}: spawned without a pid", self.def.instance);
				core.patch(|r| r.last_error = Some(msg.clone()));
				self.set_state(&mut core, ProcessState::Stopped);
				return Err(msg);
			}
		};

		core.run_id += 1;
		let run = core.run_id;
		core.child_pid = Some(pid as i32);
		core.run_started = Some(Instant::now());
		core.last_activity = Instant::now();
		core.patch(|r| {
			r.pid = Some(pid);
			r.exit_code = None;
			r.signal = None;
			r.started_at = Some(Utc::now());
			r.ended_at = None;
			r.last_error = None;
		});

		let (exit_tx, exit_rx) = watch::channel(false);
		core.exit_rx = Some(exit_rx);

		if let Some(stdout) = child.stdout.take() {
			let sup = Arc::clone(self);
			tokio::spawn(async move {
				sup.pump_stream(stdout, StreamKind::Stdout, run).await;
			});
		}
		if let Some(stderr) = child.stderr.take() {
			let sup = Arc::clone(self);
			tokio::spawn(async move {
				sup.pump_stream(stderr, StreamKind::Stderr, run).await;
			});
		}

		let sup = Arc::clone(self);
		tokio::spawn(async move {
			let status = child.wait().await;
			sup.handle_exit(run, status).await;
			// Flipped only after the exit transition is complete, so a
			// kill waiting on it observes the final state.
			let _ = exit_tx.send(true);
		});

		if let Some(interval) = self.config.health_interval() {
			let sup = Arc::clone(self);
			core.health_timer = Some(tokio::spawn(async move {
				sup.health_loop(run, interval).await;
			}));
		}

		self.set_state(&mut core, ProcessState::Running);
		self.emit(&core, EventKind::Started);
		Ok(())
	}

	/// Stops the child and settles in `stopped`.
	///
	/// Rejected while `starting` (stopping mid-spawn would race the
	/// spawn); a no-op when already stopped. Cancels any pending restart
	/// before touching the process, so an explicit stop always wins.
	pub async fn stop(self: &Arc<Self>) -> Result<(), String> {
		let (pid, exit_rx) = {
			let mut core = self.core.lock().await;
			match core.state {
				ProcessState::Starting => {
					return Err(format!(
						"{}: cannot stop while starting",
						self.def.instance
					))
				}
				ProcessState::Stopped => return Ok(()),
				_ => {}
			}
			if let Some(timer) = core.restart_timer.take() {
				timer.abort();
			}
			if let Some(timer) = core.health_timer.take() {
				timer.abort();
			}
			self.set_state(&mut core, ProcessState::Stopping);
			self.flush_carry(&mut core).await;
			(core.child_pid, core.exit_rx.clone())
		};

		self.kill_child(pid, exit_rx, false).await;

		let mut core = self.core.lock().await;
		// If the exit handler already ran it owns the transition; emitting
		// here as well would double-report the stop.
		if core.state == ProcessState::Stopping {
			core.patch(|r| r.ended_at = Some(Utc::now()));
			self.set_state(&mut core, ProcessState::Stopped);
			let exit_code = core.record.exit_code;
			self.emit(
				&core,
				EventKind::Stopped {
					exit_code,
					reason: Some("stop requested".to_string()),
				},
			);
		}
		Ok(())
	}

	/// Stop followed by start, with a fresh restart budget.
	pub async fn restart(self: &Arc<Self>) -> Result<(), String> {
		self.stop().await?;
		{
			let mut core = self.core.lock().await;
			core.restart_count = 0;
		}
		self.start().await
	}

	/// Graceful-then-forced kill of the whole process group.
	///
	/// The child may already have exited; checking the exit flag with
	/// `borrow_and_update` before signalling means a completion landing
	/// between the check and the wait still wakes the wait, so this can
	/// never hang on a process that is already gone.
	async fn kill_child(
		&self,
		pid: Option<i32>,
		exit_rx: Option<watch::Receiver<bool>>,
		force: bool,
	) {
		let Some(pid) = pid else { return };
		let Some(mut exit_rx) = exit_rx else { return };
		if *exit_rx.borrow_and_update() {
			return;
		}

		let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
		if let Err(e) = self.control.signal_group(pid, sig) {
			tracing::warn!(instance = %self.def.instance, error = %e, "group signal failed");
			let _ = self.control.signal_pid(pid, sig);
		}

		tokio::select! {
			_ = exit_rx.changed() => {}
			_ = tokio::time::sleep(self.config.kill_timeout()) => {
				// Failure here almost certainly means it died on its own.
				let _ = self.control.signal_group(pid, Signal::SIGKILL);
			}
		}
	}

	async fn handle_exit(
		self: &Arc<Self>,
		run: u64,
		status: std::io::Result<std::process::ExitStatus>,
	) {
		let mut core = self.core.lock().await;
		if core.run_id != run {
			return;
		}

		let was_stopping = core.state == ProcessState::Stopping;

		if let Some(timer) = core.health_timer.take() {
			timer.abort();
		}

		let (exit_code, signal) = match &status {
			Ok(st) => (st.code(), st.signal()),
			Err(_) => (None, None),
		};
		if let Err(e) = &status {
			let msg = format!("wait failed: {}", e);
			core.patch(|r| r.last_error = Some(msg));
		}

		core.child_pid = None;
		core.last_run = core.run_started.take().map(|s| s.elapsed());
		let idle = core.last_activity.elapsed();
		core.patch(|r| {
			r.exit_code = exit_code;
			r.signal = signal;
			r.ended_at = Some(Utc::now());
		});

		let restart_wanted =
			self.should_restart(core.restart_count, exit_code, signal, was_stopping, idle);

		// An exit is either a clean stop or a crash, never both.
		let clean_exit =
			was_stopping || (exit_code == Some(0) && idle <= self.config.clean_exit_idle());

		if clean_exit {
			self.set_state(&mut core, ProcessState::Stopped);
			let reason = if was_stopping { "stop requested" } else { "clean exit" };
			self.emit(
				&core,
				EventKind::Stopped {
					exit_code,
					reason: Some(reason.to_string()),
				},
			);
			return;
		}

		self.set_state(&mut core, ProcessState::Crashed);
		self.emit(
			&core,
			EventKind::Crashed {
				exit_code,
				signal,
				will_restart: restart_wanted,
			},
		);

		if restart_wanted {
			self.logs
				.monitor(&format!(
					"crashed (exit {}), restart {}/{} in {}ms",
					exit_code.unwrap_or(-1),
					core.restart_count + 1,
					self.config.max_restarts,
					self.config.restart_delay_ms
				))
				.await;
			self.schedule_restart(&mut core);
		} else if core.restart_count >= self.config.max_restarts {
			self.logs
				.monitor(&format!(
					"crashed (exit {}), {} restarts exhausted",
					exit_code.unwrap_or(-1),
					self.config.max_restarts
				))
				.await;
		}
	}

	/// Restart decision for one observed exit.
	fn should_restart(
		&self,
		restart_count: u32,
		exit_code: Option<i32>,
		signal: Option<i32>,
		was_stopping: bool,
		idle: Duration,
	) -> bool {
		if was_stopping || !self.config.auto_restart {
			return false;
		}
		if restart_count >= self.config.max_restarts {
			return false;
		}
		// A signal means something outside the app killed it.
		if signal.is_some() {
			return true;
		}
		match exit_code {
			// Exit 0 after a long silence reads as hang-then-kill, not a
			// genuine shutdown.
			Some(0) => idle > self.config.clean_exit_idle(),
			_ => true,
		}
	}

	/// Idempotent: an already-pending restart is cancelled first.
	fn schedule_restart(self: &Arc<Self>, core: &mut Core) {
		if let Some(timer) = core.restart_timer.take() {
			timer.abort();
		}
		core.restart_count += 1;
		let attempt = core.restart_count;
		let delay = self.config.restart_delay();
		let sup = Arc::clone(self);
		core.restart_timer = Some(tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			{
				let mut core = sup.core.lock().await;
				// A stop during the delay cancels the restart.
				if matches!(core.state, ProcessState::Stopped | ProcessState::Stopping) {
					return;
				}
				// The wait is over; drop our own handle so the start below
				// does not cancel the task running it.
				core.restart_timer = None;
			}
			if let Err(error) = sup.start().await {
				sup.logs
					.monitor(&format!("restart attempt {} failed: {}", attempt, error))
					.await;
				let core = sup.core.lock().await;
				sup.emit(&core, EventKind::RestartFailed { attempt, error });
			}
		}));
	}

	async fn pump_stream<R>(self: Arc<Self>, mut reader: R, kind: StreamKind, run: u64)
	where
		R: tokio::io::AsyncRead + Unpin,
	{
		let mut decoder = Utf8Decoder::default();
		let mut buf = [0u8; 8192];
		loop {
			match reader.read(&mut buf).await {
				Ok(0) => break,
				Ok(n) => {
					let text = decoder.feed(&buf[..n]);
					if text.is_empty() {
						continue;
					}
					let mut core = self.core.lock().await;
					if core.run_id != run {
						break;
					}
					self.ingest(&mut core, kind, &text).await;
				}
				Err(_) => break,
			}
		}
	}

	async fn ingest(self: &Arc<Self>, core: &mut Core, kind: StreamKind, text: &str) {
		core.last_activity = Instant::now();
		let lines = match kind {
			StreamKind::Stdout => frame_lines(&mut core.stdout_carry, text),
			_ => frame_lines(&mut core.stderr_carry, text),
		};
		for line in lines {
			self.capture_line(core, kind, &line).await;
		}
	}

	async fn flush_carry(self: &Arc<Self>, core: &mut Core) {
		for kind in [StreamKind::Stdout, StreamKind::Stderr] {
			let carry = match kind {
				StreamKind::Stdout => std::mem::take(&mut core.stdout_carry),
				_ => std::mem::take(&mut core.stderr_carry),
			};
			let line = carry.trim().to_string();
			if !line.is_empty() {
				self.capture_line(core, kind, &line).await;
			}
		}
	}

	async fn capture_line(self: &Arc<Self>, core: &mut Core, kind: StreamKind, line: &str) {
		if let Err(e) = self.logs.append(kind, line).await {
			tracing::warn!(instance = %self.def.instance, error = %e, "log append failed");
		}
		core.ring.push(LogLine {
			at: Utc::now(),
			stream: kind,
			content: line.to_string(),
			instance: self.def.instance.clone(),
		});
		self.inspect_line(core, line).await;
	}

	/// JSON log inspection: error-level lines become stored error records,
	/// fatal ones additionally terminate the child.
	async fn inspect_line(self: &Arc<Self>, core: &mut Core, line: &str) {
		if !line.starts_with('{') {
			return;
		}
		let value: serde_json::Value = match serde_json::from_str(line) {
			Ok(value) => value,
			Err(e) => {
				// Plenty of plain-text lines start with a brace; only a
				// line that also closes one is interesting enough to note.
				if line.ends_with('}') {
					tracing::debug!(instance = %self.def.instance, error = %e, "log line is not json");
				}
				return;
			}
		};
		let Some(level) = value.get("level").and_then(json_level) else {
			return;
		};
		let message = value
			.get("msg")
			.or_else(|| value.get("message"))
			.and_then(|v| v.as_str())
			.unwrap_or(line)
			.to_string();

		if level >= ERROR_LEVEL {
			let error = StructuredError {
				at: Utc::now(),
				level,
				message: message.clone(),
				raw: line.to_string(),
			};
			match self
				.sink
				.store_error(&self.def.instance, core.record.pid, &error)
				.await
			{
				Ok(()) => self.emit(core, EventKind::ErrorDetected { error }),
				Err(e) => {
					tracing::warn!(instance = %self.def.instance, error = %e, "error store failed")
				}
			}
		}

		if level >= FATAL_LEVEL || is_fatal_message(&message) {
			self.handle_fatal(core, &message).await;
		}
	}

	/// Graceful termination on a fatal application error. The exit and
	/// restart pipeline decides what happens afterwards.
	async fn handle_fatal(self: &Arc<Self>, core: &mut Core, message: &str) {
		if core.state != ProcessState::Running {
			return;
		}
		self.logs
			.monitor(&format!("fatal error detected, stopping process: {}", message))
			.await;
		if let Some(pid) = core.child_pid {
			let _ = self.control.signal_group(pid, Signal::SIGTERM);
		}
	}

	async fn health_loop(self: Arc<Self>, run: u64, interval: Duration) {
		loop {
			tokio::time::sleep(interval).await;
			if !self.health_tick(run, interval).await {
				return;
			}
		}
	}

	/// One health-check tick. Returns false once the run it was started
	/// for is over.
	async fn health_tick(self: &Arc<Self>, run: u64, interval: Duration) -> bool {
		let (pid, grace_over, port_confirmed) = {
			let core = self.core.lock().await;
			if core.run_id != run {
				return false;
			}
			if core.state != ProcessState::Running {
				return true;
			}
			let grace_over = core
				.run_started
				.map(|s| s.elapsed() >= self.config.port_grace())
				.unwrap_or(true);
			(core.child_pid, grace_over, core.port_confirmed)
		};

		let mut issues: Vec<String> = Vec::new();

		let pid_dead = match pid {
			Some(pid) => !self.control.alive(pid),
			None => true,
		};
		if pid_dead {
			issues.push("process is not responding to signals".to_string());
		}

		// The probe runs without the state lock; it can take up to the
		// probe timeout.
		let probed = match self.config.expected_port {
			Some(port) if !pid_dead => Some((port, self.probe_port(port).await)),
			_ => None,
		};

		let mut core = self.core.lock().await;
		if core.run_id != run {
			return false;
		}
		if core.state != ProcessState::Running {
			return true;
		}

		match probed {
			Some((_, true)) => {
				core.port_confirmed = true;
				core.port_failures = 0;
				core.restart_kill_sent = false;
			}
			Some((port, false)) => {
				// A server that has not bound its port yet is not failing;
				// count only after first contact or once the grace period
				// has elapsed.
				if port_confirmed || grace_over {
					core.port_failures += 1;
					issues.push(format!(
						"port {} not responding ({}/{})",
						port, core.port_failures, self.config.port_failure_threshold
					));
					if core.port_failures >= self.config.port_failure_threshold
						&& self.config.auto_restart
						&& !core.restart_kill_sent
					{
						core.restart_kill_sent = true;
						self.logs
							.monitor(&format!("port {} unresponsive, restarting", port))
							.await;
						if let Some(pid) = core.child_pid {
							let _ = self.control.signal_group(pid, Signal::SIGTERM);
						}
					}
				}
			}
			None => {}
		}

		let idle = core.last_activity.elapsed();
		if idle > interval * 2 {
			let notice = format!("no output for {}s", idle.as_secs());
			self.logs.monitor(&notice).await;
			issues.push(notice);
		}

		if !issues.is_empty() {
			let idle_ms = idle.as_millis() as u64;
			self.emit(&core, EventKind::HealthCheckFailed { issues, idle_ms });
		}
		true
	}

	/// Anything that answers at all counts as responsive; the body is
	/// dropped unread.
	async fn probe_port(&self, port: u16) -> bool {
		let url = format!("http://127.0.0.1:{}/", port);
		self.probe
			.get(&url)
			.header(reqwest::header::ACCEPT, "*/*")
			.send()
			.await
			.is_ok()
	}

	/// Single source of `state_changed`: emits once per genuine change no
	/// matter how many paths call it.
	fn set_state(&self, core: &mut Core, to: ProcessState) {
		let from = core.state;
		if from == to {
			return;
		}
		core.state = to;
		core.patch(|r| r.status = to);
		self.emit(core, EventKind::StateChanged { from, to });
	}

	fn emit(&self, core: &Core, kind: EventKind) {
		self.events
			.emit(Event::new(&self.def.instance, core.record.pid, kind));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::NullSink;
	use std::sync::atomic::{AtomicU32, Ordering};

	static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

	fn test_supervisor(config: MonitorConfig) -> Arc<ProcessSupervisor> {
		let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir().join(format!("banken-sup-unit-{}", n));
		let _ = std::fs::create_dir_all(&dir);
		let def = ProcessDef {
			instance: "unit".to_string(),
			command: "true".to_string(),
			args: vec![],
			dir: dir.clone(),
			env: Default::default(),
		};
		ProcessSupervisor::new(def, config, LogConfig::new(dir), Arc::new(NullSink)).unwrap()
	}

	#[test]
	fn utf8_decoder_reassembles_split_chars() {
		let text = "héllo wörld";
		let bytes = text.as_bytes();
		// Split inside the two-byte 'é'.
		let mut decoder = Utf8Decoder::default();
		let mut out = decoder.feed(&bytes[..2]);
		out.push_str(&decoder.feed(&bytes[2..]));
		assert_eq!(out, text);
	}

	#[test]
	fn utf8_decoder_every_split_point() {
		let text = "日本語テスト";
		let bytes = text.as_bytes();
		for split in 0..=bytes.len() {
			let mut decoder = Utf8Decoder::default();
			let mut out = decoder.feed(&bytes[..split]);
			out.push_str(&decoder.feed(&bytes[split..]));
			assert_eq!(out, text, "split at {}", split);
		}
	}

	#[test]
	fn utf8_decoder_replaces_invalid_bytes() {
		let mut decoder = Utf8Decoder::default();
		let out = decoder.feed(&[b'a', 0xFF, b'b']);
		assert_eq!(out, "a\u{FFFD}b");
	}

	#[test]
	fn frame_lines_carries_partial_line() {
		let mut carry = String::new();
		assert_eq!(frame_lines(&mut carry, "hel"), Vec::<String>::new());
		assert_eq!(frame_lines(&mut carry, "lo\nwor"), vec!["hello"]);
		assert_eq!(frame_lines(&mut carry, "ld\n"), vec!["world"]);
		assert_eq!(carry, "");
	}

	#[test]
	fn frame_lines_skips_blank_lines() {
		let mut carry = String::new();
		let lines = frame_lines(&mut carry, "a\n\n  \nb\n");
		assert_eq!(lines, vec!["a", "b"]);
	}

	#[test]
	fn fatal_patterns_match_known_failures() {
		assert!(is_fatal_message("FATAL ERROR: JavaScript heap out of memory"));
		assert!(is_fatal_message("Segmentation fault (core dumped)"));
		assert!(is_fatal_message("Error: listen EADDRINUSE: address already in use"));
		assert!(is_fatal_message("Cannot find module 'express'"));
		assert!(is_fatal_message("RangeError: Maximum call stack size exceeded"));
		assert!(is_fatal_message("Failed to compile."));
		assert!(!is_fatal_message("request handled in 3ms"));
	}

	#[test]
	fn json_level_accepts_numbers() {
		assert_eq!(json_level(&serde_json::json!(50)), Some(50));
		assert_eq!(json_level(&serde_json::json!(60.0)), Some(60));
		assert_eq!(json_level(&serde_json::json!("fatal")), None);
	}

	#[test]
	fn restart_policy_table() {
		let sup = test_supervisor(MonitorConfig {
			max_restarts: 3,
			clean_exit_idle_ms: 30_000,
			..Default::default()
		});
		let idle = Duration::from_secs(0);
		let long_idle = Duration::from_secs(60);

		// Explicit stop always wins.
		assert!(!sup.should_restart(0, Some(1), None, true, idle));
		assert!(!sup.should_restart(0, None, Some(9), true, idle));
		// Budget exhausted.
		assert!(!sup.should_restart(3, Some(1), None, false, idle));
		// Signals restart.
		assert!(sup.should_restart(0, None, Some(15), false, idle));
		// Zero exit: only after long silence.
		assert!(!sup.should_restart(0, Some(0), None, false, idle));
		assert!(sup.should_restart(0, Some(0), None, false, long_idle));
		// Any other exit code restarts.
		assert!(sup.should_restart(0, Some(1), None, false, idle));
		assert!(sup.should_restart(2, Some(137), None, false, idle));
	}

	#[test]
	fn restart_policy_respects_auto_restart_flag() {
		let sup = test_supervisor(MonitorConfig {
			auto_restart: false,
			..Default::default()
		});
		assert!(!sup.should_restart(0, Some(1), None, false, Duration::ZERO));
	}

	#[test]
	fn constructor_rejects_missing_config() {
		let dir = std::env::temp_dir();
		let def = ProcessDef {
			instance: "".to_string(),
			command: "true".to_string(),
			args: vec![],
			dir: dir.clone(),
			env: Default::default(),
		};
		assert!(ProcessSupervisor::new(
			def,
			MonitorConfig::default(),
			LogConfig::new(&dir),
			Arc::new(NullSink)
		)
		.is_err());

		let def = ProcessDef {
			instance: "web".to_string(),
			command: "  ".to_string(),
			args: vec![],
			dir,
			env: Default::default(),
		};
		assert!(ProcessSupervisor::new(
			def,
			MonitorConfig::default(),
			LogConfig::new(std::env::temp_dir()),
			Arc::new(NullSink)
		)
		.is_err());
	}
}
