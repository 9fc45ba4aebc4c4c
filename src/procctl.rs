use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Platform process control. Signals target the whole process group so
/// children forked by the supervised process (dev servers in particular)
/// are included. ESRCH is reported as success: the process is already
/// gone, which is the outcome a kill wants anyway.
pub trait ProcessControl: Send + Sync {
	/// Signal the process group rooted at `pid`.
	fn signal_group(&self, pid: i32, sig: Signal) -> Result<(), String>;
	/// Signal `pid` directly, without touching its descendants.
	fn signal_pid(&self, pid: i32, sig: Signal) -> Result<(), String>;
	/// Liveness probe via signal 0.
	fn alive(&self, pid: i32) -> bool;
}

#[derive(Debug, Default)]
pub struct PosixControl;

impl ProcessControl for PosixControl {
	fn signal_group(&self, pid: i32, sig: Signal) -> Result<(), String> {
		match killpg(Pid::from_raw(pid), sig) {
			Ok(()) | Err(Errno::ESRCH) => Ok(()),
			Err(e) => Err(format!("killpg({}, {}): {}", pid, sig, e)),
		}
	}

	fn signal_pid(&self, pid: i32, sig: Signal) -> Result<(), String> {
		match kill(Pid::from_raw(pid), sig) {
			Ok(()) | Err(Errno::ESRCH) => Ok(()),
			Err(e) => Err(format!("kill({}, {}): {}", pid, sig, e)),
		}
	}

	fn alive(&self, pid: i32) -> bool {
		kill(Pid::from_raw(pid), None).is_ok()
	}
}
