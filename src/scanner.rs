//! Background handle scanner.
//!
//! One dedicated worker thread enumerates every open kernel handle in the
//! system, duplicates the ones pointing at the watched device names and
//! records which processes hold them with what access. The result drives
//! the "waiting for exclusive access" picture: the caller learns who is
//! blocking the drive and with which of read/write/execute.
//!
//! The thread parks on a condition variable until a target is armed, runs
//! one full pass per second afterwards, and exports results under a coarse
//! mutex. It never holds that mutex across an OS call, and it never opens
//! the target device itself.

use std::{
	collections::HashSet,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Condvar, Mutex,
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
	device::DriveInfo,
	sys::{DiskHost, DupError, HandleEntry, ProcessPort},
};

/// Ring capacity for blocking-process entries.
pub const MAX_BLOCKING_PROCESSES: usize = 16;

pub const ACCESS_READ: u8 = 0x1;
pub const ACCESS_WRITE: u8 = 0x2;
pub const ACCESS_EXEC: u8 = 0x4;

/// Granted-access bits worth reporting: read (bit 0), write (bit 1) and
/// execute (bit 5, repositioned to 0x4 on export).
const INTERESTING_ACCESS: u32 = 0x23;

const PASS_THROTTLE: Duration = Duration::from_secs(1);
const PARK_POLL: Duration = Duration::from_millis(500);
const WARMUP_POLL: Duration = Duration::from_millis(100);

/// One process currently holding a watched handle.
#[derive(Clone, Debug)]
pub struct ProcessEntry {
	pub pid: u32,
	/// r/w/x in the low three bits.
	pub access: u8,
	pub cmdline: String,
	pub seen_on_pass: u64,
}

#[derive(Default)]
struct ScanState {
	watched: Vec<String>,
	/// Bumped by `arm`; the worker copies the names when it differs from
	/// `synced_version` and resets the pass counter.
	version: u64,
	synced_version: u64,
	/// Completed passes against the current watched set.
	pass: u64,
	entries: Vec<ProcessEntry>,
}

struct Shared {
	state: Mutex<ScanState>,
	wakeup: Condvar,
	active: AtomicBool,
}

/// Owner of the scanning thread. Dropping it stops the thread
/// cooperatively.
pub struct Scanner {
	shared: Arc<Shared>,
	port: Arc<dyn ProcessPort>,
	worker: Option<JoinHandle<()>>,
}

impl Scanner {
	pub fn start(port: Arc<dyn ProcessPort>) -> Scanner {
		Scanner::with_throttle(port, PASS_THROTTLE)
	}

	/// Start with a custom inter-pass throttle (tests).
	pub fn with_throttle(port: Arc<dyn ProcessPort>, throttle: Duration) -> Scanner {
		if !port.enable_debug_privilege() {
			debug!("Debug privilege not available, fewer processes will be visible");
		}
		let shared = Arc::new(Shared {
			state: Mutex::new(ScanState::default()),
			wakeup: Condvar::new(),
			active: AtomicBool::new(true),
		});
		let worker = {
			let shared = Arc::clone(&shared);
			let port = Arc::clone(&port);
			thread::Builder::new()
				.name("handle-scanner".to_string())
				.spawn(move || worker_loop(&shared, port.as_ref(), throttle))
				.expect("failed to spawn the handle scanner thread")
		};
		Scanner {
			shared,
			port,
			worker: Some(worker),
		}
	}

	/// Set the watched handle-name list and wake the worker. An empty list
	/// parks the scanner again.
	pub fn arm(&self, names: Vec<String>) {
		{
			let mut state = self.shared.state.lock().unwrap();
			state.watched = names;
			state.version += 1;
		}
		self.shared.wakeup.notify_all();
	}

	pub fn disarm(&self) {
		self.arm(Vec::new());
	}

	/// Watch a drive: its physical device kernel name plus the kernel name
	/// behind every mounted letter.
	pub fn arm_for_drive(&self, host: &dyn DiskHost, drive: &DriveInfo) {
		let mut names = Vec::new();
		match host.query_dos_device(&format!("PhysicalDrive{}", drive.index)) {
			Some(device) => names.push(device),
			None => names.push(drive.physical_path.clone()),
		}
		for letter in &drive.letters {
			if let Some(device) = host.query_dos_device(&format!("{}:", letter)) {
				names.push(device);
			}
		}
		debug!("Watching handles: {:?}", names);
		self.arm(names);
	}

	/// Snapshot of the processes blocking the watched targets.
	///
	/// Blocks up to `timeout` until at least one pass against the current
	/// watched set has completed, so early callers don't read an empty
	/// warm-up state. Entries are filtered by `access_mask`;
	/// `ignore_stale` additionally drops processes that are no longer
	/// running. Returns the combined access mask and the matching entries.
	pub fn get_blocking(
		&self,
		timeout: Duration,
		access_mask: u8,
		ignore_stale: bool,
	) -> (u8, Vec<ProcessEntry>) {
		let deadline = Instant::now() + timeout;
		let entries = loop {
			{
				let state = self.shared.state.lock().unwrap();
				if state.version == state.synced_version && state.pass >= 1 {
					break state.entries.clone();
				}
			}
			if Instant::now() >= deadline {
				if !timeout.is_zero() {
					warn!("Timeout while retrieving the conflicting process list");
				}
				return (0, Vec::new());
			}
			thread::sleep(WARMUP_POLL);
		};
		// The staleness check talks to the OS, so it runs outside the lock.
		let mut combined = 0u8;
		let mut result = Vec::new();
		for entry in entries {
			if entry.access & access_mask == 0 {
				continue;
			}
			if ignore_stale && !self.port.is_running(entry.pid) {
				continue;
			}
			combined |= entry.access;
			result.push(entry);
		}
		(combined & access_mask, result)
	}
}

impl Drop for Scanner {
	fn drop(&mut self) {
		self.shared.active.store(false, Ordering::SeqCst);
		self.shared.wakeup.notify_all();
		if let Some(worker) = self.worker.take() {
			if worker.join().is_err() {
				warn!("Handle scanner thread panicked during shutdown");
			}
		}
	}
}

fn worker_loop(shared: &Shared, port: &dyn ProcessPort, throttle: Duration) {
	let mut names: Vec<String> = Vec::new();
	while shared.active.load(Ordering::SeqCst) {
		// Copy the watched names under the lock, then never touch shared
		// state during enumeration.
		{
			let mut state = shared.state.lock().unwrap();
			loop {
				if !shared.active.load(Ordering::SeqCst) {
					return;
				}
				if state.version != state.synced_version {
					names = state.watched.clone();
					state.synced_version = state.version;
					state.pass = 0;
					state.entries.clear();
				}
				if !names.is_empty() {
					break;
				}
				state = shared.wakeup.wait_timeout(state, PARK_POLL).unwrap().0;
			}
		}

		let start = Instant::now();
		if run_pass(shared, port, &names) {
			let mut state = shared.state.lock().unwrap();
			state.pass += 1;
			// Entries not seen for two passes are ghosts.
			let pass = state.pass;
			state.entries.retain(|e| e.seen_on_pass + 1 >= pass);
			debug!(
				"Process search pass #{} completed in {} ms",
				pass,
				start.elapsed().as_millis()
			);
		}

		let state = shared.state.lock().unwrap();
		let _ = shared.wakeup.wait_timeout(state, throttle);
	}
}

/// One full scan. Returns whether the pass ran to completion.
fn run_pass(shared: &Shared, port: &dyn ProcessPort, names: &[String]) -> bool {
	let mut handles = match port.snapshot() {
		Ok(handles) => handles,
		Err(e) => {
			debug!("Handle snapshot failed: {:#}", e);
			return false;
		}
	};
	// Walking in PID order lets one process handle serve all of that
	// process's entries.
	handles.sort_by_key(|h| h.pid);

	let mut denied: HashSet<u32> = HashSet::new();
	let mut cur_pid = 0u32;
	let mut accumulated = 0u32;
	let mut matched = false;
	for handle in &handles {
		if !shared.active.load(Ordering::SeqCst) {
			return false;
		}
		if handle.pid != cur_pid {
			if matched {
				publish(shared, port, cur_pid, accumulated);
			}
			cur_pid = handle.pid;
			accumulated = 0;
			matched = false;
		}
		if denied.contains(&handle.pid) {
			continue;
		}
		// A zero object-type index marks an entry that went stale between
		// the snapshot and now.
		if handle.object_type_index == 0 {
			continue;
		}
		if handle.granted_access & INTERESTING_ACCESS == 0 {
			continue;
		}
		if scan_handle(port, handle, names, &mut denied) {
			matched = true;
			accumulated |= handle.granted_access;
		}
	}
	if matched {
		publish(shared, port, cur_pid, accumulated);
	}
	true
}

fn scan_handle(
	port: &dyn ProcessPort,
	handle: &HandleEntry,
	names: &[String],
	denied: &mut HashSet<u32>,
) -> bool {
	let dup = match port.duplicate(handle.pid, handle.handle) {
		Ok(dup) => dup,
		Err(DupError::AccessDenied) => {
			// Skip this process for the remainder of the pass.
			denied.insert(handle.pid);
			return false;
		}
		Err(DupError::Gone) => return false,
	};
	// The kernel object can go away between the snapshot and these
	// queries; a fault here must only lose this one handle.
	let name = match catch_unwind(AssertUnwindSafe(|| {
		if !port.is_disk_handle(&dup) {
			return None;
		}
		port.query_name(&dup)
	})) {
		Ok(Some(name)) => name,
		_ => return false,
	};
	names.iter().any(|w| name.starts_with(w.as_str()))
}

fn publish(shared: &Shared, port: &dyn ProcessPort, pid: u32, accumulated: u32) {
	let mut access = (accumulated & INTERESTING_ACCESS) as u8;
	// The execute bit sits at 0x20; reposition it next to read/write.
	if access & 0x20 != 0 {
		access = (access & 0x03) | ACCESS_EXEC;
	}
	access &= 0x07;

	// Display name resolution, best source first: the user-mode command
	// line, the executable module path, the process image name, then a
	// synthetic fallback.
	let cmdline = port
		.query_cmdline(pid)
		.or_else(|| port.query_exe_path(pid))
		.or_else(|| port.query_image_name(pid))
		.unwrap_or_else(|| format!("Unknown_Process_{}", pid));

	let mut state = shared.state.lock().unwrap();
	let seen_on_pass = state.pass + 1;
	if let Some(entry) = state.entries.iter_mut().find(|e| e.pid == pid) {
		entry.access = access;
		entry.cmdline = cmdline;
		entry.seen_on_pass = seen_on_pass;
	} else if state.entries.len() < MAX_BLOCKING_PROCESSES {
		state.entries.push(ProcessEntry {
			pid,
			access,
			cmdline,
			seen_on_pass,
		});
	} else {
		debug!("No empty blocking-process slot for pid {}", pid);
	}
}
