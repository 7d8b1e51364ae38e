use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

/// Maximum partitions tracked per drive. GPT tables are always created with
/// room for this many entries; detecting more than this on an existing drive
/// is fatal for that drive.
pub const MAX_PARTITIONS: usize = 128;

/// Device numbers at or above this limit are logged and skipped during
/// enumeration.
pub const MAX_DRIVES: u32 = 64;

/// Sectors zeroed at the head of every planned partition before the table is
/// written, so the OS cannot resurrect a stale cached file system.
pub const MAX_SECTORS_TO_CLEAR: u64 = 128;

/// How long to wait for a drive or one of its volumes to become accessible.
pub const DRIVE_ACCESS_TIMEOUT: Duration = Duration::from_secs(15);
pub const DRIVE_ACCESS_RETRIES: u32 = 15;

/// Bounded timeout for per-letter volume opens; some drivers hang forever.
pub const VOLUME_OPEN_TIMEOUT: Duration = Duration::from_secs(3);

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;

/// Round `x` up to the next multiple of `y`.
#[inline]
pub fn align_up(x: u64, y: u64) -> u64 {
	debug_assert!(y != 0);
	x.div_ceil(y) * y
}

/// Round `x` down to a multiple of `y`.
#[inline]
pub fn align_down(x: u64, y: u64) -> u64 {
	debug_assert!(y != 0);
	(x / y) * y
}

pub fn size_to_human_readable(size: u64) -> String {
	const UNITS: &[&str] = &["bytes", "KB", "MB", "GB", "TB"];
	let mut value = size as f64;
	let mut unit = 0;
	while value >= 1024.0 && unit < UNITS.len() - 1 {
		value /= 1024.0;
		unit += 1;
	}
	if unit == 0 {
		format!("{} {}", size, UNITS[unit])
	} else {
		format!("{:.1} {}", value, UNITS[unit])
	}
}

/// Cooperative cancellation flag, shared between the Ctrl-C handler and any
/// retry loop that may spin for a while.
#[derive(Clone, Default)]
pub struct CancelToken {
	flag: Arc<AtomicBool>,
}

impl CancelToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.flag.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.flag.load(Ordering::SeqCst)
	}
}
