//! Seams between the portable core and the host OS.
//!
//! Everything the registry, the layout writer, the mount controller and the
//! handle scanner need from the platform goes through the [`DiskHost`],
//! [`DiskIo`] and [`ProcessPort`] traits. [`file::FileHost`] backs them with
//! raw image files or block-device nodes; the in-memory double in [`sim`]
//! backs them for the unit tests.

use std::{
	io::{Read, Seek, Write},
	time::Duration,
};

use anyhow::Result;
use thiserror::Error;

pub mod file;
#[cfg(test)]
pub mod sim;

/// NT namespace prefix for devices that have no mount-point GUID volume.
pub const GROOT_NAME: &str = r"\\?\GLOBALROOT";
pub const GROOT_LEN: usize = 14;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum MediaKind {
	Removable,
	Fixed,
	Unknown,
}

#[derive(Copy, Clone, Debug)]
pub struct DiskGeometry {
	pub disk_size: u64,
	/// Logical sector size as reported by the firmware. Consumers must round
	/// values below 512 up to 512.
	pub sector_size: u32,
	pub sectors_per_track: u32,
	pub media: MediaKind,
}

impl DiskGeometry {
	pub fn bytes_per_track(&self) -> u64 {
		self.sectors_per_track as u64 * self.sector_size as u64
	}
}

/// USB identification data for a physical disk.
#[derive(Clone, Debug, Default)]
pub struct DiskIdentity {
	pub vid: u16,
	pub pid: u16,
	pub vendor: String,
	pub product: String,
}

impl DiskIdentity {
	/// Vendor and product combined the way identification strings are
	/// matched against the scoring tables.
	pub fn model(&self) -> String {
		format!("{} {}", self.vendor.trim(), self.product.trim())
			.trim()
			.to_string()
	}
}

#[derive(Clone, Copy, Debug)]
pub struct DiskExtent {
	pub disk_number: u32,
	pub starting_offset: u64,
}

/// One mounted volume as seen by the OS.
#[derive(Clone, Debug)]
pub struct VolumeInfo {
	/// NT-style volume name, e.g. `\\?\Volume{...}`, without a trailing
	/// backslash.
	pub volume_name: String,
	/// Kernel device name behind the volume, e.g. `\Device\HarddiskVolume7`.
	pub device_name: String,
	pub kind: MediaKind,
	pub extents: Vec<DiskExtent>,
}

/// An open disk. Partition tables and boot records are read and written
/// through the standard I/O traits; `geometry` is fixed for the lifetime of
/// the handle.
pub trait DiskIo: Read + Write + Seek + Send {
	fn geometry(&self) -> DiskGeometry;
	fn sync(&mut self) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum MountError {
	/// The mount point already carries a volume. The caller compares GUIDs
	/// and decides whether to retry after a dismount.
	#[error("Mount point is already in use")]
	AlreadyMounted,
	#[error("{0}")]
	Other(String),
}

/// Platform port for device discovery, mounting and layout refresh.
pub trait DiskHost: Send + Sync {
	/// Physical disk numbers currently present.
	fn disk_indices(&self) -> Vec<u32>;

	fn disk_identity(&self, index: u32) -> Result<DiskIdentity>;

	fn open_disk(&self, index: u32, write: bool) -> Result<Box<dyn DiskIo>>;

	/// The volume mounted on `letter`, if any. Opening must observe the
	/// bounded `timeout`; a hung driver surfaces as an error, not a stall.
	fn letter_volume(&self, letter: char, timeout: Duration) -> Result<Option<VolumeInfo>>;

	/// Every mount-point GUID volume known to the OS.
	fn guid_volumes(&self) -> Result<Vec<VolumeInfo>>;

	/// Resolve a DOS device name (`PhysicalDrive3`, `E:`,
	/// `Harddisk0Partition1`) to its kernel device name.
	fn query_dos_device(&self, name: &str) -> Option<String>;

	/// Define (or, with `None`, remove) a raw DOS device mapping for
	/// `letter`. This is the only way to mount a GLOBALROOT device.
	fn define_dos_device(&self, letter: char, target: Option<&str>) -> Result<()>;

	fn set_mount_point(&self, mount: &str, volume_name: &str) -> Result<(), MountError>;

	fn delete_mount_point(&self, mount: &str) -> Result<()>;

	/// GUID volume currently behind `mount`, if any.
	fn mount_point_volume(&self, mount: &str) -> Option<String>;

	fn letters_in_use(&self) -> Vec<char>;

	fn flush_volume(&self, letter: char) -> Result<()>;

	fn dismount_volume(&self, volume_name: &str) -> Result<()>;

	/// Ask the OS to drop its cached view of the partition table.
	fn reread_partitions(&self, index: u32) -> Result<()>;

	/// Whether this host can mount more than one partition of a removable
	/// drive at once.
	fn supports_multipart_removable(&self) -> bool;
}

/// One entry of the system-wide open-handle table.
#[derive(Clone, Copy, Debug)]
pub struct HandleEntry {
	pub pid: u32,
	pub handle: u64,
	pub granted_access: u32,
	pub object_type_index: u16,
}

/// Token for a handle duplicated into our own address space.
#[derive(Debug)]
pub struct OwnedHandle {
	pub raw: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DupError {
	/// The owning process refused to be opened; the scanner caches the PID
	/// for the remainder of the pass.
	AccessDenied,
	/// The handle or process disappeared between snapshot and duplication.
	Gone,
}

/// Platform port for the handle scanner. Kernel pointers behind these calls
/// can go stale between snapshot and use; implementations must fail per call
/// rather than fault.
pub trait ProcessPort: Send + Sync {
	/// Best-effort debug-privilege elevation so more processes can be
	/// opened. Failure only narrows the result set.
	fn enable_debug_privilege(&self) -> bool {
		false
	}

	fn snapshot(&self) -> Result<Vec<HandleEntry>>;

	fn duplicate(&self, pid: u32, handle: u64) -> Result<OwnedHandle, DupError>;

	/// Whether the duplicated handle refers to a disk or file object.
	/// Everything else would hang the name query and is skipped fast.
	fn is_disk_handle(&self, handle: &OwnedHandle) -> bool;

	fn query_name(&self, handle: &OwnedHandle) -> Option<String>;

	/// User-mode command line of the process, resolved from its own memory.
	fn query_cmdline(&self, pid: u32) -> Option<String>;

	fn query_exe_path(&self, pid: u32) -> Option<String>;

	fn query_image_name(&self, pid: u32) -> Option<String>;

	fn is_running(&self, pid: u32) -> bool;
}
