//! Host backend over raw image files and block-device nodes.
//!
//! This backend has no mounted-volume surface: letter and GUID lookups come
//! back empty, and mount operations are refused. Everything that works on
//! the disk contents itself (enumeration, planning, table and boot-record
//! writes, superblock probing) is fully functional.

use std::{
	fs::File,
	io::{Read, Seek, SeekFrom, Write},
	path::{Path, PathBuf},
	process::{Command, Stdio},
	time::Duration,
};

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::{
	error::OpError,
	sys::{
		DiskGeometry, DiskHost, DiskIdentity, DiskIo, DupError, HandleEntry, MediaKind,
		MountError, OwnedHandle, ProcessPort, VolumeInfo,
	},
};

/// Sectors per track reported for file targets. Matches what USB mass
/// storage firmware reports for virtually every stick in existence.
const FILE_SECTORS_PER_TRACK: u32 = 63;

pub struct FileHost {
	targets: Vec<PathBuf>,
	sector_size: u32,
}

impl FileHost {
	/// `targets` become device indices 1..=N in order. `sector_size` is the
	/// logical sector size to report (images carry no geometry of their
	/// own).
	pub fn new(targets: Vec<PathBuf>, sector_size: u32) -> Result<Self> {
		if !sector_size.is_power_of_two() || !(512..=4096).contains(&sector_size) {
			bail!("Unsupported sector size {}", sector_size);
		}
		for t in &targets {
			if !t.exists() {
				bail!("Target '{}' does not exist", t.display());
			}
		}
		Ok(FileHost {
			targets,
			sector_size,
		})
	}

	fn path_for(&self, index: u32) -> Result<&Path> {
		if index == 0 {
			return Err(OpError::NoDevice.into());
		}
		self.targets
			.get(index as usize - 1)
			.map(|p| p.as_path())
			.ok_or_else(|| OpError::NoDevice.into())
	}
}

struct FileDisk {
	file: File,
	geometry: DiskGeometry,
}

impl Read for FileDisk {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		self.file.read(buf)
	}
}

impl Write for FileDisk {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.file.write(buf)
	}

	fn flush(&mut self) -> std::io::Result<()> {
		self.file.flush()
	}
}

impl Seek for FileDisk {
	fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
		self.file.seek(pos)
	}
}

impl DiskIo for FileDisk {
	fn geometry(&self) -> DiskGeometry {
		self.geometry
	}

	fn sync(&mut self) -> Result<()> {
		self.file.sync_all().context("Failed to sync disk contents")
	}
}

#[cfg(unix)]
fn is_block_device(path: &Path) -> bool {
	use std::os::unix::fs::FileTypeExt;
	std::fs::metadata(path)
		.map(|m| m.file_type().is_block_device())
		.unwrap_or(false)
}

#[cfg(not(unix))]
fn is_block_device(_path: &Path) -> bool {
	false
}

impl DiskHost for FileHost {
	fn disk_indices(&self) -> Vec<u32> {
		(1..=self.targets.len() as u32).collect()
	}

	fn disk_identity(&self, index: u32) -> Result<DiskIdentity> {
		let path = self.path_for(index)?;
		Ok(DiskIdentity {
			vid: 0,
			pid: 0,
			vendor: String::new(),
			product: path
				.file_name()
				.map(|n| n.to_string_lossy().to_string())
				.unwrap_or_default(),
		})
	}

	fn open_disk(&self, index: u32, write: bool) -> Result<Box<dyn DiskIo>> {
		let path = self.path_for(index)?;
		let mut file = match File::options().read(true).write(write).open(path) {
			Ok(file) => file,
			Err(e) => {
				let err = match e.kind() {
					std::io::ErrorKind::PermissionDenied => {
						anyhow::Error::new(e).context(OpError::AccessDenied)
					}
					// EBUSY: the kernel (or another process) holds the
					// block device exclusively.
					_ if cfg!(unix) && e.raw_os_error() == Some(16) => {
						anyhow::Error::new(e).context(OpError::Sharing)
					}
					_ => anyhow::Error::new(e),
				};
				return Err(err.context(format!("Unable to open '{}'", path.display())));
			}
		};
		// Image file sizes are in the metadata; block devices report their
		// size only through a seek to the end.
		let disk_size = file.seek(SeekFrom::End(0))?;
		file.seek(SeekFrom::Start(0))?;
		if disk_size == 0 {
			return Err(OpError::BadMedia(format!("'{}' is empty", path.display())).into());
		}
		let media = if is_block_device(path) {
			MediaKind::Removable
		} else {
			MediaKind::Unknown
		};
		Ok(Box::new(FileDisk {
			file,
			geometry: DiskGeometry {
				disk_size,
				sector_size: self.sector_size,
				sectors_per_track: FILE_SECTORS_PER_TRACK,
				media,
			},
		}))
	}

	fn letter_volume(&self, _letter: char, _timeout: Duration) -> Result<Option<VolumeInfo>> {
		Ok(None)
	}

	fn guid_volumes(&self) -> Result<Vec<VolumeInfo>> {
		Ok(Vec::new())
	}

	fn query_dos_device(&self, _name: &str) -> Option<String> {
		None
	}

	fn define_dos_device(&self, _letter: char, _target: Option<&str>) -> Result<()> {
		bail!("The file backend has no DOS device table");
	}

	fn set_mount_point(&self, _mount: &str, _volume_name: &str) -> Result<(), MountError> {
		Err(MountError::Other(
			"The file backend cannot mount volumes".to_string(),
		))
	}

	fn delete_mount_point(&self, _mount: &str) -> Result<()> {
		bail!("The file backend cannot mount volumes");
	}

	fn mount_point_volume(&self, _mount: &str) -> Option<String> {
		None
	}

	fn letters_in_use(&self) -> Vec<char> {
		Vec::new()
	}

	fn flush_volume(&self, _letter: char) -> Result<()> {
		Ok(())
	}

	fn dismount_volume(&self, _volume_name: &str) -> Result<()> {
		Ok(())
	}

	fn reread_partitions(&self, index: u32) -> Result<()> {
		let path = self.path_for(index)?;
		if !is_block_device(path) {
			debug!("'{}' is a plain file, no partition re-read needed", path.display());
			return Ok(());
		}
		// Tell the kernel to reload the partition table.
		debug!("Refreshing partition table ...");
		let mut command = Command::new("partprobe");
		let command = command.arg("--summary").arg(path).stdout(Stdio::piped());
		let out = command
			.output()
			.context("Failed to run partprobe(8) to refresh the partition table")?
			.stdout;
		info!("partprobe: {}", String::from_utf8_lossy(&out).trim());
		Ok(())
	}

	fn supports_multipart_removable(&self) -> bool {
		true
	}
}

/// Process port for hosts without a system handle table. Every scan pass
/// completes with an empty result.
pub struct NullProcessPort;

impl ProcessPort for NullProcessPort {
	fn snapshot(&self) -> Result<Vec<HandleEntry>> {
		Ok(Vec::new())
	}

	fn duplicate(&self, _pid: u32, _handle: u64) -> Result<OwnedHandle, DupError> {
		Err(DupError::Gone)
	}

	fn is_disk_handle(&self, _handle: &OwnedHandle) -> bool {
		false
	}

	fn query_name(&self, _handle: &OwnedHandle) -> Option<String> {
		None
	}

	fn query_cmdline(&self, _pid: u32) -> Option<String> {
		None
	}

	fn query_exe_path(&self, _pid: u32) -> Option<String> {
		None
	}

	fn query_image_name(&self, _pid: u32) -> Option<String> {
		None
	}

	fn is_running(&self, _pid: u32) -> bool {
		false
	}
}
