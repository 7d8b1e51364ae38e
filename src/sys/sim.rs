//! In-memory host used by the unit tests: sparse disk buffers, a small
//! letter/volume/DOS-device table and a fake process handle table.

use std::{
	collections::{BTreeMap, HashSet},
	io::{Read, Seek, SeekFrom, Write},
	sync::{Arc, Mutex},
	time::Duration,
};

use anyhow::{bail, Result};

use crate::sys::{
	DiskExtent, DiskGeometry, DiskHost, DiskIdentity, DiskIo, DupError, HandleEntry, MediaKind,
	MountError, OwnedHandle, ProcessPort, VolumeInfo,
};

const CHUNK: usize = 4096;

/// Chunked zero-filled buffer so tests can stand up multi-gigabyte disks
/// without allocating them.
pub struct SparseBuf {
	len: u64,
	chunks: BTreeMap<u64, Box<[u8; CHUNK]>>,
}

impl SparseBuf {
	pub fn new(len: u64) -> Self {
		SparseBuf {
			len,
			chunks: BTreeMap::new(),
		}
	}

	pub fn len(&self) -> u64 {
		self.len
	}

	pub fn read_at(&self, mut pos: u64, buf: &mut [u8]) {
		for byte in buf.iter_mut() {
			let chunk = pos / CHUNK as u64;
			let off = (pos % CHUNK as u64) as usize;
			*byte = match self.chunks.get(&chunk) {
				Some(data) => data[off],
				None => 0,
			};
			pos += 1;
		}
	}

	pub fn write_at(&mut self, mut pos: u64, buf: &[u8]) {
		for byte in buf {
			let chunk = pos / CHUNK as u64;
			let off = (pos % CHUNK as u64) as usize;
			let data = self
				.chunks
				.entry(chunk)
				.or_insert_with(|| Box::new([0u8; CHUNK]));
			data[off] = *byte;
			pos += 1;
		}
	}
}

struct SimDisk {
	buf: Arc<Mutex<SparseBuf>>,
	geometry: DiskGeometry,
	identity: DiskIdentity,
}

/// Open handle onto a sim disk.
pub struct SimDiskIo {
	buf: Arc<Mutex<SparseBuf>>,
	geometry: DiskGeometry,
	pos: u64,
}

impl Read for SimDiskIo {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		let inner = self.buf.lock().unwrap();
		let remaining = inner.len().saturating_sub(self.pos);
		let n = (buf.len() as u64).min(remaining) as usize;
		inner.read_at(self.pos, &mut buf[..n]);
		self.pos += n as u64;
		Ok(n)
	}
}

impl Write for SimDiskIo {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let mut inner = self.buf.lock().unwrap();
		if self.pos + buf.len() as u64 > inner.len() {
			return Err(std::io::Error::new(
				std::io::ErrorKind::WriteZero,
				"write past end of sim disk",
			));
		}
		inner.write_at(self.pos, buf);
		self.pos += buf.len() as u64;
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

impl Seek for SimDiskIo {
	fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
		let len = self.buf.lock().unwrap().len();
		let new = match pos {
			SeekFrom::Start(n) => n as i64,
			SeekFrom::End(n) => len as i64 + n,
			SeekFrom::Current(n) => self.pos as i64 + n,
		};
		if new < 0 {
			return Err(std::io::Error::new(
				std::io::ErrorKind::InvalidInput,
				"seek before start",
			));
		}
		self.pos = new as u64;
		Ok(self.pos)
	}
}

impl DiskIo for SimDiskIo {
	fn geometry(&self) -> DiskGeometry {
		self.geometry
	}

	fn sync(&mut self) -> Result<()> {
		Ok(())
	}
}

struct SimVolume {
	info: VolumeInfo,
	letter: Option<char>,
	/// Volumes the OS only notices after a partition-table re-read.
	pending: bool,
}

#[derive(Default)]
struct SimState {
	disks: BTreeMap<u32, SimDisk>,
	volumes: Vec<SimVolume>,
	/// Raw DOS device definitions (letter -> kernel device path).
	dos_defined: BTreeMap<char, String>,
	dos_devices: BTreeMap<String, String>,
	hung_letters: HashSet<char>,
}

#[derive(Default)]
pub struct SimHost {
	state: Mutex<SimState>,
	pub multipart_removable: bool,
}

impl SimHost {
	pub fn new() -> Self {
		SimHost {
			state: Mutex::default(),
			multipart_removable: true,
		}
	}

	pub fn add_disk(
		&self,
		index: u32,
		size: u64,
		sector_size: u32,
		sectors_per_track: u32,
		media: MediaKind,
		identity: DiskIdentity,
	) {
		let mut state = self.state.lock().unwrap();
		state.dos_devices.insert(
			format!("PhysicalDrive{}", index),
			format!(r"\Device\Harddisk{0}\DR{0}", index),
		);
		state.disks.insert(
			index,
			SimDisk {
				buf: Arc::new(Mutex::new(SparseBuf::new(size))),
				geometry: DiskGeometry {
					disk_size: size,
					sector_size,
					sectors_per_track,
					media,
				},
				identity,
			},
		);
	}

	#[allow(clippy::too_many_arguments)]
	pub fn add_volume(
		&self,
		guid: &str,
		hd_volume: u32,
		kind: MediaKind,
		disk: u32,
		offset: u64,
		letter: Option<char>,
		pending: bool,
	) {
		let mut state = self.state.lock().unwrap();
		let device_name = format!(r"\Device\HarddiskVolume{}", hd_volume);
		if let Some(l) = letter {
			state.dos_devices.insert(format!("{}:", l), device_name.clone());
		}
		state.volumes.push(SimVolume {
			info: VolumeInfo {
				volume_name: format!(r"\\?\Volume{{{}}}", guid),
				device_name,
				kind,
				extents: vec![DiskExtent {
					disk_number: disk,
					starting_offset: offset,
				}],
			},
			letter,
			pending,
		});
	}

	/// Register a `Harddisk<N>Partition<M>` kernel mapping the way the OS
	/// names partitions that carry no mount-point volume.
	pub fn map_partition_device(&self, disk: u32, partition: u32, hd_volume: u32) {
		let mut state = self.state.lock().unwrap();
		state.dos_devices.insert(
			format!("Harddisk{}Partition{}", disk, partition),
			format!(r"\Device\HarddiskVolume{}", hd_volume),
		);
	}

	/// Make every open of this letter time out, like a wedged driver.
	pub fn hang_letter(&self, letter: char) {
		self.state.lock().unwrap().hung_letters.insert(letter);
	}

	pub fn defined_dos_device(&self, letter: char) -> Option<String> {
		self.state.lock().unwrap().dos_defined.get(&letter).cloned()
	}
}

impl DiskHost for SimHost {
	fn disk_indices(&self) -> Vec<u32> {
		self.state.lock().unwrap().disks.keys().copied().collect()
	}

	fn disk_identity(&self, index: u32) -> Result<DiskIdentity> {
		let state = self.state.lock().unwrap();
		match state.disks.get(&index) {
			Some(disk) => Ok(disk.identity.clone()),
			None => bail!(crate::error::OpError::NoDevice),
		}
	}

	fn open_disk(&self, index: u32, _write: bool) -> Result<Box<dyn DiskIo>> {
		let state = self.state.lock().unwrap();
		match state.disks.get(&index) {
			Some(disk) => Ok(Box::new(SimDiskIo {
				buf: Arc::clone(&disk.buf),
				geometry: disk.geometry,
				pos: 0,
			})),
			None => bail!(crate::error::OpError::NoDevice),
		}
	}

	fn letter_volume(&self, letter: char, _timeout: Duration) -> Result<Option<VolumeInfo>> {
		let state = self.state.lock().unwrap();
		if state.hung_letters.contains(&letter) {
			bail!("Timed out opening volume {}:", letter);
		}
		Ok(state
			.volumes
			.iter()
			.find(|v| v.letter == Some(letter) && !v.pending)
			.map(|v| v.info.clone()))
	}

	fn guid_volumes(&self) -> Result<Vec<VolumeInfo>> {
		let state = self.state.lock().unwrap();
		Ok(state
			.volumes
			.iter()
			.filter(|v| !v.pending)
			.map(|v| v.info.clone())
			.collect())
	}

	fn query_dos_device(&self, name: &str) -> Option<String> {
		self.state.lock().unwrap().dos_devices.get(name).cloned()
	}

	fn define_dos_device(&self, letter: char, target: Option<&str>) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		match target {
			Some(t) => {
				state.dos_defined.insert(letter, t.to_string());
			}
			None => {
				if state.dos_defined.remove(&letter).is_none() {
					bail!("No DOS device defined for {}:", letter);
				}
			}
		}
		Ok(())
	}

	fn set_mount_point(&self, mount: &str, volume_name: &str) -> Result<(), MountError> {
		let letter = mount
			.chars()
			.next()
			.ok_or_else(|| MountError::Other("empty mount point".to_string()))?;
		let mut state = self.state.lock().unwrap();
		if state.volumes.iter().any(|v| v.letter == Some(letter)) {
			return Err(MountError::AlreadyMounted);
		}
		let device_name = match state
			.volumes
			.iter_mut()
			.find(|v| v.info.volume_name == volume_name)
		{
			Some(volume) => {
				volume.letter = Some(letter);
				volume.info.device_name.clone()
			}
			None => {
				return Err(MountError::Other(format!(
					"No such volume '{}'",
					volume_name
				)))
			}
		};
		state.dos_devices.insert(format!("{}:", letter), device_name);
		Ok(())
	}

	fn delete_mount_point(&self, mount: &str) -> Result<()> {
		let letter = mount.chars().next().unwrap_or('?');
		let mut state = self.state.lock().unwrap();
		match state.volumes.iter_mut().find(|v| v.letter == Some(letter)) {
			Some(volume) => {
				volume.letter = None;
				state.dos_devices.remove(&format!("{}:", letter));
				Ok(())
			}
			None => bail!("Nothing mounted on {}:", letter),
		}
	}

	fn mount_point_volume(&self, mount: &str) -> Option<String> {
		let letter = mount.chars().next()?;
		let state = self.state.lock().unwrap();
		state
			.volumes
			.iter()
			.find(|v| v.letter == Some(letter))
			.map(|v| v.info.volume_name.clone())
	}

	fn letters_in_use(&self) -> Vec<char> {
		let state = self.state.lock().unwrap();
		let mut letters: Vec<char> = state.volumes.iter().filter_map(|v| v.letter).collect();
		letters.extend(state.dos_defined.keys().copied());
		letters.sort_unstable();
		letters.dedup();
		letters
	}

	fn flush_volume(&self, _letter: char) -> Result<()> {
		Ok(())
	}

	fn dismount_volume(&self, _volume_name: &str) -> Result<()> {
		Ok(())
	}

	fn reread_partitions(&self, _index: u32) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		for volume in state.volumes.iter_mut() {
			volume.pending = false;
		}
		Ok(())
	}

	fn supports_multipart_removable(&self) -> bool {
		self.multipart_removable
	}
}

#[derive(Clone)]
pub struct SimProcess {
	pub pid: u32,
	pub cmdline: Option<String>,
	pub exe_path: Option<String>,
	pub image_name: Option<String>,
	pub running: bool,
	pub deny_open: bool,
}

struct SimHandle {
	pid: u32,
	handle: u64,
	access: u32,
	name: String,
	disk: bool,
}

#[derive(Default)]
struct SimProcState {
	processes: BTreeMap<u32, SimProcess>,
	handles: Vec<SimHandle>,
}

/// Fake system handle table for scanner tests.
#[derive(Default)]
pub struct SimProcessPort {
	state: Mutex<SimProcState>,
}

impl SimProcessPort {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_process(&self, process: SimProcess) {
		let mut state = self.state.lock().unwrap();
		state.processes.insert(process.pid, process);
	}

	pub fn add_handle(&self, pid: u32, handle: u64, access: u32, name: &str, disk: bool) {
		let mut state = self.state.lock().unwrap();
		state.handles.push(SimHandle {
			pid,
			handle,
			access,
			name: name.to_string(),
			disk,
		});
	}

	pub fn remove_handles_of(&self, pid: u32) {
		let mut state = self.state.lock().unwrap();
		state.handles.retain(|h| h.pid != pid);
	}

	pub fn set_running(&self, pid: u32, running: bool) {
		let mut state = self.state.lock().unwrap();
		if let Some(process) = state.processes.get_mut(&pid) {
			process.running = running;
		}
	}
}

impl ProcessPort for SimProcessPort {
	fn enable_debug_privilege(&self) -> bool {
		true
	}

	fn snapshot(&self) -> Result<Vec<HandleEntry>> {
		let state = self.state.lock().unwrap();
		Ok(state
			.handles
			.iter()
			.map(|h| HandleEntry {
				pid: h.pid,
				handle: h.handle,
				granted_access: h.access,
				object_type_index: if h.disk { 0x25 } else { 0x10 },
			})
			.collect())
	}

	fn duplicate(&self, pid: u32, handle: u64) -> Result<OwnedHandle, DupError> {
		let state = self.state.lock().unwrap();
		match state.processes.get(&pid) {
			Some(process) if process.deny_open => return Err(DupError::AccessDenied),
			Some(_) => (),
			None => return Err(DupError::Gone),
		}
		state
			.handles
			.iter()
			.find(|h| h.pid == pid && h.handle == handle)
			.map(|h| OwnedHandle { raw: h.handle })
			.ok_or(DupError::Gone)
	}

	fn is_disk_handle(&self, handle: &OwnedHandle) -> bool {
		let state = self.state.lock().unwrap();
		state
			.handles
			.iter()
			.find(|h| h.handle == handle.raw)
			.map(|h| h.disk)
			.unwrap_or(false)
	}

	fn query_name(&self, handle: &OwnedHandle) -> Option<String> {
		let state = self.state.lock().unwrap();
		state
			.handles
			.iter()
			.find(|h| h.handle == handle.raw)
			.map(|h| h.name.clone())
	}

	fn query_cmdline(&self, pid: u32) -> Option<String> {
		let state = self.state.lock().unwrap();
		state.processes.get(&pid).and_then(|p| p.cmdline.clone())
	}

	fn query_exe_path(&self, pid: u32) -> Option<String> {
		let state = self.state.lock().unwrap();
		state.processes.get(&pid).and_then(|p| p.exe_path.clone())
	}

	fn query_image_name(&self, pid: u32) -> Option<String> {
		let state = self.state.lock().unwrap();
		state.processes.get(&pid).and_then(|p| p.image_name.clone())
	}

	fn is_running(&self, pid: u32) -> bool {
		let state = self.state.lock().unwrap();
		state.processes.get(&pid).map(|p| p.running).unwrap_or(false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sparse_buf_io() {
		let mut buf = SparseBuf::new(32 * crate::utils::GB);
		let mut sector = [0u8; 512];
		buf.read_at(8 * crate::utils::GB, &mut sector);
		assert!(sector.iter().all(|b| *b == 0));
		buf.write_at(8 * crate::utils::GB + 10, &[1, 2, 3]);
		buf.read_at(8 * crate::utils::GB, &mut sector);
		assert_eq!(&sector[10..13], &[1, 2, 3]);
	}

	#[test]
	fn test_sim_disk_io_round_trip() {
		let host = SimHost::new();
		host.add_disk(
			1,
			16 * crate::utils::MB,
			512,
			63,
			MediaKind::Removable,
			DiskIdentity::default(),
		);
		let mut disk = host.open_disk(1, true).unwrap();
		disk.seek(SeekFrom::Start(0x1FE)).unwrap();
		disk.write_all(&[0x55, 0xAA]).unwrap();
		let mut back = [0u8; 2];
		disk.seek(SeekFrom::Start(0x1FE)).unwrap();
		disk.read_exact(&mut back).unwrap();
		assert_eq!(back, [0x55, 0xAA]);
		assert_eq!(disk.seek(SeekFrom::End(0)).unwrap(), 16 * crate::utils::MB);
	}
}
