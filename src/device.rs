//! Device discovery and classification.
//!
//! The registry walks the 26 drive letters (each behind a bounded-timeout
//! open, because some drivers hang), rejects multi-extent volumes, reads the
//! drive geometry and the existing partition table, then matches every
//! mount-point GUID volume back to a physical disk by its first extent.
//! The result is one immutable [`DriveInfo`] per device, rebuilt on rescan.

use std::{
	collections::BTreeMap,
	io::{Read, Seek, SeekFrom},
	sync::Arc,
	thread,
};

use anyhow::{bail, Context, Result};
use gptman::GPT;
use log::{debug, error, info, warn};
use mbrman::MBR;
use uuid::Uuid;

use crate::{
	error::OpError,
	fsprobe::{self, FsKind},
	plan::{MBR_UEFI_MARKER, PARTTYPE_BASIC_UUID, PARTTYPE_ESP_UUID, PARTTYPE_MSR_UUID},
	score,
	sys::{DiskHost, DiskIdentity, DiskIo, MediaKind, VolumeInfo, GROOT_NAME},
	utils::{
		size_to_human_readable, CancelToken, DRIVE_ACCESS_RETRIES, DRIVE_ACCESS_TIMEOUT, GB,
		MAX_DRIVES, MAX_PARTITIONS, VOLUME_OPEN_TIMEOUT,
	},
};

/// MBR type of the BIOS-compatibility stub partition this tool creates.
pub const EXTRA_PARTITION_TYPE: u8 = 0xEA;

/// MBR partition types Windows is willing to assign a mount point to.
const MBR_MOUNTABLE: &[u8] = &[0x01, 0x04, 0x06, 0x07, 0x0b, 0x0c, 0x0e, 0xef];

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum PartitionStyle {
	#[strum(serialize = "MBR")]
	Mbr,
	#[strum(serialize = "GPT")]
	Gpt,
	#[strum(serialize = "RAW")]
	Raw,
}

/// Partition type tag: a one-byte code on MBR, a type GUID on GPT.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartTypeTag {
	Mbr(u8),
	Gpt(Uuid),
}

impl std::fmt::Display for PartTypeTag {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			PartTypeTag::Mbr(t) => write!(f, "{:#04x}", t),
			PartTypeTag::Gpt(guid) => write!(f, "{}", guid),
		}
	}
}

#[derive(Clone, Debug)]
pub struct PartitionRecord {
	/// Starting byte offset on the disk.
	pub offset: u64,
	/// Size in bytes.
	pub size: u64,
	pub tag: PartTypeTag,
	/// GPT partition label; empty on MBR.
	pub name: String,
	/// GPT attribute bitmap; zero on MBR.
	pub attributes: u64,
	/// GPT unique partition GUID.
	pub unique_guid: Option<Uuid>,
	/// MBR boot indicator.
	pub boot: bool,
	/// Whether the partition carries the UEFI:NTFS helper image.
	pub uefi_ntfs: bool,
	/// Mount-point GUID volume bound to this partition, when the OS exposes
	/// one.
	pub volume_name: Option<String>,
	pub fs: FsKind,
}

impl PartitionRecord {
	pub fn is_esp(&self) -> bool {
		match self.tag {
			PartTypeTag::Mbr(t) => t == 0xEF,
			PartTypeTag::Gpt(guid) => guid == PARTTYPE_ESP_UUID,
		}
	}

	pub fn is_msr(&self) -> bool {
		matches!(self.tag, PartTypeTag::Gpt(guid) if guid == PARTTYPE_MSR_UUID)
	}

	pub fn is_basic_data(&self) -> bool {
		matches!(self.tag, PartTypeTag::Gpt(guid) if guid == PARTTYPE_BASIC_UUID)
	}

	/// BIOS-compatibility stub written by this tool.
	pub fn is_extra(&self) -> bool {
		matches!(self.tag, PartTypeTag::Mbr(t) if t == EXTRA_PARTITION_TYPE)
	}

	pub fn is_mountable(&self) -> bool {
		match self.tag {
			PartTypeTag::Mbr(t) => MBR_MOUNTABLE.contains(&t),
			PartTypeTag::Gpt(guid) => guid == PARTTYPE_BASIC_UUID,
		}
	}
}

/// Everything known about one physical device after enumeration.
///
/// Immutable once built; a rescan produces a fresh value.
#[derive(Clone, Debug)]
pub struct DriveInfo {
	/// Device index, a small nonzero integer.
	pub index: u32,
	/// User-facing physical path, `PHYSICAL/<index>`.
	pub physical_path: String,
	/// Drive letters currently assigned to volumes of this disk.
	pub letters: Vec<char>,
	pub size: u64,
	pub sector_size: u32,
	pub sectors_per_track: u32,
	pub media: MediaKind,
	pub style: PartitionStyle,
	/// File system written directly at offset 0, no partition table.
	pub super_floppy: bool,
	/// MBR disk signature matches the fixed MBR+UEFI marker.
	pub has_uefi_marker: bool,
	pub has_protective_mbr: bool,
	pub disk_signature: u32,
	pub disk_guid: Option<Uuid>,
	/// User-visible partition count; helper and compatibility partitions
	/// this tool creates are not counted.
	pub num_partitions: usize,
	pub partitions: Vec<PartitionRecord>,
	pub first_data_sector: u64,
	pub identity: DiskIdentity,
	/// Composite HDD likelihood; positive means HDD-like.
	pub score: i32,
}

impl DriveInfo {
	pub fn looks_like_hdd(&self) -> bool {
		self.score > 0
	}

	pub fn bytes_per_track(&self) -> u64 {
		self.sectors_per_track as u64 * self.sector_size as u64
	}

	pub fn partition_at(&self, offset: u64) -> Option<&PartitionRecord> {
		self.partitions.iter().find(|p| p.offset == offset)
	}

	/// Whether the drive carries at least one partition the OS would give a
	/// mount point to.
	pub fn has_mountable_partition(&self) -> bool {
		self.partitions.iter().any(|p| p.is_mountable())
	}
}

pub struct Registry {
	host: Arc<dyn DiskHost>,
}

impl Registry {
	pub fn new(host: Arc<dyn DiskHost>) -> Self {
		Registry { host }
	}

	pub fn host(&self) -> &Arc<dyn DiskHost> {
		&self.host
	}

	/// Enumerate every usable device. Open timeouts and sharing violations
	/// are logged and the offending drive is omitted, never fatal.
	pub fn enumerate(&self) -> Vec<DriveInfo> {
		let (letters, letter_kinds) = self.walk_letters();
		let volumes = self.usable_guid_volumes();
		let mut drives = Vec::new();
		for index in self.host.disk_indices() {
			if index >= MAX_DRIVES {
				warn!("Skipping device {} (device number beyond limit)", index);
				continue;
			}
			let drive_letters = letters.get(&index).cloned().unwrap_or_default();
			let kind = letter_kinds.get(&index).copied();
			match self.read_drive(index, drive_letters, kind, &volumes) {
				Ok(drive) => drives.push(drive),
				Err(e) => {
					error!("Skipping device {}: {:#}", index, e);
				}
			}
		}
		drives
	}

	/// Re-read one device. `NoDevice` when the index has vanished.
	pub fn query(&self, index: u32) -> Result<DriveInfo> {
		let (letters, letter_kinds) = self.walk_letters();
		let volumes = self.usable_guid_volumes();
		if !self.host.disk_indices().contains(&index) {
			return Err(OpError::NoDevice.into());
		}
		self.read_drive(
			index,
			letters.get(&index).cloned().unwrap_or_default(),
			letter_kinds.get(&index).copied(),
			&volumes,
		)
	}

	pub fn drive_letters(&self, index: u32) -> Vec<char> {
		let (letters, _) = self.walk_letters();
		letters.get(&index).cloned().unwrap_or_default()
	}

	/// First pass: the 26 drive letters, each behind a bounded-timeout open.
	fn walk_letters(&self) -> (BTreeMap<u32, Vec<char>>, BTreeMap<u32, MediaKind>) {
		let mut letters: BTreeMap<u32, Vec<char>> = BTreeMap::new();
		let mut kinds: BTreeMap<u32, MediaKind> = BTreeMap::new();
		for letter in 'A'..='Z' {
			let volume = match self.host.letter_volume(letter, VOLUME_OPEN_TIMEOUT) {
				Ok(v) => v,
				Err(e) => {
					debug!("Skipping drive {}: {:#}", letter, e);
					continue;
				}
			};
			let Some(volume) = volume else { continue };
			debug!(
				"{}: is '{}' ({})",
				letter, volume.volume_name, volume.device_name
			);
			if !matches!(volume.kind, MediaKind::Removable | MediaKind::Fixed) {
				continue;
			}
			let Some(extent) = single_extent(&volume) else {
				continue;
			};
			if extent.disk_number >= MAX_DRIVES {
				warn!(
					"Skipping drive {}: (device number {} beyond limit)",
					letter, extent.disk_number
				);
				continue;
			}
			letters.entry(extent.disk_number).or_default().push(letter);
			kinds.entry(extent.disk_number).or_insert(volume.kind);
		}
		(letters, kinds)
	}

	/// Second pass: every mount-point GUID volume with exactly one extent.
	fn usable_guid_volumes(&self) -> Vec<VolumeInfo> {
		let volumes = match self.host.guid_volumes() {
			Ok(v) => v,
			Err(e) => {
				warn!("Could not enumerate GUID volumes: {:#}", e);
				return Vec::new();
			}
		};
		volumes
			.into_iter()
			.filter(|v| single_extent(v).is_some())
			.collect()
	}

	fn read_drive(
		&self,
		index: u32,
		letters: Vec<char>,
		letter_kind: Option<MediaKind>,
		volumes: &[VolumeInfo],
	) -> Result<DriveInfo> {
		let mut disk = self
			.host
			.open_disk(index, false)
			.context("Unable to open physical device")?;
		let geometry = disk.geometry();
		let mut sector_size = geometry.sector_size;
		if sector_size < 512 {
			warn!(
				"Device {} reports a sector size of {} - correcting to 512 bytes",
				index, sector_size
			);
			sector_size = 512;
		}
		// The letter walk knows removable vs fixed even when the geometry
		// reports nothing useful; devices with no mounted volume keep the
		// geometry's media type.
		let media = match geometry.media {
			MediaKind::Unknown => letter_kind.unwrap_or(MediaKind::Unknown),
			known => known,
		};
		let identity = self.host.disk_identity(index)?;
		info!(
			"Device {}: {}, {} ({} bytes per sector)",
			index,
			media,
			size_to_human_readable(geometry.disk_size),
			sector_size
		);

		let mut drive = DriveInfo {
			index,
			physical_path: format!("PHYSICAL/{}", index),
			letters,
			size: geometry.disk_size,
			sector_size,
			sectors_per_track: geometry.sectors_per_track,
			media,
			style: PartitionStyle::Raw,
			super_floppy: false,
			has_uefi_marker: false,
			has_protective_mbr: false,
			disk_signature: 0,
			disk_guid: None,
			num_partitions: 0,
			partitions: Vec::new(),
			first_data_sector: u64::MAX,
			identity,
			score: 0,
		};
		drive.score = score::usb_hdd_score(&drive.identity, drive.size, drive.media);

		self.read_layout(disk.as_mut(), &mut drive)?;

		// Bind each mounted GUID volume to the partition it covers.
		for record in drive.partitions.iter_mut() {
			record.volume_name = volumes
				.iter()
				.find(|v| {
					single_extent(v).is_some_and(|e| {
						e.disk_number == index && e.starting_offset == record.offset
					})
				})
				.map(|v| v.volume_name.clone());
		}
		drive.first_data_sector = drive
			.partitions
			.iter()
			.map(|r| r.offset / sector_size as u64)
			.min()
			.unwrap_or(u64::MAX);
		Ok(drive)
	}

	fn read_layout(&self, disk: &mut dyn DiskIo, drive: &mut DriveInfo) -> Result<()> {
		// A file system living directly at offset 0 means no partition table
		// at all ("super floppy"). This must be checked before the MBR parse:
		// a FAT boot sector carries the 55 AA marker too and would otherwise
		// be misread as a tiny FAT16 partition table.
		let fs_at_zero = fsprobe::detect_fs(disk, 0)?;
		if fs_at_zero.is_recognized() {
			info!("Partition type: SFD (super floppy drive) or unpartitioned");
			drive.style = PartitionStyle::Mbr;
			drive.super_floppy = true;
			drive.num_partitions = 1;
			drive.partitions.push(PartitionRecord {
				offset: 0,
				size: drive.size,
				tag: PartTypeTag::Mbr(0),
				name: String::new(),
				attributes: 0,
				unique_guid: None,
				boot: false,
				uefi_ntfs: false,
				volume_name: None,
				fs: fs_at_zero,
			});
			return Ok(());
		}

		let mbr = {
			let mut io = &mut *disk;
			match MBR::read_from(&mut io, drive.sector_size) {
				Ok(mbr) => mbr,
				Err(_) => {
					info!("Partition type: RAW");
					return Ok(());
				}
			}
		};

		let protective = mbr.iter().any(|(_, e)| e.is_used() && e.sys == 0xEE);
		if protective {
			let gpt = {
				let mut io = &mut *disk;
				GPT::find_from(&mut io)
			};
			match gpt {
				Ok(gpt) => return self.read_gpt_layout(disk, drive, &gpt),
				Err(e) => {
					warn!("Protective MBR without a readable GPT: {:#}", e);
					drive.has_protective_mbr = true;
				}
			}
		}
		self.read_mbr_layout(disk, drive, &mbr)
	}

	fn read_mbr_layout(
		&self,
		disk: &mut dyn DiskIo,
		drive: &mut DriveInfo,
		mbr: &MBR,
	) -> Result<()> {
		drive.style = PartitionStyle::Mbr;
		drive.disk_signature = u32::from_le_bytes(mbr.header.disk_signature);
		drive.has_uefi_marker = drive.disk_signature == MBR_UEFI_MARKER;
		info!(
			"Partition type: MBR, Disk ID: {:#010x} {}",
			drive.disk_signature,
			if drive.has_uefi_marker { "(UEFI target)" } else { "" }
		);
		for (_, entry) in mbr.iter() {
			if !entry.is_used() {
				continue;
			}
			let offset = entry.starting_lba as u64 * drive.sector_size as u64;
			let size = entry.sectors as u64 * drive.sector_size as u64;
			if entry.sys == 0xEE {
				drive.has_protective_mbr = true;
			}
			let uefi_ntfs = entry.sys == 0xEF && read_uefi_ntfs_label(disk, offset);
			let fs = fsprobe::detect_fs(disk, offset)?;
			debug!(
				"Partition at {:#x}: type {:#04x}, detected file system: {}",
				offset, entry.sys, fs
			);
			drive.num_partitions += 1;
			// Partitions this tool creates don't count against the user.
			if uefi_ntfs || entry.sys == EXTRA_PARTITION_TYPE {
				drive.num_partitions -= 1;
			}
			drive.partitions.push(PartitionRecord {
				offset,
				size,
				tag: PartTypeTag::Mbr(entry.sys),
				name: String::new(),
				attributes: 0,
				unique_guid: None,
				boot: entry.boot == mbrman::BOOT_ACTIVE,
				uefi_ntfs,
				volume_name: None,
				fs,
			});
		}
		drive.partitions.sort_by_key(|p| p.offset);
		Ok(())
	}

	fn read_gpt_layout(
		&self,
		disk: &mut dyn DiskIo,
		drive: &mut DriveInfo,
		gpt: &GPT,
	) -> Result<()> {
		drive.style = PartitionStyle::Gpt;
		let disk_guid = Uuid::from_bytes_le(gpt.header.disk_guid);
		drive.disk_guid = Some(disk_guid);
		info!("Partition type: GPT, Disk GUID: {}", disk_guid);
		let used = gpt.iter().filter(|(_, e)| e.is_used()).count();
		if used > MAX_PARTITIONS {
			bail!(
				"Disk has {} partitions (more than the {} supported)",
				used,
				MAX_PARTITIONS
			);
		}
		for (_, entry) in gpt.iter() {
			if !entry.is_used() {
				continue;
			}
			let offset = entry.starting_lba * drive.sector_size as u64;
			let size = (entry.ending_lba - entry.starting_lba + 1) * drive.sector_size as u64;
			let type_guid = Uuid::from_bytes_le(entry.partition_type_guid);
			let name = entry.partition_name.as_str().to_string();
			let uefi_ntfs = name == "UEFI:NTFS";
			let fs = fsprobe::detect_fs(disk, offset)?;
			debug!(
				"Partition '{}' at {:#x}: type {}, detected file system: {}",
				name, offset, type_guid, fs
			);
			drive.num_partitions += 1;
			// Don't count the partitions we don't care about destroying.
			if uefi_ntfs || type_guid == PARTTYPE_MSR_UUID || type_guid == PARTTYPE_ESP_UUID {
				drive.num_partitions -= 1;
			}
			drive.partitions.push(PartitionRecord {
				offset,
				size,
				tag: PartTypeTag::Gpt(type_guid),
				name,
				attributes: entry.attribute_bits,
				unique_guid: Some(Uuid::from_bytes_le(entry.unique_partition_guid)),
				boot: false,
				uefi_ntfs,
				volume_name: None,
				fs,
			});
		}
		drive.partitions.sort_by_key(|p| p.offset);
		Ok(())
	}

	/// GUID volume name for a partition of the drive, e.g.
	/// `\\?\Volume{...}`. Falls back to the synthesized GLOBALROOT path for
	/// partitions the OS refuses to enumerate (such as ESPs).
	pub fn logical_name(
		&self,
		drive: &DriveInfo,
		partition_offset: u64,
		keep_trailing_backslash: bool,
	) -> Option<String> {
		let volumes = self.usable_guid_volumes();
		let found = volumes.iter().find(|v| {
			single_extent(v).is_some_and(|e| {
				e.disk_number == drive.index
					&& (partition_offset == 0 || e.starting_offset == partition_offset)
			})
		});
		let name = match found {
			Some(volume) => volume.volume_name.clone(),
			None => {
				let alt = self
					.alt_logical_name(drive, partition_offset, keep_trailing_backslash)
					.ok()?;
				return Some(alt);
			}
		};
		Some(if keep_trailing_backslash {
			format!("{}\\", name)
		} else {
			name
		})
	}

	/// Synthesize the `\\?\GLOBALROOT\Device\HarddiskVolume<N>` name for a
	/// partition, from the OS's `Harddisk<D>Partition<P>` device mapping.
	pub fn alt_logical_name(
		&self,
		drive: &DriveInfo,
		partition_offset: u64,
		keep_trailing_backslash: bool,
	) -> Result<String> {
		let partition_number = if partition_offset == 0 {
			1
		} else {
			drive
				.partitions
				.iter()
				.position(|p| p.offset == partition_offset)
				.map(|i| i + 1)
				.with_context(|| {
					format!(
						"Could not find a partition at offset {} on this disk",
						partition_offset
					)
				})?
		};
		let dos_name = format!("Harddisk{}Partition{}", drive.index, partition_number);
		let device = self
			.host
			.query_dos_device(&dos_name)
			.with_context(|| format!("Could not find a DOS volume name for '{}'", dos_name))?;
		let mut name = format!("{}{}", GROOT_NAME, device);
		if keep_trailing_backslash {
			name.push('\\');
		}
		Ok(name)
	}

	/// Wait for the logical volume covering `partition_offset` to reappear
	/// after a layout change.
	pub fn wait_for_logical(
		&self,
		index: u32,
		partition_offset: u64,
		cancel: &CancelToken,
	) -> Result<String> {
		for _ in 0..DRIVE_ACCESS_RETRIES {
			if cancel.is_cancelled() {
				return Err(OpError::Cancelled.into());
			}
			if let Ok(drive) = self.query(index) {
				if let Some(name) = self.logical_name(&drive, partition_offset, false) {
					return Ok(name);
				}
			}
			thread::sleep(DRIVE_ACCESS_TIMEOUT / DRIVE_ACCESS_RETRIES);
		}
		Err(OpError::RemountFailed.into())
	}

	/// Whether the drive looks like a Microsoft Dev Drive: GPT with exactly
	/// an MSR and a ReFS-formatted Basic Data partition of at least 20 GB.
	pub fn is_dev_drive(&self, drive: &DriveInfo) -> Result<bool> {
		if drive.style != PartitionStyle::Gpt || drive.partitions.len() != 2 {
			return Ok(false);
		}
		if !drive.partitions[0].is_msr() || !drive.partitions[1].is_basic_data() {
			return Ok(false);
		}
		if drive.partitions[1].size < 20 * GB {
			return Ok(false);
		}
		let mut disk = self.host.open_disk(drive.index, false)?;
		Ok(fsprobe::detect_fs(disk.as_mut(), drive.partitions[1].offset)? == FsKind::ReFs)
	}
}

fn single_extent(volume: &VolumeInfo) -> Option<&crate::sys::DiskExtent> {
	match volume.extents.as_slice() {
		[extent] => Some(extent),
		[] => {
			debug!("Ignoring volume '{}' (no extents)", volume.volume_name);
			None
		}
		_ => {
			// More than one extent means RAID or spanned volumes. Stay well
			// away from those.
			debug!(
				"Ignoring volume '{}' (more than one extent)",
				volume.volume_name
			);
			None
		}
	}
}

fn read_uefi_ntfs_label(disk: &mut dyn DiskIo, offset: u64) -> bool {
	let mut label = [0u8; 9];
	if disk.seek(SeekFrom::Start(offset + 0x2B)).is_err() {
		return false;
	}
	if disk.read_exact(&mut label).is_err() {
		return false;
	}
	&label == b"UEFI_NTFS"
}
