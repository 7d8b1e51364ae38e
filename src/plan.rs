//! Partition planning and layout writing.
//!
//! `plan()` turns a drive plus a request into a [`LayoutPlan`] without any
//! I/O; `write_layout()` zeroes superseded file-system signatures, writes
//! the helper image and the partition table, then walks the refresh
//! sequence (kernel re-read, wait for the logical volume, one rescan
//! retry).

use std::{
	io::{Seek, SeekFrom, Write},
	thread,
};

use anyhow::{bail, Context, Result};
use bitflags::bitflags;
use gptman::{GPTPartitionEntry, GPT};
use log::{info, warn};
use mbrman::{MBRPartitionEntry, CHS, MBR};
use uuid::{uuid, Uuid};

use crate::{
	device::{DriveInfo, Registry, EXTRA_PARTITION_TYPE},
	error::OpError,
	sys::{DiskHost, DiskIo, MediaKind},
	utils::{
		align_down, align_up, size_to_human_readable, CancelToken, MAX_PARTITIONS,
		MAX_SECTORS_TO_CLEAR, MB,
	},
};

pub const PARTTYPE_ESP_UUID: Uuid = uuid!("C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
pub const PARTTYPE_MSR_UUID: Uuid = uuid!("E3C9E316-0B5C-4DB8-817D-F92DF00215AE");
pub const PARTTYPE_BASIC_UUID: Uuid = uuid!("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7");
pub const PARTTYPE_LINUX_UUID: Uuid = uuid!("0FC63DAF-8483-4772-8E79-3D69D8477DE4");

/// Fixed disk signature written for MBR+UEFI targets, so the tool can
/// recognize its own output later instead of a random value.
pub const MBR_UEFI_MARKER: u32 = 0x17283545;

pub const GPT_ATTR_READ_ONLY: u64 = 1 << 60;
pub const GPT_ATTR_NO_DRIVE_LETTER: u64 = 1 << 63;

/// 260 MB keeps everyone happy, including 4K-sector drives and macOS.
const ESP_SIZE: u64 = 260 * MB;
const MSR_SIZE: u64 = 128 * MB;

bitflags! {
	/// Extra partitions to create around the main one.
	#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
	pub struct Extras: u8 {
		const ESP = 1 << 0;
		const MSR = 1 << 1;
		const PERSISTENCE = 1 << 2;
		const UEFI_NTFS = 1 << 3;
		const BIOS_COMPAT = 1 << 4;
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, clap::ValueEnum)]
pub enum PlanStyle {
	#[strum(serialize = "MBR")]
	Mbr,
	#[strum(serialize = "GPT")]
	Gpt,
	/// File system at offset 0, no partition table. Nothing to plan.
	#[strum(serialize = "SFD")]
	SuperFloppy,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, clap::ValueEnum)]
pub enum TargetFs {
	Fat16,
	Fat32,
	Ntfs,
	ExFat,
	Udf,
	ReFs,
	Ext2,
	Ext3,
	Ext4,
}

impl TargetFs {
	/// MBR partition type for a main partition holding this file system.
	pub fn mbr_type(&self) -> u8 {
		match self {
			TargetFs::Fat16 => 0x0e,
			TargetFs::Fat32 => 0x0c,
			TargetFs::Ntfs | TargetFs::ExFat | TargetFs::Udf | TargetFs::ReFs => 0x07,
			TargetFs::Ext2 | TargetFs::Ext3 | TargetFs::Ext4 => 0x83,
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartRole {
	Main,
	Esp,
	Msr,
	Persistence,
	UefiNtfs,
	BiosCompat,
}

impl PartRole {
	fn display_name(&self) -> &'static str {
		match self {
			PartRole::Main => "Main Data Partition",
			PartRole::Esp => "EFI System Partition",
			PartRole::Msr => "Microsoft Reserved Partition",
			PartRole::Persistence => "Linux Persistence",
			PartRole::UefiNtfs => "UEFI:NTFS",
			PartRole::BiosCompat => "BIOS Compatibility",
		}
	}
}

#[derive(Clone, Debug)]
pub struct PlanRequest {
	pub style: PlanStyle,
	pub fs: TargetFs,
	/// Set the MBR boot indicator on the main partition.
	pub bootable: bool,
	pub extras: Extras,
	/// Requested persistence partition size in bytes; required when the
	/// `PERSISTENCE` extra is set.
	pub persistence_size: u64,
	/// Align the first partition for ancient BIOSes instead of the 1 MB
	/// offset.
	pub old_bios_fixes: bool,
	/// Target cluster size in bytes; 0 selects the default.
	pub cluster_size: u64,
	/// Write the fixed self-identification signature instead of a random
	/// one (MBR prepared for UEFI boot).
	pub mbr_uefi_marker: bool,
	/// Size of the UEFI:NTFS helper image; required when the `UEFI_NTFS`
	/// extra is set.
	pub helper_image_size: u64,
	/// Whether the host can mount several partitions of a removable drive,
	/// which allows placing the ESP before the main partition.
	pub multipart_ok: bool,
	/// Pin the MBR disk signature (tests, reproducible output).
	pub disk_signature: Option<u32>,
	/// Pin the GPT disk GUID.
	pub disk_guid: Option<Uuid>,
}

impl PlanRequest {
	pub fn new(style: PlanStyle, fs: TargetFs) -> Self {
		PlanRequest {
			style,
			fs,
			bootable: true,
			extras: Extras::empty(),
			persistence_size: 0,
			old_bios_fixes: false,
			cluster_size: 0,
			mbr_uefi_marker: false,
			helper_image_size: 0,
			multipart_ok: true,
			disk_signature: None,
			disk_guid: None,
		}
	}
}

#[derive(Clone, Debug)]
pub struct PlannedPartition {
	pub role: PartRole,
	pub name: String,
	/// Starting byte offset.
	pub offset: u64,
	/// Size in bytes.
	pub size: u64,
}

/// Transient output of the planner, consumed by [`write_layout`].
#[derive(Clone, Debug)]
pub struct LayoutPlan {
	pub style: PlanStyle,
	pub fs: TargetFs,
	pub bootable: bool,
	pub sector_size: u32,
	pub disk_size: u64,
	pub disk_signature: u32,
	pub disk_guid: Uuid,
	/// Partitions in offset order.
	pub partitions: Vec<PlannedPartition>,
	pub main: Option<usize>,
	pub esp: Option<usize>,
	pub msr: Option<usize>,
	pub persistence: Option<usize>,
	pub uefi_ntfs: Option<usize>,
	pub compat: Option<usize>,
}

impl LayoutPlan {
	fn slot(&mut self, role: PartRole) -> &mut Option<usize> {
		match role {
			PartRole::Main => &mut self.main,
			PartRole::Esp => &mut self.esp,
			PartRole::Msr => &mut self.msr,
			PartRole::Persistence => &mut self.persistence,
			PartRole::UefiNtfs => &mut self.uefi_ntfs,
			PartRole::BiosCompat => &mut self.compat,
		}
	}

	fn push(&mut self, role: PartRole, offset: u64, size: u64) {
		self.partitions.push(PlannedPartition {
			role,
			name: role.display_name().to_string(),
			offset,
			size,
		});
		*self.slot(role) = Some(self.partitions.len() - 1);
	}
}

/// Compute the partition layout for a drive. Pure: no I/O, and
/// deterministic whenever the request pins the signature and GUID.
pub fn plan(drive: &DriveInfo, req: &PlanRequest) -> Result<LayoutPlan> {
	let sector = drive.sector_size as u64;
	let track = drive.bytes_per_track();
	let cluster = match req.cluster_size {
		0 => sector.max(512),
		c if c % sector != 0 => {
			bail!(
				"Cluster size {} is not a multiple of the {}-byte sector size",
				c,
				sector
			);
		}
		c => c,
	};

	let mut out = LayoutPlan {
		style: req.style,
		fs: req.fs,
		bootable: req.bootable,
		sector_size: drive.sector_size,
		disk_size: drive.size,
		disk_signature: if req.mbr_uefi_marker {
			MBR_UEFI_MARKER
		} else {
			req.disk_signature.unwrap_or_else(rand::random)
		},
		disk_guid: req.disk_guid.unwrap_or_else(Uuid::new_v4),
		partitions: Vec::new(),
		main: None,
		esp: None,
		msr: None,
		persistence: None,
		uefi_ntfs: None,
		compat: None,
	};

	if req.style == PlanStyle::SuperFloppy {
		// Nothing to do.
		return Ok(out);
	}

	let mut extras = req.extras;
	if extras.contains(Extras::MSR) && req.style != PlanStyle::Gpt {
		bail!("A Microsoft Reserved partition requires GPT");
	}
	if extras.contains(Extras::ESP | Extras::UEFI_NTFS) {
		bail!("ESP and UEFI:NTFS cannot both own the extra partition slot");
	}
	if extras.contains(Extras::PERSISTENCE) && req.persistence_size == 0 {
		bail!("A persistence partition needs a nonzero size");
	}
	if extras.contains(Extras::UEFI_NTFS) && req.helper_image_size == 0 {
		bail!("Could not determine the size of the UEFI:NTFS helper image");
	}

	// First-partition offset: the 1 MB wastage everyone expects, unless old
	// BIOS fixes are requested on MBR. In that case align to a cylinder
	// that is itself cluster-aligned, and double it because Grub2 no longer
	// fits in the traditional 31.5 KB gap.
	let mut offset = if req.style == PlanStyle::Gpt || !req.old_bios_fixes {
		MB
	} else {
		align_up(track, cluster) * 2
	};

	// Having the ESP up front is the recommended arrangement, but is only
	// achievable when more than one partition can be mounted at once, i.e.
	// a fixed drive or a capable host.
	if extras.contains(Extras::ESP)
		&& req.style == PlanStyle::Gpt
		&& (drive.media == MediaKind::Fixed || req.multipart_ok)
	{
		out.push(PartRole::Esp, offset, ESP_SIZE);
		offset = align_down(align_up(offset + ESP_SIZE, track), cluster).max(offset + ESP_SIZE);
		extras.remove(Extras::ESP);
	}

	// The MSR always goes before the main partition.
	if extras.contains(Extras::MSR) {
		out.push(PartRole::Msr, offset, MSR_SIZE);
		offset = align_down(align_up(offset + MSR_SIZE, track), cluster).max(offset + MSR_SIZE);
		extras.remove(Extras::MSR);
	}

	let main_offset = offset;
	out.push(PartRole::Main, main_offset, 0);

	// Trailing extras, all track-aligned.
	let mut tail: Vec<(PartRole, u64)> = Vec::new();
	if extras.contains(Extras::PERSISTENCE) {
		tail.push((PartRole::Persistence, align_up(req.persistence_size, track)));
	}
	if extras.contains(Extras::ESP) {
		tail.push((PartRole::Esp, align_up(ESP_SIZE, track)));
	} else if extras.contains(Extras::UEFI_NTFS) {
		tail.push((PartRole::UefiNtfs, align_up(req.helper_image_size, track)));
	} else if extras.contains(Extras::BIOS_COMPAT) {
		// One track is all the compatibility stub needs.
		tail.push((PartRole::BiosCompat, track));
	}

	let mut last_offset = drive.size;
	if req.style == PlanStyle::Gpt {
		last_offset -= 33 * sector;
	}
	// Place the trailing extras back to front, then give the main partition
	// whatever remains.
	let mut placed = Vec::new();
	for (role, size) in tail.iter().rev() {
		if *size >= last_offset {
			return Err(OpError::LayoutRefuses(format!(
				"No room left for the {} partition",
				role.display_name()
			))
			.into());
		}
		last_offset = align_down(last_offset - size, track);
		placed.push((*role, last_offset, *size));
	}
	for (role, offset, size) in placed.into_iter().rev() {
		out.push(role, offset, size);
	}

	let mut main_size = align_down(last_offset.saturating_sub(main_offset), track);
	// Align the main partition to the cluster size too, so capture tools
	// that parse the allocation map instead of scanning raw sectors keep
	// working.
	main_size = align_down(main_size, cluster);
	if main_size == 0 {
		return Err(OpError::LayoutRefuses(
			"Disk is too small for the requested layout".to_string(),
		)
		.into());
	}
	let main = out.main.expect("main slot was just pushed");
	out.partitions[main].size = main_size;

	out.partitions.sort_by_key(|p| p.offset);
	reindex(&mut out);

	if out.partitions.len() > MAX_PARTITIONS {
		return Err(OpError::Internal("Planned too many partitions".to_string()).into());
	}
	if req.style == PlanStyle::Mbr && out.partitions.len() > 4 {
		return Err(OpError::LayoutRefuses(
			"MBR cannot hold more than 4 partitions".to_string(),
		)
		.into());
	}
	Ok(out)
}

fn reindex(plan: &mut LayoutPlan) {
	plan.main = None;
	plan.esp = None;
	plan.msr = None;
	plan.persistence = None;
	plan.uefi_ntfs = None;
	plan.compat = None;
	for i in 0..plan.partitions.len() {
		let role = plan.partitions[i].role;
		*plan.slot(role) = Some(i);
	}
}

/// Zero the first sectors of a planned partition. Needed because the OS
/// will otherwise keep reading cached file-system data at the old location
/// even after the table changed.
fn clear_partition(disk: &mut dyn DiskIo, offset: u64, size: u64) -> Result<()> {
	const ZEROES: [u8; 16384] = [0; 16384];
	disk.seek(SeekFrom::Start(offset))?;
	let mut remaining = size;
	while remaining > 0 {
		let n = remaining.min(ZEROES.len() as u64) as usize;
		disk.write_all(&ZEROES[..n])?;
		remaining -= n as u64;
	}
	Ok(())
}

/// Write a layout plan onto the disk and walk the refresh sequence.
///
/// `helper_image` must hold the UEFI:NTFS image when the plan contains the
/// helper partition. `wait_for_volume` is skipped on hosts without a
/// mounted-volume surface (plain image files).
pub fn write_layout(
	registry: &Registry,
	index: u32,
	layout: &LayoutPlan,
	helper_image: Option<&[u8]>,
	wait_for_volume: bool,
	cancel: &CancelToken,
) -> Result<()> {
	info!("Partitioning ({})...", layout.style);
	log::debug!(
		"Layout slots: main={:?} esp={:?} msr={:?} persistence={:?} uefi_ntfs={:?} compat={:?}",
		layout.main,
		layout.esp,
		layout.msr,
		layout.persistence,
		layout.uefi_ntfs,
		layout.compat
	);
	if layout.style == PlanStyle::SuperFloppy {
		return Ok(());
	}
	let host = registry.host().clone();
	let mut disk = host
		.open_disk(index, true)
		.context("Unable to open physical device for writing")?;
	let sector = layout.sector_size as u64;
	let clear_size = MAX_SECTORS_TO_CLEAR * sector;

	for part in &layout.partitions {
		if cancel.is_cancelled() {
			return Err(OpError::Cancelled.into());
		}
		info!(
			"* Creating {} (offset: {}, size: {})",
			part.name,
			part.offset,
			size_to_human_readable(part.size)
		);
		if let Err(e) = clear_partition(disk.as_mut(), part.offset, clear_size.min(part.size)) {
			warn!("Could not zero {}: {:#}", part.name, e);
		}
	}

	// The helper partition contents must be in place before the refresh.
	if let Some(i) = layout.uefi_ntfs {
		let image = helper_image.context("UEFI:NTFS helper image is required by this layout")?;
		let part = &layout.partitions[i];
		if image.len() as u64 > part.size {
			bail!("UEFI:NTFS image does not fit its partition");
		}
		info!("Writing UEFI:NTFS data...");
		disk.seek(SeekFrom::Start(part.offset))?;
		disk.write_all(image)
			.map_err(|e| OpError::BadMedia(e.to_string()))?;
	}

	match layout.style {
		PlanStyle::Mbr => write_mbr_table(disk.as_mut(), layout)?,
		PlanStyle::Gpt => write_gpt_table(disk.as_mut(), layout)?,
		PlanStyle::SuperFloppy => unreachable!(),
	}
	disk.sync()?;
	drop(disk);

	host.reread_partitions(index)
		.context("Could not refresh drive layout")?;

	if wait_for_volume {
		let main_offset = layout
			.main
			.map(|i| layout.partitions[i].offset)
			.unwrap_or(0);
		if let Err(e) = registry.wait_for_logical(index, main_offset, cancel) {
			if e.downcast_ref::<OpError>()
				.is_some_and(|k| matches!(k, OpError::Cancelled))
			{
				return Err(e);
			}
			// One more chance with rescan semantics: refresh again, then
			// re-enumerate.
			warn!("Logical volume did not reappear, rescanning: {:#}", e);
			thread::sleep(std::time::Duration::from_millis(500));
			host.reread_partitions(index)?;
			registry
				.wait_for_logical(index, main_offset, cancel)
				.context("Volume did not come back after the layout change")?;
		}
	}
	Ok(())
}

fn write_mbr_table(disk: &mut dyn DiskIo, layout: &LayoutPlan) -> Result<()> {
	let sector = layout.sector_size as u64;
	let mut io = &mut *disk;
	let mut mbr = MBR::new_from(
		&mut io,
		layout.sector_size,
		layout.disk_signature.to_le_bytes(),
	)
	.context("Unable to create a new MBR table")?;
	info!("Disk ID: {:#010x}", layout.disk_signature);
	for (i, part) in layout.partitions.iter().enumerate() {
		let sys = match part.role {
			PartRole::Main => layout.fs.mbr_type(),
			PartRole::Esp | PartRole::UefiNtfs => 0xEF,
			PartRole::Persistence => 0x83,
			PartRole::BiosCompat => EXTRA_PARTITION_TYPE,
			PartRole::Msr => bail!("MSR is not representable on MBR"),
		};
		let boot = if part.role == PartRole::Main && layout.bootable {
			mbrman::BOOT_ACTIVE
		} else {
			mbrman::BOOT_INACTIVE
		};
		let starting_lba = u32::try_from(part.offset / sector)
			.context("Partition offset exceeds the limit of MBR")?;
		let sectors = u32::try_from(part.size / sector)
			.context("Partition size exceeds the limit of MBR")?;
		mbr[i + 1] = MBRPartitionEntry {
			boot,
			first_chs: CHS::empty(),
			sys,
			last_chs: CHS::empty(),
			starting_lba,
			sectors,
		};
	}
	mbr.write_into(&mut io)
		.context("Unable to write the MBR table")?;
	Ok(())
}

fn write_gpt_table(disk: &mut dyn DiskIo, layout: &LayoutPlan) -> Result<()> {
	let sector = layout.sector_size as u64;
	// GUIDs in GPT are mixed-endian; to_bytes_le() produces the on-disk
	// byte order.
	let mut io = &mut *disk;
	let mut gpt = GPT::new_from(&mut io, sector, layout.disk_guid.to_bytes_le())
		.context("Unable to create a new GPT table")?;
	info!("Disk GUID: {}", layout.disk_guid);
	for (i, part) in layout.partitions.iter().enumerate() {
		let mut attributes = 0u64;
		let type_guid = match part.role {
			PartRole::Main => PARTTYPE_BASIC_UUID,
			PartRole::Esp => PARTTYPE_ESP_UUID,
			PartRole::Msr => PARTTYPE_MSR_UUID,
			PartRole::Persistence => PARTTYPE_LINUX_UUID,
			PartRole::UefiNtfs => {
				// No drive letter for the helper, and read-only outside of
				// debug builds.
				attributes |= GPT_ATTR_NO_DRIVE_LETTER;
				#[cfg(not(debug_assertions))]
				{
					attributes |= GPT_ATTR_READ_ONLY;
				}
				PARTTYPE_ESP_UUID
			}
			PartRole::BiosCompat => bail!("The BIOS compatibility stub is MBR-only"),
		};
		gpt[(i + 1) as u32] = GPTPartitionEntry {
			partition_type_guid: type_guid.to_bytes_le(),
			unique_partition_guid: Uuid::new_v4().to_bytes_le(),
			starting_lba: part.offset / sector,
			ending_lba: (part.offset + part.size) / sector - 1,
			attribute_bits: attributes,
			partition_name: part.name.as_str().into(),
		};
	}
	// Most partitioning tools refuse a GPT without its protective MBR.
	GPT::write_protective_mbr_into(&mut io, sector)
		.context("Unable to write the protective MBR")?;
	gpt.write_into(&mut io)
		.context("Unable to write the GPT table")?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::{PartitionStyle, PartTypeTag};
	use crate::sys::sim::SimHost;
	use crate::sys::{DiskHost, DiskIdentity};
	use crate::utils::GB;
	use std::sync::Arc;

	const TRACK_63: u64 = 63 * 512;

	fn drive(size: u64, sector: u32, spt: u32, media: MediaKind) -> DriveInfo {
		DriveInfo {
			index: 1,
			physical_path: "PHYSICAL/1".to_string(),
			letters: Vec::new(),
			size,
			sector_size: sector,
			sectors_per_track: spt,
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
			identity: DiskIdentity::default(),
			score: 0,
		}
	}

	fn assert_geometry_invariants(layout: &LayoutPlan, drive: &DriveInfo) {
		let track = drive.bytes_per_track();
		let limit = if layout.style == PlanStyle::Gpt {
			drive.size - 33 * drive.sector_size as u64
		} else {
			drive.size
		};
		let mut previous_end = 0;
		for (i, part) in layout.partitions.iter().enumerate() {
			assert!(part.offset >= previous_end, "partitions overlap");
			// The first partition may sit at the fixed 1 MB offset even when
			// the track size does not divide it.
			if i > 0 || part.offset != MB {
				assert_eq!(part.offset % track, 0, "offset not track aligned");
			}
			assert!(part.offset + part.size <= limit, "partition past the limit");
			previous_end = part.offset + part.size;
		}
		assert_eq!(
			layout.partitions.iter().filter(|p| p.role == PartRole::Main).count(),
			1
		);
	}

	#[test]
	fn test_plain_mbr_fat32_layout() -> Result<()> {
		// 32 GiB removable drive, MBR, FAT32, no extras: a single partition
		// starting at 1 MiB.
		let drive = drive(32 * GB, 512, 63, MediaKind::Removable);
		let mut req = PlanRequest::new(PlanStyle::Mbr, TargetFs::Fat32);
		req.disk_signature = Some(0x1234_5678);
		let layout = plan(&drive, &req)?;
		assert_eq!(layout.partitions.len(), 1);
		let main = &layout.partitions[layout.main.unwrap()];
		assert_eq!(main.offset, MB);
		assert_eq!(main.size, align_down(32 * GB - MB, TRACK_63));
		Ok(())
	}

	#[test]
	fn test_gpt_ntfs_with_uefi_ntfs_helper() -> Result<()> {
		// 128 GiB removable, GPT, NTFS, with the UEFI:NTFS helper: main data
		// partition plus the helper at the tail, 33 sectors short of the
		// disk end.
		let drive = drive(128 * GB, 512, 63, MediaKind::Removable);
		let mut req = PlanRequest::new(PlanStyle::Gpt, TargetFs::Ntfs);
		req.extras = Extras::UEFI_NTFS;
		req.helper_image_size = MB;
		req.cluster_size = 4096;
		let layout = plan(&drive, &req)?;
		assert_geometry_invariants(&layout, &drive);
		assert_eq!(layout.partitions.len(), 2);
		let main = &layout.partitions[layout.main.unwrap()];
		let helper = &layout.partitions[layout.uefi_ntfs.unwrap()];
		assert_eq!(main.offset, MB);
		assert_eq!(main.size % 4096, 0, "main not cluster aligned");
		assert_eq!(helper.name, "UEFI:NTFS");
		assert_eq!(helper.size, align_up(MB, TRACK_63));
		assert!(helper.offset + helper.size <= 128 * GB - 33 * 512);
		assert!(main.offset + main.size <= helper.offset);
		Ok(())
	}

	#[test]
	fn test_gpt_esp_msr_main_order() -> Result<()> {
		let drive = drive(64 * GB, 512, 63, MediaKind::Fixed);
		let mut req = PlanRequest::new(PlanStyle::Gpt, TargetFs::Ntfs);
		req.extras = Extras::ESP | Extras::MSR;
		let layout = plan(&drive, &req)?;
		assert_eq!(layout.partitions.len(), 3);
		// ESP first (fixed drive), MSR before main.
		assert_eq!(layout.partitions[0].role, PartRole::Esp);
		assert_eq!(layout.partitions[0].size, 260 * MB);
		assert_eq!(layout.partitions[1].role, PartRole::Msr);
		assert_eq!(layout.partitions[1].size, 128 * MB);
		assert_eq!(layout.partitions[2].role, PartRole::Main);
		Ok(())
	}

	#[test]
	fn test_esp_goes_to_tail_without_multipart_support() -> Result<()> {
		let drive = drive(64 * GB, 512, 63, MediaKind::Removable);
		let mut req = PlanRequest::new(PlanStyle::Gpt, TargetFs::Fat32);
		req.extras = Extras::ESP;
		req.multipart_ok = false;
		let layout = plan(&drive, &req)?;
		assert_eq!(layout.partitions[0].role, PartRole::Main);
		assert_eq!(layout.partitions[1].role, PartRole::Esp);
		Ok(())
	}

	#[test]
	fn test_old_bios_fixes_first_offset() -> Result<()> {
		let drive = drive(32 * GB, 512, 63, MediaKind::Removable);
		let mut req = PlanRequest::new(PlanStyle::Mbr, TargetFs::Fat32);
		req.old_bios_fixes = true;
		let layout = plan(&drive, &req)?;
		// Cylinder alignment rounded to the cluster size, then doubled for
		// the Grub2 embedding area.
		let expected = align_up(TRACK_63, 512) * 2;
		assert_eq!(layout.partitions[0].offset, expected);
		Ok(())
	}

	#[test]
	fn test_plan_is_deterministic_and_validates() -> Result<()> {
		// Track size dividing 1 MiB so every boundary is track-aligned.
		let drive = drive(32 * GB, 512, 64, MediaKind::Removable);
		let mut req = PlanRequest::new(PlanStyle::Gpt, TargetFs::Ntfs);
		req.extras = Extras::PERSISTENCE | Extras::UEFI_NTFS;
		req.persistence_size = 4 * GB;
		req.helper_image_size = MB;
		req.disk_guid = Some(Uuid::new_v4());
		let first = plan(&drive, &req)?;
		assert_geometry_invariants(&first, &drive);
		let second = plan(&drive, &req)?;
		assert_eq!(first.disk_guid, second.disk_guid);
		for (a, b) in first.partitions.iter().zip(second.partitions.iter()) {
			assert_eq!(a.offset, b.offset);
			assert_eq!(a.size, b.size);
			assert_eq!(a.role, b.role);
		}
		// Persistence sits between main and the helper.
		assert!(first.persistence.unwrap() < first.uefi_ntfs.unwrap());
		Ok(())
	}

	#[test]
	fn test_plan_rejections() {
		let small = drive(MB, 512, 63, MediaKind::Removable);
		let req = PlanRequest::new(PlanStyle::Gpt, TargetFs::Fat32);
		assert!(plan(&small, &req).is_err());

		let drive = drive(32 * GB, 512, 63, MediaKind::Removable);
		let mut req = PlanRequest::new(PlanStyle::Mbr, TargetFs::Fat32);
		req.extras = Extras::MSR;
		assert!(plan(&drive, &req).is_err());

		let mut req = PlanRequest::new(PlanStyle::Gpt, TargetFs::Fat32);
		req.extras = Extras::ESP | Extras::UEFI_NTFS;
		req.helper_image_size = MB;
		assert!(plan(&drive, &req).is_err());

		let mut req = PlanRequest::new(PlanStyle::Mbr, TargetFs::Fat32);
		req.cluster_size = 1536;
		assert!(plan(&drive, &req).is_err());
	}

	#[test]
	fn test_write_mbr_layout_end_to_end() -> Result<()> {
		let host = Arc::new(SimHost::new());
		host.add_disk(1, 32 * GB, 512, 63, MediaKind::Removable, DiskIdentity::default());
		let registry = Registry::new(host.clone() as Arc<dyn DiskHost>);
		let drive = registry.query(1)?;
		let mut req = PlanRequest::new(PlanStyle::Mbr, TargetFs::Fat32);
		req.mbr_uefi_marker = true;
		let layout = plan(&drive, &req)?;
		write_layout(&registry, 1, &layout, None, false, &CancelToken::new())?;

		let drive = registry.query(1)?;
		assert_eq!(drive.style, PartitionStyle::Mbr);
		assert_eq!(drive.disk_signature, MBR_UEFI_MARKER);
		assert!(drive.has_uefi_marker);
		assert_eq!(drive.partitions.len(), 1);
		assert_eq!(drive.partitions[0].tag, PartTypeTag::Mbr(0x0c));
		assert!(drive.partitions[0].boot);
		assert_eq!(drive.partitions[0].offset, MB);
		// Boot marker in place.
		let mut disk = host.open_disk(1, false)?;
		assert!(crate::bootrec::is_br(disk.as_mut())?);
		Ok(())
	}

	#[test]
	fn test_write_gpt_layout_with_helper_image() -> Result<()> {
		let host = Arc::new(SimHost::new());
		host.add_disk(1, 128 * GB, 512, 63, MediaKind::Removable, DiskIdentity::default());
		let registry = Registry::new(host.clone() as Arc<dyn DiskHost>);
		let drive = registry.query(1)?;
		let mut req = PlanRequest::new(PlanStyle::Gpt, TargetFs::Ntfs);
		req.extras = Extras::UEFI_NTFS;
		let helper = vec![0xA5u8; MB as usize];
		req.helper_image_size = helper.len() as u64;
		let layout = plan(&drive, &req)?;
		write_layout(&registry, 1, &layout, Some(&helper), false, &CancelToken::new())?;

		let drive = registry.query(1)?;
		assert_eq!(drive.style, PartitionStyle::Gpt);
		assert_eq!(drive.partitions.len(), 2);
		let helper_part = &drive.partitions[1];
		assert_eq!(helper_part.name, "UEFI:NTFS");
		assert!(helper_part.is_esp());
		assert_ne!(helper_part.attributes & GPT_ATTR_NO_DRIVE_LETTER, 0);
		// The read-only attribute is reserved for release builds.
		#[cfg(debug_assertions)]
		assert_eq!(helper_part.attributes & GPT_ATTR_READ_ONLY, 0);
		// Helper image contents are on disk.
		use std::io::{Read, Seek, SeekFrom};
		let mut disk = host.open_disk(1, false)?;
		let mut buf = [0u8; 16];
		disk.seek(SeekFrom::Start(helper_part.offset))?;
		disk.read_exact(&mut buf)?;
		assert!(buf.iter().all(|b| *b == 0xA5));
		Ok(())
	}

	#[test]
	fn test_write_waits_for_volume() -> Result<()> {
		let host = Arc::new(SimHost::new());
		host.add_disk(1, 32 * GB, 512, 63, MediaKind::Removable, DiskIdentity::default());
		// The volume only becomes visible once the OS re-reads the table.
		host.add_volume("aaaa-bbbb", 3, MediaKind::Removable, 1, MB, Some('E'), true);
		let registry = Registry::new(host.clone() as Arc<dyn DiskHost>);
		let drive = registry.query(1)?;
		let req = PlanRequest::new(PlanStyle::Mbr, TargetFs::Fat32);
		let layout = plan(&drive, &req)?;
		write_layout(&registry, 1, &layout, None, true, &CancelToken::new())?;
		let drive = registry.query(1)?;
		assert_eq!(
			drive.partitions[0].volume_name.as_deref(),
			Some(r"\\?\Volume{aaaa-bbbb}")
		);
		Ok(())
	}
}
