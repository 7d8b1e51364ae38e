//! ESP visibility toggling.
//!
//! Windows refuses to mount EFI System Partitions for user-mode apps, so
//! the partition type is flipped in place to Basic Data and back. The
//! original partition type GUID is remembered in the settings store so the
//! reverse operation is exact; MBR disks get a synthetic GUID derived from
//! the disk signature and the partition offset.

use std::io::{Read, Seek, SeekFrom};

use anyhow::{Context, Result};
use gptman::GPT;
use log::{info, warn};
use mbrman::MBR;
use uuid::Uuid;

use crate::{
	device::{DriveInfo, PartTypeTag, PartitionStyle, Registry},
	mount,
	plan::{PARTTYPE_BASIC_UUID, PARTTYPE_ESP_UUID},
	settings::{Settings, MAX_ESP_TOGGLE},
	sys::{DiskHost, DiskIo},
};

/// Letter tried for the freshly visible data partition after a toggle.
const DEFAULT_ESP_MOUNT_LETTER: char = 'S';

/// MBR types by FAT variant, probed from the extended BPB of the PBR.
const FAT_MBR_TYPES: &[(u8, &[u8; 8])] = &[
	(0x0b, b"FAT     "),
	(0x01, b"FAT12   "),
	(0x0e, b"FAT16   "),
	(0x0c, b"FAT32   "),
];

/// Offset of the first ESP on the drive, if any.
pub fn esp_offset(drive: &DriveInfo) -> Option<u64> {
	drive.partitions.iter().find(|p| p.is_esp()).map(|p| p.offset)
}

/// Synthetic GUID for an MBR "ESP": disk signature in the first field, the
/// partition offset in the node bytes.
fn mbr_synthetic_guid(disk_signature: u32, offset: u64) -> Uuid {
	Uuid::from_fields(disk_signature, 0, 0, &offset.to_le_bytes())
}

fn record_guid(drive: &DriveInfo, record: &crate::device::PartitionRecord) -> Option<Uuid> {
	match drive.style {
		PartitionStyle::Gpt => record.unique_guid,
		PartitionStyle::Mbr => Some(mbr_synthetic_guid(drive.disk_signature, record.offset)),
		PartitionStyle::Raw => None,
	}
}

/// Pick the matching MBR type for the FAT variant at `offset`, defaulting
/// to plain FAT32 (non-LBA) when nothing better can be determined.
fn detect_fat_mbr_type(disk: &mut dyn DiskIo, offset: u64) -> u8 {
	let mut sector = [0u8; 512];
	if disk.seek(SeekFrom::Start(offset)).is_err() || disk.read_exact(&mut sector).is_err() {
		return 0x0b;
	}
	let mut ebpb = 0x36;
	while ebpb <= 0x52 {
		for (mbr_type, magic) in FAT_MBR_TYPES {
			if &sector[ebpb..ebpb + 8] == *magic {
				return *mbr_type;
			}
		}
		ebpb += 0x1C;
	}
	0x0b
}

/// Rewrite the type of the partition at `offset` in place.
fn set_partition_type(
	disk: &mut dyn DiskIo,
	drive: &DriveInfo,
	offset: u64,
	new_tag: PartTypeTag,
) -> Result<()> {
	let sector = drive.sector_size as u64;
	let mut io = &mut *disk;
	match (drive.style, new_tag) {
		(PartitionStyle::Mbr, PartTypeTag::Mbr(sys)) => {
			let mut mbr = MBR::read_from(&mut io, drive.sector_size)
				.context("Could not read the MBR table")?;
			let lba = (offset / sector) as u32;
			let mut found = false;
			for n in 1..=4usize {
				if mbr[n].is_used() && mbr[n].starting_lba == lba {
					mbr[n].sys = sys;
					found = true;
					break;
				}
			}
			if !found {
				anyhow::bail!("No partition at the requested offset");
			}
			mbr.write_into(&mut io)
				.context("Could not set drive layout")?;
		}
		(PartitionStyle::Gpt, PartTypeTag::Gpt(guid)) => {
			let mut gpt = GPT::find_from(&mut io).context("Could not read the GPT table")?;
			let lba = offset / sector;
			let mut found = false;
			for n in 1..=gpt.header.number_of_partition_entries {
				if gpt[n].is_used() && gpt[n].starting_lba == lba {
					gpt[n].partition_type_guid = guid.to_bytes_le();
					found = true;
					break;
				}
			}
			if !found {
				anyhow::bail!("No partition at the requested offset");
			}
			gpt.write_into(&mut io)
				.context("Could not set drive layout")?;
		}
		_ => anyhow::bail!("Partition style and type tag do not match"),
	}
	disk.sync()
}

/// Toggle a GPT or MBR ESP to Basic Data and back.
///
/// With `partition_offset` zero the drive is searched: an existing ESP is
/// switched away (and remembered), otherwise the stored GUIDs are matched
/// to switch a previously toggled partition back. A nonzero offset forces
/// the partition at that offset back to an ESP. Returns whether anything
/// was toggled.
pub fn toggle_esp(
	registry: &Registry,
	settings: &mut Settings,
	index: u32,
	partition_offset: u64,
) -> Result<bool> {
	let drive = registry.query(index)?;
	let host = registry.host().clone();

	if partition_offset != 0 {
		let record = drive
			.partition_at(partition_offset)
			.context("No partition at the requested offset")?;
		let new_tag = match drive.style {
			PartitionStyle::Gpt => PartTypeTag::Gpt(PARTTYPE_ESP_UUID),
			_ => PartTypeTag::Mbr(0xEF),
		};
		let mut disk = host.open_disk(index, true)?;
		set_partition_type(disk.as_mut(), &drive, record.offset, new_tag)?;
		drop(disk);
		host.reread_partitions(index)?;
		return Ok(true);
	}

	if let Some(esp) = drive.partitions.iter().find(|p| p.is_esp()) {
		// ESP -> Basic Data.
		if !esp.name.is_empty() {
			info!("ESP name: '{}'", esp.name);
		}
		let guid = record_guid(&drive, esp).context("Cannot derive a GUID for this partition")?;
		settings
			.store_esp_guid(&guid)
			.context("ESP toggling data could not be stored")?;
		let mut disk = host.open_disk(index, true)?;
		let new_tag = match drive.style {
			PartitionStyle::Gpt => PartTypeTag::Gpt(PARTTYPE_BASIC_UUID),
			_ => PartTypeTag::Mbr(detect_fat_mbr_type(disk.as_mut(), esp.offset)),
		};
		set_partition_type(disk.as_mut(), &drive, esp.offset, new_tag)?;
		drop(disk);
		host.reread_partitions(index)?;
		// The partition is mountable now; try to give it a letter.
		if !mount::is_drive_letter_in_use(host.as_ref(), DEFAULT_ESP_MOUNT_LETTER) {
			if let Some(volume_name) = registry.logical_name(&drive, esp.offset, true) {
				if let Err(e) =
					mount::mount_volume(host.as_ref(), DEFAULT_ESP_MOUNT_LETTER, &volume_name)
				{
					warn!("Could not mount toggled partition: {:#}", e);
				}
			}
		}
		return Ok(true);
	}

	// Basic Data -> ESP: match the drive's partitions against the stored
	// toggle GUIDs.
	for slot in 0..MAX_ESP_TOGGLE {
		let Some(stored) = settings.esp_guid(slot) else {
			continue;
		};
		for record in &drive.partitions {
			if record_guid(&drive, record) != Some(stored) {
				continue;
			}
			let new_tag = match drive.style {
				PartitionStyle::Gpt => PartTypeTag::Gpt(PARTTYPE_ESP_UUID),
				_ => PartTypeTag::Mbr(0xEF),
			};
			let mut disk = host.open_disk(index, true)?;
			set_partition_type(disk.as_mut(), &drive, record.offset, new_tag)?;
			drop(disk);
			host.reread_partitions(index)?;
			settings.clear_esp_guid(slot)?;
			return Ok(true);
		}
	}

	info!("No partition to toggle");
	Ok(false)
}
