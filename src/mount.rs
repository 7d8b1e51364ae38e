//! Volume mounting discipline.
//!
//! Regular GUID volumes go through the OS mount-point call. GLOBALROOT
//! device paths (ESPs and friends) cannot be mounted that way at all; for
//! those the raw DOS-device definition is the only option, with the leading
//! 14-character prefix stripped and no trailing backslash.

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::{
	device::{DriveInfo, Registry},
	error::OpError,
	sys::{DiskHost, MountError, GROOT_LEN, GROOT_NAME},
};

fn mount_point(letter: char) -> String {
	format!("{}:", letter.to_ascii_uppercase())
}

/// First unused drive letter, the way the OS would pick one.
pub fn unused_drive_letter(host: &dyn DiskHost) -> Option<char> {
	let used = host.letters_in_use();
	('C'..='Z').find(|l| !used.contains(l))
}

pub fn is_drive_letter_in_use(host: &dyn DiskHost, letter: char) -> bool {
	host.letters_in_use().contains(&letter.to_ascii_uppercase())
}

/// Mount `volume_name` on `letter`.
///
/// If the letter already carries a volume with the same GUID this silently
/// succeeds; a different GUID gets one dismount-and-retry.
pub fn mount_volume(host: &dyn DiskHost, letter: char, volume_name: &str) -> Result<()> {
	let volume_name = volume_name.trim_end_matches('\\');
	if volume_name.len() < GROOT_LEN {
		bail!("Invalid volume name '{}'", volume_name);
	}

	// GLOBALROOT devices can only be mounted through a raw DOS device
	// definition.
	if volume_name.starts_with(GROOT_NAME) {
		host.define_dos_device(letter, Some(&volume_name[GROOT_LEN..]))
			.context(format!(
				"Could not mount {} as {}:",
				volume_name,
				letter.to_ascii_uppercase()
			))?;
		info!(
			"{} was successfully mounted as {}:",
			volume_name,
			letter.to_ascii_uppercase()
		);
		return Ok(());
	}

	let mount = mount_point(letter);
	match host.set_mount_point(&mount, volume_name) {
		Ok(()) => Ok(()),
		Err(MountError::AlreadyMounted) => {
			match host.mount_point_volume(&mount) {
				Some(mounted) if mounted.trim_end_matches('\\') == volume_name => {
					info!("{} is already mounted as {}:", volume_name, letter);
					return Ok(());
				}
				Some(mounted) => {
					info!(
						"{}: is mounted, but volume GUID doesn't match: expected {}, got {}",
						letter, volume_name, mounted
					);
				}
				None => {
					info!(
						"{}: is already mounted, but the volume GUID could not be checked",
						letter
					);
				}
			}
			info!("Retrying after dismount...");
			if let Err(e) = host.delete_mount_point(&mount) {
				warn!("Could not delete volume mountpoint '{}': {:#}", mount, e);
			}
			host.set_mount_point(&mount, volume_name)
				.map_err(|e| anyhow::anyhow!("Could not mount {} as {}: {}", volume_name, mount, e))
		}
		Err(e) => bail!("Could not mount {} as {}: {}", volume_name, mount, e),
	}
}

/// Dismount the file system on a volume.
pub fn unmount_volume(host: &dyn DiskHost, volume_name: &str) -> Result<()> {
	host.dismount_volume(volume_name)
		.context("Could not unmount volume")
}

/// Flush, look up the current GUID and mount the volume again. Failure is
/// surfaced as [`OpError::RemountFailed`]: it leaves the drive inaccessible
/// and the user must be told to replug it.
pub fn remount_volume(host: &dyn DiskHost, letter: char) -> Result<()> {
	// UDF requires a flush, and it's a good idea for the other file
	// systems too.
	host.flush_volume(letter)
		.context("Failed to flush volume buffers")?;
	let mount = mount_point(letter);
	let Some(volume_name) = host.mount_point_volume(&mount) else {
		return Ok(());
	};
	host.delete_mount_point(&mount)?;
	match host.set_mount_point(&mount, &volume_name) {
		Ok(()) => {
			info!("Successfully remounted {} as {}:", volume_name, letter);
			Ok(())
		}
		Err(e) => {
			warn!("Could not remount {} as {}: {}", volume_name, letter, e);
			Err(OpError::RemountFailed.into())
		}
	}
}

/// Mount a partition that has no GUID volume (an ESP) on the first unused
/// letter, through its GLOBALROOT device path. Returns the letter used.
pub fn alt_mount_volume(
	registry: &Registry,
	drive: &DriveInfo,
	partition_offset: u64,
) -> Result<char> {
	let host = registry.host();
	let letter = unused_drive_letter(host.as_ref()).context("Could not find an unused drive letter")?;
	let volume_name = registry.alt_logical_name(drive, partition_offset, false)?;
	if !volume_name.starts_with(GROOT_NAME) {
		bail!("Unexpected volume name: '{}'", volume_name);
	}
	info!("Mounting '{}' as '{}:'", &volume_name[GROOT_LEN..], letter);
	host.define_dos_device(letter, Some(&volume_name[GROOT_LEN..]))
		.context("Mount operation failed")?;
	Ok(letter)
}

/// Undo an [`alt_mount_volume`].
pub fn alt_unmount_volume(host: &dyn DiskHost, letter: char) -> Result<()> {
	host.define_dos_device(letter, None)
		.context(format!("Could not unmount '{}:'", letter))?;
	info!("Successfully unmounted '{}:'", letter);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sys::sim::SimHost;
	use crate::sys::{DiskIdentity, MediaKind};
	use crate::utils::MB;
	use mbrman::{CHS, MBR};
	use std::sync::Arc;

	fn host_with_volume() -> Arc<SimHost> {
		let host = Arc::new(SimHost::new());
		host.add_disk(1, 256 * MB, 512, 63, MediaKind::Removable, DiskIdentity::default());
		host.add_volume("cafe-0001", 4, MediaKind::Removable, 1, MB, None, false);
		host
	}

	#[test]
	fn test_mount_guid_volume() -> Result<()> {
		let host = host_with_volume();
		mount_volume(host.as_ref(), 'E', r"\\?\Volume{cafe-0001}")?;
		assert_eq!(
			host.mount_point_volume("E:").as_deref(),
			Some(r"\\?\Volume{cafe-0001}")
		);
		Ok(())
	}

	#[test]
	fn test_mount_same_guid_silently_succeeds() -> Result<()> {
		let host = host_with_volume();
		mount_volume(host.as_ref(), 'E', r"\\?\Volume{cafe-0001}")?;
		// Trailing backslash form must compare equal.
		mount_volume(host.as_ref(), 'E', "\\\\?\\Volume{cafe-0001}\\")?;
		Ok(())
	}

	#[test]
	fn test_mount_conflicting_guid_retries_after_dismount() -> Result<()> {
		let host = host_with_volume();
		host.add_volume("cafe-0002", 5, MediaKind::Removable, 1, 128 * MB, None, false);
		mount_volume(host.as_ref(), 'E', r"\\?\Volume{cafe-0001}")?;
		mount_volume(host.as_ref(), 'E', r"\\?\Volume{cafe-0002}")?;
		assert_eq!(
			host.mount_point_volume("E:").as_deref(),
			Some(r"\\?\Volume{cafe-0002}")
		);
		Ok(())
	}

	#[test]
	fn test_globalroot_mount_uses_dos_device() -> Result<()> {
		let host = host_with_volume();
		mount_volume(
			host.as_ref(),
			'S',
			r"\\?\GLOBALROOT\Device\HarddiskVolume9\",
		)?;
		// Prefix stripped, trailing backslash dropped.
		assert_eq!(
			host.defined_dos_device('S').as_deref(),
			Some(r"\Device\HarddiskVolume9")
		);
		alt_unmount_volume(host.as_ref(), 'S')?;
		assert_eq!(host.defined_dos_device('S'), None);
		Ok(())
	}

	#[test]
	fn test_remount_round_trip() -> Result<()> {
		let host = host_with_volume();
		mount_volume(host.as_ref(), 'E', r"\\?\Volume{cafe-0001}")?;
		remount_volume(host.as_ref(), 'E')?;
		assert_eq!(
			host.mount_point_volume("E:").as_deref(),
			Some(r"\\?\Volume{cafe-0001}")
		);
		// Remounting an empty letter is not an error.
		remount_volume(host.as_ref(), 'Q')?;
		Ok(())
	}

	#[test]
	fn test_alt_mount_for_esp() -> Result<()> {
		let host = host_with_volume();
		// Give the disk a partition so the alt name can be synthesized.
		{
			let mut disk = host.open_disk(1, true)?;
			let mut io = disk.as_mut();
			let mut mbr = MBR::new_from(&mut io, 512, [0; 4])?;
			mbr[1] = mbrman::MBRPartitionEntry {
				boot: mbrman::BOOT_INACTIVE,
				first_chs: CHS::empty(),
				sys: 0xEF,
				last_chs: CHS::empty(),
				starting_lba: 2048,
				sectors: 2048,
			};
			mbr.write_into(&mut io)?;
		}
		host.map_partition_device(1, 1, 9);
		let registry = Registry::new(host.clone() as Arc<dyn crate::sys::DiskHost>);
		let drive = registry.query(1)?;
		let letter = alt_mount_volume(&registry, &drive, 2048 * 512)?;
		assert_eq!(
			host.defined_dos_device(letter).as_deref(),
			Some(r"\Device\HarddiskVolume9")
		);
		alt_unmount_volume(host.as_ref(), letter)?;
		Ok(())
	}
}
