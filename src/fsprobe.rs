//! Crude file-system detection through superblock magics.
//!
//! Only the file systems this tool can produce plus a couple of mainstream
//! ones are attempted. Read failures propagate; running past the end of a
//! small partition is treated as "nothing more to probe".

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use anyhow::{Context, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum FsKind {
	#[strum(serialize = "ISO9660")]
	Iso9660,
	#[strum(serialize = "exFAT")]
	ExFat,
	#[strum(serialize = "NTFS")]
	Ntfs,
	#[strum(serialize = "ReFS")]
	ReFs,
	#[strum(serialize = "FAT")]
	Fat,
	#[strum(serialize = "FAT12")]
	Fat12,
	#[strum(serialize = "FAT16")]
	Fat16,
	#[strum(serialize = "FAT32")]
	Fat32,
	#[strum(serialize = "APFS")]
	Apfs,
	#[strum(serialize = "HFS/HFS+")]
	Hfs,
	#[strum(serialize = "ext")]
	Ext,
	#[strum(serialize = "ext2")]
	Ext2,
	#[strum(serialize = "ext3")]
	Ext3,
	#[strum(serialize = "ext4")]
	Ext4,
	#[strum(serialize = "UDF")]
	Udf,
	#[strum(serialize = "(Unrecognized)")]
	Unrecognized,
}

impl FsKind {
	pub fn is_recognized(&self) -> bool {
		*self != FsKind::Unrecognized
	}

	pub fn is_fat(&self) -> bool {
		matches!(self, FsKind::Fat | FsKind::Fat12 | FsKind::Fat16 | FsKind::Fat32)
	}
}

/// OEM-name magics right after the 3-byte jump instruction. Not technically
/// immutable, but in practice they are for exFAT/NTFS/ReFS.
const WIN_FS_MAGICS: &[(FsKind, &[u8; 8])] = &[
	(FsKind::ExFat, b"EXFAT   "),
	(FsKind::Ntfs, b"NTFS    "),
	(FsKind::ReFs, b"ReFS\0\0\0\0"),
];

/// FAT detection goes through the FAT12/16 and FAT32 Extended BIOS Parameter
/// Blocks instead, since the OEM name is commonly something else entirely.
const FAT_FS_MAGICS: &[(FsKind, &[u8; 8])] = &[
	(FsKind::Fat, b"FAT     "),
	(FsKind::Fat12, b"FAT12   "),
	(FsKind::Fat16, b"FAT16   "),
	(FsKind::Fat32, b"FAT32   "),
];

/// ext2/3/4 revision detection from the three feature bitmask families
/// (compat, ro_compat, incompat). A set bit in column `j` raises the
/// revision to at least `j + 1`.
const EXT_FEATURES: [[u32; 3]; 3] = [
	[0x0000_017B, 0x0000_0004, 0x0000_0E00],
	[0x0000_0003, 0x0000_0000, 0x0000_8FF8],
	[0x0000_0013, 0x0000_004C, 0x0003_F780],
];

const EXT_KINDS: [FsKind; 4] = [FsKind::Ext, FsKind::Ext2, FsKind::Ext3, FsKind::Ext4];

/// Read one 512-byte probe window. `Ok(None)` when the window lies past the
/// end of the medium.
fn read_window<D: Read + Seek + ?Sized>(dev: &mut D, offset: u64) -> Result<Option<[u8; 512]>> {
	let mut buf = [0u8; 512];
	dev.seek(SeekFrom::Start(offset))
		.context("Failed to seek to probe window")?;
	match dev.read_exact(&mut buf) {
		Ok(()) => Ok(Some(buf)),
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
		Err(e) => Err(e).context("Failed to read probe window"),
	}
}

/// Classify the file system starting at `offset` on an open device.
pub fn detect_fs<D: Read + Seek + ?Sized>(dev: &mut D, offset: u64) -> Result<FsKind> {
	// 1. ISO9660 / exFAT / NTFS / ReFS / FAT through the sector at offset 0.
	let buf = match read_window(dev, offset)? {
		Some(buf) => buf,
		None => return Ok(FsKind::Unrecognized),
	};
	if &buf[0x01..0x06] == b"CD001" {
		return Ok(FsKind::Iso9660);
	}
	for (kind, magic) in WIN_FS_MAGICS {
		if &buf[0x03..0x0B] == *magic {
			return Ok(*kind);
		}
	}
	let mut ebpb = 0x36;
	while ebpb <= 0x52 {
		for (kind, magic) in FAT_FS_MAGICS {
			if &buf[ebpb..ebpb + 8] == *magic {
				return Ok(*kind);
			}
		}
		ebpb += 0x1C;
	}

	// 2. APFS container superblock at offset 0, HFS/HFS+ at offset 1024.
	if &buf[0x20..0x24] == b"NXSB" {
		return Ok(FsKind::Apfs);
	}
	let buf = match read_window(dev, offset + 0x400)? {
		Some(buf) => buf,
		None => return Ok(FsKind::Unrecognized),
	};
	if buf[0] == b'H' && (buf[1] == b'X' || buf[1] == b'+') {
		return Ok(FsKind::Hfs);
	}

	// 3. ext2/3/4 superblock, also at offset 1024.
	if buf[0x38] == 0x53 && buf[0x39] == 0xEF {
		let mut rev = 0usize;
		for (i, masks) in EXT_FEATURES.iter().enumerate() {
			let feature = u32::from_le_bytes([
				buf[0x5C + 4 * i],
				buf[0x5D + 4 * i],
				buf[0x5E + 4 * i],
				buf[0x5F + 4 * i],
			]);
			for (j, mask) in masks.iter().enumerate() {
				if feature & mask != 0 && rev <= j {
					rev = j + 1;
				}
			}
		}
		return Ok(EXT_KINDS[rev]);
	}

	// 4. UDF beginning extended area descriptor at offset 0x8000. Not a
	// thorough UDF check, but good enough here.
	let buf = match read_window(dev, offset + 0x8000)? {
		Some(buf) => buf,
		None => return Ok(FsKind::Unrecognized),
	};
	if &buf[0x01..0x06] == b"BEA01" {
		return Ok(FsKind::Udf);
	}

	Ok(FsKind::Unrecognized)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;

	fn image(size: usize) -> Vec<u8> {
		vec![0u8; size]
	}

	#[test]
	fn test_detect_ntfs() -> Result<()> {
		let mut img = image(64 * 1024);
		img[0x03..0x0B].copy_from_slice(b"NTFS    ");
		assert_eq!(detect_fs(&mut Cursor::new(img), 0)?, FsKind::Ntfs);
		Ok(())
	}

	#[test]
	fn test_detect_fat32_via_ebpb() -> Result<()> {
		let mut img = image(64 * 1024);
		// OEM name deliberately not a FAT magic.
		img[0x03..0x0B].copy_from_slice(b"MSWIN4.1");
		img[0x52..0x5A].copy_from_slice(b"FAT32   ");
		assert_eq!(detect_fs(&mut Cursor::new(img), 0)?, FsKind::Fat32);
		Ok(())
	}

	#[test]
	fn test_detect_fat16_at_partition_offset() -> Result<()> {
		let offset = 0x100000;
		let mut img = image(offset as usize + 64 * 1024);
		img[offset as usize + 0x36..offset as usize + 0x3E].copy_from_slice(b"FAT16   ");
		assert_eq!(detect_fs(&mut Cursor::new(img), offset)?, FsKind::Fat16);
		Ok(())
	}

	#[test]
	fn test_detect_iso9660() -> Result<()> {
		let mut img = image(64 * 1024);
		img[0x01..0x06].copy_from_slice(b"CD001");
		assert_eq!(detect_fs(&mut Cursor::new(img), 0)?, FsKind::Iso9660);
		Ok(())
	}

	#[test]
	fn test_detect_ext_revisions() -> Result<()> {
		let mut img = image(64 * 1024);
		img[0x400 + 0x38] = 0x53;
		img[0x400 + 0x39] = 0xEF;
		// No features set at all: plain ext.
		assert_eq!(detect_fs(&mut Cursor::new(img.clone()), 0)?, FsKind::Ext);
		// An incompat bit from the ext4 column (64-bit support).
		img[0x400 + 0x64..0x400 + 0x68].copy_from_slice(&0x0000_0080u32.to_le_bytes());
		assert_eq!(detect_fs(&mut Cursor::new(img.clone()), 0)?, FsKind::Ext4);
		// Journalling alone makes it ext3.
		img[0x400 + 0x64..0x400 + 0x68].copy_from_slice(&0u32.to_le_bytes());
		img[0x400 + 0x5C..0x400 + 0x60].copy_from_slice(&0x0000_0004u32.to_le_bytes());
		assert_eq!(detect_fs(&mut Cursor::new(img), 0)?, FsKind::Ext3);
		Ok(())
	}

	#[test]
	fn test_detect_udf() -> Result<()> {
		let mut img = image(64 * 1024);
		img[0x8001..0x8006].copy_from_slice(b"BEA01");
		assert_eq!(detect_fs(&mut Cursor::new(img), 0)?, FsKind::Udf);
		Ok(())
	}

	#[test]
	fn test_unrecognized_and_tiny_media() -> Result<()> {
		assert_eq!(
			detect_fs(&mut Cursor::new(image(64 * 1024)), 0)?,
			FsKind::Unrecognized
		);
		// A medium smaller than the deeper probe windows must not error out.
		let mut img = image(2048);
		img[0x20..0x24].copy_from_slice(b"NXSB");
		assert_eq!(detect_fs(&mut Cursor::new(img), 0)?, FsKind::Apfs);
		assert_eq!(detect_fs(&mut Cursor::new(image(512)), 0)?, FsKind::Unrecognized);
		Ok(())
	}
}
