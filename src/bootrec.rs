//! Master and partition boot record templates.
//!
//! Every template is a frozen set of `(offset, bytes)` chunks. Matching
//! compares only the declared ranges and writing writes only the declared
//! ranges, so the partition table of an MBR and the BIOS Parameter Block of
//! a PBR are never touched. The generic `55 AA` boot marker is appended
//! after every write, repeated every 512 bytes through the logical sector
//! size to support 4K-native media.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};
use log::info;

/// Offset of the boot marker within a 512-byte sector.
const MARKER_OFFSET: u64 = 0x1FE;
const MARKER: [u8; 2] = [0x55, 0xAA];

/// Start of the MBR disk signature; templates must stay below this.
const DISK_SIGNATURE_OFFSET: u64 = 0x1B8;

type Chunk = (u64, &'static [u8]);

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, clap::ValueEnum)]
pub enum MbrFlavor {
	#[strum(serialize = "DOS/NT/95A")]
	Dos,
	#[strum(serialize = "Windows 95B/98/98SE/ME")]
	Win95b,
	#[strum(serialize = "Windows 2000/XP/2003")]
	Win2000,
	#[strum(serialize = "Windows Vista")]
	Vista,
	#[strum(serialize = "Windows 7")]
	Win7,
	#[strum(serialize = "Rufus")]
	Rufus,
	#[strum(serialize = "Syslinux")]
	Syslinux,
	#[strum(serialize = "Syslinux GPT")]
	SyslinuxGpt,
	#[strum(serialize = "ReactOS")]
	ReactOs,
	#[strum(serialize = "KolibriOS")]
	KolibriOs,
	#[strum(serialize = "Grub4DOS")]
	Grub4Dos,
	#[strum(serialize = "Grub 2.0")]
	Grub2,
	#[strum(serialize = "Zeroed")]
	Zeroed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum PbrFlavor {
	#[strum(serialize = "FAT16")]
	Fat16,
	#[strum(serialize = "FAT32")]
	Fat32,
	#[strum(serialize = "NTFS")]
	Ntfs,
}

// Boot-stub images, truncated to their distinguishing prefixes. The real
// stubs carry a few hundred more bytes of code and message text; only the
// declared windows take part in identification and writing.

static MBR_DOS: &[Chunk] = &[(
	0x0,
	&[
		0xFA, 0x33, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0x8B, 0xF4, 0x50, 0x07, 0x50, 0x1F,
		0xFB, 0xFC, 0xBF, 0x00, 0x06, 0xB9, 0x00, 0x01, 0xF2, 0xA5, 0xEA, 0x1D, 0x06, 0x00,
		0x00,
	],
)];

static MBR_95B: &[Chunk] = &[
	(
		0x0,
		&[
			0xFA, 0x33, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0xFB, 0x8E, 0xC0, 0x8E, 0xD8,
			0xBE, 0x00, 0x7C, 0xBF, 0x00, 0x06, 0xB9, 0x00, 0x01, 0xF3, 0xA5,
		],
	),
	(0x0E0, &[0xBE, 0xBE, 0x07, 0xB1, 0x04, 0x38, 0x2C]),
];

static MBR_2000: &[Chunk] = &[(
	0x0,
	&[
		0xFA, 0x33, 0xC9, 0x8E, 0xD1, 0xBC, 0xFC, 0x7B, 0x8E, 0xC1, 0x8E, 0xD9, 0xBE, 0x00,
		0x7C, 0xBF, 0x00, 0x06, 0xB9, 0x00, 0x02, 0xFC, 0xF3, 0xA4, 0x50, 0x68, 0x1C, 0x06,
		0xCB,
	],
)];

static MBR_VISTA: &[Chunk] = &[(
	0x0,
	&[
		0x33, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0x8E, 0xC0, 0x8E, 0xD8, 0xBE, 0x00, 0x7C,
		0xBF, 0x00, 0x06, 0xB9, 0x00, 0x02, 0xFC, 0xF3, 0xA4, 0x50, 0x68, 0x1C, 0x06, 0xCB,
		0xFB, 0xB9, 0x04, 0x00,
	],
)];

static MBR_WIN7: &[Chunk] = &[(
	0x0,
	&[
		0x33, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0x8E, 0xC0, 0x8E, 0xD8, 0xBE, 0x00, 0x7C,
		0xBF, 0x00, 0x06, 0xB9, 0x00, 0x02, 0xF3, 0xA4, 0x50, 0x68, 0x1C, 0x06, 0xCB, 0xFB,
		0xB9, 0x04, 0x00, 0xBD, 0xBE, 0x07,
	],
)];

static MBR_RUFUS: &[Chunk] = &[
	(
		0x0,
		&[0x33, 0xC0, 0xFA, 0x8E, 0xD8, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0xFB],
	),
	(0x1A0, b"Rufus"),
];

static MBR_SYSLINUX: &[Chunk] = &[(
	0x0,
	&[
		0x33, 0xC0, 0xFA, 0x8E, 0xD8, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0xFB, 0xFC, 0x66, 0x31,
		0xDB, 0x66, 0x31, 0xC9, 0x66, 0x53, 0x66, 0x51, 0x06, 0x57, 0x8E, 0xDD,
	],
)];

static MBR_SYSLINUX_GPT: &[Chunk] = &[(
	0x0,
	&[
		0x33, 0xC0, 0xFA, 0x8E, 0xD8, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0x66, 0x31, 0xDB, 0x66,
		0x31, 0xC9, 0x66, 0x53, 0x66, 0x51, 0x06, 0x57, 0x8E, 0xDD, 0xE8, 0x00, 0x00,
	],
)];

static MBR_REACTOS: &[Chunk] = &[(
	0x0,
	&[
		0xFA, 0x33, 0xC9, 0x8E, 0xD9, 0x8E, 0xD1, 0xBC, 0x00, 0x7C, 0x8B, 0xF1, 0x50, 0x07,
		0x50, 0x1F, 0xFC, 0xBE, 0x1B, 0x7C,
	],
)];

static MBR_KOLIBRI: &[Chunk] = &[(
	0x0,
	&[
		0xFC, 0xFA, 0x33, 0xC9, 0x8E, 0xD9, 0x8E, 0xC1, 0x8E, 0xD1, 0xBC, 0x00, 0x7C, 0x89,
		0xE6,
	],
)];

static MBR_GRUB4DOS: &[Chunk] = &[(0x0, &[0xEB, 0x63, 0x90, 0x90]), (0x80, b"GRLDR")];

static MBR_GRUB2: &[Chunk] = &[(0x0, &[0xEB, 0x63, 0x90]), (0x17C, b"GRUB\0")];

static ZEROS: [u8; DISK_SIGNATURE_OFFSET as usize] = [0; DISK_SIGNATURE_OFFSET as usize];
static MBR_ZERO: &[Chunk] = &[(0x0, &ZEROS)];

/// Probe order matters: templates sharing a stub prefix rely on the more
/// specific one being tried first, and the all-zero record comes last.
static MBR_TEMPLATES: &[(MbrFlavor, &[Chunk])] = &[
	(MbrFlavor::Dos, MBR_DOS),
	(MbrFlavor::Win95b, MBR_95B),
	(MbrFlavor::Win2000, MBR_2000),
	(MbrFlavor::Vista, MBR_VISTA),
	(MbrFlavor::Win7, MBR_WIN7),
	(MbrFlavor::Rufus, MBR_RUFUS),
	(MbrFlavor::Syslinux, MBR_SYSLINUX),
	(MbrFlavor::SyslinuxGpt, MBR_SYSLINUX_GPT),
	(MbrFlavor::ReactOs, MBR_REACTOS),
	(MbrFlavor::KolibriOs, MBR_KOLIBRI),
	(MbrFlavor::Grub4Dos, MBR_GRUB4DOS),
	(MbrFlavor::Grub2, MBR_GRUB2),
	(MbrFlavor::Zeroed, MBR_ZERO),
];

// PBR stubs. FAT16 keeps the window between the jump instruction and 0x3E
// (the BPB plus extended BPB) untouched; FAT32 additionally owns a small
// cluster-lookup window at 0x3F0; NTFS code starts at 0x54.

static PBR_FAT16: &[Chunk] = &[
	(0x0, &[0xEB, 0x3C, 0x90]),
	(
		0x3E,
		&[
			0xFA, 0x33, 0xC9, 0x8E, 0xD1, 0xBC, 0xF0, 0x7B, 0x8E, 0xD9, 0xB8, 0x00, 0x20,
			0x8E, 0xC0, 0xFC, 0xBD, 0x00, 0x7C, 0x38, 0x4E, 0x24, 0x7D, 0x24, 0x8B, 0xC1,
			0x99, 0xE8,
		],
	),
];

static PBR_FAT32: &[Chunk] = &[
	(0x0, &[0xEB, 0x58, 0x90]),
	(
		0x52,
		&[
			0xFA, 0x33, 0xC9, 0x8E, 0xD1, 0xBC, 0xF4, 0x7B, 0x8E, 0xC1, 0x8E, 0xD9, 0xBD,
			0x00, 0x7C, 0x88, 0x4E, 0x02, 0x8A, 0x56, 0x40, 0xB4, 0x41, 0xBB,
		],
	),
	(
		0x3F0,
		&[0xAC, 0x84, 0xC0, 0x74, 0x17, 0x3C, 0xFF, 0x74, 0x09, 0xB4],
	),
];

static PBR_NTFS: &[Chunk] = &[
	(0x0, &[0xEB, 0x52, 0x90]),
	(
		0x54,
		&[
			0xFA, 0x33, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0xFB, 0x68, 0xC0, 0x07, 0x1F,
			0x1E, 0x68, 0x66, 0x00, 0xCB, 0x88, 0x16, 0x0E, 0x00, 0x66, 0x81,
		],
	),
];

static PBR_TEMPLATES: &[(PbrFlavor, &[Chunk])] = &[
	(PbrFlavor::Fat16, PBR_FAT16),
	(PbrFlavor::Fat32, PBR_FAT32),
	(PbrFlavor::Ntfs, PBR_NTFS),
];

/// 11-character volume label field offsets inside the extended BPB.
const FAT16_LABEL_OFFSET: u64 = 0x2B;
const FAT32_LABEL_OFFSET: u64 = 0x47;
const DEFAULT_LABEL: &[u8; 11] = b"NO NAME    ";

fn contains_data<D: Read + Seek + ?Sized>(dev: &mut D, offset: u64, data: &[u8]) -> Result<bool> {
	let mut buf = vec![0u8; data.len()];
	dev.seek(SeekFrom::Start(offset))
		.context("Failed to seek to template window")?;
	if dev.read_exact(&mut buf).is_err() {
		// Template window past the end of the medium: not a match.
		return Ok(false);
	}
	Ok(buf == data)
}

fn write_data<D: Write + Seek + ?Sized>(dev: &mut D, offset: u64, data: &[u8]) -> Result<()> {
	dev.seek(SeekFrom::Start(offset))
		.context("Failed to seek to template window")?;
	dev.write_all(data)
		.context("Failed to write template bytes")
}

fn matches_template<D: Read + Seek + ?Sized>(dev: &mut D, chunks: &[Chunk]) -> Result<bool> {
	for (offset, data) in chunks {
		if !contains_data(dev, *offset, data)? {
			return Ok(false);
		}
	}
	Ok(true)
}

/// Whether the record carries the generic `55 AA` boot marker at offset 510.
pub fn is_br<D: Read + Seek + ?Sized>(dev: &mut D) -> Result<bool> {
	contains_data(dev, MARKER_OFFSET, &MARKER)
}

/// Write the boot marker at offset 510, replicated every 512 bytes through
/// the logical sector size so 4K-native firmware finds it too.
fn write_bootmark<D: Write + Seek + ?Sized>(dev: &mut D, sector_size: u32) -> Result<()> {
	let mut pos = MARKER_OFFSET;
	while pos < sector_size as u64 {
		write_data(dev, pos, &MARKER)?;
		pos += 0x200;
	}
	Ok(())
}

/// Name the MBR flavor on the device, probing known templates in order.
pub fn identify_mbr<D: Read + Seek + ?Sized>(dev: &mut D) -> Result<Option<MbrFlavor>> {
	for (flavor, chunks) in MBR_TEMPLATES {
		if matches_template(dev, chunks)? {
			return Ok(Some(*flavor));
		}
	}
	Ok(None)
}

/// Write an MBR boot stub. Only the declared template ranges are written;
/// the partition table and the disk signature are left alone.
pub fn write_mbr<D: Write + Seek + ?Sized>(
	dev: &mut D,
	flavor: MbrFlavor,
	sector_size: u32,
) -> Result<()> {
	let chunks = MBR_TEMPLATES
		.iter()
		.find(|(f, _)| *f == flavor)
		.map(|(_, c)| *c)
		.expect("every flavor has a template");
	for (offset, data) in chunks {
		write_data(dev, *offset, data)?;
	}
	write_bootmark(dev, sector_size)
}

/// Name the PBR flavor at the current partition start.
pub fn identify_pbr<D: Read + Seek + ?Sized>(dev: &mut D) -> Result<Option<PbrFlavor>> {
	for (flavor, chunks) in PBR_TEMPLATES {
		if matches_template(dev, chunks)? {
			return Ok(Some(*flavor));
		}
	}
	Ok(None)
}

/// Write a partition boot record. The BPB windows between the declared
/// chunks are never modified; the 11-byte volume label is preserved when
/// `keep_label` is set and reset to the default otherwise.
pub fn write_pbr<D: Write + Seek + ?Sized>(
	dev: &mut D,
	flavor: PbrFlavor,
	keep_label: bool,
	sector_size: u32,
) -> Result<()> {
	let chunks = PBR_TEMPLATES
		.iter()
		.find(|(f, _)| *f == flavor)
		.map(|(_, c)| *c)
		.expect("every flavor has a template");
	for (offset, data) in chunks {
		write_data(dev, *offset, data)?;
	}
	if !keep_label {
		match flavor {
			PbrFlavor::Fat16 => write_data(dev, FAT16_LABEL_OFFSET, DEFAULT_LABEL)?,
			PbrFlavor::Fat32 => write_data(dev, FAT32_LABEL_OFFSET, DEFAULT_LABEL)?,
			PbrFlavor::Ntfs => (),
		}
	}
	write_bootmark(dev, sector_size)
}

/// Adapter exposing one partition as its own zero-based device, so PBR
/// templates can be read and written with partition-relative offsets.
pub struct SectorWindow<D> {
	inner: D,
	base: u64,
	pos: u64,
}

impl<D> SectorWindow<D> {
	pub fn new(inner: D, base: u64) -> Self {
		SectorWindow {
			inner,
			base,
			pos: 0,
		}
	}
}

impl<D: Read + Seek> Read for SectorWindow<D> {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		self.inner.seek(SeekFrom::Start(self.base + self.pos))?;
		let n = self.inner.read(buf)?;
		self.pos += n as u64;
		Ok(n)
	}
}

impl<D: Write + Seek> Write for SectorWindow<D> {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.inner.seek(SeekFrom::Start(self.base + self.pos))?;
		let n = self.inner.write(buf)?;
		self.pos += n as u64;
		Ok(n)
	}

	fn flush(&mut self) -> std::io::Result<()> {
		self.inner.flush()
	}
}

impl<D: Seek> Seek for SectorWindow<D> {
	fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
		match pos {
			SeekFrom::Start(n) => self.pos = n,
			SeekFrom::Current(n) => {
				self.pos = self
					.pos
					.checked_add_signed(n)
					.ok_or_else(|| {
						std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start")
					})?;
			}
			SeekFrom::End(_) => {
				return Err(std::io::Error::new(
					std::io::ErrorKind::Unsupported,
					"end-relative seeks are not supported inside a partition window",
				));
			}
		}
		Ok(self.pos)
	}
}

/// Little-endian disk signature at offset 0x1B8 of the MBR.
pub fn read_disk_signature<D: Read + Seek + ?Sized>(dev: &mut D) -> Result<u32> {
	let mut buf = [0u8; 4];
	dev.seek(SeekFrom::Start(DISK_SIGNATURE_OFFSET))?;
	dev.read_exact(&mut buf)
		.context("Failed to read disk signature")?;
	Ok(u32::from_le_bytes(buf))
}

pub fn write_disk_signature<D: Write + Seek + ?Sized>(dev: &mut D, signature: u32) -> Result<()> {
	write_data(dev, DISK_SIGNATURE_OFFSET, &signature.to_le_bytes())
}

/// Log what kind of master boot record the target carries. Returns whether
/// it looks bootable at all.
pub fn analyze_mbr<D: Read + Seek + ?Sized>(dev: &mut D, target_name: &str) -> Result<bool> {
	if !is_br(dev)? {
		info!("{} does not have a Boot Marker", target_name);
		return Ok(false);
	}
	match identify_mbr(dev)? {
		Some(flavor) => info!("{} has a {} Master Boot Record", target_name, flavor),
		None => info!("{} has an unknown Master Boot Record", target_name),
	}
	Ok(true)
}

/// Log what kind of partition boot record the volume carries.
pub fn analyze_pbr<D: Read + Seek + ?Sized>(dev: &mut D) -> Result<bool> {
	if !is_br(dev)? {
		info!("Volume does not have an x86 Partition Boot Record");
		return Ok(false);
	}
	match identify_pbr(dev)? {
		Some(flavor) => info!("Volume has a {} Partition Boot Record", flavor),
		None => info!("Volume has an unknown Partition Boot Record"),
	}
	Ok(true)
}
