//! Module defining the command line usage.
//!
//! Available subcommands
//! ---------------------
//!
//! ### List devices
//!
//! ```shell
//! $ mkbootdev list --format FORMAT TARGET [TARGET..]
//! ```
//!
//! `FORMAT` is one of `pretty` (a table with classification data), `simple`
//! (tab-separated columns) or `json`.
//!
//! ### Inspect a device
//!
//! ```shell
//! $ mkbootdev inspect TARGET
//! ```
//!
//! Reports the partition style, the boot-record flavor, and the detected
//! file system of every partition.
//!
//! ### Write a bootable layout
//!
//! ```shell
//! $ mkbootdev write --style gpt --fs ntfs --uefi-ntfs uefi-ntfs.img TARGET
//! ```
//!
//! ### Toggle an ESP
//!
//! ```shell
//! $ mkbootdev toggle-esp TARGET
//! ```
//!
//! ### Watch blocking processes
//!
//! ```shell
//! $ mkbootdev watch TARGET
//! ```
//!
//! `TARGET` is a raw image file or a block-device node.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::{
	bootrec::MbrFlavor,
	plan::{PlanStyle, TargetFs},
};

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
	Pretty,
	Simple,
	Json,
}

/// Command line usage
/// ==================
///
/// This tool uses the subcommand approach to specify the action to take.
///
/// ```shell
/// mkbootdev [GLOBAL_OPTIONS] action [OPTIONS] [--] TARGET
/// ```
///
/// Global options
/// ==============
///
/// - `-D`, `--debug`: Enables the debug output.
/// - `--sector-size`: Logical sector size to assume for image targets
///   (default 512).
/// - `--settings`: Overrides the path of the persistent settings store.
#[derive(Parser)]
#[command(version, about = "Bootable-media authoring for removable mass-storage devices")]
pub struct Cmdline {
	/// Enable debug output.
	#[arg(short = 'D', long, global = true)]
	pub debug: bool,
	/// Logical sector size to assume for the targets.
	#[arg(long, global = true, default_value_t = 512)]
	pub sector_size: u32,
	/// Path of the persistent settings store.
	#[arg(long, global = true)]
	pub settings: Option<PathBuf>,
	#[command(subcommand)]
	pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
	/// List the given devices with size, layout and classification data.
	List {
		#[arg(long, value_enum, default_value = "pretty")]
		format: ListFormat,
		/// Image files or block-device nodes.
		#[arg(required = true)]
		targets: Vec<PathBuf>,
	},
	/// Analyze the boot records and file systems on a device.
	Inspect {
		target: PathBuf,
	},
	/// Plan and write a partition layout, boot records included.
	Write {
		target: PathBuf,
		#[arg(long, value_enum, default_value = "mbr")]
		style: PlanStyle,
		#[arg(long, value_enum, default_value = "fat32")]
		fs: TargetFs,
		/// Add an EFI System Partition.
		#[arg(long)]
		esp: bool,
		/// Add a Microsoft Reserved partition (GPT only).
		#[arg(long)]
		msr: bool,
		/// Add a persistence partition of the given size in MiB.
		#[arg(long, value_name = "MIB")]
		persistence: Option<u64>,
		/// Add the UEFI:NTFS helper partition, fed from this image.
		#[arg(long, value_name = "IMAGE")]
		uefi_ntfs: Option<PathBuf>,
		/// Add the one-track BIOS compatibility stub.
		#[arg(long)]
		bios_compat: bool,
		/// Apply the partition alignment workarounds for old BIOSes.
		#[arg(long)]
		old_bios_fixes: bool,
		/// Write the fixed MBR+UEFI self-identification signature.
		#[arg(long)]
		mbr_uefi_marker: bool,
		/// Target cluster size in bytes.
		#[arg(long)]
		cluster_size: Option<u64>,
		/// Do not set the boot indicator on the main partition.
		#[arg(long)]
		non_bootable: bool,
		/// Master boot record flavor to install after partitioning.
		#[arg(long, value_enum)]
		boot_record: Option<MbrFlavor>,
	},
	/// Toggle an EFI System Partition to Basic Data and back.
	ToggleEsp {
		target: PathBuf,
		/// Force the partition at this byte offset back to an ESP.
		#[arg(long, default_value_t = 0)]
		offset: u64,
	},
	/// Report the processes holding handles on a device.
	Watch {
		target: PathBuf,
		/// How long to keep reporting, in seconds.
		#[arg(long, default_value_t = 10)]
		seconds: u64,
	},
}
