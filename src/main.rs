mod bootrec;
mod cli;
mod device;
mod error;
mod esp;
mod fsprobe;
mod mount;
mod plan;
mod scanner;
mod score;
mod settings;
mod sys;
mod utils;

use std::{fs, path::PathBuf, sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use crate::{
	bootrec::{PbrFlavor, SectorWindow},
	cli::{Action, Cmdline, ListFormat},
	device::{DriveInfo, PartitionStyle, Registry},
	error::OpError,
	plan::{Extras, PlanRequest, PlanStyle, TargetFs},
	scanner::Scanner,
	settings::Settings,
	sys::{file::FileHost, file::NullProcessPort, DiskHost, DiskIo},
	utils::{size_to_human_readable, CancelToken, MB},
};

const DEFAULT_SETTINGS_FILE: &str = "mkbootdev-settings.toml";

fn main() -> Result<()> {
	let cancel = CancelToken::new();
	{
		let cancel = cancel.clone();
		ctrlc::set_handler(move || {
			eprintln!("\nReceived Ctrl-C, aborting.");
			cancel.cancel();
		})
		.context("Can not register Ctrl-C (SIGTERM) handler.")?;
	}

	let cmdline = Cmdline::try_parse()?;
	let mut logger = colog::basic_builder();
	if cmdline.debug {
		logger.filter(None, log::LevelFilter::Debug);
	} else {
		logger.filter(None, log::LevelFilter::Info);
	}
	logger.init();

	if let Err(e) = try_main(cmdline, cancel) {
		// Use the logger to pretty-print the error chain.
		error!("Error encountered!\n{}", e);
		let mut str_buf = String::new();
		let mut indent = 0;
		e.chain().skip(1).for_each(|cause| {
			let indent_str = "\t".repeat(indent);
			indent += 1;
			str_buf += &format!("{0}- Caused by:\n{0}  {1}\n", indent_str, cause);
		});
		if !str_buf.is_empty() {
			error!("{}", str_buf);
		}
		std::process::exit(1);
	}
	Ok(())
}

fn open_registry(targets: Vec<PathBuf>, sector_size: u32) -> Result<(Arc<dyn DiskHost>, Registry)> {
	let host: Arc<dyn DiskHost> = Arc::new(FileHost::new(targets, sector_size)?);
	let registry = Registry::new(host.clone());
	Ok((host, registry))
}

fn try_main(cmdline: Cmdline, cancel: CancelToken) -> Result<()> {
	match cmdline.action {
		Action::List { format, targets } => {
			let paths = targets.clone();
			let (_, registry) = open_registry(targets, cmdline.sector_size)?;
			let drives = registry.enumerate();
			list_drives(&drives, &paths, format);
		}
		Action::Inspect { target } => {
			let (_, registry) = open_registry(vec![target], cmdline.sector_size)?;
			let drive = registry.query(1)?;
			inspect_drive(&registry, &drive)?;
		}
		Action::Write {
			target,
			style,
			fs,
			esp,
			msr,
			persistence,
			uefi_ntfs,
			bios_compat,
			old_bios_fixes,
			mbr_uefi_marker,
			cluster_size,
			non_bootable,
			boot_record,
		} => {
			let (host, registry) = open_registry(vec![target], cmdline.sector_size)?;
			let drive = registry.query(1)?;
			if drive.looks_like_hdd() {
				warn!(
					"This device scores as an USB hard drive ({}). Make sure it is the right target.",
					drive.score
				);
			}

			let helper_image = match &uefi_ntfs {
				Some(path) => Some(fs::read(path).context(format!(
					"Unable to read the UEFI:NTFS helper image '{}'",
					path.display()
				))?),
				None => None,
			};

			let mut req = PlanRequest::new(style, fs);
			req.bootable = !non_bootable;
			req.old_bios_fixes = old_bios_fixes;
			req.mbr_uefi_marker = mbr_uefi_marker;
			req.cluster_size = cluster_size.unwrap_or(0);
			req.multipart_ok = host.supports_multipart_removable();
			if esp {
				req.extras |= Extras::ESP;
			}
			if msr {
				req.extras |= Extras::MSR;
			}
			if let Some(mib) = persistence {
				req.extras |= Extras::PERSISTENCE;
				req.persistence_size = mib * MB;
			}
			if let Some(image) = &helper_image {
				req.extras |= Extras::UEFI_NTFS;
				req.helper_image_size = image.len() as u64;
			}
			if bios_compat {
				req.extras |= Extras::BIOS_COMPAT;
			}

			let layout = plan::plan(&drive, &req)?;
			// Image files have no mounted-volume surface to wait on.
			plan::write_layout(
				&registry,
				1,
				&layout,
				helper_image.as_deref(),
				false,
				&cancel,
			)?;
			write_boot_records(&registry, &layout, boot_record, &cancel)?;
			info!("Done.");
		}
		Action::ToggleEsp { target, offset } => {
			let (_, registry) = open_registry(vec![target], cmdline.sector_size)?;
			let settings_path = cmdline
				.settings
				.unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
			let mut settings = Settings::load(&settings_path)?;
			if esp::toggle_esp(&registry, &mut settings, 1, offset)? {
				info!("Partition type toggled.");
			} else {
				info!("Nothing to toggle on this device.");
			}
		}
		Action::Watch { target, seconds } => {
			let (host, registry) = open_registry(vec![target], cmdline.sector_size)?;
			let drive = registry.query(1)?;
			let scanner = Scanner::start(Arc::new(NullProcessPort));
			scanner.arm_for_drive(host.as_ref(), &drive);
			for _ in 0..seconds {
				if cancel.is_cancelled() {
					return Err(OpError::Cancelled.into());
				}
				let (mask, entries) =
					scanner.get_blocking(Duration::from_secs(2), 0x7, true);
				if entries.is_empty() {
					info!("No processes are blocking the device.");
				} else {
					warn!("The following application(s) or service(s) are accessing the drive:");
					for entry in &entries {
						warn!(
							"* [{}] {} ({})",
							entry.pid,
							entry.cmdline,
							access_string(entry.access)
						);
					}
					warn!("Combined access mask: {:#x}", mask);
				}
				thread::sleep(Duration::from_secs(1));
			}
		}
	}
	Ok(())
}

fn access_string(access: u8) -> &'static str {
	const NAMES: [&str; 8] = ["n", "r", "w", "rw", "x", "rx", "wx", "rwx"];
	NAMES[(access & 0x7) as usize]
}

fn list_drives(drives: &[DriveInfo], paths: &[PathBuf], format: ListFormat) {
	let path_of = |drive: &DriveInfo| {
		paths
			.get(drive.index as usize - 1)
			.map(|p| p.display().to_string())
			.unwrap_or_else(|| drive.physical_path.clone())
	};
	match format {
		ListFormat::Pretty => {
			println!(
				"{:>2} {:<40} {:>10} {:<5} {:>5} Class",
				"#", "Target", "Size", "Style", "Score"
			);
			println!("{}", "=".repeat(80));
			for drive in drives {
				println!(
					"{:>2} {:<40} {:>10} {:<5} {:>5} {}",
					drive.index,
					path_of(drive),
					size_to_human_readable(drive.size),
					drive.style.to_string(),
					drive.score,
					if drive.looks_like_hdd() {
						"USB HDD"
					} else {
						"Flash Drive"
					}
				);
			}
		}
		ListFormat::Simple => {
			for drive in drives {
				println!(
					"{}\t{}\t{}\t{}\t{}",
					drive.index,
					path_of(drive),
					drive.size,
					drive.style,
					drive.score
				);
			}
		}
		ListFormat::Json => {
			let out: Vec<serde_json::Value> = drives
				.iter()
				.map(|drive| {
					serde_json::json!({
						"index": drive.index,
						"target": path_of(drive),
						"physical_path": drive.physical_path.clone(),
						"size": drive.size,
						"sector_size": drive.sector_size,
						"style": drive.style.to_string(),
						"super_floppy": drive.super_floppy,
						"uefi_marker": drive.has_uefi_marker,
						"protective_mbr": drive.has_protective_mbr,
						"disk_guid": drive.disk_guid.map(|g| g.to_string()),
						"first_data_sector": drive.first_data_sector,
						"num_partitions": drive.num_partitions,
						"score": drive.score,
						"looks_like_hdd": drive.looks_like_hdd(),
						"partitions": drive.partitions.iter().map(|p| {
							serde_json::json!({
								"offset": p.offset,
								"size": p.size,
								"type": p.tag.to_string(),
								"name": p.name.clone(),
								"fs": p.fs.to_string(),
							})
						}).collect::<Vec<_>>(),
					})
				})
				.collect();
			println!(
				"{}",
				serde_json::to_string_pretty(&out).unwrap_or_else(|_| "[]".to_string())
			);
		}
	}
}

fn inspect_drive(registry: &Registry, drive: &DriveInfo) -> Result<()> {
	info!(
		"Device {}: {} ({} bytes per sector), {} partition table",
		drive.index,
		size_to_human_readable(drive.size),
		drive.sector_size,
		drive.style
	);
	if drive.super_floppy {
		info!("Layout: super floppy ({} at offset 0)", drive.partitions[0].fs);
	}
	let letters = registry.drive_letters(drive.index);
	if !letters.is_empty() {
		info!("Mounted letters: {:?}", letters);
	}
	let mut disk = registry.host().open_disk(drive.index, false)?;
	bootrec::analyze_mbr(disk.as_mut(), "Drive")?;
	for (i, part) in drive.partitions.iter().enumerate() {
		info!(
			"Partition {}{}: type {}, size {} ({} bytes), start sector {}, boot: {}, file system {}",
			i + 1,
			if part.uefi_ntfs { " (UEFI:NTFS)" } else { "" },
			part.tag,
			size_to_human_readable(part.size),
			part.size,
			part.offset / drive.sector_size as u64,
			if part.boot { "Yes" } else { "No" },
			part.fs
		);
		if !part.name.is_empty() {
			info!("  Name: '{}'", part.name);
		}
		if let Some(volume) = &part.volume_name {
			info!("  Volume: {}", volume);
		}
		let mut window = SectorWindow::new(disk.as_mut(), part.offset);
		bootrec::analyze_pbr(&mut window)?;
	}
	if !drive.has_mountable_partition() {
		info!("No partition on this drive can be mounted by the OS");
	}
	if drive.style == PartitionStyle::Gpt && registry.is_dev_drive(drive)? {
		info!("This drive is a Microsoft Dev Drive");
	}
	Ok(())
}

/// Install the requested MBR flavor and the matching PBR on the freshly
/// written layout.
fn write_boot_records(
	registry: &Registry,
	layout: &plan::LayoutPlan,
	boot_record: Option<bootrec::MbrFlavor>,
	cancel: &CancelToken,
) -> Result<()> {
	if cancel.is_cancelled() {
		return Err(OpError::Cancelled.into());
	}
	let pbr = match layout.fs {
		TargetFs::Fat16 => Some(PbrFlavor::Fat16),
		TargetFs::Fat32 => Some(PbrFlavor::Fat32),
		TargetFs::Ntfs => Some(PbrFlavor::Ntfs),
		_ => None,
	};
	if boot_record.is_none() && pbr.is_none() {
		return Ok(());
	}
	let mut disk = registry.host().open_disk(1, true)?;
	if let Some(flavor) = boot_record {
		if layout.style != PlanStyle::Mbr {
			warn!("Skipping the {} boot record on a non-MBR layout", flavor);
		} else {
			info!("Writing {} Master Boot Record...", flavor);
			bootrec::write_mbr(disk.as_mut(), flavor, layout.sector_size)?;
		}
	}
	if let (Some(flavor), Some(main)) = (pbr, layout.main) {
		info!("Writing {} Partition Boot Record...", flavor);
		let offset = layout.partitions[main].offset;
		let mut window = SectorWindow::new(disk.as_mut(), offset);
		bootrec::write_pbr(&mut window, flavor, false, layout.sector_size)?;
	}
	disk.sync()?;
	Ok(())
}
