//! Small persistent key-value store.
//!
//! Currently only the ESP-toggle GUID slots live here, so the toggle
//! operation can be reversed exactly across runs.

use std::{
	fs,
	path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of remembered ESP toggles. When all slots are taken the oldest
/// one is evicted.
pub const MAX_ESP_TOGGLE: usize = 8;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsData {
	/// `ToggleEsp` slots; an empty string marks a free slot.
	#[serde(default)]
	toggle_esp: Vec<String>,
}

pub struct Settings {
	path: Option<PathBuf>,
	data: SettingsData,
}

impl Settings {
	/// Load the store, starting fresh when the file does not exist yet.
	pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
		let path = path.as_ref();
		let data = if path.exists() {
			let content = fs::read_to_string(path)
				.context(format!("Unable to read settings file '{}'", path.display()))?;
			toml::from_str(&content).context(format!(
				"Unable to parse settings file '{}'",
				path.display()
			))?
		} else {
			SettingsData::default()
		};
		let mut settings = Settings {
			path: Some(path.to_path_buf()),
			data,
		};
		settings.data.toggle_esp.resize(MAX_ESP_TOGGLE, String::new());
		Ok(settings)
	}

	/// Store that never touches the disk.
	pub fn ephemeral() -> Self {
		Settings {
			path: None,
			data: SettingsData {
				toggle_esp: vec![String::new(); MAX_ESP_TOGGLE],
			},
		}
	}

	fn save(&self) -> Result<()> {
		let Some(path) = &self.path else {
			return Ok(());
		};
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		let content = toml::to_string_pretty(&self.data)?;
		fs::write(path, content)
			.context(format!("Unable to write settings file '{}'", path.display()))?;
		Ok(())
	}

	/// Remember a toggled-away ESP. Uses the first free slot; when all are
	/// taken, every slot moves down and the new entry takes the last one.
	pub fn store_esp_guid(&mut self, guid: &Uuid) -> Result<()> {
		let text = guid.to_string();
		match self.data.toggle_esp.iter().position(|s| s.is_empty()) {
			Some(free) => self.data.toggle_esp[free] = text,
			None => {
				debug!("All ESP toggle slots used, evicting the first one");
				self.data.toggle_esp.remove(0);
				self.data.toggle_esp.push(text);
			}
		}
		self.save()
	}

	pub fn esp_guid(&self, slot: usize) -> Option<Uuid> {
		self.data
			.toggle_esp
			.get(slot)
			.filter(|s| !s.is_empty())
			.and_then(|s| Uuid::parse_str(s).ok())
	}

	pub fn clear_esp_guid(&mut self, slot: usize) -> Result<()> {
		if let Some(entry) = self.data.toggle_esp.get_mut(slot) {
			entry.clear();
		}
		self.save()
	}

	/// Slot index holding `guid`, if remembered.
	pub fn find_esp_guid(&self, guid: &Uuid) -> Option<usize> {
		(0..MAX_ESP_TOGGLE).find(|slot| self.esp_guid(*slot) == Some(*guid))
	}
}
