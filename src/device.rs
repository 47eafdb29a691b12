//! Device database: per-device serial and clock defaults.
use std::{path::Path, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::variant::{BindOptions, Family};

/// One entry of the database. Every key is optional, missing keys come from
/// the `default` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(default)]
    pub name: String,
    pub port: Option<String>,
    pub speed: Option<u32>,
    pub clock: Option<u32>,
    pub multipliers: Option<Vec<u8>>,
    #[serde(default, deserialize_with = "parse_id_code")]
    pub id: Option<[u8; 16]>,
    /// Microseconds
    pub erase_page_wait: Option<u64>,
    /// Microseconds
    pub write_page_wait: Option<u64>,
}

/// Fully resolved settings for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub family: Family,
    pub port: String,
    pub speed: u32,
    pub clock: u32,
    pub multipliers: Vec<u8>,
    pub id: Option<[u8; 16]>,
    pub erase_page_wait: Duration,
    pub write_page_wait: Duration,
}

impl ::std::fmt::Display for Device {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{}({}, {} Hz x{:?}, {} baud)",
            self.name, self.family, self.clock, self.multipliers, self.speed
        )
    }
}

impl Device {
    pub fn to_bind_options(&self) -> BindOptions {
        BindOptions {
            clock: self.clock,
            multipliers: self.multipliers.clone(),
            speed: self.speed,
            id: self.id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceDB {
    #[serde(default)]
    default: DeviceEntry,
    #[serde(default)]
    devices: Vec<DeviceEntry>,
}

impl DeviceDB {
    /// Database shipped with the tool.
    pub fn load() -> Result<Self> {
        Ok(serde_yaml::from_str(include_str!("../devices/rx.yaml"))?)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::format_err!("cannot read {}: {}", path.display(), e))?;
        let db: DeviceDB = serde_yaml::from_str(&text)?;
        log::debug!(
            "Loaded {} device entries from {}",
            db.devices.len(),
            path.display()
        );
        Ok(db)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(|d| d.name.as_str())
    }

    /// Look up `name` case-insensitively. Names without an entry still
    /// resolve from the defaults when their family is known.
    pub fn find(&self, name: &str) -> Result<Device> {
        let family = Family::from_device_name(name)
            .ok_or_else(|| anyhow::format_err!("Device {} is not an RX family part", name))?;
        let entry = match self
            .devices
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name.trim()))
        {
            Some(entry) => entry.clone(),
            None => {
                log::warn!("Device {} not in database, using defaults", name);
                DeviceEntry::default()
            }
        };

        let default = &self.default;
        let device = Device {
            name: name.trim().to_ascii_uppercase(),
            family,
            port: entry
                .port
                .or_else(|| default.port.clone())
                .unwrap_or_else(|| "/dev/ttyUSB0".to_string()),
            speed: entry
                .speed
                .or(default.speed)
                .unwrap_or(crate::constants::INITIAL_BAUD),
            clock: entry
                .clock
                .or(default.clock)
                .ok_or_else(|| anyhow::format_err!("No input clock configured for {}", name))?,
            multipliers: entry
                .multipliers
                .or_else(|| default.multipliers.clone())
                .ok_or_else(|| anyhow::format_err!("No multipliers configured for {}", name))?,
            id: entry.id.or(default.id),
            erase_page_wait: Duration::from_micros(
                entry.erase_page_wait.or(default.erase_page_wait).unwrap_or(0),
            ),
            write_page_wait: Duration::from_micros(
                entry.write_page_wait.or(default.write_page_wait).unwrap_or(0),
            ),
        };
        log::debug!("Device settings: {}", device);
        Ok(device)
    }
}

/// Parse an ID code given as 32 hex digits, optionally `0x` prefixed.
pub fn parse_id(s: &str) -> Result<[u8; 16]> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let raw = hex::decode(s)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| anyhow::format_err!("ID code must be 16 bytes, got {}", raw.len()))
}

fn parse_id_code<'de, D>(deserializer: D) -> std::result::Result<Option<[u8; 16]>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    s.map(|s| parse_id(&s).map_err(serde::de::Error::custom))
        .transpose()
}
