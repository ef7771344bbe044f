//! Settings and loco persistence in NVS.
//!
//! | Namespace | Key | Value |
//! |-----------|-----|-------|
//! | `settings` | [`SettingKey::name`] | `u16` |
//! | `locos` | `index` | addresses as little endian `u16` blob |
//! | `locos` | `loco<addr>` | JSON document |

use std::sync::{Mutex, MutexGuard, PoisonError};

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::EspError;

use crate::config::SettingKey;
use crate::dcc::Loco;
use crate::error::TrackError;
use crate::traits::{LocoStore, SettingsStore};

/// Longest loco document.
const LOCO_JSON_SIZE: usize = 256;

/// Largest loco table.
const MAX_LOCOS: usize = 256;

const INDEX_KEY: &str = "index";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Settings
// ============================================================================

/// Settings in the `settings` namespace.
pub struct Esp32SettingsStore {
    nvs: EspNvs<NvsDefault>,
}

impl Esp32SettingsStore {
    /// Opens the namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace can't be opened.
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        Ok(Self {
            nvs: EspNvs::new(partition, "settings", true)?,
        })
    }
}

impl SettingsStore for Esp32SettingsStore {
    type Error = EspError;

    fn get(&self, key: SettingKey) -> Option<u16> {
        match self.nvs.get_u16(key.name()) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Can't read setting {}: {:?}", key.name(), e);
                None
            }
        }
    }

    fn set(&mut self, key: SettingKey, value: u16) -> Result<(), EspError> {
        self.nvs.set_u16(key.name(), value)
    }
}

// ============================================================================
// Locos
// ============================================================================

/// Loco table in the `locos` namespace, one JSON document per address.
pub struct Esp32LocoStore {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl Esp32LocoStore {
    /// Opens the namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace can't be opened.
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        Ok(Self {
            nvs: Mutex::new(EspNvs::new(partition, "locos", true)?),
        })
    }

    fn key(addr: u16) -> String {
        format!("loco{}", addr)
    }

    fn read_index(nvs: &EspNvs<NvsDefault>) -> Result<Vec<u16>, TrackError> {
        let mut buf = [0u8; MAX_LOCOS * 2];
        let blob = nvs
            .get_blob(INDEX_KEY, &mut buf)
            .map_err(TrackError::hardware)?
            .unwrap_or_default();
        Ok(blob
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect())
    }

    fn write_index(nvs: &mut EspNvs<NvsDefault>, index: &[u16]) -> Result<(), TrackError> {
        let blob: Vec<u8> = index.iter().flat_map(|addr| addr.to_le_bytes()).collect();
        nvs.set_blob(INDEX_KEY, &blob).map_err(TrackError::hardware)
    }
}

impl LocoStore for Esp32LocoStore {
    type Error = TrackError;

    fn load_all(&self) -> Result<Vec<(u16, Loco)>, TrackError> {
        let nvs = lock(&self.nvs);
        let mut locos = Vec::new();
        for addr in Self::read_index(&nvs)? {
            let mut buf = [0u8; LOCO_JSON_SIZE];
            let Some(json) = nvs
                .get_str(&Self::key(addr), &mut buf)
                .map_err(TrackError::hardware)?
            else {
                continue;
            };
            match Loco::from_json(json) {
                Ok(loco) => locos.push((addr, loco)),
                Err(e) => log::warn!("Dropping loco {}: {}", addr, e),
            }
        }
        Ok(locos)
    }

    fn set(&self, addr: u16, loco: &Loco) -> Result<(), TrackError> {
        let json = loco.to_json()?;
        let mut nvs = lock(&self.nvs);
        nvs.set_str(&Self::key(addr), &json)
            .map_err(TrackError::hardware)?;

        let mut index = Self::read_index(&nvs)?;
        if !index.contains(&addr) {
            if index.len() >= MAX_LOCOS {
                return Err(TrackError::QueueFull);
            }
            index.push(addr);
            Self::write_index(&mut nvs, &index)?;
        }
        Ok(())
    }

    fn erase(&self, addr: u16) -> Result<(), TrackError> {
        let mut nvs = lock(&self.nvs);
        nvs.remove(&Self::key(addr)).map_err(TrackError::hardware)?;
        let mut index = Self::read_index(&nvs)?;
        index.retain(|&a| a != addr);
        Self::write_index(&mut nvs, &index)
    }

    fn erase_all(&self) -> Result<(), TrackError> {
        let mut nvs = lock(&self.nvs);
        for addr in Self::read_index(&nvs)? {
            nvs.remove(&Self::key(addr)).map_err(TrackError::hardware)?;
        }
        Self::write_index(&mut nvs, &[])
    }
}
