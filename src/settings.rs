// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Persisted settings record.
//!
//! A flat little-endian bincode record of the shared snapshot minus the
//! sync flag: two `f64` temperatures, then twenty `i32` fields (duties,
//! hysteresis, breakpoints, duty points) in shared-memory order. Storage failures never
//! stop the control loop; the first one is reported as a warning.

use crate::curve::{CurveEngine, CurveParameters};
use crate::domain::Domain;
use crate::error::{FanError, Result};
use crate::shm::SharedSnapshot;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default settings file location.
pub const DEFAULT_SETTINGS_PATH: &str = "/var/lib/ecfan/fanctrl_settings.dat";

/// Encoded record length in bytes.
pub const SETTINGS_RECORD_LEN: usize = 2 * 8 + 20 * 4;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Everything that survives a restart, indexed by [`Domain::index`].
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsRecord {
    pub temperatures: [f64; 2],
    pub fan_speeds: [i32; 2],
    pub parameters: [CurveParameters; 2],
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self {
            temperatures: [0.0; 2],
            fan_speeds: [0; 2],
            parameters: Domain::ALL.map(CurveParameters::defaults),
        }
    }
}

impl SettingsRecord {
    /// Capture the current snapshot.
    pub fn from_snapshot(shared: &SharedSnapshot) -> Self {
        let telemetry = Domain::ALL.map(|d| shared.telemetry(d));
        Self {
            temperatures: telemetry.map(|t| t.temperature),
            fan_speeds: telemetry.map(|t| t.duty),
            parameters: Domain::ALL.map(|d| shared.load_parameters(d)),
        }
    }

    /// Seed the snapshot from this record and lower the sync flag.
    pub fn apply_to(&self, shared: &SharedSnapshot) {
        for domain in Domain::ALL {
            let i = domain.index();
            shared.publish_telemetry(domain, self.temperatures[i], self.fan_speeds[i]);
            shared.store_parameters(domain, &self.parameters[i]);
        }
        shared.clear_sync();
    }

    /// Encode to the fixed 96-byte layout.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        bincode::serialize(&SettingsWire::from(self)).map_err(into_io)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < SETTINGS_RECORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "settings record is {} bytes, expected {SETTINGS_RECORD_LEN}",
                    bytes.len()
                ),
            ));
        }
        let wire: SettingsWire = bincode::deserialize(bytes).map_err(into_io)?;
        Ok(wire.into())
    }

    /// Reject parameter sets the curve engine would refuse.
    pub fn validate(&self) -> Result<()> {
        for domain in Domain::ALL {
            CurveEngine::from_parameters(domain, &self.parameters[domain.index()])?;
        }
        Ok(())
    }
}

/// On-disk field order. bincode writes fixed arrays without a length
/// prefix, so this is exactly the flat shared-memory order.
#[derive(Serialize, Deserialize)]
struct SettingsWire {
    temperatures: [f64; 2],
    fan_speeds: [i32; 2],
    hysteresis: [i32; 2],
    breakpoints: [[i32; 3]; 2],
    duties: [[i32; 5]; 2],
}

impl From<&SettingsRecord> for SettingsWire {
    fn from(record: &SettingsRecord) -> Self {
        let p = &record.parameters;
        Self {
            temperatures: record.temperatures,
            fan_speeds: record.fan_speeds,
            hysteresis: p.map(|p| p.hysteresis),
            breakpoints: p.map(|p| p.breakpoints),
            duties: p.map(|p| p.duties),
        }
    }
}

impl From<SettingsWire> for SettingsRecord {
    fn from(wire: SettingsWire) -> Self {
        Self {
            temperatures: wire.temperatures,
            fan_speeds: wire.fan_speeds,
            parameters: Domain::ALL.map(|d| {
                let i = d.index();
                CurveParameters {
                    hysteresis: wire.hysteresis[i],
                    breakpoints: wire.breakpoints[i],
                    duties: wire.duties[i],
                }
            }),
        }
    }
}

fn into_io(err: bincode::Error) -> io::Error {
    match *err {
        bincode::ErrorKind::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Reads and writes the settings file, warning once on failure.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    warned: bool,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            warned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record; `Ok(None)` if the file does not exist.
    ///
    /// A record that decodes but holds a curve the engine would refuse is
    /// reported as invalid data.
    pub fn load(&self) -> Result<Option<SettingsRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.persistence_error(e)),
        };
        let record = SettingsRecord::decode(&bytes).map_err(|e| self.persistence_error(e))?;
        record.validate().map_err(|e| {
            self.persistence_error(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })?;
        Ok(Some(record))
    }

    /// Write the record, creating parent directories if needed.
    pub fn save(&self, record: &SettingsRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.persistence_error(e))?;
        }
        let bytes = record.encode().map_err(|e| self.persistence_error(e))?;
        fs::write(&self.path, bytes).map_err(|e| self.persistence_error(e))?;
        log::debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    /// Seed `shared` from the settings file.
    ///
    /// A missing file seeds the built-in defaults and writes them out
    /// immediately. An unreadable or invalid file seeds the defaults and is
    /// left untouched.
    pub fn load_or_seed(&mut self, shared: &SharedSnapshot) -> SettingsRecord {
        let record = match self.load() {
            Ok(Some(record)) => {
                log::info!("Loaded settings from {}", self.path.display());
                record
            }
            Ok(None) => {
                log::info!("No settings at {}, using defaults", self.path.display());
                let record = SettingsRecord::default();
                self.save_or_warn(&record);
                record
            }
            Err(e) => {
                self.warn_once(&e);
                SettingsRecord::default()
            }
        };
        record.apply_to(shared);
        record
    }

    /// Save, downgrading failure to a (one-time) warning.
    pub fn save_or_warn(&mut self, record: &SettingsRecord) -> bool {
        match self.save(record) {
            Ok(()) => true,
            Err(e) => {
                self.warn_once(&e);
                false
            }
        }
    }

    fn warn_once(&mut self, err: &FanError) {
        if self.warned {
            log::debug!("{err}");
        } else {
            log::warn!("{err}; continuing with in-memory settings");
            self.warned = true;
        }
    }

    fn persistence_error(&self, source: io::Error) -> FanError {
        FanError::Persistence {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SettingsRecord {
        SettingsRecord {
            temperatures: [61.5, 48.25],
            fan_speeds: [12, 7],
            parameters: [
                CurveParameters {
                    hysteresis: 2,
                    breakpoints: [50, 66, 81],
                    duties: [0, 10, 20, 50, 100],
                },
                CurveParameters {
                    hysteresis: 4,
                    breakpoints: [45, 60, 70],
                    duties: [5, 9, 15, 35, 90],
                },
            ],
        }
    }

    #[test]
    fn test_defaults() {
        let record = SettingsRecord::default();
        assert_eq!(record.parameters[0].breakpoints, [55, 70, 80]);
        assert_eq!(record.parameters[1].breakpoints, [50, 65, 75]);
        for p in &record.parameters {
            assert_eq!(p.hysteresis, 3);
            assert_eq!(p.duties, [0, 5, 8, 30, 100]);
        }
    }

    #[test]
    fn test_encoded_field_order() {
        let bytes = sample_record().encode().unwrap();
        assert_eq!(bytes.len(), SETTINGS_RECORD_LEN);
        assert_eq!(&bytes[0..8], &61.5f64.to_le_bytes());
        // cpu fan speed, gpu fan speed, cpu hysteresis, gpu hysteresis
        assert_eq!(&bytes[16..20], &12i32.to_le_bytes());
        assert_eq!(&bytes[20..24], &7i32.to_le_bytes());
        assert_eq!(&bytes[24..28], &2i32.to_le_bytes());
        assert_eq!(&bytes[28..32], &4i32.to_le_bytes());
        // first gpu breakpoint follows the three cpu breakpoints
        assert_eq!(&bytes[44..48], &45i32.to_le_bytes());
        // last gpu duty point closes the record
        assert_eq!(&bytes[92..96], &90i32.to_le_bytes());
    }

    #[test]
    fn test_decode_encoded() {
        let record = sample_record();
        assert_eq!(SettingsRecord::decode(&record.encode().unwrap()).unwrap(), record);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = sample_record().encode().unwrap();
        let err = SettingsRecord::decode(&bytes[..50]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_missing_file_seeds_and_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.dat");
        let mut store = SettingsStore::new(&path);
        let shared = SharedSnapshot::default();

        let record = store.load_or_seed(&shared);
        assert_eq!(record, SettingsRecord::default());
        assert!(path.exists());
        assert_eq!(shared.load_parameters(Domain::Gpu), CurveParameters::defaults(Domain::Gpu));
        assert_eq!(store.load().unwrap(), Some(SettingsRecord::default()));
    }

    #[test]
    fn test_existing_file_restores_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::new(dir.path().join("settings.dat"));
        store.save(&sample_record()).unwrap();

        let shared = SharedSnapshot::default();
        shared.submit_parameters(Domain::Cpu, &CurveParameters::defaults(Domain::Cpu));
        store.load_or_seed(&shared);

        assert_eq!(SettingsRecord::from_snapshot(&shared), sample_record());
        assert!(!shared.sync_requested());
    }

    #[test]
    fn test_corrupt_file_falls_back_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.dat");
        fs::write(&path, b"garbage").unwrap();

        let mut store = SettingsStore::new(&path);
        let record = store.load_or_seed(&SharedSnapshot::default());
        assert_eq!(record, SettingsRecord::default());
        assert_eq!(fs::read(&path).unwrap(), b"garbage");
    }

    #[test]
    fn test_invalid_contents_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.dat");
        // Decodes fine, but every duty reads as -1
        fs::write(&path, [0xFFu8; SETTINGS_RECORD_LEN]).unwrap();

        let mut store = SettingsStore::new(&path);
        assert!(matches!(store.load(), Err(FanError::Persistence { .. })));

        let shared = SharedSnapshot::default();
        let record = store.load_or_seed(&shared);
        assert_eq!(record, SettingsRecord::default());
        assert_eq!(shared.load_parameters(Domain::Cpu), CurveParameters::defaults(Domain::Cpu));
        assert_eq!(fs::read(&path).unwrap(), vec![0xFFu8; SETTINGS_RECORD_LEN]);
    }

    #[test]
    fn test_validate_rejects_bad_curve() {
        let mut record = sample_record();
        assert!(record.validate().is_ok());
        record.parameters[1].breakpoints = [60, 50, 70];
        assert!(matches!(record.validate(), Err(FanError::Configuration(_))));
    }

    #[test]
    fn test_unwritable_path_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let mut store = SettingsStore::new(blocker.join("settings.dat"));
        assert!(!store.save_or_warn(&sample_record()));
        assert!(!store.save_or_warn(&sample_record()));
        assert!(matches!(
            store.save(&sample_record()),
            Err(FanError::Persistence { .. })
        ));
    }
}
