// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error types shared by the library.
//!
//! Sensor faults are deliberately absent: implausible readings are recovered
//! inside the control loop and never propagate.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FanError>;

#[derive(Error, Debug)]
pub enum FanError {
    /// The EC input buffer never drained within the retry bound.
    #[error("EC input buffer still busy after {attempts} polls")]
    HardwareTimeout { attempts: u32 },

    /// Raw port access failed (usually missing privileges on `/dev/port`).
    #[error("EC port I/O failed: {0}")]
    PortIo(#[from] io::Error),

    /// Malformed curve or configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Settings file could not be read or written.
    #[error("Settings file {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Shared memory segment could not be created, sized or mapped.
    #[error("Shared memory segment {}: {source}", path.display())]
    SharedMemory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The host is not on the supported-model allow-list.
    #[error("Unsupported system: {vendor} {product}")]
    UnsupportedHardware { vendor: String, product: String },
}

impl FanError {
    /// Whether the control loop must stop when it sees this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FanError::HardwareTimeout { .. } | FanError::PortIo(_))
    }
}
