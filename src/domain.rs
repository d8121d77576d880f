// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Thermal domains.
//!
//! CPU and GPU are controlled identically; a [`Domain`] picks the EC
//! register set and the slot in the shared snapshot.

use crate::ec::{self, DomainRegisters};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Cpu,
    Gpu,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Cpu, Domain::Gpu];

    /// Slot of this domain in per-domain arrays.
    pub fn index(self) -> usize {
        match self {
            Domain::Cpu => 0,
            Domain::Gpu => 1,
        }
    }

    pub fn registers(self) -> &'static DomainRegisters {
        match self {
            Domain::Cpu => &ec::CPU_REGISTERS,
            Domain::Gpu => &ec::GPU_REGISTERS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Domain::Cpu => "cpu",
            Domain::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Domain::Cpu),
            "gpu" => Ok(Domain::Gpu),
            other => Err(format!("unknown domain '{other}' (expected cpu or gpu)")),
        }
    }
}
