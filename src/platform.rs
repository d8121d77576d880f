// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Host model detection.
//!
//! The EC register map is hard-wired, so the daemon only runs on models
//! listed in the configuration. Identification uses the DMI strings the
//! kernel exposes under `/sys/class/dmi/id/`.

use crate::config::PlatformConfig;
use crate::error::{FanError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const DMI_ROOT: &str = "/sys/class/dmi/id";

/// Vendor and product reported by the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub vendor: String,
    pub product: String,
}

/// Read the host's DMI identity.
pub fn read_host_identity() -> HostIdentity {
    read_identity_from(Path::new(DMI_ROOT))
}

/// Read DMI identity from an alternate sysfs root. Missing entries read as
/// `"Unknown"`.
pub fn read_identity_from(root: &Path) -> HostIdentity {
    HostIdentity {
        vendor: read_trimmed(&root.join("sys_vendor")).unwrap_or_else(unknown),
        product: read_trimmed(&root.join("product_name")).unwrap_or_else(unknown),
    }
}

/// Pre-flight check: is `host` on the allow-list?
pub fn check_supported(config: &PlatformConfig, host: &HostIdentity) -> Result<()> {
    if !config.check_model {
        log::info!("Model check disabled; running on {} {}", host.vendor, host.product);
        return Ok(());
    }

    let supported = config
        .supported
        .iter()
        .any(|m| m.vendor == host.vendor && m.product == host.product);

    if supported {
        log::info!("Detected supported system: {} {}", host.vendor, host.product);
        Ok(())
    } else {
        Err(FanError::UnsupportedHardware {
            vendor: host.vendor.clone(),
            product: host.product.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn unknown() -> String {
    "Unknown".to_string()
}
