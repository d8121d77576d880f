// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Shared memory record exchanged with the curve editor.
//!
//! The control process owns the segment and is the only writer of the
//! telemetry fields. The editor writes curve parameters and then raises
//! `write_sync`; the control loop imports the parameters and lowers the
//! flag again. Every field is an individual atomic; there are no
//! cross-field transactions, so the flag is the only synchronization point.
//!
//! Field order and widths are shared with external editors and must not
//! change.

use crate::curve::{CURVE_POINTS, CurveParameters};
use crate::domain::Domain;
use crate::error::{FanError, Result};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

/// Default segment name.
pub const DEFAULT_SHM_NAME: &str = "ecfan";

/// Directory backing POSIX shared memory objects on Linux.
const SHM_DIR: &str = "/dev/shm";

/// Size of [`SharedSnapshot`] in bytes.
pub const SNAPSHOT_SIZE: usize = std::mem::size_of::<SharedSnapshot>();

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// The shared record. Per-domain arrays are indexed by [`Domain::index`],
/// which reproduces the flat `cpu..., gpu...` field order.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedSnapshot {
    /// Filtered temperatures, stored as `f64` bit patterns
    temperatures: [AtomicU64; 2],
    /// Current duty outputs
    fan_speeds: [AtomicI32; 2],
    hysteresis: [AtomicI32; 2],
    /// Interior breakpoint temperatures (points 2-4)
    breakpoints: [[AtomicI32; CURVE_POINTS - 2]; 2],
    /// Duty points 1-5
    duties: [[AtomicI32; CURVE_POINTS]; 2],
    write_sync: AtomicBool,
}

const_assert_eq!(SNAPSHOT_SIZE, 104);

/// Live readings for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub temperature: f64,
    pub duty: i32,
}

impl SharedSnapshot {
    pub fn telemetry(&self, domain: Domain) -> Telemetry {
        let i = domain.index();
        Telemetry {
            temperature: f64::from_bits(self.temperatures[i].load(Ordering::Acquire)),
            duty: self.fan_speeds[i].load(Ordering::Acquire),
        }
    }

    /// Control loop only.
    pub fn publish_telemetry(&self, domain: Domain, temperature: f64, duty: i32) {
        let i = domain.index();
        self.temperatures[i].store(temperature.to_bits(), Ordering::Release);
        self.fan_speeds[i].store(duty, Ordering::Release);
    }

    pub fn load_parameters(&self, domain: Domain) -> CurveParameters {
        let i = domain.index();
        CurveParameters {
            hysteresis: self.hysteresis[i].load(Ordering::Acquire),
            breakpoints: load_all(&self.breakpoints[i]),
            duties: load_all(&self.duties[i]),
        }
    }

    pub fn store_parameters(&self, domain: Domain, params: &CurveParameters) {
        let i = domain.index();
        self.hysteresis[i].store(params.hysteresis, Ordering::Release);
        store_all(&self.breakpoints[i], &params.breakpoints);
        store_all(&self.duties[i], &params.duties);
    }

    pub fn sync_requested(&self) -> bool {
        self.write_sync.load(Ordering::Acquire)
    }

    /// Acknowledge a sync request. Control loop only.
    pub fn clear_sync(&self) {
        self.write_sync.store(false, Ordering::Release);
    }

    /// Editor side of the handshake: write one domain's parameters and raise
    /// the sync flag.
    ///
    /// Returns `false` without touching anything while a previous request
    /// is still pending.
    pub fn submit_parameters(&self, domain: Domain, params: &CurveParameters) -> bool {
        if self.sync_requested() {
            return false;
        }
        self.store_parameters(domain, params);
        self.write_sync.store(true, Ordering::Release);
        true
    }
}

fn load_all<const N: usize>(fields: &[AtomicI32; N]) -> [i32; N] {
    std::array::from_fn(|i| fields[i].load(Ordering::Acquire))
}

fn store_all<const N: usize>(fields: &[AtomicI32; N], values: &[i32; N]) {
    for (field, &value) in fields.iter().zip(values) {
        field.store(value, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Resolve a segment name to its backing file.
pub fn shm_path(name: &str) -> PathBuf {
    Path::new(SHM_DIR).join(name)
}

/// A mapped [`SharedSnapshot`].
///
/// The creating process owns the backing file and removes it on drop;
/// attached processes only unmap.
pub struct SharedRegion {
    _map: MmapMut,
    snapshot: NonNull<SharedSnapshot>,
    path: PathBuf,
    owner: bool,
    /// Held by the owner until after the file is unlinked in `drop`
    _lock: Option<Flock<File>>,
}

impl SharedRegion {
    /// Create (or reset) the segment at `path` and map it zeroed.
    ///
    /// The owner holds an exclusive `flock` on the backing file for its
    /// lifetime, so a second control process fails here instead of zeroing
    /// a live record. A leftover file with no lock holder is reused.
    pub fn create(path: &Path) -> Result<Self> {
        let map_err = |source| FanError::SharedMemory {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(map_err)?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                map_err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "segment is held by another running daemon",
                ))
            } else {
                map_err(io::Error::from(errno))
            }
        })?;

        // Zero any stale contents now that the segment is ours
        lock.set_len(0).map_err(map_err)?;
        lock.set_len(SNAPSHOT_SIZE as u64).map_err(map_err)?;

        // Editors typically run unprivileged
        fs::set_permissions(path, fs::Permissions::from_mode(0o666)).map_err(map_err)?;

        let map = unsafe { MmapOptions::new().len(SNAPSHOT_SIZE).map_mut(&*lock) }.map_err(map_err)?;
        log::info!("Created shared segment {}", path.display());
        Ok(Self::from_map(map, path, Some(lock)))
    }

    /// Attach to a segment created by the control process.
    pub fn open(path: &Path) -> Result<Self> {
        let map_err = |source| FanError::SharedMemory {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(map_err)?;
        let len = file.metadata().map_err(map_err)?.len();
        if len < SNAPSHOT_SIZE as u64 {
            return Err(map_err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment is {len} bytes, expected {SNAPSHOT_SIZE}"),
            )));
        }

        let map = unsafe { MmapOptions::new().len(SNAPSHOT_SIZE).map_mut(&file) }.map_err(map_err)?;
        Ok(Self::from_map(map, path, None))
    }

    fn from_map(mut map: MmapMut, path: &Path, lock: Option<Flock<File>>) -> Self {
        // mmap returns page-aligned memory, which satisfies the 8-byte
        // alignment of the record, and the mapping is SNAPSHOT_SIZE long.
        let snapshot = NonNull::from(&mut map[..]).cast::<SharedSnapshot>();
        Self {
            _map: map,
            snapshot,
            path: path.to_path_buf(),
            owner: lock.is_some(),
            _lock: lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for SharedRegion {
    type Target = SharedSnapshot;

    fn deref(&self) -> &SharedSnapshot {
        // SAFETY: the pointer targets the start of a live mapping of
        // SNAPSHOT_SIZE bytes owned by `self`; every field is an atomic, so
        // concurrent access from other processes is sound and an all-zero
        // mapping is a valid value.
        unsafe { self.snapshot.as_ref() }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("Failed to remove shared segment {}: {e}", self.path.display());
            } else {
                log::info!("Released shared segment {}", self.path.display());
            }
        }
    }
}
