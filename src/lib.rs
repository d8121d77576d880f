// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Embedded-controller fan control.
//!
//! The daemon reads CPU/GPU temperatures from the laptop EC, evaluates a
//! five-point fan curve per domain with smoothing and hysteresis, writes the
//! resulting duty back to the EC, and shares live state with an editor
//! process through a fixed-layout shared memory record.

pub mod config;
pub mod control;
pub mod curve;
pub mod domain;
pub mod ec;
pub mod error;
pub mod filter;
pub mod platform;
pub mod settings;
pub mod shm;

pub use error::{FanError, Result};
