// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Embedded controller register access.
//!
//! The EC is driven through two 8-bit I/O ports using the standard ACPI
//! handshake: every byte sent to the controller waits for the input buffer
//! full (IBF) bit of the status port to clear first. The controller is slow,
//! so each transaction ends with a fixed settle delay.

use crate::error::{FanError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::thread;
use std::time::Duration;

/// Data port.
pub const EC_DATA_PORT: u16 = 0x62;
/// Command (write) / status (read) port.
pub const EC_COMMAND_PORT: u16 = 0x66;
/// Read-register opcode.
pub const EC_READ_CMD: u8 = 0x80;
/// Write-register opcode.
pub const EC_WRITE_CMD: u8 = 0x81;
/// Input buffer full bit of the status register.
pub const EC_STATUS_IBF: u8 = 0x02;

const DEV_PORT: &str = "/dev/port";

// ---------------------------------------------------------------------------
// Register map
// ---------------------------------------------------------------------------

/// Fixed register set for one thermal domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainRegisters {
    /// Fan mode selector register
    pub fan_mode: u8,
    /// Value selecting manual duty control
    pub fan_mode_manual: u8,
    /// Value handing the fan back to EC firmware
    pub fan_mode_auto: u8,
    /// Duty register (0-100)
    pub fan_speed: u8,
    /// Temperature register (whole degrees C)
    pub temperature: u8,
}

pub const CPU_REGISTERS: DomainRegisters = DomainRegisters {
    fan_mode: 34,
    fan_mode_manual: 0x0c,
    fan_mode_auto: 0x04,
    fan_speed: 55,
    temperature: 176,
};

pub const GPU_REGISTERS: DomainRegisters = DomainRegisters {
    fan_mode: 33,
    fan_mode_manual: 0x30,
    fan_mode_auto: 0x10,
    fan_speed: 58,
    temperature: 180,
};

// ---------------------------------------------------------------------------
// Port access
// ---------------------------------------------------------------------------

/// Raw 8-bit port I/O.
pub trait PortIo {
    fn read_port(&mut self, port: u16) -> io::Result<u8>;
    fn write_port(&mut self, port: u16, value: u8) -> io::Result<()>;
}

/// Port I/O through the kernel's `/dev/port` device. Requires root.
#[derive(Debug)]
pub struct DevPort {
    file: File,
}

impl DevPort {
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(DEV_PORT)?;
        Ok(Self { file })
    }
}

impl PortIo for DevPort {
    fn read_port(&mut self, port: u16) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact_at(&mut buf, u64::from(port))?;
        Ok(buf[0])
    }

    fn write_port(&mut self, port: u16, value: u8) -> io::Result<()> {
        self.file.write_all_at(&[value], u64::from(port))
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Handshake bounds and settle delays.
///
/// `Default` is the timing the hardware needs. Shorter values are only
/// meant for simulated controllers.
#[derive(Debug, Clone, Copy)]
pub struct EcTiming {
    pub busy_poll_attempts: u32,
    pub busy_poll_interval: Duration,
    pub write_settle: Duration,
    pub read_delay: Duration,
    pub read_settle: Duration,
}

impl Default for EcTiming {
    fn default() -> Self {
        Self {
            busy_poll_attempts: 100,
            busy_poll_interval: Duration::from_millis(10),
            write_settle: Duration::from_millis(50),
            read_delay: Duration::from_millis(10),
            read_settle: Duration::from_millis(40),
        }
    }
}

impl EcTiming {
    /// No delays at all, for simulated controllers.
    pub fn immediate() -> Self {
        Self {
            busy_poll_attempts: 100,
            busy_poll_interval: Duration::ZERO,
            write_settle: Duration::ZERO,
            read_delay: Duration::ZERO,
            read_settle: Duration::ZERO,
        }
    }
}

/// Register-level access to an embedded controller.
pub trait EmbeddedController {
    fn read(&mut self, register: u8) -> Result<u8>;
    fn write(&mut self, register: u8, value: u8) -> Result<()>;

    /// Read a domain's temperature register in whole degrees.
    fn read_temperature(&mut self, regs: &DomainRegisters) -> Result<f64> {
        self.read(regs.temperature).map(f64::from)
    }

    /// Switch a domain's fan to manual control and set its duty.
    fn set_fan_manual(&mut self, regs: &DomainRegisters, duty: u8) -> Result<()> {
        self.write(regs.fan_mode, regs.fan_mode_manual)?;
        self.write(regs.fan_speed, duty)
    }

    /// Hand a domain's fan back to the EC firmware.
    fn set_fan_auto(&mut self, regs: &DomainRegisters) -> Result<()> {
        self.write(regs.fan_mode, regs.fan_mode_auto)
    }
}

/// EC command channel over a [`PortIo`] backend.
pub struct EcChannel<P: PortIo> {
    io: P,
    timing: EcTiming,
}

impl<P: PortIo> EcChannel<P> {
    pub fn new(io: P) -> Self {
        Self::with_timing(io, EcTiming::default())
    }

    pub fn with_timing(io: P, timing: EcTiming) -> Self {
        Self { io, timing }
    }

    /// Poll the IBF bit until it clears, bounded by the retry count.
    fn wait_ready(&mut self) -> Result<()> {
        for attempt in 0..self.timing.busy_poll_attempts {
            if self.io.read_port(EC_COMMAND_PORT)? & EC_STATUS_IBF == 0 {
                return Ok(());
            }
            if attempt + 1 < self.timing.busy_poll_attempts {
                pause(self.timing.busy_poll_interval);
            }
        }
        Err(FanError::HardwareTimeout {
            attempts: self.timing.busy_poll_attempts,
        })
    }

    fn send_command(&mut self, opcode: u8, register: u8) -> Result<()> {
        self.wait_ready()?;
        self.io.write_port(EC_COMMAND_PORT, opcode)?;
        self.wait_ready()?;
        self.io.write_port(EC_DATA_PORT, register)?;
        self.wait_ready()
    }

    #[cfg(test)]
    fn io(&self) -> &P {
        &self.io
    }
}

impl<P: PortIo> EmbeddedController for EcChannel<P> {
    fn read(&mut self, register: u8) -> Result<u8> {
        self.send_command(EC_READ_CMD, register)?;
        pause(self.timing.read_delay);
        let value = self.io.read_port(EC_DATA_PORT)?;
        pause(self.timing.read_settle);
        log::trace!("EC read  reg {register:#04x} = {value:#04x}");
        Ok(value)
    }

    fn write(&mut self, register: u8, value: u8) -> Result<()> {
        self.send_command(EC_WRITE_CMD, register)?;
        self.io.write_port(EC_DATA_PORT, value)?;
        pause(self.timing.write_settle);
        log::trace!("EC write reg {register:#04x} = {value:#04x}");
        Ok(())
    }
}

fn pause(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}
