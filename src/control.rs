// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The fan control loop.
//!
//! Each iteration samples both domains, evaluates their curves, writes any
//! duty that changed since the last write, publishes telemetry, sleeps, and
//! finally services a pending parameter sync from the editor. Shutdown is
//! cooperative: the flag is polled at the top of every iteration and
//! between sleep slices, so an in-flight EC transaction always completes.

use crate::config::DaemonConfig;
use crate::curve::CurveEngine;
use crate::domain::Domain;
use crate::ec::EmbeddedController;
use crate::error::Result;
use crate::settings::{SettingsRecord, SettingsStore};
use crate::shm::SharedSnapshot;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Re-reads allowed after an implausible sample.
pub const SENSOR_RETRIES: u32 = 3;
/// Readings above this are treated as sensor faults.
pub const MAX_PLAUSIBLE_TEMP: f64 = 110.0;
/// Temperature assumed when a sensor keeps faulting.
pub const FALLBACK_TEMP: f64 = 100.0;

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFault {
    /// Reading of exactly 0 C
    Zero,
    /// Reading above [`MAX_PLAUSIBLE_TEMP`]
    OutOfRange,
}

impl SensorFault {
    pub fn classify(raw: f64) -> Option<Self> {
        if raw == 0.0 {
            Some(SensorFault::Zero)
        } else if raw > MAX_PLAUSIBLE_TEMP {
            Some(SensorFault::OutOfRange)
        } else {
            None
        }
    }
}

/// Outcome of sampling one domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Valid(f64),
    /// Every attempt faulted; the caller should assume [`FALLBACK_TEMP`].
    Fallback(SensorFault),
}

/// Read a domain's temperature, re-reading implausible values up to
/// [`SENSOR_RETRIES`] times.
pub fn sample_temperature<E: EmbeddedController>(ec: &mut E, domain: Domain) -> Result<Sample> {
    let regs = domain.registers();
    let mut raw = ec.read_temperature(regs)?;
    for attempt in 1..=SENSOR_RETRIES {
        let Some(fault) = SensorFault::classify(raw) else {
            return Ok(Sample::Valid(raw));
        };
        log::debug!("{domain}: implausible reading {raw} ({fault:?}), retry {attempt}");
        raw = ec.read_temperature(regs)?;
    }
    Ok(match SensorFault::classify(raw) {
        None => Sample::Valid(raw),
        Some(fault) => Sample::Fallback(fault),
    })
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    ShuttingDown,
}

/// Timing and exit behaviour of the loop.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub poll_interval: Duration,
    pub sleep_slice: Duration,
    pub restore_auto_on_exit: bool,
}

impl From<&DaemonConfig> for LoopOptions {
    fn from(cfg: &DaemonConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            sleep_slice: cfg.sleep_slice(),
            restore_auto_on_exit: cfg.restore_auto_on_exit,
        }
    }
}

pub struct ControlLoop<'a, E: EmbeddedController> {
    ec: E,
    shared: &'a SharedSnapshot,
    store: SettingsStore,
    /// Indexed by `Domain::index`
    engines: [CurveEngine; 2],
    last_written: [Option<i32>; 2],
    shutdown: Arc<AtomicBool>,
    options: LoopOptions,
    state: LoopState,
}

impl<'a, E: EmbeddedController> ControlLoop<'a, E> {
    /// Build both curve engines from the parameters currently in `shared`.
    ///
    /// Fails with a configuration error if either curve is malformed.
    pub fn new(
        ec: E,
        shared: &'a SharedSnapshot,
        store: SettingsStore,
        shutdown: Arc<AtomicBool>,
        options: LoopOptions,
    ) -> Result<Self> {
        let engines = [
            CurveEngine::from_parameters(Domain::Cpu, &shared.load_parameters(Domain::Cpu))?,
            CurveEngine::from_parameters(Domain::Gpu, &shared.load_parameters(Domain::Gpu))?,
        ];
        for engine in &engines {
            engine.export_parameters(shared);
        }

        Ok(Self {
            ec,
            shared,
            store,
            engines,
            last_written: [None; 2],
            shutdown,
            options,
            state: LoopState::Running,
        })
    }

    /// Run until shutdown is requested or the EC fails.
    ///
    /// The shutdown path (persist settings, optionally restore automatic
    /// fan control) runs in both cases; a hardware error is returned after.
    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "Control loop running (period {:?}, slice {:?})",
            self.options.poll_interval,
            self.options.sleep_slice
        );

        let result = self.run_until_shutdown();
        if let Err(e) = &result {
            log::error!("Control loop aborted: {e}");
        }
        self.shut_down();
        result
    }

    fn run_until_shutdown(&mut self) -> Result<()> {
        while !self.shutdown_requested() {
            self.iterate()?;
            self.sleep_interval();
            self.service_sync();
        }
        Ok(())
    }

    /// One sample / evaluate / write / publish pass over both domains.
    pub fn iterate(&mut self) -> Result<()> {
        let mut duties = [0; 2];
        for domain in Domain::ALL {
            duties[domain.index()] = self.evaluate_domain(domain)?;
        }

        for domain in Domain::ALL {
            let i = domain.index();
            let duty = duties[i];
            if self.last_written[i] != Some(duty) {
                self.ec.set_fan_manual(domain.registers(), duty.clamp(0, 100) as u8)?;
                self.last_written[i] = Some(duty);
                log::debug!("{domain}: fan duty set to {duty}%");
            }
        }

        for engine in &self.engines {
            let temperature = engine.filtered_temperature().unwrap_or_default();
            self.shared.publish_telemetry(engine.domain(), temperature, engine.duty());
        }
        Ok(())
    }

    fn evaluate_domain(&mut self, domain: Domain) -> Result<i32> {
        let engine = &mut self.engines[domain.index()];
        Ok(match sample_temperature(&mut self.ec, domain)? {
            Sample::Valid(raw) => engine.update(raw),
            Sample::Fallback(fault) => {
                log::warn!("{domain}: sensor fault ({fault:?}) persists, assuming {FALLBACK_TEMP} C");
                engine.override_temperature(FALLBACK_TEMP)
            }
        })
    }

    /// Import editor parameters if the sync flag is raised.
    ///
    /// Both domains are staged together; if either set is rejected the
    /// current parameters stay in force and are written back so the editor
    /// can see the revert. Returns whether new parameters were accepted.
    pub fn service_sync(&mut self) -> bool {
        if !self.shared.sync_requested() {
            return false;
        }

        let mut staged = self.engines.clone();
        let imported: Result<()> = staged
            .iter_mut()
            .try_for_each(|engine| engine.import_parameters(self.shared));

        let accepted = match imported {
            Ok(()) => {
                self.engines = staged;
                log::info!("Applied new curve parameters from editor");
                true
            }
            Err(e) => {
                log::warn!("Rejected curve parameters from editor: {e}");
                for engine in &self.engines {
                    engine.export_parameters(self.shared);
                }
                false
            }
        };

        self.shared.clear_sync();
        if accepted {
            self.store.save_or_warn(&self.settings_record());
        }
        accepted
    }

    fn sleep_interval(&self) {
        let mut remaining = self.options.poll_interval;
        while !remaining.is_zero() && !self.shutdown_requested() {
            let slice = remaining.min(self.options.sleep_slice);
            thread::sleep(slice);
            remaining -= slice;
        }
    }

    fn shut_down(&mut self) {
        self.state = LoopState::ShuttingDown;
        log::info!("Shutting down");

        if self.store.save_or_warn(&self.settings_record()) {
            log::info!("Saved settings to {}", self.store.path().display());
        }

        if self.options.restore_auto_on_exit {
            for domain in Domain::ALL {
                match self.ec.set_fan_auto(domain.registers()) {
                    Ok(()) => log::info!("{domain}: fan returned to automatic control"),
                    Err(e) => log::error!("{domain}: failed to restore automatic control: {e}"),
                }
            }
        }
    }

    /// Current parameters and last published telemetry.
    pub fn settings_record(&self) -> SettingsRecord {
        SettingsRecord {
            parameters: self.engines.each_ref().map(CurveEngine::parameters),
            ..SettingsRecord::from_snapshot(self.shared)
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn engine(&self, domain: Domain) -> &CurveEngine {
        &self.engines[domain.index()]
    }

    pub fn ec(&self) -> &E {
        &self.ec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurveParameters;
    use crate::ec::{CPU_REGISTERS, GPU_REGISTERS};
    use crate::error::FanError;
    use std::collections::{HashMap, VecDeque};
    use tempfile::TempDir;

    /// Simulated EC. Temperature registers replay a queue, repeating the
    /// last value once it is drained.
    #[derive(Default)]
    struct FakeEc {
        temps: HashMap<u8, VecDeque<u8>>,
        writes: Vec<(u8, u8)>,
        reads: usize,
        hung: bool,
    }

    impl FakeEc {
        fn with_temps(cpu: &[u8], gpu: &[u8]) -> Self {
            let mut temps = HashMap::new();
            temps.insert(CPU_REGISTERS.temperature, cpu.iter().copied().collect());
            temps.insert(GPU_REGISTERS.temperature, gpu.iter().copied().collect());
            Self {
                temps,
                ..Default::default()
            }
        }

        fn speed_writes(&self, regs: &crate::ec::DomainRegisters) -> Vec<u8> {
            self.writes
                .iter()
                .filter(|(r, _)| *r == regs.fan_speed)
                .map(|(_, v)| *v)
                .collect()
        }
    }

    impl EmbeddedController for FakeEc {
        fn read(&mut self, register: u8) -> Result<u8> {
            if self.hung {
                return Err(FanError::HardwareTimeout { attempts: 100 });
            }
            self.reads += 1;
            let queue = self.temps.entry(register).or_default();
            Ok(if queue.len() > 1 {
                queue.pop_front().unwrap_or(0)
            } else {
                queue.front().copied().unwrap_or(0)
            })
        }

        fn write(&mut self, register: u8, value: u8) -> Result<()> {
            if self.hung {
                return Err(FanError::HardwareTimeout { attempts: 100 });
            }
            self.writes.push((register, value));
            Ok(())
        }
    }

    fn seeded_snapshot() -> SharedSnapshot {
        let shared = SharedSnapshot::default();
        SettingsRecord::default().apply_to(&shared);
        shared
    }

    fn fast_options() -> LoopOptions {
        LoopOptions {
            poll_interval: Duration::ZERO,
            sleep_slice: Duration::from_millis(1),
            restore_auto_on_exit: true,
        }
    }

    fn make_loop<'a>(
        ec: FakeEc,
        shared: &'a SharedSnapshot,
        dir: &TempDir,
    ) -> ControlLoop<'a, FakeEc> {
        let store = SettingsStore::new(dir.path().join("settings.dat"));
        ControlLoop::new(ec, shared, store, Arc::new(AtomicBool::new(false)), fast_options()).unwrap()
    }

    #[test]
    fn test_classify_faults() {
        assert_eq!(SensorFault::classify(0.0), Some(SensorFault::Zero));
        assert_eq!(SensorFault::classify(111.0), Some(SensorFault::OutOfRange));
        assert_eq!(SensorFault::classify(110.0), None);
        assert_eq!(SensorFault::classify(1.0), None);
    }

    #[test]
    fn test_sample_recovers_after_retry() {
        let mut ec = FakeEc::with_temps(&[0, 120, 65], &[50]);
        assert_eq!(sample_temperature(&mut ec, Domain::Cpu).unwrap(), Sample::Valid(65.0));
        assert_eq!(ec.reads, 3);
    }

    #[test]
    fn test_sample_falls_back_after_four_zero_readings() {
        let mut ec = FakeEc::with_temps(&[0, 0, 0, 0, 70], &[50]);
        assert_eq!(
            sample_temperature(&mut ec, Domain::Cpu).unwrap(),
            Sample::Fallback(SensorFault::Zero)
        );
        assert_eq!(ec.reads, 4);
    }

    #[test]
    fn test_fallback_forces_high_duty() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let mut ctl = make_loop(FakeEc::with_temps(&[0], &[60]), &shared, &dir);

        ctl.iterate().unwrap();
        assert_eq!(ctl.engine(Domain::Cpu).duty(), 100);
        assert_eq!(shared.telemetry(Domain::Cpu).temperature, FALLBACK_TEMP);
        assert_eq!(ctl.ec().speed_writes(&CPU_REGISTERS), vec![100]);
    }

    #[test]
    fn test_writes_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let mut ctl = make_loop(FakeEc::with_temps(&[60], &[60]), &shared, &dir);

        ctl.iterate().unwrap();
        // mode + speed for each domain
        assert_eq!(ctl.ec().writes.len(), 4);
        assert_eq!(
            ctl.ec().writes[..2],
            [
                (CPU_REGISTERS.fan_mode, CPU_REGISTERS.fan_mode_manual),
                (CPU_REGISTERS.fan_speed, 6)
            ]
        );

        ctl.iterate().unwrap();
        ctl.iterate().unwrap();
        assert_eq!(ctl.ec().writes.len(), 4);
    }

    #[test]
    fn test_telemetry_published_every_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let mut ctl = make_loop(FakeEc::with_temps(&[60], &[70]), &shared, &dir);

        ctl.iterate().unwrap();
        let cpu = shared.telemetry(Domain::Cpu);
        assert_eq!(cpu.temperature, 60.0);
        assert_eq!(cpu.duty, 6);
        // gpu: 8 + 5 * 22 / 10 = 19
        assert_eq!(shared.telemetry(Domain::Gpu).duty, 19);

        shared.publish_telemetry(Domain::Cpu, 0.0, 0);
        ctl.iterate().unwrap();
        assert_eq!(shared.telemetry(Domain::Cpu).duty, 6);
    }

    #[test]
    fn test_service_sync_applies_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let mut ctl = make_loop(FakeEc::with_temps(&[60], &[60]), &shared, &dir);
        ctl.iterate().unwrap();

        assert!(!ctl.service_sync());

        let params = CurveParameters {
            hysteresis: 2,
            breakpoints: [50, 65, 80],
            duties: [10, 20, 40, 60, 100],
        };
        assert!(shared.submit_parameters(Domain::Cpu, &params));
        assert!(ctl.service_sync());
        assert!(!shared.sync_requested());
        assert_eq!(ctl.engine(Domain::Cpu).parameters(), params);

        let saved = SettingsStore::new(dir.path().join("settings.dat")).load().unwrap().unwrap();
        assert_eq!(saved.parameters[0], params);

        // Same temperature, but the gate was reset: 20 + 10 * 20 / 15 = 33.3
        ctl.iterate().unwrap();
        assert_eq!(ctl.ec().speed_writes(&CPU_REGISTERS), vec![6, 33]);
    }

    #[test]
    fn test_service_sync_rejects_invalid_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let mut ctl = make_loop(FakeEc::with_temps(&[60], &[60]), &shared, &dir);
        let before = ctl.engine(Domain::Gpu).parameters();

        let bad = CurveParameters {
            hysteresis: 3,
            breakpoints: [70, 60, 50],
            duties: [0, 5, 8, 30, 100],
        };
        assert!(shared.submit_parameters(Domain::Gpu, &bad));
        assert!(!ctl.service_sync());
        assert!(!shared.sync_requested());
        assert_eq!(ctl.engine(Domain::Gpu).parameters(), before);
        assert_eq!(shared.load_parameters(Domain::Gpu), before);
    }

    #[test]
    fn test_reset_to_defaults_after_custom_curve() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let mut ctl = make_loop(FakeEc::with_temps(&[60], &[60]), &shared, &dir);

        let custom = CurveParameters {
            hysteresis: 1,
            breakpoints: [40, 50, 60],
            duties: [20, 40, 60, 80, 100],
        };
        assert!(shared.submit_parameters(Domain::Cpu, &custom));
        assert!(ctl.service_sync());
        assert_eq!(ctl.engine(Domain::Cpu).parameters(), custom);

        let defaults = CurveParameters::defaults(Domain::Cpu);
        assert!(shared.submit_parameters(Domain::Cpu, &defaults));
        assert!(ctl.service_sync());
        assert_eq!(ctl.engine(Domain::Cpu).parameters(), defaults);
        assert_eq!(shared.load_parameters(Domain::Cpu), defaults);
    }

    #[test]
    fn test_invalid_settings_file_does_not_block_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.dat");
        std::fs::write(&path, [0xFFu8; crate::settings::SETTINGS_RECORD_LEN]).unwrap();

        let shared = SharedSnapshot::default();
        let mut store = SettingsStore::new(&path);
        store.load_or_seed(&shared);

        let ctl = ControlLoop::new(
            FakeEc::default(),
            &shared,
            store,
            Arc::new(AtomicBool::new(false)),
            fast_options(),
        )
        .unwrap();
        assert_eq!(
            ctl.engine(Domain::Gpu).parameters(),
            CurveParameters::defaults(Domain::Gpu)
        );
    }

    #[test]
    fn test_invalid_seed_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        shared.store_parameters(
            Domain::Cpu,
            &CurveParameters {
                hysteresis: 3,
                breakpoints: [55, 55, 80],
                duties: [0, 5, 8, 30, 100],
            },
        );
        let store = SettingsStore::new(dir.path().join("settings.dat"));
        let result = ControlLoop::new(
            FakeEc::default(),
            &shared,
            store,
            Arc::new(AtomicBool::new(false)),
            fast_options(),
        );
        assert!(matches!(result, Err(FanError::Configuration(_))));
    }

    #[test]
    fn test_run_exits_on_shutdown_and_restores_auto() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let shutdown = Arc::new(AtomicBool::new(true));
        let store = SettingsStore::new(dir.path().join("settings.dat"));
        let mut ctl = ControlLoop::new(
            FakeEc::with_temps(&[60], &[60]),
            &shared,
            store,
            shutdown,
            fast_options(),
        )
        .unwrap();

        ctl.run().unwrap();
        assert_eq!(ctl.state(), LoopState::ShuttingDown);
        assert_eq!(ctl.ec().reads, 0);
        assert_eq!(
            ctl.ec().writes,
            vec![
                (CPU_REGISTERS.fan_mode, CPU_REGISTERS.fan_mode_auto),
                (GPU_REGISTERS.fan_mode, GPU_REGISTERS.fan_mode_auto),
            ]
        );
        assert!(dir.path().join("settings.dat").exists());
    }

    #[test]
    fn test_hardware_timeout_aborts_but_persists() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let ec = FakeEc {
            hung: true,
            ..Default::default()
        };
        let mut ctl = make_loop(ec, &shared, &dir);

        let err = ctl.run().unwrap_err();
        assert!(matches!(err, FanError::HardwareTimeout { .. }));
        assert_eq!(ctl.state(), LoopState::ShuttingDown);
        assert!(dir.path().join("settings.dat").exists());
    }

    #[test]
    fn test_loop_with_concurrent_editor() {
        let dir = tempfile::tempdir().unwrap();
        let shared = seeded_snapshot();
        let shutdown = Arc::new(AtomicBool::new(false));
        let store = SettingsStore::new(dir.path().join("settings.dat"));
        let options = LoopOptions {
            poll_interval: Duration::from_millis(5),
            sleep_slice: Duration::from_millis(1),
            restore_auto_on_exit: false,
        };
        let mut ctl = ControlLoop::new(
            FakeEc::with_temps(&[60], &[60]),
            &shared,
            store,
            shutdown.clone(),
            options,
        )
        .unwrap();

        let params = CurveParameters {
            hysteresis: 1,
            breakpoints: [40, 60, 80],
            duties: [0, 10, 30, 60, 100],
        };

        thread::scope(|s| {
            let editor = s.spawn(|| {
                assert!(shared.submit_parameters(Domain::Cpu, &params));
                while shared.sync_requested() {
                    thread::sleep(Duration::from_millis(1));
                }
                shutdown.store(true, Ordering::Release);
            });
            ctl.run().unwrap();
            editor.join().unwrap();
        });

        assert_eq!(ctl.engine(Domain::Cpu).parameters(), params);
        assert_eq!(shared.load_parameters(Domain::Cpu), params);
        assert!(!shared.sync_requested());
    }
}
