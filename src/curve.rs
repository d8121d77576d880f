// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve definitions and the per-domain curve engine.
//!
//! A curve maps temperature to fan duty (0-100 %) through five fixed
//! control points. The first point sits at 0 C and the last at 100 C; the
//! three interior temperatures and all five duties are user-adjustable.
//! Duty is linearly interpolated between points and truncated to an
//! integer.

use crate::domain::Domain;
use crate::error::{FanError, Result};
use crate::filter::LowPassFilter;
use crate::shm::SharedSnapshot;
use serde::{Deserialize, Serialize};

/// Number of control points on every curve.
pub const CURVE_POINTS: usize = 5;
/// Temperature of the first control point.
pub const CURVE_MIN_TEMP: i32 = 0;
/// Temperature of the last control point.
pub const CURVE_MAX_TEMP: i32 = 100;
/// Hysteresis band used when no settings exist yet.
pub const DEFAULT_HYSTERESIS: i32 = 3;
/// Duty points used when no settings exist yet (both domains).
pub const DEFAULT_DUTIES: [i32; CURVE_POINTS] = [0, 5, 8, 30, 100];

/// A single point on a fan curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurvePoint {
    /// Temperature in degrees Celsius
    pub temp_c: i32,
    /// Fan duty in percent (0-100)
    pub duty: i32,
}

/// The user-editable parameters of one domain: hysteresis band, the three
/// interior breakpoint temperatures and the five duty values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurveParameters {
    pub hysteresis: i32,
    pub breakpoints: [i32; CURVE_POINTS - 2],
    pub duties: [i32; CURVE_POINTS],
}

impl CurveParameters {
    /// Built-in defaults for a domain.
    pub fn defaults(domain: Domain) -> Self {
        let breakpoints = match domain {
            Domain::Cpu => [55, 70, 80],
            Domain::Gpu => [50, 65, 75],
        };
        Self {
            hysteresis: DEFAULT_HYSTERESIS,
            breakpoints,
            duties: DEFAULT_DUTIES,
        }
    }
}

// ---------------------------------------------------------------------------
// Curve
// ---------------------------------------------------------------------------

/// A validated five-point fan curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanCurve {
    points: [CurvePoint; CURVE_POINTS],
}

impl FanCurve {
    /// Build a curve from exactly five points.
    ///
    /// Rejects the wrong point count, end points other than 0 C / 100 C,
    /// temperatures that are not strictly increasing and duties outside
    /// 0-100.
    pub fn new(points: &[CurvePoint]) -> Result<Self> {
        let points: [CurvePoint; CURVE_POINTS] = points.try_into().map_err(|_| {
            FanError::Configuration(format!(
                "Curve must have exactly {CURVE_POINTS} points, got {}",
                points.len()
            ))
        })?;
        validate(&points)?;
        Ok(Self { points })
    }

    pub fn from_parameters(params: &CurveParameters) -> Result<Self> {
        let temps = [
            CURVE_MIN_TEMP,
            params.breakpoints[0],
            params.breakpoints[1],
            params.breakpoints[2],
            CURVE_MAX_TEMP,
        ];
        let points: Vec<CurvePoint> = temps
            .iter()
            .zip(params.duties)
            .map(|(&temp_c, duty)| CurvePoint { temp_c, duty })
            .collect();
        Self::new(&points)
    }

    pub fn points(&self) -> &[CurvePoint; CURVE_POINTS] {
        &self.points
    }

    /// Interior breakpoint temperatures.
    pub fn breakpoints(&self) -> [i32; CURVE_POINTS - 2] {
        [
            self.points[1].temp_c,
            self.points[2].temp_c,
            self.points[3].temp_c,
        ]
    }

    pub fn duties(&self) -> [i32; CURVE_POINTS] {
        self.points.map(|p| p.duty)
    }

    /// Interpolate the duty for a temperature.
    ///
    /// Segments are half-open `[lo, hi)` and scanned in order; the last
    /// point itself maps to its own duty. Returns `None` outside 0-100 C.
    pub fn interpolate(&self, temp_c: f64) -> Option<i32> {
        for window in self.points.windows(2) {
            let lo = window[0];
            let hi = window[1];
            if temp_c >= f64::from(lo.temp_c) && temp_c < f64::from(hi.temp_c) {
                let temp_range = f64::from(hi.temp_c - lo.temp_c);
                let duty_range = f64::from(hi.duty - lo.duty);
                let duty = f64::from(lo.duty) + (temp_c - f64::from(lo.temp_c)) * duty_range / temp_range;
                return Some(duty as i32);
            }
        }

        let last = self.points[CURVE_POINTS - 1];
        (temp_c == f64::from(last.temp_c)).then_some(last.duty)
    }
}

fn validate(points: &[CurvePoint; CURVE_POINTS]) -> Result<()> {
    if points[0].temp_c != CURVE_MIN_TEMP || points[CURVE_POINTS - 1].temp_c != CURVE_MAX_TEMP {
        return Err(FanError::Configuration(format!(
            "Curve must start at {CURVE_MIN_TEMP} C and end at {CURVE_MAX_TEMP} C"
        )));
    }
    for (i, p) in points.iter().enumerate() {
        if !(0..=100).contains(&p.duty) {
            return Err(FanError::Configuration(format!(
                "Duty {} at point {i} is outside 0-100",
                p.duty
            )));
        }
        if i > 0 && p.temp_c <= points[i - 1].temp_c {
            return Err(FanError::Configuration(format!(
                "Points must have strictly increasing temperatures (point {i})"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Smoothing, hysteresis gate and curve evaluation for one domain.
#[derive(Debug, Clone)]
pub struct CurveEngine {
    domain: Domain,
    curve: FanCurve,
    hysteresis: i32,
    filter: LowPassFilter,
    /// Temperature at the last recompute; `None` forces the next one.
    reference: Option<f64>,
    duty: i32,
}

impl CurveEngine {
    pub fn new(domain: Domain, curve: FanCurve, hysteresis: i32) -> Result<Self> {
        check_hysteresis(hysteresis)?;
        Ok(Self {
            domain,
            curve,
            hysteresis,
            filter: LowPassFilter::default(),
            reference: None,
            duty: 0,
        })
    }

    pub fn from_parameters(domain: Domain, params: &CurveParameters) -> Result<Self> {
        Self::new(domain, FanCurve::from_parameters(params)?, params.hysteresis)
    }

    /// Smooth a raw sample and evaluate the curve on the result.
    pub fn update(&mut self, raw_temp: f64) -> i32 {
        let filtered = self.filter.apply(raw_temp);
        self.evaluate(filtered)
    }

    /// Re-seed the filter with `temp_c` and evaluate it unsmoothed.
    pub fn override_temperature(&mut self, temp_c: f64) -> i32 {
        self.filter.seed(temp_c);
        self.evaluate(temp_c)
    }

    /// Hysteresis gate plus curve lookup on an already-filtered temperature.
    pub fn evaluate(&mut self, temp_c: f64) -> i32 {
        if self.should_recompute(temp_c) {
            if let Some(duty) = self.curve.interpolate(temp_c) {
                if duty != self.duty {
                    log::debug!("{}: {temp_c:.1} C -> {duty}%", self.domain);
                }
                self.duty = duty;
            }
            self.reference = Some(temp_c);
        }
        self.duty
    }

    fn should_recompute(&self, temp_c: f64) -> bool {
        match self.reference {
            None => true,
            Some(last) => temp_c > last || last - temp_c > f64::from(self.hysteresis),
        }
    }

    /// Publish hysteresis and curve points to the shared snapshot.
    pub fn export_parameters(&self, shared: &SharedSnapshot) {
        shared.store_parameters(self.domain, &self.parameters());
    }

    /// Pull hysteresis and curve points from the shared snapshot.
    ///
    /// On success the hysteresis reference is cleared so the next sample is
    /// evaluated against the new curve unconditionally. A rejected parameter
    /// set leaves the engine untouched.
    pub fn import_parameters(&mut self, shared: &SharedSnapshot) -> Result<()> {
        let params = shared.load_parameters(self.domain);
        let curve = FanCurve::from_parameters(&params)?;
        check_hysteresis(params.hysteresis)?;
        self.curve = curve;
        self.hysteresis = params.hysteresis;
        self.reference = None;
        Ok(())
    }

    pub fn parameters(&self) -> CurveParameters {
        CurveParameters {
            hysteresis: self.hysteresis,
            breakpoints: self.curve.breakpoints(),
            duties: self.curve.duties(),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Last computed duty.
    pub fn duty(&self) -> i32 {
        self.duty
    }

    pub fn filtered_temperature(&self) -> Option<f64> {
        self.filter.value()
    }

    pub fn curve(&self) -> &FanCurve {
        &self.curve
    }

    pub fn hysteresis(&self) -> i32 {
        self.hysteresis
    }
}

fn check_hysteresis(hysteresis: i32) -> Result<()> {
    if hysteresis < 0 {
        return Err(FanError::Configuration(format!(
            "Hysteresis must not be negative, got {hysteresis}"
        )));
    }
    Ok(())
}
