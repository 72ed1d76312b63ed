//! Tare and span calibration.
//!
//! Converts raw voltage ratios to weight with a linear model:
//! `weight = (ratio - tare_offset) * calibration_factor`

use crate::error::CalibrationError;

/// Known reference mass offered to the operator by default (grams).
pub const DEFAULT_KNOWN_MASS: f64 = 100.0;

/// Calibration parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationParameters {
    /// Raw ratio that reads as zero weight.
    pub tare_offset: f64,
    /// Mass units per ratio unit above the tare offset.
    pub calibration_factor: f64,
    /// Reference mass used by the last successful calibration.
    pub known_mass: f64,
    /// Raw ratio observed under the reference mass.
    pub vr_at_known_mass: f64,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self {
            tare_offset: 0.0,
            calibration_factor: 1.0,
            known_mass: DEFAULT_KNOWN_MASS,
            vr_at_known_mass: 0.0,
        }
    }
}

impl CalibrationParameters {
    /// Converts a raw ratio to weight.
    #[inline]
    #[must_use]
    pub fn weight(&self, raw_ratio: f64) -> f64 {
        weight(raw_ratio, self)
    }
}

/// Converts a raw ratio to weight using `params`.
#[inline]
#[must_use]
pub fn weight(raw_ratio: f64, params: &CalibrationParameters) -> f64 {
    (raw_ratio - params.tare_offset) * params.calibration_factor
}

/// Owns the calibration parameters and the operations that change them.
#[derive(Debug, Clone, Default)]
pub struct CalibrationEngine {
    params: CalibrationParameters,
}

impl CalibrationEngine {
    /// Creates an engine with default parameters (tare 0, factor 1).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine starting from known parameters.
    #[must_use]
    pub const fn with_parameters(params: CalibrationParameters) -> Self {
        Self { params }
    }

    /// Returns the current parameters.
    #[must_use]
    pub const fn parameters(&self) -> &CalibrationParameters {
        &self.params
    }

    /// Converts a raw ratio with the current parameters.
    #[must_use]
    pub fn weight(&self, raw_ratio: f64) -> f64 {
        self.params.weight(raw_ratio)
    }

    /// Zeroes the scale at `current_raw`.
    pub fn tare(&mut self, current_raw: f64) -> CalibrationParameters {
        self.params.tare_offset = current_raw;
        tracing::debug!("tare offset set to {current_raw}");
        self.params
    }

    /// Derives the calibration factor from a reference mass.
    ///
    /// `current_raw` is the ratio read with `known_mass` on the scale. The
    /// mass is validated before the span; on error nothing changes.
    pub fn calibrate(
        &mut self,
        current_raw: f64,
        known_mass: f64,
    ) -> Result<CalibrationParameters, CalibrationError> {
        if !known_mass.is_finite() || known_mass <= 0.0 {
            return Err(CalibrationError::InvalidKnownMass(known_mass));
        }

        let span = current_raw - self.params.tare_offset;
        if span.is_nan() || span <= 0.0 {
            return Err(CalibrationError::InvalidCalibrationSpan { span });
        }

        // A span too small for the mass overflows the factor.
        let factor = known_mass / span;
        if !factor.is_finite() {
            return Err(CalibrationError::InvalidCalibrationSpan { span });
        }

        self.params.vr_at_known_mass = current_raw;
        self.params.calibration_factor = factor;
        self.params.known_mass = known_mass;

        tracing::debug!(
            "calibrated: span {span}, factor {}",
            self.params.calibration_factor
        );
        Ok(self.params)
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn test_weight_formula() {
        let cases = [
            (0.0, 0.0, 1.0),
            (0.002, 0.0, 1.0),
            (-0.5, 0.25, 3.0),
            (1.0e-6, 2.0e-6, 12_345.678),
        ];
        for (raw, tare, factor) in cases {
            let params = CalibrationParameters {
                tare_offset: tare,
                calibration_factor: factor,
                ..CalibrationParameters::default()
            };
            assert_eq!(weight(raw, &params).to_bits(), ((raw - tare) * factor).to_bits());
        }
    }

    #[test]
    fn test_defaults() {
        let engine = CalibrationEngine::new();
        let params = engine.parameters();
        assert_eq!(params.tare_offset, 0.0);
        assert_eq!(params.calibration_factor, 1.0);
        assert_eq!(params.known_mass, DEFAULT_KNOWN_MASS);
        assert_eq!(params.vr_at_known_mass, 0.0);
    }

    #[test]
    fn test_untared_reading() {
        let engine = CalibrationEngine::new();
        assert_eq!(engine.weight(0.002), 0.002);
    }

    #[test]
    fn test_tare_zeroes_reading() {
        let mut engine = CalibrationEngine::new();
        let params = engine.tare(0.002);

        assert_eq!(params.tare_offset, 0.002);
        assert_eq!(engine.weight(0.002), 0.0);
    }

    #[test]
    fn test_tare_is_idempotent() {
        let mut engine = CalibrationEngine::new();
        let first = engine.tare(0.0031);
        let second = engine.tare(0.0031);
        assert_eq!(first, second);
    }

    #[test]
    fn test_calibrate_after_tare() {
        let mut engine = CalibrationEngine::new();
        engine.tare(0.002);
        let params = engine.calibrate(0.012, 100.0).unwrap();

        assert!(approx(params.calibration_factor, 10_000.0));
        assert_eq!(params.vr_at_known_mass, 0.012);
        assert_eq!(params.known_mass, 100.0);
        assert!(approx(engine.weight(0.012), 100.0));
        assert!(approx(engine.weight(0.002), 0.0));
    }

    #[test]
    fn test_calibrate_below_tare_is_rejected() {
        let mut engine = CalibrationEngine::new();
        engine.tare(0.002);
        let before = *engine.parameters();

        let err = engine.calibrate(0.001, 100.0).unwrap_err();
        match err {
            CalibrationError::InvalidCalibrationSpan { span } => assert!(approx(span, -0.001)),
            CalibrationError::InvalidKnownMass(_) => panic!("wrong error: {err}"),
        }
        assert_eq!(*engine.parameters(), before);
    }

    #[test]
    fn test_zero_span_is_rejected() {
        let mut engine = CalibrationEngine::new();
        engine.tare(0.004);
        engine.calibrate(0.014, 50.0).unwrap();
        let before = *engine.parameters();

        assert!(matches!(
            engine.calibrate(0.004, 100.0),
            Err(CalibrationError::InvalidCalibrationSpan { .. })
        ));
        assert_eq!(engine.parameters().calibration_factor, before.calibration_factor);
        assert_eq!(engine.parameters().vr_at_known_mass, before.vr_at_known_mass);
    }

    #[test]
    fn test_invalid_known_mass_checked_first() {
        let mut engine = CalibrationEngine::new();
        engine.tare(0.002);

        for mass in [0.0, -10.0, f64::NAN, f64::INFINITY] {
            // The span here is also invalid; mass must win.
            let err = engine.calibrate(0.001, mass).unwrap_err();
            assert!(matches!(err, CalibrationError::InvalidKnownMass(_)));
        }
        assert_eq!(engine.parameters().calibration_factor, 1.0);
    }

    #[test]
    fn test_overflowing_factor_is_rejected() {
        let mut engine = CalibrationEngine::new();
        engine.tare(0.0);
        let before = *engine.parameters();

        let err = engine.calibrate(1e-300, 1e300).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidCalibrationSpan { .. }));
        assert_eq!(*engine.parameters(), before);
        assert!(engine.weight(0.0).is_finite());
    }
}
