//! Distance estimation from received signal strength.
//!
//! The estimate is an empirical path-loss curve fit, not a physical law. It
//! compares the received RSSI against the transmit power the peer declares
//! at one meter and maps the ratio through two branches: a steep near-field
//! power curve below `ratio == 1.0` and a fitted far-field curve above it.

use thiserror::Error;

/// Errors returned by [`estimate`] and [`PathLossCurve::estimate`].
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum DistanceError {
    /// The peer did not declare a usable transmit power, so the distance is unknown.
    #[error("insufficient calibration data: no usable transmit power")]
    InsufficientCalibrationData,
    /// The curve produced a non-finite distance for this reading.
    #[error("distance out of range for rssi {rssi} dBm at tx power {tx_power} dBm")]
    OutOfRange { rssi: i16, tx_power: i16 },
}

/// Calibration constants of a two-branch path-loss curve.
///
/// `distance = ratio^near_exponent` when `ratio < 1.0`, otherwise
/// `far_coefficient * ratio^far_exponent + far_intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLossCurve {
    pub near_exponent: f64,
    pub far_coefficient: f64,
    pub far_exponent: f64,
    pub far_intercept: f64,
}

impl PathLossCurve {
    /// The default calibration set (a common fit for phone-class receivers).
    pub const DEFAULT: PathLossCurve = PathLossCurve {
        near_exponent: 10.0,
        far_coefficient: 0.42093,
        far_exponent: 6.9476,
        far_intercept: 0.54992,
    };

    /// Estimate the distance in meters to a peer.
    ///
    /// # Arguments
    /// * `rssi` - Received signal strength in dBm
    /// * `tx_power` - Declared transmit power at 1 m in dBm, `None` when not advertised
    ///
    /// # Errors
    /// [`DistanceError::InsufficientCalibrationData`] when `tx_power` is absent or
    /// not negative (a non-negative anchor makes the ratio meaningless).
    pub fn estimate(&self, rssi: i16, tx_power: Option<i16>) -> Result<f64, DistanceError> {
        let tx_power = match tx_power {
            Some(tx) if tx < 0 => tx,
            _ => return Err(DistanceError::InsufficientCalibrationData),
        };

        let ratio = f64::from(rssi) / f64::from(tx_power);
        let distance = if ratio < 1.0 {
            ratio.powf(self.near_exponent)
        } else {
            self.far_coefficient * ratio.powf(self.far_exponent) + self.far_intercept
        };

        if distance.is_finite() {
            Ok(distance)
        } else {
            Err(DistanceError::OutOfRange { rssi, tx_power })
        }
    }
}

impl Default for PathLossCurve {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Estimate the distance in meters using the default calibration curve.
///
/// # Example
/// ```
/// use proximity_fusion::distance::estimate;
///
/// let meters = estimate(-80, Some(-59)).unwrap();
/// assert!((meters - 4.0409).abs() < 1e-3);
/// assert!(estimate(-80, None).is_err());
/// ```
pub fn estimate(rssi: i16, tx_power: Option<i16>) -> Result<f64, DistanceError> {
    PathLossCurve::DEFAULT.estimate(rssi, tx_power)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_branch() {
        let distance = estimate(-50, Some(-59)).unwrap();
        assert!((distance - (50.0f64 / 59.0).powi(10)).abs() < 1e-12);
        assert!((distance - 0.1911).abs() < 1e-3);
    }

    #[test]
    fn test_far_branch() {
        let ratio = 80.0f64 / 59.0;
        let expected = 0.42093 * ratio.powf(6.9476) + 0.54992;
        let distance = estimate(-80, Some(-59)).unwrap();
        assert!((distance - expected).abs() < 1e-12);
        assert!((distance - 4.0409).abs() < 1e-3);
    }

    #[test]
    fn test_threshold_uses_far_branch() {
        // ratio == 1.0 exactly: far curve evaluates to coefficient + intercept
        let distance = estimate(-59, Some(-59)).unwrap();
        assert!((distance - (0.42093 + 0.54992)).abs() < 1e-12);
    }

    #[test]
    fn test_distance_grows_with_weaker_signal() {
        let near = estimate(-55, Some(-59)).unwrap();
        let mid = estimate(-70, Some(-59)).unwrap();
        let far = estimate(-90, Some(-59)).unwrap();
        assert!(near < mid && mid < far);
    }

    #[test]
    fn test_unknown_tx_power_is_not_zero_distance() {
        assert_eq!(
            estimate(-60, None),
            Err(DistanceError::InsufficientCalibrationData)
        );
    }

    #[test]
    fn test_non_negative_tx_power_rejected() {
        assert_eq!(
            estimate(-60, Some(0)),
            Err(DistanceError::InsufficientCalibrationData)
        );
        assert_eq!(
            estimate(-60, Some(4)),
            Err(DistanceError::InsufficientCalibrationData)
        );
    }

    #[test]
    fn test_substituted_curve_keeps_branch_shape() {
        let curve = PathLossCurve {
            near_exponent: 2.0,
            far_coefficient: 1.0,
            far_exponent: 1.0,
            far_intercept: 0.0,
        };
        assert!((curve.estimate(-30, Some(-60)).unwrap() - 0.25).abs() < 1e-12);
        assert!((curve.estimate(-90, Some(-60)).unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_result_is_out_of_range() {
        let curve = PathLossCurve {
            near_exponent: 0.5,
            ..PathLossCurve::DEFAULT
        };
        assert_eq!(
            curve.estimate(10, Some(-60)),
            Err(DistanceError::OutOfRange {
                rssi: 10,
                tx_power: -60
            })
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            DistanceError::InsufficientCalibrationData.to_string(),
            "insufficient calibration data: no usable transmit power"
        );
    }
}
