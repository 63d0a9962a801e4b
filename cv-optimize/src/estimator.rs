use float_ord::FloatOrd;

/// The number of parameters of a 6-DOF pose.
pub const POSE_PARAMETERS: usize = 6;

/// Robust error estimators.
///
/// Square is the plain least squares error. Huber and Tukey reduce the influence of large residuals,
/// with Tukey ignoring residuals above its threshold entirely. Both derive their threshold from a
/// median-based estimate of the standard deviation of the residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Estimator {
    Square,
    Huber,
    Tukey,
}

impl Estimator {
    /// Returns `true` if the estimator needs a standard deviation estimate.
    pub fn needs_sigma(self) -> bool {
        !matches!(self, Estimator::Square)
    }

    /// The threshold in units of the standard deviation.
    pub fn threshold(self) -> f64 {
        match self {
            Estimator::Square => f64::INFINITY,
            Estimator::Huber => 1.345,
            Estimator::Tukey => 4.6851,
        }
    }

    /// Robust squared standard deviation of a set of squared residuals.
    ///
    /// Uses `1.4826 * (1 + 5 / (n - p)) * median` and never returns less than `min_sqr_sigma`.
    pub fn sqr_sigma(sqr_errors: &[f64], model_parameters: usize, min_sqr_sigma: f64) -> f64 {
        let median = match median(sqr_errors) {
            Some(median) => median,
            None => return min_sqr_sigma,
        };
        let n = sqr_errors.len();
        let correction = if n > model_parameters {
            1.0 + 5.0 / (n - model_parameters) as f64
        } else {
            6.0
        };
        let sigma = 1.4826 * correction * median.sqrt();
        (sigma * sigma).max(min_sqr_sigma)
    }

    /// The robust error of one squared residual.
    pub fn robust_error(self, sqr_error: f64, sqr_sigma: f64) -> f64 {
        match self {
            Estimator::Square => sqr_error,
            Estimator::Huber => {
                let sqr_threshold = sqr_sigma * self.threshold().powi(2);
                if sqr_error <= sqr_threshold {
                    sqr_error * 0.5
                } else {
                    let threshold = sqr_threshold.sqrt();
                    threshold * (sqr_error.sqrt() - threshold * 0.5)
                }
            }
            Estimator::Tukey => {
                let sqr_threshold = sqr_sigma * self.threshold().powi(2);
                if sqr_error <= sqr_threshold {
                    let ratio = 1.0 - sqr_error / sqr_threshold;
                    sqr_threshold / 6.0 * (1.0 - ratio * ratio * ratio)
                } else {
                    sqr_threshold / 6.0
                }
            }
        }
    }

    /// The iteratively reweighted least squares weight of one squared residual.
    pub fn robust_weight(self, sqr_error: f64, sqr_sigma: f64) -> f64 {
        match self {
            Estimator::Square => 1.0,
            Estimator::Huber => {
                let sqr_threshold = sqr_sigma * self.threshold().powi(2);
                if sqr_error <= sqr_threshold {
                    1.0
                } else {
                    (sqr_threshold / sqr_error).sqrt()
                }
            }
            Estimator::Tukey => {
                let sqr_threshold = sqr_sigma * self.threshold().powi(2);
                if sqr_error <= sqr_threshold {
                    let ratio = 1.0 - sqr_error / sqr_threshold;
                    ratio * ratio
                } else {
                    0.0
                }
            }
        }
    }

    /// Weights for a set of squared residuals.
    pub fn robust_weights(self, sqr_errors: &[f64], min_sqr_sigma: f64) -> Vec<f64> {
        if !self.needs_sigma() {
            return vec![1.0; sqr_errors.len()];
        }
        let sqr_sigma = Self::sqr_sigma(sqr_errors, POSE_PARAMETERS, min_sqr_sigma);
        sqr_errors
            .iter()
            .map(|&sqr_error| self.robust_weight(sqr_error, sqr_sigma))
            .collect()
    }
}

/// The upper median of a set of values.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut values = values.to_vec();
    let middle = values.len() / 2;
    let (_, &mut median, _) = values.select_nth_unstable_by_key(middle, |&value| FloatOrd(value));
    Some(median)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0, 10.0]), Some(3.0));
        assert_eq!(median(&[5.0]), Some(5.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn tukey_ignores_outliers() {
        let sqr_sigma = 1.0;
        assert_eq!(Estimator::Tukey.robust_weight(1000.0, sqr_sigma), 0.0);
        assert!(Estimator::Tukey.robust_weight(0.5, sqr_sigma) > 0.9);
        let saturated = Estimator::Tukey.robust_error(1000.0, sqr_sigma);
        assert_eq!(saturated, Estimator::Tukey.robust_error(1e6, sqr_sigma));
    }

    #[test]
    fn huber_is_continuous_at_threshold() {
        let sqr_sigma = 4.0;
        let sqr_threshold = sqr_sigma * 1.345f64.powi(2);
        let below = Estimator::Huber.robust_error(sqr_threshold - 1e-9, sqr_sigma);
        let above = Estimator::Huber.robust_error(sqr_threshold + 1e-9, sqr_sigma);
        assert!((below - above).abs() < 1e-6);
        assert_eq!(Estimator::Huber.robust_weight(sqr_threshold * 0.5, sqr_sigma), 1.0);
        assert!(Estimator::Huber.robust_weight(sqr_threshold * 4.0, sqr_sigma) < 1.0);
    }

    #[test]
    fn square_is_plain() {
        assert_eq!(Estimator::Square.robust_error(7.0, 0.0), 7.0);
        assert_eq!(Estimator::Square.robust_weights(&[1.0, 100.0], 0.0), vec![1.0, 1.0]);
    }
}
