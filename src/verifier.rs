//! Verifier ("The Judge")
//!
//! Measures, after the fact, whether a quantized model's deviation from
//! its floating-point reference ever exceeds the analyzer's a-priori
//! bound. The verifier never runs inference itself: callers hand it two
//! aligned streams of activations (float reference, fixed-point or
//! float-decoded-from-fixed) one sample at a time.

use crate::fault::{Fault, FaultFlags};
use crate::hash::{sha256, Digest32};

/// Default minimum verification sample count.
pub const DEFAULT_MIN_SAMPLES: u64 = 100;
/// Default maximum verification sample count.
pub const DEFAULT_MAX_SAMPLES: u64 = 1000;

/// Verifier tunables.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VerifyConfig {
    /// Minimum samples for a meaningful verification run.
    pub min_samples: u64,
    /// Maximum samples to process.
    pub max_samples: u64,
    /// Whether to retain per-sample intermediates (caller concern; this
    /// crate's verifier does not allocate per-sample storage regardless).
    pub capture_intermediates: bool,
    /// If `true`, stop checking bounds at the first violation. If `false`
    /// (the default), continue through every layer to build a complete
    /// picture, matching the source's lenient default.
    pub strict_mode: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        VerifyConfig {
            min_samples: DEFAULT_MIN_SAMPLES,
            max_samples: DEFAULT_MAX_SAMPLES,
            capture_intermediates: true,
            strict_mode: false,
        }
    }
}

/// L∞ norm (max absolute elementwise difference) between two equal-length
/// float slices.
pub fn linf_norm(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0_f64, f64::max)
}

/// L∞ norm between a float reference and a Q16.16-encoded stream, decoding
/// each Q16.16 code to float (`code / 2^16`) before comparing.
pub fn linf_norm_q16(fp: &[f64], q16: &[i32]) -> f64 {
    debug_assert_eq!(fp.len(), q16.len());
    const SCALE: f64 = 1.0 / 65536.0;
    fp.iter()
        .zip(q16)
        .map(|(x, &q)| (x - f64::from(q) * SCALE).abs())
        .fold(0.0_f64, f64::max)
}

/// Running and finalized error statistics for a single layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerComparison {
    /// Index of the layer these statistics cover.
    pub layer_index: u32,
    /// Number of samples folded in.
    pub sample_count: u64,
    /// Running/finalized maximum observed error.
    pub error_max_measured: f64,
    /// Finalized mean error (valid only after [`LayerComparison::finalize`]).
    pub error_mean_measured: f64,
    /// Finalized standard deviation of error.
    pub error_std_measured: f64,
    /// The analyzer's theoretical bound for this layer.
    pub error_bound_theoretical: f64,
    /// Running sum of errors.
    pub error_sum: f64,
    /// Running sum of squared errors.
    pub error_sum_sq: f64,
    /// Whether `error_max_measured <= error_bound_theoretical`.
    pub bound_satisfied: bool,
}

impl LayerComparison {
    /// Initialize a comparison for `layer_index` against a theoretical bound.
    pub fn init(layer_index: u32, error_bound_theoretical: f64) -> Self {
        LayerComparison {
            layer_index,
            sample_count: 0,
            error_max_measured: 0.0,
            error_mean_measured: 0.0,
            error_std_measured: 0.0,
            error_bound_theoretical,
            error_sum: 0.0,
            error_sum_sq: 0.0,
            bound_satisfied: false,
        }
    }

    /// Fold one sample's error into the running statistics.
    pub fn update(&mut self, error: f64) {
        self.sample_count += 1;
        self.error_max_measured = self.error_max_measured.max(error);
        self.error_sum += error;
        self.error_sum_sq += error * error;
    }

    /// Finalize mean/variance/stddev. No-op if no samples were observed.
    /// Variance is floored at zero to absorb floating-point cancellation.
    pub fn finalize(&mut self) {
        if self.sample_count == 0 {
            return;
        }
        let n = self.sample_count as f64;
        self.error_mean_measured = self.error_sum / n;
        let variance =
            (self.error_sum_sq / n - self.error_mean_measured * self.error_mean_measured).max(0.0);
        self.error_std_measured = variance.sqrt();
    }

    /// Check the weak-inequality bound (`<=`, equality passes), flagging a
    /// fatal [`Fault::BoundViolation`] on failure.
    pub fn check_bound(&mut self, faults: &mut FaultFlags) -> bool {
        self.bound_satisfied = self.error_max_measured <= self.error_bound_theoretical;
        if !self.bound_satisfied {
            faults.set(Fault::BoundViolation);
        }
        self.bound_satisfied
    }
}

/// A complete verification run: per-layer comparisons plus end-to-end
/// statistics.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    /// Hash identifying the verification dataset.
    pub verification_set_hash: Digest32,
    /// Number of samples processed.
    pub sample_count: u64,
    /// Per-layer comparisons.
    pub layers: Vec<LayerComparison>,
    /// Analyzer's theoretical end-to-end bound.
    pub total_error_theoretical: f64,
    /// Maximum observed end-to-end error.
    pub total_error_max_measured: f64,
    /// Finalized mean end-to-end error.
    pub total_error_mean: f64,
    /// Finalized standard deviation of end-to-end error.
    pub total_error_std: f64,
    /// Running sum of end-to-end errors.
    pub total_error_sum: f64,
    /// Running sum of squared end-to-end errors.
    pub total_error_sum_sq: f64,
    /// True iff every layer's bound was satisfied.
    pub all_bounds_satisfied: bool,
    /// True iff the end-to-end bound was satisfied.
    pub total_bound_satisfied: bool,
    /// Accumulated faults.
    pub faults: FaultFlags,
}

impl VerificationReport {
    /// Initialize an empty report against a theoretical end-to-end bound.
    pub fn init(verification_set_hash: Digest32, total_error_theoretical: f64) -> Self {
        VerificationReport {
            verification_set_hash,
            sample_count: 0,
            layers: Vec::new(),
            total_error_theoretical,
            total_error_max_measured: 0.0,
            total_error_mean: 0.0,
            total_error_std: 0.0,
            total_error_sum: 0.0,
            total_error_sum_sq: 0.0,
            all_bounds_satisfied: false,
            total_bound_satisfied: false,
            faults: FaultFlags::new(),
        }
    }

    /// Fold one sample's end-to-end error into the running total stats.
    pub fn update_total(&mut self, error: f64) {
        self.sample_count += 1;
        self.total_error_max_measured = self.total_error_max_measured.max(error);
        self.total_error_sum += error;
        self.total_error_sum_sq += error * error;
    }

    /// Finalize the running total stats.
    pub fn finalize_total(&mut self) {
        if self.sample_count == 0 {
            return;
        }
        let n = self.sample_count as f64;
        self.total_error_mean = self.total_error_sum / n;
        let variance =
            (self.total_error_sum_sq / n - self.total_error_mean * self.total_error_mean).max(0.0);
        self.total_error_std = variance.sqrt();
    }

    /// Check bounds for every layer and the end-to-end total.
    ///
    /// In lenient mode (the default), every layer is checked regardless of
    /// earlier failures, so `all_bounds_satisfied` reflects the complete
    /// picture. In strict mode, checking stops at the first violation.
    pub fn check_all_bounds(&mut self, config: &VerifyConfig) {
        let mut all_ok = true;
        for layer in &mut self.layers {
            let ok = layer.check_bound(&mut self.faults);
            all_ok &= ok;
            if !ok && config.strict_mode {
                break;
            }
        }
        self.all_bounds_satisfied = all_ok;
        self.total_bound_satisfied = self.total_error_max_measured <= self.total_error_theoretical;
        if !self.total_bound_satisfied {
            self.faults.set(Fault::BoundViolation);
        }
    }

    /// `all_bounds_satisfied && total_bound_satisfied`.
    pub fn passed(&self) -> bool {
        self.all_bounds_satisfied && self.total_bound_satisfied
    }
}

/// A compact, hashable summary of a [`VerificationReport`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationDigest {
    /// Hash identifying the verification dataset.
    pub verification_set_hash: Digest32,
    /// Number of samples processed.
    pub sample_count: u64,
    /// Number of layers whose bound was satisfied.
    pub layers_passed: u32,
    /// Analyzer's theoretical end-to-end bound.
    pub total_error_theoretical: f64,
    /// Maximum observed end-to-end error.
    pub total_error_max_measured: f64,
    /// `1` if `all_bounds_satisfied && total_bound_satisfied`, else `0`.
    pub bounds_satisfied: u8,
}

impl VerificationDigest {
    /// Build a digest from a finalized report.
    pub fn generate(report: &VerificationReport) -> Self {
        let layers_passed = report.layers.iter().filter(|l| l.bound_satisfied).count() as u32;
        VerificationDigest {
            verification_set_hash: report.verification_set_hash,
            sample_count: report.sample_count,
            layers_passed,
            total_error_theoretical: report.total_error_theoretical,
            total_error_max_measured: report.total_error_max_measured,
            bounds_satisfied: report.passed() as u8,
        }
    }

    /// Hash the digest's fixed fields, the input to the certificate's
    /// mathematical-core section.
    pub fn hash(&self) -> Digest32 {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.verification_set_hash);
        buf.extend_from_slice(&self.sample_count.to_le_bytes());
        buf.extend_from_slice(&self.layers_passed.to_le_bytes());
        buf.extend_from_slice(&self.total_error_theoretical.to_le_bytes());
        buf.extend_from_slice(&self.total_error_max_measured.to_le_bytes());
        buf.push(self.bounds_satisfied);
        sha256(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linf_norm_is_max_abs_diff() {
        assert_eq!(linf_norm(&[1.0, 2.0, 3.0], &[1.0, 2.5, 2.0]), 1.0);
    }

    #[test]
    fn linf_norm_q16_decodes_before_comparing() {
        let one_q16 = 1i32 << 16;
        let err = linf_norm_q16(&[1.0], &[one_q16]);
        assert!(err < 1e-9);
    }

    #[test]
    fn equality_satisfies_weak_bound() {
        let mut faults = FaultFlags::new();
        let mut lc = LayerComparison::init(0, 1.0);
        lc.update(1.0);
        assert!(lc.check_bound(&mut faults));
        assert!(!faults.has_fatal());
    }

    #[test]
    fn exceeding_bound_sets_fatal_fault() {
        let mut faults = FaultFlags::new();
        let mut lc = LayerComparison::init(0, 1.0);
        lc.update(1.01);
        assert!(!lc.check_bound(&mut faults));
        assert!(faults.has_fatal());
    }

    #[test]
    fn lenient_mode_checks_every_layer() {
        let mut report = VerificationReport::init([0u8; 32], 10.0);
        let mut failing = LayerComparison::init(0, 1.0);
        failing.update(2.0);
        let mut passing = LayerComparison::init(1, 1.0);
        passing.update(0.5);
        report.layers.push(failing);
        report.layers.push(passing);
        report.update_total(2.0);
        report.check_all_bounds(&VerifyConfig::default());
        assert!(!report.all_bounds_satisfied);
        // Both layers were checked even though the first failed.
        assert!(report.layers[1].bound_satisfied);
    }

    #[test]
    fn variance_floors_at_zero() {
        let mut lc = LayerComparison::init(0, 10.0);
        lc.update(1.0);
        lc.finalize();
        assert_eq!(lc.error_std_measured, 0.0);
    }
}
