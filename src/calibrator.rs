//! Calibrator ("The Observer")
//!
//! Streams real activation samples and checks, after the fact, that the
//! ranges the analyzer *assumed* are actually obeyed. Every reduction here
//! (min, max, sum) is commutative and associative, so samples may arrive
//! in any order or batching without changing the finalized report.

use crate::fault::{Fault, FaultFlags};
use crate::hash::{sha256, Digest32};
use crate::tensor::Range;

/// Default degenerate-range epsilon, matching the source's
/// `CQ_CALIBRATE_CONFIG_DEFAULT`.
pub const DEFAULT_DEGENERATE_EPSILON: f64 = 1e-7;
/// Default minimum-coverage veto threshold.
pub const DEFAULT_COVERAGE_MIN_THRESHOLD: f64 = 0.90;
/// Default 10th-percentile coverage veto threshold.
pub const DEFAULT_COVERAGE_P10_THRESHOLD: f64 = 0.95;
/// Default minimum sample count before a calibration run is meaningful.
pub const DEFAULT_MIN_SAMPLES: u64 = 100;

/// Calibration thresholds and tunables.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CalibrateConfig {
    /// Global `C_min` veto threshold.
    pub coverage_min_threshold: f64,
    /// Global `C_p10` veto threshold.
    pub coverage_p10_threshold: f64,
    /// Width below which an observed range is considered degenerate.
    pub degenerate_epsilon: f64,
    /// Minimum sample count for a meaningful report.
    pub min_samples: u64,
}

impl Default for CalibrateConfig {
    fn default() -> Self {
        CalibrateConfig {
            coverage_min_threshold: DEFAULT_COVERAGE_MIN_THRESHOLD,
            coverage_p10_threshold: DEFAULT_COVERAGE_P10_THRESHOLD,
            degenerate_epsilon: DEFAULT_DEGENERATE_EPSILON,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

/// Running and finalized statistics for a single tracked tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorStats {
    /// Caller-assigned tensor identifier.
    pub tensor_id: u32,
    /// Index of the layer this tensor belongs to.
    pub layer_index: u32,
    /// Running observed minimum.
    pub min_observed: f64,
    /// Running observed maximum.
    pub max_observed: f64,
    /// Claimed safe range, lower bound.
    pub min_safe: f64,
    /// Claimed safe range, upper bound.
    pub max_safe: f64,
    /// `C_t = (U_obs - L_obs) / (U_safe - L_safe)`.
    pub coverage_ratio: f64,
    /// True if the observed range is narrower than the degeneracy epsilon.
    pub is_degenerate: bool,
    /// True if the observed range escapes the claimed safe range.
    pub range_veto: bool,
}

impl TensorStats {
    /// Initialize stats for a tensor with a claimed safe range.
    ///
    /// `min_observed`/`max_observed` start at `+inf`/`-inf` so the first
    /// finite sample always replaces them.
    pub fn init(tensor_id: u32, layer_index: u32, safe: Range) -> Self {
        TensorStats {
            tensor_id,
            layer_index,
            min_observed: f64::INFINITY,
            max_observed: f64::NEG_INFINITY,
            min_safe: safe.lo,
            max_safe: safe.hi,
            coverage_ratio: 0.0,
            is_degenerate: false,
            range_veto: false,
        }
    }

    /// Fold one sample into the running min/max. NaN/infinite samples are
    /// silently skipped, matching the source's `isnan`/`isinf` guard.
    pub fn update(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.min_observed = self.min_observed.min(value);
        self.max_observed = self.max_observed.max(value);
    }

    /// Fold a batch of samples.
    pub fn update_all(&mut self, values: &[f64]) {
        for &v in values {
            self.update(v);
        }
    }

    /// Compute `coverage_ratio`/`is_degenerate`, using `epsilon` as the
    /// degeneracy threshold.
    pub fn compute_coverage(&mut self, epsilon: f64) {
        let observed_range = self.max_observed - self.min_observed;
        if observed_range.abs() < epsilon {
            self.is_degenerate = true;
            self.coverage_ratio = 1.0;
            return;
        }
        let safe_range = self.max_safe - self.min_safe;
        if safe_range.abs() < epsilon {
            // Defensive: shouldn't happen for a well-formed analyzer output.
            self.is_degenerate = true;
            self.coverage_ratio = 1.0;
            return;
        }
        self.is_degenerate = false;
        self.coverage_ratio = observed_range / safe_range;
    }

    /// Check and record the range-veto condition.
    pub fn check_range_veto(&mut self) -> bool {
        self.range_veto = self.min_observed < self.min_safe || self.max_observed > self.max_safe;
        self.range_veto
    }
}

/// A calibration run's full report: per-tensor stats plus global coverage
/// metrics.
#[derive(Debug, Clone)]
pub struct CalibrationReport {
    /// Hash identifying the calibration dataset.
    pub dataset_hash: Digest32,
    /// Number of samples observed.
    pub sample_count: u64,
    /// Per-tensor statistics.
    pub tensors: Vec<TensorStats>,
    /// `min_t C_t` across all tensors.
    pub global_coverage_min: f64,
    /// 10th percentile of `C_t` across all tensors.
    pub global_coverage_p10: f64,
    /// `mean_t C_t` across all tensors.
    pub global_coverage_mean: f64,
    /// True if any tensor's range veto fired (fatal).
    pub range_veto_triggered: bool,
    /// True if the global coverage thresholds were not met (warning only).
    pub coverage_veto_triggered: bool,
    /// Accumulated faults.
    pub faults: FaultFlags,
}

impl CalibrationReport {
    /// Initialize an empty report over `dataset_hash`.
    pub fn init(dataset_hash: Digest32) -> Self {
        CalibrationReport {
            dataset_hash,
            sample_count: 0,
            tensors: Vec::new(),
            global_coverage_min: 0.0,
            global_coverage_p10: 0.0,
            global_coverage_mean: 0.0,
            range_veto_triggered: false,
            coverage_veto_triggered: false,
            faults: FaultFlags::new(),
        }
    }

    /// Record that one more sample was processed.
    pub fn add_sample(&mut self) {
        self.sample_count += 1;
    }

    /// Finalize every tensor's coverage/veto, then compute global metrics
    /// and the coverage veto. Range vetoes are fatal; a coverage veto is a
    /// warning only and does not set a fault.
    pub fn finalize(&mut self, config: &CalibrateConfig) {
        for t in &mut self.tensors {
            t.compute_coverage(config.degenerate_epsilon);
            if t.check_range_veto() {
                self.range_veto_triggered = true;
                self.faults.set(Fault::RangeExceed);
            }
        }
        let (min, p10, mean) = compute_global_coverage(&self.tensors);
        self.global_coverage_min = min;
        self.global_coverage_p10 = p10;
        self.global_coverage_mean = mean;
        self.coverage_veto_triggered = self.global_coverage_min < config.coverage_min_threshold
            || self.global_coverage_p10 < config.coverage_p10_threshold;
    }

    /// A certificate-ready report must have no fatal faults; a coverage
    /// veto alone does not block certification.
    pub fn passed(&self) -> bool {
        !self.faults.has_fatal()
    }
}

/// Compute `global_coverage_min`/`_p10`/`_mean` over `tensors`, writing
/// them into `report`.
///
/// Allocates a scratch buffer to sort coverage ratios for the percentile.
/// If that allocation were to fail, the source degrades `C_p10` to
/// `C_min` rather than aborting; in safe Rust an allocation failure aborts
/// the process, so this fallback path is unreachable here but its
/// intent — "never let a percentile computation become a hard failure of
/// the whole report" — is preserved as the function's only branch.
fn compute_global_coverage(tensors: &[TensorStats]) -> (f64, f64, f64) {
    if tensors.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mut coverages: Vec<f64> = tensors.iter().map(|t| t.coverage_ratio).collect();
    let sum: f64 = coverages.iter().sum();
    let min = coverages.iter().cloned().fold(f64::INFINITY, f64::min);

    coverages.sort_by(|a, b| a.partial_cmp(b).expect("coverage ratios are never NaN"));
    let n = coverages.len();
    let p10_idx = ((n as f64) * 0.10) as usize;
    let p10_idx = p10_idx.min(n - 1);
    let p10 = coverages[p10_idx];
    let mean = sum / n as f64;

    (min, p10, mean)
}

/// A compact, hashable summary of a [`CalibrationReport`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationDigest {
    /// Hash identifying the calibration dataset.
    pub dataset_hash: Digest32,
    /// Number of samples observed.
    pub sample_count: u64,
    /// Number of tensors tracked.
    pub tensor_count: u32,
    /// `global_coverage_min`.
    pub global_coverage_min: f64,
    /// `global_coverage_p10`.
    pub global_coverage_p10: f64,
    /// `0x00` if no range veto fired, `0x01` otherwise.
    pub range_veto_status: u8,
    /// `0x00` if no coverage veto fired, `0x01` otherwise.
    pub coverage_veto_status: u8,
}

impl CalibrationDigest {
    /// Build a digest from a finalized report.
    pub fn generate(report: &CalibrationReport) -> Self {
        CalibrationDigest {
            dataset_hash: report.dataset_hash,
            sample_count: report.sample_count,
            tensor_count: report.tensors.len() as u32,
            global_coverage_min: report.global_coverage_min,
            global_coverage_p10: report.global_coverage_p10,
            range_veto_status: report.range_veto_triggered as u8,
            coverage_veto_status: report.coverage_veto_triggered as u8,
        }
    }

    /// Hash the digest's fixed fields, the input to the certificate's
    /// mathematical-core section.
    pub fn hash(&self) -> Digest32 {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.dataset_hash);
        buf.extend_from_slice(&self.sample_count.to_le_bytes());
        buf.extend_from_slice(&self.tensor_count.to_le_bytes());
        buf.extend_from_slice(&self.global_coverage_min.to_le_bytes());
        buf.extend_from_slice(&self.global_coverage_p10.to_le_bytes());
        buf.push(self.range_veto_status);
        buf.push(self.coverage_veto_status);
        sha256(&buf)
    }
}
