//! Conversion ("The Transformer")
//!
//! Everything that turns a floating-point source model into the symmetric
//! fixed-point tensors the rest of this crate certifies: round-to-nearest-
//! even weight quantization, symmetric/dyadic constraint enforcement, and
//! BatchNorm folding with provenance hashing. Not one of the five lettered
//! components in the original distillation, but its outputs (the BatchNorm
//! folding hash/status, the quantized weights referenced by the notary's
//! source-identity claim) are load-bearing inputs to [`crate::certificate`],
//! so it is built and tested alongside the rest of the core.

use crate::fault::{Fault, FaultFlags};
use crate::hash::{sha256, sha256_concat, Digest32};
use crate::tensor::{LayerHeader, TensorSpec};

/// Errors from constraint enforcement and BatchNorm folding.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// A tensor spec required symmetric quantization but wasn't.
    #[error("tensor spec is not symmetric")]
    Asymmetric,
    /// `bias.scale_exp != weight.scale_exp + input.scale_exp`.
    #[error("dyadic constraint violated: bias_exp={bias_exp}, expected={expected}")]
    DyadicViolation {
        /// The bias spec's actual scale exponent.
        bias_exp: i8,
        /// `weight.scale_exp + input.scale_exp`.
        expected: i32,
    },
    /// BatchNorm channel count didn't match the weight matrix's row count.
    #[error("BatchNorm channel_count ({channels}) != weight rows ({rows})")]
    DimensionMismatch {
        /// Declared channel count.
        channels: usize,
        /// Weight row count.
        rows: usize,
    },
    /// `var[i] + epsilon <= 0`, which would require a division by zero or
    /// the square root of a nonpositive number.
    #[error("channel {0}: var + epsilon <= 0")]
    NonPositiveVariance(usize),
}

/// Quantize a single floating-point weight to a fixed-point code, rounding
/// half-to-even.
///
/// Uses `f64` for the scaling multiply, then corrects the platform's
/// round-half-away-from-zero (`f64::round`) to round-half-to-even by
/// checking the tie case explicitly and nudging toward the even integer,
/// mirroring the source's RNE correction.
pub fn quantize_weight_rne(w_fp: f32, scale: f64, faults: &mut FaultFlags) -> i32 {
    let scaled = f64::from(w_fp) * scale;
    let mut r = scaled.round();
    let diff = r - scaled;

    if diff.abs() == 0.5 {
        let i = r as i64;
        if i % 2 != 0 {
            if scaled > 0.0 {
                r -= 1.0;
            } else {
                r += 1.0;
            }
        }
    }

    if r > i32::MAX as f64 {
        faults.set(Fault::Overflow);
        i32::MAX
    } else if r < i32::MIN as f64 {
        faults.set(Fault::Underflow);
        i32::MIN
    } else {
        r as i32
    }
}

/// Enforce that `spec` is symmetric, flagging and erroring otherwise.
pub fn verify_symmetric(spec: &TensorSpec, faults: &mut FaultFlags) -> Result<(), ConvertError> {
    if !spec.is_symmetric {
        faults.set(Fault::Asymmetric);
        return Err(ConvertError::Asymmetric);
    }
    Ok(())
}

/// Enforce symmetry on weight/input/bias and the dyadic scale constraint
/// for a layer, updating `header.dyadic_valid`.
pub fn verify_layer_constraints(
    header: &mut LayerHeader,
    faults: &mut FaultFlags,
) -> Result<(), ConvertError> {
    verify_symmetric(&header.weight_spec, faults)?;
    verify_symmetric(&header.input_spec, faults)?;
    verify_symmetric(&header.bias_spec, faults)?;

    let expected = header.weight_spec.scale_exp as i32 + header.input_spec.scale_exp as i32;
    if header.bias_spec.scale_exp as i32 != expected {
        header.dyadic_valid = false;
        return Err(ConvertError::DyadicViolation {
            bias_exp: header.bias_spec.scale_exp,
            expected,
        });
    }
    header.dyadic_valid = true;
    Ok(())
}

/// Quantize a whole weight tensor, enforcing symmetry first.
pub fn convert_weights(
    w_fp: &[f32],
    spec: &TensorSpec,
    faults: &mut FaultFlags,
) -> Result<Vec<i32>, ConvertError> {
    verify_symmetric(spec, faults)?;
    let scale = spec.scale();
    Ok(w_fp
        .iter()
        .map(|&w| quantize_weight_rne(w, scale, faults))
        .collect())
}

/// BatchNorm parameters for a set of channels, pre-folding.
#[derive(Debug, Clone)]
pub struct BatchNormParams {
    /// Per-channel scale parameter `γ`.
    pub gamma: Vec<f32>,
    /// Per-channel shift parameter `β`.
    pub beta: Vec<f32>,
    /// Per-channel running mean `μ`.
    pub mean: Vec<f32>,
    /// Per-channel running variance `σ²`.
    pub var: Vec<f32>,
    /// Numerical stabilizer `ε`.
    pub epsilon: f32,
}

impl BatchNormParams {
    /// Number of channels these parameters cover.
    pub fn channel_count(&self) -> usize {
        self.gamma.len()
    }
}

/// Provenance record for a BatchNorm-folding operation, carried through to
/// the certificate's source-identity section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BnFoldingRecord {
    /// SHA-256 of the pre-fold BatchNorm parameters.
    pub original_bn_hash: Digest32,
    /// SHA-256 of the post-fold weight/bias arrays.
    pub folded_weights_hash: Digest32,
    /// Whether folding actually happened (always `true` on a successful
    /// call to [`fold_batchnorm`]).
    pub folding_occurred: bool,
}

impl BnFoldingRecord {
    /// Hash the record's fields. This is the value the certificate's
    /// `bn_folding_hash` field stores, so a caller can't assert BatchNorm
    /// provenance without actually having run [`fold_batchnorm`].
    pub fn hash(&self) -> Digest32 {
        let mut buf = Vec::with_capacity(65);
        buf.extend_from_slice(&self.original_bn_hash);
        buf.extend_from_slice(&self.folded_weights_hash);
        buf.push(self.folding_occurred as u8);
        sha256(&buf)
    }
}

/// Fold BatchNorm parameters into preceding linear-layer weights and bias:
/// `W' = W·γ/√(σ²+ε)`, `b' = (b-μ)·γ/√(σ²+ε) + β`.
///
/// Folding arithmetic runs in `f64` even though inputs/outputs are `f32`,
/// matching the source's explicit precision note for this step. Returns
/// the folded weights, folded bias, and a hashed provenance record.
///
/// `var[i] + epsilon <= 0` is a fatal [`Fault::DivZero`] in addition to the
/// returned error, matching the source's `faults->div_zero = 1`.
pub fn fold_batchnorm(
    weights: &[f32],
    bias: Option<&[f32]>,
    bn: &BatchNormParams,
    rows: usize,
    cols: usize,
    faults: &mut FaultFlags,
) -> Result<(Vec<f32>, Vec<f32>, BnFoldingRecord), ConvertError> {
    if bn.channel_count() != rows {
        return Err(ConvertError::DimensionMismatch {
            channels: bn.channel_count(),
            rows,
        });
    }

    let gamma_bytes = le_bytes_of(&bn.gamma);
    let beta_bytes = le_bytes_of(&bn.beta);
    let mean_bytes = le_bytes_of(&bn.mean);
    let var_bytes = le_bytes_of(&bn.var);
    let original_bn_hash = sha256_concat(&[
        &gamma_bytes,
        &beta_bytes,
        &mean_bytes,
        &var_bytes,
        &bn.epsilon.to_le_bytes(),
    ]);

    let mut w_folded = vec![0f32; rows * cols];
    let mut b_folded = vec![0f32; rows];

    for i in 0..rows {
        let var_eps = f64::from(bn.var[i]) + f64::from(bn.epsilon);
        if var_eps <= 0.0 {
            faults.set(Fault::DivZero);
            return Err(ConvertError::NonPositiveVariance(i));
        }
        let inv_std = 1.0 / var_eps.sqrt();
        let scale = f64::from(bn.gamma[i]) * inv_std;
        let offset = f64::from(bn.beta[i]) - f64::from(bn.mean[i]) * scale;

        let old_b = bias.map(|b| f64::from(b[i])).unwrap_or(0.0);
        b_folded[i] = (old_b * scale + offset) as f32;

        for j in 0..cols {
            let idx = i * cols + j;
            w_folded[idx] = (f64::from(weights[idx]) * scale) as f32;
        }
    }

    let w_folded_bytes = le_bytes_of(&w_folded);
    let b_folded_bytes = le_bytes_of(&b_folded);
    let folded_weights_hash = sha256_concat(&[&w_folded_bytes, &b_folded_bytes]);

    Ok((
        w_folded,
        b_folded,
        BnFoldingRecord {
            original_bn_hash,
            folded_weights_hash,
            folding_occurred: true,
        },
    ))
}

/// Serialize a `f32` slice to little-endian bytes, the same in-memory
/// layout the source hashes directly. This crate forbids `unsafe`, so the
/// bytes are copied rather than reinterpreted in place.
fn le_bytes_of(values: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Format;

    #[test]
    fn quantize_rne_ties_to_even() {
        let mut f = FaultFlags::new();
        // 0.5 scaled by 1.0 ties between 0 and 1 -> even (0)
        assert_eq!(quantize_weight_rne(0.5, 1.0, &mut f), 0);
        // 1.5 ties between 1 and 2 -> even (2)
        assert_eq!(quantize_weight_rne(1.5, 1.0, &mut f), 2);
        assert!(!f.has_fatal());
    }

    #[test]
    fn quantize_saturates() {
        let mut f = FaultFlags::new();
        let q = quantize_weight_rne(1e10, 1.0, &mut f);
        assert_eq!(q, i32::MAX);
        assert!(f.has(Fault::Overflow));
    }

    #[test]
    fn asymmetric_spec_is_fatal() {
        let spec = TensorSpec {
            scale_exp: 16,
            format: Format::Q16_16,
            is_symmetric: false,
        };
        let mut f = FaultFlags::new();
        assert!(verify_symmetric(&spec, &mut f).is_err());
        assert!(f.has_fatal());
    }

    #[test]
    fn dyadic_constraint_checked() {
        let mut header = LayerHeader {
            layer_index: 0,
            layer_kind: crate::tensor::LayerKind::Linear,
            weight_spec: TensorSpec::symmetric(16, Format::Q16_16),
            input_spec: TensorSpec::symmetric(16, Format::Q16_16),
            bias_spec: TensorSpec::symmetric(32, Format::Q16_16),
            output_spec: TensorSpec::symmetric(16, Format::Q16_16),
            fan_in: 4,
            fan_out: 4,
            dyadic_valid: false,
        };
        let mut f = FaultFlags::new();
        assert!(verify_layer_constraints(&mut header, &mut f).is_ok());
        assert!(header.dyadic_valid);

        header.bias_spec.scale_exp = 31;
        let mut f = FaultFlags::new();
        assert!(verify_layer_constraints(&mut header, &mut f).is_err());
        assert!(!header.dyadic_valid);
    }

    #[test]
    fn batchnorm_fold_matches_closed_form() {
        let bn = BatchNormParams {
            gamma: vec![2.0],
            beta: vec![0.5],
            mean: vec![1.0],
            var: vec![3.0],
            epsilon: 1.0,
        };
        let weights = vec![1.0, 2.0];
        let bias = vec![0.0];
        let mut f = FaultFlags::new();
        let (w_folded, b_folded, record) =
            fold_batchnorm(&weights, Some(&bias), &bn, 1, 2, &mut f).unwrap();

        let expected_scale = 2.0 / 4f64.sqrt(); // gamma / sqrt(var+eps) = 2/2 = 1
        assert!((w_folded[0] as f64 - 1.0 * expected_scale).abs() < 1e-6);
        assert!((w_folded[1] as f64 - 2.0 * expected_scale).abs() < 1e-6);
        let expected_offset = 0.5 - 1.0 * expected_scale;
        assert!((b_folded[0] as f64 - expected_offset).abs() < 1e-6);
        assert!(record.folding_occurred);
        assert!(!f.has_fatal());
    }

    #[test]
    fn bn_folding_record_hash_is_deterministic() {
        let record = BnFoldingRecord {
            original_bn_hash: [1u8; 32],
            folded_weights_hash: [2u8; 32],
            folding_occurred: true,
        };
        let same = record;
        assert_eq!(record.hash(), same.hash());

        let unfolded = BnFoldingRecord {
            folding_occurred: false,
            ..record
        };
        assert_ne!(record.hash(), unfolded.hash());
    }

    #[test]
    fn batchnorm_rejects_nonpositive_variance() {
        let bn = BatchNormParams {
            gamma: vec![1.0],
            beta: vec![0.0],
            mean: vec![0.0],
            var: vec![-1.0],
            epsilon: 0.5,
        };
        let weights = vec![1.0];
        let mut f = FaultFlags::new();
        let err = fold_batchnorm(&weights, None, &bn, 1, 1, &mut f).unwrap_err();
        assert!(matches!(err, ConvertError::NonPositiveVariance(0)));
        assert!(f.has(Fault::DivZero));
        assert!(f.has_fatal());
    }

    #[test]
    fn batchnorm_rejects_dimension_mismatch() {
        let bn = BatchNormParams {
            gamma: vec![1.0, 1.0],
            beta: vec![0.0, 0.0],
            mean: vec![0.0, 0.0],
            var: vec![1.0, 1.0],
            epsilon: 0.5,
        };
        let weights = vec![1.0];
        let mut f = FaultFlags::new();
        let err = fold_batchnorm(&weights, None, &bn, 1, 1, &mut f).unwrap_err();
        assert!(matches!(err, ConvertError::DimensionMismatch { .. }));
    }
}
