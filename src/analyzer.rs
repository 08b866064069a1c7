//! Static Analyzer ("The Theorist")
//!
//! Pre-inference interval arithmetic, overflow proofs, and a-priori error
//! bound recurrence. Runs entirely over floating-point weights and
//! topology; it never touches quantized codes or sample data — that's the
//! calibrator's and verifier's job downstream. A layer contract moves
//! through an explicit state machine (`Empty → Ranged → Normed → Errored →
//! OverflowProven → Sealed`); a contract may only be sealed once every
//! prior stage has succeeded.

use crate::fault::{Fault, FaultFlags};
use crate::fixed::{compute_overflow_proof, OverflowProof};
use crate::hash::{sha256, Digest32};
use crate::tensor::{LayerKind, Range};

/// Errors from analyzer operations.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    /// Range/error propagation was requested for an unsupported layer kind.
    #[error("layer kind {0:?} is not supported by range propagation")]
    UnsupportedLayerKind(LayerKind),
    /// A contract's stage was advanced out of order.
    #[error("layer {layer_index}: cannot seal contract in state {state:?}")]
    NotReady {
        /// Index of the offending layer.
        layer_index: u32,
        /// The contract's current lifecycle state.
        state: ContractState,
    },
    /// A weight or bias value was NaN or infinite.
    #[error("layer {0}: non-finite value in weights or bias")]
    NonFinite(u32),
}

/// Which norm to use as the amplification factor `A_ℓ` for a linear layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// `√(Σ wᵢⱼ²)` — looser, cheap.
    Frobenius,
    /// `maxᵢ Σⱼ |wᵢⱼ|` — tight for linear+ReLU chains.
    RowSum,
}

/// Compute the Frobenius norm of a row-major `rows × cols` matrix.
pub fn frobenius_norm(w: &[f64], rows: usize, cols: usize) -> f64 {
    debug_assert_eq!(w.len(), rows * cols);
    w.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Compute the induced L∞ (row-sum) norm of a row-major `rows × cols` matrix.
pub fn row_sum_norm(w: &[f64], rows: usize, cols: usize) -> f64 {
    debug_assert_eq!(w.len(), rows * cols);
    (0..rows)
        .map(|i| w[i * cols..(i + 1) * cols].iter().map(|x| x.abs()).sum())
        .fold(0.0_f64, f64::max)
}

/// Compute the weight value-range by a plain min/max scan.
pub fn compute_weight_range(w: &[f64]) -> Range {
    if w.is_empty() {
        return Range { lo: 0.0, hi: 0.0 };
    }
    let mut lo = w[0];
    let mut hi = w[0];
    for &v in &w[1..] {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    Range { lo, hi }
}

/// Propagate a value range through a linear layer: convex hull of the four
/// corner products, scaled by fan-in, plus the bias range.
pub fn propagate_range_linear(
    weight: &Range,
    input: &Range,
    fan_in: usize,
    bias: Option<&Range>,
) -> Range {
    let corners = [
        weight.lo * input.lo,
        weight.lo * input.hi,
        weight.hi * input.lo,
        weight.hi * input.hi,
    ];
    let mut lo = corners[0];
    let mut hi = corners[0];
    for &c in &corners[1..] {
        lo = lo.min(c);
        hi = hi.max(c);
    }
    let n = fan_in as f64;
    lo *= n;
    hi *= n;
    if let Some(b) = bias {
        lo += b.lo;
        hi += b.hi;
    }
    Range { lo, hi }
}

/// Propagate a value range through ReLU: clamp both endpoints at zero.
pub fn propagate_range_relu(input: &Range) -> Range {
    Range {
        lo: input.lo.max(0.0),
        hi: input.hi.max(0.0),
    }
}

/// Static error contributions for one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorContributions {
    /// Error from quantizing weights: `(1/(2·S_w))·‖x‖_max`.
    pub weight_error_contrib: f64,
    /// Error from quantizing bias, assuming `S_x = S_w`: `1/(2·S_w²)`.
    pub bias_error_contrib: f64,
    /// Error from rounding the projection back to the output scale.
    pub projection_error: f64,
    /// Sum of the three contributions, `L_ℓ`.
    pub local_error_sum: f64,
}

/// Compute the three static error contributions for a layer.
pub fn compute_error_contributions(
    weight_scale: f64,
    output_scale: f64,
    max_input_norm: f64,
) -> ErrorContributions {
    let weight_error_contrib = (0.5 / weight_scale) * max_input_norm;
    let bias_error_contrib = 0.5 / (weight_scale * weight_scale);
    let projection_error = 0.5 / output_scale;
    ErrorContributions {
        weight_error_contrib,
        bias_error_contrib,
        projection_error,
        local_error_sum: weight_error_contrib + bias_error_contrib + projection_error,
    }
}

/// `ε₀ = 1/(2·S_in)`, the entry error from quantizing the model's inputs.
pub fn compute_entry_error(input_scale_exp: i8) -> f64 {
    0.5 / 2f64.powi(input_scale_exp as i32)
}

/// The lifecycle state of a single layer contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractState {
    /// Freshly initialized, no analysis performed yet.
    Empty,
    /// Input/output/weight ranges have been propagated.
    Ranged,
    /// The amplification factor has been computed.
    Normed,
    /// Static error contributions and the recurrence have been applied.
    Errored,
    /// The overflow-safety proof has been computed.
    OverflowProven,
    /// Fully analyzed and immutable.
    Sealed,
}

/// The a-priori analysis contract for a single layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerContract {
    /// Index of this layer.
    pub layer_index: u32,
    /// Kind of this layer.
    pub layer_kind: LayerKind,
    /// Number of input features.
    pub fan_in: usize,
    /// Number of output features.
    pub fan_out: usize,
    /// Propagated weight range.
    pub weight_range: Range,
    /// Propagated input range.
    pub input_range: Range,
    /// Propagated output range.
    pub output_range: Range,
    /// Upper bound on the operator norm of this layer's weights.
    pub amp_factor: f64,
    /// Error contributed by weight quantization.
    pub weight_error_contrib: f64,
    /// Error contributed by bias quantization.
    pub bias_error_contrib: f64,
    /// Error contributed by output projection rounding.
    pub projection_error: f64,
    /// `L_ℓ`, the sum of the three contributions above.
    pub local_error_sum: f64,
    /// Inherited input error bound `ε_ℓ`.
    pub input_error_bound: f64,
    /// Computed output error bound `ε_{ℓ+1} = A_ℓ·ε_ℓ + L_ℓ`.
    pub output_error_bound: f64,
    /// Overflow-safety proof for this layer's accumulator.
    pub overflow_proof: OverflowProof,
    /// Whether this contract completed every stage without a fatal fault.
    pub is_valid: bool,
    /// Current lifecycle stage.
    pub state: ContractState,
}

impl LayerContract {
    /// Initialize an empty contract for a layer.
    pub fn init(layer_index: u32, layer_kind: LayerKind, fan_in: usize, fan_out: usize) -> Self {
        LayerContract {
            layer_index,
            layer_kind,
            fan_in,
            fan_out,
            weight_range: Range { lo: 0.0, hi: 0.0 },
            input_range: Range { lo: 0.0, hi: 0.0 },
            output_range: Range { lo: 0.0, hi: 0.0 },
            amp_factor: 1.0,
            weight_error_contrib: 0.0,
            bias_error_contrib: 0.0,
            projection_error: 0.0,
            local_error_sum: 0.0,
            input_error_bound: 0.0,
            output_error_bound: 0.0,
            overflow_proof: OverflowProof {
                max_weight_mag: 0,
                max_input_mag: 0,
                dot_product_len: 0,
                safety_margin: 1 << 63,
                is_safe: false,
            },
            is_valid: false,
            state: ContractState::Empty,
        }
    }

    /// Propagate ranges for this layer (stage 1).
    pub fn propagate_ranges(
        &mut self,
        weight: Range,
        input: Range,
        bias: Option<&Range>,
    ) -> Result<(), AnalyzerError> {
        self.weight_range = weight;
        self.input_range = input;
        self.output_range = match self.layer_kind {
            LayerKind::Linear => propagate_range_linear(&weight, &input, self.fan_in, bias),
            LayerKind::Relu => propagate_range_relu(&input),
            other => return Err(AnalyzerError::UnsupportedLayerKind(other)),
        };
        self.state = ContractState::Ranged;
        Ok(())
    }

    /// Compute the amplification factor (stage 2).
    pub fn compute_norm(&mut self, w: &[f64], rows: usize, cols: usize, kind: NormKind) {
        self.amp_factor = match kind {
            NormKind::Frobenius => frobenius_norm(w, rows, cols),
            NormKind::RowSum => row_sum_norm(w, rows, cols),
        };
        self.state = ContractState::Normed;
    }

    /// Apply static error contributions and the recurrence (stage 3).
    pub fn apply_error_recurrence(
        &mut self,
        weight_scale: f64,
        output_scale: f64,
        max_input_norm: f64,
        input_error_bound: f64,
    ) {
        let c = compute_error_contributions(weight_scale, output_scale, max_input_norm);
        self.weight_error_contrib = c.weight_error_contrib;
        self.bias_error_contrib = c.bias_error_contrib;
        self.projection_error = c.projection_error;
        self.local_error_sum = c.local_error_sum;
        self.input_error_bound = input_error_bound;
        self.output_error_bound = self.amp_factor * input_error_bound + c.local_error_sum;
        self.state = ContractState::Errored;
    }

    /// Compute and attach the overflow-safety proof (stage 4).
    pub fn prove_overflow_safety(&mut self, max_weight_mag: u64, max_input_mag: u64) {
        self.overflow_proof =
            compute_overflow_proof(self.fan_in as u64, max_weight_mag, max_input_mag);
        self.state = ContractState::OverflowProven;
    }

    /// Seal the contract: may only be called once every stage succeeded.
    pub fn seal(&mut self, faults: &mut FaultFlags) -> Result<(), AnalyzerError> {
        if self.state != ContractState::OverflowProven {
            return Err(AnalyzerError::NotReady {
                layer_index: self.layer_index,
                state: self.state,
            });
        }
        if !self.overflow_proof.is_safe {
            faults.set(Fault::RangeExceed);
        }
        self.is_valid = self.overflow_proof.is_safe;
        self.state = ContractState::Sealed;
        Ok(())
    }
}

/// The full analysis context for a network: entry error plus every layer's
/// sealed contract.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    /// `ε₀ = 1/(2·S_in)`.
    pub entry_error: f64,
    /// Scale exponent of the model's input tensor.
    pub input_scale_exp: i8,
    /// Sealed layer contracts, in topological order.
    pub layers: Vec<LayerContract>,
    /// `ε_total`, the last layer's output error bound.
    pub total_error_bound: f64,
    /// Whether every layer has been processed.
    pub is_complete: bool,
    /// Whether every layer sealed without a fatal fault.
    pub is_valid: bool,
    /// Accumulated faults across every layer.
    pub faults: FaultFlags,
}

impl AnalysisContext {
    /// Initialize an analysis context for a model whose input tensor has
    /// scale exponent `input_scale_exp`.
    pub fn init(input_scale_exp: i8) -> Self {
        AnalysisContext {
            entry_error: compute_entry_error(input_scale_exp),
            input_scale_exp,
            layers: Vec::new(),
            total_error_bound: 0.0,
            is_complete: false,
            is_valid: false,
            faults: FaultFlags::new(),
        }
    }

    /// Append a sealed layer contract, merging its faults.
    pub fn push_layer(&mut self, contract: LayerContract, layer_faults: FaultFlags) {
        self.faults.merge(layer_faults);
        self.layers.push(contract);
    }

    /// Finalize the context: `ε_total` is the entry error if there are no
    /// layers, otherwise the last layer's output bound. Validity is the
    /// conjunction of every layer's validity.
    pub fn finalize(&mut self) {
        self.total_error_bound = self
            .layers
            .last()
            .map(|l| l.output_error_bound)
            .unwrap_or(self.entry_error);
        self.is_valid = self.layers.iter().all(|l| l.is_valid);
        self.is_complete = true;
    }
}

/// A compact, hashable summary of an [`AnalysisContext`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisDigest {
    /// `ε₀`.
    pub entry_error: f64,
    /// `ε_total`.
    pub total_error_bound: f64,
    /// Number of layers analyzed.
    pub layer_count: u32,
    /// Number of layers whose overflow proof is safe.
    pub overflow_safe_count: u32,
    /// SHA-256 of the serialized layer contracts.
    pub layers_hash: Digest32,
}

impl AnalysisDigest {
    /// Serialize `ctx` into a fixed, field-ordered byte layout and hash it.
    /// The layout is internal to this crate (there is no cross-process
    /// struct-layout contract here, unlike the certificate's wire format),
    /// but must stay stable within a single process's lifetime for
    /// [`crate::certificate`]'s digest hashing to be reproducible.
    fn hash_layers(ctx: &AnalysisContext) -> Digest32 {
        if ctx.layers.is_empty() {
            return [0u8; 32];
        }
        let mut buf = Vec::with_capacity(ctx.layers.len() * 64);
        for l in &ctx.layers {
            buf.extend_from_slice(&l.layer_index.to_le_bytes());
            buf.extend_from_slice(&(l.layer_kind as i32).to_le_bytes());
            buf.extend_from_slice(&l.weight_range.lo.to_le_bytes());
            buf.extend_from_slice(&l.weight_range.hi.to_le_bytes());
            buf.extend_from_slice(&l.input_range.lo.to_le_bytes());
            buf.extend_from_slice(&l.input_range.hi.to_le_bytes());
            buf.extend_from_slice(&l.output_range.lo.to_le_bytes());
            buf.extend_from_slice(&l.output_range.hi.to_le_bytes());
            buf.extend_from_slice(&l.amp_factor.to_le_bytes());
            buf.extend_from_slice(&l.output_error_bound.to_le_bytes());
            buf.extend_from_slice(&(l.is_valid as u8).to_le_bytes());
        }
        sha256(&buf)
    }

    /// Build a digest from a finalized analysis context.
    pub fn generate(ctx: &AnalysisContext) -> Self {
        let overflow_safe_count = ctx
            .layers
            .iter()
            .filter(|l| l.overflow_proof.is_safe)
            .count() as u32;
        AnalysisDigest {
            entry_error: ctx.entry_error,
            total_error_bound: ctx.total_error_bound,
            layer_count: ctx.layers.len() as u32,
            overflow_safe_count,
            layers_hash: Self::hash_layers(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_propagation_example() {
        let w = Range::new(-1.0, 1.0);
        let x = Range::new(-1.0, 1.0);
        let out = propagate_range_linear(&w, &x, 3, None);
        assert_eq!(out, Range::new(-3.0, 3.0));
        let relu = propagate_range_relu(&out);
        assert_eq!(relu, Range::new(0.0, 3.0));
    }

    #[test]
    fn error_recurrence_three_layers() {
        let mut eps = 1e-4_f64;
        let a = 1.5;
        let l = 0.001;
        let expected = [1.15e-3, 2.725e-3, 5.0875e-3];
        for &want in &expected {
            eps = a * eps + l;
            assert!((eps - want).abs() < 1e-9, "eps={eps} want={want}");
        }
    }

    #[test]
    fn contract_must_pass_every_stage_before_sealing() {
        let mut c = LayerContract::init(0, LayerKind::Linear, 4, 4);
        let mut faults = FaultFlags::new();
        assert!(c.seal(&mut faults).is_err());

        c.propagate_ranges(Range::new(-1.0, 1.0), Range::new(-1.0, 1.0), None)
            .unwrap();
        c.compute_norm(&[1.0, 0.0, 0.0, 1.0], 2, 2, NormKind::Frobenius);
        c.apply_error_recurrence(65536.0, 65536.0, 1.0, 1e-4);
        c.prove_overflow_safety(1 << 10, 1 << 10);
        assert!(c.seal(&mut faults).is_ok());
        assert_eq!(c.state, ContractState::Sealed);
        assert!(c.is_valid);
    }

    #[test]
    fn unsafe_overflow_proof_marks_layer_invalid() {
        let mut c = LayerContract::init(0, LayerKind::Linear, 2, 2);
        let mut faults = FaultFlags::new();
        c.propagate_ranges(Range::new(-1.0, 1.0), Range::new(-1.0, 1.0), None)
            .unwrap();
        c.compute_norm(&[1.0, 0.0, 0.0, 1.0], 2, 2, NormKind::Frobenius);
        c.apply_error_recurrence(1.0, 1.0, 1.0, 1e-4);
        c.prove_overflow_safety(1u64 << 31, 1u64 << 31);
        c.seal(&mut faults).unwrap();
        assert!(!c.is_valid);
        assert!(faults.has_fatal());
    }

    #[test]
    fn total_error_defaults_to_entry_error_with_no_layers() {
        let mut ctx = AnalysisContext::init(16);
        ctx.finalize();
        assert_eq!(ctx.total_error_bound, ctx.entry_error);
        assert!(ctx.is_valid);
    }

    #[test]
    fn digest_empty_layers_hash_is_zero() {
        let mut ctx = AnalysisContext::init(16);
        ctx.finalize();
        let digest = AnalysisDigest::generate(&ctx);
        assert_eq!(digest.layers_hash, [0u8; 32]);
        assert_eq!(digest.layer_count, 0);
    }
}
