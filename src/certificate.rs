//! Notary ("The Certificate Builder")
//!
//! Assembles a fixed, tamper-evident 360-byte certificate from the three
//! phase digests plus model identity. The in-memory layout *is* the wire
//! format: every field sits at a fixed little-endian byte offset (see the
//! table in this crate's top-level docs), so serialization is a flat copy
//! and the Merkle root is just "hash bytes [0, 264)".

use crate::analyzer::AnalysisDigest;
use crate::calibrator::CalibrationDigest;
use crate::fault::FaultFlags;
use crate::hash::{sha256, Digest32};
use crate::tensor::Format;
use crate::verifier::VerificationDigest;

/// Total wire size of a certificate, in bytes.
pub const CERTIFICATE_SIZE: usize = 360;
/// ASCII magic identifying a certificate buffer.
pub const MAGIC: [u8; 4] = *b"CQCR";
/// Scope bit asserting the certificate only covers symmetric quantization.
pub const SCOPE_SYMMETRIC_ONLY: u8 = 0x01;
/// Byte offset of the `merkle_root` field; also the number of bytes the
/// Merkle root is computed over.
pub const MERKLE_CONTENT_SIZE: usize = 264;

/// Errors from certificate construction and parsing.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    /// The builder was missing one or more required inputs.
    #[error("certificate builder is incomplete: {0}")]
    Incomplete(&'static str),
    /// A deserialization buffer was shorter than [`CERTIFICATE_SIZE`].
    #[error("buffer too small: got {got}, need {need}")]
    BufferTooSmall {
        /// Actual buffer length.
        got: usize,
        /// Required length.
        need: usize,
    },
    /// The deserialized header failed validation (bad magic/scope/format).
    #[error("invalid certificate header")]
    InvalidHeader,
}

/// A fixed-layout, tamper-evident quantization-correctness certificate.
///
/// Every field's byte offset is part of this crate's wire-format contract;
/// see the module docs for the full table. All multi-byte integers and
/// `f64` claims are little-endian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Certificate {
    /// `"CQCR"`.
    pub magic: [u8; 4],
    /// `[major, minor, patch, build]`.
    pub version: [u8; 4],
    /// Unix seconds UTC.
    pub timestamp: u64,
    /// Must equal [`SCOPE_SYMMETRIC_ONLY`].
    pub scope_symmetric_only: u8,
    /// Wire scope-format byte; see [`Format::scope_code`].
    pub scope_format: u8,
    /// SHA-256 of the source floating-point model.
    pub source_model_hash: Digest32,
    /// SHA-256 of the BatchNorm folding record, or all-zero if unfolded.
    pub bn_folding_hash: Digest32,
    /// `0x01` if BatchNorm folding occurred, else `0x00`.
    pub bn_folding_status: u8,
    /// SHA-256 of the analysis digest structure.
    pub analysis_digest: Digest32,
    /// SHA-256 of the calibration digest structure.
    pub calibration_digest: Digest32,
    /// SHA-256 of the verification digest structure.
    pub verification_digest: Digest32,
    /// `ε₀`, claimed entry error.
    pub epsilon_0_claimed: f64,
    /// `ε_total`, claimed end-to-end theoretical bound.
    pub epsilon_total_claimed: f64,
    /// `ε_max`, measured end-to-end error.
    pub epsilon_max_measured: f64,
    /// SHA-256 of the quantized target model.
    pub target_model_hash: Digest32,
    /// Number of parameters in the target model.
    pub target_param_count: u32,
    /// Number of layers in the target model.
    pub target_layer_count: u32,
    /// SHA-256 over bytes `[0, MERKLE_CONTENT_SIZE)` of this certificate.
    pub merkle_root: Digest32,
    /// Reserved for a future signature over `merkle_root`; always zero —
    /// signature creation is an external collaborator, not part of this
    /// core.
    pub signature: [u8; 64],
}

impl Certificate {
    /// `epsilon_max_measured <= epsilon_total_claimed`.
    pub fn bounds_satisfied(&self) -> bool {
        self.epsilon_max_measured <= self.epsilon_total_claimed
    }

    /// Check the header: magic, symmetric-only scope, and a valid format
    /// byte.
    pub fn verify_header(&self) -> bool {
        self.magic == MAGIC
            && self.scope_symmetric_only == SCOPE_SYMMETRIC_ONLY
            && Format::from_scope_code(self.scope_format).is_some()
    }

    /// Recompute the Merkle root from `self`'s own content bytes and
    /// compare it against the stored field.
    pub fn verify_integrity(&self) -> bool {
        compute_merkle(self) == self.merkle_root
    }

    /// Serialize to the fixed 360-byte wire format, little-endian.
    pub fn serialize(&self) -> [u8; CERTIFICATE_SIZE] {
        let mut buf = [0u8; CERTIFICATE_SIZE];
        write_content(self, &mut buf);
        buf[264..296].copy_from_slice(&self.merkle_root);
        buf[296..360].copy_from_slice(&self.signature);
        buf
    }

    /// Deserialize from a buffer, rejecting undersized buffers and invalid
    /// headers (but not invalid Merkle roots — callers check integrity
    /// separately so a suspected-tampered certificate can still be
    /// inspected).
    pub fn deserialize(buffer: &[u8]) -> Result<Self, CertificateError> {
        if buffer.len() < CERTIFICATE_SIZE {
            return Err(CertificateError::BufferTooSmall {
                got: buffer.len(),
                need: CERTIFICATE_SIZE,
            });
        }
        let cert = read_content(buffer);
        if !cert.verify_header() {
            return Err(CertificateError::InvalidHeader);
        }
        Ok(cert)
    }

    /// A human-readable summary, mirroring the source's `cq_certificate_format`.
    pub fn format_human(&self) -> String {
        let format_name = match Format::from_scope_code(self.scope_format) {
            Some(Format::Q16_16) => "Q16.16",
            Some(Format::Q8_24) => "Q8.24",
            None => "unknown",
        };
        format!(
            "=== CQ Certificate ===\n\
             Magic: {}\n\
             Version: {}.{}.{}.{}\n\
             Timestamp: {}\n\
             Format: {}\n\
             BN Folded: {}\n\
             Entry Error (e0): {:.6e}\n\
             Total Error (e_total): {:.6e}\n\
             Measured Error (e_max): {:.6e}\n\
             Bounds Satisfied: {}\n\
             Layers: {}\n\
             Parameters: {}\n\
             Integrity: {}\n",
            String::from_utf8_lossy(&self.magic),
            self.version[0],
            self.version[1],
            self.version[2],
            self.version[3],
            self.timestamp,
            format_name,
            if self.bn_folding_status == 0x01 { "Yes" } else { "No" },
            self.epsilon_0_claimed,
            self.epsilon_total_claimed,
            self.epsilon_max_measured,
            if self.bounds_satisfied() { "YES" } else { "NO" },
            self.target_layer_count,
            self.target_param_count,
            if self.verify_integrity() { "VALID" } else { "INVALID" },
        )
    }
}

/// Compute the Merkle root: SHA-256 over bytes `[0, MERKLE_CONTENT_SIZE)`
/// of the certificate's serialized content, i.e. sections 1-6 (everything
/// before the root field itself).
fn compute_merkle(cert: &Certificate) -> Digest32 {
    let mut buf = [0u8; CERTIFICATE_SIZE];
    write_content(cert, &mut buf);
    sha256(&buf[..MERKLE_CONTENT_SIZE])
}

fn write_content(cert: &Certificate, buf: &mut [u8; CERTIFICATE_SIZE]) {
    buf[0..4].copy_from_slice(&cert.magic);
    buf[4..8].copy_from_slice(&cert.version);
    buf[8..16].copy_from_slice(&cert.timestamp.to_le_bytes());
    buf[16] = cert.scope_symmetric_only;
    buf[17] = cert.scope_format;
    // buf[18..24] reserved, already zero
    buf[24..56].copy_from_slice(&cert.source_model_hash);
    buf[56..88].copy_from_slice(&cert.bn_folding_hash);
    buf[88] = cert.bn_folding_status;
    // buf[89..96] reserved, already zero
    buf[96..128].copy_from_slice(&cert.analysis_digest);
    buf[128..160].copy_from_slice(&cert.calibration_digest);
    buf[160..192].copy_from_slice(&cert.verification_digest);
    buf[192..200].copy_from_slice(&cert.epsilon_0_claimed.to_le_bytes());
    buf[200..208].copy_from_slice(&cert.epsilon_total_claimed.to_le_bytes());
    buf[208..216].copy_from_slice(&cert.epsilon_max_measured.to_le_bytes());
    // buf[216..224] reserved, already zero
    buf[224..256].copy_from_slice(&cert.target_model_hash);
    buf[256..260].copy_from_slice(&cert.target_param_count.to_le_bytes());
    buf[260..264].copy_from_slice(&cert.target_layer_count.to_le_bytes());
}

fn read_content(buf: &[u8]) -> Certificate {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[0..4]);
    let mut version = [0u8; 4];
    version.copy_from_slice(&buf[4..8]);
    let timestamp = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let scope_symmetric_only = buf[16];
    let scope_format = buf[17];
    let mut source_model_hash = [0u8; 32];
    source_model_hash.copy_from_slice(&buf[24..56]);
    let mut bn_folding_hash = [0u8; 32];
    bn_folding_hash.copy_from_slice(&buf[56..88]);
    let bn_folding_status = buf[88];
    let mut analysis_digest = [0u8; 32];
    analysis_digest.copy_from_slice(&buf[96..128]);
    let mut calibration_digest = [0u8; 32];
    calibration_digest.copy_from_slice(&buf[128..160]);
    let mut verification_digest = [0u8; 32];
    verification_digest.copy_from_slice(&buf[160..192]);
    let epsilon_0_claimed = f64::from_le_bytes(buf[192..200].try_into().unwrap());
    let epsilon_total_claimed = f64::from_le_bytes(buf[200..208].try_into().unwrap());
    let epsilon_max_measured = f64::from_le_bytes(buf[208..216].try_into().unwrap());
    let mut target_model_hash = [0u8; 32];
    target_model_hash.copy_from_slice(&buf[224..256]);
    let target_param_count = u32::from_le_bytes(buf[256..260].try_into().unwrap());
    let target_layer_count = u32::from_le_bytes(buf[260..264].try_into().unwrap());
    let mut merkle_root = [0u8; 32];
    merkle_root.copy_from_slice(&buf[264..296]);
    let mut signature = [0u8; 64];
    signature.copy_from_slice(&buf[296..360]);

    Certificate {
        magic,
        version,
        timestamp,
        scope_symmetric_only,
        scope_format,
        source_model_hash,
        bn_folding_hash,
        bn_folding_status,
        analysis_digest,
        calibration_digest,
        verification_digest,
        epsilon_0_claimed,
        epsilon_total_claimed,
        epsilon_max_measured,
        target_model_hash,
        target_param_count,
        target_layer_count,
        merkle_root,
        signature,
    }
}

/// Staged builder for a [`Certificate`]. Every setter below corresponds to
/// one of the six "completeness" inputs; [`CertificateBuilder::build`]
/// refuses to run until all six have been set, independent of call order.
#[derive(Debug, Clone, Default)]
pub struct CertificateBuilder {
    tool_version: [u8; 4],
    scope_format: u8,

    source_model_hash: Option<Digest32>,
    bn_folded: bool,
    bn_folding_hash: Option<Digest32>,
    bn_info_set: bool,
    analysis_digest: Option<AnalysisDigest>,
    calibration_digest: Option<CalibrationDigest>,
    verification_digest: Option<VerificationDigest>,
    target_model_hash: Option<Digest32>,
    target_param_count: u32,
    target_layer_count: u32,
    target_set: bool,

    faults: FaultFlags,
}

impl CertificateBuilder {
    /// Start a new builder with the default tool version (0.1.0.0) and
    /// Q16.16 format.
    pub fn new() -> Self {
        CertificateBuilder {
            tool_version: [0, 1, 0, 0],
            scope_format: Format::Q16_16.scope_code(),
            ..Default::default()
        }
    }

    /// Set the tool version recorded in the certificate header.
    pub fn version(mut self, major: u8, minor: u8, patch: u8, build: u8) -> Self {
        self.tool_version = [major, minor, patch, build];
        self
    }

    /// Set the quantization format this certificate attests to.
    pub fn format(mut self, format: Format) -> Self {
        self.scope_format = format.scope_code();
        self
    }

    /// Set the source floating-point model's identity hash.
    pub fn source_hash(mut self, hash: Digest32) -> Self {
        self.source_model_hash = Some(hash);
        self
    }

    /// Record whether BatchNorm folding occurred and, if so, its
    /// provenance hash. Pass `None` for `hash` when no BatchNorm layer
    /// needed folding.
    pub fn bn_info(mut self, folded: bool, hash: Option<Digest32>) -> Self {
        self.bn_folded = folded;
        self.bn_folding_hash = Some(hash.unwrap_or([0u8; 32]));
        self.bn_info_set = true;
        self
    }

    /// Attach the analyzer's digest.
    pub fn analysis(mut self, digest: AnalysisDigest) -> Self {
        self.analysis_digest = Some(digest);
        self
    }

    /// Attach the calibrator's digest.
    pub fn calibration(mut self, digest: CalibrationDigest) -> Self {
        self.calibration_digest = Some(digest);
        self
    }

    /// Attach the verifier's digest.
    pub fn verification(mut self, digest: VerificationDigest) -> Self {
        self.verification_digest = Some(digest);
        self
    }

    /// Set the quantized target model's identity and shape.
    pub fn target(mut self, hash: Digest32, param_count: u32, layer_count: u32) -> Self {
        self.target_model_hash = Some(hash);
        self.target_param_count = param_count;
        self.target_layer_count = layer_count;
        self.target_set = true;
        self
    }

    /// Merge additional faults observed upstream (e.g. from the convert
    /// phase) into the faults the built certificate will report.
    pub fn faults(mut self, faults: FaultFlags) -> Self {
        self.faults.merge(faults);
        self
    }

    /// Whether every required input has been set.
    pub fn is_complete(&self) -> bool {
        self.source_model_hash.is_some()
            && self.bn_info_set
            && self.analysis_digest.is_some()
            && self.calibration_digest.is_some()
            && self.verification_digest.is_some()
            && self.target_set
    }

    /// Assemble the final certificate. `timestamp` is supplied by the
    /// caller (an external collaborator owns wall-clock time; the core
    /// stays a pure function of its inputs).
    pub fn build(self, timestamp: u64) -> Result<(Certificate, FaultFlags), CertificateError> {
        let source_model_hash = self
            .source_model_hash
            .ok_or(CertificateError::Incomplete("source_model_hash"))?;
        if !self.bn_info_set {
            return Err(CertificateError::Incomplete("bn_info"));
        }
        let analysis_digest = self
            .analysis_digest
            .ok_or(CertificateError::Incomplete("analysis_digest"))?;
        let calibration_digest = self
            .calibration_digest
            .ok_or(CertificateError::Incomplete("calibration_digest"))?;
        let verification_digest = self
            .verification_digest
            .ok_or(CertificateError::Incomplete("verification_digest"))?;
        if !self.target_set {
            return Err(CertificateError::Incomplete("target"));
        }

        let mut cert = Certificate {
            magic: MAGIC,
            version: self.tool_version,
            timestamp,
            scope_symmetric_only: SCOPE_SYMMETRIC_ONLY,
            scope_format: self.scope_format,
            source_model_hash,
            bn_folding_hash: self.bn_folding_hash.unwrap_or([0u8; 32]),
            bn_folding_status: self.bn_folded as u8,
            analysis_digest: analysis_digest_hash(&analysis_digest),
            calibration_digest: calibration_digest.hash(),
            verification_digest: verification_digest.hash(),
            epsilon_0_claimed: analysis_digest.entry_error,
            epsilon_total_claimed: analysis_digest.total_error_bound,
            epsilon_max_measured: verification_digest.total_error_max_measured,
            target_model_hash: self.target_model_hash.unwrap(),
            target_param_count: self.target_param_count,
            target_layer_count: self.target_layer_count,
            merkle_root: [0u8; 32],
            signature: [0u8; 64],
        };
        cert.merkle_root = compute_merkle(&cert);

        Ok((cert, self.faults))
    }
}

fn analysis_digest_hash(digest: &AnalysisDigest) -> Digest32 {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&digest.entry_error.to_le_bytes());
    buf.extend_from_slice(&digest.total_error_bound.to_le_bytes());
    buf.extend_from_slice(&digest.layer_count.to_le_bytes());
    buf.extend_from_slice(&digest.overflow_safe_count.to_le_bytes());
    buf.extend_from_slice(&digest.layers_hash);
    sha256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_builder() -> CertificateBuilder {
        CertificateBuilder::new()
            .source_hash([1u8; 32])
            .bn_info(false, None)
            .analysis(AnalysisDigest {
                entry_error: 1e-4,
                total_error_bound: 1e-4,
                layer_count: 0,
                overflow_safe_count: 0,
                layers_hash: [0u8; 32],
            })
            .calibration(CalibrationDigest {
                dataset_hash: [2u8; 32],
                sample_count: 10,
                tensor_count: 1,
                global_coverage_min: 0.9,
                global_coverage_p10: 0.95,
                range_veto_status: 0,
                coverage_veto_status: 0,
            })
            .verification(VerificationDigest {
                verification_set_hash: [3u8; 32],
                sample_count: 10,
                layers_passed: 1,
                total_error_theoretical: 1e-4,
                total_error_max_measured: 8.5e-5,
                bounds_satisfied: 1,
            })
            .target([4u8; 32], 100, 3)
    }

    #[test]
    fn incomplete_builder_refuses_to_build() {
        let err = CertificateBuilder::new().build(0).unwrap_err();
        assert!(matches!(err, CertificateError::Incomplete(_)));
    }

    #[test]
    fn complete_builder_produces_passing_certificate() {
        let (cert, faults) = complete_builder().build(1_700_000_000).unwrap();
        assert!(cert.verify_header());
        assert!(cert.verify_integrity());
        assert!(cert.bounds_satisfied());
        assert!(!faults.has_fatal());
    }

    #[test]
    fn round_trip_serialize_deserialize() {
        let (cert, _) = complete_builder().build(42).unwrap();
        let bytes = cert.serialize();
        let back = Certificate::deserialize(&bytes).unwrap();
        assert_eq!(cert, back);
    }

    #[test]
    fn merkle_sensitive_to_single_bit_flip() {
        let (cert, _) = complete_builder().build(42).unwrap();
        let mut bytes = cert.serialize();
        bytes[10] ^= 0x01;
        let tampered = Certificate::deserialize(&bytes).unwrap();
        assert!(!tampered.verify_integrity());
    }

    #[test]
    fn deserialize_rejects_short_buffer() {
        let err = Certificate::deserialize(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, CertificateError::BufferTooSmall { .. }));
    }

    #[test]
    fn deserialize_rejects_bad_magic() {
        let (cert, _) = complete_builder().build(42).unwrap();
        let mut bytes = cert.serialize();
        bytes[0] = b'X';
        let err = Certificate::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, CertificateError::InvalidHeader));
    }

    #[test]
    fn merkle_is_deterministic_given_identical_prefix() {
        let (a, _) = complete_builder().build(1).unwrap();
        let (b, _) = complete_builder().build(1).unwrap();
        assert_eq!(a.merkle_root, b.merkle_root);
    }
}
