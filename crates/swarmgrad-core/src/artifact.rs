//! Wire artifacts exchanged through the object store.
//!
//! - [`GradientArtifact`]: one peer's sparse compressed gradient. On the wire
//!   it is a flat JSON object keyed by `<param>idxs` / `<param>vals`; the
//!   typed form is only reachable through validated deserialization.
//! - [`AggregationArtifact`]: an evaluator's merged update, 1 bit per element.
//! - [`DebugSnapshot`]: first values of every parameter after a window, used
//!   by catch-up to measure drift.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{ChunkGeometry, CodecError, SparseParam, Tensor};
use crate::error::ValidationError;
use crate::peers::PeerId;

const IDXS_SUFFIX: &str = "idxs";
const VALS_SUFFIX: &str = "vals";

/// Parameter name → sparse payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireArtifact", into = "WireArtifact")]
pub struct GradientArtifact {
    pub params: BTreeMap<String, SparseParam>,
}

#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct WireArtifact(BTreeMap<String, Value>);

fn wire_indices(name: &str, value: Value) -> Result<Vec<u32>, ValidationError> {
    let Value::Array(items) = value else {
        return Err(ValidationError::Malformed(format!("{name}{IDXS_SUFFIX} is not an array")));
    };
    items
        .into_iter()
        .map(|v| {
            v.as_u64()
                .and_then(|i| u32::try_from(i).ok())
                .ok_or_else(|| {
                    ValidationError::Malformed(format!("{name}{IDXS_SUFFIX} holds a non-index value"))
                })
        })
        .collect()
}

fn wire_values(name: &str, value: Value) -> Result<Vec<f32>, ValidationError> {
    let Value::Array(items) = value else {
        return Err(ValidationError::Malformed(format!("{name}{VALS_SUFFIX} is not an array")));
    };
    items
        .into_iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                ValidationError::Malformed(format!("{name}{VALS_SUFFIX} holds a non-numeric value"))
            })
        })
        .collect()
}

impl TryFrom<WireArtifact> for GradientArtifact {
    type Error = ValidationError;

    fn try_from(wire: WireArtifact) -> Result<Self, Self::Error> {
        let mut idxs: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        let mut vals: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        for (key, value) in wire.0 {
            if let Some(name) = key.strip_suffix(IDXS_SUFFIX) {
                idxs.insert(name.to_string(), wire_indices(name, value)?);
            } else if let Some(name) = key.strip_suffix(VALS_SUFFIX) {
                vals.insert(name.to_string(), wire_values(name, value)?);
            } else {
                return Err(ValidationError::Malformed(format!("unexpected key {key}")));
            }
        }

        let mut params = BTreeMap::new();
        for (name, i) in idxs {
            let v = vals
                .remove(&name)
                .ok_or_else(|| ValidationError::Malformed(format!("{name}{VALS_SUFFIX} missing")))?;
            if i.len() != v.len() {
                return Err(ValidationError::LengthMismatch {
                    name,
                    idxs: i.len(),
                    vals: v.len(),
                });
            }
            params.insert(name, SparseParam { idxs: i, vals: v });
        }
        if let Some(name) = vals.into_keys().next() {
            return Err(ValidationError::Malformed(format!("{name}{IDXS_SUFFIX} missing")));
        }
        Ok(Self { params })
    }
}

impl From<GradientArtifact> for WireArtifact {
    fn from(artifact: GradientArtifact) -> Self {
        let mut map = BTreeMap::new();
        for (name, param) in artifact.params {
            map.insert(format!("{name}{IDXS_SUFFIX}"), Value::from(param.idxs));
            map.insert(
                format!("{name}{VALS_SUFFIX}"),
                Value::from(param.vals.into_iter().map(f64::from).collect::<Vec<_>>()),
            );
        }
        WireArtifact(map)
    }
}

impl GradientArtifact {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn get(&self, name: &str) -> Option<&SparseParam> {
        self.params.get(name)
    }

    pub fn total_entries(&self) -> usize {
        self.params.values().map(SparseParam::len).sum()
    }
}

/// Structural checks against the local parameter layout.
#[derive(Debug, Clone)]
pub struct ArtifactValidator {
    geometries: BTreeMap<String, ChunkGeometry>,
    allowed_topk: usize,
}

impl ArtifactValidator {
    pub fn new(geometries: BTreeMap<String, ChunkGeometry>, allowed_topk: usize) -> Self {
        Self {
            geometries,
            allowed_topk,
        }
    }

    pub fn geometries(&self) -> &BTreeMap<String, ChunkGeometry> {
        &self.geometries
    }

    pub fn geometry(&self, name: &str) -> Option<&ChunkGeometry> {
        self.geometries.get(name)
    }

    /// Upper bound on the encoded size of any artifact that could pass
    /// [`ArtifactValidator::validate`], leaving room for whitespace.
    pub fn max_payload_bytes(&self) -> usize {
        const PER_ENTRY: usize = 64;
        const PER_PARAM: usize = 128;
        const ENVELOPE: usize = 1024;
        self.geometries
            .iter()
            .map(|(name, g)| PER_PARAM + 2 * name.len() + PER_ENTRY * g.max_entries(self.allowed_topk))
            .fold(ENVELOPE, usize::saturating_add)
    }

    /// Reject a raw payload too large to be a valid artifact, before parsing.
    pub fn check_size(&self, size: usize) -> Result<(), ValidationError> {
        let max = self.max_payload_bytes();
        if size > max {
            return Err(ValidationError::PayloadTooLarge { size, max });
        }
        Ok(())
    }

    /// Every parameter present with no extras, equal lengths, at most
    /// `allowed_topk` per chunk, a whole number of entries per chunk,
    /// indices below `total_k`, finite values.
    pub fn validate(&self, artifact: &GradientArtifact) -> Result<(), ValidationError> {
        let expected: BTreeSet<&String> = self.geometries.keys().collect();
        if let Some(name) = artifact.params.keys().find(|n| !expected.contains(n)) {
            return Err(ValidationError::UnknownParameter { name: name.clone() });
        }

        for (name, geometry) in &self.geometries {
            let param = artifact
                .params
                .get(name)
                .ok_or_else(|| ValidationError::MissingParameter { name: name.clone() })?;

            if param.idxs.len() != param.vals.len() {
                return Err(ValidationError::LengthMismatch {
                    name: name.clone(),
                    idxs: param.idxs.len(),
                    vals: param.vals.len(),
                });
            }

            let count = param.len();
            let max = geometry.max_entries(self.allowed_topk);
            if count > max {
                return Err(ValidationError::TooManyEntries {
                    name: name.clone(),
                    count,
                    max,
                });
            }

            let chunks = geometry.num_chunks();
            if count > 0 && (chunks == 0 || count % chunks != 0) {
                return Err(ValidationError::ChunkMisaligned {
                    name: name.clone(),
                    count,
                    chunks,
                });
            }

            let total_k = geometry.total_k();
            if let Some(&index) = param.idxs.iter().find(|&&i| i as usize >= total_k) {
                return Err(ValidationError::IndexOutOfRange {
                    name: name.clone(),
                    index,
                    total_k,
                });
            }

            if param.vals.iter().any(|v| !v.is_finite()) {
                return Err(ValidationError::NonFinite { name: name.clone() });
            }
        }
        Ok(())
    }
}

/// Signs of a dense tensor, 8 elements per byte.
///
/// Bit `i` of byte `j` holds element `8j + i`: set means `+1`, clear `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedSigns {
    pub shape: Vec<usize>,
    pub bits: Vec<u8>,
}

impl PackedSigns {
    /// Strictly positive elements pack as `+1`, everything else as `-1`.
    pub fn pack(tensor: &Tensor) -> Self {
        let mut bits = vec![0u8; tensor.numel().div_ceil(8)];
        for (n, &v) in tensor.data().iter().enumerate() {
            if v > 0.0 {
                bits[n / 8] |= 1 << (n % 8);
            }
        }
        Self {
            shape: tensor.shape().to_vec(),
            bits,
        }
    }

    pub fn unpack(&self) -> Result<Tensor, CodecError> {
        let numel: usize = self.shape.iter().product();
        if self.bits.len() != numel.div_ceil(8) {
            return Err(CodecError::ShapeMismatch {
                shape: self.shape.clone(),
                len: self.bits.len() * 8,
            });
        }
        let data = (0..numel)
            .map(|n| {
                if (self.bits[n / 8] >> (n % 8)) & 1 == 1 {
                    1.0
                } else {
                    -1.0
                }
            })
            .collect();
        Tensor::new(self.shape.clone(), data)
    }
}

/// Merged update for one window, as published by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationArtifact {
    pub window: u64,
    pub params: BTreeMap<String, PackedSigns>,
}

impl AggregationArtifact {
    pub fn from_updates(window: u64, updates: &BTreeMap<String, Tensor>) -> Self {
        Self {
            window,
            params: updates
                .iter()
                .map(|(name, t)| (name.clone(), PackedSigns::pack(t)))
                .collect(),
        }
    }

    pub fn unpack(&self) -> Result<BTreeMap<String, Tensor>, CodecError> {
        self.params
            .iter()
            .map(|(name, packed)| Ok((name.clone(), packed.unpack()?)))
            .collect()
    }
}

/// Values sampled from every parameter after applying a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSnapshot {
    pub window: u64,
    /// First [`DebugSnapshot::SAMPLE_LEN`] values of each flattened parameter.
    pub params: BTreeMap<String, Vec<f32>>,
    pub successful_peers: Vec<PeerId>,
    pub skipped_peers: Vec<PeerId>,
}

impl DebugSnapshot {
    pub const SAMPLE_LEN: usize = 2;

    pub fn capture<'a>(
        window: u64,
        params: impl IntoIterator<Item = (&'a String, &'a Tensor)>,
        successful_peers: &[PeerId],
        skipped_peers: &[PeerId],
    ) -> Self {
        let mut successful_peers = successful_peers.to_vec();
        let mut skipped_peers = skipped_peers.to_vec();
        successful_peers.sort_unstable();
        skipped_peers.sort_unstable();
        Self {
            window,
            params: params
                .into_iter()
                .map(|(name, t)| {
                    let n = t.numel().min(Self::SAMPLE_LEN);
                    (name.clone(), t.data()[..n].to_vec())
                })
                .collect(),
            successful_peers,
            skipped_peers,
        }
    }

    /// L2 distance between the sampled values and the same prefix of
    /// `params`. Parameters missing on either side are ignored.
    pub fn l2_distance<'a>(&self, params: impl IntoIterator<Item = (&'a String, &'a Tensor)>) -> f64 {
        let mut sum = 0.0;
        for (name, tensor) in params {
            let Some(sample) = self.params.get(name) else {
                continue;
            };
            for (a, b) in sample.iter().zip(tensor.data()) {
                let d = f64::from(*a) - f64::from(*b);
                sum += d * d;
            }
        }
        sum.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TransformDct;

    fn sample_artifact() -> GradientArtifact {
        let mut params = BTreeMap::new();
        params.insert(
            "w".to_string(),
            SparseParam {
                idxs: vec![0, 3, 1, 2],
                vals: vec![0.5, -0.25, 1.0, -1.0],
            },
        );
        GradientArtifact { params }
    }

    fn validator(topk: usize) -> ArtifactValidator {
        let dct = TransformDct::new(4);
        let mut geometries = BTreeMap::new();
        geometries.insert("w".to_string(), dct.geometry(&[8]));
        ArtifactValidator::new(geometries, topk)
    }

    #[test]
    fn wire_shape_uses_suffixed_keys() {
        let json: Value = serde_json::from_slice(&sample_artifact().to_bytes().unwrap()).unwrap();
        assert_eq!(json["widxs"], serde_json::json!([0, 3, 1, 2]));
        assert_eq!(json["wvals"], serde_json::json!([0.5, -0.25, 1.0, -1.0]));
    }

    #[test]
    fn largest_valid_artifact_fits_the_size_cap() {
        let v = validator(2);
        let g = v.geometry("w").unwrap();
        let n = g.max_entries(2);
        let mut params = BTreeMap::new();
        params.insert(
            "w".to_string(),
            SparseParam {
                idxs: vec![u32::try_from(g.total_k() - 1).unwrap(); n],
                vals: vec![-1.234_567_9e-38; n],
            },
        );
        let artifact = GradientArtifact { params };
        v.validate(&artifact).unwrap();
        let pretty = serde_json::to_vec_pretty(&artifact).unwrap();
        v.check_size(pretty.len()).unwrap();

        let err = v.check_size(v.max_payload_bytes() + 1).unwrap_err();
        assert!(matches!(err, ValidationError::PayloadTooLarge { .. }));
    }

    #[test]
    fn wire_roundtrip() {
        let artifact = sample_artifact();
        let parsed = GradientArtifact::from_bytes(&artifact.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, artifact);
    }

    #[test]
    fn deserialize_rejects_half_pairs_and_garbage() {
        assert!(GradientArtifact::from_bytes(br#"{"widxs":[1]}"#).is_err());
        assert!(GradientArtifact::from_bytes(br#"{"wvals":[1.0]}"#).is_err());
        assert!(GradientArtifact::from_bytes(br#"{"widxs":[-1],"wvals":[1.0]}"#).is_err());
        assert!(GradientArtifact::from_bytes(br#"{"widxs":[1],"wvals":[null]}"#).is_err());
        assert!(GradientArtifact::from_bytes(br#"{"state":1}"#).is_err());
        assert!(GradientArtifact::from_bytes(b"not json").is_err());
        assert!(matches!(
            GradientArtifact::from_bytes(br#"{"widxs":[1,2],"wvals":[1.0]}"#),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn validator_accepts_well_formed() {
        validator(2).validate(&sample_artifact()).unwrap();
    }

    #[test]
    fn validator_rejects_over_budget() {
        assert!(matches!(
            validator(1).validate(&sample_artifact()),
            Err(ValidationError::TooManyEntries { count: 4, max: 2, .. })
        ));
    }

    #[test]
    fn validator_rejects_out_of_range_index() {
        let mut artifact = sample_artifact();
        artifact.params.get_mut("w").unwrap().idxs[2] = 4;
        assert!(matches!(
            validator(2).validate(&artifact),
            Err(ValidationError::IndexOutOfRange { index: 4, .. })
        ));
    }

    #[test]
    fn validator_rejects_missing_unknown_and_nonfinite() {
        let mut extra = sample_artifact();
        extra.params.insert("b".into(), SparseParam::default());
        assert!(matches!(
            validator(2).validate(&extra),
            Err(ValidationError::UnknownParameter { .. })
        ));

        assert!(matches!(
            validator(2).validate(&GradientArtifact::default()),
            Err(ValidationError::MissingParameter { .. })
        ));

        let mut nan = sample_artifact();
        nan.params.get_mut("w").unwrap().vals[0] = f32::NAN;
        assert!(matches!(
            validator(2).validate(&nan),
            Err(ValidationError::NonFinite { .. })
        ));
    }

    #[test]
    fn validator_rejects_misaligned_count() {
        let mut artifact = sample_artifact();
        let param = artifact.params.get_mut("w").unwrap();
        param.idxs.pop();
        param.vals.pop();
        assert!(matches!(
            validator(2).validate(&artifact),
            Err(ValidationError::ChunkMisaligned { count: 3, chunks: 2, .. })
        ));
    }

    #[test]
    fn sign_packing_bit_layout() {
        let t = Tensor::vector(vec![1.0, -1.0, 0.5, -0.5, 2.0, 0.0, 3.0, -3.0, 9.0]);
        let packed = PackedSigns::pack(&t);
        assert_eq!(packed.bits, vec![0b0101_0101, 0b0000_0001]);
        let unpacked = packed.unpack().unwrap();
        assert_eq!(
            unpacked.data(),
            &[1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0]
        );
    }

    #[test]
    fn unpack_rejects_wrong_byte_count() {
        let packed = PackedSigns {
            shape: vec![9],
            bits: vec![0xff],
        };
        assert!(packed.unpack().is_err());
    }

    #[test]
    fn debug_snapshot_samples_and_measures() {
        let name = "w".to_string();
        let t = Tensor::vector(vec![1.0, 2.0, 3.0]);
        let snap = DebugSnapshot::capture(4, [(&name, &t)], &[PeerId(3), PeerId(1)], &[]);
        assert_eq!(snap.params["w"], vec![1.0, 2.0]);
        assert_eq!(snap.successful_peers, vec![PeerId(1), PeerId(3)]);

        let moved = Tensor::vector(vec![4.0, 6.0, 0.0]);
        assert!((snap.l2_distance([(&name, &moved)]) - 5.0).abs() < 1e-9);
        assert_eq!(snap.l2_distance([(&name, &t)]), 0.0);
    }
}
