//! Gradient codec: chunked orthonormal DCT-II plus per-chunk top-k.
//!
//! A parameter of shape `[d0, .., dn]` is viewed as a `rows x cols` matrix
//! (`cols = dn`, `rows` = product of the leading dims; 1-D tensors are a
//! single row). Each dimension is split into chunks whose size is the largest
//! divisor not above `target_chunk`. Every `chunk_rows x chunk_cols` block is
//! transformed independently with a separable 2-D DCT-II
//! (`Y = C_r X C_c^T`), so 1-D parameters reduce to a DCT along the length.
//!
//! Compressed coefficients are laid out chunk-major: the first `k` entries
//! belong to chunk 0, the next `k` to chunk 1, and so on. Indices are local
//! to the chunk, in `[0, total_k)` where `total_k = chunk_rows * chunk_cols`.
//!
//! Decompression scatter-adds into a zeroed coefficient buffer (accumulated
//! in `f64`) and inverts the transform. Merging many contributions is the
//! same scatter-add over all of them followed by a single inverse pass, so
//! the result does not depend on contribution order.

mod tensor;

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use tensor::Tensor;

/// Errors raised while encoding or decoding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("shape {shape:?} does not match {len} elements")]
    ShapeMismatch { shape: Vec<usize>, len: usize },

    #[error("{idxs} indices but {vals} values")]
    LengthMismatch { idxs: usize, vals: usize },

    #[error("index {index} out of range for chunk length {total_k}")]
    IndexOutOfRange { index: u32, total_k: usize },

    #[error("{count} entries cannot be split evenly across {chunks} chunks")]
    ChunkMisaligned { count: usize, chunks: usize },
}

/// Largest divisor of `n` that does not exceed `target`.
pub fn chunk_size(n: usize, target: usize) -> usize {
    if n == 0 {
        return 1;
    }
    (1..=n.min(target.max(1)))
        .rev()
        .find(|d| n % d == 0)
        .unwrap_or(1)
}

/// How a parameter is cut into transform chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGeometry {
    pub shape: Vec<usize>,
    pub rows: usize,
    pub cols: usize,
    pub chunk_rows: usize,
    pub chunk_cols: usize,
}

impl ChunkGeometry {
    pub fn for_shape(shape: &[usize], target_chunk: usize) -> Self {
        let (rows, cols) = match shape {
            [] => (1, 1),
            [n] => (1, *n),
            [lead @ .., last] => (lead.iter().product(), *last),
        };
        Self {
            shape: shape.to_vec(),
            rows,
            cols,
            chunk_rows: chunk_size(rows, target_chunk),
            chunk_cols: chunk_size(cols, target_chunk),
        }
    }

    pub fn row_chunks(&self) -> usize {
        self.rows / self.chunk_rows
    }

    pub fn col_chunks(&self) -> usize {
        self.cols / self.chunk_cols
    }

    pub fn num_chunks(&self) -> usize {
        self.row_chunks() * self.col_chunks()
    }

    /// Coefficients per chunk; also the exclusive upper bound on indices.
    pub fn total_k(&self) -> usize {
        self.chunk_rows * self.chunk_cols
    }

    pub fn numel(&self) -> usize {
        self.rows * self.cols
    }

    /// Most entries a peer may send for this parameter.
    pub fn max_entries(&self, topk: usize) -> usize {
        self.clamp_topk(topk) * self.num_chunks()
    }

    pub fn clamp_topk(&self, topk: usize) -> usize {
        topk.clamp(1, self.total_k().max(1))
    }
}

/// Sparse per-parameter payload: chunk-major `(index, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseParam {
    pub idxs: Vec<u32>,
    pub vals: Vec<f32>,
}

impl SparseParam {
    pub fn len(&self) -> usize {
        self.idxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idxs.is_empty()
    }
}

/// Transform-domain coefficients of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub geometry: ChunkGeometry,
    /// `num_chunks * total_k` coefficients, chunk-major, row-major inside.
    pub coeffs: Vec<f32>,
}

/// Orthonormal DCT-II matrix, row `k` is basis vector `k`.
fn dct_basis(n: usize) -> Vec<f64> {
    let mut basis = vec![0.0; n * n];
    let nf = n as f64;
    for k in 0..n {
        let scale = if k == 0 {
            (1.0 / nf).sqrt()
        } else {
            (2.0 / nf).sqrt()
        };
        for i in 0..n {
            basis[k * n + i] = scale * (PI * (2 * i + 1) as f64 * k as f64 / (2.0 * nf)).cos();
        }
    }
    basis
}

/// Chunked DCT transform with a per-size basis cache.
#[derive(Debug, Clone)]
pub struct TransformDct {
    target_chunk: usize,
    bases: HashMap<usize, Arc<Vec<f64>>>,
}

impl TransformDct {
    pub fn new(target_chunk: usize) -> Self {
        Self {
            target_chunk: target_chunk.max(1),
            bases: HashMap::new(),
        }
    }

    pub fn target_chunk(&self) -> usize {
        self.target_chunk
    }

    pub fn geometry(&self, shape: &[usize]) -> ChunkGeometry {
        ChunkGeometry::for_shape(shape, self.target_chunk)
    }

    fn basis(&mut self, n: usize) -> Arc<Vec<f64>> {
        Arc::clone(
            self.bases
                .entry(n)
                .or_insert_with(|| Arc::new(dct_basis(n))),
        )
    }

    /// Forward transform of every chunk.
    pub fn encode(&mut self, tensor: &Tensor) -> Encoded {
        let geometry = self.geometry(tensor.shape());
        let (cr, cc) = (geometry.chunk_rows, geometry.chunk_cols);
        let row_basis = self.basis(cr);
        let col_basis = self.basis(cc);
        let data = tensor.data();

        let mut coeffs = vec![0.0f32; geometry.num_chunks() * geometry.total_k()];
        let mut tmp = vec![0.0f64; cr * cc];
        for br in 0..geometry.row_chunks() {
            for bc in 0..geometry.col_chunks() {
                let chunk = br * geometry.col_chunks() + bc;
                let out = &mut coeffs[chunk * cr * cc..(chunk + 1) * cr * cc];
                // tmp = X * C_c^T
                for i in 0..cr {
                    let row = &data[(br * cr + i) * geometry.cols + bc * cc..][..cc];
                    for b in 0..cc {
                        let basis_row = &col_basis[b * cc..(b + 1) * cc];
                        tmp[i * cc + b] = row
                            .iter()
                            .zip(basis_row)
                            .map(|(&x, &c)| f64::from(x) * c)
                            .sum();
                    }
                }
                // Y = C_r * tmp
                for a in 0..cr {
                    for b in 0..cc {
                        let mut acc = 0.0;
                        for i in 0..cr {
                            acc += row_basis[a * cr + i] * tmp[i * cc + b];
                        }
                        out[a * cc + b] = acc as f32;
                    }
                }
            }
        }
        Encoded { geometry, coeffs }
    }

    /// Inverse transform of a full coefficient buffer.
    pub fn decode(&mut self, encoded: &Encoded) -> Tensor {
        let coeffs: Vec<f64> = encoded.coeffs.iter().map(|&c| f64::from(c)).collect();
        self.decode_f64(&encoded.geometry, &coeffs)
    }

    fn decode_f64(&mut self, geometry: &ChunkGeometry, coeffs: &[f64]) -> Tensor {
        let (cr, cc) = (geometry.chunk_rows, geometry.chunk_cols);
        let row_basis = self.basis(cr);
        let col_basis = self.basis(cc);

        let mut out = Tensor::zeros(&geometry.shape);
        let cols = geometry.cols;
        let data = out.data_mut();
        let mut tmp = vec![0.0f64; cr * cc];
        for br in 0..geometry.row_chunks() {
            for bc in 0..geometry.col_chunks() {
                let chunk = br * geometry.col_chunks() + bc;
                let y = &coeffs[chunk * cr * cc..(chunk + 1) * cr * cc];
                // tmp = Y * C_c
                for a in 0..cr {
                    for j in 0..cc {
                        let mut acc = 0.0;
                        for b in 0..cc {
                            acc += y[a * cc + b] * col_basis[b * cc + j];
                        }
                        tmp[a * cc + j] = acc;
                    }
                }
                // X = C_r^T * tmp
                for i in 0..cr {
                    for j in 0..cc {
                        let mut acc = 0.0;
                        for a in 0..cr {
                            acc += row_basis[a * cr + i] * tmp[a * cc + j];
                        }
                        data[(br * cr + i) * cols + bc * cc + j] = acc as f32;
                    }
                }
            }
        }
        out
    }

    /// Scatter-add one contribution, then invert.
    pub fn decompress(
        &mut self,
        geometry: &ChunkGeometry,
        sparse: &SparseParam,
    ) -> Result<Tensor, CodecError> {
        self.merge(geometry, &[sparse])
    }

    /// Scatter-add every contribution into one buffer, then invert once.
    pub fn merge(
        &mut self,
        geometry: &ChunkGeometry,
        parts: &[&SparseParam],
    ) -> Result<Tensor, CodecError> {
        let mut coeffs = vec![0.0f64; geometry.num_chunks() * geometry.total_k()];
        for part in parts {
            scatter_add(geometry, part, &mut coeffs)?;
        }
        Ok(self.decode_f64(geometry, &coeffs))
    }

    /// Encode then keep the top `topk` coefficients of every chunk.
    pub fn compress_tensor(&mut self, tensor: &Tensor, topk: usize) -> (ChunkGeometry, SparseParam) {
        let encoded = self.encode(tensor);
        let sparse = compress(&encoded, topk);
        (encoded.geometry, sparse)
    }
}

/// Keep the `topk` largest-magnitude coefficients of every chunk.
///
/// `topk` is clamped to `[1, total_k]`. Within a chunk entries are ordered by
/// magnitude, largest first; equal magnitudes prefer the lower index.
pub fn compress(encoded: &Encoded, topk: usize) -> SparseParam {
    let geometry = &encoded.geometry;
    let total_k = geometry.total_k();
    let chunks = geometry.num_chunks();
    if total_k == 0 || chunks == 0 {
        return SparseParam::default();
    }
    let k = geometry.clamp_topk(topk);

    let mut idxs = Vec::with_capacity(k * chunks);
    let mut vals = Vec::with_capacity(k * chunks);
    let mut order: Vec<usize> = Vec::with_capacity(total_k);
    for chunk in encoded.coeffs.chunks_exact(total_k) {
        order.clear();
        order.extend(0..total_k);
        order.sort_by(|&a, &b| {
            chunk[b]
                .abs()
                .total_cmp(&chunk[a].abs())
                .then_with(|| a.cmp(&b))
        });
        for &i in &order[..k] {
            idxs.push(i as u32);
            vals.push(chunk[i]);
        }
    }
    SparseParam { idxs, vals }
}

fn scatter_add(
    geometry: &ChunkGeometry,
    sparse: &SparseParam,
    coeffs: &mut [f64],
) -> Result<(), CodecError> {
    if sparse.idxs.len() != sparse.vals.len() {
        return Err(CodecError::LengthMismatch {
            idxs: sparse.idxs.len(),
            vals: sparse.vals.len(),
        });
    }
    let count = sparse.idxs.len();
    if count == 0 {
        return Ok(());
    }
    let chunks = geometry.num_chunks();
    if chunks == 0 || count % chunks != 0 {
        return Err(CodecError::ChunkMisaligned { count, chunks });
    }
    let per_chunk = count / chunks;
    let total_k = geometry.total_k();
    for (j, (&index, &value)) in sparse.idxs.iter().zip(&sparse.vals).enumerate() {
        let local = index as usize;
        if local >= total_k {
            return Err(CodecError::IndexOutOfRange { index, total_k });
        }
        coeffs[(j / per_chunk) * total_k + local] += f64::from(value);
    }
    Ok(())
}
