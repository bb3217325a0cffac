//! Random decoding orders and the causal visibility masks derived from them.
use super::utilities::gather_edges;
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::encoding::one_hot;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Added to the must-predict mask before scaling the random keys.
pub const ORDER_EPS: f64 = 1e-4;

/// Standard-normal tie-break keys `[B, L]` drawn from `rng`.
pub fn random_keys<R: Rng + ?Sized>(
    batch: usize,
    len: usize,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let keys: Vec<f32> = (0..batch * len)
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Tensor::from_vec(keys, (batch, len), device)
}

/// Residue indices sorted by `(chain_mask + 1e-4) * |randn|`, ascending. Returns u32 `[B, L]`.
pub fn decoding_order(chain_mask: &Tensor, randn: &Tensor) -> Result<Tensor> {
    let keys = (chain_mask.to_dtype(DType::F32)? + ORDER_EPS)?.mul(&randn.abs()?)?;
    keys.contiguous()?.arg_sort_last_dim(true)
}

/// `[B, L, L]` with entry `(q, p)` set when residue `q` is decoded after residue `p`.
pub fn order_mask_backward(order: &Tensor) -> Result<Tensor> {
    let (_, l) = order.dims2()?;
    let device = order.device();
    // [B, rank, residue]
    let permutation = one_hot(order.to_dtype(DType::U32)?, l, 1f32, 0f32)?;
    let strictly_lower =
        (Tensor::tril2(l, DType::F32, device)? - Tensor::eye(l, DType::F32, device)?)?;
    permutation
        .transpose(1, 2)?
        .contiguous()?
        .broadcast_matmul(&strictly_lower)?
        .matmul(&permutation)
}

/// Single-residue recovery: everything but the residue itself is visible.
pub fn srr_mask_backward(batch: usize, len: usize, device: &Device) -> Result<Tensor> {
    let visible = (Tensor::ones((len, len), DType::F32, device)?
        - Tensor::eye(len, DType::F32, device)?)?;
    visible.unsqueeze(0)?.broadcast_as((batch, len, len))?.contiguous()
}

/// Order masks restricted to the neighbour graph, `[B, L, K, 1]` each.
#[derive(Clone, Debug)]
pub struct DecodingMasks {
    /// Neighbour already decoded: sequence embedding visible.
    pub mask_bw: Tensor,
    /// Neighbour not yet decoded: encoder context only.
    pub mask_fw: Tensor,
}

impl DecodingMasks {
    pub fn new(order_mask_backward: &Tensor, e_idx: &Tensor, mask: &Tensor) -> Result<Self> {
        let (b, l) = mask.dims2()?;
        let mask_attend = gather_edges(&order_mask_backward.unsqueeze(D::Minus1)?, e_idx)?;
        let mask_1d = mask.reshape((b, l, 1, 1))?;
        let mask_bw = mask_1d.broadcast_mul(&mask_attend)?;
        let mask_fw = mask_1d.broadcast_mul(&mask_attend.affine(-1.0, 1.0)?)?;
        Ok(Self { mask_bw, mask_fw })
    }
}
