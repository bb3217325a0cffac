//! Message passing layers over the K-neighbour graph.
//!
//! Two families share one contract: the standard MPNN layers aggregate a scaled sum of
//! messages, the invariant point layers (IPMP) add learned point clouds expressed in
//! per-residue rigid frames and aggregate with a mean over neighbours.
use super::configs::ProteinMPNNConfig;
use super::rigid::Rigid;
use super::utilities::{atom, cat_neighbors_nodes, gather_nodes};
use candle_core::{bail, Module, Result, Tensor, D};
use candle_nn::{layer_norm, linear, Dropout, LayerNorm, Linear, VarBuilder};

const LAYER_NORM_EPS: f64 = 1e-5;
const POINT_NORM_EPS: f64 = 1e-8;

#[derive(Clone, Debug)]
pub struct PositionWiseFeedForward {
    w_in: Linear,
    w_out: Linear,
}

impl PositionWiseFeedForward {
    pub fn new(vb: VarBuilder, num_hidden: usize, num_ff: usize) -> Result<Self> {
        let w_in = linear(num_hidden, num_ff, vb.pp("W_in"))?;
        let w_out = linear(num_ff, num_hidden, vb.pp("W_out"))?;
        Ok(Self { w_in, w_out })
    }
}

impl Module for PositionWiseFeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.w_in.forward(x)?.gelu_erf()?.apply(&self.w_out)
    }
}

/// `W3(gelu(W2(gelu(W1(x)))))`
fn message_mlp(w1: &Linear, w2: &Linear, w3: &Linear, x: &Tensor) -> Result<Tensor> {
    w1.forward(&x.contiguous()?)?.gelu_erf()?.apply(w2)?.gelu_erf()?.apply(w3)
}

/// `[B, M, H]` -> `[B, M, K, H]`
fn expand_nodes(h_v: &Tensor, k: usize) -> Result<Tensor> {
    let (b, m, h) = h_v.dims3()?;
    h_v.unsqueeze(2)?.broadcast_as((b, m, k, h))
}

fn point_norm(points: &Tensor) -> Result<Tensor> {
    (points.sqr()?.sum(D::Minus1)? + POINT_NORM_EPS)?.sqrt()
}

fn masked_nodes(h_v: Tensor, mask_v: &Tensor) -> Result<Tensor> {
    mask_v.unsqueeze(D::Minus1)?.broadcast_mul(&h_v)
}

/// Shared node update: residual message, feed-forward block, then re-zero invalid residues.
#[derive(Clone, Debug)]
struct NodeUpdate {
    dropout1: Dropout,
    dropout2: Dropout,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dense: PositionWiseFeedForward,
}

impl NodeUpdate {
    fn load(vb: &VarBuilder, num_hidden: usize, dropout: f32) -> Result<Self> {
        Ok(Self {
            dropout1: Dropout::new(dropout),
            dropout2: Dropout::new(dropout),
            norm1: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm2"))?,
            dense: PositionWiseFeedForward::new(vb.pp("dense"), num_hidden, num_hidden * 4)?,
        })
    }

    fn forward(&self, h_v: &Tensor, dh: &Tensor, mask_v: &Tensor, train: bool) -> Result<Tensor> {
        let h_v = self
            .norm1
            .forward(&(h_v + self.dropout1.forward(dh, train)?)?)?;
        let dh = self.dense.forward(&h_v)?;
        let h_v = self
            .norm2
            .forward(&(&h_v + self.dropout2.forward(&dh, train)?)?)?;
        masked_nodes(h_v, mask_v)
    }
}

#[derive(Clone, Debug)]
pub struct EncLayer {
    scale: f64,
    node: NodeUpdate,
    dropout3: Dropout,
    norm3: LayerNorm,
    w1: Linear,
    w2: Linear,
    w3: Linear,
    w11: Linear,
    w12: Linear,
    w13: Linear,
}

impl EncLayer {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig, num_in: usize) -> Result<Self> {
        let num_hidden = config.hidden_dim;
        Ok(Self {
            scale: config.scale_factor,
            node: NodeUpdate::load(&vb, num_hidden, config.dropout)?,
            dropout3: Dropout::new(config.dropout),
            norm3: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm3"))?,
            w1: linear(num_hidden + num_in, num_hidden, vb.pp("W1"))?,
            w2: linear(num_hidden, num_hidden, vb.pp("W2"))?,
            w3: linear(num_hidden, num_hidden, vb.pp("W3"))?,
            w11: linear(num_hidden + num_in, num_hidden, vb.pp("W11"))?,
            w12: linear(num_hidden, num_hidden, vb.pp("W12"))?,
            w13: linear(num_hidden, num_hidden, vb.pp("W13"))?,
        })
    }

    fn edge_input(h_v: &Tensor, h_e: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
        let h_ev = cat_neighbors_nodes(h_v, h_e, e_idx)?;
        let h_v_expand = expand_nodes(h_v, e_idx.dim(D::Minus1)?)?;
        Tensor::cat(&[&h_v_expand, &h_ev], D::Minus1)
    }

    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        e_idx: &Tensor,
        mask_v: &Tensor,
        mask_attend: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let h_ev = Self::edge_input(h_v, h_e, e_idx)?;
        let h_message = message_mlp(&self.w1, &self.w2, &self.w3, &h_ev)?;
        let h_message = match mask_attend {
            Some(mask) => mask.unsqueeze(D::Minus1)?.broadcast_mul(&h_message)?,
            None => h_message,
        };
        let dh = (h_message.sum(D::Minus2)? / self.scale)?;
        let h_v = self.node.forward(h_v, &dh, mask_v, train)?;

        let h_ev = Self::edge_input(&h_v, h_e, e_idx)?;
        let h_message = message_mlp(&self.w11, &self.w12, &self.w13, &h_ev)?;
        let h_e = self
            .norm3
            .forward(&(h_e + self.dropout3.forward(&h_message, train)?)?)?;
        Ok((h_v, h_e))
    }
}

#[derive(Clone, Debug)]
pub struct DecLayer {
    scale: f64,
    node: NodeUpdate,
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl DecLayer {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig, num_in: usize) -> Result<Self> {
        let num_hidden = config.hidden_dim;
        Ok(Self {
            scale: config.scale_factor,
            node: NodeUpdate::load(&vb, num_hidden, config.dropout)?,
            w1: linear(num_hidden + num_in, num_hidden, vb.pp("W1"))?,
            w2: linear(num_hidden, num_hidden, vb.pp("W2"))?,
            w3: linear(num_hidden, num_hidden, vb.pp("W3"))?,
        })
    }

    /// `h_e_sc` (side-chain edge embeddings) is appended to the message input when present.
    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        mask_v: &Tensor,
        mask_attend: Option<&Tensor>,
        h_e_sc: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let h_v_expand = expand_nodes(h_v, h_e.dim(2)?)?;
        let h_ev = match h_e_sc {
            Some(h_e_sc) => Tensor::cat(&[&h_v_expand, h_e, h_e_sc], D::Minus1)?,
            None => Tensor::cat(&[&h_v_expand, h_e], D::Minus1)?,
        };
        let h_message = message_mlp(&self.w1, &self.w2, &self.w3, &h_ev)?;
        let h_message = match mask_attend {
            Some(mask) => mask.unsqueeze(D::Minus1)?.broadcast_mul(&h_message)?,
            None => h_message,
        };
        let dh = (h_message.sum(D::Minus2)? / self.scale)?;
        self.node.forward(h_v, &dh, mask_v, train)
    }
}

/// The five geometric message terms, flattened to `[B, M, K, 9 * n_points]`.
///
/// `p_local` are residue i's points in its own frame `[B, M, P, 3]`, `p_global` the same points
/// in the global frame (broadcastable to `[B, M, K, P, 3]`), `neighbor_p_global` the neighbours'
/// global points `[B, M, K, P, 3]` and `frames_i` residue i's frame unsqueezed over `K, P`.
fn point_features(
    p_local: &Tensor,
    p_global: &Tensor,
    neighbor_p_global: &Tensor,
    frames_i: &Rigid,
) -> Result<Tensor> {
    let (b, m, k, p, _) = neighbor_p_global.dims5()?;
    let p_local_expand = p_local.unsqueeze(2)?.broadcast_as((b, m, k, p, 3))?;
    let p_local_norm = point_norm(&p_local_expand)?;
    let neighbor_p_local = frames_i.invert_apply(neighbor_p_global)?;
    let neighbor_p_local_norm = point_norm(&neighbor_p_local)?;
    let neighbor_p_global_norm = point_norm(&p_global.broadcast_sub(neighbor_p_global)?)?;
    Tensor::cat(
        &[
            &p_local_expand.reshape((b, m, k, 3 * p))?,
            &p_local_norm,
            &neighbor_p_local.reshape((b, m, k, 3 * p))?,
            &neighbor_p_local_norm,
            &neighbor_p_global_norm,
        ],
        D::Minus1,
    )
}

fn backbone_frames(x: &Tensor) -> Result<Rigid> {
    Rigid::from_3_points(&atom(x, 0)?, &atom(x, 1)?, &atom(x, 2)?)
}

#[derive(Clone, Debug)]
pub struct IPMPEncoder {
    n_points: usize,
    node: NodeUpdate,
    dropout3: Dropout,
    norm3: LayerNorm,
    points_fn_node: Linear,
    points_fn_edge: Linear,
    w1: Linear,
    w2: Linear,
    w3: Linear,
    w11: Linear,
    w12: Linear,
    w13: Linear,
}

impl IPMPEncoder {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig, num_in: usize) -> Result<Self> {
        let num_hidden = config.hidden_dim;
        let n_points = config.n_points;
        let msg_in = num_hidden + num_in + 9 * n_points;
        Ok(Self {
            n_points,
            node: NodeUpdate::load(&vb, num_hidden, config.dropout)?,
            dropout3: Dropout::new(config.dropout),
            norm3: layer_norm(num_hidden, LAYER_NORM_EPS, vb.pp("norm3"))?,
            points_fn_node: linear(num_hidden, n_points * 3, vb.pp("points_fn_node"))?,
            points_fn_edge: linear(num_hidden, n_points * 3, vb.pp("points_fn_edge"))?,
            w1: linear(msg_in, num_hidden, vb.pp("W1"))?,
            w2: linear(num_hidden, num_hidden, vb.pp("W2"))?,
            w3: linear(num_hidden, num_hidden, vb.pp("W3"))?,
            w11: linear(msg_in, num_hidden, vb.pp("W11"))?,
            w12: linear(num_hidden, num_hidden, vb.pp("W12"))?,
            w13: linear(num_hidden, num_hidden, vb.pp("W13"))?,
        })
    }

    fn message_input(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        e_idx: &Tensor,
        x: &Tensor,
        points_fn: &Linear,
    ) -> Result<Tensor> {
        let (b, l, _) = h_v.dims3()?;
        let k = e_idx.dim(D::Minus1)?;
        let p = self.n_points;
        let frames = backbone_frames(x)?;

        let p_local = points_fn.forward(h_v)?.reshape((b, l, p, 3))?;
        let p_global = frames.unsqueeze(2)?.apply(&p_local)?;
        let neighbor_p_global = gather_nodes(&p_global.reshape((b, l, 3 * p))?, e_idx)?
            .reshape((b, l, k, p, 3))?;
        let frames_i = frames.unsqueeze(2)?.unsqueeze(3)?;
        let points = point_features(
            &p_local,
            &p_global.unsqueeze(2)?,
            &neighbor_p_global,
            &frames_i,
        )?;

        let node_expand = expand_nodes(h_v, k)?;
        let neighbor_edge = cat_neighbors_nodes(h_v, h_e, e_idx)?;
        Tensor::cat(&[&node_expand, &neighbor_edge, &points], D::Minus1)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        e_idx: &Tensor,
        x: &Tensor,
        mask_v: &Tensor,
        mask_attend: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let message_in = self.message_input(h_v, h_e, e_idx, x, &self.points_fn_node)?;
        let node_m = message_mlp(&self.w1, &self.w2, &self.w3, &message_in)?;
        let node_m = match mask_attend {
            Some(mask) => mask.unsqueeze(D::Minus1)?.broadcast_mul(&node_m)?,
            None => node_m,
        };
        let node_m = node_m.mean(D::Minus2)?;
        let h_v = self.node.forward(h_v, &node_m, mask_v, train)?;

        let message_in = self.message_input(&h_v, h_e, e_idx, x, &self.points_fn_edge)?;
        let edge_m = message_mlp(&self.w11, &self.w12, &self.w13, &message_in)?;
        let h_e = self
            .norm3
            .forward(&(h_e + self.dropout3.forward(&edge_m, train)?)?)?;
        Ok((h_v, h_e))
    }
}

#[derive(Clone, Debug)]
pub struct IPMPDecoder {
    num_hidden: usize,
    n_points: usize,
    node: NodeUpdate,
    points_fn: Linear,
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl IPMPDecoder {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig, num_in: usize) -> Result<Self> {
        let num_hidden = config.hidden_dim;
        let n_points = config.n_points;
        Ok(Self {
            num_hidden,
            n_points,
            node: NodeUpdate::load(&vb, num_hidden, config.dropout)?,
            points_fn: linear(num_hidden, n_points * 3, vb.pp("points_fn"))?,
            w1: linear(num_hidden + num_in + 9 * n_points, num_hidden, vb.pp("W1"))?,
            w2: linear(num_hidden, num_hidden, vb.pp("W2"))?,
            w3: linear(num_hidden, num_hidden, vb.pp("W3"))?,
        })
    }

    /// Frames come from the neighbours' backbones and the points from the neighbour node
    /// embeddings at the tail of `h_e`. Neighbour slot 0 is the residue itself.
    fn message_input(&self, h_v: &Tensor, h_e: &Tensor, x_neighbors: &Tensor) -> Result<Tensor> {
        let (b, m, k, c) = h_e.dims4()?;
        let p = self.n_points;
        if c < self.num_hidden {
            bail!("decoder edge input has width {c}, narrower than hidden {}", self.num_hidden)
        }
        let frames = backbone_frames(x_neighbors)?;

        let h_v_prev = h_e.narrow(D::Minus1, c - self.num_hidden, self.num_hidden)?;
        let p_local_neighbor = self.points_fn.forward(&h_v_prev)?.reshape((b, m, k, p, 3))?;
        let p_local = p_local_neighbor.narrow(2, 0, 1)?.squeeze(2)?;

        let neighbor_p_global = frames.unsqueeze(3)?.apply(&p_local_neighbor)?;
        let p_global = neighbor_p_global.narrow(2, 0, 1)?;
        let frames_i = frames.select(2, 0)?.unsqueeze(2)?.unsqueeze(3)?;
        let points = point_features(&p_local, &p_global, &neighbor_p_global, &frames_i)?;

        let node_expand = expand_nodes(h_v, k)?;
        Tensor::cat(&[&node_expand, h_e, &points], D::Minus1)
    }

    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        x_neighbors: &Tensor,
        mask_v: &Tensor,
        mask_attend: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let message_in = self.message_input(h_v, h_e, x_neighbors)?;
        let node_m = message_mlp(&self.w1, &self.w2, &self.w3, &message_in)?;
        let node_m = match mask_attend {
            Some(mask) => mask.unsqueeze(D::Minus1)?.broadcast_mul(&node_m)?,
            None => node_m,
        };
        let node_m = node_m.mean(D::Minus2)?;
        self.node.forward(h_v, &node_m, mask_v, train)
    }
}

/// Encoder layer family, fixed when the model is built.
#[derive(Clone, Debug)]
pub enum EncoderBlock {
    Standard(EncLayer),
    Ipmp(IPMPEncoder),
}

impl EncoderBlock {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig) -> Result<Self> {
        let num_in = config.hidden_dim * 2;
        if config.use_ipmp {
            Ok(Self::Ipmp(IPMPEncoder::load(vb, config, num_in)?))
        } else {
            Ok(Self::Standard(EncLayer::load(vb, config, num_in)?))
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        h_v: &Tensor,
        h_e: &Tensor,
        e_idx: &Tensor,
        x: &Tensor,
        mask_v: &Tensor,
        mask_attend: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Standard(layer) => layer.forward(h_v, h_e, e_idx, mask_v, Some(mask_attend), train),
            Self::Ipmp(layer) => layer.forward(h_v, h_e, e_idx, x, mask_v, Some(mask_attend), train),
        }
    }
}

/// Decoder layer family. Side-chain models always use the standard layer with a 4H input.
#[derive(Clone, Debug)]
pub enum DecoderBlock {
    Standard(DecLayer),
    Ipmp(IPMPDecoder),
}

impl DecoderBlock {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig) -> Result<Self> {
        let h = config.hidden_dim;
        if config.side_chains {
            Ok(Self::Standard(DecLayer::load(vb, config, h * 4)?))
        } else if config.use_ipmp {
            Ok(Self::Ipmp(IPMPDecoder::load(vb, config, h * 3)?))
        } else {
            Ok(Self::Standard(DecLayer::load(vb, config, h * 3)?))
        }
    }

    /// `h_esv` is `[B, M, K, 3H]`, `x_neighbors` `[B, M, K, A, 3]`; `M` is `L` for a parallel
    /// pass or 1 for a single decode step.
    pub fn forward(
        &self,
        h_v: &Tensor,
        h_esv: &Tensor,
        x_neighbors: &Tensor,
        mask_v: &Tensor,
        h_e_sc: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        match self {
            Self::Standard(layer) => layer.forward(h_v, h_esv, mask_v, None, h_e_sc, train),
            Self::Ipmp(layer) => {
                if h_e_sc.is_some() {
                    bail!("side-chain edges are only injected into standard decoder layers")
                }
                layer.forward(h_v, h_esv, x_neighbors, mask_v, None, train)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proteinmpnn::utilities::gather_coords;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn small_config(use_ipmp: bool) -> ProteinMPNNConfig {
        ProteinMPNNConfig {
            hidden_dim: 8,
            node_features: 8,
            edge_features: 8,
            n_points: 2,
            use_ipmp,
            ..Default::default()
        }
    }

    /// Zig-zag backbone so consecutive N, CA, C are never colinear.
    fn backbone(l: usize, device: &Device) -> Result<Tensor> {
        let mut xs = Vec::with_capacity(l * 12);
        for r in 0..l {
            let x0 = r as f32 * 3.8;
            let y = if r % 2 == 0 { 0.0 } else { 1.0 };
            xs.extend_from_slice(&[
                x0 - 1.2,
                y + 0.8,
                0.3,
                x0,
                y,
                0.0,
                x0 + 1.2,
                y + 0.8,
                -0.3,
                x0 + 1.4,
                y + 2.0,
                0.0,
            ]);
        }
        Tensor::from_vec(xs, (1, l, 4, 3), device)
    }

    fn neighbors(device: &Device) -> Result<Tensor> {
        // residue itself first, then two others
        Tensor::new(&[[[0u32, 1, 2], [1, 0, 2], [2, 1, 3], [3, 2, 1]]], device)
    }

    #[test]
    fn test_encoder_blocks_shapes_and_mask() -> Result<()> {
        let device = Device::Cpu;
        for use_ipmp in [false, true] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let config = small_config(use_ipmp);
            let block = EncoderBlock::load(vb.pp("encoder_layers").pp(0), &config)?;
            let h_v = Tensor::randn(0f32, 1., (1, 4, 8), &device)?;
            let h_e = Tensor::randn(0f32, 1., (1, 4, 3, 8), &device)?;
            let mask = Tensor::new(&[[1f32, 1., 1., 0.]], &device)?;
            let mask_attend = Tensor::ones((1, 4, 3), DType::F32, &device)?;
            let (h_v, h_e) = block.forward(
                &h_v,
                &h_e,
                &neighbors(&device)?,
                &backbone(4, &device)?,
                &mask,
                &mask_attend,
                false,
            )?;
            assert_eq!(h_v.dims(), &[1, 4, 8]);
            assert_eq!(h_e.dims(), &[1, 4, 3, 8]);
            let padded = h_v.i((0, 3))?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert_eq!(padded, 0.0, "use_ipmp = {use_ipmp}");
        }
        Ok(())
    }

    #[test]
    fn test_ipmp_weight_names() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _ = EncoderBlock::load(vb.pp("encoder_layers").pp(0), &small_config(true))?;
        let data = varmap.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let w1 = data
            .get("encoder_layers.0.W1.weight")
            .map(|v| v.dims().to_vec());
        // H + 2H + 9P
        assert_eq!(w1, Some(vec![8, 8 + 16 + 18]));
        assert!(data.contains_key("encoder_layers.0.points_fn_edge.weight"));
        assert!(data.contains_key("encoder_layers.0.dense.W_in.weight"));
        Ok(())
    }

    #[test]
    fn test_decoder_blocks() -> Result<()> {
        let device = Device::Cpu;
        let x = backbone(4, &device)?;
        let e_idx = neighbors(&device)?;
        let x_neighbors = gather_coords(&x, &e_idx)?;
        let mask = Tensor::ones((1, 4), DType::F32, &device)?;
        for use_ipmp in [false, true] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let config = small_config(use_ipmp);
            let block = DecoderBlock::load(vb, &config)?;
            assert_eq!(matches!(block, DecoderBlock::Ipmp(_)), use_ipmp);
            let h_v = Tensor::randn(0f32, 1., (1, 4, 8), &device)?;
            let h_esv = Tensor::randn(0f32, 1., (1, 4, 3, 24), &device)?;
            let out = block.forward(&h_v, &h_esv, &x_neighbors, &mask, None, false)?;
            assert_eq!(out.dims(), &[1, 4, 8]);

            // a single decode row gives the same answer as the full pass
            let row = block.forward(
                &h_v.narrow(1, 2, 1)?,
                &h_esv.narrow(1, 2, 1)?,
                &x_neighbors.narrow(1, 2, 1)?,
                &mask.narrow(1, 2, 1)?,
                None,
                false,
            )?;
            let diff = (row.squeeze(1)? - out.i((.., 2))?)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_scalar::<f32>()?;
            assert!(diff < 1e-5, "use_ipmp = {use_ipmp}, diff = {diff}");
        }
        Ok(())
    }

    #[test]
    fn test_side_chain_decoder_width() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ProteinMPNNConfig {
            side_chains: true,
            ..small_config(false)
        };
        let block = DecoderBlock::load(vb, &config)?;
        let h_v = Tensor::randn(0f32, 1., (1, 4, 8), &device)?;
        let h_esv = Tensor::randn(0f32, 1., (1, 4, 3, 24), &device)?;
        let h_e_sc = Tensor::randn(0f32, 1., (1, 4, 3, 8), &device)?;
        let x_neighbors = gather_coords(&backbone(4, &device)?, &neighbors(&device)?)?;
        let mask = Tensor::ones((1, 4), DType::F32, &device)?;
        let out = block.forward(&h_v, &h_esv, &x_neighbors, &mask, Some(&h_e_sc), false)?;
        assert_eq!(out.dims(), &[1, 4, 8]);
        // without the side-chain edges the input is too narrow for W1
        assert!(block
            .forward(&h_v, &h_esv, &x_neighbors, &mask, None, false)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_feed_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ff = PositionWiseFeedForward::new(vb, 8, 32)?;
        let x = Tensor::randn(0f32, 1., (2, 5, 8), &device)?;
        assert_eq!(ff.forward(&x)?.dims(), &[2, 5, 8]);
        Ok(())
    }
}
