//! ProteinMPNN: a message passing protein design network that decodes sequences in a random
//! order, conditioned on backbone (and optionally side-chain) geometry.
//!
//! https://github.com/dauparas/ProteinMPNN
//!
//! Three entry points share the encoder:
//! - [`ProteinMPNN::forward`]: teacher-forced log-probabilities for training and scoring.
//! - [`ProteinMPNN::sample`]: autoregressive sampling, one decode position at a time.
//! - [`ProteinMPNN::sample_srr`]: single-residue recovery, every residue predicted with all
//!   others visible.
use super::configs::{ProteinMPNNConfig, SampleOptions};
use super::decoding::{decoding_order, order_mask_backward, srr_mask_backward, DecodingMasks};
use super::features::ProteinFeaturesModel;
use super::layers::{DecoderBlock, EncoderBlock};
use super::utilities::{
    cat_neighbors_nodes, finite_mask, gather_coords, gather_nodes, gather_rows, nan_to_zero,
};
use candle_core::{bail, DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::encoding::one_hot;
use candle_nn::ops::{log_softmax, softmax};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use thermompnn_core::featurize::ProteinBatch;

const BACKBONE_ATOMS: usize = 4;
const SIDE_CHAIN_ATOMS: usize = 14;

/// Model inputs for a padded batch.
#[derive(Clone, Debug)]
pub struct ProteinInputs {
    /// `[B, L, A, 3]`, NaN for missing atoms. `A` is 4, or 14 for side-chain models.
    pub x: Tensor,
    /// `[B, L]` u32 ground-truth sequence.
    pub s: Tensor,
    /// `[B, L]` f32 residue validity.
    pub mask: Tensor,
    /// `[B, L]` f32, 1 for residues to design.
    pub chain_m: Tensor,
    /// `[B, L]` i64.
    pub residue_idx: Tensor,
    /// `[B, L]` i64 chain labels, 0 for padding.
    pub chain_encoding_all: Tensor,
}

impl From<&ProteinBatch> for ProteinInputs {
    fn from(batch: &ProteinBatch) -> Self {
        Self {
            x: batch.x.clone(),
            s: batch.s.clone(),
            mask: batch.mask.clone(),
            chain_m: batch.chain_m.clone(),
            residue_idx: batch.residue_idx.clone(),
            chain_encoding_all: batch.chain_encoding_all.clone(),
        }
    }
}

impl ProteinInputs {
    fn dims(&self) -> Result<(usize, usize)> {
        let (b, l) = self.mask.dims2()?;
        let (xb, xl, _, three) = self.x.dims4()?;
        if (xb, xl, three) != (b, l, 3) {
            bail!(
                "coordinates {:?} do not match mask [{b}, {l}]",
                self.x.dims()
            )
        }
        for (name, t) in [
            ("s", &self.s),
            ("chain_m", &self.chain_m),
            ("residue_idx", &self.residue_idx),
            ("chain_encoding_all", &self.chain_encoding_all),
        ] {
            if t.dims() != [b, l] {
                bail!("{name} has shape {:?}, expected [{b}, {l}]", t.dims())
            }
        }
        Ok((b, l))
    }
}

#[derive(Clone, Debug)]
pub struct SampleOutput {
    /// `[B, L]` u32 sequence.
    pub s: Tensor,
    /// `[B, L, num_letters]`, zero at residues that were not designed.
    pub probs: Tensor,
    /// `[B, L, num_letters]`, untempered, zero at residues that were not designed.
    pub log_probs: Tensor,
    /// `[B, L]` u32 residue indices in decode order.
    pub decoding_order: Tensor,
    /// `[B, L, num_letters]` output logits. Raw per-step logits from
    /// [`ProteinMPNN::sample`]; divided by the temperature (when positive) in
    /// [`ProteinMPNN::sample_srr`].
    pub logits: Tensor,
}

/// Encoder output plus everything the decoder reuses.
#[derive(Clone, Debug)]
pub struct Encoded {
    pub h_v: Tensor,
    pub h_e: Tensor,
    pub e_idx: Tensor,
    /// NaN-free coordinates, with the virtual C-beta in slot 4 for side-chain models.
    pub x: Tensor,
    /// Projected side-chain edge features, side-chain models only.
    pub h_e_sc: Option<Tensor>,
}

/// Edge features of one pass before the encoder.
struct GraphFeatures {
    e: Tensor,
    e_idx: Tensor,
    x: Tensor,
    /// Side-chain edge features and the neighbour list they were gathered with.
    side_chain: Option<(Tensor, Tensor)>,
}

/// Per-call buffers of the autoregressive sampler.
///
/// Every transition returns a new state that differs from the old one only at the rows
/// selected by `rows`, a `[B, L]` u8 one-hot of the current decode position.
#[derive(Clone, Debug)]
pub struct SamplerState {
    /// `num_decoder_layers + 1` node embeddings `[B, L, H]`, entry 0 is the encoder output.
    pub h_v_stack: Vec<Tensor>,
    pub h_s: Tensor,
    pub s: Tensor,
    pub log_probs: Tensor,
    pub probs: Tensor,
    pub logits: Tensor,
}

/// `buffer` with `value` (`[B, 1, ...]`) written at the rows selected by `rows` (`[B, L]` u8).
fn write_rows(buffer: &Tensor, rows: &Tensor, value: &Tensor) -> Result<Tensor> {
    let mut rows = rows.clone();
    for _ in 2..buffer.rank() {
        rows = rows.unsqueeze(D::Minus1)?;
    }
    let shape = buffer.dims();
    rows.broadcast_as(shape)?
        .where_cond(&value.broadcast_as(shape)?, buffer)
}

impl SamplerState {
    pub fn new(h_v: &Tensor, num_layers: usize, s_true: &Tensor, num_letters: usize) -> Result<Self> {
        let (b, l, _) = h_v.dims3()?;
        let mut h_v_stack = Vec::with_capacity(num_layers + 1);
        h_v_stack.push(h_v.clone());
        for _ in 0..num_layers {
            h_v_stack.push(h_v.zeros_like()?);
        }
        let dist = Tensor::zeros((b, l, num_letters), DType::F32, h_v.device())?;
        Ok(Self {
            h_v_stack,
            h_s: h_v.zeros_like()?,
            s: s_true.to_dtype(DType::U32)?,
            log_probs: dist.clone(),
            probs: dist.clone(),
            logits: dist,
        })
    }

    /// Hidden state of decoder layer `layer` (`1..`) at the current position.
    pub fn with_hidden(mut self, layer: usize, rows: &Tensor, h_v_t: &Tensor) -> Result<Self> {
        self.h_v_stack[layer] = write_rows(&self.h_v_stack[layer], rows, h_v_t)?;
        Ok(self)
    }

    /// Output distribution at the current position, each `[B, 1, num_letters]`.
    pub fn with_distribution(
        self,
        rows: &Tensor,
        log_probs_t: &Tensor,
        probs_t: &Tensor,
        logits_t: &Tensor,
    ) -> Result<Self> {
        Ok(Self {
            log_probs: write_rows(&self.log_probs, rows, log_probs_t)?,
            probs: write_rows(&self.probs, rows, probs_t)?,
            logits: write_rows(&self.logits, rows, logits_t)?,
            ..self
        })
    }

    /// Chosen residue `[B, 1]` and its embedding `[B, 1, H]`.
    pub fn with_residue(self, rows: &Tensor, s_t: &Tensor, h_s_t: &Tensor) -> Result<Self> {
        Ok(Self {
            s: write_rows(&self.s, rows, &s_t.to_dtype(DType::U32)?)?,
            h_s: write_rows(&self.h_s, rows, h_s_t)?,
            ..self
        })
    }
}

fn sampler(options: &SampleOptions) -> LogitsProcessor {
    let sampling = if options.temperature <= 0.0 {
        Sampling::ArgMax
    } else {
        Sampling::All {
            temperature: options.temperature,
        }
    };
    LogitsProcessor::from_sampling(options.seed, sampling)
}

/// One draw per row of `[N, C]` raw logits, returned as u32 `[N]`.
fn draw_rows(processor: &mut LogitsProcessor, logits: &Tensor) -> Result<Tensor> {
    let n = logits.dim(0)?;
    let draws = (0..n)
        .map(|i| processor.sample(&logits.i(i)?))
        .collect::<Result<Vec<u32>>>()?;
    Tensor::from_vec(draws, n, logits.device())
}

/// `designed * chain_mask + truth * (1 - chain_mask)` on u32 sequences.
fn blend_sequence(designed: &Tensor, truth: &Tensor, chain_mask: &Tensor) -> Result<Tensor> {
    let designed = designed.to_dtype(DType::F32)?;
    let truth = truth.to_dtype(DType::F32)?;
    let blended = ((designed * chain_mask)? + (truth * chain_mask.affine(-1.0, 1.0)?)?)?;
    blended.to_dtype(DType::U32)
}

pub struct ProteinMPNN {
    config: ProteinMPNNConfig,
    features: ProteinFeaturesModel,
    /// Side-chain graph builder and its edge projection.
    sca: Option<(ProteinFeaturesModel, Linear)>,
    w_e: Linear,
    w_s: Embedding,
    w_out: Linear,
    encoder_layers: Vec<EncoderBlock>,
    decoder_layers: Vec<DecoderBlock>,
}

impl ProteinMPNN {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig) -> Result<Self> {
        config.validate()?;
        let features = ProteinFeaturesModel::load(vb.pp("features"), config, false)?;
        let sca = if config.side_chains {
            let sca_features = ProteinFeaturesModel::load(vb.pp("sca_features"), config, true)?;
            let sca_w_e = linear(config.edge_features, config.hidden_dim, vb.pp("sca_W_e"))?;
            Some((sca_features, sca_w_e))
        } else {
            None
        };
        let w_e = linear(config.edge_features, config.hidden_dim, vb.pp("W_e"))?;
        let w_s = embedding(config.vocab, config.hidden_dim, vb.pp("W_s"))?;
        let w_out = linear(config.hidden_dim, config.num_letters, vb.pp("W_out"))?;

        let vb_enc = vb.pp("encoder_layers");
        let encoder_layers = (0..config.num_encoder_layers)
            .map(|i| EncoderBlock::load(vb_enc.pp(i), config))
            .collect::<Result<Vec<_>>>()?;
        let vb_dec = vb.pp("decoder_layers");
        let decoder_layers = (0..config.num_decoder_layers)
            .map(|i| DecoderBlock::load(vb_dec.pp(i), config))
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "ProteinMPNN: {} encoder / {} decoder layers, ipmp = {}, side_chains = {}, srr = {}",
            config.num_encoder_layers,
            config.num_decoder_layers,
            config.use_ipmp,
            config.side_chains,
            config.single_res_rec
        );
        Ok(Self {
            config: config.clone(),
            features,
            sca,
            w_e,
            w_s,
            w_out,
            encoder_layers,
            decoder_layers,
        })
    }

    pub fn config(&self) -> &ProteinMPNNConfig {
        &self.config
    }

    /// Both graph builders over one noised copy of the coordinates.
    ///
    /// The side-chain builder reuses the backbone neighbour list, so `h_e_sc` lines up with
    /// `e_idx` in every mode.
    fn graph_features(&self, inputs: &ProteinInputs, train: bool) -> Result<GraphFeatures> {
        let n_atoms = inputs.x.dim(2)?;
        let mask = inputs.mask.to_dtype(DType::F32)?;
        // per-atom validity must be read before NaNs are replaced
        let mask_per_atom = finite_mask(&inputs.x)?;
        let x = self.features.augment(&nan_to_zero(&inputs.x)?, train)?;

        match &self.sca {
            None => {
                if n_atoms < BACKBONE_ATOMS {
                    bail!("expected at least {BACKBONE_ATOMS} backbone atoms, got {n_atoms}")
                }
                let (e, e_idx, x) = self.features.forward(
                    &x.narrow(2, 0, BACKBONE_ATOMS)?,
                    &mask,
                    &inputs.residue_idx,
                    &inputs.chain_encoding_all,
                    None,
                    None,
                )?;
                Ok(GraphFeatures {
                    e,
                    e_idx,
                    x,
                    side_chain: None,
                })
            }
            Some((sca_features, _)) => {
                if n_atoms != SIDE_CHAIN_ATOMS {
                    bail!("side-chain model expects {SIDE_CHAIN_ATOMS} atom slots, got {n_atoms}")
                }
                let (e, e_idx, _) = self.features.forward(
                    &x.narrow(2, 0, BACKBONE_ATOMS)?,
                    &mask,
                    &inputs.residue_idx,
                    &inputs.chain_encoding_all,
                    None,
                    None,
                )?;
                let (e_sc, e_idx_sc, x) = sca_features.forward(
                    &x,
                    &mask,
                    &inputs.residue_idx,
                    &inputs.chain_encoding_all,
                    Some(&mask_per_atom),
                    Some(&e_idx),
                )?;
                Ok(GraphFeatures {
                    e,
                    e_idx,
                    x,
                    side_chain: Some((e_sc, e_idx_sc)),
                })
            }
        }
    }

    /// Graph features and the encoder stack.
    pub fn encode(&self, inputs: &ProteinInputs, train: bool) -> Result<Encoded> {
        let (b, l) = inputs.dims()?;
        let mask = inputs.mask.to_dtype(DType::F32)?;
        if mask.sum(1)?.min(0)?.to_scalar::<f32>()? == 0.0 {
            log::warn!("batch contains a row without valid residues");
        }
        let GraphFeatures {
            e,
            e_idx,
            x,
            side_chain,
        } = self.graph_features(inputs, train)?;
        let h_e_sc = match (&self.sca, side_chain) {
            (Some((_, sca_w_e)), Some((e_sc, _))) => Some(sca_w_e.forward(&e_sc)?),
            _ => None,
        };

        let mut h_v = Tensor::zeros((b, l, self.config.hidden_dim), DType::F32, e.device())?;
        let mut h_e = self.w_e.forward(&e)?;
        let mask_attend = gather_nodes(&mask.unsqueeze(D::Minus1)?, &e_idx)?.squeeze(D::Minus1)?;
        let mask_attend = mask.unsqueeze(D::Minus1)?.broadcast_mul(&mask_attend)?;
        for layer in &self.encoder_layers {
            let (new_h_v, new_h_e) =
                layer.forward(&h_v, &h_e, &e_idx, &x, &mask, &mask_attend, train)?;
            h_v = new_h_v;
            h_e = new_h_e;
        }
        log::debug!("encoded: h_v {:?}, h_e {:?}", h_v.dims(), h_e.dims());
        Ok(Encoded {
            h_v,
            h_e,
            e_idx,
            x,
            h_e_sc,
        })
    }

    /// Encoder context for not-yet-decoded neighbours: `[h_e, 0, h_v_j]` masked by `mask_fw`.
    fn encoder_context(encoded: &Encoded, masks: &DecodingMasks) -> Result<Tensor> {
        let Encoded { h_v, h_e, e_idx, .. } = encoded;
        let h_ex_encoder = cat_neighbors_nodes(&h_v.zeros_like()?, h_e, e_idx)?;
        let h_exv_encoder = cat_neighbors_nodes(h_v, &h_ex_encoder, e_idx)?;
        masks.mask_fw.broadcast_mul(&h_exv_encoder)
    }

    /// All decoder layers at once, given sequence embeddings `h_s` and an order mask.
    fn decode_parallel(
        &self,
        encoded: &Encoded,
        h_s: &Tensor,
        order_mask: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let masks = DecodingMasks::new(order_mask, &encoded.e_idx, mask)?;
        let h_es = cat_neighbors_nodes(h_s, &encoded.h_e, &encoded.e_idx)?;
        let h_exv_encoder_fw = Self::encoder_context(encoded, &masks)?;
        let x_neighbors = gather_coords(&encoded.x, &encoded.e_idx)?;

        let mut h_v = encoded.h_v.clone();
        for layer in &self.decoder_layers {
            let h_esv = cat_neighbors_nodes(&h_v, &h_es, &encoded.e_idx)?;
            let h_esv = masks
                .mask_bw
                .broadcast_mul(&h_esv)?
                .add(&h_exv_encoder_fw)?;
            h_v = layer.forward(
                &h_v,
                &h_esv,
                &x_neighbors,
                mask,
                encoded.h_e_sc.as_ref(),
                train,
            )?;
        }
        Ok(h_v)
    }

    /// Teacher-forced log-probabilities `[B, L, num_letters]` under the decode order given by
    /// `randn` (`[B, L]` tie-break keys).
    pub fn forward(&self, inputs: &ProteinInputs, randn: &Tensor, train: bool) -> Result<Tensor> {
        let (b, l) = inputs.dims()?;
        let encoded = self.encode(inputs, train)?;
        let mask = inputs.mask.to_dtype(DType::F32)?;
        let chain_m = (inputs.chain_m.to_dtype(DType::F32)? * &mask)?;
        let order = decoding_order(&chain_m, randn)?;
        let order_mask = if self.config.single_res_rec {
            srr_mask_backward(b, l, mask.device())?
        } else {
            order_mask_backward(&order)?
        };
        let h_s = self.w_s.forward(&inputs.s)?;
        let h_v = self.decode_parallel(&encoded, &h_s, &order_mask, &mask, train)?;
        log_softmax(&self.w_out.forward(&h_v)?, D::Minus1)
    }

    /// Autoregressive sampling in the order given by `randn`.
    ///
    /// Residues with `chain_m * mask == 0` keep their ground-truth identity and a zero
    /// distribution. Rows of the batch advance in lockstep.
    pub fn sample(
        &self,
        inputs: &ProteinInputs,
        randn: &Tensor,
        options: &SampleOptions,
    ) -> Result<SampleOutput> {
        let (_, l) = inputs.dims()?;
        let encoded = self.encode(inputs, false)?;
        let mask = inputs.mask.to_dtype(DType::F32)?;
        let chain_mask = (inputs.chain_m.to_dtype(DType::F32)? * &mask)?;
        let order = decoding_order(&chain_mask, randn)?;
        let masks = DecodingMasks::new(&order_mask_backward(&order)?, &encoded.e_idx, &mask)?;
        let h_exv_encoder_fw = Self::encoder_context(&encoded, &masks)?;
        let x_neighbors = gather_coords(&encoded.x, &encoded.e_idx)?;
        let s_true = inputs.s.to_dtype(DType::U32)?;

        let mut processor = sampler(options);
        let mut state = SamplerState::new(
            &encoded.h_v,
            self.decoder_layers.len(),
            &s_true,
            self.config.num_letters,
        )?;
        for t_ in 0..l {
            // [B, 1]
            let t = order.narrow(1, t_, 1)?.contiguous()?;
            let rows = one_hot(t.squeeze(1)?, l, 1u8, 0u8)?;
            let chain_mask_t = gather_rows(&chain_mask, &t)?;
            let mask_t = gather_rows(&mask, &t)?;
            let s_true_t = gather_rows(&s_true, &t)?;

            let s_t = if mask_t.sum_all()?.to_scalar::<f32>()? == 0.0 {
                s_true_t.clone()
            } else {
                let e_idx_t = gather_rows(&encoded.e_idx, &t)?;
                let h_e_t = gather_rows(&encoded.h_e, &t)?;
                let h_es_t = cat_neighbors_nodes(&state.h_s, &h_e_t, &e_idx_t)?;
                let h_exv_encoder_t = gather_rows(&h_exv_encoder_fw, &t)?;
                let mask_bw_t = gather_rows(&masks.mask_bw, &t)?;
                let x_neighbors_t = gather_rows(&x_neighbors, &t)?;
                let h_e_sc_t = encoded
                    .h_e_sc
                    .as_ref()
                    .map(|h| gather_rows(h, &t))
                    .transpose()?;

                for (layer_idx, layer) in self.decoder_layers.iter().enumerate() {
                    let h_v_prev = &state.h_v_stack[layer_idx];
                    let h_esv_decoder_t = cat_neighbors_nodes(h_v_prev, &h_es_t, &e_idx_t)?;
                    let h_esv_t = mask_bw_t
                        .broadcast_mul(&h_esv_decoder_t)?
                        .add(&h_exv_encoder_t)?;
                    let h_v_t = gather_rows(h_v_prev, &t)?;
                    let h_v_t = layer.forward(
                        &h_v_t,
                        &h_esv_t,
                        &x_neighbors_t,
                        &mask_t,
                        h_e_sc_t.as_ref(),
                        false,
                    )?;
                    state = state.with_hidden(layer_idx + 1, &rows, &h_v_t)?;
                }

                let h_v_t = match state.h_v_stack.last() {
                    Some(h) => gather_rows(h, &t)?.squeeze(1)?,
                    None => bail!("decoder has no layers"),
                };
                let logits = self.w_out.forward(&h_v_t)?;
                let log_probs_t = log_softmax(&logits, D::Minus1)?;
                let probs_t = if options.temperature > 0.0 {
                    softmax(&(&logits / options.temperature)?, D::Minus1)?
                } else {
                    softmax(&logits, D::Minus1)?
                };
                let drawn = draw_rows(&mut processor, &logits)?.unsqueeze(1)?;

                let cm = chain_mask_t.unsqueeze(D::Minus1)?;
                state = state.with_distribution(
                    &rows,
                    &cm.broadcast_mul(&log_probs_t.unsqueeze(1)?)?,
                    &cm.broadcast_mul(&probs_t.unsqueeze(1)?)?,
                    &logits.unsqueeze(1)?,
                )?;
                drawn
            };

            let s_t = blend_sequence(&s_t, &s_true_t, &chain_mask_t)?;
            let h_s_t = self.w_s.forward(&s_t)?;
            state = state.with_residue(&rows, &s_t, &h_s_t)?;
            log::trace!("decoded step {}/{}", t_ + 1, l);
        }

        Ok(SampleOutput {
            s: state.s,
            probs: state.probs,
            log_probs: state.log_probs,
            decoding_order: order,
            logits: state.logits,
        })
    }

    /// Single-residue recovery: one parallel decoder pass where each residue sees the true
    /// identities of all others.
    pub fn sample_srr(
        &self,
        inputs: &ProteinInputs,
        randn: &Tensor,
        options: &SampleOptions,
    ) -> Result<SampleOutput> {
        let (b, l) = inputs.dims()?;
        let encoded = self.encode(inputs, false)?;
        let mask = inputs.mask.to_dtype(DType::F32)?;
        let chain_mask = (inputs.chain_m.to_dtype(DType::F32)? * &mask)?;
        let order = decoding_order(&chain_mask, randn)?;
        let s_true = inputs.s.to_dtype(DType::U32)?;
        let h_s = self.w_s.forward(&s_true)?;
        let order_mask = srr_mask_backward(b, l, mask.device())?;
        let h_v = self.decode_parallel(&encoded, &h_s, &order_mask, &mask, false)?;

        let raw_logits = self.w_out.forward(&h_v)?;
        let log_probs = log_softmax(&raw_logits, D::Minus1)?;
        let logits = if options.temperature > 0.0 {
            (&raw_logits / options.temperature)?
        } else {
            raw_logits.clone()
        };
        let probs = softmax(&logits, D::Minus1)?;

        let mut processor = sampler(options);
        let flat = raw_logits.reshape((b * l, self.config.num_letters))?;
        let s = draw_rows(&mut processor, &flat)?.reshape((b, l))?;

        let s = blend_sequence(&s, &s_true, &chain_mask)?;
        let cm = chain_mask.unsqueeze(D::Minus1)?;
        Ok(SampleOutput {
            s,
            probs: probs.broadcast_mul(&cm)?,
            log_probs: log_probs.broadcast_mul(&cm)?,
            decoding_order: order,
            logits,
        })
    }
}
