use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thermompnn_core::{featurize, AtomSlot, ChainRecord, ProteinEntry};
use thermompnn_nn::proteinmpnn::decoding::random_keys;
use thermompnn_nn::proteinmpnn::features::ProteinFeaturesModel;
use thermompnn_nn::proteinmpnn::loss::{loss_nll, sequence_recovery};
use thermompnn_nn::proteinmpnn::utilities::nan_to_zero;
use thermompnn_nn::{ProteinInputs, ProteinMPNN, ProteinMPNNConfig, SampleOptions};
use thermompnn_test_data::{two_chain_complex, SyntheticChain};

fn small_config() -> ProteinMPNNConfig {
    ProteinMPNNConfig {
        node_features: 16,
        edge_features: 16,
        hidden_dim: 16,
        num_encoder_layers: 2,
        num_decoder_layers: 2,
        k_neighbors: 8,
        num_rbf: 8,
        num_positional_embeddings: 8,
        n_points: 4,
        ..Default::default()
    }
}

fn entry(name: &str, chains: &[SyntheticChain], masked: &[&str], side_chains: bool) -> ProteinEntry {
    let mut entry = ProteinEntry::new(name);
    for chain in chains {
        let mut record = ChainRecord::new(chain.sequence.clone());
        for slot in AtomSlot::slots(side_chains) {
            record = record.with_atom(&slot.to_string(), chain.atom_column(slot.to_index()));
        }
        entry = entry.with_chain(&chain.id, record, masked.contains(&chain.id.as_str()));
    }
    entry
}

fn build(config: &ProteinMPNNConfig, device: &Device) -> Result<(VarMap, ProteinMPNN)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = ProteinMPNN::load(vb, config)?;
    Ok((varmap, model))
}

fn inputs(entries: &[ProteinEntry], side_chains: bool, device: &Device) -> Result<ProteinInputs> {
    let mut rng = StdRng::seed_from_u64(0);
    let batch = featurize(entries, device, side_chains, &mut rng)?;
    Ok(ProteinInputs::from(&batch))
}

#[test]
fn test_forward_log_probs() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = build(&small_config(), &device)?;
    let chains = two_chain_complex();
    let inputs = inputs(&[entry("complex", &chains, &["A"], false)], false, &device)?;
    let randn = random_keys(1, 20, &mut StdRng::seed_from_u64(1), &device)?;

    let log_probs = model.forward(&inputs, &randn, false)?;
    assert_eq!(log_probs.dims(), &[1, 20, 21]);
    let total = log_probs.exp()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(total.iter().all(|p| (p - 1.0).abs() < 1e-4));

    let (_, loss_av, _) = loss_nll(&inputs.s, &log_probs, &inputs.mask)?;
    assert!(loss_av.to_scalar::<f32>()?.is_finite());

    // dropout and coordinate noise only act in training mode
    let again = model.forward(&inputs, &randn, false)?;
    let diff = (&log_probs - &again)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}

/// With a single decoder layer and zeroed sequence embeddings the decoder input no longer
/// depends on the decode order, so arg-max sampling gives one answer for any order.
#[test]
fn test_argmax_sampling_ignores_decoding_order() -> Result<()> {
    let device = Device::Cpu;
    let config = ProteinMPNNConfig {
        num_decoder_layers: 1,
        ..small_config()
    };
    let (mut varmap, model) = build(&config, &device)?;
    varmap.set_one("W_s.weight", Tensor::zeros((21, 16), DType::F32, &device)?)?;

    let chain = SyntheticChain::helix("A", "MKTAYIAKQR", [0.0, 0.0, 0.0]);
    let inputs = inputs(&[entry("helix", &[chain], &["A"], false)], false, &device)?;
    let options = SampleOptions {
        temperature: 0.0,
        seed: 0,
    };
    let first = model.sample(
        &inputs,
        &random_keys(1, 10, &mut StdRng::seed_from_u64(11), &device)?,
        &options,
    )?;
    let second = model.sample(
        &inputs,
        &random_keys(1, 10, &mut StdRng::seed_from_u64(12), &device)?,
        &options,
    )?;
    assert_ne!(
        first.decoding_order.to_vec2::<u32>()?,
        second.decoding_order.to_vec2::<u32>()?
    );
    assert_eq!(first.s.to_vec2::<u32>()?, second.s.to_vec2::<u32>()?);

    // every position was designed, so each row carries a distribution
    let mass = first.probs.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(mass.iter().all(|p| (p - 1.0).abs() < 1e-4));
    Ok(())
}

#[test]
fn test_sampling_keeps_fixed_and_padded_residues() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = build(&small_config(), &device)?;
    let complex = entry("complex", &two_chain_complex(), &["A"], false);
    let short = entry(
        "short",
        &[SyntheticChain::helix("C", "ACDEFG", [40.0, 0.0, 0.0])],
        &["C"],
        false,
    );
    let inputs = inputs(&[complex, short], false, &device)?;
    let s_true = inputs.s.to_vec2::<u32>()?;
    let designed = (&inputs.chain_m * &inputs.mask)?.to_vec2::<f32>()?;

    for (temperature, seed) in [(1.0, 3u64), (0.5, 4), (0.0, 5)] {
        let randn = random_keys(2, 20, &mut StdRng::seed_from_u64(seed), &device)?;
        let out = model.sample(&inputs, &randn, &SampleOptions { temperature, seed })?;
        let s = out.s.to_vec2::<u32>()?;
        let probs = out.probs.sum(D::Minus1)?.to_vec2::<f32>()?;
        for b in 0..2 {
            for l in 0..20 {
                if designed[b][l] == 0.0 {
                    assert_eq!(s[b][l], s_true[b][l], "row {b} position {l}");
                    assert_eq!(probs[b][l], 0.0);
                } else {
                    assert!(s[b][l] < 21);
                }
            }
        }
    }

    // the same keys and seed reproduce the same draw
    let randn = random_keys(2, 20, &mut StdRng::seed_from_u64(9), &device)?;
    let options = SampleOptions {
        temperature: 1.0,
        seed: 9,
    };
    let a = model.sample(&inputs, &randn, &options)?;
    let b = model.sample(&inputs, &randn, &options)?;
    assert_eq!(a.s.to_vec2::<u32>()?, b.s.to_vec2::<u32>()?);
    Ok(())
}

#[test]
fn test_sparse_neighborhood_in_padded_batch() -> Result<()> {
    let device = Device::Cpu;
    let config = ProteinMPNNConfig {
        k_neighbors: 30,
        ..small_config()
    };
    let long = entry(
        "long",
        &[SyntheticChain::helix("A", &"A".repeat(40), [0.0, 0.0, 0.0])],
        &["A"],
        true,
    );
    let tiny = entry(
        "tiny",
        &[SyntheticChain::helix("A", "MKTA", [50.0, 50.0, 50.0])],
        &["A"],
        true,
    );
    let inputs = inputs(&[long, tiny], true, &device)?;
    let x = nan_to_zero(&inputs.x)?;
    let mask_per_atom = thermompnn_nn::proteinmpnn::utilities::finite_mask(&inputs.x)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let backbone = ProteinFeaturesModel::load(vb.pp("features"), &config, false)?;
    let graph = backbone.graph(
        &x.narrow(2, 0, 4)?,
        &inputs.mask,
        &inputs.residue_idx,
        &inputs.chain_encoding_all,
        None,
        None,
    )?;
    assert_eq!(graph.e_idx.dims(), &[2, 40, 30]);
    let row = graph.e_idx.i((1, 0))?.to_vec1::<u32>()?;
    let mut valid: Vec<u32> = row[..4].to_vec();
    valid.sort();
    assert_eq!(valid, vec![0, 1, 2, 3]);
    assert!(row[4..].iter().all(|&j| j >= 4));
    // padding sits at the origin, far outside the RBF range
    let padded_rbf = graph
        .rbf
        .i((1, 0))?
        .narrow(0, 4, 26)?
        .max_keepdim(D::Minus1)?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(padded_rbf < 1e-6, "padded rbf {padded_rbf}");

    let side_chain = ProteinFeaturesModel::load(vb.pp("sca_features"), &config, true)?;
    let graph = side_chain.graph(
        &x,
        &inputs.mask,
        &inputs.residue_idx,
        &inputs.chain_encoding_all,
        Some(&mask_per_atom),
        None,
    )?;
    let gated = graph
        .rbf
        .i((1, 0))?
        .narrow(0, 4, 26)?
        .abs()?
        .sum_all()?
        .to_scalar::<f32>()?;
    assert_eq!(gated, 0.0);
    Ok(())
}

#[test]
fn test_cross_chain_positional_class() -> Result<()> {
    let device = Device::Cpu;
    let config = ProteinMPNNConfig {
        k_neighbors: 20,
        ..small_config()
    };
    let inputs = inputs(
        &[entry("complex", &two_chain_complex(), &["A", "B"], false)],
        false,
        &device,
    )?;
    // contiguous numbering across the chain break, so raw offsets are small
    let residue_idx = Tensor::arange(0i64, 20, &device)?.unsqueeze(0)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let features = ProteinFeaturesModel::load(vb, &config, false)?;
    let graph = features.graph(
        &nan_to_zero(&inputs.x)?,
        &inputs.mask,
        &residue_idx,
        &inputs.chain_encoding_all,
        None,
        None,
    )?;
    let classes = features
        .positional()
        .classes(&graph.offsets, &graph.same_chain)?
        .i(0)?
        .to_vec2::<i64>()?;
    let e_idx = graph.e_idx.i(0)?.to_vec2::<u32>()?;
    let chains = inputs.chain_encoding_all.i(0)?.to_vec1::<i64>()?;
    let mut cross = 0;
    for i in 0..20 {
        for (k, &j) in e_idx[i].iter().enumerate() {
            if chains[i] != chains[j as usize] {
                assert_eq!(classes[i][k], 65);
                cross += 1;
            } else {
                let offset = (i as i64 - j as i64).clamp(-32, 32);
                assert_eq!(classes[i][k], offset + 32);
            }
        }
    }
    assert_eq!(cross, 200);
    Ok(())
}

#[test]
fn test_single_residue_recovery() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = build(&small_config(), &device)?;
    let inputs = inputs(
        &[entry("complex", &two_chain_complex(), &["B"], false)],
        false,
        &device,
    )?;
    let randn = random_keys(1, 20, &mut StdRng::seed_from_u64(2), &device)?;
    let out = model.sample_srr(
        &inputs,
        &randn,
        &SampleOptions {
            temperature: 0.0,
            seed: 0,
        },
    )?;
    assert_eq!(out.logits.dims(), &[1, 20, 21]);
    let designed = inputs.chain_m.i(0)?.to_vec1::<f32>()?;
    let argmax = out.logits.argmax(D::Minus1)?.i(0)?.to_vec1::<u32>()?;
    let s = out.s.i(0)?.to_vec1::<u32>()?;
    let s_true = inputs.s.i(0)?.to_vec1::<u32>()?;
    for l in 0..20 {
        if designed[l] == 1.0 {
            assert_eq!(s[l], argmax[l]);
        } else {
            assert_eq!(s[l], s_true[l]);
        }
    }
    let recovery = sequence_recovery(&inputs.s, &out.s, &inputs.mask)?.to_vec1::<f32>()?;
    // chain A is held fixed
    assert!(recovery[0] >= 0.5);

    let masked = out.probs.sum(D::Minus1)?.i(0)?.to_vec1::<f32>()?;
    for l in 0..20 {
        let expected = if designed[l] == 1.0 { 1.0 } else { 0.0 };
        assert!((masked[l] - expected).abs() < 1e-4);
    }
    Ok(())
}

#[test]
fn test_logits_temperature_scaling() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = build(&small_config(), &device)?;
    let inputs = inputs(
        &[entry("complex", &two_chain_complex(), &["A", "B"], false)],
        false,
        &device,
    )?;
    let randn = random_keys(1, 20, &mut StdRng::seed_from_u64(4), &device)?;
    let options = |temperature| SampleOptions {
        temperature,
        seed: 1,
    };

    let raw = model.sample_srr(&inputs, &randn, &options(0.0))?;
    let cooled = model.sample_srr(&inputs, &randn, &options(0.5))?;
    let rescaled = (&cooled.logits * 0.5)?;
    let diff = (rescaled - &raw.logits)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-5);
    let log_diff = (&cooled.log_probs - &raw.log_probs)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    assert!(log_diff < 1e-5);

    // autoregressive logits stay raw whatever the temperature
    let out = model.sample(&inputs, &randn, &options(0.5))?;
    let from_logits = log_softmax(&out.logits, D::Minus1)?;
    let diff = (from_logits - &out.log_probs)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    assert!(diff < 1e-4);
    Ok(())
}

#[test]
fn test_ipmp_model() -> Result<()> {
    let device = Device::Cpu;
    let config = ProteinMPNNConfig {
        use_ipmp: true,
        ..small_config()
    };
    let (_varmap, model) = build(&config, &device)?;
    let inputs = inputs(
        &[entry("complex", &two_chain_complex(), &["A"], false)],
        false,
        &device,
    )?;
    let randn = random_keys(1, 20, &mut StdRng::seed_from_u64(5), &device)?;
    let log_probs = model.forward(&inputs, &randn, false)?;
    assert_eq!(log_probs.dims(), &[1, 20, 21]);
    let options = SampleOptions {
        temperature: 0.1,
        seed: 5,
    };
    let out = model.sample(&inputs, &randn, &options)?;
    assert_eq!(out.s.dims(), &[1, 20]);
    let srr = model.sample_srr(&inputs, &randn, &options)?;
    assert_eq!(srr.log_probs.dims(), &[1, 20, 21]);
    let finite = log_probs.flatten_all()?.to_vec1::<f32>()?;
    assert!(finite.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn test_side_chain_model() -> Result<()> {
    let device = Device::Cpu;
    let config = ProteinMPNNConfig {
        side_chains: true,
        ..small_config()
    };
    let (varmap, model) = build(&config, &device)?;
    {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        assert!(data.contains_key("sca_W_e.weight"));
        assert!(data.contains_key("sca_features.edge_embedding.weight"));
        let w1 = data.get("decoder_layers.0.W1.weight").map(|v| v.dims().to_vec());
        assert_eq!(w1, Some(vec![16, 16 * 5]));
    }

    let chain = SyntheticChain::helix("A", "MKTAYIAKQR", [0.0, 0.0, 0.0]).with_missing_residue(4);
    let inputs = inputs(&[entry("helix", &[chain], &["A"], true)], true, &device)?;
    assert_eq!(inputs.x.dims(), &[1, 10, 14, 3]);
    assert_eq!(inputs.mask.i((0, 4))?.to_scalar::<f32>()?, 0.0);

    let randn = random_keys(1, 10, &mut StdRng::seed_from_u64(8), &device)?;
    let log_probs = model.forward(&inputs, &randn, false)?;
    assert_eq!(log_probs.dims(), &[1, 10, 21]);
    let options = SampleOptions {
        temperature: 1.0,
        seed: 8,
    };
    let out = model.sample(&inputs, &randn, &options)?;
    assert_eq!(
        out.s.i((0, 4))?.to_scalar::<u32>()?,
        inputs.s.i((0, 4))?.to_scalar::<u32>()?
    );
    let srr = model.sample_srr(&inputs, &randn, &options)?;
    assert_eq!(srr.probs.dims(), &[1, 10, 21]);

    // backbone-only input is rejected by a side-chain model
    let backbone_only = ProteinInputs {
        x: inputs.x.narrow(2, 0, 4)?,
        ..inputs
    };
    assert!(model.forward(&backbone_only, &randn, false).is_err());
    Ok(())
}

#[test]
fn test_training_mode_is_stochastic() -> Result<()> {
    let device = Device::Cpu;
    let (_varmap, model) = build(&small_config(), &device)?;
    let inputs = inputs(
        &[entry("complex", &two_chain_complex(), &["A"], false)],
        false,
        &device,
    )?;
    let randn = random_keys(1, 20, &mut StdRng::seed_from_u64(6), &device)?;
    let a = model.forward(&inputs, &randn, true)?;
    let b = model.forward(&inputs, &randn, true)?;
    let diff = (&a - &b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    assert!(diff > 0.0);
    Ok(())
}

#[test]
fn test_pdb_to_design() -> Result<()> {
    use thermompnn_nn::proteinmpnn::loss::{burial_classes, burial_counts, loss_smoothed};
    use thermompnn_test_data::TestFile;

    let device = Device::Cpu;
    let (path, _handle) = TestFile::helix_dimer().create_temp().unwrap();
    let (pdb, _errors) = pdbtbx::open(path).unwrap();
    let entry = ProteinEntry::from_pdb(&pdb, "dimer", &["A"]).unwrap();
    let inputs = inputs(&[entry], false, &device)?;
    assert_eq!(inputs.x.dims(), &[1, 20, 4, 3]);

    let (_varmap, model) = build(&small_config(), &device)?;
    let randn = random_keys(1, 20, &mut StdRng::seed_from_u64(21), &device)?;
    let log_probs = model.forward(&inputs, &randn, false)?;
    let (_, loss_av) = loss_smoothed(&inputs.s, &log_probs, &inputs.mask, 0.1)?;
    assert!(loss_av.to_scalar::<f32>()? > 0.0);

    let out = model.sample(&inputs, &randn, &SampleOptions::default())?;
    let designed = thermompnn_core::decode_sequence(&out.s.i(0)?.to_vec1::<u32>()?);
    let native = thermompnn_core::decode_sequence(&inputs.s.i(0)?.to_vec1::<u32>()?);
    let chain_m = inputs.chain_m.i(0)?.to_vec1::<f32>()?;
    assert_eq!(designed.len(), 20);
    for ((d, n), m) in designed.chars().zip(native.chars()).zip(chain_m) {
        if m == 0.0 {
            assert_eq!(d, n);
        }
    }

    // 20 residues: at most 19 neighbours, so nothing reaches the core threshold
    let counts = burial_counts(&inputs.x, &inputs.mask)?;
    let classes = burial_classes(&counts, &inputs.mask)?;
    assert_eq!(classes.core.sum_all()?.to_scalar::<f32>()?, 0.0);
    let counts = counts.i(0)?.to_vec1::<f32>()?;
    assert!(counts.iter().all(|&c| (0.0..=19.0).contains(&c)));
    Ok(())
}
