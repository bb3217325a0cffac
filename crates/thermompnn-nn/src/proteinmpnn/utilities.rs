use candle_core::{bail, DType, Device, Result, Tensor, D};

/// Gather_edges
/// Features [B,N,N,C] at Neighbor indices [B,N,K] => Neighbor features [B,N,K,C]
pub fn gather_edges(edges: &Tensor, neighbor_idx: &Tensor) -> Result<Tensor> {
    let (b, n, k) = neighbor_idx.dims3()?;
    let c = edges.dim(D::Minus1)?;
    let neighbors = neighbor_idx
        .unsqueeze(D::Minus1)?
        .expand((b, n, k, c))?
        .contiguous()?;
    edges.contiguous()?.gather(&neighbors, 2)
}

/// Gather Nodes
///
/// Features [B,N,C] at Neighbor indices [B,M,K] => [B,M,K,C]
/// Flatten and expand indices per batch [B,M,K] => [B,MK] => [B,MK,C]
pub fn gather_nodes(nodes: &Tensor, neighbor_idx: &Tensor) -> Result<Tensor> {
    let (b, _, c) = nodes.dims3()?;
    let (_, m, k) = neighbor_idx.dims3()?;
    let neighbors_flat = neighbor_idx
        .reshape((b, m * k))?
        .unsqueeze(2)?
        .expand((b, m * k, c))?
        .contiguous()?;
    nodes
        .contiguous()?
        .gather(&neighbors_flat, 1)?
        .reshape((b, m, k, c))
}

/// Features [B,N,C] at Neighbor index [B,K] => Neighbor features[B,K,C]
pub fn gather_nodes_t(nodes: &Tensor, neighbor_idx: &Tensor) -> Result<Tensor> {
    let (b, _, c) = nodes.dims3()?;
    let k = neighbor_idx.dim(1)?;
    let idx = neighbor_idx
        .unsqueeze(D::Minus1)?
        .expand((b, k, c))?
        .contiguous()?;
    nodes.contiguous()?.gather(&idx, 1)
}

/// `[h_neighbors, h_nodes[j]]` along the feature axis.
pub fn cat_neighbors_nodes(
    h_nodes: &Tensor,
    h_neighbors: &Tensor,
    e_idx: &Tensor,
) -> Result<Tensor> {
    let h_nodes = gather_nodes(h_nodes, e_idx)?;
    Tensor::cat(&[h_neighbors, &h_nodes], D::Minus1)
}

/// Coordinates [B,L,A,3] at neighbor indices [B,L,K] => [B,L,K,A,3]
pub fn gather_coords(x: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
    let (b, l, a, three) = x.dims4()?;
    let (_, m, k) = e_idx.dims3()?;
    let flat = x.reshape((b, l, a * three))?;
    gather_nodes(&flat, e_idx)?.reshape((b, m, k, a, three))
}

/// Row `rows[b]` of `xs` for every batch entry, `xs` being `[B,L,...]` and `rows` `[B,1]`.
pub fn gather_rows(xs: &Tensor, rows: &Tensor) -> Result<Tensor> {
    let dims = xs.dims();
    if dims.len() < 2 {
        bail!("gather_rows needs at least [B, L], got {:?}", dims)
    }
    let mut target = dims.to_vec();
    target[1] = 1;
    let mut idx = rows.clone();
    for _ in 2..dims.len() {
        idx = idx.unsqueeze(D::Minus1)?;
    }
    let idx = idx.broadcast_as(target)?.contiguous()?;
    xs.contiguous()?.gather(&idx, 1)
}

/// Custom Cross-Product Fn.
pub fn cross_product(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let last_dim = a.rank() - 1;

    let a0 = a.narrow(last_dim, 0, 1)?;
    let a1 = a.narrow(last_dim, 1, 1)?;
    let a2 = a.narrow(last_dim, 2, 1)?;

    let b0 = b.narrow(last_dim, 0, 1)?;
    let b1 = b.narrow(last_dim, 1, 1)?;
    let b2 = b.narrow(last_dim, 2, 1)?;

    let c0 = ((&a1 * &b2)? - (&a2 * &b1)?)?;
    let c1 = ((&a2 * &b0)? - (&a0 * &b2)?)?;
    let c2 = ((&a0 * &b1)? - (&a1 * &b0)?)?;

    Tensor::cat(&[&c0, &c1, &c2], last_dim)
}

/// Atom slot `slot` of a `[..., A, 3]` coordinate tensor.
pub fn atom(x: &Tensor, slot: usize) -> Result<Tensor> {
    x.narrow(D::Minus2, slot, 1)?.squeeze(D::Minus2)?.contiguous()
}

/// Ideal-geometry C-beta from the N, CA and C slots of `[..., A, 3]` coordinates.
pub fn virtual_cb(x: &Tensor) -> Result<Tensor> {
    let n = atom(x, 0)?;
    let ca = atom(x, 1)?;
    let c = atom(x, 2)?;
    let b = (&ca - &n)?;
    let c = (&c - &ca)?;
    let a = cross_product(&b, &c)?;
    ((a * -0.58273431)? + (b * 0.56802827)? + (c * -0.54067466)? + ca)
}

/// Replace NaN entries with 0.
pub fn nan_to_zero(x: &Tensor) -> Result<Tensor> {
    let not_nan = x.eq(x)?;
    not_nan.where_cond(x, &x.zeros_like()?)
}

/// Per-atom validity `[..., A]` of `[..., A, 3]` coordinates: 1 when no component is NaN.
pub fn finite_mask(x: &Tensor) -> Result<Tensor> {
    x.eq(x)?.to_dtype(DType::F32)?.min(D::Minus1)
}

pub fn linspace(start: f64, stop: f64, steps: usize, device: &Device) -> Result<Tensor> {
    let vs = match steps {
        0 => vec![],
        1 => vec![start as f32],
        _ => {
            let delta = (stop - start) / (steps - 1) as f64;
            (0..steps)
                .map(|step| (start + step as f64 * delta) as f32)
                .collect::<Vec<_>>()
        }
    };
    Tensor::from_vec(vs, steps, device)
}

/// The `k` smallest entries along the last dim in ascending order, with their u32 indices.
/// Equal values keep their index order.
pub fn topk_smallest(xs: &Tensor, k: usize) -> Result<(Tensor, Tensor)> {
    let sorted = xs.contiguous()?.arg_sort_last_dim(true)?;
    let idx = sorted.narrow(D::Minus1, 0, k)?.contiguous()?;
    let values = xs.contiguous()?.gather(&idx, D::Minus1)?;
    Ok((values, idx))
}
