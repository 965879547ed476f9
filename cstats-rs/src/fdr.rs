//! FDR (Benjamini-Hochberg) thresholding of voxel-wise p-value maps and
//! extraction of the surviving clusters.

use clap::Args;
use ndarray::Array3;
use serde::Serialize;
use std::path::PathBuf;

use crate::error::{self, check_shape, Error};
use crate::index;
use crate::label::{self, Connectivity};
use crate::report;
use crate::volume::{self, VolumeRef};

fn dependence_factor(n: usize, dependence: bool) -> f64 {
    if dependence {
        (1..=n).map(|k| 1.0 / k as f64).sum()
    } else {
        1.0
    }
}

fn check_p_values(p_values: &[f64]) -> error::Result<()> {
    if let Some(bad) = p_values.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(Error::InvalidInput(format!("p-value {} outside [0, 1]", bad)));
    }
    Ok(())
}

/// Largest p-value that survives BH step-up at level `q`, or `None` when
/// nothing survives. `dependence` applies the arbitrary-dependence correction
/// `c(N) = sum 1/k`.
pub fn fdr_threshold(p_values: &[f64], q: f64, dependence: bool) -> error::Result<Option<f64>> {
    if !(q > 0.0 && q <= 1.0) {
        return Err(Error::InvalidInput(format!("q must be in (0, 1], got {}", q)));
    }
    check_p_values(p_values)?;
    let n = p_values.len();
    if n == 0 {
        return Ok(None);
    }
    let mut sorted = p_values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let scale = q / (n as f64 * dependence_factor(n, dependence));
    let threshold = sorted
        .iter()
        .enumerate()
        .rev()
        .find(|(i, &p)| p <= (*i as f64 + 1.0) * scale)
        .map(|(_, &p)| p);
    Ok(threshold)
}

/// BH-adjusted p-values in input order, clipped at 1.
pub fn adjusted_p_values(p_values: &[f64], dependence: bool) -> error::Result<Vec<f64>> {
    check_p_values(p_values)?;
    let n = p_values.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    let c = dependence_factor(n, dependence);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));
    let mut adjusted = vec![0.0; n];
    let mut running = 1.0f64;
    for (rank, &i) in order.iter().enumerate().rev() {
        let value = p_values[i] * n as f64 * c / (rank as f64 + 1.0);
        running = running.min(value);
        adjusted[i] = running.min(1.0);
    }
    Ok(adjusted)
}

/// Convert a map to p-values, optionally from `1 - p`, and collect the values
/// inside `mask` (all voxels when no mask is given).
pub fn masked_p_values(
    map: &Array3<f32>,
    mask: Option<&Array3<bool>>,
    one_minus_p: bool,
) -> error::Result<(Array3<f64>, Vec<f64>)> {
    if let Some(m) = mask {
        check_shape(map.shape(), m.shape())?;
    }
    let p = map.mapv(|v| {
        let v = v as f64;
        if one_minus_p {
            (1.0 - v).clamp(0.0, 1.0)
        } else {
            v
        }
    });
    let values: Vec<f64> = match mask {
        Some(m) => p
            .iter()
            .zip(m.iter())
            .filter(|(_, &inside)| inside)
            .map(|(&v, _)| v)
            .collect(),
        None => p.iter().copied().collect(),
    };
    Ok((p, values))
}

/// Suprathreshold voxels: inside the mask and `p <= threshold`.
pub fn suprathreshold(p: &Array3<f64>, mask: Option<&Array3<bool>>, threshold: f64) -> Array3<bool> {
    match mask {
        Some(m) => ndarray::Zip::from(p).and(m).map_collect(|&v, &inside| inside && v <= threshold),
        None => p.mapv(|v| v <= threshold),
    }
}

/// Cluster index for a suprathreshold mask: components below `min_size` are
/// dropped and IDs ascend with size (largest cluster has the max ID).
pub fn cluster_index(mask: &Array3<bool>, connectivity: Connectivity, min_size: u64) -> (Array3<u32>, u32) {
    let (labels, _) = label::connected_components(&mask.view(), connectivity);
    let (kept, n) = label::remove_small(&labels, min_size);
    (label::order_by_size(&kept, true), n)
}

// ---------------------------------------------------------------------------
// `fdr` subcommand
// ---------------------------------------------------------------------------

#[derive(Args, Clone, Serialize)]
pub struct FdrArgs {
    /// Voxel-wise p-value map, STORE[::ARRAY] or .tif
    #[arg(long)]
    pub input: VolumeRef,
    /// Brain mask; only voxels inside count towards the FDR
    #[arg(long)]
    pub mask: Option<VolumeRef>,
    /// Input stores 1-p (e.g. randomise corrp maps)
    #[arg(long)]
    pub one_minus_p: bool,
    /// FDR q values
    #[arg(long, num_args = 1.., default_values_t = vec![0.05])]
    pub q: Vec<f64>,
    /// Minimum cluster size in voxels
    #[arg(long, default_value_t = 100)]
    pub min_size: u64,
    #[arg(long, value_enum, default_value = "26")]
    pub connectivity: Connectivity,
    /// Correct for arbitrary dependence between tests
    #[arg(long)]
    pub dependence: bool,
    /// Also write the BH-adjusted p-value map
    #[arg(long)]
    pub adjusted: bool,
    /// Output directory (clusters.zarr, fdr_summary.csv, params.json)
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Debug, Serialize)]
struct FdrSummaryRow {
    q: f64,
    p_threshold: Option<f64>,
    voxels_tested: usize,
    suprathreshold_voxels: usize,
    clusters: u32,
    largest_cluster_voxels: u64,
}

pub fn run(args: FdrArgs, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    let map = volume::load_f32(&args.input)?;
    let voxel = volume::read_voxel_size(&args.input);
    let mask = match &args.mask {
        Some(m) => Some(volume::load_binary(m)?),
        None => None,
    };
    let (p, values) = masked_p_values(&map, mask.as_ref(), args.one_minus_p)?;
    progress(0.1, &format!("Loaded {} ({} voxels tested)", args.input, values.len()));

    let store = args.output.join("clusters.zarr");
    if args.adjusted {
        let adjusted = adjusted_p_values(&values, args.dependence)?;
        let mut adjusted_map = Array3::<f32>::ones(p.dim());
        let in_mask: Vec<bool> = match &mask {
            Some(m) => m.iter().copied().collect(),
            None => vec![true; p.len()],
        };
        let mut it = adjusted.into_iter();
        for (out, inside) in adjusted_map.iter_mut().zip(in_mask) {
            if inside {
                *out = it.next().unwrap_or(1.0) as f32;
            }
        }
        volume::save_f32(&VolumeRef::new(&store, "/fdr_adjusted_p"), &adjusted_map, voxel, None)?;
    }

    let mut qs = args.q.clone();
    qs.sort_by(|a, b| a.total_cmp(b));
    qs.dedup();

    let mut rows = Vec::new();
    for (i, &q) in qs.iter().enumerate() {
        let threshold = fdr_threshold(&values, q, args.dependence)?;
        let (supra, clusters, largest) = match threshold {
            Some(t) => {
                let supra = suprathreshold(&p, mask.as_ref(), t);
                let n_supra = supra.iter().filter(|&&v| v).count();
                let (idx, n) = cluster_index(&supra, args.connectivity, args.min_size);
                let largest = label::label_sizes(&idx.view()).iter().skip(1).copied().max().unwrap_or(0);
                let attrs = serde_json::json!({"q": q, "p_threshold": t, "min_size": args.min_size});
                let group = format!("/q{}", q);
                volume::save_labels(
                    &VolumeRef::new(&store, &format!("{}/cluster_index", group)),
                    &idx,
                    voxel,
                    Some(attrs.clone()),
                )?;
                volume::save_labels(
                    &VolumeRef::new(&store, &format!("{}/rev_cluster_index", group)),
                    &index::reverse_ids(&idx),
                    voxel,
                    Some(attrs),
                )?;
                (n_supra, n, largest)
            }
            None => {
                log::warn!("q={}: no voxel survives FDR correction", q);
                (0, 0, 0)
            }
        };
        log::info!("q={} threshold={:?} clusters={}", q, threshold, clusters);
        rows.push(FdrSummaryRow {
            q,
            p_threshold: threshold,
            voxels_tested: values.len(),
            suprathreshold_voxels: supra,
            clusters,
            largest_cluster_voxels: largest,
        });
        progress(
            0.1 + 0.9 * (i + 1) as f64 / qs.len() as f64,
            &format!("FDR q={} ({}/{})", q, i + 1, qs.len()),
        );
    }

    report::write_csv(&args.output.join("fdr_summary.csv"), &rows, None)?;
    report::write_params(&args.output, &args)?;
    progress(1.0, &format!("Wrote {}", args.output.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const P: [f64; 10] = [0.001, 0.008, 0.039, 0.041, 0.042, 0.06, 0.074, 0.205, 0.212, 0.216];

    #[test]
    fn threshold_matches_hand_computation() {
        // 0.008 <= 2/10 * 0.05 but 0.039 > 3/10 * 0.05
        assert_eq!(fdr_threshold(&P, 0.05, false).unwrap(), Some(0.008));
        assert_eq!(fdr_threshold(&P, 0.25, false).unwrap(), Some(0.216));
        assert_eq!(fdr_threshold(&P, 0.0001, false).unwrap(), None);
        assert_eq!(fdr_threshold(&[], 0.05, false).unwrap(), None);
    }

    #[test]
    fn threshold_is_monotone_in_q() {
        let p: Vec<f64> = (0..200).map(|i| ((i * 37) % 200) as f64 / 1000.0 + 1e-4).collect();
        let mut last = 0.0;
        for step in 1..=100 {
            let q = step as f64 / 100.0;
            let t = fdr_threshold(&p, q, false).unwrap().unwrap_or(0.0);
            assert!(t >= last, "threshold decreased at q={}", q);
            last = t;
        }
    }

    #[test]
    fn dependence_correction_is_stricter() {
        let plain = fdr_threshold(&P, 0.25, false).unwrap().unwrap();
        let dep = fdr_threshold(&P, 0.25, true).unwrap().unwrap();
        assert!(dep <= plain);
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert!(fdr_threshold(&P, 0.0, false).is_err());
        assert!(fdr_threshold(&P, 1.5, false).is_err());
        assert!(fdr_threshold(&[0.5, 1.2], 0.05, false).is_err());
    }

    #[test]
    fn adjusted_values_agree_with_threshold() {
        let adj = adjusted_p_values(&P, false).unwrap();
        assert_relative_eq!(adj[0], 0.01, epsilon = 1e-12);
        assert_relative_eq!(adj[1], 0.04, epsilon = 1e-12);
        for (&p, &a) in P.iter().zip(adj.iter()) {
            assert!(a >= p && a <= 1.0);
            // a voxel survives at q exactly when its adjusted p is <= q
            let t = fdr_threshold(&P, 0.05, false).unwrap().unwrap();
            assert_eq!(p <= t, a <= 0.05);
        }
    }

    #[test]
    fn one_minus_p_and_mask() {
        let map = Array3::from_shape_vec((1, 1, 4), vec![0.999f32, 0.5, 0.9999, 0.0]).unwrap();
        let mask = Array3::from_shape_vec((1, 1, 4), vec![true, true, true, false]).unwrap();
        let (p, values) = masked_p_values(&map, Some(&mask), true).unwrap();
        assert_eq!(values.len(), 3);
        assert_relative_eq!(p[[0, 0, 0]], 0.001, epsilon = 1e-6);
        let supra = suprathreshold(&p, Some(&mask), 0.01);
        assert_eq!(supra.iter().filter(|&&v| v).count(), 2);
        assert!(!supra[[0, 0, 3]]);
    }

    #[test]
    fn clusters_ascend_with_size() {
        let mut m = Array3::from_elem((1, 1, 12), false);
        for x in [0, 1, 2, 3, 5, 6, 8, 10, 11] {
            m[[0, 0, x]] = true;
        }
        let (idx, n) = cluster_index(&m, Connectivity::TwentySix, 2);
        assert_eq!(n, 3);
        assert_eq!(idx[[0, 0, 0]], 3);
        assert_eq!(idx[[0, 0, 8]], 0);
        assert_eq!(idx[[0, 0, 5]], 1);
        assert_eq!(idx[[0, 0, 10]], 2);
    }

    #[test]
    fn run_writes_index_pairs_per_q() {
        let dir = tempfile::tempdir().unwrap();
        let map = Array3::from_shape_fn((1, 1, 12), |(_, _, x)| match x {
            4 | 7 | 8 | 9 => 0.9f32,
            _ => 0.001,
        });
        let input = VolumeRef::new(dir.path().join("p.zarr"), "/p");
        let voxel = Some(volume::VoxelSize::isotropic(10.0));
        volume::save_f32(&input, &map, voxel, None).unwrap();

        let out = dir.path().join("fdr");
        let args = FdrArgs {
            input,
            mask: None,
            one_minus_p: false,
            q: vec![0.05, 0.001],
            min_size: 2,
            connectivity: Connectivity::TwentySix,
            dependence: false,
            adjusted: true,
            output: out.clone(),
        };
        run(args, |_, _| {}).unwrap();

        let store = out.join("clusters.zarr");
        let idx_ref = VolumeRef::new(&store, "/q0.05/cluster_index");
        let idx = volume::load_labels(&idx_ref).unwrap();
        let rev = volume::load_labels(&VolumeRef::new(&store, "/q0.05/rev_cluster_index")).unwrap();
        assert_eq!(idx[[0, 0, 0]], 3);
        assert_eq!(idx[[0, 0, 5]], 1);
        assert_eq!(idx[[0, 0, 10]], 2);
        assert_eq!(rev[[0, 0, 0]], 1);
        assert_eq!(rev[[0, 0, 5]], 3);
        assert_eq!(index::reverse_ids(&rev), idx);
        assert_eq!(volume::read_voxel_size(&idx_ref), voxel);
        assert!(volume::load_labels(&VolumeRef::new(&store, "/q0.001/cluster_index")).is_err());

        let adjusted = volume::load_f32(&VolumeRef::new(&store, "/fdr_adjusted_p")).unwrap();
        assert_relative_eq!(adjusted[[0, 0, 0]] as f64, 0.0015, epsilon = 1e-6);
        assert_relative_eq!(adjusted[[0, 0, 4]] as f64, 0.9, epsilon = 1e-6);

        let summary = std::fs::read_to_string(out.join("fdr_summary.csv")).unwrap();
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "q,p_threshold,voxels_tested,suprathreshold_voxels,clusters,largest_cluster_voxels"
        );
        assert_eq!(lines[1], "0.001,,12,0,0,0");
        assert!(lines[2].starts_with("0.05,0.00100"));
        assert!(lines[2].ends_with(",12,8,3,4"));
        assert!(out.join("params.json").exists());
    }
}
