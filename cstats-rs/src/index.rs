//! Cluster index operations: ID reversal, directional split, mirroring,
//! filtering, bounding boxes and volumes.

use clap::Args;
use ndarray::{s, Array3, ArrayView3, Axis};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::{self, check_shape};
use crate::ids;
use crate::volume::{self, VolumeRef, VoxelSize};

/// Volume axis in (z, y, x) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
pub enum Axis3 {
    Z,
    Y,
    X,
}

impl Axis3 {
    pub fn index(self) -> usize {
        match self {
            Axis3::Z => 0,
            Axis3::Y => 1,
            Axis3::X => 2,
        }
    }
}

/// Reverse cluster ranks: `id -> min + max - id` over the non-zero IDs. For a
/// contiguous `1..=max` index this is `max + 1 - id`. Both extremes are kept, so
/// applying this twice restores the input.
pub fn reverse_ids(index: &Array3<u32>) -> Array3<u32> {
    let (min, max) = index
        .iter()
        .filter(|&&id| id != 0)
        .fold((u32::MAX, 0), |(lo, hi), &id| (lo.min(id), hi.max(id)));
    index.mapv(|id| if id == 0 { 0 } else { max - id + min })
}

/// Split by anatomical side: voxels with coordinate `< plane` along `axis` go to
/// the first image, the rest to the second.
pub fn split_by_axis(index: &Array3<u32>, axis: Axis3, plane: usize) -> (Array3<u32>, Array3<u32>) {
    let mut first = Array3::<u32>::zeros(index.dim());
    let mut second = Array3::<u32>::zeros(index.dim());
    let a = axis.index();
    for ((z, y, x), &id) in index.indexed_iter() {
        if id == 0 {
            continue;
        }
        let coord = [z, y, x][a];
        if coord < plane {
            first[[z, y, x]] = id;
        } else {
            second[[z, y, x]] = id;
        }
    }
    (first, second)
}

/// Split by effect direction: voxels where `direction > 0` go to the first
/// image, the rest (including zero and NaN) to the second.
pub fn split_by_sign(index: &Array3<u32>, direction: &Array3<f32>) -> error::Result<(Array3<u32>, Array3<u32>)> {
    check_shape(index.shape(), direction.shape())?;
    let mut first = Array3::<u32>::zeros(index.dim());
    let mut second = Array3::<u32>::zeros(index.dim());
    ndarray::Zip::from(&mut first)
        .and(&mut second)
        .and(index)
        .and(direction)
        .for_each(|f, s, &id, &d| {
            if id == 0 {
                return;
            }
            if d > 0.0 {
                *f = id;
            } else {
                *s = id;
            }
        });
    Ok((first, second))
}

/// Flip along `axis` and translate by `shift` voxels; voxels pushed outside the
/// volume are dropped.
pub fn mirror(index: &Array3<u32>, axis: Axis3, shift: isize) -> Array3<u32> {
    let a = axis.index();
    let n = index.shape()[a] as isize;
    let mut out = Array3::<u32>::zeros(index.dim());
    for ((z, y, x), &id) in index.indexed_iter() {
        if id == 0 {
            continue;
        }
        let mut p = [z, y, x];
        let target = n - 1 - p[a] as isize + shift;
        if target < 0 || target >= n {
            continue;
        }
        p[a] = target as usize;
        out[p] = id;
    }
    out
}

/// Overlay `mirrored` onto `index` where the original is background.
pub fn combine(index: &Array3<u32>, mirrored: &Array3<u32>) -> error::Result<Array3<u32>> {
    check_shape(index.shape(), mirrored.shape())?;
    let mut out = index.clone();
    ndarray::Zip::from(&mut out).and(mirrored).for_each(|o, &m| {
        if *o == 0 {
            *o = m;
        }
    });
    Ok(out)
}

/// Zero every cluster not listed in `keep`.
pub fn keep_ids(index: &Array3<u32>, keep: &BTreeSet<u32>) -> Array3<u32> {
    index.mapv(|id| if keep.contains(&id) { id } else { 0 })
}

/// Half-open voxel bounding box, `min` inclusive and `max` exclusive per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub min: [usize; 3],
    pub max: [usize; 3],
}

impl BoundingBox {
    fn at(p: [usize; 3]) -> Self {
        BoundingBox {
            min: p,
            max: [p[0] + 1, p[1] + 1, p[2] + 1],
        }
    }

    fn include(&mut self, p: [usize; 3]) {
        for a in 0..3 {
            self.min[a] = self.min[a].min(p[a]);
            self.max[a] = self.max[a].max(p[a] + 1);
        }
    }

    pub fn view<'a, T>(&self, volume: &ArrayView3<'a, T>) -> ArrayView3<'a, T> {
        volume.clone().slice_move(s![
            self.min[0]..self.max[0],
            self.min[1]..self.max[1],
            self.min[2]..self.max[2]
        ])
    }
}

/// Bounding box of every non-zero ID.
pub fn bounding_boxes(index: &ArrayView3<u32>) -> BTreeMap<u32, BoundingBox> {
    let mut boxes: BTreeMap<u32, BoundingBox> = BTreeMap::new();
    for ((z, y, x), &id) in index.indexed_iter() {
        if id == 0 {
            continue;
        }
        boxes
            .entry(id)
            .and_modify(|b| b.include([z, y, x]))
            .or_insert_with(|| BoundingBox::at([z, y, x]));
    }
    boxes
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClusterVolume {
    pub voxels: u64,
    pub volume_mm3: f64,
}

pub fn cluster_volumes(index: &ArrayView3<u32>, voxel: VoxelSize) -> BTreeMap<u32, ClusterVolume> {
    let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
    for &id in index.iter().filter(|&&id| id != 0) {
        *counts.entry(id).or_insert(0) += 1;
    }
    let vv = voxel.voxel_volume_mm3();
    counts
        .into_iter()
        .map(|(id, voxels)| {
            (
                id,
                ClusterVolume {
                    voxels,
                    volume_mm3: voxels as f64 * vv,
                },
            )
        })
        .collect()
}

/// One row of the cluster table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterInfo {
    #[serde(rename = "cluster_ID")]
    pub cluster_id: u32,
    pub voxels: u64,
    pub volume_mm3: f64,
    pub centroid_z: f64,
    pub centroid_y: f64,
    pub centroid_x: f64,
    pub bbox_z: String,
    pub bbox_y: String,
    pub bbox_x: String,
    pub peak_value: Option<f32>,
    pub mean_value: Option<f64>,
}

pub fn cluster_info(
    index: &Array3<u32>,
    voxel: VoxelSize,
    values: Option<&Array3<f32>>,
) -> error::Result<Vec<ClusterInfo>> {
    if let Some(v) = values {
        check_shape(index.shape(), v.shape())?;
    }
    #[derive(Default)]
    struct Acc {
        n: u64,
        sum: [f64; 3],
        peak: Option<f32>,
        total: f64,
    }
    let mut acc: BTreeMap<u32, Acc> = BTreeMap::new();
    for ((z, y, x), &id) in index.indexed_iter() {
        if id == 0 {
            continue;
        }
        let a = acc.entry(id).or_default();
        a.n += 1;
        a.sum[0] += z as f64;
        a.sum[1] += y as f64;
        a.sum[2] += x as f64;
        if let Some(v) = values {
            let val = v[[z, y, x]];
            a.total += val as f64;
            a.peak = Some(a.peak.map_or(val, |p| p.max(val)));
        }
    }
    let boxes = bounding_boxes(&index.view());
    let vv = voxel.voxel_volume_mm3();
    Ok(acc
        .into_iter()
        .map(|(id, a)| {
            let b = boxes[&id];
            let n = a.n as f64;
            ClusterInfo {
                cluster_id: id,
                voxels: a.n,
                volume_mm3: n * vv,
                centroid_z: a.sum[0] / n,
                centroid_y: a.sum[1] / n,
                centroid_x: a.sum[2] / n,
                bbox_z: format!("{}:{}", b.min[0], b.max[0]),
                bbox_y: format!("{}:{}", b.min[1], b.max[1]),
                bbox_x: format!("{}:{}", b.min[2], b.max[2]),
                peak_value: a.peak,
                mean_value: values.map(|_| a.total / n),
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// `index` subcommand
// ---------------------------------------------------------------------------

#[derive(Args, Clone)]
pub struct IndexArgs {
    /// Cluster index, STORE[::ARRAY]
    #[arg(long)]
    pub input: VolumeRef,
    /// Output index, STORE[::ARRAY]
    #[arg(long)]
    pub output: VolumeRef,
    /// Keep only these IDs: "all" or e.g. "1,3,5:9"
    #[arg(long)]
    pub keep: Option<String>,
    /// Keep only IDs listed (space separated) in a file, e.g. valid_cluster_ids.txt
    #[arg(long)]
    pub keep_file: Option<PathBuf>,
    /// Mirror clusters across this axis
    #[arg(long, value_enum)]
    pub mirror_axis: Option<Axis3>,
    /// Translation after mirroring, in voxels
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub mirror_shift: isize,
    /// Keep the original clusters and add the mirrored copy where background
    #[arg(long)]
    pub combine: bool,
    /// Reverse cluster IDs (largest <-> smallest rank)
    #[arg(long)]
    pub reverse: bool,
}

pub fn run(args: IndexArgs, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    let mut index = volume::load_labels(&args.input)?;
    let voxel = volume::read_voxel_size(&args.input);
    progress(0.3, &format!("Loaded {}", args.input));

    let max_id = index.iter().copied().max().unwrap_or(0);
    let mut keep: Option<BTreeSet<u32>> = None;
    if let Some(sel) = &args.keep {
        keep = Some(ids::parse_id_selection(sel, max_id)?.into_iter().collect());
    }
    if let Some(path) = &args.keep_file {
        let from_file: BTreeSet<u32> = ids::read_id_file(path)?.into_iter().collect();
        keep = Some(match keep {
            Some(k) => k.intersection(&from_file).copied().collect(),
            None => from_file,
        });
    }
    if let Some(k) = &keep {
        index = keep_ids(&index, k);
        log::info!("kept {} cluster id(s)", k.len());
    }

    if let Some(axis) = args.mirror_axis {
        let mirrored = mirror(&index, axis, args.mirror_shift);
        index = if args.combine {
            combine(&index, &mirrored)?
        } else {
            mirrored
        };
    }

    if args.reverse {
        index = reverse_ids(&index);
    }

    progress(0.7, "Writing index");
    volume::save_labels(&args.output, &index, voxel, None)?;
    progress(1.0, &format!("Wrote {}", args.output));
    Ok(())
}

/// Number of voxels along `axis`; used for defaulting a midline plane.
pub fn axis_len(index: &Array3<u32>, axis: Axis3) -> usize {
    index.len_of(Axis(axis.index()))
}
