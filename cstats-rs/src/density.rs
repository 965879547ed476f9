use clap::{Args, ValueEnum};
use ndarray::{Array3, ArrayView3, Zip};
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;

use crate::error::{self, check_shape};
use crate::ids;
use crate::index;
use crate::label::{self, Connectivity};
use crate::report;
use crate::volume::{self, VolumeRef, VoxelSize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DensityMode {
    /// Cells per mm³ of cluster
    Cells,
    /// Segmented volume as a percentage of the cluster volume
    Label,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDensity {
    pub cluster_id: u32,
    pub cluster_volume_mm3: f64,
    /// Cells inside the cluster (cells mode only).
    pub cell_count: u64,
    /// Segmented volume inside the cluster (label mode only).
    pub label_volume_mm3: f64,
    pub density: f64,
}

/// Count cells inside cluster `id`: the segmentation is masked by the cluster
/// before labelling, so pieces joined only outside the cluster count apart.
fn count_cells(index_crop: &ArrayView3<u32>, seg_crop: &ArrayView3<bool>, id: u32, conn: Connectivity) -> u64 {
    let masked: Array3<bool> = Zip::from(index_crop)
        .and(seg_crop)
        .map_collect(|&c, &s| c == id && s);
    let (_, n) = label::connected_components(&masked.view(), conn);
    n as u64
}

fn label_voxels(index_crop: &ArrayView3<u32>, seg_crop: &ArrayView3<bool>, id: u32) -> u64 {
    let mut n = 0u64;
    Zip::from(index_crop).and(seg_crop).for_each(|&c, &s| {
        if c == id && s {
            n += 1;
        }
    });
    n
}

/// Measure every cluster in `selected` against one sample's segmentation.
/// IDs missing from the index are skipped.
pub fn measure(
    index: &Array3<u32>,
    seg: &Array3<bool>,
    selected: &[u32],
    mode: DensityMode,
    connectivity: Connectivity,
    voxel: VoxelSize,
) -> error::Result<Vec<ClusterDensity>> {
    check_shape(index.shape(), seg.shape())?;
    let index_view = index.view();
    let seg_view = seg.view();
    let boxes = index::bounding_boxes(&index_view);
    let volumes = index::cluster_volumes(&index_view, voxel);
    let vv = voxel.voxel_volume_mm3();

    let present: Vec<u32> = selected
        .iter()
        .copied()
        .filter(|id| {
            let found = boxes.contains_key(id);
            if !found {
                log::warn!("cluster {} not present in index, skipped", id);
            }
            found
        })
        .collect();

    Ok(present
        .par_iter()
        .map(|&id| {
            let bbox = &boxes[&id];
            let idx_crop = bbox.view(&index_view);
            let seg_crop = bbox.view(&seg_view);
            let cluster_volume_mm3 = volumes[&id].volume_mm3;
            match mode {
                DensityMode::Cells => {
                    let cell_count = count_cells(&idx_crop, &seg_crop, id, connectivity);
                    ClusterDensity {
                        cluster_id: id,
                        cluster_volume_mm3,
                        cell_count,
                        label_volume_mm3: 0.0,
                        density: cell_count as f64 / cluster_volume_mm3,
                    }
                }
                DensityMode::Label => {
                    let label_volume_mm3 = label_voxels(&idx_crop, &seg_crop, id) as f64 * vv;
                    ClusterDensity {
                        cluster_id: id,
                        cluster_volume_mm3,
                        cell_count: 0,
                        label_volume_mm3,
                        density: label_volume_mm3 / cluster_volume_mm3 * 100.0,
                    }
                }
            }
        })
        .collect())
}

#[derive(Serialize)]
struct CellDensityRow<'a> {
    sample: &'a str,
    #[serde(rename = "cluster_ID")]
    cluster_id: u32,
    cluster_volume_mm3: f64,
    cell_count: u64,
    cell_density: f64,
}

#[derive(Serialize)]
struct LabelDensityRow<'a> {
    sample: &'a str,
    #[serde(rename = "cluster_ID")]
    cluster_id: u32,
    cluster_volume_mm3: f64,
    label_volume_mm3: f64,
    label_density: f64,
}

#[derive(Args, Clone)]
pub struct DensityArgs {
    /// Cluster index, STORE[::ARRAY]
    #[arg(long)]
    pub index: VolumeRef,
    /// Binary segmentation of one sample in atlas space, STORE[::ARRAY] or TIFF
    #[arg(long)]
    pub seg: VolumeRef,
    /// Sample name, e.g. sample01
    #[arg(long)]
    pub sample: String,
    /// Condition (group) of the sample
    #[arg(long)]
    pub condition: String,
    /// Clusters to measure: "all" or e.g. "1,3,5:9"
    #[arg(long, default_value = "all")]
    pub clusters: String,
    #[arg(long, value_enum, default_value = "cells")]
    pub mode: DensityMode,
    #[arg(long, value_enum, default_value = "26")]
    pub connectivity: Connectivity,
    /// Isotropic voxel size in µm (default: from the index attributes)
    #[arg(long)]
    pub voxel_size: Option<f64>,
    /// Output directory; writes <condition>_<sample>.csv
    #[arg(long)]
    pub output: PathBuf,
}

pub fn run(args: DensityArgs, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    let index = volume::load_labels(&args.index)?;
    let voxel = volume::resolve_voxel_size(args.voxel_size, &args.index)?;
    progress(0.2, &format!("Loaded {}", args.index));
    let seg = volume::load_binary(&args.seg)?;
    progress(0.4, &format!("Loaded {}", args.seg));

    let max_id = index.iter().copied().max().unwrap_or(0);
    let selected = ids::parse_id_selection(&args.clusters, max_id)?;
    log::info!(
        "{}/{}: measuring {} cluster(s), {:?} mode",
        args.condition,
        args.sample,
        selected.len(),
        args.mode
    );
    let measured = measure(&index, &seg, &selected, args.mode, args.connectivity, voxel)?;
    progress(0.9, &format!("Measured {} cluster(s)", measured.len()));

    let path = args
        .output
        .join(format!("{}_{}.csv", args.condition, args.sample));
    match args.mode {
        DensityMode::Cells => {
            let rows: Vec<CellDensityRow> = measured
                .iter()
                .map(|m| CellDensityRow {
                    sample: &args.sample,
                    cluster_id: m.cluster_id,
                    cluster_volume_mm3: m.cluster_volume_mm3,
                    cell_count: m.cell_count,
                    cell_density: m.density,
                })
                .collect();
            report::write_csv(
                &path,
                &rows,
                Some(&["sample", "cluster_ID", "cluster_volume_mm3", "cell_count", "cell_density"]),
            )?;
        }
        DensityMode::Label => {
            let rows: Vec<LabelDensityRow> = measured
                .iter()
                .map(|m| LabelDensityRow {
                    sample: &args.sample,
                    cluster_id: m.cluster_id,
                    cluster_volume_mm3: m.cluster_volume_mm3,
                    label_volume_mm3: m.label_volume_mm3,
                    label_density: m.density,
                })
                .collect();
            report::write_csv(
                &path,
                &rows,
                Some(&["sample", "cluster_ID", "cluster_volume_mm3", "label_volume_mm3", "label_density"]),
            )?;
        }
    }
    progress(1.0, &format!("Wrote {}", path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Cluster 1 is a 2x4x4 block at the origin, cluster 2 a single voxel far away.
    fn fixture() -> (Array3<u32>, Array3<bool>) {
        let mut index = Array3::<u32>::zeros((4, 8, 8));
        for z in 0..2 {
            for y in 0..4 {
                for x in 0..4 {
                    index[[z, y, x]] = 1;
                }
            }
        }
        index[[3, 7, 7]] = 2;

        let mut seg = Array3::from_elem((4, 8, 8), false);
        // a U-shaped cell, 6-connected
        seg[[0, 0, 0]] = true;
        seg[[0, 0, 2]] = true;
        seg[[0, 1, 0]] = true;
        seg[[0, 1, 1]] = true;
        seg[[0, 1, 2]] = true;
        // a separate cell
        seg[[1, 3, 3]] = true;
        // outside every cluster
        seg[[3, 0, 7]] = true;
        (index, seg)
    }

    #[test]
    fn counts_each_cell_once() {
        let (index, seg) = fixture();
        let voxel = VoxelSize::isotropic(1000.0);
        let m = measure(&index, &seg, &[1, 2], DensityMode::Cells, Connectivity::Six, voxel).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].cluster_id, 1);
        assert_eq!(m[0].cell_count, 2);
        assert_relative_eq!(m[0].cluster_volume_mm3, 32.0);
        assert_relative_eq!(m[0].density, 2.0 / 32.0);
        assert_eq!(m[1].cell_count, 0);
    }

    #[test]
    fn cells_joined_outside_the_cluster_count_apart() {
        let mut index = Array3::<u32>::zeros((1, 2, 3));
        for p in [[0, 0, 0], [0, 0, 2], [0, 1, 0], [0, 1, 2]] {
            index[p] = 1;
        }
        let mut seg = Array3::from_elem((1, 2, 3), false);
        for x in 0..3 {
            seg[[0, 0, x]] = true;
        }
        let voxel = VoxelSize::isotropic(1000.0);
        let m = measure(&index, &seg, &[1], DensityMode::Cells, Connectivity::TwentySix, voxel).unwrap();
        assert_eq!(m[0].cell_count, 2);
        assert_relative_eq!(m[0].density, 0.5);
    }

    #[test]
    fn label_mode_reports_percent_volume() {
        let (index, seg) = fixture();
        let voxel = VoxelSize::isotropic(1000.0);
        let m = measure(&index, &seg, &[1], DensityMode::Label, Connectivity::TwentySix, voxel).unwrap();
        assert_relative_eq!(m[0].label_volume_mm3, 6.0);
        assert_relative_eq!(m[0].density, 6.0 / 32.0 * 100.0);
    }

    #[test]
    fn skips_missing_ids_and_checks_shape() {
        let (index, seg) = fixture();
        let voxel = VoxelSize::isotropic(10.0);
        let m = measure(&index, &seg, &[2, 5], DensityMode::Cells, Connectivity::Six, voxel).unwrap();
        assert_eq!(m.len(), 1);
        let small = Array3::from_elem((1, 1, 1), false);
        assert!(measure(&index, &small, &[1], DensityMode::Cells, Connectivity::Six, voxel).is_err());
    }

    #[test]
    fn run_writes_condition_sample_csv() {
        let dir = tempfile::tempdir().unwrap();
        let (index, seg) = fixture();
        let store = dir.path().join("in.zarr");
        let index_ref = VolumeRef::new(&store, "/index");
        let seg_ref = VolumeRef::new(&store, "/seg");
        volume::save_labels(&index_ref, &index, Some(VoxelSize::isotropic(1000.0)), None).unwrap();
        volume::save_labels(&seg_ref, &seg.mapv(|v| v as u32), None, None).unwrap();

        let out = dir.path().join("density");
        run(
            DensityArgs {
                index: index_ref,
                seg: seg_ref,
                sample: "s1".into(),
                condition: "drug".into(),
                clusters: "all".into(),
                mode: DensityMode::Cells,
                connectivity: Connectivity::Six,
                voxel_size: None,
                output: out.clone(),
            },
            |_, _| {},
        )
        .unwrap();
        let text = std::fs::read_to_string(out.join("drug_s1.csv")).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "sample,cluster_ID,cluster_volume_mm3,cell_count,cell_density"
        );
        assert_eq!(lines.next().unwrap(), "s1,1,32.0,2,0.0625");
    }
}
