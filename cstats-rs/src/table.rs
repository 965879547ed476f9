use clap::Args;
use std::path::PathBuf;

use crate::index;
use crate::report;
use crate::volume::{self, VolumeRef};

#[derive(Args, Clone)]
pub struct TableArgs {
    /// Cluster index, STORE[::ARRAY]
    #[arg(long)]
    pub index: VolumeRef,
    /// Value map (e.g. 1-p or t-stat) for per-cluster peak and mean
    #[arg(long)]
    pub values: Option<VolumeRef>,
    /// Isotropic voxel size in µm (default: from the index attributes)
    #[arg(long)]
    pub voxel_size: Option<f64>,
    /// Output CSV
    #[arg(long)]
    pub output: PathBuf,
}

pub fn run(args: TableArgs, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    let idx = volume::load_labels(&args.index)?;
    let voxel = volume::resolve_voxel_size(args.voxel_size, &args.index)?;
    let values = match &args.values {
        Some(v) => Some(volume::load_f32(v)?),
        None => None,
    };
    progress(0.4, &format!("Loaded {}", args.index));

    let rows = index::cluster_info(&idx, voxel, values.as_ref())?;
    log::info!("{} cluster(s) in {}", rows.len(), args.index);
    report::write_csv(
        &args.output,
        &rows,
        Some(&[
            "cluster_ID", "voxels", "volume_mm3", "centroid_z", "centroid_y", "centroid_x", "bbox_z", "bbox_y",
            "bbox_x", "peak_value", "mean_value",
        ]),
    )?;
    progress(1.0, &format!("Wrote {}", args.output.display()));
    Ok(())
}
