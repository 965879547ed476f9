use clap::Args;
use ndarray::Array3;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::atlas::{self, Hierarchy};
use crate::error::{self, check_shape};
use crate::label::{self, Connectivity};
use crate::report;
use crate::volume::{self, VolumeRef, VoxelSize};

/// Label cells in `seg` and assign each to the atlas region under its rounded
/// centroid. Returns cells per region and the number of cells that fell on
/// atlas background.
pub fn cells_per_region(
    atlas: &Array3<u32>,
    seg: &Array3<bool>,
    connectivity: Connectivity,
) -> error::Result<(BTreeMap<u32, u64>, u64)> {
    check_shape(atlas.shape(), seg.shape())?;
    let (cells, n) = label::connected_components(&seg.view(), connectivity);
    let mut sums = vec![[0.0f64; 3]; n as usize + 1];
    let mut counts = vec![0u64; n as usize + 1];
    for ((z, y, x), &c) in cells.indexed_iter() {
        if c == 0 {
            continue;
        }
        let s = &mut sums[c as usize];
        s[0] += z as f64;
        s[1] += y as f64;
        s[2] += x as f64;
        counts[c as usize] += 1;
    }

    let (nz, ny, nx) = atlas.dim();
    let mut per_region = BTreeMap::new();
    let mut outside = 0u64;
    for c in 1..=n as usize {
        let k = counts[c] as f64;
        let at = |sum: f64, len: usize| ((sum / k).round() as usize).min(len - 1);
        let region = atlas[[at(sums[c][0], nz), at(sums[c][1], ny), at(sums[c][2], nx)]];
        if region == 0 {
            outside += 1;
        } else {
            *per_region.entry(region).or_insert(0) += 1;
        }
    }
    Ok((per_region, outside))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionDensity {
    pub region_id: u32,
    pub abbreviation: String,
    pub name: String,
    pub cell_count: u64,
    pub region_volume_mm3: f64,
    pub cell_density: f64,
}

/// Cell density of every region present in the atlas, optionally collapsed to
/// a hierarchy depth.
pub fn regional_densities(
    atlas: &Array3<u32>,
    cells: &BTreeMap<u32, u64>,
    voxel: VoxelSize,
    hierarchy: Option<&Hierarchy>,
    depth: Option<usize>,
) -> error::Result<Vec<RegionDensity>> {
    let vv = voxel.voxel_volume_mm3();
    let mut volumes: BTreeMap<u32, f64> = atlas::label_counts(atlas)
        .into_iter()
        .map(|(r, n)| (r, n as f64 * vv))
        .collect();
    let mut counts: BTreeMap<u32, f64> = cells.iter().map(|(&r, &n)| (r, n as f64)).collect();
    if let (Some(h), Some(d)) = (hierarchy, depth) {
        // labels missing from the hierarchy stay as their own rows
        let (known, unknown): (BTreeMap<u32, f64>, BTreeMap<u32, f64>) =
            volumes.into_iter().partition(|(id, _)| h.get(*id).is_some());
        for id in unknown.keys() {
            log::warn!("atlas label {} not in hierarchy, left uncollapsed", id);
        }
        volumes = h.collapse_to_depth(&known, d)?;
        volumes.extend(unknown);
        let (known, unknown): (BTreeMap<u32, f64>, BTreeMap<u32, f64>) =
            counts.into_iter().partition(|(id, _)| h.get(*id).is_some());
        counts = h.collapse_to_depth(&known, d)?;
        counts.extend(unknown);
    }

    Ok(volumes
        .into_iter()
        .map(|(id, vol)| {
            let cell_count = counts.get(&id).copied().unwrap_or(0.0) as u64;
            let (abbreviation, name) = hierarchy
                .and_then(|h| h.get(id))
                .map(|r| (r.abbreviation.clone(), r.name.clone()))
                .unwrap_or_default();
            RegionDensity {
                region_id: id,
                abbreviation,
                name,
                cell_count,
                region_volume_mm3: vol,
                cell_density: cell_count as f64 / vol,
            }
        })
        .collect())
}

#[derive(Args, Clone, Serialize)]
pub struct RegionalArgs {
    /// Atlas label volume in the segmentation's space, STORE[::ARRAY]
    #[arg(long)]
    pub atlas: VolumeRef,
    /// Binary cell segmentation, STORE[::ARRAY] or TIFF
    #[arg(long)]
    pub seg: VolumeRef,
    /// Region hierarchy CSV (id,name,abbreviation,parent_id)
    #[arg(long)]
    pub hierarchy: Option<PathBuf>,
    /// Sum regions deeper than this into their ancestor
    #[arg(long, requires = "hierarchy")]
    pub depth: Option<usize>,
    #[arg(long, value_enum, default_value = "26")]
    pub connectivity: Connectivity,
    /// Isotropic voxel size in µm (default: from the atlas attributes)
    #[arg(long)]
    pub voxel_size: Option<f64>,
    /// Output CSV
    #[arg(long)]
    pub output: PathBuf,
}

pub fn run(args: RegionalArgs, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    let atlas = volume::load_labels(&args.atlas)?;
    let voxel = volume::resolve_voxel_size(args.voxel_size, &args.atlas)?;
    progress(0.2, &format!("Loaded {}", args.atlas));
    let seg = volume::load_binary(&args.seg)?;
    progress(0.4, &format!("Loaded {}", args.seg));
    let hierarchy = match &args.hierarchy {
        Some(p) => Some(Hierarchy::from_csv(p)?),
        None => None,
    };

    let (cells, outside) = cells_per_region(&atlas, &seg, args.connectivity)?;
    let total: u64 = cells.values().sum();
    log::info!("{} cell(s) in {} region(s), {} outside the atlas", total, cells.len(), outside);
    progress(0.8, &format!("Counted {} cell(s)", total + outside));

    let rows = regional_densities(&atlas, &cells, voxel, hierarchy.as_ref(), args.depth)?;
    report::write_csv(
        &args.output,
        &rows,
        Some(&["region_id", "abbreviation", "name", "cell_count", "region_volume_mm3", "cell_density"]),
    )?;
    if let Some(dir) = args.output.parent() {
        report::write_params(dir, &args)?;
    }
    progress(1.0, &format!("Wrote {}", args.output.display()));
    Ok(())
}
