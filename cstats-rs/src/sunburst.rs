use clap::Args;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::atlas::{self, Hierarchy, SunburstRow};
use crate::ids;
use crate::index;
use crate::report;
use crate::volume::{self, VolumeRef};

#[derive(Debug, Serialize)]
struct ClusterRegionRow<'a> {
    #[serde(rename = "cluster_ID")]
    cluster_id: u32,
    region_id: u32,
    abbreviation: &'a str,
    name: &'a str,
    volume_mm3: f64,
    percent_of_cluster: f64,
}

fn write_sunburst(path: &Path, rows: &[SunburstRow]) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
    let mut wtr = csv::Writer::from_path(path)?;
    let width = rows.first().map_or(0, |r| r.path.len());
    let mut header: Vec<String> = (0..width).map(|d| format!("depth_{}", d)).collect();
    header.push("value".to_string());
    wtr.write_record(&header)?;
    for r in rows {
        let mut record = r.path.clone();
        record.push(r.value.to_string());
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Args, Clone, Serialize)]
pub struct SunburstArgs {
    /// Cluster index, STORE[::ARRAY]
    #[arg(long)]
    pub index: VolumeRef,
    /// Atlas label volume in the same space, STORE[::ARRAY]
    #[arg(long)]
    pub atlas: VolumeRef,
    /// Region hierarchy CSV (id,name,abbreviation,parent_id)
    #[arg(long)]
    pub hierarchy: PathBuf,
    /// Clusters to include: "all" or e.g. "1,3,5:9"
    #[arg(long, default_value = "all")]
    pub clusters: String,
    /// Only clusters listed in this file, e.g. valid_cluster_ids.txt
    #[arg(long)]
    pub ids_file: Option<PathBuf>,
    /// Sum regions deeper than this into their ancestor
    #[arg(long)]
    pub depth: Option<usize>,
    /// Isotropic voxel size in µm (default: from the index attributes)
    #[arg(long)]
    pub voxel_size: Option<f64>,
    #[arg(long)]
    pub output: PathBuf,
}

pub fn run(args: SunburstArgs, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    let hierarchy = Hierarchy::from_csv(&args.hierarchy)?;
    log::info!("{} region(s) in hierarchy", hierarchy.len());
    let mut index = volume::load_labels(&args.index)?;
    let voxel = volume::resolve_voxel_size(args.voxel_size, &args.index)?;
    let atlas_vol = volume::load_labels(&args.atlas)?;
    progress(0.3, &format!("Loaded {} and {}", args.index, args.atlas));

    let max_id = index.iter().copied().max().unwrap_or(0);
    let mut keep: BTreeSet<u32> = ids::parse_id_selection(&args.clusters, max_id)?.into_iter().collect();
    if let Some(path) = &args.ids_file {
        let listed: BTreeSet<u32> = ids::read_id_file(path)?.into_iter().collect();
        keep = keep.intersection(&listed).copied().collect();
    }
    index = index::keep_ids(&index, &keep);

    let volumes = atlas::region_volumes(&index, &atlas_vol, voxel)?;
    let rows: Vec<ClusterRegionRow> = volumes
        .iter()
        .map(|v| {
            let region = hierarchy.get(v.region_id);
            ClusterRegionRow {
                cluster_id: v.cluster_id,
                region_id: v.region_id,
                abbreviation: region.map_or("", |r| r.abbreviation.as_str()),
                name: region.map_or("", |r| r.name.as_str()),
                volume_mm3: v.volume_mm3,
                percent_of_cluster: v.percent_of_cluster,
            }
        })
        .collect();
    report::write_csv(
        &args.output.join("cluster_regions.csv"),
        &rows,
        Some(&["cluster_ID", "region_id", "abbreviation", "name", "volume_mm3", "percent_of_cluster"]),
    )?;
    progress(0.7, &format!("{} cluster/region pair(s)", rows.len()));

    let mut totals: BTreeMap<u32, f64> = BTreeMap::new();
    for v in &volumes {
        if hierarchy.get(v.region_id).is_none() {
            log::warn!("atlas label {} not in hierarchy, left out of sunburst", v.region_id);
            continue;
        }
        *totals.entry(v.region_id).or_insert(0.0) += v.volume_mm3;
    }
    if let Some(d) = args.depth {
        totals = hierarchy.collapse_to_depth(&totals, d)?;
    }
    let sunburst = hierarchy.sunburst_rows(&totals)?;
    write_sunburst(&args.output.join("sunburst.csv"), &sunburst)?;

    report::write_params(&args.output, &args)?;
    progress(1.0, &format!("Wrote {}", args.output.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::tests::CSV;
    use crate::volume::VoxelSize;
    use ndarray::Array3;

    #[test]
    fn writes_region_tables() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = dir.path().join("hierarchy.csv");
        fs::write(&hierarchy, CSV).unwrap();

        let index = Array3::from_shape_vec((1, 2, 3), vec![1, 1, 1, 2, 0, 2]).unwrap();
        let atlas_vol = Array3::from_shape_vec((1, 2, 3), vec![315, 1089, 0, 343, 343, 315]).unwrap();
        let store = dir.path().join("in.zarr");
        let index_ref = VolumeRef::new(&store, "/index");
        let atlas_ref = VolumeRef::new(&store, "/atlas");
        volume::save_labels(&index_ref, &index, Some(VoxelSize::isotropic(1000.0)), None).unwrap();
        volume::save_labels(&atlas_ref, &atlas_vol, None, None).unwrap();

        let out = dir.path().join("sunburst");
        run(
            SunburstArgs {
                index: index_ref,
                atlas: atlas_ref,
                hierarchy,
                clusters: "1".into(),
                ids_file: None,
                depth: Some(3),
                voxel_size: None,
                output: out.clone(),
            },
            |_, _| {},
        )
        .unwrap();

        let regions = fs::read_to_string(out.join("cluster_regions.csv")).unwrap();
        assert_eq!(regions.lines().count(), 3);
        assert!(regions.contains("1,315,Isocortex,Isocortex,1.0,"));

        let sunburst = fs::read_to_string(out.join("sunburst.csv")).unwrap();
        let lines: Vec<&str> = sunburst.lines().collect();
        assert_eq!(lines[0], "depth_0,depth_1,depth_2,depth_3,value");
        assert_eq!(lines[1], "root,grey,CH,CTX,2");
        assert_eq!(lines.len(), 2);
    }
}
