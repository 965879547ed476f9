//! Atlas region hierarchy (ABA/CCF style): ancestry, depth collapsing and
//! sunburst paths, plus per-cluster region volumes.

use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use crate::error::{check_shape, Error, Result};
use crate::volume::VoxelSize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Region {
    pub id: u32,
    pub name: String,
    pub abbreviation: String,
    #[serde(rename = "parent_id")]
    pub parent: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Hierarchy {
    regions: BTreeMap<u32, Region>,
}

impl Hierarchy {
    /// Build from regions; every parent must exist and parents may not cycle.
    pub fn new(regions: Vec<Region>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for r in regions {
            if map.insert(r.id, r.clone()).is_some() {
                return Err(Error::InvalidInput(format!("duplicate region id {}", r.id)));
            }
        }
        let h = Hierarchy { regions: map };
        for r in h.regions.values() {
            if let Some(p) = r.parent {
                if !h.regions.contains_key(&p) {
                    return Err(Error::InvalidInput(format!(
                        "region {} has unknown parent {}",
                        r.id, p
                    )));
                }
            }
            h.ancestors(r.id)?;
        }
        Ok(h)
    }

    /// CSV with columns `id,name,abbreviation,parent_id`; empty parent = root.
    pub fn from_reader<R: Read>(rdr: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(rdr);
        let regions = rdr.deserialize().collect::<std::result::Result<Vec<Region>, _>>()?;
        Self::new(regions)
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn get(&self, id: u32) -> Option<&Region> {
        self.regions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    fn require(&self, id: u32) -> Result<&Region> {
        self.regions
            .get(&id)
            .ok_or_else(|| Error::InvalidInput(format!("region {} not in hierarchy", id)))
    }

    /// IDs from the root down to `id`, inclusive.
    pub fn ancestors(&self, id: u32) -> Result<Vec<u32>> {
        let mut chain = vec![id];
        let mut cur = self.require(id)?;
        while let Some(p) = cur.parent {
            if chain.len() > self.regions.len() {
                return Err(Error::InvalidInput(format!("cycle in hierarchy at region {}", id)));
            }
            chain.push(p);
            cur = self.require(p)?;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Depth of `id`; roots have depth 0.
    pub fn depth(&self, id: u32) -> Result<usize> {
        Ok(self.ancestors(id)?.len() - 1)
    }

    /// The ancestor of `id` at `depth`, or `id` itself when it is not deeper.
    pub fn ancestor_at_depth(&self, id: u32, depth: usize) -> Result<u32> {
        let chain = self.ancestors(id)?;
        Ok(chain.get(depth).copied().unwrap_or(id))
    }

    /// Fold values of regions deeper than `depth` into their ancestor at `depth`.
    pub fn collapse_to_depth(&self, values: &BTreeMap<u32, f64>, depth: usize) -> Result<BTreeMap<u32, f64>> {
        let mut out = BTreeMap::new();
        for (&id, &v) in values {
            *out.entry(self.ancestor_at_depth(id, depth)?).or_insert(0.0) += v;
        }
        Ok(out)
    }

    /// One row per region: abbreviations from the root down, padded to the
    /// deepest region, and the region's own value.
    pub fn sunburst_rows(&self, values: &BTreeMap<u32, f64>) -> Result<Vec<SunburstRow>> {
        let mut rows = Vec::with_capacity(values.len());
        for (&id, &value) in values {
            let path = self
                .ancestors(id)?
                .into_iter()
                .map(|a| self.require(a).map(|r| r.abbreviation.clone()))
                .collect::<Result<Vec<_>>>()?;
            rows.push(SunburstRow { path, value });
        }
        let width = rows.iter().map(|r| r.path.len()).max().unwrap_or(0);
        for r in &mut rows {
            r.path.resize(width, String::new());
        }
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(rows)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SunburstRow {
    pub path: Vec<String>,
    pub value: f64,
}

/// Volume of one atlas region inside one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionVolume {
    #[serde(rename = "cluster_ID")]
    pub cluster_id: u32,
    pub region_id: u32,
    pub voxels: u64,
    pub volume_mm3: f64,
    pub percent_of_cluster: f64,
}

/// Region composition of every cluster. Atlas background (0) is left out of
/// the rows but still counts towards the cluster volume.
pub fn region_volumes(index: &Array3<u32>, atlas: &Array3<u32>, voxel: VoxelSize) -> Result<Vec<RegionVolume>> {
    check_shape(index.shape(), atlas.shape())?;
    let mut per_cluster: BTreeMap<u32, u64> = BTreeMap::new();
    let mut per_pair: BTreeMap<(u32, u32), u64> = BTreeMap::new();
    Zip::from(index).and(atlas).for_each(|&c, &r| {
        if c == 0 {
            return;
        }
        *per_cluster.entry(c).or_insert(0) += 1;
        if r != 0 {
            *per_pair.entry((c, r)).or_insert(0) += 1;
        }
    });
    let vv = voxel.voxel_volume_mm3();
    Ok(per_pair
        .into_iter()
        .map(|((c, r), n)| RegionVolume {
            cluster_id: c,
            region_id: r,
            voxels: n,
            volume_mm3: n as f64 * vv,
            percent_of_cluster: n as f64 / per_cluster[&c] as f64 * 100.0,
        })
        .collect())
}

/// Voxel count per atlas label, background excluded.
pub fn label_counts(atlas: &Array3<u32>) -> BTreeMap<u32, u64> {
    let mut counts = BTreeMap::new();
    for &r in atlas.iter().filter(|&&r| r != 0) {
        *counts.entry(r).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    pub(crate) const CSV: &str = "id,name,abbreviation,parent_id
997,root,root,
8,Basic cell groups and regions,grey,997
567,Cerebrum,CH,8
688,Cerebral cortex,CTX,567
315,Isocortex,Isocortex,688
1089,Hippocampal formation,HPF,688
343,Brain stem,BS,8
";

    pub(crate) fn hierarchy() -> Hierarchy {
        Hierarchy::from_reader(CSV.as_bytes()).unwrap()
    }

    #[test]
    fn ancestry_and_depth() {
        let h = hierarchy();
        assert_eq!(h.len(), 7);
        assert_eq!(h.ancestors(315).unwrap(), vec![997, 8, 567, 688, 315]);
        assert_eq!(h.depth(997).unwrap(), 0);
        assert_eq!(h.depth(1089).unwrap(), 4);
        assert_eq!(h.ancestor_at_depth(1089, 2).unwrap(), 567);
        assert_eq!(h.ancestor_at_depth(343, 5).unwrap(), 343);
        assert!(h.ancestors(42).is_err());
    }

    #[test]
    fn rejects_unknown_parents_and_cycles() {
        let bad = "id,name,abbreviation,parent_id\n1,a,A,\n2,b,B,9\n";
        assert!(matches!(Hierarchy::from_reader(bad.as_bytes()), Err(Error::InvalidInput(_))));
        let cycle = "id,name,abbreviation,parent_id\n1,a,A,2\n2,b,B,1\n";
        assert!(Hierarchy::from_reader(cycle.as_bytes()).is_err());
        let dup = "id,name,abbreviation,parent_id\n1,a,A,\n1,b,B,\n";
        assert!(Hierarchy::from_reader(dup.as_bytes()).is_err());
    }

    #[test]
    fn collapse_conserves_the_total() {
        let h = hierarchy();
        let values: BTreeMap<u32, f64> = [(315, 2.0), (1089, 3.0), (343, 1.5), (567, 0.5)].into_iter().collect();
        let collapsed = h.collapse_to_depth(&values, 2).unwrap();
        assert_eq!(collapsed.len(), 2);
        assert_relative_eq!(collapsed[&567], 5.5);
        assert_relative_eq!(collapsed[&343], 1.5);
        assert_relative_eq!(collapsed.values().sum::<f64>(), values.values().sum::<f64>());
    }

    #[test]
    fn sunburst_paths_are_padded() {
        let h = hierarchy();
        let values: BTreeMap<u32, f64> = [(315, 2.0), (343, 1.0)].into_iter().collect();
        let rows = h.sunburst_rows(&values).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].path, vec!["root", "grey", "BS", "", ""]);
        assert_eq!(rows[1].path, vec!["root", "grey", "CH", "CTX", "Isocortex"]);
        assert_relative_eq!(rows[1].value, 2.0);
    }

    #[test]
    fn region_volumes_per_cluster() {
        let index = Array3::from_shape_vec((1, 2, 3), vec![1, 1, 1, 2, 0, 2]).unwrap();
        let atlas = Array3::from_shape_vec((1, 2, 3), vec![315, 315, 0, 343, 343, 315]).unwrap();
        let rows = region_volumes(&index, &atlas, VoxelSize::isotropic(1000.0)).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].cluster_id, rows[0].region_id, rows[0].voxels), (1, 315, 2));
        assert_relative_eq!(rows[0].percent_of_cluster, 200.0 / 3.0);
        assert_relative_eq!(rows[1].percent_of_cluster, 50.0);
        assert_eq!(label_counts(&atlas)[&343], 2);
    }
}
