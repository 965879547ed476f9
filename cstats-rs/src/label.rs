//! 3-D connected component labelling (two-pass, union-find).

use ndarray::{Array3, ArrayView3};

/// Voxel neighbourhood used to decide whether two voxels touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
pub enum Connectivity {
    /// Faces only.
    #[value(name = "6")]
    Six,
    /// Faces and edges.
    #[value(name = "18")]
    Eighteen,
    /// Faces, edges and corners.
    #[value(name = "26")]
    TwentySix,
}

impl Connectivity {
    fn max_nonzero_offsets(self) -> usize {
        match self {
            Connectivity::Six => 1,
            Connectivity::Eighteen => 2,
            Connectivity::TwentySix => 3,
        }
    }

    /// Neighbour offsets that precede a voxel in raster (z, y, x) order.
    fn backward_offsets(self) -> Vec<(isize, isize, isize)> {
        let mut out = Vec::with_capacity(13);
        for dz in -1isize..=0 {
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let precedes = dz < 0 || (dz == 0 && (dy < 0 || (dy == 0 && dx < 0)));
                    if !precedes {
                        continue;
                    }
                    let nonzero = [dz, dy, dx].iter().filter(|&&d| d != 0).count();
                    if nonzero <= self.max_nonzero_offsets() {
                        out.push((dz, dy, dx));
                    }
                }
            }
        }
        out
    }
}

fn find_root(parent: &mut [u32], label: u32) -> u32 {
    let mut current = label;
    while current != parent[current as usize] {
        parent[current as usize] = parent[parent[current as usize] as usize];
        current = parent[current as usize];
    }
    current
}

fn union_labels(parent: &mut [u32], a: u32, b: u32) {
    let ra = find_root(parent, a);
    let rb = find_root(parent, b);
    if ra < rb {
        parent[rb as usize] = ra;
    } else if rb < ra {
        parent[ra as usize] = rb;
    }
}

/// Label connected foreground voxels. Returns the label volume and the number
/// of components; labels run 1..=n in raster order of each component's first voxel.
pub fn connected_components(mask: &ArrayView3<bool>, connectivity: Connectivity) -> (Array3<u32>, u32) {
    let (nz, ny, nx) = mask.dim();
    let mut labels = Array3::<u32>::zeros((nz, ny, nx));
    let mut parent: Vec<u32> = vec![0];
    let offsets = connectivity.backward_offsets();

    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if !mask[[z, y, x]] {
                    continue;
                }
                let mut current = 0u32;
                for &(dz, dy, dx) in &offsets {
                    let (zz, yy, xx) = (z as isize + dz, y as isize + dy, x as isize + dx);
                    if zz < 0 || yy < 0 || xx < 0 || yy >= ny as isize || xx >= nx as isize {
                        continue;
                    }
                    let n = labels[[zz as usize, yy as usize, xx as usize]];
                    if n == 0 {
                        continue;
                    }
                    if current == 0 {
                        current = n;
                    } else if n != current {
                        union_labels(&mut parent, current, n);
                        current = current.min(n);
                    }
                }
                if current == 0 {
                    current = parent.len() as u32;
                    parent.push(current);
                }
                labels[[z, y, x]] = current;
            }
        }
    }

    let mut relabel = vec![0u32; parent.len()];
    let mut next = 0u32;
    for i in 1..parent.len() as u32 {
        let root = find_root(&mut parent, i);
        if relabel[root as usize] == 0 {
            next += 1;
            relabel[root as usize] = next;
        }
        relabel[i as usize] = relabel[root as usize];
    }
    labels.mapv_inplace(|l| relabel[l as usize]);
    (labels, next)
}

/// Voxel count per label; index 0 is background.
pub fn label_sizes(labels: &ArrayView3<u32>) -> Vec<u64> {
    let max = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut sizes = vec![0u64; max + 1];
    for &l in labels.iter() {
        sizes[l as usize] += 1;
    }
    sizes
}

/// Zero components with fewer than `min_size` voxels and renumber the rest 1..=n,
/// keeping their relative order.
pub fn remove_small(labels: &Array3<u32>, min_size: u64) -> (Array3<u32>, u32) {
    let sizes = label_sizes(&labels.view());
    let mut map = vec![0u32; sizes.len()];
    let mut next = 0u32;
    for (id, &size) in sizes.iter().enumerate().skip(1) {
        if size > 0 && size >= min_size {
            next += 1;
            map[id] = next;
        }
    }
    (labels.mapv(|l| map[l as usize]), next)
}

/// Renumber labels by component size. Ascending puts the largest component at
/// the highest ID; ties keep the original label order.
pub fn order_by_size(labels: &Array3<u32>, ascending: bool) -> Array3<u32> {
    let sizes = label_sizes(&labels.view());
    let mut ids: Vec<usize> = (1..sizes.len()).filter(|&i| sizes[i] > 0).collect();
    if ascending {
        ids.sort_by(|&a, &b| sizes[a].cmp(&sizes[b]).then(a.cmp(&b)));
    } else {
        ids.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]).then(a.cmp(&b)));
    }
    let mut map = vec![0u32; sizes.len()];
    for (rank, &id) in ids.iter().enumerate() {
        map[id] = rank as u32 + 1;
    }
    labels.mapv(|l| map[l as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(points: &[(usize, usize, usize)], dim: (usize, usize, usize)) -> Array3<bool> {
        let mut m = Array3::from_elem(dim, false);
        for &p in points {
            m[p] = true;
        }
        m
    }

    #[test]
    fn empty_volume_has_no_components() {
        let m = Array3::from_elem((3, 3, 3), false);
        let (labels, n) = connected_components(&m.view(), Connectivity::TwentySix);
        assert_eq!(n, 0);
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn corner_touching_voxels_depend_on_connectivity() {
        let m = mask_from(&[(0, 0, 0), (1, 1, 1)], (2, 2, 2));
        assert_eq!(connected_components(&m.view(), Connectivity::TwentySix).1, 1);
        assert_eq!(connected_components(&m.view(), Connectivity::Eighteen).1, 2);
        assert_eq!(connected_components(&m.view(), Connectivity::Six).1, 2);

        let edge = mask_from(&[(0, 0, 0), (0, 1, 1)], (1, 2, 2));
        assert_eq!(connected_components(&edge.view(), Connectivity::Eighteen).1, 1);
        assert_eq!(connected_components(&edge.view(), Connectivity::Six).1, 2);
    }

    #[test]
    fn u_shape_merges_into_one_label() {
        // Two arms joined only at the bottom row force an equivalence merge.
        let mut m = Array3::from_elem((1, 4, 3), false);
        for y in 0..4 {
            m[[0, y, 0]] = true;
            m[[0, y, 2]] = true;
        }
        m[[0, 3, 1]] = true;
        let (labels, n) = connected_components(&m.view(), Connectivity::Six);
        assert_eq!(n, 1);
        assert!(labels.iter().filter(|&&l| l > 0).all(|&l| l == 1));
    }

    #[test]
    fn labels_follow_raster_order() {
        let m = mask_from(&[(0, 0, 3), (1, 0, 0), (1, 0, 1)], (2, 1, 4));
        let (labels, n) = connected_components(&m.view(), Connectivity::Six);
        assert_eq!(n, 2);
        assert_eq!(labels[[0, 0, 3]], 1);
        assert_eq!(labels[[1, 0, 0]], 2);
        assert_eq!(labels[[1, 0, 1]], 2);
    }

    #[test]
    fn small_components_are_removed_and_renumbered() {
        let m = mask_from(&[(0, 0, 0), (0, 0, 2), (0, 0, 3), (0, 0, 4)], (1, 1, 5));
        let (labels, _) = connected_components(&m.view(), Connectivity::Six);
        let (kept, n) = remove_small(&labels, 2);
        assert_eq!(n, 1);
        assert_eq!(kept[[0, 0, 0]], 0);
        assert_eq!(kept[[0, 0, 3]], 1);
    }

    #[test]
    fn ascending_order_gives_largest_the_max_id() {
        let m = mask_from(&[(0, 0, 0), (0, 0, 1), (0, 0, 2), (0, 0, 4), (0, 0, 6), (0, 0, 7)], (1, 1, 8));
        let (labels, n) = connected_components(&m.view(), Connectivity::Six);
        assert_eq!(n, 3);
        let asc = order_by_size(&labels, true);
        assert_eq!(asc[[0, 0, 0]], 3);
        assert_eq!(asc[[0, 0, 4]], 1);
        assert_eq!(asc[[0, 0, 6]], 2);
        let desc = order_by_size(&labels, false);
        assert_eq!(desc[[0, 0, 0]], 1);
        assert_eq!(desc[[0, 0, 6]], 2);
        assert_eq!(desc[[0, 0, 4]], 3);
    }
}
