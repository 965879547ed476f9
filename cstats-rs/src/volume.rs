//! Volume containers: Zarr v3 arrays (read/write) and multi-page TIFF stacks (read).
//! Volumes are (z, y, x).

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::zarr;

const SLAB: u64 = 32;

/// Physical voxel size in micrometres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoxelSize {
    pub z: f64,
    pub y: f64,
    pub x: f64,
}

impl VoxelSize {
    pub fn isotropic(um: f64) -> Self {
        VoxelSize { z: um, y: um, x: um }
    }

    pub fn voxel_volume_mm3(&self) -> f64 {
        self.z * self.y * self.x / 1e9
    }

    fn from_attrs(attrs: &serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        let v = attrs.get("voxel_size_um")?.as_array()?;
        if v.len() != 3 {
            return None;
        }
        Some(VoxelSize {
            z: v[0].as_f64()?,
            y: v[1].as_f64()?,
            x: v[2].as_f64()?,
        })
    }
}

/// `STORE[::ARRAY]` for Zarr, or a `.tif`/`.tiff` path.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRef {
    pub store: PathBuf,
    pub array: String,
}

impl VolumeRef {
    pub fn new(store: impl Into<PathBuf>, array: &str) -> Self {
        let array = if array.starts_with('/') {
            array.to_string()
        } else {
            format!("/{}", array)
        };
        VolumeRef {
            store: store.into(),
            array,
        }
    }

    pub fn is_tiff(&self) -> bool {
        matches!(
            self.store
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .as_deref(),
            Some("tif") | Some("tiff")
        )
    }
}

impl FromStr for VolumeRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty volume path".to_string());
        }
        match s.split_once("::") {
            Some((store, array)) => Ok(VolumeRef::new(store, array)),
            None => Ok(VolumeRef::new(s, "/")),
        }
    }
}

impl Serialize for VolumeRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl std::fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_tiff() || self.array == "/" {
            write!(f, "{}", self.store.display())
        } else {
            write!(f, "{}::{}", self.store.display(), self.array)
        }
    }
}

fn dims3(shape: &[u64]) -> Result<(usize, usize, usize), Box<dyn std::error::Error>> {
    if shape.len() != 3 {
        return Err(format!("Expected a 3-D (z, y, x) array, got shape {:?}", shape).into());
    }
    Ok((shape[0] as usize, shape[1] as usize, shape[2] as usize))
}

/// Read every page of a TIFF stack, converting samples with `from_u32`/`from_f32`.
fn read_tiff_stack<T: Clone>(
    path: &Path,
    from_u32: impl Fn(u32) -> T,
    from_f32: impl Fn(f32) -> T,
) -> Result<Array3<T>, Box<dyn std::error::Error>> {
    let file = fs::File::open(path)?;
    let mut decoder = tiff::decoder::Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;
    let mut data: Vec<T> = Vec::new();
    let mut pages = 0usize;
    loop {
        let (w, h) = decoder.dimensions()?;
        if (w, h) != (width, height) {
            return Err(format!(
                "TIFF page {} is {}x{}, expected {}x{}",
                pages, w, h, width, height
            )
            .into());
        }
        match decoder.read_image()? {
            tiff::decoder::DecodingResult::U8(v) => data.extend(v.into_iter().map(|x| from_u32(x as u32))),
            tiff::decoder::DecodingResult::U16(v) => data.extend(v.into_iter().map(|x| from_u32(x as u32))),
            tiff::decoder::DecodingResult::U32(v) => data.extend(v.into_iter().map(&from_u32)),
            tiff::decoder::DecodingResult::F32(v) => data.extend(v.into_iter().map(&from_f32)),
            _ => return Err("Unsupported TIFF sample format (need u8, u16, u32 or f32)".into()),
        }
        pages += 1;
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }
    let shape = (pages, height as usize, width as usize);
    Ok(Array3::from_shape_vec(shape, data)?)
}

/// Load a float map (p-values, statistics). Zarr float32 or float64.
pub fn load_f32(r: &VolumeRef) -> Result<Array3<f32>, Box<dyn std::error::Error>> {
    if r.is_tiff() {
        return read_tiff_stack(&r.store, |v| v as f32, |v| v);
    }
    let store = zarr::open_store(&r.store)?;
    let arr = zarr::open_array(&store, &r.array)?;
    let dims = dims3(arr.shape())?;
    let data = match zarr::read_all_f32(&arr) {
        Ok(d) => d,
        Err(_) => zarr::read_all_f64(&arr)?.into_iter().map(|v| v as f32).collect(),
    };
    Ok(Array3::from_shape_vec(dims, data)?)
}

/// Load a label volume (cluster index, atlas). Accepts uint32, uint16 or uint8 data.
pub fn load_labels(r: &VolumeRef) -> Result<Array3<u32>, Box<dyn std::error::Error>> {
    if r.is_tiff() {
        return read_tiff_stack(&r.store, |v| v, |v| v.max(0.0).round() as u32);
    }
    let store = zarr::open_store(&r.store)?;
    let arr = zarr::open_array(&store, &r.array)?;
    let dims = dims3(arr.shape())?;
    let data = match zarr::read_all_u32(&arr) {
        Ok(d) => d,
        Err(_) => match zarr::read_all_u16(&arr) {
            Ok(d) => d.into_iter().map(u32::from).collect(),
            Err(_) => zarr::read_all_u8(&arr)?.into_iter().map(u32::from).collect(),
        },
    };
    Ok(Array3::from_shape_vec(dims, data)?)
}

/// Load a segmentation; any non-zero voxel is foreground.
pub fn load_binary(r: &VolumeRef) -> Result<Array3<bool>, Box<dyn std::error::Error>> {
    if r.is_tiff() {
        return read_tiff_stack(&r.store, |v| v != 0, |v| v != 0.0);
    }
    let labels = load_labels(r)?;
    Ok(labels.mapv(|v| v != 0))
}

pub fn read_voxel_size(r: &VolumeRef) -> Option<VoxelSize> {
    if r.is_tiff() {
        return None;
    }
    let store = zarr::open_store(&r.store).ok()?;
    let arr = zarr::open_array(&store, &r.array).ok()?;
    VoxelSize::from_attrs(arr.attributes())
}

fn volume_attrs(
    voxel: Option<VoxelSize>,
    extra: Option<serde_json::Value>,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let mut attrs = serde_json::Map::new();
    attrs.insert("axis_names".to_string(), serde_json::json!(["z", "y", "x"]));
    if let Some(v) = voxel {
        attrs.insert("voxel_size_um".to_string(), serde_json::json!([v.z, v.y, v.x]));
    }
    if let Some(serde_json::Value::Object(map)) = extra {
        attrs.extend(map);
    }
    Some(attrs)
}

/// Copy z-slab `ci` out of `volume`, padding the last slab with `fill`.
fn slab<T: Copy>(volume: &Array3<T>, ci: usize, slab: usize, fill: T) -> Vec<T> {
    let (nz, ny, nx) = volume.dim();
    let z0 = ci * slab;
    let z1 = (z0 + slab).min(nz);
    let mut out = Vec::with_capacity(slab * ny * nx);
    for z in z0..z1 {
        out.extend(volume.index_axis(ndarray::Axis(0), z).iter().copied());
    }
    out.resize(slab * ny * nx, fill);
    out
}

pub fn save_labels(
    r: &VolumeRef,
    volume: &Array3<u32>,
    voxel: Option<VoxelSize>,
    extra_attrs: Option<serde_json::Value>,
) -> Result<(), Box<dyn std::error::Error>> {
    if r.is_tiff() {
        return Err(format!("Writing TIFF is not supported: {}", r).into());
    }
    fs::create_dir_all(&r.store)?;
    let store = zarr::open_store(&r.store)?;
    let shape: Vec<u64> = volume.shape().iter().map(|&d| d as u64).collect();
    let chunks = zarr::slab_chunks(&shape, SLAB);
    let depth = chunks[0] as usize;
    let arr = zarr::create_array_u32(&store, &r.array, shape, chunks, volume_attrs(voxel, extra_attrs))?;
    let n_chunks = volume.dim().0.div_ceil(depth);
    for ci in 0..n_chunks {
        zarr::store_chunk_u32(&arr, &[ci as u64, 0, 0], &slab(volume, ci, depth, 0))?;
    }
    Ok(())
}

pub fn save_f32(
    r: &VolumeRef,
    volume: &Array3<f32>,
    voxel: Option<VoxelSize>,
    extra_attrs: Option<serde_json::Value>,
) -> Result<(), Box<dyn std::error::Error>> {
    if r.is_tiff() {
        return Err(format!("Writing TIFF is not supported: {}", r).into());
    }
    fs::create_dir_all(&r.store)?;
    let store = zarr::open_store(&r.store)?;
    let shape: Vec<u64> = volume.shape().iter().map(|&d| d as u64).collect();
    let chunks = zarr::slab_chunks(&shape, SLAB);
    let depth = chunks[0] as usize;
    let arr = zarr::create_array_f32(&store, &r.array, shape, chunks, volume_attrs(voxel, extra_attrs))?;
    let n_chunks = volume.dim().0.div_ceil(depth);
    for ci in 0..n_chunks {
        zarr::store_chunk_f32(&arr, &[ci as u64, 0, 0], &slab(volume, ci, depth, 0.0))?;
    }
    Ok(())
}

/// Voxel size from the CLI override, else the volume attributes, else an error.
pub fn resolve_voxel_size(
    cli_um: Option<f64>,
    r: &VolumeRef,
) -> Result<VoxelSize, Box<dyn std::error::Error>> {
    if let Some(um) = cli_um {
        return Ok(VoxelSize::isotropic(um));
    }
    read_voxel_size(r).ok_or_else(|| {
        format!(
            "No voxel_size_um attribute on {}; pass --voxel-size",
            r
        )
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn parses_store_and_array() {
        let r: VolumeRef = "stats.zarr::q0.05/rev_cluster_index".parse().unwrap();
        assert_eq!(r.store, PathBuf::from("stats.zarr"));
        assert_eq!(r.array, "/q0.05/rev_cluster_index");
        let r: VolumeRef = "atlas.zarr".parse().unwrap();
        assert_eq!(r.array, "/");
        let r: VolumeRef = "seg/sample01.TIF".parse().unwrap();
        assert!(r.is_tiff());
        assert!("".parse::<VolumeRef>().is_err());
    }

    #[test]
    fn voxel_volume_in_cubic_mm() {
        assert_relative_eq!(VoxelSize::isotropic(25.0).voxel_volume_mm3(), 1.5625e-5);
        assert_relative_eq!(VoxelSize::isotropic(1000.0).voxel_volume_mm3(), 1.0);
    }

    #[test]
    fn slab_pads_last_chunk() {
        let v = Array3::from_shape_fn((3, 2, 2), |(z, _, _)| z as u32 + 1);
        assert_eq!(slab(&v, 0, 2, 0), vec![1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(slab(&v, 1, 2, 0), vec![3, 3, 3, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn labels_round_trip_through_zarr() {
        let dir = tempfile::tempdir().unwrap();
        let r = VolumeRef::new(dir.path().join("out.zarr"), "/q0.05/cluster_index");
        let v = Array3::from_shape_fn((40, 3, 4), |(z, y, x)| (z * 12 + y * 4 + x) as u32);
        save_labels(&r, &v, Some(VoxelSize::isotropic(25.0)), None).unwrap();
        let back = load_labels(&r).unwrap();
        assert_eq!(back, v);
        assert_eq!(read_voxel_size(&r), Some(VoxelSize::isotropic(25.0)));
    }
}
