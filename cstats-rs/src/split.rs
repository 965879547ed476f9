use clap::Args;

use crate::index::{self, Axis3};
use crate::volume::{self, VolumeRef};

#[derive(Args, Clone)]
pub struct SplitArgs {
    /// Cluster index, STORE[::ARRAY]
    #[arg(long)]
    pub input: VolumeRef,
    /// Clusters on the low side of the plane, or with a positive effect
    #[arg(long)]
    pub output_a: VolumeRef,
    /// Everything else
    #[arg(long)]
    pub output_b: VolumeRef,
    /// Axis separating the hemispheres
    #[arg(long, value_enum, default_value = "x")]
    pub axis: Axis3,
    /// Plane index along --axis (default: midline)
    #[arg(long)]
    pub plane: Option<usize>,
    /// Split by the sign of this map (e.g. a t-stat or mean difference) instead
    #[arg(long, conflicts_with = "plane")]
    pub direction: Option<VolumeRef>,
}

pub fn run(args: SplitArgs, progress: impl Fn(f64, &str)) -> Result<(), Box<dyn std::error::Error>> {
    let idx = volume::load_labels(&args.input)?;
    let voxel = volume::read_voxel_size(&args.input);
    progress(0.3, &format!("Loaded {}", args.input));

    let (a, b) = match &args.direction {
        Some(dir) => {
            let direction = volume::load_f32(dir)?;
            log::info!("splitting {} by sign of {}", args.input, dir);
            index::split_by_sign(&idx, &direction)?
        }
        None => {
            let plane = args
                .plane
                .unwrap_or_else(|| index::axis_len(&idx, args.axis) / 2);
            log::info!("splitting {} at {:?} = {}", args.input, args.axis, plane);
            index::split_by_axis(&idx, args.axis, plane)
        }
    };
    let count = |v: &ndarray::Array3<u32>| v.iter().filter(|&&id| id != 0).count();
    log::info!("{} voxel(s) in a, {} in b", count(&a), count(&b));

    progress(0.7, "Writing split indices");
    volume::save_labels(&args.output_a, &a, voxel, None)?;
    volume::save_labels(&args.output_b, &b, voxel, None)?;
    progress(1.0, &format!("Wrote {} and {}", args.output_a, args.output_b));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn midline_split_round_trips_through_zarr() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("clusters.zarr");
        let mut v = Array3::<u32>::zeros((2, 2, 6));
        v[[0, 0, 1]] = 1;
        v[[1, 1, 2]] = 1;
        v[[0, 1, 3]] = 2;
        v[[1, 0, 5]] = 3;
        let input = VolumeRef::new(&store, "/index");
        volume::save_labels(&input, &v, None, None).unwrap();

        let args = SplitArgs {
            input,
            output_a: VolumeRef::new(&store, "/left"),
            output_b: VolumeRef::new(&store, "/right"),
            axis: Axis3::X,
            plane: None,
            direction: None,
        };
        run(args.clone(), |_, _| {}).unwrap();
        let a = volume::load_labels(&args.output_a).unwrap();
        let b = volume::load_labels(&args.output_b).unwrap();
        assert_eq!(a[[0, 0, 1]], 1);
        assert_eq!(a[[1, 1, 2]], 1);
        assert_eq!(b[[0, 1, 3]], 2);
        assert_eq!(b[[1, 0, 5]], 3);
        assert_eq!(&a + &b, v);
    }
}
