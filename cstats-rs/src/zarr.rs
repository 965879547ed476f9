use std::path::Path;
use std::sync::Arc;
use zarrs::array::{data_type, Array, ArrayBuilder};
use zarrs::array::ArraySubset;
use zarrs::config::MetadataRetrieveVersion;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::ReadableWritableListableStorageTraits;

pub type Store = Arc<FilesystemStore>;

/// Type alias for arrays in the store.
pub type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

type Attrs = Option<serde_json::Map<String, serde_json::Value>>;

pub fn open_store(root: &Path) -> Result<Store, Box<dyn std::error::Error>> {
    let store = FilesystemStore::new(root)?;
    Ok(Arc::new(store))
}

/// Open a Zarr v3 array. Rejects v2 data.
pub fn open_array(store: &Store, path: &str) -> Result<StoreArray, Box<dyn std::error::Error>> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let array = Array::open_opt(store_trait, path, &MetadataRetrieveVersion::V3)?;
    Ok(array)
}

/// Ensure every parent group of `array_path` exists, e.g. "/", "/q0.05" for
/// "/q0.05/cluster_index".
pub(crate) fn ensure_parent_groups(
    store: &Store,
    array_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let root = GroupBuilder::new().build(store_trait.clone(), "/")?;
    root.store_metadata()?;

    let parts: Vec<&str> = array_path
        .trim_matches('/')
        .split('/')
        .filter(|p| !p.is_empty())
        .collect();
    let mut prefix = String::new();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        prefix.push('/');
        prefix.push_str(part);
        let group = GroupBuilder::new().build(store_trait.clone(), &prefix)?;
        group.store_metadata()?;
    }
    Ok(())
}

/// Chunk shape for a (z, y, x) volume: whole planes, a slab of z at a time.
pub fn slab_chunks(shape: &[u64], slab: u64) -> Vec<u64> {
    let mut chunks = shape.to_vec();
    if let Some(z) = chunks.first_mut() {
        *z = (*z).clamp(1, slab.max(1));
    }
    chunks
}

pub fn create_array_u32(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Attrs,
) -> Result<StoreArray, Box<dyn std::error::Error>> {
    ensure_parent_groups(store, path)?;
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::uint32(), 0u32);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder.build(store_trait, path)?;
    array.store_metadata()?;
    Ok(array)
}

pub fn create_array_f32(
    store: &Store,
    path: &str,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    attrs: Attrs,
) -> Result<StoreArray, Box<dyn std::error::Error>> {
    ensure_parent_groups(store, path)?;
    let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
    let mut builder = ArrayBuilder::new(shape, chunks, data_type::float32(), 0.0f32);
    if let Some(a) = attrs {
        builder.attributes(a);
    }
    let array = builder.build(store_trait, path)?;
    array.store_metadata()?;
    Ok(array)
}

pub fn store_chunk_u32(
    array: &Array<impl zarrs::storage::WritableStorageTraits + ?Sized + 'static>,
    chunk_indices: &[u64],
    data: &[u32],
) -> Result<(), Box<dyn std::error::Error>> {
    array.store_chunk(chunk_indices, data)?;
    Ok(())
}

pub fn store_chunk_f32(
    array: &Array<impl zarrs::storage::WritableStorageTraits + ?Sized + 'static>,
    chunk_indices: &[u64],
    data: &[f32],
) -> Result<(), Box<dyn std::error::Error>> {
    array.store_chunk(chunk_indices, data)?;
    Ok(())
}

fn whole(array: &StoreArray) -> ArraySubset {
    ArraySubset::new_with_shape(array.shape().to_vec())
}

pub fn read_all_u32(array: &StoreArray) -> Result<Vec<u32>, Box<dyn std::error::Error>> {
    Ok(array.retrieve_array_subset::<Vec<u32>>(&whole(array))?)
}

pub fn read_all_u16(array: &StoreArray) -> Result<Vec<u16>, Box<dyn std::error::Error>> {
    Ok(array.retrieve_array_subset::<Vec<u16>>(&whole(array))?)
}

pub fn read_all_u8(array: &StoreArray) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    Ok(array.retrieve_array_subset::<Vec<u8>>(&whole(array))?)
}

pub fn read_all_f32(array: &StoreArray) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    Ok(array.retrieve_array_subset::<Vec<f32>>(&whole(array))?)
}

pub fn read_all_f64(array: &StoreArray) -> Result<Vec<f64>, Box<dyn std::error::Error>> {
    Ok(array.retrieve_array_subset::<Vec<f64>>(&whole(array))?)
}
