use serde::Serialize;
use std::fs;
use std::path::Path;

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))
}

/// Write serializable rows as CSV with a header taken from the row type.
/// An empty row set still produces the file (header only when `header` is given).
pub fn write_csv<T: Serialize>(
    path: &Path,
    rows: &[T],
    header: Option<&[&str]>,
) -> Result<(), Box<dyn std::error::Error>> {
    ensure_parent(path)?;
    if rows.is_empty() {
        let line = header.map(|h| h.join(",")).unwrap_or_default();
        fs::write(path, format!("{}\n", line))?;
        return Ok(());
    }
    let mut wtr = csv::Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Record the parameters a subcommand ran with next to its outputs.
pub fn write_params<T: Serialize>(dir: &Path, params: &T) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(params)?;
    fs::write(dir.join("params.json"), json)?;
    Ok(())
}
