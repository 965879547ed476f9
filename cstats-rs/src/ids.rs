//! Parse cluster ID selections like "all", "1,3", "5:9", ":4", "10:".
//! IDs are 1-based and ranges are inclusive; ranges are clipped to `1..=max_id`.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub fn parse_id_selection(s: &str, max_id: u32) -> Result<Vec<u32>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") {
        return Ok((1..=max_id).collect());
    }

    let mut ids = BTreeSet::new();
    for segment in s.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = segment.split_once(':') {
            let bound = |t: &str, default: u32| -> Result<u32> {
                let t = t.trim();
                if t.is_empty() {
                    Ok(default)
                } else {
                    t.parse()
                        .map_err(|_| Error::InvalidInput(format!("invalid id range {:?}", segment)))
                }
            };
            let lo = bound(lo, 1)?;
            let hi = bound(hi, u32::MAX)?;
            if lo > hi {
                return Err(Error::InvalidInput(format!("reversed id range {:?}", segment)));
            }
            ids.extend(lo.max(1)..=hi.min(max_id));
        } else {
            let id: u32 = segment
                .parse()
                .map_err(|_| Error::InvalidInput(format!("invalid cluster id {:?}", segment)))?;
            if id == 0 || id > max_id {
                return Err(Error::InvalidInput(format!(
                    "cluster id {} out of range 1..={}",
                    id, max_id
                )));
            }
            ids.insert(id);
        }
    }
    Ok(ids.into_iter().collect())
}

/// Read IDs separated by whitespace or commas, e.g. `valid_cluster_ids.txt`.
pub fn read_id_file(path: &Path) -> Result<Vec<u32>> {
    let text = fs::read_to_string(path)?;
    let mut ids = BTreeSet::new();
    for tok in text.split(|c: char| c.is_whitespace() || c == ',') {
        if tok.is_empty() {
            continue;
        }
        let id = tok
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid cluster id {:?} in {}", tok, path.display())))?;
        ids.insert(id);
    }
    Ok(ids.into_iter().collect())
}

pub fn write_id_file(path: &Path, ids: &[u32]) -> Result<()> {
    fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
    let line = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" ");
    fs::write(path, format!("{}\n", line))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_selects_every_id() {
        assert_eq!(parse_id_selection("ALL", 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(parse_id_selection("all", 0).unwrap().is_empty());
    }

    #[test]
    fn ranges_are_inclusive_and_clipped() {
        assert_eq!(parse_id_selection("2:4, 9", 10).unwrap(), vec![2, 3, 4, 9]);
        assert_eq!(parse_id_selection(":2", 10).unwrap(), vec![1, 2]);
        assert_eq!(parse_id_selection("8:", 10).unwrap(), vec![8, 9, 10]);
        assert_eq!(parse_id_selection("0:50", 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_id_selection("3,1,3", 3).unwrap(), vec![1, 3]);
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(parse_id_selection("11", 10).is_err());
        assert!(parse_id_selection("0", 10).is_err());
        assert!(parse_id_selection("a:3", 10).is_err());
        assert!(parse_id_selection("x", 10).is_err());
        assert!(matches!(parse_id_selection("9:5", 10), Err(Error::InvalidInput(_))));
        assert!(parse_id_selection("5:5", 10).is_ok());
    }

    #[test]
    fn id_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valid_cluster_ids.txt");
        write_id_file(&path, &[3, 1, 7]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "3 1 7\n");
        assert_eq!(read_id_file(&path).unwrap(), vec![1, 3, 7]);
    }
}
