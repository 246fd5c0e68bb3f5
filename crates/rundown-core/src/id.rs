// Stable runbook IDs derived from source paths.
// For the whole operator set, IDs are the sha1 of the shortest reverse-path
// suffix that disambiguates every operator; pathless operators fall back to a
// random `r-` ID. The mapping is a function of the SET: IDs can only be
// assigned once all paths are known.

use std::path::Path;

use sha1::{Digest, Sha1};
use uuid::Uuid;

use rundown_common::errors::{Result, RundownError};

use crate::operator::Operator;

/// Assign stable IDs across one invocation's operator set.
pub fn generate_ids(ops: &mut [Operator]) -> Result<()> {
    let paths: Vec<Option<String>> = ops
        .iter()
        .map(|o| o.book_path().map(|p| absolute(p)))
        .collect();
    let ids = ids_for_paths(&paths)?;
    for (op, id) in ops.iter_mut().zip(ids) {
        op.id = id;
    }
    Ok(())
}

/// Pure form of the assignment, driven by paths alone.
pub fn ids_for_paths(paths: &[Option<String>]) -> Result<Vec<String>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }

    let reversed: Vec<Option<Vec<String>>> = paths
        .iter()
        .map(|p| p.as_ref().map(|p| reverse_segments(p)))
        .collect();
    let max = reversed.iter().flatten().map(Vec::len).max().unwrap_or(0);

    for k in 1..=max.max(1) {
        let ids: Vec<String> = reversed
            .iter()
            .map(|segments| match segments {
                Some(segments) => {
                    let take = k.min(segments.len());
                    hash_id(&segments[..take].join("/"))
                }
                None => random_id(),
            })
            .collect();

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        if unique.len() == ids.len() {
            return Ok(ids);
        }
    }

    Err(RundownError::InvalidBook {
        path: String::new(),
        message: "failed to generate unique runbook ids".to_string(),
    })
}

pub fn hash_id(input: &str) -> String {
    if input.is_empty() {
        return random_id();
    }
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fallback for operators with no source path.
pub fn random_id() -> String {
    let mut hasher = Sha1::new();
    hasher.update(Uuid::new_v4().to_string().as_bytes());
    format!("r-{}", hex::encode(hasher.finalize()))
}

fn absolute(path: &Path) -> String {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    // Normalise without touching the filesystem.
    let mut parts: Vec<String> = Vec::new();
    for comp in abs.components() {
        use std::path::Component;
        match comp {
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir => {}
            other => parts.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }
    parts.join("/")
}

fn reverse_segments(path: &str) -> Vec<String> {
    path.split('/').rev().filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn distinct_filenames_use_one_segment() {
        let ids = ids_for_paths(&[some("/a/book.yml"), some("/a/other.yml")]).unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        // One segment suffices, so the ID is the hash of the file name alone.
        assert_eq!(ids[0], hash_id("book.yml"));
    }

    #[test]
    fn same_filename_extends_the_suffix() {
        let ids = ids_for_paths(&[some("/a/book.yml"), some("/b/book.yml")]).unwrap();
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[0], hash_id("book.yml/a"));
        assert_eq!(ids[1], hash_id("book.yml/b"));
    }

    #[test]
    fn all_ids_distinct_for_distinct_paths() {
        let paths: Vec<Option<String>> = (0..20)
            .map(|i| some(&format!("/runbooks/set{}/book.yml", i)))
            .collect();
        let ids = ids_for_paths(&paths).unwrap();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn pathless_operators_get_random_prefixed_ids() {
        let ids = ids_for_paths(&[None, some("/a/book.yml")]).unwrap();
        assert!(ids[0].starts_with("r-"));
        assert!(!ids[1].starts_with("r-"));
    }

    #[test]
    fn ids_depend_on_the_set() {
        let alone = ids_for_paths(&[some("/a/book.yml")]).unwrap();
        let together = ids_for_paths(&[some("/a/book.yml"), some("/b/book.yml")]).unwrap();
        // Adding a colliding sibling changes the first operator's ID.
        assert_ne!(alone[0], together[0]);
    }
}
