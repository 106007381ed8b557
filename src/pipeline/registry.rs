//! Record of every file placed during a run.
//!
//! Placements are staged per post while a batch is in flight and become
//! visible only when the whole batch is committed, so pruning never sees
//! half of a post's fan-out.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::pipeline::naming::is_partial;

/// One post's filename under every directory it goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub post_id: u64,
    pub file_name: String,
    pub directories: BTreeSet<PathBuf>,
}

impl Placement {
    pub fn targets(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.directories.iter().map(|dir| dir.join(&self.file_name))
    }
}

#[derive(Debug, Default)]
pub struct PathRegistry {
    committed: HashMap<PathBuf, HashMap<String, PathBuf>>,
    staged: Vec<Placement>,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, placement: Placement) {
        self.staged.push(placement);
    }

    /// Drops a staged placement whose download did not happen.
    pub fn withdraw(&mut self, post_id: u64) {
        self.staged.retain(|p| p.post_id != post_id);
    }

    /// Makes every staged placement visible at once.
    pub fn commit(&mut self) {
        for placement in self.staged.drain(..) {
            for dir in &placement.directories {
                self.committed
                    .entry(dir.clone())
                    .or_default()
                    .insert(placement.file_name.clone(), dir.join(&placement.file_name));
            }
        }
    }

    pub fn discard_staged(&mut self) {
        self.staged.clear();
    }

    pub fn contains(&self, dir: &Path, file_name: &str) -> bool {
        self.committed
            .get(dir)
            .is_some_and(|files| files.contains_key(file_name))
    }

    pub fn len(&self) -> usize {
        self.committed.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes files directly inside `dirs` that were not registered this run.
    /// Side-car files are left for the recovery pass.
    pub fn prune<'a, I>(&self, dirs: I) -> io::Result<usize>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let mut removed = 0;
        for dir in dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if !entry.file_type()?.is_file() || is_partial(&path) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !self.contains(dir, &name) {
                    debug!(path = %path.display(), "Pruning undeclared file");
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!("Pruned {} files no longer wanted", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn placement(id: u64, dirs: &[&Path]) -> Placement {
        Placement {
            post_id: id,
            file_name: format!("{}.png", id),
            directories: dirs.iter().map(|d| d.to_path_buf()).collect(),
        }
    }

    #[test]
    fn test_staged_placements_are_invisible_until_commit() {
        let mut registry = PathRegistry::new();
        let a = Path::new("dl/A");
        let b = Path::new("dl/B");

        registry.stage(placement(1, &[a, b]));
        assert!(!registry.contains(a, "1.png"));

        registry.commit();
        assert!(registry.contains(a, "1.png"));
        assert!(registry.contains(b, "1.png"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_withdraw_and_discard() {
        let mut registry = PathRegistry::new();
        let a = Path::new("dl/A");

        registry.stage(placement(1, &[a]));
        registry.stage(placement(2, &[a]));
        registry.withdraw(1);
        registry.commit();
        assert!(!registry.contains(a, "1.png"));
        assert!(registry.contains(a, "2.png"));

        registry.stage(placement(3, &[a]));
        registry.discard_staged();
        registry.commit();
        assert!(!registry.contains(a, "3.png"));
    }

    #[test]
    fn test_prune_keeps_registered_and_partial_files() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("A");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("1.png"), b"keep").unwrap();
        fs::write(dir.join("2.png"), b"stale").unwrap();
        fs::write(dir.join("3.png.request"), b"partial").unwrap();

        let mut registry = PathRegistry::new();
        registry.stage(placement(1, &[dir.as_path()]));
        registry.commit();

        let missing = temp.path().join("missing");
        let removed = registry.prune([&dir, &missing]).unwrap();

        assert_eq!(removed, 1);
        assert!(dir.join("1.png").exists());
        assert!(!dir.join("2.png").exists());
        assert!(dir.join("3.png.request").exists());
    }
}
