use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const TMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = ".backup";

/// Keys of files that already have an artifact in the mirror.
///
/// Membership ignores case. Iteration is sorted by the upper-cased key
/// (ordinal, ignoring case), which is also the on-disk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedSet {
    // upper-cased key -> key as first seen
    entries: BTreeMap<String, String>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_uppercase())
    }

    /// Returns `false` if an equal key (ignoring case) was already present.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        match self.entries.entry(key.to_uppercase()) {
            Entry::Vacant(slot) => {
                slot.insert(key);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ProcessedSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read processed list {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to create processed list {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    WriteTemp { path: PathBuf, source: io::Error },

    #[error("failed to back up {path}: {source}")]
    Backup { path: PathBuf, source: io::Error },

    #[error("failed to replace {path}: {source}")]
    Replace { path: PathBuf, source: io::Error },
}

/// Line-oriented file holding a [`ProcessedSet`].
///
/// Saves go through `<file>.tmp` and keep `<file>.backup` until the rename
/// succeeds, so an interrupted save leaves the previous list readable.
#[derive(Debug, Clone)]
pub struct ProcessedStore {
    path: PathBuf,
}

impl ProcessedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }

    pub fn load(&self) -> Result<ProcessedSet, StoreError> {
        if self.path.exists() {
            let set = read_set(&self.path)?;
            info!("Loaded {} processed entries from {}", set.len(), self.path.display());
            return Ok(set);
        }

        // A save interrupted between backup and rename leaves only the backup
        let backup = self.sibling(BACKUP_SUFFIX);
        if backup.exists() {
            warn!(
                "Processed list {} missing, recovering from {}",
                self.path.display(),
                backup.display()
            );
            return read_set(&backup);
        }

        info!("Processed files list not found, creating {}", self.path.display());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Create {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        File::create(&self.path).map_err(|source| StoreError::Create {
            path: self.path.clone(),
            source,
        })?;

        Ok(ProcessedSet::new())
    }

    pub fn save(&self, set: &ProcessedSet) -> Result<(), StoreError> {
        let tmp = self.sibling(TMP_SUFFIX);
        if let Err(source) = write_set(&tmp, set) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::WriteTemp { path: tmp, source });
        }

        let backup = self.sibling(BACKUP_SUFFIX);
        let had_previous = self.path.exists();
        if had_previous {
            if let Err(source) = fs::copy(&self.path, &backup) {
                let _ = fs::remove_file(&tmp);
                return Err(StoreError::Backup {
                    path: self.path.clone(),
                    source,
                });
            }
        }

        if let Err(source) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            if had_previous {
                if let Err(e) = fs::copy(&backup, &self.path) {
                    error!("Failed to restore {} from backup: {}", self.path.display(), e);
                }
            }
            return Err(StoreError::Replace {
                path: self.path.clone(),
                source,
            });
        }

        if had_previous {
            if let Err(e) = fs::remove_file(&backup) {
                debug!("Could not remove {}: {}", backup.display(), e);
            }
        }

        debug!("Saved {} processed entries to {}", set.len(), self.path.display());
        Ok(())
    }
}

fn read_set(path: &Path) -> Result<ProcessedSet, StoreError> {
    let content = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect())
}

fn write_set(path: &Path, set: &ProcessedSet) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for key in set.iter() {
        writeln!(writer, "{}", key)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_is_case_insensitive() {
        let mut set = ProcessedSet::new();
        assert!(set.insert("cstrike:maps/De_Dust2.bsp"));
        assert!(!set.insert("CSTRIKE:maps/de_dust2.BSP"));
        assert!(set.contains("cstrike:MAPS/de_dust2.bsp"));
        assert_eq!(set.len(), 1);
        // First spelling wins
        assert_eq!(set.iter().next(), Some("cstrike:maps/De_Dust2.bsp"));
    }

    #[test]
    fn test_load_creates_missing_file() {
        let temp = TempDir::new().unwrap();
        let store = ProcessedStore::new(temp.path().join("state").join("processed.txt"));

        let set = store.load().unwrap();
        assert!(set.is_empty());
        assert!(store.path().exists());
    }

    #[test]
    fn test_load_trims_and_skips_blank_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("processed.txt");
        fs::write(&path, "  b:two.bsp \n\n\na:one.bsp\r\nA:ONE.BSP\n   \n").unwrap();

        let set = ProcessedStore::new(&path).load().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("a:one.bsp"));
        assert!(set.contains("b:two.bsp"));
    }

    #[test]
    fn test_save_writes_sorted_and_cleans_siblings() {
        let temp = TempDir::new().unwrap();
        let store = ProcessedStore::new(temp.path().join("processed.txt"));
        store.save(&ProcessedSet::from_iter(["old:x.bsp"])).unwrap();

        let set: ProcessedSet = ["tf:maps/b.bsp", "cstrike:Maps/z.bsp", "cstrike:maps/a.bsp"]
            .into_iter()
            .collect();
        store.save(&set).unwrap();

        let written = fs::read_to_string(store.path()).unwrap();
        assert_eq!(written, "cstrike:maps/a.bsp\ncstrike:Maps/z.bsp\ntf:maps/b.bsp\n");
        assert!(!store.sibling(TMP_SUFFIX).exists());
        assert!(!store.sibling(BACKUP_SUFFIX).exists());
        assert_eq!(store.load().unwrap(), set);
    }

    #[test]
    fn test_order_compares_upper_cased_keys() {
        // '_' sits between 'Z' and 'a', so it sorts after letters
        let set: ProcessedSet = ["tf:maps/a_b.bsp", "tf:maps/aZ.bsp", "tf:maps/AA.bsp"].into_iter().collect();
        let order: Vec<&str> = set.iter().collect();
        assert_eq!(order, vec!["tf:maps/AA.bsp", "tf:maps/aZ.bsp", "tf:maps/a_b.bsp"]);
    }

    #[test]
    fn test_failed_save_keeps_previous_file() {
        let temp = TempDir::new().unwrap();
        let store = ProcessedStore::new(temp.path().join("processed.txt"));
        let original: ProcessedSet = ["cstrike:maps/a.bsp", "cstrike:maps/b.bsp"].into_iter().collect();
        store.save(&original).unwrap();

        // A directory squatting on the temp path makes the write fail midway
        fs::create_dir(store.sibling(TMP_SUFFIX)).unwrap();
        let mut grown = original.clone();
        grown.insert("cstrike:maps/c.bsp");

        let result = store.save(&grown);
        assert!(matches!(result, Err(StoreError::WriteTemp { .. })));
        assert_eq!(store.load().unwrap(), original);
    }

    #[test]
    fn test_load_recovers_from_backup() {
        let temp = TempDir::new().unwrap();
        let store = ProcessedStore::new(temp.path().join("processed.txt"));
        fs::write(store.sibling(BACKUP_SUFFIX), "hl2mp:maps/dm_lockdown.bsp\n").unwrap();

        let set = store.load().unwrap();
        assert!(set.contains("hl2mp:maps/dm_lockdown.bsp"));
    }
}
