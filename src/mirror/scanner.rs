use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Used when the configured list yields no usable extension
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".nav", ".bsp", ".mdl", ".phy", ".vvd", ".vtf", ".vmt", ".wav", ".mp3", ".vtx",
];

/// Lowercase, dot-prefixed extensions. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSet {
    extensions: BTreeSet<String>,
}

impl ExtensionSet {
    /// Parse a comma-separated list such as `bsp, .NAV,dx90.vtx`.
    pub fn parse(list: &str) -> Self {
        let extensions: BTreeSet<String> = list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty() && *t != ".")
            .map(|t| {
                let t = t.to_lowercase();
                if t.starts_with('.') {
                    t
                } else {
                    format!(".{}", t)
                }
            })
            .collect();

        if extensions.is_empty() {
            return Self::default();
        }
        Self { extensions }
    }

    /// Case-insensitive suffix match on the file name, so compound entries
    /// like `.dx90.vtx` work too.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy().to_lowercase();
        self.extensions
            .iter()
            .any(|ext| name.len() > ext.len() && name.ends_with(ext.as_str()))
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }
}

impl Default for ExtensionSet {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

pub struct FileScanner<'a> {
    extensions: &'a ExtensionSet,
}

impl<'a> FileScanner<'a> {
    pub fn new(extensions: &'a ExtensionSet) -> Self {
        Self { extensions }
    }

    /// Every matching regular file under `root`, sorted.
    ///
    /// A missing root yields an empty list. Unreadable entries are skipped.
    pub fn scan(&self, root: &Path) -> Vec<PathBuf> {
        self.scan_with_total(root).0
    }

    /// Like [`scan`](Self::scan), plus the count of every regular file seen.
    pub fn scan_with_total(&self, root: &Path) -> (Vec<PathBuf>, usize) {
        if !root.is_dir() {
            warn!("Directory not found: {}", root.display());
            return (Vec::new(), 0);
        }

        let mut files = Vec::new();
        let mut total = 0usize;
        let mut unreadable = 0usize;

        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    unreadable += 1;
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            total += 1;
            if self.extensions.matches(entry.path()) {
                files.push(entry.into_path());
            }
        }

        if unreadable > 0 {
            warn!("Skipped {} unreadable entries under {}", unreadable, root.display());
        }

        files.sort();
        info!("Found {} matching files in {}", files.len(), root.display());
        (files, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse_normalizes_entries() {
        let set = ExtensionSet::parse(" BSP, .nav ,,dx90.vtx, .");
        let entries: Vec<&str> = set.iter().collect();
        assert_eq!(entries, vec![".bsp", ".dx90.vtx", ".nav"]);
    }

    #[test]
    fn test_empty_list_uses_defaults() {
        let set = ExtensionSet::parse(" , ,");
        assert_eq!(set, ExtensionSet::default());
        assert_eq!(set.len(), DEFAULT_EXTENSIONS.len());
    }

    #[test]
    fn test_extension_filtering_is_case_insensitive() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.bsp"), b"a").unwrap();
        fs::write(temp.path().join("b.txt"), b"b").unwrap();
        fs::write(temp.path().join("c.BSP"), b"c").unwrap();

        let extensions = ExtensionSet::parse("bsp");
        let files = FileScanner::new(&extensions).scan(temp.path());
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(names, vec!["a.bsp", "c.BSP"]);
    }

    #[test]
    fn test_scan_recurses_and_matches_compound_extensions() {
        let temp = TempDir::new().unwrap();
        let models = temp.path().join("models").join("props");
        fs::create_dir_all(&models).unwrap();
        fs::write(models.join("crate.dx90.vtx"), b"v").unwrap();
        fs::write(models.join("crate.mdl"), b"m").unwrap();
        fs::write(models.join("crate.dx80.vtx"), b"v").unwrap();

        let extensions = ExtensionSet::parse("dx90.vtx,mdl");
        let (files, total) = FileScanner::new(&extensions).scan_with_total(temp.path());
        assert_eq!(files, vec![models.join("crate.dx90.vtx"), models.join("crate.mdl")]);
        assert_eq!(total, 3);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        let extensions = ExtensionSet::default();
        let files = FileScanner::new(&extensions).scan(&temp.path().join("missing"));
        assert!(files.is_empty());
    }

    #[test]
    fn test_bare_extension_name_does_not_match() {
        let extensions = ExtensionSet::parse("bsp");
        assert!(!extensions.matches(Path::new("/srv/.bsp")));
        assert!(extensions.matches(Path::new("/srv/x.bsp")));
    }
}
