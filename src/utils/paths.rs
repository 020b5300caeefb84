//! Path key normalization
//!
//! Turns filesystem paths into keys that compare the same way on every run:
//! separators follow the host convention, the source root prefix is matched
//! case-insensitively, and the result is always relative to that root.

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Convert every `/` and `\` to the host separator.
pub fn normalize(path: &Path) -> PathBuf {
    PathBuf::from(normalize_str(&path.to_string_lossy()))
}

fn normalize_str(s: &str) -> String {
    s.chars()
        .map(|c| if is_separator(c) { MAIN_SEPARATOR } else { c })
        .collect()
}

/// Make a path absolute and drop `.`/`..` components without touching the
/// filesystem.
fn lexical_absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn comparable(path: &Path) -> String {
    normalize_str(&path.to_string_lossy())
        .trim_end_matches(is_separator)
        .to_string()
}

/// Strip `base` from `full` ignoring case. The match has to end on a
/// separator so `/srv/cs` never claims files under `/srv/cstrike`.
fn strip_prefix_ci(full: &str, base: &str) -> Option<String> {
    let head = full.get(..base.len())?;
    let tail = full.get(base.len()..)?;

    if head.to_lowercase() != base.to_lowercase() {
        return None;
    }
    if !tail.starts_with(is_separator) {
        return None;
    }

    let relative = tail.trim_start_matches(is_separator);
    if relative.is_empty() {
        None
    } else {
        Some(relative.to_string())
    }
}

/// Path of `full` relative to `base`, with host separators.
///
/// The lexical comparison handles trailing slashes, `.`/`..` segments and
/// casing differences. When that fails (a symlinked root, for instance) both
/// paths are canonicalized and compared again. `None` means the file does
/// not live under `base`; an absolute path is never returned.
pub fn relative_of(full: &Path, base: &Path) -> Option<String> {
    let full_lexical = comparable(&lexical_absolute(full));
    let base_lexical = comparable(&lexical_absolute(base));
    if let Some(relative) = strip_prefix_ci(&full_lexical, &base_lexical) {
        return Some(relative);
    }

    let full_canonical = std::fs::canonicalize(full).ok()?;
    let base_canonical = std::fs::canonicalize(base).ok()?;
    strip_prefix_ci(&comparable(&full_canonical), &comparable(&base_canonical))
}

/// `server:relative`
pub fn processed_key(server: &str, relative: &str) -> String {
    format!("{}:{}", server, relative)
}

/// Location of the compressed artifact for `relative` under `dest_root`:
/// the original file name keeps its extension and gains `.<suffix>`.
pub fn artifact_path(dest_root: &Path, relative: &str, suffix: &str) -> PathBuf {
    let mut path = dest_root.join(relative).into_os_string();
    path.push(".");
    path.push(suffix);
    PathBuf::from(path)
}
