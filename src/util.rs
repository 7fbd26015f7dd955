use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Normalize a workspace-relative path string independent of the host OS.
///
/// Backslashes become `/`, `.` segments and empty segments are dropped, and
/// `..` is resolved lexically. A leading `/` is discarded so that ids do not
/// depend on whether the collaborator handed over rooted or relative paths.
pub fn normalize_path_str(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Round half away from zero to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_str_handles_separators_and_dots() {
        assert_eq!(normalize_path_str("./src/lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path_str("src\\core\\graph.rs"), "src/core/graph.rs");
        assert_eq!(normalize_path_str("src//a/./b.rs"), "src/a/b.rs");
        assert_eq!(normalize_path_str("/src/a.rs"), "src/a.rs");
    }

    #[test]
    fn normalize_str_resolves_parent_segments() {
        assert_eq!(normalize_path_str("src/a/../b.rs"), "src/b.rs");
        assert_eq!(normalize_path_str("../shared/x.rs"), "../shared/x.rs");
        assert_eq!(normalize_path_str("a/../../x.rs"), "../x.rs");
    }

    #[test]
    fn normalize_str_empty_is_dot() {
        assert_eq!(normalize_path_str(""), ".");
        assert_eq!(normalize_path_str("./"), ".");
    }

    #[test]
    fn round_to_four_digits() {
        assert_eq!(round_to(0.123456, 4), 0.1235);
        assert_eq!(round_to(1.0, 4), 1.0);
        assert_eq!(round_to(0.00004, 4), 0.0);
    }
}
