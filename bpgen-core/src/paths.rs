use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Canonical form for build-relative paths: `/` separators, no empty or `.`
/// components, no leading `./` and no trailing `/`.
pub fn normalize_rel_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative paths excluded from a build.
#[derive(Clone, Debug, Default)]
pub struct IgnoreList {
    entries: HashSet<String>,
}

impl IgnoreList {
    /// Read one path per line. No file means nothing is ignored; a file that
    /// is configured but unreadable is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read ignore list {:?}", path))?;
        Ok(Self::from_lines(text.lines()))
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = lines
            .into_iter()
            .map(|l| normalize_rel_path(l.trim()))
            .filter(|l| !l.is_empty())
            .collect();
        Self { entries }
    }

    pub fn is_ignored(&self, rel: &str) -> bool {
        !self.entries.is_empty() && self.entries.contains(&normalize_rel_path(rel))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PathPolicy {
    pub follow_symlinks: bool,
}

/// Resolve a manifest path under `root`. Absolute paths and `..` are
/// rejected. Symlinks are rejected unless `follow_symlinks` is set, in which
/// case the resolved target must stay under `root`.
pub fn resolve_under(root: &Path, rel: &str, policy: PathPolicy) -> Result<PathBuf> {
    let rel = Path::new(rel);
    if rel.is_absolute() || rel.has_root() {
        bail!("absolute paths are not allowed: {:?}", rel);
    }
    for comp in rel.components() {
        match comp {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => bail!("parent traversal not allowed: {:?}", rel),
            _ => bail!("unsupported path component in {:?}", rel),
        }
    }
    let candidate = root.join(rel);
    if policy.follow_symlinks {
        let root_can =
            std::fs::canonicalize(root).with_context(|| format!("canonicalize {:?}", root))?;
        let cand_can = std::fs::canonicalize(&candidate)
            .with_context(|| format!("canonicalize {:?}", candidate))?;
        if !cand_can.starts_with(&root_can) {
            bail!("path escapes root: {:?}", rel);
        }
        return Ok(cand_can);
    }
    let mut cur = root.to_path_buf();
    for comp in rel.components() {
        cur.push(comp);
        if let Ok(m) = std::fs::symlink_metadata(&cur) {
            if m.file_type().is_symlink() {
                bail!("symlink in path (not following): {:?}", cur);
            }
        }
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_rel_path("./a//b/./c/"), "a/b/c");
        assert_eq!(normalize_rel_path(r"bin\win64\game.exe"), "bin/win64/game.exe");
        assert_eq!(normalize_rel_path("."), "");
    }

    #[test]
    fn ignore_list_matches_exactly_after_normalization() {
        let ig = IgnoreList::from_lines("./logs/run.txt\r\n\n  \nbin\\tool.exe\n".lines());
        assert_eq!(ig.len(), 2);
        assert!(ig.is_ignored("logs/run.txt"));
        assert!(ig.is_ignored("bin/tool.exe"));
        assert!(!ig.is_ignored("logs"));
        assert!(!ig.is_ignored("logs/run.txt.bak"));
    }

    #[test]
    fn missing_ignore_file_is_an_error_only_when_configured() {
        assert!(IgnoreList::load(None).unwrap().is_empty());
        let td = tempfile::tempdir().unwrap();
        assert!(IgnoreList::load(Some(&td.path().join("absent.txt"))).is_err());
    }

    #[test]
    fn traversal_and_absolute_paths_are_rejected() {
        let td = tempfile::tempdir().unwrap();
        let pol = PathPolicy::default();
        assert!(resolve_under(td.path(), "../x", pol).is_err());
        assert!(resolve_under(td.path(), "/etc/passwd", pol).is_err());
        assert_eq!(resolve_under(td.path(), "a/b", pol).unwrap(), td.path().join("a/b"));
    }
}
