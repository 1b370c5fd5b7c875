//! Lookup environment negotiated by the startup handshake.
//!
//! The caller sends four lines: a path separator, the search paths joined by
//! that separator, an execution prefix and a base prefix. Search paths are
//! used to resolve relative request paths.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub separator: String,
    pub search_path: String,
    pub exec_prefix: String,
    pub prefix: String,
}

impl Handshake {
    pub fn from_lines(lines: [String; 4]) -> Self {
        let [separator, search_path, exec_prefix, prefix] = lines;
        Handshake {
            separator,
            search_path,
            exec_prefix,
            prefix,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LookupEnv {
    search_paths: Vec<PathBuf>,
    exec_prefix: Option<PathBuf>,
    prefix: Option<PathBuf>,
}

impl LookupEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn exec_prefix(&self) -> Option<&Path> {
        self.exec_prefix.as_deref()
    }

    pub fn prefix(&self) -> Option<&Path> {
        self.prefix.as_deref()
    }

    /// Applies a handshake. An empty separator leaves the environment as it
    /// is. On error the parts that did validate stay applied.
    pub fn apply(&mut self, handshake: &Handshake) -> Result<()> {
        let separator = handshake.separator.as_str();
        if separator.is_empty() {
            debug!("empty separator, lookup environment left untouched");
            return Ok(());
        }
        if separator.chars().count() != 1 {
            bail!("path separator must be a single character, got {separator:?}");
        }

        let added: Vec<PathBuf> = handshake
            .search_path
            .split(separator)
            .filter(|segment| !segment.is_empty())
            .map(PathBuf::from)
            .collect();
        debug!(count = added.len(), "search paths added");
        self.search_paths.extend(added);

        let mut invalid = Vec::new();
        for (label, raw, slot) in [
            ("exec prefix", &handshake.exec_prefix, &mut self.exec_prefix),
            ("prefix", &handshake.prefix, &mut self.prefix),
        ] {
            if raw.is_empty() {
                continue;
            }
            let path = PathBuf::from(raw);
            if path.is_dir() {
                *slot = Some(path);
            } else {
                warn!(%raw, "{label} is not a directory");
                invalid.push(format!("{label} {raw}"));
            }
        }
        if !invalid.is_empty() {
            bail!("not a directory: {}", invalid.join(", "));
        }
        Ok(())
    }

    /// Existing file a request line refers to. Relative paths are tried
    /// against each search path in order, then the exec prefix and the
    /// prefix, then the working directory.
    pub fn resolve(&self, request: &str) -> Option<PathBuf> {
        let requested = Path::new(request);
        if requested.is_absolute() {
            return requested.exists().then(|| requested.to_path_buf());
        }
        self.search_paths
            .iter()
            .map(PathBuf::as_path)
            .chain(self.exec_prefix())
            .chain(self.prefix())
            .map(|base| base.join(requested))
            .find(|candidate| candidate.exists())
            .or_else(|| requested.exists().then(|| requested.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::fixtures::temp_dir;

    fn handshake(separator: &str, search_path: &str, exec_prefix: &str, prefix: &str) -> Handshake {
        Handshake::from_lines([
            separator.to_string(),
            search_path.to_string(),
            exec_prefix.to_string(),
            prefix.to_string(),
        ])
    }

    #[test]
    fn empty_separator_leaves_environment_untouched() {
        let mut env = LookupEnv::new();
        env.apply(&handshake("", "/a:/b", "/nope", "/nope")).unwrap();
        assert!(env.search_paths().is_empty());
        assert!(env.prefix().is_none());
    }

    #[test]
    fn search_path_is_split_and_empty_segments_dropped() {
        let mut env = LookupEnv::new();
        env.apply(&handshake(":", "/a::/b:", "", "")).unwrap();
        assert_eq!(
            env.search_paths(),
            &[PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn long_separator_is_rejected() {
        let mut env = LookupEnv::new();
        assert!(env.apply(&handshake("::", "/a", "", "")).is_err());
        assert!(env.search_paths().is_empty());
    }

    #[test]
    fn missing_prefix_degrades_but_keeps_search_paths() {
        let base = temp_dir("prefix");
        let mut env = LookupEnv::new();
        let err = env
            .apply(&handshake(
                ";",
                "/lib",
                base.to_str().unwrap(),
                "/definitely/not/here",
            ))
            .unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here"));
        assert_eq!(env.search_paths(), &[PathBuf::from("/lib")]);
        assert_eq!(env.exec_prefix(), Some(base.as_path()));
        assert!(env.prefix().is_none());
    }

    #[test]
    fn relative_requests_use_search_paths_first() {
        let first = temp_dir("first");
        let second = temp_dir("second");
        std::fs::write(second.join("mod.py"), "x = 1\n").unwrap();

        let mut env = LookupEnv::new();
        let joined = format!("{}|{}", first.display(), second.display());
        env.apply(&handshake("|", &joined, "", "")).unwrap();

        assert_eq!(env.resolve("mod.py"), Some(second.join("mod.py")));
        assert_eq!(env.resolve("absent.py"), None);

        let absolute = second.join("mod.py");
        assert_eq!(
            env.resolve(absolute.to_str().unwrap()),
            Some(absolute.clone())
        );
        assert_eq!(env.resolve(first.join("mod.py").to_str().unwrap()), None);
    }

    #[test]
    fn prefixes_resolve_after_search_paths() {
        let search = temp_dir("search");
        let exec_prefix = temp_dir("exec_prefix");
        let prefix = temp_dir("base_prefix");
        std::fs::create_dir_all(exec_prefix.join("lib")).unwrap();
        std::fs::create_dir_all(prefix.join("lib")).unwrap();
        std::fs::write(exec_prefix.join("lib/site.py"), "x = 1\n").unwrap();
        std::fs::write(prefix.join("lib/site.py"), "x = 2\n").unwrap();
        std::fs::write(prefix.join("lib/base.py"), "x = 3\n").unwrap();

        let mut env = LookupEnv::new();
        env.apply(&handshake(
            ":",
            search.to_str().unwrap(),
            exec_prefix.to_str().unwrap(),
            prefix.to_str().unwrap(),
        ))
        .unwrap();

        assert_eq!(env.resolve("lib/site.py"), Some(exec_prefix.join("lib/site.py")));
        assert_eq!(env.resolve("lib/base.py"), Some(prefix.join("lib/base.py")));

        std::fs::write(search.join("lib.py"), "x = 4\n").unwrap();
        assert_eq!(env.resolve("lib.py"), Some(search.join("lib.py")));
    }
}
