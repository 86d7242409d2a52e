//! Configuration fragment discovery and loading.
//!
//! Expands the `conf-dir` and `conf-file` declarations of a [`ConfigTree`]
//! into a concrete list of files, mirroring dnsmasq's own inclusion rules:
//! names ending in `~`, starting with `.`, or both starting and ending with
//! `#` are never read. A `conf-dir` may narrow this further with `*.<suffix>`
//! include patterns or plain exclude suffixes.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::conf::{ConfDir, ConfigTree};
use crate::error::{Error, Result};

/// Returns true for names dnsmasq skips regardless of any suffix filter.
pub fn is_default_excluded(name: &str) -> bool {
    name.ends_with('~') || name.starts_with('.') || (name.starts_with('#') && name.ends_with('#'))
}

/// Suffix rules attached to one `conf-dir` declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl FragmentFilter {
    /// Builds a filter from the suffix list of a `conf-dir` directive.
    ///
    /// `*.conf` includes only names ending in `.conf`; any other entry such
    /// as `.bak` excludes names ending in it.
    pub fn from_suffixes<'a, I>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut filter = Self::default();
        for suffix in suffixes.into_iter().map(str::trim) {
            if suffix.is_empty() {
                continue;
            }
            match suffix.strip_prefix('*') {
                Some(include) if !include.is_empty() => filter.include.push(include.to_string()),
                Some(_) => {}
                None => filter.exclude.push(suffix.to_string()),
            }
        }
        filter
    }

    /// Returns a copy whose include suffixes are replaced by `suffixes`.
    pub fn with_include_override(&self, suffixes: &[String]) -> Self {
        Self {
            include: suffixes
                .iter()
                .map(|suffix| suffix.trim().trim_start_matches('*').to_string())
                .filter(|suffix| !suffix.is_empty())
                .collect(),
            exclude: self.exclude.clone(),
        }
    }

    pub fn accepts(&self, name: &str) -> bool {
        if is_default_excluded(name) {
            return false;
        }
        if self.exclude.iter().any(|suffix| name.ends_with(suffix.as_str())) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|suffix| name.ends_with(suffix.as_str()))
    }
}

/// One configuration file and its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub path: PathBuf,
    pub contents: String,
}

impl Fragment {
    /// Short label used in log messages.
    pub fn origin(&self) -> String {
        self.path.display().to_string()
    }
}

/// The root file followed by every readable fragment, in scan order.
#[derive(Debug, Clone, Default)]
pub struct FragmentSet {
    fragments: Vec<Fragment>,
}

impl FragmentSet {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self { fragments }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.fragments.iter().map(|fragment| fragment.path.as_path()).collect()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Expands a [`ConfigTree`] into fragment files.
#[derive(Debug, Clone, Default)]
pub struct FragmentLoader {
    extension_override: Option<Vec<String>>,
}

impl FragmentLoader {
    /// Creates a loader. When `extension_override` is set it replaces the
    /// include suffixes of every `conf-dir`.
    pub fn new(extension_override: Option<Vec<String>>) -> Self {
        Self { extension_override }
    }

    /// Lists the accepted files of one directory in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FragmentUnreadable`] if the directory cannot be listed.
    pub fn list_dir(&self, dir: &ConfDir) -> Result<Vec<PathBuf>> {
        let filter = match &self.extension_override {
            Some(suffixes) => dir.filter.with_include_override(suffixes),
            None => dir.filter.clone(),
        };

        let unreadable = |source| Error::FragmentUnreadable {
            path: dir.path.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir.path).map_err(unreadable)? {
            let entry = entry.map_err(unreadable)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!("Skipping non UTF-8 fragment name {:?}", name);
                continue;
            };
            if !filter.accepts(name) {
                debug!("Filtered out fragment {}", entry.path().display());
                continue;
            }
            // Follows symlinks, so linked fragments are still read.
            if std::fs::metadata(entry.path()).is_ok_and(|meta| meta.is_file()) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Lists every fragment path of the tree, in scan order.
    ///
    /// Unreadable directories are logged and skipped.
    pub fn list(&self, tree: &ConfigTree) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for dir in tree.conf_dirs() {
            match self.list_dir(dir) {
                Ok(files) => paths.extend(files),
                Err(error) => warn!("{}", error),
            }
        }
        paths.extend(tree.conf_files().iter().cloned());
        paths
    }

    /// Reads the root file and every fragment into a [`FragmentSet`].
    ///
    /// Unreadable fragments are logged and skipped.
    pub fn load(&self, tree: &ConfigTree) -> FragmentSet {
        let mut fragments = vec![Fragment {
            path: tree.root().to_path_buf(),
            contents: tree.root_contents().to_string(),
        }];

        for path in self.list(tree) {
            match std::fs::read_to_string(&path) {
                Ok(contents) => fragments.push(Fragment { path, contents }),
                Err(source) => warn!("{}", Error::FragmentUnreadable { path, source }),
            }
        }

        debug!("Loaded {} configuration files", fragments.len());
        FragmentSet::new(fragments)
    }
}
