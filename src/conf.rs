//! dnsmasq root configuration parsing.
//!
//! Reads the root `dnsmasq.conf` to find out where the lease file lives and
//! which directories and files contribute further configuration fragments.
//!
//! Recognized directives:
//!
//! - `dhcp-leasefile=<path>` (alias `dhcp-lease-file`): last value wins
//! - `conf-dir=<dir>[,<suffix>...]`: accumulated in order, duplicates kept
//! - `conf-file=<path>`: accumulated in order
//!
//! Everything else in the root file is left to the pool and static host
//! scanners, which read the root file along with the fragments.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fragment::FragmentFilter;

const LEASE_FILE_KEYS: [&str; 2] = ["dhcp-leasefile", "dhcp-lease-file"];
const CONF_DIR_KEY: &str = "conf-dir";
const CONF_FILE_KEY: &str = "conf-file";

/// One `key=value` line from a dnsmasq configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive<'a> {
    /// 1-based line number.
    pub line: usize,
    pub key: &'a str,
    /// Empty for flag directives such as `bogus-priv`.
    pub value: &'a str,
}

/// Iterates the directives of a dnsmasq configuration text.
///
/// Blank lines and `#` comments are skipped. Keys and values are trimmed.
pub fn directives(text: &str) -> impl Iterator<Item = Directive<'_>> {
    text.lines().enumerate().filter_map(|(index, raw)| {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (key, value) = line.split_once('=').unwrap_or((line, ""));
        Some(Directive {
            line: index + 1,
            key: key.trim(),
            value: value.trim(),
        })
    })
}

/// Maps paths found in dnsmasq configuration onto the local file system.
///
/// dnsmasq usually runs in another container, so absolute paths in its
/// configuration may need re-rooting under a mount point. Relative paths are
/// resolved against the directory of the file that declared them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMapper {
    root: Option<PathBuf>,
}

impl PathMapper {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Re-roots an absolute path under the mount prefix, if one is set.
    pub fn map_absolute(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_absolute() => {
                let relative: PathBuf = path
                    .components()
                    .filter(|component| {
                        !matches!(component, Component::RootDir | Component::Prefix(_))
                    })
                    .collect();
                root.join(relative)
            }
            _ => path.to_path_buf(),
        }
    }

    /// Resolves a raw path value declared in a file living in `base_dir`.
    pub fn resolve(&self, raw: &str, base_dir: &Path) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            self.map_absolute(path)
        } else {
            base_dir.join(path)
        }
    }
}

/// A `conf-dir` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfDir {
    pub path: PathBuf,
    pub filter: FragmentFilter,
}

/// The resolved shape of a dnsmasq configuration tree.
#[derive(Debug, Clone)]
pub struct ConfigTree {
    root: PathBuf,
    root_contents: String,
    lease_file: Option<PathBuf>,
    conf_dirs: Vec<ConfDir>,
    conf_files: Vec<PathBuf>,
}

impl ConfigTree {
    /// Reads and parses the root configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigNotFound`] if the file cannot be read. A missing
    /// lease-file directive is not an error here; see [`ConfigTree::lease_file`].
    pub fn resolve(root: &Path, mapper: &PathMapper) -> Result<Self> {
        let contents = std::fs::read_to_string(root).map_err(|source| Error::ConfigNotFound {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(root, contents, mapper))
    }

    /// Parses root configuration text that was already read from `root`.
    pub fn parse(root: &Path, contents: String, mapper: &PathMapper) -> Self {
        let base_dir = root.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let origin = root.display().to_string();

        let mut lease_file = None;
        let mut conf_dirs = Vec::new();
        let mut conf_files = Vec::new();

        for directive in directives(&contents) {
            if LEASE_FILE_KEYS.contains(&directive.key) {
                if directive.value.is_empty() {
                    warn!("{}:{}: empty {}", origin, directive.line, directive.key);
                    continue;
                }
                if let Some(previous) = &lease_file {
                    debug!(
                        "{}:{}: {} overrides earlier value {:?}",
                        origin, directive.line, directive.key, previous
                    );
                }
                lease_file = Some(mapper.resolve(directive.value, &base_dir));
            } else if directive.key == CONF_DIR_KEY {
                let mut parts = directive.value.split(',').map(str::trim);
                match parts.next().filter(|dir| !dir.is_empty()) {
                    Some(dir) => conf_dirs.push(ConfDir {
                        path: mapper.resolve(dir, &base_dir),
                        filter: FragmentFilter::from_suffixes(parts),
                    }),
                    None => warn!(
                        "{}",
                        Error::ParseSkipped {
                            origin: origin.clone(),
                            line: directive.line,
                            reason: "conf-dir without a directory".to_string(),
                        }
                    ),
                }
            } else if directive.key == CONF_FILE_KEY {
                if directive.value.is_empty() {
                    warn!("{}:{}: empty conf-file", origin, directive.line);
                    continue;
                }
                conf_files.push(mapper.resolve(directive.value, &base_dir));
            }
        }

        if lease_file.is_none() {
            warn!(
                "{}: no dhcp-leasefile directive, leases will not be available",
                origin
            );
        }

        Self {
            root: root.to_path_buf(),
            root_contents: contents,
            lease_file,
            conf_dirs,
            conf_files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_contents(&self) -> &str {
        &self.root_contents
    }

    /// Returns the lease file declared by the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigIncomplete`] when no `dhcp-leasefile` directive
    /// was found. Callers are expected to continue without leases.
    pub fn lease_file(&self) -> Result<&Path> {
        self.lease_file.as_deref().ok_or_else(|| {
            Error::ConfigIncomplete(format!(
                "{} declares no dhcp-leasefile",
                self.root.display()
            ))
        })
    }

    pub fn conf_dirs(&self) -> &[ConfDir] {
        &self.conf_dirs
    }

    pub fn conf_files(&self) -> &[PathBuf] {
        &self.conf_files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ConfigTree {
        ConfigTree::parse(
            Path::new("/etc/dnsmasq.conf"),
            text.to_string(),
            &PathMapper::default(),
        )
    }

    #[test]
    fn test_directives_skip_comments_and_blanks() {
        let text = "# header\n\n  dhcp-authoritative  \ndomain = lan \n#conf-dir=/x\n";
        let parsed: Vec<_> = directives(text).collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].key, "dhcp-authoritative");
        assert_eq!(parsed[0].value, "");
        assert_eq!(parsed[0].line, 3);
        assert_eq!(parsed[1].key, "domain");
        assert_eq!(parsed[1].value, "lan");
    }

    #[test]
    fn test_last_lease_file_wins() {
        let tree = parse(
            "dhcp-leasefile=/var/lib/misc/first.leases\n\
             dhcp-leasefile=/data/dnsmasq.leases\n",
        );
        assert_eq!(
            tree.lease_file().unwrap(),
            Path::new("/data/dnsmasq.leases")
        );
    }

    #[test]
    fn test_lease_file_alias() {
        let tree = parse("dhcp-lease-file=/data/alias.leases\n");
        assert_eq!(tree.lease_file().unwrap(), Path::new("/data/alias.leases"));
    }

    #[test]
    fn test_missing_lease_file_is_incomplete() {
        let tree = parse("conf-dir=/etc/dnsmasq.d\n");
        assert!(matches!(tree.lease_file(), Err(Error::ConfigIncomplete(_))));
        assert_eq!(tree.conf_dirs().len(), 1);
    }

    #[test]
    fn test_conf_dirs_accumulate_with_duplicates() {
        let tree = parse(
            "dhcp-leasefile=/data/dnsmasq.leases\n\
             conf-dir=/data/dnsmasq.d/,*.conf\n\
             conf-dir=/data/dnsmasq-static-generated.d/,*.conf\n\
             conf-dir=/data/dnsmasq.d/,*.conf\n",
        );
        let dirs: Vec<_> = tree.conf_dirs().iter().map(|dir| dir.path.clone()).collect();
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/data/dnsmasq.d/"),
                PathBuf::from("/data/dnsmasq-static-generated.d/"),
                PathBuf::from("/data/dnsmasq.d/"),
            ]
        );
        assert!(tree.conf_dirs()[0].filter.accepts("10-dhcp.conf"));
        assert!(!tree.conf_dirs()[0].filter.accepts("10-dhcp.bak"));
    }

    #[test]
    fn test_conf_dir_exclude_suffix() {
        let tree = parse("conf-dir=/etc/dnsmasq.d,.bak,.orig\n");
        let filter = &tree.conf_dirs()[0].filter;
        assert!(filter.accepts("hosts"));
        assert!(!filter.accepts("hosts.bak"));
        assert!(!filter.accepts("hosts.orig"));
    }

    #[test]
    fn test_empty_conf_dir_skipped() {
        let tree = parse("conf-dir=\nconf-dir=,*.conf\n");
        assert!(tree.conf_dirs().is_empty());
    }

    #[test]
    fn test_conf_file_and_relative_paths() {
        let tree = parse(
            "dhcp-leasefile=./leases/dnsmasq.leases\n\
             conf-file=extra.conf\n\
             conf-dir=dnsmasq.d\n",
        );
        assert_eq!(
            tree.lease_file().unwrap(),
            Path::new("/etc/./leases/dnsmasq.leases")
        );
        assert_eq!(tree.conf_files(), &[PathBuf::from("/etc/extra.conf")]);
        assert_eq!(tree.conf_dirs()[0].path, PathBuf::from("/etc/dnsmasq.d"));
    }

    #[test]
    fn test_path_mapper_reroots_absolute_paths() {
        let mapper = PathMapper::new(Some(PathBuf::from("/srv/mount")));
        assert_eq!(
            mapper.resolve("/data/dnsmasq.leases", Path::new("/etc")),
            PathBuf::from("/srv/mount/data/dnsmasq.leases")
        );
        assert_eq!(
            mapper.resolve("relative.conf", Path::new("/srv/mount/etc")),
            PathBuf::from("/srv/mount/etc/relative.conf")
        );
        assert_eq!(
            PathMapper::default().map_absolute(Path::new("/data/x")),
            PathBuf::from("/data/x")
        );
    }

    #[test]
    fn test_resolve_missing_root_is_config_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("dnsmasq.conf");
        let result = ConfigTree::resolve(&missing, &PathMapper::default());
        assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
    }

    #[test]
    fn test_resolve_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dnsmasq.conf");
        std::fs::write(&root, "dhcp-leasefile=dnsmasq.leases\n").unwrap();

        let tree = ConfigTree::resolve(&root, &PathMapper::default()).unwrap();
        assert_eq!(tree.lease_file().unwrap(), dir.path().join("dnsmasq.leases"));
        assert!(tree.root_contents().contains("dhcp-leasefile"));
    }
}
