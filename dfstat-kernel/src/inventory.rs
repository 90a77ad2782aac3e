//! Target inventory: which partitions to watch on which hosts.
//!
//! ```toml
//! [hosts]
//! spdr01 = ["/home", "/scratch"]
//! spdr02 = ["/"]
//! ```

use crate::error::ConfigError;
use crate::models::Targets;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

pub trait TargetSource: Send + Sync {
    fn list_targets(&self) -> Result<Targets, ConfigError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InventoryFile {
    #[serde(default)]
    hosts: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct TomlInventory {
    path: PathBuf,
}

impl TomlInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(&self, text: &str) -> Result<Targets, ConfigError> {
        let file: InventoryFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let mut targets = Targets::new();
        for (host, partitions) in file.hosts {
            let host = host.trim().to_string();
            if host.is_empty() {
                return Err(ConfigError::Invalid(format!("{}: empty host name", self.path.display())));
            }
            if let Some(bad) = partitions.iter().find(|p| !p.starts_with('/')) {
                return Err(ConfigError::Invalid(format!(
                    "{}: partition {bad:?} of {host} is not an absolute mount point",
                    self.path.display()
                )));
            }
            if partitions.is_empty() {
                warn!(%host, "inventory host has no partitions, skipping");
                continue;
            }
            targets.entry(host).or_default().extend(partitions);
        }
        Ok(targets)
    }
}

impl TargetSource for TomlInventory {
    fn list_targets(&self) -> Result<Targets, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfstat_devkit::TestWorkspace;

    #[test]
    fn test_reads_hosts_table() {
        let ws = TestWorkspace::new().unwrap();
        let path = ws
            .write_inventory("hosts.toml", &[("spdr01", &["/home", "/scratch", "/home"]), ("spdr02", &["/"])])
            .unwrap();

        let targets = TomlInventory::new(path).list_targets().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["spdr01"].len(), 2);
        assert!(targets["spdr02"].contains("/"));
    }

    #[test]
    fn test_hosts_without_partitions_are_skipped() {
        let ws = TestWorkspace::new().unwrap();
        let path = ws.write("hosts.toml", "[hosts]\nidle = []\nbusy = [\"/data\"]\n").unwrap();
        let targets = TomlInventory::new(path).list_targets().unwrap();
        assert_eq!(targets.keys().collect::<Vec<_>>(), vec!["busy"]);
    }

    #[test]
    fn test_relative_mount_rejected() {
        let ws = TestWorkspace::new().unwrap();
        let path = ws.write("hosts.toml", "[hosts]\nspdr01 = [\"home\"]\n").unwrap();
        assert!(matches!(
            TomlInventory::new(path).list_targets(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unreadable_inventory() {
        let ws = TestWorkspace::new().unwrap();
        assert!(matches!(
            TomlInventory::new(ws.file("nope.toml")).list_targets(),
            Err(ConfigError::Io { .. })
        ));
        let path = ws.write("broken.toml", "[hosts\n").unwrap();
        assert!(matches!(
            TomlInventory::new(path).list_targets(),
            Err(ConfigError::Parse { .. })
        ));
    }
}
