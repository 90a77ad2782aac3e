/*!
Temporary workspace for daemon and relay tests

Creates a scratch directory holding the files a deployment would have
(`dfstat.toml`, `hosts.toml`, the SQLite file) so config loading and
reload paths run against the real filesystem.
*/

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch directory removed on drop.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok();
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of a file inside the workspace (not created).
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write arbitrary text, returning the absolute path.
    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.file(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        log::info!("[workspace] wrote {}", path.display());
        Ok(path)
    }

    /// Write an inventory file: `[hosts]` table of host -> partitions.
    pub fn write_inventory(&self, name: &str, hosts: &[(&str, &[&str])]) -> Result<PathBuf> {
        #[derive(serde::Serialize)]
        struct Inventory<'a> {
            hosts: BTreeMap<&'a str, Vec<&'a str>>,
        }

        let inventory = Inventory {
            hosts: hosts.iter().map(|(h, parts)| (*h, parts.to_vec())).collect(),
        };
        self.write(name, &toml::to_string_pretty(&inventory)?)
    }

    /// Write a minimal daemon config pointing at files inside this workspace.
    pub fn write_daemon_config(&self, name: &str, inventory: &str, extra: &str) -> Result<PathBuf> {
        let contents = format!(
            "[store]\npath = \"{}\"\n\n[inventory]\npath = \"{}\"\n\n{}\n",
            self.file("dfstat.db").display(),
            self.file(inventory).display(),
            extra
        );
        self.write(name, &contents)
    }
}
