//! Persistent set of known peer addresses (spec.md §3 "Neighbor record",
//! §6 "Persisted state").
//!
//! Stored as `neighbors.txt` under the data path: one `ip:port` per line,
//! `#`-prefixed comment lines ignored, rewritten atomically (write-temp +
//! rename) on every change.

use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use communicatord_common::logging::Logger;

/// In-memory neighbor set, backed by an on-disk file.
///
/// Invariant (spec.md §3): callers are expected to keep this set a superset
/// of the addresses of all live outbound-peer endpoints; this type itself
/// only owns the persisted set and does not track connection liveness.
pub struct NeighborStore {
    path: PathBuf,
    neighbors: BTreeSet<SocketAddr>,
    logger: Logger,
}

impl NeighborStore {
    /// Load the neighbor set from `path`, creating an empty in-memory set if
    /// the file does not yet exist.
    pub fn load(path: impl Into<PathBuf>, logger: Logger) -> io::Result<Self> {
        let path = path.into();
        let neighbors = match std::fs::read_to_string(&path) {
            Ok(contents) => parse_neighbors_file(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            neighbors,
            logger,
        })
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.neighbors.contains(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.neighbors.iter()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Add `addr`, persisting the change if it is new. Returns `true` if
    /// the set changed.
    pub fn add(&mut self, addr: SocketAddr) -> bool {
        let changed = self.neighbors.insert(addr);
        if changed {
            if let Err(err) = self.persist() {
                self.logger
                    .error(format!("failed to persist neighbor store: {err}"));
            }
        }
        changed
    }

    /// Merge a batch of addresses (as received in CONNECT/ACCEPT/GOSSIP
    /// `neighbors`/`heard-of` parameters), returning the ones that were new.
    pub fn merge(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
        let mut added = Vec::new();
        for addr in addrs {
            if self.neighbors.insert(addr) {
                added.push(addr);
            }
        }
        if !added.is_empty() {
            if let Err(err) = self.persist() {
                self.logger
                    .error(format!("failed to persist neighbor store: {err}"));
            }
        }
        added
    }

    /// Remove `addr` (the `FORGET` command, spec.md §4.5). Returns `true`
    /// if the address was present.
    pub fn forget(&mut self, addr: &SocketAddr) -> bool {
        let changed = self.neighbors.remove(addr);
        if changed {
            if let Err(err) = self.persist() {
                self.logger
                    .error(format!("failed to persist neighbor store: {err}"));
            }
        }
        changed
    }

    fn persist(&self) -> io::Result<()> {
        write_atomically(&self.path, &render_neighbors_file(&self.neighbors))
    }
}

fn parse_neighbors_file(contents: &str) -> BTreeSet<SocketAddr> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.parse().ok())
        .collect()
}

fn render_neighbors_file(neighbors: &BTreeSet<SocketAddr>) -> String {
    let mut out = String::from("# communicatord neighbor list, one ip:port per line\n");
    for addr in neighbors {
        out.push_str(&addr.to_string());
        out.push('\n');
    }
    out
}

/// Write-temp-then-rename, the only way this workspace touches the
/// filesystem for persisted state (spec.md §5).
pub fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use communicatord_common::{Component, Logger};

    fn logger() -> Logger {
        Logger::new_root(Component::Cluster, "test")
    }

    #[test]
    fn loads_missing_file_as_empty() {
        let dir = tempdir();
        let store = NeighborStore::load(dir.join("neighbors.txt"), logger()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn add_persists_and_is_reloadable() {
        let dir = tempdir();
        let path = dir.join("neighbors.txt");
        let mut store = NeighborStore::load(&path, logger()).unwrap();
        let addr: SocketAddr = "10.0.0.2:4040".parse().unwrap();
        assert!(store.add(addr));
        assert!(!store.add(addr), "second add of the same addr is a no-op");

        let reloaded = NeighborStore::load(&path, logger()).unwrap();
        assert!(reloaded.contains(&addr));
    }

    #[test]
    fn forget_removes_and_persists() {
        let dir = tempdir();
        let path = dir.join("neighbors.txt");
        let mut store = NeighborStore::load(&path, logger()).unwrap();
        let addr: SocketAddr = "10.0.0.2:4040".parse().unwrap();
        store.add(addr);
        assert!(store.forget(&addr));
        let reloaded = NeighborStore::load(&path, logger()).unwrap();
        assert!(!reloaded.contains(&addr));
    }

    #[test]
    fn comments_are_ignored() {
        let dir = tempdir();
        let path = dir.join("neighbors.txt");
        std::fs::write(&path, "# comment\n10.0.0.1:4040\n\n").unwrap();
        let store = NeighborStore::load(&path, logger()).unwrap();
        assert_eq!(store.len(), 1);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "communicatord-neighbor-store-test-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
