//! Signal directory: isolate id / node name / group to address resolution.
//!
//! The directory is a read-mostly cache of the isolate topology, populated
//! from a TOML file and refreshed on demand. It never guesses: an unknown
//! isolate or node resolves to `None`, not to a stale or default address,
//! and `resolve` never blocks on network I/O.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// Errors loading or reloading the directory configuration.
#[derive(Debug, Snafu)]
pub enum DirectoryError {
    #[snafu(display("failed to read directory file {}: {source}", path.display()))]
    Read { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse directory file {}: {source}", path.display()))]
    Parse { path: PathBuf, source: toml::de::Error },
}

/// Role of an isolate inside the application, used for group resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolateKind {
    Monitor,
    Forker,
    Isolate,
}

fn default_kind() -> IsolateKind {
    IsolateKind::Isolate
}

/// One isolate known to the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub uid: String,
    pub name: String,
    /// Name of the node hosting the isolate; resolved to a host through the
    /// `nodes` table.
    pub node: String,
    /// Port of the isolate's signal receiver.
    pub port: u16,
    #[serde(default = "default_kind")]
    pub kind: IsolateKind,
}

/// On-disk shape of the directory configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub isolates: Vec<DirectoryEntry>,
    /// node name -> host address.
    #[serde(default)]
    pub nodes: BTreeMap<String, String>,
}

/// A resolved transport address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsolateAccess {
    pub host: String,
    pub port: u16,
}

/// Logical addressing groups.
///
/// `Others` is the broadcast fan-out target: every known isolate except the
/// local one. `Local` is the local isolate alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetGroup {
    All,
    Others,
    Local,
    Isolates,
    Monitors,
    Forkers,
}

struct DirectoryState {
    entries: BTreeMap<String, DirectoryEntry>,
    nodes: BTreeMap<String, String>,
}

impl DirectoryState {
    fn from_config(config: DirectoryConfig) -> Self {
        Self {
            entries: config
                .isolates
                .into_iter()
                .map(|entry| (entry.uid.clone(), entry))
                .collect(),
            nodes: config.nodes,
        }
    }
}

/// The per-isolate address directory.
pub struct SignalDirectory {
    local_uid: String,
    config_path: Option<PathBuf>,
    state: RwLock<DirectoryState>,
}

impl SignalDirectory {
    /// Builds a directory from an in-memory configuration.
    pub fn new(local_uid: impl Into<String>, config: DirectoryConfig) -> Self {
        Self {
            local_uid: local_uid.into(),
            config_path: None,
            state: RwLock::new(DirectoryState::from_config(config)),
        }
    }

    /// Loads the directory from a TOML file; `reload` re-reads the same file.
    pub fn from_file(
        local_uid: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let config = read_config(path)?;
        Ok(Self {
            local_uid: local_uid.into(),
            config_path: Some(path.to_path_buf()),
            state: RwLock::new(DirectoryState::from_config(config)),
        })
    }

    /// UID of the local isolate.
    pub fn local_uid(&self) -> &str {
        &self.local_uid
    }

    /// Resolves an isolate uid to its transport address.
    ///
    /// Returns `None` for unknown isolates and for isolates whose node has
    /// no known host address.
    pub fn resolve(&self, uid: &str) -> Option<IsolateAccess> {
        let state = self.state.read();
        let entry = state.entries.get(uid)?;
        let host = state.nodes.get(&entry.node)?;
        Some(IsolateAccess {
            host: host.clone(),
            port: entry.port,
        })
    }

    /// Resolves every member of the group that has a usable address.
    ///
    /// Isolates whose node host is unknown are silently skipped; group
    /// resolution never fails.
    pub fn resolve_group(&self, group: TargetGroup) -> Vec<(String, IsolateAccess)> {
        let state = self.state.read();
        state
            .entries
            .values()
            .filter(|entry| match group {
                TargetGroup::All => true,
                TargetGroup::Others => entry.uid != self.local_uid,
                TargetGroup::Local => entry.uid == self.local_uid,
                TargetGroup::Isolates => entry.kind == IsolateKind::Isolate,
                TargetGroup::Monitors => entry.kind == IsolateKind::Monitor,
                TargetGroup::Forkers => entry.kind == IsolateKind::Forker,
            })
            .filter_map(|entry| {
                let host = state.nodes.get(&entry.node)?;
                Some((
                    entry.uid.clone(),
                    IsolateAccess {
                        host: host.clone(),
                        port: entry.port,
                    },
                ))
            })
            .collect()
    }

    /// Host address for a node name.
    pub fn resolve_host_for_node(&self, node: &str) -> Option<String> {
        self.state.read().nodes.get(node).cloned()
    }

    /// True when the uid is known to the directory.
    pub fn is_registered(&self, uid: &str) -> bool {
        self.state.read().entries.contains_key(uid)
    }

    /// Adds an isolate discovered at runtime. Returns `false` when the uid
    /// was already known (the existing entry is kept).
    pub fn register_isolate(&self, entry: DirectoryEntry) -> bool {
        let mut state = self.state.write();
        if state.entries.contains_key(&entry.uid) {
            return false;
        }
        state.entries.insert(entry.uid.clone(), entry);
        true
    }

    /// Removes an isolate from the directory. Returns whether it was known.
    pub fn unregister_isolate(&self, uid: &str) -> bool {
        self.state.write().entries.remove(uid).is_some()
    }

    /// Records the host address of a node, returning the previous one.
    pub fn set_node_address(&self, node: &str, host: &str) -> Option<String> {
        self.state
            .write()
            .nodes
            .insert(node.to_string(), host.to_string())
    }

    /// Snapshot of the directory content, in the on-disk shape.
    pub fn dump(&self) -> DirectoryConfig {
        let state = self.state.read();
        DirectoryConfig {
            isolates: state.entries.values().cloned().collect(),
            nodes: state.nodes.clone(),
        }
    }

    /// Re-reads the backing file and reports whether the resolvable isolate
    /// set changed. Directories built from in-memory configuration have
    /// nothing to reload and always report `false`.
    ///
    /// The comparison is over the sorted uid set, so a file rewrite that
    /// only reorders entries does not count as a change.
    pub fn reload(&self) -> Result<bool, DirectoryError> {
        let Some(path) = &self.config_path else {
            return Ok(false);
        };
        let config = read_config(path)?;
        let fresh = DirectoryState::from_config(config);

        let mut state = self.state.write();
        let changed = !state.entries.keys().eq(fresh.entries.keys());
        *state = fresh;
        Ok(changed)
    }
}

fn read_config(path: &Path) -> Result<DirectoryConfig, DirectoryError> {
    let text = std::fs::read_to_string(path).context(ReadSnafu { path })?;
    toml::from_str(&text).context(ParseSnafu { path })
}
