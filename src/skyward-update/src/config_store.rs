//! Hierarchical configuration store.
//!
//! Models a registry-like key/value tree: keys are addressed by a base scope
//! and a backslash-separated path, and hold named typed values. The engine
//! only talks to the [`ConfigStore`] trait; [`MemoryConfigStore`] backs tests
//! and embedders, [`JsonConfigStore`] persists to a file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};

/// Root of a key path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BaseScope {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
    CurrentConfig,
}

impl BaseScope {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::ClassesRoot => 0,
            Self::CurrentUser => 1,
            Self::LocalMachine => 2,
            Self::Users => 3,
            Self::CurrentConfig => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::ClassesRoot,
            1 => Self::CurrentUser,
            2 => Self::LocalMachine,
            3 => Self::Users,
            4 => Self::CurrentConfig,
            _ => return None,
        })
    }

    /// Whether changes under this scope only affect the invoking user.
    pub fn is_per_user(self) -> bool {
        matches!(self, Self::CurrentUser)
    }
}

impl std::fmt::Display for BaseScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ClassesRoot => "HKEY_CLASSES_ROOT",
            Self::CurrentUser => "HKEY_CURRENT_USER",
            Self::LocalMachine => "HKEY_LOCAL_MACHINE",
            Self::Users => "HKEY_USERS",
            Self::CurrentConfig => "HKEY_CURRENT_CONFIG",
        };
        f.write_str(name)
    }
}

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum ConfigValue {
    String(String),
    ExpandString(String),
    MultiString(Vec<String>),
    DWord(u32),
    QWord(u64),
    Binary(Vec<u8>),
    None,
}

/// Recursive copy of a key, its values and its subkeys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySnapshot {
    pub path: String,
    pub values: Vec<(String, ConfigValue)>,
    pub subkeys: Vec<KeySnapshot>,
}

/// Backend for configuration changes.
///
/// Implementations use interior mutability so a store can be shared behind
/// an `Arc` between the engine and its caller.
pub trait ConfigStore: Send + Sync {
    fn key_exists(&self, scope: BaseScope, path: &str) -> UpdateResult<bool>;

    /// Create a key. Missing parents are created implicitly.
    fn create_key(&self, scope: BaseScope, path: &str) -> UpdateResult<()>;

    /// Delete a key and everything below it.
    fn delete_key(&self, scope: BaseScope, path: &str) -> UpdateResult<()>;

    fn get_value(&self, scope: BaseScope, path: &str, name: &str)
    -> UpdateResult<Option<ConfigValue>>;

    /// Set a value on an existing key.
    fn set_value(
        &self,
        scope: BaseScope,
        path: &str,
        name: &str,
        value: &ConfigValue,
    ) -> UpdateResult<()>;

    fn delete_value(&self, scope: BaseScope, path: &str, name: &str) -> UpdateResult<()>;

    /// Snapshot a key recursively, `None` when it does not exist.
    fn snapshot(&self, scope: BaseScope, path: &str) -> UpdateResult<Option<KeySnapshot>>;
}

/// Canonical form of a key path: backslash separated, no empty segments.
pub fn normalize_path(path: &str) -> String {
    path.split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\\")
}

/// Every proper ancestor of `path` followed by `path` itself, outermost first.
pub fn key_prefixes(path: &str) -> Vec<String> {
    let normalized = normalize_path(path);
    let mut out = Vec::new();
    let mut current = String::new();
    for segment in normalized.split('\\').filter(|s| !s.is_empty()) {
        if !current.is_empty() {
            current.push('\\');
        }
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

fn is_within(candidate: &str, root: &str) -> bool {
    root.is_empty()
        || candidate == root
        || (candidate.len() > root.len()
            && candidate.starts_with(root)
            && candidate.as_bytes()[root.len()] == b'\\')
}

/// One key as persisted by [`JsonConfigStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub scope: BaseScope,
    pub path: String,
    #[serde(default)]
    pub values: BTreeMap<String, ConfigValue>,
}

type KeyMap = BTreeMap<(BaseScope, String), BTreeMap<String, ConfigValue>>;

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    keys: Mutex<KeyMap>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: Vec<StoredKey>) -> Self {
        let map = keys
            .into_iter()
            .map(|k| ((k.scope, normalize_path(&k.path)), k.values))
            .collect();
        Self {
            keys: Mutex::new(map),
        }
    }

    /// Every key in deterministic order.
    pub fn dump(&self) -> Vec<StoredKey> {
        self.keys
            .lock()
            .iter()
            .map(|((scope, path), values)| StoredKey {
                scope: *scope,
                path: path.clone(),
                values: values.clone(),
            })
            .collect()
    }

    fn build_snapshot(keys: &KeyMap, scope: BaseScope, path: &str) -> KeySnapshot {
        let values = keys
            .get(&(scope, path.to_string()))
            .map(|v| v.iter().map(|(n, v)| (n.clone(), v.clone())).collect())
            .unwrap_or_default();
        let subkeys = keys
            .keys()
            .filter(|(s, p)| *s == scope && is_direct_child(p, path))
            .map(|(_, p)| Self::build_snapshot(keys, scope, p))
            .collect();
        KeySnapshot {
            path: path.to_string(),
            values,
            subkeys,
        }
    }
}

fn is_direct_child(candidate: &str, parent: &str) -> bool {
    if parent.is_empty() {
        return !candidate.is_empty() && !candidate.contains('\\');
    }
    is_within(candidate, parent)
        && candidate != parent
        && !candidate[parent.len() + 1..].contains('\\')
}

impl ConfigStore for MemoryConfigStore {
    fn key_exists(&self, scope: BaseScope, path: &str) -> UpdateResult<bool> {
        let path = normalize_path(path);
        Ok(path.is_empty() || self.keys.lock().contains_key(&(scope, path)))
    }

    fn create_key(&self, scope: BaseScope, path: &str) -> UpdateResult<()> {
        let mut keys = self.keys.lock();
        for prefix in key_prefixes(path) {
            keys.entry((scope, prefix)).or_default();
        }
        Ok(())
    }

    fn delete_key(&self, scope: BaseScope, path: &str) -> UpdateResult<()> {
        let path = normalize_path(path);
        self.keys
            .lock()
            .retain(|(s, p), _| *s != scope || !is_within(p, &path));
        Ok(())
    }

    fn get_value(
        &self,
        scope: BaseScope,
        path: &str,
        name: &str,
    ) -> UpdateResult<Option<ConfigValue>> {
        Ok(self
            .keys
            .lock()
            .get(&(scope, normalize_path(path)))
            .and_then(|values| values.get(name).cloned()))
    }

    fn set_value(
        &self,
        scope: BaseScope,
        path: &str,
        name: &str,
        value: &ConfigValue,
    ) -> UpdateResult<()> {
        let path = normalize_path(path);
        let mut keys = self.keys.lock();
        let values = keys.get_mut(&(scope, path.clone())).ok_or_else(|| {
            UpdateError::store(format!("key {scope}\\{path} does not exist"))
        })?;
        values.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn delete_value(&self, scope: BaseScope, path: &str, name: &str) -> UpdateResult<()> {
        if let Some(values) = self.keys.lock().get_mut(&(scope, normalize_path(path))) {
            values.remove(name);
        }
        Ok(())
    }

    fn snapshot(&self, scope: BaseScope, path: &str) -> UpdateResult<Option<KeySnapshot>> {
        let path = normalize_path(path);
        let keys = self.keys.lock();
        if !path.is_empty() && !keys.contains_key(&(scope, path.clone())) {
            return Ok(None);
        }
        Ok(Some(Self::build_snapshot(&keys, scope, &path)))
    }
}

/// File-backed store, rewritten atomically after every mutation.
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    inner: MemoryConfigStore,
}

impl JsonConfigStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> UpdateResult<Self> {
        let path = path.as_ref().to_path_buf();
        let keys = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Vec<StoredKey>>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("Opened configuration store {} ({} keys)", path.display(), keys.len());
        Ok(Self {
            path,
            inner: MemoryConfigStore::from_keys(keys),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> UpdateResult<()> {
        let content = serde_json::to_vec_pretty(&self.inner.dump())?;
        skyward_common::atomic_write(&self.path, &content)
            .map_err(|e| UpdateError::store(format!("{}: {e}", self.path.display())))
    }
}

impl ConfigStore for JsonConfigStore {
    fn key_exists(&self, scope: BaseScope, path: &str) -> UpdateResult<bool> {
        self.inner.key_exists(scope, path)
    }

    fn create_key(&self, scope: BaseScope, path: &str) -> UpdateResult<()> {
        self.inner.create_key(scope, path)?;
        self.persist()
    }

    fn delete_key(&self, scope: BaseScope, path: &str) -> UpdateResult<()> {
        self.inner.delete_key(scope, path)?;
        self.persist()
    }

    fn get_value(
        &self,
        scope: BaseScope,
        path: &str,
        name: &str,
    ) -> UpdateResult<Option<ConfigValue>> {
        self.inner.get_value(scope, path, name)
    }

    fn set_value(
        &self,
        scope: BaseScope,
        path: &str,
        name: &str,
        value: &ConfigValue,
    ) -> UpdateResult<()> {
        self.inner.set_value(scope, path, name, value)?;
        self.persist()
    }

    fn delete_value(&self, scope: BaseScope, path: &str, name: &str) -> UpdateResult<()> {
        self.inner.delete_value(scope, path, name)?;
        self.persist()
    }

    fn snapshot(&self, scope: BaseScope, path: &str) -> UpdateResult<Option<KeySnapshot>> {
        self.inner.snapshot(scope, path)
    }
}
