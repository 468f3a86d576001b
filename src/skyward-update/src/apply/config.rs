//! Journaled configuration changes.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::config_store::{BaseScope, ConfigStore, ConfigValue, KeySnapshot, key_prefixes};
use crate::error::{UpdateError, UpdateResult};

/// One mutation of the configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    CreateKey {
        scope: BaseScope,
        path: String,
    },
    RemoveKey {
        scope: BaseScope,
        path: String,
    },
    CreateValue {
        scope: BaseScope,
        path: String,
        name: String,
        value: ConfigValue,
    },
    RemoveValue {
        scope: BaseScope,
        path: String,
        name: String,
    },
}

impl fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateKey { scope, path } => write!(f, "create key {scope}\\{path}"),
            Self::RemoveKey { scope, path } => write!(f, "remove key {scope}\\{path}"),
            Self::CreateValue {
                scope, path, name, ..
            } => write!(f, "set value {scope}\\{path}\\{name}"),
            Self::RemoveValue { scope, path, name } => {
                write!(f, "remove value {scope}\\{path}\\{name}")
            }
        }
    }
}

impl ConfigChange {
    pub fn scope(&self) -> BaseScope {
        match self {
            Self::CreateKey { scope, .. }
            | Self::RemoveKey { scope, .. }
            | Self::CreateValue { scope, .. }
            | Self::RemoveValue { scope, .. } => *scope,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::CreateKey { path, .. }
            | Self::RemoveKey { path, .. }
            | Self::CreateValue { path, .. }
            | Self::RemoveValue { path, .. } => path,
        }
    }

    /// Apply this change. When `log` is given, the inverse of everything
    /// about to be mutated is journaled before the mutation happens.
    pub fn apply(
        &self,
        store: &dyn ConfigStore,
        mut log: Option<&mut ConfigRollback>,
    ) -> UpdateResult<()> {
        match self {
            Self::CreateKey { scope, path } => create_missing_keys(store, *scope, path, log),
            Self::RemoveKey { scope, path } => {
                let Some(snapshot) = store.snapshot(*scope, path)? else {
                    return Ok(());
                };
                if let Some(log) = log {
                    let mut restore = Vec::new();
                    flatten(*scope, &snapshot, &mut restore);
                    // Rollback runs backwards, so parents must come last here
                    log.entries.extend(restore.into_iter().rev());
                }
                store.delete_key(*scope, path)
            }
            Self::CreateValue {
                scope,
                path,
                name,
                value,
            } => {
                create_missing_keys(store, *scope, path, log.as_deref_mut())?;
                let previous = store.get_value(*scope, path, name)?;
                if let Some(log) = log {
                    log.push(match previous {
                        Some(old) => Self::CreateValue {
                            scope: *scope,
                            path: path.clone(),
                            name: name.clone(),
                            value: old,
                        },
                        None => Self::RemoveValue {
                            scope: *scope,
                            path: path.clone(),
                            name: name.clone(),
                        },
                    });
                }
                store.set_value(*scope, path, name, value)
            }
            Self::RemoveValue { scope, path, name } => {
                let Some(previous) = store.get_value(*scope, path, name)? else {
                    return Ok(());
                };
                if let Some(log) = log {
                    log.push(Self::CreateValue {
                        scope: *scope,
                        path: path.clone(),
                        name: name.clone(),
                        value: previous,
                    });
                }
                store.delete_value(*scope, path, name)
            }
        }
    }
}

fn create_missing_keys(
    store: &dyn ConfigStore,
    scope: BaseScope,
    path: &str,
    mut log: Option<&mut ConfigRollback>,
) -> UpdateResult<()> {
    for prefix in key_prefixes(path) {
        if store.key_exists(scope, &prefix)? {
            continue;
        }
        if let Some(log) = log.as_deref_mut() {
            log.push(ConfigChange::RemoveKey {
                scope,
                path: prefix.clone(),
            });
        }
        store.create_key(scope, &prefix)?;
    }
    Ok(())
}

/// Changes recreating `snapshot`, parents before children.
fn flatten(scope: BaseScope, snapshot: &KeySnapshot, out: &mut Vec<ConfigChange>) {
    out.push(ConfigChange::CreateKey {
        scope,
        path: snapshot.path.clone(),
    });
    for (name, value) in &snapshot.values {
        out.push(ConfigChange::CreateValue {
            scope,
            path: snapshot.path.clone(),
            name: name.clone(),
            value: value.clone(),
        });
    }
    for subkey in &snapshot.subkeys {
        flatten(scope, subkey, out);
    }
}

/// Inverse changes of everything applied so far, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigRollback {
    entries: Vec<ConfigChange>,
}

impl ConfigRollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, inverse: ConfigChange) {
        self.entries.push(inverse);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ConfigChange] {
        &self.entries
    }

    /// Removals undoing the keys and values this run created, innermost first.
    pub fn creations(&self) -> Vec<ConfigChange> {
        self.entries
            .iter()
            .rev()
            .filter(|c| {
                matches!(
                    c,
                    ConfigChange::RemoveKey { .. } | ConfigChange::RemoveValue { .. }
                )
            })
            .cloned()
            .collect()
    }

    /// Undo every journaled change, newest first. Every entry is attempted;
    /// failures are returned rather than stopping the rollback.
    pub fn rollback(self, store: &dyn ConfigStore) -> Vec<String> {
        let mut failures = Vec::new();
        for inverse in self.entries.into_iter().rev() {
            if let Err(e) = inverse.apply(store, None) {
                tracing::error!("Config rollback step '{}' failed: {}", inverse, e);
                failures.push(format!("{inverse}: {e}"));
            }
        }
        failures
    }
}

/// Apply `changes` in order, journaling into `log`. Cancellation is checked
/// before each mutation.
pub fn apply_config_changes(
    changes: &[ConfigChange],
    store: &dyn ConfigStore,
    log: &mut ConfigRollback,
    cancel: &CancellationToken,
) -> UpdateResult<()> {
    for change in changes {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        tracing::debug!("Applying {}", change);
        change.apply(store, Some(log))?;
    }
    Ok(())
}
