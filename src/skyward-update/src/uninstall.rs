//! Removing what committed runs installed.

use std::path::{Path, PathBuf};

use crate::codec::read_record;
use crate::config_store::ConfigStore;
use crate::error::UpdateResult;
use crate::manifest::UninstallRecord;

/// File name of the uninstall record, kept next to the client manifest.
pub const UNINSTALL_FILE: &str = "uninstall.dat";

pub fn record_path(client_manifest: &Path) -> PathBuf {
    client_manifest.with_file_name(UNINSTALL_FILE)
}

/// The record at `path`, empty when none was written yet.
pub fn load_record(path: &Path) -> UpdateResult<UninstallRecord> {
    if !path.exists() {
        return Ok(UninstallRecord::default());
    }
    read_record(path)
}

/// The record at `path` with `run` folded in. Nothing is written.
pub fn merged(path: &Path, run: UninstallRecord) -> UpdateResult<UninstallRecord> {
    let mut record = load_record(path)?;
    record.merge(run);
    Ok(record)
}

/// Remove everything in `record`: files and shortcuts, then folders that
/// are left empty, then configuration keys and values. Missing items are
/// skipped. Returns the items that could not be removed.
pub fn remove_installed(record: &UninstallRecord, store: &dyn ConfigStore) -> Vec<String> {
    let mut failures = Vec::new();

    for file in record.files.iter().chain(&record.shortcuts) {
        match std::fs::remove_file(file) {
            Ok(()) => tracing::debug!("Removed {}", file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("Failed to remove {}: {}", file, e);
                failures.push(format!("{file}: {e}"));
            }
        }
    }

    // Deepest first so parents are empty by the time they are reached
    let mut folders: Vec<&String> = record.folders.iter().collect();
    folders.sort_by_key(|f| std::cmp::Reverse(Path::new(f).components().count()));
    for folder in folders {
        let path = Path::new(folder);
        if !path.is_dir() {
            continue;
        }
        if let Err(e) = std::fs::remove_dir(path) {
            tracing::debug!("Keeping non-empty folder {}: {}", folder, e);
        }
    }

    for change in &record.config_changes {
        if let Err(e) = change.apply(store, None) {
            tracing::warn!("Failed to {}: {}", change, e);
            failures.push(format!("{change}: {e}"));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ConfigChange;
    use crate::config_store::{BaseScope, ConfigValue, MemoryConfigStore};

    #[test]
    fn test_removes_recorded_items_and_keeps_foreign_ones() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(app.join("lib/nested")).unwrap();
        std::fs::create_dir_all(app.join("data")).unwrap();
        std::fs::write(app.join("lib/nested/core.so"), "x").unwrap();
        std::fs::write(app.join("data/user.txt"), "keep me").unwrap();
        std::fs::write(app.join("sky.desktop"), "[Desktop Entry]").unwrap();

        let store = MemoryConfigStore::new();
        store.create_key(BaseScope::CurrentUser, "Software\\Sky").unwrap();
        store
            .set_value(
                BaseScope::CurrentUser,
                "Software\\Sky",
                "Theme",
                &ConfigValue::DWord(2),
            )
            .unwrap();

        let s = |p: PathBuf| p.to_string_lossy().into_owned();
        let record = UninstallRecord {
            files: vec![s(app.join("lib/nested/core.so")), s(app.join("gone.txt"))],
            folders: vec![s(app.join("lib")), s(app.join("lib/nested")), s(app.join("data"))],
            shortcuts: vec![s(app.join("sky.desktop"))],
            config_changes: vec![ConfigChange::RemoveKey {
                scope: BaseScope::CurrentUser,
                path: "Software\\Sky".into(),
            }],
        };

        assert!(remove_installed(&record, &store).is_empty());
        assert!(!app.join("lib").exists());
        assert!(!app.join("sky.desktop").exists());
        assert!(app.join("data/user.txt").exists());
        assert!(!store.key_exists(BaseScope::CurrentUser, "Software\\Sky").unwrap());
    }

    #[test]
    fn test_merged_extends_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = record_path(&dir.path().join("client.wyc"));
        assert_eq!(path, dir.path().join(UNINSTALL_FILE));
        assert!(load_record(&path).unwrap().is_empty());

        let first = UninstallRecord {
            files: vec!["/a".into()],
            ..Default::default()
        };
        crate::codec::write_record(&path, &first).unwrap();
        let record = merged(
            &path,
            UninstallRecord {
                files: vec!["/a".into(), "/b".into()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(record.files, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(load_record(&path).unwrap(), first);
    }
}
