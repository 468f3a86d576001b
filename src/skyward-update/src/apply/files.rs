//! File installation with backups for rollback.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::capabilities::DeltaDecoder;
use crate::elevation::{InstallLocation, InstallTargets, join_within};
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{FileIntent, ShortcutInfo, UpdateDetails};
use crate::verify::{self, NO_CHECKSUM};

#[derive(Debug)]
enum JournalEntry {
    Created(PathBuf),
    Replaced { target: PathBuf, backup: PathBuf },
    Deleted { target: PathBuf, backup: PathBuf },
    CreatedDir(PathBuf),
    DeletedDir { target: PathBuf, backup: PathBuf },
}

/// What a committed transaction left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedFiles {
    pub created_files: Vec<PathBuf>,
    pub created_dirs: Vec<PathBuf>,
}

/// Journal of every file system change of a run.
///
/// Overwritten and deleted items are copied into `backup_dir` first, so
/// [`rollback`](Self::rollback) can restore them in reverse order.
#[derive(Debug)]
pub struct FileTransaction {
    backup_dir: PathBuf,
    journal: Vec<JournalEntry>,
    next_backup: usize,
}

impl FileTransaction {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            journal: Vec::new(),
            next_backup: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.journal.is_empty()
    }

    fn backup_path(&mut self) -> UpdateResult<PathBuf> {
        fs::create_dir_all(&self.backup_dir)?;
        let path = self.backup_dir.join(format!("{:05}", self.next_backup));
        self.next_backup += 1;
        Ok(path)
    }

    /// Create missing ancestors of `target`, journaling each one.
    fn ensure_parent(&mut self, target: &Path) -> UpdateResult<()> {
        let Some(parent) = target.parent() else {
            return Ok(());
        };
        let mut missing = Vec::new();
        for dir in parent.ancestors() {
            if dir.as_os_str().is_empty() || dir.exists() {
                break;
            }
            missing.push(dir.to_path_buf());
        }
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir)?;
            self.journal.push(JournalEntry::CreatedDir(dir));
        }
        Ok(())
    }

    /// Journal the pre-state of `target` before it is overwritten.
    fn prepare_overwrite(&mut self, target: &Path) -> UpdateResult<()> {
        if target.is_file() {
            let backup = self.backup_path()?;
            fs::copy(target, &backup)?;
            self.journal.push(JournalEntry::Replaced {
                target: target.to_path_buf(),
                backup,
            });
        } else {
            self.ensure_parent(target)?;
            self.journal.push(JournalEntry::Created(target.to_path_buf()));
        }
        Ok(())
    }

    pub fn write(&mut self, target: &Path, contents: &[u8]) -> UpdateResult<()> {
        self.prepare_overwrite(target)?;
        fs::write(target, contents)?;
        Ok(())
    }

    /// Copy `source` over `target`, keeping its permissions.
    pub fn copy_in(&mut self, source: &Path, target: &Path) -> UpdateResult<()> {
        self.prepare_overwrite(target)?;
        fs::copy(source, target)?;
        Ok(())
    }

    /// Delete a file. Returns `false` when there was nothing to delete.
    pub fn delete_file(&mut self, target: &Path) -> UpdateResult<bool> {
        if !target.is_file() {
            return Ok(false);
        }
        let backup = self.backup_path()?;
        fs::copy(target, &backup)?;
        self.journal.push(JournalEntry::Deleted {
            target: target.to_path_buf(),
            backup,
        });
        fs::remove_file(target)?;
        Ok(true)
    }

    /// Delete a directory tree. Returns `false` when it did not exist.
    pub fn delete_dir(&mut self, target: &Path) -> UpdateResult<bool> {
        if !target.is_dir() {
            return Ok(false);
        }
        let backup = self.backup_path()?;
        copy_tree(target, &backup)?;
        self.journal.push(JournalEntry::DeletedDir {
            target: target.to_path_buf(),
            backup,
        });
        fs::remove_dir_all(target)?;
        Ok(true)
    }

    /// Undo every journaled change, newest first. Every entry is attempted;
    /// failures are returned rather than stopping the rollback.
    pub fn rollback(self) -> Vec<String> {
        let mut failures = Vec::new();
        for entry in self.journal.into_iter().rev() {
            let result = match &entry {
                JournalEntry::Created(target) => match fs::remove_file(target) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
                JournalEntry::Replaced { target, backup }
                | JournalEntry::Deleted { target, backup } => {
                    restore_parent(target).and_then(|_| fs::copy(backup, target).map(|_| ()))
                }
                JournalEntry::CreatedDir(dir) => match fs::remove_dir(dir) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
                JournalEntry::DeletedDir { target, backup } => copy_tree(backup, target),
            };
            if let Err(e) = result {
                tracing::error!("File rollback step {:?} failed: {}", entry, e);
                failures.push(format!("{entry:?}: {e}"));
            }
        }
        if let Err(e) = fs::remove_dir_all(&self.backup_dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove {}: {}", self.backup_dir.display(), e);
        }
        failures
    }

    /// Files and folders that did not exist before this transaction.
    pub fn created(&self) -> CommittedFiles {
        let mut created = CommittedFiles::default();
        for entry in &self.journal {
            match entry {
                JournalEntry::Created(path) => created.created_files.push(path.clone()),
                JournalEntry::CreatedDir(path) => created.created_dirs.push(path.clone()),
                _ => {}
            }
        }
        created
    }

    /// Keep every change and drop the backups.
    pub fn commit(self) -> CommittedFiles {
        let committed = self.created();
        if let Err(e) = fs::remove_dir_all(&self.backup_dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove {}: {}", self.backup_dir.display(), e);
        }
        committed
    }
}

fn restore_parent(target: &Path) -> std::io::Result<()> {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Installs an extracted payload onto the install targets.
pub struct FileApplier<'a> {
    targets: &'a InstallTargets,
    delta: &'a dyn DeltaDecoder,
}

impl<'a> FileApplier<'a> {
    pub fn new(targets: &'a InstallTargets, delta: &'a dyn DeltaDecoder) -> Self {
        Self { targets, delta }
    }

    /// Install everything in `payload_root`, then apply the file
    /// operations of `details`. Returns the shortcuts written.
    pub fn apply(
        &self,
        payload_root: &Path,
        details: Option<&UpdateDetails>,
        tx: &mut FileTransaction,
        cancel: &CancellationToken,
    ) -> UpdateResult<Vec<PathBuf>> {
        let patches: HashSet<String> = details
            .map(|d| d.patch_paths().map(normalize_relative).collect())
            .unwrap_or_default();
        self.install_folders(payload_root, &patches, tx, cancel)?;

        let Some(details) = details else {
            return Ok(Vec::new());
        };
        self.apply_file_ops(payload_root, details, tx, cancel)?;

        for folder in &details.folders_to_delete {
            let dir = self.targets.resolve(folder)?;
            if tx.delete_dir(&dir)? {
                tracing::debug!("Deleted folder {}", dir.display());
            }
        }

        for previous in &details.previous_shortcuts {
            tx.delete_file(&self.targets.resolve(previous)?)?;
        }
        let mut written = Vec::new();
        for shortcut in &details.shortcuts {
            let path = self.targets.resolve(&shortcut.path)?;
            let descriptor = self.shortcut_descriptor(&path, shortcut)?;
            tx.write(&path, descriptor.as_bytes())?;
            written.push(path);
        }
        Ok(written)
    }

    fn install_folders(
        &self,
        payload_root: &Path,
        patches: &HashSet<String>,
        tx: &mut FileTransaction,
        cancel: &CancellationToken,
    ) -> UpdateResult<()> {
        for location in InstallLocation::ALL {
            let source_root = payload_root.join(location.folder());
            if !source_root.is_dir() {
                continue;
            }
            let target_root = self.targets.path(location);
            for entry in WalkDir::new(&source_root).sort_by_file_name() {
                let entry = entry.map_err(|e| UpdateError::Io(std::io::Error::other(e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Err(UpdateError::Cancelled);
                }
                let relative = entry
                    .path()
                    .strip_prefix(payload_root)
                    .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?;
                if patches.contains(&normalize_relative(&relative.to_string_lossy())) {
                    continue;
                }
                let within = entry
                    .path()
                    .strip_prefix(&source_root)
                    .map_err(|e| UpdateError::Io(std::io::Error::other(e)))?;
                let target = target_root.join(within);
                tracing::debug!("Installing {}", target.display());
                tx.copy_in(entry.path(), &target)?;
            }
        }
        Ok(())
    }

    fn apply_file_ops(
        &self,
        payload_root: &Path,
        details: &UpdateDetails,
        tx: &mut FileTransaction,
        cancel: &CancellationToken,
    ) -> UpdateResult<()> {
        for op in &details.files {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            match &op.intent {
                FileIntent::DeltaPatch {
                    patch_path,
                    expected_sha256,
                } => {
                    let target = self.targets.resolve(&op.relative_path)?;
                    let source = fs::read(&target).map_err(|e| {
                        UpdateError::patch(format!("cannot read {}: {e}", target.display()))
                    })?;
                    let patch = fs::read(join_within(payload_root, patch_path)?)
                        .map_err(|e| UpdateError::patch(format!("missing patch {patch_path}: {e}")))?;
                    let patched = self.delta.decode(&source, &patch)?;
                    if *expected_sha256 != NO_CHECKSUM {
                        verify::verify_checksum(expected_sha256, &verify::sha256_bytes(&patched))
                            .map_err(|e| {
                                UpdateError::patch(format!("{}: {e}", op.relative_path))
                            })?;
                    }
                    tracing::debug!("Patched {}", target.display());
                    tx.write(&target, &patched)?;
                }
                FileIntent::Delete => {
                    let target = self.targets.resolve(&op.relative_path)?;
                    if tx.delete_file(&target)? {
                        tracing::debug!("Deleted {}", target.display());
                    }
                }
                FileIntent::Execute { .. } => {}
            }
        }
        Ok(())
    }

    fn shortcut_descriptor(&self, path: &Path, shortcut: &ShortcutInfo) -> UpdateResult<String> {
        let target = self.targets.resolve(&shortcut.target)?;
        let working_dir = shortcut
            .working_dir
            .as_deref()
            .map(|d| self.targets.resolve(d))
            .transpose()?;
        let icon = shortcut
            .icon
            .as_deref()
            .map(|i| self.targets.resolve(i))
            .transpose()?;

        let is_url = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("url"));
        let mut out = String::new();
        if is_url {
            out.push_str("[InternetShortcut]\n");
            out.push_str(&format!("URL=file:///{}\n", target.display()));
            if let Some(dir) = &working_dir {
                out.push_str(&format!("WorkingDirectory={}\n", dir.display()));
            }
            if let Some(icon) = &icon {
                out.push_str(&format!("IconFile={}\nIconIndex=0\n", icon.display()));
            }
        } else {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let exec = match &shortcut.arguments {
                Some(args) if !args.is_empty() => {
                    format!("\"{}\" {}", target.display(), args)
                }
                _ => format!("\"{}\"", target.display()),
            };
            out.push_str("[Desktop Entry]\nType=Application\n");
            out.push_str(&format!("Name={name}\nExec={exec}\n"));
            if let Some(description) = &shortcut.description {
                out.push_str(&format!("Comment={description}\n"));
            }
            if let Some(dir) = &working_dir {
                out.push_str(&format!("Path={}\n", dir.display()));
            }
            if let Some(icon) = &icon {
                out.push_str(&format!("Icon={}\n", icon.display()));
            }
        }
        Ok(out)
    }
}

/// Manifest paths may use either separator.
fn normalize_relative(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileOp;
    use std::collections::BTreeMap;

    /// Treats the patch as the new contents when it starts with the source.
    struct PrefixDelta;

    impl DeltaDecoder for PrefixDelta {
        fn decode(&self, source: &[u8], patch: &[u8]) -> UpdateResult<Vec<u8>> {
            patch
                .strip_prefix(source)
                .map(|_| patch.to_vec())
                .ok_or_else(|| UpdateError::patch("patch does not match source"))
        }
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                let contents = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
                (rel, contents)
            })
            .collect()
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_transaction_rollback_restores_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("install");
        write(&root.join("keep.txt"), "original");
        write(&root.join("gone.txt"), "to delete");
        write(&root.join("old/inner.txt"), "old tree");
        let before = snapshot(&root);

        let mut tx = FileTransaction::new(dir.path().join("backup"));
        tx.write(&root.join("keep.txt"), b"replaced").unwrap();
        tx.write(&root.join("new/deep/file.txt"), b"created").unwrap();
        assert!(tx.delete_file(&root.join("gone.txt")).unwrap());
        assert!(tx.delete_dir(&root.join("old")).unwrap());
        assert!(!tx.delete_file(&root.join("missing.txt")).unwrap());
        assert_ne!(snapshot(&root), before);

        assert!(tx.rollback().is_empty());
        assert_eq!(snapshot(&root), before);
        assert!(!dir.path().join("backup").exists());
    }

    #[test]
    fn test_commit_reports_created_items() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("install");
        write(&root.join("existing.txt"), "x");

        let mut tx = FileTransaction::new(dir.path().join("backup"));
        tx.write(&root.join("existing.txt"), b"y").unwrap();
        tx.write(&root.join("sub/new.txt"), b"z").unwrap();
        let committed = tx.commit();

        assert_eq!(committed.created_files, vec![root.join("sub/new.txt")]);
        assert_eq!(committed.created_dirs, vec![root.join("sub")]);
        assert_eq!(fs::read(root.join("existing.txt")).unwrap(), b"y");
    }

    fn setup() -> (tempfile::TempDir, PathBuf, InstallTargets) {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("payload");
        let targets = InstallTargets::for_base_dir(dir.path().join("app"))
            .with_location(InstallLocation::CommonStartMenu, dir.path().join("menu"));
        (dir, payload, targets)
    }

    #[test]
    fn test_applier_installs_patches_and_deletes() {
        let (dir, payload, targets) = setup();
        let app = dir.path().join("app");
        write(&app.join("bin/tool"), "v1");
        write(&app.join("obsolete.txt"), "old");
        write(&app.join("cache/blob"), "cached");
        write(&payload.join("base/readme.txt"), "hello");
        write(&payload.join("base/bin/tool.patch"), "v1+v2");
        write(&dir.path().join("menu/old.desktop"), "old shortcut");

        let details = UpdateDetails {
            files: vec![
                FileOp {
                    relative_path: "base/bin/tool".into(),
                    intent: FileIntent::DeltaPatch {
                        patch_path: "base\\bin\\tool.patch".into(),
                        expected_sha256: verify::sha256_bytes(b"v1+v2"),
                    },
                },
                FileOp {
                    relative_path: "base/obsolete.txt".into(),
                    intent: FileIntent::Delete,
                },
            ],
            folders_to_delete: vec!["base/cache".into()],
            previous_shortcuts: vec!["startmenu/old.desktop".into()],
            shortcuts: vec![ShortcutInfo {
                path: "startmenu/sky.desktop".into(),
                target: "base/bin/tool".into(),
                arguments: Some("--fast".into()),
                description: Some("Sky".into()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut tx = FileTransaction::new(dir.path().join("backup"));
        let written = FileApplier::new(&targets, &PrefixDelta)
            .apply(&payload, Some(&details), &mut tx, &CancellationToken::new())
            .unwrap();

        assert_eq!(fs::read_to_string(app.join("readme.txt")).unwrap(), "hello");
        assert_eq!(fs::read_to_string(app.join("bin/tool")).unwrap(), "v1+v2");
        assert!(!app.join("bin/tool.patch").exists());
        assert!(!app.join("obsolete.txt").exists());
        assert!(!app.join("cache").exists());
        assert!(!dir.path().join("menu/old.desktop").exists());
        assert_eq!(written, vec![dir.path().join("menu/sky.desktop")]);
        let shortcut = fs::read_to_string(&written[0]).unwrap();
        assert!(shortcut.contains("Exec=\""));
        assert!(shortcut.contains("--fast"));
        assert!(shortcut.contains("Comment=Sky"));
    }

    #[test]
    fn test_bad_patch_digest_fails_and_rolls_back() {
        let (dir, payload, targets) = setup();
        let app = dir.path().join("app");
        write(&app.join("bin/tool"), "v1");
        write(&payload.join("base/new.txt"), "new");
        write(&payload.join("base/bin/tool.patch"), "v1+v2");
        let before = snapshot(&app);

        let details = UpdateDetails {
            files: vec![FileOp {
                relative_path: "base/bin/tool".into(),
                intent: FileIntent::DeltaPatch {
                    patch_path: "base/bin/tool.patch".into(),
                    expected_sha256: [9u8; 32],
                },
            }],
            ..Default::default()
        };

        let mut tx = FileTransaction::new(dir.path().join("backup"));
        let err = FileApplier::new(&targets, &PrefixDelta)
            .apply(&payload, Some(&details), &mut tx, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, UpdateError::PatchApplication { .. }));
        assert!(app.join("new.txt").exists());

        assert!(tx.rollback().is_empty());
        assert_eq!(snapshot(&app), before);
    }

    #[test]
    fn test_patch_outside_payload_is_rejected() {
        let (dir, payload, targets) = setup();
        let app = dir.path().join("app");
        write(&app.join("bin/tool"), "v1");
        write(&dir.path().join("secret.patch"), "stolen");
        fs::create_dir_all(&payload).unwrap();

        let details = UpdateDetails {
            files: vec![FileOp {
                relative_path: "base/bin/tool".into(),
                intent: FileIntent::DeltaPatch {
                    patch_path: "base/../../secret.patch".into(),
                    expected_sha256: NO_CHECKSUM,
                },
            }],
            ..Default::default()
        };

        let mut tx = FileTransaction::new(dir.path().join("backup"));
        let err = FileApplier::new(&targets, &PrefixDelta)
            .apply(&payload, Some(&details), &mut tx, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidPath { .. }));
        assert_eq!(fs::read_to_string(app.join("bin/tool")).unwrap(), "v1");
    }
}
