//! Collaborators the engine delegates to: archive extraction, discovery of
//! processes holding install files, delta decoding and relaunching.
//!
//! Each is a trait so embedders and tests can inject their own.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysinfo::{ProcessRefreshKind, RefreshKind, System, UpdateKind};
use walkdir::WalkDir;

use crate::error::{UpdateError, UpdateResult};

/// Unpacks a downloaded payload.
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, archive: &Path, dest: &Path) -> UpdateResult<()>;
}

/// A process running an executable from one of the install directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingProcess {
    pub pid: u32,
    pub name: String,
    pub exe: PathBuf,
}

/// Finds processes that would block file replacement.
pub trait ProcessInspector: Send + Sync {
    fn blocking_processes(&self, dirs: &[PathBuf]) -> Vec<BlockingProcess>;
}

/// Rebuilds a file from its previous version and a binary delta.
pub trait DeltaDecoder: Send + Sync {
    fn decode(&self, source: &[u8], patch: &[u8]) -> UpdateResult<Vec<u8>>;
}

/// Replaces the running client and starts follow-up processes.
pub trait Relauncher: Send + Sync {
    /// Install the new client found under `extracted` in place of the
    /// running executable.
    fn replace_client(&self, extracted: &Path) -> UpdateResult<()>;

    /// Start a new process continuing from `continuation`.
    fn relaunch(&self, continuation: &Path, elevate: bool) -> UpdateResult<()>;
}

/// The set injected into an updater.
#[derive(Clone)]
pub struct Capabilities {
    pub extractor: Arc<dyn ArchiveExtractor>,
    pub processes: Arc<dyn ProcessInspector>,
    pub delta: Arc<dyn DeltaDecoder>,
    pub relauncher: Arc<dyn Relauncher>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            extractor: Arc::new(PayloadExtractor),
            processes: Arc::new(SysinfoInspector),
            delta: Arc::new(VcdiffDecoder),
            relauncher: Arc::new(ProcessRelauncher::default()),
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

/// Zip and tar.gz payloads, told apart by their leading bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadExtractor;

impl PayloadExtractor {
    fn extract_tar_gz(archive: &Path, dest: &Path) -> UpdateResult<()> {
        let gz = flate2::read::GzDecoder::new(File::open(archive)?);
        tar::Archive::new(gz)
            .unpack(dest)
            .map_err(|e| UpdateError::ExtractionFailed {
                message: e.to_string(),
            })
    }

    fn extract_zip(archive: &Path, dest: &Path) -> UpdateResult<()> {
        let extraction = |e: zip::result::ZipError| UpdateError::ExtractionFailed {
            message: e.to_string(),
        };
        let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(extraction)?;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(extraction)?;
            let Some(relative) = entry.enclosed_name() else {
                return Err(UpdateError::ExtractionFailed {
                    message: format!("entry {} escapes the archive root", entry.name()),
                });
            };
            let out = dest.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&out)?;
                continue;
            }
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&out)?;
            std::io::copy(&mut entry, &mut file)?;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode))?;
            }
        }
        Ok(())
    }
}

impl ArchiveExtractor for PayloadExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> UpdateResult<()> {
        let mut magic = [0u8; 4];
        let read = File::open(archive)?.read(&mut magic)?;
        std::fs::create_dir_all(dest)?;
        match &magic[..read] {
            [b'P', b'K', 3, 4] => Self::extract_zip(archive, dest),
            [0x1F, 0x8B, ..] => Self::extract_tar_gz(archive, dest),
            _ => Err(UpdateError::ExtractionFailed {
                message: format!("Unknown archive format: {}", archive.display()),
            }),
        }
    }
}

/// Scans running processes for executables under the install directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoInspector;

impl ProcessInspector for SysinfoInspector {
    fn blocking_processes(&self, dirs: &[PathBuf]) -> Vec<BlockingProcess> {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_exe(UpdateKind::Always)),
        );
        let own_pid = std::process::id();
        let mut found: Vec<BlockingProcess> = system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .filter_map(|(pid, process)| {
                let exe = process.exe()?;
                dirs.iter().any(|dir| exe.starts_with(dir)).then(|| BlockingProcess {
                    pid: pid.as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                    exe: exe.to_path_buf(),
                })
            })
            .collect();
        found.sort_by_key(|p| p.pid);
        found
    }
}

/// VCDIFF deltas.
#[derive(Debug, Clone, Copy, Default)]
pub struct VcdiffDecoder;

impl DeltaDecoder for VcdiffDecoder {
    fn decode(&self, source: &[u8], patch: &[u8]) -> UpdateResult<Vec<u8>> {
        xdelta3::decode(patch, source)
            .ok_or_else(|| UpdateError::patch("VCDIFF delta could not be applied"))
    }
}

/// Replaces the running executable with `self_replace` and relaunches it
/// with `resume <file>`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRelauncher {
    /// Program wrapping the relaunch when elevating (`pkexec` by default on Unix).
    pub elevation_launcher: Option<String>,
}

impl ProcessRelauncher {
    pub fn new(elevation_launcher: Option<String>) -> Self {
        Self { elevation_launcher }
    }

    fn find_client(extracted: &Path) -> UpdateResult<PathBuf> {
        let exe = std::env::current_exe()?;
        let name = exe.file_name().ok_or_else(|| UpdateError::ReplaceFailed {
            message: format!("{} has no file name", exe.display()),
        })?;
        WalkDir::new(extracted)
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_type().is_file() && e.file_name() == name)
            .map(|e| e.into_path())
            .ok_or_else(|| UpdateError::ReplaceFailed {
                message: format!(
                    "no {} in the client update",
                    name.to_string_lossy()
                ),
            })
    }
}

impl Relauncher for ProcessRelauncher {
    fn replace_client(&self, extracted: &Path) -> UpdateResult<()> {
        let new_client = Self::find_client(extracted)?;
        tracing::info!("Replacing client with {}", new_client.display());
        self_replace::self_replace(&new_client).map_err(|e| UpdateError::ReplaceFailed {
            message: e.to_string(),
        })
    }

    fn relaunch(&self, continuation: &Path, elevate: bool) -> UpdateResult<()> {
        let exe = std::env::current_exe()?;
        let mut command = if elevate {
            elevated_command(self.elevation_launcher.as_deref(), &exe, continuation)
        } else {
            let mut c = std::process::Command::new(&exe);
            c.arg("resume").arg(continuation);
            c
        };
        tracing::info!("Relaunching {} (elevated: {})", exe.display(), elevate);
        command
            .spawn()
            .map(|_| ())
            .map_err(|e| UpdateError::RelaunchFailed {
                message: e.to_string(),
            })
    }
}

#[cfg(windows)]
fn elevated_command(
    launcher: Option<&str>,
    exe: &Path,
    continuation: &Path,
) -> std::process::Command {
    if let Some(launcher) = launcher {
        let mut c = std::process::Command::new(launcher);
        c.arg(exe).arg("resume").arg(continuation);
        return c;
    }
    let quote = |p: &Path| format!("'{}'", p.display().to_string().replace('\'', "''"));
    let mut c = std::process::Command::new("powershell");
    c.args(["-NoProfile", "-Command"]).arg(format!(
        "Start-Process -Verb RunAs -FilePath {} -ArgumentList 'resume',{}",
        quote(exe),
        quote(continuation)
    ));
    c
}

#[cfg(not(windows))]
fn elevated_command(
    launcher: Option<&str>,
    exe: &Path,
    continuation: &Path,
) -> std::process::Command {
    let mut c = std::process::Command::new(launcher.unwrap_or("pkexec"));
    c.arg(exe).arg("resume").arg(continuation);
    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn test_extracts_zip_payload() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("payload.bin");
        let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
        zip.add_directory("base/", SimpleFileOptions::default()).unwrap();
        zip.start_file("base/bin/app", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"binary").unwrap();
        zip.finish().unwrap();

        let out = dir.path().join("out");
        PayloadExtractor.extract(&archive, &out).unwrap();
        assert_eq!(std::fs::read(out.join("base/bin/app")).unwrap(), b"binary");
    }

    #[test]
    fn test_extracts_tar_gz_payload() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("payload.bin");
        let gz = flate2::write::GzEncoder::new(
            File::create(&archive).unwrap(),
            flate2::Compression::default(),
        );
        let mut tar = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, "base/readme.txt", &b"hello"[..])
            .unwrap();
        tar.into_inner().unwrap().finish().unwrap();

        let out = dir.path().join("out");
        PayloadExtractor.extract(&archive, &out).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("base/readme.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("payload.bin");
        std::fs::write(&archive, b"plain text").unwrap();
        assert!(matches!(
            PayloadExtractor.extract(&archive, &dir.path().join("out")),
            Err(UpdateError::ExtractionFailed { .. })
        ));
    }

    #[test]
    fn test_vcdiff_roundtrip() {
        let source = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let mut target = source.clone();
        target.extend_from_slice(b" and runs away");
        let patch = xdelta3::encode(&target, &source).unwrap();
        assert_eq!(VcdiffDecoder.decode(&source, &patch).unwrap(), target);
        assert!(VcdiffDecoder.decode(&source, b"not a delta").is_err());
    }

    #[test]
    fn test_no_blockers_in_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            SysinfoInspector
                .blocking_processes(&[dir.path().to_path_buf()])
                .is_empty()
        );
    }
}
