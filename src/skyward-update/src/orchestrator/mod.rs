//! Update orchestration: the step sequence of a run, rollback, the catch-all
//! retry and handing a run off to a relaunched process.

mod events;
mod step;

pub use events::{CheckOutcome, Operation, ProcessDecision, RunOutcome, UpdateEvent, UpdateOffer};
pub use step::UpdateStep;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use skyward_common::{AppDirs, FileLockGuard, try_acquire_lock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::apply::{
    ConfigRollback, ExecPhase, FileApplier, FileTransaction, apply_config_changes,
    launch_post_update, run_executables,
};
use crate::capabilities::{BlockingProcess, Capabilities, ProcessRelauncher};
use crate::codec::{Record, read_record};
use crate::config::EngineConfig;
use crate::config_store::{ConfigStore, JsonConfigStore};
use crate::download::{DownloadRequest, Downloader};
use crate::elevation::{InstallLocation, InstallTargets, Privilege, elevation_reason};
use crate::error::{ResultCode, UpdateError, UpdateResult};
use crate::manifest::{
    ClientManifest, ContinuationKind, ContinuationRecord, DETAILS_FILE, ServerManifest,
    UninstallRecord, UpdateDetails, VersionChoice,
};
use crate::resolver::{self, ResolvedPatch};
use crate::uninstall;
use crate::version::VersionComparator;

const SERVER_MANIFEST_FILE: &str = "server.manifest";
const CLIENT_UPDATE_MANIFEST_FILE: &str = "client-update.manifest";
const CONTINUATION_FILE: &str = "continue.dat";

/// How long a relaunched process waits for its predecessor's run lock.
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(200);

/// Asks the caller what to do about programs blocking the install.
pub type ProcessDecisionFn =
    dyn Fn(Vec<BlockingProcess>) -> oneshot::Receiver<ProcessDecision> + Send + Sync;

/// State of one install attempt.
#[derive(Debug, Clone)]
struct Run {
    manifest: ServerManifest,
    manifest_path: PathBuf,
    patch: ResolvedPatch,
    temp_dir: PathBuf,
    payload: Option<PathBuf>,
    self_updated: bool,
    elevated: bool,
    resume_from: UpdateStep,
}

/// Drives update runs for one installed product.
pub struct Updater {
    client_path: PathBuf,
    client: ClientManifest,
    config: EngineConfig,
    dirs: AppDirs,
    comparator: VersionComparator,
    downloader: Downloader,
    capabilities: Capabilities,
    store: Arc<dyn ConfigStore>,
    /// File behind `store`, when it is the default JSON store.
    store_path: Option<PathBuf>,
    targets: InstallTargets,
    server_override: Option<String>,
    client_version: String,
    privilege: Privilege,
    cancel: CancellationToken,
    decide: Option<Arc<ProcessDecisionFn>>,
    events: mpsc::UnboundedSender<UpdateEvent>,
}

impl Updater {
    /// Updater for the product described by the client manifest at
    /// `client_manifest`, installed in `base_dir`.
    pub fn new(
        client_manifest: impl Into<PathBuf>,
        base_dir: impl Into<PathBuf>,
        config: EngineConfig,
        dirs: AppDirs,
    ) -> UpdateResult<(Self, mpsc::UnboundedReceiver<UpdateEvent>)> {
        let client_path = client_manifest.into();
        let client: ClientManifest = read_record(&client_path)?;
        let store_path = config.config_store_path(&dirs);
        let store: Arc<dyn ConfigStore> = Arc::new(JsonConfigStore::open(&store_path)?);
        let capabilities = Capabilities {
            relauncher: Arc::new(ProcessRelauncher::new(config.elevation_launcher.clone())),
            ..Capabilities::default()
        };
        let (events, receiver) = mpsc::unbounded_channel();

        let updater = Self {
            client_path,
            client,
            comparator: config.comparator(),
            downloader: Downloader::new(&config)?,
            capabilities,
            store,
            store_path: Some(store_path),
            targets: InstallTargets::for_base_dir(base_dir),
            server_override: None,
            client_version: crate::CURRENT_VERSION.to_string(),
            privilege: Privilege::current(),
            cancel: CancellationToken::new(),
            decide: None,
            events,
            config,
            dirs,
        };
        Ok((updater, receiver))
    }

    /// Updater for a run handed off by another process.
    ///
    /// App directories and the configuration store come from `record`, so
    /// an elevated process with a different environment still shares the
    /// run lock and store of the process that wrote it. `fallback` is used
    /// for records that carry no directories.
    pub fn for_continuation(
        record: &ContinuationRecord,
        fallback: AppDirs,
    ) -> UpdateResult<(Self, mpsc::UnboundedReceiver<UpdateEvent>)> {
        let dirs = record.app_dirs().unwrap_or(fallback);
        let mut config = EngineConfig::load(&dirs);
        if let Some(store) = &record.config_store {
            config.config_store = Some(store.clone());
        }
        let (updater, events) = Self::new(&record.client_manifest, &record.base_dir, config, dirs)?;
        Ok((updater.with_server_override(record.server_override.clone()), events))
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = store;
        self.store_path = None;
        self
    }

    pub fn with_targets(mut self, targets: InstallTargets) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = downloader;
        self
    }

    /// Fetch the server manifest from `url` instead of the client's mirrors.
    pub fn with_server_override(mut self, url: Option<String>) -> Self {
        self.server_override = url;
        self
    }

    /// Version of the running updater client, compared against the
    /// server's minimum client version.
    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Callback consulted when programs block the install. Without one the
    /// run fails with `ProcessesBlocking`.
    pub fn with_process_decision<F>(mut self, decide: F) -> Self
    where
        F: Fn(Vec<BlockingProcess>) -> oneshot::Receiver<ProcessDecision> + Send + Sync + 'static,
    {
        self.decide = Some(Arc::new(decide));
        self
    }

    pub fn client(&self) -> &ClientManifest {
        &self.client
    }

    pub fn targets(&self) -> &InstallTargets {
        &self.targets
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `operation` on a Tokio task.
    pub fn spawn(self, operation: Operation) -> JoinHandle<UpdateResult<RunOutcome>> {
        tokio::spawn(async move { self.perform(operation).await })
    }

    pub async fn perform(&self, operation: Operation) -> UpdateResult<RunOutcome> {
        match operation {
            Operation::Check => self.check_for_update().await.map(RunOutcome::from),
            Operation::Update => self.run().await,
            Operation::Apply(offer) => self.download_and_apply(&offer).await,
            Operation::Resume(record) => self.resume(*record).await,
            Operation::Uninstall => self.uninstall().await,
        }
    }

    fn emit(&self, event: UpdateEvent) {
        let _ = self.events.send(event);
    }

    fn start(&self, step: UpdateStep) -> UpdateResult<()> {
        if self.cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        tracing::info!("Step: {}", step);
        self.emit(UpdateEvent::StepStarted(step));
        Ok(())
    }

    fn skip(&self, step: UpdateStep) {
        tracing::debug!("Skipping step: {}", step);
        self.emit(UpdateEvent::StepSkipped(step));
    }

    fn finish<T>(
        &self,
        result: UpdateResult<T>,
        code: impl FnOnce(&T) -> ResultCode,
    ) -> UpdateResult<T> {
        let code = match &result {
            Ok(value) => code(value),
            Err(e) => {
                tracing::error!("Update failed: {}", e);
                e.code()
            }
        };
        self.emit(UpdateEvent::Finished(code));
        result
    }

    /// Short stable key for the install target.
    fn target_key(&self) -> String {
        let digest = Sha256::digest(self.targets.base_dir.to_string_lossy().as_bytes());
        hex::encode(&digest[..8])
    }

    fn temp_dir(&self) -> PathBuf {
        self.config.temp_root(&self.dirs).join(self.target_key())
    }

    /// Lock file guarding runs against this install target.
    pub fn lock_path(&self) -> PathBuf {
        self.dirs
            .locks_dir()
            .join(format!("{}.lock", self.target_key()))
    }

    async fn acquire_lock(&self, wait: bool) -> UpdateResult<FileLockGuard> {
        let path = self.lock_path();
        let deadline = tokio::time::Instant::now() + if wait { LOCK_WAIT } else { Duration::ZERO };
        loop {
            let acquired = try_acquire_lock(&path)
                .map_err(|e| UpdateError::Io(std::io::Error::other(e.to_string())))?;
            if let Some(mut guard) = acquired {
                if let Err(e) = guard.stamp_owner() {
                    tracing::debug!("Failed to stamp {}: {}", path.display(), e);
                }
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(UpdateError::AlreadyRunning {
                    target: self.targets.base_dir.clone(),
                });
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    /// Download the server manifest and decide whether an update applies.
    pub async fn check_for_update(&self) -> UpdateResult<CheckOutcome> {
        let result = self.check_inner().await;
        self.finish(result, |outcome| RunOutcome::from(outcome.clone()).code())
    }

    async fn check_inner(&self) -> UpdateResult<CheckOutcome> {
        self.start(UpdateStep::CheckForUpdate)?;
        let mirrors = match &self.server_override {
            Some(url) => vec![url.clone()],
            None => self.client.server_mirrors.clone(),
        };
        if mirrors.is_empty() {
            return Err(UpdateError::NoMirrors {
                what: "server manifest",
            });
        }

        // The manifest file is shared with any run on this target
        let _lock = self.acquire_lock(false).await?;
        let temp_dir = self.temp_dir();
        tokio::fs::create_dir_all(&temp_dir).await?;
        let manifest_path = temp_dir.join(SERVER_MANIFEST_FILE);
        let _ = tokio::fs::remove_file(&manifest_path).await;
        self.downloader
            .fetch(
                &DownloadRequest::new(mirrors, &manifest_path),
                &self.cancel,
                |progress| {
                    self.emit(UpdateEvent::DownloadProgress {
                        artifact: ServerManifest::NAME,
                        progress,
                    })
                },
            )
            .await?;
        let manifest: ServerManifest = read_record(&manifest_path)?;

        if manifest.choices.is_empty() {
            tracing::info!("Server publishes no updates");
            self.emit(UpdateEvent::StepStarted(UpdateStep::NoUpdateAvailable));
            return Ok(CheckOutcome::NoUpdateAvailable);
        }
        let installed = &self.client.installed_version;
        if self
            .comparator
            .meets_minimum(installed, &manifest.new_version)
        {
            tracing::info!("{} is up to date", installed);
            self.emit(UpdateEvent::StepStarted(UpdateStep::AlreadyLatest));
            return Ok(CheckOutcome::AlreadyLatest {
                version: installed.clone(),
                message: manifest.no_update_text.clone(),
                url: manifest.no_update_url.clone(),
            });
        }

        let patch = resolver::resolve(&manifest, installed, &self.comparator)?;
        let choice = choice_of(&manifest, &patch, installed)?;
        let (rtf_changelog, size) = (choice.rtf_changes, choice.size);
        let offer = UpdateOffer {
            installed_version: installed.clone(),
            new_version: manifest.new_version.clone(),
            changelog: resolver::changelog(&manifest, &patch, &self.comparator),
            rtf_changelog,
            size,
            patch,
            manifest,
            manifest_path,
        };
        tracing::info!(
            "Update available: {} -> {}",
            offer.installed_version,
            offer.new_version
        );
        self.emit(UpdateEvent::UpdateAvailable(Box::new(offer.clone())));
        Ok(CheckOutcome::UpdateAvailable(Box::new(offer)))
    }

    /// Check, then apply whatever was found.
    pub async fn run(&self) -> UpdateResult<RunOutcome> {
        let result = async {
            match self.check_inner().await? {
                CheckOutcome::UpdateAvailable(offer) => self.apply_offer(&offer).await,
                other => Ok(other.into()),
            }
        }
        .await;
        self.finish(result, RunOutcome::code)
    }

    /// Download, verify and install `offer`.
    pub async fn download_and_apply(&self, offer: &UpdateOffer) -> UpdateResult<RunOutcome> {
        let result = self.apply_offer(offer).await;
        self.finish(result, RunOutcome::code)
    }

    async fn apply_offer(&self, offer: &UpdateOffer) -> UpdateResult<RunOutcome> {
        let _lock = self.acquire_lock(false).await?;
        let run = Run {
            manifest: offer.manifest.clone(),
            manifest_path: offer.manifest_path.clone(),
            patch: offer.patch,
            temp_dir: self.temp_dir(),
            payload: None,
            self_updated: false,
            elevated: self.privilege.is_elevated(),
            resume_from: UpdateStep::DownloadPayload,
        };
        self.execute(run).await
    }

    /// Continue a run handed off by an earlier process.
    pub async fn resume(&self, record: ContinuationRecord) -> UpdateResult<RunOutcome> {
        let result = async {
            let _lock = self.acquire_lock(true).await?;
            tracing::info!(
                "Resuming {:?} run at step: {}",
                record.kind,
                record.resume_step
            );
            let manifest: ServerManifest = read_record(&record.server_manifest)?;
            let patch = if record.use_catch_all {
                let index = manifest.catch_all_index(&self.comparator).ok_or_else(|| {
                    UpdateError::NoUpdatePathToNewest {
                        installed: self.client.installed_version.clone(),
                        latest: manifest.new_version.clone(),
                    }
                })?;
                ResolvedPatch {
                    index,
                    catch_all: true,
                }
            } else {
                resolver::resolve(&manifest, &self.client.installed_version, &self.comparator)?
            };
            let run = Run {
                manifest,
                manifest_path: record.server_manifest.clone(),
                patch,
                temp_dir: record.temp_dir.clone(),
                payload: record.payload.clone(),
                self_updated: record.self_updated,
                elevated: record.elevated,
                resume_from: record.resume_step,
            };
            if let Err(e) = tokio::fs::remove_file(&record.continuation_file).await {
                tracing::debug!("Continuation file already gone: {}", e);
            }
            self.execute(run).await
        }
        .await;
        self.finish(result, RunOutcome::code)
    }

    /// Remove everything recorded by committed runs.
    pub async fn uninstall(&self) -> UpdateResult<RunOutcome> {
        let result = async {
            let _lock = self.acquire_lock(false).await?;
            let path = uninstall::record_path(&self.client_path);
            let record = uninstall::load_record(&path)?;
            let failures = uninstall::remove_installed(&record, self.store.as_ref());
            if !failures.is_empty() {
                tracing::warn!("{} item(s) could not be removed", failures.len());
            }
            match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            Ok(RunOutcome::Uninstalled)
        }
        .await;
        self.finish(result, RunOutcome::code)
    }

    /// Install attempts, falling back to the catch-all once when a delta fails.
    async fn execute(&self, mut run: Run) -> UpdateResult<RunOutcome> {
        loop {
            match self.install(&mut run).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if !run.patch.catch_all && e.allows_catch_all_retry() => {
                    let Some(index) = run.manifest.catch_all_index(&self.comparator) else {
                        return Err(e);
                    };
                    tracing::warn!("Delta patch failed ({}), retrying with catch-all", e);
                    self.emit(UpdateEvent::RetryingWithCatchAll {
                        cause: e.to_string(),
                    });
                    run.patch = ResolvedPatch {
                        index,
                        catch_all: true,
                    };
                    run.payload = None;
                    run.resume_from = UpdateStep::DownloadPayload;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn install(&self, run: &mut Run) -> UpdateResult<RunOutcome> {
        let choice = choice_of(&run.manifest, &run.patch, &self.client.installed_version)?.clone();
        tokio::fs::create_dir_all(&run.temp_dir).await?;

        if let Some(reason) = elevation_reason(self.privilege, &choice, &self.targets) {
            return self.relaunch_elevated(run, reason);
        }

        self.download_payload(run, &choice).await?;

        if let Some(outcome) = self.self_update_client(run).await? {
            return Ok(outcome);
        }

        self.start(UpdateStep::ExtractPayload)?;
        let payload = run
            .payload
            .clone()
            .ok_or_else(|| UpdateError::patch("payload missing after download"))?;
        let extracted = run.temp_dir.join("payload");
        self.extract(&payload, &extracted).await?;
        let details_path = extracted.join(DETAILS_FILE);
        let details: Option<UpdateDetails> = if details_path.is_file() {
            Some(read_record(&details_path)?)
        } else {
            None
        };

        self.close_blocking_processes(&choice).await?;

        let mut files = FileTransaction::new(run.temp_dir.join("backup"));
        let mut config_log = ConfigRollback::new();
        let applied = self
            .apply_changes(run, &extracted, details.as_ref(), &mut files, &mut config_log)
            .await;
        if let Err((step, cause)) = applied {
            let mut failures = config_log.rollback(self.store.as_ref());
            failures.extend(files.rollback());
            tracing::warn!("Rolled back after failure during {}", step);
            self.emit(UpdateEvent::RolledBack {
                step,
                failures: failures.clone(),
            });
            return Err(UpdateError::InstallFailed {
                step: step.to_string(),
                source: Box::new(cause),
                rollback_errors: failures,
            });
        }
        let committed = files.commit();
        tracing::debug!(
            "Committed {} new file(s) and {} new folder(s)",
            committed.created_files.len(),
            committed.created_dirs.len()
        );

        self.start(UpdateStep::DeleteTemp)?;
        if let Err(e) = tokio::fs::remove_dir_all(&run.temp_dir).await {
            tracing::warn!("Failed to remove {}: {}", run.temp_dir.display(), e);
        }

        self.emit(UpdateEvent::StepStarted(UpdateStep::Done));
        if let Some(command) = details.as_ref().and_then(|d| d.post_update_command.as_deref()) {
            launch_post_update(command, &self.targets.base_dir);
        }
        tracing::info!(
            "Updated {} from {} to {}",
            self.client.product,
            self.client.installed_version,
            run.manifest.new_version
        );
        Ok(RunOutcome::Updated {
            from: self.client.installed_version.clone(),
            to: run.manifest.new_version.clone(),
        })
    }

    async fn download_payload(&self, run: &mut Run, choice: &VersionChoice) -> UpdateResult<()> {
        let have_payload = run.payload.as_deref().is_some_and(Path::is_file);
        if run.resume_from > UpdateStep::DownloadPayload && have_payload {
            self.skip(UpdateStep::DownloadPayload);
            return Ok(());
        }
        self.start(UpdateStep::DownloadPayload)?;
        let destination = run.temp_dir.join(format!("payload-{}.bin", run.patch.index));
        let request = DownloadRequest {
            mirrors: choice.mirrors.clone(),
            destination,
            expected_size: (choice.size > 0).then_some(choice.size),
            sha256: choice.sha256,
            signature: choice.signature.clone(),
            public_key: self.client.public_key,
        };
        let path = self
            .downloader
            .fetch(&request, &self.cancel, |progress| {
                self.emit(UpdateEvent::DownloadProgress {
                    artifact: "payload",
                    progress,
                })
            })
            .await?;
        run.payload = Some(path);
        Ok(())
    }

    /// Replace the updater client first when the server requires a newer
    /// one. Returns an outcome when the run was handed off.
    async fn self_update_client(&self, run: &mut Run) -> UpdateResult<Option<RunOutcome>> {
        let needs_update = match &run.manifest.min_client_version {
            Some(minimum) => !self.comparator.meets_minimum(&self.client_version, minimum),
            None => false,
        };
        if run.self_updated || !needs_update {
            self.skip(UpdateStep::SelfUpdateClient);
            return Ok(None);
        }

        self.start(UpdateStep::SelfUpdateClient)?;
        if run.manifest.client_update_mirrors.is_empty() {
            return Err(UpdateError::NoMirrors {
                what: "client update",
            });
        }
        let manifest_path = run.temp_dir.join(CLIENT_UPDATE_MANIFEST_FILE);
        let _ = tokio::fs::remove_file(&manifest_path).await;
        self.downloader
            .fetch(
                &DownloadRequest::new(run.manifest.client_update_mirrors.clone(), &manifest_path),
                &self.cancel,
                |_| {},
            )
            .await?;
        let client_manifest: ServerManifest = read_record(&manifest_path)?;
        let patch = resolver::resolve(&client_manifest, &self.client_version, &self.comparator)?;
        let choice = choice_of(&client_manifest, &patch, &self.client_version)?;

        let archive = self
            .downloader
            .fetch(
                &DownloadRequest {
                    mirrors: choice.mirrors.clone(),
                    destination: run.temp_dir.join("client-update.bin"),
                    expected_size: (choice.size > 0).then_some(choice.size),
                    sha256: choice.sha256,
                    signature: choice.signature.clone(),
                    public_key: self.client.public_key,
                },
                &self.cancel,
                |progress| {
                    self.emit(UpdateEvent::DownloadProgress {
                        artifact: "client update",
                        progress,
                    })
                },
            )
            .await?;
        let extracted = run.temp_dir.join("client");
        self.extract(&archive, &extracted).await?;
        self.capabilities.relauncher.replace_client(&extracted)?;
        run.self_updated = true;
        tracing::info!("Updater client replaced with {}", client_manifest.new_version);

        if !self.config.allow_relaunch {
            tracing::info!("Relaunch disabled, continuing in this process");
            return Ok(None);
        }
        self.hand_off(run, ContinuationKind::SelfUpdate, UpdateStep::ExtractPayload, false)?;
        Ok(Some(RunOutcome::Relaunched))
    }

    fn relaunch_elevated(&self, run: &Run, reason: String) -> UpdateResult<RunOutcome> {
        if run.elevated || !self.config.allow_relaunch {
            return Err(UpdateError::ElevationRequired { reason });
        }
        tracing::info!("Elevation required: {}", reason);
        self.hand_off(run, ContinuationKind::AutoUpdate, UpdateStep::DownloadPayload, true)
            .map_err(|e| UpdateError::ElevationRequired {
                reason: format!("{reason} (relaunch failed: {e})"),
            })?;
        Ok(RunOutcome::Relaunched)
    }

    /// Persist the run and start a new process continuing at `resume_step`.
    fn hand_off(
        &self,
        run: &Run,
        kind: ContinuationKind,
        resume_step: UpdateStep,
        elevate: bool,
    ) -> UpdateResult<()> {
        let record = ContinuationRecord {
            kind,
            client_manifest: self.client_path.clone(),
            server_manifest: run.manifest_path.clone(),
            temp_dir: run.temp_dir.clone(),
            base_dir: self.targets.base_dir.clone(),
            server_override: self.server_override.clone(),
            continuation_file: run.temp_dir.join(CONTINUATION_FILE),
            payload: run.payload.clone(),
            config_dir: Some(self.dirs.config_dir.clone()),
            cache_dir: Some(self.dirs.cache_dir.clone()),
            config_store: self.store_path.clone(),
            resume_step,
            elevated: run.elevated || elevate,
            self_updated: run.self_updated,
            use_catch_all: run.patch.catch_all,
        };
        record.save()?;
        self.emit(UpdateEvent::Relaunching { elevate });
        self.capabilities
            .relauncher
            .relaunch(&record.continuation_file, elevate)
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> UpdateResult<()> {
        if dest.exists() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        let extractor = Arc::clone(&self.capabilities.extractor);
        let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
        tokio::task::spawn_blocking(move || extractor.extract(&archive, &dest))
            .await
            .map_err(|e| UpdateError::ExtractionFailed {
                message: e.to_string(),
            })?
    }

    async fn close_blocking_processes(&self, choice: &VersionChoice) -> UpdateResult<()> {
        let dirs: Vec<PathBuf> = InstallLocation::ALL
            .into_iter()
            .filter(|loc| {
                *loc == InstallLocation::Base || choice.installing_to.contains(loc.flag())
            })
            // The whole drive would match every process
            .filter(|loc| *loc != InstallLocation::RootDrive)
            .map(|loc| self.targets.path(loc).to_path_buf())
            .collect();

        let mut started = false;
        loop {
            let blocking = self.capabilities.processes.blocking_processes(&dirs);
            if blocking.is_empty() {
                if !started {
                    self.skip(UpdateStep::CloseBlockingProcesses);
                }
                return Ok(());
            }
            if !started {
                self.start(UpdateStep::CloseBlockingProcesses)?;
                started = true;
            }
            let names: Vec<String> = blocking
                .iter()
                .map(|p| format!("{} ({})", p.name, p.pid))
                .collect();
            tracing::info!("Blocking processes: {}", names.join(", "));
            self.emit(UpdateEvent::ProcessesBlocking(blocking.clone()));

            let decision = match &self.decide {
                Some(decide) => {
                    let answer = (**decide)(blocking);
                    tokio::select! {
                        answer = answer => answer.unwrap_or(ProcessDecision::Cancel),
                        _ = self.cancel.cancelled() => return Err(UpdateError::Cancelled),
                    }
                }
                None => ProcessDecision::Cancel,
            };
            if decision == ProcessDecision::Cancel {
                return Err(UpdateError::ProcessesBlocking { processes: names });
            }
        }
    }

    /// The transactional part of a run. On failure reports the step that
    /// failed; the caller rolls back.
    async fn apply_changes(
        &self,
        run: &Run,
        extracted: &Path,
        details: Option<&UpdateDetails>,
        files: &mut FileTransaction,
        config_log: &mut ConfigRollback,
    ) -> Result<(), (UpdateStep, UpdateError)> {
        let at = |step: UpdateStep| move |e: UpdateError| (step, e);

        match details.filter(|d| d.has_executables(true)) {
            Some(details) => {
                self.start(UpdateStep::PreExecute).map_err(at(UpdateStep::PreExecute))?;
                run_executables(details, ExecPhase::Before, extracted, &self.targets, &self.cancel)
                    .await
                    .map_err(at(UpdateStep::PreExecute))?;
            }
            None => self.skip(UpdateStep::PreExecute),
        }

        self.start(UpdateStep::BackupAndInstallFiles)
            .map_err(at(UpdateStep::BackupAndInstallFiles))?;
        let shortcuts = FileApplier::new(&self.targets, self.capabilities.delta.as_ref())
            .apply(extracted, details, files, &self.cancel)
            .map_err(at(UpdateStep::BackupAndInstallFiles))?;

        match details.filter(|d| !d.config_changes.is_empty()) {
            Some(details) => {
                self.start(UpdateStep::ModifyConfig).map_err(at(UpdateStep::ModifyConfig))?;
                apply_config_changes(
                    &details.config_changes,
                    self.store.as_ref(),
                    config_log,
                    &self.cancel,
                )
                .map_err(at(UpdateStep::ModifyConfig))?;
            }
            None => self.skip(UpdateStep::ModifyConfig),
        }

        match details.filter(|d| d.has_executables(false)) {
            Some(details) => {
                self.start(UpdateStep::PostExecute).map_err(at(UpdateStep::PostExecute))?;
                run_executables(details, ExecPhase::After, extracted, &self.targets, &self.cancel)
                    .await
                    .map_err(at(UpdateStep::PostExecute))?;
            }
            None => self.skip(UpdateStep::PostExecute),
        }

        self.commit_manifest(run, &shortcuts, files, config_log)
            .map_err(at(UpdateStep::CommitManifest))
    }

    /// Record the new version and what this run created.
    fn commit_manifest(
        &self,
        run: &Run,
        shortcuts: &[PathBuf],
        files: &mut FileTransaction,
        config_log: &ConfigRollback,
    ) -> UpdateResult<()> {
        self.start(UpdateStep::CommitManifest)?;

        let mut client = self.client.clone();
        client.installed_version = run.manifest.new_version.clone();
        if !run.manifest.mirrors.is_empty() {
            client.server_mirrors = run.manifest.mirrors.clone();
        }

        let record_path = uninstall::record_path(&self.client_path);
        let created = files.created();
        let as_string = |p: &PathBuf| p.to_string_lossy().into_owned();
        let this_run = UninstallRecord {
            files: created
                .created_files
                .iter()
                .filter(|p| **p != record_path && !shortcuts.contains(p))
                .map(as_string)
                .collect(),
            folders: created.created_dirs.iter().map(as_string).collect(),
            shortcuts: shortcuts.iter().map(as_string).collect(),
            config_changes: config_log.creations(),
        };
        let record = uninstall::merged(&record_path, this_run)?;

        files.write(&self.client_path, &client.encode())?;
        files.write(&record_path, &record.encode())?;
        Ok(())
    }
}

fn choice_of<'a>(
    manifest: &'a ServerManifest,
    patch: &ResolvedPatch,
    installed: &str,
) -> UpdateResult<&'a VersionChoice> {
    patch
        .choice(manifest)
        .ok_or_else(|| UpdateError::NoUpdatePathToNewest {
            installed: installed.to_string(),
            latest: manifest.new_version.clone(),
        })
}
