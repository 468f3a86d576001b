//! End-to-end update runs against a mock mirror.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use reqwest::Client;
use skyward_common::{AppDirs, try_acquire_lock};
use skyward_update::apply::ConfigChange;
use skyward_update::codec::{Record, read_record, write_record};
use skyward_update::manifest::{ContinuationKind, FileIntent, FileOp, UpdateDetails};
use skyward_update::verify::sha256_bytes;
use skyward_update::{
    BaseScope, BlockingProcess, Capabilities, CheckOutcome, ClientManifest, ConfigStore,
    ConfigValue, ContinuationRecord, Downloader, EngineConfig, InstallLocation, InstallTargets,
    InstallingTo, JsonConfigStore, MemoryConfigStore, Privilege, ProcessDecision, ProcessInspector,
    Relauncher, ResultCode, RunOutcome, ServerManifest, UpdateError, UpdateEvent, UpdateResult, UpdateStep,
    Updater, VersionChoice,
};
use tokio::sync::{mpsc, oneshot};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

/// Reports the queued answers in order, then nothing.
#[derive(Default)]
struct ScriptedInspector {
    answers: Mutex<Vec<Vec<BlockingProcess>>>,
}

impl ProcessInspector for ScriptedInspector {
    fn blocking_processes(&self, _dirs: &[PathBuf]) -> Vec<BlockingProcess> {
        let mut answers = self.answers.lock();
        if answers.is_empty() {
            Vec::new()
        } else {
            answers.remove(0)
        }
    }
}

#[derive(Default)]
struct RecordingRelauncher {
    relaunches: Mutex<Vec<(PathBuf, bool)>>,
}

impl Relauncher for RecordingRelauncher {
    fn replace_client(&self, _extracted: &Path) -> UpdateResult<()> {
        Ok(())
    }

    fn relaunch(&self, continuation: &Path, elevate: bool) -> UpdateResult<()> {
        self.relaunches
            .lock()
            .push((continuation.to_path_buf(), elevate));
        Ok(())
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    app: PathBuf,
    client_path: PathBuf,
    store: Arc<MemoryConfigStore>,
    inspector: Arc<ScriptedInspector>,
    relauncher: Arc<RecordingRelauncher>,
}

impl Fixture {
    fn new(installed: &str, server: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("sky.bin"), "v1 binary").unwrap();

        let client_path = dir.path().join("client").join("client.wyc");
        std::fs::create_dir_all(client_path.parent().unwrap()).unwrap();
        let client = ClientManifest {
            company: "Skyward".into(),
            product: "Sky".into(),
            installed_version: installed.into(),
            server_mirrors: vec![format!("{server}/server.manifest")],
            ..Default::default()
        };
        write_record(&client_path, &client).unwrap();

        Self {
            dir,
            app,
            client_path,
            store: Arc::new(MemoryConfigStore::new()),
            inspector: Arc::new(ScriptedInspector::default()),
            relauncher: Arc::new(RecordingRelauncher::default()),
        }
    }

    fn targets(&self) -> InstallTargets {
        InstallTargets::for_base_dir(&self.app)
            .with_user_profile(Some(self.dir.path().to_path_buf()))
    }

    fn dirs(&self) -> AppDirs {
        AppDirs::rooted_at(&self.dir.path().join("skyward"))
    }

    /// Scripted capabilities and a direct client, keeping the default store.
    fn wire(&self, updater: Updater) -> Updater {
        let capabilities = Capabilities {
            processes: self.inspector.clone(),
            relauncher: self.relauncher.clone(),
            ..Capabilities::default()
        };
        let client = Client::builder().no_proxy().build().unwrap();
        updater
            .with_capabilities(capabilities)
            .with_downloader(Downloader::with_clients(client.clone(), client, 4096))
            .with_targets(self.targets())
    }

    fn updater(&self) -> (Updater, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (updater, events) =
            Updater::new(&self.client_path, &self.app, EngineConfig::default(), self.dirs())
                .unwrap();
        let updater = self
            .wire(updater)
            .with_config_store(self.store.clone())
            .with_privilege(Privilege::Standard);
        (updater, events)
    }

    fn installed_version(&self) -> String {
        read_record::<ClientManifest>(&self.client_path)
            .unwrap()
            .installed_version
    }
}

fn zip_payload(files: &[(&str, &[u8])], details: Option<&UpdateDetails>) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in files {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(contents).unwrap();
    }
    if let Some(details) = details {
        zip.start_file("updtdetails.udt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(&details.encode()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn choice(version: &str, url: String, payload: &[u8]) -> VersionChoice {
    VersionChoice {
        changes: format!("changes from {version}"),
        mirrors: vec![url],
        size: payload.len() as u64,
        sha256: sha256_bytes(payload),
        installing_to: InstallingTo::BASE_DIR,
        ..VersionChoice::new(version)
    }
}

async fn serve(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

fn drain(events: &mut mpsc::UnboundedReceiver<UpdateEvent>) -> Vec<UpdateEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn sky_key_details() -> UpdateDetails {
    UpdateDetails {
        config_changes: vec![ConfigChange::CreateValue {
            scope: BaseScope::CurrentUser,
            path: "Software\\Sky".into(),
            name: "Version".into(),
            value: ConfigValue::String("2.0".into()),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_check_then_apply_delta() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("1.0", &server.uri());

    let details = sky_key_details();
    let delta = zip_payload(
        &[("base/sky.bin", b"v2 binary"), ("base/lib/extra.so", b"extra")],
        Some(&details),
    );
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![
            choice("1.0", format!("{}/delta.zip", server.uri()), &delta),
            choice("2.0", format!("{}/full.zip", server.uri()), b"unused"),
        ],
        ..Default::default()
    };
    serve(&server, "/server.manifest", manifest.encode()).await;
    serve(&server, "/delta.zip", delta).await;

    let (updater, mut events) = fixture.updater();
    let CheckOutcome::UpdateAvailable(offer) = updater.check_for_update().await.unwrap() else {
        panic!("expected an update");
    };
    assert_eq!(offer.new_version, "2.0");
    assert!(!offer.patch.catch_all);
    assert!(offer.changelog.contains("changes from 1.0"));

    let outcome = updater.download_and_apply(&offer).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Updated { ref from, ref to } if from == "1.0" && to == "2.0"));

    assert_eq!(
        std::fs::read_to_string(fixture.app.join("sky.bin")).unwrap(),
        "v2 binary"
    );
    assert!(fixture.app.join("lib/extra.so").exists());
    assert!(!fixture.app.join("updtdetails.udt").exists());
    assert_eq!(fixture.installed_version(), "2.0");
    assert_eq!(
        fixture
            .store
            .get_value(BaseScope::CurrentUser, "Software\\Sky", "Version")
            .unwrap(),
        Some(ConfigValue::String("2.0".into()))
    );

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, UpdateEvent::UpdateAvailable(_))));
    assert!(events.iter().any(|e| matches!(e, UpdateEvent::StepStarted(UpdateStep::ModifyConfig))));
    assert!(events.iter().any(|e| matches!(e, UpdateEvent::StepSkipped(UpdateStep::PreExecute))));
    assert!(matches!(
        events.last(),
        Some(UpdateEvent::Finished(ResultCode::Success))
    ));
}

#[tokio::test]
async fn test_failed_delta_falls_back_to_catch_all() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("1.0", &server.uri());

    let full = zip_payload(&[("base/sky.bin", b"v2 full")], None);
    let mut delta = choice("1.0", format!("{}/delta.zip", server.uri()), b"whatever");
    delta.sha256 = [7u8; 32];
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![delta, choice("2.0", format!("{}/full.zip", server.uri()), &full)],
        ..Default::default()
    };
    serve(&server, "/server.manifest", manifest.encode()).await;
    serve(&server, "/delta.zip", b"whatever".to_vec()).await;
    serve(&server, "/full.zip", full).await;

    let (updater, mut events) = fixture.updater();
    let outcome = updater.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Updated { .. }));
    assert_eq!(
        std::fs::read_to_string(fixture.app.join("sky.bin")).unwrap(),
        "v2 full"
    );

    let events = drain(&mut events);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, UpdateEvent::RetryingWithCatchAll { .. }))
    );
    let finished = events
        .iter()
        .filter(|e| matches!(e, UpdateEvent::Finished(_)))
        .count();
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn test_already_latest_reports_server_text() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("2.0", &server.uri());
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        no_update_text: Some("You're current".into()),
        choices: vec![VersionChoice::new("2.0")],
        ..Default::default()
    };
    serve(&server, "/server.manifest", manifest.encode()).await;

    let (updater, _events) = fixture.updater();
    match updater.check_for_update().await.unwrap() {
        CheckOutcome::AlreadyLatest { version, message, .. } => {
            assert_eq!(version, "2.0");
            assert_eq!(message.as_deref(), Some("You're current"));
        }
        other => panic!("unexpected {other:?}"),
    }
    let outcome = updater.run().await.unwrap();
    assert_eq!(outcome.code(), ResultCode::NoUpdate);
    assert_eq!(ResultCode::NoUpdate.exit_code(), 2);
}

#[tokio::test]
async fn test_install_failure_rolls_back_everything() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("1.0", &server.uri());
    fixture
        .store
        .create_key(BaseScope::CurrentUser, "Software\\Other")
        .unwrap();
    let store_before = fixture.store.dump();

    // The delta targets a file that is not installed, so patching fails
    // after the plain files were copied.
    let details = UpdateDetails {
        files: vec![FileOp {
            relative_path: "base/missing.bin".into(),
            intent: FileIntent::DeltaPatch {
                patch_path: "base/missing.bin.patch".into(),
                expected_sha256: [0u8; 32],
            },
        }],
        ..sky_key_details()
    };
    let full = zip_payload(
        &[
            ("base/sky.bin", b"v2 binary"),
            ("base/new/file.txt", b"new"),
            ("base/missing.bin.patch", b"delta"),
        ],
        Some(&details),
    );
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![choice("2.0", format!("{}/full.zip", server.uri()), &full)],
        ..Default::default()
    };
    serve(&server, "/server.manifest", manifest.encode()).await;
    serve(&server, "/full.zip", full).await;

    let (updater, mut events) = fixture.updater();
    let err = updater.run().await.unwrap_err();
    match &err {
        UpdateError::InstallFailed {
            step,
            rollback_errors,
            ..
        } => {
            assert_eq!(step, &UpdateStep::BackupAndInstallFiles.to_string());
            assert!(rollback_errors.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.code(), ResultCode::InstallFailedRolledBack);

    assert_eq!(
        std::fs::read_to_string(fixture.app.join("sky.bin")).unwrap(),
        "v1 binary"
    );
    assert!(!fixture.app.join("new").exists());
    assert_eq!(fixture.installed_version(), "1.0");
    assert_eq!(fixture.store.dump(), store_before);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        UpdateEvent::RolledBack {
            step: UpdateStep::BackupAndInstallFiles,
            ..
        }
    )));
    assert!(!events.iter().any(|e| matches!(e, UpdateEvent::RetryingWithCatchAll { .. })));
}

#[tokio::test]
async fn test_uninstall_removes_what_updates_created() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("1.0", &server.uri());

    let full = zip_payload(&[("base/plugins/a.so", b"plugin")], Some(&sky_key_details()));
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![choice("2.0", format!("{}/full.zip", server.uri()), &full)],
        ..Default::default()
    };
    serve(&server, "/server.manifest", manifest.encode()).await;
    serve(&server, "/full.zip", full).await;

    let (updater, _events) = fixture.updater();
    updater.run().await.unwrap();
    assert!(fixture.app.join("plugins/a.so").exists());
    assert!(fixture.client_path.with_file_name("uninstall.dat").exists());

    let outcome = updater.uninstall().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Uninstalled));
    assert!(!fixture.app.join("plugins").exists());
    assert!(fixture.app.join("sky.bin").exists());
    assert!(
        !fixture
            .store
            .key_exists(BaseScope::CurrentUser, "Software\\Sky")
            .unwrap()
    );
    assert!(!fixture.client_path.with_file_name("uninstall.dat").exists());
}

#[tokio::test]
async fn test_blocking_processes_wait_for_decision() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("1.0", &server.uri());
    let blocker = BlockingProcess {
        pid: 4242,
        name: "sky".into(),
        exe: fixture.app.join("sky.bin"),
    };
    *fixture.inspector.answers.lock() = vec![vec![blocker.clone()], vec![blocker]];

    let full = zip_payload(&[("base/sky.bin", b"v2 binary")], None);
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![choice("2.0", format!("{}/full.zip", server.uri()), &full)],
        ..Default::default()
    };
    serve(&server, "/server.manifest", manifest.encode()).await;
    serve(&server, "/full.zip", full).await;

    let asked = Arc::new(Mutex::new(0usize));
    let counter = asked.clone();
    let (updater, _events) = fixture.updater();
    let updater = updater.with_process_decision(move |_processes| {
        *counter.lock() += 1;
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(ProcessDecision::Retry);
        rx
    });

    updater.run().await.unwrap();
    assert_eq!(*asked.lock(), 2);
    assert_eq!(fixture.installed_version(), "2.0");
}

#[tokio::test]
async fn test_blocking_processes_without_decision_fail() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("1.0", &server.uri());
    *fixture.inspector.answers.lock() = vec![vec![BlockingProcess {
        pid: 7,
        name: "sky".into(),
        exe: fixture.app.join("sky.bin"),
    }]];

    let full = zip_payload(&[("base/sky.bin", b"v2 binary")], None);
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![choice("2.0", format!("{}/full.zip", server.uri()), &full)],
        ..Default::default()
    };
    serve(&server, "/server.manifest", manifest.encode()).await;
    serve(&server, "/full.zip", full).await;

    let (updater, _events) = fixture.updater();
    let err = updater.run().await.unwrap_err();
    assert!(matches!(err, UpdateError::ProcessesBlocking { ref processes } if processes.len() == 1));
    assert_eq!(err.code().exit_code(), 7);
    assert_eq!(
        std::fs::read_to_string(fixture.app.join("sky.bin")).unwrap(),
        "v1 binary"
    );
}

#[tokio::test]
async fn test_privileged_location_hands_off_to_elevated_process() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("1.0", &server.uri());

    let mut full = choice("2.0", format!("{}/full.zip", server.uri()), b"payload");
    full.installing_to = InstallingTo::BASE_DIR | InstallingTo::COMMON_APP_DATA;
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![full],
        ..Default::default()
    };
    serve(&server, "/server.manifest", manifest.encode()).await;

    let (updater, mut events) = fixture.updater();
    let updater = updater.with_targets(
        fixture
            .targets()
            .with_location(InstallLocation::CommonAppData, "/var/lib/sky"),
    );
    let outcome = updater.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Relaunched));

    let relaunches = fixture.relauncher.relaunches.lock().clone();
    assert_eq!(relaunches.len(), 1);
    let (file, elevate) = &relaunches[0];
    assert!(*elevate);
    let record = ContinuationRecord::load(file).unwrap();
    assert_eq!(record.kind, ContinuationKind::AutoUpdate);
    assert_eq!(record.resume_step, UpdateStep::DownloadPayload);
    assert!(record.elevated);
    assert_eq!(record.base_dir, fixture.app);
    assert_eq!(
        record.app_dirs().map(|dirs| dirs.locks_dir()),
        Some(fixture.dirs().locks_dir())
    );
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, UpdateEvent::Relaunching { elevate: true }))
    );
}

#[tokio::test]
async fn test_resume_continues_from_saved_payload() {
    let fixture = Fixture::new("1.0", "http://127.0.0.1:9");
    let temp = fixture.dir.path().join("handoff");
    std::fs::create_dir_all(&temp).unwrap();

    let full = zip_payload(&[("base/sky.bin", b"v2 resumed")], None);
    let payload = temp.join("payload-0.bin");
    std::fs::write(&payload, &full).unwrap();
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![choice("2.0", "http://127.0.0.1:9/full.zip".into(), &full)],
        ..Default::default()
    };
    let manifest_path = temp.join("server.manifest");
    write_record(&manifest_path, &manifest).unwrap();

    let record = ContinuationRecord {
        kind: ContinuationKind::SelfUpdate,
        client_manifest: fixture.client_path.clone(),
        server_manifest: manifest_path,
        temp_dir: temp.clone(),
        base_dir: fixture.app.clone(),
        server_override: None,
        continuation_file: temp.join("continue.dat"),
        payload: Some(payload),
        config_dir: None,
        cache_dir: None,
        config_store: None,
        resume_step: UpdateStep::ExtractPayload,
        elevated: false,
        self_updated: true,
        use_catch_all: true,
    };
    record.save().unwrap();

    let (updater, mut events) = fixture.updater();
    let outcome = updater
        .resume(ContinuationRecord::load(&record.continuation_file).unwrap())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Updated { .. }));
    assert_eq!(
        std::fs::read_to_string(fixture.app.join("sky.bin")).unwrap(),
        "v2 resumed"
    );
    assert!(!temp.exists());

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, UpdateEvent::StepSkipped(UpdateStep::DownloadPayload))));
    assert!(events.iter().any(|e| matches!(e, UpdateEvent::StepSkipped(UpdateStep::SelfUpdateClient))));
}

#[tokio::test]
async fn test_resume_uses_directories_of_the_writing_process() {
    let fixture = Fixture::new("1.0", "http://127.0.0.1:9");
    let temp = fixture.dir.path().join("handoff");
    std::fs::create_dir_all(&temp).unwrap();

    let full = zip_payload(&[("base/sky.bin", b"v2 elevated")], Some(&sky_key_details()));
    let payload = temp.join("payload-0.bin");
    std::fs::write(&payload, &full).unwrap();
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![choice("2.0", "http://127.0.0.1:9/full.zip".into(), &full)],
        ..Default::default()
    };
    let manifest_path = temp.join("server.manifest");
    write_record(&manifest_path, &manifest).unwrap();

    let writer = fixture.dirs();
    let store_path = fixture.dir.path().join("user-store.json");
    let record = ContinuationRecord {
        kind: ContinuationKind::AutoUpdate,
        client_manifest: fixture.client_path.clone(),
        server_manifest: manifest_path,
        temp_dir: temp.clone(),
        base_dir: fixture.app.clone(),
        server_override: None,
        continuation_file: temp.join("continue.dat"),
        payload: Some(payload),
        config_dir: Some(writer.config_dir.clone()),
        cache_dir: Some(writer.cache_dir.clone()),
        config_store: Some(store_path.clone()),
        resume_step: UpdateStep::ExtractPayload,
        elevated: true,
        self_updated: false,
        use_catch_all: false,
    };
    record.save().unwrap();

    // The elevated process sees another home directory
    let elevated_env = AppDirs::rooted_at(&fixture.dir.path().join("root-home"));
    let (updater, _events) = Updater::for_continuation(&record, elevated_env.clone()).unwrap();
    assert_eq!(updater.lock_path().parent(), Some(writer.locks_dir().as_path()));
    let updater = fixture.wire(updater).with_privilege(Privilege::Elevated);

    let outcome = updater.resume(record).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Updated { .. }));
    assert_eq!(
        JsonConfigStore::open(&store_path)
            .unwrap()
            .get_value(BaseScope::CurrentUser, "Software\\Sky", "Version")
            .unwrap(),
        Some(ConfigValue::String("2.0".into()))
    );
    assert!(!elevated_env.config_dir.exists());
}

#[tokio::test]
async fn test_check_refuses_target_locked_by_another_run() {
    let server = MockServer::start().await;
    let fixture = Fixture::new("1.0", &server.uri());
    let manifest = ServerManifest {
        new_version: "2.0".into(),
        choices: vec![choice("2.0", format!("{}/full.zip", server.uri()), b"v2")],
        ..Default::default()
    };
    Mock::given(method("GET"))
        .and(path("/server.manifest"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest.encode()))
        .expect(1)
        .mount(&server)
        .await;

    let (updater, _events) = fixture.updater();
    let held = try_acquire_lock(updater.lock_path()).unwrap().unwrap();
    let err = updater.check_for_update().await.unwrap_err();
    assert!(matches!(err, UpdateError::AlreadyRunning { .. }));

    drop(held);
    let outcome = updater.check_for_update().await.unwrap();
    assert!(matches!(outcome, CheckOutcome::UpdateAvailable(_)));
}
