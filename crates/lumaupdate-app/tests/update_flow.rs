//! End-to-end update sessions
//!
//! These tests run the orchestrator against a temporary SD card and an
//! in-memory release server.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use lumaupdate_app::config::{Config, HourlyBranchConfig};
use lumaupdate_app::http::{HttpClient, HttpError, HttpResponse};
use lumaupdate_app::migrate::SdMigrator;
use lumaupdate_app::selfupdate::{NoTitleInstaller, UpdaterInfo};
use lumaupdate_app::{
    Channel, Choice, Event, Orchestrator, Phase, ProgressSink, UpdateResult, UpdateStep,
};
use lumaupdate_core::scan::{self, Encoding};
use lumaupdate_core::{FirmwareQuery, SvcVersionInfo, VersionDetector, MAX_PATH_LEN};
use serde_json::json;

const STABLE_URL: &str = "https://fake/releases/latest";
const UPDATER_URL: &str = "https://fake/updater/latest";
const STABLE_ASSET_URL: &str = "https://fake/Luma3DSv6.1.7z";
const DEV_ASSET_URL: &str = "https://fake/Luma3DSv6.1-dev.7z";
const HOURLY_COMMIT_URL: &str = "https://fake/hourly/lastCommit";

/// Release server answering from a fixed table
#[derive(Default)]
struct FakeServer {
    routes: HashMap<String, HttpResponse>,
}

impl FakeServer {
    fn route(&mut self, url: &str, body: Vec<u8>, etag: Option<String>) {
        self.routes.insert(url.to_string(), HttpResponse { body, etag });
    }
}

impl HttpClient for FakeServer {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.routes.get(url).cloned().ok_or(HttpError::Status(404))
    }
}

/// Firmware that does not answer the version call
struct NoFirmware;

impl FirmwareQuery for NoFirmware {
    fn query_version(&self) -> Option<SvcVersionInfo> {
        None
    }
}

#[derive(Default)]
struct Recorder {
    steps: Vec<UpdateStep>,
    phases: Vec<Phase>,
    downloads: usize,
}

impl ProgressSink for Recorder {
    fn on_progress(&mut self, step: UpdateStep, fraction: f32) {
        assert_eq!(step.fraction(), fraction);
        self.steps.push(step);
    }

    fn on_download(&mut self, _received: u64, _total: Option<u64>) {
        self.downloads += 1;
    }

    fn on_phase(&mut self, phase: Phase) {
        self.phases.push(phase);
    }
}

fn widen(s: &[u8]) -> Vec<u8> {
    s.iter().flat_map(|&b| [b, 0]).collect()
}

/// A 1000-byte payload carrying a version banner and, optionally, the
/// embedded install path
fn payload(version: &str, with_path: bool) -> Vec<u8> {
    let mut data = vec![0xE5u8; 1000];
    let banner = format!("Luma3DS v{} configuration", version);
    data[100..100 + banner.len()].copy_from_slice(banner.as_bytes());
    if with_path {
        let path = widen(b"sdmc:/arm9loaderhax.bin\0");
        data[400..400 + path.len()].copy_from_slice(&path);
    }
    data
}

fn build_7z(name: &str, data: &[u8]) -> Vec<u8> {
    use sevenz_rust::{SevenZArchiveEntry, SevenZWriter};

    let mut writer = SevenZWriter::new(Cursor::new(Vec::new())).unwrap();
    let mut readme = SevenZArchiveEntry::new();
    readme.name = "README.txt".to_string();
    readme.has_stream = true;
    writer
        .push_archive_entry(readme, Some(&b"Luma3DS release"[..]))
        .unwrap();
    let mut entry = SevenZArchiveEntry::new();
    entry.name = name.to_string();
    entry.has_stream = true;
    writer.push_archive_entry(entry, Some(data)).unwrap();
    writer.finish().unwrap().into_inner()
}

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn md5_etag(data: &[u8]) -> Option<String> {
    Some(format!("\"{:x}\"", md5::compute(data)))
}

/// Serve a stable 6.1 release whose normal variant contains `payload`
fn serve_stable(server: &mut FakeServer, payload: &[u8]) {
    let archive = build_7z("arm9loaderhax.bin", payload);
    let manifest = json!({
        "tag_name": "v6.1",
        "body": "Changes:\n- Fixed things",
        "assets": [
            {
                "name": "Luma3DSv6.1-dev.7z",
                "browser_download_url": DEV_ASSET_URL,
                "size": 1
            },
            {
                "name": "Luma3DSv6.1.7z",
                "browser_download_url": STABLE_ASSET_URL,
                "size": archive.len()
            }
        ]
    });
    server.route(STABLE_URL, manifest.to_string().into_bytes(), None);
    server.route(STABLE_ASSET_URL, archive.clone(), md5_etag(&archive));
}

fn config(sd_root: &Path) -> Config {
    let mut config = Config::default();
    config.general.sd_root = sd_root.to_path_buf();
    config.general.self_update = false;
    config.sources.stable_release_url = STABLE_URL.into();
    config.sources.updater_release_url = UPDATER_URL.into();
    config.sources.hourly_branches = vec![HourlyBranchConfig {
        label: "normal".into(),
        friendly_name: "latest hourly".into(),
        last_commit_url: HOURLY_COMMIT_URL.into(),
        build_url: "https://fake/hourly/Luma-{commit}.zip".into(),
    }];
    config
}

fn orchestrator(config: Config, server: FakeServer) -> Orchestrator<FakeServer, NoFirmware> {
    let migrator = SdMigrator::new(config.general.sd_root.clone());
    Orchestrator::with_parts(config, server, VersionDetector::new(NoFirmware), migrator)
}

fn confirm(channel: Channel, index: usize) -> Event {
    Event::Confirm(Choice::Update { channel, index })
}

#[test]
fn test_stable_update_with_backup() {
    let sd = tempfile::tempdir().unwrap();
    let old = payload("6.0", true);
    let new = payload("6.1", true);
    fs::write(sd.path().join("arm9loaderhax.bin"), &old).unwrap();

    let mut server = FakeServer::default();
    serve_stable(&mut server, &new);
    let orchestrator = orchestrator(config(sd.path()), server);

    let state = orchestrator.prepare();
    assert_eq!(state.phase, Phase::ConfirmationScreen);
    assert_eq!(state.install.installed.release, "6.0");
    assert!(!state.install.backup_exists);
    assert!(!state.install.migrate_legacy);
    assert_eq!(state.stable.name, "6.1");
    assert_eq!(state.stable.versions[0].url, STABLE_ASSET_URL);
    assert!(state.stable_update_available());
    assert!(!state.hourly.is_valid());

    let mut recorder = Recorder::default();
    let (state, result) = orchestrator.handle(state, confirm(Channel::Stable, 0), &mut recorder);
    assert_eq!(result, Some(UpdateResult::ok()));
    assert_eq!(state.phase, Phase::Complete);

    assert_eq!(fs::read(sd.path().join("arm9loaderhax.bin.bak")).unwrap(), old);
    assert_eq!(fs::read(sd.path().join("arm9loaderhax.bin")).unwrap(), new);

    assert_eq!(
        recorder.steps,
        vec![UpdateStep::Backup, UpdateStep::Download, UpdateStep::Save]
    );
    assert!(recorder.downloads > 0);

    let (state, result) = orchestrator.handle(state, Event::Acknowledge, &mut recorder);
    assert_eq!(state.phase, Phase::Exit);
    assert!(result.is_none());
    assert_eq!(
        recorder.phases,
        vec![Phase::Updating, Phase::Complete, Phase::Exit]
    );
}

#[test]
fn test_update_without_backup() {
    let sd = tempfile::tempdir().unwrap();
    fs::write(sd.path().join("arm9loaderhax.bin"), payload("6.0", true)).unwrap();

    let mut server = FakeServer::default();
    serve_stable(&mut server, &payload("6.1", true));
    let mut config = config(sd.path());
    config.general.backup_existing = false;
    let orchestrator = orchestrator(config, server);

    let (_, result) = orchestrator.handle(
        orchestrator.prepare(),
        confirm(Channel::Stable, 0),
        &mut Recorder::default(),
    );
    assert_eq!(result, Some(UpdateResult::ok()));
    assert!(!sd.path().join("arm9loaderhax.bin.bak").exists());
}

#[test]
fn test_hourly_update_patches_path() {
    let sd = tempfile::tempdir().unwrap();
    fs::create_dir(sd.path().join("luma")).unwrap();

    let new = payload("6.1-abc1234", true);
    let archive = build_zip(&[("out/arm9loaderhax.bin", &new), ("out/README.md", b"hourly")]);

    let mut server = FakeServer::default();
    server.route(HOURLY_COMMIT_URL, b"abc1234\n".to_vec(), None);
    server.route("https://fake/hourly/Luma-abc1234.zip", archive, None);

    let mut config = config(sd.path());
    config.general.payload_path = "/luma/boot.bin".into();
    let orchestrator = orchestrator(config, server);

    let state = orchestrator.prepare();
    assert!(!state.stable.is_valid());
    assert_eq!(state.hourly.name, "abc1234");
    assert!(state.hourly_update_available());

    let mut recorder = Recorder::default();
    let (state, result) = orchestrator.handle(state, confirm(Channel::Hourly, 0), &mut recorder);
    assert_eq!(result, Some(UpdateResult::ok()));
    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(
        recorder.steps,
        vec![UpdateStep::Download, UpdateStep::PathChange, UpdateStep::Save]
    );

    let installed = fs::read(sd.path().join("luma/boot.bin")).unwrap();
    assert_eq!(installed.len(), new.len());
    assert_eq!(
        scan::find(&installed, b"sdmc:/luma/boot.bin\0", Encoding::Utf16Ascii),
        Some(400)
    );
    assert_eq!(
        scan::find(&installed, b"sdmc:/arm9loaderhax.bin", Encoding::Utf16Ascii),
        None
    );
    // Bytes outside the path field are untouched
    assert_eq!(installed[..400], new[..400]);

    let version = lumaupdate_core::version::scan_version(&installed);
    assert_eq!(version.release, "6.1");
    assert_eq!(version.commit, "abc1234");
}

#[test]
fn test_path_change_failure_keeps_install() {
    let sd = tempfile::tempdir().unwrap();
    let old = payload("6.0", true);
    fs::write(sd.path().join("boot.bin"), &old).unwrap();

    let mut server = FakeServer::default();
    serve_stable(&mut server, &payload("6.1", false));
    let mut config = config(sd.path());
    config.general.payload_path = "/boot.bin".into();
    let orchestrator = orchestrator(config, server);

    let (state, result) = orchestrator.handle(
        orchestrator.prepare(),
        confirm(Channel::Stable, 0),
        &mut Recorder::default(),
    );
    assert_eq!(result, Some(UpdateResult::failed("PATHCHANGE FAILED")));
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(fs::read(sd.path().join("boot.bin")).unwrap(), old);
    assert_eq!(fs::read(sd.path().join("boot.bin.bak")).unwrap(), old);
}

#[test]
fn test_path_limit_excludes_leading_slash() {
    // "luma/" plus a 32 character name fills the field exactly
    let longest = format!("luma/{}.bin", "a".repeat(28));
    let too_long = format!("luma/{}.bin", "a".repeat(29));
    assert_eq!(longest.len(), MAX_PATH_LEN);

    for name in [&longest, &too_long] {
        let sd = tempfile::tempdir().unwrap();
        fs::create_dir(sd.path().join("luma")).unwrap();

        let mut server = FakeServer::default();
        serve_stable(&mut server, &payload("6.1", true));
        let mut config = config(sd.path());
        config.general.payload_path = format!("/{}", name);
        let orchestrator = orchestrator(config, server);

        let (_, result) = orchestrator.handle(
            orchestrator.prepare(),
            confirm(Channel::Stable, 0),
            &mut Recorder::default(),
        );

        if name == &longest {
            assert_eq!(result, Some(UpdateResult::ok()));
            let installed = fs::read(sd.path().join(name)).unwrap();
            let embedded = format!("sdmc:/{}", name);
            assert_eq!(
                scan::find(&installed, embedded.as_bytes(), Encoding::Utf16Ascii),
                Some(400)
            );
        } else {
            assert_eq!(result, Some(UpdateResult::failed("PATHCHANGE FAILED")));
            assert!(!sd.path().join(name).exists());
        }
    }
}

#[test]
fn test_corrupt_download_fails() {
    let sd = tempfile::tempdir().unwrap();
    let mut server = FakeServer::default();
    serve_stable(&mut server, &payload("6.1", true));
    // Serve different bytes than the ETag describes
    let archive = build_7z("arm9loaderhax.bin", &payload("6.2", true));
    let etag = md5_etag(b"something else");
    server.route(STABLE_ASSET_URL, archive, etag);

    let orchestrator = orchestrator(config(sd.path()), server);
    let (_, result) = orchestrator.handle(
        orchestrator.prepare(),
        confirm(Channel::Stable, 0),
        &mut Recorder::default(),
    );
    assert_eq!(result, Some(UpdateResult::failed("DOWNLOAD FAILED")));
    assert!(!sd.path().join("arm9loaderhax.bin").exists());
}

#[test]
fn test_legacy_install_is_migrated() {
    let sd = tempfile::tempdir().unwrap();
    fs::write(sd.path().join("arm9loaderhax.bin"), payload("5.1", true)).unwrap();
    fs::create_dir_all(sd.path().join("aurei/payloads")).unwrap();
    fs::write(sd.path().join("aurei/config.bin"), b"config").unwrap();
    fs::write(sd.path().join("aurei/payloads/default.bin"), b"chainload").unwrap();

    let mut server = FakeServer::default();
    serve_stable(&mut server, &payload("6.1", true));
    let orchestrator = orchestrator(config(sd.path()), server);

    let state = orchestrator.prepare();
    assert!(state.install.migrate_legacy);

    let mut recorder = Recorder::default();
    let (_, result) = orchestrator.handle(state, confirm(Channel::Stable, 0), &mut recorder);
    assert_eq!(result, Some(UpdateResult::ok()));
    assert!(recorder.steps.contains(&UpdateStep::Migration));

    assert!(!sd.path().join("aurei").exists());
    assert_eq!(fs::read(sd.path().join("luma/config.bin")).unwrap(), b"config");
    // default.bin -> def.bin -> start.bin
    assert_eq!(
        fs::read(sd.path().join("luma/payloads/start.bin")).unwrap(),
        b"chainload"
    );
}

#[test]
fn test_failed_migration_aborts_before_write() {
    let sd = tempfile::tempdir().unwrap();
    let old = payload("4.9", true);
    fs::write(sd.path().join("arm9loaderhax.bin"), &old).unwrap();

    let mut server = FakeServer::default();
    serve_stable(&mut server, &payload("6.1", true));
    let orchestrator = orchestrator(config(sd.path()), server);

    let (state, result) = orchestrator.handle(
        orchestrator.prepare(),
        confirm(Channel::Stable, 0),
        &mut Recorder::default(),
    );
    assert_eq!(result, Some(UpdateResult::failed("MIGRATION FAILED")));
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(fs::read(sd.path().join("arm9loaderhax.bin")).unwrap(), old);
}

#[test]
fn test_restore_backup() {
    let sd = tempfile::tempdir().unwrap();
    let current = payload("6.1", true);
    let backup = payload("6.0", true);
    fs::write(sd.path().join("arm9loaderhax.bin"), &current).unwrap();
    fs::write(sd.path().join("arm9loaderhax.bin.bak"), &backup).unwrap();

    let orchestrator = orchestrator(config(sd.path()), FakeServer::default());
    let state = orchestrator.prepare();
    assert!(state.install.backup_exists);
    assert_eq!(state.install.backup.release, "6.0");

    let mut recorder = Recorder::default();
    let (state, result) =
        orchestrator.handle(state, Event::Confirm(Choice::Restore), &mut recorder);
    assert_eq!(result, Some(UpdateResult::ok()));
    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(recorder.phases, vec![Phase::Restoring, Phase::Complete]);

    assert_eq!(fs::read(sd.path().join("arm9loaderhax.bin")).unwrap(), backup);
    assert!(!sd.path().join("arm9loaderhax.bin.bak").exists());
    assert!(!sd.path().join("arm9loaderhax.bin.broken").exists());
}

#[test]
fn test_restore_without_current_payload() {
    let sd = tempfile::tempdir().unwrap();
    fs::write(sd.path().join("arm9loaderhax.bin.bak"), payload("6.0", true)).unwrap();

    let orchestrator = orchestrator(config(sd.path()), FakeServer::default());
    let (state, result) = orchestrator.handle(
        orchestrator.prepare(),
        Event::Confirm(Choice::Restore),
        &mut Recorder::default(),
    );
    assert_eq!(result, Some(UpdateResult::failed("RENAME1 FAILED")));
    assert_eq!(state.phase, Phase::Failed);
    assert!(sd.path().join("arm9loaderhax.bin.bak").exists());
}

fn serve_updater(server: &mut FakeServer, tag: &str, archive: Vec<u8>) {
    let manifest = json!({
        "tag_name": tag,
        "body": "Updater changes",
        "assets": [
            {
                "name": "lumaupdater.zip",
                "browser_download_url": "https://fake/lumaupdater.zip",
                "size": archive.len()
            }
        ]
    });
    server.route(UPDATER_URL, manifest.to_string().into_bytes(), None);
    server.route("https://fake/lumaupdater.zip", archive, None);
}

#[test]
fn test_self_update_homebrew() {
    let sd = tempfile::tempdir().unwrap();
    fs::create_dir_all(sd.path().join("3ds/lumaupdater")).unwrap();

    let mut server = FakeServer::default();
    serve_updater(
        &mut server,
        "v2.1",
        build_zip(&[
            ("lumaupdater.cia", b"cia"),
            ("3DS/lumaupdater/lumaupdater.3dsx", b"3dsx"),
            ("3DS/lumaupdater/lumaupdater.smdh", b"smdh"),
        ]),
    );

    let mut config = config(sd.path());
    config.general.self_update = true;
    let info = UpdaterInfo::from_launch_path(Some("sdmc:/3ds/lumaupdater/lumaupdater.3dsx"), false);
    let orchestrator =
        orchestrator(config, server).with_self_update(info, Box::new(NoTitleInstaller), "2.0.1");

    let state = orchestrator.prepare();
    assert!(state.self_update_available());
    assert_eq!(state.updater.as_ref().unwrap().version, "2.1");

    let (state, result) = orchestrator.handle(
        state,
        Event::Confirm(Choice::SelfUpdate),
        &mut Recorder::default(),
    );
    assert_eq!(result, Some(UpdateResult::ok()));
    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(
        fs::read(sd.path().join("3ds/lumaupdater/lumaupdater.3dsx")).unwrap(),
        b"3dsx"
    );
    assert_eq!(
        fs::read(sd.path().join("3ds/lumaupdater/lumaupdater.smdh")).unwrap(),
        b"smdh"
    );
}

#[test]
fn test_self_update_cia_without_title_manager() {
    let sd = tempfile::tempdir().unwrap();
    let mut server = FakeServer::default();
    serve_updater(&mut server, "v3.0", build_zip(&[("lumaupdater.cia", b"cia")]));

    let mut config = config(sd.path());
    config.general.self_update = true;
    let info = UpdaterInfo::from_launch_path(None, true);
    let orchestrator =
        orchestrator(config, server).with_self_update(info, Box::new(NoTitleInstaller), "2.0");

    let (_, result) = orchestrator.handle(
        orchestrator.prepare(),
        Event::Confirm(Choice::SelfUpdate),
        &mut Recorder::default(),
    );
    assert_eq!(result, Some(UpdateResult::failed("CIA INSTALL FAILED")));
}

#[test]
fn test_self_update_not_newer() {
    let sd = tempfile::tempdir().unwrap();
    let mut server = FakeServer::default();
    serve_updater(&mut server, "v1.0", build_zip(&[("lumaupdater.cia", b"cia")]));

    let mut config = config(sd.path());
    config.general.self_update = true;
    let orchestrator = orchestrator(config, server).with_self_update(
        UpdaterInfo::from_launch_path(None, true),
        Box::new(NoTitleInstaller),
        "1.0.0",
    );

    let state = orchestrator.prepare();
    assert!(!state.self_update_available());

    let (next, result) = orchestrator.handle(
        state.clone(),
        Event::Confirm(Choice::SelfUpdate),
        &mut Recorder::default(),
    );
    assert!(result.is_none());
    assert_eq!(next, state);
}
