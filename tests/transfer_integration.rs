//! End-to-end runs against a mock remote: planning from disk and checkpoint,
//! outcome classification, retries, session expiry and the upload ledger.

mod support;

use std::path::Path;

use bulkfetch_core::config::{AuthOverrides, DownloadOverrides, EngineOverrides, UploadOverrides};
use bulkfetch_core::{
    CheckpointState, Database, DownloadConfig, FileConfig, Ledger, ShutdownCoordinator,
    UploadConfig, export_mapping, run_download, run_upload,
};
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FAST_ENGINE: &str = r#"
[engine]
rate = 1000.0
initial_backoff_secs = 0.01
max_backoff_secs = 0.05
backoff_jitter_secs = 0.0
rate_limit_pause_secs = 0.01
rate_limit_jitter_secs = 0.0
concurrency = 4
batch_size = 4
"#;

fn download_config(
    server: &MockServer,
    dir: &Path,
    end: u64,
    max_attempts: Option<u32>,
) -> DownloadConfig {
    let file = FileConfig::parse(FAST_ENGINE, Path::new("test.toml")).unwrap();
    let engine = EngineOverrides {
        max_attempts,
        checkpoint: Some(dir.join("checkpoint.json")),
        failed_report: Some(dir.join("failed.txt")),
        ..EngineOverrides::default()
    };
    let download = DownloadOverrides {
        start: Some(1),
        end: Some(end),
        dataset: Some("files/".to_string()),
        base_url: Some(format!("{}/", server.uri())),
        output_dir: Some(dir.join("out")),
    };
    let auth = AuthOverrides {
        skip: true,
        ..AuthOverrides::default()
    };
    file.resolve_download(&engine, &download, &auth).unwrap()
}

fn remote_path(config: &DownloadConfig, ordinal: u64) -> String {
    format!("/files/{}", config.layout.file_name(ordinal))
}

async fn requests_for(server: &MockServer, wanted: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == wanted)
        .count()
}

#[tokio::test]
async fn test_download_skips_files_already_on_disk() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let config = download_config(&server, dir.path(), 10, None);

    std::fs::create_dir_all(&config.output_dir).unwrap();
    for ordinal in [1, 2] {
        std::fs::write(config.output_dir.join(config.layout.file_name(ordinal)), b"old").unwrap();
    }

    Mock::given(method("GET"))
        .and(path_regex(r"^/files/.+\.pdf$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 body".to_vec()))
        .mount(&server)
        .await;

    let summary = run_download(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();

    assert_eq!(summary.planned, 8);
    assert_eq!(summary.counters.success, 8);
    assert_eq!(summary.failed, 0);
    assert!(!summary.interrupted);
    assert_eq!(server.received_requests().await.unwrap().len(), 8);

    let checkpoint =
        CheckpointState::<u64>::load(&config.engine.orchestrator.checkpoint_path).unwrap();
    assert_eq!(checkpoint.completed.len(), 10);
    assert!(checkpoint.failed.is_empty());

    // Files on disk are left alone.
    let first = std::fs::read(config.output_dir.join(config.layout.file_name(1))).unwrap();
    assert_eq!(first, b"old");
    let third = std::fs::read(config.output_dir.join(config.layout.file_name(3))).unwrap();
    assert_eq!(third, b"%PDF-1.4 body");
}

#[tokio::test]
async fn test_download_absent_item_not_requested_again() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let config = download_config(&server, dir.path(), 5, None);
    let absent = remote_path(&config, 3);

    Mock::given(method("GET"))
        .and(path(absent.as_str()))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/files/.+\.pdf$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .mount(&server)
        .await;

    let summary = run_download(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();
    assert_eq!(summary.counters.success, 4);
    assert_eq!(summary.counters.not_found, 1);
    assert_eq!(summary.failed, 0);
    assert!(!config.output_dir.join(config.layout.file_name(3)).exists());

    let checkpoint =
        CheckpointState::<u64>::load(&config.engine.orchestrator.checkpoint_path).unwrap();
    assert_eq!(checkpoint.not_found.iter().copied().collect::<Vec<_>>(), vec![3]);
    assert_eq!(requests_for(&server, &absent).await, 1);

    let again = run_download(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();
    assert_eq!(again.planned, 0);
    assert_eq!(requests_for(&server, &absent).await, 1);
}

#[tokio::test]
async fn test_download_recovers_from_overloaded_server() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let config = download_config(&server, dir.path(), 8, Some(5));
    let busy = remote_path(&config, 7);

    Mock::given(method("GET"))
        .and(path(busy.as_str()))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(4)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/files/.+\.pdf$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .mount(&server)
        .await;

    let summary = run_download(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();

    assert_eq!(summary.counters.success, 8);
    assert_eq!(summary.counters.retries, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(requests_for(&server, &busy).await, 5);
    assert!(config.output_dir.join(config.layout.file_name(7)).exists());

    assert!(!config.engine.orchestrator.failure_report.exists());
}

#[tokio::test]
async fn test_download_exhausted_retries_written_to_report() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let config = download_config(&server, dir.path(), 3, Some(2));

    Mock::given(method("GET"))
        .and(path(remote_path(&config, 2).as_str()))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/files/.+\.pdf$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .mount(&server)
        .await;

    let summary = run_download(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();
    assert_eq!(summary.counters.success, 2);
    assert_eq!(summary.failed, 1);

    let report = std::fs::read_to_string(&config.engine.orchestrator.failure_report).unwrap();
    assert_eq!(report, "2\n");
    let checkpoint =
        CheckpointState::<u64>::load(&config.engine.orchestrator.checkpoint_path).unwrap();
    assert!(checkpoint.failed.contains(&2));
    assert!(!checkpoint.completed.contains(&2));
}

#[tokio::test]
async fn test_download_expired_session_stops_nothing_recorded() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let config = download_config(&server, dir.path(), 4, None);

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/age-verify"))
        .mount(&server)
        .await;

    let summary = run_download(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();

    assert_eq!(summary.credential_expired, 4);
    assert!(summary.needs_new_credentials());
    assert_eq!(summary.counters.success, 0);

    let checkpoint =
        CheckpointState::<u64>::load(&config.engine.orchestrator.checkpoint_path).unwrap();
    assert!(checkpoint.completed.is_empty());
    assert!(checkpoint.failed.is_empty());
    // Redirects are not followed.
    assert!(
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .all(|r| r.url.path() != "/age-verify")
    );
}

fn upload_config(server: &MockServer, dir: &Path) -> UploadConfig {
    let file = FileConfig::parse(FAST_ENGINE, Path::new("test.toml")).unwrap();
    let engine = EngineOverrides {
        max_attempts: Some(2),
        checkpoint: Some(dir.join("upload_checkpoint.json")),
        failed_report: Some(dir.join("failed_uploads.txt")),
        ..EngineOverrides::default()
    };
    let upload = UploadOverrides {
        source_dir: Some(dir.join("images")),
        ledger: Some(dir.join("ledger.db")),
        storage_zone: Some("zone".to_string()),
        storage_host: Some(server.address().to_string()),
        cdn_host: Some("cdn.test".to_string()),
        access_key: Some("secret".to_string()),
    };
    let mut config = file
        .resolve_upload(&engine, &upload, &AuthOverrides::default())
        .unwrap();
    config.layout.scheme = "http".to_string();
    config
}

#[tokio::test]
async fn test_upload_records_ledger_and_exports_mapping() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let config = upload_config(&server, dir.path());

    let folder = config.source_dir.join("f1");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("a.png"), b"png-a").unwrap();
    std::fs::write(folder.join("b.png"), b"png-b").unwrap();
    std::fs::write(folder.join("notes.txt"), b"not an image").unwrap();

    Mock::given(method("PUT"))
        .and(path("/zone/images/f1/a.png"))
        .and(header("AccessKey", "secret"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/zone/images/f1/b.png"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let summary = run_upload(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();
    assert_eq!(summary.planned, 2);
    assert_eq!(summary.counters.success, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(requests_for(&server, "/zone/images/f1/b.png").await, 2);

    let ledger = Ledger::new(Database::new(&config.ledger).await.unwrap());
    let a = ledger.get("f1/a.png").await.unwrap().unwrap();
    assert_eq!(a.status, "success");
    assert_eq!(a.cdn_url, "http://cdn.test/images/f1/a.png");
    assert_eq!(a.size_bytes, Some(5));
    assert!(a.file_hash.is_some());
    let b = ledger.get("f1/b.png").await.unwrap().unwrap();
    assert_eq!(b.status, "failed");
    assert!(b.last_error.is_some());
    ledger.database().clone().close().await;

    let export = FileConfig::default()
        .resolve_export(Some(config.ledger.clone()), Some(dir.path().join("map.json")));
    assert_eq!(export_mapping(&export).await.unwrap(), 1);
    let raw = std::fs::read_to_string(&export.output).unwrap();
    let mapping: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let urls: Vec<&str> = mapping
        .as_object()
        .unwrap()
        .values()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(urls, vec!["http://cdn.test/images/f1/a.png"]);

    // Second run: a.png is in the ledger, b.png is retried.
    let again = run_upload(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();
    assert_eq!(again.planned, 1);
    assert_eq!(requests_for(&server, "/zone/images/f1/a.png").await, 1);
}

#[tokio::test]
async fn test_upload_rejected_key_is_session_expiry() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    let config = upload_config(&server, dir.path());
    let folder = config.source_dir.join("f2");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("c.jpg"), b"jpg").unwrap();

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let summary = run_upload(&config, ShutdownCoordinator::shared(), None)
        .await
        .unwrap();
    assert!(summary.needs_new_credentials());
    assert_eq!(summary.counters.success, 0);

    // Started but never finished: the row stays pending for the next run.
    let ledger = Ledger::new(Database::new(&config.ledger).await.unwrap());
    let row = ledger.get("f2/c.jpg").await.unwrap().unwrap();
    assert_eq!(row.status, "pending");
    assert_eq!(row.last_error, None);
}
