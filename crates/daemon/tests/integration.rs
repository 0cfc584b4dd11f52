mod common;

use std::sync::atomic::Ordering;

use common::Harness;
use factory_backup_core::BACKUP_TYPE_MANUAL;
use factory_backup_daemon::{build_router, AppState};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    _handle: tokio::task::JoinHandle<()>,
}

async fn start_server(h: &Harness, api_token: Option<String>) -> TestServer {
    let state = AppState {
        manager: h.manager.clone(),
        api_token,
    };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _handle: handle,
    }
}

async fn create_backup(h: &Harness) -> i64 {
    h.manager
        .create_backup(BACKUP_TYPE_MANUAL, None)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_healthz() {
    let h = Harness::new(10);
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/healthz", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_api_create_backup() {
    let h = Harness::new(10);
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .post(format!("{}/api/v1/backups", srv.base_url))
        .json(&serde_json::json!({ "description": "pre-migration" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "manual");
    assert_eq!(body["description"], "pre-migration");
    assert!(body["filename"].as_str().unwrap().ends_with(".tar.zst"));
    assert!(body["file_size"].as_i64().unwrap() > 0);
    assert!(body["file_size_formatted"].is_string());
    assert!(body["duration_formatted"].is_string());
    assert_eq!(h.archives().len(), 1);
}

#[tokio::test]
async fn test_api_create_backup_without_body() {
    let h = Harness::new(10);
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .post(format!("{}/api/v1/backups", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["description"].is_null());
}

#[tokio::test]
async fn test_api_create_backup_rejects_bad_json() {
    let h = Harness::new(10);
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .post(format!("{}/api/v1/backups", srv.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(h.archives().is_empty());
}

#[tokio::test]
async fn test_api_create_backup_conflict_while_running() {
    let h = Harness::new(10);
    h.exporter.gated.store(true, Ordering::SeqCst);
    let manager = h.manager.clone();
    let running =
        tokio::spawn(async move { manager.create_backup(BACKUP_TYPE_MANUAL, None).await });
    h.exporter.entered.notified().await;

    let srv = start_server(&h, None).await;
    let resp = srv
        .client
        .post(format!("{}/api/v1/backups", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let status: serde_json::Value = srv
        .client
        .get(format!("{}/api/v1/status", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["is_running"], true);

    h.exporter.gated.store(false, Ordering::SeqCst);
    h.exporter.release.notify_one();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_api_list_backups() {
    let h = Harness::new(10);
    create_backup(&h).await;
    common::tick().await;
    let newest = create_backup(&h).await;
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups?page=1&limit=1", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let backups = body["backups"].as_array().unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0]["id"], newest);
    assert_eq!(backups[0]["file_exists"], true);
    assert_eq!(body["pagination"]["total"], 2);
    assert_eq!(body["pagination"]["pages"], 2);
}

#[tokio::test]
async fn test_api_backup_detail() {
    let h = Harness::new(10);
    let id = create_backup(&h).await;
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups/{id}", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], id);
    assert_eq!(body["type"], "manual");

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups/9999", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_api_delete_backup() {
    let h = Harness::new(10);
    let id = create_backup(&h).await;
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .delete(format!("{}/api/v1/backups/{id}", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(h.archives().is_empty());

    let resp = srv
        .client
        .delete(format!("{}/api/v1/backups/{id}", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_download() {
    let h = Harness::new(10);
    let id = create_backup(&h).await;
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups/{id}/download", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ct = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(ct, "application/zstd");
    let cd = resp
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cd.contains(".tar.zst"));
    let bytes = resp.bytes().await.unwrap();
    assert!(!bytes.is_empty());
}

#[tokio::test]
async fn test_download_missing_archive() {
    let h = Harness::new(10);
    let result = h
        .manager
        .create_backup(BACKUP_TYPE_MANUAL, None)
        .await
        .unwrap();
    std::fs::remove_file(&result.file_path).unwrap();
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups/{}/download", srv.base_url, result.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_api_verify_backup() {
    let h = Harness::new(10);
    let id = create_backup(&h).await;
    let srv = start_server(&h, None).await;

    let resp = srv
        .client
        .post(format!("{}/api/v1/backups/{id}/verify", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["valid"], true);
    assert_eq!(body["checksum_match"], true);
}

#[tokio::test]
async fn test_api_statistics_and_status() {
    let h = Harness::new(10);
    h.manager.initialize().await.unwrap();
    create_backup(&h).await;
    let srv = start_server(&h, None).await;

    let stats: serde_json::Value = srv
        .client
        .get(format!("{}/api/v1/statistics", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["overall"]["total_backups"], 1);
    assert_eq!(stats["by_type"][0]["type"], "manual");
    assert_eq!(stats["schedule"]["enabled"], true);
    assert_eq!(stats["schedule"]["cron"], "0 2 * * *");

    let status: serde_json::Value = srv
        .client
        .get(format!("{}/api/v1/status", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["is_running"], false);
    assert_eq!(status["scheduled_enabled"], true);
    assert_eq!(status["max_backups"], 10);
    assert!(status["next_scheduled_run"].is_string());
}

#[tokio::test]
async fn test_api_reconcile() {
    let h = Harness::new(10);
    create_backup(&h).await;
    std::fs::write(h.backup_dir.join("backup_stray.tar.zst"), b"junk").unwrap();
    let srv = start_server(&h, None).await;

    let body: serde_json::Value = srv
        .client
        .post(format!("{}/api/v1/reconcile", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["orphan_archives"][0], "backup_stray.tar.zst");
    assert_eq!(body["removed"], 0);

    let body: serde_json::Value = srv
        .client
        .post(format!("{}/api/v1/reconcile?remove=true", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["removed"], 1);
    assert_eq!(h.archives().len(), 1);
}

#[tokio::test]
async fn test_api_reconcile_conflict_while_backup_runs() {
    let h = Harness::new(10);
    h.store.park_insert.store(true, Ordering::SeqCst);
    let manager = h.manager.clone();
    let running =
        tokio::spawn(async move { manager.create_backup(BACKUP_TYPE_MANUAL, None).await });
    h.store.insert_entered.notified().await;

    let srv = start_server(&h, None).await;
    let resp = srv
        .client
        .post(format!("{}/api/v1/reconcile?remove=true", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    assert_eq!(h.archives().len(), 1);

    h.store.park_insert.store(false, Ordering::SeqCst);
    h.store.insert_release.notify_one();
    running.await.unwrap().unwrap();
    assert_eq!(h.archives().len(), 1);
}

#[tokio::test]
async fn test_api_auth_rejected_without_token() {
    let h = Harness::new(10);
    let srv = start_server(&h, Some("secret-token".to_string())).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = srv
        .client
        .post(format!("{}/api/v1/backups", srv.base_url))
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(h.archives().is_empty());
}

#[tokio::test]
async fn test_api_auth_accepted_with_token() {
    let h = Harness::new(10);
    let srv = start_server(&h, Some("secret-token".to_string())).await;

    let resp = srv
        .client
        .get(format!("{}/api/v1/backups", srv.base_url))
        .header("Authorization", "Bearer secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = srv
        .client
        .get(format!("{}/api/v1/healthz", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
