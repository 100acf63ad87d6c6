//! Control API tests over a real listener.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;

use ripd::config::{AppConfig, ToolsConfig};
use ripd::context::AppContext;
use ripd::core::drive::{DiscType, DriveClass};
use ripd::db;
use ripd::web::{WebState, router};

fn write_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

async fn serve() -> (String, AppContext, tempfile::TempDir) {
    let root = tempdir().unwrap();
    let bin = root.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();

    let dd = write_tool(
        &bin,
        "dd",
        r#"for a in "$@"; do case "$a" in of=*) out="${a#of=}";; esac; done
mkdir -p "$(dirname "$out")"
printf 'ISODATA' > "$out"
echo "7 bytes copied""#,
    );

    let config = AppConfig {
        temp_dir: root.path().join("temp"),
        video_output_dir: root.path().join("out/video"),
        audio_output_dir: root.path().join("out/audio"),
        rom_output_dir: root.path().join("out/iso"),
        db_path: root.path().join("ripd.db"),
        cancel_grace_secs: 2,
        simulation: true,
        tools: ToolsConfig {
            image_dump: dd,
            use_compression: false,
            eject: "true".to_string(),
            ..ToolsConfig::default()
        },
        ..AppConfig::default()
    };

    let db = db::init(&config.db_path).await.unwrap();
    let ctx = AppContext::new(config, db);

    let app = router(WebState { ctx: ctx.clone() });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), ctx, root)
}

async fn wait_finished(ctx: &AppContext, job_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let job = ctx.store.get(job_id).await.expect("job exists");
        if job.status.is_terminal() {
            assert_eq!(job.status, ripd::core::job::JobStatus::Finished, "job: {job:?}");
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out; job: {job:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn drives_and_jobs_are_listed() {
    let (base, ctx, _root) = serve().await;
    let client = reqwest::Client::new();

    let drives: Vec<serde_json::Value> =
        client.get(format!("{base}/api/drives")).send().await.unwrap().json().await.unwrap();
    assert!(drives.is_empty());

    ctx.registry.register("/dev/sr0", "FAKE DVD", DriveClass::Dvd).await;
    let drives: Vec<serde_json::Value> =
        client.get(format!("{base}/api/drives")).send().await.unwrap().json().await.unwrap();
    assert_eq!(drives.len(), 1);
    assert_eq!(drives[0]["path"], "/dev/sr0");
    assert_eq!(drives[0]["capability"], "dvd");

    let jobs: Vec<serde_json::Value> =
        client.get(format!("{base}/api/jobs")).send().await.unwrap().json().await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn unknown_job_is_404_and_bad_output_shape_is_422() {
    let (base, ctx, _root) = serve().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/api/jobs/nope")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    ctx.registry.register("/dev/sr0", "FAKE DVD", DriveClass::Dvd).await;
    let job = ctx
        .executor
        .admit_disc("/dev/sr0", DiscType::DvdRom, "DATA DISC")
        .await
        .unwrap();

    // ROM output must keep an image extension
    let resp = client
        .put(format!("{base}/api/jobs/{}/output", job.id))
        .json(&serde_json::json!({ "path": "/elsewhere/DATA" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    wait_finished(&ctx, &job.id).await;

    // Locked after finalize: overriding now conflicts
    let resp = client
        .put(format!("{base}/api/jobs/{}/output", job.id))
        .json(&serde_json::json!({ "path": "/elsewhere/DATA.iso" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn job_lifecycle_over_http() {
    let (base, ctx, _root) = serve().await;
    let client = reqwest::Client::new();

    ctx.registry.register("/dev/sr0", "FAKE DVD", DriveClass::Dvd).await;
    let job = ctx
        .executor
        .admit_disc("/dev/sr0", DiscType::CdRom, "MyDisc")
        .await
        .unwrap();
    wait_finished(&ctx, &job.id).await;

    let body: serde_json::Value = client
        .get(format!("{base}/api/jobs/{}", job.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "Finished");
    assert_eq!(body["progress_overall"], 100);

    let output: serde_json::Value = client
        .get(format!("{base}/api/jobs/{}/output", job.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(output["locked"], true);
    assert!(output["output_path"].as_str().unwrap().ends_with("MyDisc.iso"));

    let log = client
        .get(format!("{base}/api/jobs/{}/log", job.id))
        .send()
        .await
        .unwrap();
    assert_eq!(log.status(), 200);
    let text = log.text().await.unwrap();
    assert!(text.contains("step 1/2: extract-image"));
    assert!(text.contains("job finished"));

    // Retry a finished job is rejected
    let resp = client
        .post(format!("{base}/api/jobs/{}/retry", job.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Delete, then it is gone
    let resp = client
        .delete(format!("{base}/api/jobs/{}", job.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let resp = client.get(format!("{base}/api/jobs/{}", job.id)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn blacklist_round_trips_and_blocks_admission() {
    let (base, ctx, _root) = serve().await;
    let client = reqwest::Client::new();

    ctx.registry.register("/dev/sr0", "FAKE DVD", DriveClass::Dvd).await;
    let resp = client
        .post(format!("{base}/api/drives/blacklist"))
        .json(&serde_json::json!({ "path": "/dev/sr0", "blacklisted": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let err = ctx
        .executor
        .admit_disc("/dev/sr0", DiscType::CdRom, "BLOCKED")
        .await
        .unwrap_err();
    assert!(matches!(err, ripd::error::ControlError::DriveUnavailable(_)));

    // The flag is persisted for the next attach
    let records = db::drives::load_all(&ctx.db).await.unwrap();
    assert!(records.iter().any(|r| r.path == "/dev/sr0" && r.blacklisted));

    // Unknown drive is a 404
    let resp = client
        .post(format!("{base}/api/drives/blacklist"))
        .json(&serde_json::json!({ "path": "/dev/sr9", "blacklisted": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn metadata_endpoints_require_a_provider() {
    let (base, _ctx, _root) = serve().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/api/metadata/search?query=blade+runner"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
}
