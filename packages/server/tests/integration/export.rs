use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use memoryark::entity::export_job::{self, ArchiveFormat, ExportStatus};
use memoryark::entity::user::UserRole;
use memoryark::export::jobs::{reset_interrupted, spool_path, sweep_expired};
use rand::Rng;
use reqwest::multipart::{Form, Part};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::json;

use crate::common::{TestApp, TestResponse, routes};

const MEMBER: &str = "archivist@church.test";
const OTHER: &str = "pianist@church.test";

fn read_zip(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).expect("valid zip");
    let mut entries = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        entries.insert(file.name().to_string(), content);
    }
    entries
}

fn read_tar_gz(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
    let mut entries = BTreeMap::new();
    for entry in archive.entries().expect("valid tar.gz") {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        entries.insert(name, content);
    }
    entries
}

async fn queue(app: &TestApp, body: serde_json::Value, email: &str) -> String {
    let res = app.post(routes::EXPORT_STREAM, &body, email).await;
    assert_eq!(res.status, 202, "export create failed: {}", res.text);
    assert_eq!(res.body["data"]["status"], "pending");
    res.body["data"]["job_id"].as_str().unwrap().to_string()
}

/// Insert a job row directly, bypassing the queue and the workers.
async fn job_row(
    app: &TestApp,
    job_id: String,
    owner_id: i32,
    status: ExportStatus,
    archive_path: Option<String>,
    expires_at: Option<DateTime<Utc>>,
) -> String {
    let now = Utc::now();
    export_job::ActiveModel {
        job_id: Set(job_id),
        owner_id: Set(owner_id),
        filter: Set(json!({})),
        format: Set(ArchiveFormat::Zip),
        status: Set(status),
        progress: Set(40),
        processed_files: Set(2),
        total_files: Set(5),
        processed_size: Set(0),
        total_size: Set(0),
        archive_name: Set("orphan.zip".into()),
        archive_path: Set(archive_path),
        archive_size: Set(None),
        error: Set(None),
        expires_at: Set(expires_at),
        started_at: Set(Some(now)),
        completed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&app.db)
    .await
    .expect("Failed to insert export job")
    .job_id
}

/// A job row left in `processing` with no worker attached, as after a crash.
async fn orphaned_job(app: &TestApp, owner_id: i32) -> String {
    let job_id = uuid::Uuid::new_v4().to_string();
    job_row(app, job_id, owner_id, ExportStatus::Processing, None, None).await
}

fn spool_of(app: &TestApp, job_id: &str) -> PathBuf {
    spool_path(&app.state.config.storage.export_dir(), job_id, ArchiveFormat::Zip)
}

async fn download(app: &TestApp, job: &TestResponse, email: &str) -> Vec<u8> {
    let url = job.body["data"]["download_url"].as_str().unwrap();
    let res = app.get_raw(url, email).await;
    assert_eq!(res.status().as_u16(), 200);
    res.bytes().await.unwrap().to_vec()
}

mod jobs {
    use super::*;

    #[tokio::test]
    async fn completed_job_contains_every_matching_file() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        app.create_user(OTHER, UserRole::User).await;

        let res = app
            .post(routes::CATEGORIES, &json!({ "name": "Youth" }), MEMBER)
            .await;
        let youth = res.id();

        let sub = app.create_folder(MEMBER, "Sub", None).await;
        app.upload_file(MEMBER, "a.jpg", b"root a", None).await;
        app.upload_file(MEMBER, "a.jpg", b"nested a", Some(sub)).await;
        let tagged = app.upload_file(MEMBER, "games.png", b"games", None).await;
        app.put(&routes::file(tagged), &json!({ "category_id": youth }), MEMBER)
            .await;
        app.upload_file(OTHER, "not-mine.jpg", b"other", None).await;

        let job_id = queue(&app, json!({ "name": "everything" }), MEMBER).await;
        let job = app.wait_for_job(&job_id, MEMBER).await;
        assert_eq!(job.body["data"]["status"], "completed", "{}", job.text);
        assert_eq!(job.body["data"]["progress"], 100);
        assert_eq!(job.body["data"]["total_files"], 3);
        assert!(job.body["data"]["expires_at"].is_string());

        let entries = read_zip(&download(&app, &job, MEMBER).await);
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["Youth/games.png", "a (1).jpg", "a.jpg"]);
        assert_eq!(entries["a.jpg"], b"root a");
        assert_eq!(entries["a (1).jpg"], b"nested a");
        assert_eq!(entries["Youth/games.png"], b"games");
    }

    #[tokio::test]
    async fn folder_filter_with_tar_gz() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let camp = app.create_folder(MEMBER, "Camp", None).await;
        let day = app.create_folder(MEMBER, "Day 2", Some(camp)).await;
        app.upload_file(MEMBER, "top.jpg", b"top", Some(camp)).await;
        app.upload_file(MEMBER, "deep.jpg", b"deep", Some(day)).await;
        app.upload_file(MEMBER, "outside.jpg", b"outside", None).await;

        let job_id = queue(
            &app,
            json!({ "folder_id": camp, "include_subfolders": true, "format": "tar.gz" }),
            MEMBER,
        )
        .await;
        let job = app.wait_for_job(&job_id, MEMBER).await;
        assert_eq!(job.body["data"]["status"], "completed", "{}", job.text);

        let entries = read_tar_gz(&download(&app, &job, MEMBER).await);
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["deep.jpg", "top.jpg"]);
    }

    #[tokio::test]
    async fn invalid_filters_are_refused() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let res = app
            .post(
                routes::EXPORT_STREAM,
                &json!({ "date_from": "2024-06-01", "date_to": "2024-05-01" }),
                MEMBER,
            )
            .await;
        assert_eq!(res.status, 400);
        assert_eq!(res.code(), "VALIDATION_FAILED");

        let res = app
            .post(routes::EXPORT_STREAM, &json!({ "folder_id": 999 }), MEMBER)
            .await;
        assert_eq!(res.status, 404);
    }

    #[tokio::test]
    async fn jobs_are_private_to_their_owner() {
        let app = TestApp::spawn().await;
        let owner = app.create_user(MEMBER, UserRole::User).await;
        app.create_user(OTHER, UserRole::User).await;
        let job_id = orphaned_job(&app, owner).await;

        let res = app.get(&routes::export_status(&job_id), OTHER).await;
        assert_eq!(res.status, 404);
        assert_eq!(res.code(), "JOB_NOT_FOUND");

        let res = app.get(routes::EXPORT_HISTORY, MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["meta"]["pagination"]["total"], 1);
        let res = app.get(routes::EXPORT_HISTORY, OTHER).await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 0);
    }

    #[tokio::test]
    async fn unfinished_job_cannot_be_downloaded_and_can_be_cancelled() {
        let app = TestApp::spawn().await;
        let owner = app.create_user(MEMBER, UserRole::User).await;
        let job_id = orphaned_job(&app, owner).await;

        let res = app.get(&routes::export_download(&job_id), MEMBER).await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "JOB_NOT_COMPLETED");

        let res = app
            .post(&routes::export_cancel(&job_id), &json!({}), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["status"], "failed");
        assert_eq!(res.body["data"]["error"], "cancelled");

        let res = app
            .post(&routes::export_cancel(&job_id), &json!({}), MEMBER)
            .await;
        assert_eq!(res.status, 400, "a failed job stays failed");
    }

    #[tokio::test]
    async fn cancelling_a_running_job_stops_its_worker() {
        let app = TestApp::spawn_with(|cfg| cfg.export.progress_every_files = 1).await;
        app.create_user(MEMBER, UserRole::User).await;

        // Incompressible text keeps the worker busy deflating for a while.
        for i in 0..24 {
            let mut noise = vec![0u8; 1 << 20];
            rand::rng().fill(&mut noise[..]);
            app.upload_file(MEMBER, &format!("noise-{i}.txt"), &noise, None)
                .await;
        }

        let job_id = queue(&app, json!({ "name": "slow" }), MEMBER).await;
        let mut running = false;
        for _ in 0..200 {
            let res = app.get(&routes::export_status(&job_id), MEMBER).await;
            if res.body["data"]["status"] == "processing" {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(running, "the worker never picked the job up");

        let res = app
            .post(&routes::export_cancel(&job_id), &json!({}), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);

        let job = app.wait_for_job(&job_id, MEMBER).await;
        assert_eq!(job.body["data"]["status"], "failed", "{}", job.text);
        assert_eq!(job.body["data"]["error"], "cancelled");
        assert!(!spool_of(&app, &job_id).exists(), "partial archive left behind");
    }

    #[tokio::test]
    async fn past_retention_downloads_expire_and_archives_are_swept() {
        let app = TestApp::spawn().await;
        let owner = app.create_user(MEMBER, UserRole::User).await;

        let stale = uuid::Uuid::new_v4().to_string();
        let spool = spool_of(&app, &stale);
        std::fs::write(&spool, b"old archive").unwrap();
        let yesterday = Utc::now() - chrono::Duration::hours(24);
        job_row(
            &app,
            stale.clone(),
            owner,
            ExportStatus::Completed,
            Some(spool.to_string_lossy().into_owned()),
            Some(yesterday),
        )
        .await;

        let res = app.get(&routes::export_download(&stale), MEMBER).await;
        assert_eq!(res.status, 410, "{}", res.text);
        assert_eq!(res.code(), "DOWNLOAD_EXPIRED");

        sweep_expired(&app.state).await.expect("sweep should succeed");
        assert!(!spool.exists(), "expired archive should be deleted");

        let res = app.get(&routes::export_status(&stale), MEMBER).await;
        assert_eq!(res.body["data"]["status"], "expired");
        let res = app.get(&routes::export_download(&stale), MEMBER).await;
        assert_eq!(res.status, 410);
        assert_eq!(res.code(), "DOWNLOAD_EXPIRED");
    }

    #[tokio::test]
    async fn jobs_interrupted_by_a_restart_are_requeued_and_finish() {
        let app = TestApp::spawn().await;
        let owner = app.create_user(MEMBER, UserRole::User).await;
        app.upload_file(MEMBER, "hymnal.pdf", b"%PDF hymnal", None).await;

        let job_id = orphaned_job(&app, owner).await;
        let spool = spool_of(&app, &job_id);
        std::fs::write(&spool, b"half-written archive").unwrap();

        let requeued = reset_interrupted(&app.db, &app.state.config)
            .await
            .expect("reset should succeed");
        assert_eq!(requeued, 1);

        let row = export_job::Entity::find_by_id(job_id.clone())
            .one(&app.db)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(row.progress, 40, "stale progress must be cleared");
        assert!(matches!(
            row.status,
            ExportStatus::Pending | ExportStatus::Processing | ExportStatus::Completed
        ));

        app.state.exports.wake();
        let job = app.wait_for_job(&job_id, MEMBER).await;
        assert_eq!(job.body["data"]["status"], "completed", "{}", job.text);
        let entries = read_zip(&download(&app, &job, MEMBER).await);
        assert_eq!(entries["hymnal.pdf"], b"%PDF hymnal");
    }
}

mod quick {
    use super::*;

    #[tokio::test]
    async fn all_photos_contains_only_live_images() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        app.upload_file(MEMBER, "baptism.jpg", b"jpeg bytes", None).await;
        let png = app.upload_file(MEMBER, "old.png", b"png bytes", None).await;
        app.delete(&routes::file(png), MEMBER).await;
        let form = Form::new().part(
            "file",
            Part::bytes(b"mp4 bytes".to_vec())
                .file_name("service.mp4")
                .mime_str("video/mp4")
                .unwrap(),
        );
        app.multipart(routes::UPLOAD, form, MEMBER).await;

        let res = app
            .get_raw(&format!("{}?type=all-photos", routes::EXPORT_QUICK), MEMBER)
            .await;
        assert_eq!(res.status().as_u16(), 200);
        assert_eq!(res.headers()["content-type"], "application/zip");

        let entries = read_zip(&res.bytes().await.unwrap());
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["baptism.jpg"]);
        assert_eq!(entries["baptism.jpg"], b"jpeg bytes");
    }

    #[tokio::test]
    async fn this_month_includes_fresh_uploads() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        app.upload_file(MEMBER, "notes.txt", b"fresh", None).await;

        let res = app
            .get_raw(
                &format!("{}?type=this-month&format=tar.gz", routes::EXPORT_QUICK),
                MEMBER,
            )
            .await;
        assert_eq!(res.status().as_u16(), 200);
        let disposition = res.headers()["content-disposition"].to_str().unwrap().to_string();
        assert!(disposition.contains("this-month_"), "{disposition}");

        let entries = read_tar_gz(&res.bytes().await.unwrap());
        assert_eq!(entries["notes.txt"], b"fresh");
    }

    #[tokio::test]
    async fn unknown_type_and_unconfigured_sabbath_are_refused() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let res = app
            .get(&format!("{}?type=everything", routes::EXPORT_QUICK), MEMBER)
            .await;
        assert_eq!(res.status, 400);

        let res = app
            .get(&format!("{}?type=last-sabbath", routes::EXPORT_QUICK), MEMBER)
            .await;
        assert_eq!(res.status, 400);
        assert_eq!(res.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn last_sabbath_uses_the_configured_category() {
        let app = TestApp::spawn_with(|cfg| cfg.export.sabbath_category_id = Some(1)).await;
        app.create_user(MEMBER, UserRole::User).await;

        let res = app
            .post(routes::CATEGORIES, &json!({ "name": "Sabbath" }), MEMBER)
            .await;
        assert_eq!(res.id(), 1);

        let id = app.upload_file(MEMBER, "sermon.mp3", b"sermon", None).await;
        app.put(&routes::file(id), &json!({ "category_id": 1 }), MEMBER)
            .await;
        app.upload_file(MEMBER, "other.mp3", b"other", None).await;

        let res = app
            .get_raw(&format!("{}?type=last-sabbath", routes::EXPORT_QUICK), MEMBER)
            .await;
        assert_eq!(res.status().as_u16(), 200);
        let entries = read_zip(&res.bytes().await.unwrap());
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["Sabbath/sermon.mp3"]);
    }
}
