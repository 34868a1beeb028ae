use std::collections::BTreeSet;

use futures::future::join_all;
use memoryark::entity::user::UserRole;
use reqwest::multipart::{Form, Part};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::common::{ADMIN_EMAIL, TestApp, routes};

const MEMBER: &str = "member@church.test";
const OTHER: &str = "other@church.test";

mod upload {
    use super::*;

    #[tokio::test]
    async fn stores_file_and_serves_it_back() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let bytes = b"Sabbath bulletin, week 18";

        let res = app.upload(MEMBER, "bulletin.txt", bytes, None).await;
        assert_eq!(res.status, 201, "{}", res.text);
        let file = &res.body["data"]["file"];
        assert_eq!(file["name"], "bulletin.txt");
        assert_eq!(file["virtual_path"], "/bulletin.txt");
        assert_eq!(file["size"], bytes.len());
        assert_eq!(file["content_hash"], hex::encode(Sha256::digest(bytes)));
        assert_eq!(res.body["data"]["deduplicated"], false);

        let id = file["id"].as_i64().unwrap();
        let res = app.get_raw(&routes::file_download(id), MEMBER).await;
        assert_eq!(res.status().as_u16(), 200);
        let disposition = res.headers()["content-disposition"].to_str().unwrap().to_string();
        assert!(disposition.starts_with("attachment"), "{disposition}");
        assert_eq!(res.bytes().await.unwrap().as_ref(), bytes);

        let res = app.get(&routes::file(id), MEMBER).await;
        assert_eq!(res.body["data"]["download_count"], 1);
    }

    #[tokio::test]
    async fn same_content_is_stored_once() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let bytes = b"the same photo bytes";

        let first = app.upload(MEMBER, "a.jpg", bytes, None).await;
        assert_eq!(first.status, 201);
        let second = app.upload(MEMBER, "b.jpg", bytes, None).await;
        assert_eq!(second.status, 201, "{}", second.text);
        assert_eq!(second.body["data"]["deduplicated"], true);
        assert_eq!(
            first.body["data"]["file"]["content_hash"],
            second.body["data"]["file"]["content_hash"]
        );

        let res = app.get(routes::STORAGE_STATS, MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);
        let stats = &res.body["data"];
        assert_eq!(stats["total_files"], 2);
        assert_eq!(stats["total_size"], 2 * bytes.len());
        assert_eq!(stats["blob_count"], 1);
        assert_eq!(stats["physical_size"], bytes.len());
        assert_eq!(stats["saved_bytes"], bytes.len());
    }

    #[tokio::test]
    async fn empty_files_share_one_blob() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let first = app.upload(MEMBER, "empty1.txt", b"", None).await;
        assert_eq!(first.status, 201, "{}", first.text);
        let second = app.upload(MEMBER, "empty2.txt", b"", None).await;
        assert_eq!(second.status, 201, "{}", second.text);

        let empty_digest = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(first.body["data"]["file"]["content_hash"], empty_digest);
        assert_eq!(second.body["data"]["file"]["content_hash"], empty_digest);

        let res = app.get(routes::STORAGE_STATS, MEMBER).await;
        assert_eq!(res.body["data"]["total_files"], 2);
        assert_eq!(res.body["data"]["blob_count"], 1);
    }

    #[tokio::test]
    async fn duplicate_large_upload_saves_half() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let bytes: Vec<u8> = (0..100 * 1024u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();

        app.upload_file(MEMBER, "video-a.mp4", &bytes, None).await;
        app.upload_file(MEMBER, "video-b.mp4", &bytes, None).await;

        let res = app.get(routes::STORAGE_STATS, MEMBER).await;
        let stats = &res.body["data"];
        assert_eq!(stats["physical_size"], bytes.len());
        assert_eq!(stats["saved_bytes"], bytes.len());
        assert_eq!(stats["saved_percent"], 50.0);
        assert_eq!(stats["dedup_ratio"], 2.0);
    }

    #[tokio::test]
    async fn identical_file_in_same_folder_is_skipped() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let first = app.upload(MEMBER, "hymn.pdf", b"%PDF hymn", None).await;
        let second = app.upload(MEMBER, "hymn.pdf", b"%PDF hymn", None).await;
        assert_eq!(second.status, 200, "{}", second.text);
        assert_eq!(second.body["data"]["skipped"], true);
        assert_eq!(
            second.body["data"]["file"]["id"],
            first.body["data"]["file"]["id"]
        );

        let res = app.get(routes::FILES, MEMBER).await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 1);
    }

    #[tokio::test]
    async fn different_content_with_same_name_gets_a_suffix() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        app.upload_file(MEMBER, "choir.jpg", b"first take", None).await;
        let res = app.upload(MEMBER, "choir.jpg", b"second take", None).await;
        assert_eq!(res.status, 201, "{}", res.text);
        assert_eq!(res.body["data"]["file"]["name"], "choir (1).jpg");
        assert_eq!(res.body["data"]["file"]["original_name"], "choir.jpg");
    }

    #[tokio::test]
    async fn concurrent_same_name_uploads_get_distinct_names() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let takes: Vec<Vec<u8>> = (0..8).map(|i| format!("take {i}").into_bytes()).collect();
        let responses = join_all(
            takes
                .iter()
                .map(|bytes| app.upload(MEMBER, "race.jpg", bytes, None)),
        )
        .await;

        let mut names = BTreeSet::new();
        for res in &responses {
            assert_eq!(res.status, 201, "{}", res.text);
            names.insert(res.body["data"]["file"]["name"].as_str().unwrap().to_string());
        }
        assert_eq!(names.len(), 8, "{names:?}");
        assert!(names.contains("race.jpg"));
        assert!(names.contains("race (7).jpg"));

        let res = app.get(routes::FILES, MEMBER).await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 8);
    }

    #[tokio::test]
    async fn concurrent_uploads_share_one_folder_path() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let uploads = (0..6).map(|i| {
            let form = Form::new()
                .part(
                    "file",
                    Part::bytes(format!("frame {i}").into_bytes()).file_name(format!("frame-{i}.jpg")),
                )
                .text("relative_path", "Vespers/Candles");
            app.multipart(routes::UPLOAD, form, MEMBER)
        });
        for res in join_all(uploads).await {
            assert_eq!(res.status, 201, "{}", res.text);
            let path = res.body["data"]["file"]["virtual_path"].as_str().unwrap().to_string();
            assert!(path.starts_with("/Vespers/Candles/frame-"), "{path}");
        }

        let res = app.get(routes::STORAGE_STATS, MEMBER).await;
        assert_eq!(res.body["data"]["total_folders"], 2);
    }

    #[tokio::test]
    async fn blocked_extension_is_refused() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let res = app.upload(MEMBER, "setup.exe", b"MZ", None).await;
        assert_eq!(res.status, 400);
        assert_eq!(res.code(), "INVALID_FILE_TYPE");

        let res = app.get(routes::STORAGE_STATS, MEMBER).await;
        assert_eq!(res.body["data"]["blob_count"], 0);
    }

    #[tokio::test]
    async fn missing_file_field_is_reported() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let form = Form::new().text("description", "no file here");
        let res = app.multipart(routes::UPLOAD, form, MEMBER).await;
        assert_eq!(res.status, 400);
        assert_eq!(res.code(), "MISSING_PARAMETER");
    }

    #[tokio::test]
    async fn relative_path_creates_folders() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let form = Form::new()
            .part("file", Part::bytes(b"jpeg".to_vec()).file_name("IMG_0001.jpg"))
            .text("relative_path", "Camp/Day 1");
        let res = app.multipart(routes::UPLOAD, form, MEMBER).await;
        assert_eq!(res.status, 201, "{}", res.text);
        assert_eq!(
            res.body["data"]["file"]["virtual_path"],
            "/Camp/Day 1/IMG_0001.jpg"
        );

        let res = app.get(routes::STORAGE_STATS, MEMBER).await;
        assert_eq!(res.body["data"]["total_folders"], 2);
    }

    #[tokio::test]
    async fn batch_reports_each_file() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let form = Form::new()
            .text("relative_path", "Retreat")
            .part("files", Part::bytes(b"one".to_vec()).file_name("one.jpg"))
            .part("files", Part::bytes(b"two".to_vec()).file_name("two.png"))
            .part("files", Part::bytes(b"bad".to_vec()).file_name("run.bat"));
        let res = app.multipart(routes::BATCH_UPLOAD, form, MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);

        let data = &res.body["data"];
        assert_eq!(data["uploaded"].as_array().unwrap().len(), 2);
        assert_eq!(data["failed"].as_array().unwrap().len(), 1);
        assert_eq!(data["failed"][0]["code"], "INVALID_FILE_TYPE");
        assert_eq!(
            data["uploaded"][0]["file"]["virtual_path"],
            "/Retreat/one.jpg"
        );
        assert_eq!(
            data["uploaded"][1]["file"]["virtual_path"],
            "/Retreat/two.png"
        );
    }
}

mod serving {
    use super::*;

    #[tokio::test]
    async fn etag_match_returns_not_modified() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let id = app.upload_file(MEMBER, "logo.png", b"png bytes", None).await;

        let res = app.get_raw(&routes::file_download(id), MEMBER).await;
        let etag = res.headers()["etag"].to_str().unwrap().to_string();
        assert_eq!(etag, format!("\"{}\"", hex::encode(Sha256::digest(b"png bytes"))));

        let res = app
            .client
            .get(app.url(&routes::file_download(id)))
            .header(memoryark::extractors::auth::GATEWAY_EMAIL_HEADER, MEMBER)
            .header("if-none-match", &etag)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 304);
    }

    #[tokio::test]
    async fn trashed_file_is_gone() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let id = app.upload_file(MEMBER, "old.txt", b"old", None).await;

        let res = app.delete(&routes::file(id), MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);

        let res = app.get(&routes::file_download(id), MEMBER).await;
        assert_eq!(res.status, 410);
        assert_eq!(res.code(), "FILE_DELETED");

        let res = app.get(&routes::file(9999), MEMBER).await;
        assert_eq!(res.status, 404);
        assert_eq!(res.code(), "FILE_NOT_FOUND");
    }
}

mod metadata {
    use super::*;

    #[tokio::test]
    async fn owner_updates_and_others_cannot() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        app.create_user(OTHER, UserRole::User).await;
        let id = app.upload_file(MEMBER, "notes.txt", b"notes", None).await;

        let res = app
            .put(
                &routes::file(id),
                &json!({ "description": "Elders meeting", "tags": "minutes" }),
                MEMBER,
            )
            .await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["description"], "Elders meeting");

        let res = app
            .put(&routes::file(id), &json!({ "description": null }), MEMBER)
            .await;
        assert!(res.body["data"]["description"].is_null());
        assert_eq!(res.body["data"]["tags"], "minutes");

        let res = app
            .put(&routes::file(id), &json!({ "tags": "hijack" }), OTHER)
            .await;
        assert_eq!(res.status, 403);

        let res = app
            .put(&routes::file(id), &json!({ "tags": "admin edit" }), ADMIN_EMAIL)
            .await;
        assert_eq!(res.status, 200);
    }

    #[tokio::test]
    async fn category_assignment_and_listing() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let res = app
            .post(
                routes::CATEGORIES,
                &json!({ "name": "Sabbath Service", "color": "#336699" }),
                MEMBER,
            )
            .await;
        assert_eq!(res.status, 201, "{}", res.text);
        let category_id = res.id();

        let res = app
            .post(routes::CATEGORIES, &json!({ "name": "Sabbath Service" }), ADMIN_EMAIL)
            .await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "CATEGORY_EXISTS");

        let id = app.upload_file(MEMBER, "sermon.mp3", b"ID3 audio", None).await;
        let res = app
            .put(&routes::file(id), &json!({ "category_id": category_id }), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);

        let res = app
            .get(&format!("{}?category_id={category_id}", routes::FILES), MEMBER)
            .await;
        assert_eq!(res.body["data"].as_array().unwrap().len(), 1);

        let res = app.get(&routes::category(category_id), MEMBER).await;
        assert_eq!(res.body["data"]["file_count"], 1);

        let res = app.delete(&routes::category(category_id), MEMBER).await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "CATEGORY_IN_USE");
    }
}

mod share {
    use super::*;

    #[tokio::test]
    async fn link_downloads_until_budget_is_spent() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let id = app.upload_file(MEMBER, "flyer.pdf", b"%PDF flyer", None).await;

        let res = app
            .post(&routes::file_share(id), &json!({ "max_downloads": 1 }), MEMBER)
            .await;
        assert_eq!(res.status, 201, "{}", res.text);
        let token = res.body["data"]["token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 32);

        let res = app
            .client
            .get(app.url(&routes::share(&token)))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        assert_eq!(res.bytes().await.unwrap().as_ref(), b"%PDF flyer");

        let res = app.get_anonymous(&routes::share(&token)).await;
        assert_eq!(res.status, 410);
        assert_eq!(res.code(), "SHARE_EXPIRED");

        let res = app.get_anonymous(&routes::share("0123456789abcdef")).await;
        assert_eq!(res.status, 404);
        assert_eq!(res.code(), "SHARE_NOT_FOUND");
    }
}
