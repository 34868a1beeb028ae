use memoryark::entity::user::UserRole;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::common::{TestApp, TestResponse, routes};

const MEMBER: &str = "media@church.test";
const CONTENT: &[u8] = b"0123456789";

async fn init(app: &TestApp, body: Value) -> String {
    let res = app.post(routes::CHUNK_INIT, &body, MEMBER).await;
    assert_eq!(res.status, 201, "chunk-init failed: {}", res.text);
    res.body["data"]["session_id"].as_str().unwrap().to_string()
}

async fn send_chunk(app: &TestApp, session_id: &str, index: usize, bytes: &[u8]) -> TestResponse {
    let form = Form::new()
        .text("session_id", session_id.to_string())
        .text("index", index.to_string())
        .part("chunk", Part::bytes(bytes.to_vec()).file_name("blob"));
    app.multipart(routes::CHUNK_UPLOAD, form, MEMBER).await
}

async fn finalize(app: &TestApp, session_id: &str) -> TestResponse {
    app.post(
        routes::CHUNK_FINALIZE,
        &json!({ "session_id": session_id }),
        MEMBER,
    )
    .await
}

mod sessions {
    use super::*;

    #[tokio::test]
    async fn out_of_order_chunks_assemble_in_order() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let session = init(
            &app,
            json!({
                "file_name": "sermon.mp3",
                "total_size": CONTENT.len(),
                "chunk_count": 3,
                "expected_hash": hex::encode(Sha256::digest(CONTENT)),
            }),
        )
        .await;

        let res = send_chunk(&app, &session, 2, &CONTENT[8..]).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["status"]["missing_indices"], json!([0, 1]));

        let res = send_chunk(&app, &session, 0, &CONTENT[..4]).await;
        assert_eq!(res.status, 200, "{}", res.text);

        let res = finalize(&app, &session).await;
        assert_eq!(res.status, 409, "finalize before every chunk arrived");
        assert_eq!(res.code(), "INCOMPLETE_UPLOAD");

        send_chunk(&app, &session, 1, &CONTENT[4..8]).await;
        let res = app.get(&routes::chunk_status(&session), MEMBER).await;
        assert_eq!(res.body["data"]["received_indices"], json!([0, 1, 2]));
        assert_eq!(res.body["data"]["bytes_received"], CONTENT.len());

        let res = finalize(&app, &session).await;
        assert_eq!(res.status, 201, "{}", res.text);
        let id = res.body["data"]["file"]["id"].as_i64().unwrap();

        let res = app.get_raw(&routes::file_download(id), MEMBER).await;
        assert_eq!(res.bytes().await.unwrap().as_ref(), CONTENT);

        let res = app.get(&routes::chunk_status(&session), MEMBER).await;
        assert_eq!(res.body["data"]["state"], "finalized");
        assert_eq!(res.body["data"]["file_id"], id);

        let res = send_chunk(&app, &session, 0, &CONTENT[..4]).await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "UPLOAD_SESSION_CLOSED");

        let res = finalize(&app, &session).await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "UPLOAD_SESSION_CLOSED");
    }

    #[tokio::test]
    async fn replayed_chunk_is_a_duplicate_and_different_bytes_conflict() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let session = init(
            &app,
            json!({ "file_name": "clip.mp4", "total_size": 10, "chunk_count": 3 }),
        )
        .await;

        send_chunk(&app, &session, 0, b"0123").await;
        let res = send_chunk(&app, &session, 0, b"0123").await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["duplicate"], true);

        let res = send_chunk(&app, &session, 0, b"abcd").await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "CHUNK_CONFLICT");
    }

    #[tokio::test]
    async fn wrong_chunk_length_is_invalid() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let session = init(
            &app,
            json!({ "file_name": "clip.mp4", "total_size": 10, "chunk_count": 3 }),
        )
        .await;

        let res = send_chunk(&app, &session, 1, b"45").await;
        assert_eq!(res.status, 400);
        assert_eq!(res.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn digest_mismatch_reopens_the_session() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let session = init(
            &app,
            json!({
                "file_name": "scan.pdf",
                "total_size": 4,
                "chunk_count": 1,
                "expected_hash": hex::encode(Sha256::digest(b"good")),
            }),
        )
        .await;

        send_chunk(&app, &session, 0, b"evil").await;
        let res = finalize(&app, &session).await;
        assert_eq!(res.status, 422, "{}", res.text);
        assert_eq!(res.code(), "DIGEST_MISMATCH");

        let res = app.get(&routes::chunk_status(&session), MEMBER).await;
        assert_eq!(res.body["data"]["state"], "open");
        assert_eq!(res.body["data"]["received_indices"], json!([]));

        send_chunk(&app, &session, 0, b"good").await;
        let res = finalize(&app, &session).await;
        assert_eq!(res.status, 201, "{}", res.text);
    }

    #[tokio::test]
    async fn abort_closes_the_session() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let session = init(
            &app,
            json!({ "file_name": "draft.docx", "total_size": 10, "chunk_count": 2 }),
        )
        .await;

        let res = app
            .post(routes::CHUNK_ABORT, &json!({ "session_id": session }), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["state"], "aborted");

        let res = finalize(&app, &session).await;
        assert_eq!(res.code(), "UPLOAD_SESSION_CLOSED");
    }

    #[tokio::test]
    async fn other_users_cannot_see_a_session() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        app.create_user("someone@church.test", UserRole::User).await;
        let session = init(
            &app,
            json!({ "file_name": "draft.docx", "total_size": 10, "chunk_count": 2 }),
        )
        .await;

        let res = app
            .get(&routes::chunk_status(&session), "someone@church.test")
            .await;
        assert_eq!(res.status, 404);
        assert_eq!(res.code(), "UPLOAD_SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn impossible_layout_is_refused() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let res = app
            .post(
                routes::CHUNK_INIT,
                &json!({ "file_name": "a.jpg", "total_size": 10, "chunk_count": 2, "chunk_size": 3 }),
                MEMBER,
            )
            .await;
        assert_eq!(res.status, 400);
        assert_eq!(res.code(), "VALIDATION_FAILED");
    }
}
