use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use memoryark::config::{AppConfig, sqlite_url};
use memoryark::entity::user::{self, UserRole, UserStatus};
use memoryark::extractors::auth::GATEWAY_EMAIL_HEADER;
use memoryark::state::AppState;

pub const ADMIN_EMAIL: &str = "admin@church.test";

pub mod routes {
    pub const AUTH_STATUS: &str = "/api/auth/status";
    pub const AUTH_REGISTER: &str = "/api/auth/register";
    pub const AUTH_ME: &str = "/api/auth/me";
    pub const AUTH_TOKEN: &str = "/api/auth/token";
    pub const FILES: &str = "/api/files";
    pub const UPLOAD: &str = "/api/files/upload";
    pub const BATCH_UPLOAD: &str = "/api/files/batch-upload";
    pub const CHUNK_INIT: &str = "/api/files/chunk-init";
    pub const CHUNK_UPLOAD: &str = "/api/files/chunk-upload";
    pub const CHUNK_FINALIZE: &str = "/api/files/chunk-finalize";
    pub const CHUNK_ABORT: &str = "/api/files/chunk-abort";
    pub const FOLDERS: &str = "/api/folders";
    pub const TRASH: &str = "/api/trash";
    pub const TRASH_EMPTY: &str = "/api/trash/empty";
    pub const STORAGE_STATS: &str = "/api/storage/stats";
    pub const CATEGORIES: &str = "/api/categories";
    pub const EXPORT_STREAM: &str = "/api/export/stream";
    pub const EXPORT_QUICK: &str = "/api/export/quick";
    pub const EXPORT_HISTORY: &str = "/api/export/history";
    pub const ADMIN_REGISTRATIONS: &str = "/api/admin/registrations";
    pub const ADMIN_GC: &str = "/api/admin/maintenance/gc";
    pub const ADMIN_REBUILD_PATHS: &str = "/api/admin/maintenance/rebuild-paths";

    pub fn file(id: i64) -> String {
        format!("/api/files/{id}")
    }

    pub fn file_download(id: i64) -> String {
        format!("/api/files/{id}/download")
    }

    pub fn file_restore(id: i64) -> String {
        format!("/api/files/{id}/restore")
    }

    pub fn file_permanent(id: i64) -> String {
        format!("/api/files/{id}/permanent")
    }

    pub fn file_share(id: i64) -> String {
        format!("/api/files/{id}/share")
    }

    pub fn chunk_status(session_id: &str) -> String {
        format!("/api/files/chunk-status/{session_id}")
    }

    pub fn folder_move(id: i64) -> String {
        format!("/api/folders/{id}/move")
    }

    pub fn folder_rename(id: i64) -> String {
        format!("/api/folders/{id}/rename")
    }

    pub fn category(id: i64) -> String {
        format!("/api/categories/{id}")
    }

    pub fn export_status(job_id: &str) -> String {
        format!("/api/export/status/{job_id}")
    }

    pub fn export_download(job_id: &str) -> String {
        format!("/api/export/download/{job_id}")
    }

    pub fn export_cancel(job_id: &str) -> String {
        format!("/api/export/cancel/{job_id}")
    }

    pub fn share(token: &str) -> String {
        format!("/api/share/{token}")
    }

    pub fn approve(id: i64) -> String {
        format!("/api/admin/registrations/{id}/approve")
    }

    pub fn reject(id: i64) -> String {
        format!("/api/admin/registrations/{id}/reject")
    }
}

/// A running test server backed by a throwaway SQLite file and upload root.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: Client,
    pub db: DatabaseConnection,
    pub state: AppState,
    shutdown: CancellationToken,
    _dir: TempDir,
}

/// Parsed HTTP response for test assertions.
pub struct TestResponse {
    pub status: u16,
    /// Raw response body as text.
    pub text: String,
    /// Parsed JSON body, or `Null` if the response is not valid JSON.
    pub body: Value,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn with a tweaked configuration.
    pub async fn spawn_with(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = dir.path().join("memoryark.db");

        let mut config: AppConfig = serde_json::from_value(json!({
            "server": { "host": "127.0.0.1", "port": 0 },
            "database": {
                "url": sqlite_url(db_path.to_str().expect("temp path is UTF-8")),
                "max_connections": 5,
            },
            "storage": { "root": dir.path().join("uploads") },
            "auth": { "jwt_secret": "test-secret-for-integration-tests" },
            "admin": { "root_email": ADMIN_EMAIL, "root_name": "Test Admin" },
            "export": { "workers": 1, "poll_interval_secs": 1 },
        }))
        .expect("Test configuration should deserialize");
        customize(&mut config);

        let shutdown = CancellationToken::new();
        let state = memoryark::init_state(config, shutdown.clone())
            .await
            .expect("Failed to initialize application state");
        memoryark::spawn_workers(&state);

        let app = memoryark::build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let addr = listener.local_addr().unwrap();

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            client: Client::new(),
            db: state.db.clone(),
            state,
            shutdown,
            _dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn as_user(&self, builder: RequestBuilder, email: &str) -> RequestBuilder {
        builder.header(GATEWAY_EMAIL_HEADER, email)
    }

    pub async fn get(&self, path: &str, email: &str) -> TestResponse {
        let res = self
            .as_user(self.client.get(self.url(path)), email)
            .send()
            .await
            .expect("Failed to send GET request");
        TestResponse::from_response(res).await
    }

    /// GET returning the raw response, for binary bodies and headers.
    pub async fn get_raw(&self, path: &str, email: &str) -> reqwest::Response {
        self.as_user(self.client.get(self.url(path)), email)
            .send()
            .await
            .expect("Failed to send GET request")
    }

    pub async fn get_anonymous(&self, path: &str) -> TestResponse {
        let res = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to send GET request");
        TestResponse::from_response(res).await
    }

    pub async fn post(&self, path: &str, body: &Value, email: &str) -> TestResponse {
        let res = self
            .as_user(self.client.post(self.url(path)), email)
            .json(body)
            .send()
            .await
            .expect("Failed to send POST request");
        TestResponse::from_response(res).await
    }

    pub async fn put(&self, path: &str, body: &Value, email: &str) -> TestResponse {
        let res = self
            .as_user(self.client.put(self.url(path)), email)
            .json(body)
            .send()
            .await
            .expect("Failed to send PUT request");
        TestResponse::from_response(res).await
    }

    pub async fn delete(&self, path: &str, email: &str) -> TestResponse {
        let res = self
            .as_user(self.client.delete(self.url(path)), email)
            .send()
            .await
            .expect("Failed to send DELETE request");
        TestResponse::from_response(res).await
    }

    pub async fn multipart(&self, path: &str, form: Form, email: &str) -> TestResponse {
        let res = self
            .as_user(self.client.post(self.url(path)), email)
            .multipart(form)
            .send()
            .await
            .expect("Failed to send multipart request");
        TestResponse::from_response(res).await
    }

    /// Insert an approved account directly.
    pub async fn create_user(&self, email: &str, role: UserRole) -> i32 {
        let now = Utc::now();
        user::ActiveModel {
            email: Set(email.to_string()),
            name: Set(email.split('@').next().unwrap_or(email).to_string()),
            role: Set(role),
            status: Set(UserStatus::Approved),
            last_login_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await
        .expect("Failed to insert user")
        .id
    }

    /// Upload one file, optionally into a folder. Returns the whole response.
    pub async fn upload(
        &self,
        email: &str,
        name: &str,
        bytes: &[u8],
        parent_id: Option<i64>,
    ) -> TestResponse {
        let part = Part::bytes(bytes.to_vec()).file_name(name.to_string());
        let mut form = Form::new().part("file", part);
        if let Some(parent) = parent_id {
            form = form.text("parent_id", parent.to_string());
        }
        self.multipart(routes::UPLOAD, form, email).await
    }

    /// Upload one file and return the new entry's id.
    pub async fn upload_file(
        &self,
        email: &str,
        name: &str,
        bytes: &[u8],
        parent_id: Option<i64>,
    ) -> i64 {
        let res = self.upload(email, name, bytes, parent_id).await;
        assert_eq!(res.status, 201, "upload failed: {}", res.text);
        res.body["data"]["file"]["id"]
            .as_i64()
            .expect("upload response should contain data.file.id")
    }

    pub async fn create_folder(&self, email: &str, name: &str, parent_id: Option<i64>) -> i64 {
        let res = self
            .post(
                routes::FOLDERS,
                &json!({ "name": name, "parent_id": parent_id }),
                email,
            )
            .await;
        assert_eq!(res.status, 201, "create_folder failed: {}", res.text);
        res.id()
    }

    /// Poll an export job until it leaves `pending`/`processing`.
    pub async fn wait_for_job(&self, job_id: &str, email: &str) -> TestResponse {
        for _ in 0..100 {
            let res = self.get(&routes::export_status(job_id), email).await;
            assert_eq!(res.status, 200, "status failed: {}", res.text);
            match res.body["data"]["status"].as_str() {
                Some("pending") | Some("processing") => {
                    tokio::time::sleep(Duration::from_millis(100)).await
                }
                _ => return res,
            }
        }
        panic!("export job {job_id} did not finish in time");
    }
}

impl TestResponse {
    pub async fn from_response(res: reqwest::Response) -> Self {
        let status = res.status().as_u16();
        let text = res.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);
        Self { status, text, body }
    }

    /// `data.id` of a success envelope.
    pub fn id(&self) -> i64 {
        self.body["data"]["id"]
            .as_i64()
            .expect("response body should contain 'data.id'")
    }

    /// `error.code` of a failure envelope.
    pub fn code(&self) -> &str {
        self.body["error"]["code"].as_str().unwrap_or_default()
    }
}
