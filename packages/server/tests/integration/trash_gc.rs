use std::time::Duration;

use futures::future::join_all;
use memoryark::entity::blob;
use memoryark::entity::user::UserRole;
use sea_orm::EntityTrait;
use serde_json::json;

use crate::common::{ADMIN_EMAIL, TestApp, routes};

const MEMBER: &str = "secretary@church.test";
const OTHER: &str = "treasurer@church.test";

mod trash {
    use super::*;

    #[tokio::test]
    async fn deleting_a_folder_trashes_its_subtree_and_restore_brings_it_back() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let trip = app.create_folder(MEMBER, "Mission Trip", None).await;
        let photo = app.upload_file(MEMBER, "bus.jpg", b"bus", Some(trip)).await;
        app.upload_file(MEMBER, "team.jpg", b"team", Some(trip)).await;

        let res = app.delete(&routes::file(trip), MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["entries"], 3);

        let res = app.get(routes::FILES, MEMBER).await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 0);

        let res = app.get(routes::TRASH, MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["meta"]["pagination"]["total"], 1);
        assert_eq!(res.body["data"][0]["name"], "Mission Trip");

        let res = app
            .get(&format!("{}?parent_id={trip}", routes::TRASH), MEMBER)
            .await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 2);

        let res = app.post(&routes::file_restore(trip), &json!({}), MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["restored"], 3);
        assert_eq!(res.body["data"]["recovered"], false);

        let res = app.get(&routes::file(photo), MEMBER).await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body["data"]["virtual_path"], "/Mission Trip/bus.jpg");
    }

    #[tokio::test]
    async fn restore_without_a_live_parent_goes_to_recovery() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let folder = app.create_folder(MEMBER, "Drafts", None).await;
        let doc = app.upload_file(MEMBER, "plan.docx", b"plan", Some(folder)).await;

        app.delete(&routes::file(doc), MEMBER).await;
        app.delete(&routes::file(folder), MEMBER).await;

        let res = app.post(&routes::file_restore(doc), &json!({}), MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["recovered"], true);
        assert_eq!(
            res.body["data"]["file"]["virtual_path"],
            "/Recovered Files/plan.docx"
        );
    }

    /// Trash `name` from inside a folder, then trash the folder, leaving the file orphaned.
    async fn orphan(app: &TestApp, folder: &str, name: &str, bytes: &[u8]) -> i64 {
        let parent = app.create_folder(MEMBER, folder, None).await;
        let id = app.upload_file(MEMBER, name, bytes, Some(parent)).await;
        app.delete(&routes::file(id), MEMBER).await;
        app.delete(&routes::file(parent), MEMBER).await;
        id
    }

    #[tokio::test]
    async fn recovery_folder_belongs_to_the_entry_owner() {
        let app = TestApp::spawn().await;
        let member = app.create_user(MEMBER, UserRole::User).await;
        let doc = orphan(&app, "Minutes", "june.docx", b"june").await;

        let res = app.post(&routes::file_restore(doc), &json!({}), ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["recovered"], true);
        let folder = res.body["data"]["file"]["parent_id"].as_i64().unwrap();

        let res = app.get(&routes::file(folder), MEMBER).await;
        assert_eq!(res.body["data"]["name"], "Recovered Files");
        assert_eq!(res.body["data"]["owner_id"], member);
    }

    #[tokio::test]
    async fn a_file_named_like_the_recovery_folder_does_not_multiply_folders() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let blocker = app.upload_file(MEMBER, "blocker.txt", b"in the way", None).await;
        let res = app
            .put(&routes::file(blocker), &json!({ "name": "Recovered Files" }), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);

        let first = orphan(&app, "Week 1", "one.jpg", b"one").await;
        let second = orphan(&app, "Week 2", "two.jpg", b"two").await;
        for (id, name) in [(first, "one.jpg"), (second, "two.jpg")] {
            let res = app.post(&routes::file_restore(id), &json!({}), MEMBER).await;
            assert_eq!(res.status, 200, "{}", res.text);
            assert_eq!(
                res.body["data"]["file"]["virtual_path"],
                format!("/Recovered Files (1)/{name}")
            );
        }

        let res = app.get(routes::STORAGE_STATS, MEMBER).await;
        assert_eq!(res.body["data"]["total_folders"], 1);
    }

    #[tokio::test]
    async fn users_only_see_their_own_trash() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        app.create_user(OTHER, UserRole::User).await;

        let mine = app.upload_file(MEMBER, "mine.txt", b"mine", None).await;
        let theirs = app.upload_file(OTHER, "theirs.txt", b"theirs", None).await;
        app.delete(&routes::file(mine), MEMBER).await;
        app.delete(&routes::file(theirs), OTHER).await;

        let res = app.get(routes::TRASH, MEMBER).await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 1);
        assert_eq!(res.body["data"][0]["name"], "mine.txt");

        let res = app.get(routes::TRASH, ADMIN_EMAIL).await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 2);

        let res = app.delete(&routes::file(mine), OTHER).await;
        assert_eq!(res.status, 410, "already trashed entries are gone for everyone");
    }

    #[tokio::test]
    async fn permanent_delete_is_admin_only_and_needs_the_trash() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let id = app.upload_file(MEMBER, "old.pdf", b"%PDF old", None).await;

        let res = app.delete(&routes::file_permanent(id), ADMIN_EMAIL).await;
        assert_eq!(res.status, 400, "live entries must be trashed first");

        app.delete(&routes::file(id), MEMBER).await;
        let res = app.delete(&routes::file_permanent(id), MEMBER).await;
        assert_eq!(res.status, 403);
        assert_eq!(res.code(), "INSUFFICIENT_PERMISSIONS");

        let res = app.delete(&routes::file_permanent(id), ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["references_released"], 1);

        let res = app.get(&routes::file(id), MEMBER).await;
        assert_eq!(res.status, 404);
    }

    #[tokio::test]
    async fn emptying_the_trash_purges_everything() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let folder = app.create_folder(MEMBER, "Old", None).await;
        app.upload_file(MEMBER, "a.txt", b"a", Some(folder)).await;
        app.upload_file(MEMBER, "b.txt", b"b", None).await;
        let keep = app.upload_file(MEMBER, "keep.txt", b"keep", None).await;

        app.delete(&routes::file(folder), MEMBER).await;
        let b = app.get(&format!("{}?search=b.txt", routes::FILES), MEMBER).await;
        let b_id = b.body["data"][0]["id"].as_i64().unwrap();
        app.delete(&routes::file(b_id), MEMBER).await;

        let res = app.post(routes::TRASH_EMPTY, &json!({}), MEMBER).await;
        assert_eq!(res.status, 403);

        let res = app.post(routes::TRASH_EMPTY, &json!({}), ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["entries_removed"], 3);
        assert_eq!(res.body["data"]["references_released"], 2);

        let res = app.get(routes::TRASH, ADMIN_EMAIL).await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 0);
        let res = app.get(&routes::file(keep), MEMBER).await;
        assert_eq!(res.status, 200);
    }
}

mod gc {
    use super::*;

    async fn blob_count(app: &TestApp) -> u64 {
        let res = app.get(routes::STORAGE_STATS, ADMIN_EMAIL).await;
        res.body["data"]["blob_count"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn unreferenced_content_is_reclaimed_after_grace() {
        let app = TestApp::spawn_with(|cfg| cfg.gc.grace_period_secs = 0).await;
        app.create_user(MEMBER, UserRole::User).await;

        let id = app.upload_file(MEMBER, "tmp.jpg", b"temporary bytes", None).await;
        assert_eq!(blob_count(&app).await, 1);

        app.delete(&routes::file(id), MEMBER).await;
        app.delete(&routes::file_permanent(id), ADMIN_EMAIL).await;

        let res = app.post(routes::ADMIN_GC, &json!({}), MEMBER).await;
        assert_eq!(res.status, 403);

        let res = app.post(routes::ADMIN_GC, &json!({}), ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);

        // The background worker is woken by the purge and may win the race.
        for _ in 0..50 {
            if blob_count(&app).await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(blob_count(&app).await, 0);

        let again = app.upload(MEMBER, "tmp.jpg", b"temporary bytes", None).await;
        assert_eq!(again.status, 201, "{}", again.text);
        assert_eq!(again.body["data"]["deduplicated"], false);
    }

    #[tokio::test]
    async fn shared_content_survives_while_referenced() {
        let app = TestApp::spawn_with(|cfg| cfg.gc.grace_period_secs = 0).await;
        app.create_user(MEMBER, UserRole::User).await;

        let first = app.upload_file(MEMBER, "one.png", b"same bytes", None).await;
        let second = app.upload_file(MEMBER, "two.png", b"same bytes", None).await;

        app.delete(&routes::file(first), MEMBER).await;
        app.delete(&routes::file_permanent(first), ADMIN_EMAIL).await;

        let res = app.post(routes::ADMIN_GC, &json!({}), ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["reclaimed"], 0);
        assert_eq!(blob_count(&app).await, 1);

        let res = app.get_raw(&routes::file_download(second), MEMBER).await;
        assert_eq!(res.status().as_u16(), 200);
        assert_eq!(res.bytes().await.unwrap().as_ref(), b"same bytes");
    }

    #[tokio::test]
    async fn concurrent_uploads_of_one_content_count_every_reference() {
        let app = TestApp::spawn_with(|cfg| cfg.gc.grace_period_secs = 0).await;
        app.create_user(MEMBER, UserRole::User).await;

        let names: Vec<String> = (0..6).map(|i| format!("hymn-{i}.mp3")).collect();
        let responses = join_all(
            names
                .iter()
                .map(|name| app.upload(MEMBER, name, b"amazing grace", None)),
        )
        .await;
        let ids: Vec<i64> = responses
            .iter()
            .map(|res| {
                assert_eq!(res.status, 201, "{}", res.text);
                res.body["data"]["file"]["id"].as_i64().unwrap()
            })
            .collect();

        let blobs = blob::Entity::find().all(&app.db).await.unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].ref_count, 6);

        let (last, rest) = ids.split_last().unwrap();
        for id in rest {
            app.delete(&routes::file(*id), MEMBER).await;
            let res = app.delete(&routes::file_permanent(*id), ADMIN_EMAIL).await;
            assert_eq!(res.status, 200, "{}", res.text);
        }

        let res = app.post(routes::ADMIN_GC, &json!({}), ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["reclaimed"], 0);
        let blobs = blob::Entity::find().all(&app.db).await.unwrap();
        assert_eq!(blobs[0].ref_count, 1);

        let res = app.get_raw(&routes::file_download(*last), MEMBER).await;
        assert_eq!(res.bytes().await.unwrap().as_ref(), b"amazing grace");

        app.delete(&routes::file(*last), MEMBER).await;
        app.delete(&routes::file_permanent(*last), ADMIN_EMAIL).await;
        app.post(routes::ADMIN_GC, &json!({}), ADMIN_EMAIL).await;
        for _ in 0..50 {
            if blob_count(&app).await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(blob_count(&app).await, 0);
    }

    #[tokio::test]
    async fn grace_period_protects_fresh_orphans() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let id = app.upload_file(MEMBER, "fresh.jpg", b"fresh", None).await;
        app.delete(&routes::file(id), MEMBER).await;
        app.delete(&routes::file_permanent(id), ADMIN_EMAIL).await;

        let res = app.post(routes::ADMIN_GC, &json!({}), ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["reclaimed"], 0);
        assert_eq!(blob_count(&app).await, 1);
    }
}
