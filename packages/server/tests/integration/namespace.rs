use memoryark::entity::user::UserRole;
use serde_json::json;

use crate::common::{ADMIN_EMAIL, TestApp, routes};

const MEMBER: &str = "deacon@church.test";
const OTHER: &str = "elder@church.test";

fn names(body: &serde_json::Value) -> Vec<String> {
    body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_string())
        .collect()
}

mod folders {
    use super::*;

    #[tokio::test]
    async fn nested_folders_carry_full_paths() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let events = app.create_folder(MEMBER, "Events", None).await;
        let res = app
            .post(
                routes::FOLDERS,
                &json!({ "name": "Easter 2024", "parent_id": events }),
                MEMBER,
            )
            .await;
        assert_eq!(res.status, 201, "{}", res.text);
        assert_eq!(res.body["data"]["virtual_path"], "/Events/Easter 2024");
        assert_eq!(res.body["data"]["is_directory"], true);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_names_are_refused() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        app.create_folder(MEMBER, "Youth", None).await;

        let res = app
            .post(routes::FOLDERS, &json!({ "name": "Youth" }), MEMBER)
            .await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "NAME_CONFLICT");

        for bad in ["", "..", "a/b"] {
            let res = app
                .post(routes::FOLDERS, &json!({ "name": bad }), MEMBER)
                .await;
            assert_eq!(res.status, 400, "name {bad:?} should be refused");
        }
    }

    #[tokio::test]
    async fn unknown_parent_is_not_found() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let res = app
            .post(
                routes::FOLDERS,
                &json!({ "name": "Orphan", "parent_id": 4242 }),
                MEMBER,
            )
            .await;
        assert_eq!(res.status, 404);
        assert_eq!(res.code(), "FILE_NOT_FOUND");
    }
}

mod moves {
    use super::*;

    #[tokio::test]
    async fn moving_a_folder_rewrites_descendant_paths() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let archive = app.create_folder(MEMBER, "Archive", None).await;
        let camp = app.create_folder(MEMBER, "Camp", None).await;
        let day = app.create_folder(MEMBER, "Day 1", Some(camp)).await;
        let photo = app.upload_file(MEMBER, "fire.jpg", b"campfire", Some(day)).await;

        let res = app
            .put(&routes::folder_move(camp), &json!({ "parent_id": archive }), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["virtual_path"], "/Archive/Camp");

        let res = app.get(&routes::file(photo), MEMBER).await;
        assert_eq!(res.body["data"]["virtual_path"], "/Archive/Camp/Day 1/fire.jpg");

        let res = app
            .put(&routes::folder_move(camp), &json!({ "parent_id": null }), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);
        let res = app.get(&routes::file(photo), MEMBER).await;
        assert_eq!(res.body["data"]["virtual_path"], "/Camp/Day 1/fire.jpg");
    }

    #[tokio::test]
    async fn folder_cannot_move_into_its_own_subtree() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let outer = app.create_folder(MEMBER, "Outer", None).await;
        let inner = app.create_folder(MEMBER, "Inner", Some(outer)).await;

        let res = app
            .put(&routes::folder_move(outer), &json!({ "parent_id": inner }), MEMBER)
            .await;
        assert_eq!(res.status, 400);

        let res = app
            .put(&routes::folder_move(outer), &json!({ "parent_id": outer }), MEMBER)
            .await;
        assert_eq!(res.status, 400);
    }

    #[tokio::test]
    async fn rename_rewrites_paths_and_checks_siblings() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let music = app.create_folder(MEMBER, "Music", None).await;
        app.create_folder(MEMBER, "Choir", None).await;
        let score = app.upload_file(MEMBER, "hymn.pdf", b"%PDF score", Some(music)).await;

        let res = app
            .put(&routes::folder_rename(music), &json!({ "name": "Choir" }), MEMBER)
            .await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "NAME_CONFLICT");

        let res = app
            .put(&routes::folder_rename(music), &json!({ "name": "Worship" }), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);

        let res = app.get(&routes::file(score), MEMBER).await;
        assert_eq!(res.body["data"]["virtual_path"], "/Worship/hymn.pdf");
    }

    #[tokio::test]
    async fn only_owner_or_admin_may_move() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        app.create_user(OTHER, UserRole::User).await;

        let folder = app.create_folder(MEMBER, "Mine", None).await;
        let res = app
            .put(&routes::folder_rename(folder), &json!({ "name": "Theirs" }), OTHER)
            .await;
        assert_eq!(res.status, 403);
        assert_eq!(res.code(), "INSUFFICIENT_PERMISSIONS");

        let res = app
            .put(&routes::folder_rename(folder), &json!({ "name": "Shared" }), ADMIN_EMAIL)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);
    }
}

mod listing {
    use super::*;

    #[tokio::test]
    async fn folders_come_first_then_names() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        app.upload_file(MEMBER, "b.jpg", b"b", None).await;
        app.upload_file(MEMBER, "a.jpg", b"a", None).await;
        app.create_folder(MEMBER, "Zeta", None).await;

        let res = app.get(routes::FILES, MEMBER).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(names(&res.body), vec!["Zeta", "a.jpg", "b.jpg"]);

        let res = app
            .get(&format!("{}?sort_by=size&sort_order=desc", routes::FILES), MEMBER)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);

        let res = app
            .get(&format!("{}?sort_by=colour", routes::FILES), MEMBER)
            .await;
        assert_eq!(res.status, 400);
    }

    #[tokio::test]
    async fn search_spans_the_whole_tree() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        let folder = app.create_folder(MEMBER, "Baptisms", None).await;
        app.upload_file(MEMBER, "River_Baptism.jpg", b"river", Some(folder)).await;
        app.upload_file(MEMBER, "lunch.jpg", b"lunch", None).await;

        let res = app
            .get(&format!("{}?search=baptism.", routes::FILES), MEMBER)
            .await;
        assert_eq!(names(&res.body), vec!["River_Baptism.jpg"]);

        let res = app
            .get(&format!("{}?parent_id={folder}", routes::FILES), MEMBER)
            .await;
        assert_eq!(res.body["meta"]["pagination"]["total"], 1);
    }

    #[tokio::test]
    async fn pagination_reports_totals() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;

        for i in 0..5 {
            app.upload_file(MEMBER, &format!("p{i}.png"), format!("png {i}").as_bytes(), None)
                .await;
        }

        let res = app
            .get(&format!("{}?page=2&per_page=2", routes::FILES), MEMBER)
            .await;
        assert_eq!(names(&res.body), vec!["p2.png", "p3.png"]);
        let pagination = &res.body["meta"]["pagination"];
        assert_eq!(pagination["total"], 5);
        assert_eq!(pagination["total_pages"], 3);
    }

    #[tokio::test]
    async fn admin_rebuild_reports_no_drift() {
        let app = TestApp::spawn().await;
        app.create_user(MEMBER, UserRole::User).await;
        let folder = app.create_folder(MEMBER, "Docs", None).await;
        app.upload_file(MEMBER, "minutes.txt", b"minutes", Some(folder)).await;

        let res = app
            .post(routes::ADMIN_REBUILD_PATHS, &json!({}), MEMBER)
            .await;
        assert_eq!(res.status, 403);

        let res = app
            .post(routes::ADMIN_REBUILD_PATHS, &json!({}), ADMIN_EMAIL)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["updated"], 0);
    }
}
