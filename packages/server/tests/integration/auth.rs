use serde_json::json;

use crate::common::{ADMIN_EMAIL, TestApp, routes};

mod identity {
    use super::*;

    #[tokio::test]
    async fn missing_gateway_header_is_rejected() {
        let app = TestApp::spawn().await;

        let res = app.get_anonymous(routes::AUTH_ME).await;
        assert_eq!(res.status, 401);
        assert_eq!(res.body["success"], false);
        assert_eq!(res.code(), "CF_ACCESS_HEADER_MISSING");
    }

    #[tokio::test]
    async fn unknown_email_is_not_registered() {
        let app = TestApp::spawn().await;

        let res = app.get(routes::AUTH_ME, "stranger@church.test").await;
        assert_eq!(res.status, 401);
        assert_eq!(res.code(), "USER_NOT_REGISTERED");
    }

    #[tokio::test]
    async fn root_admin_is_seeded() {
        let app = TestApp::spawn().await;

        let res = app.get(routes::AUTH_ME, ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["email"], ADMIN_EMAIL);
        assert_eq!(res.body["data"]["role"], "admin");
    }

    #[tokio::test]
    async fn header_email_is_case_insensitive() {
        let app = TestApp::spawn().await;

        let res = app.get(routes::AUTH_ME, "  Admin@Church.TEST ").await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["email"], ADMIN_EMAIL);
    }

    #[tokio::test]
    async fn bearer_token_authenticates_without_gateway() {
        let app = TestApp::spawn().await;

        let res = app.post(routes::AUTH_TOKEN, &json!({}), ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        let token = res.body["data"]["access_token"].as_str().unwrap().to_string();
        assert_eq!(res.body["data"]["token_type"], "Bearer");

        let res = app
            .client
            .get(app.url(routes::AUTH_ME))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);

        let res = app
            .client
            .get(app.url(routes::AUTH_ME))
            .bearer_auth("not-a-jwt")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 401);
    }
}

mod registration {
    use super::*;

    #[tokio::test]
    async fn status_reports_the_registration_lifecycle() {
        let app = TestApp::spawn().await;
        let email = "newcomer@church.test";

        let res = app.get(routes::AUTH_STATUS, email).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["registered"], false);
        assert_eq!(res.body["data"]["needs_registration"], true);

        let res = app
            .post(
                routes::AUTH_REGISTER,
                &json!({ "name": "New Comer", "reason": "Choir photos" }),
                email,
            )
            .await;
        assert_eq!(res.status, 201, "{}", res.text);
        assert_eq!(res.body["data"]["status"], "pending");

        let res = app.get(routes::AUTH_STATUS, email).await;
        assert_eq!(res.body["data"]["pending_approval"], true);
        assert_eq!(res.body["data"]["needs_registration"], false);

        let res = app.get(routes::AUTH_ME, email).await;
        assert_eq!(res.status, 403);
        assert_eq!(res.code(), "USER_NOT_APPROVED");
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let app = TestApp::spawn().await;
        let email = "twice@church.test";

        let body = json!({ "name": "Twice" });
        let res = app.post(routes::AUTH_REGISTER, &body, email).await;
        assert_eq!(res.status, 201);

        let res = app.post(routes::AUTH_REGISTER, &body, email).await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "REGISTRATION_EXISTS");
    }

    #[tokio::test]
    async fn existing_user_cannot_register() {
        let app = TestApp::spawn().await;

        let res = app
            .post(routes::AUTH_REGISTER, &json!({ "name": "Admin" }), ADMIN_EMAIL)
            .await;
        assert_eq!(res.status, 409);
        assert_eq!(res.code(), "USER_EXISTS");
    }

    #[tokio::test]
    async fn blank_name_is_invalid() {
        let app = TestApp::spawn().await;

        let res = app
            .post(routes::AUTH_REGISTER, &json!({ "name": "   " }), "blank@church.test")
            .await;
        assert_eq!(res.status, 400);
        assert_eq!(res.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn approval_creates_an_account() {
        let app = TestApp::spawn().await;
        let email = "usher@church.test";

        let res = app
            .post(routes::AUTH_REGISTER, &json!({ "name": "Usher" }), email)
            .await;
        let registration_id = res.id();

        let res = app
            .put(&routes::approve(registration_id), &json!({}), email)
            .await;
        assert_eq!(res.status, 403, "applicants cannot approve themselves");

        let res = app
            .put(&routes::approve(registration_id), &json!({}), ADMIN_EMAIL)
            .await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["registration"]["status"], "approved");
        assert_eq!(res.body["data"]["user"]["role"], "user");

        let res = app.get(routes::AUTH_ME, email).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"]["name"], "Usher");

        let res = app
            .put(&routes::approve(registration_id), &json!({}), ADMIN_EMAIL)
            .await;
        assert_eq!(res.status, 400, "an approved request is no longer pending");
    }

    #[tokio::test]
    async fn rejected_applicant_sees_the_reason_and_may_retry() {
        let app = TestApp::spawn().await;
        let email = "visitor@church.test";

        let res = app
            .post(routes::AUTH_REGISTER, &json!({ "name": "Visitor" }), email)
            .await;
        let registration_id = res.id();

        let res = app
            .put(
                &routes::reject(registration_id),
                &json!({ "reason": "Please ask the office first" }),
                ADMIN_EMAIL,
            )
            .await;
        assert_eq!(res.status, 200, "{}", res.text);

        let res = app.get(routes::AUTH_STATUS, email).await;
        assert_eq!(
            res.body["data"]["rejection_reason"],
            "Please ask the office first"
        );
        assert_eq!(res.body["data"]["needs_registration"], true);

        let res = app
            .post(routes::AUTH_REGISTER, &json!({ "name": "Visitor" }), email)
            .await;
        assert_eq!(res.status, 201, "{}", res.text);
        assert_eq!(
            res.body["data"]["rejection_history"],
            json!(["Please ask the office first"])
        );
    }

    #[tokio::test]
    async fn pending_list_is_admin_only() {
        let app = TestApp::spawn().await;
        app.post(routes::AUTH_REGISTER, &json!({ "name": "A" }), "a@church.test")
            .await;

        let res = app.get(routes::ADMIN_REGISTRATIONS, ADMIN_EMAIL).await;
        assert_eq!(res.status, 200, "{}", res.text);
        assert_eq!(res.body["data"].as_array().unwrap().len(), 1);
        assert_eq!(res.body["meta"]["pagination"]["total"], 1);
    }
}
