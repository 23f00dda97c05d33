use reqwest::{Method, StatusCode};
use uuid::Uuid;

use crate::helpers::App;

#[tokio::test]
async fn new_subscribers_are_active() {
    let app = App::new().await;

    let response = app
        .post_subscriber(&serde_json::json!({
            "email": "  Ada@Example.com ",
            "first_name": "Ada",
            "last_name": "Lovelace",
        }))
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let subscriber: serde_json::Value = response.json().await.unwrap();
    assert_eq!(subscriber["email"], "ada@example.com");
    assert_eq!(subscriber["status"], "active");
    assert_eq!(subscriber["unsubscribe_token"].as_str().unwrap().len(), 32);
}

#[tokio::test]
async fn a_known_email_cannot_subscribe_twice() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;

    let response = app
        .post_subscriber(&serde_json::json!({"email": "ADA@example.com"}))
        .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_subscribers_are_rejected() {
    let app = App::new().await;
    let cases = [
        (serde_json::json!({"email": "not-an-email"}), "invalid email"),
        (
            serde_json::json!({"email": "ada@example.com", "first_name": "<script>"}),
            "forbidden characters in the name",
        ),
    ];

    for (body, description) in cases {
        let response = app.post_subscriber(&body).await;
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "The API did not reject a subscriber with {}",
            description
        );
    }
}

#[tokio::test]
async fn subscribers_can_be_edited_and_deleted() {
    let app = App::new().await;
    let subscriber = app.create_subscriber("ada@example.com").await;
    let id = subscriber["id"].as_str().unwrap();

    let response = app
        .admin(Method::PUT, &format!("/subscribers/{}", id))
        .json(&serde_json::json!({
            "email": "ada@lovelace.org",
            "first_name": "Ada",
            "status": "unsubscribed",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let edited: serde_json::Value = response.json().await.unwrap();
    assert_eq!(edited["email"], "ada@lovelace.org");
    assert_eq!(edited["status"], "unsubscribed");
    assert_eq!(edited["unsubscribe_token"], subscriber["unsubscribe_token"]);

    let response = app
        .admin(Method::DELETE, &format!("/subscribers/{}", id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let listed: Vec<serde_json::Value> = app
        .admin(Method::GET, "/subscribers")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn editing_an_unknown_subscriber_is_not_found() {
    let app = App::new().await;

    let response = app
        .admin(Method::PUT, &format!("/subscribers/{}", Uuid::new_v4()))
        .json(&serde_json::json!({"email": "ada@example.com"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn import_creates_new_subscribers_and_skips_known_ones() {
    let app = App::new().await;
    app.create_subscriber("known@example.com").await;
    let csv = "\
Mail,Given,Family
ada@example.com,Ada,Lovelace
known@example.com,Someone,Else
not-an-email,Bad,Row
,Empty,Row
grace@example.com,,
";

    let response = app
        .admin(Method::POST, "/subscribers/import")
        .query(&[
            ("email_column", "Mail"),
            ("first_name_column", "Given"),
            ("last_name_column", "Family"),
        ])
        .body(csv)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let summary: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        summary,
        serde_json::json!({"imported": 2, "skipped": 1, "errors": 2})
    );

    let listed: Vec<serde_json::Value> = app
        .admin(Method::GET, "/subscribers")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let known = listed
        .iter()
        .find(|s| s["email"] == "known@example.com")
        .unwrap();
    assert!(known["first_name"].is_null());
    let ada = listed
        .iter()
        .find(|s| s["email"] == "ada@example.com")
        .unwrap();
    assert_eq!(ada["last_name"], "Lovelace");
}

#[tokio::test]
async fn import_reads_spreadsheet_exports_that_are_not_utf8() {
    let app = App::new().await;
    let latin1: &[u8] = b"email,first_name\nzoe@example.com,Zo\xe9\nbob@example.com,Bob\n";

    let response = app
        .admin(Method::POST, "/subscribers/import")
        .query(&[("first_name_column", "first_name")])
        .body(latin1)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let summary: serde_json::Value = response.json().await.unwrap();
    assert_eq!(summary["imported"], 2);
    let listed: Vec<serde_json::Value> = app
        .admin(Method::GET, "/subscribers")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let zoe = listed
        .iter()
        .find(|s| s["email"] == "zoe@example.com")
        .unwrap();
    assert_eq!(zoe["first_name"], "Zoé");
}

#[tokio::test]
async fn import_without_the_email_column_lists_what_exists() {
    let app = App::new().await;

    let response = app
        .admin(Method::POST, "/subscribers/import")
        .body("address,name\nada@example.com,Ada\n")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let message: String = response.json().await.unwrap();
    assert!(message.contains("address, name"));
}

#[tokio::test]
async fn export_lists_every_subscriber_as_csv() {
    let app = App::new().await;
    app.post_subscriber(&serde_json::json!({
        "email": "ada@example.com",
        "first_name": "Ada",
    }))
    .await;

    let response = app
        .admin(Method::GET, "/subscribers/export")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let body = response.text().await.unwrap();
    let mut lines = body.lines();
    assert_eq!(
        lines.next(),
        Some("email,first_name,last_name,subscribed_at,status")
    );
    let row = lines.next().unwrap();
    assert!(row.starts_with("ada@example.com,Ada,,"));
    assert!(row.ends_with(",active"));
    assert_eq!(lines.next(), None);
}
