use chrono::{Duration, Utc};
use reqwest::{Method, StatusCode};
use uuid::Uuid;

use crate::helpers::App;

#[tokio::test]
async fn creating_a_newsletter_returns_a_draft() {
    let app = App::new().await;

    let response = app
        .post_newsletter(&serde_json::json!({
            "title": "Spring issue",
            "html_body": "<h1>Hello</h1><p>News</p>",
        }))
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "draft");
    assert_eq!(body["subject"], "Spring issue");
    assert_eq!(body["text_body"], "Hello\nNews");
    assert_eq!(body["attempts"], 0);
}

#[tokio::test]
async fn creating_with_a_date_schedules_the_newsletter() {
    let app = App::new().await;
    let at = Utc::now() + Duration::hours(2);

    let response = app
        .post_newsletter(&serde_json::json!({
            "title": "Later",
            "html_body": "<p>Soon</p>",
            "scheduled_at": at,
        }))
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "scheduled");
    assert!(body["scheduled_at"].is_string());
}

#[tokio::test]
async fn invalid_newsletters_are_rejected() {
    let app = App::new().await;
    let cases = [
        (
            serde_json::json!({"title": "  ", "html_body": "<p>x</p>"}),
            "blank title",
        ),
        (
            serde_json::json!({"title": "Issue", "html_body": "   "}),
            "blank body",
        ),
        (
            serde_json::json!({"title": "Issue", "html_body": "<p>x</p>", "cc": ["nope"]}),
            "invalid cc",
        ),
        (
            serde_json::json!({"title": "Issue", "html_body": "<p>x</p>", "font": "Comic;}"}),
            "invalid font",
        ),
    ];

    for (body, description) in cases {
        let response = app.post_newsletter(&body).await;
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "The API did not reject a newsletter with a {}",
            description
        );
    }
}

#[tokio::test]
async fn unknown_newsletters_are_not_found() {
    let app = App::new().await;

    let response = app
        .admin(Method::GET, &format!("/newsletters/{}", Uuid::new_v4()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn drafts_can_be_edited_but_sent_newsletters_cannot() {
    let app = App::new().await;
    let id = app.create_draft("First").await;

    let edit = serde_json::json!({"title": "Second", "html_body": "<p>Edited</p>"});
    let response = app
        .admin(Method::PUT, &format!("/newsletters/{}", id))
        .json(&edit)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.get_newsletter(id).await["title"], "Second");

    app.create_subscriber("reader@example.com").await;
    let response = app.send_newsletter(id, &serde_json::json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .admin(Method::PUT, &format!("/newsletters/{}", id))
        .json(&edit)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn deleting_a_newsletter_removes_it() {
    let app = App::new().await;
    let id = app.create_draft("Doomed").await;

    let response = app
        .admin(Method::DELETE, &format!("/newsletters/{}", id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .admin(Method::DELETE, &format!("/newsletters/{}", id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicates_are_fresh_drafts() {
    let app = App::new().await;
    let id = app.create_draft("Original").await;

    let response = app
        .admin(Method::POST, &format!("/newsletters/{}/duplicate", id))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let copy: serde_json::Value = response.json().await.unwrap();
    assert_eq!(copy["title"], "Copy of Original");
    assert_eq!(copy["status"], "draft");
    assert_ne!(copy["id"], id.to_string());
}

#[tokio::test]
async fn schedule_and_unschedule_move_between_draft_and_scheduled() {
    let app = App::new().await;
    let id = app.create_draft("Timed").await;
    let at = Utc::now() + Duration::days(1);

    let response = app
        .admin(Method::POST, &format!("/newsletters/{}/schedule", id))
        .json(&serde_json::json!({ "scheduled_at": at }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.get_newsletter(id).await["status"], "scheduled");

    let response = app
        .admin(Method::POST, &format!("/newsletters/{}/unschedule", id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let newsletter = app.get_newsletter(id).await;
    assert_eq!(newsletter["status"], "draft");
    assert!(newsletter["scheduled_at"].is_null());

    let response = app
        .admin(Method::POST, &format!("/newsletters/{}/unschedule", id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn preview_renders_the_html_recipients_receive() {
    let app = App::new().await;
    let response = app
        .post_newsletter(&serde_json::json!({
            "title": "Preview",
            "html_body": "<img src=\"{{logo_url}}\"><p>Look</p>",
            "font": "Georgia",
        }))
        .await;
    let body: serde_json::Value = response.json().await.unwrap();
    let id = body["id"].as_str().unwrap();

    let response = app
        .admin(Method::GET, &format!("/newsletters/{}/preview", id))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = response.text().await.unwrap();
    assert!(html.contains("font-family: Georgia"));
    assert!(html.contains("https://news.example.com/static/logo.png"));
    assert!(!html.contains("{{logo_url}}"));
}
