use chrono::{Duration, Utc};
use reqwest::{Method, StatusCode};
use uuid::Uuid;

use crate::helpers::{App, Relay};

#[tokio::test]
async fn sending_reaches_every_active_subscriber() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;
    app.create_subscriber("grace@example.com").await;
    app.post_subscriber(&serde_json::json!({
        "email": "gone@example.com",
        "status": "unsubscribed",
    }))
    .await;
    let id = app.create_draft("Weekly").await;

    let response = app
        .send_newsletter(id, &serde_json::json!({"recipients": "all"}))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["status"], "sent");
    assert_eq!(report["sent"], 2);
    assert_eq!(report["failed"], 0);

    let delivered = app.relay.delivered();
    assert_eq!(delivered.len(), 1);
    let bcc: Vec<&str> = delivered[0].bcc.iter().map(|e| e.as_ref()).collect();
    assert_eq!(bcc, vec!["ada@example.com", "grace@example.com"]);

    let newsletter = app.get_newsletter(id).await;
    assert_eq!(newsletter["status"], "sent");
    assert!(newsletter["sent_at"].is_string());
}

#[tokio::test]
async fn deliveries_are_recorded_per_recipient() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;
    app.create_subscriber("grace@example.com").await;
    let id = app.create_draft("Weekly").await;
    app.send_newsletter(id, &serde_json::json!({})).await;

    let response = app
        .admin(Method::GET, &format!("/newsletters/{}/deliveries", id))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let deliveries: Vec<serde_json::Value> = response.json().await.unwrap();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d["status"] == "sent"));
}

#[tokio::test]
async fn a_selected_audience_limits_the_send() {
    let app = App::new().await;
    let ada = app.create_subscriber("ada@example.com").await;
    app.create_subscriber("grace@example.com").await;
    let id = app.create_draft("Private").await;
    let selected = vec![ada["id"].clone()];

    let response = app
        .send_newsletter(id, &serde_json::json!({ "recipients": selected }))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["sent"], 1);
    let bcc: Vec<String> = app.relay.delivered()[0]
        .bcc
        .iter()
        .map(|e| e.to_string())
        .collect();
    assert_eq!(bcc, vec!["ada@example.com".to_string()]);
}

#[tokio::test]
async fn an_unknown_recipients_keyword_is_rejected() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;
    let id = app.create_draft("Weekly").await;

    let response = app
        .send_newsletter(id, &serde_json::json!({"recipients": "everyone"}))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.relay.delivered().is_empty());
}

#[tokio::test]
async fn sending_without_subscribers_leaves_the_draft_alone() {
    let app = App::new().await;
    let id = app.create_draft("Lonely").await;

    let response = app.send_newsletter(id, &serde_json::json!({})).await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(app.get_newsletter(id).await["status"], "draft");
}

#[tokio::test]
async fn sending_an_unknown_newsletter_is_not_found() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;

    let response = app
        .send_newsletter(Uuid::new_v4(), &serde_json::json!({}))
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn an_unreachable_relay_marks_the_newsletter_as_failed() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;
    let id = app.create_draft("Weekly").await;
    app.relay.set(Relay::Unreachable);

    let response = app.send_newsletter(id, &serde_json::json!({})).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(app.get_newsletter(id).await["status"], "error");
}

#[tokio::test]
async fn a_rejecting_relay_reports_what_failed() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;
    app.create_subscriber("grace@example.com").await;
    let id = app.create_draft("Weekly").await;
    app.relay.set(Relay::Rejecting);

    let response = app.send_newsletter(id, &serde_json::json!({})).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["status"], "error");
    assert_eq!(report["sent"], 0);
    assert_eq!(report["failed"], 2);
}

#[tokio::test]
async fn failed_newsletters_can_be_requeued() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;
    let id = app.create_draft("Weekly").await;
    app.relay.set(Relay::Rejecting);
    app.send_newsletter(id, &serde_json::json!({})).await;

    let at = Utc::now() + Duration::minutes(10);
    let response = app
        .admin(Method::POST, &format!("/newsletters/{}/requeue", id))
        .json(&serde_json::json!({ "scheduled_at": at }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let newsletter: serde_json::Value = response.json().await.unwrap();
    assert_eq!(newsletter["status"], "scheduled");
}

#[tokio::test]
async fn drafts_cannot_be_requeued() {
    let app = App::new().await;
    let id = app.create_draft("Weekly").await;

    let response = app
        .admin(Method::POST, &format!("/newsletters/{}/requeue", id))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn a_test_send_leaves_no_trace() {
    let app = App::new().await;
    let id = app.create_draft("Weekly").await;

    let response = app
        .admin(Method::POST, &format!("/newsletters/{}/test", id))
        .json(&serde_json::json!({"email": "proof@example.com"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let delivered = app.relay.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].bcc[0].as_ref(), "proof@example.com");

    assert_eq!(app.get_newsletter(id).await["status"], "draft");
    let deliveries: Vec<serde_json::Value> = app
        .admin(Method::GET, &format!("/newsletters/{}/deliveries", id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(deliveries.is_empty());
}

#[tokio::test]
async fn a_test_send_to_an_invalid_address_is_rejected() {
    let app = App::new().await;
    let id = app.create_draft("Weekly").await;

    let response = app
        .admin(Method::POST, &format!("/newsletters/{}/test", id))
        .json(&serde_json::json!({"email": "not-an-address"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn relay_check_reflects_the_relay() {
    let app = App::new().await;

    let response = app.admin(Method::POST, "/relay/check").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    app.relay.set(Relay::Unreachable);
    let response = app.admin(Method::POST, "/relay/check").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn statistics_count_recipients_and_sent_newsletters() {
    let app = App::new().await;
    app.create_subscriber("ada@example.com").await;
    app.post_subscriber(&serde_json::json!({
        "email": "gone@example.com",
        "status": "unsubscribed",
    }))
    .await;
    let id = app.create_draft("Counted").await;
    app.send_newsletter(id, &serde_json::json!({})).await;

    let statistics: serde_json::Value = app
        .admin(Method::GET, "/statistics")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(statistics["active_recipients"], 1);
    assert_eq!(statistics["total_recipients"], 2);
    assert_eq!(statistics["sent_newsletters"], 1);
    assert_eq!(statistics["last_sent"]["title"], "Counted");
}
