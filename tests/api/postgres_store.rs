use std::sync::Arc;

use chrono::{Duration, Utc};
use claims::{assert_matches, assert_none, assert_some};
use reqwest::StatusCode;

use bulletin::domain::{
    DeliveryStatus, Newsletter, NewsletterContent, NewsletterStatus, Recipient, RecipientStatus,
    SubscriberEmail,
};
use bulletin::store::{DeliveryStore, NewsletterStore, RecipientStore, StoreError};

use crate::helpers::{postgres_store, App};

fn newsletter() -> Newsletter {
    let content = NewsletterContent::parse(
        "Weekly".to_string(),
        None,
        "<p>News</p>".to_string(),
        None,
        None,
        vec!["editor@example.com".to_string()],
    )
    .unwrap();
    Newsletter::draft(content)
}

fn recipient(email: &str) -> Recipient {
    Recipient::new(SubscriberEmail::parse(email.to_string()).unwrap(), None, None)
}

#[tokio::test]
async fn newsletters_round_trip_through_postgres() {
    let store = postgres_store().await;
    let newsletter = newsletter();

    store.insert_newsletter(&newsletter).await.unwrap();

    let stored = assert_some!(store.newsletter(newsletter.id).await.unwrap());
    assert_eq!(stored.content, newsletter.content);
    assert_eq!(stored.status, NewsletterStatus::Draft);
    assert_none!(stored.audience);
}

#[tokio::test]
async fn only_one_concurrent_claim_wins() {
    let store = Arc::new(postgres_store().await);
    let newsletter = newsletter();
    store.insert_newsletter(&newsletter).await.unwrap();

    let id = newsletter.id;
    let claims: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .claim(id, NewsletterStatus::Draft, None)
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    let stored = store.newsletter(id).await.unwrap().unwrap();
    assert_eq!(stored.status, NewsletterStatus::Sending);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn claiming_remembers_the_audience() {
    let store = postgres_store().await;
    let newsletter = newsletter();
    let reader = recipient("reader@example.com");
    store.insert_newsletter(&newsletter).await.unwrap();
    store.insert_recipient(&reader).await.unwrap();

    assert!(store
        .claim(newsletter.id, NewsletterStatus::Draft, Some(&[reader.id]))
        .await
        .unwrap());

    let stored = store.newsletter(newsletter.id).await.unwrap().unwrap();
    assert_eq!(stored.audience, Some(vec![reader.id]));
}

#[tokio::test]
async fn only_past_schedules_are_due() {
    let store = postgres_store().await;
    let past = newsletter();
    let future = newsletter();
    store.insert_newsletter(&past).await.unwrap();
    store.insert_newsletter(&future).await.unwrap();
    let from = [NewsletterStatus::Draft];
    store
        .reschedule(past.id, Utc::now() - Duration::minutes(1), &from)
        .await
        .unwrap();
    store
        .reschedule(future.id, Utc::now() + Duration::hours(1), &from)
        .await
        .unwrap();

    let due = store.due_newsletters().await.unwrap();

    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, past.id);
}

#[tokio::test]
async fn finishing_a_dispatch_twice_keeps_one_record_per_recipient() {
    let store = postgres_store().await;
    let newsletter = newsletter();
    let reader = recipient("reader@example.com");
    store.insert_newsletter(&newsletter).await.unwrap();
    store.insert_recipient(&reader).await.unwrap();
    store
        .claim(newsletter.id, NewsletterStatus::Draft, None)
        .await
        .unwrap();
    store
        .record_pending(newsletter.id, &[reader.id])
        .await
        .unwrap();

    for outcome in [DeliveryStatus::Error, DeliveryStatus::Sent] {
        store
            .finish_dispatch(
                newsletter.id,
                &[(reader.id, outcome)],
                NewsletterStatus::from_outcomes(
                    usize::from(outcome == DeliveryStatus::Sent),
                    usize::from(outcome == DeliveryStatus::Error),
                ),
                Utc::now(),
            )
            .await
            .unwrap();
    }

    let records = store.deliveries(newsletter.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Sent);
    let stored = store.newsletter(newsletter.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NewsletterStatus::Sent);
    assert_some!(stored.sent_at);
}

#[tokio::test]
async fn outcomes_for_recipients_deleted_mid_dispatch_are_dropped() {
    let store = postgres_store().await;
    let newsletter = newsletter();
    let stays = recipient("stays@example.com");
    let leaves = recipient("leaves@example.com");
    store.insert_newsletter(&newsletter).await.unwrap();
    store.insert_recipient(&stays).await.unwrap();
    store.insert_recipient(&leaves).await.unwrap();
    store
        .claim(newsletter.id, NewsletterStatus::Draft, None)
        .await
        .unwrap();
    store
        .record_pending(newsletter.id, &[stays.id, leaves.id])
        .await
        .unwrap();

    assert!(store.delete_recipient(leaves.id).await.unwrap());
    store
        .finish_dispatch(
            newsletter.id,
            &[(stays.id, DeliveryStatus::Sent), (leaves.id, DeliveryStatus::Sent)],
            NewsletterStatus::Sent,
            Utc::now(),
        )
        .await
        .unwrap();

    let records = store.deliveries(newsletter.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].recipient_id, stays.id);
    let stored = store.newsletter(newsletter.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NewsletterStatus::Sent);
}

#[tokio::test]
async fn duplicate_emails_conflict() {
    let store = postgres_store().await;
    store
        .insert_recipient(&recipient("a@example.com"))
        .await
        .unwrap();

    let outcome = store.insert_recipient(&recipient("A@example.com")).await;

    assert_matches!(outcome, Err(StoreError::Conflict(_)));
    assert!(!store
        .insert_recipient_if_absent(&recipient("a@example.com"))
        .await
        .unwrap());
}

#[tokio::test]
async fn unsubscribing_is_idempotent() {
    let store = postgres_store().await;
    let reader = recipient("reader@example.com");
    store.insert_recipient(&reader).await.unwrap();
    let token = reader.unsubscribe_token.as_ref();

    assert_some!(store.unsubscribe(token).await.unwrap());
    let again = assert_some!(store.unsubscribe(token).await.unwrap());

    assert_eq!(again.status, RecipientStatus::Unsubscribed);
    assert!(store.active_recipients().await.unwrap().is_empty());
    assert_none!(store.unsubscribe("unknown").await.unwrap());
}

#[tokio::test]
async fn sending_through_postgres_records_every_delivery() {
    let app = App::with_postgres().await;
    app.create_subscriber("ada@example.com").await;
    app.create_subscriber("grace@example.com").await;
    let id = app.create_draft("Weekly").await;

    let response = app.send_newsletter(id, &serde_json::json!({})).await;

    assert_eq!(response.status(), StatusCode::OK);
    let records: Vec<serde_json::Value> = app
        .admin(reqwest::Method::GET, &format!("/newsletters/{}/deliveries", id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r["status"] == "sent"));
    assert_eq!(app.get_newsletter(id).await["status"], "sent");
}
