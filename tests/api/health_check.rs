use reqwest::{Method, StatusCode};

use crate::helpers::App;

#[tokio::test]
async fn health_check_works() {
    let app = App::new().await;

    let response = app.get_health_check().await;

    assert!(response.status().is_success());
    assert_eq!(response.content_length(), Some(0));
}

#[tokio::test]
async fn admin_routes_reject_missing_credentials() {
    let app = App::new().await;

    let response = app
        .request(Method::GET, "/admin/newsletters")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()["WWW-Authenticate"],
        r#"Basic realm="admin""#
    );
}

#[tokio::test]
async fn admin_routes_reject_a_wrong_password() {
    let app = App::new().await;

    let response = app
        .request(Method::GET, "/admin/subscribers")
        .basic_auth(&app.user.username, Some("not-the-password"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_reject_an_unknown_user() {
    let app = App::new().await;

    let response = app
        .request(Method::GET, "/admin/statistics")
        .basic_auth("somebody", Some(&app.user.password))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
