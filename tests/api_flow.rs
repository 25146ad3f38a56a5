//! End-to-end flow through the public router: two users share an
//! organization, work its invoices and send a reminder.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Local};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use noa_cobros::config::AppConfig;
use noa_cobros::notify::{Messenger, NotifyError};
use noa_cobros::rest::{create_router, AppState};
use noa_cobros::storage::Storage;

#[derive(Default)]
struct Outbox {
    messages: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Messenger for Outbox {
    async fn send(&self, to: &str, text: &str) -> Result<Value, NotifyError> {
        self.messages.lock().unwrap().push((to.to_string(), text.to_string()));
        Ok(json!({ "success": true }))
    }
}

fn app(outbox: Arc<Outbox>) -> Router {
    let config = AppConfig {
        bcrypt_cost: 4,
        ..AppConfig::default()
    };
    let storage = Storage::temporary().unwrap();
    create_router(AppState::new(storage, config, Some(outbox as Arc<dyn Messenger>)))
}

async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn send_json(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let (status, text) = send(app, method, uri, token, body).await;
    (status, serde_json::from_str(&text).unwrap_or(Value::Null))
}

async fn signup(app: &Router, username: &str) -> String {
    let creds = json!({ "username": username, "password": "secret" });
    let (status, _) = send_json(app, "POST", "/auth/register", None, Some(creds.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send_json(app, "POST", "/auth/login", None, Some(creds)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "bearer");
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_organization_invoice_lifecycle() {
    let outbox = Arc::new(Outbox::default());
    let app = app(outbox.clone());

    let owner = signup(&app, "tony").await;
    let agent = signup(&app, "jeff").await;
    let outsider = signup(&app, "mallory").await;

    let (status, org) = send_json(&app, "POST", "/orgs", Some(&owner), Some(json!({ "name": "NOA" }))).await;
    assert_eq!(status, StatusCode::OK);
    let org_id = org["id"].as_str().unwrap().to_string();

    let (status, _) = send_json(
        &app,
        "POST",
        &format!("/orgs/{}/users", org_id),
        Some(&owner),
        Some(json!({ "username": "jeff", "role": "agent" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let due = Local::now().date_naive() + Duration::days(7);
    let (status, invoice) = send_json(
        &app,
        "POST",
        "/invoices",
        Some(&agent),
        Some(json!({
            "client_name": "Ana Mora",
            "phone": "50688880001",
            "amount": 45000.0,
            "reference": "F-0001",
            "due_date": due.to_string(),
            "org_id": org_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(invoice["state"], "pending");
    let invoice_uri = format!("/invoices/{}", invoice["id"]);

    // The owner sees the agent's invoice, an outsider does not
    let (_, listed) = send_json(&app, "GET", "/invoices", Some(&owner), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, listed) = send_json(&app, "GET", "/invoices", Some(&outsider), None).await;
    assert!(listed.as_array().unwrap().is_empty());
    let (status, _) = send_json(&app, "GET", &invoice_uri, Some(&outsider), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, stats) = send_json(&app, "GET", "/stats", Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["due_next_7_days"], 1);

    let (status, csv) = send(&app, "GET", "/export/invoices.csv", Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(csv.lines().count(), 2);
    assert!(csv.contains("Ana Mora"));

    let (status, reply) = send_json(&app, "POST", "/notify", Some(&agent), Some(json!({ "ids": [invoice["id"]] }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["sent"], 1);
    {
        let messages = outbox.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "50688880001");
        assert!(messages[0].1.contains("Ana Mora"));
    }

    let (status, paid) = send_json(&app, "PATCH", &invoice_uri, Some(&agent), Some(json!({ "state": "paid" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paid["state"], "paid");

    // Agents cannot delete; the owner can
    let (status, _) = send_json(&app, "DELETE", &invoice_uri, Some(&agent), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send_json(&app, "DELETE", &invoice_uri, Some(&owner), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, stats) = send_json(&app, "GET", "/stats", Some(&owner), None).await;
    assert_eq!(stats["total"], 0);
}

#[tokio::test]
async fn test_protected_routes_require_a_token() {
    let app = app(Arc::new(Outbox::default()));
    for uri in ["/invoices", "/stats", "/orgs", "/templates", "/export/invoices.csv"] {
        let (status, _) = send_json(&app, "GET", uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
    }
    let (status, _) = send_json(&app, "GET", "/invoices", Some("not-a-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, doc) = send_json(&app, "GET", "/openapi.json", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/invoices"].is_object());
}
