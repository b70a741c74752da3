use std::sync::Arc;
use std::time::Duration;

use dmflow_api::app::services::{self, AppSettings, BackgroundTasks};
use dmflow_core::{HandlerError, Job, RetryPolicy};
use dmflow_events::{SIGNATURE_HEADER, WebhookEvent, sign};
use dmflow_infra::{ProcessRole, QueueConfig, handler_fn};
use reqwest::StatusCode;
use serde_json::json;

const APP_SECRET: &str = "test-app-secret";
const VERIFY_TOKEN: &str = "test-verify-token";
const ADMIN_TOKEN: &str = "test-admin-token";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _background: BackgroundTasks,
}

impl TestServer {
    async fn spawn(role: ProcessRole) -> Self {
        let config = QueueConfig {
            idle_poll_interval: Duration::from_millis(10),
            job_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
            retry: RetryPolicy::exponential(3, Duration::ZERO, Duration::ZERO).with_jitter(0.0),
            role,
            ..QueueConfig::default()
        };
        let settings = AppSettings {
            app_secret: Some(APP_SECRET.to_string()),
            verify_token: Some(VERIFY_TOKEN.to_string()),
            admin_token: Some(ADMIN_TOKEN.to_string()),
        };
        let services = Arc::new(services::build_in_memory_services(config, settings));

        // Messages saying "fail" are rejected permanently; everything else succeeds.
        let handler = handler_fn(|job: Job| async move {
            match WebhookEvent::from_payload(&job.payload) {
                Ok(WebhookEvent::DirectMessage(dm)) if dm.text.as_deref() == Some("fail") => {
                    Err(HandlerError::terminal("rejected by automation"))
                }
                Ok(_) => Ok(()),
                Err(e) => Err(HandlerError::terminal(e.to_string())),
            }
        });
        let background = services::start_background(&services, Arc::new(handler));

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = dmflow_api::app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _background: background,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn dm_delivery(mid: &str, text: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "object": "instagram",
        "entry": [{
            "id": "17841400000000000",
            "time": 1_700_000_000,
            "messaging": [{
                "sender": { "id": "9000" },
                "recipient": { "id": "17841400000000000" },
                "timestamp": 1_700_000_000_000i64,
                "message": { "mid": mid, "text": text }
            }]
        }]
    }))
    .unwrap()
}

async fn post_webhook(client: &reqwest::Client, base_url: &str, body: Vec<u8>) -> reqwest::Response {
    let signature = sign(&body, APP_SECRET.as_bytes());
    client
        .post(format!("{}/webhooks/instagram", base_url))
        .header(SIGNATURE_HEADER, signature)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap()
}

async fn admin_get(client: &reqwest::Client, url: String) -> reqwest::Response {
    client.get(url).bearer_auth(ADMIN_TOKEN).send().await.unwrap()
}

/// Poll `/admin/stats` until `check` holds.
async fn stats_eventually<F>(client: &reqwest::Client, base_url: &str, check: F) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    for _ in 0..200 {
        let res = admin_get(client, format!("{}/admin/stats", base_url)).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        if check(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("stats did not reach the expected state in time");
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn(ProcessRole::All).await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_requires_bearer_token() {
    let srv = TestServer::spawn(ProcessRole::All).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/admin/stats", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/admin/stats", srv.base_url))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = admin_get(&client, format!("{}/admin/stats", srv.base_url)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["healthStatus"], "healthy");
    assert_eq!(body["successRatePct"], 100.0);
    assert!(body["workers"].as_array().is_some_and(|w| !w.is_empty()));
}

#[tokio::test]
async fn subscription_handshake_echoes_challenge() {
    let srv = TestServer::spawn(ProcessRole::All).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/webhooks/instagram", srv.base_url))
        .query(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", VERIFY_TOKEN),
            ("hub.challenge", "1158201444"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "1158201444");

    let res = client
        .get(format!("{}/webhooks/instagram", srv.base_url))
        .query(&[
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "guess"),
            ("hub.challenge", "1158201444"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unsigned_or_malformed_deliveries_are_rejected() {
    let srv = TestServer::spawn(ProcessRole::All).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/webhooks/instagram", srv.base_url))
        .header(SIGNATURE_HEADER, "sha256=00")
        .body(dm_delivery("mid.1", "hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_signature");

    let res = post_webhook(&client, &srv.base_url, b"{not json".to_vec()).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delivery_is_enqueued_once_and_processed() {
    let srv = TestServer::spawn(ProcessRole::All).await;
    let client = reqwest::Client::new();

    let res = post_webhook(&client, &srv.base_url, dm_delivery("mid.42", "hello")).await;
    assert_eq!(res.status(), StatusCode::OK);
    let ack: serde_json::Value = res.json().await.unwrap();
    assert_eq!(ack, json!({ "accepted": 1, "duplicates": 0 }));

    // Provider redelivery.
    let res = post_webhook(&client, &srv.base_url, dm_delivery("mid.42", "hello")).await;
    let ack: serde_json::Value = res.json().await.unwrap();
    assert_eq!(ack, json!({ "accepted": 0, "duplicates": 1 }));

    let stats = stats_eventually(&client, &srv.base_url, |s| s["completed"] == 1).await;
    assert_eq!(stats["pending"], 0);
    assert_eq!(stats["completedLastWindow"], 1);
    assert_eq!(stats["workers"][0]["succeeded"], 1);
}

#[tokio::test]
async fn malformed_sibling_does_not_block_valid_events() {
    let srv = TestServer::spawn(ProcessRole::All).await;
    let client = reqwest::Client::new();

    let body = serde_json::to_vec(&json!({
        "object": "instagram",
        "entry": [{
            "id": "17841400000000000",
            "changes": [{ "field": "comments", "value": { "text": "missing id", "from": { "id": "9001" } } }],
            "messaging": [{
                "sender": { "id": "9000" },
                "message": { "mid": "mid.sibling", "text": "hello" }
            }]
        }]
    }))
    .unwrap();

    let res = post_webhook(&client, &srv.base_url, body).await;
    assert_eq!(res.status(), StatusCode::OK);
    let ack: serde_json::Value = res.json().await.unwrap();
    assert_eq!(ack, json!({ "accepted": 1, "duplicates": 0 }));
}

#[tokio::test]
async fn dead_letters_can_be_inspected_requeued_and_deleted() {
    let srv = TestServer::spawn(ProcessRole::All).await;
    let client = reqwest::Client::new();

    post_webhook(&client, &srv.base_url, dm_delivery("mid.bad", "fail")).await;
    stats_eventually(&client, &srv.base_url, |s| s["dead"] == 1).await;

    let res = admin_get(&client, format!("{}/admin/dead-letters", srv.base_url)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let entries: serde_json::Value = res.json().await.unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["reason"], "terminal_failure");
    let id = entries[0]["job"]["id"].as_str().unwrap().to_string();

    let res = admin_get(&client, format!("{}/admin/jobs/{}", srv.base_url, id)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let job: serde_json::Value = res.json().await.unwrap();
    assert_eq!(job["status"], "dead");
    assert_eq!(job["last_error"], "rejected by automation");

    let res = client
        .post(format!("{}/admin/dead-letters/{}/requeue", srv.base_url, id))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let requeued: serde_json::Value = res.json().await.unwrap();
    assert_eq!(requeued["attempts"], 0);

    // The handler rejects it again.
    stats_eventually(&client, &srv.base_url, |s| s["dead"] == 1 && s["pending"] == 0 && s["processing"] == 0).await;

    let res = client
        .delete(format!("{}/admin/dead-letters/{}", srv.base_url, id))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .delete(format!("{}/admin/dead-letters/{}", srv.base_url, id))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn job_lookup_validates_ids_and_reap_reports_nothing_stale() {
    let srv = TestServer::spawn(ProcessRole::All).await;
    let client = reqwest::Client::new();

    let res = admin_get(&client, format!("{}/admin/jobs/not-a-uuid", srv.base_url)).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = admin_get(
        &client,
        format!("{}/admin/jobs/0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b", srv.base_url),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(format!("{}/admin/reap", srv.base_url))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, json!({ "reaped": 0, "jobIds": [] }));
}

#[tokio::test]
async fn worker_role_does_not_expose_webhooks() {
    let srv = TestServer::spawn(ProcessRole::Worker).await;
    let client = reqwest::Client::new();

    let res = post_webhook(&client, &srv.base_url, dm_delivery("mid.1", "hi")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = admin_get(&client, format!("{}/admin/stats", srv.base_url)).await;
    assert_eq!(res.status(), StatusCode::OK);
}
