//! Backend client against a canned HTTP responder
//!
//! Each test binds a one-shot TCP listener that records the raw request and
//! answers with a fixed response.

use backend::{BackendClient, BackendError, EdgeFunction, Order, Query};
use backend::functions::{DeployAgentRequest, DeployResponse};
use bazaar_config::BackendConfig;
use bazaar_types::{Deployment, DeploymentState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Canned {
    status: &'static str,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Canned {
    fn json(body: serde_json::Value) -> Self {
        Self {
            status: "200 OK",
            headers: vec![("Content-Type", "application/json".to_string())],
            body: body.to_string(),
        }
    }
}

/// Serve exactly one request; the handle resolves to the raw request text
async fn serve_once(canned: Canned) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;

        let mut response = format!("HTTP/1.1 {}\r\n", canned.status);
        for (name, value) in &canned.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            canned.body.len(),
            canned.body
        ));
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();

        request
    });

    (format!("http://{}", addr), handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf).to_string();
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }

    String::from_utf8_lossy(&buf).to_string()
}

fn client(base_url: &str) -> BackendClient {
    BackendClient::new(&BackendConfig {
        url: base_url.to_string(),
        anon_key: "anon-key".to_string(),
        request_timeout_ms: 5000,
    })
    .unwrap()
}

fn deployment_row(id: Uuid, status: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "agent_id": Uuid::new_v4(),
        "status": status,
        "progress": 40,
        "created_at": "2024-05-01T12:00:00Z"
    })
}

#[tokio::test]
async fn test_select_sends_filters_and_auth() {
    let id = Uuid::new_v4();
    let (base, server) = serve_once(Canned::json(serde_json::json!([
        deployment_row(id, "deploying"),
        { "id": "broken" }
    ])))
    .await;

    let client = client(&base);
    client.set_access_token(Some("user-jwt".to_string()));

    let query = Query::table("deployments")
        .eq("id", id)
        .order("created_at", Order::Desc)
        .limit(1);
    let rows: Vec<Deployment> = client.select(&query).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, DeploymentState::Deploying);
    assert_eq!(rows[0].progress, Some(40));

    let request = server.await.unwrap();
    let request_line = request.lines().next().unwrap();
    assert!(request_line.starts_with("GET /rest/v1/deployments?"));
    assert!(request_line.contains(&format!("id=eq.{}", id)));
    assert!(request_line.contains("order=created_at.desc"));
    assert!(request_line.contains("limit=1"));

    let lower = request.to_ascii_lowercase();
    assert!(lower.contains("apikey: anon-key"));
    assert!(lower.contains("authorization: bearer user-jwt"));
}

#[tokio::test]
async fn test_count_reads_content_range() {
    let (base, server) = serve_once(Canned {
        status: "200 OK",
        headers: vec![("Content-Range", "0-0/17".to_string())],
        body: String::new(),
    })
    .await;

    let total = client(&base)
        .count(&Query::table("reviews").eq("agent_id", "a1"))
        .await
        .unwrap();
    assert_eq!(total, 17);

    let request = server.await.unwrap();
    assert!(request.starts_with("HEAD /rest/v1/reviews?agent_id=eq.a1"));
    assert!(request.to_ascii_lowercase().contains("prefer: count=exact"));
}

#[tokio::test]
async fn test_api_error_carries_message() {
    let (base, _server) = serve_once(Canned {
        status: "400 Bad Request",
        headers: vec![("Content-Type", "application/json".to_string())],
        body: r#"{"message":"column \"nope\" does not exist"}"#.to_string(),
    })
    .await;

    let result: Result<Vec<Deployment>, _> = client(&base)
        .select(&Query::table("deployments").eq("nope", 1))
        .await;

    match result {
        Err(BackendError::Api { status, message }) => {
            assert_eq!(status, 400);
            assert!(message.contains("does not exist"));
        }
        other => panic!("expected api error, got {:?}", other.map(|r| r.len())),
    }
}

#[tokio::test]
async fn test_deploy_agent_function() {
    let deployment_id = Uuid::new_v4();
    let (base, server) = serve_once(Canned::json(serde_json::json!({
        "deploymentId": deployment_id,
        "status": "deploying"
    })))
    .await;

    let response = client(&base)
        .deploy_agent(&DeployAgentRequest {
            agent_id: Uuid::new_v4(),
            version_id: None,
            environment: "production".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.deployment_id, deployment_id);

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /functions/v1/deploy-agent"));
    assert!(request.contains("\"environment\":\"production\""));
}

#[tokio::test]
async fn test_function_error_field() {
    let (base, _server) = serve_once(Canned::json(serde_json::json!({
        "error": { "message": "agent has no published version" }
    })))
    .await;

    let result: Result<DeployResponse, _> = client(&base)
        .invoke(EdgeFunction::DeployAgent, &serde_json::json!({}))
        .await;

    match result {
        Err(BackendError::Api { message, .. }) => {
            assert_eq!(message, "agent has no published version")
        }
        other => panic!("expected function error, got {:?}", other.map(|r| r.deployment_id)),
    }
}

#[tokio::test]
async fn test_get_user_requires_session() {
    let client = client("http://127.0.0.1:9");
    assert!(matches!(client.get_user().await, Err(BackendError::Unauthenticated)));
}

#[tokio::test]
async fn test_unfiltered_delete_refused() {
    let client = client("http://127.0.0.1:9");
    let result = client.delete(&Query::table("webhooks")).await;
    assert!(matches!(result, Err(BackendError::Config(_))));
}
