use anyhow::Result;
use hyper::{body::to_bytes, Body};
use k8s_openapi::chrono::{DateTime, Utc};
use kube::Client;

use crate::utils::Clock;

pub type ApiServerHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;
pub type SendResponse = tower_test::mock::SendResponse<http::Response<Body>>;

/// Create a client backed by a mocked API server handle.
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) =
        tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

/// A clock frozen at a fixed instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("stub succeeded")
}

/// A captured mock request, decoded for assertions.
pub struct Request {
    pub method: String,
    pub uri: String,
    pub body: serde_json::Value,
}

impl Request {
    pub async fn from_request(request: http::Request<Body>) -> Result<Self> {
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let body_bytes = to_bytes(request.into_body()).await?;
        let body = if body_bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body_bytes).expect("body should be JSON")
        };
        Ok(Self { method, uri, body })
    }
}

/// Wait for the next request sent to the mock API server.
pub async fn next_request(handle: &mut ApiServerHandle) -> (Request, SendResponse) {
    let (request, send) = handle.next_request().await.expect("service not called");
    let request = Request::from_request(request)
        .await
        .expect("request should decode");
    (request, send)
}

/// Respond with a JSON body.
pub fn respond_json(send: SendResponse, body: serde_json::Value) {
    send.send_response(
        http::Response::builder()
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    );
}

/// Respond with a Kubernetes Status error.
pub fn respond_error(send: SendResponse, code: u16, reason: &str) {
    let status = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{reason} (mock)"),
        "reason": reason,
        "code": code,
    });
    send.send_response(
        http::Response::builder()
            .status(code)
            .body(Body::from(serde_json::to_vec(&status).unwrap()))
            .unwrap(),
    );
}
