//! HTTP API end to end: a real listener, reqwest, and the fake hypervisor.

mod common;

use std::sync::Arc;

use common::{FakeHypervisor, spawn_coordinator, within};
use reqwest::StatusCode;
use serde_json::Value;
use simplevm::coordinator::CoordinatorHandle;
use simplevm::server;
use simplevm::vm::readiness::ReadinessPolicy;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct TestServer {
    base: String,
    client: reqwest::Client,
    fake: Arc<FakeHypervisor>,
    _shutdown: oneshot::Sender<()>,
    _handle: CoordinatorHandle,
}

impl TestServer {
    async fn start() -> Self {
        let fake = FakeHypervisor::new();
        let handle = spawn_coordinator(ReadinessPolicy::kernel_only(), fake.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(server::serve(listener, handle.clone(), async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            fake,
            _shutdown: shutdown_tx,
            _handle: handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn status(&self) -> Value {
        self.client
            .get(self.url("/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn put_slot(&self, slot: &str, body: &str) -> reqwest::Response {
        self.client
            .put(self.url(&format!("/slots/{slot}")))
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str) -> reqwest::Response {
        self.client.post(self.url(path)).send().await.unwrap()
    }
}

#[tokio::test]
async fn status_starts_idle_and_not_ready() {
    let server = TestServer::start().await;
    let status = server.status().await;

    assert_eq!(status["phase"], "idle");
    assert_eq!(status["ready"], false);
    assert_eq!(status["missing"], serde_json::json!(["kernel"]));
    assert_eq!(status["description"], Value::Null);
}

#[tokio::test]
async fn slots_accept_paths_and_file_urls() {
    let server = TestServer::start().await;

    let resp = server.put_slot("kernel", "file:///images/vmlinuz").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = server.put_slot("vmlinuz", "/images/vmlinuz-2").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = server.put_slot("initrd", "/images/initrd\n").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["ready"], true);
    assert_eq!(status["slots"]["kernel"], "/images/vmlinuz-2");
    assert_eq!(status["slots"]["initrd"], "/images/initrd");

    let resp = server
        .client
        .delete(server.url("/slots/initrd"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let status = server.status().await;
    assert_eq!(status["slots"]["initrd"], Value::Null);
}

#[tokio::test]
async fn bad_slot_and_bad_path_are_rejected() {
    let server = TestServer::start().await;

    assert_eq!(
        server.put_slot("floppy", "/x").await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        server.put_slot("kernel", "   ").await.status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        server
            .put_slot("kernel", "https://example.com/vmlinuz")
            .await
            .status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(server.status().await["ready"], false);
}

#[tokio::test]
async fn start_before_ready_reports_missing_slots() {
    let server = TestServer::start().await;

    let outcome: Value = server.post("/start").await.json().await.unwrap();
    assert_eq!(outcome["outcome"], "not_ready");
    assert_eq!(outcome["missing"], serde_json::json!(["kernel"]));
    assert_eq!(server.fake.boot_count(), 0);
}

#[tokio::test]
async fn start_console_and_stop() {
    let server = TestServer::start().await;
    server.put_slot("kernel", "/images/vmlinuz").await;

    let outcome: Value = server.post("/start").await.json().await.unwrap();
    assert_eq!(outcome["outcome"], "started");
    assert_eq!(outcome["description"], "Running");
    assert_eq!(server.status().await["phase"], "running");

    let run = server.fake.last_run();
    run.hub.publish(b"Welcome\n");

    let mut output = server
        .client
        .get(server.url("/console"))
        .send()
        .await
        .unwrap();
    assert_eq!(output.status(), StatusCode::OK);
    let first = within(output.chunk()).await.unwrap().unwrap();
    assert_eq!(&first[..], b"Welcome\n");

    let resp = server
        .client
        .post(server.url("/console"))
        .body("uname -a\n")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(within(run.next_input()).await, Some(b"uname -a\n".to_vec()));

    let outcome: Value = server.post("/stop").await.json().await.unwrap();
    assert_eq!(outcome["outcome"], "stopped");
    let outcome: Value = server.post("/stop").await.json().await.unwrap();
    assert_eq!(outcome["outcome"], "not_running");

    let resp = server
        .client
        .get(server.url("/console"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}
