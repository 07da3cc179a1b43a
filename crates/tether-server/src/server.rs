use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use tether_engine::Orchestrator;

use crate::handlers;

/// How long open streams get to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-connection event queue; a client that falls this far behind is
    /// dropped and must reconnect.
    pub max_send_queue: usize,
    pub keepalive_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/query", post(handlers::start_query))
        .route("/api/command", post(handlers::start_command))
        .route("/api/reconnect", get(handlers::reconnect))
        .route("/api/status", get(handlers::status))
        .route("/api/abort", post(handlers::abort))
        .route("/api/permission", post(handlers::resolve_permission))
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session)
                .delete(handlers::delete_session)
                .patch(handlers::update_session),
        )
        .route("/api/sessions/{id}/rewind", post(handlers::rewind_session))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let state = AppState {
        orchestrator,
        config: Arc::new(config),
    };
    let router = build_router(state);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    tracing::info!(addr = %local_addr, "tether server started");

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait briefly for open streams.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let abort = self.server.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            tracing::warn!("open streams outlived shutdown grace, closing");
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tether_engine::mock::{scripted_turn, MockAgentBackend, MockStep};
    use tether_engine::{EngineConfig, RunnerLimits, ShellLauncher};
    use tether_store::{SessionStore, StoreConfig};

    struct TestServer {
        handle: ServerHandle,
        orchestrator: Arc<Orchestrator>,
        dir: tempfile::TempDir,
        client: reqwest::Client,
    }

    impl TestServer {
        async fn start(scripts: Vec<Vec<MockStep>>) -> Self {
            Self::start_with(scripts, EngineConfig::default()).await
        }

        async fn start_with(scripts: Vec<Vec<MockStep>>, engine: EngineConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(SessionStore::new(StoreConfig::new(
                dir.path().join("sessions.json"),
            )));
            let orchestrator = Arc::new(Orchestrator::new(
                engine,
                store,
                Arc::new(MockAgentBackend::new(scripts)),
                Arc::new(ShellLauncher),
            ));
            let config = ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                ..Default::default()
            };
            let handle = start(config, Arc::clone(&orchestrator)).await.unwrap();
            Self {
                handle,
                orchestrator,
                dir,
                client: reqwest::Client::new(),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://127.0.0.1:{}{}", self.handle.port, path)
        }

        fn cwd(&self) -> String {
            self.dir.path().display().to_string()
        }

        async fn post(&self, path: &str, body: Value) -> reqwest::Response {
            self.client.post(self.url(path)).json(&body).send().await.unwrap()
        }
    }

    /// Parse the `data:` payloads of a finished SSE body.
    fn frames(body: &str) -> Vec<Value> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).unwrap())
            .filter(|frame: &Value| frame["type"] != "keepalive")
            .collect()
    }

    fn kinds(frames: &[Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let server = TestServer::start(vec![]).await;
        let resp = reqwest::get(server.url("/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["runners"], 0);
        assert_eq!(body["pendingPermissions"], 0);
    }

    #[tokio::test]
    async fn query_streams_until_done() {
        let server = TestServer::start(vec![scripted_turn("agent-1", "hello", 0.1)]).await;
        let resp = server
            .post("/api/query", json!({"prompt": "hi", "cwd": server.cwd()}))
            .await;
        assert_eq!(resp.status(), 200);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let frames = frames(&resp.text().await.unwrap());
        assert_eq!(
            kinds(&frames),
            vec!["operation", "system", "user", "assistant", "result", "done"]
        );
        let indices: Vec<u64> = frames.iter().map(|f| f["index"].as_u64().unwrap()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(frames[5]["data"]["status"], "completed");

        let session: Value = reqwest::get(server.url("/api/sessions/agent-1"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(session["messageCount"], 1);
        assert_eq!(session["checkpoints"], json!(["agent-1-u1"]));
    }

    #[tokio::test]
    async fn invalid_start_requests_are_rejected_as_json() {
        let server = TestServer::start(vec![]).await;
        let resp = server
            .post("/api/query", json!({"prompt": "", "cwd": server.cwd()}))
            .await;
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "BAD_REQUEST");

        let resp = server
            .post(
                "/api/query",
                json!({"prompt": "hi", "cwd": server.cwd(), "permissionMode": "yolo"}),
            )
            .await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn busy_session_is_conflict() {
        let server = TestServer::start(vec![vec![MockStep::Hang]]).await;
        let first = server
            .post("/api/query", json!({"prompt": "a", "cwd": server.cwd(), "sessionId": "s1"}))
            .await;
        assert_eq!(first.status(), 200);

        let second = server
            .post("/api/query", json!({"prompt": "b", "cwd": server.cwd(), "sessionId": "s1"}))
            .await;
        assert_eq!(second.status(), 409);
        server.orchestrator.abort_all();
    }

    #[tokio::test]
    async fn command_streams_stdout_and_exit() {
        let server = TestServer::start(vec![]).await;
        let resp = server
            .post("/api/command", json!({"command": "echo one; echo two", "cwd": server.cwd()}))
            .await;
        let frames = frames(&resp.text().await.unwrap());
        assert_eq!(kinds(&frames), vec!["operation", "stdout", "stdout", "exit", "done"]);
        assert_eq!(frames[1]["data"]["data"], "one");
        assert_eq!(frames[3]["data"]["code"], 0);
    }

    #[tokio::test]
    async fn reconnect_after_finish_replays_tail_and_completes() {
        let server = TestServer::start(vec![scripted_turn("agent-2", "hello", 0.1)]).await;
        let resp = server
            .post("/api/query", json!({"prompt": "hi", "cwd": server.cwd()}))
            .await;
        let first = frames(&resp.text().await.unwrap());
        let operation_id = first[0]["data"]["operationId"].as_str().unwrap().to_string();

        let resp = reqwest::get(server.url(&format!(
            "/api/reconnect?operationId={operation_id}&lastIndex=2"
        )))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        let replayed = frames(&resp.text().await.unwrap());
        assert_eq!(
            kinds(&replayed),
            vec!["assistant", "result", "done", "reconnect_complete"]
        );
        assert_eq!(replayed[0]["index"], 3);
        assert!(replayed[3].get("index").is_none());
        assert_eq!(replayed[3]["data"]["status"], "completed");

        // By session id, having seen everything.
        let resp = reqwest::get(server.url("/api/reconnect?sessionId=agent-2&lastIndex=5"))
            .await
            .unwrap();
        let replayed = frames(&resp.text().await.unwrap());
        assert_eq!(kinds(&replayed), vec!["reconnect_complete"]);
    }

    #[tokio::test]
    async fn reconnect_reports_buffer_gap() {
        let engine = EngineConfig {
            limits: RunnerLimits {
                query_buffer_cap: 3,
                command_buffer_cap: 3,
            },
            ..Default::default()
        };
        let server = TestServer::start_with(vec![], engine).await;
        let resp = server
            .post(
                "/api/command",
                json!({"command": "for i in 1 2 3 4 5 6; do echo $i; done", "cwd": server.cwd()}),
            )
            .await;
        let first = frames(&resp.text().await.unwrap());
        let operation_id = first[0]["data"]["operationId"].as_str().unwrap().to_string();
        let total = first.len() as u64;

        let resp = reqwest::get(server.url(&format!("/api/reconnect?operationId={operation_id}")))
            .await
            .unwrap();
        let replayed = frames(&resp.text().await.unwrap());
        assert_eq!(replayed[0]["type"], "buffer_gap");
        assert_eq!(replayed[0]["data"]["requestedFrom"], 0);
        assert_eq!(replayed[0]["data"]["firstAvailable"], total - 3);
        assert_eq!(
            kinds(&replayed[1..]),
            vec!["stdout", "exit", "done", "reconnect_complete"]
        );
    }

    #[tokio::test]
    async fn reconnect_past_published_index_is_rejected() {
        let server = TestServer::start(vec![vec![MockStep::Hang]]).await;
        let resp = server
            .post("/api/query", json!({"prompt": "hi", "cwd": server.cwd(), "sessionId": "ahead"}))
            .await;
        assert_eq!(resp.status(), 200);

        // Only the `operation` event (index 0) exists.
        let resp = reqwest::get(server.url("/api/reconnect?sessionId=ahead&lastIndex=7"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "BAD_REQUEST");

        let resp = reqwest::get(server.url("/api/reconnect?sessionId=ahead&lastIndex=0"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        server.orchestrator.abort_all();
    }

    #[tokio::test]
    async fn reconnect_to_unknown_operation_is_not_found() {
        let server = TestServer::start(vec![]).await;
        let resp = reqwest::get(server.url("/api/reconnect?operationId=op_missing"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = reqwest::get(server.url("/api/reconnect")).await.unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn disconnect_keeps_operation_running_and_reconnect_goes_live() {
        let server = TestServer::start(vec![vec![
            MockStep::assistant("before"),
            MockStep::Hang,
        ]])
        .await;
        let resp = server
            .post("/api/query", json!({"prompt": "hi", "cwd": server.cwd(), "sessionId": "live"}))
            .await;
        assert_eq!(resp.status(), 200);
        drop(resp);

        let runner = server
            .orchestrator
            .find(Some(&tether_core::ids::SessionId::from_raw("live")), None)
            .unwrap();
        while runner.event_count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(runner.is_running());

        let status: Value = reqwest::get(server.url("/api/status?sessionId=live"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["active"], true);
        assert_eq!(status["status"], "running");
        assert_eq!(status["eventCount"], 2);

        // Headers arrive after the handler has subscribed.
        let resp = reqwest::get(server.url("/api/reconnect?sessionId=live&lastIndex=1"))
            .await
            .unwrap();
        let abort = server
            .post(
                "/api/abort",
                json!({"operationId": runner.operation_id().as_str(), "hard": true}),
            )
            .await;
        assert_eq!(abort.status(), 200);
        let body: Value = abort.json().await.unwrap();
        assert_eq!(body["outcome"], "aborted");

        let replayed = frames(&resp.text().await.unwrap());
        assert_eq!(kinds(&replayed), vec!["done", "reconnect_complete"]);
        assert_eq!(replayed[0]["index"], 2);
        assert_eq!(replayed[0]["data"]["status"], "aborted");
    }

    #[tokio::test]
    async fn status_of_unknown_operation_is_inactive() {
        let server = TestServer::start(vec![]).await;
        let status: Value = reqwest::get(server.url("/api/status?operationId=op_gone"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["active"], false);
        assert_eq!(status["eventCount"], 0);
    }

    #[tokio::test]
    async fn abort_unknown_operation_is_not_found() {
        let server = TestServer::start(vec![]).await;
        let resp = server
            .post("/api/abort", json!({"operationId": "op_nope"}))
            .await;
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn permission_decision_over_http() {
        let server = TestServer::start(vec![vec![
            MockStep::permission("Bash", json!({"command": "ls"})),
            MockStep::assistant("done"),
        ]])
        .await;
        let resp = server
            .post("/api/query", json!({"prompt": "hi", "cwd": server.cwd()}))
            .await;

        while server.orchestrator.broker().pending_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let runner = server.orchestrator.registry().running().pop().unwrap();
        let request_id = runner
            .replay_from(0)
            .events
            .iter()
            .find(|e| e.event_type() == "permission_request")
            .map(|e| e.payload.data()["requestId"].as_str().unwrap().to_string())
            .unwrap();

        let bad = server
            .post("/api/permission", json!({"requestId": request_id, "decision": "maybe"}))
            .await;
        assert_eq!(bad.status(), 400);

        let ok = server
            .post("/api/permission", json!({"requestId": request_id, "decision": "allow"}))
            .await;
        assert_eq!(ok.status(), 200);
        let again = server
            .post("/api/permission", json!({"requestId": request_id, "decision": "deny"}))
            .await;
        assert_eq!(again.status(), 404);

        let frames = frames(&resp.text().await.unwrap());
        assert_eq!(
            kinds(&frames),
            vec!["operation", "permission_request", "permission_resolved", "user", "assistant", "done"]
        );
        assert_eq!(frames[2]["data"]["allowed"], true);
    }

    #[tokio::test]
    async fn session_endpoints() {
        let server = TestServer::start(vec![]).await;
        let resp = reqwest::get(server.url("/api/sessions/nope")).await.unwrap();
        assert_eq!(resp.status(), 404);

        let mut state = tether_store::SessionState::new("m");
        state.checkpoints = vec!["u0".into(), "u1".into(), "u2".into()];
        server
            .orchestrator
            .store()
            .save(tether_core::ids::SessionId::from_raw("s"), state);

        let resp = server
            .post("/api/sessions/s/rewind", json!({"index": 1}))
            .await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["checkpoint"], "u1");

        let resp = server
            .post("/api/sessions/s/rewind", json!({"index": 7}))
            .await;
        assert_eq!(resp.status(), 400);

        let resp = server
            .client
            .patch(server.url("/api/sessions/s"))
            .json(&json!({"permissionMode": "plan"}))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["permissionMode"], "plan");
        assert_eq!(body["checkpoints"], json!(["u0"]));

        let resp = server
            .client
            .delete(server.url("/api/sessions/s"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
        let resp = reqwest::get(server.url("/api/sessions/s")).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_connections() {
        let server = TestServer::start(vec![]).await;
        let url = server.url("/health");
        server.handle.shutdown().await;
        assert!(reqwest::get(&url).await.is_err());
    }
}
