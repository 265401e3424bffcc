//! Shared fixtures for the admin surface integration tests.
//!
//! Fixture hosts (manifest, artifacts, core, child health) are
//! in-process axum servers on ephemeral loopback ports; the supervisor
//! is replaced by a counting stub so tests can assert restart
//! accounting without real child processes.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use tokio::net::TcpListener;

use payram_agent_core::config::AgentConfig;
use payram_agent_core::layout::AgentPaths;
use payram_agent_core::secrets::SecretStore;
use payram_agent_core::status::StatusStore;
use payram_agent_core::supervisor::{RestartChildren, SupervisorStatus};
use payram_agent_core::update::UpdateController;

use payram_agent_daemon::admin::{self, AdminGuard, AppState, ChildSupervisor};
use payram_agent_daemon::metrics::AgentMetrics;

/// Counting supervisor stub.
pub struct StubSupervisor {
    pub restarts: AtomicU32,
}

impl StubSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            restarts: AtomicU32::new(0),
        })
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl RestartChildren for StubSupervisor {
    fn restart_all(&self) -> Result<(), String> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ChildSupervisor for StubSupervisor {
    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            components: Vec::new(),
        }
    }

    fn logs(&self, component: &str, tail: usize) -> Option<Vec<String>> {
        match component {
            "chat" | "mcp" => Some(
                vec![format!("[{component}] started pid=42")]
                    .into_iter()
                    .take(tail)
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Builds the admin app state over a temp home and the stub supervisor.
pub fn app_state(config: AgentConfig, stub: &Arc<StubSupervisor>) -> AppState {
    let paths = AgentPaths::new(&config.home);
    let controller = UpdateController::new(
        config.clone(),
        Arc::clone(stub) as Arc<dyn RestartChildren>,
    )
    .expect("controller");

    AppState {
        guard: Arc::new(AdminGuard::new(
            config.admin_token.clone(),
            &config.admin_allowlist,
        )),
        supervisor: Arc::clone(stub) as Arc<dyn ChildSupervisor>,
        controller: Arc::new(controller),
        status: StatusStore::new(&paths),
        secrets: SecretStore::new(&paths),
        metrics: Arc::new(AgentMetrics::new().expect("metrics")),
        http: reqwest::Client::new(),
        config: Arc::new(config),
    }
}

/// Serves the agent router on an ephemeral loopback port with real
/// connection info, returning its address.
pub async fn serve_agent(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = admin::router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Serves an arbitrary fixture router on an ephemeral loopback port.
pub async fn serve_fixture(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A health fixture answering with a fixed status on `/health`.
pub async fn serve_health(status: StatusCode) -> SocketAddr {
    serve_fixture(Router::new().route("/health", get(move || async move { status }))).await
}

/// A core fixture answering `/internal/version` with the given version.
pub async fn serve_core(version: &str) -> SocketAddr {
    let body = format!(r#"{{"version":"{version}"}}"#);
    serve_fixture(Router::new().route(
        "/internal/version",
        get(move || {
            let body = body.clone();
            async move {
                ([("content-type", "application/json")], body)
            }
        }),
    ))
    .await
}

/// A signed release published by a fixture update host.
pub struct UpdateHost {
    /// Base URL of the manifest host.
    pub base_url: String,
    /// Base64 public key matching the manifest signature.
    pub pubkey_b64: String,
    /// The version the manifest declares.
    pub version: String,
}

pub struct UpdateHostSpec {
    pub version: String,
    pub min: String,
    pub max: String,
    pub revoked: bool,
    /// When set, the signature is produced by an unrelated key.
    pub tamper_signature: bool,
    /// Artificial delay on the manifest route, for lock-contention tests.
    pub manifest_delay: std::time::Duration,
}

impl Default for UpdateHostSpec {
    fn default() -> Self {
        Self {
            version: "2.0.0".to_string(),
            min: "1.12.0".to_string(),
            max: "1.13.x".to_string(),
            revoked: false,
            tamper_signature: false,
            manifest_delay: std::time::Duration::ZERO,
        }
    }
}

/// Publishes a signed manifest plus both artifacts on one fixture host.
pub async fn serve_update_host(spec: UpdateHostSpec) -> UpdateHost {
    let chat_data = b"chat-binary-bytes".to_vec();
    let mcp_data = b"mcp-binary-bytes".to_vec();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    let manifest = serde_json::json!({
        "name": "payram-analytics",
        "channel": "stable",
        "version": spec.version,
        "released_at": "2025-06-01T12:00:00Z",
        "notes": "integration fixture",
        "revoked": spec.revoked,
        "artifacts": {
            "chat": {
                "url": format!("{base_url}/chat"),
                "sha256": sha256_hex(&chat_data),
            },
            "mcp": {
                "url": format!("{base_url}/mcp"),
                "sha256": sha256_hex(&mcp_data),
            }
        },
        "compatibility": {"payram_core": {"min": spec.min, "max": spec.max}}
    });
    let raw = serde_json::to_vec(&manifest).unwrap();

    let signing = SigningKey::generate(&mut OsRng);
    let pubkey_b64 = BASE64.encode(signing.verifying_key().to_bytes());
    let signer = if spec.tamper_signature {
        SigningKey::generate(&mut OsRng)
    } else {
        signing
    };
    let signature = signer.sign(&raw).to_bytes().to_vec();

    let delay = spec.manifest_delay;
    let manifest_body = raw.clone();
    let app = Router::new()
        .route(
            "/stable/manifest.json",
            get(move || {
                let body = manifest_body.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    body
                }
            }),
        )
        .route(
            "/stable/manifest.json.sig",
            get(move || {
                let body = signature.clone();
                async move { body }
            }),
        )
        .route(
            "/chat",
            get(move || {
                let body = chat_data.clone();
                async move { body }
            }),
        )
        .route(
            "/mcp",
            get(move || {
                let body = mcp_data.clone();
                async move { body }
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    UpdateHost {
        base_url,
        pubkey_b64,
        version: spec.version,
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Parses an envelope body into JSON.
pub async fn body_json(response: reqwest::Response) -> serde_json::Value {
    response.json().await.unwrap()
}
