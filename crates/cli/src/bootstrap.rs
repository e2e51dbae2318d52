//! Process bootstrap: configuration, datastore, shared listener, shutdown.
//!
//! Startup walks a fixed sequence of [`BootState`]s. Any failure before the
//! gateway is serving is fatal and surfaces as a [`BootError`]; there is no
//! retry and no alternate port.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use gateway::{ChannelRegistry, GatewayServer};
use proto::{ConfigError, DatabaseError, GatewayError};
use store::{Datastore, SqliteStore};
use thiserror::Error;
use tracing::{error, info};

use crate::config::Config;

/// Exit status for a clean shutdown.
pub const EXIT_OK: u8 = 0;
/// Exit status for any fatal startup or serve failure.
pub const EXIT_FAILURE: u8 = 1;

/// Bootstrap lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Unconfigured,
    DatastoreConnecting,
    Listening,
    ServingOrFailed,
    Terminated,
}

impl BootState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::DatastoreConnecting => "datastore_connecting",
            Self::Listening => "listening",
            Self::ServingOrFailed => "serving_or_failed",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Datastore connection failed: {0}")]
    Datastore(#[from] DatabaseError),

    #[error("Port {port} is already in use")]
    AddrInUse { port: u16 },

    #[error("Failed to bind port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("Server error: {0}")]
    Serve(String),
}

impl From<GatewayError> for BootError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::AddrInUse { port } => Self::AddrInUse { port },
            GatewayError::Bind { port, reason } => Self::Bind { port, reason },
            GatewayError::Serve(reason) => Self::Serve(reason),
        }
    }
}

impl BootError {
    /// State the bootstrap was in when this error ended it.
    pub fn failed_in(&self) -> BootState {
        match self {
            Self::Config(_) => BootState::Unconfigured,
            Self::Datastore(_) => BootState::DatastoreConnecting,
            Self::AddrInUse { .. } | Self::Bind { .. } => BootState::Listening,
            Self::Serve(_) => BootState::ServingOrFailed,
        }
    }

    /// Operator-facing message, with remediation steps where they exist.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::AddrInUse { port } => format!("{self}\n\n{}", remediation(*port)),
            other => other.to_string(),
        }
    }
}

/// How to recover from an occupied listen port.
pub fn remediation(port: u16) -> String {
    let alternate = if port == u16::MAX { port - 1 } else { port + 1 };
    [
        format!("Another process is listening on port {port}. Either:"),
        format!("  1. Stop it: lsof -ti :{port} | xargs kill -9"),
        format!("  2. Use another port: set PORT={alternate} in .env, or pass --port {alternate}"),
    ]
    .join("\n")
}

/// Exit status for a finished bootstrap run.
pub fn exit_status(result: &Result<(), BootError>) -> u8 {
    match result {
        Ok(()) => EXIT_OK,
        Err(_) => EXIT_FAILURE,
    }
}

/// Tracks and logs state transitions.
struct Lifecycle {
    state: BootState,
}

impl Lifecycle {
    fn new() -> Self {
        info!(state = %BootState::Unconfigured, "Bootstrap starting");
        Self {
            state: BootState::Unconfigured,
        }
    }

    fn advance(&mut self, next: BootState) {
        info!(from = %self.state, to = %next, "Bootstrap transition");
        self.state = next;
    }

    fn fail(&mut self, err: &BootError) {
        error!(state = %err.failed_in(), "Bootstrap failed: {err}");
        self.advance(BootState::Terminated);
    }
}

/// Runs the gateway until `shutdown` resolves.
pub async fn run<F>(config: Config, shutdown: F) -> Result<(), BootError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut lifecycle = Lifecycle::new();
    let result = drive(&mut lifecycle, config, shutdown).await;
    match &result {
        Ok(()) => lifecycle.advance(BootState::Terminated),
        Err(e) => lifecycle.fail(e),
    }
    result
}

async fn drive<F>(lifecycle: &mut Lifecycle, config: Config, shutdown: F) -> Result<(), BootError>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    lifecycle.advance(BootState::DatastoreConnecting);

    let store = SqliteStore::connect(&config.database.url).await?;
    let datastore: Arc<dyn Datastore> = Arc::new(store);
    info!(backend = datastore.backend(), "Datastore connected");
    lifecycle.advance(BootState::Listening);

    let registry = Arc::new(ChannelRegistry::new());
    let server = match GatewayServer::bind(
        &config.gateway_config(),
        registry,
        Some(datastore.clone()),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            datastore.close().await;
            return Err(e.into());
        }
    };
    lifecycle.advance(BootState::ServingOrFailed);
    if let Ok(addr) = server.local_addr() {
        info!(%addr, "Serving realtime and control-plane traffic");
    }

    let served = server.serve(shutdown).await;
    datastore.close().await;
    served.map_err(BootError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(url: &str, port: u16) -> Config {
        let mut cfg = Config::default();
        cfg.server.host = "127.0.0.1".to_string();
        cfg.server.port = port;
        cfg.server.drain_timeout_secs = 1;
        cfg.database.url = url.to_string();
        cfg
    }

    #[test]
    fn remediation_names_port_and_both_options() {
        let text = remediation(8080);
        assert!(text.contains("8080"));
        assert!(text.contains("lsof -ti :8080 | xargs kill -9"));
        assert!(text.contains("PORT=8081"));
        assert!(text.contains("--port 8081"));
    }

    #[test]
    fn remediation_does_not_overflow_at_max_port() {
        let text = remediation(u16::MAX);
        assert!(text.contains("PORT=65534"));
    }

    #[test]
    fn gateway_errors_map_one_to_one() {
        assert!(matches!(
            BootError::from(GatewayError::AddrInUse { port: 1 }),
            BootError::AddrInUse { port: 1 }
        ));
        assert!(matches!(
            BootError::from(GatewayError::Bind {
                port: 2,
                reason: "denied".into()
            }),
            BootError::Bind { port: 2, .. }
        ));
        assert!(matches!(
            BootError::from(GatewayError::Serve("x".into())),
            BootError::Serve(_)
        ));
    }

    #[test]
    fn failed_lifecycle_ends_terminated() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(BootState::DatastoreConnecting);
        let err = BootError::Datastore(DatabaseError::Connection("refused".into()));
        assert_eq!(err.failed_in(), lifecycle.state);

        lifecycle.fail(&err);
        assert_eq!(lifecycle.state, BootState::Terminated);
    }

    #[tokio::test]
    async fn missing_datastore_url_fails_before_connecting() {
        let result = run(config_with("", 0), async {}).await;
        let err = result.as_ref().expect_err("missing url is fatal");
        assert!(matches!(err, BootError::Config(ConfigError::MissingField(_))));
        assert_eq!(err.failed_in(), BootState::Unconfigured);
        assert_eq!(exit_status(&result), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn unusable_datastore_is_fatal() {
        let result = run(config_with("mongodb://localhost/devices", 0), async {}).await;
        let err = result.as_ref().expect_err("unsupported scheme");
        assert!(matches!(err, BootError::Datastore(DatabaseError::InvalidUrl(_))));
        assert_eq!(err.failed_in(), BootState::DatastoreConnecting);
        assert_eq!(exit_status(&result), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn occupied_port_exits_with_remediation() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").expect("bind holder");
        let port = holder.local_addr().expect("addr").port();

        let result = run(config_with("sqlite::memory:", port), async {}).await;
        let err = result.as_ref().expect_err("port is taken");
        assert!(matches!(err, BootError::AddrInUse { port: p } if *p == port));
        assert_eq!(err.failed_in(), BootState::Listening);
        assert_eq!(exit_status(&result), EXIT_FAILURE);

        let message = err.diagnostic();
        assert!(message.contains(&port.to_string()));
        assert!(message.contains("lsof"));
        assert!(message.contains("--port"));
    }

    #[tokio::test]
    async fn serves_then_terminates_cleanly_on_signal() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(run(config_with("sqlite::memory:", 0), async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(()).expect("signal shutdown");

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("bootstrap stops")
            .expect("task joins");
        assert!(result.is_ok(), "clean shutdown: {result:?}");
        assert_eq!(exit_status(&result), EXIT_OK);
    }
}
