//! HTTP surface of the gateway: routing, authentication, CORS, the SSE
//! writer and graceful shutdown. Kept deliberately thin; all behavior of
//! substance lives in `relay-core`.

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::http::HeaderValue;
use axum::http::Method;
use axum::http::header;
use axum::middleware;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use relay_core::GatewayConfig;
use relay_core::McpSupervisor;
use relay_core::SessionManager;
use relay_core::SupervisorTimeouts;
use relay_core::secrets::ApiKeyResolver;
use relay_core::secrets::SecretFetcher;
use relay_core::store::ConfigStore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing::warn;

pub mod auth;
pub mod error;
mod routes;
mod sse;

pub use sse::STREAM_ID_HEADER;

pub struct AppState {
    pub config: GatewayConfig,
    pub resolver: ApiKeyResolver,
    pub supervisor: Arc<McpSupervisor>,
    pub sessions: Arc<SessionManager>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn ConfigStore>,
        fetcher: Arc<dyn SecretFetcher>,
    ) -> SharedState {
        let resolver = ApiKeyResolver::new(config.api_key.clone(), fetcher);
        let supervisor = Arc::new(McpSupervisor::new(
            store,
            config.scratch_root.clone(),
            SupervisorTimeouts::default(),
        ));
        let sessions = SessionManager::new(config.idle_horizon);
        Arc::new(Self {
            config,
            resolver,
            supervisor,
            sessions,
        })
    }
}

pub fn build_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/list/models", get(routes::list_models))
        .route("/list/mcp_server", get(routes::list_mcp_servers))
        .route("/add/mcp_server", post(routes::add_mcp_server))
        .route(
            "/remove/mcp_server/{server_id}",
            delete(routes::remove_mcp_server),
        )
        .route("/chat/completions", post(routes::chat_completions))
        .route("/stop/stream/{stream_id}", post(routes::stop_stream))
        .route("/remove/history", post(routes::remove_history))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let v1 = Router::new()
        .route("/health", get(routes::health))
        .merge(protected);

    Router::new()
        .nest("/v1", v1)
        .layer(cors_layer(&state.config))
        .layer(DefaultBodyLimit::max(state.config.body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Explicit allow-list CORS. An empty list denies every cross-origin
/// request; wildcard entries were already rejected at config load.
fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "dropping unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-user-id"),
        ])
}

/// Bind and run until `shutdown` fires. Bind failures surface to the caller
/// so the process can exit non-zero.
pub async fn serve(state: SharedState, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, https = state.config.use_https, "gateway listening");

    let app = build_router(state.clone());

    if state.config.use_https {
        #[cfg(feature = "tls")]
        {
            return tls::serve_tls(listener, app, &state, shutdown).await;
        }
        #[cfg(not(feature = "tls"))]
        {
            return Err(std::io::Error::other(
                "USE_HTTPS requires the `tls` build feature",
            ));
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(feature = "tls")]
mod tls {
    use std::io;
    use std::sync::Arc;

    use axum::Router;
    use rustls_pki_types::CertificateDer;
    use rustls_pki_types::PrivateKeyDer;
    use rustls_pki_types::pem::PemObject;
    use tokio::net::TcpListener;
    use tokio::net::TcpStream;
    use tokio_rustls::TlsAcceptor;
    use tokio_rustls::rustls::ServerConfig;
    use tokio_util::sync::CancellationToken;
    use tracing::warn;

    use crate::SharedState;

    pub(crate) async fn serve_tls(
        listener: TcpListener,
        app: Router,
        state: &SharedState,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        let (Some(cert_path), Some(key_path)) = (
            state.config.tls_cert_path.as_ref(),
            state.config.tls_key_path.as_ref(),
        ) else {
            return Err(io::Error::other("TLS enabled without cert/key paths"));
        };

        let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
            .map_err(io::Error::other)?
            .collect::<Result<_, _>>()
            .map_err(io::Error::other)?;
        let key = PrivateKeyDer::from_pem_file(key_path).map_err(io::Error::other)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        axum::serve(TlsListener { listener, acceptor }, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }

    struct TlsListener {
        listener: TcpListener,
        acceptor: TlsAcceptor,
    }

    impl axum::serve::Listener for TlsListener {
        type Io = tokio_rustls::server::TlsStream<TcpStream>;
        type Addr = std::net::SocketAddr;

        async fn accept(&mut self) -> (Self::Io, Self::Addr) {
            loop {
                let (stream, addr) = match self.listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                match self.acceptor.accept(stream).await {
                    Ok(tls_stream) => return (tls_stream, addr),
                    Err(e) => {
                        warn!(%addr, "TLS handshake failed: {e}");
                    }
                }
            }
        }

        fn local_addr(&self) -> io::Result<Self::Addr> {
            self.listener.local_addr()
        }
    }
}
