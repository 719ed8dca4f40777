//! HTTP server part of tidbit

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
        StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Router,
};
use base64::prelude::*;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{info, info_span, warn, Level};

mod error;
mod tiddlers;

use crate::state::AppState;

const REALM: &str = r#"Basic realm="Who are you?""#;

/// The running HTTP server
pub struct HttpServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl HttpServer {
    /// Bind to `bind_addr` and start serving in the background
    pub async fn spawn(bind_addr: &str, state: AppState) -> Result<HttpServer> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener to {bind_addr}"))?;
        let addr = listener.local_addr()?;

        let app = create_app(state);
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });
        info!("HTTP server listening on {addr}");

        Ok(HttpServer { addr, cancel, task })
    }

    /// Get the bound address of the HTTP socket.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.run_until_done().await
    }

    /// Wait for the server task to complete.
    ///
    /// Runs forever unless the server fails or is shut down.
    pub async fn run_until_done(self) -> Result<()> {
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(?err, "server failed");
                Err(err.into())
            }
            Err(err) => {
                warn!(?err, "server task panicked");
                Err(err.into())
            }
        }
    }
}

pub(crate) fn create_app(state: AppState) -> Router {
    // configure tracing middleware
    let trace = TraceLayer::new_for_http()
        .make_span_with(|request: &Request| {
            info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
            )
        })
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let auth = middleware::from_fn_with_state(state.clone(), authenticate);

    Router::new()
        .route("/", get(tiddlers::index))
        .route("/status", get(tiddlers::status))
        .route("/recipes/all/tiddlers.json", get(tiddlers::list))
        .route(
            "/recipes/all/tiddlers/{*key}",
            get(tiddlers::get_tiddler).put(tiddlers::put_tiddler),
        )
        .route("/bags/bag/tiddlers/{*key}", delete(tiddlers::delete_tiddler))
        .with_state(state)
        .layer(auth)
        .layer(trace)
}

/// Require HTTP Basic credentials when a password is configured.
async fn authenticate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(credentials) = &state.credentials else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic_auth)
        .is_some_and(|(user, pass)| credentials.verify(&user, &pass));

    if authorized {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, [(WWW_AUTHENTICATE, REALM)]).into_response()
    }
}

/// Split a `Basic <base64(user:pass)>` header into user and password
fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
