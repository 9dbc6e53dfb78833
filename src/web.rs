// src/web.rs
use crate::config::AppConfig;
use crate::reload::BrowserReloader;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use percent_encoding::percent_decode_str;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, watch::Receiver as WatchReceiver};
use tracing::{debug, error, info, warn};

/// Path of the injected reload client.
pub const CLIENT_SCRIPT_PATH: &str = "/__sitewatch/client.js";
/// Path of the reload websocket.
pub const WEBSOCKET_PATH: &str = "/__sitewatch/ws";

const CLIENT_SCRIPT_TAG: &str = "<script src=\"/__sitewatch/client.js\"></script>";

/// Shared application state for the web server.
#[derive(Clone)]
struct AppState {
    /// Source of reload messages for websocket clients.
    reloader: BrowserReloader,
    /// Root of the generated site.
    site_dir: PathBuf,
}

/// Serves the reload client script.
async fn serve_client() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        include_str!("../static/client.js"),
    )
}

/// Handles incoming WebSocket upgrade requests.
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    debug!("New reload WebSocket connection request.");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handles a single reload client.
///
/// One task pushes reload messages as JSON, the other drains client frames so
/// closes are noticed. The connection ends when either task finishes.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Browser connected for live reload.");
    let (mut sender, mut receiver): (SplitSink<WebSocket, Message>, SplitStream<WebSocket>) =
        socket.split();
    let mut rx = state.reloader.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => match serde_json::to_string(&message) {
                    Ok(json_payload) => {
                        if sender.send(Message::Text(json_payload)).await.is_err() {
                            debug!("Failed to send reload to browser, client disconnected?");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to serialize reload message: {}", e);
                    }
                },
                Err(RecvError::Lagged(missed_count)) => {
                    // Any reload will do; the client reloads on the next one.
                    warn!("Reload client lagged behind, missed {} messages.", missed_count);
                }
                Err(RecvError::Closed) => {
                    info!("Reload channel closed, WebSocket send task finishing.");
                    break;
                }
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
    info!("Browser disconnected from live reload.");
}

/// Maps a request path onto a file below `root`.
///
/// Segments are percent-decoded first. Only plain names are accepted after
/// decoding; anything that could leave `root` yields `None`. A trailing slash
/// or empty path maps to `index.html`.
pub fn resolve_site_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    let mut resolved = root.to_path_buf();
    for raw in trimmed.split('/').filter(|s| !s.is_empty()) {
        let segment = percent_decode_str(raw).decode_utf8().ok()?;
        if segment.contains('\\') {
            return None;
        }
        let mut components = Path::new(segment.as_ref()).components();
        match (components.next(), components.next()) {
            (Some(Component::CurDir), None) => {}
            (Some(Component::Normal(name)), None) => resolved.push(name),
            _ => return None,
        }
    }
    if trimmed.is_empty() || trimmed.ends_with('/') {
        resolved.push("index.html");
    }
    Some(resolved)
}

/// Content type for a served file, by extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    }
}

/// Inserts the reload client before the last `</body>`, or appends it.
pub fn inject_client(html: &str) -> String {
    // ASCII lowercasing keeps byte offsets intact.
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + CLIENT_SCRIPT_TAG.len());
            out.push_str(&html[..idx]);
            out.push_str(CLIENT_SCRIPT_TAG);
            out.push_str(&html[idx..]);
            out
        }
        None => format!("{}{}", html, CLIENT_SCRIPT_TAG),
    }
}

/// Byte form of [`inject_client`]. Bodies that are not valid UTF-8 are
/// returned untouched.
pub fn inject_client_bytes(bytes: Vec<u8>) -> Vec<u8> {
    match String::from_utf8(bytes) {
        Ok(html) => inject_client(&html).into_bytes(),
        Err(e) => {
            debug!("HTML body is not valid UTF-8, serving it without the reload client");
            e.into_bytes()
        }
    }
}

fn file_response(path: &Path, bytes: Vec<u8>) -> Response {
    let ct = content_type(path);
    let body = if ct.starts_with("text/html") {
        inject_client_bytes(bytes)
    } else {
        bytes
    };
    ([(header::CONTENT_TYPE, ct)], body).into_response()
}

async fn not_found(site_dir: &Path) -> Response {
    let page = site_dir.join("404.html");
    match tokio::fs::read(&page).await {
        Ok(bytes) => (StatusCode::NOT_FOUND, file_response(&page, bytes)).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

/// Serves a file from the generated site.
async fn serve_site(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let Some(mut path) = resolve_site_path(&state.site_dir, uri.path()) else {
        debug!("Rejected request path: {}", uri.path());
        return not_found(&state.site_dir).await;
    };
    if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
        // Relative links inside index.html need the trailing slash.
        if !uri.path().ends_with('/') {
            return Redirect::permanent(&format!("{}/", uri.path())).into_response();
        }
        path.push("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => file_response(&path, bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Not found: {}", path.display());
            not_found(&state.site_dir).await
        }
        Err(e) => {
            error!("Failed to read {}: {}", path.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Starts the site server and live-reload hub.
///
/// - Serves the reload client at [`CLIENT_SCRIPT_PATH`].
/// - Handles reload WebSocket connections at [`WEBSOCKET_PATH`].
/// - Serves everything else from the site directory, injecting the client into HTML.
/// - Shuts down gracefully when the shutdown signal is triggered.
///
/// # Returns
/// Returns `Ok(())` when the server shuts down cleanly, or an error if startup fails.
pub async fn start_server(
    app_config: Arc<AppConfig>,
    reloader: BrowserReloader,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    let socket_addr: SocketAddr = app_config.web_addr.parse()?;

    let app_state = Arc::new(AppState {
        reloader,
        site_dir: app_config.site_dir.clone(),
    });

    let app = Router::new()
        .route(CLIENT_SCRIPT_PATH, get(serve_client))
        .route(WEBSOCKET_PATH, get(websocket_handler))
        .fallback(serve_site)
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    info!(
        "Serving {} on http://{}",
        app_config.site_dir.display(),
        socket_addr
    );

    let mut shutdown = shutdown_signal.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.changed().await.ok();
        info!("Web server shutting down gracefully.");
    })
    .await?;

    info!("Web server stopped.");
    Ok(())
}
