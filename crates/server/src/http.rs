//! HTTP endpoint
//!
//! One route: a connection-upgrade handler that becomes the framed duplex
//! transport. Non-upgrading requests get a liveness body. Credentials ride
//! in the `device-id`, `client-id` and `authorization` headers, or as query
//! parameters for devices that cannot set headers.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use voice_gateway_transport::{Transport, WsTransport};

use crate::state::{run_session_loop, wire_session, AppState};

const AUTH_FAILED_TEXT: &str = "认证失败";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

fn header_or_query(headers: &HeaderMap, query: &str, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| query_param(query, key))
}

async fn root_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return "Server is running\n".into_response();
    };

    let query = query.unwrap_or_default();
    let device_id = header_or_query(&headers, &query, "device-id");
    let client_id = header_or_query(&headers, &query, "client-id");
    let authorization = header_or_query(&headers, &query, "authorization");
    let from_gateway = query_param(&query, "from").as_deref() == Some("mqtt_gateway");

    // Proxies forward the device address in x-real-ip / x-forwarded-for.
    let client_ip = headers
        .get("x-real-ip")
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()));

    if !state
        .auth
        .authenticate(device_id.as_deref(), client_id.as_deref(), authorization.as_deref())
    {
        tracing::warn!(
            device_id = device_id.as_deref().unwrap_or("-"),
            client_ip = client_ip.as_deref().unwrap_or("-"),
            "authentication failed"
        );
        return ws.on_upgrade(reject_socket);
    }

    ws.on_upgrade(move |socket| async move {
        let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(socket));
        let defaults = state.config.read().clone();
        let ctx = state
            .sessions
            .create_session(defaults, device_id, client_id, client_ip, from_gateway)
            .await;
        wire_session(&state, &ctx, transport.clone()).await;
        run_session_loop(state, ctx, transport).await;
    })
}

/// Failed auth still upgrades so the device hears why, then closes. No
/// session is created.
async fn reject_socket(mut socket: WebSocket) {
    let _ = socket.send(Message::Text(AUTH_FAILED_TEXT.to_string())).await;
    let _ = socket.send(Message::Close(None)).await;
}
