//! Broker listener
//!
//! Accepts broker-style device connections: reads CONNECT, authenticates
//! the `(client_id, device_id, token)` triple carried in the credentials,
//! answers CONNACK, and runs the same session loop as the WebSocket path.
//! Audio for these sessions flows through the shared UDP endpoint.

use std::sync::Arc;
use tokio::net::TcpListener;

use voice_gateway_transport::{BrokerHandshake, Transport, UdpAudioEndpoint};

use crate::state::{run_session_loop, wire_session, AppState};
use crate::ServerError;

/// Bind the control listener and the datagram endpoint; returns the
/// endpoint for the `hello` advertisement.
pub async fn start_broker(state: AppState) -> Result<Arc<UdpAudioEndpoint>, ServerError> {
    let broker_config = state.config.read().broker.clone();
    let advertised_host = if broker_config.public_ip.is_empty() {
        "127.0.0.1".to_string()
    } else {
        broker_config.public_ip.clone()
    };
    let udp = UdpAudioEndpoint::bind(
        &broker_config.udp_bind,
        advertised_host,
        broker_config.udp_port,
    )
    .await
    .map_err(|e| ServerError::Internal(e.to_string()))?;
    udp.spawn_recv_loop();

    let listener = TcpListener::bind(&broker_config.bind)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;
    tracing::info!(bind = %broker_config.bind, "broker listener started");

    let udp_for_loop = udp.clone();
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(error = %err, "broker accept failed");
                    continue;
                }
            };
            let state = state.clone();
            let udp = udp_for_loop.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(state, udp, stream, peer).await {
                    tracing::debug!(%peer, error = %err, "broker connection ended");
                }
            });
        }
    });

    Ok(udp)
}

async fn handle_connection(
    state: AppState,
    udp: Arc<UdpAudioEndpoint>,
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
) -> Result<(), ServerError> {
    let handshake = BrokerHandshake::read_connect(stream).await?;
    let info = handshake.info.clone();
    tracing::info!(
        %peer,
        client_id = %info.client_id,
        device_id = %info.device_id,
        keep_alive = info.keep_alive,
        "broker connect"
    );

    // CONNECT credentials: username is the device id, password the token.
    let authorized = state.auth.authenticate(
        Some(&info.device_id),
        Some(&info.client_id),
        info.password.as_deref(),
    );
    if !authorized {
        tracing::warn!(device_id = %info.device_id, "broker authentication refused");
        handshake.reject().await;
        return Err(ServerError::Auth);
    }

    let defaults = state.config.read().clone();
    let ctx = state
        .sessions
        .create_session(
            defaults,
            Some(info.device_id.clone()),
            info.client_uuid.clone(),
            Some(peer.ip().to_string()),
            true,
        )
        .await;

    let connection = handshake.accept(ctx.session_id.clone(), udp).await?;
    let transport: Arc<dyn Transport> = connection;
    wire_session(&state, &ctx, transport.clone()).await;
    run_session_loop(state, ctx, transport).await;
    Ok(())
}
