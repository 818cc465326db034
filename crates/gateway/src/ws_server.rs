//! WebSocket server handler using Axum.

use crate::client::ClientActor;
use crate::config::ClientConfig;
use crate::hub::HubHandle;
use crate::protocol::{parse_topic_ids, TopicId};
use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::StreamExt;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tracing::warn;

/// How long the health check waits on the hub.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared application state.
pub struct AppState {
    pub hub: HubHandle,
    pub client_config: ClientConfig,
    connections: AtomicUsize,
}

impl AppState {
    pub fn new(hub: HubHandle, client_config: ClientConfig) -> Self {
        Self {
            hub,
            client_config,
            connections: AtomicUsize::new(0),
        }
    }

    /// Open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/{channel}", get(ws_channel_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.connection_count();
    match timeout(HEALTH_TIMEOUT, state.hub.stats()).await {
        Ok(Ok(stats)) => (
            StatusCode::OK,
            format!(
                r#"{{"status":"ok","connections":{},"topics":{}}}"#,
                connections,
                stats.topics.len()
            ),
        ),
        Ok(Err(e)) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"status":"unavailable"}"#.to_string(),
            )
        }
        Err(_) => {
            warn!("Health check timed out after {:?}", HEALTH_TIMEOUT);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"status":"unavailable"}"#.to_string(),
            )
        }
    }
}

/// WebSocket upgrade with no initial subscriptions.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state, Vec::new()))
}

/// WebSocket upgrade subscribing to the comma-separated topics in the path.
async fn ws_channel_handler(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let topics = parse_topic_ids(&channel);
    ws.on_upgrade(|socket| handle_socket(socket, state, topics))
}

/// Run one client actor over the connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, topics: Vec<TopicId>) {
    let (ws_tx, ws_rx) = socket.split();
    let actor = ClientActor::new(state.hub.clone(), state.client_config.clone());

    let open = state.connections.fetch_add(1, Ordering::Relaxed) + 1;
    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(open as f64);

    actor.run(ws_rx, ws_tx, topics).await;

    let open = state.connections.fetch_sub(1, Ordering::Relaxed) - 1;
    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(open as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use futures::SinkExt;
    use log_store::MemoryLogStore;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tokio_util::sync::CancellationToken;

    type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn serve(store: Arc<MemoryLogStore>) -> (SocketAddr, Arc<AppState>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let (hub, handle) = Hub::new(store, HubConfig::default(), shutdown.clone());
        tokio::spawn(hub.run());

        let state = Arc::new(AppState::new(handle, ClientConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .unwrap();
        });
        (addr, state, shutdown)
    }

    async fn next_text(socket: &mut Socket) -> String {
        loop {
            let msg = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return text.as_str().to_string();
            }
        }
    }

    #[tokio::test]
    async fn test_channel_path_subscribes_and_streams() {
        let store = Arc::new(MemoryLogStore::new());
        store.append("ABC::markets", [("name", "ABC")]);
        let (addr, _state, shutdown) = serve(store.clone()).await;

        let (mut socket, _) = connect_async(format!("ws://{}/ws/ABC", addr)).await.unwrap();
        assert_eq!(
            next_text(&mut socket).await,
            r#"{"success":"true","subscriptions":["ABC"]}"#
        );

        store.append("ABC::public_trades", [("px", "1")]);
        assert_eq!(next_text(&mut socket).await, r#"{"px":"1"}"#);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_requests_over_plain_endpoint() {
        let store = Arc::new(MemoryLogStore::new());
        let (addr, _state, shutdown) = serve(store).await;

        let (mut socket, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        socket.send(Message::Text("garbage".into())).await.unwrap();
        assert_eq!(next_text(&mut socket).await, "error: Message format");

        socket
            .send(Message::Text(r#"{"op":"subscribe","args":"ZZZ"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            next_text(&mut socket).await,
            "error: Topic does not exist ZZZ"
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dropped_socket_leaves_topic_to_remaining_client() {
        let store = Arc::new(MemoryLogStore::new());
        store.append("ABC::markets", [("name", "ABC")]);
        let (addr, state, shutdown) = serve(store.clone()).await;

        let url = format!("ws://{}/ws/ABC", addr);
        let (mut a, _) = connect_async(url.as_str()).await.unwrap();
        next_text(&mut a).await;
        let (mut b, _) = connect_async(url.as_str()).await.unwrap();
        next_text(&mut b).await;
        assert_eq!(state.connection_count(), 2);

        drop(a);
        for _ in 0..200 {
            if state.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.connection_count(), 1);

        store.append("ABC::public_trades", [("px", "1")]);
        assert_eq!(next_text(&mut b).await, r#"{"px":"1"}"#);
        assert_eq!(state.hub.stats().await.unwrap().topics, vec!["ABC".to_string()]);
        shutdown.cancel();
    }
}
