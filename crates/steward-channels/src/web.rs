use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};

use steward_config::{GatewayConfig, WebConfig};
use steward_core::agent::AgentLoop;
use steward_core::bus::{InboundMessage, OutboundKind, OutboundMessage};
use steward_core::turn::{ConversationKey, Turn, TurnBody};

use crate::base::Channel;

const CHANNEL_NAME: &str = "web";
const MAX_HISTORY_MESSAGES: usize = 100;

type WsSender = mpsc::UnboundedSender<Message>;

/// Browser chat over a websocket, plus a small JSON API for inspecting and
/// cancelling conversations.
pub struct WebChannel {
    config: WebConfig,
    gateway_config: GatewayConfig,
    agent: Arc<AgentLoop>,
    /// Keyed by connection ID. Every message is broadcast; clients filter by chatId.
    connections: Arc<DashMap<String, WsSender>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Clone)]
struct AppState {
    config: WebConfig,
    agent: Arc<AgentLoop>,
    connections: Arc<DashMap<String, WsSender>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

/// `?password=` query parameter accepted by every route.
#[derive(Deserialize)]
struct AuthParams {
    password: Option<String>,
}

#[derive(Serialize)]
struct WsOutMsg {
    #[serde(rename = "type")]
    msg_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "chatId")]
    chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    messages: Option<Vec<HistoryMessage>>,
}

impl WsOutMsg {
    fn bare(msg_type: &'static str) -> Self {
        Self {
            msg_type,
            content: None,
            chat_id: None,
            timestamp: None,
            messages: None,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
struct HistoryMessage {
    role: &'static str,
    content: String,
    timestamp: String,
}

#[derive(Deserialize)]
struct WsInMsg {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    #[serde(rename = "chatId")]
    chat_id: String,
}

impl WebChannel {
    pub fn new(config: WebConfig, gateway_config: GatewayConfig, agent: Arc<AgentLoop>) -> Self {
        Self {
            config,
            gateway_config,
            agent,
            connections: Arc::new(DashMap::new()),
            shutdown_tx: Mutex::new(None),
        }
    }

    fn broadcast(&self, out: &WsOutMsg) -> Result<()> {
        let json = serde_json::to_string(out)?;
        for entry in self.connections.iter() {
            if entry.value().send(Message::Text(json.clone().into())).is_err() {
                warn!(
                    "WebSocket send failed for conn={}, will clean up on disconnect",
                    entry.key()
                );
            }
        }
        Ok(())
    }
}

fn ws_type(kind: OutboundKind) -> &'static str {
    match kind {
        OutboundKind::Error => "error",
        OutboundKind::Partial => "partial",
        // Clients clear the partial text shown for the chat.
        OutboundKind::Reset => "partial_reset",
        OutboundKind::Final => "message",
    }
}

/// True when no password is configured or `given` matches it.
fn password_ok(config: &WebConfig, given: Option<&str>) -> bool {
    match config.password.as_deref().filter(|p| !p.is_empty()) {
        Some(expected) => given == Some(expected),
        None => true,
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/conversations/{chat_id}", get(api_snapshot))
        .route("/api/conversations/{chat_id}/cancel", post(api_cancel))
        .with_state(state)
}

fn sender_allowed(config: &WebConfig, sender_id: &str) -> bool {
    config.allow_from.is_empty() || config.allow_from.iter().any(|a| a == sender_id)
}

#[async_trait]
impl Channel for WebChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn start(&self, inbound_tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let state = AppState {
            config: self.config.clone(),
            agent: self.agent.clone(),
            connections: self.connections.clone(),
            inbound_tx,
        };

        let router = router(state);

        let addr: SocketAddr = format!("{}:{}", self.gateway_config.host, self.gateway_config.port)
            .parse()
            .context("invalid gateway listen address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("Web channel listening on http://{addr}");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let connections = self.connections.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("Web server error: {e}");
            }
            connections.clear();
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        self.connections.clear();
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        if self.connections.is_empty() {
            warn!(
                "No active WebSocket connections, dropping reply for chat_id={}",
                msg.chat_id
            );
            return Ok(());
        }
        self.broadcast(&WsOutMsg {
            content: Some(msg.content.clone()),
            chat_id: Some(msg.chat_id.clone()),
            timestamp: Some(chrono::Local::now().to_rfc3339()),
            ..WsOutMsg::bare(ws_type(msg.kind))
        })
    }

    async fn send_partial(&self, msg: &OutboundMessage) -> Result<()> {
        let content = (msg.kind == OutboundKind::Partial).then(|| msg.content.clone());
        self.broadcast(&WsOutMsg {
            content,
            chat_id: Some(msg.chat_id.clone()),
            ..WsOutMsg::bare(ws_type(msg.kind))
        })
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        sender_allowed(&self.config, sender_id)
    }
}

// --- Axum Handlers ---

async fn api_snapshot(
    Path(chat_id): Path<String>,
    Query(params): Query<AuthParams>,
    State(state): State<AppState>,
) -> Response {
    if !password_ok(&state.config, params.password.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let key = ConversationKey::new(CHANNEL_NAME, chat_id);
    if !state.agent.context().contains(&key) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(state.agent.snapshot(&key)).into_response()
}

async fn api_cancel(
    Path(chat_id): Path<String>,
    Query(params): Query<AuthParams>,
    State(state): State<AppState>,
) -> Response {
    if !password_ok(&state.config, params.password.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let key = ConversationKey::new(CHANNEL_NAME, chat_id);
    let cancelled = state.agent.cancel(&key);
    Json(serde_json::json!({ "cancelled": cancelled })).into_response()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<AuthParams>,
    State(state): State<AppState>,
) -> Response {
    if !password_ok(&state.config, params.password.as_deref()) {
        return ws
            .on_upgrade(|mut socket| async move {
                let err = WsOutMsg {
                    content: Some("Authentication failed".to_string()),
                    ..WsOutMsg::bare("error")
                };
                let json = serde_json::to_string(&err).unwrap_or_default();
                let _ = socket.send(Message::Text(json.into())).await;
                let _ = socket.close().await;
            })
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_ws(socket, state))
        .into_response()
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let short_conn = conn_id[..8].to_string();
    info!("WebSocket connected: conn={short_conn}");

    let (ws_write, mut ws_read) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    state.connections.insert(conn_id.clone(), tx.clone());
    let write_handle = tokio::spawn(ws_write_loop(ws_write, rx, short_conn.clone()));

    send_json(&tx, &WsOutMsg::bare("connected"));

    while let Some(result) = ws_read.next().await {
        let msg = match result {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket read error for conn={short_conn}: {e}");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(parsed) = serde_json::from_str::<WsInMsg>(&text) else {
            continue;
        };
        if parsed.chat_id.is_empty() {
            continue;
        }
        let key = ConversationKey::new(CHANNEL_NAME, &parsed.chat_id);

        match parsed.msg_type.as_str() {
            "get_history" => {
                let history = WsOutMsg {
                    chat_id: Some(parsed.chat_id),
                    messages: Some(history_messages(&state.agent.snapshot(&key))),
                    ..WsOutMsg::bare("history")
                };
                send_json(&tx, &history);
            }
            "cancel" => {
                if state.agent.cancel(&key) {
                    info!("[{key}] cancelled from conn={short_conn}");
                }
            }
            "message" => {
                if parsed.content.trim().is_empty() {
                    continue;
                }
                let sender_id = format!(
                    "web:{}",
                    parsed.chat_id.chars().take(8).collect::<String>()
                );
                if !sender_allowed(&state.config, &sender_id) {
                    warn!("Rejected message from {sender_id}");
                    continue;
                }
                let inbound = InboundMessage {
                    channel: CHANNEL_NAME.to_string(),
                    sender_id,
                    chat_id: parsed.chat_id,
                    content: parsed.content,
                    media: Vec::new(),
                    metadata: HashMap::new(),
                };
                if let Err(e) = state.inbound_tx.send(inbound).await {
                    error!("Failed to send inbound message: {e}");
                    break;
                }
            }
            _ => {}
        }
    }

    state.connections.remove(&conn_id);
    write_handle.abort();
    info!("WebSocket disconnected: conn={short_conn}");
}

fn send_json(tx: &WsSender, out: &WsOutMsg) {
    if let Ok(json) = serde_json::to_string(out) {
        let _ = tx.send(Message::Text(json.into()));
    }
}

async fn ws_write_loop(
    mut ws_write: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    conn_id: String,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = ws_write.send(msg).await {
            warn!("WebSocket write error for conn={conn_id}: {e}");
            break;
        }
    }
}

/// User and assistant text from a conversation, newest `MAX_HISTORY_MESSAGES`.
fn history_messages(turns: &[Turn]) -> Vec<HistoryMessage> {
    let mut messages: Vec<HistoryMessage> = turns
        .iter()
        .filter_map(|turn| {
            let (role, text) = match turn.body() {
                TurnBody::UserMessage { text, .. } => ("user", text),
                TurnBody::AssistantMessage { text, .. } => ("assistant", text),
                _ => return None,
            };
            (!text.is_empty()).then(|| HistoryMessage {
                role,
                content: text.clone(),
                timestamp: turn.created_at().to_rfc3339(),
            })
        })
        .collect();
    if messages.len() > MAX_HISTORY_MESSAGES {
        messages.split_off(messages.len() - MAX_HISTORY_MESSAGES)
    } else {
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use steward_core::bus::MessageBus;
    use steward_core::context::ContextManager;
    use steward_core::provider::{ModelRequest, ModelTurn, Provider, ProviderError, ProviderPool, StreamSink};
    use steward_core::tools::ToolRegistry;
    use steward_core::turn::ToolCallRequest;
    use steward_core::AgentConfig;
    use tower::ServiceExt;

    struct SilentProvider;

    #[async_trait]
    impl Provider for SilentProvider {
        fn name(&self) -> &str {
            "silent"
        }

        async fn generate(
            &self,
            _request: &ModelRequest,
            _stream: Option<&dyn StreamSink>,
        ) -> Result<ModelTurn, ProviderError> {
            Err(ProviderError::Fatal("unused".into()))
        }
    }

    fn app(password: Option<&str>) -> (Router, Arc<AgentLoop>) {
        let bus = MessageBus::new(8);
        let agent = Arc::new(AgentLoop::new(
            Arc::new(ContextManager::new()),
            ProviderPool::new(Arc::new(SilentProvider)),
            Arc::new(ToolRegistry::new()),
            Arc::new(bus.outbound()),
            AgentConfig::default(),
        ));
        let state = AppState {
            config: WebConfig {
                password: password.map(str::to_string),
                ..config(vec![])
            },
            agent: agent.clone(),
            connections: Arc::new(DashMap::new()),
            inbound_tx: bus.inbound_tx.clone(),
        };
        (router(state), agent)
    }

    async fn status(router: Router, method: Method, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        router.oneshot(request).await.unwrap().status()
    }

    #[test]
    fn password_check() {
        let open = config(vec![]);
        assert!(password_ok(&open, None));
        let empty = WebConfig {
            password: Some(String::new()),
            ..config(vec![])
        };
        assert!(password_ok(&empty, None));

        let locked = WebConfig {
            password: Some("secret".into()),
            ..config(vec![])
        };
        assert!(password_ok(&locked, Some("secret")));
        assert!(!password_ok(&locked, Some("guess")));
        assert!(!password_ok(&locked, None));
    }

    #[tokio::test]
    async fn api_requires_password_when_configured() {
        let (router, agent) = app(Some("secret"));
        let key = ConversationKey::new(CHANNEL_NAME, "chat");
        agent
            .context()
            .append(&key, TurnBody::user("private", vec![]))
            .unwrap();

        let snapshot = "/api/conversations/chat";
        let cancel = "/api/conversations/chat/cancel";
        assert_eq!(
            status(router.clone(), Method::GET, snapshot).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(router.clone(), Method::GET, &format!("{snapshot}?password=guess")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(router.clone(), Method::POST, cancel).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(router.clone(), Method::GET, &format!("{snapshot}?password=secret")).await,
            StatusCode::OK
        );
        assert_eq!(
            status(router, Method::POST, &format!("{cancel}?password=secret")).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn open_api_reports_unknown_conversations() {
        let (router, _agent) = app(None);
        assert_eq!(
            status(router, Method::GET, "/api/conversations/missing").await,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn reset_maps_to_its_own_message_type() {
        assert_eq!(ws_type(OutboundKind::Partial), "partial");
        assert_eq!(ws_type(OutboundKind::Reset), "partial_reset");
        assert_eq!(ws_type(OutboundKind::Final), "message");
    }

    fn config(allow_from: Vec<String>) -> WebConfig {
        WebConfig {
            enabled: true,
            password: None,
            allow_from,
        }
    }

    #[test]
    fn empty_allow_list_allows_all() {
        assert!(sender_allowed(&config(vec![]), "anyone"));
    }

    #[test]
    fn allow_list_is_checked() {
        let cfg = config(vec!["web:abc12345".to_string()]);
        assert!(sender_allowed(&cfg, "web:abc12345"));
        assert!(!sender_allowed(&cfg, "web:other"));
    }

    #[test]
    fn out_msg_skips_empty_fields() {
        let msg = WsOutMsg {
            chat_id: Some("abc-123".to_string()),
            ..WsOutMsg::bare("connected")
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"connected\""));
        assert!(json.contains("\"chatId\":\"abc-123\""));
        assert!(!json.contains("content"));
        assert!(!json.contains("messages"));
    }

    #[test]
    fn in_msg_defaults_missing_fields() {
        let msg: WsInMsg = serde_json::from_str(r#"{"type":"message"}"#).unwrap();
        assert_eq!(msg.msg_type, "message");
        assert_eq!(msg.content, "");
        assert_eq!(msg.chat_id, "");

        let msg: WsInMsg =
            serde_json::from_str(r#"{"type":"cancel","chatId":"abc-123"}"#).unwrap();
        assert_eq!(msg.msg_type, "cancel");
        assert_eq!(msg.chat_id, "abc-123");
    }

    #[test]
    fn history_keeps_only_conversation_text() {
        let cm = ContextManager::new();
        let key = ConversationKey::new(CHANNEL_NAME, "chat");
        let call = ToolCallRequest {
            id: "c1".into(),
            tool_name: "calculator".into(),
            arguments: serde_json::json!({"expression": "1+1"}),
        };
        cm.append(&key, TurnBody::user("what is 1+1?", vec![])).unwrap();
        cm.append(&key, TurnBody::assistant("", vec![call])).unwrap();
        cm.append(&key, TurnBody::tool_result("c1", "2", true)).unwrap();
        cm.append(&key, TurnBody::assistant("2", vec![])).unwrap();
        cm.finalize(&key);

        let history = history_messages(&cm.snapshot(&key));
        let pairs: Vec<(&str, &str)> = history
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(pairs, vec![("user", "what is 1+1?"), ("assistant", "2")]);
    }

    #[test]
    fn history_is_capped() {
        let cm = ContextManager::new();
        let key = ConversationKey::new(CHANNEL_NAME, "long");
        for i in 0..60 {
            cm.append(&key, TurnBody::user(format!("q{i}"), vec![])).unwrap();
            cm.append(&key, TurnBody::assistant(format!("a{i}"), vec![])).unwrap();
            cm.finalize(&key);
        }
        let history = history_messages(&cm.snapshot(&key));
        assert_eq!(history.len(), MAX_HISTORY_MESSAGES);
        assert_eq!(history[0].content, "q10");
    }
}
