use std::sync::Arc;
use std::time::Duration;

use actor_protocol::{
    http as http_proto,
    ws::{ToClient, ToServer, ToServerBody},
    EncodedMessage, ProtocolFormat, RawMessage,
};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{
    actor::{ActorInstance, ConnectRequest, Instance},
    config::ProtocolConfig,
    connection::{Connection, HttpTransport, Outbound, WebSocketTransport},
    error::{ActorError, ErrorPayload},
    inspect::execute_inspector_rpc,
    rpc::RpcArgs,
};

/// How long a closing session waits for queued frames to flush.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a server-initiated close waits for the peer's close frame.
/// Longer than the shutdown drain, which gives up first.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct AppState {
    instance: Arc<Instance>,
}

/// Build the HTTP/WS router for a hosted actor.
pub fn router(actor: ActorInstance) -> Router {
    let state = AppState {
        instance: actor.inner().clone(),
    };

    Router::new()
        .route("/", get(liveness))
        .route("/rpc/{name}", post(http_rpc))
        .route("/connect", get(ws_connect))
        .route("/__inspect/connect", get(ws_inspect))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the actor has terminated.
pub async fn serve(listener: TcpListener, actor: ActorInstance) -> Result<()> {
    let app = router(actor.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { actor.terminated().await })
        .await?;
    Ok(())
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, "actor is running")
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Actor is shutting down").into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Negotiation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ConnectQuery {
    format: Option<String>,
    params: Option<String>,
}

fn resolve_format(
    raw: Option<&str>,
    default: Option<ProtocolFormat>,
) -> Result<ProtocolFormat, ActorError> {
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|_| ActorError::InvalidProtocolFormat(Some(raw.to_string()))),
        None => default.ok_or(ActorError::InvalidProtocolFormat(None)),
    }
}

fn parse_parameters(raw: Option<&str>, config: &ProtocolConfig) -> Result<Value, ActorError> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    if raw.len() > config.max_connection_parameters_size {
        return Err(ActorError::ConnectionParametersTooLong);
    }
    serde_json::from_str(raw).map_err(|e| ActorError::MalformedConnectionParameters(e.to_string()))
}

fn error_response(instance: &Instance, format: ProtocolFormat, err: &anyhow::Error) -> Response {
    let payload = ErrorPayload::from_error(err, &instance.metadata);
    let status = if payload.public {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = http_proto::RpcResponseError {
        code: payload.code,
        message: payload.message,
        metadata: payload.metadata,
    };
    encoded_response(status, format, &body)
}

fn encoded_response<T: Serialize>(status: StatusCode, format: ProtocolFormat, body: &T) -> Response {
    match actor_protocol::encode(body, format) {
        Ok(encoded) => (
            status,
            [(header::CONTENT_TYPE, format.content_type())],
            encoded.into_bytes(),
        )
            .into_response(),
        Err(err) => {
            error!(?err, "failed to encode response");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response").into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP RPC
// ─────────────────────────────────────────────────────────────────────────────

async fn http_rpc(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let instance = state.instance;
    if instance.is_shutting_down() {
        return unavailable();
    }

    let format = match resolve_format(query.format.as_deref(), Some(ProtocolFormat::Json)) {
        Ok(format) => format,
        Err(err) => return error_response(&instance, ProtocolFormat::Json, &err.into()),
    };

    match call_over_http(&instance, &name, &query, headers, format, &body).await {
        Ok(output) => encoded_response(
            StatusCode::OK,
            format,
            &http_proto::RpcResponseOk { output },
        ),
        Err(err) => error_response(&instance, format, &err),
    }
}

/// One RPC on an ephemeral connection that is removed whatever the outcome.
async fn call_over_http(
    instance: &Arc<Instance>,
    name: &str,
    query: &ConnectQuery,
    headers: HeaderMap,
    format: ProtocolFormat,
    body: &[u8],
) -> Result<Value> {
    instance.wait_until_loaded().await?;

    let protocol = &instance.config.protocol;
    let parameters = parse_parameters(query.params.as_deref(), protocol)?;
    let request: http_proto::RpcRequest = if body.is_empty() {
        http_proto::RpcRequest::default()
    } else {
        actor_protocol::decode(
            RawMessage::Binary(body),
            format,
            protocol.max_incoming_message_size,
        )
        .map_err(ActorError::from)?
    };

    let conn_state = instance
        .before_connect(ConnectRequest {
            parameters,
            headers,
            format,
        })
        .await?;
    let conn = Arc::new(Connection::new(
        format,
        conn_state,
        Arc::new(HttpTransport::new()),
    ));
    let guard = EphemeralConnection::new(instance.clone(), conn.clone());
    instance.accept_connection(conn.clone()).await?;

    let result = instance
        .execute_rpc(conn, name, RpcArgs::new(request.args))
        .await;
    guard.finish().await;
    result
}

/// Removes an HTTP connection once its request ends. If the handler future
/// is dropped (the client went away), removal moves to a spawned task.
struct EphemeralConnection {
    instance: Arc<Instance>,
    conn: Arc<Connection>,
    armed: bool,
}

impl EphemeralConnection {
    fn new(instance: Arc<Instance>, conn: Arc<Connection>) -> Self {
        Self {
            instance,
            conn,
            armed: true,
        }
    }

    async fn finish(mut self) {
        self.armed = false;
        self.conn.disconnect(None);
        self.instance.remove_connection(self.conn.id()).await;
    }
}

impl Drop for EphemeralConnection {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.conn.disconnect(None);
        let instance = self.instance.clone();
        let id = self.conn.id();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(conn = id, "http request dropped, removing connection");
                handle.spawn(async move { instance.remove_connection(id).await });
            }
            Err(_) => warn!(conn = id, "no runtime to remove dropped http connection"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Actor,
    Inspector,
}

async fn ws_connect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state.instance, query, headers, ws, SocketKind::Actor).await
}

async fn ws_inspect(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state.instance, query, headers, ws, SocketKind::Inspector).await
}

/// Negotiate and admit the connection before accepting the upgrade, so a
/// refused client gets a plain HTTP error.
async fn upgrade(
    instance: Arc<Instance>,
    query: ConnectQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    kind: SocketKind,
) -> Response {
    if instance.is_shutting_down() {
        return unavailable();
    }
    if let Err(err) = instance.wait_until_loaded().await {
        return error_response(&instance, ProtocolFormat::Json, &err.into());
    }

    let format = match resolve_format(query.format.as_deref(), None) {
        Ok(format) => format,
        Err(err) => return error_response(&instance, ProtocolFormat::Json, &err.into()),
    };
    let parameters = match parse_parameters(query.params.as_deref(), &instance.config.protocol) {
        Ok(parameters) => parameters,
        Err(err) => return error_response(&instance, format, &err.into()),
    };

    let conn_state = match kind {
        SocketKind::Inspector => None,
        SocketKind::Actor => {
            let request = ConnectRequest {
                parameters,
                headers,
                format,
            };
            match instance.before_connect(request).await {
                Ok(conn_state) => conn_state,
                Err(err) => {
                    debug!(?err, "connection refused");
                    return error_response(&instance, format, &err);
                }
            }
        }
    };

    ws.on_upgrade(move |socket| run_session(instance, socket, format, conn_state, kind))
}

async fn run_session(
    instance: Arc<Instance>,
    socket: WebSocket,
    format: ProtocolFormat,
    conn_state: Option<Value>,
    kind: SocketKind,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Outbound>();
    let (closed_tx, closed_rx) = watch::channel(false);
    let (writer_done_tx, mut writer_done) = oneshot::channel::<()>();

    let conn = Arc::new(Connection::new(
        format,
        conn_state,
        Arc::new(WebSocketTransport::new(outbox, closed_rx)),
    ));

    // Frames are written by a single task so handlers never block on I/O.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbox_rx.recv().await {
            let sent = match outbound {
                Outbound::Frame(EncodedMessage::Text(text)) => {
                    sink.send(WsMessage::Text(text.into())).await
                }
                Outbound::Frame(EncodedMessage::Binary(bytes)) => {
                    sink.send(WsMessage::Binary(bytes.into())).await
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
        let _ = writer_done_tx.send(());
    });

    let admitted = match kind {
        SocketKind::Actor => instance.accept_connection(conn.clone()).await.is_ok(),
        SocketKind::Inspector => {
            instance.inspector.registry().insert(conn.clone());
            true
        }
    };

    if admitted {
        info!(conn = conn.id(), %format, ?kind, "websocket connected");
        let peer_closed = loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&instance, &conn, kind, RawMessage::Text(text.as_str()));
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        handle_frame(&instance, &conn, kind, RawMessage::Binary(&bytes));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break true,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(conn = conn.id(), ?err, "websocket error");
                        break true;
                    }
                },
                _ = &mut writer_done => break false,
            }
        };

        // We closed first: the connection counts as closed once the peer
        // answers with its own close frame or goes away.
        if !peer_closed {
            let acknowledged = async {
                while let Some(Ok(msg)) = stream.next().await {
                    if matches!(msg, WsMessage::Close(_)) {
                        break;
                    }
                }
            };
            if tokio::time::timeout(CLOSE_ACK_TIMEOUT, acknowledged).await.is_err() {
                debug!(conn = conn.id(), "peer did not acknowledge close");
            }
        }
    }

    // Let queued frames go out, then tear down.
    conn.disconnect(None);
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!(conn = conn.id(), "writer did not finish, dropping it");
    }
    closed_tx.send_replace(true);

    match kind {
        SocketKind::Actor => instance.remove_connection(conn.id()).await,
        SocketKind::Inspector => {
            instance.inspector.registry().remove(conn.id());
        }
    }
    info!(conn = conn.id(), "websocket closed");
}

/// Decode one frame and act on it. RPCs run as their own tasks, so
/// responses may come back out of order.
fn handle_frame(instance: &Arc<Instance>, conn: &Arc<Connection>, kind: SocketKind, raw: RawMessage<'_>) {
    let limit = instance.config.protocol.max_incoming_message_size;
    let frame: ToServer = match actor_protocol::decode(raw, conn.format(), limit) {
        Ok(frame) => frame,
        Err(err) => {
            let err = ActorError::from(err);
            warn!(conn = conn.id(), code = err.code(), "rejecting frame");
            let payload = ErrorPayload::from_error(&err.into(), &instance.metadata);
            let message = ToClient::error(payload.code, payload.message, payload.metadata);
            if let Err(err) = conn.send_message(&message) {
                error!(conn = conn.id(), ?err, "failed to send connection error");
            }
            return;
        }
    };

    match frame.body {
        ToServerBody::RpcRequest(request) => {
            let instance = instance.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let args = RpcArgs::new(request.args);
                let result = match kind {
                    SocketKind::Actor => instance.execute_rpc(conn.clone(), &request.name, args).await,
                    SocketKind::Inspector => {
                        execute_inspector_rpc(&instance, conn.clone(), &request.name, args).await
                    }
                };
                let message = match result {
                    Ok(output) => ToClient::rpc_ok(request.id, output),
                    Err(err) => {
                        let payload = ErrorPayload::from_error(&err, &instance.metadata);
                        ToClient::rpc_error(request.id, payload.code, payload.message, payload.metadata)
                    }
                };
                if let Err(err) = conn.send_message(&message) {
                    error!(conn = conn.id(), rpc = %request.name, ?err, "failed to send rpc response");
                }
            });
        }
        ToServerBody::SubscriptionRequest(request) => match kind {
            SocketKind::Actor => instance.subscribe(conn.id(), &request.event, request.subscribe),
            SocketKind::Inspector => {
                let registry = instance.inspector.registry();
                if request.subscribe {
                    registry.subscribe(conn.id(), &request.event);
                } else {
                    registry.unsubscribe(conn.id(), &request.event);
                }
            }
        },
    }
}
