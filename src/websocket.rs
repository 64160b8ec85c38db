//! # WebSocket Transcoding Endpoint
//!
//! Clients connect to `/ws`, send a RIFF/WAVE header followed by raw PCM as
//! binary messages, and receive the transcoded stream back as binary messages.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: each upgrade gets a fresh session id and its own session task
//! 2. **Header**: the first binary message(s) carry the 44-byte container header
//! 3. **Audio Streaming**: every later binary message is raw PCM payload
//! 4. **Output**: transcoded fragments arrive as binary messages, as the transcoder flushes them
//! 5. **Errors**: a failed session sends one JSON text frame, then the connection closes
//!
//! ## Message Format:
//! - **Client → Server**: binary header + PCM; text messages are ignored
//! - **Server → Client**: binary transcoded audio; `{"type":"error","code":..,"message":..}` on failure
//!
//! ## Actor Bridge:
//! The actix actor owns the socket. Inbound frames are pushed into a channel the
//! session coordinator reads (`ChannelInbound`); the coordinator writes back
//! through the actor's mailbox (`ActorOutbound`).

use crate::config::{StreamConfig, TranscoderConfig};
use crate::error::SessionError;
use crate::session::connection::{ChannelInbound, FrameSender};
use crate::session::{Coordinator, Frame, Outbound};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// WebSocket actor for one transcoding session.
pub struct GatewaySocket {
    session_id: String,
    state: AppState,
    transcoder: TranscoderConfig,
    stream: StreamConfig,

    /// Frames for the session; dropped when the actor stops
    frames: Option<FrameSender>,

    /// Read side handed to the coordinator in `started()`
    inbound: Option<ChannelInbound>,

    /// Last time the client sent anything
    last_heartbeat: Instant,
}

impl GatewaySocket {
    pub fn new(
        session_id: String,
        state: AppState,
        transcoder: TranscoderConfig,
        stream: StreamConfig,
    ) -> Self {
        let (frames, inbound) = ChannelInbound::new();
        Self {
            session_id,
            state,
            transcoder,
            stream,
            frames: Some(frames),
            inbound: Some(inbound),
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&mut self, frame: Result<Frame, SessionError>) {
        if let Some(frames) = &self.frames {
            // The session may already have finished reading; nothing to do then
            if frames.send(frame).is_err() {
                self.frames = None;
            }
        }
    }

    /// Ping the client and drop the connection if it went quiet.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.stream.client_timeout();

        ctx.run_interval(self.stream.heartbeat_interval(), move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                act.forward(Err(SessionError::Connection(
                    "client heartbeat timeout".to_string(),
                )));
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Spawn the session coordinator for this connection.
    fn start_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = self.inbound.take() else {
            return;
        };

        let outbound: Arc<dyn Outbound> = Arc::new(ActorOutbound {
            addr: ctx.address(),
        });
        let coordinator = Coordinator::new(
            self.session_id.clone(),
            self.transcoder.clone(),
            self.stream.clone(),
            inbound,
            outbound,
        );

        let metrics = self.state.metrics.clone();
        metrics.session_opened();

        let span = info_span!("session", session_id = %self.session_id);
        tokio::spawn(
            async move {
                let report = coordinator.run().await;
                metrics.record_report(&report);
            }
            .instrument(span),
        );
    }
}

impl Actor for GatewaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");
        self.start_heartbeat(ctx);
        self.start_session(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");
        // Closing the channel ends the session's read loop
        self.frames = None;
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for GatewaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.forward(Ok(Frame::Binary(data)));
            }
            Ok(ws::Message::Text(text)) => {
                self.forward(Ok(Frame::Text(text.to_string())));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed by client: {:?}", reason);
                self.forward(Ok(Frame::Close));
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                self.forward(Err(SessionError::Connection(err.to_string())));
                ctx.stop();
            }
        }
    }
}

/// Transcoded chunk for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendBinary(Bytes);

/// Text frame for the client (error reports).
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// Close the socket after the session's teardown.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

impl Handler<SendBinary> for GatewaySocket {
    type Result = ();

    fn handle(&mut self, msg: SendBinary, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<SendText> for GatewaySocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<CloseSocket> for GatewaySocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "Session finished, closing socket");
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// Session write side: messages to the actor's mailbox.
///
/// A send completes once the actor has queued the frame on the socket's write
/// buffer, not when the client has read it.
struct ActorOutbound {
    addr: Addr<GatewaySocket>,
}

#[async_trait]
impl Outbound for ActorOutbound {
    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError> {
        self.addr
            .send(SendBinary(data))
            .await
            .map_err(|e| SessionError::OutputDelivery(e.to_string()))
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.addr
            .send(SendText(text))
            .await
            .map_err(|e| SessionError::OutputDelivery(e.to_string()))
    }

    async fn close(&self) {
        // Already stopped if the client closed first
        if self.addr.send(CloseSocket).await.is_err() {
            debug!("Socket already closed");
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Takes a snapshot of the transcoder and stream configuration, then hands the
/// connection to a `GatewaySocket` actor. Client messages up to
/// `stream.max_message_bytes` are accepted; a larger one is a protocol error
/// that ends the session. A failed handshake is answered by actix with the
/// matching HTTP error and no session is created.
pub async fn gateway_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = Uuid::new_v4().to_string();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let config = state.get_config();
    let max_message_bytes = config.stream.max_message_bytes;
    let socket = GatewaySocket::new(
        session_id.clone(),
        state.get_ref().clone(),
        config.transcoder,
        config.stream,
    );

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_message_bytes)
        .start()
        .map_err(|err| {
            warn!(session_id = %session_id, error = %err, "WebSocket handshake failed");
            err
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ContainerHeader;
    use crate::config::AppConfig;
    use actix_web::{dev::ServerHandle, http::StatusCode, test, App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use std::net::{SocketAddr, TcpListener};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Serve `/ws` on an ephemeral port with `cat` standing in for the transcoder.
    fn serve_echo(max_message_bytes: usize) -> (SocketAddr, ServerHandle) {
        let mut config = AppConfig::default();
        config.transcoder.wrapper_args = vec!["sh".into(), "-c".into(), "exec cat".into()];
        config.stream.max_message_bytes = max_message_bytes;
        let state = AppState::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(gateway_websocket))
        })
        .workers(1)
        .disable_signals()
        .listen(listener)
        .unwrap()
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(server);
        (addr, handle)
    }

    #[actix_web::test]
    async fn test_plain_get_is_not_upgraded() {
        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/ws", web::get().to(gateway_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.metrics.snapshot().sessions_started, 0);
    }

    #[actix_web::test]
    async fn test_messages_above_64k_reach_the_transcoder() {
        let (addr, server) = serve_echo(1024 * 1024);
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
        socket
            .send(WsMessage::Binary(ContainerHeader::encode(2, 44100, 16, 0)))
            .await
            .unwrap();
        socket.send(WsMessage::Binary(payload.clone())).await.unwrap();

        let mut received = Vec::new();
        while received.len() < payload.len() {
            let msg = tokio::time::timeout(Duration::from_secs(10), socket.next())
                .await
                .expect("no transcoded output in time")
                .expect("socket ended early")
                .unwrap();
            match msg {
                WsMessage::Binary(data) => received.extend_from_slice(&data),
                WsMessage::Text(text) => panic!("unexpected text frame: {}", text),
                _ => {}
            }
        }
        assert_eq!(received, payload);

        let _ = socket.close(None).await;
        server.stop(true).await;
    }

    #[actix_web::test]
    async fn test_message_over_configured_limit_ends_session() {
        let (addr, server) = serve_echo(16 * 1024);
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        socket
            .send(WsMessage::Binary(ContainerHeader::encode(1, 16000, 16, 0)))
            .await
            .unwrap();
        socket.send(WsMessage::Binary(vec![0u8; 32 * 1024])).await.unwrap();

        let mut binary_bytes = 0;
        loop {
            let next = tokio::time::timeout(Duration::from_secs(10), socket.next())
                .await
                .expect("connection was not closed");
            match next {
                Some(Ok(WsMessage::Binary(data))) => binary_bytes += data.len(),
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
        assert_eq!(binary_bytes, 0);

        server.stop(true).await;
    }
}
