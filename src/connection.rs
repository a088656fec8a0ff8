//! # Device Connection
//!
//! Owns exactly one live WebSocket to one remote device and keeps it alive:
//! a reconnect state machine wrapped around a duplex session.
//!
//! ## Connection Lifecycle:
//! 1. **Connecting**: dial `ws://host:port/realtime` with a bounded timeout
//! 2. **Configure**: fresh session handler + codec pair, then exactly one
//!    `session.update` message - the device must never see audio before its
//!    session configuration
//! 3. **Active**: two concurrent loops share the split transport - the
//!    inbound loop only receives, the outbound loop only sends
//! 4. **Teardown**: whichever loop finishes first wins; the other is
//!    cancelled, cleanup runs, and (policy permitting) we sleep the
//!    configured delay and dial again
//!
//! Retry is a fixed delay with no cap: the fleet is small and operator
//! supervised, and a device that stays down simply keeps a slot warm. Only
//! `stop()` ends the cycle, after which this connection never dials again.

use crate::audio::{CodecFactory, StreamDecoder, StreamEncoder, SAMPLE_RATE};
use crate::devices::RemoteDevice;
use crate::error::{AppError, AppResult};
use crate::protocol::{
    self, DeviceMessage, SessionConfig, CONNECT_TIMEOUT, PING_INTERVAL, PING_TIMEOUT,
};
use crate::session::{Emission, SessionHandler, SessionHandlerFactory};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Observable lifecycle state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, not yet started
    Idle,
    /// Dialing (or waiting out the reconnect delay)
    Connecting,
    /// Session configured, duplex loops running
    Active,
    /// stop() in progress
    Closing,
    /// Terminal; this connection never dials again
    Stopped,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Stopped => "stopped",
        }
    }
}

/// Manages a single connection to a remote device.
///
/// ## Ownership:
/// The connection exclusively owns its transport halves, its session handler
/// and its codec state for the duration of one session; the supervisor only
/// ever reads the atomic status flags. Every reconnect gets a brand-new
/// handler and codec pair so no stream state survives a dropped transport.
pub struct DeviceConnection {
    device: RemoteDevice,
    handler_factory: Arc<dyn SessionHandlerFactory>,
    codec: Arc<dyn CodecFactory>,

    state: RwLock<ConnectionState>,
    connected: AtomicBool,
    /// Cleared exactly once, by stop(); never set again for this instance
    should_reconnect: AtomicBool,

    shutdown_tx: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,

    // Session-scoped resources, present only while a session is up.
    // Inbound and outbound halves are separate locks because the two loops
    // hold them concurrently for the whole session.
    sink: Mutex<Option<WsSink>>,
    source: Mutex<Option<WsSource>>,
    handler: StdMutex<Option<Arc<dyn SessionHandler>>>,

    /// Last time the device sent us anything (frames of any kind)
    last_activity: StdMutex<Instant>,
}

impl DeviceConnection {
    pub fn new(
        device: RemoteDevice,
        handler_factory: Arc<dyn SessionHandlerFactory>,
        codec: Arc<dyn CodecFactory>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            device,
            handler_factory,
            codec,
            state: RwLock::new(ConnectionState::Idle),
            connected: AtomicBool::new(false),
            should_reconnect: AtomicBool::new(true),
            shutdown_tx,
            task: StdMutex::new(None),
            sink: Mutex::new(None),
            source: Mutex::new(None),
            handler: StdMutex::new(None),
            last_activity: StdMutex::new(Instant::now()),
        }
    }

    /// The device this connection is responsible for.
    pub fn device(&self) -> &RemoteDevice {
        &self.device
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Connection {} -> {}", self.device.name, state.as_str());
        *self.state.write().unwrap() = state;
    }

    fn reconnect_allowed(&self) -> bool {
        self.should_reconnect.load(Ordering::SeqCst)
    }

    /// Spawn the connection loop. Calling start on an already-started or
    /// already-stopped connection is a logged no-op.
    pub fn start(self: Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            warn!("Connection for {} already started", self.device.name);
            return;
        }
        if !self.reconnect_allowed() {
            warn!("Connection for {} was stopped and cannot restart", self.device.name);
            return;
        }

        let conn = Arc::clone(&self);
        *task = Some(tokio::spawn(async move {
            conn.connection_loop().await;
        }));
    }

    /// Stop the connection and disable reconnection permanently.
    ///
    /// Cancels the connection loop, awaits it, and runs cleanup - after stop
    /// returns, no task of this connection touches the transport or the
    /// handler. Safe to call more than once.
    pub async fn stop(&self) {
        self.set_state(ConnectionState::Closing);
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Connection task for {} panicked: {}", self.device.name, e);
                }
            }
        }

        self.cleanup().await;
        self.set_state(ConnectionState::Stopped);
    }

    /// Main connection loop with auto-reconnect.
    async fn connection_loop(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();

        while self.reconnect_allowed() {
            self.set_state(ConnectionState::Connecting);

            let result = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                result = self.connect_and_handle() => result,
            };

            if let Err(e) = result {
                error!("Connection error for {}: {}", self.device.name, e);
            }

            if self.reconnect_allowed() && self.device.auto_reconnect {
                info!(
                    "Reconnecting to {} in {}s",
                    self.device.name, self.device.reconnect_delay
                );
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(self.device.reconnect_delay)) => {}
                }
            } else {
                break;
            }
        }

        self.cleanup().await;
        self.set_state(ConnectionState::Stopped);
    }

    /// One full session: connect, configure, run the duplex loops, clean up.
    async fn connect_and_handle(&self) -> AppResult<()> {
        let result = self.run_session().await;

        self.connected.store(false, Ordering::SeqCst);
        self.cleanup().await;
        result
    }

    async fn run_session(&self) -> AppResult<()> {
        let uri = format!(
            "ws://{}:{}{}",
            self.device.host,
            self.device.port,
            protocol::REALTIME_PATH
        );
        info!("Connecting to {} at {}", self.device.name, uri);

        let mut request = uri
            .as_str()
            .into_client_request()
            .map_err(|e| AppError::Connect(format!("Invalid device URI {}: {}", uri, e)))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(protocol::SUBPROTOCOL),
        );

        let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| AppError::Connect(format!("Connection timeout for {}", self.device.name)))?
            .map_err(|e| {
                AppError::Connect(format!("Failed to connect to {}: {}", self.device.name, e))
            })?;

        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock().await = Some(source);
        *self.last_activity.lock().unwrap() = Instant::now();

        // Fresh handler and codec streams for this session only. Stored
        // before start_up so a half-initialized handler still gets cleaned up.
        let handler = self.handler_factory.create();
        *self.handler.lock().unwrap() = Some(Arc::clone(&handler));
        handler.start_up().await?;

        let decoder = self.codec.new_decoder();
        let encoder = self.codec.new_encoder();

        // The device must receive its session configuration before any
        // audio or content event crosses the wire.
        self.configure_session().await?;

        self.connected.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Active);
        info!("Connected to {}", self.device.name);

        // First loop to exit ends the session; the sibling is cancelled by
        // the select and awaited implicitly as it drops.
        let result = tokio::select! {
            result = self.receive_loop(Arc::clone(&handler), decoder) => result,
            result = self.emit_loop(handler, encoder) => result,
        };

        info!("Session with {} ended", self.device.name);
        result
    }

    /// Send the one-time session configuration message.
    async fn configure_session(&self) -> AppResult<()> {
        let config = DeviceMessage::SessionUpdate {
            session: SessionConfig {
                voice: self.device.voice.clone(),
                instructions: self.device.instructions.clone(),
                allow_recording: false,
            },
        };

        self.send_text(config.to_json()?).await?;
        debug!("Session configured for {}", self.device.name);
        Ok(())
    }

    /// Inbound half: consume frames from the device in arrival order.
    ///
    /// Malformed messages are logged and dropped; only transport-level
    /// failure or closure ends the loop.
    async fn receive_loop(
        &self,
        handler: Arc<dyn SessionHandler>,
        mut decoder: Box<dyn StreamDecoder>,
    ) -> AppResult<()> {
        let mut source_guard = self.source.lock().await;
        let source = source_guard
            .as_mut()
            .ok_or_else(|| AppError::Transport("Transport already torn down".to_string()))?;

        while let Some(frame) = source.next().await {
            let frame = frame.map_err(|e| {
                AppError::Transport(format!("Receive failed for {}: {}", self.device.name, e))
            })?;

            *self.last_activity.lock().unwrap() = Instant::now();

            match frame {
                Message::Text(text) => {
                    if let Err(e) = self
                        .process_device_message(&handler, decoder.as_mut(), &text)
                        .await
                    {
                        // Per-message errors never end the session
                        warn!("Dropping message from {}: {}", self.device.name, e);
                    }
                }
                Message::Close(_) => {
                    info!("Connection to {} closed by device", self.device.name);
                    return Ok(());
                }
                // tungstenite answers pings itself; pongs feed last_activity
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(data) => {
                    debug!(
                        "Ignoring {}-byte binary frame from {} (protocol is JSON text)",
                        data.len(),
                        self.device.name
                    );
                }
                Message::Frame(_) => {}
            }
        }

        info!("Receive stream ended for {}", self.device.name);
        Ok(())
    }

    /// Dispatch one inbound JSON message by its `type` discriminator.
    async fn process_device_message(
        &self,
        handler: &Arc<dyn SessionHandler>,
        decoder: &mut dyn StreamDecoder,
        text: &str,
    ) -> AppResult<()> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| AppError::Protocol(format!("Invalid JSON: {}", e)))?;

        match DeviceMessage::from_value(&value)? {
            Some(DeviceMessage::InputAudioAppend { audio }) => {
                let frame = protocol::decode_audio_payload(&audio)?;
                let pcm = decoder.decode(&frame);

                // The decoder may be mid-frame and have nothing yet
                if !pcm.is_empty() {
                    handler
                        .receive(SAMPLE_RATE, pcm)
                        .await
                        .map_err(|e| AppError::Protocol(format!("Handler rejected audio: {}", e)))?;
                }
            }
            Some(DeviceMessage::SessionUpdate { session }) => {
                debug!("Session update from {}: {:?}", self.device.name, session);
            }
            Some(DeviceMessage::ResponseAudioDelta { .. }) => {
                debug!("Ignoring response.audio.delta from {}", self.device.name);
            }
            None => {
                debug!(
                    "Received from {}: {:?}",
                    self.device.name,
                    value.get("type")
                );
            }
        }

        Ok(())
    }

    /// Outbound half: forward handler emissions, interleaving keep-alive
    /// pings. Any send or encode failure ends the loop (and the session).
    async fn emit_loop(
        &self,
        handler: Arc<dyn SessionHandler>,
        mut encoder: Box<dyn StreamEncoder>,
    ) -> AppResult<()> {
        let mut ping = IntervalStream::new(tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        ));

        loop {
            tokio::select! {
                _ = ping.next() => {
                    let silence = self.last_activity.lock().unwrap().elapsed();
                    if silence > PING_INTERVAL + PING_TIMEOUT {
                        return Err(AppError::Transport(format!(
                            "Keep-alive timeout for {} ({}s of silence)",
                            self.device.name,
                            silence.as_secs()
                        )));
                    }
                    self.send_frame(Message::Ping(Vec::new())).await?;
                }
                emitted = handler.emit() => {
                    match emitted? {
                        // Idle poll, nothing to send
                        None => continue,
                        Some(Emission::Event(event)) => {
                            let text = serde_json::to_string(&event)
                                .map_err(|e| AppError::Internal(e.to_string()))?;
                            self.send_text(text).await?;
                        }
                        Some(Emission::Audio(buffer)) => {
                            if buffer.is_empty() {
                                continue;
                            }
                            let pcm = buffer.into_f32();
                            let frame = encoder.encode(&pcm);

                            // The encoder may still be filling a frame
                            if !frame.is_empty() {
                                let message = DeviceMessage::audio_delta(&frame);
                                self.send_text(message.to_json()?).await?;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn send_text(&self, text: String) -> AppResult<()> {
        self.send_frame(Message::Text(text)).await
    }

    async fn send_frame(&self, frame: Message) -> AppResult<()> {
        let mut sink_guard = self.sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| AppError::Transport("Transport already torn down".to_string()))?;

        sink.send(frame).await.map_err(|e| {
            AppError::Transport(format!("Send failed for {}: {}", self.device.name, e))
        })
    }

    /// Release session resources. Idempotent and non-throwing: every error
    /// here is swallowed, because cleanup runs on paths that are already
    /// failing.
    async fn cleanup(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = tokio::time::timeout(protocol::CLOSE_TIMEOUT, sink.close()).await;
        }
        self.source.lock().await.take();

        let handler = self.handler.lock().unwrap().take();
        if let Some(handler) = handler {
            if let Err(e) = handler.cleanup().await {
                debug!("Handler cleanup for {} failed: {}", self.device.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{PassthroughCodec, PcmBuffer};
    use byteorder::{ByteOrder, LittleEndian};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Handler that plays back a scripted list of emissions and records
    /// everything it receives.
    struct ScriptedHandler {
        emissions: StdMutex<VecDeque<Emission>>,
        received: Arc<StdMutex<Vec<Vec<f32>>>>,
    }

    #[async_trait::async_trait]
    impl SessionHandler for ScriptedHandler {
        async fn start_up(&self) -> AppResult<()> {
            Ok(())
        }

        async fn receive(&self, _sample_rate: u32, pcm: Vec<f32>) -> AppResult<()> {
            self.received.lock().unwrap().push(pcm);
            Ok(())
        }

        async fn emit(&self) -> AppResult<Option<Emission>> {
            let next = self.emissions.lock().unwrap().pop_front();
            if next.is_none() {
                // Script exhausted: stay idle without spinning
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(next)
        }

        async fn cleanup(&self) -> AppResult<()> {
            Ok(())
        }
    }

    struct ScriptedFactory {
        script: StdMutex<VecDeque<Emission>>,
        received: Arc<StdMutex<Vec<Vec<f32>>>>,
        created: AtomicUsize,
    }

    impl ScriptedFactory {
        fn new(script: Vec<Emission>) -> Self {
            Self {
                script: StdMutex::new(script.into()),
                received: Arc::new(StdMutex::new(Vec::new())),
                created: AtomicUsize::new(0),
            }
        }
    }

    impl SessionHandlerFactory for ScriptedFactory {
        fn create(&self) -> Arc<dyn SessionHandler> {
            self.created.fetch_add(1, Ordering::SeqCst);
            // The first handler gets the script; later sessions idle
            let emissions = std::mem::take(&mut *self.script.lock().unwrap());
            Arc::new(ScriptedHandler {
                emissions: StdMutex::new(emissions),
                received: Arc::clone(&self.received),
            })
        }
    }

    fn test_device(port: u16, reconnect_delay: f64, auto_reconnect: bool) -> RemoteDevice {
        RemoteDevice {
            name: "test_device".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            voice: "Watercooler".to_string(),
            instructions: serde_json::json!({"type": "smalltalk"}),
            auto_reconnect,
            reconnect_delay,
            enabled: true,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    /// Accept a WebSocket handshake, echoing the client's requested
    /// subprotocol back like a real device does. The production client
    /// negotiates the `realtime` subprotocol and tungstenite fails the
    /// handshake client-side if the server omits it from the response.
    async fn accept_echoing_subprotocol(
        stream: TcpStream,
    ) -> Result<WebSocketStream<TcpStream>, tokio_tungstenite::tungstenite::Error> {
        use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
        tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
            if let Some(proto) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, proto.clone());
            }
            Ok(response)
        })
        .await
    }

    /// Fake device: accepts connections and streams every received text
    /// frame into a channel. Optionally sends scripted frames after accept.
    async fn spawn_device(
        send_on_accept: Vec<String>,
        close_after_accept: bool,
    ) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut ws = match accept_echoing_subprotocol(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };

                for frame in &send_on_accept {
                    let _ = ws.send(Message::Text(frame.clone())).await;
                }

                if close_after_accept {
                    let _ = ws.close(None).await;
                    continue;
                }

                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        let _ = tx.send(text);
                    }
                }
            }
        });

        (port, rx)
    }

    fn encoded_pcm(samples: &[f32]) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let mut bytes = vec![0u8; samples.len() * 4];
        LittleEndian::write_f32_into(samples, &mut bytes);
        STANDARD.encode(bytes)
    }

    #[tokio::test]
    async fn test_session_config_precedes_all_traffic_and_order_is_kept() {
        let (port, mut frames) = spawn_device(Vec::new(), false).await;

        let factory = Arc::new(ScriptedFactory::new(vec![
            Emission::Event(serde_json::json!({"type": "response.text.delta", "delta": "A"})),
            Emission::Audio(PcmBuffer::F32(vec![0.5; 4])),
            Emission::Event(serde_json::json!({"type": "response.text.done", "text": "C"})),
        ]));
        let connection = Arc::new(DeviceConnection::new(
            test_device(port, 0.1, true),
            factory,
            Arc::new(PassthroughCodec),
        ));
        Arc::clone(&connection).start();

        let mut received = Vec::new();
        for _ in 0..4 {
            let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("device channel closed");
            received.push(serde_json::from_str::<serde_json::Value>(&frame).unwrap());
        }

        assert_eq!(received[0]["type"], "session.update");
        assert_eq!(received[0]["session"]["voice"], "Watercooler");
        assert_eq!(received[0]["session"]["allow_recording"], false);
        assert_eq!(received[1]["type"], "response.text.delta");
        assert_eq!(received[1]["delta"], "A");
        assert_eq!(received[2]["type"], "response.audio.delta");
        assert_eq!(received[3]["type"], "response.text.done");

        connection.stop().await;
        assert_eq!(connection.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_inbound_audio_reaches_handler_despite_garbage() {
        let pcm = vec![0.25f32, -0.25, 0.5, -0.5];
        let frames = vec![
            "this is not json".to_string(),
            serde_json::json!({"type": "input_audio_buffer.append", "audio": encoded_pcm(&pcm)})
                .to_string(),
        ];
        let (port, _rx) = spawn_device(frames, false).await;

        let factory = Arc::new(ScriptedFactory::new(Vec::new()));
        let received = Arc::clone(&factory.received);
        let connection = Arc::new(DeviceConnection::new(
            test_device(port, 0.1, true),
            factory,
            Arc::new(PassthroughCodec),
        ));
        Arc::clone(&connection).start();

        // The malformed frame must not kill the loop; the valid one after it
        // still gets decoded and delivered.
        assert!(
            wait_until(
                || !received.lock().unwrap().is_empty(),
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(received.lock().unwrap()[0], pcm);

        connection.stop().await;
    }

    #[tokio::test]
    async fn test_auto_reconnect_builds_fresh_session() {
        let (port, _rx) = spawn_device(Vec::new(), true).await;

        let factory = Arc::new(ScriptedFactory::new(Vec::new()));
        let connection = Arc::new(DeviceConnection::new(
            test_device(port, 0.05, true),
            Arc::clone(&factory) as Arc<dyn SessionHandlerFactory>,
            Arc::new(PassthroughCodec),
        ));
        Arc::clone(&connection).start();

        // The device closes every session right away; the connection must
        // keep retrying, with a brand-new handler per attempt.
        assert!(
            wait_until(
                || factory.created.load(Ordering::SeqCst) >= 3,
                Duration::from_secs(5)
            )
            .await
        );

        connection.stop().await;
        assert_eq!(connection.state(), ConnectionState::Stopped);
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_no_reconnect_when_policy_disallows() {
        let (port, _rx) = spawn_device(Vec::new(), true).await;

        let factory = Arc::new(ScriptedFactory::new(Vec::new()));
        let connection = Arc::new(DeviceConnection::new(
            test_device(port, 0.05, false),
            Arc::clone(&factory) as Arc<dyn SessionHandlerFactory>,
            Arc::new(PassthroughCodec),
        ));
        Arc::clone(&connection).start();

        assert!(
            wait_until(
                || connection.state() == ConnectionState::Stopped,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_retrying_until_stop() {
        // Nothing is listening on this port (bound then dropped)
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = Arc::new(ScriptedFactory::new(Vec::new()));
        let connection = Arc::new(DeviceConnection::new(
            test_device(port, 0.05, true),
            factory,
            Arc::new(PassthroughCodec),
        ));
        Arc::clone(&connection).start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!connection.is_connected());
        assert_ne!(connection.state(), ConnectionState::Stopped);

        connection.stop().await;
        assert_eq!(connection.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (port, _rx) = spawn_device(Vec::new(), false).await;

        let factory = Arc::new(ScriptedFactory::new(Vec::new()));
        let connection = Arc::new(DeviceConnection::new(
            test_device(port, 0.1, true),
            factory,
            Arc::new(PassthroughCodec),
        ));
        Arc::clone(&connection).start();

        assert!(wait_until(|| connection.is_connected(), Duration::from_secs(5)).await);

        connection.stop().await;
        connection.stop().await;
        assert_eq!(connection.state(), ConnectionState::Stopped);
        assert!(!connection.is_connected());

        // A stopped connection refuses to dial again
        Arc::clone(&connection).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!connection.is_connected());
    }
}
