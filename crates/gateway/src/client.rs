// Gateway Protocol Client
//
// One logical connection to the gateway. A single dispatcher task consumes
// inbound frames; everything it shares with callers lives in `Session`
// behind one mutex that is never held across an await point.

use crate::auth::{DeviceAuthPayload, DeviceAuthStore};
use crate::events::{EventSubscribers, SubscriptionId};
use crate::identity::DeviceIdentity;
use crate::protocol::*;
use crate::transport::{Connector, TransportEvent};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by the client. `Clone` so coalesced connects share one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not connected to gateway")]
    NotConnected,
    #[error("gateway connection closed")]
    ConnectionClosed,
    #[error("gateway handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("gateway rejected authentication: {0}")]
    AuthRejected(String),
    #[error("request '{method}' timed out after {timeout:?}")]
    CallTimeout { method: String, timeout: Duration },
    #[error("gateway error {code}: {message}")]
    Gateway { code: String, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection parameters for one client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    /// Statically configured bearer token
    pub token: Option<String>,
    pub role: String,
    pub scopes: BTreeSet<String>,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub display_name: Option<String>,
    pub client_version: String,
    pub platform: String,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            role: DEFAULT_ROLE.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            display_name: None,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<JsonValue, ClientError>>,
}

struct Session {
    state: ConnectionState,
    /// Bumped on every transport open so stale dispatchers cannot close a newer one
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    dispatcher: Option<JoinHandle<()>>,
    challenge: Option<oneshot::Sender<Option<String>>>,
    pending: HashMap<String, PendingCall>,
    hello: Option<HelloOkPayload>,
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ClientError>>>;

/// In-flight connect, tagged so a superseded attempt cannot clear its successor
struct ConnectSlot {
    ticket: u64,
    attempt: ConnectAttempt,
}

struct ClientInner {
    options: ClientOptions,
    identity: Arc<DeviceIdentity>,
    tokens: Arc<DeviceAuthStore>,
    connector: Arc<dyn Connector>,
    events: Arc<EventSubscribers>,
    session: Mutex<Session>,
    connecting: Mutex<Option<ConnectSlot>>,
    next_ticket: AtomicU64,
}

/// Authenticated request/response client for the gateway
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

impl GatewayClient {
    pub fn new(
        options: ClientOptions,
        identity: Arc<DeviceIdentity>,
        tokens: Arc<DeviceAuthStore>,
        connector: Arc<dyn Connector>,
        events: Arc<EventSubscribers>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                options,
                identity,
                tokens,
                connector,
                events,
                session: Mutex::new(Session {
                    state: ConnectionState::Idle,
                    generation: 0,
                    outbound: None,
                    dispatcher: None,
                    challenge: None,
                    pending: HashMap::new(),
                    hello: None,
                }),
                connecting: Mutex::new(None),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_session().pending.len()
    }

    /// `hello-ok` payload of the current connection
    pub fn hello(&self) -> Option<HelloOkPayload> {
        self.inner.lock_session().hello.clone()
    }

    /// Connect and authenticate.
    ///
    /// Calls made while a handshake is in flight share its outcome.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let attempt = {
            let mut slot = self.inner.lock_connecting();
            if self.state() == ConnectionState::Connected {
                return Ok(());
            }
            match slot.as_ref() {
                Some(existing) => existing.attempt.clone(),
                None => {
                    let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self.inner);
                    let attempt = async move {
                        let result = inner.handshake().await;
                        let mut slot = inner.lock_connecting();
                        if slot.as_ref().is_some_and(|s| s.ticket == ticket) {
                            slot.take();
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(ConnectSlot {
                        ticket,
                        attempt: attempt.clone(),
                    });
                    attempt
                }
            }
        };
        attempt.await
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: JsonValue,
    ) -> Result<JsonValue, ClientError> {
        self.send_request_with_timeout(method, params, self.inner.options.request_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue, ClientError> {
        self.inner.call(method, params, timeout, true).await
    }

    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &JsonValue) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(event, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Close the connection, rejecting every pending call
    pub fn disconnect(&self) {
        self.inner.lock_connecting().take();
        let generation = self.inner.lock_session().generation;
        if let Some(dispatcher) = self
            .inner
            .close_session(generation, ClientError::ConnectionClosed)
        {
            dispatcher.abort();
        }
    }
}

impl ClientInner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_connecting(&self) -> MutexGuard<'_, Option<ConnectSlot>> {
        self.connecting.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn handshake(self: &Arc<Self>) -> Result<(), ClientError> {
        let generation = {
            let mut session = self.lock_session();
            if session.state == ConnectionState::Connected {
                return Ok(());
            }
            session.generation += 1;
            session.state = ConnectionState::Connecting;
            session.generation
        };
        debug!("Connecting to gateway at {}", self.options.url);

        let transport = match self.connector.open(&self.options.url).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Gateway connection failed: {}", e);
                self.close_session(generation, e.clone());
                return Err(e);
            }
        };

        let (challenge_tx, challenge_rx) = oneshot::channel();
        {
            let mut session = self.lock_session();
            if session.generation != generation {
                return Err(ClientError::ConnectionClosed);
            }
            session.outbound = Some(transport.outbound);
            session.challenge = Some(challenge_tx);
            session.dispatcher = Some(tokio::spawn(dispatch(
                Arc::clone(self),
                generation,
                transport.inbound,
            )));
        }

        let outcome = tokio::time::timeout(
            self.options.handshake_timeout,
            self.authenticate(generation, challenge_rx),
        )
        .await
        .unwrap_or(Err(ClientError::HandshakeTimeout(
            self.options.handshake_timeout,
        )));

        let hello = match outcome {
            Ok(hello) => hello,
            Err(e) => {
                warn!("Gateway handshake failed: {}", e);
                if let Some(dispatcher) = self.close_session(generation, e.clone()) {
                    dispatcher.abort();
                }
                return Err(e);
            }
        };

        if let Some(auth) = &hello.auth {
            let role = auth.role.as_deref().unwrap_or(&self.options.role);
            let scopes: Vec<String> = if auth.scopes.is_empty() {
                self.options.scopes.iter().cloned().collect()
            } else {
                auth.scopes.clone()
            };
            if let Err(e) =
                self.tokens
                    .store(self.identity.device_id(), role, &auth.device_token, scopes)
            {
                warn!("Failed to persist device token: {}", e);
            }
        }

        let mut session = self.lock_session();
        if session.generation != generation || session.state == ConnectionState::Closed {
            return Err(ClientError::ConnectionClosed);
        }
        session.state = ConnectionState::Connected;
        session.hello = Some(hello);
        info!("Connected to gateway at {}", self.options.url);
        Ok(())
    }

    async fn authenticate(
        &self,
        generation: u64,
        challenge: oneshot::Receiver<Option<String>>,
    ) -> Result<HelloOkPayload, ClientError> {
        let nonce = challenge.await.map_err(|_| ClientError::ConnectionClosed)?;
        {
            let mut session = self.lock_session();
            if session.generation != generation || session.state == ConnectionState::Closed {
                return Err(ClientError::ConnectionClosed);
            }
            session.state = ConnectionState::Authenticating;
        }

        let device_id = self.identity.device_id();
        let stored = self.tokens.load(device_id, &self.options.role);
        let used_stored_token = stored.is_some();
        let token = stored
            .map(|t| t.token)
            .or_else(|| self.options.token.clone());

        let signed_at = chrono::Utc::now().timestamp_millis();
        let payload = DeviceAuthPayload {
            device_id,
            client_id: CLIENT_ID,
            client_mode: CLIENT_MODE,
            role: &self.options.role,
            scopes: &self.options.scopes,
            signed_at_ms: signed_at,
            token: token.as_deref(),
            nonce: nonce.as_deref(),
        };
        debug!("Signing {} device auth payload", payload.version());
        let signature = self.identity.sign(&payload.build());

        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: CLIENT_ID.to_string(),
                display_name: self.options.display_name.clone(),
                version: self.options.client_version.clone(),
                platform: self.options.platform.clone(),
                mode: CLIENT_MODE.to_string(),
                instance_id: Uuid::new_v4().to_string(),
            },
            role: self.options.role.clone(),
            scopes: self.options.scopes.iter().cloned().collect(),
            caps: Vec::new(),
            device: DeviceProof {
                id: device_id.to_string(),
                public_key: self.identity.public_key_base64url(),
                signature,
                signed_at,
                nonce: nonce.clone(),
            },
            auth: token.map(|token| ConnectAuth { token: Some(token) }),
            user_agent: Some(format!("clawlink/{}", self.options.client_version)),
            locale: None,
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| ClientError::Protocol(format!("failed to encode connect: {}", e)))?;

        let payload = match self
            .call(CONNECT_METHOD, params, self.options.request_timeout, false)
            .await
        {
            Ok(payload) => payload,
            Err(ClientError::Gateway { code, message }) => {
                if used_stored_token {
                    debug!("Clearing rejected device token");
                    if let Err(e) = self.tokens.clear(device_id, &self.options.role) {
                        warn!("Failed to clear device token: {}", e);
                    }
                }
                return Err(ClientError::AuthRejected(format!("{}: {}", code, message)));
            }
            Err(e) => return Err(e),
        };

        let hello: HelloOkPayload = serde_json::from_value(payload)
            .map_err(|e| ClientError::Protocol(format!("invalid hello-ok payload: {}", e)))?;
        if hello.kind.as_deref() != Some(HELLO_OK_TYPE) {
            return Err(ClientError::Protocol(format!(
                "expected {} in connect response, got {}",
                HELLO_OK_TYPE,
                hello.kind.as_deref().unwrap_or("untyped payload")
            )));
        }
        Ok(hello)
    }

    async fn call(
        &self,
        method: &str,
        params: JsonValue,
        timeout: Duration,
        require_connected: bool,
    ) -> Result<JsonValue, ClientError> {
        let id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut session = self.lock_session();
            if require_connected && session.state != ConnectionState::Connected {
                return Err(ClientError::NotConnected);
            }
            let outbound = session
                .outbound
                .clone()
                .ok_or(ClientError::NotConnected)?;
            let frame = serde_json::to_string(&GatewayFrame::Request(GatewayRequest::new(
                id.clone(),
                method,
                params,
            )))
            .map_err(|e| ClientError::Protocol(format!("failed to encode request: {}", e)))?;
            session.pending.insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    reply: reply_tx,
                },
            );
            if outbound.send(frame).is_err() {
                session.pending.remove(&id);
                return Err(ClientError::ConnectionClosed);
            }
        }
        debug!("Sent request {} ({})", method, id);

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.lock_session().pending.remove(&id);
                Err(ClientError::CallTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    fn handle_frame(&self, text: &str) -> Result<(), ClientError> {
        let frame: GatewayFrame = serde_json::from_str(text)
            .map_err(|e| ClientError::Protocol(format!("malformed frame: {}", e)))?;

        match frame {
            GatewayFrame::Event(event) if event.event == CHALLENGE_EVENT => {
                let challenge: ChallengePayload =
                    serde_json::from_value(event.payload).unwrap_or_default();
                let waiting = self.lock_session().challenge.take();
                match waiting {
                    Some(tx) => {
                        let _ = tx.send(challenge.nonce.filter(|n| !n.is_empty()));
                    }
                    None => debug!("Ignoring unexpected connect.challenge"),
                }
            }
            GatewayFrame::Event(event) => {
                let delivered = self.events.emit(&event.event, &event.payload);
                debug!("Event {} delivered to {} handler(s)", event.event, delivered);
            }
            GatewayFrame::Response(response) => {
                let pending = self.lock_session().pending.remove(&response.id);
                let Some(call) = pending else {
                    debug!("Dropping response for unknown request {}", response.id);
                    return Ok(());
                };
                let result = if response.ok {
                    Ok(response.payload.unwrap_or(JsonValue::Null))
                } else {
                    let error = response
                        .error
                        .unwrap_or_else(|| ErrorShape::new("UNKNOWN", "request failed"));
                    debug!("Request {} failed: {}", call.method, error.message);
                    Err(ClientError::Gateway {
                        code: error.code,
                        message: error.message,
                    })
                };
                let _ = call.reply.send(result);
            }
            GatewayFrame::Request(request) => {
                debug!(
                    "Ignoring gateway-initiated request {} ({})",
                    request.method, request.id
                );
            }
        }
        Ok(())
    }

    /// Move to `Closed` and reject all pending calls with `reason`.
    ///
    /// Returns the dispatcher handle so callers outside the dispatcher can abort it.
    fn close_session(&self, generation: u64, reason: ClientError) -> Option<JoinHandle<()>> {
        let mut session = self.lock_session();
        if session.generation != generation {
            return None;
        }
        if session.state != ConnectionState::Closed {
            info!("Gateway connection closed ({})", reason);
        }
        session.state = ConnectionState::Closed;
        session.outbound = None;
        session.challenge = None;
        session.hello = None;
        for (_, call) in session.pending.drain() {
            let _ = call.reply.send(Err(reason.clone()));
        }
        session.dispatcher.take()
    }
}

/// Single dispatch path for inbound frames of one connection
async fn dispatch(
    inner: Arc<ClientInner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(TransportEvent::Frame(text)) => {
                debug!("Received frame: {}", text);
                if let Err(e) = inner.handle_frame(&text) {
                    warn!("Closing gateway connection: {}", e);
                    break e;
                }
            }
            Some(TransportEvent::Closed(reason)) => {
                if let Some(reason) = reason.filter(|r| !r.is_empty()) {
                    debug!("Gateway closed the connection: {}", reason);
                }
                break ClientError::ConnectionClosed;
            }
            None => break ClientError::ConnectionClosed,
        }
    };
    // Own handle, nothing to abort
    drop(inner.close_session(generation, reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use base64::prelude::*;
    use ed25519_dalek::{Signature, Verifier};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockServer {
        to_client: mpsc::UnboundedSender<TransportEvent>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl MockServer {
        fn send(&self, frame: JsonValue) {
            self.to_client
                .send(TransportEvent::Frame(frame.to_string()))
                .unwrap();
        }

        fn challenge(&self, nonce: Option<&str>) {
            self.send(json!({
                "type": "event",
                "event": "connect.challenge",
                "payload": {"nonce": nonce}
            }));
        }

        async fn next_request(&mut self) -> GatewayRequest {
            let text = self.from_client.recv().await.expect("client frame");
            match serde_json::from_str(&text).unwrap() {
                GatewayFrame::Request(request) => request,
                other => panic!("expected request, got {:?}", other),
            }
        }

        fn respond_ok(&self, id: &str, payload: JsonValue) {
            let frame = GatewayFrame::Response(GatewayResponse::ok(id, payload));
            self.send(serde_json::to_value(frame).unwrap());
        }

        fn respond_err(&self, id: &str, code: &str, message: &str) {
            let frame = GatewayFrame::Response(GatewayResponse::error(
                id,
                ErrorShape::new(code, message),
            ));
            self.send(serde_json::to_value(frame).unwrap());
        }

        fn close(&self) {
            let _ = self.to_client.send(TransportEvent::Closed(None));
        }

        /// Run the server half of a handshake, returning the connect params
        async fn accept(&mut self, nonce: Option<&str>, hello: JsonValue) -> ConnectParams {
            self.challenge(nonce);
            let request = self.next_request().await;
            assert_eq!(request.method, CONNECT_METHOD);
            let params: ConnectParams = serde_json::from_value(request.params).unwrap();
            self.respond_ok(&request.id, hello);
            params
        }
    }

    struct MockConnector {
        opens: AtomicUsize,
        servers: mpsc::UnboundedSender<MockServer>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(&self, _url: &str) -> Result<Transport, ClientError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.servers
                .send(MockServer {
                    to_client: in_tx,
                    from_client: out_rx,
                })
                .map_err(|_| ClientError::Transport("test server gone".to_string()))?;
            Ok(Transport {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    struct Harness {
        client: GatewayClient,
        connector: Arc<MockConnector>,
        servers: mpsc::UnboundedReceiver<MockServer>,
        identity: Arc<DeviceIdentity>,
        tokens: Arc<DeviceAuthStore>,
        _temp: tempfile::TempDir,
    }

    impl Harness {
        fn opens(&self) -> usize {
            self.connector.opens.load(Ordering::SeqCst)
        }

        async fn next_server(&mut self) -> MockServer {
            self.servers.recv().await.expect("transport opened")
        }
    }

    fn harness(configure: impl FnOnce(&mut ClientOptions)) -> Harness {
        let temp = tempfile::tempdir().unwrap();
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            opens: AtomicUsize::new(0),
            servers: servers_tx,
        });
        let identity = Arc::new(DeviceIdentity::generate());
        let tokens = Arc::new(DeviceAuthStore::new(temp.path().join("device-auth.json")));
        let mut options = ClientOptions::new("ws://gateway.test");
        configure(&mut options);
        let client = GatewayClient::new(
            options,
            Arc::clone(&identity),
            Arc::clone(&tokens),
            connector.clone(),
            Arc::new(EventSubscribers::new()),
        );
        Harness {
            client,
            connector,
            servers: servers_rx,
            identity,
            tokens,
            _temp: temp,
        }
    }

    fn hello_ok(device_token: Option<&str>) -> JsonValue {
        let mut hello = json!({"type": "hello-ok", "protocol": PROTOCOL_VERSION});
        if let Some(token) = device_token {
            hello["auth"] = json!({"deviceToken": token, "role": "operator", "scopes": ["operator.admin"]});
        }
        hello
    }

    async fn connected(h: &mut Harness) -> MockServer {
        let client = h.client.clone();
        let connect = tokio::spawn(async move { client.connect().await });
        let mut server = h.next_server().await;
        server.accept(None, hello_ok(None)).await;
        connect.await.unwrap().unwrap();
        server
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_handshake() {
        let mut h = harness(|_| {});
        let client = h.client.clone();
        let mut servers = std::mem::replace(&mut h.servers, mpsc::unbounded_channel().1);

        let server_task = tokio::spawn(async move {
            let mut server = servers.recv().await.unwrap();
            server.accept(Some("n1"), hello_ok(None)).await;
            (server, servers)
        });

        let (first, second) = tokio::join!(client.connect(), client.connect());
        let (_server, _servers) = server_task.await.unwrap();

        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(h.opens(), 1);
        assert_eq!(h.client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_rejection() {
        let mut h = harness(|_| {});
        let client = h.client.clone();
        let mut servers = std::mem::replace(&mut h.servers, mpsc::unbounded_channel().1);

        let server_task = tokio::spawn(async move {
            let mut server = servers.recv().await.unwrap();
            server.challenge(None);
            let request = server.next_request().await;
            server.respond_err(&request.id, ErrorShape::UNAUTHORIZED, "bad token");
            (server, servers)
        });

        let (first, second) = tokio::join!(client.connect(), client.connect());
        let _ = server_task.await.unwrap();

        let expected = Err(ClientError::AuthRejected(
            "UNAUTHORIZED: bad token".to_string(),
        ));
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(h.opens(), 1);
        assert_eq!(h.client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_request_requires_connection() {
        let h = harness(|_| {});
        let result = h.client.send_request("health", json!({})).await;
        assert_eq!(result, Err(ClientError::NotConnected));
        assert_eq!(h.opens(), 0);
        assert_eq!(h.client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_request_resolves_and_gateway_error_is_surfaced() {
        let mut h = harness(|_| {});
        let mut server = connected(&mut h).await;

        let client = h.client.clone();
        let call = tokio::spawn(async move { client.send_request("health", json!({})).await });
        let request = server.next_request().await;
        assert_eq!(request.method, "health");
        server.respond_ok(&request.id, json!({"status": "ok"}));
        assert_eq!(call.await.unwrap(), Ok(json!({"status": "ok"})));

        let client = h.client.clone();
        let call = tokio::spawn(async move { client.send_request("nope", json!({})).await });
        let request = server.next_request().await;
        server.respond_err(&request.id, ErrorShape::INVALID_REQUEST, "unknown method");
        assert_eq!(
            call.await.unwrap(),
            Err(ClientError::Gateway {
                code: ErrorShape::INVALID_REQUEST.to_string(),
                message: "unknown method".to_string(),
            })
        );
        assert!(h.client.is_connected());
    }

    #[tokio::test]
    async fn test_close_rejects_all_pending_calls() {
        let mut h = harness(|_| {});
        let mut server = connected(&mut h).await;

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let client = h.client.clone();
                tokio::spawn(async move { client.send_request("chat.send", json!({"i": i})).await })
            })
            .collect();
        for _ in 0..3 {
            server.next_request().await;
        }
        assert_eq!(h.client.pending_count(), 3);

        server.close();
        for call in calls {
            assert_eq!(call.await.unwrap(), Err(ClientError::ConnectionClosed));
        }
        assert_eq!(h.client.pending_count(), 0);
        assert_eq!(h.client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_call_timeout_keeps_connection_open() {
        let mut h = harness(|o| o.request_timeout = Duration::from_millis(50));
        let mut server = connected(&mut h).await;

        let result = h.client.send_request("status", json!({})).await;
        assert_eq!(
            result,
            Err(ClientError::CallTimeout {
                method: "status".to_string(),
                timeout: Duration::from_millis(50),
            })
        );
        assert_eq!(h.client.pending_count(), 0);
        assert!(h.client.is_connected());

        // A late answer to the timed-out call is dropped
        let late = server.next_request().await;
        server.respond_ok(&late.id, json!({}));

        let client = h.client.clone();
        let call = tokio::spawn(async move { client.send_request("health", json!({})).await });
        let request = server.next_request().await;
        server.respond_ok(&request.id, json!(true));
        assert_eq!(call.await.unwrap(), Ok(json!(true)));
    }

    #[tokio::test]
    async fn test_handshake_timeout_allows_clean_retry() {
        let mut h = harness(|o| o.handshake_timeout = Duration::from_millis(50));

        let client = h.client.clone();
        let attempt = tokio::spawn(async move { client.connect().await });
        let _silent = h.next_server().await;
        assert_eq!(
            attempt.await.unwrap(),
            Err(ClientError::HandshakeTimeout(Duration::from_millis(50)))
        );
        assert_eq!(h.client.state(), ConnectionState::Closed);

        let client = h.client.clone();
        let retry = tokio::spawn(async move { client.connect().await });
        let mut server = h.next_server().await;
        server.accept(None, hello_ok(None)).await;
        assert_eq!(retry.await.unwrap(), Ok(()));
        assert_eq!(h.opens(), 2);
    }

    #[tokio::test]
    async fn test_signed_connect_and_device_token_reuse() {
        let mut h = harness(|o| o.token = Some("static-token".to_string()));

        let client = h.client.clone();
        let connect = tokio::spawn(async move { client.connect().await });
        let mut server = h.next_server().await;
        let params = server.accept(Some("n1"), hello_ok(Some("device-token"))).await;
        connect.await.unwrap().unwrap();

        assert_eq!(params.device.id, h.identity.device_id());
        assert_eq!(params.device.public_key, h.identity.public_key_base64url());
        assert_eq!(params.device.nonce.as_deref(), Some("n1"));
        assert_eq!(params.client.id, CLIENT_ID);
        assert_eq!(params.client.mode, CLIENT_MODE);
        assert_eq!(params.min_protocol, PROTOCOL_VERSION);
        assert_eq!(
            params.auth.as_ref().and_then(|a| a.token.as_deref()),
            Some("static-token")
        );

        let scopes: BTreeSet<String> = params.scopes.iter().cloned().collect();
        let signed = DeviceAuthPayload {
            device_id: &params.device.id,
            client_id: &params.client.id,
            client_mode: &params.client.mode,
            role: &params.role,
            scopes: &scopes,
            signed_at_ms: params.device.signed_at,
            token: Some("static-token"),
            nonce: params.device.nonce.as_deref(),
        }
        .build();
        assert!(signed.starts_with("v2|"));
        assert!(signed.ends_with("|n1"));
        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(&params.device.signature)
            .unwrap();
        let signature = Signature::from_slice(&signature).unwrap();
        assert!(h
            .identity
            .verifying_key()
            .verify(signed.as_bytes(), &signature)
            .is_ok());

        let stored = h.tokens.load(h.identity.device_id(), "operator").unwrap();
        assert_eq!(stored.token, "device-token");

        h.client.disconnect();
        assert_eq!(h.client.state(), ConnectionState::Closed);

        let client = h.client.clone();
        let reconnect = tokio::spawn(async move { client.connect().await });
        let mut server = h.next_server().await;
        let params = server.accept(None, hello_ok(None)).await;
        reconnect.await.unwrap().unwrap();
        assert_eq!(
            params.auth.and_then(|a| a.token),
            Some("device-token".to_string())
        );
        assert!(params.device.nonce.is_none());
    }

    #[tokio::test]
    async fn test_empty_nonce_signs_v1_payload() {
        let mut h = harness(|_| {});
        let client = h.client.clone();
        let connect = tokio::spawn(async move { client.connect().await });
        let mut server = h.next_server().await;
        let params = server.accept(Some(""), hello_ok(None)).await;
        connect.await.unwrap().unwrap();

        assert!(params.device.nonce.is_none());
        let scopes: BTreeSet<String> = params.scopes.iter().cloned().collect();
        let signed = DeviceAuthPayload {
            device_id: &params.device.id,
            client_id: &params.client.id,
            client_mode: &params.client.mode,
            role: &params.role,
            scopes: &scopes,
            signed_at_ms: params.device.signed_at,
            token: None,
            nonce: None,
        }
        .build();
        assert!(signed.starts_with("v1|"));
        assert!(!signed.ends_with('|'));
        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(&params.device.signature)
            .unwrap();
        let signature = Signature::from_slice(&signature).unwrap();
        assert!(h
            .identity
            .verifying_key()
            .verify(signed.as_bytes(), &signature)
            .is_ok());
    }

    #[tokio::test]
    async fn test_connect_requires_hello_ok_payload() {
        let mut h = harness(|_| {});
        for payload in [json!({"status": "ok"}), JsonValue::Null] {
            let client = h.client.clone();
            let connect = tokio::spawn(async move { client.connect().await });
            let mut server = h.next_server().await;
            server.challenge(Some("n1"));
            let request = server.next_request().await;
            assert_eq!(request.method, CONNECT_METHOD);
            server.respond_ok(&request.id, payload);

            let result = connect.await.unwrap();
            assert!(matches!(result, Err(ClientError::Protocol(_))));
            assert_eq!(h.client.state(), ConnectionState::Closed);
        }
        assert_eq!(h.opens(), 2);
    }

    #[tokio::test]
    async fn test_superseded_connect_does_not_release_newer_handshake() {
        let mut h = harness(|_| {});
        let client = h.client.clone();

        let stale = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        let _stale_server = h.next_server().await;
        client.disconnect();

        // Start the replacement handshake before the stale one has finished
        let mut current = Box::pin(client.connect());
        assert!(futures::poll!(current.as_mut()).is_pending());
        assert_eq!(h.opens(), 2);

        assert_eq!(stale.await.unwrap(), Err(ClientError::ConnectionClosed));

        let mut joined = Box::pin(client.connect());
        assert!(futures::poll!(joined.as_mut()).is_pending());
        assert_eq!(h.opens(), 2);

        let mut server = h.next_server().await;
        let (current, joined, _) =
            tokio::join!(current, joined, server.accept(None, hello_ok(None)));
        assert_eq!(current, Ok(()));
        assert_eq!(joined, Ok(()));
        assert_eq!(h.opens(), 2);
        assert!(h.client.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_stored_token_is_cleared() {
        let mut h = harness(|_| {});
        h.tokens
            .store(h.identity.device_id(), "operator", "stale", ["operator.admin"])
            .unwrap();

        let client = h.client.clone();
        let connect = tokio::spawn(async move { client.connect().await });
        let mut server = h.next_server().await;
        server.challenge(Some("n2"));
        let request = server.next_request().await;
        server.respond_err(&request.id, ErrorShape::UNAUTHORIZED, "token mismatch");

        assert!(matches!(
            connect.await.unwrap(),
            Err(ClientError::AuthRejected(_))
        ));
        assert!(h.tokens.load(h.identity.device_id(), "operator").is_none());
    }

    #[tokio::test]
    async fn test_events_reach_subscribers_but_not_the_challenge() {
        let mut h = harness(|_| {});
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        h.client.subscribe(crate::events::ANY_EVENT, move |event, payload| {
            log.lock()
                .unwrap()
                .push(format!("{}={}", event, payload));
        });

        let mut server = connected(&mut h).await;
        server.send(json!({"type": "event", "event": "presence", "payload": {"n": 1}}));
        server.send(json!({"type": "event", "event": "tick", "seq": 2}));

        // A round trip after the events guarantees they were dispatched
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.send_request("health", json!({})).await });
        let request = server.next_request().await;
        server.respond_ok(&request.id, json!({}));
        call.await.unwrap().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["presence={\"n\":1}".to_string(), "tick=null".to_string()]
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let mut h = harness(|_| {});
        let mut server = connected(&mut h).await;

        let client = h.client.clone();
        let call = tokio::spawn(async move { client.send_request("health", json!({})).await });
        server.next_request().await;
        server
            .to_client
            .send(TransportEvent::Frame("{not json".to_string()))
            .unwrap();

        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::Protocol(_))
        ));
        assert_eq!(h.client.state(), ConnectionState::Closed);
    }
}
