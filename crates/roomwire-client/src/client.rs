//! Event client over a reconnecting transport.
//!
//! [`Client`] is a cheap, cloneable handle. All I/O happens on one background
//! transport loop that owns the live [`Transport`], dispatches inbound events
//! to listeners registered with [`Client::on`], settles acknowledgements and
//! re-dials through the [`Connector`] when the link drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use roomwire_core::protocol::Frame;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::reconnect::ReconnectPolicy;
use crate::transport::{Connector, Transport, WsConnector};

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;
pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Identifies one registered listener or reconnect hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    /// Terminal: shut down, or reconnection gave up.
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub reconnect: ReconnectPolicy,
    /// Bound on waiting for an acknowledgement; `None` waits until the
    /// link drops.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

enum Command {
    Send(String),
    Shutdown,
}

struct Shared {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, EventHandler)>>>,
    reconnect_hooks: Mutex<Vec<(ListenerId, ReconnectHook)>>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn dispatch(&self, event: &str, data: Value) {
        let handlers: Vec<EventHandler> = self
            .listeners
            .lock()
            .get(event)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(event, "no listener for event");
            return;
        }
        for handler in handlers {
            handler(data.clone());
        }
    }

    fn settle_ack(&self, id: u64, data: Value) {
        match self.pending_acks.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => debug!(ack_id = id, "ack for unknown request"),
        }
    }

    /// Drop every waiting request; their futures resolve as disconnected.
    fn fail_pending(&self) {
        let dropped = std::mem::take(&mut *self.pending_acks.lock());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "failing pending requests");
        }
    }

    /// Leave `Connected` before failing waiters: a request registered after
    /// this point fails its own connectivity check instead of being stranded.
    fn begin_reconnect(&self) {
        self.set_state(ConnectionState::Reconnecting);
        self.fail_pending();
    }

    fn fire_reconnect(&self) {
        let hooks: Vec<ReconnectHook> = self
            .reconnect_hooks
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for hook in hooks {
            hook();
        }
    }
}

#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    config: Arc<ClientConfig>,
}

impl Client {
    /// Dial `url` and start the transport loop.
    pub async fn connect_ws(url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        Self::connect(Arc::new(WsConnector::new(url)), config).await
    }

    /// Open the first transport through `connector`, then start the loop.
    /// Later reconnects use the same connector.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let transport = connector.connect().await?;
        Ok(Self::start(transport, connector, config))
    }

    /// Start the loop on an already-open transport.
    pub fn start(
        transport: Box<dyn Transport>,
        connector: Arc<dyn Connector>,
        config: ClientConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let shared = Arc::new(Shared {
            listeners: Mutex::new(HashMap::new()),
            reconnect_hooks: Mutex::new(Vec::new()),
            pending_acks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(transport_loop(
            transport,
            connector,
            config.reconnect.clone(),
            cmd_rx,
            Arc::clone(&shared),
        ));
        *shared.task.lock() = Some(task);

        Self {
            cmd_tx,
            shared,
            config: Arc::new(config),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        let text = frame.encode()?;
        self.cmd_tx
            .send(Command::Send(text))
            .map_err(|_| ClientError::Disconnected)
    }

    /// Fire-and-forget event.
    pub fn emit(&self, event: &str, data: Value) -> Result<(), ClientError> {
        self.send_frame(&Frame::event(event, data))
    }

    /// Send an event and wait for the server's acknowledgement payload.
    pub async fn emit_with_ack(&self, event: &str, data: Value) -> Result<Value, ClientError> {
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending_acks.lock().insert(id, tx);

        if let Err(e) = self.send_frame(&Frame::request(event, data, id)) {
            self.shared.pending_acks.lock().remove(&id);
            return Err(e);
        }

        match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received.map_err(|_| ClientError::Disconnected),
                Err(_) => {
                    self.shared.pending_acks.lock().remove(&id);
                    Err(ClientError::Timeout(limit))
                }
            },
            None => rx.await.map_err(|_| ClientError::Disconnected),
        }
    }

    /// Register `handler` for `event`. Handlers run on the transport loop
    /// and must not block.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_id());
        self.shared
            .listeners
            .lock()
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one listener. Returns whether it was registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let Some(handlers) = listeners.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.shared
            .listeners
            .lock()
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Run `hook` every time the link is re-established.
    pub fn on_reconnect<F>(&self, hook: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_id());
        self.shared.reconnect_hooks.lock().push((id, Arc::new(hook)));
        id
    }

    pub fn off_reconnect(&self, id: ListenerId) -> bool {
        let mut hooks = self.shared.reconnect_hooks.lock();
        let before = hooks.len();
        hooks.retain(|(hid, _)| *hid != id);
        hooks.len() != before
    }

    /// Close the link and stop the loop. Pending requests fail with
    /// `Disconnected`.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let task = self.shared.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                warn!("transport loop did not exit in time; aborting");
                task.abort();
            }
        }
        self.shared.set_state(ConnectionState::Closed);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .finish()
    }
}

enum Exit {
    Shutdown,
    Dropped(String),
}

async fn transport_loop(
    mut transport: Box<dyn Transport>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    debug!("transport loop started");
    loop {
        match run_link(transport.as_mut(), &mut cmd_rx, &shared).await {
            Exit::Shutdown => {
                let _ = transport.close().await;
                break;
            }
            Exit::Dropped(reason) => {
                warn!(reason = %reason, "connection lost");
                shared.begin_reconnect();

                let Some(next) = redial(connector.as_ref(), &policy, &mut cmd_rx).await else {
                    break;
                };
                transport = next;

                // Frames queued while the link was down target the old
                // connection's room state; drop them so rejoin goes first.
                let mut shutdown = false;
                while let Ok(cmd) = cmd_rx.try_recv() {
                    if matches!(cmd, Command::Shutdown) {
                        shutdown = true;
                    }
                }
                shared.fail_pending();
                if shutdown {
                    let _ = transport.close().await;
                    break;
                }

                info!("reconnected");
                shared.set_state(ConnectionState::Connected);
                shared.fire_reconnect();
            }
        }
    }
    shared.fail_pending();
    shared.set_state(ConnectionState::Closed);
    debug!("transport loop exited");
}

async fn run_link(
    transport: &mut dyn Transport,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shared: &Shared,
) -> Exit {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if let Err(e) = transport.send(text).await {
                        return Exit::Dropped(e.to_string());
                    }
                }
                Some(Command::Shutdown) | None => return Exit::Shutdown,
            },
            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => handle_incoming(shared, &text),
                Some(Err(e)) => return Exit::Dropped(e.to_string()),
                None => return Exit::Dropped("closed by server".into()),
            },
        }
    }
}

fn handle_incoming(shared: &Shared, text: &str) {
    match Frame::decode(text, false) {
        Ok(Frame::Event { event, data, .. }) => shared.dispatch(&event, data),
        Ok(Frame::Ack { id, data }) => shared.settle_ack(id, data),
        Err(e) => warn!(error = %e, "dropping malformed frame"),
    }
}

async fn redial(
    connector: &dyn Connector,
    policy: &ReconnectPolicy,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> Option<Box<dyn Transport>> {
    let mut attempt = 0;
    while policy.allows(attempt) {
        let sleep = tokio::time::sleep(policy.delay(attempt));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send(_)) => debug!("dropping frame while disconnected"),
                    Some(Command::Shutdown) | None => return None,
                },
            }
        }

        match connector.connect().await {
            Ok(transport) => return Some(transport),
            Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
        }
        attempt += 1;
    }
    warn!(attempts = attempt, "giving up on reconnection");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelConnector, ChannelTransport};
    use serde_json::json;

    /// Client wired to an in-memory server end.
    fn client_with(config: ClientConfig) -> (Client, ChannelTransport, mpsc::UnboundedSender<ChannelTransport>) {
        let (connector, queue) = ChannelConnector::new();
        let (client_end, server_end) = ChannelTransport::pair();
        let client = Client::start(Box::new(client_end), Arc::new(connector), config);
        (client, server_end, queue)
    }

    fn fast_reconnect() -> ClientConfig {
        ClientConfig::default().with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
            ..ReconnectPolicy::default()
        })
    }

    async fn next_frame(server: &mut ChannelTransport) -> Frame {
        let text = server.recv().await.unwrap().unwrap();
        Frame::decode(&text, false).unwrap()
    }

    #[tokio::test]
    async fn emit_reaches_server() {
        let (client, mut server, _q) = client_with(ClientConfig::default());
        client.emit("test.publish", json!({"name": "x"})).unwrap();
        assert_eq!(
            next_frame(&mut server).await,
            Frame::event("test.publish", json!({"name": "x"}))
        );
    }

    #[tokio::test]
    async fn listeners_receive_events() {
        let (client, mut server, _q) = client_with(ClientConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on("test.ping", move |data| {
            let _ = tx.send(data);
        });

        server
            .send(Frame::event("test.ping", json!(1)).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn off_detaches_only_that_listener() {
        let (client, _server, _q) = client_with(ClientConfig::default());
        let a = client.on("evt", |_| {});
        let _b = client.on("evt", |_| {});
        assert_eq!(client.listener_count("evt"), 2);
        assert!(client.off("evt", a));
        assert!(!client.off("evt", a));
        assert_eq!(client.listener_count("evt"), 1);
    }

    #[tokio::test]
    async fn ack_settles_request() {
        let (client, mut server, _q) = client_with(ClientConfig::default());
        let requester = client.clone();
        let call = tokio::spawn(async move {
            requester
                .emit_with_ack("test.register", json!({"name": "f"}))
                .await
        });

        let Frame::Event { ack: Some(id), .. } = next_frame(&mut server).await else {
            panic!("expected request frame");
        };
        server
            .send(Frame::ack(id, json!({"ok": true})).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timeout() {
        let (client, _server, _q) =
            client_with(ClientConfig::default().with_request_timeout(Duration::from_secs(1)));
        let err = client.emit_with_ack("test.call", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn reconnect_fails_waiters_before_accepting_requests() {
        let (client, _server, _q) = client_with(ClientConfig::default());
        let (tx, rx) = oneshot::channel();
        client.shared.pending_acks.lock().insert(99, tx);

        client.shared.begin_reconnect();
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert!(rx.await.is_err());

        let err = client.emit_with_ack("x", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClientError::Disconnected));
        assert!(client.shared.pending_acks.lock().is_empty());
    }

    #[tokio::test]
    async fn request_queued_while_down_is_failed_after_redial() {
        let (client, server, queue) = client_with(fast_reconnect());
        let mut states = client.state_changes();
        drop(server);
        while *states.borrow_and_update() != ConnectionState::Reconnecting {
            states.changed().await.unwrap();
        }

        // A request that registered its ack and queued its frame just as the
        // link went down.
        let (tx, rx) = oneshot::channel();
        client.shared.pending_acks.lock().insert(7, tx);
        let stale = Frame::request("stale", Value::Null, 7).encode().unwrap();
        client.cmd_tx.send(Command::Send(stale)).ok();

        let (next_client_end, mut next_server) = ChannelTransport::pair();
        queue.send(next_client_end).ok();

        assert!(tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .is_err());
        while *states.borrow_and_update() != ConnectionState::Connected {
            states.changed().await.unwrap();
        }
        client.emit("fresh", Value::Null).unwrap();
        assert_eq!(next_frame(&mut next_server).await, Frame::event("fresh", Value::Null));
    }

    #[tokio::test]
    async fn drop_fails_pending_and_reconnects() {
        let (client, mut server, queue) = client_with(fast_reconnect());
        let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
        client.on_reconnect(move || {
            let _ = hook_tx.send(());
        });

        let requester = client.clone();
        let pending = tokio::spawn(async move { requester.emit_with_ack("x", Value::Null).await });
        // The request is on the wire, so its ack is registered.
        next_frame(&mut server).await;

        let (next_client_end, mut next_server) = ChannelTransport::pair();
        queue.send(next_client_end).ok();
        drop(server);

        assert!(matches!(
            pending.await.unwrap(),
            Err(ClientError::Disconnected)
        ));
        hook_rx.recv().await.unwrap();
        assert!(client.is_connected());

        client.emit("after", Value::Null).unwrap();
        assert_eq!(next_frame(&mut next_server).await, Frame::event("after", Value::Null));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let config = ClientConfig::default().with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: Some(2),
            jitter_factor: 0.0,
            ..ReconnectPolicy::default()
        });
        let (client, server, _queue) = client_with(config);
        let mut states = client.state_changes();
        drop(server);

        while *states.borrow_and_update() != ConnectionState::Closed {
            states.changed().await.unwrap();
        }
        assert!(matches!(
            client.emit("x", Value::Null),
            Err(ClientError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn shutdown_closes() {
        let (client, mut server, _q) = client_with(ClientConfig::default());
        client.shutdown().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(server.recv().await.is_none());
    }
}
