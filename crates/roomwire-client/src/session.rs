//! Room session: membership, pub/sub and RPC for one room over a [`Client`].
//!
//! A session joins its room once, then keeps the membership alive across
//! reconnects by re-joining under the same user id. Server-side registrations
//! do not survive a reconnect; re-register from `on_joined`.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use roomwire_core::events::{self, INVOKE, IS_MASTER, ROOM_JOINED};
use roomwire_core::protocol::{InvokeRequest, RpcOutcome};
use roomwire_core::{InvokePolicy, ProtocolError, RpcError, UserId};
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::client::{Client, ConnectionState, ListenerId};
use crate::error::ClientError;

type RpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
type MasterCallback = Arc<dyn Fn() + Send + Sync>;
type JoinedCallback = Arc<dyn Fn(UserId) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Identity to join as; the server mints one when absent.
    pub user_id: Option<UserId>,
    on_master: Option<MasterCallback>,
    on_joined: Option<JoinedCallback>,
}

impl SessionOptions {
    #[must_use]
    /// Join as `user_id`; a blank id leaves the choice to the server.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = UserId::parse(user_id).ok();
        self
    }

    /// Called on every `isMaster` notification for this session.
    #[must_use]
    pub fn on_master<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_master = Some(Arc::new(f));
        self
    }

    /// Called after the initial join and after every rejoin.
    #[must_use]
    pub fn on_joined<F>(mut self, f: F) -> Self
    where
        F: Fn(UserId) + Send + Sync + 'static,
    {
        self.on_joined = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("user_id", &self.user_id)
            .field("on_master", &self.on_master.is_some())
            .field("on_joined", &self.on_joined.is_some())
            .finish()
    }
}

/// Local RPC handlers. A registration awaiting the server's verdict is
/// staged; it answers calls only when no accepted handler of that name exists.
#[derive(Default)]
struct FunctionTable {
    live: HashMap<String, RpcHandler>,
    staged: HashMap<String, (u64, RpcHandler)>,
    next_token: u64,
}

impl FunctionTable {
    fn stage(&mut self, name: &str, handler: RpcHandler) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.staged.insert(name.to_string(), (token, handler));
        token
    }

    fn commit(&mut self, name: &str, token: u64, handler: RpcHandler) {
        self.discard(name, token);
        self.live.insert(name.to_string(), handler);
    }

    fn discard(&mut self, name: &str, token: u64) {
        if self.staged.get(name).is_some_and(|(t, _)| *t == token) {
            self.staged.remove(name);
        }
    }

    fn lookup(&self, name: &str) -> Option<RpcHandler> {
        self.live
            .get(name)
            .or_else(|| self.staged.get(name).map(|(_, h)| h))
            .cloned()
    }

    fn remove(&mut self, name: &str) {
        self.live.remove(name);
        self.staged.remove(name);
    }

    fn clear(&mut self) {
        self.live.clear();
        self.staged.clear();
    }
}

struct SessionInner {
    client: Client,
    room: String,
    user_id: Mutex<Option<UserId>>,
    is_master: AtomicBool,
    joined: AtomicBool,
    left: AtomicBool,
    functions: Mutex<FunctionTable>,
    /// Every listener this session attached: control events and subscriptions.
    listeners: Mutex<Vec<(String, ListenerId)>>,
    reconnect_hook: Mutex<Option<ListenerId>>,
    join_waiter: Mutex<Option<oneshot::Sender<UserId>>>,
    on_master: Option<MasterCallback>,
    on_joined: Option<JoinedCallback>,
}

impl SessionInner {
    fn event(&self, suffix: &str) -> String {
        events::scoped(&self.room, suffix)
    }

    fn ensure_active(&self) -> Result<(), ClientError> {
        if self.left.load(Ordering::Acquire) {
            return Err(ClientError::Left);
        }
        Ok(())
    }

    fn detach(&self) {
        for (event, id) in self.listeners.lock().drain(..) {
            self.client.off(&event, id);
        }
        if let Some(id) = self.reconnect_hook.lock().take() {
            self.client.off_reconnect(id);
        }
        self.functions.lock().clear();
    }

    fn join_payload(&self) -> Value {
        match self.user_id.lock().as_ref() {
            Some(uid) => json!({ "room": self.room, "userId": uid }),
            None => json!({ "room": self.room }),
        }
    }

    fn on_room_joined(&self, data: Value) {
        let Some(uid) = data.as_str().and_then(|raw| UserId::parse(raw).ok()) else {
            warn!(room = %self.room, "roomJoined without user id");
            return;
        };
        *self.user_id.lock() = Some(uid.clone());
        self.joined.store(true, Ordering::Release);
        info!(room = %self.room, user_id = %uid, "joined room");

        if let Some(tx) = self.join_waiter.lock().take() {
            let _ = tx.send(uid.clone());
        }
        if let Some(cb) = &self.on_joined {
            cb(uid);
        }
    }

    fn on_is_master(&self) {
        self.is_master.store(true, Ordering::Release);
        info!(room = %self.room, "became master");
        if let Some(cb) = &self.on_master {
            cb();
        }
    }

    fn on_invoke(&self, data: Value) {
        let req: InvokeRequest = match serde_json::from_value(data) {
            Ok(req) => req,
            Err(e) => {
                warn!(room = %self.room, error = %e, "malformed invoke");
                return;
            }
        };
        let handler = self.functions.lock().lookup(&req.name);
        let client = self.client.clone();
        let result_event = events::result(&self.room, &req.call_id);

        tokio::spawn(async move {
            let outcome = match handler {
                // Run on its own task so a panicking handler still answers.
                Some(handler) => match tokio::spawn(handler(req.params)).await {
                    Ok(Ok(value)) => RpcOutcome::Ok(value),
                    Ok(Err(message)) => RpcOutcome::Err(message),
                    Err(e) => RpcOutcome::Err(format!("Function {} failed: {e}", req.name)),
                },
                None => RpcOutcome::Err(RpcError::not_registered(&req.name).to_string()),
            };
            debug!(function = %req.name, call_id = %req.call_id, ok = outcome.is_ok(), "answering call");
            if let Err(e) = client.emit(&result_event, outcome.to_value()) {
                warn!(call_id = %req.call_id, error = %e, "could not send call result");
            }
        });
    }

    fn on_reconnect(&self) {
        if self.left.load(Ordering::Acquire) || !self.joined.load(Ordering::Acquire) {
            return;
        }
        self.is_master.store(false, Ordering::Release);
        info!(room = %self.room, "rejoining after reconnect");
        if let Err(e) = self.client.emit(events::JOIN, self.join_payload()) {
            warn!(room = %self.room, error = %e, "rejoin failed");
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.detach();
    }
}

/// A joined room. Cloning shares the same membership.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Join `room` and wait for the server to confirm.
    pub async fn join(
        client: &Client,
        room: impl Into<String>,
        options: SessionOptions,
    ) -> Result<Session, ClientError> {
        let inner = Arc::new(SessionInner {
            client: client.clone(),
            room: room.into(),
            user_id: Mutex::new(options.user_id),
            is_master: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            left: AtomicBool::new(false),
            functions: Mutex::new(FunctionTable::default()),
            listeners: Mutex::new(Vec::new()),
            reconnect_hook: Mutex::new(None),
            join_waiter: Mutex::new(None),
            on_master: options.on_master,
            on_joined: options.on_joined,
        });
        let session = Session { inner };
        session.attach_control_listeners();

        let (tx, rx) = oneshot::channel();
        *session.inner.join_waiter.lock() = Some(tx);
        client.emit(events::JOIN, session.inner.join_payload())?;

        let mut states = client.state_changes();
        let confirmed = async {
            tokio::select! {
                uid = rx => uid.map_err(|_| ClientError::Disconnected),
                _ = link_lost(&mut states) => Err(ClientError::Disconnected),
            }
        };
        match client.request_timeout() {
            Some(limit) => tokio::time::timeout(limit, confirmed)
                .await
                .map_err(|_| ClientError::Timeout(limit))??,
            None => confirmed.await?,
        };
        Ok(session)
    }

    fn attach_control_listeners(&self) {
        let inner = &self.inner;
        let mut attached = Vec::new();

        let weak = Arc::downgrade(inner);
        let event = inner.event(IS_MASTER);
        let id = inner.client.on(event.clone(), move |_| {
            with_active(&weak, |s| s.on_is_master());
        });
        attached.push((event, id));

        let weak = Arc::downgrade(inner);
        let event = inner.event(ROOM_JOINED);
        let id = inner.client.on(event.clone(), move |data| {
            with_active(&weak, |s| s.on_room_joined(data));
        });
        attached.push((event, id));

        let weak = Arc::downgrade(inner);
        let event = inner.event(INVOKE);
        let id = inner.client.on(event.clone(), move |data| {
            with_active(&weak, |s| s.on_invoke(data));
        });
        attached.push((event, id));

        inner.listeners.lock().extend(attached);

        let weak = Arc::downgrade(inner);
        let hook = inner.client.on_reconnect(move || {
            with_active(&weak, |s| s.on_reconnect());
        });
        *inner.reconnect_hook.lock() = Some(hook);
    }

    pub fn room(&self) -> &str {
        &self.inner.room
    }

    /// User id confirmed by the server.
    pub fn user_id(&self) -> Option<UserId> {
        self.inner.user_id.lock().clone()
    }

    pub fn is_master(&self) -> bool {
        self.inner.is_master.load(Ordering::Acquire)
    }

    pub fn has_left(&self) -> bool {
        self.inner.left.load(Ordering::Acquire)
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Broadcast `params` as `<room>.<event>` to the other members, and to
    /// this session too when `include_self` is set. Control event names are
    /// refused before anything is sent.
    pub fn publish(&self, event: &str, params: Value, include_self: bool) -> Result<(), ClientError> {
        self.inner.ensure_active()?;
        if events::is_reserved(event) {
            return Err(ProtocolError::ReservedEvent(event.to_string()).into());
        }
        self.inner.client.emit(
            &self.inner.event(events::PUBLISH),
            json!({ "name": event, "params": params, "self": include_self }),
        )
    }

    /// Listen for `<room>.<event>`. Local listeners survive reconnects.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Result<Subscription, ClientError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner.ensure_active()?;
        let scoped = self.inner.event(event);
        let id = self.inner.client.on(scoped.clone(), handler);
        self.inner.listeners.lock().push((scoped.clone(), id));
        Ok(Subscription {
            session: Arc::downgrade(&self.inner),
            event: scoped,
            id,
        })
    }

    /// Expose `handler` as `name` under the `single` policy.
    pub async fn register<F, Fut, E>(&self, name: &str, handler: F) -> Result<Registration, ClientError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display + 'static,
    {
        self.register_with_policy(name, InvokePolicy::default(), handler)
            .await
    }

    /// Expose `handler` as `name` in this room. Resolves once the server has
    /// accepted the registration.
    pub async fn register_with_policy<F, Fut, E>(
        &self,
        name: &str,
        policy: InvokePolicy,
        handler: F,
    ) -> Result<Registration, ClientError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display + 'static,
    {
        self.inner.ensure_active()?;
        let wrapped: RpcHandler = Arc::new(move |params| {
            handler(params)
                .map(|result| result.map_err(|e| e.to_string()))
                .boxed()
        });
        let token = self
            .inner
            .functions
            .lock()
            .stage(name, Arc::clone(&wrapped));

        let ack = self
            .inner
            .client
            .emit_with_ack(
                &self.inner.event(events::REGISTER),
                json!({ "name": name, "invoke": policy }),
            )
            .await;

        match ack.and_then(parse_outcome) {
            Ok(_) => {
                self.inner.functions.lock().commit(name, token, wrapped);
                debug!(room = %self.inner.room, function = name, %policy, "registered");
                Ok(Registration {
                    session: self.clone(),
                    name: name.to_string(),
                })
            }
            Err(e) => {
                self.inner.functions.lock().discard(name, token);
                Err(e)
            }
        }
    }

    /// Withdraw this session's registration of `name`.
    pub async fn unregister(&self, name: &str) -> Result<(), ClientError> {
        self.inner.ensure_active()?;
        self.inner.functions.lock().remove(name);
        let ack = self
            .inner
            .client
            .emit_with_ack(&self.inner.event(events::UNREGISTER), json!({ "name": name }))
            .await?;
        parse_outcome(ack).map(|_| ())
    }

    /// Invoke `name` somewhere in the room. Failures reported by the server
    /// or the remote handler arrive as [`ClientError::Remote`] with their
    /// text unchanged.
    pub async fn call(&self, name: &str, params: Value) -> Result<Value, ClientError> {
        self.inner.ensure_active()?;
        let ack = self
            .inner
            .client
            .emit_with_ack(
                &self.inner.event(events::CALL),
                json!({ "name": name, "params": params }),
            )
            .await?;
        parse_outcome(ack)
    }

    /// Leave the room. Detaches every listener and local function; all
    /// further operations on this session fail with [`ClientError::Left`].
    pub fn leave(&self) -> Result<(), ClientError> {
        if self.inner.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.detach();
        self.inner.is_master.store(false, Ordering::Release);
        info!(room = %self.inner.room, "leaving room");
        match self
            .inner
            .client
            .emit(&self.inner.event(events::LEAVE), Value::Null)
        {
            // The server drops membership on disconnect anyway.
            Ok(()) | Err(ClientError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("room", &self.inner.room)
            .field("user_id", &self.user_id())
            .field("is_master", &self.is_master())
            .field("left", &self.has_left())
            .finish()
    }
}

/// Handle for one `subscribe` listener.
pub struct Subscription {
    session: Weak<SessionInner>,
    event: String,
    id: ListenerId,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Detach exactly this listener.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.session.upgrade() {
            inner
                .listeners
                .lock()
                .retain(|(event, id)| !(event == &self.event && *id == self.id));
            inner.client.off(&self.event, self.id);
        }
    }
}

/// Handle for one accepted `register`.
pub struct Registration {
    session: Session,
    name: String,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn unregister(self) -> Result<(), ClientError> {
        self.session.unregister(&self.name).await
    }
}

fn with_active(weak: &Weak<SessionInner>, f: impl FnOnce(&SessionInner)) {
    if let Some(inner) = weak.upgrade() {
        if !inner.left.load(Ordering::Acquire) {
            f(&inner);
        }
    }
}

fn parse_outcome(ack: Value) -> Result<Value, ClientError> {
    let outcome: RpcOutcome = serde_json::from_value(ack)?;
    outcome.into_result().map_err(ClientError::Remote)
}

/// Resolves once the link is no longer connected.
async fn link_lost(states: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *states.borrow_and_update() != ConnectionState::Connected {
            return;
        }
        if states.changed().await.is_err() {
            return;
        }
    }
}
