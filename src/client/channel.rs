//! Channel lifecycle tracking and the typed handles users hold.
//!
//! Every channel the context creates is backed by a [`ChannelShared`]
//! record in the registry. The record owns the connection state machine:
//!
//! ```text
//!  NEVER_CONNECTED --create reply ok--> CONNECTED
//!  CONNECTED       --circuit death / server disconnect--> DISCONNECTED
//!  DISCONNECTED    --re-search succeeds--> CONNECTED
//!  any             --close()--> CLOSED (terminal)
//! ```
//!
//! Connection and access-rights listeners hang off the record and are
//! fanned out from a per-channel dispatch task, so events for one channel
//! arrive in order no matter which network task produced them. An explicit
//! close is quiet: it never emits a disconnect event.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::{
    client::{
        circuit::CircuitKey,
        context::Shared,
        monitor::Monitor,
        requests::{RequestFailure, RequestKind, RequestResult},
    },
    dbr::{CaType, Dbr, DbrBasicType, DbrCategory, DbrType},
    messages::{self, AccessRights, ErrorCondition, Message, MonitorMask},
};

/// Where a channel is in its lifecycle. `Closed` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    NeverConnected,
    Connected,
    Disconnected,
    Closed,
}

/// Errors surfaced through the channel facade
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Channel is not connected")]
    Disconnected,
    #[error("Channel has been closed")]
    Closed,
    #[error("Context has been shut down")]
    ContextClosed,
    #[error("{condition}: {message}")]
    Status {
        condition: ErrorCondition,
        message: String,
    },
    #[error("Value cannot be represented as the requested type")]
    BadType,
    #[error("Invalid usage: {0}")]
    Usage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RequestFailure> for ClientError {
    fn from(failure: RequestFailure) -> Self {
        ClientError::Status {
            condition: failure.condition,
            message: failure.message,
        }
    }
}

/// The native type and element count a server reported for a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelProperties {
    pub native_type_code: u16,
    pub native_element_count: u32,
    pub native_type: &'static str,
}

/// Events fanned out to channel listeners, in per-channel FIFO order
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ChannelEvent {
    Connection(bool),
    Rights(AccessRights),
}

type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;
type RightsCallback = Arc<dyn Fn(AccessRights) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    next_id: u32,
    connection: Vec<(u32, ConnectionCallback)>,
    rights: Vec<(u32, RightsCallback)>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ListenerKind {
    Connection,
    Rights,
}

/// Disposer handle for a registered listener.
///
/// Dropping the handle does not remove the listener; call [`Listener::close`]
/// to unregister. Closing twice is a no-op.
pub struct Listener {
    channel: Weak<ChannelShared>,
    id: u32,
    kind: ListenerKind,
    closed: AtomicBool,
}

impl Listener {
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let mut listeners = channel.listeners.lock().unwrap();
        match self.kind {
            ListenerKind::Connection => listeners.connection.retain(|(id, _)| *id != self.id),
            ListenerKind::Rights => listeners.rights.retain(|(id, _)| *id != self.id),
        }
    }
}

struct ChannelStateInner {
    connection_state: ConnectionState,
    access_rights: AccessRights,
    server_id: u32,
    native_type: Option<DbrBasicType>,
    native_count: u32,
    circuit: Option<CircuitKey>,
}

/// The registry-side record backing one channel
pub(crate) struct ChannelShared {
    pub cid: u32,
    pub name: String,
    pub priority: u16,
    state: Mutex<ChannelStateInner>,
    pub state_watch: watch::Sender<ConnectionState>,
    /// Taken (and thereby closed) when the channel enters CLOSED, which
    /// ends the dispatch task
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    listeners: Mutex<ListenerSet>,
}

impl ChannelShared {
    fn send_event(&self, event: ChannelEvent) {
        if let Some(sender) = &*self.events.lock().unwrap() {
            let _ = sender.send(event);
        }
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection_state
    }

    pub(crate) fn access_rights(&self) -> AccessRights {
        self.state.lock().unwrap().access_rights
    }

    /// The server's id for this channel. Zero unless connected.
    pub(crate) fn server_id(&self) -> u32 {
        let state = self.state.lock().unwrap();
        match state.connection_state {
            ConnectionState::Connected => state.server_id,
            _ => 0,
        }
    }

    pub(crate) fn native_type(&self) -> Option<DbrBasicType> {
        let state = self.state.lock().unwrap();
        match state.connection_state {
            ConnectionState::Connected => state.native_type,
            _ => None,
        }
    }

    pub(crate) fn native_count(&self) -> u32 {
        let state = self.state.lock().unwrap();
        match state.connection_state {
            ConnectionState::Connected => state.native_count,
            _ => 0,
        }
    }

    /// The circuit currently hosting this channel, while connected
    pub(crate) fn circuit(&self) -> Option<CircuitKey> {
        let state = self.state.lock().unwrap();
        match state.connection_state {
            ConnectionState::Connected => state.circuit,
            _ => None,
        }
    }

    /// Record rights from the server. An event is only emitted once the
    /// channel is connected; the stored value is replayed on connect.
    pub(crate) fn set_access_rights(&self, rights: AccessRights) {
        let emit = {
            let mut state = self.state.lock().unwrap();
            state.access_rights = rights;
            state.connection_state == ConnectionState::Connected
        };
        if emit {
            self.send_event(ChannelEvent::Rights(rights));
        }
    }

    /// Enter CONNECTED after a successful create-channel reply.
    ///
    /// Emits `connected=true` followed by the latest access rights.
    pub(crate) fn transition_connected(
        &self,
        server_id: u32,
        native_type: DbrBasicType,
        native_count: u32,
        circuit: CircuitKey,
    ) -> bool {
        let rights = {
            let mut state = self.state.lock().unwrap();
            match state.connection_state {
                ConnectionState::NeverConnected | ConnectionState::Disconnected => (),
                _ => return false,
            }
            state.connection_state = ConnectionState::Connected;
            state.server_id = server_id;
            state.native_type = Some(native_type);
            state.native_count = native_count;
            state.circuit = Some(circuit);
            state.access_rights
        };
        debug!(
            "{}: connected (sid={server_id}, {native_type:?} x{native_count})",
            self.name
        );
        self.state_watch.send_replace(ConnectionState::Connected);
        self.send_event(ChannelEvent::Connection(true));
        self.send_event(ChannelEvent::Rights(rights));
        true
    }

    /// Enter DISCONNECTED after circuit death or a server disconnect.
    ///
    /// Returns false when the channel was not connected, so the loss
    /// side-effects (request sweep, monitor sentinel) run exactly once.
    pub(crate) fn transition_disconnected(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.connection_state != ConnectionState::Connected {
                return false;
            }
            state.connection_state = ConnectionState::Disconnected;
            state.circuit = None;
        }
        debug!("{}: disconnected", self.name);
        self.state_watch.send_replace(ConnectionState::Disconnected);
        self.send_event(ChannelEvent::Connection(false));
        true
    }

    /// Enter the terminal CLOSED state. Deliberately quiet: no disconnect
    /// event reaches the listeners, and they are all unregistered.
    pub(crate) fn transition_closed(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.connection_state == ConnectionState::Closed {
                return false;
            }
            state.connection_state = ConnectionState::Closed;
            state.circuit = None;
        }
        let mut listeners = self.listeners.lock().unwrap();
        listeners.connection.clear();
        listeners.rights.clear();
        drop(listeners);
        // Dropping the sender ends the event dispatch task
        self.events.lock().unwrap().take();
        self.state_watch.send_replace(ConnectionState::Closed);
        true
    }

    fn add_connection_listener(
        self: &Arc<Self>,
        callback: ConnectionCallback,
    ) -> Listener {
        let mut listeners = self.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.connection.push((id, callback));
        Listener {
            channel: Arc::downgrade(self),
            id,
            kind: ListenerKind::Connection,
            closed: AtomicBool::new(false),
        }
    }

    fn add_rights_listener(self: &Arc<Self>, callback: RightsCallback) -> Listener {
        let mut listeners = self.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.rights.push((id, callback));
        Listener {
            channel: Arc::downgrade(self),
            id,
            kind: ListenerKind::Rights,
            closed: AtomicBool::new(false),
        }
    }
}

/// Fan one channel's events out to its listeners, in arrival order.
///
/// The listener list is snapshotted per event, so a listener removing
/// itself (or another) mid-dispatch does not disturb the current round.
pub(crate) async fn dispatch_events(
    shared: Arc<ChannelShared>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        trace!("{}: dispatching {event:?}", shared.name);
        match event {
            ChannelEvent::Connection(connected) => {
                let snapshot: Vec<ConnectionCallback> = {
                    let listeners = shared.listeners.lock().unwrap();
                    listeners.connection.iter().map(|(_, f)| f.clone()).collect()
                };
                for callback in snapshot {
                    callback(connected);
                }
            }
            ChannelEvent::Rights(rights) => {
                let snapshot: Vec<RightsCallback> = {
                    let listeners = shared.listeners.lock().unwrap();
                    listeners.rights.iter().map(|(_, f)| f.clone()).collect()
                };
                for callback in snapshot {
                    callback(rights);
                }
            }
        }
    }
}

/// All channels the context knows about, by client id
#[derive(Default)]
pub(crate) struct Registry {
    channels: Mutex<HashMap<u32, Arc<ChannelShared>>>,
    next_cid: AtomicU32,
}

impl Registry {
    pub(crate) fn create(
        &self,
        name: &str,
        priority: u16,
    ) -> (Arc<ChannelShared>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let cid = self.next_cid.fetch_add(1, Ordering::AcqRel);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_watch, _) = watch::channel(ConnectionState::NeverConnected);
        let shared = Arc::new(ChannelShared {
            cid,
            name: name.to_string(),
            priority,
            state: Mutex::new(ChannelStateInner {
                connection_state: ConnectionState::NeverConnected,
                access_rights: AccessRights::NoAccess,
                server_id: 0,
                native_type: None,
                native_count: 0,
                circuit: None,
            }),
            state_watch,
            events: Mutex::new(Some(events)),
            listeners: Mutex::new(ListenerSet::default()),
        });
        self.channels.lock().unwrap().insert(cid, shared.clone());
        (shared, events_rx)
    }

    pub(crate) fn get(&self, cid: u32) -> Option<Arc<ChannelShared>> {
        self.channels.lock().unwrap().get(&cid).cloned()
    }

    pub(crate) fn remove(&self, cid: u32) -> Option<Arc<ChannelShared>> {
        self.channels.lock().unwrap().remove(&cid)
    }

    pub(crate) fn all(&self) -> Vec<Arc<ChannelShared>> {
        self.channels.lock().unwrap().values().cloned().collect()
    }
}

/// A typed handle onto one named channel.
///
/// `T` selects the wire type requested for gets, puts and monitors; scalar
/// types transfer a single element, `Vec` types the server's native count.
pub struct Channel<T: CaType> {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) context: Arc<Shared>,
    _type: PhantomData<T>,
}

impl<T: CaType> Channel<T> {
    pub(crate) fn new(shared: Arc<ChannelShared>, context: Arc<Shared>) -> Channel<T> {
        Channel {
            shared,
            context,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    pub fn access_rights(&self) -> AccessRights {
        self.shared.access_rights()
    }

    /// The server-reported native type and count. Zero-valued unless the
    /// channel is currently connected.
    pub fn properties(&self) -> ChannelProperties {
        match self.shared.native_type() {
            Some(native) => ChannelProperties {
                native_type_code: native as u16,
                native_element_count: self.shared.native_count(),
                native_type: native.name(),
            },
            None => ChannelProperties {
                native_type_code: 0,
                native_element_count: 0,
                native_type: "",
            },
        }
    }

    /// Wait until the channel is connected.
    ///
    /// There is no built-in deadline; searching continues indefinitely.
    /// Bound the wait with `tokio::time::timeout` at the call site.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut watch = self.shared.state_watch.subscribe();
        loop {
            match *watch.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(ClientError::Closed),
                _ => (),
            }
            if watch.changed().await.is_err() {
                return Err(ClientError::ContextClosed);
            }
        }
    }

    /// Register for connect/disconnect events. The returned handle removes
    /// the listener when closed; explicit channel close emits no event.
    pub fn add_connection_listener(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> Listener {
        self.shared.add_connection_listener(Arc::new(callback))
    }

    /// Register for access-rights events. The current rights are replayed
    /// on every (re)connect.
    pub fn add_access_rights_listener(
        &self,
        callback: impl Fn(AccessRights) + Send + Sync + 'static,
    ) -> Listener {
        self.shared.add_rights_listener(Arc::new(callback))
    }

    fn request_count(&self, minor_revision: u16) -> u32 {
        T::FORCED_COUNT.unwrap_or_else(|| {
            if minor_revision < messages::CA_MINIMUM_MODERN_REVISION {
                // Legacy peers reject count=0; ask for the native count
                self.shared.native_count()
            } else {
                0
            }
        })
    }

    /// Read the current value.
    pub async fn get(&self) -> Result<T, ClientError> {
        let dbr = self.get_meta(DbrCategory::Basic).await?;
        T::from_value(dbr.value()).ok_or(ClientError::BadType)
    }

    /// Read the value wrapped in the requested metadata category.
    ///
    /// The metadata variant is selected by value: `DbrCategory::Time` gets
    /// a timestamped bundle, `DbrCategory::Graphics` on an enum channel
    /// gets the choice labels, and so on.
    pub async fn get_meta(&self, category: DbrCategory) -> Result<Dbr, ClientError> {
        let route = self.context.route_for(&self.shared)?;
        // Enum channels deliver their metadata with the enum-specific
        // layouts, whatever value type the user asked for
        let basic_type = match (category, self.shared.native_type()) {
            (DbrCategory::Graphics | DbrCategory::Control, Some(DbrBasicType::Enum)) => {
                DbrBasicType::Enum
            }
            _ => T::BASIC_TYPE,
        };
        let (ioid, waiter) = self.context.mux.register(
            RequestKind::ReadNotify,
            self.shared.cid,
            route.key,
        );
        let request = Message::ReadNotify(messages::ReadNotify {
            data_type: DbrType::new(basic_type, category).into(),
            data_count: self.request_count(route.minor_revision),
            server_id: route.server_id,
            ioid,
        });
        if let Err(e) = route.circuit.send(request).await {
            self.context.mux.cancel(ioid);
            return Err(e);
        }
        match waiter.await {
            Ok(Ok(RequestResult::Value(dbr))) => Ok(dbr),
            Ok(Ok(RequestResult::WriteOk)) => Err(ClientError::Status {
                condition: ErrorCondition::Internal,
                message: "write completion for a read request".to_string(),
            }),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(ClientError::ContextClosed),
        }
    }

    /// Write a value without waiting for confirmation.
    ///
    /// The value is sent as an unacknowledged WRITE; ordering against a
    /// following `get` on the same channel is preserved by the circuit.
    pub async fn put(&self, value: T) -> Result<(), ClientError> {
        self.put_no_wait(value).await
    }

    /// Fire-and-forget write, bypassing the request multiplexer entirely.
    pub async fn put_no_wait(&self, value: T) -> Result<(), ClientError> {
        let route = self.context.route_for(&self.shared)?;
        let dbr_value = value.into_value();
        let (count, data) = dbr_value.to_bytes(None);
        route
            .circuit
            .send(Message::Write(messages::Write {
                data_type: DbrType::new(T::BASIC_TYPE, DbrCategory::Basic).into(),
                data_count: count as u32,
                server_id: route.server_id,
                ioid: 0,
                data,
            }))
            .await
    }

    /// Write a value and complete once the server confirms it.
    pub async fn put_async(&self, value: T) -> Result<(), ClientError> {
        let route = self.context.route_for(&self.shared)?;
        let dbr_value = value.into_value();
        let (count, data) = dbr_value.to_bytes(None);
        let (ioid, waiter) = self.context.mux.register(
            RequestKind::WriteNotify,
            self.shared.cid,
            route.key,
        );
        let request = Message::WriteNotify(messages::WriteNotify {
            data_type: DbrType::new(T::BASIC_TYPE, DbrCategory::Basic).into(),
            data_count: count as u32,
            server_id: route.server_id,
            ioid,
            data,
        });
        if let Err(e) = route.circuit.send(request).await {
            self.context.mux.cancel(ioid);
            return Err(e);
        }
        match waiter.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(ClientError::ContextClosed),
        }
    }

    /// Subscribe to value updates with the default event mask
    /// (value + alarm).
    ///
    /// The consumer receives `Some(value)` per update and exactly one
    /// `None` when the connection to the server is lost.
    pub async fn add_value_monitor(
        &self,
        consumer: impl FnMut(Option<T>) + Send + 'static,
    ) -> Result<Monitor, ClientError> {
        self.add_value_monitor_with_mask(consumer, MonitorMask::default())
            .await
    }

    /// Subscribe to value updates with an explicit event mask
    pub async fn add_value_monitor_with_mask(
        &self,
        mut consumer: impl FnMut(Option<T>) + Send + 'static,
        mask: MonitorMask,
    ) -> Result<Monitor, ClientError> {
        let adapter = Box::new(move |update: Option<Dbr>| match update {
            None => consumer(None),
            Some(dbr) => match T::from_value(dbr.value()) {
                Some(value) => consumer(Some(value)),
                None => warn!("Dropping monitor update not representable as requested type"),
            },
        });
        self.context
            .add_monitor(
                &self.shared,
                DbrType::new(T::BASIC_TYPE, DbrCategory::Basic),
                T::FORCED_COUNT.unwrap_or(0),
                mask,
                adapter,
            )
            .await
    }

    /// Subscribe to updates carrying a metadata bundle instead of the bare
    /// value
    pub async fn add_monitor(
        &self,
        category: DbrCategory,
        consumer: impl FnMut(Option<Dbr>) + Send + 'static,
        mask: MonitorMask,
    ) -> Result<Monitor, ClientError> {
        let basic_type = match (category, self.shared.native_type()) {
            (DbrCategory::Graphics | DbrCategory::Control, Some(DbrBasicType::Enum)) => {
                DbrBasicType::Enum
            }
            _ => T::BASIC_TYPE,
        };
        self.context
            .add_monitor(
                &self.shared,
                DbrType::new(basic_type, category),
                T::FORCED_COUNT.unwrap_or(0),
                mask,
                Box::new(consumer),
            )
            .await
    }

    /// Close the channel: quiet, terminal, idempotent.
    ///
    /// Outstanding requests fail with CHANDESTROY, monitors are closed and
    /// no disconnect event is delivered to listeners.
    pub fn close(&self) {
        self.context.close_channel(&self.shared);
    }
}
