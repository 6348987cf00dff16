//! The process-facing composition root: configuration, channel creation,
//! and shutdown.
//!
//! A [`Context`] owns the UDP searcher, the circuit pool, the channel
//! registry, the request multiplexer and the monitor notification
//! machinery. Channels are created from it and every background task hangs
//! off its cancellation token, so dropping or closing the context winds the
//! whole client down.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{io, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::{
        channel::{
            Channel, ChannelShared, ClientError, ConnectionState, Registry, dispatch_events,
        },
        circuit::{Circuit, CircuitKey},
        monitor::{
            Monitor, MonitorConsumer, MonitorRecord, MonitorRouter, NotifierConfig,
            NotifierConfigError, NotifierFactory,
        },
        requests::IoMux,
        searcher::{Searcher, SearcherBuilder},
    },
    dbr::{CaType, DbrType},
    messages::{self, ErrorCondition, Message, MonitorMask, RsrvIsUp},
    utils::{
        get_client_hostname, get_client_username, get_default_beacon_period,
        get_default_beacon_port, get_default_connection_timeout, get_default_max_array_bytes,
        get_default_monitor_notifier, get_default_server_port, get_target_broadcast_ips,
        new_reusable_udp_socket,
    },
};

/// How long a create-channel attempt waits before searching again
const CREATE_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Pause before retrying after a failed circuit connection
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Grace allowed per circuit when the context closes
const CIRCUIT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Client configuration, seeded from the `EPICS_CA_*` environment.
///
/// Every field can be overridden programmatically before handing the
/// config to [`Context::with_config`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Addresses searched for channel names. `None` derives the list from
    /// `EPICS_CA_ADDR_LIST` and `EPICS_CA_AUTO_ADDR_LIST`.
    pub search_addresses: Option<Vec<SocketAddr>>,
    /// Default CA server port for search targets (`EPICS_CA_SERVER_PORT`)
    pub server_port: u16,
    /// Port beacons are broadcast on (`EPICS_CA_REPEATER_PORT`)
    pub repeater_port: u16,
    /// Seconds allowed for TCP connect + version exchange
    /// (`EPICS_CA_CONN_TMO`)
    pub connection_timeout: f32,
    /// Expected server beacon period in seconds (`EPICS_CA_BEACON_PERIOD`)
    pub beacon_period: f32,
    /// Receive payload cap in bytes (`EPICS_CA_MAX_ARRAY_BYTES`)
    pub max_array_bytes: usize,
    /// Raw `CA_MONITOR_NOTIFIER_IMPL` string; `None` selects the default
    /// (`multi-worker,16`)
    pub monitor_notifier: Option<String>,
    /// Name reported in the CLIENT_NAME handshake
    pub client_name: String,
    /// Name reported in the HOST_NAME handshake
    pub host_name: String,
    /// Observe server beacons to trigger prompt re-searches
    pub watch_beacons: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            search_addresses: None,
            server_port: get_default_server_port(),
            repeater_port: get_default_beacon_port(),
            connection_timeout: get_default_connection_timeout(),
            beacon_period: get_default_beacon_period(),
            max_array_bytes: get_default_max_array_bytes(),
            monitor_notifier: get_default_monitor_notifier(),
            client_name: get_client_username(),
            host_name: get_client_hostname(),
            watch_beacons: true,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        ClientConfig::default()
    }
    pub fn search_addresses(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.search_addresses = Some(addresses);
        self
    }
    pub fn max_array_bytes(mut self, bytes: usize) -> Self {
        self.max_array_bytes = bytes;
        self
    }
    pub fn monitor_notifier(mut self, configuration: &str) -> Self {
        self.monitor_notifier = Some(configuration.to_string());
        self
    }
    pub fn watch_beacons(mut self, enabled: bool) -> Self {
        self.watch_beacons = enabled;
        self
    }
}

/// Context construction failures. Nothing is left running when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Invalid monitor notifier configuration: {0}")]
    Notifier(#[from] NotifierConfigError),
    #[error("IO error during context startup: {0}")]
    Io(#[from] io::Error),
}

/// Everything needed to talk to a connected channel's server
pub(crate) struct Route {
    pub key: CircuitKey,
    pub server_id: u32,
    pub minor_revision: u16,
    pub circuit: Arc<Circuit>,
}

/// Context-internal state shared with circuit and connector tasks
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) registry: Registry,
    pub(crate) mux: IoMux,
    pub(crate) monitors: MonitorRouter,
    pub(crate) notifiers: NotifierFactory,
    pub(crate) searcher: Searcher,
    circuits: Mutex<HashMap<CircuitKey, Arc<Circuit>>>,
    pub(crate) cancellation: CancellationToken,
}

impl Shared {
    /// The circuit and addressing for a channel, which must be connected
    pub(crate) fn route_for(&self, chan: &ChannelShared) -> Result<Route, ClientError> {
        let Some(key) = chan.circuit() else {
            return Err(match chan.connection_state() {
                ConnectionState::Closed => ClientError::Closed,
                _ => ClientError::Disconnected,
            });
        };
        let circuit = self
            .circuits
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(ClientError::Disconnected)?;
        Ok(Route {
            key,
            server_id: chan.server_id(),
            minor_revision: circuit.minor_revision(),
            circuit,
        })
    }

    /// Get the live circuit for an address, connecting one if needed.
    /// Circuits are shared: every channel resolving to the same
    /// (address, priority) reuses the same one.
    pub(crate) async fn circuit_for(
        self: &Arc<Self>,
        key: CircuitKey,
    ) -> Result<Arc<Circuit>, ClientError> {
        if let Some(existing) = self.circuits.lock().unwrap().get(&key)
            && !existing.is_dead()
        {
            return Ok(existing.clone());
        }
        let new_circuit = Circuit::connect(key, self.clone()).await?;
        let mut map = self.circuits.lock().unwrap();
        match map.get(&key) {
            Some(existing) if !existing.is_dead() => {
                // Someone else connected while we were; keep theirs
                new_circuit.abandon();
                Ok(existing.clone())
            }
            _ => {
                map.insert(key, new_circuit.clone());
                Ok(new_circuit)
            }
        }
    }

    pub(crate) fn remove_circuit(&self, circuit: &Circuit) {
        let mut map = self.circuits.lock().unwrap();
        if let Some(existing) = map.get(&circuit.key)
            && std::ptr::eq(existing.as_ref(), circuit)
        {
            map.remove(&circuit.key);
        }
    }

    fn drain_circuits(&self) -> Vec<Arc<Circuit>> {
        self.circuits.lock().unwrap().drain().map(|(_, c)| c).collect()
    }

    fn broadcast_message(&self, message: Message) {
        for circuit in self.circuits.lock().unwrap().values() {
            circuit.try_send(message.clone());
        }
    }

    /// Subscription ids share the I/O-id space but outlive single requests,
    /// so skip ids that either table still knows about
    fn allocate_subscription_id(&self) -> u32 {
        loop {
            let id = self.mux.allocate_id();
            if self.monitors.get(id).is_none() {
                return id;
            }
        }
    }

    /// Create a monitor on a channel: one notification service instance,
    /// one registry record, and (while connected) one wire subscription.
    pub(crate) async fn add_monitor(
        self: &Arc<Self>,
        chan: &Arc<ChannelShared>,
        data_type: DbrType,
        data_count: u32,
        mask: MonitorMask,
        consumer: MonitorConsumer,
    ) -> Result<Monitor, ClientError> {
        if mask.is_empty() {
            return Err(ClientError::Usage(
                "event mask must select at least one event kind".to_string(),
            ));
        }
        if chan.connection_state() == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }
        let service = self.notifiers.create_service(consumer);
        let subscription_id = self.allocate_subscription_id();
        let record = Arc::new(MonitorRecord {
            subscription_id,
            cid: chan.cid,
            data_type,
            data_count,
            mask,
            service,
            active: AtomicBool::new(true),
        });
        self.monitors.insert(record);
        // Arm the wire subscription now when connected; the reconnect path
        // arms it otherwise
        if let Ok(route) = self.route_for(chan) {
            let _ = route
                .circuit
                .send(Message::EventAdd(messages::EventAdd {
                    data_type: data_type.into(),
                    data_count,
                    server_id: route.server_id,
                    subscription_id,
                    mask,
                }))
                .await;
        }
        Ok(Monitor::new(self, chan.cid, subscription_id))
    }

    /// Tear down one subscription. The notification service instance stays
    /// with the context; only context close releases it.
    pub(crate) fn cancel_subscription(&self, cid: u32, subscription_id: u32) {
        let Some(record) = self.monitors.remove(subscription_id) else {
            return;
        };
        record.active.store(false, Ordering::Release);
        let Some(chan) = self.registry.get(cid) else {
            return;
        };
        if let Ok(route) = self.route_for(&chan) {
            route.circuit.try_send(Message::EventCancel(messages::EventCancel {
                data_type: record.data_type.into(),
                data_count: record.data_count,
                server_id: route.server_id,
                subscription_id,
            }));
        }
    }

    /// Quiet, terminal channel close: cancel requests and monitors, tell
    /// the server, emit no disconnect event.
    pub(crate) fn close_channel(self: &Arc<Self>, chan: &Arc<ChannelShared>) {
        let route = self.route_for(chan).ok();
        if !chan.transition_closed() {
            return;
        }
        debug!("{}: closed", chan.name);
        self.registry.remove(chan.cid);
        self.mux.fail_channel(chan.cid, ErrorCondition::ChanDestroy);
        for record in self.monitors.for_channel(chan.cid) {
            record.active.store(false, Ordering::Release);
            self.monitors.remove(record.subscription_id);
            if let Some(route) = &route {
                route.circuit.try_send(Message::EventCancel(messages::EventCancel {
                    data_type: record.data_type.into(),
                    data_count: record.data_count,
                    server_id: route.server_id,
                    subscription_id: record.subscription_id,
                }));
            }
        }
        if let Some(route) = &route {
            route.circuit.try_send(Message::ClearChannel(messages::ClearChannel {
                server_id: route.server_id,
                client_id: chan.cid,
            }));
            route.circuit.detach(self, chan.cid);
        }
    }
}

/// A CA client runtime.
///
/// Channels are created from a context and live within it. The context is
/// a scoped resource: [`Context::close`] tears everything down gracefully,
/// and dropping it cancels all background work.
pub struct Context {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl Context {
    /// Start a context configured from the environment
    pub async fn new() -> Result<Context, ContextError> {
        Context::with_config(ClientConfig::default()).await
    }

    /// Start a context with explicit configuration.
    ///
    /// Fails without starting anything when the configuration is invalid,
    /// including an unknown monitor notifier strategy.
    pub async fn with_config(config: ClientConfig) -> Result<Context, ContextError> {
        let notifier_config: NotifierConfig = match &config.monitor_notifier {
            Some(raw) => raw.parse()?,
            None => NotifierConfig::default(),
        };
        let cancellation = CancellationToken::new();
        let search_addresses = config
            .search_addresses
            .clone()
            .unwrap_or_else(|| get_target_broadcast_ips(config.server_port));
        let searcher = SearcherBuilder::new()
            .stop_token(cancellation.clone())
            .broadcast_to(search_addresses)
            .start()
            .await?;

        let shared = Arc::new(Shared {
            notifiers: NotifierFactory::new(notifier_config, cancellation.child_token()),
            config,
            registry: Registry::default(),
            mux: IoMux::default(),
            monitors: MonitorRouter::default(),
            searcher,
            circuits: Mutex::new(HashMap::new()),
            cancellation,
        });
        if shared.config.watch_beacons {
            tokio::spawn(watch_beacons(shared.clone()));
        }
        Ok(Context {
            shared,
            closed: AtomicBool::new(false),
        })
    }

    /// Create a channel handle for a named PV and start resolving it.
    ///
    /// The returned channel is NEVER_CONNECTED until a server answers the
    /// search; await [`Channel::connect`] to wait for that.
    pub fn create_channel<T: CaType>(&self, name: &str) -> Result<Channel<T>, ClientError> {
        self.create_channel_with_priority(name, 0)
    }

    /// As [`Context::create_channel`], with an explicit circuit priority
    pub fn create_channel_with_priority<T: CaType>(
        &self,
        name: &str,
        priority: u16,
    ) -> Result<Channel<T>, ClientError> {
        if self.closed.load(Ordering::Acquire) || self.shared.cancellation.is_cancelled() {
            return Err(ClientError::ContextClosed);
        }
        let (chan, events) = self.shared.registry.create(name, priority);
        tokio::spawn(dispatch_events(
            chan.clone(),
            events,
            self.shared.cancellation.child_token(),
        ));
        tokio::spawn(run_channel_connector(self.shared.clone(), chan.clone()));
        Ok(Channel::new(chan, self.shared.clone()))
    }

    /// Number of monitor notification services created and still held.
    ///
    /// Grows by one per monitor added; closing a monitor does not shrink
    /// it. Reset to zero by [`Context::close`].
    pub fn monitor_service_count(&self) -> usize {
        self.shared.notifiers.service_count()
    }

    /// Ask every connected server to stop sending subscription updates
    pub fn events_off(&self) {
        self.shared.broadcast_message(Message::EventsOff);
    }

    /// Resume subscription updates after [`Context::events_off`]
    pub fn events_on(&self) {
        self.shared.broadcast_message(Message::EventsOn);
    }

    /// Shut the context down: close every channel quietly, stop circuits
    /// and the searcher, and dispose all notification services. Waits a
    /// bounded grace per worker before giving up on it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing context");
        for chan in self.shared.registry.all() {
            self.shared.close_channel(&chan);
        }
        self.shared.cancellation.cancel();
        for circuit in self.shared.drain_circuits() {
            circuit.join(CIRCUIT_CLOSE_GRACE).await;
        }
        self.shared.notifiers.close().await;
        debug!("Context closed");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Cancellation reaches every task; close() additionally waits
        self.shared.cancellation.cancel();
    }
}

/// Drive one channel through search → create-channel → (re)connect cycles
/// until it is closed or the context shuts down
async fn run_channel_connector(shared: Arc<Shared>, chan: Arc<ChannelShared>) {
    let mut watch = chan.state_watch.subscribe();
    loop {
        let state = *watch.borrow_and_update();
        match state {
            ConnectionState::Closed => break,
            ConnectionState::Connected => {
                select! {
                    _ = shared.cancellation.cancelled() => break,
                    changed = watch.changed() => if changed.is_err() { break },
                }
            }
            ConnectionState::NeverConnected | ConnectionState::Disconnected => {
                let found = select! {
                    _ = shared.cancellation.cancelled() => break,
                    result = shared.searcher.search_for(&chan.name) => match result {
                        Ok(found) => found,
                        // The searcher only refuses when shutting down
                        Err(_) => break,
                    },
                };
                if chan.connection_state() == ConnectionState::Closed {
                    break;
                }
                let key = (found.server, chan.priority);
                let circuit = match shared.circuit_for(key).await {
                    Ok(circuit) => circuit,
                    Err(e) => {
                        debug!("{}: could not reach {key:?}: {e}", chan.name);
                        tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
                        continue;
                    }
                };
                let create = Message::CreateChannel(messages::CreateChannel {
                    client_id: chan.cid,
                    protocol_version: circuit.minor_revision() as u32,
                    channel_name: chan.name.clone(),
                });
                if circuit.send(create).await.is_err() {
                    tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
                    continue;
                }
                // Wait for the create reply; fall back to a fresh search
                // if the circuit dies or the server never answers
                select! {
                    _ = shared.cancellation.cancelled() => break,
                    _ = circuit.cancel.cancelled() => continue,
                    _ = tokio::time::sleep(CREATE_RETRY_INTERVAL) => continue,
                    changed = watch.changed() => if changed.is_err() { break },
                }
            }
        }
    }
    trace!("{}: connector finished", chan.name);
}

/// Observe server beacons; an unknown server or a restarted beacon id
/// means something changed out there, so pending searches are re-fired
/// immediately.
async fn watch_beacons(shared: Arc<Shared>) {
    let port = shared.config.repeater_port;
    let socket = match new_reusable_udp_socket(format!("0.0.0.0:{port}")) {
        Ok(socket) => socket,
        Err(e) => {
            debug!("Not watching beacons on port {port}: {e}");
            return;
        }
    };
    let mut observed: HashMap<SocketAddr, (u32, Instant)> = HashMap::new();
    // A server silent for two beacon periods and then heard again has
    // probably been away; treat that like a restart
    let stale_after = Duration::from_secs_f32(shared.config.beacon_period * 2.0);
    let mut buf = vec![0u8; 0xFFFF];
    loop {
        let (size, origin) = select! {
            _ = shared.cancellation.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    warn!("Beacon watcher receive failed: {e}");
                    break;
                }
            },
        };
        let Ok(beacon) = RsrvIsUp::parse(&buf[..size]) else {
            continue;
        };
        let server: SocketAddr = (
            beacon.server_ip.map(Into::into).unwrap_or(origin.ip()),
            beacon.server_port,
        )
            .into();
        let anomaly = match observed.get(&server) {
            // A beacon id going backwards means the server restarted
            Some((last_id, last_seen)) => {
                beacon.beacon_id < *last_id || last_seen.elapsed() > stale_after
            }
            None => true,
        };
        observed.insert(server, (beacon.beacon_id, Instant::now()));
        if anomaly {
            debug!("Beacon anomaly from {server}, kicking searches");
            shared.searcher.kick();
        }
    }
}
