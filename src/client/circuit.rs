//! One TCP circuit per (server, priority), shared by every channel that
//! resolves there.
//!
//! A circuit owns its socket through two tasks: a writer draining an
//! ordered queue (so all outbound frames for a circuit are serialized), and
//! a reader framing inbound bytes and dispatching them - lifecycle messages
//! to the channel registry, correlated responses through the request
//! multiplexer, and subscription updates to the monitor router.
//!
//! Liveness: the writer sends an ECHO after 15 s without traffic, and the
//! reader declares the circuit dead after 30 s without hearing anything.
//! Death disconnects every hosted channel, which re-enter search. A circuit
//! whose last channel detaches lingers for 5 s before closing, to absorb
//! rapid create/close cycles.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::SinkExt;
use tokio::{
    io::{ReadHalf, WriteHalf, split},
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tokio_stream::StreamExt;
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use crate::{
    client::{
        channel::ClientError,
        context::Shared,
        requests::{RequestFailure, RequestKind, RequestResult},
    },
    dbr::{Dbr, DbrBasicType, DbrType},
    messages::{
        self, CA_PROTOCOL_REVISION, ClientCodec, ErrorCondition, Message,
    },
};

/// Circuits are shared per server address and priority
pub(crate) type CircuitKey = (SocketAddr, u16);

/// Send an ECHO after this long without writing anything
const ECHO_INTERVAL: Duration = Duration::from_secs(15);

/// Declare the circuit dead after this long without peer traffic
const DEAD_INTERVAL: Duration = Duration::from_secs(30);

/// Grace before an unreferenced circuit is torn down
const LINGER_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct Circuit {
    pub key: CircuitKey,
    writer: mpsc::Sender<Message>,
    pub cancel: CancellationToken,
    minor_revision: AtomicU16,
    /// Client ids of the channels hosted here
    channels: Mutex<HashSet<u32>>,
    /// Bumped on attach so a pending linger close knows to stand down
    generation: AtomicU64,
    dead: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Circuit {
    /// Open a circuit: connect, exchange versions, introduce ourselves,
    /// and start the reader/writer tasks.
    pub(crate) async fn connect(
        key: CircuitKey,
        shared: Arc<Shared>,
    ) -> Result<Arc<Circuit>, ClientError> {
        let (address, priority) = key;
        let connect_deadline = Duration::from_secs_f32(shared.config.connection_timeout);
        let stream = timeout(connect_deadline, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out connecting to server",
                ))
            })??;
        debug!("Opened circuit to {address} (priority {priority})");
        let (read_half, write_half) = split(stream);
        let codec = ClientCodec::new(shared.config.max_array_bytes);
        let mut framed_read = FramedRead::new(read_half, codec.clone());
        let mut framed_write = FramedWrite::new(write_half, codec);

        // Introduce ourselves before anything else flows
        framed_write
            .send(Message::Version(messages::Version {
                priority,
                protocol_version: CA_PROTOCOL_REVISION,
            }))
            .await
            .map_err(io_from_message_error)?;
        framed_write
            .send(Message::ClientName(messages::ClientName::new(
                &shared.config.client_name,
            )))
            .await
            .map_err(io_from_message_error)?;
        framed_write
            .send(Message::HostName(messages::HostName::new(
                &shared.config.host_name,
            )))
            .await
            .map_err(io_from_message_error)?;

        // The peer's version must arrive before we use the circuit
        let peer_version = timeout(connect_deadline, framed_read.next())
            .await
            .map_err(|_| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for server version",
                ))
            })?;
        let minor_revision = match peer_version {
            Some(Ok(Message::Version(v))) => v.protocol_version,
            Some(Ok(other)) => {
                warn!("Expected VERSION from {address}, got {other:?}");
                return Err(ClientError::Io(std::io::Error::other(
                    "server did not start with a version exchange",
                )));
            }
            Some(Err(e)) => return Err(ClientError::Io(std::io::Error::other(e))),
            None => {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection during the handshake",
                )));
            }
        };
        debug!("{address}: server speaks minor revision {minor_revision}");

        let (writer, writer_queue) = mpsc::channel(64);
        let circuit = Arc::new(Circuit {
            key,
            writer,
            cancel: shared.cancellation.child_token(),
            minor_revision: AtomicU16::new(minor_revision),
            channels: Mutex::new(HashSet::new()),
            generation: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(writer_loop(
            framed_write,
            writer_queue,
            circuit.clone(),
            shared.clone(),
        ));
        let reader_task = tokio::spawn(reader_loop(framed_read, circuit.clone(), shared));
        *circuit.tasks.lock().unwrap() = vec![writer_task, reader_task];
        Ok(circuit)
    }

    pub(crate) fn minor_revision(&self) -> u16 {
        self.minor_revision.load(Ordering::Acquire)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Queue a message on the ordered writer
    pub(crate) async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.writer
            .send(message)
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    /// Queue a message without waiting; drops with a log line if the queue
    /// is full or the circuit is going away
    pub(crate) fn try_send(&self, message: Message) {
        if let Err(e) = self.writer.try_send(message) {
            debug!("Dropping outbound message on circuit {:?}: {e}", self.key);
        }
    }

    /// Host a channel on this circuit
    pub(crate) fn attach(&self, cid: u32) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.channels.lock().unwrap().insert(cid);
    }

    /// Stop hosting a channel. When the last one leaves, the circuit is
    /// closed after a linger period unless something reattaches.
    pub(crate) fn detach(self: &Arc<Self>, shared: &Arc<Shared>, cid: u32) {
        let now_empty = {
            let mut channels = self.channels.lock().unwrap();
            channels.remove(&cid);
            channels.is_empty()
        };
        if !now_empty {
            return;
        }
        let generation = self.generation.load(Ordering::Acquire);
        let circuit = self.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            select! {
                _ = circuit.cancel.cancelled() => return,
                _ = tokio::time::sleep(LINGER_INTERVAL) => (),
            }
            let still_empty = circuit.channels.lock().unwrap().is_empty();
            if still_empty && circuit.generation.load(Ordering::Acquire) == generation {
                debug!("Closing idle circuit to {:?}", circuit.key);
                circuit.shutdown(&shared);
            }
        });
    }

    /// Discard a circuit that lost a creation race and was never shared
    pub(crate) fn abandon(&self) {
        self.dead.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Quiet teardown for a circuit nothing references any more
    fn shutdown(self: &Arc<Self>, shared: &Arc<Shared>) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        shared.remove_circuit(self);
    }

    /// Teardown after a failure: every hosted channel becomes disconnected,
    /// its outstanding requests fail with DISCONN, and its monitors get the
    /// loss sentinel. Channels re-enter search from their connector tasks.
    pub(crate) fn died(self: &Arc<Self>, shared: &Arc<Shared>) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Circuit to {:?} died", self.key);
        self.cancel.cancel();
        shared.remove_circuit(self);
        shared.mux.fail_circuit(self.key, ErrorCondition::Disconn);
        let cids: Vec<u32> = self.channels.lock().unwrap().drain().collect();
        for cid in cids {
            channel_lost(shared, cid);
        }
    }

    /// Wait for the circuit tasks to finish, bounded by `grace`
    pub(crate) async fn join(&self, grace: Duration) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if timeout(grace, task).await.is_err() {
                warn!("Circuit task for {:?} did not stop within grace", self.key);
            }
        }
    }
}

fn io_from_message_error(e: messages::MessageError) -> ClientError {
    match e {
        messages::MessageError::IO(io) => ClientError::Io(io),
        other => ClientError::Io(std::io::Error::other(other)),
    }
}

/// Disconnect one channel and run the loss side-effects exactly once
pub(crate) fn channel_lost(shared: &Arc<Shared>, cid: u32) {
    let Some(chan) = shared.registry.get(cid) else {
        return;
    };
    if chan.transition_disconnected() {
        shared.mux.fail_channel(cid, ErrorCondition::Disconn);
        shared.monitors.connection_lost(cid);
    }
}

async fn writer_loop(
    mut framed: FramedWrite<WriteHalf<TcpStream>, ClientCodec>,
    mut queue: mpsc::Receiver<Message>,
    circuit: Arc<Circuit>,
    shared: Arc<Shared>,
) {
    let mut last_write = Instant::now();
    loop {
        select! {
            _ = circuit.cancel.cancelled() => break,
            _ = sleep_until(last_write + ECHO_INTERVAL) => {
                trace!("{:?}: keep-alive echo", circuit.key);
                if framed.send(Message::Echo).await.is_err() {
                    circuit.died(&shared);
                    break;
                }
                last_write = Instant::now();
            },
            message = queue.recv() => match message {
                Some(message) => {
                    if let Err(e) = framed.send(message).await {
                        warn!("{:?}: write failed: {e}", circuit.key);
                        circuit.died(&shared);
                        break;
                    }
                    last_write = Instant::now();
                }
                None => break,
            },
        }
    }
}

async fn reader_loop(
    mut framed: FramedRead<ReadHalf<TcpStream>, ClientCodec>,
    circuit: Arc<Circuit>,
    shared: Arc<Shared>,
) {
    loop {
        let frame = select! {
            _ = circuit.cancel.cancelled() => break,
            frame = timeout(DEAD_INTERVAL, framed.next()) => frame,
        };
        match frame {
            Err(_) => {
                warn!("{:?}: no traffic for {DEAD_INTERVAL:?}", circuit.key);
                circuit.died(&shared);
                break;
            }
            Ok(None) => {
                debug!("{:?}: server closed the connection", circuit.key);
                circuit.died(&shared);
                break;
            }
            Ok(Some(Err(e))) => {
                // The codec already absorbed isolated bad frames; getting
                // an error here means the stream is unusable
                warn!("{:?}: receive failed: {e}", circuit.key);
                circuit.died(&shared);
                break;
            }
            Ok(Some(Ok(message))) => dispatch(message, &circuit, &shared),
        }
    }
}

/// Route one inbound message to the subsystem that owns it
fn dispatch(message: Message, circuit: &Arc<Circuit>, shared: &Arc<Shared>) {
    trace!("{:?}: received {message:?}", circuit.key);
    match message {
        Message::Version(v) => {
            circuit
                .minor_revision
                .store(v.protocol_version, Ordering::Release);
        }
        Message::Echo => (),
        Message::AccessRights(m) => {
            let Some(chan) = shared.registry.get(m.client_id) else {
                return;
            };
            chan.set_access_rights(m.access_rights);
        }
        Message::CreateChannelResponse(r) => {
            let Some(chan) = shared.registry.get(r.client_id) else {
                warn!("Create response for unknown channel cid={}", r.client_id);
                return;
            };
            let Ok(native_type) = DbrBasicType::try_from(r.data_type) else {
                warn!(
                    "{}: server reported unusable native type {}",
                    chan.name, r.data_type
                );
                return;
            };
            circuit.attach(r.client_id);
            if chan.transition_connected(r.server_id, native_type, r.data_count, circuit.key) {
                // Re-arm every monitor that survived a disconnect
                for record in shared.monitors.for_channel(r.client_id) {
                    if record.active.load(Ordering::Acquire) {
                        circuit.try_send(Message::EventAdd(messages::EventAdd {
                            data_type: record.data_type.into(),
                            data_count: record.data_count,
                            server_id: r.server_id,
                            subscription_id: record.subscription_id,
                            mask: record.mask,
                        }));
                    }
                }
            }
        }
        Message::CreateChannelFailure(m) => {
            let name = shared
                .registry
                .get(m.client_id)
                .map(|c| c.name.clone())
                .unwrap_or_default();
            warn!("Server refused to create channel '{name}' (cid={})", m.client_id);
        }
        Message::ServerDisconnect(m) => {
            circuit.detach(shared, m.client_id);
            channel_lost(shared, m.client_id);
        }
        Message::ReadNotifyResponse(r) => {
            if shared.mux.kind_of(r.ioid) != Some(RequestKind::ReadNotify) {
                warn!("Discarding read response for unknown I/O id {}", r.ioid);
                return;
            }
            let result = match r.status_code {
                ErrorCondition::Normal => DbrType::try_from(r.data_type)
                    .and_then(|dbr_type| {
                        Dbr::from_bytes(dbr_type, r.data_count as usize, &r.data)
                    })
                    .map(RequestResult::Value)
                    .map_err(|e| RequestFailure {
                        condition: ErrorCondition::GetFail,
                        message: format!("undecodable read response: {e}"),
                    }),
                condition => Err(RequestFailure::from_condition(condition)),
            };
            shared.mux.complete(r.ioid, result);
        }
        Message::WriteNotifyResponse(r) => {
            if shared.mux.kind_of(r.ioid) != Some(RequestKind::WriteNotify) {
                warn!("Discarding write response for unknown I/O id {}", r.ioid);
                return;
            }
            let result = match r.status_code {
                ErrorCondition::Normal => Ok(RequestResult::WriteOk),
                condition => Err(RequestFailure::from_condition(condition)),
            };
            shared.mux.complete(r.ioid, result);
        }
        Message::EventAddResponse(r) => {
            if r.status_code != ErrorCondition::Normal {
                warn!(
                    "Subscription {} update carried status {:?}",
                    r.subscription_id, r.status_code
                );
                return;
            }
            let Ok(dbr_type) = DbrType::try_from(r.data_type) else {
                warn!(
                    "Subscription {} update with unknown type {}",
                    r.subscription_id, r.data_type
                );
                return;
            };
            shared
                .monitors
                .publish(r.subscription_id, dbr_type, r.data_count as usize, &r.data);
        }
        Message::EventCancelResponse(m) => {
            trace!("Subscription {} cancel confirmed", m.subscription_id);
        }
        Message::Error(e) => {
            warn!(
                "Server error on circuit {:?} (cid={}): {} {}",
                circuit.key, e.client_id, e.condition, e.error_message
            );
        }
        other => {
            debug!("{:?}: ignoring unexpected message {other:?}", circuit.key);
        }
    }
}
