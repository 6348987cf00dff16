//! A minimal in-process CA server for exercising the client end-to-end.
//!
//! Speaks just enough of the protocol for the tests: search responses over
//! UDP, then per-connection channel creation, reads, writes and
//! subscriptions over TCP. State is a small PV table; restarting the server
//! on the same ports resets every PV to its configured default, which is
//! exactly what the reconnect tests need.

use std::{
    collections::HashMap,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use calcium::{
    dbr::{
        Alarm, AlarmSeverity, AlarmStatus, Dbr, DbrBasicType, DbrCategory, DbrControl,
        DbrGraphics, DbrType, DbrValue,
    },
    messages::{
        self, ErrorCondition, Message, SearchResponse, ServerCodec, parse_search_packet,
    },
};
use futures::SinkExt;
use tokio::{
    io::split,
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    task::JoinSet,
};
use tokio_stream::StreamExt;
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

/// One simulated process variable
#[derive(Debug, Clone)]
pub struct MockPv {
    pub value: DbrValue,
    pub labels: Vec<String>,
}

impl MockPv {
    pub fn new(value: DbrValue) -> MockPv {
        MockPv {
            value,
            labels: Vec::new(),
        }
    }

    pub fn with_labels(value: DbrValue, labels: &[&str]) -> MockPv {
        MockPv {
            value,
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn native_type(&self) -> DbrBasicType {
        self.value.get_type()
    }
}

/// The standard PV table the tests run against
pub fn standard_pvs() -> HashMap<String, MockPv> {
    let mut pvs = HashMap::new();
    pvs.insert(
        "adc01".to_string(),
        MockPv::new(DbrValue::Double(vec![0.0, 0.0])),
    );
    pvs.insert("counter".to_string(), MockPv::new(DbrValue::Long(vec![0])));
    pvs.insert(
        "large".to_string(),
        MockPv::new(DbrValue::Long((0..1_048_576).collect())),
    );
    pvs.insert(
        "enum".to_string(),
        MockPv::with_labels(
            DbrValue::Enum(vec![0]),
            &["zero", "one", "two", "three", "four", "five", "six", "seven"],
        ),
    );
    pvs
}

pub struct MockServer {
    /// Where clients should send their searches
    pub search_address: SocketAddr,
    pub tcp_port: u16,
    cancel: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl MockServer {
    /// Start on fresh ports
    pub async fn start(pvs: HashMap<String, MockPv>) -> MockServer {
        MockServer::start_on(pvs, 0, 0).await
    }

    /// Start on specific ports, for simulating a restart of the same server
    pub async fn start_on(
        pvs: HashMap<String, MockPv>,
        udp_port: u16,
        tcp_port: u16,
    ) -> MockServer {
        let pvs = Arc::new(Mutex::new(pvs));
        let udp = UdpSocket::bind(("127.0.0.1", udp_port)).await.unwrap();
        let listener = TcpListener::bind(("127.0.0.1", tcp_port)).await.unwrap();
        let search_address = udp.local_addr().unwrap();
        let tcp_port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Search responder
        {
            let cancel = cancel.clone();
            let pvs = pvs.clone();
            tasks.spawn(async move {
                let mut buf = vec![0u8; 0xFFFF];
                loop {
                    let (size, origin) = select! {
                        _ = cancel.cancelled() => break,
                        received = udp.recv_from(&mut buf) => match received {
                            Ok(r) => r,
                            Err(_) => break,
                        },
                    };
                    let Ok(searches) = parse_search_packet(&buf[..size]) else {
                        continue;
                    };
                    let mut reply: Vec<u8> = Message::Version(messages::Version::default())
                        .as_bytes();
                    let mut any = false;
                    for search in searches {
                        if pvs.lock().unwrap().contains_key(&search.channel_name) {
                            any = true;
                            reply.extend(
                                Message::SearchResponse(SearchResponse {
                                    port_number: tcp_port,
                                    server_ip: None,
                                    search_id: search.search_id,
                                    protocol_version: 13,
                                })
                                .as_bytes(),
                            );
                        }
                    }
                    if any {
                        let _ = udp.send_to(&reply, origin).await;
                    }
                }
            });
        }

        // Connection acceptor
        {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let mut connections = JoinSet::new();
                loop {
                    let accepted = select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    let Ok((stream, _)) = accepted else { break };
                    connections.spawn(serve_connection(stream, pvs.clone(), cancel.clone()));
                }
                connections.shutdown().await;
            });
        }

        MockServer {
            search_address,
            tcp_port,
            cancel,
            tasks: Mutex::new(Some(tasks)),
        }
    }

    /// Tear the server down, releasing its ports before returning
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = self.tasks.lock().unwrap().take();
        if let Some(mut tasks) = tasks {
            tasks.shutdown().await;
        }
    }
}

struct ServedChannel {
    name: String,
}

struct Subscription {
    subscription_id: u32,
    data_type: DbrType,
    data_count: u32,
    pv_name: String,
}

/// The alarm state every mock PV reports: an unwritten record
fn mock_alarm() -> Alarm {
    Alarm {
        status: AlarmStatus::Udf,
        severity: AlarmSeverity::Invalid,
    }
}

/// Build the response payload for one PV at the requested DBR type
fn dbr_for(pv: &MockPv, dbr_type: DbrType) -> Option<Dbr> {
    let value = pv.value.convert_to(dbr_type.basic_type).ok()?;
    Some(match dbr_type.category {
        DbrCategory::Basic => Dbr::Basic(value),
        DbrCategory::Status => Dbr::Status {
            status: mock_alarm(),
            value,
        },
        DbrCategory::Time => Dbr::Time {
            status: mock_alarm(),
            timestamp: SystemTime::now(),
            value,
        },
        DbrCategory::Graphics => Dbr::Graphics {
            status: mock_alarm(),
            graphics: graphics_for(pv, dbr_type.basic_type),
            value,
        },
        DbrCategory::Control => Dbr::Control {
            status: mock_alarm(),
            graphics: graphics_for(pv, dbr_type.basic_type),
            control: DbrControl::default_for(dbr_type.basic_type),
            value,
        },
    })
}

fn graphics_for(pv: &MockPv, basic_type: DbrBasicType) -> DbrGraphics {
    match basic_type {
        DbrBasicType::Enum => DbrGraphics::Enum {
            labels: pv.labels.clone(),
        },
        other => DbrGraphics::default_for(other),
    }
}

fn encode_dbr(dbr: &Dbr, count: u32) -> (u32, Vec<u8>) {
    let (real, data) = dbr.to_bytes(NonZeroUsize::new(count as usize));
    (real as u32, data)
}

async fn serve_connection(
    stream: TcpStream,
    pvs: Arc<Mutex<HashMap<String, MockPv>>>,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = split(stream);
    let mut reader = FramedRead::new(read_half, ServerCodec::default());
    let mut writer = FramedWrite::new(write_half, ServerCodec::default());

    // A server leads with its version
    writer
        .send(Message::Version(messages::Version::default()))
        .await
        .unwrap();

    let mut channels: HashMap<u32, ServedChannel> = HashMap::new();
    let mut subscriptions: Vec<Subscription> = Vec::new();
    let mut next_sid = 100u32;

    loop {
        let message = select! {
            _ = cancel.cancelled() => break,
            message = reader.next() => match message {
                Some(Ok(message)) => message,
                _ => break,
            },
        };
        match message {
            Message::Version(_) | Message::ClientName(_) | Message::HostName(_) => (),
            Message::Echo => {
                writer.send(Message::Echo).await.unwrap();
            }
            Message::CreateChannel(m) => {
                let native = pvs
                    .lock()
                    .unwrap()
                    .get(&m.channel_name)
                    .map(|pv| (pv.native_type(), pv.value.get_count() as u32));
                match native {
                    Some((native_type, native_count)) => {
                        let sid = next_sid;
                        next_sid += 1;
                        channels.insert(
                            sid,
                            ServedChannel {
                                name: m.channel_name.clone(),
                            },
                        );
                        writer
                            .send(Message::AccessRights(messages::AccessRightsMessage {
                                client_id: m.client_id,
                                access_rights: messages::AccessRights::ReadWrite,
                            }))
                            .await
                            .unwrap();
                        writer
                            .send(Message::CreateChannelResponse(
                                messages::CreateChannelResponse {
                                    data_type: native_type as u16,
                                    data_count: native_count,
                                    client_id: m.client_id,
                                    server_id: sid,
                                },
                            ))
                            .await
                            .unwrap();
                    }
                    None => {
                        writer
                            .send(Message::CreateChannelFailure(
                                messages::CreateChannelFailure {
                                    client_id: m.client_id,
                                },
                            ))
                            .await
                            .unwrap();
                    }
                }
            }
            Message::ClearChannel(m) => {
                channels.remove(&m.server_id);
            }
            Message::ReadNotify(m) => {
                let response = read_channel(&pvs, &channels, m.server_id, m.data_type, m.data_count)
                    .map(|(count, data)| messages::ReadNotifyResponse {
                        data_type: m.data_type,
                        data_count: count,
                        status_code: ErrorCondition::Normal,
                        ioid: m.ioid,
                        data,
                    })
                    .unwrap_or(messages::ReadNotifyResponse {
                        data_type: m.data_type,
                        data_count: 0,
                        status_code: ErrorCondition::GetFail,
                        ioid: m.ioid,
                        data: Vec::new(),
                    });
                writer.send(Message::ReadNotifyResponse(response)).await.unwrap();
            }
            Message::Write(m) => {
                if store_value(&pvs, &channels, m.server_id, m.data_type, m.data_count, &m.data) {
                    publish_updates(&pvs, &channels, &subscriptions, m.server_id, &mut writer)
                        .await;
                }
            }
            Message::WriteNotify(m) => {
                let ok =
                    store_value(&pvs, &channels, m.server_id, m.data_type, m.data_count, &m.data);
                writer
                    .send(Message::WriteNotifyResponse(messages::WriteNotifyResponse {
                        data_type: m.data_type,
                        data_count: m.data_count,
                        status_code: if ok {
                            ErrorCondition::Normal
                        } else {
                            ErrorCondition::PutFail
                        },
                        ioid: m.ioid,
                    }))
                    .await
                    .unwrap();
                if ok {
                    publish_updates(&pvs, &channels, &subscriptions, m.server_id, &mut writer)
                        .await;
                }
            }
            Message::EventAdd(m) => {
                let Some(channel) = channels.get(&m.server_id) else {
                    continue;
                };
                let Ok(data_type) = DbrType::try_from(m.data_type) else {
                    continue;
                };
                let subscription = Subscription {
                    subscription_id: m.subscription_id,
                    data_type,
                    data_count: m.data_count,
                    pv_name: channel.name.clone(),
                };
                // Initial value accompanies every new subscription
                if let Some(update) = subscription_update(&pvs, &subscription) {
                    writer.send(update).await.unwrap();
                }
                subscriptions.push(subscription);
            }
            Message::EventCancel(m) => {
                subscriptions.retain(|s| s.subscription_id != m.subscription_id);
                writer
                    .send(Message::EventCancelResponse(messages::EventCancelResponse {
                        data_type: m.data_type,
                        server_id: m.server_id,
                        subscription_id: m.subscription_id,
                    }))
                    .await
                    .unwrap();
            }
            Message::EventsOff | Message::EventsOn => (),
            other => {
                panic!("Mock server got unexpected message: {other:?}");
            }
        }
    }
}

fn read_channel(
    pvs: &Arc<Mutex<HashMap<String, MockPv>>>,
    channels: &HashMap<u32, ServedChannel>,
    server_id: u32,
    data_type: u16,
    data_count: u32,
) -> Option<(u32, Vec<u8>)> {
    let channel = channels.get(&server_id)?;
    let dbr_type = DbrType::try_from(data_type).ok()?;
    let pvs = pvs.lock().unwrap();
    let pv = pvs.get(&channel.name)?;
    let dbr = dbr_for(pv, dbr_type)?;
    Some(encode_dbr(&dbr, data_count))
}

fn store_value(
    pvs: &Arc<Mutex<HashMap<String, MockPv>>>,
    channels: &HashMap<u32, ServedChannel>,
    server_id: u32,
    data_type: u16,
    data_count: u32,
    data: &[u8],
) -> bool {
    let Some(channel) = channels.get(&server_id) else {
        return false;
    };
    let Ok(dbr_type) = DbrType::try_from(data_type) else {
        return false;
    };
    let Ok(incoming) = DbrValue::decode_value(dbr_type.basic_type, data_count as usize, data)
    else {
        return false;
    };
    let mut pvs = pvs.lock().unwrap();
    let Some(pv) = pvs.get_mut(&channel.name) else {
        return false;
    };
    let Ok(converted) = incoming.convert_to(pv.native_type()) else {
        return false;
    };
    pv.value = converted;
    true
}

fn subscription_update(
    pvs: &Arc<Mutex<HashMap<String, MockPv>>>,
    subscription: &Subscription,
) -> Option<Message> {
    let pvs = pvs.lock().unwrap();
    let pv = pvs.get(&subscription.pv_name)?;
    let dbr = dbr_for(pv, subscription.data_type)?;
    let (count, data) = encode_dbr(&dbr, subscription.data_count);
    Some(Message::EventAddResponse(messages::EventAddResponse {
        data_type: subscription.data_type.into(),
        data_count: count,
        status_code: ErrorCondition::Normal,
        subscription_id: subscription.subscription_id,
        data,
    }))
}

async fn publish_updates<W>(
    pvs: &Arc<Mutex<HashMap<String, MockPv>>>,
    channels: &HashMap<u32, ServedChannel>,
    subscriptions: &[Subscription],
    server_id: u32,
    writer: &mut W,
) where
    W: futures::Sink<Message> + Unpin,
    W::Error: std::fmt::Debug,
{
    let Some(channel) = channels.get(&server_id) else {
        return;
    };
    for subscription in subscriptions {
        if subscription.pv_name == channel.name
            && let Some(update) = subscription_update(pvs, subscription)
        {
            writer.send(update).await.unwrap();
        }
    }
}
