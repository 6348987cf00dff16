//! Resolve channel names to server endpoints over UDP broadcast.
//!
//! The searcher is a small actor: callers submit names through an mpsc
//! channel and wait on a per-name broadcast receiver for the answer. The
//! actor owns the UDP socket, coalesces pending names into shared datagrams
//! capped at the search MTU, and drives the retry schedule - an exponential
//! backoff from 33 ms doubling up to 30 s, jittered by ±20% so that a
//! rebooting client fleet does not synchronise its search storms.

use rand::Rng;
use std::{
    cmp::min,
    collections::HashMap,
    fmt::Display,
    future,
    net::SocketAddr,
    pin::Pin,
    time::{Duration, Instant},
};
use tokio::{
    io,
    net::UdpSocket,
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    messages::{self, Message},
    utils::{get_default_server_port, get_target_broadcast_ips, wrapping_inplace_add},
};

/// Search datagrams are kept under this size so they fit one ethernet frame
const SEARCH_MTU: usize = 1400;

/// First retry delay for an unanswered search
const INITIAL_SEARCH_DELAY: Duration = Duration::from_millis(33);

/// Retry backoff stops doubling here
const MAX_SEARCH_DELAY: Duration = Duration::from_secs(30);

/// A resolved channel name
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub server: SocketAddr,
    pub protocol_version: u16,
}

pub struct SearcherBuilder {
    stop_token: CancellationToken,
    broadcast_addresses: Option<Vec<SocketAddr>>,
    timeout: Option<Duration>,
    /// The socket that is UDP bound to receive replies
    bind_address: SocketAddr,
}

impl Default for SearcherBuilder {
    fn default() -> Self {
        SearcherBuilder {
            stop_token: CancellationToken::new(),
            broadcast_addresses: None,
            // Searches retry forever unless the caller imposes a deadline
            timeout: None,
            bind_address: "0.0.0.0:0".parse().unwrap(),
        }
    }
}

impl SearcherBuilder {
    pub fn new() -> Self {
        SearcherBuilder::default()
    }
    pub async fn start(self) -> Result<Searcher, io::Error> {
        let (send, request_recv) = mpsc::channel(32);
        let searcher = Searcher {
            timeout: self.timeout,
            requests: send,
            stop_token: self.stop_token.clone(),
            broadcast_addresses: self
                .broadcast_addresses
                .unwrap_or_else(|| get_target_broadcast_ips(get_default_server_port())),
            bind_address: self.bind_address,
        };
        searcher.start_searching(request_recv).await?;
        Ok(searcher)
    }
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.broadcast_addresses = Some(addresses);
        self
    }
}

/// Commands the searcher actor accepts
enum SearchCommand {
    Lookup(
        String,
        oneshot::Sender<broadcast::Receiver<Option<SearchResult>>>,
    ),
    /// Reset every pending retry to fire now, e.g. after a beacon anomaly
    Kick,
}

#[derive(Debug)]
pub struct Searcher {
    timeout: Option<Duration>,
    /// Submit requests to search for new PVs
    requests: mpsc::Sender<SearchCommand>,
    /// Interfaces to broadcast onto
    broadcast_addresses: Vec<SocketAddr>,
    stop_token: CancellationToken,
    bind_address: SocketAddr,
}

impl Searcher {
    pub async fn start() -> Result<Searcher, io::Error> {
        SearcherBuilder::new().start().await
    }
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn start_searching(
        &self,
        mut incoming_requests: mpsc::Receiver<SearchCommand>,
    ) -> Result<(), io::Error> {
        let send_socket = UdpSocket::bind(self.bind_address).await?;
        send_socket.set_broadcast(true)?;

        let mut state = SearcherInternal {
            broadcast_addresses: self.broadcast_addresses.clone(),
            stop_token: self.stop_token.clone(),
            timeout: self.timeout,
            ..Default::default()
        };

        tokio::spawn(async move {
            let mut buffer = vec![0u8; 0xFFFF];
            loop {
                let mut requests = Vec::new();
                select! {
                    _ = state.stop_token.cancelled() => break,
                    _ = incoming_requests.recv_many(&mut requests, 32) => if requests.is_empty() {
                        break;
                    } else {
                        state.handle_commands(&send_socket, requests).await
                    },
                    result = send_socket.recv_from(&mut buffer) => match result {
                        Ok((size, sender)) => state.handle_response(&buffer[..size], sender),
                        Err(e) => {
                            error!("Error waiting for search responses: {e}");
                        },
                    },
                    _ = state.next_attempt() => {
                        let packets = state.handle_retries_and_timeouts();
                        state.send_packets(&send_socket, packets).await;
                    },
                };
            }
        });
        Ok(())
    }

    /// Find the server serving a specific PV.
    ///
    /// With no timeout configured this waits as long as it takes; wrap the
    /// future in a deadline at the call site to bound it.
    pub async fn search_for(&self, name: &str) -> Result<SearchResult, CouldNotFindError> {
        let (ret_send, ret_recv) = oneshot::channel();
        // Send the request into our async search loop
        self.requests
            .send(SearchCommand::Lookup(name.to_string(), ret_send))
            .await
            .map_err(|_| CouldNotFindError)?;
        // Get the receiver back from here
        let mut result_receiver = ret_recv.await.map_err(|_| CouldNotFindError)?;
        // Now, wait on this
        result_receiver
            .recv()
            .await
            .unwrap_or(None)
            .ok_or(CouldNotFindError)
    }

    /// Ask for all pending searches to be re-sent immediately
    pub fn kick(&self) {
        let _ = self.requests.try_send(SearchCommand::Kick);
    }

    pub fn stop(&self) {
        self.stop_token.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.stop_token.is_cancelled()
    }
}

impl Drop for Searcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
pub struct CouldNotFindError;

impl Display for CouldNotFindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Could not find the requested PV")
    }
}

impl std::error::Error for CouldNotFindError {}

#[derive(Debug)]
struct SearchAttempt {
    name: String,
    attempts: u32,
    search_expires_at: Option<Instant>,
    active_searches: Vec<u32>,
    next_search_at: Instant,
    /// How are results reported back to the requesters?
    reporter: broadcast::Sender<Option<SearchResult>>,
}

impl SearchAttempt {
    /// Recalculate timings and return a new search message.
    ///
    /// The delay doubles per attempt up to the cap, with ±20% jitter.
    fn new_search(&mut self, search_id: u32) -> messages::Search {
        let exponent = min(self.attempts, 16);
        let backoff = min(INITIAL_SEARCH_DELAY * 2u32.pow(exponent), MAX_SEARCH_DELAY);
        let jittered = backoff.mul_f64(rand::thread_rng().gen_range(0.8..1.2));
        self.attempts += 1;
        self.active_searches.push(search_id);
        self.next_search_at = Instant::now() + jittered;
        messages::Search {
            search_id,
            channel_name: self.name.clone(),
            ..Default::default()
        }
    }
}

impl Default for SearchAttempt {
    fn default() -> Self {
        SearchAttempt {
            name: String::new(),
            attempts: 0,
            search_expires_at: None,
            active_searches: Vec::new(),
            next_search_at: Instant::now(),
            reporter: broadcast::Sender::new(1),
        }
    }
}

/// Handle searcher internal state, inside a single async context
#[derive(Default)]
struct SearcherInternal {
    /// Interfaces to broadcast onto
    broadcast_addresses: Vec<SocketAddr>,
    /// Search IDs of outstanding requests to the PV name
    in_flight: HashMap<u32, String>,
    /// Data about all the PVs we are searching for
    per_pv_info: HashMap<String, SearchAttempt>,
    stop_token: CancellationToken,
    /// The next search ID to send
    search_id: u32,
    timeout: Option<Duration>,
}

impl SearcherInternal {
    /// Wait until it's time for the next tracked attempt
    fn next_attempt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let next_wake = self
            .per_pv_info
            .values()
            .flat_map(|v| [Some(v.next_search_at), v.search_expires_at])
            .flatten()
            .min();
        match next_wake {
            None => Box::pin(future::pending()),
            Some(instant) => {
                if instant < Instant::now() {
                    Box::pin(future::ready(()))
                } else {
                    Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(
                        instant,
                    )))
                }
            }
        }
    }

    /// Pack messages into datagrams no larger than the search MTU, each
    /// led by a Version message
    fn build_packets(messages: impl IntoIterator<Item = Message>) -> Vec<Vec<u8>> {
        let version = Message::Version(messages::Version::default()).as_bytes();
        let mut packets: Vec<Vec<u8>> = Vec::new();
        let mut current = version.clone();
        let mut have_content = false;
        for message in messages {
            let bytes = message.as_bytes();
            if have_content && current.len() + bytes.len() > SEARCH_MTU {
                packets.push(std::mem::replace(&mut current, version.clone()));
                have_content = false;
            }
            current.extend_from_slice(&bytes);
            have_content = true;
        }
        if have_content {
            packets.push(current);
        }
        packets
    }

    async fn send_packets(&self, socket: &UdpSocket, packets: Vec<Vec<u8>>) {
        for packet in packets {
            for addr in &self.broadcast_addresses {
                debug!("Sending search packet ({} bytes) to: {addr}", packet.len());
                if let Err(e) = socket.send_to::<SocketAddr>(&packet, *addr).await {
                    warn!("Search send to {addr} failed: {e}");
                }
            }
        }
    }

    async fn handle_commands(&mut self, socket: &UdpSocket, commands: Vec<SearchCommand>) {
        debug_assert!(!commands.is_empty());

        let mut messages = Vec::new();
        for command in commands {
            match command {
                SearchCommand::Lookup(name, waiter_reply) => {
                    // Get or create an entry in our per-PV map
                    let timeout = self.timeout;
                    let info = self
                        .per_pv_info
                        .entry(name.clone())
                        .or_insert_with(|| SearchAttempt {
                            name: name.clone(),
                            search_expires_at: timeout.map(|t| Instant::now() + t),
                            ..Default::default()
                        });
                    // Give the requester a place to wait for replies
                    let _ = waiter_reply.send(info.reporter.subscribe());
                    let search_id = wrapping_inplace_add(&mut self.search_id);
                    // Register this search attempt
                    self.in_flight.insert(search_id, name.clone());
                    messages.push(Message::Search(info.new_search(search_id)));
                    debug!("Sending search for {name}");
                }
                SearchCommand::Kick => {
                    let now = Instant::now();
                    for info in self.per_pv_info.values_mut() {
                        info.next_search_at = now;
                        info.attempts = 0;
                    }
                }
            }
        }

        if !messages.is_empty() {
            let packets = Self::build_packets(messages);
            self.send_packets(socket, packets).await;
        }
    }

    fn handle_response(&mut self, response: &[u8], sender: SocketAddr) {
        let Ok(messages) = Message::parse_many_client_messages(response) else {
            warn!("Received unparseable search response");
            return;
        };
        for message in messages {
            let response = match message {
                Message::SearchResponse(search_response) => search_response,
                Message::Version(_) => continue,
                Message::NotFound { .. } => continue,
                m => {
                    warn!("Received unexpected search response: {m:?}");
                    continue;
                }
            };
            // What was this a response to?
            let Some(pv_name) = self.in_flight.remove(&response.search_id) else {
                debug!("Received unrequested or duplicate search response");
                continue;
            };
            // Now we know we have a response to an actual request - clear out
            // any past requests for this and send the notification up
            let info = self.per_pv_info.remove(&pv_name).unwrap();
            // Get rid of any other in-flight searches for this
            for search_id in info.active_searches {
                self.in_flight.remove(&search_id);
            }
            let server = (
                response.server_ip.map(|i| i.into()).unwrap_or(sender.ip()),
                response.port_number,
            )
                .into();
            debug!("Found server for {pv_name}: {server:?}");
            let _ = info.reporter.send(Some(SearchResult {
                server,
                protocol_version: response.protocol_version,
            }));
        }
    }

    fn handle_retries_and_timeouts(&mut self) -> Vec<Vec<u8>> {
        let now = Instant::now();

        // discard any expired searches
        self.per_pv_info.retain(|_, v| match v.search_expires_at {
            None => true,
            Some(time) => {
                if time < now {
                    // We are discarding this. Send the termination signal,
                    let _ = v.reporter.send(None);
                    // And then remove from the in-flight register
                    for id in v.active_searches.iter() {
                        let _ = self.in_flight.remove(id);
                    }
                    debug!(
                        "Dropping search for {} as reached search timeout {:.2} ms ago",
                        v.name,
                        (now - time).as_secs_f32() * 1000.0
                    );
                    false
                } else {
                    true
                }
            }
        });

        let search_id = &mut self.search_id;
        let search_messages: Vec<Message> = self
            .per_pv_info
            .values_mut()
            .filter(|s| s.next_search_at < now)
            .map(|s| {
                debug!("Sending retry search for: {}", s.name);
                Message::Search(s.new_search(wrapping_inplace_add(search_id)))
            })
            .collect();

        for message in &search_messages {
            if let Message::Search(search) = message {
                self.in_flight
                    .insert(search.search_id, search.channel_name.clone());
            }
        }

        if search_messages.is_empty() {
            Vec::new()
        } else {
            Self::build_packets(search_messages)
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::messages::parse_search_packet;

    #[tokio::test(flavor = "current_thread")]
    async fn test_search() {
        // Set up a receiver standing in for a server
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = incoming.local_addr().unwrap().port();

        let subtask = tokio::spawn(async move {
            let s = SearcherBuilder::new()
                .broadcast_to(vec![(Ipv4Addr::LOCALHOST, port).into()])
                .start()
                .await
                .unwrap();
            let found = s.search_for("TEST").await.unwrap();
            assert_eq!(found.server, "127.0.0.1:6464".parse().unwrap());
            assert_eq!(found.protocol_version, 13);
        });

        // Receive and validate this request
        let mut buffer = [0u8; 16384];
        let (size, source) = incoming.recv_from(&mut buffer).await.unwrap();
        let searches = parse_search_packet(&buffer[..size]).unwrap();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].channel_name, "TEST");

        // Send a message back
        incoming
            .send_to(
                &Message::from(searches[0].respond(None, 6464, 13)).as_bytes(),
                source,
            )
            .await
            .unwrap();

        subtask.await.unwrap();
    }

    #[tokio::test]
    async fn test_search_timeout() {
        let searcher = SearcherBuilder::new()
            .broadcast_to(vec![(Ipv4Addr::LOCALHOST, 1).into()])
            .timeout(Some(Duration::from_millis(50)))
            .start()
            .await
            .unwrap();
        assert!(searcher.search_for("NOBODY:HOME").await.is_err());
    }

    #[tokio::test]
    async fn retries_back_off_and_coalesce() {
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = incoming.local_addr().unwrap().port();

        let searcher = SearcherBuilder::new()
            .broadcast_to(vec![(Ipv4Addr::LOCALHOST, port).into()])
            .start()
            .await
            .unwrap();
        let searcher_task = tokio::spawn(async move {
            let _ = searcher.search_for("SLOW:PV").await;
        });

        // The same name arrives repeatedly as retries fire, each time with
        // a fresh search id
        let mut buffer = [0u8; 16384];
        let mut seen_ids = Vec::new();
        for _ in 0..3 {
            let (size, _) = incoming.recv_from(&mut buffer).await.unwrap();
            let searches = parse_search_packet(&buffer[..size]).unwrap();
            for search in searches {
                assert_eq!(search.channel_name, "SLOW:PV");
                assert!(!seen_ids.contains(&search.search_id));
                seen_ids.push(search.search_id);
            }
        }
        searcher_task.abort();
    }

    #[test]
    fn packets_respect_the_mtu() {
        let names: Vec<Message> = (0..100)
            .map(|i| {
                Message::Search(messages::Search {
                    search_id: i,
                    channel_name: format!("SOME:RATHER:LONG:PV:NAME:{i:04}"),
                    ..Default::default()
                })
            })
            .collect();
        let packets = SearcherInternal::build_packets(names);
        assert!(packets.len() > 1);
        for packet in &packets {
            assert!(packet.len() <= SEARCH_MTU);
            // Every packet leads with a Version message
            let messages = Message::parse_many_server_messages(packet).unwrap();
            assert!(matches!(messages[0], Message::Version(_)));
        }
    }
}
