//! Represent the CA wire protocol messages, and translate them to/from bytes.
//!
//! Every CA message starts with a 16-byte header of six big-endian fields.
//! Messages whose payload or element count overflow the 16-bit header fields
//! are carried with an extended 24-byte header in which the short fields are
//! set to `0xFFFF` and the real values follow as two `u32`s. Payloads are
//! always padded out to a multiple of 8 bytes.
//!
//! The same command id can mean different things depending on the direction
//! of travel (a `SEARCH` datagram and its reply share command 6), so parsing
//! is split into [`Message::parse_many_client_messages`] for traffic arriving
//! at a client and [`Message::parse_many_server_messages`] for traffic
//! arriving at a server (the latter exists for test fixtures that play the
//! server role). Stream framing for TCP circuits goes through [`ClientCodec`].

use std::{
    fmt::Display,
    io::Cursor,
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use binrw::{BinRead, BinWrite, binrw};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// The CA minor protocol revision this library speaks
pub const CA_PROTOCOL_REVISION: u16 = 13;

/// Oldest peer revision using modern (explicit-count) payload sizing
pub const CA_MINIMUM_MODERN_REVISION: u16 = 13;

/// Default cap on a received payload, overridable via `EPICS_CA_MAX_ARRAY_BYTES`
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16384;

/// Pad a payload buffer out to the next multiple of 8 bytes
fn pad_to_8(buffer: &mut Vec<u8>) {
    let target = buffer.len().div_ceil(8) * 8;
    buffer.resize(target, 0u8);
}

/// The fixed CA message header
#[binrw]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[brw(big)]
struct Header {
    command: u16,
    payload_size: u16,
    data_type: u16,
    data_count: u16,
    parameter_1: u32,
    parameter_2: u32,
}

/// Marker in the short header fields that a 24-byte extended header follows
const EXTENDED_MARKER: u16 = 0xFFFF;

/// A message as it appears on the wire, before command dispatch.
///
/// `payload_size` and `data_count` are the already-widened values; reading
/// and writing take care of the extended-header dance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub command: u16,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter_1: u32,
    pub parameter_2: u32,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Total encoded size of this message, header included
    pub fn wire_size(&self) -> usize {
        let header = if self.needs_extended_header() { 24 } else { 16 };
        header + self.padded_payload_size()
    }

    fn padded_payload_size(&self) -> usize {
        self.payload.len().div_ceil(8) * 8
    }

    fn needs_extended_header(&self) -> bool {
        self.padded_payload_size() >= EXTENDED_MARKER as usize
            || self.data_count >= EXTENDED_MARKER as u32
    }

    pub fn write<W: std::io::Write + std::io::Seek>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut payload = self.payload.clone();
        pad_to_8(&mut payload);
        if self.needs_extended_header() {
            Header {
                command: self.command,
                payload_size: EXTENDED_MARKER,
                data_type: self.data_type,
                data_count: EXTENDED_MARKER,
                parameter_1: self.parameter_1,
                parameter_2: self.parameter_2,
            }
            .write(writer)
            .map_err(binrw_to_io)?;
            (payload.len() as u32, self.data_count)
                .write_be(writer)
                .map_err(binrw_to_io)?;
        } else {
            Header {
                command: self.command,
                payload_size: payload.len() as u16,
                data_type: self.data_type,
                data_count: self.data_count as u16,
                parameter_1: self.parameter_1,
                parameter_2: self.parameter_2,
            }
            .write(writer)
            .map_err(binrw_to_io)?;
        }
        writer.write_all(&payload)?;
        Ok(())
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut writer = Cursor::new(Vec::new());
        self.write(&mut writer).unwrap();
        writer.into_inner()
    }

    /// Try to read one message out of `buf`.
    ///
    /// Returns `None` while the buffer does not yet hold a complete message,
    /// otherwise the number of bytes consumed along with the message.
    pub fn read(buf: &[u8]) -> Option<(usize, RawMessage)> {
        if buf.len() < 16 {
            return None;
        }
        let mut reader = Cursor::new(buf);
        let header = Header::read(&mut reader).ok()?;
        let (payload_size, data_count, header_size) = if header.payload_size == EXTENDED_MARKER {
            if buf.len() < 24 {
                return None;
            }
            let (size, count) = <(u32, u32)>::read_be(&mut reader).ok()?;
            (size as usize, count, 24usize)
        } else {
            (
                header.payload_size as usize,
                header.data_count as u32,
                16usize,
            )
        };
        if buf.len() < header_size + payload_size {
            return None;
        }
        Some((
            header_size + payload_size,
            RawMessage {
                command: header.command,
                data_type: header.data_type,
                data_count,
                parameter_1: header.parameter_1,
                parameter_2: header.parameter_2,
                payload: buf[header_size..header_size + payload_size].to_vec(),
            },
        ))
    }
}

fn binrw_to_io(err: binrw::Error) -> std::io::Error {
    match err {
        binrw::Error::Io(e) => e,
        other => std::io::Error::other(other),
    }
}

/// Extract a NUL-terminated string from a payload field, truncating at the
/// field boundary if the terminator never arrives
fn read_padded_string(data: &[u8]) -> String {
    let end = data.iter().position(|&c| c == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Encode a string as a NUL-terminated payload padded to 8 bytes
fn write_padded_string(value: &str) -> Vec<u8> {
    let mut buffer = value.as_bytes().to_vec();
    buffer.push(0);
    pad_to_8(&mut buffer);
    buffer
}

/// Severity half of an ECA status code
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
    Fatal = 6,
}

/// CA operation status, as carried in response messages.
///
/// The on-wire code is `(message_number << 3) | severity`; the message
/// number alone identifies the condition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCondition {
    Normal = 0,
    AllocMem = 6,
    TooLarge = 9,
    Timeout = 10,
    BadType = 14,
    Internal = 17,
    GetFail = 19,
    PutFail = 20,
    BadCount = 22,
    BadString = 23,
    Disconn = 24,
    DblChnl = 25,
    EvDisallow = 26,
    BadMonId = 30,
    BadMask = 41,
    NoSearchAddr = 49,
    NoConvert = 50,
    BadChId = 51,
    UnavailInServ = 54,
    ChanDestroy = 55,
    BadPriority = 56,
}

impl ErrorCondition {
    pub fn severity(&self) -> CaSeverity {
        use ErrorCondition::*;
        match self {
            Normal => CaSeverity::Success,
            AllocMem | TooLarge | Timeout | GetFail | PutFail | BadCount | Disconn | DblChnl
            | NoSearchAddr | ChanDestroy => CaSeverity::Warning,
            BadType | BadString | EvDisallow | BadMonId | BadMask | NoConvert | BadChId
            | UnavailInServ | BadPriority => CaSeverity::Error,
            Internal => CaSeverity::Fatal,
        }
    }

    /// The full on-wire ECA status code
    pub fn eca_code(&self) -> u32 {
        ((*self as u32) << 3) | self.severity() as u32
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCondition::Normal => "Normal successful completion",
            ErrorCondition::AllocMem => "Unable to allocate additional dynamic memory",
            ErrorCondition::TooLarge => {
                "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES"
            }
            ErrorCondition::Timeout => "User specified timeout on IO operation expired",
            ErrorCondition::BadType => "The data type specified is invalid",
            ErrorCondition::Internal => "Channel Access internal failure",
            ErrorCondition::GetFail => "Channel read request failed",
            ErrorCondition::PutFail => "Channel write request failed",
            ErrorCondition::BadCount => "Requested count larger than native element count",
            ErrorCondition::BadString => "Invalid string format",
            ErrorCondition::Disconn => "Virtual circuit disconnect",
            ErrorCondition::DblChnl => "Identical process variable names on multiple servers",
            ErrorCondition::EvDisallow => {
                "Request inappropriate within subscription (monitor) update callback"
            }
            ErrorCondition::BadMonId => "Bad event subscription (monitor) identifier",
            ErrorCondition::BadMask => "Invalid event selection mask",
            ErrorCondition::NoSearchAddr => "Empty PV search address list",
            ErrorCondition::NoConvert => {
                "No reasonable data conversion between client and server types"
            }
            ErrorCondition::BadChId => "Invalid channel identifier",
            ErrorCondition::UnavailInServ => "Not supported by attached service",
            ErrorCondition::ChanDestroy => "Channel destroyed while request was pending",
            ErrorCondition::BadPriority => "Invalid channel priority",
        }
    }
}

impl Default for ErrorCondition {
    fn default() -> Self {
        ErrorCondition::Normal
    }
}

impl TryFrom<u32> for ErrorCondition {
    type Error = ();
    fn try_from(code: u32) -> Result<Self, ()> {
        use ErrorCondition::*;
        Ok(match code >> 3 {
            0 => Normal,
            6 => AllocMem,
            9 => TooLarge,
            10 => Timeout,
            14 => BadType,
            17 => Internal,
            19 => GetFail,
            20 => PutFail,
            22 => BadCount,
            23 => BadString,
            24 => Disconn,
            25 => DblChnl,
            26 => EvDisallow,
            30 => BadMonId,
            41 => BadMask,
            49 => NoSearchAddr,
            50 => NoConvert,
            51 => BadChId,
            54 => UnavailInServ,
            55 => ChanDestroy,
            56 => BadPriority,
            _ => return Err(()),
        })
    }
}

impl Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ErrorCondition {}

/// Per-channel access permissions, as reported by the server
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum AccessRights {
    #[default]
    NoAccess = 0,
    ReadOnly = 1,
    WriteOnly = 2,
    ReadWrite = 3,
}

impl AccessRights {
    pub fn can_read(&self) -> bool {
        matches!(self, AccessRights::ReadOnly | AccessRights::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, AccessRights::WriteOnly | AccessRights::ReadWrite)
    }
}

impl From<u32> for AccessRights {
    fn from(value: u32) -> Self {
        match value & 0x3 {
            1 => AccessRights::ReadOnly,
            2 => AccessRights::WriteOnly,
            3 => AccessRights::ReadWrite,
            _ => AccessRights::NoAccess,
        }
    }
}

/// Event selection mask for subscriptions.
///
/// An all-zero mask is not a valid subscription and is rejected at the API
/// boundary, before anything touches the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl MonitorMask {
    pub const VALUE: MonitorMask = MonitorMask {
        value: true,
        log: false,
        alarm: false,
        property: false,
    };

    pub fn to_mask(self) -> u16 {
        (self.value as u16)
            | (self.log as u16) << 1
            | (self.alarm as u16) << 2
            | (self.property as u16) << 3
    }

    pub fn from_mask(mask: u16) -> MonitorMask {
        MonitorMask {
            value: mask & 0x1 != 0,
            log: mask & 0x2 != 0,
            alarm: mask & 0x4 != 0,
            property: mask & 0x8 != 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_mask() == 0
    }
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}

// Command ids, per the CA protocol reference
const CMD_VERSION: u16 = 0;
const CMD_EVENT_ADD: u16 = 1;
const CMD_EVENT_CANCEL: u16 = 2;
const CMD_READ: u16 = 3;
const CMD_WRITE: u16 = 4;
const CMD_SEARCH: u16 = 6;
const CMD_EVENTS_OFF: u16 = 8;
const CMD_EVENTS_ON: u16 = 9;
const CMD_READ_SYNC: u16 = 10;
const CMD_ERROR: u16 = 11;
const CMD_CLEAR_CHANNEL: u16 = 12;
const CMD_RSRV_IS_UP: u16 = 13;
const CMD_NOT_FOUND: u16 = 14;
const CMD_READ_NOTIFY: u16 = 15;
const CMD_CREATE_CHANNEL: u16 = 18;
const CMD_WRITE_NOTIFY: u16 = 19;
const CMD_CLIENT_NAME: u16 = 20;
const CMD_HOST_NAME: u16 = 21;
const CMD_ACCESS_RIGHTS: u16 = 22;
const CMD_ECHO: u16 = 23;
const CMD_CREATE_CH_FAIL: u16 = 26;
const CMD_SERVER_DISCONN: u16 = 27;

/// Exchanged first on every TCP circuit and prefixed to search datagrams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
}

impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: CA_PROTOCOL_REVISION,
        }
    }
}

impl Version {
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: CMD_VERSION,
            data_type: self.priority,
            data_count: self.protocol_version as u32,
            ..Default::default()
        }
    }
    fn from_raw(raw: &RawMessage) -> Version {
        Version {
            priority: raw.data_type,
            protocol_version: raw.data_count as u16,
        }
    }
}

/// UDP datagram asking "who serves this channel name?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Ask the server to reply even when it does not serve the name
    pub force_reply: bool,
    pub protocol_version: u16,
}

impl Default for Search {
    fn default() -> Self {
        Search {
            search_id: 0,
            channel_name: String::new(),
            force_reply: false,
            protocol_version: CA_PROTOCOL_REVISION,
        }
    }
}

impl Search {
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: CMD_SEARCH,
            data_type: if self.force_reply { 10 } else { 5 },
            data_count: self.protocol_version as u32,
            parameter_1: self.search_id,
            parameter_2: self.search_id,
            payload: write_padded_string(&self.channel_name),
        }
    }
    fn from_raw(raw: &RawMessage) -> Search {
        Search {
            search_id: raw.parameter_2,
            channel_name: read_padded_string(&raw.payload),
            force_reply: raw.data_type == 10,
            protocol_version: raw.data_count as u16,
        }
    }

    /// Build the response a server would send back for this search
    pub fn respond(
        &self,
        server_ip: Option<Ipv4Addr>,
        port_number: u16,
        protocol_version: u16,
    ) -> SearchResponse {
        SearchResponse {
            port_number,
            server_ip,
            search_id: self.search_id,
            protocol_version,
        }
    }
}

/// Reply to a [`Search`], carrying the server's TCP endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub port_number: u16,
    /// `None` means "use the address the datagram came from"
    pub server_ip: Option<Ipv4Addr>,
    pub search_id: u32,
    pub protocol_version: u16,
}

impl SearchResponse {
    fn to_raw(&self) -> RawMessage {
        let mut payload = self.protocol_version.to_be_bytes().to_vec();
        pad_to_8(&mut payload);
        RawMessage {
            command: CMD_SEARCH,
            data_type: self.port_number,
            data_count: 0,
            parameter_1: self
                .server_ip
                .map(|ip| u32::from_be_bytes(ip.octets()))
                .unwrap_or(0xFFFF_FFFF),
            parameter_2: self.search_id,
            payload,
        }
    }
    fn from_raw(raw: &RawMessage) -> SearchResponse {
        let protocol_version = if raw.payload.len() >= 2 {
            u16::from_be_bytes([raw.payload[0], raw.payload[1]])
        } else {
            // Pre-4.11 servers put the version in the count field instead
            raw.data_count as u16
        };
        SearchResponse {
            port_number: raw.data_type,
            server_ip: match raw.parameter_1 {
                0xFFFF_FFFF => None,
                ip => Some(Ipv4Addr::from(ip.to_be_bytes())),
            },
            search_id: raw.parameter_2,
            protocol_version,
        }
    }
}

/// Request to open a named channel on a circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}

impl Default for CreateChannel {
    fn default() -> Self {
        CreateChannel {
            client_id: 0,
            protocol_version: CA_PROTOCOL_REVISION as u32,
            channel_name: String::new(),
        }
    }
}

impl CreateChannel {
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: CMD_CREATE_CHANNEL,
            parameter_1: self.client_id,
            parameter_2: self.protocol_version,
            payload: write_padded_string(&self.channel_name),
            ..Default::default()
        }
    }
    fn from_raw(raw: &RawMessage) -> CreateChannel {
        CreateChannel {
            client_id: raw.parameter_1,
            protocol_version: raw.parameter_2,
            channel_name: read_padded_string(&raw.payload),
        }
    }
}

/// Successful channel creation: the server's id and native type for the name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateChannelResponse {
    pub data_type: u16,
    pub data_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}

impl CreateChannelResponse {
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: CMD_CREATE_CHANNEL,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.client_id,
            parameter_2: self.server_id,
            ..Default::default()
        }
    }
}

/// The server could not create the requested channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}

/// The server is dropping one channel (not the whole circuit)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDisconnect {
    pub client_id: u32,
}

/// Client request to tear down one channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}

/// Access rights notification, sent after channel creation and on changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessRightsMessage {
    pub client_id: u32,
    pub access_rights: AccessRights,
}

/// Identify the client user to the server (advisory)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientName {
    pub name: String,
}

impl ClientName {
    pub fn new(name: &str) -> Self {
        ClientName {
            name: name.to_string(),
        }
    }
}

/// Identify the client host to the server (advisory)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostName {
    pub name: String,
}

impl HostName {
    pub fn new(name: &str) -> Self {
        HostName {
            name: name.to_string(),
        }
    }
}

/// Subscription request for value updates on a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventAdd {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
    pub mask: MonitorMask,
}

impl EventAdd {
    fn to_raw(&self) -> RawMessage {
        // Payload: three obsolete f32 deadband fields, then the mask
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&0f32.to_be_bytes());
        payload.extend_from_slice(&0f32.to_be_bytes());
        payload.extend_from_slice(&0f32.to_be_bytes());
        payload.extend_from_slice(&self.mask.to_mask().to_be_bytes());
        pad_to_8(&mut payload);
        RawMessage {
            command: CMD_EVENT_ADD,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.server_id,
            parameter_2: self.subscription_id,
            payload,
        }
    }
    fn from_raw(raw: &RawMessage) -> Result<EventAdd, MessageError> {
        if raw.payload.len() < 14 {
            return Err(MessageError::ParsingError(
                "EVENT_ADD payload too short".to_string(),
            ));
        }
        Ok(EventAdd {
            data_type: raw.data_type,
            data_count: raw.data_count,
            server_id: raw.parameter_1,
            subscription_id: raw.parameter_2,
            mask: MonitorMask::from_mask(u16::from_be_bytes([raw.payload[12], raw.payload[13]])),
        })
    }
}

/// A value update for one subscription
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventAddResponse {
    pub data_type: u16,
    pub data_count: u32,
    pub status_code: ErrorCondition,
    pub subscription_id: u32,
    pub data: Vec<u8>,
}

impl EventAddResponse {
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: CMD_EVENT_ADD,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.status_code.eca_code(),
            parameter_2: self.subscription_id,
            payload: self.data.clone(),
        }
    }
    fn from_raw(raw: &RawMessage) -> EventAddResponse {
        EventAddResponse {
            data_type: raw.data_type,
            data_count: raw.data_count,
            status_code: ErrorCondition::try_from(raw.parameter_1)
                .unwrap_or(ErrorCondition::Internal),
            subscription_id: raw.parameter_2,
            data: raw.payload.clone(),
        }
    }
}

/// Cancel one subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCancel {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}

impl EventCancel {
    /// The confirmation a server sends back (an EVENT_ADD with empty payload)
    pub fn response(&self) -> EventCancelResponse {
        EventCancelResponse {
            data_type: self.data_type,
            server_id: self.server_id,
            subscription_id: self.subscription_id,
        }
    }
}

/// Server confirmation of an [`EventCancel`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCancelResponse {
    pub data_type: u16,
    pub server_id: u32,
    pub subscription_id: u32,
}

/// Legacy unacknowledged read; modern clients use [`ReadNotify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Read {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub ioid: u32,
}

/// Fire-and-forget write, with no confirmation from the server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Write {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub ioid: u32,
    pub data: Vec<u8>,
}

/// Read request correlated by I/O id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadNotify {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub ioid: u32,
}

/// Response carrying the data for a [`ReadNotify`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadNotifyResponse {
    pub data_type: u16,
    pub data_count: u32,
    pub status_code: ErrorCondition,
    pub ioid: u32,
    pub data: Vec<u8>,
}

/// Write request correlated by I/O id, confirmed by [`WriteNotifyResponse`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteNotify {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub ioid: u32,
    pub data: Vec<u8>,
}

/// Completion status for a [`WriteNotify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteNotifyResponse {
    pub data_type: u16,
    pub data_count: u32,
    pub status_code: ErrorCondition,
    pub ioid: u32,
}

/// Error report tied to a prior request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ECAError {
    pub client_id: u32,
    pub condition: ErrorCondition,
    pub error_message: String,
}

impl ECAError {
    fn from_raw(raw: &RawMessage) -> ECAError {
        // Payload carries the offending request's header, then the text
        let error_message = if raw.payload.len() > 16 {
            read_padded_string(&raw.payload[16..])
        } else {
            String::new()
        };
        ECAError {
            client_id: raw.parameter_1,
            condition: ErrorCondition::try_from(raw.parameter_2)
                .unwrap_or(ErrorCondition::Internal),
            error_message,
        }
    }
    fn to_raw(&self) -> RawMessage {
        let mut payload = vec![0u8; 16];
        payload.extend_from_slice(&write_padded_string(&self.error_message));
        RawMessage {
            command: CMD_ERROR,
            parameter_1: self.client_id,
            parameter_2: self.condition.eca_code(),
            payload,
            ..Default::default()
        }
    }
}

/// Server beacon, broadcast periodically over UDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsrvIsUp {
    pub protocol_version: u16,
    pub server_port: u16,
    pub beacon_id: u32,
    pub server_ip: Option<Ipv4Addr>,
}

impl Default for RsrvIsUp {
    fn default() -> Self {
        RsrvIsUp {
            protocol_version: CA_PROTOCOL_REVISION,
            server_port: 0,
            beacon_id: 0,
            server_ip: None,
        }
    }
}

impl RsrvIsUp {
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: CMD_RSRV_IS_UP,
            data_type: self.protocol_version,
            data_count: self.server_port as u32,
            parameter_1: self.beacon_id,
            parameter_2: self
                .server_ip
                .map(|ip| u32::from_be_bytes(ip.octets()))
                .unwrap_or(0),
            ..Default::default()
        }
    }
    fn from_raw(raw: &RawMessage) -> RsrvIsUp {
        RsrvIsUp {
            protocol_version: raw.data_type,
            server_port: raw.data_count as u16,
            beacon_id: raw.parameter_1,
            server_ip: match raw.parameter_2 {
                0 => None,
                ip => Some(Ipv4Addr::from(ip.to_be_bytes())),
            },
        }
    }
    pub fn parse(data: &[u8]) -> Result<RsrvIsUp, MessageError> {
        let Some((_, raw)) = RawMessage::read(data) else {
            return Err(MessageError::ParsingError("truncated beacon".to_string()));
        };
        if raw.command != CMD_RSRV_IS_UP {
            return Err(MessageError::UnknownCommandId(raw.command));
        }
        Ok(RsrvIsUp::from_raw(&raw))
    }
    pub fn as_bytes(&self) -> Vec<u8> {
        self.to_raw().as_bytes()
    }
}

/// Every CA message this library can exchange, in either direction
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(Version),
    Search(Search),
    SearchResponse(SearchResponse),
    NotFound { search_id: u32 },
    CreateChannel(CreateChannel),
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    ServerDisconnect(ServerDisconnect),
    ClearChannel(ClearChannel),
    AccessRights(AccessRightsMessage),
    ClientName(ClientName),
    HostName(HostName),
    EventAdd(EventAdd),
    EventAddResponse(EventAddResponse),
    EventCancel(EventCancel),
    EventCancelResponse(EventCancelResponse),
    EventsOff,
    EventsOn,
    ReadSync,
    Read(Read),
    Write(Write),
    ReadNotify(ReadNotify),
    ReadNotifyResponse(ReadNotifyResponse),
    WriteNotify(WriteNotify),
    WriteNotifyResponse(WriteNotifyResponse),
    Error(ECAError),
    RsrvIsUp(RsrvIsUp),
    Echo,
}

macro_rules! impl_message_from {
    ($typ:ident) => {
        impl From<$typ> for Message {
            fn from(value: $typ) -> Self {
                Message::$typ(value)
            }
        }
    };
}
impl_message_from!(Version);
impl_message_from!(Search);
impl_message_from!(SearchResponse);
impl_message_from!(CreateChannel);
impl_message_from!(CreateChannelResponse);
impl_message_from!(CreateChannelFailure);
impl_message_from!(ServerDisconnect);
impl_message_from!(ClearChannel);
impl_message_from!(ClientName);
impl_message_from!(HostName);
impl_message_from!(EventAdd);
impl_message_from!(EventAddResponse);
impl_message_from!(EventCancel);
impl_message_from!(EventCancelResponse);
impl_message_from!(Read);
impl_message_from!(Write);
impl_message_from!(ReadNotify);
impl_message_from!(ReadNotifyResponse);
impl_message_from!(WriteNotify);
impl_message_from!(WriteNotifyResponse);
impl_message_from!(RsrvIsUp);

impl From<AccessRightsMessage> for Message {
    fn from(value: AccessRightsMessage) -> Self {
        Message::AccessRights(value)
    }
}
impl From<ECAError> for Message {
    fn from(value: ECAError) -> Self {
        Message::Error(value)
    }
}

/// Which peer a byte stream is arriving at, for command dispatch
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Direction {
    /// Messages a client receives from a server
    ToClient,
    /// Messages a server receives from a client
    ToServer,
}

/// Things that can go wrong reading or dispatching messages
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("IO error handling message: {0}")]
    IO(#[from] std::io::Error),
    #[error("Unknown command id: {0}")]
    UnknownCommandId(u16),
    #[error("Failed to parse message: {0}")]
    ParsingError(String),
    #[error("Got valid but unexpected message: {0:?}")]
    UnexpectedMessage(Message),
    #[error("Invalid message field: {0}")]
    InvalidField(String),
    #[error("Peer signalled error: {0}")]
    ErrorResponse(ErrorCondition),
    #[error("Payload of {size} bytes exceeds the receive limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("Too many undecodable frames in short succession")]
    ProtocolStorm,
}

impl Message {
    pub fn to_raw(&self) -> RawMessage {
        match self {
            Message::Version(m) => m.to_raw(),
            Message::Search(m) => m.to_raw(),
            Message::SearchResponse(m) => m.to_raw(),
            Message::NotFound { search_id } => RawMessage {
                command: CMD_NOT_FOUND,
                data_type: 10,
                data_count: CA_PROTOCOL_REVISION as u32,
                parameter_1: *search_id,
                parameter_2: *search_id,
                ..Default::default()
            },
            Message::CreateChannel(m) => m.to_raw(),
            Message::CreateChannelResponse(m) => m.to_raw(),
            Message::CreateChannelFailure(m) => RawMessage {
                command: CMD_CREATE_CH_FAIL,
                parameter_1: m.client_id,
                ..Default::default()
            },
            Message::ServerDisconnect(m) => RawMessage {
                command: CMD_SERVER_DISCONN,
                parameter_1: m.client_id,
                ..Default::default()
            },
            Message::ClearChannel(m) => RawMessage {
                command: CMD_CLEAR_CHANNEL,
                parameter_1: m.server_id,
                parameter_2: m.client_id,
                ..Default::default()
            },
            Message::AccessRights(m) => RawMessage {
                command: CMD_ACCESS_RIGHTS,
                parameter_1: m.client_id,
                parameter_2: m.access_rights as u32,
                ..Default::default()
            },
            Message::ClientName(m) => RawMessage {
                command: CMD_CLIENT_NAME,
                payload: write_padded_string(&m.name),
                ..Default::default()
            },
            Message::HostName(m) => RawMessage {
                command: CMD_HOST_NAME,
                payload: write_padded_string(&m.name),
                ..Default::default()
            },
            Message::EventAdd(m) => m.to_raw(),
            Message::EventAddResponse(m) => m.to_raw(),
            Message::EventCancel(m) => RawMessage {
                command: CMD_EVENT_CANCEL,
                data_type: m.data_type,
                data_count: m.data_count,
                parameter_1: m.server_id,
                parameter_2: m.subscription_id,
                ..Default::default()
            },
            Message::EventCancelResponse(m) => RawMessage {
                command: CMD_EVENT_ADD,
                data_type: m.data_type,
                parameter_1: m.server_id,
                parameter_2: m.subscription_id,
                ..Default::default()
            },
            Message::EventsOff => RawMessage {
                command: CMD_EVENTS_OFF,
                ..Default::default()
            },
            Message::EventsOn => RawMessage {
                command: CMD_EVENTS_ON,
                ..Default::default()
            },
            Message::ReadSync => RawMessage {
                command: CMD_READ_SYNC,
                ..Default::default()
            },
            Message::Read(m) => RawMessage {
                command: CMD_READ,
                data_type: m.data_type,
                data_count: m.data_count,
                parameter_1: m.server_id,
                parameter_2: m.ioid,
                ..Default::default()
            },
            Message::Write(m) => RawMessage {
                command: CMD_WRITE,
                data_type: m.data_type,
                data_count: m.data_count,
                parameter_1: m.server_id,
                parameter_2: m.ioid,
                payload: m.data.clone(),
            },
            Message::ReadNotify(m) => RawMessage {
                command: CMD_READ_NOTIFY,
                data_type: m.data_type,
                data_count: m.data_count,
                parameter_1: m.server_id,
                parameter_2: m.ioid,
                ..Default::default()
            },
            Message::ReadNotifyResponse(m) => RawMessage {
                command: CMD_READ_NOTIFY,
                data_type: m.data_type,
                data_count: m.data_count,
                parameter_1: m.status_code.eca_code(),
                parameter_2: m.ioid,
                payload: m.data.clone(),
            },
            Message::WriteNotify(m) => RawMessage {
                command: CMD_WRITE_NOTIFY,
                data_type: m.data_type,
                data_count: m.data_count,
                parameter_1: m.server_id,
                parameter_2: m.ioid,
                payload: m.data.clone(),
            },
            Message::WriteNotifyResponse(m) => RawMessage {
                command: CMD_WRITE_NOTIFY,
                data_type: m.data_type,
                data_count: m.data_count,
                parameter_1: m.status_code.eca_code(),
                parameter_2: m.ioid,
                ..Default::default()
            },
            Message::Error(m) => m.to_raw(),
            Message::RsrvIsUp(m) => m.to_raw(),
            Message::Echo => RawMessage {
                command: CMD_ECHO,
                ..Default::default()
            },
        }
    }

    fn from_raw(raw: &RawMessage, direction: Direction) -> Result<Message, MessageError> {
        use Direction::*;
        Ok(match (raw.command, direction) {
            (CMD_VERSION, _) => Message::Version(Version::from_raw(raw)),
            (CMD_SEARCH, ToServer) => Message::Search(Search::from_raw(raw)),
            (CMD_SEARCH, ToClient) => Message::SearchResponse(SearchResponse::from_raw(raw)),
            (CMD_NOT_FOUND, ToClient) => Message::NotFound {
                search_id: raw.parameter_2,
            },
            (CMD_CREATE_CHANNEL, ToServer) => Message::CreateChannel(CreateChannel::from_raw(raw)),
            (CMD_CREATE_CHANNEL, ToClient) => {
                Message::CreateChannelResponse(CreateChannelResponse {
                    data_type: raw.data_type,
                    data_count: raw.data_count,
                    client_id: raw.parameter_1,
                    server_id: raw.parameter_2,
                })
            }
            (CMD_CREATE_CH_FAIL, ToClient) => Message::CreateChannelFailure(CreateChannelFailure {
                client_id: raw.parameter_1,
            }),
            (CMD_SERVER_DISCONN, ToClient) => Message::ServerDisconnect(ServerDisconnect {
                client_id: raw.parameter_1,
            }),
            (CMD_CLEAR_CHANNEL, _) => Message::ClearChannel(ClearChannel {
                server_id: raw.parameter_1,
                client_id: raw.parameter_2,
            }),
            (CMD_ACCESS_RIGHTS, ToClient) => Message::AccessRights(AccessRightsMessage {
                client_id: raw.parameter_1,
                access_rights: raw.parameter_2.into(),
            }),
            (CMD_CLIENT_NAME, ToServer) => Message::ClientName(ClientName {
                name: read_padded_string(&raw.payload),
            }),
            (CMD_HOST_NAME, ToServer) => Message::HostName(HostName {
                name: read_padded_string(&raw.payload),
            }),
            (CMD_EVENT_ADD, ToServer) => Message::EventAdd(EventAdd::from_raw(raw)?),
            // A payload-free EVENT_ADD from a server confirms a cancel
            (CMD_EVENT_ADD, ToClient) if raw.payload.is_empty() => {
                Message::EventCancelResponse(EventCancelResponse {
                    data_type: raw.data_type,
                    server_id: raw.parameter_1,
                    subscription_id: raw.parameter_2,
                })
            }
            (CMD_EVENT_ADD, ToClient) => Message::EventAddResponse(EventAddResponse::from_raw(raw)),
            (CMD_EVENT_CANCEL, ToServer) => Message::EventCancel(EventCancel {
                data_type: raw.data_type,
                data_count: raw.data_count,
                server_id: raw.parameter_1,
                subscription_id: raw.parameter_2,
            }),
            (CMD_EVENTS_OFF, ToServer) => Message::EventsOff,
            (CMD_EVENTS_ON, ToServer) => Message::EventsOn,
            (CMD_READ_SYNC, _) => Message::ReadSync,
            (CMD_READ, ToServer) => Message::Read(Read {
                data_type: raw.data_type,
                data_count: raw.data_count,
                server_id: raw.parameter_1,
                ioid: raw.parameter_2,
            }),
            (CMD_WRITE, ToServer) => Message::Write(Write {
                data_type: raw.data_type,
                data_count: raw.data_count,
                server_id: raw.parameter_1,
                ioid: raw.parameter_2,
                data: raw.payload.clone(),
            }),
            (CMD_READ_NOTIFY, ToServer) => Message::ReadNotify(ReadNotify {
                data_type: raw.data_type,
                data_count: raw.data_count,
                server_id: raw.parameter_1,
                ioid: raw.parameter_2,
            }),
            (CMD_READ_NOTIFY, ToClient) => Message::ReadNotifyResponse(ReadNotifyResponse {
                data_type: raw.data_type,
                data_count: raw.data_count,
                status_code: ErrorCondition::try_from(raw.parameter_1)
                    .unwrap_or(ErrorCondition::GetFail),
                ioid: raw.parameter_2,
                data: raw.payload.clone(),
            }),
            (CMD_WRITE_NOTIFY, ToServer) => Message::WriteNotify(WriteNotify {
                data_type: raw.data_type,
                data_count: raw.data_count,
                server_id: raw.parameter_1,
                ioid: raw.parameter_2,
                data: raw.payload.clone(),
            }),
            (CMD_WRITE_NOTIFY, ToClient) => Message::WriteNotifyResponse(WriteNotifyResponse {
                data_type: raw.data_type,
                data_count: raw.data_count,
                status_code: ErrorCondition::try_from(raw.parameter_1)
                    .unwrap_or(ErrorCondition::PutFail),
                ioid: raw.parameter_2,
            }),
            (CMD_ERROR, ToClient) => Message::Error(ECAError::from_raw(raw)),
            (CMD_RSRV_IS_UP, _) => Message::RsrvIsUp(RsrvIsUp::from_raw(raw)),
            (CMD_ECHO, _) => Message::Echo,
            (command, _) => return Err(MessageError::UnknownCommandId(command)),
        })
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.to_raw().as_bytes()
    }

    /// Parse a datagram arriving at a client into its component messages
    pub fn parse_many_client_messages(data: &[u8]) -> Result<Vec<Message>, MessageError> {
        Self::parse_many(data, Direction::ToClient)
    }

    /// Parse a datagram arriving at a server into its component messages
    pub fn parse_many_server_messages(data: &[u8]) -> Result<Vec<Message>, MessageError> {
        Self::parse_many(data, Direction::ToServer)
    }

    fn parse_many(data: &[u8], direction: Direction) -> Result<Vec<Message>, MessageError> {
        let mut messages = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let Some((consumed, raw)) = RawMessage::read(rest) else {
                return Err(MessageError::ParsingError(format!(
                    "{} trailing bytes do not form a message",
                    rest.len()
                )));
            };
            messages.push(Message::from_raw(&raw, direction)?);
            rest = &rest[consumed..];
        }
        Ok(messages)
    }
}

/// How many undecodable frames within [`ERROR_STORM_WINDOW`] kill a circuit
const ERROR_STORM_LIMIT: usize = 3;
const ERROR_STORM_WINDOW: Duration = Duration::from_secs(1);

/// Tracks recent decode failures so isolated bad frames are absorbed but a
/// stream of garbage terminates the circuit
#[derive(Debug, Clone, Default)]
struct ErrorStorm {
    recent: Vec<Instant>,
}

impl ErrorStorm {
    /// Record a failure; true when the storm threshold has been crossed
    fn record(&mut self) -> bool {
        let now = Instant::now();
        self.recent.retain(|t| now - *t < ERROR_STORM_WINDOW);
        self.recent.push(now);
        self.recent.len() > ERROR_STORM_LIMIT
    }
}

/// Frame codec for the client side of a TCP circuit.
///
/// Payloads larger than `max_payload_bytes` are refused at the framing
/// stage so that a misbehaving peer cannot balloon the receive task.
/// Individual undecodable frames are logged and skipped; more than three
/// within a second errors the stream, which resets the circuit.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    pub max_payload_bytes: usize,
    storm: ErrorStorm,
}

impl Default for ClientCodec {
    fn default() -> Self {
        ClientCodec::new(DEFAULT_MAX_PAYLOAD_BYTES)
    }
}

impl ClientCodec {
    pub fn new(max_payload_bytes: usize) -> Self {
        ClientCodec {
            max_payload_bytes,
            storm: ErrorStorm::default(),
        }
    }
}

fn decode_with_recovery(
    src: &mut BytesMut,
    direction: Direction,
    max_payload_bytes: usize,
    storm: &mut ErrorStorm,
) -> Result<Option<Message>, MessageError> {
    loop {
        let Some((consumed, raw)) = RawMessage::read(src.as_ref()) else {
            return Ok(None);
        };
        src.advance(consumed);
        if raw.payload.len() > max_payload_bytes {
            warn!(
                "Dropping frame (command {}): payload of {} bytes exceeds limit of {}",
                raw.command,
                raw.payload.len(),
                max_payload_bytes
            );
            if storm.record() {
                return Err(MessageError::ProtocolStorm);
            }
            continue;
        }
        match Message::from_raw(&raw, direction) {
            Ok(message) => return Ok(Some(message)),
            Err(e) => {
                warn!("Dropping undecodable frame (command {}): {e}", raw.command);
                if storm.record() {
                    return Err(MessageError::ProtocolStorm);
                }
                continue;
            }
        }
    }
}

impl Decoder for ClientCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        decode_with_recovery(
            src,
            Direction::ToClient,
            self.max_payload_bytes,
            &mut self.storm,
        )
    }
}

impl Encoder<Message> for ClientCodec {
    type Error = MessageError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), MessageError> {
        dst.put_slice(&item.as_bytes());
        Ok(())
    }
}

/// The server-side twin of [`ClientCodec`], used by test fixtures
#[derive(Debug, Clone)]
pub struct ServerCodec {
    pub max_payload_bytes: usize,
    storm: ErrorStorm,
}

impl Default for ServerCodec {
    fn default() -> Self {
        ServerCodec {
            max_payload_bytes: 32 * 1024 * 1024,
            storm: ErrorStorm::default(),
        }
    }
}

impl Decoder for ServerCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        decode_with_recovery(
            src,
            Direction::ToServer,
            self.max_payload_bytes,
            &mut self.storm,
        )
    }
}

impl Encoder<Message> for ServerCodec {
    type Error = MessageError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), MessageError> {
        dst.put_slice(&item.as_bytes());
        Ok(())
    }
}

/// Parse a UDP search packet as a server sees it: a VERSION followed by one
/// or more SEARCH messages
pub fn parse_search_packet(data: &[u8]) -> Result<Vec<Search>, MessageError> {
    let messages = Message::parse_many_server_messages(data)?;
    let mut searches = Vec::new();
    for message in messages {
        match message {
            Message::Version(_) => continue,
            Message::Search(search) => searches.push(search),
            other => return Err(MessageError::UnexpectedMessage(other)),
        }
    }
    Ok(searches)
}
