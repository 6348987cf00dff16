mod channel;
mod circuit;
mod context;
mod monitor;
mod requests;
mod searcher;

pub use channel::{Channel, ChannelProperties, ClientError, ConnectionState, Listener};
pub use context::{ClientConfig, Context, ContextError};
pub use monitor::{Monitor, NotifierConfig, NotifierConfigError, NotifierStrategy, QosReport};
pub use searcher::{CouldNotFindError, SearchResult, Searcher, SearcherBuilder};

pub use crate::messages::{AccessRights, MonitorMask};
