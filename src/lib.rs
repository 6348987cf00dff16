// #![warn(missing_docs)]

//! Rust client library for the EPICS CA protocol.
//!
//! This crate is a pure-rust client implementation of the [EPICS CA protocol].
//! It does not depend on the C-based [epics-base] project at all.
//!
//! A [`client::Context`] owns the machinery a CA client needs: a UDP
//! searcher that resolves channel names to servers, one TCP circuit per
//! server, a registry tracking every channel's connection lifecycle, and a
//! notification subsystem that hands monitor updates to user consumers.
//! Applications interact through typed [`client::Channel`] handles created
//! from the context, and never touch the wire machinery directly.
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base

pub mod client;
pub mod dbr;
pub mod messages;
pub mod utils;

pub use client::{AccessRights, Channel, ConnectionState, Context, Monitor};
