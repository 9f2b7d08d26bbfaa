//! An RFC 6762/6763 mDNS responder: advertises services on the local
//! network, answers queries for them, and defends their names against
//! conflicts — without depending on any system mDNS daemon.
//!
//! The pieces, in the order data flows through them:
//! - [`name`] / [`message`]: the DNS name and message wire codecs.
//! - [`record`]: builds a service's PTR/SRV/TXT/A record set and rate-limits
//!   how often any one record may be multicast.
//! - [`service`]: the user-facing service registration type and its
//!   validation rules.
//! - [`state_machine`]: drives one service through Probing, Announcing, and
//!   Established, renaming on conflict.
//! - [`registry`]: the actor holding every Established service.
//! - [`responder`]: the query responder loop and the public [`Responder`]
//!   handle embedders actually construct.
//! - [`transport`]: the `Transport`/`InterfaceResolver` collaborator
//!   boundaries, and the default UDP implementation.
//! - [`config`] / [`logging`]: the ambient configuration and tracing setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod name;
pub mod record;
pub mod registry;
pub mod responder;
pub mod service;
pub mod state_machine;
pub mod transport;

pub use config::ResponderOptions;
pub use error::{Error, Result};
pub use responder::{Responder, ResponderBuilder};
pub use service::Service;
