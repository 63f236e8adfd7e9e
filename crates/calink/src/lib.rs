//! Async Channel Access client runtime.
//!
//! Channel Access is a publish/subscribe and request/reply protocol for
//! named process variables (PVs) hosted by servers on a LAN. This crate
//! implements the client side: PV names are located by broadcast search
//! over UDP, long-lived TCP circuits multiplex every channel bound to
//! one server, and typed reads, writes and subscription updates flow
//! back to user callbacks with connect/disconnect lifecycle handling
//! and automatic resubscription after a server restart.
//!
//! # Example
//!
//! ```ignore
//! use calink::{Context, DbrType, IgnoreChannelEvents, dbe};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> calink::Result<()> {
//!     let ctx = Context::new()?;
//!     let chan = ctx.create_channel("room:temperature", Arc::new(IgnoreChannelEvents), 0)?;
//!
//!     // durable subscription, re-issued automatically on reconnect
//!     chan.subscribe(DbrType::Double, 1, dbe::VALUE, |sample| {
//!         match sample {
//!             Ok(value) => println!("update: {value:?}"),
//!             Err(e) => eprintln!("lost: {e}"),
//!         }
//!     })
//!     .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     ctx.destroy().await;
//!     Ok(())
//! }
//! ```

mod bhe;
mod callback;
pub mod channel;
mod circuit;
pub mod config;
pub mod context;
pub mod dbr;
mod error;
mod io;
pub mod notify;
mod resolver;
pub mod service;
pub mod status;
mod sync_group;
mod udp;
pub mod wire;

pub use callback::CallbackMode;
pub use channel::{Channel, PRIORITY_MAX};
pub use context::{Context, ContextBuilder};
pub use dbr::{Dbr, DbrType};
pub use error::{CaException, Error, Result};
pub use io::{Ioid, ReadCallback, SubscriptionCallback, WriteCallback};
pub use notify::{AccessRights, ChannelNotify, ContextNotify, IgnoreChannelEvents, LogNotify};
pub use service::{PvService, ServiceChannel, register_global};
pub use status::{Severity, Status};
pub use sync_group::SyncGroupInfo;
pub use wire::dbe;
