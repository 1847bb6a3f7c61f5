//! # ibmf - InfiniBand management datagram transactions
//!
//! This crate implements the transaction core of an InfiniBand Management
//! Framework: per-message response and transaction timers with retries,
//! RMPP segmentation, software loopback of zero-hop directed-route SMPs on
//! adapters that do not loop them back, and a termination path that
//! notifies each client exactly once per transaction.
//!
//! ## Features
//!
//! - **Bounded retries**: a sequenced send is resent up to `retries` times
//!   before it finishes with [`TransStatus::TransTimeout`]
//! - **RMPP**: windowed sender and receiver flows for payloads larger than
//!   one MAD, including double-sided transfers
//! - **Directed-route loopback**: zero-hop DR SMPs are handed to the local
//!   SM or SMA without touching the wire
//! - **At-most-once notification**: completion callbacks run with no lock
//!   held, after the message is done, unlinked and unreferenced
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ibmf::{ClientOptions, ClientType, HcaInfo, IbmfConfig, Port, TransportOpts};
//! use ibmf::timer::{MonotonicClock, TimerDriver, TimerQueue};
//!
//! let timers = Arc::new(TimerQueue::new(Arc::new(MonotonicClock::new())));
//! let _driver = TimerDriver::spawn(timers.clone())?;
//! let port = Port::new(IbmfConfig::default(), hca, transport, timers);
//!
//! let sm = port.register(ClientType::SubnManager, ClientOptions::new())?;
//! let msg = port.alloc_msg(&sm)?;
//! msg.set_send(bufs)?;
//! msg.set_addr(addr, None)?;
//! port.msg_transport(&sm, &msg, TransportOpts::new().sequenced().with_callback(|msg| {
//!     println!("finished: {:?}", msg.status());
//! }))?;
//!
//! // Inbound datagrams from the QP go back in through the port.
//! port.recv_mad(&datagram, remote_addr, None)?;
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: Configuration types (`IbmfConfig`, `RetransParams`)
//! - [`mad`]: MAD and RMPP header layout
//! - [`msg`]: Message context (`Message`, `MsgFlags`, `MsgBufs`)
//! - [`client`]: Client registration and per-client registry
//! - [`timer`]: Clock, timing wheel and timer queue
//! - [`transport`]: The send primitive a port is built on
//! - [`port`]: Main API (`Port`)
//! - `timeouts`: Response and transaction timer callbacks
//! - `rmpp`: RMPP sender and receiver flows
//! - `loopback`: Directed-route loopback filter
//! - `terminate`: Termination and client notification

pub mod client;
pub mod config;
pub mod error;
mod loopback;
pub mod mad;
pub mod msg;
pub mod port;
mod recv;
pub mod rmpp;
mod send;
mod terminate;
mod timeouts;
pub mod timer;
pub mod transport;

// Re-export main types
pub use client::{Client, ClientOptions, ClientStatsSnapshot, ClientType, RecvCallback, RegFlags};
pub use config::{HcaId, IbmfConfig, RetransParams};
pub use error::{Error, Result, TransStatus};
pub use mad::{MadHdr, RmppHdr, RmppType};
pub use msg::{AddrInfo, GlobalRoute, Message, MsgBufs, MsgFlags, TransCallback};
pub use port::Port;
pub use rmpp::{RmppCtx, RmppState};
pub use send::TransportOpts;
pub use transport::{HcaInfo, OutboundMad, Transport};
