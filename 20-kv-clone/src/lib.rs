//! Key-value state cloning over a message-oriented transport.
//!
//! One publisher owns the authoritative store and stamps every mutation with
//! a sequence number. Subscribers bootstrap from a snapshot, then follow the
//! live update stream, discarding anything the snapshot already covered.
//!
//! - [`entry`] the three-frame key/sequence/body message and its sentinel.
//! - [`transport`] multipart framing over TCP.
//! - [`store`] and [`sequencer`] the state and the sequence counter.
//! - [`state`] the single task that owns both on the publisher, plus the
//!   [`state::Submit`] capability writers go through.
//! - [`snapshot`], [`bus`] and [`collector`] serve the three channels.
//! - [`server`] binds the channels and supervises their accept loops.
//! - [`replica`] the merge rule and the subscriber state machine.
//! - [`client`] the subscriber, the update generator and the push writer.
//! - [`config`] command-line and environment configuration.
//! - [`supervisor`] role tasks reporting to one coordinating loop.

pub mod bus;
pub mod client;
pub mod collector;
pub mod config;
pub mod entry;
pub mod error;
pub mod replica;
pub mod sequencer;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod transport;
