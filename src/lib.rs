//! Point-to-point messaging between the parties of a multi-party computation. Each party runs
//!  its compute steps locally and exchanges intermediate results with its peers, every payload
//!  tagged with the step that produced it and the step that is going to consume it.
//!
//! ## Design goals
//!
//! * A consumer asks for "the payload party P produced in step S1 for my step S2", and gets
//!   exactly that payload, no matter in which order payloads from P arrived
//!   * payloads that arrive before anybody asks for them are buffered in memory
//!   * every received payload is handed out exactly once
//!   * there is no ordering guarantee across different step pairs, and none is needed
//! * A failure on the producing party travels to the consumer in place of the data, and is
//!   surfaced there as a distinct [error::ProxyError::Remote] rather than as a transport problem
//! * Starting (binding, connecting to all peers) happens in the background. Its outcome is
//!   recorded once, and any number of callers can wait for it
//! * All parties are directly connected peers with a fixed topology: no routing, no membership
//!   changes, no persistence
//!
//! ## Structure
//!
//! * [link] is the transport: it moves opaque messages between parties identified by their
//!   *rank*, i.e. their position in the topology. [link::tcp_link::TcpLink] is the production
//!   implementation (TCP, optionally TLS with mutual authentication)
//! * [envelope] is the wire format wrapping a payload with its step pair
//! * [proxy] is the API for the rest of the engine: [proxy::sender_receiver_proxy::SenderReceiverProxy]
//!   sends envelopes, and demultiplexes received envelopes by step pair
//! * [config] has the (optional, explicitly defaulted) tuning parameters
//! * [context::PartyContext] holds the per-job state of a party process
//!
//! ## Receiving
//!
//! The link keeps a single inbound queue per peer, regardless of which steps the messages
//!  belong to. For each peer, a single pump task reads that queue and delivers envelopes to the
//!  peer's mailbox: either to a consumer waiting for that exact pair, or into the buffer.
//!  Consumers never read from the link directly, so concurrent consumers for different pairs do
//!  not compete for the same stream.

pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod link;
pub mod proxy;
pub mod util;
pub mod test_util;
