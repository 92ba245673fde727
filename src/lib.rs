//! Message exchange engine for a CoAP-style request / response protocol running over unreliable
//!  datagram transports.
//!
//! ## Layer stack
//!
//! Outgoing traffic passes through an ordered stack of layers, inbound traffic passes through
//!  the same stack in reverse:
//!
//! ```ascii
//!   application (RequestHandler / Exchange outcome)
//!        |  ^
//!   ObserveLayer       pacing of notifications, re-registration, freshness
//!   BlockwiseLayer     block1 / block2 fragmentation and reassembly
//!   ReliabilityLayer   retransmission of CON messages, piggy-backed vs. separate responses
//!        |  ^
//!   Matcher            correlation of datagrams to exchanges, deduplication, MID allocation
//!   codec / DatagramSender / UdpSocket
//! ```
//!
//! Every layer has the same bidirectional contract (see [stack::Layer]): `send_request`,
//!  `send_response` and `send_empty` flow towards the wire, `receive_request`,
//!  `receive_response` and `receive_empty` flow towards the application. A layer forwards
//!  a message unchanged, forwards a derived message (e.g. a block), or swallows it.
//!
//! ## Exchanges
//!
//! An [exchange::Exchange] holds the state of one logical request / response cycle. It is
//!  shared between the thread delivering an inbound datagram and timer tasks firing on the
//!  [scheduler::Scheduler], so all of its mutable state lives in a single block behind one lock.
//!
//! ## Wire format
//!
//! See [message::codec] - the header layout is RFC 7252, blockwise options RFC 7959, observe
//!  RFC 7641.

pub mod config;
pub mod message;
pub mod exchange;
pub mod scheduler;
pub mod deduplication;
pub mod matcher;
pub mod stack;
pub mod observe;
pub mod endpoint;
pub mod util;
pub mod test_util;
