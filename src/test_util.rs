//! Recording fakes for the collaborators of the layer stack and the endpoint. They are used for
//!  testing the engine itself, but they are also exported for application testing.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::endpoint::DatagramSender;
use crate::exchange::Exchange;
use crate::message::codec::{self, ParsedMessage};
use crate::message::{EmptyMessage, Message, Request, Response};
use crate::stack::{LayerStack, MessageDeliverer, Outbox};

/// convenience method for unit test code: create a peer address based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_peer(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

#[derive(Debug, Clone)]
pub enum Sent {
    Request(Request),
    Response(Response),
    Empty(EmptyMessage),
}

impl Sent {
    pub fn message(&self) -> &Message {
        match self {
            Sent::Request(r) => r.message(),
            Sent::Response(r) => r.message(),
            Sent::Empty(e) => e.message(),
        }
    }
}

/// [Outbox] that records what reaches the bottom of the stack. Like the matcher, it assigns
///  message ids to messages that have none.
#[derive(Debug)]
pub struct RecordingOutbox {
    next_mid: AtomicU16,
    tracker: Arc<RwLock<Vec<Sent>>>,
}

impl Default for RecordingOutbox {
    fn default() -> Self {
        RecordingOutbox {
            next_mid: AtomicU16::new(1000),
            tracker: Default::default(),
        }
    }
}

impl RecordingOutbox {
    fn assign_mid(&self, message: &Message) {
        if message.mid().is_none() {
            message.set_mid(self.next_mid.fetch_add(1, Ordering::Relaxed));
        }
    }

    /// returns sent messages, clearing the internal buffer
    pub async fn sent_messages(&self) -> Vec<Sent> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
    }

    pub async fn sent_responses(&self) -> Vec<Response> {
        self.sent_messages().await
            .into_iter()
            .filter_map(|s| match s {
                Sent::Response(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub async fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected messages: {:?}", *lock);
    }
}

#[async_trait]
impl Outbox for RecordingOutbox {
    async fn send_request(&self, _exchange: &Arc<Exchange>, request: Request) {
        self.assign_mid(&request);
        self.tracker.write().await.push(Sent::Request(request));
    }

    async fn send_response(&self, _exchange: &Arc<Exchange>, response: Response) {
        self.assign_mid(&response);
        self.tracker.write().await.push(Sent::Response(response));
    }

    async fn send_empty(&self, _exchange: &Arc<Exchange>, message: EmptyMessage) {
        self.tracker.write().await.push(Sent::Empty(message));
    }
}

/// [MessageDeliverer] that records what reaches the top of the stack
#[derive(Debug, Default)]
pub struct RecordingDeliverer {
    requests: Arc<RwLock<Vec<Request>>>,
    responses: Arc<RwLock<Vec<Response>>>,
}

impl RecordingDeliverer {
    /// returns delivered requests, clearing the internal buffer
    pub async fn delivered_requests(&self) -> Vec<Request> {
        std::mem::take(&mut *self.requests.write().await)
    }

    /// returns delivered responses, clearing the internal buffer
    pub async fn delivered_responses(&self) -> Vec<Response> {
        std::mem::take(&mut *self.responses.write().await)
    }
}

#[async_trait]
impl MessageDeliverer for RecordingDeliverer {
    async fn deliver_request(&self, _stack: &Arc<LayerStack>, _exchange: &Arc<Exchange>, request: Request) {
        self.requests.write().await.push(request);
    }

    async fn deliver_response(&self, _exchange: &Arc<Exchange>, response: Response) {
        self.responses.write().await.push(response);
    }
}

/// [DatagramSender] that records datagrams instead of sending them
#[derive(Debug, Default)]
pub struct RecordingSender {
    tracker: Arc<RwLock<Vec<(SocketAddr, Bytes)>>>,
}

impl RecordingSender {
    /// returns sent datagrams, clearing the internal buffer
    pub async fn sent_datagrams(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.tracker.write().await)
    }

    /// returns sent datagrams decoded, clearing the internal buffer
    pub async fn sent_messages(&self) -> anyhow::Result<Vec<ParsedMessage>> {
        self.sent_datagrams().await
            .into_iter()
            .map(|(to, buf)| codec::deser(&buf, to))
            .collect()
    }
}

#[async_trait]
impl DatagramSender for RecordingSender {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        self.tracker.write().await.push((to, Bytes::copy_from_slice(datagram)));
    }
}
