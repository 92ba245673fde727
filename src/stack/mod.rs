//! The ordered stack of protocol layers between the application and the matcher.
//!
//! A [Chain] is a position in the stack. Layers receive the chain of their own position and call
//!  `chain.send_*` to pass a message further down, or `chain.receive_*` to pass it further up.
//!  Below the lowest layer is the [Outbox], above the highest layer the [MessageDeliverer].

pub mod blockwise;
pub mod observe;
pub mod reliability;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::exchange::Exchange;
use crate::message::{EmptyMessage, Request, Response};

/// One stage of the stack. Every method defaults to forwarding the message unchanged.
#[async_trait]
pub trait Layer: Send + Sync + 'static {
    async fn send_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        chain.send_request(exchange, request).await
    }

    async fn send_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        chain.send_response(exchange, response).await
    }

    async fn send_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, message: EmptyMessage) {
        chain.send_empty(exchange, message).await
    }

    async fn receive_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        chain.receive_request(exchange, request).await
    }

    async fn receive_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        chain.receive_response(exchange, response).await
    }

    async fn receive_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, message: EmptyMessage) {
        chain.receive_empty(exchange, message).await
    }
}

/// Where messages go after passing the lowest layer: the matcher and the wire
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Outbox: Send + Sync + 'static {
    async fn send_request(&self, exchange: &Arc<Exchange>, request: Request);
    async fn send_response(&self, exchange: &Arc<Exchange>, response: Response);
    async fn send_empty(&self, exchange: &Arc<Exchange>, message: EmptyMessage);
}

/// Where messages go after passing the highest layer: the application
#[async_trait]
pub trait MessageDeliverer: Send + Sync + 'static {
    /// The stack is passed in so the application can respond through it
    async fn deliver_request(&self, stack: &Arc<LayerStack>, exchange: &Arc<Exchange>, request: Request);
    async fn deliver_response(&self, exchange: &Arc<Exchange>, response: Response);
}

pub struct LayerStack {
    layers: Vec<Arc<dyn Layer>>,
    outbox: Arc<dyn Outbox>,
    deliverer: Arc<dyn MessageDeliverer>,
}

impl LayerStack {
    /// `layers` is ordered from the application side to the wire side
    pub fn new(layers: Vec<Arc<dyn Layer>>, outbox: Arc<dyn Outbox>, deliverer: Arc<dyn MessageDeliverer>) -> Arc<LayerStack> {
        Arc::new(LayerStack {
            layers,
            outbox,
            deliverer,
        })
    }

    fn chain_at(self: &Arc<Self>, index: usize) -> Option<Chain> {
        if index < self.layers.len() {
            Some(Chain { stack: self.clone(), index })
        }
        else {
            None
        }
    }

    fn top(self: &Arc<Self>) -> Option<Chain> {
        self.chain_at(0)
    }

    fn bottom(self: &Arc<Self>) -> Option<Chain> {
        self.chain_at(self.layers.len().checked_sub(1)?)
    }

    pub async fn send_request(self: &Arc<Self>, exchange: &Arc<Exchange>, request: Request) {
        match self.top() {
            Some(chain) => chain.layer().send_request(&chain, exchange, request).await,
            None => self.outbox.send_request(exchange, request).await,
        }
    }

    pub async fn send_response(self: &Arc<Self>, exchange: &Arc<Exchange>, response: Response) {
        match self.top() {
            Some(chain) => chain.layer().send_response(&chain, exchange, response).await,
            None => self.outbox.send_response(exchange, response).await,
        }
    }

    pub async fn send_empty(self: &Arc<Self>, exchange: &Arc<Exchange>, message: EmptyMessage) {
        match self.top() {
            Some(chain) => chain.layer().send_empty(&chain, exchange, message).await,
            None => self.outbox.send_empty(exchange, message).await,
        }
    }

    pub async fn receive_request(self: &Arc<Self>, exchange: &Arc<Exchange>, request: Request) {
        match self.bottom() {
            Some(chain) => chain.layer().receive_request(&chain, exchange, request).await,
            None => self.deliverer.deliver_request(self, exchange, request).await,
        }
    }

    pub async fn receive_response(self: &Arc<Self>, exchange: &Arc<Exchange>, response: Response) {
        match self.bottom() {
            Some(chain) => chain.layer().receive_response(&chain, exchange, response).await,
            None => self.deliverer.deliver_response(exchange, response).await,
        }
    }

    pub async fn receive_empty(self: &Arc<Self>, exchange: &Arc<Exchange>, message: EmptyMessage) {
        if let Some(chain) = self.bottom() {
            chain.layer().receive_empty(&chain, exchange, message).await;
        }
    }
}

/// A layer's position in a [LayerStack]
#[derive(Clone)]
pub struct Chain {
    stack: Arc<LayerStack>,
    index: usize,
}

impl Chain {
    /// the layer at this position, for a layer re-entering its own send path (e.g. retransmission)
    pub fn layer(&self) -> &Arc<dyn Layer> {
        &self.stack.layers[self.index]
    }

    pub fn stack(&self) -> &Arc<LayerStack> {
        &self.stack
    }

    /// for callbacks that are stored in messages, and must not keep the stack alive
    pub fn downgrade(&self) -> WeakChain {
        WeakChain {
            stack: Arc::downgrade(&self.stack),
            index: self.index,
        }
    }

    fn below(&self) -> Option<Chain> {
        self.stack.chain_at(self.index + 1)
    }

    fn above(&self) -> Option<Chain> {
        self.stack.chain_at(self.index.checked_sub(1)?)
    }

    pub async fn send_request(&self, exchange: &Arc<Exchange>, request: Request) {
        match self.below() {
            Some(next) => next.layer().send_request(&next, exchange, request).await,
            None => self.stack.outbox.send_request(exchange, request).await,
        }
    }

    pub async fn send_response(&self, exchange: &Arc<Exchange>, response: Response) {
        match self.below() {
            Some(next) => next.layer().send_response(&next, exchange, response).await,
            None => self.stack.outbox.send_response(exchange, response).await,
        }
    }

    pub async fn send_empty(&self, exchange: &Arc<Exchange>, message: EmptyMessage) {
        match self.below() {
            Some(next) => next.layer().send_empty(&next, exchange, message).await,
            None => self.stack.outbox.send_empty(exchange, message).await,
        }
    }

    pub async fn receive_request(&self, exchange: &Arc<Exchange>, request: Request) {
        match self.above() {
            Some(prev) => prev.layer().receive_request(&prev, exchange, request).await,
            None => self.stack.deliverer.deliver_request(&self.stack, exchange, request).await,
        }
    }

    pub async fn receive_response(&self, exchange: &Arc<Exchange>, response: Response) {
        match self.above() {
            Some(prev) => prev.layer().receive_response(&prev, exchange, response).await,
            None => self.stack.deliverer.deliver_response(exchange, response).await,
        }
    }

    /// empty messages are not delivered to the application
    pub async fn receive_empty(&self, exchange: &Arc<Exchange>, message: EmptyMessage) {
        if let Some(prev) = self.above() {
            prev.layer().receive_empty(&prev, exchange, message).await;
        }
    }
}

#[derive(Clone)]
pub struct WeakChain {
    stack: Weak<LayerStack>,
    index: usize,
}

impl WeakChain {
    pub fn upgrade(&self) -> Option<Chain> {
        Some(Chain {
            stack: self.stack.upgrade()?,
            index: self.index,
        })
    }
}
