//! The endpoint is where all other parts come together: it listens on a datagram socket,
//!  dispatches inbound datagrams through the matcher into the layer stack, and has an API for
//!  application code to send requests and respond to requests.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

use crate::config::ConfigHandle;
use crate::deduplication::SweepDeduplicator;
use crate::exchange::{Exchange, Origin, Outcome};
use crate::matcher::{Matcher, ResponseMatch};
use crate::message::codec::{self, ParsedMessage};
use crate::message::{EmptyMessage, MessageType, Request, Response};
use crate::observe::ObserveRegistry;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::stack::blockwise::BlockwiseLayer;
use crate::stack::observe::ObserveLayer;
use crate::stack::reliability::ReliabilityLayer;
use crate::stack::{LayerStack, MessageDeliverer, Outbox};
use crate::util::random::{random_token, RngRandom};

/// The largest datagram the receive loop accepts
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Abstraction for the actual sending of a datagram, introduced to facilitate mocking the I/O
///  part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);
}

#[async_trait]
impl DatagramSender for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending datagram to {:?}", to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}

/// Application code handling inbound requests. The handler responds through the responder,
///  either right away or later (which makes the response a separate response), and may keep
///  the responder to send notifications if the request established an observe relation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, responder: ExchangeResponder);
}

/// Application side handle of an inbound exchange
#[derive(Clone)]
pub struct ExchangeResponder {
    stack: Arc<LayerStack>,
    exchange: Arc<Exchange>,
}

impl ExchangeResponder {
    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    /// the (reassembled) request
    pub fn request(&self) -> Option<Request> {
        self.exchange.request()
    }

    /// true while the peer observes the requested resource through this exchange
    pub fn is_observed(&self) -> bool {
        self.exchange.relation()
            .map(|r| !r.is_canceled())
            .unwrap_or(false)
    }

    /// Sends a response. Successful responses to an observe request get the relation's next
    ///  observe number unless they carry one already.
    pub async fn respond(&self, mut response: Response) {
        if let Some(relation) = self.exchange.relation() {
            if !relation.is_canceled() && response.code.is_success() && !response.options.has_observe() {
                response.options.set_observe(relation.next_observe_number());
            }
        }

        self.exchange.state().response = Some(response.clone());
        self.stack.send_response(&self.exchange, response).await
    }

    /// Sends a notification to the observing peer. Returns false if the exchange has no observe
    ///  relation, or it was canceled.
    pub async fn notify(&self, response: Response) -> bool {
        if !self.is_observed() {
            debug!("no observe relation for notification {:?}", response.code);
            return false;
        }
        self.respond(response).await;
        true
    }

    /// Acknowledges a CON request with an empty ACK, announcing a separate response
    pub async fn accept(&self) {
        let Some(request) = self.exchange.current_request() else { return; };
        if request.is_confirmable() && !request.is_acknowledged() {
            request.set_acknowledged(true).await;
            self.stack.send_empty(&self.exchange, EmptyMessage::ack_for(&request)).await;
        }
    }

    /// Rejects the request with RST
    pub async fn reject(&self) {
        let Some(request) = self.exchange.current_request() else { return; };
        request.set_rejected(true).await;
        self.stack.send_empty(&self.exchange, EmptyMessage::rst_for(&request)).await;
    }
}

/// Below the lowest layer: registers the message with the matcher, then serializes and sends it
struct EndpointOutbox {
    matcher: Arc<Matcher>,
    sender: Arc<dyn DatagramSender>,
}

impl EndpointOutbox {
    async fn send(&self, to: SocketAddr, datagram: anyhow::Result<bytes::Bytes>) {
        match datagram {
            Ok(datagram) => self.sender.send_datagram(to, &datagram).await,
            Err(e) => error!("failed to serialize message for {:?}: {}", to, e),
        }
    }
}

#[async_trait]
impl Outbox for EndpointOutbox {
    async fn send_request(&self, exchange: &Arc<Exchange>, request: Request) {
        self.matcher.send_request(exchange, &request);
        self.send(request.peer, codec::ser_request(&request)).await
    }

    async fn send_response(&self, exchange: &Arc<Exchange>, response: Response) {
        self.matcher.send_response(exchange, &response);
        self.send(response.peer, codec::ser_response(&response)).await
    }

    async fn send_empty(&self, exchange: &Arc<Exchange>, message: EmptyMessage) {
        self.matcher.send_empty(Some(exchange), &message);
        self.send(message.peer, codec::ser_empty(&message)).await
    }
}

/// Above the highest layer: hands requests to the application and resolves the outcome of
///  locally issued requests
struct EndpointDeliverer {
    registry: Arc<ObserveRegistry>,
    handler: Arc<dyn RequestHandler>,
}

#[async_trait]
impl MessageDeliverer for EndpointDeliverer {
    async fn deliver_request(&self, stack: &Arc<LayerStack>, exchange: &Arc<Exchange>, request: Request) {
        self.registry.register(exchange, &request);
        self.handler.handle_request(ExchangeResponder {
            stack: stack.clone(),
            exchange: exchange.clone(),
        }).await
    }

    async fn deliver_response(&self, exchange: &Arc<Exchange>, response: Response) {
        let is_notification = response.options.has_observe();
        exchange.resolve(Outcome::Response(response));
        if !is_notification {
            exchange.set_complete();
        }
    }
}

pub struct Endpoint {
    config: ConfigHandle,
    matcher: Arc<Matcher>,
    stack: Arc<LayerStack>,
    registry: Arc<ObserveRegistry>,
    sender: Arc<dyn DatagramSender>,
}

impl Endpoint {
    pub fn new(
        config: ConfigHandle,
        sender: Arc<dyn DatagramSender>,
        scheduler: Arc<dyn Scheduler>,
        handler: Arc<dyn RequestHandler>,
    ) -> Endpoint {
        let deduplicator = Arc::new(SweepDeduplicator::new(config.clone()));
        let matcher = Arc::new(Matcher::new(&config.load(), deduplicator));
        matcher.set_scheduler(scheduler.clone());

        let registry = Arc::new(ObserveRegistry::new());
        let stack = LayerStack::new(
            vec![
                Arc::new(ObserveLayer::new(config.clone(), scheduler.clone())),
                Arc::new(BlockwiseLayer::new(config.clone())),
                Arc::new(ReliabilityLayer::<RngRandom>::new(config.clone(), scheduler)),
            ],
            Arc::new(EndpointOutbox {
                matcher: matcher.clone(),
                sender: sender.clone(),
            }),
            Arc::new(EndpointDeliverer {
                registry: registry.clone(),
                handler,
            }),
        );

        Endpoint {
            config,
            matcher,
            stack,
            registry,
            sender,
        }
    }

    /// Binds a UDP socket and creates an endpoint sending through it, with timers on the current
    ///  tokio runtime. The socket is returned for [Endpoint::recv_loop].
    pub async fn bind(config: ConfigHandle, addr: SocketAddr, handler: Arc<dyn RequestHandler>) -> anyhow::Result<(Endpoint, Arc<UdpSocket>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await
            .with_context(|| format!("binding UDP socket to {:?}", addr))?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        let scheduler = Arc::new(TokioScheduler::current()?);
        let endpoint = Endpoint::new(config, Arc::new(socket.clone()), scheduler, handler);
        Ok((endpoint, socket))
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn start(&self) -> anyhow::Result<()> {
        info!("starting endpoint");
        self.matcher.start()
    }

    pub fn stop(&self) {
        info!("stopping endpoint");
        self.matcher.stop();
        self.registry.clear();
    }

    /// Sends a request, assigning a random token if it has none. The returned exchange gives
    ///  access to the outcome.
    pub async fn send_request(&self, mut request: Request) -> Arc<Exchange> {
        if request.token.is_empty() {
            request.token = random_token::<RngRandom>();
        }
        let exchange = Exchange::new(request.clone(), Origin::Local);
        self.stack.send_request(&exchange, request).await;
        exchange
    }

    /// Responds on an exchange outside of a [RequestHandler] callback
    pub async fn send_response(&self, exchange: &Arc<Exchange>, response: Response) {
        ExchangeResponder {
            stack: self.stack.clone(),
            exchange: exchange.clone(),
        }.respond(response).await
    }

    async fn send_unmatched_empty(&self, message: EmptyMessage) {
        match codec::ser_empty(&message) {
            Ok(datagram) => self.sender.send_datagram(message.peer, &datagram).await,
            Err(e) => error!("failed to serialize {:?}: {}", message, e),
        }
    }

    pub async fn receive_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let parsed = match codec::deser(datagram, from) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("malformed datagram from {:?}: {}", from, e);
                if let Some((MessageType::Con, mid)) = codec::peek_header(datagram) {
                    self.send_unmatched_empty(EmptyMessage::new(MessageType::Rst, mid, from)).await;
                }
                return;
            }
        };

        match parsed {
            ParsedMessage::Request(request) => {
                trace!("received request {:?}", request);
                let exchange = self.matcher.receive_request(&request);
                self.stack.receive_request(&exchange, request).await;
            }
            ParsedMessage::Response(response) => {
                trace!("received response {:?}", response);
                match self.matcher.receive_response(&response) {
                    ResponseMatch::Matched(exchange) => self.stack.receive_response(&exchange, response).await,
                    ResponseMatch::Discard => {}
                    ResponseMatch::Reject => self.send_unmatched_empty(EmptyMessage::rst_for(&response)).await,
                }
            }
            ParsedMessage::Empty(message) => self.receive_empty(message).await,
        }
    }

    async fn receive_empty(&self, message: EmptyMessage) {
        match message.msg_type() {
            Some(MessageType::Con) => {
                debug!("responding to ping from {:?}", message.peer);
                self.send_unmatched_empty(EmptyMessage::rst_for(&message)).await;
            }
            Some(MessageType::Non) => debug!("ignoring empty NON from {:?}", message.peer),
            _ => {
                let Some(exchange) = self.matcher.receive_empty(&message) else { return; };
                let is_ack = message.msg_type() == Some(MessageType::Ack);
                self.stack.receive_empty(&exchange, message).await;

                // a CON response that ends the exchange was acknowledged
                let response_done = exchange.current_response()
                    .map(|r| r.last && r.is_acknowledged())
                    .unwrap_or(false);
                if is_ack && exchange.origin() == Origin::Remote && response_done {
                    exchange.set_complete();
                }
            }
        }
    }

    /// Receives datagrams until the socket fails permanently. Each datagram is processed in
    ///  a tracing span of its own.
    pub async fn recv_loop(&self, socket: Arc<UdpSocket>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    warn!("socket error: {}", e);
                    continue;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", ?from, len = num_read);
            self.receive_datagram(&buf[..num_read], from)
                .instrument(span)
                .await;
        }
    }
}
