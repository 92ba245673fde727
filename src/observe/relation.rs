use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::exchange::Exchange;
use crate::message::options::MAX_OBSERVE;
use crate::message::{MessageType, Request, Response, Token};

#[derive(Debug)]
struct RelationState {
    established: bool,
    canceled: bool,
    /// the CON notification in transit, if any
    current_control: Option<Response>,
    /// the freshest notification waiting for the current one; newer ones replace it
    next_control: Option<Response>,
    check_count: u32,
    last_check: Instant,
    observe_number: u32,
}

/// A peer's subscription to a resource, on the responding side
#[derive(Debug)]
pub struct ObserveRelation {
    peer: SocketAddr,
    token: Token,
    uri: String,
    endpoint: Weak<ObservingEndpoint>,
    exchange: Weak<Exchange>,
    state: Mutex<RelationState>,
}

fn is_in_transit(response: &Response) -> bool {
    response.msg_type() == Some(MessageType::Con) && !response.is_acknowledged() && !response.is_timed_out()
}

impl ObserveRelation {
    pub fn new(endpoint: &Arc<ObservingEndpoint>, exchange: &Arc<Exchange>, request: &Request) -> Arc<ObserveRelation> {
        Arc::new(ObserveRelation {
            peer: request.peer,
            token: request.token.clone(),
            uri: request.uri(),
            endpoint: Arc::downgrade(endpoint),
            exchange: Arc::downgrade(exchange),
            state: Mutex::new(RelationState {
                established: false,
                canceled: false,
                current_control: None,
                next_control: None,
                check_count: 0,
                last_check: Instant::now(),
                observe_number: 1,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, RelationState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn exchange(&self) -> Option<Arc<Exchange>> {
        self.exchange.upgrade()
    }

    pub fn is_established(&self) -> bool {
        self.state().established
    }

    pub fn set_established(&self) {
        let mut state = self.state();
        if !state.canceled {
            state.established = true;
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.state().canceled
    }

    /// the observe number for the next notification
    pub fn next_observe_number(&self) -> u32 {
        let mut state = self.state();
        let result = state.observe_number;
        state.observe_number = (result + 1) & MAX_OBSERVE;
        result
    }

    /// Keep-alive policy: true if this notification should be sent as CON to check the peer is
    ///  still interested
    pub fn check(&self, config: &NetworkConfig) -> bool {
        let now = Instant::now();
        let mut state = self.state();

        state.check_count += 1;
        let check = state.check_count >= config.notification_check_interval_count
            || now.duration_since(state.last_check) > config.notification_check_interval;
        if check {
            state.check_count = 0;
            state.last_check = now;
        }
        check
    }

    /// Returns true if the notification should be sent now, false if it was postponed because
    ///  another CON notification is in transit. Deciding and recording must happen atomically.
    pub fn send_or_postpone(&self, response: &Response) -> bool {
        let mut state = self.state();
        if state.current_control.as_ref().map(is_in_transit).unwrap_or(false) {
            debug!("a notification is still in transit, postponing {:?}", response.code);
            state.next_control = Some(response.clone());
            return false;
        }
        state.current_control = Some(response.clone());
        state.next_control = None;
        true
    }

    /// The current notification was acknowledged: the postponed one (if any) becomes current
    pub fn promote_next(&self) -> Option<Response> {
        let mut state = self.state();
        let next = state.next_control.take();
        state.current_control = next.clone();
        next
    }

    /// The current notification is due for retransmission: a postponed one replaces it, and is
    ///  forced to CON so there is still one CON in transit. Returns the replacement and whether
    ///  it was CON already.
    pub fn preempt(&self) -> Option<(Response, bool)> {
        let mut state = self.state();
        let next = state.next_control.take()?;
        let was_confirmable = next.is_confirmable();
        next.set_type(MessageType::Con);
        state.current_control = Some(next.clone());
        Some((next, was_confirmable))
    }

    /// Ends the relation without completing the exchange, which still has to deliver a final
    ///  notification. That notification may be the postponed one, so it is kept.
    pub fn terminate(&self) {
        {
            let mut state = self.state();
            state.established = false;
            state.canceled = true;
        }
        self.detach();
    }

    /// Ends the relation and completes its exchange
    pub fn cancel(&self) {
        debug!("canceling observe relation {:?} for {} with {:?}", self.token, self.uri, self.peer);
        self.state().next_control = None;
        self.terminate();
        if let Some(exchange) = self.exchange.upgrade() {
            exchange.set_complete();
        }
    }

    /// Cancels all relations with the same peer
    pub fn cancel_all(&self) {
        match self.endpoint.upgrade() {
            Some(endpoint) => endpoint.cancel_all(),
            None => self.cancel(),
        }
    }

    /// removes the relation from its observing endpoint
    pub fn detach(&self) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.remove_relation(self);
        }
    }
}

/// A peer observing resources of this endpoint, with all its relations
#[derive(Debug)]
pub struct ObservingEndpoint {
    peer: SocketAddr,
    relations: Mutex<Vec<Arc<ObserveRelation>>>,
}

impl ObservingEndpoint {
    pub fn new(peer: SocketAddr) -> ObservingEndpoint {
        ObservingEndpoint {
            peer,
            relations: Default::default(),
        }
    }

    fn relations(&self) -> MutexGuard<'_, Vec<Arc<ObserveRelation>>> {
        match self.relations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Adds a relation, replacing an existing relation with the same token. The replacement
    ///  (i.e. a re-registration) continues the replaced relation's observe numbers, so the peer
    ///  does not discard its notifications as stale.
    pub fn add_relation(&self, relation: Arc<ObserveRelation>) {
        let replaced = {
            let mut relations = self.relations();
            let replaced = relations.iter()
                .position(|r| r.token == relation.token)
                .map(|idx| relations.remove(idx));
            relations.push(relation.clone());
            replaced
        };
        if let Some(replaced) = replaced {
            debug!("replacing observe relation {:?} with {:?}", replaced.token, self.peer);
            let observe_number = replaced.state().observe_number;
            relation.state().observe_number = observe_number;
            replaced.cancel();
        }
    }

    pub fn remove_relation(&self, relation: &ObserveRelation) {
        self.relations().retain(|r| !std::ptr::eq(r.as_ref(), relation));
    }

    pub fn find_relation(&self, token: &Token) -> Option<Arc<ObserveRelation>> {
        self.relations().iter()
            .find(|r| &r.token == token)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.relations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        let relations = std::mem::take(&mut *self.relations());
        info!("canceling all {} observe relations with {:?}", relations.len(), self.peer);
        for relation in relations {
            relation.cancel();
        }
    }
}
