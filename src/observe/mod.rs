//! Observe relations (RFC 7641): subscriptions of peers to resources of this endpoint on the
//!  responding side, and freshness of notifications on the subscribing side.

mod orderer;
mod relation;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::exchange::Exchange;
use crate::message::{Method, Request, Token};

pub use orderer::NotificationOrderer;
pub use relation::{ObserveRelation, ObservingEndpoint};

/// observe option value of a request registering for notifications
pub const REGISTER: u32 = 0;
/// observe option value of a request deregistering
pub const DEREGISTER: u32 = 1;

/// All peers observing resources of this endpoint
#[derive(Debug, Default)]
pub struct ObserveRegistry {
    endpoints: Mutex<FxHashMap<SocketAddr, Arc<ObservingEndpoint>>>,
}

impl ObserveRegistry {
    pub fn new() -> ObserveRegistry {
        Default::default()
    }

    fn endpoints(&self) -> MutexGuard<'_, FxHashMap<SocketAddr, Arc<ObservingEndpoint>>> {
        match self.endpoints.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn find_or_create(&self, peer: SocketAddr) -> Arc<ObservingEndpoint> {
        self.endpoints()
            .entry(peer)
            .or_insert_with(|| Arc::new(ObservingEndpoint::new(peer)))
            .clone()
    }

    pub fn find(&self, peer: SocketAddr) -> Option<Arc<ObservingEndpoint>> {
        self.endpoints().get(&peer).cloned()
    }

    pub fn find_relation(&self, peer: SocketAddr, token: &Token) -> Option<Arc<ObserveRelation>> {
        self.find(peer)?.find_relation(token)
    }

    /// Handles the observe option of an inbound GET: observe=0 attaches a new (not yet
    ///  established) relation to the exchange, observe=1 cancels the peer's relation with the
    ///  request's token.
    pub fn register(&self, exchange: &Arc<Exchange>, request: &Request) {
        if request.method != Method::Get {
            return;
        }
        match request.options.observe() {
            Some(REGISTER) => {
                debug!("observe relation requested by {:?} for {}", request.peer, request.uri());
                let endpoint = self.find_or_create(request.peer);
                let relation = ObserveRelation::new(&endpoint, exchange, request);
                endpoint.add_relation(relation.clone());
                exchange.state().relation = Some(relation);
            }
            Some(DEREGISTER) => {
                if let Some(relation) = self.find_relation(request.peer, &request.token) {
                    debug!("observe relation {:?} deregistered by {:?}", request.token, request.peer);
                    relation.cancel();
                }
            }
            _ => {}
        }
    }

    /// Cancels all relations of all peers
    pub fn clear(&self) {
        let endpoints = std::mem::take(&mut *self.endpoints());
        for endpoint in endpoints.values() {
            endpoint.cancel_all();
        }
    }
}
