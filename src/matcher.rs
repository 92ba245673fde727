use std::hash::Hash;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::deduplication::Deduplicator;
use crate::exchange::{Exchange, ExchangeObserver, KeyMid, KeyToken, KeyUri, Origin};
use crate::message::{EmptyMessage, MessageType, Request, Response};
use crate::scheduler::Scheduler;
use crate::util::random::{random_mid_start, RngRandom};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// removes the entry only if it still refers to the given exchange
fn remove_if_same<K: Hash + Eq>(map: &Mutex<FxHashMap<K, Arc<Exchange>>>, key: &K, exchange: &Exchange) -> bool {
    let mut map = lock(map);
    if map.get(key).map(|e| std::ptr::eq(e.as_ref(), exchange)).unwrap_or(false) {
        map.remove(key);
        return true;
    }
    false
}

/// What to do with an inbound response
#[derive(Debug)]
pub enum ResponseMatch {
    Matched(Arc<Exchange>),
    /// not delivered, e.g. an ACK for an exchange that was already cleaned up, or a token match
    ///  for an earlier cycle of the exchange
    Discard,
    /// unknown token on a CON or NON response: reject it with RST
    Reject,
}

#[derive(Default)]
struct MatcherTables {
    /// outgoing messages by message id, to match ACK and RST
    by_mid: Mutex<FxHashMap<KeyMid, Arc<Exchange>>>,
    /// outgoing requests by token, to match responses
    by_token: Mutex<FxHashMap<KeyToken, Arc<Exchange>>>,
    /// ongoing blockwise transfers of inbound requests
    ongoing: Mutex<FxHashMap<KeyUri, Arc<Exchange>>>,
}

/// Removes a completed exchange from the tables. It holds the tables weakly since exchanges
///  (and thus their observer) may outlive the matcher.
struct MatcherCleanup {
    tables: Weak<MatcherTables>,
}

impl ExchangeObserver for MatcherCleanup {
    fn completed(&self, exchange: &Exchange) {
        let Some(tables) = self.tables.upgrade() else {
            return;
        };

        let (request, current_request, response, current_response) = {
            let state = exchange.state();
            (state.request.clone(), state.current_request.clone(), state.response.clone(), state.current_response.clone())
        };

        match exchange.origin() {
            Origin::Local => {
                let Some(request) = request else {
                    return;
                };
                let token = current_request.as_ref()
                    .map(|r| r.token.clone())
                    .unwrap_or_else(|| request.token.clone());
                let key_token = KeyToken { token, peer: request.peer };
                debug!("exchange completed: cleaning up {:?}", key_token);
                remove_if_same(&tables.by_token, &key_token, exchange);

                // in case an empty ACK was lost
                for mid in [request.mid(), current_request.and_then(|r| r.mid())].into_iter().flatten() {
                    remove_if_same(&tables.by_mid, &KeyMid { mid, peer: request.peer }, exchange);
                }
            }
            Origin::Remote => {
                if let Some(current_request) = current_request {
                    let key_uri = KeyUri { uri: current_request.uri(), peer: current_request.peer };
                    if remove_if_same(&tables.ongoing, &key_uri, exchange) {
                        debug!("remote ongoing exchange completed: cleaning up {:?}", key_uri);
                    }
                }
                // only message ids are stored for responses, no tokens
                for response in [response, current_response].into_iter().flatten() {
                    if let Some(mid) = response.mid() {
                        remove_if_same(&tables.by_mid, &KeyMid { mid, peer: response.peer }, exchange);
                    }
                }
            }
        }
    }
}

struct Lifecycle {
    started: bool,
    scheduler: Option<Arc<dyn Scheduler>>,
}

/// Correlates inbound messages with exchanges, detects duplicates and allocates message ids
///  for outbound messages.
pub struct Matcher {
    tables: Arc<MatcherTables>,
    cleanup: Arc<dyn ExchangeObserver>,
    deduplicator: Arc<dyn Deduplicator>,
    current_mid: AtomicU16,
    lifecycle: Mutex<Lifecycle>,
}

impl Matcher {
    pub fn new(config: &NetworkConfig, deduplicator: Arc<dyn Deduplicator>) -> Matcher {
        let tables = Arc::new(MatcherTables::default());
        let initial_mid = if config.use_random_mid_start {
            random_mid_start::<RngRandom>()
        }
        else {
            0
        };

        Matcher {
            cleanup: Arc::new(MatcherCleanup { tables: Arc::downgrade(&tables) }),
            tables,
            deduplicator,
            current_mid: AtomicU16::new(initial_mid),
            lifecycle: Mutex::new(Lifecycle {
                started: false,
                scheduler: None,
            }),
        }
    }

    pub fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        self.deduplicator.set_scheduler(scheduler.clone());
        lock(&self.lifecycle).scheduler = Some(scheduler);
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.started {
            return Ok(());
        }
        if lifecycle.scheduler.is_none() {
            bail!("matcher has no scheduler to run the deduplicator's eviction");
        }
        lifecycle.started = true;
        self.deduplicator.start();
        Ok(())
    }

    pub fn stop(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if !lifecycle.started {
            return;
        }
        lifecycle.started = false;
        self.deduplicator.stop();
        self.clear();
    }

    pub fn clear(&self) {
        lock(&self.tables.by_mid).clear();
        lock(&self.tables.by_token).clear();
        lock(&self.tables.ongoing).clear();
        self.deduplicator.clear();
    }

    fn next_mid(&self) -> u16 {
        // wraps around at 2^16
        self.current_mid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn send_request(&self, exchange: &Arc<Exchange>, request: &Request) {
        if request.mid().is_none() {
            request.set_mid(self.next_mid());
        }
        let Some(mid) = request.mid() else {
            return;
        };

        let key_mid = KeyMid { mid, peer: request.peer };
        let key_token = KeyToken { token: request.token.clone(), peer: request.peer };
        exchange.set_observer(self.cleanup.clone());

        debug!("stored open request by {:?}, {:?}", key_mid, key_token);
        lock(&self.tables.by_mid).insert(key_mid, exchange.clone());
        lock(&self.tables.by_token).insert(key_token, exchange.clone());
    }

    pub fn send_response(&self, exchange: &Arc<Exchange>, response: &Response) {
        if response.mid().is_none() {
            response.set_mid(self.next_mid());
        }
        let Some(mid) = response.mid() else {
            return;
        };

        // CON and NON as well, to match ACK and RST to the exchange
        lock(&self.tables.by_mid).insert(KeyMid { mid, peer: response.peer }, exchange.clone());

        if response.options.block2().is_some() {
            let (request, blocks_remaining) = {
                let state = exchange.state();
                let remaining = state.response_block_status.as_ref()
                    .map(|status| !status.complete)
                    .unwrap_or(false);
                (state.request.clone(), remaining)
            };
            if let Some(request) = request {
                let key_uri = KeyUri { uri: request.uri(), peer: response.peer };
                if blocks_remaining && !response.options.has_observe() {
                    debug!("ongoing block2 transfer started or continued, storing {:?}", key_uri);
                    lock(&self.tables.ongoing).insert(key_uri, exchange.clone());
                }
                else {
                    debug!("ongoing block2 transfer completed, cleaning up {:?}", key_uri);
                    lock(&self.tables.ongoing).remove(&key_uri);
                }
            }
        }

        match response.msg_type() {
            Some(MessageType::Ack) | Some(MessageType::Non) => {
                // the exchange is over with sending this response
                if response.last {
                    exchange.set_complete();
                }
            }
            // CON: wait for ACK or RST
            _ => {}
        }
    }

    pub fn send_empty(&self, exchange: Option<&Arc<Exchange>>, message: &EmptyMessage) {
        if message.msg_type() == Some(MessageType::Rst) {
            if let Some(exchange) = exchange {
                // we rejected the request or response
                exchange.set_complete();
            }
        }
        if message.mid().is_none() {
            warn!("empty message {:?} has no message id", message);
        }
    }

    pub fn receive_request(&self, request: &Request) -> Arc<Exchange> {
        let key_mid = KeyMid { mid: request.mid().unwrap_or_default(), peer: request.peer };

        if request.options.block1().is_none() && request.options.block2().is_none() {
            let exchange = self.remote_exchange(request);
            return match self.deduplicator.find_previous(key_mid, &exchange) {
                None => exchange,
                Some(previous) => {
                    info!("request is a duplicate: {:?}", request);
                    request.set_duplicate(true);
                    previous
                }
            };
        }

        let key_uri = KeyUri { uri: request.uri(), peer: request.peer };
        trace!("looking up ongoing exchange for {:?}", key_uri);
        let ongoing = lock(&self.tables.ongoing).get(&key_uri).cloned();

        if let Some(ongoing) = ongoing {
            if self.deduplicator.find_previous(key_mid, &ongoing).is_some() {
                info!("request is a duplicate: {:?}", request);
                request.set_duplicate(true);
            }
            return ongoing;
        }

        // No ongoing exchange for this block. The same instance must go into the deduplicator
        //  and the ongoing table, or a retransmitted first block could see a different exchange
        //  than the second one.
        let exchange = self.remote_exchange(request);
        match self.deduplicator.find_previous(key_mid, &exchange) {
            None => {
                debug!("new ongoing exchange for remote blockwise request with key {:?}", key_uri);
                lock(&self.tables.ongoing).insert(key_uri, exchange.clone());
                exchange
            }
            Some(previous) => {
                info!("request is a duplicate: {:?}", request);
                request.set_duplicate(true);
                previous
            }
        }
    }

    fn remote_exchange(&self, request: &Request) -> Arc<Exchange> {
        let exchange = Exchange::new(request.clone(), Origin::Remote);
        exchange.set_observer(self.cleanup.clone());
        exchange
    }

    pub fn receive_response(&self, response: &Response) -> ResponseMatch {
        let key_mid = KeyMid { mid: response.mid().unwrap_or_default(), peer: response.peer };
        let key_token = KeyToken { token: response.token.clone(), peer: response.peer };

        let exchange = lock(&self.tables.by_token).get(&key_token).cloned();
        let Some(exchange) = exchange else {
            if response.msg_type() != Some(MessageType::Ack) {
                info!("response with unknown token {:?}: rejecting", key_token);
                return ResponseMatch::Reject;
            }
            debug!("ACK response with unknown token {:?}: ignoring", key_token);
            return ResponseMatch::Discard;
        };

        if self.deduplicator.find_previous(key_mid.clone(), &exchange).is_some() {
            debug!("duplicate response {:?}", response);
            response.set_duplicate(true);
        }
        else {
            trace!("exchange got reply: cleaning up {:?}", key_mid);
            lock(&self.tables.by_mid).remove(&key_mid);
        }

        let current_mid = exchange.current_request().and_then(|r| r.mid());
        if response.msg_type() == Some(MessageType::Ack) && current_mid != response.mid() {
            // token matches, but this is the piggy-backed response to an earlier request of the
            //  exchange
            warn!("token matches but not message id: expected {:?} but was {:?}", current_mid, response.mid());
            return ResponseMatch::Discard;
        }
        ResponseMatch::Matched(exchange)
    }

    pub fn receive_empty(&self, message: &EmptyMessage) -> Option<Arc<Exchange>> {
        let key_mid = KeyMid { mid: message.mid().unwrap_or_default(), peer: message.peer };
        match lock(&self.tables.by_mid).remove(&key_mid) {
            Some(exchange) => {
                trace!("exchange got reply: cleaning up {:?}", key_mid);
                Some(exchange)
            }
            None => {
                info!("empty message does not match any exchange: {:?}", message);
                None
            }
        }
    }

    #[cfg(test)]
    fn table_sizes(&self) -> (usize, usize, usize) {
        (lock(&self.tables.by_mid).len(), lock(&self.tables.by_token).len(), lock(&self.tables.ongoing).len())
    }
}
