use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[cfg(test)] use mockall::automock;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, trace};

use crate::message::{BlockOption, Request, Response, Token};
use crate::observe::{NotificationOrderer, ObserveRelation};
use crate::scheduler::TaskHandle;
use crate::stack::blockwise::BlockwiseStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// this endpoint issued the request
    Local,
    /// this endpoint received the request
    Remote,
}

/// (message id, peer) - matches ACK and RST to the message they refer to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMid {
    pub mid: u16,
    pub peer: SocketAddr,
}

/// (token, peer) - matches responses to requests
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyToken {
    pub token: Token,
    pub peer: SocketAddr,
}

/// (resource URI, peer) - locates the exchange of an ongoing blockwise transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyUri {
    pub uri: String,
    pub peer: SocketAddr,
}

/// Notified once when an exchange completes
#[cfg_attr(test, automock)]
pub trait ExchangeObserver: Send + Sync + 'static {
    fn completed(&self, exchange: &Exchange);
}

/// What the application eventually learns about a locally issued request
#[derive(Debug, Clone)]
pub enum Outcome {
    Pending,
    /// The latest response. For an observe request, this is replaced by every fresh notification.
    Response(Response),
    Rejected,
    TimedOut,
    Canceled,
}

/// The mutable state of an exchange. Layers lock it through [Exchange::state] and must not hold
///  the guard across an `.await`.
#[derive(Default)]
pub struct ExchangeState {
    /// the application level request, i.e. the assembled request on the receiving side of a
    ///  blockwise transfer
    pub request: Option<Request>,
    /// the request actually on the wire, possibly a block
    pub current_request: Option<Request>,
    /// the application level response
    pub response: Option<Response>,
    /// the response actually on the wire, possibly a block
    pub current_response: Option<Response>,

    pub failed_transmission_count: u32,
    pub current_timeout: Duration,
    retransmission_handle: Option<TaskHandle>,
    reregistration_handle: Option<TaskHandle>,

    pub request_block_status: Option<BlockwiseStatus>,
    pub response_block_status: Option<BlockwiseStatus>,
    /// block1 option of a fully received blockwise request that the response still has to
    ///  acknowledge
    pub block1_to_ack: Option<BlockOption>,

    pub relation: Option<Arc<ObserveRelation>>,
    pub notification_orderer: Option<NotificationOrderer>,

    timed_out: bool,
    complete: bool,
    observer: Option<Arc<dyn ExchangeObserver>>,
}

impl ExchangeState {
    /// replaces the retransmission handle, canceling the previous one
    pub fn set_retransmission_handle(&mut self, handle: Option<TaskHandle>) {
        if let Some(previous) = std::mem::replace(&mut self.retransmission_handle, handle) {
            previous.cancel();
        }
    }

    /// replaces the re-registration handle, canceling the previous one
    pub fn set_reregistration_handle(&mut self, handle: Option<TaskHandle>) {
        if let Some(previous) = std::mem::replace(&mut self.reregistration_handle, handle) {
            previous.cancel();
        }
    }

    pub fn has_retransmission_handle(&self) -> bool {
        self.retransmission_handle.is_some()
    }

    pub fn has_reregistration_handle(&self) -> bool {
        self.reregistration_handle.is_some()
    }
}

/// Correlated state of one logical request / response cycle. Created by the matcher for
///  inbound requests and by the endpoint for outbound requests, completed when the cycle is
///  fully acknowledged, answered, rejected or timed out.
pub struct Exchange {
    origin: Origin,
    state: Mutex<ExchangeState>,
    outcome: watch::Sender<Outcome>,
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut result = f.debug_struct("Exchange");
        result.field("origin", &self.origin);
        // Debug output must not block while a layer holds the state
        if let Ok(state) = self.state.try_lock() {
            result.field("request", &state.request);
            result.field("complete", &state.complete);
        }
        result.finish()
    }
}

impl Exchange {
    pub fn new(request: Request, origin: Origin) -> Arc<Exchange> {
        let (outcome, _) = watch::channel(Outcome::Pending);
        Arc::new(Exchange {
            origin,
            state: Mutex::new(ExchangeState {
                current_request: Some(request.clone()),
                request: Some(request),
                ..Default::default()
            }),
            outcome,
        })
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn state(&self) -> MutexGuard<'_, ExchangeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// convenience for the very common access to the application level request
    pub fn request(&self) -> Option<Request> {
        self.state().request.clone()
    }

    pub fn current_request(&self) -> Option<Request> {
        self.state().current_request.clone()
    }

    pub fn current_response(&self) -> Option<Response> {
        self.state().current_response.clone()
    }

    pub fn relation(&self) -> Option<Arc<ObserveRelation>> {
        self.state().relation.clone()
    }

    pub fn set_observer(&self, observer: Arc<dyn ExchangeObserver>) {
        self.state().observer = Some(observer);
    }

    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    pub fn is_timed_out(&self) -> bool {
        self.state().timed_out
    }

    /// Marks the exchange complete and notifies its observer. Only the first call has an effect.
    pub fn set_complete(&self) {
        let observer = {
            let mut state = self.state();
            if state.complete {
                return;
            }
            state.complete = true;
            state.observer.clone()
        };

        trace!("exchange complete");
        if let Some(observer) = observer {
            observer.completed(self);
        }
    }

    pub fn set_timed_out(&self) {
        self.state().timed_out = true;
        self.resolve(Outcome::TimedOut);
        self.set_complete();
    }

    /// Cancels the application level request: no more retransmissions or re-registrations, and
    ///  notifications arriving afterwards are rejected
    pub async fn cancel(&self) {
        debug!("canceling exchange");
        let (request, current_request) = {
            let mut state = self.state();
            state.set_retransmission_handle(None);
            state.set_reregistration_handle(None);
            (state.request.clone(), state.current_request.clone())
        };

        if let Some(request) = request {
            request.set_canceled(true).await;
        }
        if let Some(current_request) = current_request {
            current_request.set_canceled(true).await;
        }
        self.resolve(Outcome::Canceled);
        self.set_complete();
    }

    pub fn resolve(&self, outcome: Outcome) {
        self.outcome.send_replace(outcome);
    }

    pub fn outcome(&self) -> watch::Receiver<Outcome> {
        self.outcome.subscribe()
    }

    /// Bounded wait for the outcome of a locally issued request. Returns `None` if the wait
    ///  budget elapses, or if the exchange was rejected, timed out or canceled.
    pub async fn wait_for_response(&self, timeout: Duration) -> Option<Response> {
        let mut receiver = self.outcome.subscribe();
        let outcome = time::timeout(timeout, receiver.wait_for(|o| !matches!(o, Outcome::Pending))).await;
        match outcome {
            Ok(Ok(outcome)) => match &*outcome {
                Outcome::Response(response) => Some(response.clone()),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, ResponseCode};
    use crate::scheduler::{Scheduler, TokioScheduler};

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5683))
    }

    #[test]
    fn test_complete_notifies_observer_once() {
        let exchange = Exchange::new(Request::new(Method::Get, peer()), Origin::Local);

        let mut observer = MockExchangeObserver::new();
        observer.expect_completed()
            .times(1)
            .return_const(());
        exchange.set_observer(Arc::new(observer));

        exchange.set_complete();
        exchange.set_complete();
        assert!(exchange.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_response_times_out() {
        let exchange = Exchange::new(Request::new(Method::Get, peer()), Origin::Local);
        assert!(exchange.wait_for_response(Duration::from_secs(1)).await.is_none());
        assert!(!exchange.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_response_resolved() {
        let exchange = Exchange::new(Request::new(Method::Get, peer()), Origin::Local);

        let e = exchange.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            e.resolve(Outcome::Response(Response::new(ResponseCode::Content, peer())));
        });

        let response = exchange.wait_for_response(Duration::from_secs(1)).await;
        assert_eq!(response.map(|r| r.code), Some(ResponseCode::Content));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_unblocks_waiter_with_none() {
        let exchange = Exchange::new(Request::new(Method::Get, peer()), Origin::Local);

        let e = exchange.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            e.set_timed_out();
        });

        assert!(exchange.wait_for_response(Duration::from_secs(10)).await.is_none());
        assert!(exchange.is_timed_out());
        assert!(exchange.is_complete());
        assert!(matches!(*exchange.outcome().borrow(), Outcome::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let scheduler = TokioScheduler::current().unwrap();
        let exchange = Exchange::new(Request::new(Method::Get, peer()), Origin::Local);

        let handle = scheduler.schedule(Duration::from_secs(1), Box::pin(async {}));
        exchange.state().set_retransmission_handle(Some(handle));

        exchange.cancel().await;

        assert!(exchange.request().unwrap().is_canceled());
        assert!(exchange.is_complete());
        assert!(matches!(*exchange.outcome().borrow(), Outcome::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_retransmission_handle_cancels_previous() {
        let scheduler = TokioScheduler::current().unwrap();
        let exchange = Exchange::new(Request::new(Method::Get, peer()), Origin::Local);
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..2 {
            let f = fired.clone();
            let handle = scheduler.schedule(Duration::from_secs(1), Box::pin(async move {
                f.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
            exchange.state().set_retransmission_handle(Some(handle));
        }

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(exchange.state().has_retransmission_handle());
    }
}
