//! Pacing of notifications on the responding side, re-registration and freshness of
//!  notifications on the subscribing side.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::ConfigHandle;
use crate::exchange::{Exchange, Origin};
use crate::message::{EmptyMessage, MessageObserver, MessageType, Method, Response};
use crate::observe::{NotificationOrderer, REGISTER};
use crate::scheduler::Scheduler;
use crate::stack::{Chain, Layer, WeakChain};

/// Observes the CON notification in transit for a relation: sends the postponed notification
///  when it is acknowledged or due for retransmission, and cancels the peer's relations when it
///  times out.
///
/// The notification itself is taken from the exchange rather than stored here, because the
///  message owns its observers.
struct NotificationController {
    chain: WeakChain,
    exchange: Weak<Exchange>,
}

impl NotificationController {
    fn upgrade(&self) -> Option<(Chain, Arc<Exchange>)> {
        Some((self.chain.upgrade()?, self.exchange.upgrade()?))
    }

    /// a controller for the notification replacing the one this controller observes
    fn for_replacement(&self) -> Arc<dyn MessageObserver> {
        Arc::new(NotificationController {
            chain: self.chain.clone(),
            exchange: self.exchange.clone(),
        })
    }
}

#[async_trait]
impl MessageObserver for NotificationController {
    async fn on_acknowledgement(&self) {
        let Some((chain, exchange)) = self.upgrade() else { return; };
        let Some(relation) = exchange.relation() else { return; };

        if let Some(next) = relation.promote_next() {
            debug!("notification has been acknowledged, sending the next one");
            chain.send_response(&exchange, next).await;
        }
    }

    async fn on_retransmission(&self) {
        let Some((chain, exchange)) = self.upgrade() else { return; };
        let Some(relation) = exchange.relation() else { return; };
        let Some(current) = exchange.current_response() else { return; };

        if let Some((next, was_confirmable)) = relation.preempt() {
            debug!("notification {:?} is due for retransmission, replacing it with a fresher one", current.mid());
            current.set_canceled(true).await;
            if !was_confirmable {
                next.add_observer(self.for_replacement());
            }
            chain.send_response(&exchange, next).await;
        }
    }

    async fn on_timeout(&self) {
        let Some(exchange) = self.exchange.upgrade() else { return; };
        if let Some(relation) = exchange.relation() {
            debug!("notification timed out, canceling all relations with {:?}", relation.peer());
            relation.cancel_all();
        }
    }
}

/// The layer closest to the application.
///
/// On the responding side, notifications for an established relation are paced so there is
///  never more than one CON notification in transit: newer notifications replace a postponed
///  one, which is sent when the notification in transit is acknowledged (or replaces it when it
///  is retransmitted).
///
/// On the subscribing side, every notification schedules a re-registration after its Max-Age,
///  and notifications that are not fresher than the last one are dropped.
pub struct ObserveLayer {
    config: ConfigHandle,
    scheduler: Arc<dyn Scheduler>,
}

impl ObserveLayer {
    pub fn new(config: ConfigHandle, scheduler: Arc<dyn Scheduler>) -> ObserveLayer {
        ObserveLayer {
            config,
            scheduler,
        }
    }

    fn prepare_reregistration(&self, chain: &Chain, exchange: &Arc<Exchange>, response: &Response) {
        let backoff = self.config.load().notification_reregistration_backoff;
        let timeout = Duration::from_secs(response.options.max_age() as u64) + backoff;
        trace!("scheduling re-registration in {:?}", timeout);

        let handle = self.scheduler.schedule(timeout, Box::pin(
            Self::reregister(chain.clone(), exchange.clone())
        ));
        exchange.state().set_reregistration_handle(Some(handle));
    }

    async fn reregister(chain: Chain, exchange: Arc<Exchange>) {
        let Some(request) = exchange.request() else { return; };
        if request.is_canceled() {
            debug!("dropping re-registration for canceled request {:?}", request.token);
            return;
        }

        let mut refresh = request.derive();
        refresh.method = Method::Get;
        refresh.options.set_observe(REGISTER);
        debug!("re-registering for notifications of {}", refresh.uri());
        chain.send_request(&exchange, refresh).await
    }
}

#[async_trait]
impl Layer for ObserveLayer {
    async fn send_response(&self, chain: &Chain, exchange: &Arc<Exchange>, mut response: Response) {
        let Some(relation) = exchange.relation() else {
            return chain.send_response(exchange, response).await;
        };
        if relation.is_canceled() {
            debug!("observe relation {:?} was canceled, dropping notification {:?}", relation.token(), response.code);
            return;
        }

        if !relation.is_established() {
            if response.code.is_success() && response.options.has_observe() {
                debug!("establishing observe relation {:?} for {}", relation.token(), relation.uri());
                relation.set_established();
            }
            else {
                debug!("response {:?} does not establish observe relation {:?}", response.code, relation.token());
                relation.detach();
                exchange.state().relation = None;
                return chain.send_response(exchange, response).await;
            }
        }

        let request_settled = exchange.request()
            .map(|r| r.is_acknowledged() || r.msg_type() == Some(MessageType::Non))
            .unwrap_or(false);
        let mut terminates = false;
        if request_settled {
            if !response.code.is_success() {
                response.set_type(MessageType::Con);
                response.last = true;
                terminates = true;
            }
            else if relation.check(&self.config.load()) {
                trace!("keep-alive: sending notification as CON");
                response.set_type(MessageType::Con);
                response.last = false;
            }
            else {
                if response.msg_type().is_none() {
                    response.set_type(MessageType::Non);
                }
                response.last = false;
            }
        }
        else {
            response.last = false;
        }

        if response.is_confirmable() {
            response.add_observer(Arc::new(NotificationController {
                chain: chain.downgrade(),
                exchange: Arc::downgrade(exchange),
            }));
        }

        // an error notification waits for a CON in transit like any other, and is then the last one
        let send_now = relation.send_or_postpone(&response);
        if terminates {
            debug!("error notification {:?} terminates observe relation {:?}", response.code, relation.token());
            relation.terminate();
        }
        if send_now {
            chain.send_response(exchange, response).await
        }
    }

    async fn receive_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        let Some(observe) = response.options.observe() else {
            return chain.receive_response(exchange, response).await;
        };

        let canceled = exchange.request()
            .map(|r| r.is_canceled())
            .unwrap_or(false);
        if canceled {
            debug!("notification for canceled request {:?}, rejecting it", response.token);
            return chain.send_empty(exchange, EmptyMessage::rst_for(&response)).await;
        }

        let fresh = exchange.state().notification_orderer
            .get_or_insert_with(NotificationOrderer::new)
            .is_new(observe);
        if !fresh {
            debug!("dropping stale notification {} for {:?}", observe, response.token);
            return;
        }

        self.prepare_reregistration(chain, exchange, &response);
        chain.receive_response(exchange, response).await
    }

    async fn receive_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, message: EmptyMessage) {
        if message.msg_type() == Some(MessageType::Rst) && exchange.origin() == Origin::Remote {
            if let Some(relation) = exchange.relation() {
                debug!("notification rejected, canceling observe relation {:?}", relation.token());
                relation.cancel();
            }
        }
        chain.receive_empty(exchange, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::time;
    use crate::config::NetworkConfig;
    use crate::message::{BlockOption, Request, ResponseCode, Token};
    use crate::observe::{ObserveRegistry, ObserveRelation};
    use crate::scheduler::TokioScheduler;
    use crate::stack::blockwise::BlockwiseLayer;
    use crate::stack::reliability::ReliabilityLayer;
    use crate::stack::LayerStack;
    use crate::test_util::{test_peer, RecordingDeliverer, RecordingOutbox, Sent};
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};

    struct Fixture {
        stack: Arc<LayerStack>,
        outbox: Arc<RecordingOutbox>,
        deliverer: Arc<RecordingDeliverer>,
    }

    fn fixture(config: NetworkConfig) -> Fixture {
        let config = ConfigHandle::new(config).unwrap();
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current().unwrap());
        let outbox = Arc::new(RecordingOutbox::default());
        let deliverer = Arc::new(RecordingDeliverer::default());
        let stack = LayerStack::new(
            vec![
                Arc::new(ObserveLayer::new(config.clone(), scheduler.clone())),
                Arc::new(BlockwiseLayer::new(config.clone())),
                Arc::new(ReliabilityLayer::<MockRandom>::new(config, scheduler)),
            ],
            outbox.clone(),
            deliverer.clone(),
        );
        Fixture { stack, outbox, deliverer }
    }

    /// an inbound CON GET with observe=0 and a registered (not yet established) relation
    fn observed_exchange(registry: &ObserveRegistry) -> (Request, Arc<Exchange>, Arc<ObserveRelation>) {
        let mut request = Request::new(Method::Get, test_peer(1));
        request.token = Token::from([11u8].as_slice());
        request.options.set_uri_path("/temp");
        request.options.set_observe(REGISTER);
        request.set_type(MessageType::Con);
        request.set_mid(7);
        let exchange = Exchange::new(request.clone(), Origin::Remote);
        registry.register(&exchange, &request);
        let relation = exchange.relation().unwrap();
        (request, exchange, relation)
    }

    fn notification(request: &Request, observe: u32, payload: &'static str) -> Response {
        let mut response = Response::for_request(request, ResponseCode::Content);
        response.options.set_observe(observe);
        response.payload = Bytes::from_static(payload.as_bytes());
        response
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_response_establishes_relation() {
        let fixture = fixture(NetworkConfig::default());
        let registry = ObserveRegistry::new();
        let (request, exchange, relation) = observed_exchange(&registry);

        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;

        assert!(relation.is_established());
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type(), Some(MessageType::Ack));
        assert_eq!(sent[0].mid(), Some(7));
        assert!(!sent[0].last);
    }

    #[rstest]
    #[case::error(ResponseCode::NotFound, true)]
    #[case::no_observe_option(ResponseCode::Content, false)]
    #[tokio::test(start_paused = true)]
    async fn test_response_without_relation(#[case] code: ResponseCode, #[case] is_error: bool) {
        let fixture = fixture(NetworkConfig::default());
        let registry = ObserveRegistry::new();
        let (request, exchange, relation) = observed_exchange(&registry);

        let response = Response::for_request(&request, code);
        assert_eq!(!response.code.is_success(), is_error);
        fixture.stack.send_response(&exchange, response).await;

        assert!(!relation.is_established());
        assert!(exchange.relation().is_none());
        assert!(registry.find_relation(test_peer(1), &request.token).is_none());
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].last);
    }

    #[rstest]
    #[case::every_second(2, vec![MessageType::Non, MessageType::Con])]
    #[case::every_third(3, vec![MessageType::Non, MessageType::Non, MessageType::Con])]
    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_notification_type(#[case] check_count: u32, #[case] expected: Vec<MessageType>) {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig {
            notification_check_interval_count: check_count,
            ..NetworkConfig::default()
        });
        let registry = ObserveRegistry::new();
        let (request, exchange, _relation) = observed_exchange(&registry);
        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;
        fixture.outbox.sent_messages().await;

        let mut types = Vec::new();
        for i in 0..expected.len() {
            fixture.stack.send_response(&exchange, notification(&request, 2 + i as u32, "b")).await;
            let sent = fixture.outbox.sent_responses().await;
            assert_eq!(sent.len(), 1);
            assert!(!sent[0].last);
            types.push(sent[0].msg_type().unwrap());
        }
        assert_eq!(types, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_keeps_only_freshest() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let registry = ObserveRegistry::new();
        let (request, exchange, _relation) = observed_exchange(&registry);
        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;
        fixture.outbox.sent_messages().await;

        let con = notification(&request, 2, "b");
        con.set_type(MessageType::Con);
        fixture.stack.send_response(&exchange, con.clone()).await;
        assert_eq!(fixture.outbox.sent_responses().await.len(), 1);

        for (i, payload) in ["c", "d", "e"].into_iter().enumerate() {
            fixture.stack.send_response(&exchange, notification(&request, 3 + i as u32, payload)).await;
        }
        fixture.outbox.assert_no_remaining_messages().await;

        fixture.stack.receive_empty(&exchange, EmptyMessage::ack_for(&con)).await;
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, Bytes::from_static(b"e"));

        // nothing left after the freshest was sent
        time::sleep(Duration::from_secs(300)).await;
        fixture.outbox.assert_no_remaining_messages().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_is_preempted_by_fresher_notification() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let registry = ObserveRegistry::new();
        let (request, exchange, _relation) = observed_exchange(&registry);
        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;
        fixture.outbox.sent_messages().await;

        let con = notification(&request, 2, "b");
        con.set_type(MessageType::Con);
        fixture.stack.send_response(&exchange, con.clone()).await;
        let con_mid = fixture.outbox.sent_responses().await[0].mid();

        fixture.stack.send_response(&exchange, notification(&request, 3, "c")).await;
        fixture.outbox.assert_no_remaining_messages().await;

        time::sleep(Duration::from_millis(2001)).await;
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, Bytes::from_static(b"c"));
        assert_eq!(sent[0].msg_type(), Some(MessageType::Con));
        // the peer may have received the replaced notification, so the same mid would be a duplicate
        let replacement_mid = sent[0].mid();
        assert!(replacement_mid.is_some());
        assert_ne!(replacement_mid, con_mid);
        assert!(con.is_canceled());

        // the replacement is retransmitted itself
        time::sleep(Duration::from_millis(4001)).await;
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mid(), replacement_mid);
        assert_eq!(sent[0].payload, Bytes::from_static(b"c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blockwise_notification_is_preempted() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig {
            max_message_size: 16,
            default_block_size: 16,
            ..NetworkConfig::default()
        });
        let registry = ObserveRegistry::new();
        let (request, exchange, _relation) = observed_exchange(&registry);
        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;
        fixture.outbox.sent_messages().await;

        let con = notification(&request, 2, "a notification of 32 bytes......");
        con.set_type(MessageType::Con);
        fixture.stack.send_response(&exchange, con.clone()).await;
        let first_block = fixture.outbox.sent_responses().await;
        assert_eq!(first_block.len(), 1);
        assert_eq!(first_block[0].options.block2(), Some(BlockOption::new(0, true, 0)));
        assert_eq!(first_block[0].msg_type(), Some(MessageType::Con));

        fixture.stack.send_response(&exchange, notification(&request, 3, "c")).await;
        fixture.outbox.assert_no_remaining_messages().await;

        // the first block is due for retransmission: the fresher notification goes out instead
        time::sleep(Duration::from_millis(2001)).await;
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, Bytes::from_static(b"c"));
        assert_eq!(sent[0].msg_type(), Some(MessageType::Con));
        assert_eq!(sent[0].options.observe(), Some(3));
        assert_eq!(sent[0].options.block2(), Some(BlockOption::new(0, false, 0)));
        assert!(con.is_canceled());
        assert!(first_block[0].is_canceled());

        // only the replacement is retransmitted from now on
        time::sleep(Duration::from_millis(4001)).await;
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, Bytes::from_static(b"c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_notification_terminates_relation() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let registry = ObserveRegistry::new();
        let (request, exchange, relation) = observed_exchange(&registry);
        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;
        fixture.outbox.sent_messages().await;

        fixture.stack.send_response(&exchange, Response::for_request(&request, ResponseCode::InternalServerError)).await;
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type(), Some(MessageType::Con));
        assert!(sent[0].last);
        assert!(relation.is_canceled());
        assert!(!exchange.is_complete());

        // notifications after the error are dropped
        fixture.stack.send_response(&exchange, notification(&request, 2, "b")).await;
        assert!(fixture.outbox.sent_responses().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_notification_waits_for_notification_in_transit() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let registry = ObserveRegistry::new();
        let (request, exchange, relation) = observed_exchange(&registry);
        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;
        fixture.outbox.sent_messages().await;

        let con = notification(&request, 2, "b");
        con.set_type(MessageType::Con);
        fixture.stack.send_response(&exchange, con.clone()).await;
        assert_eq!(fixture.outbox.sent_responses().await.len(), 1);

        fixture.stack.send_response(&exchange, Response::for_request(&request, ResponseCode::InternalServerError)).await;
        fixture.outbox.assert_no_remaining_messages().await;
        assert!(relation.is_canceled());

        // later notifications do not replace the error
        fixture.stack.send_response(&exchange, notification(&request, 3, "c")).await;
        fixture.outbox.assert_no_remaining_messages().await;

        fixture.stack.receive_empty(&exchange, EmptyMessage::ack_for(&con)).await;
        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].code, ResponseCode::InternalServerError);
        assert_eq!(sent[0].msg_type(), Some(MessageType::Con));
        assert!(sent[0].last);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_all_relations() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let registry = ObserveRegistry::new();
        let (request, exchange, relation) = observed_exchange(&registry);

        let mut other_request = request.derive();
        other_request.token = Token::from([12u8].as_slice());
        let other_exchange = Exchange::new(other_request.clone(), Origin::Remote);
        registry.register(&other_exchange, &other_request);
        let other_relation = other_exchange.relation().unwrap();

        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;
        let con = notification(&request, 2, "b");
        con.set_type(MessageType::Con);
        fixture.stack.send_response(&exchange, con).await;

        time::sleep(Duration::from_secs(2 + 4 + 8 + 16 + 32 + 1)).await;
        assert!(exchange.is_timed_out());
        assert!(relation.is_canceled());
        assert!(other_relation.is_canceled());
        assert!(other_exchange.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rst_cancels_relation() {
        let fixture = fixture(NetworkConfig::default());
        let registry = ObserveRegistry::new();
        let (request, exchange, relation) = observed_exchange(&registry);
        fixture.stack.send_response(&exchange, notification(&request, 1, "a")).await;

        let non = notification(&request, 2, "b");
        fixture.stack.send_response(&exchange, non.clone()).await;
        fixture.stack.receive_empty(&exchange, EmptyMessage::rst_for(&non)).await;

        assert!(relation.is_canceled());
        assert!(exchange.is_complete());
        assert!(registry.find_relation(test_peer(1), &request.token).is_none());
    }

    fn subscription() -> (Request, Arc<Exchange>) {
        let mut request = Request::new(Method::Get, test_peer(2));
        request.token = Token::from([11u8].as_slice());
        request.options.set_uri_path("/temp");
        request.options.set_observe(REGISTER);
        request.set_type(MessageType::Con);
        request.set_mid(3);
        let exchange = Exchange::new(request.clone(), Origin::Local);
        (request, exchange)
    }

    fn inbound_notification(request: &Request, observe: u32, msg_type: MessageType, mid: u16) -> Response {
        let mut response = Response::for_request(request, ResponseCode::Content);
        response.options.set_observe(observe);
        response.options.set_max_age(10);
        response.set_type(msg_type);
        response.set_mid(mid);
        response
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_notifications_are_dropped() {
        let fixture = fixture(NetworkConfig::default());
        let (request, exchange) = subscription();

        for (observe, mid) in [(5, 100), (7, 101), (6, 102), (7, 103), (8, 104)] {
            fixture.stack.receive_response(&exchange, inbound_notification(&request, observe, MessageType::Non, mid)).await;
        }

        let delivered: Vec<u32> = fixture.deliverer.delivered_responses().await
            .iter()
            .filter_map(|r| r.options.observe())
            .collect();
        assert_eq!(delivered, vec![5, 7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig {
            notification_reregistration_backoff: Duration::from_secs(2),
            ..NetworkConfig::default()
        });
        let (request, exchange) = subscription();
        fixture.stack.receive_response(&exchange, inbound_notification(&request, 1, MessageType::Ack, 3)).await;
        assert!(exchange.state().has_reregistration_handle());

        time::sleep(Duration::from_secs(11)).await;
        fixture.outbox.assert_no_remaining_messages().await;

        time::sleep(Duration::from_millis(1001)).await;
        let sent = fixture.outbox.sent_messages().await;
        match sent.as_slice() {
            [Sent::Request(refresh)] => {
                assert_eq!(refresh.token, request.token);
                assert_eq!(refresh.options.observe(), Some(REGISTER));
                assert_eq!(refresh.uri(), request.uri());
                assert!(!refresh.same_transmission(&request));
                assert_eq!(refresh.msg_type(), Some(MessageType::Con));
            }
            other => panic!("expected a re-registration, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reregistration_after_cancel() {
        let fixture = fixture(NetworkConfig::default());
        let (request, exchange) = subscription();
        fixture.stack.receive_response(&exchange, inbound_notification(&request, 1, MessageType::Ack, 3)).await;

        exchange.cancel().await;
        time::sleep(Duration::from_secs(600)).await;
        fixture.outbox.assert_no_remaining_messages().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_for_canceled_request_is_rejected() {
        let fixture = fixture(NetworkConfig::default());
        let (request, exchange) = subscription();
        exchange.cancel().await;

        fixture.stack.receive_response(&exchange, inbound_notification(&request, 4, MessageType::Con, 50)).await;

        let sent = fixture.outbox.sent_messages().await;
        match sent.as_slice() {
            [Sent::Empty(rst)] => {
                assert_eq!(rst.msg_type(), Some(MessageType::Rst));
                assert_eq!(rst.mid(), Some(50));
            }
            other => panic!("expected a single RST, got {:?}", other),
        }
        assert!(fixture.deliverer.delivered_responses().await.is_empty());
    }
}
