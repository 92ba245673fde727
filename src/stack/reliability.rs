use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::config::ConfigHandle;
use crate::exchange::{Exchange, Origin, Outcome};
use crate::message::{EmptyMessage, Message, MessageType, Request, Response};
use crate::scheduler::Scheduler;
use crate::stack::{Chain, Layer};
use crate::util::random::{random_timeout, RngRandom, Random};

/// The message a retransmission task resends
enum Retransmission {
    Request(Request),
    Response(Response),
}

impl Retransmission {
    fn message(&self) -> &Message {
        match self {
            Retransmission::Request(r) => r.message(),
            Retransmission::Response(r) => r.message(),
        }
    }
}

/// Retransmits CON messages with exponential backoff until they are acknowledged, rejected or
///  canceled, and decides between piggy-backed and separate responses.
pub struct ReliabilityLayer<R: Random = RngRandom> {
    config: ConfigHandle,
    scheduler: Arc<dyn Scheduler>,
    _random: PhantomData<fn() -> R>,
}

impl<R: Random> ReliabilityLayer<R> {
    pub fn new(config: ConfigHandle, scheduler: Arc<dyn Scheduler>) -> ReliabilityLayer<R> {
        ReliabilityLayer {
            config,
            scheduler,
            _random: Default::default(),
        }
    }

    /// The first transmission waits a random timeout between ACK_TIMEOUT and
    ///  ACK_TIMEOUT * ACK_RANDOM_FACTOR, every retransmission waits ACK_TIMEOUT_SCALE times
    ///  the previous timeout.
    fn prepare_retransmission(&self, chain: &Chain, exchange: &Arc<Exchange>, retransmission: Retransmission) {
        let config = self.config.load();

        let mut state = exchange.state();
        let timeout = if state.failed_transmission_count == 0 {
            random_timeout::<R>(config.ack_timeout, config.ack_random_factor)
        }
        else {
            state.current_timeout.mul_f64(config.ack_timeout_scale)
        };
        state.current_timeout = timeout;
        trace!("scheduling retransmission in {:?}", timeout);

        let handle = self.scheduler.schedule(timeout, Box::pin(
            Self::retransmit(chain.clone(), exchange.clone(), retransmission, config.max_retransmit)
        ));
        state.set_retransmission_handle(Some(handle));
    }

    async fn retransmit(chain: Chain, exchange: Arc<Exchange>, retransmission: Retransmission, max_retransmit: u32) {
        let failed_count = {
            let mut state = exchange.state();
            state.failed_transmission_count += 1;
            state.failed_transmission_count
        };

        let message = retransmission.message();
        if message.is_acknowledged() {
            trace!("timeout: message already acknowledged, no retransmission of {:?}", message.mid());
        }
        else if message.is_rejected() {
            trace!("timeout: message already rejected, no retransmission of {:?}", message.mid());
        }
        else if message.is_canceled() {
            trace!("timeout: message {:?} canceled, no retransmission", message.mid());
        }
        else if failed_count <= max_retransmit {
            debug!("timeout: retransmitting message {:?}, failed transmissions: {}", message.mid(), failed_count);

            message.retransmitting().await;
            // an observer may have canceled the message, e.g. to send a newer notification
            if message.is_canceled() {
                return;
            }
            match retransmission {
                Retransmission::Request(request) => chain.layer().send_request(&chain, &exchange, request).await,
                Retransmission::Response(response) => chain.layer().send_response(&chain, &exchange, response).await,
            }
        }
        else {
            info!("timeout: retransmission limit reached, exchange failed, message: {:?}", message.mid());
            exchange.set_timed_out();
            message.set_timed_out(true).await;
        }
    }

    #[cfg(test)]
    fn current_timeout(exchange: &Exchange) -> Duration {
        exchange.state().current_timeout
    }
}

#[async_trait]
impl<R: Random> Layer for ReliabilityLayer<R> {
    async fn send_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        trace!("send request, failed transmissions: {}", exchange.state().failed_transmission_count);

        if request.msg_type().is_none() {
            request.set_type(MessageType::Con);
        }
        if request.is_confirmable() {
            self.prepare_retransmission(chain, exchange, Retransmission::Request(request.clone()));
        }
        chain.send_request(exchange, request).await
    }

    async fn send_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        trace!("send response, failed transmissions: {}", exchange.state().failed_transmission_count);

        let current_request = exchange.current_request();
        match (response.msg_type(), current_request) {
            (None, Some(current_request)) => {
                if current_request.is_confirmable() {
                    if current_request.is_acknowledged() {
                        // an empty ACK was sent already, so this is a separate response
                        response.set_type(MessageType::Con);
                    }
                    else {
                        current_request.set_acknowledged(true).await;
                        response.set_type(MessageType::Ack);
                        if let Some(mid) = current_request.mid() {
                            response.set_mid(mid);
                        }
                    }
                }
                else {
                    response.set_type(MessageType::Non);
                }
                trace!("response type set to {:?} (request was {:?})", response.msg_type(), current_request.msg_type());
            }
            (Some(MessageType::Ack), Some(current_request)) | (Some(MessageType::Rst), Some(current_request)) => {
                if let Some(mid) = current_request.mid() {
                    response.set_mid(mid);
                }
            }
            (None, None) => {
                warn!("exchange has no request to derive the response type from - sending CON");
                response.set_type(MessageType::Con);
            }
            _ => {}
        }

        if response.is_confirmable() {
            trace!("scheduling retransmission for response {:?}", response.code);
            self.prepare_retransmission(chain, exchange, Retransmission::Response(response.clone()));
        }
        chain.send_response(exchange, response).await
    }

    /// A duplicate request is answered with whatever was decided for the original, without
    ///  passing it on to the application
    async fn receive_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        if !request.is_duplicate() {
            exchange.state().current_request = Some(request.clone());
            return chain.receive_request(exchange, request).await;
        }

        let (current_response, current_request) = {
            let state = exchange.state();
            (state.current_response.clone(), state.current_request.clone())
        };
        if let Some(current_response) = current_response {
            debug!("responding to duplicate request with the current response");
            // bypassing this layer: a replay does not restart the retransmission cycle
            chain.send_response(exchange, current_response).await;
        }
        else if current_request.as_ref().map(|r| r.is_acknowledged()).unwrap_or(false) {
            debug!("duplicate request was acknowledged but no response computed yet: retransmitting ACK");
            chain.send_empty(exchange, EmptyMessage::ack_for(&request)).await;
        }
        else if current_request.as_ref().map(|r| r.is_rejected()).unwrap_or(false) {
            debug!("duplicate request was rejected: rejecting again");
            chain.send_empty(exchange, EmptyMessage::rst_for(&request)).await;
        }
        else {
            debug!("no decision for the request yet: ignoring the duplicate");
        }
    }

    async fn receive_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        let (current_request, request) = {
            let mut state = exchange.state();
            state.failed_transmission_count = 0;
            state.set_retransmission_handle(None);
            (state.current_request.clone(), state.request.clone())
        };
        if let Some(current_request) = current_request {
            current_request.set_acknowledged(true).await;
        }

        let canceled = request.map(|r| r.is_canceled()).unwrap_or(false);
        if response.is_confirmable() && !canceled {
            trace!("response is confirmable, sending ACK");
            chain.send_empty(exchange, EmptyMessage::ack_for(&response)).await;
        }

        if response.is_duplicate() {
            debug!("response is a duplicate, ignoring it");
        }
        else {
            chain.receive_response(exchange, response).await;
        }
    }

    async fn receive_empty(&self, chain: &Chain, exchange: &Arc<Exchange>, message: EmptyMessage) {
        // The retransmission handle is dropped before the flags are raised: raising them runs
        //  message observers, which may send the next notification and register a new handle.
        let target = {
            let mut state = exchange.state();
            state.failed_transmission_count = 0;
            state.set_retransmission_handle(None);
            match exchange.origin() {
                Origin::Local => state.current_request.as_ref().map(|r| r.message().clone()),
                Origin::Remote => state.current_response.as_ref().map(|r| r.message().clone()),
            }
        };

        match (message.msg_type(), target) {
            (Some(MessageType::Ack), Some(target)) => target.set_acknowledged(true).await,
            (Some(MessageType::Rst), Some(target)) => {
                target.set_rejected(true).await;
                if exchange.origin() == Origin::Local {
                    exchange.resolve(Outcome::Rejected);
                    exchange.set_complete();
                }
            }
            (Some(MessageType::Ack), None) | (Some(MessageType::Rst), None) => {
                debug!("empty {:?} for an exchange without a message in flight", message.msg_type());
            }
            _ => warn!("empty message was neither ACK nor RST: {:?}", message),
        }

        chain.receive_empty(exchange, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use rstest::rstest;
    use tokio::time;
    use crate::config::NetworkConfig;
    use crate::message::{MessageObserver, Method, ResponseCode};
    use crate::scheduler::TokioScheduler;
    use crate::stack::LayerStack;
    use crate::test_util::{test_peer, RecordingDeliverer, RecordingOutbox, Sent};
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};

    struct Fixture {
        stack: Arc<LayerStack>,
        outbox: Arc<RecordingOutbox>,
        deliverer: Arc<RecordingDeliverer>,
    }

    fn fixture(config: NetworkConfig) -> Fixture {
        let outbox = Arc::new(RecordingOutbox::default());
        let deliverer = Arc::new(RecordingDeliverer::default());
        let layer: ReliabilityLayer<MockRandom> = ReliabilityLayer::new(
            ConfigHandle::new(config).unwrap(),
            Arc::new(TokioScheduler::current().unwrap()),
        );
        Fixture {
            stack: LayerStack::new(vec![Arc::new(layer)], outbox.clone(), deliverer.clone()),
            outbox,
            deliverer,
        }
    }

    fn inbound_request(msg_type: MessageType, mid: u16) -> Request {
        let request = Request::new(Method::Get, test_peer(1));
        request.set_type(msg_type);
        request.set_mid(mid);
        request
    }

    #[derive(Default)]
    struct RetransmissionCounter(AtomicUsize);

    #[async_trait]
    impl MessageObserver for RetransmissionCounter {
        async fn on_retransmission(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_schedule() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        // lower bound of the random interval: exactly ACK_TIMEOUT
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let request = Request::new(Method::Get, test_peer(1));
        let counter = Arc::new(RetransmissionCounter::default());
        request.add_observer(counter.clone());
        let exchange = Exchange::new(request.clone(), Origin::Local);

        fixture.stack.send_request(&exchange, request.clone()).await;
        assert_eq!(request.msg_type(), Some(MessageType::Con));
        assert_eq!(ReliabilityLayer::<MockRandom>::current_timeout(&exchange), Duration::from_secs(2));

        // retransmissions after 2, 2+4, 2+4+8, 2+4+8+16 seconds, timeout after another 32
        let mut elapsed = Duration::ZERO;
        for (i, timeout) in [2u64, 4, 8, 16].into_iter().enumerate() {
            elapsed += Duration::from_secs(timeout);
            time::sleep(Duration::from_secs(timeout) + Duration::from_millis(1)).await;
            assert_eq!(counter.0.load(Ordering::SeqCst), i + 1, "after {:?}", elapsed);
        }
        assert_eq!(ReliabilityLayer::<MockRandom>::current_timeout(&exchange), Duration::from_secs(32));
        assert!(!exchange.is_timed_out());

        time::sleep(Duration::from_secs(32)).await;
        assert!(exchange.is_timed_out());
        assert!(exchange.is_complete());
        assert!(request.is_timed_out());
        assert_eq!(counter.0.load(Ordering::SeqCst), 4);

        let sent = fixture.outbox.sent_messages().await;
        assert_eq!(sent.len(), 5);
        // all transmissions share the message id
        assert!(sent.iter().all(|s| s.message().mid() == request.mid()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_stops_retransmission() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let request = Request::new(Method::Get, test_peer(1));
        let exchange = Exchange::new(request.clone(), Origin::Local);
        fixture.stack.send_request(&exchange, request.clone()).await;
        assert_eq!(fixture.outbox.sent_messages().await.len(), 1);

        time::sleep(Duration::from_secs(1)).await;
        fixture.stack.receive_empty(&exchange, EmptyMessage::ack_for(&request)).await;
        assert!(request.is_acknowledged());

        time::sleep(Duration::from_secs(60)).await;
        fixture.outbox.assert_no_remaining_messages().await;
        assert!(!exchange.is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rst_rejects_local_exchange() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let request = Request::new(Method::Get, test_peer(1));
        let exchange = Exchange::new(request.clone(), Origin::Local);
        fixture.stack.send_request(&exchange, request.clone()).await;

        fixture.stack.receive_empty(&exchange, EmptyMessage::rst_for(&request)).await;
        assert!(request.is_rejected());
        assert!(exchange.is_complete());
        assert!(matches!(*exchange.outcome().borrow(), Outcome::Rejected));
        assert!(exchange.wait_for_response(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_request_is_not_retransmitted() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let request = Request::new(Method::Get, test_peer(1));
        let exchange = Exchange::new(request.clone(), Origin::Local);
        fixture.stack.send_request(&exchange, request.clone()).await;
        fixture.outbox.sent_messages().await;

        exchange.cancel().await;
        time::sleep(Duration::from_secs(100)).await;
        fixture.outbox.assert_no_remaining_messages().await;
        assert!(!exchange.is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_request_is_not_retransmitted() {
        let fixture = fixture(NetworkConfig::default());
        let request = Request::new(Method::Get, test_peer(1));
        request.set_type(MessageType::Non);
        let exchange = Exchange::new(request.clone(), Origin::Local);
        fixture.stack.send_request(&exchange, request).await;
        assert_eq!(fixture.outbox.sent_messages().await.len(), 1);

        time::sleep(Duration::from_secs(100)).await;
        fixture.outbox.assert_no_remaining_messages().await;
        assert!(!exchange.state().has_retransmission_handle());
    }

    #[rstest]
    #[case::piggybacked(MessageType::Con, false, MessageType::Ack)]
    #[case::separate(MessageType::Con, true, MessageType::Con)]
    #[case::non(MessageType::Non, false, MessageType::Non)]
    #[tokio::test(start_paused = true)]
    async fn test_response_type(#[case] request_type: MessageType, #[case] acked: bool, #[case] expected: MessageType) {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig::default());
        let request = inbound_request(request_type, 77);
        let exchange = Exchange::new(request.clone(), Origin::Remote);
        if acked {
            request.set_acknowledged(true).await;
        }

        fixture.stack.send_response(&exchange, Response::for_request(&request, ResponseCode::Content)).await;

        let sent = fixture.outbox.sent_responses().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type(), Some(expected));
        if expected == MessageType::Ack {
            assert_eq!(sent[0].mid(), Some(77));
            assert!(request.is_acknowledged());
        }
        else {
            assert_ne!(sent[0].mid(), Some(77));
        }
        assert_eq!(exchange.state().has_retransmission_handle(), expected == MessageType::Con);
    }

    #[rstest]
    #[case::response_replayed(true, false, false)]
    #[case::ack_replayed(false, true, false)]
    #[case::rst_replayed(false, false, true)]
    #[case::undecided_dropped(false, false, false)]
    #[tokio::test]
    async fn test_duplicate_request(#[case] responded: bool, #[case] acked: bool, #[case] rejected: bool) {
        let fixture = fixture(NetworkConfig::default());
        let request = inbound_request(MessageType::Con, 5);
        let exchange = Exchange::new(request.clone(), Origin::Remote);
        fixture.stack.receive_request(&exchange, request.clone()).await;
        assert_eq!(fixture.deliverer.delivered_requests().await.len(), 1);

        if responded {
            let response = Response::piggybacked(&request, ResponseCode::Content);
            exchange.state().current_response = Some(response);
        }
        if acked {
            request.set_acknowledged(true).await;
        }
        if rejected {
            request.set_rejected(true).await;
        }

        let duplicate = inbound_request(MessageType::Con, 5);
        duplicate.set_duplicate(true);
        fixture.stack.receive_request(&exchange, duplicate).await;

        assert!(fixture.deliverer.delivered_requests().await.is_empty());
        let sent = fixture.outbox.sent_messages().await;
        match sent.as_slice() {
            [Sent::Response(r)] => {
                assert!(responded);
                assert_eq!(r.mid(), Some(5));
            }
            [Sent::Empty(e)] => {
                assert_eq!(e.msg_type(), Some(if acked { MessageType::Ack } else { MessageType::Rst }));
                assert_eq!(e.mid(), Some(5));
            }
            [] => assert!(!responded && !acked && !rejected),
            other => panic!("unexpected {:?}", other),
        }
        // a replay does not start retransmissions
        assert!(!exchange.state().has_retransmission_handle());
    }

    #[rstest]
    #[case::con_response(MessageType::Con, false, true, true)]
    #[case::non_response(MessageType::Non, false, false, true)]
    #[case::duplicate(MessageType::Con, true, true, false)]
    #[tokio::test]
    async fn test_receive_response(#[case] msg_type: MessageType, #[case] duplicate: bool, #[case] ack_sent: bool, #[case] delivered: bool) {
        let fixture = fixture(NetworkConfig::default());
        let request = Request::new(Method::Get, test_peer(1));
        request.set_type(MessageType::Con);
        let exchange = Exchange::new(request.clone(), Origin::Local);
        exchange.state().failed_transmission_count = 2;

        let response = Response::for_request(&request, ResponseCode::Content);
        response.set_type(msg_type);
        response.set_mid(99);
        response.set_duplicate(duplicate);
        fixture.stack.receive_response(&exchange, response).await;

        assert!(request.is_acknowledged());
        assert_eq!(exchange.state().failed_transmission_count, 0);

        let sent = fixture.outbox.sent_messages().await;
        assert_eq!(sent.len(), ack_sent as usize);
        if let Some(Sent::Empty(ack)) = sent.first() {
            assert_eq!(ack.msg_type(), Some(MessageType::Ack));
            assert_eq!(ack.mid(), Some(99));
        }
        assert_eq!(fixture.deliverer.delivered_responses().await.len(), delivered as usize);
    }

    #[tokio::test]
    async fn test_no_ack_for_response_to_canceled_request() {
        let fixture = fixture(NetworkConfig::default());
        let request = Request::new(Method::Get, test_peer(1));
        let exchange = Exchange::new(request.clone(), Origin::Local);
        request.set_canceled(true).await;

        let response = Response::for_request(&request, ResponseCode::Content);
        response.set_type(MessageType::Con);
        response.set_mid(3);
        fixture.stack.receive_response(&exchange, response).await;
        fixture.outbox.assert_no_remaining_messages().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_retransmit_zero_times_out_after_first_timeout() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let ctx = MockRandom::gen_u64_range_context();
        ctx.expect().returning(|r| r.start);

        let fixture = fixture(NetworkConfig {
            max_retransmit: 0,
            ..NetworkConfig::default()
        });
        let request = Request::new(Method::Get, test_peer(1));
        let exchange = Exchange::new(request.clone(), Origin::Local);
        fixture.stack.send_request(&exchange, request).await;

        time::sleep(Duration::from_millis(2001)).await;
        assert!(exchange.is_timed_out());
        assert_eq!(fixture.outbox.sent_messages().await.len(), 1);
    }
}
