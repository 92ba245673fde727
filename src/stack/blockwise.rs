//! Transparent fragmentation of big payloads into blocks (Block1 for request bodies, Block2 for
//!  response bodies) and their reassembly on the receiving side.
//!
//! Every block carries all options of the original message, except that Observe is sent only with
//!  the first block of a notification. Reassembled messages take their header (message id, type,
//!  token, options) from the *last* block.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::ConfigHandle;
use crate::exchange::{Exchange, ExchangeState};
use crate::message::{BlockOption, EmptyMessage, Message, MessageObserver, MessageType, Method, Request, Response, ResponseCode, WeakMessage};
use crate::stack::{Chain, Layer};

/// Fragmentation bookkeeping for one direction of one exchange
#[derive(Debug, Clone, Default)]
pub struct BlockwiseStatus {
    /// all blocks of a transfer must have this content format
    pub content_format: Option<u16>,
    pub current_num: u32,
    pub current_szx: u8,
    pub complete: bool,
    /// observe number of a notification that is transferred blockwise
    pub observe: Option<u32>,
    blocks: Vec<Bytes>,
}

impl BlockwiseStatus {
    pub fn new(content_format: Option<u16>, szx: u8) -> BlockwiseStatus {
        BlockwiseStatus {
            content_format,
            current_szx: szx,
            ..Default::default()
        }
    }

    pub fn with_position(content_format: Option<u16>, num: u32, szx: u8) -> BlockwiseStatus {
        BlockwiseStatus {
            content_format,
            current_num: num,
            current_szx: szx,
            ..Default::default()
        }
    }

    pub fn add_block(&mut self, payload: Bytes) {
        self.blocks.push(payload);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// the received blocks, concatenated
    pub fn assemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.blocks.iter().map(|b| b.len()).sum());
        for block in &self.blocks {
            buf.put_slice(block);
        }
        buf.freeze()
    }
}

/// A block's timeout is the timeout of the message it was cut from
struct TimeoutForwarder {
    message: Message,
}

#[async_trait]
impl MessageObserver for TimeoutForwarder {
    async fn on_timeout(&self) {
        self.message.set_timed_out(true).await;
    }
}

/// The first block of a notification stands for the whole notification while it is in
///  transit: its retransmission is the notification's retransmission, which gives a fresher
///  notification the chance to replace it.
struct RetransmissionForwarder {
    notification: Message,
}

#[async_trait]
impl MessageObserver for RetransmissionForwarder {
    async fn on_retransmission(&self) {
        self.notification.retransmitting().await;
    }
}

/// Canceling a notification cancels its block in transit
struct CancelForwarder {
    block: WeakMessage,
}

#[async_trait]
impl MessageObserver for CancelForwarder {
    async fn on_cancel(&self) {
        self.block.cancel().await;
    }
}

/// `[num * size, min((num+1) * size, len))`, and whether more data follows
fn block_range(len: usize, num: u32, szx: u8) -> (usize, usize, bool) {
    let size = BlockOption::size_for_szx(szx);
    let from = (num as usize).saturating_mul(size).min(len);
    let to = from.saturating_add(size).min(len);
    (from, to, to < len)
}

fn next_request_block(request: &Request, status: &mut BlockwiseStatus) -> Request {
    let (from, to, more) = block_range(request.payload.len(), status.current_num, status.current_szx);

    let mut block = request.derive();
    block.payload = request.payload.slice(from..to);
    block.options.set_block1(BlockOption::new(status.current_szx, more, status.current_num));
    block.set_type(MessageType::Con);

    status.complete = !more;
    block
}

fn next_response_block(response: &Response, status: &mut BlockwiseStatus) -> Response {
    // the type is left open: only the first block has the original response's type, the
    //  others depend on the request asking for them
    let mut block = response.derive();
    block.add_observer(Arc::new(TimeoutForwarder { message: response.message().clone() }));

    if response.payload.is_empty() {
        block.options.set_block2(BlockOption::new(status.current_szx, false, 0));
        block.last = response.last;
        status.complete = true;
    }
    else {
        let (from, to, more) = block_range(response.payload.len(), status.current_num, status.current_szx);
        block.payload = response.payload.slice(from..to);
        block.options.set_block2(BlockOption::new(status.current_szx, more, status.current_num));
        block.last = !more && response.last;
        status.complete = !more;
    }
    block
}

/// copies the last block's header, with the concatenated payload of all blocks
fn assemble(status: &BlockwiseStatus, last: &Message) -> Message {
    let mut assembled = last.derive();
    if let Some(mid) = last.mid() {
        assembled.set_mid(mid);
    }
    if let Some(msg_type) = last.msg_type() {
        assembled.set_type(msg_type);
    }
    assembled.payload = status.assemble();
    assembled
}

/// A request that arrived completely may ask for a specific block size of the response
fn early_block2_negotiation(state: &mut ExchangeState, request: &Request) {
    if let Some(block2) = request.options.block2() {
        debug!("request demands blockwise transfer of the response: {:?}", block2);
        state.response_block_status = Some(BlockwiseStatus::with_position(request.options.content_format(), block2.num, block2.szx));
    }
}

fn incomplete(request: &Request, block1: BlockOption, reason: &'static str) -> Response {
    let mut error = Response::piggybacked(request, ResponseCode::RequestEntityIncomplete);
    error.options.set_block1(block1);
    error.payload = Bytes::from_static(reason.as_bytes());
    error
}

pub struct BlockwiseLayer {
    config: ConfigHandle,
}

impl BlockwiseLayer {
    pub fn new(config: ConfigHandle) -> BlockwiseLayer {
        BlockwiseLayer { config }
    }

    fn default_szx(&self) -> u8 {
        BlockOption::szx_for_size(self.config.load().default_block_size)
    }

    fn requires_blockwise(&self, request: &Request) -> bool {
        matches!(request.method, Method::Put | Method::Post)
            && request.payload.len() > self.config.load().max_message_size
    }

    async fn receive_block1(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request, block1: BlockOption) {
        enum Action {
            Respond(Response),
            Deliver(Request),
            Wait,
        }

        let default_szx = self.default_szx();
        let action = {
            let mut guard = exchange.state();
            let state = &mut *guard;
            let status = state.request_block_status
                .get_or_insert_with(|| BlockwiseStatus::new(request.options.content_format(), default_szx));

            if block1.num == 0 && status.current_num > 0 {
                debug!("block1 num is 0, the client restarted the blockwise transfer");
                *status = BlockwiseStatus::new(request.options.content_format(), default_szx);
            }

            if block1.num != status.current_num {
                warn!("wrong block number: expected {} but received {} - responding with 4.08", status.current_num, block1.num);
                Action::Respond(incomplete(&request, block1, "Wrong block number"))
            }
            else if request.options.content_format() != status.content_format {
                warn!("content format changed during blockwise transfer - responding with 4.08");
                Action::Respond(incomplete(&request, block1, "Changed Content-Format"))
            }
            else {
                status.add_block(request.payload.clone());
                status.current_num += 1;

                if block1.more {
                    trace!("more blocks to come, acknowledging block {}", block1.num);
                    if request.is_confirmable() {
                        let mut piggybacked = Response::piggybacked(&request, ResponseCode::Continue);
                        piggybacked.options.set_block1(BlockOption::new(block1.szx, true, block1.num));
                        piggybacked.last = false;
                        Action::Respond(piggybacked)
                    }
                    else {
                        Action::Wait
                    }
                }
                else {
                    debug!("last block received, delivering the assembled request");
                    let assembled = Request::from_message(request.method, assemble(status, request.message()));
                    state.block1_to_ack = Some(block1);
                    early_block2_negotiation(state, &request);
                    state.request = Some(assembled.clone());
                    Action::Deliver(assembled)
                }
            }
        };

        match action {
            Action::Respond(response) => {
                request.set_acknowledged(true).await;
                exchange.state().current_response = Some(response.clone());
                chain.send_response(exchange, response).await;
            }
            Action::Deliver(assembled) => chain.receive_request(exchange, assembled).await,
            Action::Wait => {}
        }
    }

    /// serves the next block of a response that was computed already
    async fn serve_block2(&self, chain: &Chain, exchange: &Arc<Exchange>, request: &Request, response: Response, block2: BlockOption) {
        let default_szx = self.default_szx();
        let block = {
            let mut guard = exchange.state();
            let state = &mut *guard;
            let status = state.response_block_status
                .get_or_insert_with(|| BlockwiseStatus::new(response.options.content_format(), default_szx));
            status.current_num = block2.num;
            status.current_szx = block2.szx;

            let mut block = next_response_block(&response, status);
            block.token = request.token.clone();
            block.options.remove_observe();

            if status.complete {
                debug!("ongoing block2 transfer complete");
                state.response_block_status = None;
            }
            state.current_response = Some(block.clone());
            block
        };
        chain.send_response(exchange, block).await
    }

    async fn receive_block1_ack(&self, chain: &Chain, exchange: &Arc<Exchange>, response: &Response, block1: BlockOption) -> bool {
        enum Next {
            Send(Request),
            Deliver,
            Wait,
        }

        let next = {
            let mut guard = exchange.state();
            let state = &mut *guard;
            match (state.request_block_status.as_mut(), state.request.as_ref()) {
                (Some(status), Some(request)) if !status.complete => {
                    // the peer may ask for a smaller block size, never for a bigger one
                    let next_szx = block1.szx.min(status.current_szx);
                    let sent_until = (status.current_num as usize + 1) * BlockOption::size_for_szx(status.current_szx);
                    let next_num = (sent_until / BlockOption::size_for_szx(next_szx)) as u32;
                    trace!("sending next block1 num {} with szx {}", next_num, next_szx);
                    status.current_num = next_num;
                    status.current_szx = next_szx;

                    let mut block = next_request_block(request, status);
                    if block.token.is_empty() {
                        block.token = response.token.clone();
                    }
                    state.current_request = Some(block.clone());
                    Next::Send(block)
                }
                (None, _) => {
                    warn!("response acknowledges block {:?} of a request that was not sent blockwise", block1);
                    if response.options.block2().is_none() { Next::Deliver } else { Next::Wait }
                }
                _ => {
                    if response.options.block2().is_none() { Next::Deliver } else { Next::Wait }
                }
            }
        };

        match next {
            Next::Send(block) => {
                chain.send_request(exchange, block).await;
                true
            }
            Next::Deliver => {
                exchange.state().response = Some(response.clone());
                chain.receive_response(exchange, response.clone()).await;
                true
            }
            Next::Wait => {
                debug!("response has a block2 option and is transferred blockwise");
                false
            }
        }
    }

    async fn receive_block2(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response, block2: BlockOption) {
        enum Next {
            Request(Request),
            Deliver(Response),
            WrongNumber(u32),
            NoRequest,
        }

        let default_szx = self.default_szx();
        let next = {
            let mut guard = exchange.state();
            let state = &mut *guard;
            let status = state.response_block_status
                .get_or_insert_with(|| BlockwiseStatus::new(response.options.content_format(), default_szx));

            if block2.num != status.current_num {
                Next::WrongNumber(status.current_num)
            }
            else {
                status.add_block(response.payload.clone());
                if let Some(observe) = response.options.observe() {
                    status.observe = Some(observe);
                }

                if block2.more {
                    match state.request.as_ref() {
                        Some(request) => {
                            // same token as the original request for the whole transfer
                            let mut block = request.derive();
                            block.payload = Bytes::new();
                            block.set_type(request.msg_type().unwrap_or(MessageType::Con));
                            block.options.set_block2(BlockOption::new(block2.szx, false, block2.num + 1));
                            block.options.remove_observe();
                            status.current_num = block2.num + 1;
                            state.current_request = Some(block.clone());
                            Next::Request(block)
                        }
                        None => Next::NoRequest,
                    }
                }
                else {
                    debug!("received all {} blocks of the response, delivering the assembled response", status.block_count());
                    let mut assembled = Response::from_message(response.code, assemble(status, response.message()));
                    if let Some(observe) = status.observe {
                        assembled.options.set_observe(observe);
                        // the next notification starts a transfer of its own
                        state.response_block_status = None;
                    }
                    state.response = Some(assembled.clone());
                    Next::Deliver(assembled)
                }
            }
        };

        match next {
            Next::Request(block) => chain.send_request(exchange, block).await,
            Next::Deliver(assembled) => chain.receive_response(exchange, assembled).await,
            Next::WrongNumber(expected) => {
                warn!("wrong block number: expected {} but received {} - rejecting the response, the exchange failed", expected, block2.num);
                if response.is_confirmable() {
                    chain.send_empty(exchange, EmptyMessage::rst_for(&response)).await;
                }
                exchange.cancel().await;
            }
            Next::NoRequest => warn!("blockwise response for an exchange without request"),
        }
    }
}

#[async_trait]
impl Layer for BlockwiseLayer {
    async fn send_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        if !self.requires_blockwise(&request) {
            exchange.state().current_request = Some(request.clone());
            return chain.send_request(exchange, request).await;
        }

        debug!("request payload {}/{} requires blockwise transfer", request.payload.len(), self.config.load().max_message_size);
        let default_szx = self.default_szx();
        let block = {
            let mut guard = exchange.state();
            let state = &mut *guard;
            let status = state.request_block_status
                .get_or_insert_with(|| BlockwiseStatus::new(request.options.content_format(), default_szx));
            let block = next_request_block(&request, status);
            state.current_request = Some(block.clone());
            block
        };
        chain.send_request(exchange, block).await
    }

    async fn send_response(&self, chain: &Chain, exchange: &Arc<Exchange>, mut response: Response) {
        let max_message_size = self.config.load().max_message_size;
        let default_szx = self.default_szx();

        let to_send = {
            let mut guard = exchange.state();
            let state = &mut *guard;
            let block1 = state.block1_to_ack.take();

            if response.payload.len() > max_message_size || state.response_block_status.is_some() {
                debug!("response payload {}/{} requires blockwise transfer", response.payload.len(), max_message_size);
                let status = state.response_block_status
                    .get_or_insert_with(|| BlockwiseStatus::new(response.options.content_format(), default_szx));
                if response.options.has_observe() {
                    // a notification starts its own transfer, even if it replaces one in progress
                    status.current_num = 0;
                    status.complete = false;
                }

                let mut block = next_response_block(&response, status);
                if let Some(msg_type) = response.msg_type() {
                    block.set_type(msg_type);
                }
                if response.options.has_observe() {
                    block.add_observer(Arc::new(RetransmissionForwarder { notification: response.message().clone() }));
                    response.add_observer(Arc::new(CancelForwarder { block: block.message().downgrade() }));
                }
                if let Some(block1) = block1 {
                    block.options.set_block1(block1);
                }
                if block.token.is_empty() {
                    if let Some(request) = state.request.as_ref() {
                        block.token = request.token.clone();
                    }
                }

                // the ACK of a notification's first block acknowledges the whole notification
                state.current_response = Some(if response.options.has_observe() { response.clone() } else { block.clone() });
                block
            }
            else {
                if let Some(block1) = block1 {
                    response.options.set_block1(block1);
                }
                state.current_response = Some(response.clone());
                response
            }
        };
        chain.send_response(exchange, to_send).await
    }

    async fn receive_request(&self, chain: &Chain, exchange: &Arc<Exchange>, request: Request) {
        if let Some(block1) = request.options.block1() {
            trace!("request contains block1 option {:?}", block1);
            return self.receive_block1(chain, exchange, request, block1).await;
        }

        let stored_response = exchange.state().response.clone();
        if let (Some(response), Some(block2)) = (stored_response, request.options.block2()) {
            return self.serve_block2(chain, exchange, &request, response, block2).await;
        }

        {
            let mut state = exchange.state();
            early_block2_negotiation(&mut state, &request);
            state.request = Some(request.clone());
        }
        chain.receive_request(exchange, request).await
    }

    async fn receive_response(&self, chain: &Chain, exchange: &Arc<Exchange>, response: Response) {
        let block1 = response.options.block1();
        let block2 = response.options.block2();

        if let Some(block1) = block1 {
            trace!("response acknowledges block {:?}", block1);
            if self.receive_block1_ack(chain, exchange, &response, block1).await {
                return;
            }
        }

        match block2 {
            Some(block2) => self.receive_block2(chain, exchange, response, block2).await,
            None if block1.is_none() => {
                exchange.state().response = Some(response.clone());
                chain.receive_response(exchange, response).await
            }
            None => {}
        }
    }
}
