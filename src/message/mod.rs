//! Requests, responses and empty messages as they travel through the layer stack.
//!
//! A message's *transmission state* (message id, type, and the acknowledged / rejected /
//!  timed-out / canceled flags) is shared between all clones of a message, so a layer that
//!  stores a message in an exchange and a layer further down that assigns its message id work on
//!  the same transmission. Messages derived from another message (blocks, reassembled bodies,
//!  re-registrations) get their own transmission state.

pub mod codec;
pub mod options;

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub use options::{BlockOption, OptionSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Con = 0,
    Non = 1,
    Ack = 2,
    Rst = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Method {
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
    Fetch = 5,
    Patch = 6,
    IPatch = 7,
}

/// Response codes are encoded as `class << 5 | detail`, e.g. 2.05 is `2 << 5 | 5`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Created = 0x41,
    Deleted = 0x42,
    Valid = 0x43,
    Changed = 0x44,
    Content = 0x45,
    Continue = 0x5f,
    BadRequest = 0x80,
    Unauthorized = 0x81,
    BadOption = 0x82,
    Forbidden = 0x83,
    NotFound = 0x84,
    MethodNotAllowed = 0x85,
    NotAcceptable = 0x86,
    RequestEntityIncomplete = 0x88,
    PreconditionFailed = 0x8c,
    RequestEntityTooLarge = 0x8d,
    UnsupportedContentFormat = 0x8f,
    InternalServerError = 0xa0,
    NotImplemented = 0xa1,
    BadGateway = 0xa2,
    ServiceUnavailable = 0xa3,
    GatewayTimeout = 0xa4,
    ProxyingNotSupported = 0xa5,
}

impl ResponseCode {
    pub fn class(&self) -> u8 {
        u8::from(*self) >> 5
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }
}

/// Opaque token of 0 to 8 bytes that binds a response to its request
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Token(Bytes);

impl Token {
    pub const MAX_LEN: usize = 8;

    pub fn empty() -> Token {
        Token(Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&[u8]> for Token {
    fn from(value: &[u8]) -> Self {
        Token(Bytes::copy_from_slice(value))
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "]")
    }
}

/// Callbacks on transmission events of a message. All callbacks default to doing nothing.
#[async_trait]
pub trait MessageObserver: Send + Sync + 'static {
    async fn on_retransmission(&self) {}
    async fn on_acknowledgement(&self) {}
    async fn on_reject(&self) {}
    async fn on_timeout(&self) {}
    async fn on_cancel(&self) {}
}

const NO_MID: u32 = u32::MAX;
const NO_TYPE: u8 = u8::MAX;

/// The part of a message that is shared between all its clones
pub struct Transmission {
    mid: AtomicU32,
    msg_type: AtomicU8,
    acknowledged: AtomicBool,
    rejected: AtomicBool,
    timed_out: AtomicBool,
    canceled: AtomicBool,
    duplicate: AtomicBool,
    observers: Mutex<Vec<Arc<dyn MessageObserver>>>,
}

impl Debug for Transmission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transmission")
            .field("mid", &self.mid())
            .field("type", &self.msg_type())
            .field("acknowledged", &self.acknowledged.load(Ordering::Acquire))
            .field("rejected", &self.rejected.load(Ordering::Acquire))
            .field("timed_out", &self.timed_out.load(Ordering::Acquire))
            .field("canceled", &self.canceled.load(Ordering::Acquire))
            .finish()
    }
}

impl Transmission {
    fn new() -> Transmission {
        Transmission {
            mid: AtomicU32::new(NO_MID),
            msg_type: AtomicU8::new(NO_TYPE),
            acknowledged: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            duplicate: AtomicBool::new(false),
            observers: Default::default(),
        }
    }

    fn mid(&self) -> Option<u16> {
        match self.mid.load(Ordering::Acquire) {
            NO_MID => None,
            mid => Some(mid as u16),
        }
    }

    fn msg_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.msg_type.load(Ordering::Acquire)).ok()
    }

    fn observers(&self) -> Vec<Arc<dyn MessageObserver>> {
        match self.observers.lock() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// sets the flag, returning true if it was not set before
    fn raise(flag: &AtomicBool, value: bool) -> bool {
        !flag.swap(value, Ordering::AcqRel) && value
    }

    async fn set_canceled(&self, value: bool) {
        if Transmission::raise(&self.canceled, value) {
            for o in self.observers() {
                o.on_cancel().await;
            }
        }
    }
}

/// Refers to a message's transmission state without keeping it alive, for observers of one
///  message that act on another one
#[derive(Clone, Debug)]
pub struct WeakMessage(Weak<Transmission>);

impl WeakMessage {
    pub async fn cancel(&self) {
        if let Some(transmission) = self.0.upgrade() {
            transmission.set_canceled(true).await;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub token: Token,
    pub options: OptionSet,
    pub payload: Bytes,
    /// destination for outgoing messages, source for incoming messages
    pub peer: SocketAddr,
    transmission: Arc<Transmission>,
}

impl Message {
    pub fn new(peer: SocketAddr) -> Message {
        Message {
            token: Token::empty(),
            options: OptionSet::default(),
            payload: Bytes::new(),
            peer,
            transmission: Arc::new(Transmission::new()),
        }
    }

    /// Copy of this message's content (token, options, payload, peer) with a fresh transmission
    ///  state: no message id, no type, no flags
    pub fn derive(&self) -> Message {
        Message {
            token: self.token.clone(),
            options: self.options.clone(),
            payload: self.payload.clone(),
            peer: self.peer,
            transmission: Arc::new(Transmission::new()),
        }
    }

    pub fn mid(&self) -> Option<u16> {
        self.transmission.mid()
    }

    pub fn set_mid(&self, mid: u16) {
        self.transmission.mid.store(mid as u32, Ordering::Release);
    }

    pub fn msg_type(&self) -> Option<MessageType> {
        self.transmission.msg_type()
    }

    pub fn set_type(&self, msg_type: MessageType) {
        self.transmission.msg_type.store(msg_type.into(), Ordering::Release);
    }

    pub fn is_confirmable(&self) -> bool {
        self.msg_type() == Some(MessageType::Con)
    }

    /// true if both messages are clones sharing the same transmission
    pub fn same_transmission(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.transmission, &other.transmission)
    }

    pub fn add_observer(&self, observer: Arc<dyn MessageObserver>) {
        match self.transmission.observers.lock() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.transmission.acknowledged.load(Ordering::Acquire)
    }

    pub async fn set_acknowledged(&self, value: bool) {
        if Transmission::raise(&self.transmission.acknowledged, value) {
            for o in self.transmission.observers() {
                o.on_acknowledgement().await;
            }
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.transmission.rejected.load(Ordering::Acquire)
    }

    pub async fn set_rejected(&self, value: bool) {
        if Transmission::raise(&self.transmission.rejected, value) {
            for o in self.transmission.observers() {
                o.on_reject().await;
            }
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.transmission.timed_out.load(Ordering::Acquire)
    }

    pub async fn set_timed_out(&self, value: bool) {
        if Transmission::raise(&self.transmission.timed_out, value) {
            for o in self.transmission.observers() {
                o.on_timeout().await;
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.transmission.canceled.load(Ordering::Acquire)
    }

    pub async fn set_canceled(&self, value: bool) {
        self.transmission.set_canceled(value).await
    }

    pub fn is_duplicate(&self) -> bool {
        self.transmission.duplicate.load(Ordering::Acquire)
    }

    pub fn set_duplicate(&self, value: bool) {
        self.transmission.duplicate.store(value, Ordering::Release);
    }

    /// notifies observers that this message is about to be retransmitted
    pub async fn retransmitting(&self) {
        for o in self.transmission.observers() {
            o.on_retransmission().await;
        }
    }

    pub fn downgrade(&self) -> WeakMessage {
        WeakMessage(Arc::downgrade(&self.transmission))
    }
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    message: Message,
}

impl Request {
    pub fn new(method: Method, peer: SocketAddr) -> Request {
        Request {
            method,
            message: Message::new(peer),
        }
    }

    pub fn from_message(method: Method, message: Message) -> Request {
        Request { method, message }
    }

    /// Identifies the target resource: the Uri-Path and Uri-Query options
    pub fn uri(&self) -> String {
        let mut result = String::new();
        for segment in self.options.uri_path() {
            result.push('/');
            result.push_str(&segment);
        }
        if result.is_empty() {
            result.push('/');
        }
        for (i, query) in self.options.uri_query().iter().enumerate() {
            result.push(if i == 0 { '?' } else { '&' });
            result.push_str(query);
        }
        result
    }

    /// copy of this request with a fresh transmission state
    pub fn derive(&self) -> Request {
        Request {
            method: self.method,
            message: self.message.derive(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl Deref for Request {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.message
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub code: ResponseCode,
    /// false for notifications and intermediate blocks, i.e. responses after which the exchange
    ///  is not over
    pub last: bool,
    message: Message,
}

impl Response {
    pub fn new(code: ResponseCode, peer: SocketAddr) -> Response {
        Response {
            code,
            last: true,
            message: Message::new(peer),
        }
    }

    pub fn from_message(code: ResponseCode, message: Message) -> Response {
        Response {
            code,
            last: true,
            message,
        }
    }

    /// A response addressed to the request's source and carrying its token. The type is left
    ///  undecided for the reliability layer to choose.
    pub fn for_request(request: &Request, code: ResponseCode) -> Response {
        let mut response = Response::new(code, request.peer);
        response.token = request.token.clone();
        response
    }

    /// An ACK response carrying the request's message id
    pub fn piggybacked(request: &Request, code: ResponseCode) -> Response {
        let response = Response::for_request(request, code);
        response.set_type(MessageType::Ack);
        if let Some(mid) = request.mid() {
            response.set_mid(mid);
        }
        response
    }

    pub fn derive(&self) -> Response {
        Response {
            code: self.code,
            last: self.last,
            message: self.message.derive(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl Deref for Response {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl DerefMut for Response {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.message
    }
}

/// ACK or RST without code, token or payload
#[derive(Clone, Debug)]
pub struct EmptyMessage {
    message: Message,
}

impl EmptyMessage {
    pub fn new(msg_type: MessageType, mid: u16, peer: SocketAddr) -> EmptyMessage {
        let message = Message::new(peer);
        message.set_type(msg_type);
        message.set_mid(mid);
        EmptyMessage { message }
    }

    pub fn from_message(message: Message) -> EmptyMessage {
        EmptyMessage { message }
    }

    /// empty ACK for the given message, echoing its message id
    pub fn ack_for(message: &Message) -> EmptyMessage {
        Self::reply_to(MessageType::Ack, message)
    }

    /// empty RST for the given message, echoing its message id
    pub fn rst_for(message: &Message) -> EmptyMessage {
        Self::reply_to(MessageType::Rst, message)
    }

    fn reply_to(msg_type: MessageType, message: &Message) -> EmptyMessage {
        let reply = Message::new(message.peer);
        reply.set_type(msg_type);
        if let Some(mid) = message.mid() {
            reply.set_mid(mid);
        }
        EmptyMessage { message: reply }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }
}

impl Deref for EmptyMessage {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}
