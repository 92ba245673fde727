//! Datagram format (RFC 7252 section 3), all numbers in network byte order:
//!
//! ```ascii
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Each option starts with a byte holding the option number's delta to the previous option
//!  (upper nibble) and the value length (lower nibble). Nibble values 13 and 14 announce an
//!  extended value of one byte (minus 13) or two bytes (minus 269) following the initial byte,
//!  15 is reserved for the payload marker.

use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};

use crate::message::{EmptyMessage, Message, MessageType, Method, Request, Response, ResponseCode, Token};

pub const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xff;
const HEADER_LEN: usize = 4;

#[derive(Debug)]
pub enum ParsedMessage {
    Request(Request),
    Response(Response),
    Empty(EmptyMessage),
}

pub fn ser_request(request: &Request) -> anyhow::Result<Bytes> {
    ser(request.method.into(), request.message())
}

pub fn ser_response(response: &Response) -> anyhow::Result<Bytes> {
    ser(response.code.into(), response.message())
}

pub fn ser_empty(message: &EmptyMessage) -> anyhow::Result<Bytes> {
    ser(0, message.message())
}

fn ser(code: u8, message: &Message) -> anyhow::Result<Bytes> {
    let msg_type = message.msg_type()
        .ok_or_else(|| anyhow!("message has no type: {:?}", message))?;
    let mid = message.mid()
        .ok_or_else(|| anyhow!("message has no message id: {:?}", message))?;
    if message.token.len() > Token::MAX_LEN {
        bail!("token is too long: {:?}", message.token);
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + message.token.len() + message.payload.len() + 32);
    buf.put_u8((VERSION << 6) | (u8::from(msg_type) << 4) | message.token.len() as u8);
    buf.put_u8(code);
    buf.put_u16(mid);
    buf.put_slice(message.token.as_ref());

    let mut previous_number = 0u16;
    for (number, value) in message.options.iter() {
        let delta = number - previous_number;
        previous_number = number;

        let (delta_nibble, delta_ext) = nibble(delta as usize)?;
        let (len_nibble, len_ext) = nibble(value.len())?;
        buf.put_u8((delta_nibble << 4) | len_nibble);
        put_extension(&mut buf, delta_nibble, delta_ext);
        put_extension(&mut buf, len_nibble, len_ext);
        buf.put_slice(value);
    }

    if !message.payload.is_empty() {
        buf.put_u8(PAYLOAD_MARKER);
        buf.put_slice(&message.payload);
    }
    Ok(buf.freeze())
}

fn nibble(value: usize) -> anyhow::Result<(u8, u16)> {
    match value {
        0..=12 => Ok((value as u8, 0)),
        13..=268 => Ok((13, (value - 13) as u16)),
        269..=65804 => Ok((14, (value - 269) as u16)),
        _ => bail!("option delta or length too big: {}", value),
    }
}

fn put_extension(buf: &mut BytesMut, nibble: u8, ext: u16) {
    match nibble {
        13 => buf.put_u8(ext as u8),
        14 => buf.put_u16(ext),
        _ => {}
    }
}

/// version, type and message id
fn read_header(datagram: &[u8]) -> anyhow::Result<(MessageType, u16)> {
    if datagram.len() < HEADER_LEN {
        bail!("datagram is shorter than the header: {} bytes", datagram.len());
    }
    let version = datagram[0] >> 6;
    if version != VERSION {
        bail!("unsupported protocol version {}", version);
    }
    let msg_type = MessageType::try_from((datagram[0] >> 4) & 0x3)?;
    Ok((msg_type, u16::from_be_bytes([datagram[2], datagram[3]])))
}

/// reads type and message id, which is possible for some datagrams that fail to parse otherwise
pub fn peek_header(datagram: &[u8]) -> Option<(MessageType, u16)> {
    read_header(datagram).ok()
}

pub fn deser(datagram: &[u8], peer: SocketAddr) -> anyhow::Result<ParsedMessage> {
    let (msg_type, mid) = read_header(datagram)?;
    let token_len = (datagram[0] & 0xf) as usize;
    if token_len > Token::MAX_LEN {
        bail!("token length {} is reserved", token_len);
    }
    let code = datagram[1];

    let mut rest = &datagram[HEADER_LEN..];
    let token = Token::from(take(&mut rest, token_len)?);

    let mut message = Message::new(peer);
    message.set_type(msg_type);
    message.set_mid(mid);
    message.token = token;

    let mut number = 0u16;
    while let Some(&first) = rest.first() {
        rest = &rest[1..];
        if first == PAYLOAD_MARKER {
            if rest.is_empty() {
                bail!("payload marker followed by empty payload");
            }
            message.payload = Bytes::copy_from_slice(rest);
            break;
        }

        let delta = read_extended(&mut rest, first >> 4)?;
        let len = read_extended(&mut rest, first & 0xf)?;
        number = u16::try_from(number as usize + delta)
            .map_err(|_| anyhow!("option number overflow"))?;
        let value = take(&mut rest, len)?;
        message.options.add(number, Bytes::copy_from_slice(value));
    }

    match code {
        0 => {
            if token_len != 0 || message.options.iter().next().is_some() || !message.payload.is_empty() {
                bail!("empty message with token, options or payload");
            }
            Ok(ParsedMessage::Empty(EmptyMessage::from_message(message)))
        }
        1..=31 => {
            let method = Method::try_from(code)
                .map_err(|_| anyhow!("unknown method code {}", code))?;
            Ok(ParsedMessage::Request(Request::from_message(method, message)))
        }
        64..=191 => {
            let code = ResponseCode::try_from(code)
                .map_err(|_| anyhow!("unknown response code {}.{:02}", code >> 5, code & 0x1f))?;
            Ok(ParsedMessage::Response(Response::from_message(code, message)))
        }
        _ => bail!("reserved code class {}", code >> 5),
    }
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> anyhow::Result<&'a [u8]> {
    if buf.len() < len {
        bail!("datagram truncated: expected {} more bytes, found {}", len, buf.len());
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn read_extended(buf: &mut &[u8], nibble: u8) -> anyhow::Result<usize> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => Ok(take(buf, 1)?[0] as usize + 13),
        14 => {
            let raw = take(buf, 2)?;
            Ok(u16::from_be_bytes([raw[0], raw[1]]) as usize + 269)
        }
        _ => bail!("reserved option nibble 15"),
    }
}
