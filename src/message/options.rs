use std::collections::BTreeMap;

use anyhow::bail;
use bytes::Bytes;

pub const IF_MATCH: u16 = 1;
pub const URI_HOST: u16 = 3;
pub const ETAG: u16 = 4;
pub const IF_NONE_MATCH: u16 = 5;
pub const OBSERVE: u16 = 6;
pub const URI_PORT: u16 = 7;
pub const LOCATION_PATH: u16 = 8;
pub const URI_PATH: u16 = 11;
pub const CONTENT_FORMAT: u16 = 12;
pub const MAX_AGE: u16 = 14;
pub const URI_QUERY: u16 = 15;
pub const ACCEPT: u16 = 17;
pub const LOCATION_QUERY: u16 = 20;
pub const BLOCK2: u16 = 23;
pub const BLOCK1: u16 = 27;
pub const SIZE2: u16 = 28;
pub const PROXY_URI: u16 = 35;
pub const PROXY_SCHEME: u16 = 39;
pub const SIZE1: u16 = 60;

/// seconds
pub const DEFAULT_MAX_AGE: u32 = 60;

/// Observe sequence numbers have 24 bits
pub const MAX_OBSERVE: u32 = (1 << 24) - 1;

pub fn encode_uint(value: u32) -> Bytes {
    let bytes = value.to_be_bytes();
    let first_non_zero = bytes.iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len());
    Bytes::copy_from_slice(&bytes[first_non_zero..])
}

pub fn decode_uint(value: &[u8]) -> anyhow::Result<u32> {
    if value.len() > 4 {
        bail!("integer option value is too long: {} bytes", value.len());
    }
    Ok(value.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// Block1 / Block2 descriptor: block number, 'more blocks follow' flag and size exponent
///  (the block size is `2^(4+szx)`, i.e. 16 to 1024 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    pub szx: u8,
    pub more: bool,
    pub num: u32,
}

impl BlockOption {
    pub const MAX_SZX: u8 = 6;
    pub const MAX_NUM: u32 = (1 << 20) - 1;

    pub fn new(szx: u8, more: bool, num: u32) -> BlockOption {
        BlockOption { szx, more, num }
    }

    pub fn size(&self) -> usize {
        Self::size_for_szx(self.szx)
    }

    pub fn size_for_szx(szx: u8) -> usize {
        1 << (4 + szx as usize)
    }

    /// size exponent for a block size, rounding down to a power of two and clamping to the
    ///  valid range
    pub fn szx_for_size(block_size: usize) -> u8 {
        let log2 = (usize::BITS - 1 - block_size.max(1).leading_zeros()) as i64;
        (log2 - 4).clamp(0, Self::MAX_SZX as i64) as u8
    }

    pub fn encode(&self) -> Bytes {
        let value = (self.num << 4) | if self.more { 1 << 3 } else { 0 } | (self.szx as u32 & 0x7);
        if self.num < 1 << 4 {
            Bytes::copy_from_slice(&[value as u8])
        }
        else if self.num < 1 << 12 {
            Bytes::copy_from_slice(&(value as u16).to_be_bytes())
        }
        else {
            Bytes::copy_from_slice(&value.to_be_bytes()[1..])
        }
    }

    pub fn decode(value: &[u8]) -> anyhow::Result<BlockOption> {
        if value.len() > 3 {
            bail!("block option value is too long: {} bytes", value.len());
        }
        let raw = decode_uint(value)?;
        let szx = (raw & 0x7) as u8;
        if szx > Self::MAX_SZX {
            bail!("reserved block size exponent {}", szx);
        }
        Ok(BlockOption {
            szx,
            more: raw & 0x8 != 0,
            num: raw >> 4,
        })
    }
}

/// Numbered options in ascending order of their option number. Options may be repeated; the
///  values of a repeated option keep their order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    options: BTreeMap<u16, Vec<Bytes>>,
}

impl OptionSet {
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Bytes)> {
        self.options.iter()
            .flat_map(|(number, values)| values.iter().map(move |v| (*number, v)))
    }

    pub fn has(&self, number: u16) -> bool {
        self.options.contains_key(&number)
    }

    pub fn get(&self, number: u16) -> Option<&Bytes> {
        self.options.get(&number)
            .and_then(|values| values.first())
    }

    pub fn get_all(&self, number: u16) -> &[Bytes] {
        self.options.get(&number)
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    pub fn add(&mut self, number: u16, value: Bytes) {
        self.options.entry(number)
            .or_default()
            .push(value);
    }

    pub fn set(&mut self, number: u16, value: Bytes) {
        self.options.insert(number, vec![value]);
    }

    pub fn remove(&mut self, number: u16) {
        self.options.remove(&number);
    }

    fn get_uint(&self, number: u16) -> Option<u32> {
        self.get(number)
            .and_then(|v| decode_uint(v).ok())
    }

    fn set_uint(&mut self, number: u16, value: u32) {
        self.set(number, encode_uint(value));
    }

    fn get_strings(&self, number: u16) -> Vec<String> {
        self.get_all(number).iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn content_format(&self) -> Option<u16> {
        self.get_uint(CONTENT_FORMAT).map(|v| v as u16)
    }

    pub fn set_content_format(&mut self, value: u16) {
        self.set_uint(CONTENT_FORMAT, value as u32);
    }

    pub fn accept(&self) -> Option<u16> {
        self.get_uint(ACCEPT).map(|v| v as u16)
    }

    pub fn set_accept(&mut self, value: u16) {
        self.set_uint(ACCEPT, value as u32);
    }

    pub fn has_observe(&self) -> bool {
        self.has(OBSERVE)
    }

    pub fn observe(&self) -> Option<u32> {
        self.get_uint(OBSERVE)
    }

    pub fn set_observe(&mut self, value: u32) {
        self.set_uint(OBSERVE, value & MAX_OBSERVE);
    }

    pub fn remove_observe(&mut self) {
        self.remove(OBSERVE);
    }

    /// seconds, defaulting to 60 if absent
    pub fn max_age(&self) -> u32 {
        self.get_uint(MAX_AGE).unwrap_or(DEFAULT_MAX_AGE)
    }

    pub fn set_max_age(&mut self, seconds: u32) {
        self.set_uint(MAX_AGE, seconds);
    }

    pub fn block1(&self) -> Option<BlockOption> {
        self.get(BLOCK1)
            .and_then(|v| BlockOption::decode(v).ok())
    }

    pub fn set_block1(&mut self, block: BlockOption) {
        self.set(BLOCK1, block.encode());
    }

    pub fn block2(&self) -> Option<BlockOption> {
        self.get(BLOCK2)
            .and_then(|v| BlockOption::decode(v).ok())
    }

    pub fn set_block2(&mut self, block: BlockOption) {
        self.set(BLOCK2, block.encode());
    }

    pub fn remove_block2(&mut self) {
        self.remove(BLOCK2);
    }

    pub fn size1(&self) -> Option<u32> {
        self.get_uint(SIZE1)
    }

    pub fn set_size1(&mut self, value: u32) {
        self.set_uint(SIZE1, value);
    }

    pub fn size2(&self) -> Option<u32> {
        self.get_uint(SIZE2)
    }

    pub fn set_size2(&mut self, value: u32) {
        self.set_uint(SIZE2, value);
    }

    pub fn etags(&self) -> &[Bytes] {
        self.get_all(ETAG)
    }

    pub fn add_etag(&mut self, etag: Bytes) {
        self.add(ETAG, etag);
    }

    pub fn uri_host(&self) -> Option<String> {
        self.get_strings(URI_HOST).into_iter().next()
    }

    pub fn set_uri_host(&mut self, host: &str) {
        self.set(URI_HOST, Bytes::copy_from_slice(host.as_bytes()));
    }

    pub fn uri_path(&self) -> Vec<String> {
        self.get_strings(URI_PATH)
    }

    pub fn add_uri_path(&mut self, segment: &str) {
        self.add(URI_PATH, Bytes::copy_from_slice(segment.as_bytes()));
    }

    /// replaces all Uri-Path options with the segments of a '/' separated path
    pub fn set_uri_path(&mut self, path: &str) {
        self.remove(URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_uri_path(segment);
        }
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.get_strings(URI_QUERY)
    }

    pub fn add_uri_query(&mut self, query: &str) {
        self.add(URI_QUERY, Bytes::copy_from_slice(query.as_bytes()));
    }
}
