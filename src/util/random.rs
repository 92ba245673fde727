use rand::{Rng, RngCore};
use std::ops::Range;
use std::time::Duration;
#[cfg(test)] use std::sync::Mutex;

use crate::message::Token;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random: 'static {
    fn next_u32() -> u32;
    fn gen_u64_range(range: Range<u64>) -> u64;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::thread_rng().next_u32()
    }

    fn gen_u64_range(range: Range<u64>) -> u64 {
        rand::thread_rng().gen_range(range)
    }
}

/// initial retransmission timeout, chosen uniformly in `[ack_timeout, ack_timeout * random_factor)`
pub fn random_timeout<R: Random>(ack_timeout: Duration, random_factor: f64) -> Duration {
    let min = ack_timeout.as_millis() as u64;
    let max = ack_timeout.mul_f64(random_factor).as_millis() as u64;
    if max <= min {
        return ack_timeout;
    }
    Duration::from_millis(R::gen_u64_range(min..max))
}

pub fn random_mid_start<R: Random>() -> u16 {
    (R::next_u32() & 0xffff) as u16
}

pub fn random_token<R: Random>() -> Token {
    Token::from(R::next_u32().to_be_bytes().as_slice())
}
