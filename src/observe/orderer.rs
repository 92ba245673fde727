/// Observe numbers are 24 bit and wrap around
const HALF_RANGE: u32 = 1 << 23;

/// Decides on the subscribing side whether a notification is fresher than the last one that
///  was delivered, taking the wrap-around of observe numbers into account. A notification that
///  is not fresher is never delivered, no matter how long ago the last one arrived.
#[derive(Debug, Default)]
pub struct NotificationOrderer {
    last: Option<u32>,
}

impl NotificationOrderer {
    pub fn new() -> NotificationOrderer {
        Default::default()
    }

    pub fn last_observe(&self) -> Option<u32> {
        self.last
    }

    /// Returns true and remembers the number if the notification is fresh
    pub fn is_new(&mut self, observe: u32) -> bool {
        let fresh = match self.last {
            None => true,
            Some(v1) => {
                let v2 = observe;
                (v1 < v2 && v2 - v1 < HALF_RANGE) || (v1 > v2 && v1 - v2 > HALF_RANGE)
            }
        };

        if fresh {
            self.last = Some(observe);
        }
        fresh
    }
}
