//! Rate limiting logic and state management.

mod clock;
mod counter;
mod key;
mod limiter;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterRecord, CounterUpdate, Window};
pub use key::{RateKey, KEY_DELIMITER};
pub use limiter::{Limiter, Quota, QuotaFn, RateLimit, RateLimitInfo};
