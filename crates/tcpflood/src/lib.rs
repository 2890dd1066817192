pub mod engine;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod sender;

pub use engine::classify::Classification;
pub use engine::epoch::{Admission, Epoch, EpochClock, EpochCounter, EpochReport};
pub use engine::limiter::{ConnectionRateLimiter, RateBudget};
pub use listener::{ConnectionEvent, Listener, ListenerError, ListenerEvent, ACTIVE_CONNECTIONS};
pub use sender::{LoadRequest, ModeSummary, Sender, SenderError, SenderReport};
pub use tcpflood_common::GREETING;
