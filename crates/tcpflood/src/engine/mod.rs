pub mod classify;
pub mod epoch;
pub mod limiter;
pub mod timeout;
