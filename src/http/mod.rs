//! HTTP surface: the throttling middleware and the server that hosts it.

mod middleware;
mod server;

pub use middleware::{
    throttle, Rejection, Throttle, HEADER_LIMIT, HEADER_REMAINING, HEADER_RETRY_AFTER,
};
pub use server::{router, shutdown_signal, HttpServer};
