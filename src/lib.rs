//! Ratewarden - Distributed HTTP Request Throttling
//!
//! This crate throttles repeated calls to an HTTP API by requester using
//! fixed-window counters kept in a shared store, so any number of stateless
//! server processes enforce one limit together. Requesters are identified per
//! route by API, device, user or client IP.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
