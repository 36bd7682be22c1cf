//! Rate limiting logic: rules, signatures and the fixed-window limiter.

mod limiter;
mod rules;
mod signature;

pub use limiter::RateLimiter;
pub use rules::{
    ApiLimit, DecayUnit, DefaultLimits, FailurePolicy, LimitLevel, RateLimitingConfig, RateRule,
    RateSpec, RuleResolver, GATEWAY_API_SEGMENT,
};
pub use signature::{
    AuthenticatedUser, RequesterContext, Signature, SignatureResolver, TIMER_SUFFIX,
};
