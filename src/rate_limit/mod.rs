//! Rate limit admission control.

pub mod handler;
pub mod store;
pub mod throttle;

pub use handler::{RateLimitHandler, ThrottleSource};
pub use store::{CounterKeys, CounterSnapshot, CounterStore, CounterWindow, MemoryCounterStore};
pub use throttle::{
    Authenticated, PredicateThrottle, RouteThrottle, Throttle, ThrottleContext, ThrottleRef,
    ThrottleRegistry, Unauthenticated,
};
