//! Grading queue: durable jobs, a rate-limited credential pool, and the
//! bounded rounds that move work from one to the other.

pub(crate) mod credentials;
pub(crate) mod dispatcher;
pub(crate) mod drain;
pub(crate) mod monitor;
pub(crate) mod scorer;
pub(crate) mod store;
