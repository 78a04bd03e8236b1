pub mod client;
pub mod session;

pub use client::{connect, ConnectOptions};
pub use session::Session;

// Client-side half of the sync transport: the connector establishes a
// session with a relay (self-hosting one when none is reachable) and the
// session fans decoded envelopes out to subscribers such as the diff
// scheduler.
