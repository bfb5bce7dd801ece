//! Token ring: descriptor, routing and the shared-state client
//!
//! Each ingester owns a set of tokens on a circular 32-bit space and is
//! responsible for the keys up to each of its tokens. The full map lives in
//! one document in the coordination store and is changed only through
//! [`RingClient::update`].

mod client;
mod desc;
mod router;
mod stats;
mod tokens;

pub use client::{RingClient, RingConfig};
pub use desc::{IngesterDesc, IngesterState, RingDesc, TokenDesc};
pub use router::{token_for, ReadRing, Replica};
pub use stats::RingStats;
pub use tokens::{derived_tokens, random_tokens, TokenStrategy};
