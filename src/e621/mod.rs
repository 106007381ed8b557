//! Everything that talks to e621: the wire format, the shared rate limit,
//! the client, alias resolution and side-car recovery.

pub mod client;
pub mod entries;
pub mod partial;
pub mod rate_limiter;
pub mod tag_resolver;

pub use client::{
    calculate_backoff, ClientConfig, ClientError, ClientResult, Credentials, E621Client, MAX_PAGE_SIZE,
};
pub use partial::{finish_partial_downloads, RecoveryReport};
pub use rate_limiter::RateLimiter;
pub use tag_resolver::{TagLookup, TagResolver};
