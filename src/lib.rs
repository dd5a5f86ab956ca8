//! Builds an RSS 2.0 feed from the hot-articles list a mobile page embeds in
//! its `window.__NUXT__` hydration script.

pub mod backoff;
pub mod config;
pub mod error;
pub mod extract;
pub mod feed;
pub mod fetch;
pub mod output;
pub mod pipeline;
pub mod sandbox;

pub use config::{ChannelMeta, Config, RetryPolicy};
pub use error::{Error, FetchError, Result};
pub use feed::{FeedDocument, FeedItem};
pub use pipeline::build_feed;
pub use sandbox::{Placeholders, Sandbox, SandboxError};
