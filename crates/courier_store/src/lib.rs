#![forbid(unsafe_code)]

pub mod auth;
pub mod error;
pub mod feed;
pub mod send;
pub mod store;
pub mod util;

pub use auth::{Anonymous, AuthProvider, StaticAuthProvider};
pub use error::{SendError, StoreError};
pub use feed::{ChangeFeed, ChangeFeedConfig, FeedHub, FeedHubConfig, FeedItem, FeedSubscription};
pub use send::{SendPipeline, SendRequest};
pub use store::memory::{InMemoryStore, InMemoryStoreConfig};
pub use store::persistent::PersistentStore;
pub use store::{Appended, MessageStore, StoreEvent};



#[cfg(test)]
mod store_tests;
