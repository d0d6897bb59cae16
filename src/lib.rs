//! Feed synchronization engine.
//!
//! Fetches RSS/Atom/JSON feeds (falling back to feed discovery on HTML pages
//! and to an external news search), reconciles them with the stored articles
//! and fans new articles out to subscribers.

pub mod config;
pub mod events;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
