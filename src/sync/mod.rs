//! Feed synchronization.
//!
//! [`Synchronizer`] reconciles the store with one feed; [`Scheduler`] runs it
//! over every subscribed feed on a fixed delay and records the outcomes.

mod orchestrator;
mod reconcile;
mod scheduler;
mod startup;

pub use orchestrator::{
    error_chain, favicon_refresh_due, SyncError, SyncErrorKind, SyncReport, SyncStage,
    Synchronizer, ARTICLE_TITLE_MAX, CREATOR_MAX, FEED_DESCRIPTION_MAX, FEED_TITLE_MAX,
    LANGUAGE_MAX,
};
pub use reconcile::{
    dedup_by_guid, find_removed, normalize_publication_dates, oldest_article, select_removed,
    REMOVAL_GRACE_SECS,
};
pub use scheduler::{PassSummary, Scheduler};
pub use startup::reset_custom_feed_store;
