mod articles;
mod feeds;
mod schema;
mod subscriptions;
mod synchronizations;
mod transaction;
mod types;

pub use schema::Database;
pub use subscriptions::INITIAL_USER_ARTICLES;
pub use transaction::SyncTransaction;
pub use types::{
    Article, ArticleFields, Category, DatabaseError, Feed, FeedMetadata, FeedSubscription,
    FeedSynchronization, NewFeedSynchronization, User, UserArticle,
};
