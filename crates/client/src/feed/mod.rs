//! Feed store: per-partition message lists kept in sync with the backend.

mod state;
mod store;

pub use state::{FeedSnapshot, FeedState};
pub use store::FeedStore;
