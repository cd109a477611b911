pub mod activity;
pub mod store;

pub use activity::ActivityTracker;
pub use store::{ProgressEvent, ProgressStore, SubscriptionId};
