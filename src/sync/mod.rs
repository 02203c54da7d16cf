//! Client-side synchronization of a user's tasks with a remote source.
//!
//! - [`TaskSync`] owns the visible task list for one subject and keeps it in
//!   step with a [`TaskSource`], using a shared [`crate::cache::MemoryCache`]
//! - [`RetryPolicy`] decides backoff delays and retry budgets
//! - [`Connectivity`] is the online/offline signal reads and writes consult

mod connectivity;
mod engine;
mod error;
mod retry;
mod source;
mod state;

#[cfg(test)]
pub(crate) mod mock;

pub use connectivity::Connectivity;
pub use engine::TaskSync;
pub use error::{ErrorKind, SyncError};
pub use retry::RetryPolicy;
pub use source::{SourceResult, Subscription, TaskSource};
pub use state::{LoadOutcome, SkipReason, SyncState};
