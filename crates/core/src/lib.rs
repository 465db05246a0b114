//! # trotro-core
//!
//! Services behind the trotro route planner: rate limiting, stop
//! autocomplete, route search, the displayed state and the live sync that
//! keeps it current.

pub mod config;
pub mod display;
pub mod feed;
pub mod planner;
pub mod profile;
pub mod rate;
pub mod search;
pub mod store;
pub mod suggest;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

// Route model and store traits
pub use trotro_transit as transit;

pub mod prelude {
    pub use crate::config::{ConfigError, PlannerConfig, RateLimits, RatePolicy, StoreConfig, SyncConfig};
    pub use crate::display::{DisplayHandle, DisplayState, UiOverlay};
    pub use crate::feed::{ChangeEvent, ChangeFeed, EventKind, FeedMessage, LocalChangeFeed, Table};
    pub use crate::planner::Planner;
    pub use crate::profile::ProfileSnapshot;
    pub use crate::rate::{OperationClass, RateDecision, RateGovernor, Subject};
    pub use crate::search::{SearchError, SearchOutcome, SearchQuery};
    pub use crate::store::{RealtimeFeed, RestStore};
    pub use crate::suggest::{StopMatcher, SuggestionSource, Suggestions};
    pub use crate::sync::{ConnectionState, LiveSyncController, ResumeOutcome, SyncError};
}
