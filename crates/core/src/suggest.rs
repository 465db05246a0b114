//! Stop-name autocomplete.

use std::sync::Arc;

use tracing::{debug, warn};
use trotro_transit::{StaticStopDirectory, Stop, StopDirectory};
use unicode_segmentation::UnicodeSegmentation;

use crate::rate::{OperationClass, RateGovernor, Subject};

pub const SUGGESTION_LIMIT: usize = 5;

/// Queries shorter than this (in grapheme clusters) return nothing.
pub const MIN_QUERY_LEN: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuggestionSource {
    /// Query too short, nothing looked up.
    Skipped,
    RateLimited,
    Remote,
    /// Remote lookup failed, answered from the bundled stops.
    Bundled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Suggestions {
    pub stops: Vec<Stop>,
    pub source: SuggestionSource,
    /// Lookups left in the current window; `None` when nothing was checked.
    pub remaining: Option<u32>,
}

impl Suggestions {
    fn empty(source: SuggestionSource, remaining: Option<u32>) -> Self {
        Self {
            stops: Vec::new(),
            source,
            remaining,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.stops.iter().map(|stop| stop.name.as_str()).collect()
    }
}

pub struct StopMatcher {
    directory: Arc<dyn StopDirectory>,
    bundled: StaticStopDirectory,
    governor: Arc<RateGovernor>,
}

impl StopMatcher {
    pub fn new(directory: Arc<dyn StopDirectory>, governor: Arc<RateGovernor>) -> Self {
        Self::with_bundled(directory, StaticStopDirectory::bundled(), governor)
    }

    pub fn with_bundled(
        directory: Arc<dyn StopDirectory>,
        bundled: StaticStopDirectory,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            directory,
            bundled,
            governor,
        }
    }

    /// Up to five stops whose name contains `query`. Never fails: a broken
    /// remote directory degrades to the bundled list.
    pub async fn suggest(&self, query: &str, subject: &Subject) -> Suggestions {
        let query = query.trim();
        if query.graphemes(true).count() < MIN_QUERY_LEN {
            return Suggestions::empty(SuggestionSource::Skipped, None);
        }

        let decision = self.governor.check(subject, OperationClass::SuggestionLookup);
        if !decision.allowed {
            debug!(%subject, "suggestion lookup rate limited");
            return Suggestions::empty(SuggestionSource::RateLimited, Some(0));
        }

        match self.directory.search_stops(query, SUGGESTION_LIMIT).await {
            Ok(mut stops) => {
                stops.truncate(SUGGESTION_LIMIT);
                Suggestions {
                    stops,
                    source: SuggestionSource::Remote,
                    remaining: Some(decision.remaining),
                }
            }
            Err(e) => {
                warn!(error = %e, query, "stop lookup failed, using bundled stops");
                Suggestions {
                    stops: self.bundled.search(query, SUGGESTION_LIMIT),
                    source: SuggestionSource::Bundled,
                    remaining: Some(decision.remaining),
                }
            }
        }
    }
}
