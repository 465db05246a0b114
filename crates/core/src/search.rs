//! Authenticated, rate-limited route search.

use std::sync::Arc;

use tracing::{debug, info, warn};
use trotro_transit::{
    build_matching, EndpointQuery, Itinerary, RouteIdentifier, RouteInfo, RouteStore,
    SearchHistoryEntry, Session, StoreError, UserStore,
};

use crate::rate::{OperationClass, RateGovernor, Subject};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum SearchPhase {
    Validating,
    RateChecking,
    Fetching,
    Filtering,
    Formatting,
    Done,
    RateLimited,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Endpoint {
    Start,
    Destination,
    Both,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SearchError {
    #[error("Please sign in to search for routes")]
    AuthRequired,

    #[error("Please enter both start and destination points (missing {missing})")]
    Validation { missing: Endpoint },

    #[error("Rate limit exceeded: please wait {retry_after_secs} seconds before searching again")]
    RateLimited { retry_after_secs: u64 },

    #[error("Error searching for routes, please try again")]
    StoreFetch(#[source] StoreError),
}

/// The endpoints a rider typed, trimmed but otherwise as entered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    pub start: String,
    pub destination: String,
}

impl SearchQuery {
    pub fn new(start: &str, destination: &str) -> Self {
        Self {
            start: start.trim().to_owned(),
            destination: destination.trim().to_owned(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.start.is_empty() && !self.destination.is_empty()
    }

    pub fn swapped(&self) -> Self {
        Self {
            start: self.destination.clone(),
            destination: self.start.clone(),
        }
    }

    fn validate(&self) -> Result<(), SearchError> {
        let missing = match (self.start.is_empty(), self.destination.is_empty()) {
            (false, false) => return Ok(()),
            (true, false) => Endpoint::Start,
            (false, true) => Endpoint::Destination,
            (true, true) => Endpoint::Both,
        };
        Err(SearchError::Validation { missing })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchOutcome {
    pub query: SearchQuery,
    /// The first (cheapest) match, `None` when there is no direct route.
    pub selected: Option<Itinerary>,
    pub all: Vec<Itinerary>,
    /// Searches left in the caller's current window.
    pub remaining: u32,
}

impl SearchOutcome {
    pub fn found_direct_route(&self) -> bool {
        !self.all.is_empty()
    }
}

pub struct RouteSearchService {
    routes: Arc<dyn RouteStore>,
    users: Arc<dyn UserStore>,
    governor: Arc<RateGovernor>,
}

impl RouteSearchService {
    pub fn new(
        routes: Arc<dyn RouteStore>,
        users: Arc<dyn UserStore>,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            routes,
            users,
            governor,
        }
    }

    /// Match routes for `(start, destination)` on behalf of `session`.
    ///
    /// Unauthenticated and incomplete requests are refused before the rate
    /// counter is touched. Recording the search in the user's history is
    /// best effort and never fails the search.
    pub async fn search(
        &self,
        start: &str,
        destination: &str,
        session: Option<&Session>,
    ) -> Result<SearchOutcome, SearchError> {
        let Some(session) = session else {
            return Err(SearchError::AuthRequired);
        };

        let query = SearchQuery::new(start, destination);
        enter(SearchPhase::Validating, &query);
        query.validate()?;

        enter(SearchPhase::RateChecking, &query);
        let subject = Subject::from_session(Some(session));
        let decision = self.governor.check(&subject, OperationClass::RouteSearch);
        if !decision.allowed {
            enter(SearchPhase::RateLimited, &query);
            return Err(SearchError::RateLimited {
                retry_after_secs: decision.retry_after_secs.unwrap_or(1),
            });
        }

        let all = self.fetch_itineraries(&query).await.map_err(|e| {
            enter(SearchPhase::Failed, &query);
            SearchError::StoreFetch(e)
        })?;

        let entry = SearchHistoryEntry::now(
            session.user_id.clone(),
            &query.start,
            &query.destination,
        );
        if let Err(e) = self.users.record_search(&entry).await {
            warn!(error = %e, user = %session.user_id, "failed to record search history");
        }

        enter(SearchPhase::Done, &query);
        info!(
            start = %query.start,
            destination = %query.destination,
            found = all.len(),
            remaining = decision.remaining,
            "route search finished"
        );

        Ok(SearchOutcome {
            selected: all.first().cloned(),
            all,
            remaining: decision.remaining,
            query,
        })
    }

    /// Fetch and filter without auth, rate limiting or history. Used to
    /// rebuild what is already on screen after a change notification.
    pub async fn fetch_itineraries(&self, query: &SearchQuery) -> Result<Vec<Itinerary>, StoreError> {
        enter(SearchPhase::Fetching, query);
        let rows = self.routes.fetch_routes().await?;

        enter(SearchPhase::Filtering, query);
        let endpoints = EndpointQuery::new(&query.start, &query.destination);
        let itineraries = build_matching(&rows, &endpoints);

        enter(SearchPhase::Formatting, query);
        debug!(candidates = rows.len(), matched = itineraries.len(), "filtered routes");
        Ok(itineraries)
    }

    pub async fn route_info(&self, route_id: &RouteIdentifier) -> Result<Option<RouteInfo>, StoreError> {
        self.routes.fetch_route_info(route_id).await
    }
}

fn enter(phase: SearchPhase, query: &SearchQuery) {
    debug!(%phase, start = %query.start, destination = %query.destination, "route search");
}
