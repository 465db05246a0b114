//! Pluggable store traits.
//!
//! External crates implement these to reach the relational backend and the
//! identity provider. Everything returns boxed futures so the traits stay
//! object safe.

use std::future::Future;
use std::pin::Pin;

use crate::identifiers::{RouteIdentifier, UserIdentifier};
use crate::models::{
    CreatedRoute, NewAccount, RouteInfo, RouteRow, SearchHistoryEntry, Session, Stop, StoreError,
    UserProfile,
};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Read access to routes and their metadata
pub trait RouteStore: Send + Sync {
    /// All routes with their junction rows and stops embedded, cheapest first.
    fn fetch_routes(&self) -> StoreFuture<'_, Vec<RouteRow>>;

    /// Metadata for one route, `None` when none has been written.
    fn fetch_route_info<'a>(
        &'a self,
        route_id: &'a RouteIdentifier,
    ) -> StoreFuture<'a, Option<RouteInfo>>;
}

/// Name lookup over the stop table
pub trait StopDirectory: Send + Sync {
    /// Case-insensitive substring search, at most `limit` rows, store order.
    fn search_stops<'a>(&'a self, query: &'a str, limit: usize) -> StoreFuture<'a, Vec<Stop>>;
}

/// Per-user rows: profile, search history and authored routes
pub trait UserStore: Send + Sync {
    fn fetch_profile<'a>(&'a self, user_id: &'a UserIdentifier)
        -> StoreFuture<'a, Option<UserProfile>>;

    /// Newest first.
    fn fetch_search_history<'a>(
        &'a self,
        user_id: &'a UserIdentifier,
    ) -> StoreFuture<'a, Vec<SearchHistoryEntry>>;

    /// Newest first.
    fn fetch_created_routes<'a>(
        &'a self,
        user_id: &'a UserIdentifier,
    ) -> StoreFuture<'a, Vec<CreatedRoute>>;

    fn record_search<'a>(&'a self, entry: &'a SearchHistoryEntry) -> StoreFuture<'a, ()>;
}

/// Thin pass-through to the external identity provider
pub trait IdentityProvider: Send + Sync {
    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> StoreFuture<'a, Session>;

    /// Resolve an access token obtained elsewhere into a session.
    fn session_for_token<'a>(&'a self, access_token: &'a str) -> StoreFuture<'a, Session>;

    /// Create an account. `None` when the provider wants the address
    /// confirmed before handing out a session.
    fn sign_up<'a>(&'a self, account: &'a NewAccount) -> StoreFuture<'a, Option<Session>>;

    /// Revoke `access_token`.
    fn sign_out<'a>(&'a self, access_token: &'a str) -> StoreFuture<'a, ()>;

    /// Ask the provider to mail a password reset link to `email`.
    fn send_password_reset<'a>(&'a self, email: &'a str) -> StoreFuture<'a, ()>;
}
