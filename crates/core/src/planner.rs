//! The rider-facing facade: one session, one display, all services.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};
use trotro_transit::{
    IdentityProvider, NewAccount, RouteIdentifier, RouteInfo, RouteStore, Session, StopDirectory,
    StoreError, UserStore,
};

use crate::config::PlannerConfig;
use crate::display::{DisplayHandle, UiOverlay};
use crate::profile::{ProfileService, ProfileSnapshot};
use crate::rate::{OperationClass, RateGovernor, Subject};
use crate::search::{RouteSearchService, SearchError, SearchOutcome, SearchQuery};
use crate::suggest::{StopMatcher, Suggestions};

pub struct Planner {
    governor: Arc<RateGovernor>,
    search: RouteSearchService,
    matcher: StopMatcher,
    profiles: ProfileService,
    display: DisplayHandle,
    session: watch::Sender<Option<Session>>,
}

impl Planner {
    pub fn new(
        config: &PlannerConfig,
        routes: Arc<dyn RouteStore>,
        stops: Arc<dyn StopDirectory>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        let governor = Arc::new(RateGovernor::new(config.limits.clone()));
        Self {
            search: RouteSearchService::new(routes, users.clone(), governor.clone()),
            matcher: StopMatcher::new(stops, governor.clone()),
            profiles: ProfileService::new(users, governor.clone()),
            display: DisplayHandle::new(),
            session: watch::channel(None).0,
            governor,
        }
    }

    /// Build from a single backend that serves every store trait.
    pub fn from_store<S>(config: &PlannerConfig, store: Arc<S>) -> Self
    where
        S: RouteStore + StopDirectory + UserStore + 'static,
    {
        Self::new(config, store.clone(), store.clone(), store)
    }

    pub fn display(&self) -> &DisplayHandle {
        &self.display
    }

    pub fn search_service(&self) -> &RouteSearchService {
        &self.search
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// Evict expired rate-limit records every `sweep_interval`.
    pub fn spawn_sweeper(&self, config: &PlannerConfig) -> JoinHandle<()> {
        self.governor.spawn_sweeper(config.sweep_interval)
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn session(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    /// Follow sign-ins and sign-outs.
    pub fn watch_session(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    pub fn subject(&self) -> Subject {
        Subject::from_session(self.session().as_ref())
    }

    pub fn set_session(&self, session: Option<Session>) {
        let signed_in = session.is_some();
        self.session.send_if_modified(|current| {
            if *current == session {
                return false;
            }
            *current = session;
            true
        });
        if !signed_in {
            self.display.apply_profile(None);
        }
    }

    pub async fn sign_in(
        &self,
        identity: &dyn IdentityProvider,
        email: &str,
        password: &str,
    ) -> Result<Session, StoreError> {
        let session = identity.sign_in(email, password).await?;
        info!(user = %session.user_id, "signed in");
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    pub async fn resume_session(
        &self,
        identity: &dyn IdentityProvider,
        access_token: &str,
    ) -> Result<Session, StoreError> {
        let session = identity.session_for_token(access_token).await?;
        debug!(user = %session.user_id, "session restored");
        self.set_session(Some(session.clone()));
        Ok(session)
    }

    /// Create an account, signing straight in when the provider allows it.
    pub async fn sign_up(
        &self,
        identity: &dyn IdentityProvider,
        account: &NewAccount,
    ) -> Result<Option<Session>, StoreError> {
        let session = identity.sign_up(account).await?;
        match &session {
            Some(session) => {
                info!(user = %session.user_id, "signed up");
                self.set_session(Some(session.clone()));
            }
            None => info!("account created, awaiting confirmation"),
        }
        Ok(session)
    }

    /// Forget the session and everything shown for it, then revoke its token.
    /// The local state is cleared even when revoking fails.
    pub async fn sign_out(&self, identity: &dyn IdentityProvider) -> Result<(), StoreError> {
        let Some(session) = self.session() else {
            return Ok(());
        };

        self.set_session(None);
        self.display.reset_search();
        self.display.set_overlay(UiOverlay::None);
        info!(user = %session.user_id, "signed out");

        identity.sign_out(&session.access_token).await
    }

    /// Mail a reset link to `email`, or to the signed-in rider when `None`.
    pub async fn send_password_reset(
        &self,
        identity: &dyn IdentityProvider,
        email: Option<&str>,
    ) -> Result<(), StoreError> {
        let email = match email {
            Some(email) => email.to_owned(),
            None => self
                .session()
                .and_then(|session| session.email)
                .ok_or(StoreError::Unauthorized)?,
        };
        identity.send_password_reset(&email).await?;
        debug!(%email, "password reset requested");
        Ok(())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub async fn suggest(&self, query: &str) -> Suggestions {
        self.matcher.suggest(query, &self.subject()).await
    }

    /// Run a search and show its result. A refused search leaves the display
    /// as it was, except that a missing session opens the profile overlay so
    /// the rider can sign in.
    ///
    /// Routes that changed while the fetch was in flight are rebuilt once the
    /// result is shown.
    pub async fn search(&self, start: &str, destination: &str) -> Result<SearchOutcome, SearchError> {
        let session = self.session();
        let ticket = self.display.begin_search();

        match self.search.search(start, destination, session.as_ref()).await {
            Ok(outcome) => {
                if self.display.apply_search(ticket, &outcome) && self.display.changed_since(ticket) {
                    debug!(query = ?outcome.query, "routes changed during search");
                    self.rebuild_itineraries(&outcome.query).await;
                }
                Ok(outcome)
            }
            Err(SearchError::AuthRequired) => {
                self.display.set_overlay(UiOverlay::Profile);
                Err(SearchError::AuthRequired)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch and fold fresh itineraries for `query` without spending a search
    /// or writing history. Returns whether the display changed.
    pub async fn rebuild_itineraries(&self, query: &SearchQuery) -> bool {
        let ticket = self.display.begin_refresh();
        match self.search.fetch_itineraries(query).await {
            Ok(fresh) => self.display.apply_refresh(ticket, query, fresh),
            Err(e) => {
                warn!(error = %e, "failed to refresh itineraries");
                false
            }
        }
    }

    pub fn select(&self, route_id: &RouteIdentifier) -> bool {
        self.display.select(route_id)
    }

    pub fn swap_endpoints(&self) -> bool {
        self.display.swap_endpoints()
    }

    pub fn reset_search(&self) -> bool {
        self.display.reset_search()
    }

    /// Searches left in the current window, without spending one.
    pub fn remaining_searches(&self) -> u32 {
        self.governor
            .remaining(&self.subject(), OperationClass::RouteSearch)
    }

    /// Fetch metadata for the selected itinerary and show it.
    pub async fn show_route_info(&self) -> Result<Option<RouteInfo>, StoreError> {
        let Some(route_id) = self
            .display
            .read(|state| state.selected.as_ref().map(|it| it.id.clone()))
        else {
            return Ok(None);
        };

        let info = self.search.route_info(&route_id).await?;
        let still_selected = self
            .display
            .read(|state| state.selected.as_ref().is_some_and(|it| it.id == route_id));
        if still_selected {
            self.display.apply_route_info(info.clone());
        }
        Ok(info)
    }

    /// Reload the profile screen. Without a session the profile is cleared.
    pub async fn refresh_profile(&self) -> Option<ProfileSnapshot> {
        let snapshot = self.profiles.load(self.session().as_ref()).await;
        if snapshot.is_none() {
            debug!("no session, clearing profile");
        }
        self.display.apply_profile(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{route, route_info, session, FakeStore};

    fn planner(store: &Arc<FakeStore>) -> Planner {
        let config = PlannerConfig::new("https://example.supabase.co", "anon");
        Planner::from_store(&config, store.clone())
    }

    fn rows() -> Vec<trotro_transit::RouteRow> {
        vec![
            route(1, "Accra - Madina", 6.5, &[(1, "Accra"), (2, "Madina")]),
            route(2, "Accra - Madina Express", 9.0, &[(1, "Accra"), (2, "Legon"), (3, "Madina")]),
        ]
    }

    #[tokio::test]
    async fn test_search_without_session_opens_profile() {
        let store = Arc::new(FakeStore::default());
        let planner = planner(&store);

        let err = planner.search("Accra", "Madina").await.unwrap_err();
        assert_eq!(err, SearchError::AuthRequired);
        assert_eq!(planner.display().read(|s| s.overlay), UiOverlay::Profile);
    }

    #[tokio::test]
    async fn test_search_updates_display() {
        let store = Arc::new(FakeStore::default());
        store.set_routes(Ok(rows()));
        let planner = planner(&store);
        planner.set_session(Some(session("u1")));

        planner.search("Accra", "Madina").await.unwrap();
        let state = planner.display().snapshot();
        assert_eq!(state.itineraries.len(), 2);
        assert_eq!(state.selected.as_ref().unwrap().id.as_str(), "1");
        assert_eq!(state.remaining_searches, Some(9));
        assert_eq!(planner.remaining_searches(), 9);

        assert!(planner.select(&RouteIdentifier::new("2")));
        assert_eq!(
            planner.display().read(|s| s.selected.as_ref().unwrap().intermediate_stop_count()),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_search_keeps_previous_results() {
        let store = Arc::new(FakeStore::default());
        store.set_routes(Ok(rows()));
        let planner = planner(&store);
        planner.set_session(Some(session("u1")));
        planner.search("Accra", "Madina").await.unwrap();

        store.set_routes(Err(StoreError::Timeout));
        assert!(planner.search("Circle", "Osu").await.is_err());
        assert_eq!(planner.display().read(|s| s.itineraries.len()), 2);
    }

    #[tokio::test]
    async fn test_show_route_info_for_selection() {
        let store = Arc::new(FakeStore::default());
        store.set_routes(Ok(rows()));
        store.set_route_info(Some(route_info(2, "Via Legon")));
        let planner = planner(&store);
        planner.set_session(Some(session("u1")));

        assert_eq!(planner.show_route_info().await.unwrap(), None);
        assert_eq!(store.info_fetches(), 0);

        planner.search("Accra", "Madina").await.unwrap();
        planner.select(&RouteIdentifier::new("2"));
        let info = planner.show_route_info().await.unwrap().unwrap();
        assert_eq!(info.description.as_deref(), Some("Via Legon"));
        assert_eq!(planner.display().read(|s| s.route_info.clone()), Some(info));
    }

    #[tokio::test]
    async fn test_sign_in_and_out() {
        let store = Arc::new(FakeStore::default());
        let planner = planner(&store);

        assert_eq!(
            planner.sign_in(store.as_ref(), "ama@example.com", "wrong").await,
            Err(StoreError::Unauthorized)
        );
        assert_eq!(planner.subject(), Subject::Anonymous);

        planner
            .sign_in(store.as_ref(), "ama@example.com", "correct horse")
            .await
            .unwrap();
        assert!(planner.refresh_profile().await.is_some());
        assert!(planner.display().read(|s| s.profile.is_some()));

        planner.sign_out(store.as_ref()).await.unwrap();
        assert!(planner.display().read(|s| s.profile.is_none()));
        assert!(planner.refresh_profile().await.is_none());
        assert_eq!(store.signed_out(), ["token-u1"]);
    }

    #[tokio::test]
    async fn test_sign_out_clears_results_and_notifies() {
        let store = Arc::new(FakeStore::default());
        store.set_routes(Ok(rows()));
        let planner = planner(&store);
        let mut sessions = planner.watch_session();

        planner.set_session(Some(session("u1")));
        assert!(sessions.has_changed().unwrap());
        assert!(sessions.borrow_and_update().is_some());

        planner.search("Accra", "Madina").await.unwrap();
        planner.display().set_overlay(UiOverlay::Info);

        planner.sign_out(store.as_ref()).await.unwrap();
        assert!(sessions.has_changed().unwrap());
        assert!(sessions.borrow_and_update().is_none());

        let state = planner.display().snapshot();
        assert!(state.itineraries.is_empty());
        assert!(state.selected.is_none());
        assert_eq!(state.overlay, UiOverlay::None);

        // Nothing to revoke the second time.
        planner.sign_out(store.as_ref()).await.unwrap();
        assert_eq!(store.signed_out().len(), 1);
        assert!(!sessions.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_sign_up() {
        let store = Arc::new(FakeStore::default());
        let planner = planner(&store);
        let mut account = NewAccount {
            email: "kofi@example.com".into(),
            password: "correct horse".into(),
            first_name: Some("Kofi".into()),
            last_name: None,
        };

        assert_eq!(planner.sign_up(store.as_ref(), &account).await, Ok(None));
        assert_eq!(planner.session(), None);

        account.email = "kofi@confirmed.example".into();
        let session = planner.sign_up(store.as_ref(), &account).await.unwrap();
        assert!(session.is_some());
        assert_eq!(planner.session(), session);

        account.password = "short".into();
        assert!(matches!(
            planner.sign_up(store.as_ref(), &account).await,
            Err(StoreError::Status { status: 422, .. })
        ));
    }

    #[tokio::test]
    async fn test_password_reset_addresses() {
        let store = Arc::new(FakeStore::default());
        let planner = planner(&store);

        assert_eq!(
            planner.send_password_reset(store.as_ref(), None).await,
            Err(StoreError::Unauthorized)
        );
        planner
            .send_password_reset(store.as_ref(), Some("ama@example.com"))
            .await
            .unwrap();

        planner
            .sign_in(store.as_ref(), "kofi@example.com", "correct horse")
            .await
            .unwrap();
        planner.send_password_reset(store.as_ref(), None).await.unwrap();
        assert_eq!(store.reset_requests(), ["ama@example.com", "kofi@example.com"]);
    }

    #[tokio::test]
    async fn test_resume_session_from_token() {
        let store = Arc::new(FakeStore::default());
        let planner = planner(&store);

        let session = planner.resume_session(store.as_ref(), "token-u7").await.unwrap();
        assert_eq!(session.user_id.as_str(), "u7");
        assert_eq!(planner.session(), Some(session));
        assert!(planner.resume_session(store.as_ref(), "garbage").await.is_err());
    }
}
