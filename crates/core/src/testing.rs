//! In-memory stores for unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use trotro_transit::{
    CreatedRoute, IdentityProvider, NewAccount, RouteIdentifier, RouteInfo, RouteRow, RouteStopLink,
    RouteStore, SearchHistoryEntry, Session, Stop, StopDirectory, StoreError, StoreFuture,
    UserIdentifier, UserProfile, UserStore,
};

type Queued = (Duration, Result<Vec<RouteRow>, StoreError>);

pub struct FakeStore {
    routes: Mutex<Result<Vec<RouteRow>, StoreError>>,
    queued_routes: Mutex<VecDeque<Queued>>,
    route_info: Mutex<Option<RouteInfo>>,
    stops: Mutex<Result<Vec<Stop>, StoreError>>,
    profile: Mutex<Result<Option<UserProfile>, StoreError>>,
    history: Mutex<Vec<SearchHistoryEntry>>,
    created: Mutex<Vec<CreatedRoute>>,
    recorded: Mutex<Vec<SearchHistoryEntry>>,
    signed_out: Mutex<Vec<String>>,
    reset_requests: Mutex<Vec<String>>,
    fail_history: AtomicBool,
    route_fetches: AtomicUsize,
    info_fetches: AtomicUsize,
    stop_lookups: AtomicUsize,
    profile_fetches: AtomicUsize,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self {
            routes: Mutex::new(Ok(Vec::new())),
            queued_routes: Mutex::new(VecDeque::new()),
            route_info: Mutex::new(None),
            stops: Mutex::new(Ok(Vec::new())),
            profile: Mutex::new(Ok(None)),
            history: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            recorded: Mutex::new(Vec::new()),
            signed_out: Mutex::new(Vec::new()),
            reset_requests: Mutex::new(Vec::new()),
            fail_history: AtomicBool::new(false),
            route_fetches: AtomicUsize::new(0),
            info_fetches: AtomicUsize::new(0),
            stop_lookups: AtomicUsize::new(0),
            profile_fetches: AtomicUsize::new(0),
        }
    }
}

impl FakeStore {
    pub fn set_routes(&self, routes: Result<Vec<RouteRow>, StoreError>) {
        *self.routes.lock().unwrap() = routes;
    }

    /// The next `fetch_routes` call sleeps for `delay` and returns `result`
    /// instead of the standing routes.
    pub fn queue_routes(&self, delay: Duration, result: Result<Vec<RouteRow>, StoreError>) {
        self.queued_routes.lock().unwrap().push_back((delay, result));
    }

    pub fn set_route_info(&self, info: Option<RouteInfo>) {
        *self.route_info.lock().unwrap() = info;
    }

    pub fn set_stops(&self, stops: Result<Vec<Stop>, StoreError>) {
        *self.stops.lock().unwrap() = stops;
    }

    pub fn set_profile(&self, profile: Result<Option<UserProfile>, StoreError>) {
        *self.profile.lock().unwrap() = profile;
    }

    pub fn set_history(&self, history: Vec<SearchHistoryEntry>) {
        *self.history.lock().unwrap() = history;
    }

    pub fn set_created_routes(&self, created: Vec<CreatedRoute>) {
        *self.created.lock().unwrap() = created;
    }

    pub fn fail_history_writes(&self) {
        self.fail_history.store(true, Ordering::SeqCst);
    }

    pub fn recorded_searches(&self) -> Vec<SearchHistoryEntry> {
        self.recorded.lock().unwrap().clone()
    }

    /// Tokens revoked through `sign_out`.
    pub fn signed_out(&self) -> Vec<String> {
        self.signed_out.lock().unwrap().clone()
    }

    pub fn reset_requests(&self) -> Vec<String> {
        self.reset_requests.lock().unwrap().clone()
    }

    pub fn route_fetches(&self) -> usize {
        self.route_fetches.load(Ordering::SeqCst)
    }

    pub fn info_fetches(&self) -> usize {
        self.info_fetches.load(Ordering::SeqCst)
    }

    pub fn stop_lookups(&self) -> usize {
        self.stop_lookups.load(Ordering::SeqCst)
    }

    pub fn profile_fetches(&self) -> usize {
        self.profile_fetches.load(Ordering::SeqCst)
    }
}

impl RouteStore for FakeStore {
    fn fetch_routes(&self) -> StoreFuture<'_, Vec<RouteRow>> {
        self.route_fetches.fetch_add(1, Ordering::SeqCst);
        let queued = self.queued_routes.lock().unwrap().pop_front();

        Box::pin(async move {
            match queued {
                Some((delay, result)) => {
                    tokio::time::sleep(delay).await;
                    result
                }
                None => self.routes.lock().unwrap().clone(),
            }
        })
    }

    fn fetch_route_info<'a>(
        &'a self,
        route_id: &'a RouteIdentifier,
    ) -> StoreFuture<'a, Option<RouteInfo>> {
        self.info_fetches.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(self
                .route_info
                .lock()
                .unwrap()
                .clone()
                .filter(|info| &info.route_id == route_id))
        })
    }
}

impl StopDirectory for FakeStore {
    fn search_stops<'a>(&'a self, _query: &'a str, limit: usize) -> StoreFuture<'a, Vec<Stop>> {
        self.stop_lookups.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            self.stops
                .lock()
                .unwrap()
                .clone()
                .map(|stops| stops.into_iter().take(limit).collect())
        })
    }
}

impl UserStore for FakeStore {
    fn fetch_profile<'a>(
        &'a self,
        _user_id: &'a UserIdentifier,
    ) -> StoreFuture<'a, Option<UserProfile>> {
        self.profile_fetches.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { self.profile.lock().unwrap().clone() })
    }

    fn fetch_search_history<'a>(
        &'a self,
        user_id: &'a UserIdentifier,
    ) -> StoreFuture<'a, Vec<SearchHistoryEntry>> {
        Box::pin(async move {
            Ok(self
                .history
                .lock()
                .unwrap()
                .iter()
                .filter(|entry| &entry.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    fn fetch_created_routes<'a>(
        &'a self,
        user_id: &'a UserIdentifier,
    ) -> StoreFuture<'a, Vec<CreatedRoute>> {
        Box::pin(async move {
            Ok(self
                .created
                .lock()
                .unwrap()
                .iter()
                .filter(|route| &route.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    fn record_search<'a>(&'a self, entry: &'a SearchHistoryEntry) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_history.load(Ordering::SeqCst) {
                return Err(StoreError::Status {
                    status: 403,
                    body: "row-level security".into(),
                });
            }
            self.recorded.lock().unwrap().push(entry.clone());
            Ok(())
        })
    }
}

impl IdentityProvider for FakeStore {
    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> StoreFuture<'a, Session> {
        Box::pin(async move {
            if password != "correct horse" {
                return Err(StoreError::Unauthorized);
            }
            Ok(Session {
                user_id: UserIdentifier::new("u1"),
                access_token: "token-u1".into(),
                email: Some(email.to_owned()),
            })
        })
    }

    fn session_for_token<'a>(&'a self, access_token: &'a str) -> StoreFuture<'a, Session> {
        Box::pin(async move {
            let user = access_token
                .strip_prefix("token-")
                .ok_or(StoreError::Unauthorized)?;
            Ok(session(user))
        })
    }

    /// Addresses at `confirmed.example` get a session straight away.
    fn sign_up<'a>(&'a self, account: &'a NewAccount) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            if account.password.len() < 6 {
                return Err(StoreError::Status {
                    status: 422,
                    body: "weak password".into(),
                });
            }
            Ok(account.email.ends_with("@confirmed.example").then(|| Session {
                email: Some(account.email.clone()),
                ..session("new")
            }))
        })
    }

    fn sign_out<'a>(&'a self, access_token: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.signed_out.lock().unwrap().push(access_token.to_owned());
            Ok(())
        })
    }

    fn send_password_reset<'a>(&'a self, email: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.reset_requests.lock().unwrap().push(email.to_owned());
            Ok(())
        })
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn session(user: &str) -> Session {
    Session {
        user_id: UserIdentifier::new(user),
        access_token: format!("token-{user}"),
        email: None,
    }
}

/// A route whose stops sit on a short line north of Accra, one leg per link.
pub fn route(id: i64, name: &str, fare: f64, stops: &[(i32, &str)]) -> RouteRow {
    RouteRow {
        id: RouteIdentifier::from(id),
        name: name.to_owned(),
        total_distance: Some(stops.len() as f64),
        total_fare: Some(fare),
        links: stops
            .iter()
            .enumerate()
            .map(|(i, &(order, stop_name))| RouteStopLink {
                stop_order: order,
                fare_to_next: None,
                distance_to_next: None,
                stop: Stop::new(
                    id * 100 + i as i64,
                    stop_name,
                    5.55 + f64::from(order) * 0.01,
                    -0.2,
                ),
            })
            .collect(),
    }
}

pub fn route_info(route_id: i64, description: &str) -> RouteInfo {
    RouteInfo {
        route_id: RouteIdentifier::from(route_id),
        description: Some(description.to_owned()),
        operating_hours: None,
        landmarks: Vec::new(),
        notes: None,
        updated_at: None,
    }
}
