//! Keeps the display in step with the remote store.
//!
//! The controller subscribes to row changes on the tables the display is
//! derived from and rebuilds the affected views when one arrives. It also
//! handles the app coming back to the foreground: reconnect if needed, then
//! reload the profile and itineraries, at most once per debounce interval.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::feed::{ChangeEvent, ChangeFeed, DerivedView, FeedError, FeedMessage, FeedSubscription, InterestSet};
use crate::planner::Planner;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("Sync controller has been torn down")]
    TornDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Another resume ran within the debounce interval.
    Debounced,
    Refreshed { reconnected: bool },
}

pub struct LiveSyncController {
    planner: Arc<Planner>,
    feed: Arc<dyn ChangeFeed>,
    interest: InterestSet,
    config: SyncConfig,
    connection: watch::Sender<ConnectionState>,
    last_update: Mutex<Option<DateTime<Utc>>>,
    last_resume: Mutex<Option<Instant>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    alive: AtomicBool,
}

impl LiveSyncController {
    pub fn new(planner: Arc<Planner>, feed: Arc<dyn ChangeFeed>, config: SyncConfig) -> Arc<Self> {
        Self::with_interest(planner, feed, config, InterestSet::standard())
    }

    pub fn with_interest(
        planner: Arc<Planner>,
        feed: Arc<dyn ChangeFeed>,
        config: SyncConfig,
        interest: InterestSet,
    ) -> Arc<Self> {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            planner,
            feed,
            interest,
            config,
            connection,
            last_update: Mutex::new(None),
            last_resume: Mutex::new(None),
            listener: Mutex::new(None),
            alive: AtomicBool::new(true),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// When the last change notification was handled.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.connection.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "sync connection");
            *current = state;
            true
        });
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Subscribe to the interest set and start handling changes. Does nothing
    /// when already connected or connecting.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SyncError> {
        if !self.is_alive() {
            return Err(SyncError::TornDown);
        }
        if self.connection_state() != ConnectionState::Disconnected {
            return Ok(());
        }

        let subscription = self.open().await?;
        if !self.is_alive() {
            return Err(SyncError::TornDown);
        }

        let handle = tokio::spawn(self.clone().listen(subscription));
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn open(&self) -> Result<FeedSubscription, SyncError> {
        self.set_state(ConnectionState::Connecting);
        let tables = self.interest.tables();

        self.feed.subscribe(&tables).await.map_err(|e| {
            error!(error = %e, "change feed subscription failed");
            self.set_state(ConnectionState::Disconnected);
            SyncError::from(e)
        })
    }

    async fn listen(self: Arc<Self>, mut subscription: FeedSubscription) {
        loop {
            let reason = loop {
                match subscription.next().await {
                    Some(FeedMessage::Acknowledged) => {
                        info!("subscribed to route changes");
                        self.set_state(ConnectionState::Subscribed);
                    }
                    Some(FeedMessage::Change(event)) => {
                        self.handle_event(&event).await;
                    }
                    Some(FeedMessage::Closed(reason)) => break reason,
                    None => break "feed ended".to_owned(),
                }
            };

            drop(subscription);
            self.set_state(ConnectionState::Disconnected);
            if !self.is_alive() {
                break;
            }
            warn!(%reason, "change feed closed, reconnecting");

            tokio::time::sleep(self.config.reconnect_delay).await;
            if !self.is_alive() {
                break;
            }
            subscription = match self.open().await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(error = %e, "reconnect failed, waiting for resume");
                    break;
                }
            };
        }
    }

    /// Release the subscription and discard anything still in flight. The
    /// controller cannot be reconnected afterwards.
    pub fn teardown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.planner.display().close();
        self.set_state(ConnectionState::Disconnected);
        info!("live sync torn down");
    }

    // ========================================================================
    // Change handling
    // ========================================================================

    /// Rebuild every view `event` can affect. Returns whether anything shown
    /// changed.
    pub async fn handle_event(&self, event: &ChangeEvent) -> bool {
        if !self.is_alive() {
            return false;
        }

        debug!(table = %event.table, kind = %event.kind, "row change");
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());

        let views = self.interest.views_for(event.table);
        if views.contains(&DerivedView::Itineraries) {
            self.planner.display().note_change();
        }

        let mut changed = false;
        for view in views {
            changed |= match view {
                DerivedView::Itineraries => self.refresh_itineraries().await,
                DerivedView::RouteInfo => self.refresh_route_info().await,
            };
        }
        changed
    }

    /// Rebuild the itinerary list for the query on screen, if any.
    pub async fn refresh_itineraries(&self) -> bool {
        let display = self.planner.display();
        let Some(query) = display.read(|state| {
            state
                .wants_refresh()
                .then(|| state.query.clone())
                .flatten()
        }) else {
            return false;
        };

        self.planner.rebuild_itineraries(&query).await
    }

    async fn refresh_route_info(&self) -> bool {
        if self.planner.display().read(|state| state.route_info.is_none()) {
            return false;
        }
        match self.planner.show_route_info().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "failed to refresh route info");
                false
            }
        }
    }

    // ========================================================================
    // Foreground
    // ========================================================================

    /// The app returned to the foreground.
    pub async fn resume(self: &Arc<Self>) -> ResumeOutcome {
        {
            let now = Instant::now();
            let mut last = self.last_resume.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| now.saturating_duration_since(at) < self.config.resume_debounce) {
                debug!("resume debounced");
                return ResumeOutcome::Debounced;
            }
            *last = Some(now);
        }

        let reconnect = async {
            if self.connection_state() == ConnectionState::Subscribed {
                return false;
            }
            match self.connect().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "reconnect on resume failed");
                    false
                }
            }
        };

        let (reconnected, _, _) = tokio::join!(
            reconnect,
            self.planner.refresh_profile(),
            self.refresh_itineraries()
        );

        ResumeOutcome::Refreshed { reconnected }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::PlannerConfig;
    use crate::feed::{EventKind, FeedFuture, LocalChangeFeed, Table};
    use crate::search::SearchQuery;
    use tokio::sync::mpsc;
    use crate::testing::{route, route_info, session, FakeStore};
    use trotro_transit::{RouteIdentifier, RouteRow};

    struct Harness {
        store: Arc<FakeStore>,
        feed: LocalChangeFeed,
        planner: Arc<Planner>,
        sync: Arc<LiveSyncController>,
    }

    fn harness() -> Harness {
        let store = Arc::new(FakeStore::default());
        let feed = LocalChangeFeed::new();
        let config = PlannerConfig::new("https://example.supabase.co", "anon");
        let planner = Arc::new(Planner::from_store(&config, store.clone()));
        planner.set_session(Some(session("u1")));
        let sync = LiveSyncController::new(planner.clone(), Arc::new(feed.clone()), config.sync);

        Harness {
            store,
            feed,
            planner,
            sync,
        }
    }

    /// Hands out subscriptions the test can close at will.
    #[derive(Default)]
    struct ScriptedFeed {
        opened: Mutex<Vec<mpsc::Sender<FeedMessage>>>,
    }

    impl ScriptedFeed {
        fn subscriptions(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        async fn close_latest(&self) {
            let tx = self.opened.lock().unwrap().last().cloned().unwrap();
            tx.send(FeedMessage::Closed("server went away".into()))
                .await
                .unwrap();
        }
    }

    impl ChangeFeed for ScriptedFeed {
        fn subscribe<'a>(&'a self, _tables: &'a [Table]) -> FeedFuture<'a, FeedSubscription> {
            Box::pin(async move {
                let (tx, rx) = mpsc::channel(8);
                tx.send(FeedMessage::Acknowledged)
                    .await
                    .map_err(|_| FeedError::Rejected("closed".into()))?;
                self.opened.lock().unwrap().push(tx);
                Ok(FeedSubscription::new(rx))
            })
        }
    }

    fn change(table: Table) -> ChangeEvent {
        ChangeEvent {
            table,
            kind: EventKind::Update,
            record: json!({"id": 1}),
        }
    }

    fn rows(fare: f64) -> Vec<RouteRow> {
        vec![
            route(1, "Accra - Madina", fare, &[(1, "Accra"), (2, "Madina")]),
            route(2, "Accra - Legon - Madina", 8.0, &[(1, "Accra"), (2, "Legon"), (3, "Madina")]),
        ]
    }

    // Lets every runnable task finish under the paused clock.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reaches_subscribed() {
        let h = harness();
        let mut states = h.sync.watch_connection();

        h.sync.connect().await.unwrap();
        states
            .wait_for(|state| *state == ConnectionState::Subscribed)
            .await
            .unwrap();
        assert_eq!(h.feed.subscriber_count(), 1);

        // Already connected.
        h.sync.connect().await.unwrap();
        settle().await;
        assert_eq!(h.feed.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_change_without_search_fetches_nothing() {
        let h = harness();
        assert!(!h.sync.handle_event(&change(Table::Routes)).await);
        assert_eq!(h.store.route_fetches(), 0);
        assert!(h.sync.last_update().is_some());
    }

    #[tokio::test]
    async fn test_identical_refresh_keeps_selection_reference() {
        let h = harness();
        h.store.set_routes(Ok(rows(6.5)));
        h.planner.search("Accra", "Madina").await.unwrap();
        h.planner.select(&RouteIdentifier::new("2"));

        let before = h.planner.display().read(|s| s.selected.clone()).unwrap();
        let rx = h.planner.display().subscribe();

        assert!(!h.sync.handle_event(&change(Table::Routes)).await);
        assert!(!rx.has_changed().unwrap());

        let after = h.planner.display().read(|s| s.selected.clone()).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_changed_rows_update_and_keep_selected_id() {
        let h = harness();
        h.store.set_routes(Ok(rows(6.5)));
        h.planner.search("Accra", "Madina").await.unwrap();
        h.planner.select(&RouteIdentifier::new("2"));

        h.store.set_routes(Ok(rows(7.0)));
        assert!(h.sync.handle_event(&change(Table::RouteStops)).await);

        let state = h.planner.display().snapshot();
        assert_eq!(state.itineraries[0].total_fare, Some(7.0));
        assert_eq!(state.selected.unwrap().id.as_str(), "2");
    }

    #[tokio::test]
    async fn test_selected_route_removed_falls_back_to_first() {
        let h = harness();
        h.store.set_routes(Ok(rows(6.5)));
        h.planner.search("Accra", "Madina").await.unwrap();
        h.planner.select(&RouteIdentifier::new("2"));

        h.store.set_routes(Ok(vec![rows(6.5).remove(0)]));
        assert!(h.sync.handle_event(&change(Table::Routes)).await);
        assert_eq!(
            h.planner.display().read(|s| s.selected.as_ref().map(|it| it.id.to_string())),
            Some("1".into())
        );
    }

    #[tokio::test]
    async fn test_route_info_change_refreshes_shown_info() {
        let h = harness();
        h.store.set_routes(Ok(rows(6.5)));
        h.store.set_route_info(Some(route_info(1, "Old")));
        h.planner.search("Accra", "Madina").await.unwrap();

        // Not shown yet: nothing to refresh.
        assert!(!h.sync.handle_event(&change(Table::RouteInfo)).await);
        assert_eq!(h.store.info_fetches(), 0);

        h.planner.show_route_info().await.unwrap();
        h.store.set_route_info(Some(route_info(1, "New")));
        assert!(h.sync.handle_event(&change(Table::RouteInfo)).await);
        assert_eq!(
            h.planner.display().read(|s| s.route_info.clone().and_then(|i| i.description)),
            Some("New".into())
        );
        assert_eq!(h.store.route_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_refresh_loses_to_newer_search() {
        let h = harness();
        h.store.set_routes(Ok(rows(6.5)));
        h.planner.search("Accra", "Madina").await.unwrap();

        // The refresh is slow and carries old data; the search is fast.
        h.store.queue_routes(Duration::from_millis(500), Ok(rows(1.0)));
        h.store.queue_routes(
            Duration::from_millis(10),
            Ok(vec![route(3, "Circle - Osu", 3.0, &[(1, "Circle"), (2, "Osu")])]),
        );

        let (refreshed, searched) = tokio::join!(
            h.sync.refresh_itineraries(),
            h.planner.search("Circle", "Osu")
        );
        assert!(!refreshed);
        assert!(searched.is_ok());

        let ids = h
            .planner
            .display()
            .read(|s| s.itineraries.iter().map(|it| it.id.to_string()).collect::<Vec<_>>());
        assert_eq!(ids, ["3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_during_search_is_not_lost() {
        let h = harness();
        let with_circle = |fare| {
            let mut all = rows(6.5);
            all.push(route(3, "Circle - Osu", fare, &[(1, "Circle"), (2, "Osu")]));
            all
        };
        h.store.set_routes(Ok(with_circle(3.0)));
        h.planner.search("Accra", "Madina").await.unwrap();

        // The search reads the rows before the edit; the refresh and anything
        // after it see the edit.
        h.store.queue_routes(Duration::from_millis(500), Ok(with_circle(3.0)));
        h.store.queue_routes(Duration::from_millis(10), Ok(with_circle(4.0)));
        h.store.set_routes(Ok(with_circle(4.0)));

        let (searched, _) = tokio::join!(h.planner.search("Circle", "Osu"), async {
            settle().await;
            h.sync.handle_event(&change(Table::Routes)).await
        });
        assert!(searched.is_ok());

        let state = h.planner.display().snapshot();
        assert_eq!(state.query, Some(SearchQuery::new("Circle", "Osu")));
        assert_eq!(state.itineraries[0].total_fare, Some(4.0));
        assert_eq!(state.selected.unwrap().total_fare, Some(4.0));
        assert_eq!(h.store.route_fetches(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_discards_in_flight_and_stops_listening() {
        let h = harness();
        h.store.set_routes(Ok(rows(6.5)));
        h.planner.search("Accra", "Madina").await.unwrap();
        h.sync.connect().await.unwrap();
        settle().await;

        h.store.queue_routes(Duration::from_millis(200), Ok(rows(1.0)));
        let pending = {
            let sync = h.sync.clone();
            tokio::spawn(async move { sync.refresh_itineraries().await })
        };
        settle().await;

        h.sync.teardown();
        assert!(!pending.await.unwrap());
        assert_eq!(h.planner.display().read(|s| s.itineraries[0].total_fare), Some(6.5));
        assert_eq!(h.sync.connection_state(), ConnectionState::Disconnected);

        settle().await;
        let fetches = h.store.route_fetches();
        h.feed.publish(change(Table::Routes));
        settle().await;
        assert_eq!(h.store.route_fetches(), fetches);
        assert_eq!(h.feed.subscriber_count(), 0);
        assert_eq!(h.sync.connect().await, Err(SyncError::TornDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_is_debounced() {
        let h = harness();
        h.store.set_routes(Ok(rows(6.5)));
        h.planner.search("Accra", "Madina").await.unwrap();
        let fetches = h.store.route_fetches();

        assert_eq!(
            h.sync.resume().await,
            ResumeOutcome::Refreshed { reconnected: true }
        );
        assert_eq!(h.store.route_fetches(), fetches + 1);
        assert_eq!(h.store.profile_fetches(), 1);

        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(h.sync.resume().await, ResumeOutcome::Debounced);
        assert_eq!(h.store.route_fetches(), fetches + 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(matches!(h.sync.resume().await, ResumeOutcome::Refreshed { .. }));
        assert_eq!(h.store.route_fetches(), fetches + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_replaces_pending_reconnect() {
        let h = harness();
        let feed = Arc::new(ScriptedFeed::default());
        let config = SyncConfig::default();
        let sync = LiveSyncController::new(h.planner.clone(), feed.clone(), config.clone());

        sync.connect().await.unwrap();
        settle().await;
        assert_eq!(sync.connection_state(), ConnectionState::Subscribed);

        feed.close_latest().await;
        settle().await;
        assert_eq!(sync.connection_state(), ConnectionState::Disconnected);

        // The listener is now waiting out its reconnect delay.
        assert_eq!(
            sync.resume().await,
            ResumeOutcome::Refreshed { reconnected: true }
        );
        settle().await;
        assert_eq!(sync.connection_state(), ConnectionState::Subscribed);
        assert_eq!(feed.subscriptions(), 2);

        tokio::time::advance(config.reconnect_delay * 2).await;
        settle().await;
        assert_eq!(feed.subscriptions(), 2);
        assert_eq!(sync.connection_state(), ConnectionState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_events_drive_refresh() {
        let h = harness();
        h.store.set_routes(Ok(rows(6.5)));
        h.planner.search("Accra", "Madina").await.unwrap();
        h.sync.connect().await.unwrap();
        settle().await;

        let mut rx = h.planner.display().subscribe();
        h.store.set_routes(Ok(rows(9.5)));
        h.feed.publish(change(Table::Stops));

        rx.changed().await.unwrap();
        assert_eq!(h.planner.display().read(|s| s.itineraries[0].total_fare), Some(9.5));
    }
}
