//! What the rider currently sees, and the rules for changing it.
//!
//! State lives in a `watch` channel so any number of views can follow it.
//! Writes that would not change anything are swallowed so followers are not
//! woken for identical data. Every asynchronous write carries a
//! [`FetchTicket`]; a ticket that has been overtaken is discarded on arrival.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tokio::sync::watch;
use tracing::{debug, trace};
use trotro_transit::{same_itineraries, Itinerary, MapView, RouteIdentifier, RouteInfo};

use crate::profile::ProfileSnapshot;
use crate::search::{SearchOutcome, SearchQuery};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
pub enum UiOverlay {
    #[default]
    None,
    Search,
    Profile,
    Info,
    History,
}

#[derive(Clone, Debug, Default)]
pub struct DisplayState {
    pub query: Option<SearchQuery>,
    pub itineraries: Vec<Arc<Itinerary>>,
    pub selected: Option<Arc<Itinerary>>,
    pub route_info: Option<RouteInfo>,
    pub profile: Option<ProfileSnapshot>,
    pub overlay: UiOverlay,
    /// Searches left in the current window, as of the last search.
    pub remaining_searches: Option<u32>,
}

impl DisplayState {
    pub fn search_active(&self) -> bool {
        self.query.as_ref().is_some_and(SearchQuery::is_complete)
    }

    /// Whether a change notification should rebuild the itineraries.
    pub fn wants_refresh(&self) -> bool {
        self.search_active() || !self.itineraries.is_empty()
    }

    pub fn map_view(&self) -> MapView {
        MapView::for_selection(self.selected.as_deref())
    }
}

/// Fold freshly built itineraries into `state`.
///
/// Returns `false` and leaves `state` untouched when `fresh` is structurally
/// identical to what is shown. Otherwise the list is replaced, keeping the
/// existing allocation for every itinerary whose content did not change, and
/// the selection follows its id into the new list. It falls back to the
/// first entry (or nothing) when that id is gone.
pub fn reconcile(state: &mut DisplayState, fresh: Vec<Itinerary>) -> bool {
    if same_itineraries(&state.itineraries, &fresh) {
        return false;
    }

    let itineraries: Vec<Arc<Itinerary>> = fresh
        .into_iter()
        .map(|itinerary| {
            state
                .itineraries
                .iter()
                .find(|shown| shown.id == itinerary.id && ***shown == itinerary)
                .cloned()
                .unwrap_or_else(|| Arc::new(itinerary))
        })
        .collect();
    let selected = state
        .selected
        .as_ref()
        .and_then(|current| itineraries.iter().find(|it| it.id == current.id))
        .or_else(|| itineraries.first())
        .cloned();

    state.itineraries = itineraries;
    state.selected = selected;
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FetchKind {
    Search,
    Refresh,
}

/// Proof of when a fetch started, and of which route changes it had seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    sequence: u64,
    kind: FetchKind,
    epoch: u64,
}

struct DisplayInner {
    state: watch::Sender<DisplayState>,
    issued: AtomicU64,
    latest_search: AtomicU64,
    /// Bumped for every route change notification.
    epoch: AtomicU64,
    alive: AtomicBool,
}

#[derive(Clone)]
pub struct DisplayHandle {
    inner: Arc<DisplayInner>,
}

impl Default for DisplayHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayHandle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DisplayState::default());
        Self {
            inner: Arc::new(DisplayInner {
                state,
                issued: AtomicU64::new(0),
                latest_search: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                alive: AtomicBool::new(true),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> DisplayState {
        self.inner.state.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&DisplayState) -> R) -> R {
        f(&self.inner.state.borrow())
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Stop accepting writes. Fetches still in flight land nowhere.
    pub fn close(&self) {
        if self.inner.alive.swap(false, Ordering::SeqCst) {
            debug!("display closed");
        }
    }

    // ========================================================================
    // Tickets
    // ========================================================================

    pub fn begin_search(&self) -> FetchTicket {
        let sequence = self.inner.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.latest_search.store(sequence, Ordering::SeqCst);
        FetchTicket {
            sequence,
            kind: FetchKind::Search,
            epoch: self.inner.epoch.load(Ordering::SeqCst),
        }
    }

    pub fn begin_refresh(&self) -> FetchTicket {
        let sequence = self.inner.issued.fetch_add(1, Ordering::SeqCst) + 1;
        FetchTicket {
            sequence,
            kind: FetchKind::Refresh,
            epoch: self.inner.epoch.load(Ordering::SeqCst),
        }
    }

    /// Record that the rows itineraries are built from have changed.
    pub fn note_change(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether a route change arrived after `ticket` was issued, so the data
    /// it fetched may already be out of date.
    pub fn changed_since(&self, ticket: FetchTicket) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) != ticket.epoch
    }

    /// A search is overtaken only by a later search. A refresh is overtaken
    /// by any later fetch.
    pub fn is_current(&self, ticket: FetchTicket) -> bool {
        if !self.is_alive() {
            return false;
        }
        match ticket.kind {
            FetchKind::Search => self.inner.latest_search.load(Ordering::SeqCst) == ticket.sequence,
            FetchKind::Refresh => self.inner.issued.load(Ordering::SeqCst) == ticket.sequence,
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    fn modify(&self, f: impl FnOnce(&mut DisplayState) -> bool) -> bool {
        if !self.is_alive() {
            trace!("write to closed display dropped");
            return false;
        }
        self.inner.state.send_if_modified(f)
    }

    /// Show the result of a rider-initiated search. The selection is reset
    /// to the first match.
    pub fn apply_search(&self, ticket: FetchTicket, outcome: &SearchOutcome) -> bool {
        if !self.is_current(ticket) {
            debug!(sequence = ticket.sequence, "discarding superseded search");
            return false;
        }

        self.modify(|state| {
            state.itineraries = outcome.all.iter().cloned().map(Arc::new).collect();
            state.selected = state.itineraries.first().cloned();
            state.query = Some(outcome.query.clone());
            state.route_info = None;
            state.remaining_searches = Some(outcome.remaining);
            true
        })
    }

    /// Fold a background rebuild for `query` into the display.
    ///
    /// Dropped when a newer fetch has started or the rider has moved on to a
    /// different query since this one began.
    pub fn apply_refresh(&self, ticket: FetchTicket, query: &SearchQuery, fresh: Vec<Itinerary>) -> bool {
        if !self.is_current(ticket) {
            debug!(sequence = ticket.sequence, "discarding superseded refresh");
            return false;
        }

        self.modify(|state| {
            if state.query.as_ref() != Some(query) {
                return false;
            }
            reconcile(state, fresh)
        })
    }

    pub fn apply_route_info(&self, info: Option<RouteInfo>) -> bool {
        self.modify(|state| {
            if state.route_info == info {
                return false;
            }
            state.route_info = info;
            true
        })
    }

    pub fn apply_profile(&self, profile: Option<ProfileSnapshot>) -> bool {
        self.modify(|state| {
            if state.profile == profile {
                return false;
            }
            state.profile = profile;
            true
        })
    }

    /// Select the displayed itinerary with `route_id`. Returns `false` when
    /// no such itinerary is shown.
    pub fn select(&self, route_id: &RouteIdentifier) -> bool {
        self.modify(|state| {
            let Some(found) = state.itineraries.iter().find(|it| &it.id == route_id) else {
                return false;
            };
            if state
                .selected
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, found))
            {
                return false;
            }
            state.selected = Some(found.clone());
            state.route_info = None;
            true
        })
    }

    /// Exchange start and destination. Results stay until the next search.
    pub fn swap_endpoints(&self) -> bool {
        self.modify(|state| match state.query.as_mut() {
            Some(query) => {
                std::mem::swap(&mut query.start, &mut query.destination);
                true
            }
            None => false,
        })
    }

    /// Clear the query and everything derived from it.
    pub fn reset_search(&self) -> bool {
        // Anything still in flight belongs to the query being cleared.
        self.begin_search();

        self.modify(|state| {
            let had_search = state.query.is_some() || !state.itineraries.is_empty();
            state.query = None;
            state.itineraries.clear();
            state.selected = None;
            state.route_info = None;
            had_search
        })
    }

    pub fn set_overlay(&self, overlay: UiOverlay) -> bool {
        self.modify(|state| {
            if state.overlay == overlay {
                return false;
            }
            state.overlay = overlay;
            true
        })
    }
}
