//! Row-level change notifications from the remote store.
//!
//! A [`ChangeFeed`] hands out a [`FeedSubscription`]; dropping the
//! subscription releases whatever the feed holds for it.

use std::{future::Future, pin::Pin};

use itertools::Itertools;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Table {
    Routes,
    RouteStops,
    Stops,
    RouteInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: EventKind,
    /// New row for inserts and updates, old row for deletes.
    pub record: Value,
}

impl ChangeEvent {
    /// An update with no row attached, for when the rows themselves were lost.
    pub fn touched(table: Table) -> Self {
        Self {
            table,
            kind: EventKind::Update,
            record: Value::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FeedMessage {
    /// The feed confirmed the subscription.
    Acknowledged,
    Change(ChangeEvent),
    /// The feed went away; no further messages follow.
    Closed(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    #[error("Could not reach change feed: {0}")]
    Connect(String),

    #[error("Change feed protocol error: {0}")]
    Protocol(String),

    #[error("Change feed rejected the subscription: {0}")]
    Rejected(String),
}

pub type FeedFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FeedError>> + Send + 'a>>;

pub struct FeedSubscription {
    messages: mpsc::Receiver<FeedMessage>,
}

impl FeedSubscription {
    pub fn new(messages: mpsc::Receiver<FeedMessage>) -> Self {
        Self { messages }
    }

    /// `None` once the feed side has shut down.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        self.messages.recv().await
    }
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe<'a>(&'a self, tables: &'a [Table]) -> FeedFuture<'a, FeedSubscription>;
}

// ============================================================================
// Interest set
// ============================================================================

/// A piece of displayed state that a change can invalidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum DerivedView {
    Itineraries,
    RouteInfo,
}

/// Which tables feed which views.
#[derive(Clone, Debug)]
pub struct InterestSet {
    entries: Vec<(Table, DerivedView)>,
}

impl InterestSet {
    pub fn new(entries: Vec<(Table, DerivedView)>) -> Self {
        Self { entries }
    }

    pub fn standard() -> Self {
        Self::new(vec![
            (Table::Routes, DerivedView::Itineraries),
            (Table::RouteStops, DerivedView::Itineraries),
            (Table::Stops, DerivedView::Itineraries),
            (Table::RouteInfo, DerivedView::RouteInfo),
        ])
    }

    pub fn tables(&self) -> Vec<Table> {
        self.entries.iter().map(|(table, _)| *table).unique().collect()
    }

    pub fn views_for(&self, table: Table) -> Vec<DerivedView> {
        self.entries
            .iter()
            .filter(|(t, _)| *t == table)
            .map(|(_, view)| *view)
            .collect()
    }
}

impl Default for InterestSet {
    fn default() -> Self {
        Self::standard()
    }
}

// ============================================================================
// In-process feed
// ============================================================================

/// A feed driven by [`LocalChangeFeed::publish`] rather than a socket.
#[derive(Clone)]
pub struct LocalChangeFeed {
    events: broadcast::Sender<ChangeEvent>,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self { events }
    }

    /// Returns the number of live subscriptions the event reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed for LocalChangeFeed {
    fn subscribe<'a>(&'a self, tables: &'a [Table]) -> FeedFuture<'a, FeedSubscription> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(32);
            let mut events = self.events.subscribe();
            let tables = tables.to_vec();

            tx.send(FeedMessage::Acknowledged)
                .await
                .map_err(|_| FeedError::Rejected("subscriber dropped".into()))?;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        event = events.recv() => match event {
                            Ok(event) if tables.contains(&event.table) => {
                                trace!(table = %event.table, "forwarding local change");
                                if tx.send(FeedMessage::Change(event)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                // The skipped rows are unknown, so report every
                                // table as touched.
                                debug!(skipped, "local feed subscriber lagged");
                                for table in &tables {
                                    let event = ChangeEvent::touched(*table);
                                    if tx.send(FeedMessage::Change(event)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                let _ = tx.send(FeedMessage::Closed("feed dropped".into())).await;
                                break;
                            }
                        },
                    }
                }
            });

            Ok(FeedSubscription::new(rx))
        })
    }
}
