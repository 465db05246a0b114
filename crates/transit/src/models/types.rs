//! Row types as the remote store returns them, plus error types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::identifiers::*;

// ============================================================================
// Store Rows
// ============================================================================

/// A named boarding point.
///
/// Coordinates are kept as the raw text the store holds; parsing happens when
/// an itinerary is built so one bad row cannot fail a whole fetch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopIdentifier,
    pub name: String,
    #[serde(deserialize_with = "numeric_text")]
    pub latitude: String,
    #[serde(deserialize_with = "numeric_text")]
    pub longitude: String,
}

impl Stop {
    pub fn new(
        id: impl Into<StopIdentifier>,
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            latitude: latitude.to_string(),
            longitude: longitude.to_string(),
        }
    }
}

/// Junction row placing a stop on a route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteStopLink {
    pub stop_order: i32,
    #[serde(default, deserialize_with = "optional_number")]
    pub fare_to_next: Option<f64>,
    #[serde(default, deserialize_with = "optional_number")]
    pub distance_to_next: Option<f64>,
    #[serde(rename = "stops")]
    pub stop: Stop,
}

/// A pre-authored route with its (unordered) junction rows embedded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteRow {
    pub id: RouteIdentifier,
    pub name: String,
    #[serde(default, deserialize_with = "optional_number")]
    pub total_distance: Option<f64>,
    #[serde(default, deserialize_with = "optional_number")]
    pub total_fare: Option<f64>,
    #[serde(default, rename = "route_stops")]
    pub links: Vec<RouteStopLink>,
}

/// Append-only record of a submitted search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub user_id: UserIdentifier,
    pub start_point: String,
    pub destination: String,
    pub searched_at: DateTime<Utc>,
}

impl SearchHistoryEntry {
    pub fn now(user_id: UserIdentifier, start_point: &str, destination: &str) -> Self {
        Self {
            user_id,
            start_point: start_point.to_owned(),
            destination: destination.to_owned(),
            searched_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserIdentifier,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn display_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(name), None) | (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        }
    }
}

/// A route the user authored themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreatedRoute {
    pub id: RouteIdentifier,
    pub user_id: UserIdentifier,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_point: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Supplementary metadata for a route, stored in `route_info`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub route_id: RouteIdentifier,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub operating_hours: Option<String>,
    #[serde(default)]
    pub landmarks: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An authenticated session handed out by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserIdentifier,
    pub access_token: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Details collected when a rider creates an account. The names end up in
/// the provider's user metadata and from there in the profile row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

// ============================================================================
// Lenient numeric columns
// ============================================================================

// PostgREST renders `numeric` as a JSON number, but text columns and older
// exports carry the same values as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

fn numeric_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    Ok(match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => n.to_string(),
        NumberOrText::Text(s) => s,
    })
}

fn optional_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<f64>, D::Error> {
    Ok(match Option::<NumberOrText>::deserialize(deserializer)? {
        Some(NumberOrText::Number(n)) => Some(n),
        Some(NumberOrText::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitError {
    #[error("Stop {stop} has an unparsable {axis}: {value:?}")]
    InvalidCoordinate {
        stop: StopIdentifier,
        axis: &'static str,
        value: String,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Failure talking to the remote store or identity provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Not authorized")]
    Unauthorized,

    #[error("Could not decode store response: {0}")]
    Decode(String),

    #[error("Not found")]
    NotFound,
}

impl StoreError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout | StoreError::Transport(_) => true,
            StoreError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransitError>;
