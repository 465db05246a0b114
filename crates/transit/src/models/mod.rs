//! Transit data models and derived itinerary values.

pub mod itinerary;
pub mod types;

// Re-exports for convenience
pub use itinerary::{same_itineraries, Itinerary, ItineraryStop, MapView, DEFAULT_CENTER};
pub use types::{
    CreatedRoute, NewAccount, Result, RouteInfo, RouteRow, RouteStopLink, SearchHistoryEntry,
    Session, Stop, StoreError, TransitError, UserProfile,
};
