//! Client-side itinerary values and the map projection built from them.

use std::borrow::Borrow;

use geo::{BoundingRect, Coord, LineString, Rect};
use serde::{Deserialize, Serialize};

use crate::identifiers::RouteIdentifier;

/// Accra city centre, used when nothing is selected.
pub const DEFAULT_CENTER: [f64; 2] = [5.6037, -0.1870];

/// One stop along an itinerary, in ride order.
///
/// `lat`/`lng` are `None` when the store held text that is not a finite
/// number; the rest of the itinerary is still usable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItineraryStop {
    pub name: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub fare_to_next: Option<f64>,
    pub distance_to_next: Option<f64>,
}

impl ItineraryStop {
    pub fn position(&self) -> Option<[f64; 2]> {
        Some([self.lat?, self.lng?])
    }
}

/// A route as presented to the rider.
///
/// Built fresh on every fetch and compared by value; two itineraries are the
/// same exactly when every field, including every stop, is equal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: RouteIdentifier,
    pub name: String,
    pub total_distance: Option<f64>,
    pub total_fare: Option<f64>,
    pub stops: Vec<ItineraryStop>,
}

impl Itinerary {
    pub fn origin(&self) -> Option<&ItineraryStop> {
        self.stops.first()
    }

    pub fn terminus(&self) -> Option<&ItineraryStop> {
        self.stops.last()
    }

    /// Stops strictly between the origin and the terminus.
    pub fn intermediate_stop_count(&self) -> usize {
        self.stops.len().saturating_sub(2)
    }

    /// `[lat, lng]` pairs of every stop with usable coordinates.
    pub fn coordinates(&self) -> Vec<[f64; 2]> {
        self.stops.iter().filter_map(ItineraryStop::position).collect()
    }

    /// Polyline through the stops, x = longitude and y = latitude.
    pub fn path(&self) -> LineString {
        self.coordinates()
            .into_iter()
            .map(|[lat, lng]| Coord { x: lng, y: lat })
            .collect()
    }

    pub fn bounds(&self) -> Option<Rect> {
        self.path().bounding_rect()
    }
}

/// Structural equality over two itinerary sets, order-sensitive.
pub fn same_itineraries<A, B>(a: &[A], b: &[B]) -> bool
where
    A: Borrow<Itinerary>,
    B: Borrow<Itinerary>,
{
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(left, right)| left.borrow() == right.borrow())
}

/// What the map surface consumes for the current selection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MapView {
    pub center: [f64; 2],
    pub route_coordinates: Vec<[f64; 2]>,
    pub stops: Vec<ItineraryStop>,
}

impl MapView {
    pub fn for_selection(selected: Option<&Itinerary>) -> Self {
        let Some(itinerary) = selected else {
            return Self {
                center: DEFAULT_CENTER,
                route_coordinates: Vec::new(),
                stops: Vec::new(),
            };
        };

        let route_coordinates = itinerary.coordinates();
        let center = route_coordinates.first().copied().unwrap_or(DEFAULT_CENTER);

        Self {
            center,
            route_coordinates,
            stops: itinerary.stops.clone(),
        }
    }
}
