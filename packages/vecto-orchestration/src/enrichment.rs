//! Venue enrichment
//!
//! Lookups run with bounded concurrency, each under its own timeout. A lookup
//! that fails, times out or finds nothing leaves the venue's fields
//! [`Enrichment::Unknown`]; nothing is guessed.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vecto_storage::GeoPoint;

use crate::plan::Venue;

/// A field that is either looked up or explicitly unknown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Enrichment<T> {
    Known(T),
    Unknown,
}

impl<T> Enrichment<T> {
    pub fn is_known(&self) -> bool {
        matches!(self, Enrichment::Known(_))
    }
}

impl<T> From<Option<T>> for Enrichment<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Enrichment::Unknown, Enrichment::Known)
    }
}

/// What an enrichment service knows about a venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueDetails {
    pub hours: Option<String>,
    pub coordinates: Option<GeoPoint>,
}

/// Venue lookup collaborator (places/hours API)
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    /// `Ok(None)` when the venue is not found
    async fn lookup(&self, venue: &Venue) -> anyhow::Result<Option<VenueDetails>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedVenue {
    #[serde(flatten)]
    pub venue: Venue,
    pub hours: Enrichment<String>,
    pub coordinates: Enrichment<GeoPoint>,
}

impl EnrichedVenue {
    fn unknown(venue: Venue) -> Self {
        Self {
            venue,
            hours: Enrichment::Unknown,
            coordinates: Enrichment::Unknown,
        }
    }
}

/// Enrich every venue, at most `concurrency` lookups in flight; output order
/// matches input order
pub async fn enrich_venues(
    service: &dyn EnrichmentService,
    venues: Vec<Venue>,
    concurrency: usize,
    timeout: Duration,
) -> Vec<EnrichedVenue> {
    stream::iter(venues)
        .map(|venue| async move {
            match tokio::time::timeout(timeout, service.lookup(&venue)).await {
                Ok(Ok(Some(details))) => EnrichedVenue {
                    hours: details.hours.into(),
                    coordinates: details.coordinates.into(),
                    venue,
                },
                Ok(Ok(None)) => {
                    debug!(venue = %venue.name, "no enrichment found");
                    EnrichedVenue::unknown(venue)
                }
                Ok(Err(e)) => {
                    warn!(venue = %venue.name, "enrichment lookup failed: {:#}", e);
                    EnrichedVenue::unknown(venue)
                }
                Err(_) => {
                    warn!(venue = %venue.name, timeout_ms = timeout.as_millis() as u64, "enrichment lookup timed out");
                    EnrichedVenue::unknown(venue)
                }
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}
