//! Orchestrates the registry's three public operations -- register,
//! release, search -- over a [RegistryStore]. Validation and ordering live
//! here; persistence and the change log live in `mrs-store`, federation
//! fan-out lives in `mrs-federation`. `mrs-server` composes all three per
//! request.

use std::sync::Arc;

use mrs_geometry::{bbox, intersects, nearest_point_distance, volume, Coordinate, Geometry, GeometryError};
use mrs_store::{RegistryStore, StoreError};
use mrs_types::{Identity, Registration, Timestamp};
use thiserror::Error;

pub const DEFAULT_SEARCH_LIMIT: usize = 50;
pub const MAX_SEARCH_LIMIT: usize = 500;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("geometry was invalid: {0}")]
    InvalidGeometry(#[from] GeometryError),
    #[error("service_point {0:?} is not a valid https URI")]
    InvalidUri(String),
    #[error("search range must be >= 0, got {0}")]
    InvalidRange(f64),
    #[error("no such registration")]
    NotFound,
    #[error("{caller} does not own this registration")]
    NotOwner { caller: String },
    #[error("record is owned by origin server {origin_server}")]
    NotAuthoritative { origin_server: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// `service_point` validation from the boundary adapter's URI rules:
/// scheme exactly `https`, non-empty host, no userinfo/fragment/whitespace/
/// control characters, length <= 2048, and it must round-trip through a
/// URI parser.
fn validate_service_point(raw: &str) -> Result<(), RegistryError> {
    if raw.len() > 2048 || raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(RegistryError::InvalidUri(raw.to_string()));
    }

    let url = url::Url::parse(raw).map_err(|_| RegistryError::InvalidUri(raw.to_string()))?;
    if url.scheme() != "https" {
        return Err(RegistryError::InvalidUri(raw.to_string()));
    }
    if url.host_str().unwrap_or_default().is_empty() {
        return Err(RegistryError::InvalidUri(raw.to_string()));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(RegistryError::InvalidUri(raw.to_string()));
    }
    if url.fragment().is_some() {
        return Err(RegistryError::InvalidUri(raw.to_string()));
    }

    Ok(())
}

pub struct RegisterInput {
    pub space: Geometry,
    pub service_point: Option<String>,
    pub foad: bool,
    pub owner: Identity,
    /// When set, this call updates the existing local record by `id`
    /// instead of creating one. Ownership and origin are re-checked (I4).
    pub update_id: Option<String>,
}

pub struct SearchQuery {
    pub center: Coordinate,
    pub range_m: f64,
    pub owner: Option<Identity>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub registration: Registration,
    pub distance_m: f64,
}

pub struct RegistryService {
    store: Arc<dyn RegistryStore>,
    local_server: String,
    max_results: usize,
}

impl RegistryService {
    pub fn new(store: Arc<dyn RegistryStore>, local_server: impl Into<String>) -> Self {
        Self::with_max_results(store, local_server, MAX_SEARCH_LIMIT)
    }

    pub fn with_max_results(
        store: Arc<dyn RegistryStore>,
        local_server: impl Into<String>,
        max_results: usize,
    ) -> Self {
        Self {
            store,
            local_server: local_server.into(),
            max_results,
        }
    }

    fn validate_input(input: &RegisterInput) -> Result<(), RegistryError> {
        input.space.validate()?;
        if input.foad != input.service_point.is_none() {
            return Err(RegistryError::InvalidUri(
                "foad must be set if and only if service_point is absent".to_string(),
            ));
        }
        if let Some(service_point) = &input.service_point {
            validate_service_point(service_point)?;
        }
        Ok(())
    }

    /// Validate and persist a registration: a fresh, locally-originated
    /// record when `update_id` is absent, or a rewrite of an existing
    /// local record (I4: only the origin server may mutate it) when set.
    pub async fn register(
        &self,
        input: RegisterInput,
        now: Timestamp,
    ) -> Result<Registration, RegistryError> {
        Self::validate_input(&input)?;

        if let Some(id) = input.update_id.clone() {
            return self.update(id, input, now).await;
        }

        for _attempt in 0..3 {
            let id = mrs_types::generate_registration_id();
            let registration = Registration {
                id: id.clone(),
                space: input.space.clone(),
                service_point: input.service_point.clone(),
                foad: input.foad,
                owner: input.owner.to_string(),
                origin_server: self.local_server.clone(),
                origin_id: id.clone(),
                version: 1,
                created: now,
                updated: now,
                replicated_from: None,
                last_synced_at: None,
                bbox: bbox(&input.space),
            };

            match self.store.put(registration.clone()).await {
                Ok(_) => return Ok(registration),
                Err(StoreError::CanonicalConflict(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }

        // Vanishingly unlikely with a 16-character random suffix; treated
        // as a store error rather than a silent infinite retry.
        Err(RegistryError::Store(StoreError::CanonicalConflict(
            mrs_types::CanonicalId::new(self.local_server.clone(), "<exhausted retries>"),
        )))
    }

    async fn update(
        &self,
        id: String,
        input: RegisterInput,
        now: Timestamp,
    ) -> Result<Registration, RegistryError> {
        let existing = self.get(&id).await?;
        if existing.origin_server != self.local_server {
            return Err(RegistryError::NotAuthoritative {
                origin_server: existing.origin_server,
            });
        }
        if existing.owner != input.owner.to_string() {
            return Err(RegistryError::NotOwner {
                caller: input.owner.to_string(),
            });
        }

        let updated = Registration {
            space: input.space.clone(),
            service_point: input.service_point,
            foad: input.foad,
            version: existing.version + 1,
            updated: now,
            bbox: bbox(&input.space),
            ..existing
        };
        self.store.put(updated.clone()).await?;
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Result<Registration, RegistryError> {
        self.store.get(id).await?.ok_or(RegistryError::NotFound)
    }

    /// Release a registration the caller owns. Only the origin server may
    /// release a record it holds; replicas are cleaned up by tombstone
    /// propagation instead (see `mrs-federation`). Authority is checked
    /// before ownership, matching the order a redirect-carrying
    /// `not_authoritative` error takes precedence over a plain `forbidden`.
    pub async fn release(
        &self,
        id: &str,
        caller: &Identity,
        now: Timestamp,
    ) -> Result<Registration, RegistryError> {
        let registration = self.get(id).await?;
        if registration.origin_server != self.local_server {
            return Err(RegistryError::NotAuthoritative {
                origin_server: registration.origin_server,
            });
        }
        if registration.owner != caller.to_string() {
            return Err(RegistryError::NotOwner {
                caller: caller.to_string(),
            });
        }

        let (removed, _event) = self.store.release(id, now).await?;
        Ok(removed)
    }

    /// Search local registrations near `query.center`, ordered inside-out
    /// (smallest enclosing volume first), then by distance, then by id for
    /// a stable tiebreak, truncated to the requested (capped) limit.
    pub async fn search(&self, query: SearchQuery) -> Result<Vec<SearchResult>, RegistryError> {
        if query.range_m < 0.0 {
            return Err(RegistryError::InvalidRange(query.range_m));
        }

        let query_geometry = Geometry::Sphere {
            center: query.center,
            radius: query.range_m.max(1.0),
        };
        let candidate_bbox = bbox(&query_geometry);
        let candidates = self.store.query_bbox(candidate_bbox).await?;

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .filter(|r| intersects(&r.space, &query.center, query.range_m))
            .filter(|r| {
                query
                    .owner
                    .as_ref()
                    .map(|owner| r.owner == owner.to_string())
                    .unwrap_or(true)
            })
            .map(|registration| {
                let distance_m = nearest_point_distance(&registration.space, &query.center);
                SearchResult {
                    registration,
                    distance_m,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            volume(&a.registration.space)
                .partial_cmp(&volume(&b.registration.space))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.distance_m
                        .partial_cmp(&b.distance_m)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.registration.id.cmp(&b.registration.id))
        });

        let limit = query
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .min(self.max_results);
        results.truncate(limit);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mrs_store::InMemoryStore;

    fn ts(seconds: i64) -> Timestamp {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn service() -> RegistryService {
        RegistryService::new(Arc::new(InMemoryStore::new()), "example.com")
    }

    fn alice() -> Identity {
        "alice@example.com".parse().unwrap()
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let svc = service();
        let space = Geometry::Sphere {
            center: Coordinate::new(-33.8568, 151.2153, 0.0),
            radius: 25.0,
        };
        let registration = svc
            .register(
                RegisterInput {
                    space,
                    service_point: Some("https://svc.example".to_string()),
                    foad: false,
                    owner: alice(),
                    update_id: None,
                },
                ts(1000),
            )
            .await
            .unwrap();

        let fetched = svc.get(&registration.id).await.unwrap();
        assert_eq!(fetched.id, registration.id);
        assert_eq!(fetched.owner, "alice@example.com");
    }

    #[tokio::test]
    async fn release_rejects_a_non_owner() {
        let svc = service();
        let registration = svc
            .register(
                RegisterInput {
                    space: Geometry::Sphere {
                        center: Coordinate::new(0.0, 0.0, 0.0),
                        radius: 10.0,
                    },
                    service_point: None,
                    foad: true,
                    owner: alice(),
                    update_id: None,
                },
                ts(1000),
            )
            .await
            .unwrap();

        let mallory: Identity = "mallory@example.com".parse().unwrap();
        let err = svc.release(&registration.id, &mallory, ts(2000)).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn search_orders_inside_out_then_by_distance() {
        let svc = service();
        let center = Coordinate::new(-33.8568, 151.2153, 0.0);

        let small = svc
            .register(
                RegisterInput {
                    space: Geometry::Sphere { center, radius: 5.0 },
                    service_point: None,
                    foad: true,
                    owner: alice(),
                    update_id: None,
                },
                ts(1000),
            )
            .await
            .unwrap();
        let large = svc
            .register(
                RegisterInput {
                    space: Geometry::Sphere { center, radius: 500.0 },
                    service_point: None,
                    foad: true,
                    owner: alice(),
                    update_id: None,
                },
                ts(1000),
            )
            .await
            .unwrap();

        let results = svc
            .search(SearchQuery {
                center,
                range_m: 1000.0,
                owner: None,
                limit: None,
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].registration.id, small.id);
        assert_eq!(results[1].registration.id, large.id);
    }

    #[tokio::test]
    async fn search_rejects_negative_range() {
        let svc = service();
        let err = svc
            .search(SearchQuery {
                center: Coordinate::new(0.0, 0.0, 0.0),
                range_m: -1.0,
                owner: None,
                limit: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRange(_)));
    }
}
