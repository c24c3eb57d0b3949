//! Observation and vineyard persistence, imagery blob storage and the
//! correlation query layer built on top of them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use vhar_core::{HarvestError, Observation, ObservationKind, Result, TimeRange, Vineyard};

mod blob;
mod correlation;
pub mod postgres;

pub use blob::{BlobStore, FsBlobStore, StoredBlob};
pub use correlation::{CorrelationEngine, EnvironmentalSnapshot, SnapshotFilter};
pub use postgres::{PgObservationStore, PgVineyardStore};

pub const CRATE_NAME: &str = "vhar-storage";

/// Typed persistence for every observation kind.
///
/// Writers to different ids never conflict. Concurrent `update` calls on the
/// same id are serialized by the backend and the last writer wins; there is
/// no optimistic concurrency check.
///
/// Cancellation follows the async convention: dropping a returned future
/// abandons the operation, so callers bound calls with `tokio::time::timeout`
/// or `tokio::select!`.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Persists a new observation and returns its id, allocating one when the
    /// observation's id is zero. Ids are unique across kinds; an explicit id
    /// already held by any kind is a `Conflict`, and later allocations start
    /// above it.
    async fn save(&self, observation: Observation) -> Result<i64>;

    async fn get(&self, kind: ObservationKind, id: i64) -> Result<Observation>;

    /// Full replacement of an existing observation.
    async fn update(&self, observation: Observation) -> Result<()>;

    async fn delete(&self, kind: ObservationKind, id: i64) -> Result<()>;

    async fn list_by_vineyard(&self, kind: ObservationKind, vineyard_id: i64) -> Result<Vec<Observation>>;

    /// Both bounds are inclusive. An empty result is not an error.
    async fn list_by_date_range(
        &self,
        kind: ObservationKind,
        vineyard_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>>;

    /// Newest first, at most `limit` rows.
    async fn list_recent(&self, kind: ObservationKind, vineyard_id: i64, limit: i64) -> Result<Vec<Observation>>;
}

/// Read side of the vineyard CRUD collaborator, plus `save` for seeding.
#[async_trait]
pub trait VineyardStore: Send + Sync {
    async fn save(&self, vineyard: Vineyard) -> Result<i64>;
    async fn get(&self, id: i64) -> Result<Vineyard>;
    async fn list(&self) -> Result<Vec<Vineyard>>;
}

pub fn check_vineyard_id(vineyard_id: i64) -> Result<()> {
    if vineyard_id <= 0 {
        return Err(HarvestError::invalid(format!("invalid vineyard id {vineyard_id}")));
    }
    Ok(())
}

pub fn check_observation_id(kind: ObservationKind, id: i64) -> Result<()> {
    if id <= 0 {
        return Err(HarvestError::invalid(format!("invalid {kind} observation id {id}")));
    }
    Ok(())
}

pub fn check_limit(limit: i64) -> Result<usize> {
    if limit <= 0 {
        return Err(HarvestError::invalid(format!("limit must be positive, got {limit}")));
    }
    Ok(usize::try_from(limit).unwrap_or(usize::MAX))
}

fn not_found(kind: ObservationKind, id: i64) -> HarvestError {
    HarvestError::not_found(format!("{kind} observation {id}"))
}

#[derive(Debug, Default)]
pub struct InMemoryObservationStore {
    rows: RwLock<BTreeMap<(ObservationKind, i64), Observation>>,
    last_id: AtomicI64,
}

impl InMemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    async fn scan(
        &self,
        kind: ObservationKind,
        vineyard_id: i64,
        keep: impl Fn(&Observation) -> bool,
    ) -> Vec<Observation> {
        self.rows
            .read()
            .await
            .iter()
            .filter(|((k, _), obs)| *k == kind && obs.vineyard_id() == vineyard_id && keep(obs))
            .map(|(_, obs)| obs.clone())
            .collect()
    }
}

#[async_trait]
impl ObservationStore for InMemoryObservationStore {
    async fn save(&self, mut observation: Observation) -> Result<i64> {
        observation.validate()?;
        let kind = observation.kind();
        let mut rows = self.rows.write().await;
        let id = match observation.id() {
            0 => self.last_id.fetch_add(1, Ordering::SeqCst) + 1,
            explicit => {
                check_observation_id(kind, explicit)?;
                if let Some((taken, _)) = rows.keys().find(|(_, id)| *id == explicit) {
                    return Err(HarvestError::Conflict(format!(
                        "observation {explicit} already exists as {taken}"
                    )));
                }
                self.last_id.fetch_max(explicit, Ordering::SeqCst);
                explicit
            }
        };
        observation.set_id(id);
        rows.insert((kind, id), observation);
        Ok(id)
    }

    async fn get(&self, kind: ObservationKind, id: i64) -> Result<Observation> {
        check_observation_id(kind, id)?;
        self.rows
            .read()
            .await
            .get(&(kind, id))
            .cloned()
            .ok_or_else(|| not_found(kind, id))
    }

    async fn update(&self, observation: Observation) -> Result<()> {
        let kind = observation.kind();
        check_observation_id(kind, observation.id())?;
        observation.validate()?;
        let mut rows = self.rows.write().await;
        match rows.get_mut(&(kind, observation.id())) {
            Some(slot) => {
                *slot = observation;
                Ok(())
            }
            None => Err(not_found(kind, observation.id())),
        }
    }

    async fn delete(&self, kind: ObservationKind, id: i64) -> Result<()> {
        check_observation_id(kind, id)?;
        self.rows
            .write()
            .await
            .remove(&(kind, id))
            .map(|_| ())
            .ok_or_else(|| not_found(kind, id))
    }

    async fn list_by_vineyard(&self, kind: ObservationKind, vineyard_id: i64) -> Result<Vec<Observation>> {
        check_vineyard_id(vineyard_id)?;
        Ok(self.scan(kind, vineyard_id, |_| true).await)
    }

    async fn list_by_date_range(
        &self,
        kind: ObservationKind,
        vineyard_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        check_vineyard_id(vineyard_id)?;
        let range = TimeRange::new(start, end)?;
        Ok(self
            .scan(kind, vineyard_id, |obs| range.contains(&obs.timestamp()))
            .await)
    }

    async fn list_recent(&self, kind: ObservationKind, vineyard_id: i64, limit: i64) -> Result<Vec<Observation>> {
        check_vineyard_id(vineyard_id)?;
        let limit = check_limit(limit)?;
        let mut rows = self.scan(kind, vineyard_id, |_| true).await;
        rows.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()).then(b.id().cmp(&a.id())));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryVineyardStore {
    rows: RwLock<BTreeMap<i64, Vineyard>>,
    last_id: AtomicI64,
}

impl InMemoryVineyardStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VineyardStore for InMemoryVineyardStore {
    async fn save(&self, mut vineyard: Vineyard) -> Result<i64> {
        if vineyard.name.trim().is_empty() {
            return Err(HarvestError::invalid("vineyard name must not be empty"));
        }
        let mut rows = self.rows.write().await;
        let id = if vineyard.id > 0 {
            self.last_id.fetch_max(vineyard.id, Ordering::SeqCst);
            vineyard.id
        } else {
            self.last_id.fetch_add(1, Ordering::SeqCst) + 1
        };
        vineyard.id = id;
        rows.insert(id, vineyard);
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Vineyard> {
        check_vineyard_id(id)?;
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| HarvestError::not_found(format!("vineyard {id}")))
    }

    async fn list(&self) -> Result<Vec<Vineyard>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use vhar_core::{ErrorKind, Severity};

    #[tokio::test]
    async fn save_allocates_ids_and_rejects_invalid_input() {
        let store = InMemoryObservationStore::new();
        let a = store.save(soil(5, day(1))).await.unwrap();
        let b = store.save(weather(5, day(1))).await.unwrap();
        assert!(a > 0 && b > a);

        let err = store.save(soil(0, day(1))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = store.save(soil(5, DateTime::<Utc>::default())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let fetched = store.get(ObservationKind::Soil, a).await.unwrap();
        assert_eq!(fetched.id(), a);
        assert_eq!(store.get(ObservationKind::Pest, a).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn save_with_taken_id_conflicts() {
        let store = InMemoryObservationStore::new();
        let mut obs = soil(5, day(1));
        obs.set_id(40);
        assert_eq!(store.save(obs.clone()).await.unwrap(), 40);
        assert_eq!(store.save(obs).await.unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(store.save(soil(5, day(2))).await.unwrap(), 41);

        let mut other_kind = weather(5, day(3));
        other_kind.set_id(40);
        assert_eq!(store.save(other_kind).await.unwrap_err().kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn date_range_rejects_inverted_bounds() {
        let store = InMemoryObservationStore::new();
        let err = store
            .list_by_date_range(ObservationKind::Weather, 5, day(20), day(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn date_range_includes_both_boundaries() {
        let store = InMemoryObservationStore::new();
        for d in [9, 10, 15, 20, 21] {
            store.save(weather(5, day(d))).await.unwrap();
        }
        store.save(weather(6, day(15))).await.unwrap();
        store.save(soil(5, day(15))).await.unwrap();

        let rows = store
            .list_by_date_range(ObservationKind::Weather, 5, day(10), day(20))
            .await
            .unwrap();
        let mut days: Vec<_> = rows.iter().map(|o| o.timestamp()).collect();
        days.sort();
        assert_eq!(days, vec![day(10), day(15), day(20)]);

        let empty = store
            .list_by_date_range(ObservationKind::Pest, 5, day(10), day(20))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_bounded() {
        let store = InMemoryObservationStore::new();
        for d in [3, 1, 7, 5] {
            store.save(pest(5, day(d), "mealybug", Severity::Mild)).await.unwrap();
        }
        let rows = store.list_recent(ObservationKind::Pest, 5, 2).await.unwrap();
        let days: Vec<_> = rows.iter().map(|o| o.timestamp()).collect();
        assert_eq!(days, vec![day(7), day(5)]);

        let err = store.list_recent(ObservationKind::Pest, 5, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn update_replaces_and_delete_removes_only_target() {
        let store = InMemoryObservationStore::new();
        let id = store.save(pest(5, day(1), "mealybug", Severity::Mild)).await.unwrap();
        let other = store.save(pest(5, day(2), "leafhopper", Severity::Mild)).await.unwrap();

        let mut replacement = pest(5, day(3), "mealybug", Severity::Severe);
        assert_eq!(store.update(replacement.clone()).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        replacement.set_id(id);
        store.update(replacement.clone()).await.unwrap();
        assert_eq!(store.get(ObservationKind::Pest, id).await.unwrap(), replacement);

        store.delete(ObservationKind::Pest, id).await.unwrap();
        assert_eq!(store.delete(ObservationKind::Pest, id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(store.get(ObservationKind::Pest, other).await.is_ok());
    }

    #[tokio::test]
    async fn vineyard_store_round_trips() {
        let store = InMemoryVineyardStore::new();
        let id = store
            .save(Vineyard {
                id: 0,
                name: "Stag's Leap".into(),
                location: "Napa".into(),
                bounding_box: vineyard_bbox(),
            })
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().name, "Stag's Leap");
        assert_eq!(store.get(id + 1).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
