//! Correlation query engine: composes a vineyard's environmental picture from
//! per-kind observation listings, and fans batch writes out to the store.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info_span, Instrument};
use vhar_core::{
    BoundingBox, HarvestError, ImageObservation, Observation, ObservationKind, PestObservation, Result, Severity,
    SoilObservation, TimeRange, Vineyard, WeatherObservation,
};

use crate::{ObservationStore, VineyardStore};

/// Every kind is always present; a kind without rows is an empty list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentalSnapshot {
    pub vineyard: Vineyard,
    pub soil: Vec<SoilObservation>,
    pub pests: Vec<PestObservation>,
    pub weather: Vec<WeatherObservation>,
    pub imagery: Vec<ImageObservation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SnapshotFilter {
    pub range: Option<TimeRange>,
    /// Keep observations whose geometry intersects this box.
    pub area: Option<BoundingBox>,
}

pub struct CorrelationEngine {
    observations: Arc<dyn ObservationStore>,
    vineyards: Arc<dyn VineyardStore>,
}

impl CorrelationEngine {
    pub fn new(observations: Arc<dyn ObservationStore>, vineyards: Arc<dyn VineyardStore>) -> Self {
        Self {
            observations,
            vineyards,
        }
    }

    pub fn observations(&self) -> &Arc<dyn ObservationStore> {
        &self.observations
    }

    pub fn vineyards(&self) -> &Arc<dyn VineyardStore> {
        &self.vineyards
    }

    pub async fn environmental_snapshot(&self, vineyard_id: i64) -> Result<EnvironmentalSnapshot> {
        self.snapshot_filtered(vineyard_id, &SnapshotFilter::default()).await
    }

    /// Fails as a whole when the vineyard is missing or any one kind cannot be
    /// listed; the error names the kind that failed.
    pub async fn snapshot_filtered(&self, vineyard_id: i64, filter: &SnapshotFilter) -> Result<EnvironmentalSnapshot> {
        let span = info_span!("environmental_snapshot", vineyard_id);
        async move {
            let vineyard = self.vineyards.get(vineyard_id).await?;

            let (soil, pests, weather, imagery) = tokio::try_join!(
                self.list_kind(ObservationKind::Soil, vineyard_id, filter),
                self.list_kind(ObservationKind::Pest, vineyard_id, filter),
                self.list_kind(ObservationKind::Weather, vineyard_id, filter),
                self.list_kind(ObservationKind::Image, vineyard_id, filter),
            )?;

            let snapshot = EnvironmentalSnapshot {
                vineyard,
                soil: soil
                    .into_iter()
                    .map(|o| match o {
                        Observation::Soil(s) => Ok(s),
                        other => Err(kind_mismatch(ObservationKind::Soil, &other)),
                    })
                    .collect::<Result<_>>()?,
                pests: pests
                    .into_iter()
                    .map(|o| match o {
                        Observation::Pest(p) => Ok(p),
                        other => Err(kind_mismatch(ObservationKind::Pest, &other)),
                    })
                    .collect::<Result<_>>()?,
                weather: weather
                    .into_iter()
                    .map(|o| match o {
                        Observation::Weather(w) => Ok(w),
                        other => Err(kind_mismatch(ObservationKind::Weather, &other)),
                    })
                    .collect::<Result<_>>()?,
                imagery: imagery
                    .into_iter()
                    .map(|o| match o {
                        Observation::Image(i) => Ok(i),
                        other => Err(kind_mismatch(ObservationKind::Image, &other)),
                    })
                    .collect::<Result<_>>()?,
            };
            debug!(
                soil = snapshot.soil.len(),
                pests = snapshot.pests.len(),
                weather = snapshot.weather.len(),
                imagery = snapshot.imagery.len(),
                "assembled snapshot"
            );
            Ok(snapshot)
        }
        .instrument(span)
        .await
    }

    async fn list_kind(&self, kind: ObservationKind, vineyard_id: i64, filter: &SnapshotFilter) -> Result<Vec<Observation>> {
        let rows = match filter.range {
            Some(range) => {
                self.observations
                    .list_by_date_range(kind, vineyard_id, range.start(), range.end())
                    .await
            }
            None => self.observations.list_by_vineyard(kind, vineyard_id).await,
        }
        .map_err(|err| err.with_context(format!("listing {kind} observations")))?;

        Ok(match filter.area {
            Some(area) => rows.into_iter().filter(|o| o.geometry().intersects(&area)).collect(),
            None => rows,
        })
    }

    /// Pest observations matching an optional pest type (case-insensitive) and
    /// an optional severity.
    pub async fn filter_pests(
        &self,
        vineyard_id: i64,
        pest_type: Option<&str>,
        severity: Option<Severity>,
    ) -> Result<Vec<PestObservation>> {
        let rows = self
            .observations
            .list_by_vineyard(ObservationKind::Pest, vineyard_id)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|o| match o {
                Observation::Pest(p) => Some(p),
                _ => None,
            })
            .filter(|p| pest_type.map_or(true, |t| p.pest_type.eq_ignore_ascii_case(t)))
            .filter(|p| severity.map_or(true, |s| p.severity == s))
            .collect())
    }

    /// Saves every observation concurrently and waits for all of them.
    ///
    /// Returns the first error read back from the shared error channel, which
    /// is not necessarily the first failure in time or in submission order.
    /// The batch is not atomic: items other than the failed ones may have
    /// been persisted. Use [`Self::save_many_detailed`] for per-item outcomes.
    pub async fn save_many(&self, observations: Vec<Observation>) -> Result<()> {
        if observations.is_empty() {
            return Ok(());
        }
        // Sized to the batch so no task ever waits to report its failure.
        let (tx, mut rx) = mpsc::channel::<HarvestError>(observations.len());
        let mut tasks = JoinSet::new();
        for observation in observations {
            let store = Arc::clone(&self.observations);
            let tx = tx.clone();
            tasks.spawn(async move {
                if let Err(err) = store.save(observation).await {
                    let _ = tx.send(err).await;
                }
            });
        }
        drop(tx);

        let mut task_failure = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                task_failure.get_or_insert_with(|| HarvestError::Internal(format!("batch save task failed: {err}")));
            }
        }

        if let Some(err) = rx.recv().await {
            return Err(err);
        }
        task_failure.map_or(Ok(()), Err)
    }

    /// Per-item outcomes in submission order.
    pub async fn save_many_detailed(&self, observations: Vec<Observation>) -> Vec<Result<i64>> {
        join_all(observations.into_iter().map(|o| self.observations.save(o))).await
    }
}

fn kind_mismatch(expected: ObservationKind, got: &Observation) -> HarvestError {
    HarvestError::Internal(format!(
        "store returned a {} observation while listing {expected}",
        got.kind()
    ))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use vhar_core::{BoundingBox, ErrorKind};

    use super::*;
    use crate::test_support::*;
    use crate::{InMemoryObservationStore, InMemoryVineyardStore};

    async fn seeded() -> (CorrelationEngine, Arc<InMemoryObservationStore>, i64) {
        let observations = Arc::new(InMemoryObservationStore::new());
        let vineyards = Arc::new(InMemoryVineyardStore::new());
        let vineyard_id = vineyards
            .save(Vineyard {
                id: 0,
                name: "Carneros Block 7".into(),
                location: "Sonoma".into(),
                bounding_box: vineyard_bbox(),
            })
            .await
            .unwrap();
        let engine = CorrelationEngine::new(observations.clone(), vineyards);
        (engine, observations, vineyard_id)
    }

    #[tokio::test]
    async fn snapshot_reports_every_kind_with_exact_counts() {
        let (engine, store, vid) = seeded().await;
        store.save(soil(vid, day(1))).await.unwrap();
        store.save(soil(vid, day(2))).await.unwrap();
        store.save(pest(vid, day(3), "phylloxera", Severity::Severe)).await.unwrap();
        for d in [4, 5, 6] {
            store.save(image(vid, day(d), vineyard_bbox())).await.unwrap();
        }
        store.save(weather(vid + 1, day(1))).await.unwrap();

        let snapshot = engine.environmental_snapshot(vid).await.unwrap();
        assert_eq!(snapshot.soil.len(), 2);
        assert_eq!(snapshot.pests.len(), 1);
        assert_eq!(snapshot.weather.len(), 0);
        assert_eq!(snapshot.imagery.len(), 3);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["weather"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn snapshot_of_missing_vineyard_is_not_found() {
        let (engine, _store, vid) = seeded().await;
        let err = engine.environmental_snapshot(vid + 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    struct FailingWeather(InMemoryObservationStore);

    #[async_trait]
    impl ObservationStore for FailingWeather {
        async fn save(&self, observation: Observation) -> Result<i64> {
            self.0.save(observation).await
        }
        async fn get(&self, kind: ObservationKind, id: i64) -> Result<Observation> {
            self.0.get(kind, id).await
        }
        async fn update(&self, observation: Observation) -> Result<()> {
            self.0.update(observation).await
        }
        async fn delete(&self, kind: ObservationKind, id: i64) -> Result<()> {
            self.0.delete(kind, id).await
        }
        async fn list_by_vineyard(&self, kind: ObservationKind, vineyard_id: i64) -> Result<Vec<Observation>> {
            if kind == ObservationKind::Weather {
                return Err(HarvestError::Unavailable("weather partition offline".into()));
            }
            self.0.list_by_vineyard(kind, vineyard_id).await
        }
        async fn list_by_date_range(
            &self,
            kind: ObservationKind,
            vineyard_id: i64,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Observation>> {
            self.0.list_by_date_range(kind, vineyard_id, start, end).await
        }
        async fn list_recent(&self, kind: ObservationKind, vineyard_id: i64, limit: i64) -> Result<Vec<Observation>> {
            self.0.list_recent(kind, vineyard_id, limit).await
        }
    }

    #[tokio::test]
    async fn one_failing_kind_fails_the_whole_snapshot_and_names_it() {
        let vineyards = Arc::new(InMemoryVineyardStore::new());
        let vid = vineyards
            .save(Vineyard {
                id: 0,
                name: "Block A".into(),
                location: String::new(),
                bounding_box: vineyard_bbox(),
            })
            .await
            .unwrap();
        let engine = CorrelationEngine::new(Arc::new(FailingWeather(InMemoryObservationStore::new())), vineyards);
        let err = engine.environmental_snapshot(vid).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.to_string().contains("weather"));
    }

    #[tokio::test]
    async fn filtered_snapshot_applies_range_and_area() {
        let (engine, store, vid) = seeded().await;
        store.save(weather(vid, day(5))).await.unwrap();
        store.save(weather(vid, day(25))).await.unwrap();
        let far = BoundingBox::new(10.0, 10.0, 11.0, 11.0).unwrap();
        store.save(image(vid, day(5), far)).await.unwrap();
        store.save(image(vid, day(6), vineyard_bbox())).await.unwrap();

        let filter = SnapshotFilter {
            range: Some(TimeRange::new(day(1), day(10)).unwrap()),
            area: Some(vineyard_bbox()),
        };
        let snapshot = engine.snapshot_filtered(vid, &filter).await.unwrap();
        assert_eq!(snapshot.weather.len(), 1);
        assert_eq!(snapshot.imagery.len(), 1);
        assert_eq!(snapshot.imagery[0].captured_at, day(6));
    }

    #[tokio::test]
    async fn pests_filter_by_type_and_severity() {
        let (engine, store, vid) = seeded().await;
        store.save(pest(vid, day(1), "Phylloxera", Severity::Severe)).await.unwrap();
        store.save(pest(vid, day(2), "phylloxera", Severity::Mild)).await.unwrap();
        store.save(pest(vid, day(3), "ladybird", Severity::Beneficial)).await.unwrap();

        assert_eq!(engine.filter_pests(vid, Some("PHYLLOXERA"), None).await.unwrap().len(), 2);
        assert_eq!(
            engine
                .filter_pests(vid, Some("phylloxera"), Some(Severity::Severe))
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(engine.filter_pests(vid, None, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn batch_save_surfaces_an_error_without_rolling_back() {
        let (engine, store, vid) = seeded().await;
        let batch = vec![soil(vid, day(1)), soil(0, day(2)), soil(vid, day(3))];

        let err = engine.save_many(batch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        // Non-atomic: the valid items may well have landed.
        let persisted = store.list_by_vineyard(ObservationKind::Soil, vid).await.unwrap();
        assert!(persisted.len() <= 2);
        assert!(!persisted.is_empty());
    }

    #[tokio::test]
    async fn batch_save_succeeds_when_every_item_is_valid() {
        let (engine, store, vid) = seeded().await;
        engine
            .save_many(vec![soil(vid, day(1)), weather(vid, day(1)), pest(vid, day(1), "mite", Severity::Mild)])
            .await
            .unwrap();
        assert_eq!(store.len().await, 3);
        engine.save_many(Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn detailed_batch_save_reports_each_item_in_order() {
        let (engine, _store, vid) = seeded().await;
        let results = engine
            .save_many_detailed(vec![soil(vid, day(1)), soil(0, day(2)), soil(vid, day(3))])
            .await;
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert!(results[2].is_ok());
    }
}
