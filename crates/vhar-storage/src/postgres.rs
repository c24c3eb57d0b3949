//! PostgreSQL backends over a single `observations` table. Observation ids
//! come from one sequence and are unique across kinds.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use vhar_core::{BoundingBox, GeometryValue, HarvestError, Observation, ObservationKind, Result, TimeRange, Vineyard};

use crate::{check_limit, check_observation_id, check_vineyard_id, ObservationStore, VineyardStore};

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying migrations")
}

/// Maps driver errors onto the harvest taxonomy.
pub fn map_sqlx_error(err: sqlx::Error) -> HarvestError {
    match err {
        sqlx::Error::RowNotFound => HarvestError::not_found("row"),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            HarvestError::Unavailable(err.to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => HarvestError::Conflict(db.to_string()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23514") => {
            HarvestError::InvalidArgument(db.to_string())
        }
        other => HarvestError::Internal(other.to_string()),
    }
}

/// Points are stored as degenerate boxes so every kind shares one extent layout.
fn extent(geometry: GeometryValue) -> (f64, f64, f64, f64) {
    match geometry {
        GeometryValue::Point(p) => (p.x, p.y, p.x, p.y),
        GeometryValue::BoundingBox(b) => (b.min_x(), b.min_y(), b.max_x(), b.max_y()),
    }
}

fn payload(observation: &Observation) -> Result<serde_json::Value> {
    serde_json::to_value(observation)
        .map_err(|err| HarvestError::Internal(format!("encoding {} observation: {err}", observation.kind())))
}

fn row_to_observation(row: &PgRow) -> Result<Observation> {
    let id: i64 = row.try_get("id").map_err(map_sqlx_error)?;
    let value: serde_json::Value = row.try_get("payload").map_err(map_sqlx_error)?;
    let mut observation: Observation = serde_json::from_value(value)
        .map_err(|err| HarvestError::Internal(format!("decoding observation {id}: {err}")))?;
    observation.set_id(id);
    Ok(observation)
}

#[derive(Debug, Clone)]
pub struct PgObservationStore {
    pool: PgPool,
}

impl PgObservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>) -> Result<Vec<Observation>> {
        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter().map(row_to_observation).collect()
    }
}

#[async_trait]
impl ObservationStore for PgObservationStore {
    async fn save(&self, observation: Observation) -> Result<i64> {
        observation.validate()?;
        let kind = observation.kind();
        let (min_x, min_y, max_x, max_y) = extent(observation.geometry());
        let body = payload(&observation)?;

        if observation.id() == 0 {
            let row = sqlx::query(
                r#"
                INSERT INTO observations (kind, vineyard_id, observed_at, min_x, min_y, max_x, max_y, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
                "#,
            )
            .bind(kind.as_str())
            .bind(observation.vineyard_id())
            .bind(observation.timestamp())
            .bind(min_x)
            .bind(min_y)
            .bind(max_x)
            .bind(max_y)
            .bind(body)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_sqlx_error(err).with_context(format!("inserting {kind} observation")))?;
            return row.try_get("id").map_err(map_sqlx_error);
        }

        check_observation_id(kind, observation.id())?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        // Blocks concurrent serial allocation until the sequence has moved past this id.
        sqlx::query("LOCK TABLE observations IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let row = sqlx::query(
            r#"
            INSERT INTO observations (id, kind, vineyard_id, observed_at, min_x, min_y, max_x, max_y, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(observation.id())
        .bind(kind.as_str())
        .bind(observation.vineyard_id())
        .bind(observation.timestamp())
        .bind(min_x)
        .bind(min_y)
        .bind(max_x)
        .bind(max_y)
        .bind(body)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        if row.is_none() {
            return Err(HarvestError::Conflict(format!(
                "observation {} already exists",
                observation.id()
            )));
        }

        sqlx::query(
            r#"
            SELECT setval(
                'observations_id_seq',
                GREATEST($1, (SELECT last_value FROM observations_id_seq), (SELECT MAX(id) FROM observations))
            )
            "#,
        )
        .bind(observation.id())
        .execute(&mut *tx)
        .await
        .map_err(|err| map_sqlx_error(err).with_context("advancing observation id sequence"))?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(observation.id())
    }

    async fn get(&self, kind: ObservationKind, id: i64) -> Result<Observation> {
        check_observation_id(kind, id)?;
        let row = sqlx::query("SELECT id, payload FROM observations WHERE id = $1 AND kind = $2")
            .bind(id)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        match row {
            Some(row) => row_to_observation(&row),
            None => Err(HarvestError::not_found(format!("{kind} observation {id}"))),
        }
    }

    async fn update(&self, observation: Observation) -> Result<()> {
        let kind = observation.kind();
        check_observation_id(kind, observation.id())?;
        observation.validate()?;
        let (min_x, min_y, max_x, max_y) = extent(observation.geometry());
        let body = payload(&observation)?;

        // Single-statement replace; concurrent writers to one id: last write wins.
        let result = sqlx::query(
            r#"
            UPDATE observations
               SET vineyard_id = $3, observed_at = $4,
                   min_x = $5, min_y = $6, max_x = $7, max_y = $8,
                   payload = $9
             WHERE id = $1 AND kind = $2
            "#,
        )
        .bind(observation.id())
        .bind(kind.as_str())
        .bind(observation.vineyard_id())
        .bind(observation.timestamp())
        .bind(min_x)
        .bind(min_y)
        .bind(max_x)
        .bind(max_y)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(HarvestError::not_found(format!("{kind} observation {}", observation.id())));
        }
        Ok(())
    }

    async fn delete(&self, kind: ObservationKind, id: i64) -> Result<()> {
        check_observation_id(kind, id)?;
        let result = sqlx::query("DELETE FROM observations WHERE id = $1 AND kind = $2")
            .bind(id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(HarvestError::not_found(format!("{kind} observation {id}")));
        }
        Ok(())
    }

    async fn list_by_vineyard(&self, kind: ObservationKind, vineyard_id: i64) -> Result<Vec<Observation>> {
        check_vineyard_id(vineyard_id)?;
        self.fetch(
            sqlx::query("SELECT id, payload FROM observations WHERE kind = $1 AND vineyard_id = $2 ORDER BY id")
                .bind(kind.as_str())
                .bind(vineyard_id),
        )
        .await
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
        self.fetch(
            sqlx::query(
                r#"
                SELECT id, payload
                  FROM observations
                 WHERE kind = $1 AND vineyard_id = $2
                   AND observed_at BETWEEN $3 AND $4
                 ORDER BY observed_at, id
                "#,
            )
            .bind(kind.as_str())
            .bind(vineyard_id)
            .bind(range.start())
            .bind(range.end()),
        )
        .await
    }

    async fn list_recent(&self, kind: ObservationKind, vineyard_id: i64, limit: i64) -> Result<Vec<Observation>> {
        check_vineyard_id(vineyard_id)?;
        check_limit(limit)?;
        self.fetch(
            sqlx::query(
                r#"
                SELECT id, payload
                  FROM observations
                 WHERE kind = $1 AND vineyard_id = $2
                 ORDER BY observed_at DESC, id DESC
                 LIMIT $3
                "#,
            )
            .bind(kind.as_str())
            .bind(vineyard_id)
            .bind(limit),
        )
        .await
    }
}

#[derive(Debug, Clone)]
pub struct PgVineyardStore {
    pool: PgPool,
}

impl PgVineyardStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_vineyard(row: &PgRow) -> Result<Vineyard> {
    let bounding_box = BoundingBox::new(
        row.try_get("min_x").map_err(map_sqlx_error)?,
        row.try_get("min_y").map_err(map_sqlx_error)?,
        row.try_get("max_x").map_err(map_sqlx_error)?,
        row.try_get("max_y").map_err(map_sqlx_error)?,
    )?;
    Ok(Vineyard {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        name: row.try_get("name").map_err(map_sqlx_error)?,
        location: row.try_get("location").map_err(map_sqlx_error)?,
        bounding_box,
    })
}

#[async_trait]
impl VineyardStore for PgVineyardStore {
    async fn save(&self, vineyard: Vineyard) -> Result<i64> {
        if vineyard.name.trim().is_empty() {
            return Err(HarvestError::invalid("vineyard name must not be empty"));
        }
        let bbox = vineyard.bounding_box;
        let row = sqlx::query(
            r#"
            INSERT INTO vineyards (name, location, min_x, min_y, max_x, max_y)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&vineyard.name)
        .bind(&vineyard.location)
        .bind(bbox.min_x())
        .bind(bbox.min_y())
        .bind(bbox.max_x())
        .bind(bbox.max_y())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.try_get("id").map_err(map_sqlx_error)
    }

    async fn get(&self, id: i64) -> Result<Vineyard> {
        check_vineyard_id(id)?;
        let row = sqlx::query("SELECT id, name, location, min_x, min_y, max_x, max_y FROM vineyards WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        match row {
            Some(row) => row_to_vineyard(&row),
            None => Err(HarvestError::not_found(format!("vineyard {id}"))),
        }
    }

    async fn list(&self) -> Result<Vec<Vineyard>> {
        let rows = sqlx::query("SELECT id, name, location, min_x, min_y, max_x, max_y FROM vineyards ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(row_to_vineyard).collect()
    }
}
