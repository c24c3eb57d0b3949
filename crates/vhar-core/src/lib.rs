//! Core domain model for the viticulture harvester: geometry, vineyards,
//! typed environmental observations and the shared error taxonomy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vhar-core";

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;

/// Coarse classification of a [`HarvestError`], stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarvestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl HarvestError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Only transient I/O failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Prefix the message with `context`, keeping the variant intact.
    pub fn with_context(self, context: impl fmt::Display) -> Self {
        let wrap = |msg: String| format!("{context}: {msg}");
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(wrap(m)),
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::Conflict(m) => Self::Conflict(wrap(m)),
            Self::Unavailable(m) => Self::Unavailable(wrap(m)),
            Self::Internal(m) => Self::Internal(wrap(m)),
            Self::Cancelled(m) => Self::Cancelled(wrap(m)),
        }
    }
}

/// A longitude/latitude position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Longitude.
    pub x: f64,
    /// Latitude.
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in longitude/latitude space.
///
/// Fields are private so every instance has passed [`BoundingBox::new`]:
/// `min_x <= max_x` and `min_y <= max_y`, all coordinates finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBoundingBox")]
pub struct BoundingBox {
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
}

#[derive(Deserialize)]
struct RawBoundingBox {
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
}

impl TryFrom<RawBoundingBox> for BoundingBox {
    type Error = HarvestError;

    fn try_from(raw: RawBoundingBox) -> Result<Self> {
        Self::new(raw.min_x, raw.min_y, raw.max_x, raw.max_y)
    }
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Result<Self> {
        if [min_x, min_y, max_x, max_y].iter().any(|v| !v.is_finite()) {
            return Err(HarvestError::invalid("bounding box coordinates must be finite"));
        }
        if min_x > max_x {
            return Err(HarvestError::invalid(format!(
                "bounding box min_x {min_x} exceeds max_x {max_x}"
            )));
        }
        if min_y > max_y {
            return Err(HarvestError::invalid(format!(
                "bounding box min_y {min_y} exceeds max_y {max_y}"
            )));
        }
        Ok(Self {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    pub fn min_x(&self) -> f64 {
        self.min_x
    }

    pub fn min_y(&self) -> f64 {
        self.min_y
    }

    pub fn max_x(&self) -> f64 {
        self.max_x
    }

    pub fn max_y(&self) -> f64 {
        self.max_y
    }

    /// Edges are inclusive.
    pub fn contains(&self, point: &Point) -> bool {
        point.x >= self.min_x && point.x <= self.max_x && point.y >= self.min_y && point.y <= self.max_y
    }

    /// True when the two boxes share at least one point, touching edges included.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

impl FromStr for BoundingBox {
    type Err = HarvestError;

    /// Parses `minX,minY,maxX,maxY`.
    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| HarvestError::invalid(format!("bounding box `{s}`: {err}")))?;
        match parts.as_slice() {
            [min_x, min_y, max_x, max_y] => Self::new(*min_x, *min_y, *max_x, *max_y),
            _ => Err(HarvestError::invalid(format!(
                "bounding box `{s}` must have four comma-separated coordinates"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeometryValue {
    Point(Point),
    BoundingBox(BoundingBox),
}

impl GeometryValue {
    pub fn intersects(&self, area: &BoundingBox) -> bool {
        match self {
            Self::Point(p) => area.contains(p),
            Self::BoundingBox(b) => area.intersects(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vineyard {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// Free-text location description.
    pub location: String,
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Soil,
    Pest,
    Weather,
    Image,
}

impl ObservationKind {
    pub const ALL: [ObservationKind; 4] = [Self::Soil, Self::Pest, Self::Weather, Self::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soil => "soil",
            Self::Pest => "pest",
            Self::Weather => "weather",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObservationKind {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "soil" => Ok(Self::Soil),
            "pest" | "pests" => Ok(Self::Pest),
            "weather" => Ok(Self::Weather),
            "image" | "images" | "imagery" | "satellite" => Ok(Self::Image),
            other => Err(HarvestError::invalid(format!("unknown observation kind `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
    Beneficial,
}

impl FromStr for Severity {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mild" => Ok(Self::Mild),
            "moderate" => Ok(Self::Moderate),
            "severe" => Ok(Self::Severe),
            "beneficial" => Ok(Self::Beneficial),
            other => Err(HarvestError::invalid(format!("unknown severity `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SoilProperties {
    #[serde(default)]
    pub ph: Option<f64>,
    #[serde(default)]
    pub organic_matter_pct: Option<f64>,
    #[serde(default)]
    pub moisture_pct: Option<f64>,
    #[serde(default)]
    pub soil_type: Option<String>,
    /// Nutrient name (nitrogen, phosphorus, ...) to concentration.
    #[serde(default)]
    pub nutrients: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilObservation {
    #[serde(default)]
    pub id: i64,
    pub vineyard_id: i64,
    #[serde(default)]
    pub sampled_at: DateTime<Utc>,
    pub location: Point,
    #[serde(default)]
    pub properties: SoilProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PestObservation {
    #[serde(default)]
    pub id: i64,
    pub vineyard_id: i64,
    #[serde(default)]
    pub observed_at: DateTime<Utc>,
    pub location: Point,
    pub pest_type: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    #[serde(default)]
    pub id: i64,
    pub vineyard_id: i64,
    #[serde(default)]
    pub observed_at: DateTime<Utc>,
    pub location: Point,
    pub temperature_c: f64,
    pub humidity_pct: f64,
}

/// Plain or satellite imagery; satellite captures carry a ground resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageObservation {
    #[serde(default)]
    pub id: i64,
    pub vineyard_id: i64,
    #[serde(default)]
    pub captured_at: DateTime<Utc>,
    pub bounding_box: BoundingBox,
    pub url: String,
    #[serde(default)]
    pub resolution_meters: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Soil(SoilObservation),
    Pest(PestObservation),
    Weather(WeatherObservation),
    Image(ImageObservation),
}

impl Observation {
    pub fn kind(&self) -> ObservationKind {
        match self {
            Self::Soil(_) => ObservationKind::Soil,
            Self::Pest(_) => ObservationKind::Pest,
            Self::Weather(_) => ObservationKind::Weather,
            Self::Image(_) => ObservationKind::Image,
        }
    }

    /// Zero until the store allocates one.
    pub fn id(&self) -> i64 {
        match self {
            Self::Soil(o) => o.id,
            Self::Pest(o) => o.id,
            Self::Weather(o) => o.id,
            Self::Image(o) => o.id,
        }
    }

    pub fn set_id(&mut self, id: i64) {
        match self {
            Self::Soil(o) => o.id = id,
            Self::Pest(o) => o.id = id,
            Self::Weather(o) => o.id = id,
            Self::Image(o) => o.id = id,
        }
    }

    pub fn vineyard_id(&self) -> i64 {
        match self {
            Self::Soil(o) => o.vineyard_id,
            Self::Pest(o) => o.vineyard_id,
            Self::Weather(o) => o.vineyard_id,
            Self::Image(o) => o.vineyard_id,
        }
    }

    /// The single timestamp range queries filter on for this kind.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Soil(o) => o.sampled_at,
            Self::Pest(o) => o.observed_at,
            Self::Weather(o) => o.observed_at,
            Self::Image(o) => o.captured_at,
        }
    }

    pub fn geometry(&self) -> GeometryValue {
        match self {
            Self::Soil(o) => GeometryValue::Point(o.location),
            Self::Pest(o) => GeometryValue::Point(o.location),
            Self::Weather(o) => GeometryValue::Point(o.location),
            Self::Image(o) => GeometryValue::BoundingBox(o.bounding_box),
        }
    }

    /// Checks the fields every store requires before persisting.
    pub fn validate(&self) -> Result<()> {
        if self.vineyard_id() <= 0 {
            return Err(HarvestError::invalid(format!(
                "{} observation has invalid vineyard id {}",
                self.kind(),
                self.vineyard_id()
            )));
        }
        if is_unset_timestamp(&self.timestamp()) {
            return Err(HarvestError::invalid(format!(
                "{} observation is missing its timestamp",
                self.kind()
            )));
        }
        Ok(())
    }
}

/// The zero value an omitted timestamp deserializes to (the Unix epoch).
pub fn is_unset_timestamp(ts: &DateTime<Utc>) -> bool {
    *ts == DateTime::<Utc>::default()
}

/// Inclusive `[start, end]` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(HarvestError::invalid(format!(
                "range start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts <= self.end
    }
}
