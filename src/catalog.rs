//! Catalog of physical objects on the work surface.
//!
//! The catalog is imported in bulk from a semicolon-delimited file and afterwards mutated only
//! by the dialogue engine: nearest-neighbour corrections from the tracker and removals once an
//! action has been executed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use csv_async::{AsyncReaderBuilder, StringRecord, Trim};
use futures_util::StreamExt;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::error::ImportError;
use crate::spatial::{CoordinateText, Position};

/// Attribute name -> expected value. Values compare case-insensitively.
pub type Predicates = BTreeMap<String, String>;

pub const ID_COLUMN: &str = "id";
pub const X_COLUMN: &str = "x";
pub const Y_COLUMN: &str = "y";
pub const IMAGE_COLUMN: &str = "image";
pub const NAME_COLUMN: &str = "name";

/// Attribute derived from the name column at import time.
pub const SHAPE_ATTRIBUTE: &str = "shape";

static BRICK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)brick\s*\d+\s*x\s*\d+").expect("static pattern"));

/// A physical object known to the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: String,
    pub position: Position,
    /// Lower-case attribute names (e.g. `color`, `shape`, `name`) to values.
    pub attributes: BTreeMap<String, String>,
    /// Resolved path of the object's reference image, if any.
    pub image: Option<PathBuf>,
    /// Coordinates as imported or last reported. `None` renders from `position`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinate_text: Option<CoordinateText>,
}

impl ObjectRecord {
    pub fn new(id: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            position,
            attributes: BTreeMap::new(),
            image: None,
            coordinate_text: None,
        }
    }

    /// Coordinates as they go out in frames.
    pub fn coordinates(&self) -> CoordinateText {
        self.coordinate_text
            .clone()
            .unwrap_or_else(|| CoordinateText::from(&self.position))
    }

    pub fn with_attribute(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.attributes
            .insert(key.as_ref().to_lowercase(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// True when every predicate matches, ignoring case.
    pub fn matches(&self, predicates: &Predicates) -> bool {
        predicates.iter().all(|(key, expected)| {
            self.attributes
                .get(&key.to_lowercase())
                .is_some_and(|actual| actual.to_lowercase() == expected.to_lowercase())
        })
    }
}

/// Classifies an object name into a coarse shape.
///
/// Roof tiles are `slope`, `Brick <n>X<m>` sizes are `regular`, everything else is `round`.
pub fn classify_shape(name: &str) -> &'static str {
    if name.to_lowercase().contains("roof tile") {
        "slope"
    } else if BRICK_PATTERN.is_match(name) {
        "regular"
    } else {
        "round"
    }
}

/// Returns the subset of `records` matching every predicate, preserving order.
///
/// An empty predicate set returns the records unchanged.
pub fn filter_records(records: &[ObjectRecord], predicates: &Predicates) -> Vec<ObjectRecord> {
    records
        .iter()
        .filter(|record| record.matches(predicates))
        .cloned()
        .collect()
}

/// A position/attribute correction reported by the tracking source.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub position: Position,
    /// The reported coordinates as text, if the update came off the wire.
    pub coordinate_text: Option<CoordinateText>,
    pub attributes: BTreeMap<String, String>,
}

impl RecordUpdate {
    pub fn at(position: Position) -> Self {
        Self {
            position,
            coordinate_text: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// Result of [`ObjectCatalog::update_nearest`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied { id: String, distance: f64 },
    /// Nothing within the threshold. `distance` is `None` for an empty catalog.
    NoCloseMatch { distance: Option<f64> },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectCatalog {
    records: IndexMap<String, ObjectRecord>,
}

impl ObjectCatalog {
    /// Builds a catalog from already constructed records.
    pub fn from_records(
        records: impl IntoIterator<Item = ObjectRecord>,
    ) -> Result<Self, ImportError> {
        let mut map = IndexMap::new();
        for record in records {
            if map.contains_key(&record.id) {
                return Err(ImportError::DuplicateId(record.id));
            }
            map.insert(record.id.clone(), record);
        }
        Ok(Self { records: map })
    }

    /// Imports a catalog from a semicolon-delimited file.
    ///
    /// Image references resolve relative to the file's directory.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| ImportError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let catalog = Self::from_reader(file, base_dir).await?;
        info!(path = %path.display(), objects = catalog.len(), "catalog imported");
        Ok(catalog)
    }

    /// Imports a catalog from any async byte source.
    pub async fn from_reader<R>(source: R, base_dir: &Path) -> Result<Self, ImportError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = AsyncReaderBuilder::new()
            .delimiter(b';')
            .trim(Trim::All)
            .create_reader(source);

        let columns = Columns::from_headers(reader.headers().await?)?;
        let mut records = Vec::new();
        let mut rows = reader.records();
        while let Some(row) = rows.next().await {
            let row = row?;
            records.push(columns.record(&row, base_dir).await?);
        }
        Self::from_records(records)
    }

    /// Replaces the contents with a fresh import. On failure the catalog is left untouched.
    pub async fn reload(&mut self, path: impl AsRef<Path>) -> Result<(), ImportError> {
        *self = Self::load(path).await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ObjectRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.records.values()
    }

    /// All records matching every predicate, in catalog order.
    pub fn filter(&self, predicates: &Predicates) -> Vec<ObjectRecord> {
        self.records()
            .filter(|record| record.matches(predicates))
            .cloned()
            .collect()
    }

    /// Finds the attribute whose values include `descriptor` (e.g. `blue` -> `color`).
    pub fn attribute_for(&self, descriptor: &str) -> Option<String> {
        let wanted = descriptor.to_lowercase();
        self.records().find_map(|record| {
            record
                .attributes
                .iter()
                .find(|(_, value)| value.to_lowercase() == wanted)
                .map(|(key, _)| key.clone())
        })
    }

    pub fn nearest_to(&self, position: &Position) -> Option<(&ObjectRecord, f64)> {
        self.records()
            .map(|record| (record, record.position.distance(position)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Applies `update` to the record nearest its position, if within `threshold`.
    ///
    /// The matched record takes the reported position and attributes. A renamed record has its
    /// shape re-derived unless the update sets the shape explicitly.
    pub fn update_nearest(&mut self, update: &RecordUpdate, threshold: f64) -> UpdateOutcome {
        let Some((id, distance)) = self
            .nearest_to(&update.position)
            .map(|(record, distance)| (record.id.clone(), distance))
        else {
            return UpdateOutcome::NoCloseMatch { distance: None };
        };

        if distance > threshold {
            return UpdateOutcome::NoCloseMatch {
                distance: Some(distance),
            };
        }

        if let Some(record) = self.records.get_mut(&id) {
            record.position = update.position;
            record.coordinate_text = update.coordinate_text.clone();
            for (key, value) in &update.attributes {
                record.attributes.insert(key.to_lowercase(), value.clone());
            }
            let renamed = update.attributes.contains_key(NAME_COLUMN);
            if renamed && !update.attributes.contains_key(SHAPE_ATTRIBUTE) {
                let shape = record
                    .attribute(NAME_COLUMN)
                    .map(classify_shape)
                    .unwrap_or("round");
                record
                    .attributes
                    .insert(SHAPE_ATTRIBUTE.to_string(), shape.to_string());
            }
            debug!(id = %id, distance, "object updated");
        }
        UpdateOutcome::Applied { id, distance }
    }

    /// Removes a record. Absent identifiers are a no-op.
    pub fn remove(&mut self, id: &str) -> Option<ObjectRecord> {
        self.records.shift_remove(id)
    }
}

/// Column positions resolved from the header row.
struct Columns {
    id: usize,
    x: usize,
    y: usize,
    image: usize,
    name: usize,
    extra: Vec<(usize, String)>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self, ImportError> {
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        for (index, header) in headers.iter().enumerate() {
            let key = header.trim().to_lowercase();
            if key.is_empty() {
                return Err(ImportError::Header(format!("column {index} has no name")));
            }
            if seen.insert(key.clone(), index).is_some() {
                return Err(ImportError::Header(format!("duplicate column {key:?}")));
            }
        }

        let required = |name: &str| {
            seen.get(name)
                .copied()
                .ok_or_else(|| ImportError::Header(format!("missing column {name:?}")))
        };
        let id = required(ID_COLUMN)?;
        let x = required(X_COLUMN)?;
        let y = required(Y_COLUMN)?;
        let image = required(IMAGE_COLUMN)?;
        let name = required(NAME_COLUMN)?;

        let fixed = [id, x, y, image, name];
        let extra = seen
            .iter()
            .filter(|(_, index)| !fixed.contains(index))
            .map(|(key, index)| (*index, key.clone()))
            .collect();

        Ok(Self {
            id,
            x,
            y,
            image,
            name,
            extra,
        })
    }

    async fn record(
        &self,
        row: &StringRecord,
        base_dir: &Path,
    ) -> Result<ObjectRecord, ImportError> {
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        let cell = |index: usize| row.get(index).unwrap_or("").trim();
        let coordinate = |index: usize, axis: &str| {
            cell(index)
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ImportError::Row {
                    line,
                    reason: format!("{axis} coordinate {:?} is not a number", cell(index)),
                })
        };

        let id = cell(self.id);
        if id.is_empty() {
            return Err(ImportError::Row {
                line,
                reason: "empty identifier".to_string(),
            });
        }
        let position = Position::new(coordinate(self.x, "x")?, coordinate(self.y, "y")?);

        let name = cell(self.name);
        let mut record = ObjectRecord::new(id, position)
            .with_attribute(NAME_COLUMN, name)
            .with_attribute(SHAPE_ATTRIBUTE, classify_shape(name));
        record.coordinate_text = Some(CoordinateText::new(cell(self.x), cell(self.y)));
        for (index, key) in &self.extra {
            let value = cell(*index);
            if !value.is_empty() {
                record = record.with_attribute(key, value);
            }
        }

        let image = cell(self.image);
        if !image.is_empty() {
            let path = base_dir.join(image);
            tokio::fs::read(&path)
                .await
                .map_err(|source| ImportError::Attachment {
                    id: id.to_string(),
                    path: path.clone(),
                    source,
                })?;
            record.image = Some(path);
        }
        Ok(record)
    }
}
