//! Persistence interface consumed by the nested writer
//!
//! The writer never talks to a database directly. Everything it needs from
//! storage goes through [`Persistence`]: row creation and updates, deletes
//! that may be refused by a protecting foreign key, primary key and filter
//! lookups, and many-to-many association management.

use crate::schema::{PrimaryKeyKind, ThroughMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Attribute map of one row
pub type Attrs = serde_json::Map<String, Value>;

/// Primary key of a persisted row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
	Int(i64),
	Uuid(Uuid),
	Slug(String),
}

impl PrimaryKey {
	/// Parses a payload value as a key of the given kind
	///
	/// Integer keys accept JSON numbers and numeric strings. Empty strings
	/// and nulls never produce a key.
	pub fn from_value(kind: PrimaryKeyKind, value: &Value) -> Option<Self> {
		match (kind, value) {
			(PrimaryKeyKind::Integer, Value::Number(n)) => n.as_i64().map(PrimaryKey::Int),
			(PrimaryKeyKind::Integer, Value::String(s)) => s.trim().parse().ok().map(PrimaryKey::Int),
			(PrimaryKeyKind::Uuid, Value::String(s)) => Uuid::parse_str(s).ok().map(PrimaryKey::Uuid),
			(PrimaryKeyKind::Slug, Value::String(s)) if !s.is_empty() => {
				Some(PrimaryKey::Slug(s.clone()))
			}
			_ => None,
		}
	}

	pub fn to_value(&self) -> Value {
		match self {
			PrimaryKey::Int(id) => Value::from(*id),
			PrimaryKey::Uuid(id) => Value::String(id.to_string()),
			PrimaryKey::Slug(slug) => Value::String(slug.clone()),
		}
	}
}

impl fmt::Display for PrimaryKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PrimaryKey::Int(id) => write!(f, "{id}"),
			PrimaryKey::Uuid(id) => write!(f, "{id}"),
			PrimaryKey::Slug(slug) => f.write_str(slug),
		}
	}
}

impl From<i64> for PrimaryKey {
	fn from(id: i64) -> Self {
		PrimaryKey::Int(id)
	}
}

impl From<Uuid> for PrimaryKey {
	fn from(id: Uuid) -> Self {
		PrimaryKey::Uuid(id)
	}
}

/// A persisted row
///
/// `attrs` always carries the primary key attribute as well.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
	pub entity: String,
	pub pk: PrimaryKey,
	pub attrs: Attrs,
}

impl Row {
	pub fn new(entity: impl Into<String>, pk: PrimaryKey, attrs: Attrs) -> Self {
		Self {
			entity: entity.into(),
			pk,
			attrs,
		}
	}

	/// Attribute value, `None` when the column is unknown
	pub fn get(&self, column: &str) -> Option<&Value> {
		self.attrs.get(column)
	}

	/// String attribute, `None` for other JSON types
	pub fn get_str(&self, column: &str) -> Option<&str> {
		self.get(column).and_then(Value::as_str)
	}
}

impl fmt::Display for Row {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} object ({})", self.entity, self.pk)
	}
}

/// Comparison applied to one attribute path
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
	Exact(Value),
	In(Vec<Value>),
	IsNull(bool),
}

/// One condition of a [`Filter`]
///
/// `path` follows relations segment by segment, e.g. `["profile", "user",
/// "username"]`; the segment `pk` names the primary key of the entity reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
	pub path: Vec<String>,
	pub lookup: Lookup,
}

/// Row filter understood by [`Persistence::find_by_filter`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
	pub conditions: Vec<Condition>,
	pub exclude: Vec<PrimaryKey>,
	pub for_update: bool,
	pub limit: Option<usize>,
}

/// Splits a `field__subfield` lookup path
fn split_path(path: &str) -> Vec<String> {
	path.split("__").map(str::to_string).collect()
}

impl Filter {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn exact(mut self, path: &str, value: Value) -> Self {
		self.conditions.push(Condition {
			path: split_path(path),
			lookup: Lookup::Exact(value),
		});
		self
	}

	#[must_use]
	pub fn is_in(mut self, path: &str, values: Vec<Value>) -> Self {
		self.conditions.push(Condition {
			path: split_path(path),
			lookup: Lookup::In(values),
		});
		self
	}

	#[must_use]
	pub fn is_null(mut self, path: &str, null: bool) -> Self {
		self.conditions.push(Condition {
			path: split_path(path),
			lookup: Lookup::IsNull(null),
		});
		self
	}

	/// Restricts the filter to the given primary keys
	#[must_use]
	pub fn pk_in(self, pks: &[PrimaryKey]) -> Self {
		self.is_in("pk", pks.iter().map(PrimaryKey::to_value).collect())
	}

	/// Drops rows with the given primary keys from the result
	#[must_use]
	pub fn exclude_pks(mut self, pks: impl IntoIterator<Item = PrimaryKey>) -> Self {
		self.exclude.extend(pks);
		self
	}

	/// Requests row locks on the matched rows
	#[must_use]
	pub fn for_update(mut self, for_update: bool) -> Self {
		self.for_update = for_update;
		self
	}

	#[must_use]
	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("{")?;
		for (i, condition) in self.conditions.iter().enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			let path = condition.path.join("__");
			match &condition.lookup {
				Lookup::Exact(value) => write!(f, "{path}: {value}")?,
				Lookup::In(values) => write!(f, "{path}__in: {}", Value::Array(values.clone()))?,
				Lookup::IsNull(null) => write!(f, "{path}__isnull: {null}")?,
			}
		}
		f.write_str("}")
	}
}

/// Failures reported by a [`Persistence`] backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
	/// A protecting foreign key refused the delete
	#[error("cannot delete {}: referenced through a protected foreign key", .blocked.join(", "))]
	Protected {
		entity: String,
		/// Rows that could not be deleted
		blocked: Vec<String>,
		/// Rows holding the protecting references
		referenced_by: Vec<String>,
	},
	#[error("NOT NULL constraint failed: {entity}.{column}")]
	NotNull { entity: String, column: String },
	#[error("UNIQUE constraint failed: {entity}.{}", .fields.join(", "))]
	Unique { entity: String, fields: Vec<String> },
	#[error("FOREIGN KEY constraint failed: {entity}.{column} -> {target}")]
	ForeignKey {
		entity: String,
		column: String,
		target: String,
	},
	#[error("unknown entity `{0}`")]
	UnknownEntity(String),
	#[error("unknown column `{entity}.{column}`")]
	UnknownColumn { entity: String, column: String },
	#[error("{entity} row {pk} does not exist")]
	RowNotFound { entity: String, pk: String },
	#[error("transaction error: {0}")]
	Transaction(String),
	#[error("backend error: {0}")]
	Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage operations used by the nested writer
///
/// Implementations must be usable through `&self`; transactional state and
/// rows live behind interior mutability. `begin` may be called while a
/// transaction is already open, in which case it opens a nested savepoint.
pub trait Persistence: Send + Sync {
	fn begin(&self) -> StorageResult<()>;

	fn commit(&self) -> StorageResult<()>;

	fn rollback(&self) -> StorageResult<()>;

	/// Inserts a row; a missing integer or UUID primary key is generated
	fn create(&self, entity: &str, attrs: Attrs) -> StorageResult<Row>;

	/// Merges `attrs` into the stored row and returns the result
	fn update(&self, row: &Row, attrs: Attrs) -> StorageResult<Row>;

	/// Deletes a row, applying the cascade action of every reference to it
	fn delete(&self, row: &Row) -> StorageResult<()>;

	fn find_by_pk(&self, entity: &str, pk: &PrimaryKey, for_update: bool) -> StorageResult<Option<Row>>;

	fn find_by_filter(&self, entity: &str, filter: &Filter) -> StorageResult<Vec<Row>>;

	/// Points the foreign key `relation` of `row` at `target`, or nulls it
	fn set_foreign_key(&self, row: &Row, relation: &str, target: Option<&PrimaryKey>) -> StorageResult<Row> {
		let mut attrs = Attrs::new();
		attrs.insert(
			relation.to_string(),
			target.map_or(Value::Null, PrimaryKey::to_value),
		);
		self.update(row, attrs)
	}

	/// Links `source` and `target` through a join entity
	///
	/// Linking an already linked pair is a no-op.
	fn associate(&self, through: &ThroughMeta, source: &Row, target: &Row) -> StorageResult<()> {
		let existing = Filter::new()
			.exact(&through.source_column, source.pk.to_value())
			.exact(&through.target_column, target.pk.to_value())
			.limit(1);
		if self.find_by_filter(&through.entity, &existing)?.is_empty() {
			let mut attrs = Attrs::new();
			attrs.insert(through.source_column.clone(), source.pk.to_value());
			attrs.insert(through.target_column.clone(), target.pk.to_value());
			self.create(&through.entity, attrs)?;
		}
		Ok(())
	}

	/// Removes the join rows between `source` and each of `targets`
	///
	/// Returns the number of join rows removed.
	fn disassociate(
		&self,
		through: &ThroughMeta,
		source: &Row,
		targets: &[PrimaryKey],
	) -> StorageResult<usize> {
		if targets.is_empty() {
			return Ok(0);
		}
		let filter = Filter::new()
			.exact(&through.source_column, source.pk.to_value())
			.is_in(
				&through.target_column,
				targets.iter().map(PrimaryKey::to_value).collect(),
			);
		let links = self.find_by_filter(&through.entity, &filter)?;
		for link in &links {
			self.delete(link)?;
		}
		Ok(links.len())
	}
}
