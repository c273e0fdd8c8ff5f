//! Error types for nested writes
//!
//! Two layers live here:
//!
//! - [`ErrorTree`] is the payload-shaped structure returned to callers when a
//!   nested save fails validation. Leaves are lists of messages, to-one
//!   relations become nested maps and to-many relations become lists of maps
//!   aligned with the submitted items (`{}` marks an item that succeeded).
//! - [`NestedWriteError`] is the taxonomy raised by the engine itself.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Key used for errors that belong to a whole entity rather than one field
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

/// Validation errors shaped like the submitted payload
///
/// # Examples
///
/// ```
/// use reinhardt_writable_nested::ErrorTree;
/// use serde_json::json;
///
/// let tree = ErrorTree::field(
/// 	"parents",
/// 	ErrorTree::List(vec![
/// 		ErrorTree::empty(),
/// 		ErrorTree::field("raise_error", ErrorTree::message("should be False")),
/// 		ErrorTree::empty(),
/// 	]),
/// );
///
/// assert_eq!(
/// 	tree.to_json(),
/// 	json!({"parents": [{}, {"raise_error": ["should be False"]}, {}]})
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorTree {
	/// Leaf: messages for a single field
	Messages(Vec<String>),
	/// A single nested entity
	Map(IndexMap<String, ErrorTree>),
	/// Many nested entities, one slot per submitted item
	List(Vec<ErrorTree>),
}

impl ErrorTree {
	/// An empty map, the placeholder for an item that saved cleanly
	pub fn empty() -> Self {
		ErrorTree::Map(IndexMap::new())
	}

	/// A leaf holding one message
	pub fn message(message: impl Into<String>) -> Self {
		ErrorTree::Messages(vec![message.into()])
	}

	/// A map with a single entry
	pub fn field(name: impl Into<String>, tree: ErrorTree) -> Self {
		let mut map = IndexMap::new();
		map.insert(name.into(), tree);
		ErrorTree::Map(map)
	}

	/// `{"non_field_errors": [message]}`
	pub fn non_field(message: impl Into<String>) -> Self {
		Self::field(NON_FIELD_ERRORS, Self::message(message))
	}

	/// Returns true when the tree carries no message at any depth
	pub fn is_empty(&self) -> bool {
		match self {
			ErrorTree::Messages(messages) => messages.is_empty(),
			ErrorTree::Map(map) => map.values().all(ErrorTree::is_empty),
			ErrorTree::List(items) => items.iter().all(ErrorTree::is_empty),
		}
	}

	/// Looks up a child of a map node
	pub fn get(&self, key: &str) -> Option<&ErrorTree> {
		match self {
			ErrorTree::Map(map) => map.get(key),
			_ => None,
		}
	}

	/// Looks up a slot of a list node
	pub fn at(&self, index: usize) -> Option<&ErrorTree> {
		match self {
			ErrorTree::List(items) => items.get(index),
			_ => None,
		}
	}

	/// Messages of a leaf node
	pub fn messages(&self) -> Option<&[String]> {
		match self {
			ErrorTree::Messages(messages) => Some(messages),
			_ => None,
		}
	}

	/// Inserts `tree` under `name`, turning a non-map node into a map first.
	///
	/// Leaf messages already stored under the same key are extended rather
	/// than replaced.
	pub fn insert(&mut self, name: impl Into<String>, tree: ErrorTree) {
		if !matches!(self, ErrorTree::Map(_)) {
			*self = ErrorTree::empty();
		}
		if let ErrorTree::Map(map) = self {
			let name = name.into();
			if let (Some(ErrorTree::Messages(existing)), ErrorTree::Messages(more)) =
				(map.get(&name), &tree)
			{
				let merged = existing.iter().chain(more.iter()).cloned().collect();
				map.insert(name, ErrorTree::Messages(merged));
			} else {
				map.insert(name, tree);
			}
		}
	}

	/// Renders the tree as JSON
	pub fn to_json(&self) -> Value {
		match self {
			ErrorTree::Messages(messages) => {
				Value::Array(messages.iter().cloned().map(Value::String).collect())
			}
			ErrorTree::Map(map) => Value::Object(
				map.iter()
					.map(|(key, tree)| (key.clone(), tree.to_json()))
					.collect(),
			),
			ErrorTree::List(items) => Value::Array(items.iter().map(ErrorTree::to_json).collect()),
		}
	}
}

impl Default for ErrorTree {
	fn default() -> Self {
		Self::empty()
	}
}

impl fmt::Display for ErrorTree {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_json())
	}
}

/// A serializer does not agree with the relational metadata it targets.
///
/// Raised while building a [`WritePlan`](crate::WritePlan) or a
/// [`SchemaRegistry`](crate::SchemaRegistry); never at request time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("schema mismatch on `{entity}.{field}`: {reason}")]
pub struct SchemaMismatchError {
	pub entity: String,
	pub field: String,
	pub reason: String,
}

impl SchemaMismatchError {
	pub fn new(
		entity: impl Into<String>,
		field: impl Into<String>,
		reason: impl Into<String>,
	) -> Self {
		Self {
			entity: entity.into(),
			field: field.into(),
			reason: reason.into(),
		}
	}
}

/// Errors raised by a nested save
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NestedWriteError {
	/// Serializer and relational metadata disagree (configuration bug)
	#[error(transparent)]
	SchemaMismatch(#[from] SchemaMismatchError),
	/// One or more fragments failed validation or a translated constraint
	#[error("validation failed: {0}")]
	Validation(ErrorTree),
	/// Storage refused to delete rows still referenced elsewhere
	#[error("Cannot delete {} because protected relation exists", .instances.join(", "))]
	ProtectedDelete {
		entity: String,
		instances: Vec<String>,
	},
	/// Storage refused to null a non-nullable foreign key
	#[error(
		"Cannot unlink {} from `{field}`: the relation is not nullable",
		.instances.join(", ")
	)]
	NonNullableUnlink {
		entity: String,
		field: String,
		instances: Vec<String>,
	},
	/// Match criteria selected more than one existing row
	#[error("match criteria {criteria} selected {count} `{entity}` rows, expected at most one")]
	AmbiguousMatch {
		entity: String,
		criteria: String,
		count: usize,
	},
	/// Save kwargs for a relation were not an object
	#[error("Arguments to nested serializer's `save` must be objects: `{field}` got {found}")]
	SaveKwargsType { field: String, found: String },
	/// Backend failure that maps to nothing above
	#[error("persistence failure: {0}")]
	Persistence(String),
}

/// Result type for nested write operations
pub type NestedResult<T> = Result<T, NestedWriteError>;

impl NestedWriteError {
	/// Shorthand for a validation failure with a single non-field message
	pub fn non_field(message: impl Into<String>) -> Self {
		NestedWriteError::Validation(ErrorTree::non_field(message))
	}

	/// Configuration-class errors that indicate a setup bug, not bad input
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			NestedWriteError::SchemaMismatch(_)
				| NestedWriteError::AmbiguousMatch { .. }
				| NestedWriteError::SaveKwargsType { .. }
				| NestedWriteError::Persistence(_)
		)
	}

	/// User-facing errors rendered as an [`ErrorTree`]
	pub fn error_tree(&self) -> Option<ErrorTree> {
		match self {
			NestedWriteError::Validation(tree) => Some(tree.clone()),
			NestedWriteError::ProtectedDelete { .. } | NestedWriteError::NonNullableUnlink { .. } => {
				Some(ErrorTree::non_field(self.to_string()))
			}
			_ => None,
		}
	}
}

/// Human readable JSON type name used in validation messages
pub(crate) fn json_type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "str",
		Value::Array(_) => "list",
		Value::Object(_) => "dict",
	}
}
