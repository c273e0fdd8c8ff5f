//! Engine settings
//!
//! Settings can be built in code or loaded from a TOML or JSON document.
//! Every key is optional; missing keys keep their defaults.
//!
//! ```toml
//! max_depth = 5
//! locator_field = "href"
//! many_to_many_policy = "disassociate_and_delete"
//! ```

use crate::schema::RelationKind;
use crate::serializer::DeletePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings shared by every save of a [`NestedWriter`](crate::NestedWriter)
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NestedWriteSettings {
	/// Maximum nesting depth below the root
	pub max_depth: usize,
	/// Fragment key holding a locator string
	pub locator_field: String,
	/// Lock rows selected by the matcher
	pub lock_on_match: bool,
	/// Fill the currently linked row's key into a reverse one-to-one fragment without one
	pub reuse_linked_singleton: bool,
	/// Default disposition for reverse foreign keys and reverse one-to-one relations
	pub reverse_fk_policy: DeletePolicy,
	/// Default disposition for many-to-many relations
	pub many_to_many_policy: DeletePolicy,
	/// Default disposition for generic relations
	pub generic_policy: DeletePolicy,
}

impl Default for NestedWriteSettings {
	fn default() -> Self {
		Self {
			max_depth: 10,
			locator_field: "url".to_string(),
			lock_on_match: false,
			reuse_linked_singleton: true,
			reverse_fk_policy: DeletePolicy::Delete,
			many_to_many_policy: DeletePolicy::Disassociate,
			generic_policy: DeletePolicy::Delete,
		}
	}
}

impl NestedWriteSettings {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_max_depth(mut self, max_depth: usize) -> Self {
		self.max_depth = max_depth;
		self
	}

	#[must_use]
	pub fn with_locator_field(mut self, field: impl Into<String>) -> Self {
		self.locator_field = field.into();
		self
	}

	#[must_use]
	pub fn with_lock_on_match(mut self, lock: bool) -> Self {
		self.lock_on_match = lock;
		self
	}

	#[must_use]
	pub fn with_reuse_linked_singleton(mut self, reuse: bool) -> Self {
		self.reuse_linked_singleton = reuse;
		self
	}

	#[must_use]
	pub fn with_many_to_many_policy(mut self, policy: DeletePolicy) -> Self {
		self.many_to_many_policy = policy;
		self
	}

	#[must_use]
	pub fn with_reverse_fk_policy(mut self, policy: DeletePolicy) -> Self {
		self.reverse_fk_policy = policy;
		self
	}

	#[must_use]
	pub fn with_generic_policy(mut self, policy: DeletePolicy) -> Self {
		self.generic_policy = policy;
		self
	}

	/// Default disposition for a relation of `kind`
	pub fn default_policy(&self, kind: RelationKind) -> DeletePolicy {
		match kind {
			RelationKind::ManyToManyForward | RelationKind::ManyToManyReverse => {
				self.many_to_many_policy
			}
			RelationKind::Generic => self.generic_policy,
			_ => self.reverse_fk_policy,
		}
	}

	pub fn from_toml_str(contents: &str) -> Result<Self, SettingsError> {
		toml::from_str(contents).map_err(|e| SettingsError::ParseError(format!("TOML parse error: {}", e)))
	}

	pub fn from_json_str(contents: &str) -> Result<Self, SettingsError> {
		serde_json::from_str(contents)
			.map_err(|e| SettingsError::ParseError(format!("JSON parse error: {}", e)))
	}

	/// Loads settings from a `.toml` or `.json` file
	pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
		let path = path.into();
		let contents = std::fs::read_to_string(&path).map_err(|e| {
			SettingsError::FileError(format!("Failed to read {}: {}", path.display(), e))
		})?;
		match path.extension().and_then(|s| s.to_str()) {
			Some("toml") => Self::from_toml_str(&contents),
			Some("json") => Self::from_json_str(&contents),
			_ => Err(SettingsError::UnsupportedFormat(
				"Supported formats: .toml, .json".to_string(),
			)),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
	#[error("File error: {0}")]
	FileError(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Unsupported format: {0}")]
	UnsupportedFormat(String),
}
