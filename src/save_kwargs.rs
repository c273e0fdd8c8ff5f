//! Caller supplied save overrides
//!
//! `SaveKwargs` carries extra values for one save call. At each level, keys
//! naming a nested relation field hold the overrides for that relation's own
//! save (applied to every item of a to-many relation); every other key
//! overrides an attribute of the row being saved.
//!
//! ```
//! use reinhardt_writable_nested::SaveKwargs;
//! use serde_json::json;
//!
//! let kwargs = SaveKwargs::from_value(json!({
//! 	"profile": {"access_key": {"key": "key2"}, "sites": {"url": "http://test.com"}}
//! }))
//! .unwrap();
//!
//! let profile = kwargs.nested("profile").unwrap();
//! let access_key = profile.nested("access_key").unwrap();
//! assert_eq!(access_key.get("key"), Some(&json!("key2")));
//! ```

use crate::backend::Attrs;
use crate::classifier::{FieldRole, WritePlan};
use crate::errors::{NestedResult, NestedWriteError, json_type_name};
use serde_json::Value;

/// Immutable per-save overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveKwargs {
	values: Attrs,
}

impl SaveKwargs {
	pub fn new() -> Self {
		Self::default()
	}

	/// Builds kwargs from a JSON object
	pub fn from_value(value: Value) -> NestedResult<Self> {
		match value {
			Value::Object(values) => Ok(Self { values }),
			Value::Null => Ok(Self::default()),
			other => Err(NestedWriteError::SaveKwargsType {
				field: String::new(),
				found: json_type_name(&other).to_string(),
			}),
		}
	}

	/// Returns a copy with `key` set to `value`
	#[must_use]
	pub fn with(&self, key: impl Into<String>, value: Value) -> Self {
		let mut values = self.values.clone();
		values.insert(key.into(), value);
		Self { values }
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.values.get(key)
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	/// Overrides for the nested save of `field`
	///
	/// Fails with [`NestedWriteError::SaveKwargsType`] when the value under
	/// `field` is not an object.
	pub fn nested(&self, field: &str) -> NestedResult<SaveKwargs> {
		match self.values.get(field) {
			None | Some(Value::Null) => Ok(Self::default()),
			Some(Value::Object(values)) => Ok(Self {
				values: values.clone(),
			}),
			Some(other) => Err(NestedWriteError::SaveKwargsType {
				field: field.to_string(),
				found: json_type_name(other).to_string(),
			}),
		}
	}

	/// Attribute overrides for a row written through `plan`
	///
	/// Keys naming a relation field of the plan are skipped; keys naming a
	/// local field are mapped onto that field's source.
	pub fn attributes(&self, plan: &WritePlan) -> Attrs {
		self.values
			.iter()
			.filter_map(|(key, value)| match plan.field(key) {
				Some(field) => match field.role {
					FieldRole::Direct(_) | FieldRole::Reverse(_) => None,
					_ => Some((field.descriptor.source().to_string(), value.clone())),
				},
				None => Some((key.clone(), value.clone())),
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;
	use serde_json::json;

	#[rstest]
	fn test_nested_rejects_non_objects() {
		let kwargs = SaveKwargs::from_value(json!({"profile": "oops"})).unwrap();
		assert_eq!(
			kwargs.nested("profile"),
			Err(NestedWriteError::SaveKwargsType {
				field: "profile".into(),
				found: "str".into(),
			})
		);
		assert!(kwargs.nested("avatars").unwrap().is_empty());
	}

	#[rstest]
	fn test_with_leaves_original_untouched() {
		let base = SaveKwargs::new();
		let extended = base.with("key", json!("value"));
		assert!(base.is_empty());
		assert_eq!(extended.get("key"), Some(&json!("value")));
	}

	#[rstest]
	fn test_root_must_be_object() {
		assert!(SaveKwargs::from_value(json!([1, 2])).is_err());
		assert!(SaveKwargs::from_value(Value::Null).unwrap().is_empty());
	}
}
