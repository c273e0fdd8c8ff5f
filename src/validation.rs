//! Field validation and coercion
//!
//! The writer calls a [`FieldValidator`] once for every local field present in
//! a fragment. Presence rules (required fields, partial updates) are applied by
//! the writer itself; the validator only sees values that were submitted.

use crate::errors::json_type_name;
use crate::serializer::{FieldDescriptor, FieldType};
use serde_json::Value;

pub const REQUIRED: &str = "This field is required.";
pub const NOT_NULL: &str = "This field may not be null.";
pub const NOT_BLANK: &str = "This field may not be blank.";
pub const DB_NOT_NULL: &str = "This field cannot be null.";

// Exclusive upper bound: `i64::MAX as f64` is 2^63
const I64_MIN_F64: f64 = i64::MIN as f64;
const I64_MAX_F64: f64 = i64::MAX as f64;

/// Validates and coerces one submitted value
pub trait FieldValidator: Send + Sync {
	fn validate(&self, descriptor: &FieldDescriptor, raw: &Value) -> Result<Value, Vec<String>>;
}

/// Validator implementing the built-in [`FieldType`] coercions
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFieldValidator;

impl DefaultFieldValidator {
	pub fn new() -> Self {
		Self
	}

	fn coerce(&self, descriptor: &FieldDescriptor, raw: &Value) -> Result<Value, String> {
		match descriptor.field_type {
			FieldType::Any => Ok(raw.clone()),
			FieldType::String { max_length } => {
				let text = as_text(raw).ok_or_else(|| "Not a valid string.".to_string())?;
				check_blank(descriptor, &text)?;
				if let Some(max) = max_length
					&& text.chars().count() > max
				{
					return Err(format!("Ensure this field has no more than {max} characters."));
				}
				Ok(Value::String(text))
			}
			FieldType::Slug => {
				let text = as_text(raw).ok_or_else(|| "Not a valid string.".to_string())?;
				check_blank(descriptor, &text)?;
				let valid = text
					.chars()
					.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
				if !valid {
					return Err(
						"Enter a valid \"slug\" consisting of letters, numbers, underscores or hyphens."
							.to_string(),
					);
				}
				Ok(Value::String(text))
			}
			FieldType::Integer => match raw {
				Value::Number(n) if n.is_i64() => Ok(raw.clone()),
				Value::Number(n) => n
					.as_f64()
					.filter(|f| f.fract() == 0.0 && (I64_MIN_F64..I64_MAX_F64).contains(f))
					.map(|f| Value::from(f as i64))
					.ok_or_else(|| "A valid integer is required.".to_string()),
				Value::String(s) => s
					.trim()
					.parse::<i64>()
					.map(Value::from)
					.map_err(|_| "A valid integer is required.".to_string()),
				_ => Err("A valid integer is required.".to_string()),
			},
			FieldType::Float => match raw {
				Value::Number(_) => Ok(raw.clone()),
				Value::String(s) => s
					.trim()
					.parse::<f64>()
					.ok()
					.and_then(serde_json::Number::from_f64)
					.map(Value::Number)
					.ok_or_else(|| "A valid number is required.".to_string()),
				_ => Err("A valid number is required.".to_string()),
			},
			FieldType::Boolean => match raw {
				Value::Bool(_) => Ok(raw.clone()),
				Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
				Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
				Value::String(s) => match s.to_ascii_lowercase().as_str() {
					"true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
					"false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
					_ => Err("Must be a valid boolean.".to_string()),
				},
				_ => Err("Must be a valid boolean.".to_string()),
			},
			FieldType::Url => {
				let text = as_text(raw).ok_or_else(|| "Enter a valid URL.".to_string())?;
				check_blank(descriptor, &text)?;
				match url::Url::parse(&text) {
					Ok(parsed) if parsed.has_host() => Ok(Value::String(text)),
					_ => Err("Enter a valid URL.".to_string()),
				}
			}
			FieldType::Uuid => raw
				.as_str()
				.and_then(|s| uuid::Uuid::parse_str(s).ok())
				.map(|id| Value::String(id.to_string()))
				.ok_or_else(|| "Must be a valid UUID.".to_string()),
		}
	}
}

impl FieldValidator for DefaultFieldValidator {
	fn validate(&self, descriptor: &FieldDescriptor, raw: &Value) -> Result<Value, Vec<String>> {
		if raw.is_null() {
			return if descriptor.allow_null {
				Ok(Value::Null)
			} else {
				Err(vec![NOT_NULL.to_string()])
			};
		}
		let value = self.coerce(descriptor, raw).map_err(|message| vec![message])?;
		let errors: Vec<String> = descriptor
			.validators
			.iter()
			.filter_map(|check| check.check(&value).err())
			.collect();
		if errors.is_empty() {
			Ok(value)
		} else {
			Err(errors)
		}
	}
}

fn as_text(raw: &Value) -> Option<String> {
	match raw {
		Value::String(s) => Some(s.trim().to_string()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

fn check_blank(descriptor: &FieldDescriptor, text: &str) -> Result<(), String> {
	if text.is_empty() && !descriptor.allow_blank {
		Err(NOT_BLANK.to_string())
	} else {
		Ok(())
	}
}

/// Message for a to-many nested field that did not receive a list
pub fn expected_list(value: &Value) -> String {
	format!(
		"Expected a list of items but got type \"{}\".",
		json_type_name(value)
	)
}

/// Message for a nested fragment that is not an object
pub fn expected_object(value: &Value) -> String {
	format!(
		"Invalid data. Expected a dictionary, but got {}.",
		json_type_name(value)
	)
}
