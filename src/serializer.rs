//! Serializer definitions
//!
//! A [`NestedSerializer`] is the static description of how one level of a
//! payload maps onto an entity: an ordered list of [`FieldDescriptor`]s plus
//! the matching and write policy used when the serializer appears as a child
//! of another one. Nested fields hold their child serializer behind an `Arc`,
//! so a tree of serializers is built once and shared by every save.
//!
//! # Examples
//!
//! ```
//! use reinhardt_writable_nested::serializer::{FieldDescriptor, FieldType, NestedSerializer};
//! use std::sync::Arc;
//!
//! let avatar = Arc::new(
//! 	NestedSerializer::new("avatar")
//! 		.field(FieldDescriptor::new("pk").read_only(true))
//! 		.field(FieldDescriptor::new("image").field_type(FieldType::String { max_length: Some(100) })),
//! );
//!
//! let profile = NestedSerializer::new("profile")
//! 	.field(FieldDescriptor::new("pk").read_only(true))
//! 	.field(FieldDescriptor::nested_many("avatars", avatar));
//!
//! assert!(profile.field_named("avatars").unwrap().is_nested());
//! ```

use crate::backend::Attrs;
use crate::errors::ErrorTree;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Coercion applied to a local field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
	/// Accept any JSON value unchanged
	#[default]
	Any,
	String {
		max_length: Option<usize>,
	},
	Slug,
	Integer,
	Float,
	Boolean,
	Url,
	Uuid,
}

/// Per-field validation hook run after type coercion
#[derive(Clone)]
pub struct ValueCheck(Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>);

impl ValueCheck {
	pub fn new<F>(check: F) -> Self
	where
		F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
	{
		Self(Arc::new(check))
	}

	pub fn check(&self, value: &Value) -> Result<(), String> {
		(self.0)(value)
	}
}

impl fmt::Debug for ValueCheck {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("ValueCheck(..)")
	}
}

/// Object-level validation hook
///
/// Receives the validated local attributes of one level and may rewrite them,
/// e.g. to strip a field that has no column.
#[derive(Clone)]
pub struct ObjectValidator(Arc<dyn Fn(&mut Attrs) -> Result<(), ErrorTree> + Send + Sync>);

impl ObjectValidator {
	pub fn new<F>(validate: F) -> Self
	where
		F: Fn(&mut Attrs) -> Result<(), ErrorTree> + Send + Sync + 'static,
	{
		Self(Arc::new(validate))
	}

	pub fn validate(&self, attrs: &mut Attrs) -> Result<(), ErrorTree> {
		(self.0)(attrs)
	}
}

impl fmt::Debug for ObjectValidator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("ObjectValidator(..)")
	}
}

/// How a fragment without a primary key is matched to an existing row
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchCriteria {
	/// Only primary keys and locators identify rows
	#[default]
	PrimaryKey,
	/// The listed fields must all be equal
	Fields(Vec<String>),
	/// Every writable field must be equal
	AllFields,
}

/// What happens to a fragment once it has been matched (or not)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
	/// Update matched rows, create the rest
	#[default]
	UpdateOrCreate,
	/// Leave matched rows untouched, create the rest
	GetOrCreate,
	/// Only accept fragments that match an existing row
	GetOnly,
	/// Never match; always create
	CreateOnly,
}

/// Disposition of previously linked rows missing from a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
	/// Delete the rows
	Delete,
	/// Null the back-reference, keep the rows
	Unlink,
	/// Remove the join rows, keep the targets
	Disassociate,
	/// Remove the join rows, then delete the targets
	DisassociateAndDelete,
	/// Leave the rows linked
	Retain,
}

/// One child serializer chosen by the value of a discriminator field
#[derive(Debug, Clone)]
pub struct PolymorphicSerializer {
	pub resource_type_field: String,
	pub variants: IndexMap<String, Arc<NestedSerializer>>,
}

impl PolymorphicSerializer {
	pub fn new(resource_type_field: impl Into<String>) -> Self {
		Self {
			resource_type_field: resource_type_field.into(),
			variants: IndexMap::new(),
		}
	}

	#[must_use]
	pub fn variant(mut self, resource_type: impl Into<String>, serializer: Arc<NestedSerializer>) -> Self {
		self.variants.insert(resource_type.into(), serializer);
		self
	}

	/// Serializer for a fragment, `None` when the discriminator is missing or unknown
	pub fn resolve(&self, fragment: &Value) -> Option<&Arc<NestedSerializer>> {
		fragment
			.get(&self.resource_type_field)
			.and_then(Value::as_str)
			.and_then(|resource_type| self.variants.get(resource_type))
	}
}

/// Child of a nested field
#[derive(Debug, Clone)]
pub enum NestedChild {
	Single(Arc<NestedSerializer>),
	Polymorphic(Arc<PolymorphicSerializer>),
}

impl NestedChild {
	/// Entities the child may write to
	pub fn entities(&self) -> Vec<&str> {
		match self {
			NestedChild::Single(serializer) => vec![serializer.entity.as_str()],
			NestedChild::Polymorphic(poly) => {
				poly.variants.values().map(|s| s.entity.as_str()).collect()
			}
		}
	}
}

#[derive(Debug, Clone)]
pub struct NestedField {
	pub child: NestedChild,
	pub many: bool,
}

/// Maps one payload key onto an entity attribute or relation
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
	pub name: String,
	pub source: Option<String>,
	pub read_only: bool,
	pub write_only: bool,
	pub required: bool,
	pub allow_null: bool,
	pub allow_blank: bool,
	pub field_type: FieldType,
	pub unique: bool,
	pub unique_message: Option<String>,
	pub validators: Vec<ValueCheck>,
	pub nested: Option<NestedField>,
	/// Reverse relations are resolved in ascending priority, ties in declaration order
	pub priority: i32,
	pub delete_policy: Option<DeletePolicy>,
}

impl FieldDescriptor {
	/// A required local field accepting any value
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			source: None,
			read_only: false,
			write_only: false,
			required: true,
			allow_null: false,
			allow_blank: false,
			field_type: FieldType::Any,
			unique: false,
			unique_message: None,
			validators: Vec::new(),
			nested: None,
			priority: 0,
			delete_policy: None,
		}
	}

	/// A to-one nested field
	pub fn nested(name: impl Into<String>, child: Arc<NestedSerializer>) -> Self {
		Self::with_child(name, NestedChild::Single(child), false)
	}

	/// A to-many nested field
	pub fn nested_many(name: impl Into<String>, child: Arc<NestedSerializer>) -> Self {
		Self::with_child(name, NestedChild::Single(child), true)
	}

	/// A nested field whose serializer depends on each fragment's resource type
	pub fn polymorphic(name: impl Into<String>, child: Arc<PolymorphicSerializer>, many: bool) -> Self {
		Self::with_child(name, NestedChild::Polymorphic(child), many)
	}

	fn with_child(name: impl Into<String>, child: NestedChild, many: bool) -> Self {
		let mut field = Self::new(name);
		field.nested = Some(NestedField { child, many });
		field
	}

	/// Attribute or relation name on the entity
	pub fn source(&self) -> &str {
		self.source.as_deref().unwrap_or(&self.name)
	}

	pub fn is_nested(&self) -> bool {
		self.nested.is_some()
	}

	pub fn is_many(&self) -> bool {
		self.nested.as_ref().is_some_and(|n| n.many)
	}

	#[must_use]
	pub fn with_source(mut self, source: impl Into<String>) -> Self {
		self.source = Some(source.into());
		self
	}

	#[must_use]
	pub fn read_only(mut self, read_only: bool) -> Self {
		self.read_only = read_only;
		self
	}

	#[must_use]
	pub fn write_only(mut self, write_only: bool) -> Self {
		self.write_only = write_only;
		self
	}

	/// Marks the field as not required
	#[must_use]
	pub fn optional(mut self) -> Self {
		self.required = false;
		self
	}

	#[must_use]
	pub fn allow_null(mut self, allow_null: bool) -> Self {
		self.allow_null = allow_null;
		self
	}

	#[must_use]
	pub fn allow_blank(mut self, allow_blank: bool) -> Self {
		self.allow_blank = allow_blank;
		self
	}

	#[must_use]
	pub fn field_type(mut self, field_type: FieldType) -> Self {
		self.field_type = field_type;
		self
	}

	/// Checks uniqueness against storage when the row is saved
	#[must_use]
	pub fn unique(mut self, unique: bool) -> Self {
		self.unique = unique;
		self
	}

	#[must_use]
	pub fn unique_message(mut self, message: impl Into<String>) -> Self {
		self.unique = true;
		self.unique_message = Some(message.into());
		self
	}

	#[must_use]
	pub fn validator(mut self, check: ValueCheck) -> Self {
		self.validators.push(check);
		self
	}

	#[must_use]
	pub fn priority(mut self, priority: i32) -> Self {
		self.priority = priority;
		self
	}

	#[must_use]
	pub fn delete_policy(mut self, policy: DeletePolicy) -> Self {
		self.delete_policy = Some(policy);
		self
	}
}

/// Serializer for one entity level of a nested payload
#[derive(Debug, Clone)]
pub struct NestedSerializer {
	pub entity: String,
	pub fields: Vec<FieldDescriptor>,
	pub match_criteria: MatchCriteria,
	pub write_policy: WritePolicy,
	/// Overrides the engine-wide lock-on-match setting
	pub lock_on_match: Option<bool>,
	pub validator: Option<ObjectValidator>,
}

impl NestedSerializer {
	pub fn new(entity: impl Into<String>) -> Self {
		Self {
			entity: entity.into(),
			fields: Vec::new(),
			match_criteria: MatchCriteria::default(),
			write_policy: WritePolicy::default(),
			lock_on_match: None,
			validator: None,
		}
	}

	#[must_use]
	pub fn field(mut self, field: FieldDescriptor) -> Self {
		self.fields.push(field);
		self
	}

	/// Match fragments on the given fields
	#[must_use]
	pub fn match_on<I, S>(mut self, fields: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.match_criteria = MatchCriteria::Fields(fields.into_iter().map(Into::into).collect());
		self
	}

	#[must_use]
	pub fn match_criteria(mut self, criteria: MatchCriteria) -> Self {
		self.match_criteria = criteria;
		self
	}

	#[must_use]
	pub fn write_policy(mut self, policy: WritePolicy) -> Self {
		self.write_policy = policy;
		self
	}

	#[must_use]
	pub fn lock_on_match(mut self, lock: bool) -> Self {
		self.lock_on_match = Some(lock);
		self
	}

	#[must_use]
	pub fn validate_with(mut self, validator: ObjectValidator) -> Self {
		self.validator = Some(validator);
		self
	}

	pub fn field_named(&self, name: &str) -> Option<&FieldDescriptor> {
		self.fields.iter().find(|f| f.name == name)
	}

	/// Fields that take part in writes
	pub fn writable_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
		self.fields.iter().filter(|f| !f.read_only)
	}

	/// True unless the serializer asks for criteria matching or a non-default policy
	pub fn has_default_matching(&self) -> bool {
		self.match_criteria == MatchCriteria::PrimaryKey
			&& self.write_policy == WritePolicy::UpdateOrCreate
	}
}
