//! Field classification
//!
//! Every writable field of a serializer is classified once against the
//! relational metadata of its entity:
//!
//! - [`FieldRole::Local`]: a column written with the owner's own attributes,
//!   including foreign keys submitted as plain primary keys.
//! - [`FieldRole::Direct`]: a nested relation whose foreign key lives on the
//!   owner; the related row is saved first.
//! - [`FieldRole::Reverse`]: a nested relation whose foreign key lives on the
//!   other side (or a many-to-many); saved after the owner.
//!
//! [`WritePlan::build`] runs the classification over a whole serializer tree
//! and keeps the result next to each field descriptor.

use crate::errors::SchemaMismatchError;
use crate::schema::{EntitySchema, RelationMeta, RelationalMetadata};
use crate::serializer::{FieldDescriptor, MatchCriteria, NestedChild, NestedSerializer};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// Classification of one serializer field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRole {
	ReadOnly,
	Local,
	Direct(RelationMeta),
	Reverse(RelationMeta),
}

impl FieldRole {
	pub fn relation(&self) -> Option<&RelationMeta> {
		match self {
			FieldRole::Direct(meta) | FieldRole::Reverse(meta) => Some(meta),
			_ => None,
		}
	}
}

/// Looks up a relation by source, accessor or `_set`-stripped source
fn find_relation<'a>(schema: &'a EntitySchema, source: &str) -> Option<&'a RelationMeta> {
	schema
		.relation_named(source)
		.or_else(|| schema.relation_by_accessor(source))
		.or_else(|| {
			source
				.strip_suffix("_set")
				.and_then(|stripped| schema.relation_named(stripped))
		})
}

fn classify_field(
	schema: &EntitySchema,
	field: &FieldDescriptor,
) -> Result<FieldRole, SchemaMismatchError> {
	if field.read_only {
		return Ok(FieldRole::ReadOnly);
	}
	let relation = find_relation(schema, field.source());
	let Some(nested) = &field.nested else {
		return Ok(FieldRole::Local);
	};
	let Some(relation) = relation else {
		return Err(SchemaMismatchError::new(
			&schema.name,
			&field.name,
			format!("nested field source `{}` is not a relation", field.source()),
		));
	};
	if let Some(other) = nested
		.child
		.entities()
		.into_iter()
		.find(|entity| *entity != relation.target)
	{
		return Err(SchemaMismatchError::new(
			&schema.name,
			&field.name,
			format!(
				"nested serializer writes `{other}` but the relation targets `{}`",
				relation.target
			),
		));
	}
	if nested.many != relation.kind.is_to_many() {
		return Err(SchemaMismatchError::new(
			&schema.name,
			&field.name,
			if nested.many {
				"many=true on a to-one relation"
			} else {
				"many=false on a to-many relation"
			},
		));
	}
	if relation.kind.is_forward_owner() {
		Ok(FieldRole::Direct(relation.clone()))
	} else {
		Ok(FieldRole::Reverse(relation.clone()))
	}
}

/// Classifies the fields of `serializer` against `schema`
pub fn classify(
	schema: &EntitySchema,
	fields: &[FieldDescriptor],
) -> Result<IndexMap<String, FieldRole>, SchemaMismatchError> {
	fields
		.iter()
		.map(|field| Ok((field.name.clone(), classify_field(schema, field)?)))
		.collect()
}

/// Child plans of a nested field
#[derive(Debug, Clone)]
pub enum ChildPlan {
	Single(Arc<WritePlan>),
	Polymorphic {
		resource_type_field: String,
		variants: IndexMap<String, Arc<WritePlan>>,
	},
}

impl ChildPlan {
	/// Plan for one fragment
	pub fn resolve(&self, fragment: &Value) -> Option<&Arc<WritePlan>> {
		match self {
			ChildPlan::Single(plan) => Some(plan),
			ChildPlan::Polymorphic {
				resource_type_field,
				variants,
			} => fragment
				.get(resource_type_field)
				.and_then(Value::as_str)
				.and_then(|resource_type| variants.get(resource_type)),
		}
	}

	/// Every plan this child may use
	pub fn plans(&self) -> Vec<&Arc<WritePlan>> {
		match self {
			ChildPlan::Single(plan) => vec![plan],
			ChildPlan::Polymorphic { variants, .. } => variants.values().collect(),
		}
	}
}

/// A field descriptor with its classification
#[derive(Debug, Clone)]
pub struct PlannedField {
	pub descriptor: FieldDescriptor,
	pub role: FieldRole,
	pub child: Option<ChildPlan>,
}

impl PlannedField {
	pub fn name(&self) -> &str {
		&self.descriptor.name
	}
}

/// A classified serializer tree, ready to drive nested saves
#[derive(Debug, Clone)]
pub struct WritePlan {
	pub serializer: Arc<NestedSerializer>,
	pub schema: EntitySchema,
	pub fields: Vec<PlannedField>,
}

impl WritePlan {
	/// Classifies `serializer` and every nested serializer below it
	pub fn build(
		serializer: Arc<NestedSerializer>,
		metadata: &dyn RelationalMetadata,
	) -> Result<Arc<WritePlan>, SchemaMismatchError> {
		let schema = metadata.entity(&serializer.entity).ok_or_else(|| {
			SchemaMismatchError::new(&serializer.entity, "*", "unknown entity")
		})?;

		let mut fields = Vec::with_capacity(serializer.fields.len());
		for descriptor in &serializer.fields {
			let role = classify_field(schema, descriptor)?;
			let child = match (&role, &descriptor.nested) {
				(FieldRole::Direct(_) | FieldRole::Reverse(_), Some(nested)) => Some(match &nested.child {
					NestedChild::Single(child) => {
						ChildPlan::Single(WritePlan::build(Arc::clone(child), metadata)?)
					}
					NestedChild::Polymorphic(poly) => {
						let mut variants = IndexMap::new();
						for (resource_type, child) in &poly.variants {
							variants.insert(
								resource_type.clone(),
								WritePlan::build(Arc::clone(child), metadata)?,
							);
						}
						ChildPlan::Polymorphic {
							resource_type_field: poly.resource_type_field.clone(),
							variants,
						}
					}
				}),
				_ => None,
			};
			fields.push(PlannedField {
				descriptor: descriptor.clone(),
				role,
				child,
			});
		}

		if let MatchCriteria::Fields(names) = &serializer.match_criteria
			&& let Some(missing) = names
				.iter()
				.find(|name| !fields.iter().any(|f| f.name() == name.as_str() && f.role != FieldRole::ReadOnly))
		{
			return Err(SchemaMismatchError::new(
				&serializer.entity,
				missing,
				"match criteria name a field the serializer cannot write",
			));
		}

		tracing::trace!(entity = %serializer.entity, fields = fields.len(), "write plan built");
		Ok(Arc::new(WritePlan {
			schema: schema.clone(),
			serializer,
			fields,
		}))
	}

	pub fn entity(&self) -> &str {
		&self.schema.name
	}

	pub fn field(&self, name: &str) -> Option<&PlannedField> {
		self.fields.iter().find(|f| f.name() == name)
	}

	/// Classification of every field, in declaration order
	pub fn field_roles(&self) -> IndexMap<String, FieldRole> {
		self.fields
			.iter()
			.map(|f| (f.descriptor.name.clone(), f.role.clone()))
			.collect()
	}

	pub fn local_fields(&self) -> impl Iterator<Item = &PlannedField> {
		self.fields.iter().filter(|f| f.role == FieldRole::Local)
	}

	pub fn direct_fields(&self) -> impl Iterator<Item = &PlannedField> {
		self.fields
			.iter()
			.filter(|f| matches!(f.role, FieldRole::Direct(_)))
	}

	/// Reverse relation fields in resolution order
	pub fn reverse_fields(&self) -> Vec<&PlannedField> {
		let mut reverse: Vec<&PlannedField> = self
			.fields
			.iter()
			.filter(|f| matches!(f.role, FieldRole::Reverse(_)))
			.collect();
		reverse.sort_by_key(|f| f.descriptor.priority);
		reverse
	}
}
