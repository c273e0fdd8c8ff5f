//! Entity schemas and relational metadata
//!
//! An [`EntitySchema`] describes one entity type: its primary key, its scalar
//! columns and the relations it declares. Only the owning side of a relation
//! is declared by hand (foreign keys, one-to-one fields, many-to-many fields
//! and generic relations); [`SchemaRegistryBuilder::build`] synthesizes the
//! reverse side of each of them, auto-creates the join entity of every
//! many-to-many relation without a custom through entity and rejects
//! declarations that do not line up.
//!
//! # Example
//!
//! ```
//! use reinhardt_writable_nested::schema::{
//! 	EntitySchema, RelationDecl, RelationKind, RelationalMetadata, SchemaRegistry,
//! };
//!
//! let registry = SchemaRegistry::builder()
//! 	.entity(EntitySchema::new("profile"))
//! 	.entity(
//! 		EntitySchema::new("avatar")
//! 			.scalar("image")
//! 			.relation(RelationDecl::foreign_key("profile", "profile").related_name("avatars")),
//! 	)
//! 	.build()
//! 	.unwrap();
//!
//! let reverse = registry.get_relation("profile", "avatars").unwrap();
//! assert_eq!(reverse.kind, RelationKind::OneToManyReverse);
//! assert_eq!(reverse.remote_name.as_deref(), Some("profile"));
//! ```

use crate::errors::SchemaMismatchError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Storage type of an entity's primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKeyKind {
	/// Auto-incrementing integer
	#[default]
	Integer,
	/// Random UUID generated on insert
	Uuid,
	/// Caller supplied slug
	Slug,
}

/// Primary key attribute of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyField {
	pub attname: String,
	pub kind: PrimaryKeyKind,
}

impl Default for PrimaryKeyField {
	fn default() -> Self {
		Self {
			attname: "id".to_string(),
			kind: PrimaryKeyKind::Integer,
		}
	}
}

/// A plain (non-relational) column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarField {
	pub name: String,
	pub null: bool,
	pub unique: bool,
}

impl ScalarField {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			null: false,
			unique: false,
		}
	}

	#[must_use]
	pub fn null(mut self, null: bool) -> Self {
		self.null = null;
		self
	}

	#[must_use]
	pub fn unique(mut self, unique: bool) -> Self {
		self.unique = unique;
		self
	}
}

/// Action to take on referencing rows when the referenced row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CascadeAction {
	/// Do nothing (default behavior, may leave dangling references)
	#[default]
	NoAction,
	/// Refuse the deletion while referencing rows exist
	Restrict,
	/// Set the foreign key to NULL
	SetNull,
	/// Delete the referencing rows as well
	Cascade,
}

/// Shape of a relation as seen from the entity that carries the metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
	OneToOneForward,
	OneToOneReverse,
	ManyToOneForward,
	OneToManyReverse,
	ManyToManyForward,
	ManyToManyReverse,
	/// Polymorphic reverse relation keyed by (content type, object id)
	Generic,
}

impl RelationKind {
	/// True when this entity holds the foreign key column
	pub fn is_forward_owner(self) -> bool {
		matches!(
			self,
			RelationKind::OneToOneForward | RelationKind::ManyToOneForward
		)
	}

	/// True when the relation can hold more than one related row
	pub fn is_to_many(self) -> bool {
		matches!(
			self,
			RelationKind::OneToManyReverse
				| RelationKind::ManyToManyForward
				| RelationKind::ManyToManyReverse
				| RelationKind::Generic
		)
	}

	pub fn is_many_to_many(self) -> bool {
		matches!(
			self,
			RelationKind::ManyToManyForward | RelationKind::ManyToManyReverse
		)
	}

	pub fn is_one_to_one(self) -> bool {
		matches!(
			self,
			RelationKind::OneToOneForward | RelationKind::OneToOneReverse
		)
	}
}

/// Join entity of a many-to-many relation
///
/// Columns are oriented from the entity carrying the [`RelationMeta`]:
/// `source_column` points back at it, `target_column` at the related entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughMeta {
	pub entity: String,
	pub source_column: String,
	pub target_column: String,
	pub auto_created: bool,
}

impl ThroughMeta {
	fn reversed(&self) -> Self {
		Self {
			entity: self.entity.clone(),
			source_column: self.target_column.clone(),
			target_column: self.source_column.clone(),
			auto_created: self.auto_created,
		}
	}
}

/// Two-column back-reference of a generic relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericLink {
	pub content_type_field: String,
	pub object_id_field: String,
}

/// Relation metadata as seen from `entity`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationMeta {
	/// Query name of the relation on `entity` (the FK attribute for forward relations)
	pub name: String,
	pub kind: RelationKind,
	/// Entity carrying this metadata
	pub entity: String,
	/// Entity on the other side
	pub target: String,
	/// Whether the foreign key column may be NULL
	pub nullable: bool,
	pub on_delete: CascadeAction,
	/// Name of the opposite relation on `target`
	pub remote_name: Option<String>,
	/// Alternative attribute name, e.g. the default `message_set` accessor
	pub accessor: Option<String>,
	pub through: Option<ThroughMeta>,
	pub generic: Option<GenericLink>,
}

impl RelationMeta {
	/// Column on the related entity that points back at `entity`
	pub fn back_reference(&self) -> Option<&str> {
		match self.kind {
			RelationKind::OneToManyReverse | RelationKind::OneToOneReverse => {
				self.remote_name.as_deref()
			}
			_ => None,
		}
	}
}

/// Hand-written declaration of the owning side of a relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDecl {
	name: String,
	kind: RelationKind,
	target: String,
	related_name: Option<String>,
	null: bool,
	on_delete: CascadeAction,
	through: Option<(String, String, String)>,
	generic: Option<GenericLink>,
}

/// `related_name` value that suppresses the reverse relation
pub const NO_REVERSE: &str = "+";

impl RelationDecl {
	fn new(name: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			kind,
			target: target.into(),
			related_name: None,
			null: false,
			on_delete: CascadeAction::Cascade,
			through: None,
			generic: None,
		}
	}

	/// Many-to-one foreign key stored on the declaring entity
	pub fn foreign_key(name: impl Into<String>, target: impl Into<String>) -> Self {
		Self::new(name, RelationKind::ManyToOneForward, target)
	}

	/// Unique foreign key stored on the declaring entity
	pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
		Self::new(name, RelationKind::OneToOneForward, target)
	}

	/// Many-to-many relation through a join entity
	pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
		Self::new(name, RelationKind::ManyToManyForward, target)
	}

	/// Generic relation: rows of `target` point back through a
	/// (content type, object id) column pair
	pub fn generic(
		name: impl Into<String>,
		target: impl Into<String>,
		content_type_field: impl Into<String>,
		object_id_field: impl Into<String>,
	) -> Self {
		let mut decl = Self::new(name, RelationKind::Generic, target);
		decl.generic = Some(GenericLink {
			content_type_field: content_type_field.into(),
			object_id_field: object_id_field.into(),
		});
		decl
	}

	/// Name of the reverse relation on the target; [`NO_REVERSE`] disables it
	#[must_use]
	pub fn related_name(mut self, related_name: impl Into<String>) -> Self {
		self.related_name = Some(related_name.into());
		self
	}

	#[must_use]
	pub fn null(mut self, null: bool) -> Self {
		self.null = null;
		self
	}

	#[must_use]
	pub fn on_delete(mut self, action: CascadeAction) -> Self {
		self.on_delete = action;
		self
	}

	/// Custom join entity for a many-to-many relation
	#[must_use]
	pub fn through(
		mut self,
		entity: impl Into<String>,
		source_column: impl Into<String>,
		target_column: impl Into<String>,
	) -> Self {
		self.through = Some((entity.into(), source_column.into(), target_column.into()));
		self
	}
}

/// Static description of one entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
	pub name: String,
	pub pk: PrimaryKeyField,
	pub fields: Vec<ScalarField>,
	pub relations: Vec<RelationMeta>,
	decls: Vec<RelationDecl>,
}

impl EntitySchema {
	/// Entity with an auto-incrementing integer `id`
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			pk: PrimaryKeyField::default(),
			fields: Vec::new(),
			relations: Vec::new(),
			decls: Vec::new(),
		}
	}

	#[must_use]
	pub fn primary_key(mut self, attname: impl Into<String>, kind: PrimaryKeyKind) -> Self {
		self.pk = PrimaryKeyField {
			attname: attname.into(),
			kind,
		};
		self
	}

	/// Adds a non-nullable, non-unique scalar column
	#[must_use]
	pub fn scalar(self, name: impl Into<String>) -> Self {
		self.field(ScalarField::new(name))
	}

	#[must_use]
	pub fn field(mut self, field: ScalarField) -> Self {
		self.fields.push(field);
		self
	}

	#[must_use]
	pub fn relation(mut self, decl: RelationDecl) -> Self {
		self.decls.push(decl);
		self
	}

	/// Relation by exact query name
	pub fn relation_named(&self, name: &str) -> Option<&RelationMeta> {
		self.relations.iter().find(|r| r.name == name)
	}

	/// Relation by its alternative accessor name
	pub fn relation_by_accessor(&self, accessor: &str) -> Option<&RelationMeta> {
		self.relations
			.iter()
			.find(|r| r.accessor.as_deref() == Some(accessor))
	}

	pub fn scalar_field(&self, name: &str) -> Option<&ScalarField> {
		self.fields.iter().find(|f| f.name == name)
	}

	/// True for the pk attribute, a scalar column or a forward FK column
	pub fn has_column(&self, name: &str) -> bool {
		name == self.pk.attname
			|| self.scalar_field(name).is_some()
			|| self
				.relation_named(name)
				.is_some_and(|r| r.kind.is_forward_owner())
	}

	/// Forward foreign key columns of this entity
	pub fn foreign_keys(&self) -> impl Iterator<Item = &RelationMeta> {
		self.relations.iter().filter(|r| r.kind.is_forward_owner())
	}

	fn has_name(&self, name: &str) -> bool {
		self.scalar_field(name).is_some() || self.relation_named(name).is_some()
	}
}

/// Read access to relational metadata
pub trait RelationalMetadata: Send + Sync {
	/// Looks up an entity schema by name
	fn entity(&self, name: &str) -> Option<&EntitySchema>;

	/// Looks up the relation `source` on `entity`
	fn get_relation(&self, entity: &str, source: &str) -> Option<&RelationMeta> {
		self.entity(entity)?.relation_named(source)
	}

	/// Whether the entity carrying `relation` owns the foreign key
	fn is_forward_owner(&self, relation: &RelationMeta) -> bool {
		relation.kind.is_forward_owner()
	}

	/// Join entity of a many-to-many relation
	fn through_entity(&self, relation: &RelationMeta) -> Option<&EntitySchema> {
		relation
			.through
			.as_ref()
			.and_then(|through| self.entity(&through.entity))
	}
}

/// Registry of all entity schemas taking part in nested writes
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
	entities: IndexMap<String, EntitySchema>,
}

impl SchemaRegistry {
	pub fn builder() -> SchemaRegistryBuilder {
		SchemaRegistryBuilder::default()
	}

	/// All registered entities in registration order
	pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
		self.entities.values()
	}

	/// Forward foreign keys anywhere in the registry that point at `target`
	pub fn references_to<'a>(
		&'a self,
		target: &'a str,
	) -> impl Iterator<Item = (&'a EntitySchema, &'a RelationMeta)> + 'a {
		self.entities.values().flat_map(move |entity| {
			entity
				.foreign_keys()
				.filter(move |r| r.target == target)
				.map(move |r| (entity, r))
		})
	}
}

impl RelationalMetadata for SchemaRegistry {
	fn entity(&self, name: &str) -> Option<&EntitySchema> {
		self.entities.get(name)
	}
}

/// Collects entity schemas and resolves both sides of every relation
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
	entities: Vec<EntitySchema>,
}

impl SchemaRegistryBuilder {
	#[must_use]
	pub fn entity(mut self, entity: EntitySchema) -> Self {
		self.entities.push(entity);
		self
	}

	/// Validates declarations and synthesizes reverse relations
	pub fn build(self) -> Result<SchemaRegistry, SchemaMismatchError> {
		let mut entities: IndexMap<String, EntitySchema> = IndexMap::new();
		for entity in self.entities {
			if entities.contains_key(&entity.name) {
				return Err(SchemaMismatchError::new(
					&entity.name,
					&entity.pk.attname,
					"entity registered twice",
				));
			}
			entities.insert(entity.name.clone(), entity);
		}

		let decls: Vec<(String, RelationDecl)> = entities
			.values_mut()
			.flat_map(|entity| {
				let name = entity.name.clone();
				std::mem::take(&mut entity.decls)
					.into_iter()
					.map(move |decl| (name.clone(), decl))
			})
			.collect();

		let mut join_entities = Vec::new();
		let mut reverse = Vec::new();

		for (owner, decl) in decls {
			if !entities.contains_key(&decl.target) {
				return Err(SchemaMismatchError::new(
					&owner,
					&decl.name,
					format!("relation targets unknown entity `{}`", decl.target),
				));
			}
			let reverse_name = decl
				.related_name
				.clone()
				.unwrap_or_else(|| owner.clone());
			let suppressed = reverse_name == NO_REVERSE;

			let through = match (decl.kind, &decl.through) {
				(RelationKind::ManyToManyForward, Some((entity, source, target))) => {
					let through = ThroughMeta {
						entity: entity.clone(),
						source_column: source.clone(),
						target_column: target.clone(),
						auto_created: false,
					};
					check_custom_through(&entities, &owner, &decl, &through)?;
					Some(through)
				}
				(RelationKind::ManyToManyForward, None) => {
					let (join, through) = auto_join_entity(&owner, &decl);
					join_entities.push(join);
					Some(through)
				}
				(_, Some(_)) => {
					return Err(SchemaMismatchError::new(
						&owner,
						&decl.name,
						"only many-to-many relations accept a through entity",
					));
				}
				_ => None,
			};

			if let Some(link) = &decl.generic {
				let target = &entities[&decl.target];
				for column in [&link.content_type_field, &link.object_id_field] {
					if target.scalar_field(column).is_none() {
						return Err(SchemaMismatchError::new(
							&owner,
							&decl.name,
							format!("generic target `{}` has no column `{column}`", decl.target),
						));
					}
				}
			}

			let forward = RelationMeta {
				name: decl.name.clone(),
				kind: decl.kind,
				entity: owner.clone(),
				target: decl.target.clone(),
				nullable: decl.null,
				on_delete: decl.on_delete,
				remote_name: (!suppressed && decl.kind != RelationKind::Generic)
					.then(|| reverse_name.clone()),
				accessor: None,
				through: through.clone(),
				generic: decl.generic.clone(),
			};

			if !suppressed && decl.kind != RelationKind::Generic {
				let (kind, accessor) = match decl.kind {
					RelationKind::ManyToOneForward => (
						RelationKind::OneToManyReverse,
						decl.related_name.is_none().then(|| format!("{owner}_set")),
					),
					RelationKind::OneToOneForward => (RelationKind::OneToOneReverse, None),
					_ => (
						RelationKind::ManyToManyReverse,
						decl.related_name.is_none().then(|| format!("{owner}_set")),
					),
				};
				reverse.push(RelationMeta {
					name: reverse_name,
					kind,
					entity: decl.target.clone(),
					target: owner.clone(),
					nullable: decl.null,
					on_delete: decl.on_delete,
					remote_name: Some(decl.name.clone()),
					accessor,
					through: through.as_ref().map(ThroughMeta::reversed),
					generic: None,
				});
			}

			push_relation(&mut entities, forward)?;
		}

		for meta in reverse {
			push_relation(&mut entities, meta)?;
		}

		for join in join_entities {
			if entities.contains_key(&join.name) {
				return Err(SchemaMismatchError::new(
					&join.name,
					&join.pk.attname,
					"auto-created join entity clashes with a registered entity",
				));
			}
			entities.insert(join.name.clone(), join);
		}

		tracing::debug!(entities = entities.len(), "schema registry built");
		Ok(SchemaRegistry { entities })
	}
}

fn push_relation(
	entities: &mut IndexMap<String, EntitySchema>,
	meta: RelationMeta,
) -> Result<(), SchemaMismatchError> {
	let entity = entities.get_mut(&meta.entity).ok_or_else(|| {
		SchemaMismatchError::new(&meta.entity, &meta.name, "unknown entity")
	})?;
	if entity.has_name(&meta.name) {
		return Err(SchemaMismatchError::new(
			&meta.entity,
			&meta.name,
			"relation name clashes with an existing field or relation",
		));
	}
	entity.relations.push(meta);
	Ok(())
}

fn auto_join_entity(owner: &str, decl: &RelationDecl) -> (EntitySchema, ThroughMeta) {
	let source_column = owner.to_string();
	let target_column = if decl.target == owner {
		format!("to_{}", decl.target)
	} else {
		decl.target.clone()
	};
	let join_name = format!("{owner}_{}", decl.name);

	let mut join = EntitySchema::new(&join_name);
	for (column, target) in [(&source_column, owner), (&target_column, decl.target.as_str())] {
		join.relations.push(RelationMeta {
			name: column.clone(),
			kind: RelationKind::ManyToOneForward,
			entity: join_name.clone(),
			target: target.to_string(),
			nullable: false,
			on_delete: CascadeAction::Cascade,
			remote_name: None,
			accessor: None,
			through: None,
			generic: None,
		});
	}

	let through = ThroughMeta {
		entity: join_name,
		source_column,
		target_column,
		auto_created: true,
	};
	(join, through)
}

fn check_custom_through(
	entities: &IndexMap<String, EntitySchema>,
	owner: &str,
	decl: &RelationDecl,
	through: &ThroughMeta,
) -> Result<(), SchemaMismatchError> {
	let join = entities.get(&through.entity).ok_or_else(|| {
		SchemaMismatchError::new(
			owner,
			&decl.name,
			format!("unknown through entity `{}`", through.entity),
		)
	})?;
	let points_at = |column: &str, target: &str| {
		join.decls
			.iter()
			.chain(std::iter::empty())
			.any(|d| d.name == column && d.kind == RelationKind::ManyToOneForward && d.target == target)
			|| join
				.relations
				.iter()
				.any(|r| r.name == column && r.kind == RelationKind::ManyToOneForward && r.target == target)
	};
	if !points_at(&through.source_column, owner) || !points_at(&through.target_column, &decl.target)
	{
		return Err(SchemaMismatchError::new(
			owner,
			&decl.name,
			format!(
				"through entity `{}` needs foreign keys `{}` -> `{owner}` and `{}` -> `{}`",
				through.entity, through.source_column, through.target_column, decl.target
			),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn registry() -> SchemaRegistry {
		SchemaRegistry::builder()
			.entity(EntitySchema::new("site").scalar("url"))
			.entity(EntitySchema::new("access_key").scalar("key"))
			.entity(EntitySchema::new("user").scalar("username"))
			.entity(
				EntitySchema::new("profile")
					.relation(RelationDecl::many_to_many("sites", "site"))
					.relation(RelationDecl::one_to_one("user", "user"))
					.relation(
						RelationDecl::foreign_key("access_key", "access_key")
							.null(true)
							.on_delete(CascadeAction::SetNull),
					),
			)
			.entity(
				EntitySchema::new("message")
					.primary_key("id", PrimaryKeyKind::Uuid)
					.scalar("message")
					.relation(RelationDecl::foreign_key("profile", "profile")),
			)
			.build()
			.unwrap()
	}

	#[rstest]
	fn test_forward_and_reverse_foreign_key() {
		let registry = registry();
		let forward = registry.get_relation("message", "profile").unwrap();
		assert_eq!(forward.kind, RelationKind::ManyToOneForward);
		assert!(registry.is_forward_owner(forward));

		let reverse = registry.get_relation("profile", "message").unwrap();
		assert_eq!(reverse.kind, RelationKind::OneToManyReverse);
		assert_eq!(reverse.accessor.as_deref(), Some("message_set"));
		assert_eq!(reverse.back_reference(), Some("profile"));
		assert!(!registry.is_forward_owner(reverse));
	}

	#[rstest]
	fn test_one_to_one_reverse() {
		let registry = registry();
		let reverse = registry.get_relation("user", "profile").unwrap();
		assert_eq!(reverse.kind, RelationKind::OneToOneReverse);
		assert!(!reverse.kind.is_to_many());
	}

	#[rstest]
	fn test_many_to_many_creates_join_entity() {
		let registry = registry();
		let forward = registry.get_relation("profile", "sites").unwrap();
		let through = registry.through_entity(forward).unwrap();
		assert_eq!(through.name, "profile_sites");
		assert!(through.has_column("profile"));
		assert!(through.has_column("site"));

		let reverse = registry.get_relation("site", "profile").unwrap();
		assert_eq!(reverse.kind, RelationKind::ManyToManyReverse);
		let reverse_through = reverse.through.as_ref().unwrap();
		assert_eq!(reverse_through.source_column, "site");
		assert_eq!(reverse_through.target_column, "profile");
	}

	#[rstest]
	fn test_unknown_target_is_rejected() {
		let err = SchemaRegistry::builder()
			.entity(EntitySchema::new("avatar").relation(RelationDecl::foreign_key("profile", "profile")))
			.build()
			.unwrap_err();
		assert_eq!(err.entity, "avatar");
		assert_eq!(err.field, "profile");
	}

	#[rstest]
	fn test_reverse_name_clash_is_rejected() {
		let err = SchemaRegistry::builder()
			.entity(EntitySchema::new("profile").scalar("avatars"))
			.entity(
				EntitySchema::new("avatar")
					.relation(RelationDecl::foreign_key("profile", "profile").related_name("avatars")),
			)
			.build()
			.unwrap_err();
		assert_eq!(err.field, "avatars");
	}

	#[rstest]
	fn test_generic_relation_requires_columns() {
		let err = SchemaRegistry::builder()
			.entity(EntitySchema::new("tag").scalar("tag"))
			.entity(
				EntitySchema::new("tagged_item").relation(RelationDecl::generic(
					"tags",
					"tag",
					"content_type",
					"object_id",
				)),
			)
			.build()
			.unwrap_err();
		assert!(err.reason.contains("content_type"));
	}

	#[rstest]
	fn test_custom_through_is_checked() {
		let registry = SchemaRegistry::builder()
			.entity(EntitySchema::new("user"))
			.entity(
				EntitySchema::new("team")
					.relation(RelationDecl::many_to_many("members", "user").through("membership", "team", "user")),
			)
			.entity(
				EntitySchema::new("membership")
					.scalar("role")
					.relation(RelationDecl::foreign_key("team", "team").related_name(NO_REVERSE))
					.relation(RelationDecl::foreign_key("user", "user").related_name(NO_REVERSE)),
			)
			.build()
			.unwrap();
		let members = registry.get_relation("team", "members").unwrap();
		assert_eq!(registry.through_entity(members).unwrap().name, "membership");
		assert!(!members.through.as_ref().unwrap().auto_created);
	}
}
