//! Nested write orchestration
//!
//! A save walks the classified tree of a [`WritePlan`] in a fixed order:
//!
//! 1. the whole payload is validated up front;
//! 2. direct relations (the row holds the foreign key) are resolved and saved
//!    first, so their keys can be written onto the owner;
//! 3. the owner row is persisted;
//! 4. reverse relations (the related rows point back) are resolved, pointed at
//!    the owner and saved;
//! 5. for an owner that already existed, reverse rows missing from the payload
//!    are swept.
//!
//! Everything after validation runs in one transaction. Any failure rolls the
//! whole tree back; user-facing failures come back as one
//! [`ErrorTree`] mirroring the payload shape.

use crate::backend::{Attrs, Filter, Persistence, PrimaryKey, Row, StorageError};
use crate::classifier::{ChildPlan, FieldRole, PlannedField, WritePlan};
use crate::errors::{ErrorTree, NestedResult, NestedWriteError};
use crate::locator::LocatorResolver;
use crate::matcher::{MatchOutcome, Matcher, fragment_pk};
use crate::reconcile::{self, SweepTarget};
use crate::save_kwargs::SaveKwargs;
use crate::schema::{RelationKind, RelationMeta, RelationalMetadata};
use crate::serializer::{NestedSerializer, WritePolicy};
use crate::settings::NestedWriteSettings;
use crate::transaction::atomic;
use crate::validation::{
	DB_NOT_NULL, DefaultFieldValidator, FieldValidator, NOT_NULL, REQUIRED, expected_list,
	expected_object,
};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Phase of a nested save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
	Validating,
	ResolvingDirect,
	PersistingOwner,
	ResolvingReverse,
	Reconciling,
	Committed,
	Failed,
}

impl fmt::Display for SaveState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SaveState::Validating => "validating",
			SaveState::ResolvingDirect => "resolving_direct",
			SaveState::PersistingOwner => "persisting_owner",
			SaveState::ResolvingReverse => "resolving_reverse",
			SaveState::Reconciling => "reconciling",
			SaveState::Committed => "committed",
			SaveState::Failed => "failed",
		};
		f.write_str(name)
	}
}

/// Context threaded through one nested save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedSaveContext {
	/// Levels below the root
	pub depth: usize,
	pub max_depth: usize,
	/// Partial update: absent fields are not required of existing rows
	pub partial: bool,
}

impl NestedSaveContext {
	pub fn new(max_depth: usize) -> Self {
		Self {
			depth: 0,
			max_depth,
			partial: false,
		}
	}

	#[must_use]
	pub fn with_partial(mut self, partial: bool) -> Self {
		self.partial = partial;
		self
	}

	/// Context of the next level down
	pub fn child_context(&self) -> NestedResult<Self> {
		if self.depth >= self.max_depth {
			return Err(NestedWriteError::non_field(format!(
				"Maximum nesting depth {} exceeded",
				self.max_depth
			)));
		}
		Ok(Self {
			depth: self.depth + 1,
			..*self
		})
	}
}

/// Per-call options of [`NestedWriter::save`]
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
	pub partial: bool,
	pub kwargs: SaveKwargs,
}

impl SaveOptions {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn partial(mut self, partial: bool) -> Self {
		self.partial = partial;
		self
	}

	#[must_use]
	pub fn kwargs(mut self, kwargs: SaveKwargs) -> Self {
		self.kwargs = kwargs;
		self
	}
}

/// One validated payload level
#[derive(Debug)]
struct Validated<'a> {
	plan: &'a WritePlan,
	raw: &'a Value,
	/// Coerced local values keyed by source column
	attrs: Attrs,
	/// Nested fields present in the payload, in declaration order
	relations: Vec<(&'a PlannedField, Nested<'a>)>,
}

#[derive(Debug)]
enum Nested<'a> {
	Null,
	One(Validated<'a>),
	Many(Vec<Validated<'a>>),
}

impl<'a> Validated<'a> {
	fn relation(&self, name: &str) -> Option<&Nested<'a>> {
		self.relations
			.iter()
			.find(|(field, _)| field.name() == name)
			.map(|(_, nested)| nested)
	}

	/// Required fields absent from the payload
	fn missing_required(&self) -> ErrorTree {
		let mut errors = ErrorTree::empty();
		for field in &self.plan.fields {
			if matches!(field.role, FieldRole::ReadOnly) || !field.descriptor.required {
				continue;
			}
			if self.raw.get(field.name()).is_none() {
				errors.insert(field.name(), ErrorTree::message(REQUIRED));
			}
		}
		errors
	}
}

/// Writes nested payloads through a [`Persistence`] backend
///
/// # Examples
///
/// ```
/// use reinhardt_writable_nested::{
/// 	FieldDescriptor, InMemoryStore, NestedSerializer, NestedWriter, SaveOptions,
/// };
/// use reinhardt_writable_nested::schema::{EntitySchema, RelationDecl, SchemaRegistry};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let registry = Arc::new(
/// 	SchemaRegistry::builder()
/// 		.entity(EntitySchema::new("author").scalar("name"))
/// 		.entity(
/// 			EntitySchema::new("book")
/// 				.scalar("title")
/// 				.relation(RelationDecl::foreign_key("author", "author").related_name("books")),
/// 		)
/// 		.build()
/// 		.unwrap(),
/// );
/// let store = Arc::new(InMemoryStore::new(registry.clone()));
/// let writer = NestedWriter::new(registry, store.clone());
///
/// let book = Arc::new(NestedSerializer::new("book").field(FieldDescriptor::new("title")));
/// let author = NestedSerializer::new("author")
/// 	.field(FieldDescriptor::new("name"))
/// 	.field(FieldDescriptor::nested_many("books", book));
/// let plan = writer.plan(Arc::new(author)).unwrap();
///
/// writer
/// 	.save(&plan, None, &json!({"name": "Ann", "books": [{"title": "A"}, {"title": "B"}]}), &SaveOptions::new())
/// 	.unwrap();
/// assert_eq!(store.count("book"), 2);
/// ```
pub struct NestedWriter {
	metadata: Arc<dyn RelationalMetadata>,
	store: Arc<dyn Persistence>,
	validator: Arc<dyn FieldValidator>,
	locator: Option<Arc<dyn LocatorResolver>>,
	settings: NestedWriteSettings,
}

impl NestedWriter {
	pub fn new(metadata: Arc<dyn RelationalMetadata>, store: Arc<dyn Persistence>) -> Self {
		Self {
			metadata,
			store,
			validator: Arc::new(DefaultFieldValidator::new()),
			locator: None,
			settings: NestedWriteSettings::default(),
		}
	}

	#[must_use]
	pub fn with_validator(mut self, validator: Arc<dyn FieldValidator>) -> Self {
		self.validator = validator;
		self
	}

	#[must_use]
	pub fn with_locator(mut self, locator: Arc<dyn LocatorResolver>) -> Self {
		self.locator = Some(locator);
		self
	}

	#[must_use]
	pub fn with_settings(mut self, settings: NestedWriteSettings) -> Self {
		self.settings = settings;
		self
	}

	pub fn settings(&self) -> &NestedWriteSettings {
		&self.settings
	}

	pub fn store(&self) -> &Arc<dyn Persistence> {
		&self.store
	}

	/// Classifies `serializer` against the writer's metadata
	pub fn plan(&self, serializer: Arc<NestedSerializer>) -> NestedResult<Arc<WritePlan>> {
		Ok(WritePlan::build(serializer, self.metadata.as_ref())?)
	}

	/// Creates the root row described by `data`
	pub fn create(&self, plan: &WritePlan, data: &Value, kwargs: SaveKwargs) -> NestedResult<Row> {
		self.save(plan, None, data, &SaveOptions::new().kwargs(kwargs))
	}

	/// Updates `instance` from `data`
	pub fn update(
		&self,
		plan: &WritePlan,
		instance: &Row,
		data: &Value,
		options: &SaveOptions,
	) -> NestedResult<Row> {
		self.save(plan, Some(instance), data, options)
	}

	/// Validates and persists a whole payload tree in one transaction
	///
	/// Without `instance`, a root serializer with non-default match criteria
	/// or write policy is matched against storage like any nested fragment.
	pub fn save(
		&self,
		plan: &WritePlan,
		instance: Option<&Row>,
		data: &Value,
		options: &SaveOptions,
	) -> NestedResult<Row> {
		let span = tracing::debug_span!("nested_save", entity = plan.entity());
		let _guard = span.enter();

		let ctx = NestedSaveContext::new(self.settings.max_depth).with_partial(options.partial);
		tracing::trace!(state = %SaveState::Validating, "validating payload");
		let validated = match self.validate_level(plan, data, &ctx) {
			Ok(validated) => validated,
			Err(errors) => {
				tracing::debug!(state = %SaveState::Failed, "payload rejected");
				return Err(NestedWriteError::Validation(errors));
			}
		};

		let result = atomic(self.store.as_ref(), || match instance {
			Some(row) => self.write_level(
				&validated,
				Some(row.clone()),
				true,
				&options.kwargs,
				&ctx,
				&Attrs::new(),
			),
			None => {
				let outcome = if plan.serializer.has_default_matching() {
					MatchOutcome::New
				} else {
					self.matcher().match_one(plan, data)?
				};
				self.write_outcome(&validated, outcome, &options.kwargs, &ctx, &Attrs::new())
			}
		});

		match &result {
			Ok(row) => tracing::debug!(state = %SaveState::Committed, pk = %row.pk, "nested save committed"),
			Err(err) => tracing::debug!(state = %SaveState::Failed, error = %err, "nested save rolled back"),
		}
		result
	}

	fn matcher(&self) -> Matcher<'_> {
		Matcher::new(self.store.as_ref(), self.locator.as_deref(), &self.settings)
	}

	fn validate_level<'a>(
		&self,
		plan: &'a WritePlan,
		raw: &'a Value,
		ctx: &NestedSaveContext,
	) -> Result<Validated<'a>, ErrorTree> {
		let Value::Object(map) = raw else {
			return Err(ErrorTree::non_field(expected_object(raw)));
		};
		let mut errors = ErrorTree::empty();
		let mut attrs = Attrs::new();
		let mut relations = Vec::new();

		for field in &plan.fields {
			if matches!(field.role, FieldRole::ReadOnly) {
				continue;
			}
			let descriptor = &field.descriptor;
			let Some(value) = map.get(field.name()) else {
				if descriptor.required && !ctx.partial {
					errors.insert(field.name(), ErrorTree::message(REQUIRED));
				}
				continue;
			};

			let Some(child) = &field.child else {
				match self.validator.validate(descriptor, value) {
					Ok(coerced) => {
						attrs.insert(descriptor.source().to_string(), coerced);
					}
					Err(messages) => errors.insert(field.name(), ErrorTree::Messages(messages)),
				}
				continue;
			};

			if value.is_null() {
				if descriptor.allow_null {
					relations.push((field, Nested::Null));
				} else {
					errors.insert(field.name(), ErrorTree::message(NOT_NULL));
				}
				continue;
			}

			let child_ctx = match ctx.child_context() {
				Ok(child_ctx) => child_ctx,
				Err(err) => {
					errors.insert(field.name(), err.error_tree().unwrap_or_default());
					continue;
				}
			};
			let validate_item = |item: &'a Value| -> Result<Validated<'a>, ErrorTree> {
				if !item.is_object() {
					return Err(ErrorTree::non_field(expected_object(item)));
				}
				let Some(child_plan) = child.resolve(item) else {
					return Err(unknown_resource_type(child, item));
				};
				self.validate_level(child_plan, item, &child_ctx)
			};

			if descriptor.is_many() {
				let Value::Array(items) = value else {
					errors.insert(field.name(), ErrorTree::non_field(expected_list(value)));
					continue;
				};
				let mut levels = Vec::with_capacity(items.len());
				let mut item_errors = Vec::with_capacity(items.len());
				for item in items {
					match validate_item(item) {
						Ok(level) => {
							levels.push(level);
							item_errors.push(ErrorTree::empty());
						}
						Err(tree) => item_errors.push(tree),
					}
				}
				if item_errors.iter().all(ErrorTree::is_empty) {
					relations.push((field, Nested::Many(levels)));
				} else {
					errors.insert(field.name(), ErrorTree::List(item_errors));
				}
			} else {
				match validate_item(value) {
					Ok(level) => relations.push((field, Nested::One(level))),
					Err(tree) => errors.insert(field.name(), tree),
				}
			}
		}

		if errors.is_empty()
			&& let Some(validator) = &plan.serializer.validator
			&& let Err(tree) = validator.validate(&mut attrs)
		{
			match tree {
				ErrorTree::Map(fields) => {
					for (name, tree) in fields {
						errors.insert(name, tree);
					}
				}
				other => errors.insert(crate::errors::NON_FIELD_ERRORS, other),
			}
		}

		if errors.is_empty() {
			Ok(Validated {
				plan,
				raw,
				attrs,
				relations,
			})
		} else {
			Err(errors)
		}
	}

	fn write_outcome(
		&self,
		level: &Validated<'_>,
		outcome: MatchOutcome,
		kwargs: &SaveKwargs,
		ctx: &NestedSaveContext,
		back_reference: &Attrs,
	) -> NestedResult<Row> {
		let plan = level.plan;
		match outcome {
			MatchOutcome::Missing => Err(NestedWriteError::non_field(format!(
				"{} matching query does not exist.",
				plan.entity()
			))),
			MatchOutcome::New => self.write_level(level, None, true, kwargs, ctx, back_reference),
			MatchOutcome::Existing(row) => {
				let modify = plan.serializer.write_policy == WritePolicy::UpdateOrCreate;
				self.write_level(level, Some(row), modify, kwargs, ctx, back_reference)
			}
		}
	}

	/// Saves one level: direct relations, the owner row, reverse relations
	///
	/// With `modify` unset the matched row keeps its own values and direct
	/// relations; only the back reference and reverse relations are written.
	fn write_level(
		&self,
		level: &Validated<'_>,
		existing: Option<Row>,
		modify: bool,
		kwargs: &SaveKwargs,
		ctx: &NestedSaveContext,
		back_reference: &Attrs,
	) -> NestedResult<Row> {
		let plan = level.plan;
		let span = tracing::trace_span!("nested_level", entity = plan.entity(), depth = ctx.depth);
		let _guard = span.enter();
		let existed = existing.is_some();

		// Nested rows about to be created get no partial relief
		if !existed && ctx.partial && ctx.depth > 0 {
			let missing = level.missing_required();
			if !missing.is_empty() {
				return Err(NestedWriteError::Validation(missing));
			}
		}

		let mut errors = ErrorTree::empty();
		let mut attrs = Attrs::new();

		if modify {
			tracing::trace!(state = %SaveState::ResolvingDirect);
			attrs = level.attrs.clone();
			attrs.extend(kwargs.attributes(plan));
			for (field, nested) in &level.relations {
				let FieldRole::Direct(meta) = &field.role else {
					continue;
				};
				match nested {
					Nested::Null => {
						attrs.insert(meta.name.clone(), Value::Null);
					}
					Nested::One(child) => {
						let child_kwargs = kwargs.nested(field.name())?;
						let result = ctx.child_context().and_then(|child_ctx| {
							let outcome = self.matcher().match_one(child.plan, child.raw)?;
							self.write_outcome(child, outcome, &child_kwargs, &child_ctx, &Attrs::new())
						});
						match result {
							Ok(row) => {
								attrs.insert(meta.name.clone(), row.pk.to_value());
							}
							Err(NestedWriteError::Validation(tree)) => errors.insert(field.name(), tree),
							Err(err) => return Err(err),
						}
					}
					Nested::Many(_) => {}
				}
			}
			if !errors.is_empty() {
				return Err(NestedWriteError::Validation(errors));
			}
		}

		tracing::trace!(state = %SaveState::PersistingOwner, existed);
		attrs.extend(back_reference.iter().map(|(k, v)| (k.clone(), v.clone())));
		let owner = match existing {
			Some(row) => {
				let fresh = self
					.store
					.find_by_pk(plan.entity(), &row.pk, false)
					.map_err(|err| translate_storage(plan, &attrs, err))?
					.ok_or_else(|| {
						NestedWriteError::Persistence(format!("{row} no longer exists"))
					})?;
				if attrs.is_empty() {
					fresh
				} else {
					if modify {
						self.check_unique(plan, &attrs, Some(&fresh.pk))?;
					}
					self.store
						.update(&fresh, attrs.clone())
						.map_err(|err| translate_storage(plan, &attrs, err))?
				}
			}
			None => {
				self.check_unique(plan, &attrs, None)?;
				self.store
					.create(plan.entity(), attrs.clone())
					.map_err(|err| translate_storage(plan, &attrs, err))?
			}
		};

		tracing::trace!(state = %SaveState::ResolvingReverse, pk = %owner.pk);
		let mut targets = Vec::new();
		for field in plan.reverse_fields() {
			let Some(nested) = level.relation(field.name()) else {
				continue;
			};
			let items: Vec<&Validated<'_>> = match nested {
				Nested::Null => {
					if !field.descriptor.is_many() {
						targets.push(SweepTarget {
							field,
							payload: Vec::new(),
						});
					}
					continue;
				}
				Nested::One(item) => vec![item],
				Nested::Many(items) => items.iter().collect(),
			};
			let item_kwargs = kwargs.nested(field.name())?;
			match self.write_reverse(&owner, existed, field, &items, &item_kwargs, ctx) {
				Ok(payload) => targets.push(SweepTarget { field, payload }),
				Err(NestedWriteError::Validation(tree)) => errors.insert(field.name(), tree),
				Err(err) => return Err(err),
			}
		}
		if !errors.is_empty() {
			return Err(NestedWriteError::Validation(errors));
		}

		if existed {
			tracing::trace!(state = %SaveState::Reconciling, targets = targets.len());
			reconcile::sweep(
				self.store.as_ref(),
				self.metadata.as_ref(),
				&self.settings,
				&owner,
				&targets,
			)?;
		}
		Ok(owner)
	}

	/// Resolves and saves the fragments of one reverse relation
	///
	/// Returns the primary keys of the saved rows, in payload order.
	fn write_reverse(
		&self,
		owner: &Row,
		existed: bool,
		field: &PlannedField,
		items: &[&Validated<'_>],
		kwargs: &SaveKwargs,
		ctx: &NestedSaveContext,
	) -> NestedResult<Vec<PrimaryKey>> {
		let Some(meta) = field.role.relation() else {
			return Ok(Vec::new());
		};
		let child_ctx = ctx.child_context()?;

		let mut fragments: Vec<Cow<'_, Value>> = items.iter().map(|item| Cow::Borrowed(item.raw)).collect();
		if meta.kind == RelationKind::OneToOneReverse && existed && self.settings.reuse_linked_singleton {
			let linked = reconcile::linked_rows(self.store.as_ref(), self.metadata.as_ref(), owner, meta)?;
			if let Some(linked) = linked.first() {
				for (fragment, item) in fragments.iter_mut().zip(items) {
					if fragment_pk(item.plan, item.raw).is_none()
						&& let Value::Object(map) = fragment.to_mut()
					{
						map.insert("pk".to_string(), linked.pk.to_value());
					}
				}
			}
		}

		let pairs: Vec<(&WritePlan, &Value)> = items
			.iter()
			.zip(&fragments)
			.map(|(item, fragment)| (item.plan, fragment.as_ref()))
			.collect();
		let outcomes = self.matcher().match_many(&pairs)?;
		let link = back_reference(meta, owner);

		let mut rows = Vec::with_capacity(items.len());
		let mut errors = Vec::with_capacity(items.len());
		for (item, outcome) in items.iter().zip(outcomes) {
			match self.write_outcome(item, outcome, kwargs, &child_ctx, &link) {
				Ok(row) => {
					rows.push(row);
					errors.push(ErrorTree::empty());
				}
				Err(NestedWriteError::Validation(tree)) => errors.push(tree),
				Err(err) => return Err(err),
			}
		}
		if errors.iter().any(|tree| !tree.is_empty()) {
			let tree = if field.descriptor.is_many() {
				ErrorTree::List(errors)
			} else {
				errors.into_iter().next().unwrap_or_default()
			};
			return Err(NestedWriteError::Validation(tree));
		}

		if meta.kind.is_many_to_many() {
			let through = meta.through.as_ref().ok_or_else(|| {
				NestedWriteError::Persistence(format!("`{}` has no join entity", meta.name))
			})?;
			for row in &rows {
				self.store
					.associate(through, owner, row)
					.map_err(|err| NestedWriteError::Persistence(err.to_string()))?;
			}
		}
		Ok(rows.into_iter().map(|row| row.pk).collect())
	}

	/// Rejects values of unique fields already taken by another row
	fn check_unique(&self, plan: &WritePlan, attrs: &Attrs, exclude: Option<&PrimaryKey>) -> NestedResult<()> {
		let mut errors = ErrorTree::empty();
		for field in plan.local_fields().filter(|field| field.descriptor.unique) {
			let source = field.descriptor.source();
			let Some(value) = attrs.get(source).filter(|value| !value.is_null()) else {
				continue;
			};
			let filter = Filter::new()
				.exact(source, value.clone())
				.exclude_pks(exclude.cloned())
				.limit(1);
			let taken = self
				.store
				.find_by_filter(plan.entity(), &filter)
				.map_err(|err| NestedWriteError::Persistence(err.to_string()))?;
			if !taken.is_empty() {
				errors.insert(field.name(), ErrorTree::message(unique_message(plan, field)));
			}
		}
		if errors.is_empty() {
			Ok(())
		} else {
			Err(NestedWriteError::Validation(errors))
		}
	}
}

impl fmt::Debug for NestedWriter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("NestedWriter")
			.field("settings", &self.settings)
			.field("locator", &self.locator.is_some())
			.finish_non_exhaustive()
	}
}

fn unknown_resource_type(child: &ChildPlan, item: &Value) -> ErrorTree {
	match child {
		ChildPlan::Polymorphic {
			resource_type_field,
			..
		} => {
			let message = match item.get(resource_type_field) {
				None | Some(Value::Null) => REQUIRED.to_string(),
				Some(found) => format!("Invalid resource type {found}."),
			};
			ErrorTree::field(resource_type_field.clone(), ErrorTree::message(message))
		}
		ChildPlan::Single(_) => ErrorTree::non_field(expected_object(item)),
	}
}

/// Columns pointing a reverse-related row back at `owner`
fn back_reference(meta: &RelationMeta, owner: &Row) -> Attrs {
	let mut attrs = Attrs::new();
	if let Some(link) = &meta.generic {
		attrs.insert(
			link.content_type_field.clone(),
			Value::String(owner.entity.clone()),
		);
		attrs.insert(link.object_id_field.clone(), owner.pk.to_value());
	} else if let Some(remote) = meta.back_reference() {
		attrs.insert(remote.to_string(), owner.pk.to_value());
	}
	attrs
}

fn unique_message(plan: &WritePlan, field: &PlannedField) -> String {
	field.descriptor.unique_message.clone().unwrap_or_else(|| {
		format!("{} with this {} already exists.", plan.entity(), field.name())
	})
}

/// Field of `plan` written to `column`, falling back to the column itself
fn field_for_column<'a>(plan: &'a WritePlan, column: &'a str) -> &'a str {
	plan.fields
		.iter()
		.find(|field| match field.role.relation() {
			Some(meta) => meta.name == column,
			None => field.descriptor.source() == column,
		})
		.map_or(column, PlannedField::name)
}

/// Maps constraint failures onto the fields that caused them
fn translate_storage(plan: &WritePlan, attrs: &Attrs, err: StorageError) -> NestedWriteError {
	match err {
		StorageError::NotNull { column, .. } => NestedWriteError::Validation(ErrorTree::field(
			field_for_column(plan, &column),
			ErrorTree::message(DB_NOT_NULL),
		)),
		StorageError::Unique { fields, .. } => {
			let mut errors = ErrorTree::empty();
			for column in &fields {
				let name = field_for_column(plan, column);
				let message = match plan.field(name) {
					Some(field) => unique_message(plan, field),
					None => format!("{} with this {} already exists.", plan.entity(), column),
				};
				errors.insert(name, ErrorTree::message(message));
			}
			NestedWriteError::Validation(errors)
		}
		StorageError::ForeignKey { column, .. } => {
			let value = attrs.get(&column).cloned().unwrap_or(Value::Null);
			let pk = match value {
				Value::String(s) => s,
				other => other.to_string(),
			};
			NestedWriteError::Validation(ErrorTree::field(
				field_for_column(plan, &column),
				ErrorTree::message(format!("Invalid pk \"{pk}\" - object does not exist.")),
			))
		}
		StorageError::Protected { entity, blocked, .. } => NestedWriteError::ProtectedDelete {
			entity,
			instances: blocked,
		},
		other => {
			tracing::error!(entity = plan.entity(), error = %other, "storage failure during nested save");
			NestedWriteError::Persistence(other.to_string())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::InMemoryStore;
	use crate::schema::{EntitySchema, RelationDecl, SchemaRegistry};
	use crate::serializer::FieldDescriptor;
	use rstest::{fixture, rstest};
	use serde_json::json;

	struct Fixture {
		store: Arc<InMemoryStore>,
		writer: NestedWriter,
		plan: Arc<WritePlan>,
	}

	#[fixture]
	fn fixture() -> Fixture {
		let registry = Arc::new(
			SchemaRegistry::builder()
				.entity(EntitySchema::new("author").scalar("name"))
				.entity(
					EntitySchema::new("book")
						.scalar("title")
						.relation(RelationDecl::foreign_key("author", "author").related_name("books")),
				)
				.build()
				.unwrap(),
		);
		let store = Arc::new(InMemoryStore::new(registry.clone()));
		let writer = NestedWriter::new(registry, store.clone());
		let book = Arc::new(NestedSerializer::new("book").field(FieldDescriptor::new("title")));
		let author = NestedSerializer::new("author")
			.field(FieldDescriptor::new("pk").read_only(true))
			.field(FieldDescriptor::new("name"))
			.field(FieldDescriptor::nested_many("books", book).optional());
		let plan = writer.plan(Arc::new(author)).unwrap();
		Fixture {
			store,
			writer,
			plan,
		}
	}

	#[rstest]
	fn test_child_context_limits_depth() {
		let ctx = NestedSaveContext::new(1);
		let child = ctx.child_context().unwrap();
		assert_eq!(child.depth, 1);
		let err = child.child_context().unwrap_err();
		assert_eq!(
			err,
			NestedWriteError::non_field("Maximum nesting depth 1 exceeded")
		);
	}

	#[rstest]
	fn test_validation_reports_every_level(fixture: Fixture) {
		let err = fixture
			.writer
			.save(
				&fixture.plan,
				None,
				&json!({"books": [{"title": "ok"}, {}]}),
				&SaveOptions::new(),
			)
			.unwrap_err();
		assert_eq!(
			err.error_tree().unwrap().to_json(),
			json!({
				"name": ["This field is required."],
				"books": [{}, {"title": ["This field is required."]}],
			})
		);
		assert_eq!(fixture.store.count("author"), 0);
	}

	#[rstest]
	fn test_update_sweeps_missing_children(fixture: Fixture) {
		let author = fixture
			.writer
			.save(
				&fixture.plan,
				None,
				&json!({"name": "Ann", "books": [{"title": "A"}, {"title": "B"}]}),
				&SaveOptions::new(),
			)
			.unwrap();
		let kept = fixture.store.all("book")[0].pk.clone();

		fixture
			.writer
			.update(
				&fixture.plan,
				&author,
				&json!({"name": "Ann", "books": [{"pk": kept.to_value(), "title": "A2"}]}),
				&SaveOptions::new(),
			)
			.unwrap();

		let books = fixture.store.all("book");
		assert_eq!(books.len(), 1);
		assert_eq!(books[0].pk, kept);
		assert_eq!(books[0].get_str("title"), Some("A2"));
	}

	#[rstest]
	fn test_partial_update_leaves_absent_relations(fixture: Fixture) {
		let author = fixture
			.writer
			.save(
				&fixture.plan,
				None,
				&json!({"name": "Ann", "books": [{"title": "A"}]}),
				&SaveOptions::new(),
			)
			.unwrap();
		let updated = fixture
			.writer
			.update(
				&fixture.plan,
				&author,
				&json!({"name": "Bea"}),
				&SaveOptions::new().partial(true),
			)
			.unwrap();
		assert_eq!(updated.get_str("name"), Some("Bea"));
		assert_eq!(fixture.store.count("book"), 1);
	}

	#[rstest]
	fn test_save_state_names() {
		assert_eq!(SaveState::ResolvingDirect.to_string(), "resolving_direct");
		assert_eq!(SaveState::Committed.to_string(), "committed");
	}
}
