//! In-memory reference backend
//!
//! [`InMemoryStore`] keeps every table in insertion order behind a
//! `parking_lot::Mutex` and enforces the constraints a relational database
//! would: NOT NULL, UNIQUE, foreign key existence and the cascade action of
//! each foreign key on delete. Transactions are snapshot based; `begin` pushes
//! a copy of all tables and `rollback` restores it, so nested `begin` calls
//! behave like savepoints.
//!
//! Every mutation is appended to a journal of [`StoreEvent`]s, which tests use
//! to check the order in which rows were written.

use crate::backend::{Attrs, Condition, Filter, Lookup, Persistence, PrimaryKey, Row, StorageError, StorageResult};
use crate::schema::{CascadeAction, EntitySchema, PrimaryKeyKind, RelationKind, RelationMeta, RelationalMetadata, SchemaRegistry};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A storage mutation recorded by [`InMemoryStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
	Begin,
	Commit,
	Rollback,
	Created { entity: String, pk: PrimaryKey },
	Updated { entity: String, pk: PrimaryKey },
	Deleted { entity: String, pk: PrimaryKey },
	Locked { entity: String, pk: PrimaryKey },
}

#[derive(Debug, Clone, Default)]
struct Tables {
	rows: HashMap<String, IndexMap<PrimaryKey, Attrs>>,
	sequences: HashMap<String, i64>,
}

impl Tables {
	fn table(&self, entity: &str) -> impl Iterator<Item = (&PrimaryKey, &Attrs)> {
		self.rows.get(entity).into_iter().flat_map(|t| t.iter())
	}

	fn get(&self, entity: &str, pk: &PrimaryKey) -> Option<&Attrs> {
		self.rows.get(entity).and_then(|t| t.get(pk))
	}
}

#[derive(Debug, Default)]
struct State {
	tables: Tables,
	savepoints: Vec<Tables>,
	journal: Vec<StoreEvent>,
}

#[derive(Debug, Default)]
struct DeletePlan {
	deletes: Vec<(String, PrimaryKey)>,
	set_null: Vec<(String, PrimaryKey, String)>,
	blocked: Vec<String>,
	referenced_by: Vec<String>,
}

/// Thread-safe in-memory implementation of [`Persistence`]
///
/// # Examples
///
/// ```
/// use reinhardt_writable_nested::backend::{Attrs, Persistence};
/// use reinhardt_writable_nested::memory::InMemoryStore;
/// use reinhardt_writable_nested::schema::{EntitySchema, SchemaRegistry};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let registry = SchemaRegistry::builder()
/// 	.entity(EntitySchema::new("site").scalar("url"))
/// 	.build()
/// 	.unwrap();
/// let store = InMemoryStore::new(Arc::new(registry));
///
/// let mut attrs = Attrs::new();
/// attrs.insert("url".into(), json!("http://example.com"));
/// let site = store.create("site", attrs).unwrap();
///
/// assert_eq!(store.count("site"), 1);
/// assert_eq!(site.get("url"), Some(&json!("http://example.com")));
/// ```
#[derive(Debug)]
pub struct InMemoryStore {
	registry: Arc<SchemaRegistry>,
	state: Mutex<State>,
}

impl InMemoryStore {
	pub fn new(registry: Arc<SchemaRegistry>) -> Self {
		Self {
			registry,
			state: Mutex::new(State::default()),
		}
	}

	pub fn registry(&self) -> &Arc<SchemaRegistry> {
		&self.registry
	}

	/// Number of rows of `entity`
	pub fn count(&self, entity: &str) -> usize {
		self.state
			.lock()
			.tables
			.rows
			.get(entity)
			.map_or(0, IndexMap::len)
	}

	/// All rows of `entity` in insertion order
	pub fn all(&self, entity: &str) -> Vec<Row> {
		let state = self.state.lock();
		state
			.tables
			.table(entity)
			.map(|(pk, attrs)| Row::new(entity, pk.clone(), attrs.clone()))
			.collect()
	}

	pub fn get(&self, entity: &str, pk: &PrimaryKey) -> Option<Row> {
		let state = self.state.lock();
		state
			.tables
			.get(entity, pk)
			.map(|attrs| Row::new(entity, pk.clone(), attrs.clone()))
	}

	/// Mutations recorded since the store was created or last cleared
	pub fn journal(&self) -> Vec<StoreEvent> {
		self.state.lock().journal.clone()
	}

	pub fn clear_journal(&self) {
		self.state.lock().journal.clear();
	}

	/// Number of open transactions (savepoints included)
	pub fn transaction_depth(&self) -> usize {
		self.state.lock().savepoints.len()
	}

	fn schema(&self, entity: &str) -> StorageResult<&EntitySchema> {
		self.registry
			.entity(entity)
			.ok_or_else(|| StorageError::UnknownEntity(entity.to_string()))
	}

	/// Rejects unknown columns and canonicalizes foreign key values
	fn normalize(&self, schema: &EntitySchema, attrs: Attrs) -> StorageResult<Attrs> {
		let mut normalized = Attrs::new();
		for (column, value) in attrs {
			if !schema.has_column(&column) {
				return Err(StorageError::UnknownColumn {
					entity: schema.name.clone(),
					column,
				});
			}
			let value = match schema.relation_named(&column) {
				Some(fk) if !value.is_null() => {
					let target = self.schema(&fk.target)?;
					PrimaryKey::from_value(target.pk.kind, &value)
						.map(|pk| pk.to_value())
						.ok_or_else(|| StorageError::ForeignKey {
							entity: schema.name.clone(),
							column: column.clone(),
							target: value.to_string(),
						})?
				}
				_ => value,
			};
			normalized.insert(column, value);
		}
		Ok(normalized)
	}

	fn check_constraints(
		&self,
		tables: &Tables,
		schema: &EntitySchema,
		pk: &PrimaryKey,
		attrs: &Attrs,
	) -> StorageResult<()> {
		let is_null = |column: &str| attrs.get(column).is_none_or(Value::is_null);

		for field in &schema.fields {
			if !field.null && is_null(&field.name) {
				return Err(StorageError::NotNull {
					entity: schema.name.clone(),
					column: field.name.clone(),
				});
			}
		}

		for fk in schema.foreign_keys() {
			let Some(value) = attrs.get(&fk.name).filter(|v| !v.is_null()) else {
				if !fk.nullable {
					return Err(StorageError::NotNull {
						entity: schema.name.clone(),
						column: fk.name.clone(),
					});
				}
				continue;
			};
			let target = self.schema(&fk.target)?;
			let exists = PrimaryKey::from_value(target.pk.kind, value)
				.is_some_and(|target_pk| tables.get(&fk.target, &target_pk).is_some());
			if !exists {
				return Err(StorageError::ForeignKey {
					entity: schema.name.clone(),
					column: fk.name.clone(),
					target: format!("{}({})", fk.target, value),
				});
			}
		}

		let unique_columns = schema
			.fields
			.iter()
			.filter(|f| f.unique)
			.map(|f| f.name.as_str())
			.chain(
				schema
					.foreign_keys()
					.filter(|fk| fk.kind == RelationKind::OneToOneForward)
					.map(|fk| fk.name.as_str()),
			);
		for column in unique_columns {
			let Some(value) = attrs.get(column).filter(|v| !v.is_null()) else {
				continue;
			};
			let clash = tables
				.table(&schema.name)
				.any(|(other, other_attrs)| other != pk && other_attrs.get(column) == Some(value));
			if clash {
				return Err(StorageError::Unique {
					entity: schema.name.clone(),
					fields: vec![column.to_string()],
				});
			}
		}
		Ok(())
	}

	/// Rows reachable from one row through a relation
	fn related(
		&self,
		tables: &Tables,
		entity: &str,
		pk: &PrimaryKey,
		attrs: &Attrs,
		relation: &RelationMeta,
	) -> Vec<(PrimaryKey, Attrs)> {
		let Some(target) = self.registry.entity(&relation.target) else {
			return Vec::new();
		};
		let owner_pk = pk.to_value();
		let rows_where = |column: &str, value: &Value| -> Vec<(PrimaryKey, Attrs)> {
			tables
				.table(&relation.target)
				.filter(|(_, a)| a.get(column) == Some(value))
				.map(|(p, a)| (p.clone(), a.clone()))
				.collect()
		};
		match relation.kind {
			RelationKind::ManyToOneForward | RelationKind::OneToOneForward => attrs
				.get(&relation.name)
				.and_then(|v| PrimaryKey::from_value(target.pk.kind, v))
				.and_then(|target_pk| {
					tables
						.get(&relation.target, &target_pk)
						.map(|a| (target_pk, a.clone()))
				})
				.into_iter()
				.collect(),
			RelationKind::OneToManyReverse | RelationKind::OneToOneReverse => relation
				.remote_name
				.as_deref()
				.map(|column| rows_where(column, &owner_pk))
				.unwrap_or_default(),
			RelationKind::ManyToManyForward | RelationKind::ManyToManyReverse => {
				let Some(through) = &relation.through else {
					return Vec::new();
				};
				tables
					.table(&through.entity)
					.filter(|(_, link)| link.get(&through.source_column) == Some(&owner_pk))
					.filter_map(|(_, link)| link.get(&through.target_column))
					.filter_map(|v| PrimaryKey::from_value(target.pk.kind, v))
					.filter_map(|target_pk| {
						tables
							.get(&relation.target, &target_pk)
							.map(|a| (target_pk, a.clone()))
					})
					.collect()
			}
			RelationKind::Generic => {
				let Some(link) = &relation.generic else {
					return Vec::new();
				};
				tables
					.table(&relation.target)
					.filter(|(_, a)| {
						a.get(&link.content_type_field) == Some(&Value::String(entity.to_string()))
							&& a.get(&link.object_id_field) == Some(&owner_pk)
					})
					.map(|(p, a)| (p.clone(), a.clone()))
					.collect()
			}
		}
	}

	/// Values reached by following `path` from one row
	fn path_values(
		&self,
		tables: &Tables,
		schema: &EntitySchema,
		pk: &PrimaryKey,
		attrs: &Attrs,
		path: &[String],
	) -> StorageResult<Vec<Value>> {
		let Some((segment, rest)) = path.split_first() else {
			return Ok(vec![pk.to_value()]);
		};
		if segment == "pk" || *segment == schema.pk.attname {
			return if rest.is_empty() {
				Ok(vec![pk.to_value()])
			} else {
				Err(StorageError::UnknownColumn {
					entity: schema.name.clone(),
					column: path.join("__"),
				})
			};
		}
		if let Some(relation) = schema.relation_named(segment) {
			if rest.is_empty() && relation.kind.is_forward_owner() {
				return Ok(vec![attrs.get(segment).cloned().unwrap_or(Value::Null)]);
			}
			let target = self.schema(&relation.target)?;
			let mut values = Vec::new();
			for (related_pk, related_attrs) in self.related(tables, &schema.name, pk, attrs, relation) {
				values.extend(self.path_values(tables, target, &related_pk, &related_attrs, rest)?);
			}
			return Ok(values);
		}
		if schema.scalar_field(segment).is_some() && rest.is_empty() {
			return Ok(vec![attrs.get(segment).cloned().unwrap_or(Value::Null)]);
		}
		Err(StorageError::UnknownColumn {
			entity: schema.name.clone(),
			column: path.join("__"),
		})
	}

	fn matches(
		&self,
		tables: &Tables,
		schema: &EntitySchema,
		pk: &PrimaryKey,
		attrs: &Attrs,
		condition: &Condition,
	) -> StorageResult<bool> {
		let values = self.path_values(tables, schema, pk, attrs, &condition.path)?;
		let all_null = values.iter().all(Value::is_null);
		Ok(match &condition.lookup {
			Lookup::Exact(Value::Null) | Lookup::IsNull(true) => all_null,
			Lookup::IsNull(false) => !all_null,
			Lookup::Exact(expected) => values.iter().any(|v| json_eq(v, expected)),
			Lookup::In(candidates) => values
				.iter()
				.any(|v| candidates.iter().any(|c| json_eq(v, c))),
		})
	}

	/// Primary key for a new row and the entity sequence value it implies
	///
	/// The sequence is left untouched; the caller stores the returned value
	/// once the row is accepted.
	fn next_pk(&self, tables: &Tables, schema: &EntitySchema, attrs: &Attrs) -> StorageResult<(PrimaryKey, i64)> {
		let given = attrs
			.get(&schema.pk.attname)
			.filter(|v| !v.is_null())
			.map(|v| {
				PrimaryKey::from_value(schema.pk.kind, v).ok_or_else(|| StorageError::Backend(format!(
					"invalid primary key {v} for `{}`",
					schema.name
				)))
			})
			.transpose()?;
		let sequence = tables.sequences.get(&schema.name).copied().unwrap_or(0);
		match (given, schema.pk.kind) {
			(Some(PrimaryKey::Int(id)), _) => Ok((PrimaryKey::Int(id), sequence.max(id))),
			(Some(pk), _) => Ok((pk, sequence)),
			(None, PrimaryKeyKind::Integer) => Ok((PrimaryKey::Int(sequence + 1), sequence + 1)),
			(None, PrimaryKeyKind::Uuid) => Ok((PrimaryKey::Uuid(Uuid::new_v4()), sequence)),
			(None, PrimaryKeyKind::Slug) => Err(StorageError::NotNull {
				entity: schema.name.clone(),
				column: schema.pk.attname.clone(),
			}),
		}
	}

	fn collect_delete(
		&self,
		tables: &Tables,
		entity: &str,
		pk: &PrimaryKey,
		plan: &mut DeletePlan,
	) -> StorageResult<()> {
		if plan.deletes.iter().any(|(e, p)| e == entity && p == pk) {
			return Ok(());
		}
		let schema = self.schema(entity)?;
		let attrs = tables.get(entity, pk).cloned().unwrap_or_default();
		plan.deletes.push((entity.to_string(), pk.clone()));

		let pk_value = pk.to_value();
		for (referencing, fk) in self.registry.references_to(entity) {
			let rows: Vec<PrimaryKey> = tables
				.table(&referencing.name)
				.filter(|(_, a)| a.get(&fk.name) == Some(&pk_value))
				.map(|(p, _)| p.clone())
				.collect();
			for row_pk in rows {
				match fk.on_delete {
					CascadeAction::Restrict => {
						let blocked = Row::new(entity, pk.clone(), Attrs::new()).to_string();
						if !plan.blocked.contains(&blocked) {
							plan.blocked.push(blocked);
						}
						plan.referenced_by
							.push(Row::new(&referencing.name, row_pk, Attrs::new()).to_string());
					}
					CascadeAction::SetNull => {
						plan.set_null.push((referencing.name.clone(), row_pk, fk.name.clone()));
					}
					CascadeAction::Cascade => {
						self.collect_delete(tables, &referencing.name, &row_pk, plan)?;
					}
					CascadeAction::NoAction => {}
				}
			}
		}

		for relation in schema.relations.iter().filter(|r| r.kind == RelationKind::Generic) {
			for (tagged_pk, _) in self.related(tables, entity, pk, &attrs, relation) {
				self.collect_delete(tables, &relation.target, &tagged_pk, plan)?;
			}
		}
		Ok(())
	}
}

/// JSON equality that treats numerically equal numbers as equal
///
/// Integers compare exactly; floats only meet integers through `f64`.
fn json_eq(a: &Value, b: &Value) -> bool {
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => {
			if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
				x == y
			} else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
				x == y
			} else if x.is_f64() || y.is_f64() {
				x.as_f64() == y.as_f64()
			} else {
				false
			}
		}
		_ => a == b,
	}
}

impl Persistence for InMemoryStore {
	fn begin(&self) -> StorageResult<()> {
		let mut state = self.state.lock();
		let snapshot = state.tables.clone();
		state.savepoints.push(snapshot);
		state.journal.push(StoreEvent::Begin);
		Ok(())
	}

	fn commit(&self) -> StorageResult<()> {
		let mut state = self.state.lock();
		state
			.savepoints
			.pop()
			.ok_or_else(|| StorageError::Transaction("commit without an active transaction".into()))?;
		state.journal.push(StoreEvent::Commit);
		Ok(())
	}

	fn rollback(&self) -> StorageResult<()> {
		let mut state = self.state.lock();
		let snapshot = state
			.savepoints
			.pop()
			.ok_or_else(|| StorageError::Transaction("rollback without an active transaction".into()))?;
		state.tables = snapshot;
		state.journal.push(StoreEvent::Rollback);
		Ok(())
	}

	fn create(&self, entity: &str, attrs: Attrs) -> StorageResult<Row> {
		let schema = self.schema(entity)?;
		let attrs = self.normalize(schema, attrs)?;
		let mut state = self.state.lock();
		let (pk, sequence) = self.next_pk(&state.tables, schema, &attrs)?;
		if state.tables.get(entity, &pk).is_some() {
			return Err(StorageError::Unique {
				entity: entity.to_string(),
				fields: vec![schema.pk.attname.clone()],
			});
		}

		let mut row = Attrs::new();
		row.insert(schema.pk.attname.clone(), pk.to_value());
		for field in &schema.fields {
			row.insert(field.name.clone(), Value::Null);
		}
		for fk in schema.foreign_keys() {
			row.insert(fk.name.clone(), Value::Null);
		}
		for (column, value) in attrs {
			if column != schema.pk.attname {
				row.insert(column, value);
			}
		}

		self.check_constraints(&state.tables, schema, &pk, &row)?;
		state.tables.sequences.insert(entity.to_string(), sequence);
		state
			.tables
			.rows
			.entry(entity.to_string())
			.or_default()
			.insert(pk.clone(), row.clone());
		state.journal.push(StoreEvent::Created {
			entity: entity.to_string(),
			pk: pk.clone(),
		});
		tracing::trace!(entity, %pk, "row created");
		Ok(Row::new(entity, pk, row))
	}

	fn update(&self, row: &Row, attrs: Attrs) -> StorageResult<Row> {
		let schema = self.schema(&row.entity)?;
		let attrs = self.normalize(schema, attrs)?;
		let mut state = self.state.lock();
		let mut current = state
			.tables
			.get(&row.entity, &row.pk)
			.cloned()
			.ok_or_else(|| StorageError::RowNotFound {
				entity: row.entity.clone(),
				pk: row.pk.to_string(),
			})?;
		for (column, value) in attrs {
			if column != schema.pk.attname {
				current.insert(column, value);
			}
		}
		self.check_constraints(&state.tables, schema, &row.pk, &current)?;
		state
			.tables
			.rows
			.entry(row.entity.clone())
			.or_default()
			.insert(row.pk.clone(), current.clone());
		state.journal.push(StoreEvent::Updated {
			entity: row.entity.clone(),
			pk: row.pk.clone(),
		});
		tracing::trace!(entity = %row.entity, pk = %row.pk, "row updated");
		Ok(Row::new(&row.entity, row.pk.clone(), current))
	}

	fn delete(&self, row: &Row) -> StorageResult<()> {
		let mut state = self.state.lock();
		if state.tables.get(&row.entity, &row.pk).is_none() {
			return Err(StorageError::RowNotFound {
				entity: row.entity.clone(),
				pk: row.pk.to_string(),
			});
		}

		let mut plan = DeletePlan::default();
		self.collect_delete(&state.tables, &row.entity, &row.pk, &mut plan)?;
		if !plan.blocked.is_empty() {
			return Err(StorageError::Protected {
				entity: row.entity.clone(),
				blocked: plan.blocked,
				referenced_by: plan.referenced_by,
			});
		}

		let state = &mut *state;
		for (entity, pk, column) in plan.set_null {
			let deleted = plan.deletes.iter().any(|(e, p)| *e == entity && *p == pk);
			if deleted {
				continue;
			}
			if let Some(attrs) = state.tables.rows.get_mut(&entity).and_then(|t| t.get_mut(&pk)) {
				attrs.insert(column, Value::Null);
				state.journal.push(StoreEvent::Updated { entity, pk });
			}
		}
		for (entity, pk) in plan.deletes {
			if let Some(table) = state.tables.rows.get_mut(&entity) {
				table.shift_remove(&pk);
			}
			tracing::trace!(entity = %entity, pk = %pk, "row deleted");
			state.journal.push(StoreEvent::Deleted { entity, pk });
		}
		Ok(())
	}

	fn find_by_pk(&self, entity: &str, pk: &PrimaryKey, for_update: bool) -> StorageResult<Option<Row>> {
		self.schema(entity)?;
		let mut state = self.state.lock();
		let row = state
			.tables
			.get(entity, pk)
			.map(|attrs| Row::new(entity, pk.clone(), attrs.clone()));
		if for_update && row.is_some() {
			state.journal.push(StoreEvent::Locked {
				entity: entity.to_string(),
				pk: pk.clone(),
			});
		}
		Ok(row)
	}

	fn find_by_filter(&self, entity: &str, filter: &Filter) -> StorageResult<Vec<Row>> {
		let schema = self.schema(entity)?;
		let mut state = self.state.lock();
		let mut rows = Vec::new();
		for (pk, attrs) in state.tables.table(entity) {
			if filter.exclude.contains(pk) {
				continue;
			}
			let mut keep = true;
			for condition in &filter.conditions {
				if !self.matches(&state.tables, schema, pk, attrs, condition)? {
					keep = false;
					break;
				}
			}
			if keep {
				rows.push(Row::new(entity, pk.clone(), attrs.clone()));
				if filter.limit.is_some_and(|limit| rows.len() >= limit) {
					break;
				}
			}
		}
		if filter.for_update {
			for row in &rows {
				state.journal.push(StoreEvent::Locked {
					entity: entity.to_string(),
					pk: row.pk.clone(),
				});
			}
		}
		Ok(rows)
	}
}
