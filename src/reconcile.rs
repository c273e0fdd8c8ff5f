//! Reconciliation of reverse relations
//!
//! After the reverse relations of an existing owner have been written, rows
//! still linked to the owner but absent from the payload are disposed of
//! according to each field's [`DeletePolicy`]. Relations are swept in the
//! reverse of their write order.

use crate::backend::{Attrs, Filter, Persistence, PrimaryKey, Row, StorageError};
use crate::classifier::PlannedField;
use crate::errors::{NestedResult, NestedWriteError, SchemaMismatchError};
use crate::schema::{RelationKind, RelationMeta, RelationalMetadata};
use crate::serializer::DeletePolicy;
use crate::settings::NestedWriteSettings;
use serde_json::Value;

/// Rows of one reverse field that survived the write
#[derive(Debug, Clone)]
pub struct SweepTarget<'a> {
	pub field: &'a PlannedField,
	/// Primary keys present in the payload after resolution
	pub payload: Vec<PrimaryKey>,
}

fn storage(err: StorageError) -> NestedWriteError {
	NestedWriteError::Persistence(err.to_string())
}

fn relation_of<'a>(field: &'a PlannedField) -> NestedResult<&'a RelationMeta> {
	field.role.relation().ok_or_else(|| {
		SchemaMismatchError::new(
			"",
			field.name(),
			"only relation fields can be reconciled",
		)
		.into()
	})
}

/// Rows currently linked to `owner` through the reverse relation `meta`
pub fn linked_rows(
	store: &dyn Persistence,
	metadata: &dyn RelationalMetadata,
	owner: &Row,
	meta: &RelationMeta,
) -> NestedResult<Vec<Row>> {
	let owner_pk = owner.pk.to_value();
	let filter = match meta.kind {
		RelationKind::ManyToManyForward | RelationKind::ManyToManyReverse => {
			let pks = linked_through(store, metadata, owner, meta)?;
			if pks.is_empty() {
				return Ok(Vec::new());
			}
			Filter::new().pk_in(&pks)
		}
		RelationKind::Generic => {
			let link = meta.generic.as_ref().ok_or_else(|| {
				NestedWriteError::from(SchemaMismatchError::new(
					&meta.entity,
					&meta.name,
					"generic relation without content type columns",
				))
			})?;
			Filter::new()
				.exact(&link.content_type_field, Value::String(owner.entity.clone()))
				.exact(&link.object_id_field, owner_pk)
		}
		_ => {
			let remote = meta.back_reference().ok_or_else(|| {
				NestedWriteError::from(SchemaMismatchError::new(
					&meta.entity,
					&meta.name,
					"reverse relation without a back reference",
				))
			})?;
			Filter::new().exact(remote, owner_pk)
		}
	};
	store.find_by_filter(&meta.target, &filter).map_err(storage)
}

fn linked_through(
	store: &dyn Persistence,
	metadata: &dyn RelationalMetadata,
	owner: &Row,
	meta: &RelationMeta,
) -> NestedResult<Vec<PrimaryKey>> {
	let through = meta.through.as_ref().ok_or_else(|| {
		NestedWriteError::from(SchemaMismatchError::new(
			&meta.entity,
			&meta.name,
			"many-to-many relation without a join entity",
		))
	})?;
	if metadata.through_entity(meta).is_none() {
		return Err(SchemaMismatchError::new(
			&meta.entity,
			&meta.name,
			format!("join entity `{}` is not registered", through.entity),
		)
		.into());
	}
	let kind = metadata
		.entity(&meta.target)
		.map(|schema| schema.pk.kind)
		.unwrap_or_default();
	let links = store
		.find_by_filter(
			&through.entity,
			&Filter::new().exact(&through.source_column, owner.pk.to_value()),
		)
		.map_err(storage)?;
	Ok(links
		.iter()
		.filter_map(|link| link.get(&through.target_column))
		.filter_map(|value| PrimaryKey::from_value(kind, value))
		.collect())
}

/// Disposes of rows no longer present in the payload of each target
pub fn sweep(
	store: &dyn Persistence,
	metadata: &dyn RelationalMetadata,
	settings: &NestedWriteSettings,
	owner: &Row,
	targets: &[SweepTarget<'_>],
) -> NestedResult<()> {
	for target in targets.iter().rev() {
		let meta = relation_of(target.field)?;
		let policy = target
			.field
			.descriptor
			.delete_policy
			.unwrap_or_else(|| settings.default_policy(meta.kind));
		if policy == DeletePolicy::Retain {
			continue;
		}
		let stale: Vec<Row> = linked_rows(store, metadata, owner, meta)?
			.into_iter()
			.filter(|row| !target.payload.contains(&row.pk))
			.collect();
		if stale.is_empty() {
			continue;
		}
		tracing::debug!(
			entity = %owner.entity,
			field = target.field.name(),
			?policy,
			count = stale.len(),
			"sweeping rows missing from payload"
		);
		dispose(store, meta, policy, owner, &stale)?;
	}
	Ok(())
}

fn dispose(
	store: &dyn Persistence,
	meta: &RelationMeta,
	policy: DeletePolicy,
	owner: &Row,
	stale: &[Row],
) -> NestedResult<()> {
	if meta.kind.is_many_to_many() {
		let through = meta.through.as_ref().ok_or_else(|| {
			NestedWriteError::from(SchemaMismatchError::new(
				&meta.entity,
				&meta.name,
				"many-to-many relation without a join entity",
			))
		})?;
		if policy != DeletePolicy::Delete {
			let pks: Vec<PrimaryKey> = stale.iter().map(|row| row.pk.clone()).collect();
			store.disassociate(through, owner, &pks).map_err(storage)?;
		}
		return match policy {
			DeletePolicy::Delete | DeletePolicy::DisassociateAndDelete => delete_rows(store, meta, stale),
			_ => Ok(()),
		};
	}
	match policy {
		DeletePolicy::Unlink | DeletePolicy::Disassociate => unlink_rows(store, meta, stale),
		_ => delete_rows(store, meta, stale),
	}
}

fn delete_rows(store: &dyn Persistence, meta: &RelationMeta, rows: &[Row]) -> NestedResult<()> {
	let mut blocked = Vec::new();
	for row in rows {
		match store.delete(row) {
			Ok(()) => {}
			Err(StorageError::Protected { blocked: names, .. }) => blocked.extend(names),
			Err(err) => return Err(storage(err)),
		}
	}
	if blocked.is_empty() {
		Ok(())
	} else {
		tracing::debug!(entity = %meta.target, ?blocked, "delete blocked by protected references");
		Err(NestedWriteError::ProtectedDelete {
			entity: meta.target.clone(),
			instances: blocked,
		})
	}
}

fn unlink_rows(store: &dyn Persistence, meta: &RelationMeta, rows: &[Row]) -> NestedResult<()> {
	let columns: Vec<&str> = match (&meta.generic, meta.back_reference()) {
		(Some(link), _) => vec![
			link.content_type_field.as_str(),
			link.object_id_field.as_str(),
		],
		(None, Some(remote)) => vec![remote],
		(None, None) => Vec::new(),
	};
	let field = columns.last().copied().unwrap_or(meta.name.as_str()).to_string();
	let refused = |rows: &[Row]| NestedWriteError::NonNullableUnlink {
		entity: meta.target.clone(),
		field: field.clone(),
		instances: rows.iter().map(Row::to_string).collect(),
	};
	if meta.generic.is_none() && !meta.nullable {
		return Err(refused(rows));
	}
	let attrs: Attrs = columns
		.iter()
		.map(|column| (column.to_string(), Value::Null))
		.collect();
	for row in rows {
		match store.update(row, attrs.clone()) {
			Ok(_) => {}
			Err(StorageError::NotNull { .. }) => return Err(refused(std::slice::from_ref(row))),
			Err(err) => return Err(storage(err)),
		}
	}
	Ok(())
}
