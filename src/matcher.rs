//! Related-entity matching
//!
//! Decides, for each fragment of a relation, whether it describes a row that
//! already exists. Identity is resolved in a fixed order and the first hit
//! wins:
//!
//! 1. a primary key under `pk`, the entity's primary key attribute or `id`;
//! 2. a locator string under the configured locator field;
//! 3. the serializer's [`MatchCriteria`].
//!
//! All primary keys of one batch are fetched with a single `pk IN (...)`
//! query. The matcher never writes; the only side effect it may request is a
//! row lock when lock-on-match is enabled.

use crate::backend::{Filter, Persistence, PrimaryKey, Row};
use crate::classifier::{FieldRole, PlannedField, WritePlan};
use crate::errors::{NestedResult, NestedWriteError};
use crate::locator::LocatorResolver;
use crate::serializer::{MatchCriteria, WritePolicy};
use crate::settings::NestedWriteSettings;
use serde_json::Value;
use std::collections::HashMap;

/// Result of matching one fragment
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
	/// The fragment describes this row
	Existing(Row),
	/// No row matched; the fragment is created
	New,
	/// No row matched and the write policy requires one
	Missing,
}

impl MatchOutcome {
	pub fn row(&self) -> Option<&Row> {
		match self {
			MatchOutcome::Existing(row) => Some(row),
			_ => None,
		}
	}
}

/// Primary key carried by a fragment, if any
pub fn fragment_pk(plan: &WritePlan, fragment: &Value) -> Option<PrimaryKey> {
	let pk = &plan.schema.pk;
	["pk", pk.attname.as_str(), "id"]
		.into_iter()
		.filter_map(|key| fragment.get(key))
		.find(|value| !value.is_null() && value.as_str() != Some(""))
		.and_then(|value| PrimaryKey::from_value(pk.kind, value))
}

/// Read-only identity resolution against storage
pub struct Matcher<'a> {
	store: &'a dyn Persistence,
	locator: Option<&'a dyn LocatorResolver>,
	settings: &'a NestedWriteSettings,
}

impl<'a> Matcher<'a> {
	pub fn new(
		store: &'a dyn Persistence,
		locator: Option<&'a dyn LocatorResolver>,
		settings: &'a NestedWriteSettings,
	) -> Self {
		Self {
			store,
			locator,
			settings,
		}
	}

	fn lock(&self, plan: &WritePlan) -> bool {
		plan.serializer
			.lock_on_match
			.unwrap_or(self.settings.lock_on_match)
	}

	/// Matches a single fragment
	pub fn match_one(&self, plan: &WritePlan, fragment: &Value) -> NestedResult<MatchOutcome> {
		Ok(self
			.match_many(&[(plan, fragment)])?
			.into_iter()
			.next()
			.unwrap_or(MatchOutcome::New))
	}

	/// Matches the fragments of one relation, one outcome per fragment
	pub fn match_many(&self, items: &[(&WritePlan, &Value)]) -> NestedResult<Vec<MatchOutcome>> {
		let mut outcomes: Vec<Option<MatchOutcome>> = vec![None; items.len()];

		// Primary keys, batched per entity
		let mut by_entity: HashMap<&str, Vec<(usize, PrimaryKey)>> = HashMap::new();
		for (index, (plan, fragment)) in items.iter().enumerate() {
			if plan.serializer.write_policy == WritePolicy::CreateOnly {
				outcomes[index] = Some(MatchOutcome::New);
				continue;
			}
			if let Some(pk) = fragment_pk(plan, fragment) {
				by_entity.entry(plan.entity()).or_default().push((index, pk));
			}
		}
		for (entity, wanted) in by_entity {
			let pks: Vec<PrimaryKey> = wanted.iter().map(|(_, pk)| pk.clone()).collect();
			let lock = wanted.iter().any(|(i, _)| self.lock(items[*i].0));
			let rows = self
				.store
				.find_by_filter(entity, &Filter::new().pk_in(&pks).for_update(lock))
				.map_err(|e| NestedWriteError::Persistence(e.to_string()))?;
			tracing::trace!(entity, requested = pks.len(), found = rows.len(), "batched primary key match");
			for (index, pk) in wanted {
				if let Some(row) = rows.iter().find(|row| row.pk == pk) {
					outcomes[index] = Some(MatchOutcome::Existing(row.clone()));
				}
			}
		}

		// Locators and match criteria, per fragment
		for (index, (plan, fragment)) in items.iter().enumerate() {
			if outcomes[index].is_some() {
				continue;
			}
			let found = match self.match_locator(plan, fragment)? {
				Some(row) => Some(row),
				None => self.match_criteria(plan, fragment)?,
			};
			outcomes[index] = Some(match found {
				Some(row) => MatchOutcome::Existing(row),
				None if plan.serializer.write_policy == WritePolicy::GetOnly => MatchOutcome::Missing,
				None => MatchOutcome::New,
			});
		}

		Ok(outcomes
			.into_iter()
			.map(|outcome| outcome.unwrap_or(MatchOutcome::New))
			.collect())
	}

	fn match_locator(&self, plan: &WritePlan, fragment: &Value) -> NestedResult<Option<Row>> {
		let Some(resolver) = self.locator else {
			return Ok(None);
		};
		let Some(raw) = fragment
			.get(&self.settings.locator_field)
			.and_then(Value::as_str)
		else {
			return Ok(None);
		};
		let Some(locator) = resolver.resolve(plan.entity(), raw) else {
			tracing::debug!(entity = plan.entity(), locator = raw, "unresolvable locator");
			return Ok(None);
		};

		let lock = self.lock(plan);
		if locator.field == "pk" || locator.field == plan.schema.pk.attname {
			let Some(pk) = PrimaryKey::from_value(plan.schema.pk.kind, &locator.value) else {
				return Ok(None);
			};
			return self
				.store
				.find_by_pk(plan.entity(), &pk, lock)
				.map_err(|e| NestedWriteError::Persistence(e.to_string()));
		}
		let filter = Filter::new()
			.exact(&locator.field, locator.value)
			.for_update(lock);
		self.single(plan, filter)
	}

	fn match_criteria(&self, plan: &WritePlan, fragment: &Value) -> NestedResult<Option<Row>> {
		if plan.serializer.match_criteria == MatchCriteria::PrimaryKey {
			return Ok(None);
		}
		let filter = criteria_filter(plan, fragment, "", Filter::new());
		if filter.conditions.is_empty() {
			return Ok(None);
		}
		self.single(plan, filter.for_update(self.lock(plan)))
	}

	fn single(&self, plan: &WritePlan, filter: Filter) -> NestedResult<Option<Row>> {
		let mut rows = self
			.store
			.find_by_filter(plan.entity(), &filter)
			.map_err(|e| NestedWriteError::Persistence(e.to_string()))?;
		if rows.len() > 1 {
			return Err(NestedWriteError::AmbiguousMatch {
				entity: plan.entity().to_string(),
				criteria: filter.to_string(),
				count: rows.len(),
			});
		}
		Ok(rows.pop())
	}
}

/// Fields consulted by a plan's match criteria
fn criteria_fields<'p>(plan: &'p WritePlan) -> Vec<&'p PlannedField> {
	match &plan.serializer.match_criteria {
		MatchCriteria::PrimaryKey => Vec::new(),
		MatchCriteria::Fields(names) => names.iter().filter_map(|name| plan.field(name)).collect(),
		MatchCriteria::AllFields => plan
			.fields
			.iter()
			.filter(|f| f.role != FieldRole::ReadOnly)
			.collect(),
	}
}

/// Adds the lookups of `plan`'s criteria for `fragment` under `prefix`
fn criteria_filter(plan: &WritePlan, fragment: &Value, prefix: &str, mut filter: Filter) -> Filter {
	if plan.serializer.match_criteria == MatchCriteria::PrimaryKey {
		if let Some(pk) = fragment_pk(plan, fragment) {
			filter = filter.exact(&format!("{prefix}pk"), pk.to_value());
		}
		return filter;
	}

	for field in criteria_fields(plan) {
		let Some(value) = fragment.get(field.name()) else {
			continue;
		};
		let column = field
			.role
			.relation()
			.map_or(field.descriptor.source(), |meta| meta.name.as_str());
		let path = format!("{prefix}{column}");
		match (&field.child, value) {
			(None, value) => filter = filter.exact(&path, value.clone()),
			(Some(_), Value::Null) => filter = filter.is_null(&path, true),
			(Some(child), Value::Array(items)) => {
				filter = many_criteria(child.plans(), items, &path, filter);
			}
			(Some(child), item) => {
				if let Some(child_plan) = child.resolve(item) {
					filter = criteria_filter(child_plan, item, &format!("{path}__"), filter);
				}
			}
		}
	}
	filter
}

/// `path__field IN (...)` lookups for a to-many nested criterion
fn many_criteria(
	plans: Vec<&std::sync::Arc<WritePlan>>,
	items: &[Value],
	path: &str,
	mut filter: Filter,
) -> Filter {
	let Some(plan) = plans.first() else {
		return filter;
	};
	if plan.serializer.match_criteria == MatchCriteria::PrimaryKey {
		let pks: Vec<Value> = items
			.iter()
			.filter_map(|item| fragment_pk(plan, item))
			.map(|pk| pk.to_value())
			.collect();
		if !pks.is_empty() {
			filter = filter.is_in(&format!("{path}__pk"), pks);
		}
		return filter;
	}
	for field in criteria_fields(plan) {
		if field.child.is_some() {
			continue;
		}
		let values: Vec<Value> = items
			.iter()
			.filter_map(|item| item.get(field.name()).cloned())
			.collect();
		if !values.is_empty() {
			filter = filter.is_in(&format!("{path}__{}", field.descriptor.source()), values);
		}
	}
	filter
}
