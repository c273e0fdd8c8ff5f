//! Transactional envelope
//!
//! [`atomic`] runs a closure inside one storage transaction, committing when
//! it returns `Ok` and rolling back otherwise. [`TransactionScope`] is the
//! guard underneath: dropping it without a commit rolls the transaction back.

use crate::backend::Persistence;
use crate::errors::{NestedResult, NestedWriteError};

/// Transaction guard with automatic rollback on drop
///
/// # Examples
///
/// ```
/// use reinhardt_writable_nested::backend::{Attrs, Persistence};
/// use reinhardt_writable_nested::memory::InMemoryStore;
/// use reinhardt_writable_nested::schema::{EntitySchema, SchemaRegistry};
/// use reinhardt_writable_nested::transaction::TransactionScope;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let registry = SchemaRegistry::builder()
/// 	.entity(EntitySchema::new("site").scalar("url"))
/// 	.build()
/// 	.unwrap();
/// let store = InMemoryStore::new(Arc::new(registry));
///
/// {
/// 	let _tx = TransactionScope::begin(&store).unwrap();
/// 	let mut attrs = Attrs::new();
/// 	attrs.insert("url".into(), json!("http://dropped.com"));
/// 	store.create("site", attrs).unwrap();
/// 	// No commit: rolled back here
/// }
/// assert_eq!(store.count("site"), 0);
/// ```
pub struct TransactionScope<'a> {
	store: &'a dyn Persistence,
	finished: bool,
}

impl<'a> TransactionScope<'a> {
	pub fn begin(store: &'a dyn Persistence) -> NestedResult<Self> {
		store
			.begin()
			.map_err(|e| NestedWriteError::Persistence(e.to_string()))?;
		Ok(Self {
			store,
			finished: false,
		})
	}

	pub fn commit(mut self) -> NestedResult<()> {
		self.finished = true;
		self.store
			.commit()
			.map_err(|e| NestedWriteError::Persistence(e.to_string()))
	}

	pub fn rollback(mut self) -> NestedResult<()> {
		self.finished = true;
		self.store
			.rollback()
			.map_err(|e| NestedWriteError::Persistence(e.to_string()))
	}
}

impl Drop for TransactionScope<'_> {
	fn drop(&mut self) {
		if !self.finished {
			tracing::warn!("TransactionScope dropped without explicit commit/rollback, rolling back");
			if let Err(e) = self.store.rollback() {
				tracing::error!(error = %e, "automatic rollback failed");
			}
		}
	}
}

/// Runs `f` inside a transaction
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`. A failed
/// rollback is logged and the original error is returned.
pub fn atomic<T, F>(store: &dyn Persistence, f: F) -> NestedResult<T>
where
	F: FnOnce() -> NestedResult<T>,
{
	let tx = TransactionScope::begin(store)?;
	match f() {
		Ok(value) => {
			tx.commit()?;
			Ok(value)
		}
		Err(err) => {
			if let Err(rollback_err) = tx.rollback() {
				tracing::error!(error = %rollback_err, "rollback after failed save failed");
			}
			Err(err)
		}
	}
}
