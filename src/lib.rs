//! # Reinhardt Writable Nested
//!
//! Deep writes for nested serializers: one JSON payload describing a root row
//! and its related rows (one-to-one, many-to-one, one-to-many, many-to-many
//! and generic relations) is persisted as a single transactional graph write.
//!
//! ## Overview
//!
//! - [`classifier`] splits serializer fields into local fields, direct
//!   relations (the row owns the foreign key) and reverse relations.
//! - [`matcher`] decides whether a fragment describes an existing row, by
//!   primary key, locator URL or match criteria.
//! - [`writer`] drives the save: direct relations first, then the owner, then
//!   reverse relations, all inside one transaction.
//! - [`reconcile`] disposes of related rows that are missing from an update.
//! - [`errors`] shapes failures into an [`ErrorTree`] that mirrors the payload.
//!
//! Storage and relational metadata are consumed through the [`Persistence`]
//! and [`RelationalMetadata`] traits; [`InMemoryStore`] and [`SchemaRegistry`]
//! are the shipped implementations.
//!
//! ## Quick Example
//!
//! ```
//! use reinhardt_writable_nested::{
//! 	FieldDescriptor, InMemoryStore, NestedSerializer, NestedWriter, SaveOptions,
//! };
//! use reinhardt_writable_nested::schema::{EntitySchema, RelationDecl, SchemaRegistry};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(
//! 	SchemaRegistry::builder()
//! 		.entity(EntitySchema::new("user").scalar("username"))
//! 		.entity(
//! 			EntitySchema::new("profile")
//! 				.scalar("bio")
//! 				.relation(RelationDecl::one_to_one("user", "user").related_name("profile")),
//! 		)
//! 		.build()
//! 		.unwrap(),
//! );
//! let store = Arc::new(InMemoryStore::new(registry.clone()));
//! let writer = NestedWriter::new(registry, store.clone());
//!
//! let profile = Arc::new(NestedSerializer::new("profile").field(FieldDescriptor::new("bio")));
//! let user = NestedSerializer::new("user")
//! 	.field(FieldDescriptor::new("username"))
//! 	.field(FieldDescriptor::nested("profile", profile).optional().allow_null(true));
//! let plan = writer.plan(Arc::new(user)).unwrap();
//!
//! let data = json!({"username": "alice", "profile": {"bio": "hello"}});
//! let user = writer.save(&plan, None, &data, &SaveOptions::new()).unwrap();
//!
//! assert_eq!(store.count("profile"), 1);
//! assert_eq!(store.all("profile")[0].get("user"), Some(&user.pk.to_value()));
//! ```

pub mod backend;
pub mod classifier;
pub mod errors;
pub mod locator;
pub mod matcher;
pub mod memory;
pub mod reconcile;
pub mod save_kwargs;
pub mod schema;
pub mod serializer;
pub mod settings;
pub mod transaction;
pub mod validation;
pub mod writer;

pub use backend::{Attrs, Filter, Persistence, PrimaryKey, Row, StorageError, StorageResult};
pub use classifier::{FieldRole, WritePlan, classify};
pub use errors::{ErrorTree, NON_FIELD_ERRORS, NestedResult, NestedWriteError, SchemaMismatchError};
pub use locator::{Locator, LocatorResolver, RouteLocator};
pub use matcher::{MatchOutcome, Matcher};
pub use memory::InMemoryStore;
pub use save_kwargs::SaveKwargs;
pub use schema::{
	CascadeAction, EntitySchema, PrimaryKeyKind, RelationDecl, RelationKind, RelationMeta,
	RelationalMetadata, SchemaRegistry,
};
pub use serializer::{
	DeletePolicy, FieldDescriptor, FieldType, MatchCriteria, NestedSerializer, ObjectValidator,
	PolymorphicSerializer, ValueCheck, WritePolicy,
};
pub use settings::{NestedWriteSettings, SettingsError};
pub use transaction::{TransactionScope, atomic};
pub use validation::{DefaultFieldValidator, FieldValidator};
pub use writer::{NestedSaveContext, NestedWriter, SaveOptions, SaveState};
