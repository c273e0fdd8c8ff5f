//! Shared models and serializers for the integration tests
#![allow(dead_code)]

use reinhardt_writable_nested::backend::{Attrs, Filter, Persistence, Row};
use reinhardt_writable_nested::schema::{
	CascadeAction, EntitySchema, PrimaryKeyKind, RelationDecl, SchemaRegistry,
};
use reinhardt_writable_nested::{
	FieldDescriptor, FieldType, InMemoryStore, NestedSerializer, NestedWriteSettings, NestedWriter,
	ObjectValidator, WritePlan,
};
use serde_json::{Value, json};
use std::sync::Arc;

/// Blog-style models: users with a profile, avatars, sites, access keys,
/// messages, tagged items, teams and slug-keyed records
pub fn registry() -> Arc<SchemaRegistry> {
	let registry = SchemaRegistry::builder()
		.entity(EntitySchema::new("site").scalar("url"))
		.entity(EntitySchema::new("access_key").scalar("key"))
		.entity(
			EntitySchema::new("user").scalar("username").relation(
				RelationDecl::foreign_key("user_avatar", "avatar")
					.null(true)
					.on_delete(CascadeAction::Restrict),
			),
		)
		.entity(
			EntitySchema::new("profile")
				.relation(RelationDecl::many_to_many("sites", "site"))
				.relation(RelationDecl::one_to_one("user", "user").related_name("profile"))
				.relation(
					RelationDecl::foreign_key("access_key", "access_key")
						.null(true)
						.on_delete(CascadeAction::SetNull),
				),
		)
		.entity(
			EntitySchema::new("avatar")
				.scalar("image")
				.relation(RelationDecl::foreign_key("profile", "profile").related_name("avatars")),
		)
		.entity(
			EntitySchema::new("message")
				.primary_key("id", PrimaryKeyKind::Uuid)
				.scalar("message")
				.relation(RelationDecl::foreign_key("profile", "profile")),
		)
		.entity(
			EntitySchema::new("tag")
				.scalar("tag")
				.scalar("content_type")
				.scalar("object_id"),
		)
		.entity(
			EntitySchema::new("tagged_item")
				.relation(RelationDecl::generic("tags", "tag", "content_type", "object_id")),
		)
		.entity(
			EntitySchema::new("team")
				.scalar("name")
				.relation(RelationDecl::many_to_many("members", "user")),
		)
		.entity(
			EntitySchema::new("custom_pk")
				.primary_key("slug", PrimaryKeyKind::Slug)
				.relation(RelationDecl::foreign_key("user", "user").related_name("custompks")),
		)
		.build()
		.expect("test registry is valid");
	Arc::new(registry)
}

pub struct World {
	pub store: Arc<InMemoryStore>,
	pub writer: NestedWriter,
}

impl World {
	pub fn plan(&self, serializer: NestedSerializer) -> Arc<WritePlan> {
		self.writer
			.plan(Arc::new(serializer))
			.expect("serializer matches the test models")
	}

	/// Inserts a row directly, bypassing the writer
	pub fn insert(&self, entity: &str, values: Value) -> Row {
		self.store
			.create(entity, attrs(values))
			.expect("direct insert succeeds")
	}

	pub fn reload(&self, row: &Row) -> Row {
		self.store
			.get(&row.entity, &row.pk)
			.expect("row still exists")
	}

	/// Rows of `entity` whose `column` equals `value`
	pub fn filter(&self, entity: &str, column: &str, value: Value) -> Vec<Row> {
		self.store
			.find_by_filter(entity, &Filter::new().exact(column, value))
			.expect("filter succeeds")
	}

	pub fn profile_of(&self, user: &Row) -> Row {
		self.filter("profile", "user", user.pk.to_value())
			.into_iter()
			.next()
			.expect("user has a profile")
	}

	/// Targets linked to `profile` through the `sites` join entity
	pub fn sites_of(&self, profile: &Row) -> Vec<Row> {
		self.filter("profile_sites", "profile", profile.pk.to_value())
			.iter()
			.filter_map(|link| link.get("site"))
			.filter_map(|pk| {
				self.filter("site", "pk", pk.clone())
					.into_iter()
					.next()
			})
			.collect()
	}

	pub fn strings(rows: &[Row], column: &str) -> Vec<String> {
		rows.iter()
			.filter_map(|row| row.get_str(column).map(str::to_string))
			.collect()
	}
}

pub fn world() -> World {
	world_with(NestedWriteSettings::default())
}

pub fn world_with(settings: NestedWriteSettings) -> World {
	let registry = registry();
	let store = Arc::new(InMemoryStore::new(registry.clone()));
	let writer = NestedWriter::new(registry, store.clone()).with_settings(settings);
	World { store, writer }
}

pub fn attrs(values: Value) -> Attrs {
	match values {
		Value::Object(map) => map,
		other => panic!("expected an object, got {other}"),
	}
}

fn pk() -> FieldDescriptor {
	FieldDescriptor::new("pk").read_only(true)
}

fn text(name: &str) -> FieldDescriptor {
	FieldDescriptor::new(name).field_type(FieldType::String { max_length: Some(100) })
}

pub fn avatar_serializer() -> NestedSerializer {
	NestedSerializer::new("avatar").field(pk()).field(text("image"))
}

pub fn site_serializer() -> NestedSerializer {
	NestedSerializer::new("site").field(pk()).field(text("url"))
}

pub fn access_key_serializer() -> NestedSerializer {
	NestedSerializer::new("access_key").field(pk()).field(text("key"))
}

pub fn message_serializer() -> NestedSerializer {
	NestedSerializer::new("message").field(pk()).field(text("message"))
}

pub fn profile_serializer() -> NestedSerializer {
	NestedSerializer::new("profile")
		.field(pk())
		.field(FieldDescriptor::nested_many("sites", Arc::new(site_serializer())))
		.field(FieldDescriptor::nested_many("avatars", Arc::new(avatar_serializer())))
		.field(FieldDescriptor::nested("access_key", Arc::new(access_key_serializer())).allow_null(true))
		.field(FieldDescriptor::nested_many("message_set", Arc::new(message_serializer())).optional())
}

pub fn user_serializer() -> NestedSerializer {
	NestedSerializer::new("user")
		.field(pk())
		.field(
			FieldDescriptor::nested("profile", Arc::new(profile_serializer()))
				.optional()
				.allow_null(true),
		)
		.field(text("username"))
}

/// User serializer with an extra non-model field its validator strips
pub fn custom_serializer() -> NestedSerializer {
	user_serializer()
		.field(text("custom_field"))
		.validate_with(ObjectValidator::new(|attrs| {
			attrs.remove("custom_field");
			Ok(())
		}))
}

pub fn tagged_item_serializer() -> NestedSerializer {
	let tag = NestedSerializer::new("tag")
		.field(pk())
		.field(FieldDescriptor::new("tag").field_type(FieldType::Slug));
	NestedSerializer::new("tagged_item").field(FieldDescriptor::nested_many("tags", Arc::new(tag)))
}

pub fn team_serializer() -> NestedSerializer {
	NestedSerializer::new("team")
		.field(FieldDescriptor::nested_many("members", Arc::new(user_serializer())).optional())
		.field(text("name"))
}

pub fn user_with_custom_pk_serializer() -> NestedSerializer {
	let custom_pk =
		NestedSerializer::new("custom_pk").field(FieldDescriptor::new("slug").field_type(FieldType::Slug));
	NestedSerializer::new("user")
		.field(FieldDescriptor::nested_many("custompks", Arc::new(custom_pk)))
		.field(text("username"))
}

pub fn initial_data() -> Value {
	json!({
		"username": "test",
		"profile": {
			"access_key": {"key": "key"},
			"sites": [
				{"url": "http://google.com"},
				{"url": "http://yahoo.com"},
			],
			"avatars": [
				{"image": "image-1.png"},
				{"image": "image-2.png"},
			],
		},
	})
}
