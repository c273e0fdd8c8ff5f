//! End-to-end saves through the full user/profile model graph

mod common;

use common::{World, world, world_with};
use reinhardt_writable_nested::{
	DeletePolicy, NestedWriteError, NestedWriteSettings, Persistence, Row, SaveKwargs, SaveOptions,
};
use rstest::{fixture, rstest};
use serde_json::json;

#[fixture]
fn w() -> World {
	world()
}

fn create_user(w: &World) -> Row {
	let plan = w.plan(common::user_serializer());
	w.writer
		.save(&plan, None, &common::initial_data(), &SaveOptions::new())
		.unwrap()
}

#[rstest]
fn test_create(w: World) {
	let user = create_user(&w);
	assert_eq!(user.get_str("username"), Some("test"));

	let profile = w.profile_of(&user);
	let access_key = w.filter("access_key", "pk", profile.get("access_key").cloned().unwrap());
	assert_eq!(World::strings(&access_key, "key"), vec!["key"]);

	let mut urls = World::strings(&w.sites_of(&profile), "url");
	urls.sort();
	assert_eq!(urls, vec!["http://google.com", "http://yahoo.com"]);

	let avatars = w.filter("avatar", "profile", profile.pk.to_value());
	assert_eq!(World::strings(&avatars, "image"), vec!["image-1.png", "image-2.png"]);

	assert_eq!(w.store.count("user"), 1);
	assert_eq!(w.store.count("profile"), 1);
	assert_eq!(w.store.count("site"), 2);
	assert_eq!(w.store.count("avatar"), 2);
	assert_eq!(w.store.count("access_key"), 1);
}

#[rstest]
#[case(json!({"username": "test"}))]
#[case(json!({"username": "test", "profile": null}))]
fn test_create_without_reverse_one_to_one(w: World, #[case] data: serde_json::Value) {
	let plan = w.plan(common::user_serializer());
	let user = w.writer.save(&plan, None, &data, &SaveOptions::new()).unwrap();
	assert!(w.filter("profile", "user", user.pk.to_value()).is_empty());
}

#[rstest]
fn test_create_with_custom_field(w: World) {
	let plan = w.plan(common::custom_serializer());
	let mut data = common::initial_data();
	data["custom_field"] = json!("custom value");
	let user = w.writer.save(&plan, None, &data, &SaveOptions::new()).unwrap();
	assert!(user.get("custom_field").is_none());
	assert_eq!(w.store.count("profile"), 1);
}

#[rstest]
fn test_create_with_generic_relation(w: World) {
	let plan = w.plan(common::tagged_item_serializer());
	let item = w
		.writer
		.save(
			&plan,
			None,
			&json!({"tags": [{"tag": "the_first_tag"}, {"tag": "the_next_tag"}]}),
			&SaveOptions::new(),
		)
		.unwrap();
	let tags = w.filter("tag", "object_id", item.pk.to_value());
	assert_eq!(w.store.count("tag"), 2);
	assert_eq!(World::strings(&tags, "tag"), vec!["the_first_tag", "the_next_tag"]);
	assert!(tags.iter().all(|tag| tag.get_str("content_type") == Some("tagged_item")));
}

#[rstest]
fn test_update(w: World) {
	let user = create_user(&w);
	let profile = w.profile_of(&user);
	let first_avatar = w.filter("avatar", "profile", profile.pk.to_value())[0].clone();

	let plan = w.plan(common::user_serializer());
	let data = json!({
		"pk": user.pk.to_value(),
		"username": "new",
		"profile": {
			"pk": profile.pk.to_value(),
			"access_key": null,
			"sites": [{"url": "http://new-site.com"}],
			"avatars": [
				{"pk": first_avatar.pk.to_value(), "image": "old-image-1.png"},
				{"image": "new-image-1.png"},
				{"image": "new-image-2.png"},
			],
		},
	});
	let updated = w.writer.update(&plan, &user, &data, &SaveOptions::new()).unwrap();
	assert_eq!(updated.pk, user.pk);
	assert_eq!(updated.get_str("username"), Some("new"));

	let profile_after = w.profile_of(&updated);
	assert_eq!(profile_after.pk, profile.pk);
	assert_eq!(profile_after.get("access_key"), Some(&json!(null)));
	assert_eq!(
		World::strings(&w.sites_of(&profile_after), "url"),
		vec!["http://new-site.com"]
	);
	let avatars = w.filter("avatar", "profile", profile.pk.to_value());
	assert_eq!(
		World::strings(&avatars, "image"),
		vec!["old-image-1.png", "new-image-1.png", "new-image-2.png"]
	);
	assert_eq!(w.reload(&first_avatar).get_str("image"), Some("old-image-1.png"));

	assert_eq!(w.store.count("user"), 1);
	assert_eq!(w.store.count("profile"), 1);
	// Unlinked sites stay persisted under the default many-to-many policy
	assert_eq!(w.store.count("site"), 3);
	assert_eq!(w.store.count("avatar"), 3);
	// A plain foreign key target is never deleted
	assert_eq!(w.store.count("access_key"), 1);
}

#[rstest]
fn test_update_with_disassociate_and_delete_sites() {
	let w = world_with(
		NestedWriteSettings::default().with_many_to_many_policy(DeletePolicy::DisassociateAndDelete),
	);
	let user = create_user(&w);
	let profile = w.profile_of(&user);
	let plan = w.plan(common::profile_serializer());
	w.writer
		.update(
			&plan,
			&profile,
			&json!({"access_key": null, "sites": [{"url": "http://new-site.com"}], "avatars": []}),
			&SaveOptions::new(),
		)
		.unwrap();
	assert_eq!(w.store.count("site"), 1);
	assert_eq!(w.store.count("avatar"), 0);
}

#[rstest]
fn test_update_raise_protected_error(w: World) {
	let user = create_user(&w);
	let profile = w.profile_of(&user);
	let avatars = w.filter("avatar", "profile", profile.pk.to_value());
	let protected = avatars[0].clone();
	w.store
		.update(&user, common::attrs(json!({"user_avatar": protected.pk.to_value()})))
		.unwrap();

	let plan = w.plan(common::profile_serializer());
	let err = w
		.writer
		.update(
			&plan,
			&profile,
			&json!({
				"access_key": null,
				"sites": [],
				"avatars": [
					{"pk": avatars[1].pk.to_value(), "image": "old-image-1.png"},
					{"image": "new-image-1.png"},
				],
			}),
			&SaveOptions::new(),
		)
		.unwrap_err();

	assert_eq!(
		err,
		NestedWriteError::ProtectedDelete {
			entity: "avatar".into(),
			instances: vec![protected.to_string()],
		}
	);
	assert!(err.error_tree().is_some());
	// Rolled back: no new avatar, no rename, access key still linked
	assert_eq!(w.store.count("avatar"), 2);
	assert_eq!(w.reload(&avatars[1]).get_str("image"), Some("image-2.png"));
	assert_ne!(w.reload(&profile).get("access_key"), Some(&json!(null)));
	assert_eq!(w.sites_of(&profile).len(), 2);
}

#[rstest]
fn test_update_with_empty_reverse_one_to_one(w: World) {
	let user = create_user(&w);
	let plan = w.plan(common::user_serializer());
	w.writer
		.update(
			&plan,
			&user,
			&json!({"pk": user.pk.to_value(), "username": "new", "profile": null}),
			&SaveOptions::new(),
		)
		.unwrap();
	assert!(w.filter("profile", "user", user.pk.to_value()).is_empty());
	assert_eq!(w.store.count("avatar"), 0);
}

#[rstest]
fn test_partial_update(w: World) {
	let user = create_user(&w);
	let profile = w.profile_of(&user);
	let plan = w.plan(common::user_serializer());
	let updated = w
		.writer
		.update(
			&plan,
			&user,
			&json!({"pk": user.pk.to_value(), "username": "new"}),
			&SaveOptions::new().partial(true),
		)
		.unwrap();

	assert_eq!(updated.get_str("username"), Some("new"));
	assert_eq!(w.profile_of(&updated).pk, profile.pk);
	assert_eq!(w.sites_of(&profile).len(), 2);
	assert_eq!(w.store.count("avatar"), 2);
	assert_eq!(w.store.count("access_key"), 1);
}

#[rstest]
fn test_partial_update_direct_fk(w: World) {
	let user = create_user(&w);
	let profile = w.profile_of(&user);
	let access_key = profile.get("access_key").cloned().unwrap();
	let plan = w.plan(common::user_serializer());
	let updated = w
		.writer
		.update(
			&plan,
			&user,
			&json!({
				"pk": user.pk.to_value(),
				"profile": {
					"pk": profile.pk.to_value(),
					"access_key": {"pk": access_key.clone(), "key": "new"},
				},
			}),
			&SaveOptions::new().partial(true),
		)
		.unwrap();

	assert_eq!(updated.get_str("username"), Some("test"));
	let profile = w.profile_of(&updated);
	assert_eq!(profile.get("access_key"), Some(&access_key));
	let keys = w.filter("access_key", "pk", access_key);
	assert_eq!(World::strings(&keys, "key"), vec!["new"]);
	assert_eq!(w.store.count("access_key"), 1);
	assert_eq!(w.store.count("avatar"), 2);
	assert_eq!(w.store.count("site"), 2);
}

#[rstest]
fn test_nested_partial_update(w: World) {
	let user = create_user(&w);
	let profile = w.profile_of(&user);
	let plan = w.plan(common::user_serializer());
	w.writer
		.update(
			&plan,
			&user,
			&json!({
				"pk": user.pk.to_value(),
				"profile": {"pk": profile.pk.to_value(), "access_key": {"key": "new"}},
			}),
			&SaveOptions::new().partial(true),
		)
		.unwrap();

	let profile = w.reload(&profile);
	let keys = w.filter("access_key", "pk", profile.get("access_key").cloned().unwrap());
	assert_eq!(World::strings(&keys, "key"), vec!["new"]);
	assert_eq!(w.sites_of(&profile).len(), 2);
	assert_eq!(w.store.count("avatar"), 2);
	// The previous access key is not deleted
	assert_eq!(w.store.count("access_key"), 2);
}

#[rstest]
fn test_update_with_generic_relation(w: World) {
	let item = w.insert("tagged_item", json!({}));
	let plan = w.plan(common::tagged_item_serializer());
	let tags_of = |w: &World| w.filter("tag", "object_id", item.pk.to_value());

	w.writer
		.update(&plan, &item, &json!({"tags": [{"tag": "the_tag"}]}), &SaveOptions::new())
		.unwrap();
	let tag = tags_of(&w).remove(0);

	w.writer
		.update(
			&plan,
			&item,
			&json!({"tags": [{"pk": tag.pk.to_value(), "tag": "the_new_tag"}]}),
			&SaveOptions::new(),
		)
		.unwrap();
	assert_eq!(World::strings(&tags_of(&w), "tag"), vec!["the_new_tag"]);
	assert_eq!(tags_of(&w)[0].pk, tag.pk);

	w.writer
		.update(&plan, &item, &json!({"tags": [{"tag": "the_third_tag"}]}), &SaveOptions::new())
		.unwrap();
	assert_eq!(World::strings(&tags_of(&w), "tag"), vec!["the_third_tag"]);
	assert_eq!(w.store.count("tag"), 1);
}

#[rstest]
fn test_create_m2m_with_existing_related_objects(w: World) {
	let one = w.insert("user", json!({"username": "user one"}));
	let two = w.insert("user", json!({"username": "user two"}));
	let plan = w.plan(common::team_serializer());

	let team = w
		.writer
		.save(
			&plan,
			None,
			&json!({
				"name": "Team Test",
				"members": [
					{"pk": one.pk.to_value(), "profile": null, "username": "first user"},
					{"pk": two.pk.to_value(), "profile": null, "username": "user two"},
					{"username": "user three"},
				],
			}),
			&SaveOptions::new(),
		)
		.unwrap();
	let members = w.filter("team_members", "team", team.pk.to_value());
	assert_eq!(members.len(), 3);
	assert_eq!(w.store.count("user"), 3);
	assert_eq!(w.reload(&one).get_str("username"), Some("first user"));

	let three = w.filter("user", "username", json!("user three")).remove(0);
	w.writer
		.update(
			&plan,
			&team,
			&json!({
				"name": "Team Test",
				"members": [
					{"pk": one.pk.to_value(), "username": "first user"},
					{"pk": two.pk.to_value(), "username": "user two"},
					{"pk": three.pk.to_value(), "username": "user three"},
					{"username": "last user"},
				],
			}),
			&SaveOptions::new(),
		)
		.unwrap();
	assert_eq!(w.filter("team_members", "team", team.pk.to_value()).len(), 4);
	assert_eq!(w.store.count("user"), 4);
}

#[rstest]
fn test_create_fk_with_existing_related_object(w: World) {
	let other_user = w.insert("user", json!({"username": "user one"}));
	let other_profile = w.insert("profile", json!({"user": other_user.pk.to_value()}));
	let avatar = w.insert(
		"avatar",
		json!({"image": "old.png", "profile": other_profile.pk.to_value()}),
	);

	let mut data = common::initial_data();
	data["profile"]["avatars"][0]["pk"] = avatar.pk.to_value();
	let plan = w.plan(common::user_serializer());
	let user = w.writer.save(&plan, None, &data, &SaveOptions::new()).unwrap();

	assert_eq!(w.store.count("avatar"), 2);
	let avatar = w.reload(&avatar);
	assert_eq!(avatar.get_str("image"), Some("image-1.png"));
	let profile = w.profile_of(&user);
	assert_ne!(profile.pk, other_profile.pk);
	assert_eq!(avatar.get("profile"), Some(&profile.pk.to_value()));
}

#[rstest]
fn test_create_with_existing_direct_fk_object(w: World) {
	let access_key = w.insert("access_key", json!({"key": "the-key"}));
	let mut data = common::initial_data();
	data["profile"]["access_key"] = json!({"pk": access_key.pk.to_value(), "key": "new-key"});
	let plan = w.plan(common::user_serializer());
	let user = w.writer.save(&plan, None, &data, &SaveOptions::new()).unwrap();

	assert_eq!(w.profile_of(&user).get("access_key"), Some(&access_key.pk.to_value()));
	assert_eq!(w.reload(&access_key).get_str("key"), Some("new-key"));
	assert_eq!(w.store.count("access_key"), 1);
}

#[rstest]
fn test_create_with_save_kwargs(w: World) {
	let plan = w.plan(common::user_serializer());
	let kwargs = SaveKwargs::from_value(json!({
		"profile": {
			"access_key": {"key": "key2"},
			"sites": {"url": "http://test.com"},
		},
	}))
	.unwrap();
	let user = w.writer.create(&plan, &common::initial_data(), kwargs).unwrap();

	let profile = w.profile_of(&user);
	let keys = w.filter("access_key", "pk", profile.get("access_key").cloned().unwrap());
	assert_eq!(World::strings(&keys, "key"), vec!["key2"]);
	assert_eq!(
		World::strings(&w.sites_of(&profile), "url"),
		vec!["http://test.com", "http://test.com"]
	);
}

#[rstest]
fn test_save_kwargs_must_be_objects(w: World) {
	let plan = w.plan(common::user_serializer());
	let kwargs = SaveKwargs::from_value(json!({"profile": {"sites": "http://test.com"}})).unwrap();
	let err = w.writer.create(&plan, &common::initial_data(), kwargs).unwrap_err();
	assert_eq!(
		err,
		NestedWriteError::SaveKwargsType {
			field: "sites".into(),
			found: "str".into(),
		}
	);
	assert!(err.is_fatal());
	assert_eq!(w.store.count("user"), 0);
}

#[rstest]
fn test_custom_pk(w: World) {
	let plan = w.plan(common::user_with_custom_pk_serializer());
	let user = w
		.writer
		.save(
			&plan,
			None,
			&json!({"username": "username", "custompks": [{"slug": "custom-key"}]}),
			&SaveOptions::new(),
		)
		.unwrap();
	let slugs = |w: &World| {
		World::strings(&w.filter("custom_pk", "user", user.pk.to_value()), "slug")
	};
	assert_eq!(slugs(&w), vec!["custom-key"]);

	w.writer
		.update(
			&plan,
			&user,
			&json!({"username": "username", "custompks": [{"slug": "key2"}, {"slug": "next-key"}]}),
			&SaveOptions::new(),
		)
		.unwrap();
	assert_eq!(slugs(&w), vec!["key2", "next-key"]);
	assert_eq!(w.store.count("custom_pk"), 2);
}

#[rstest]
fn test_resubmitting_saved_keys_creates_nothing(w: World) {
	let user = create_user(&w);
	let profile = w.profile_of(&user);
	let avatars = w.filter("avatar", "profile", profile.pk.to_value());
	let sites = w.sites_of(&profile);
	let data = json!({
		"pk": user.pk.to_value(),
		"username": "test",
		"profile": {
			"pk": profile.pk.to_value(),
			"access_key": {"pk": profile.get("access_key").cloned().unwrap(), "key": "key"},
			"sites": sites.iter().map(|s| json!({"pk": s.pk.to_value(), "url": s.get("url")})).collect::<Vec<_>>(),
			"avatars": avatars.iter().map(|a| json!({"pk": a.pk.to_value(), "image": a.get("image")})).collect::<Vec<_>>(),
		},
	});
	let plan = w.plan(common::user_serializer());
	w.writer.update(&plan, &user, &data, &SaveOptions::new()).unwrap();

	for (entity, count) in [("user", 1), ("profile", 1), ("site", 2), ("avatar", 2), ("access_key", 1)] {
		assert_eq!(w.store.count(entity), count, "{entity}");
	}
	assert_eq!(w.sites_of(&profile).len(), 2);
}

#[rstest]
fn test_reverse_one_to_one_reuses_linked_row(w: World) {
	let user = create_user(&w);
	let profile = w.profile_of(&user);
	let plan = w.plan(common::user_serializer());
	w.writer
		.update(
			&plan,
			&user,
			&json!({"username": "test", "profile": {"access_key": null, "sites": [], "avatars": []}}),
			&SaveOptions::new(),
		)
		.unwrap();
	assert_eq!(w.store.count("profile"), 1);
	assert_eq!(w.profile_of(&user).pk, profile.pk);
}

#[rstest]
fn test_reverse_one_to_one_without_reuse_replaces_row() {
	let w = world_with(NestedWriteSettings::default().with_reuse_linked_singleton(false));
	let user = create_user(&w);
	let plan = w.plan(common::user_serializer());
	let err = w
		.writer
		.update(
			&plan,
			&user,
			&json!({"username": "test", "profile": {"access_key": null, "sites": [], "avatars": []}}),
			&SaveOptions::new(),
		)
		.unwrap_err();
	// The new profile collides with the linked one on the one-to-one column
	assert_eq!(
		err.error_tree().unwrap().to_json(),
		json!({"profile": {"user": ["profile with this user already exists."]}})
	);
	assert_eq!(w.store.count("profile"), 1);
}
