//! Locator decoding
//!
//! A fragment may identify an existing row by a resource URL instead of a
//! primary key, e.g. `{"url": "http://api.example.com/publishers/acme/"}`.
//! A [`LocatorResolver`] turns such a string into a lookup on the target
//! entity; [`RouteLocator`] is the route-table implementation.

use indexmap::IndexMap;
use serde_json::Value;
use url::Url;

/// A decoded locator: the row whose `field` equals `value`
#[derive(Debug, Clone, PartialEq)]
pub struct Locator {
	pub field: String,
	pub value: Value,
}

/// Decodes locator strings for an entity
pub trait LocatorResolver: Send + Sync {
	/// Returns `None` when the locator does not point at `entity`
	fn resolve(&self, entity: &str, locator: &str) -> Option<Locator>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
	prefix: String,
	lookup_field: String,
}

/// Maps detail routes of the form `<prefix>/<lookup value>/` to entities
///
/// # Examples
///
/// ```
/// use reinhardt_writable_nested::locator::{LocatorResolver, RouteLocator};
/// use serde_json::json;
///
/// let routes = RouteLocator::new().route("publisher", "/publishers/", "slug");
///
/// let locator = routes
/// 	.resolve("publisher", "http://testserver/publishers/acme/")
/// 	.unwrap();
/// assert_eq!(locator.field, "slug");
/// assert_eq!(locator.value, json!("acme"));
///
/// assert!(routes.resolve("publisher", "/books/acme/").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RouteLocator {
	routes: IndexMap<String, Route>,
}

/// Base used to resolve relative locators
const RELATIVE_BASE: &str = "http://localhost/";

impl RouteLocator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers the detail route of `entity`
	#[must_use]
	pub fn route(
		mut self,
		entity: impl Into<String>,
		prefix: impl Into<String>,
		lookup_field: impl Into<String>,
	) -> Self {
		let prefix = prefix.into();
		let prefix = format!("/{}/", prefix.trim_matches('/'));
		self.routes.insert(
			entity.into(),
			Route {
				prefix,
				lookup_field: lookup_field.into(),
			},
		);
		self
	}
}

impl LocatorResolver for RouteLocator {
	fn resolve(&self, entity: &str, locator: &str) -> Option<Locator> {
		let route = self.routes.get(entity)?;
		let url = Url::parse(locator)
			.or_else(|_| Url::parse(RELATIVE_BASE).and_then(|base| base.join(locator)))
			.ok()?;
		let rest = url.path().strip_prefix(&route.prefix)?;
		let value = rest.trim_end_matches('/');
		if value.is_empty() || value.contains('/') {
			return None;
		}
		Some(Locator {
			field: route.lookup_field.clone(),
			value: Value::String(value.to_string()),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;
	use serde_json::json;

	#[rstest]
	#[case("http://testserver/publishers/acme/", Some(json!("acme")))]
	#[case("/publishers/acme", Some(json!("acme")))]
	#[case("publishers/acme/", Some(json!("acme")))]
	#[case("/publishers/", None)]
	#[case("/publishers/acme/books/", None)]
	#[case("/authors/acme/", None)]
	fn test_route_resolution(#[case] locator: &str, #[case] expected: Option<Value>) {
		let routes = RouteLocator::new().route("publisher", "publishers", "slug");
		assert_eq!(
			routes.resolve("publisher", locator).map(|l| l.value),
			expected
		);
	}

	#[rstest]
	fn test_unknown_entity() {
		let routes = RouteLocator::new().route("publisher", "/publishers/", "slug");
		assert!(routes.resolve("book", "/publishers/acme/").is_none());
	}
}
