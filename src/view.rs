//! Views: class-tagged scopes that answer requests.
//!
//! A view names the slice of configuration and zone data that serves a
//! request. The client core only needs to pick one: after parsing a
//! request it walks the registry under a read lock and attaches the first
//! view whose class matches the request's class. Requests that match no
//! view are refused.

use std::sync::{Arc, RwLock};

use crate::types::Class;

//------------ View ----------------------------------------------------------

/// A named, class-tagged scope of server data.
///
/// Attaching and detaching a view is cloning and dropping an `Arc`; the
/// client holds its reference only between request acceptance and
/// finalization.
#[derive(Debug)]
pub struct View {
    /// The name of the view.
    name: String,

    /// The class this view serves.
    class: Class,
}

impl View {
    /// Creates a new view.
    #[must_use]
    pub fn new(name: impl Into<String>, class: Class) -> Self {
        View {
            name: name.into(),
            class,
        }
    }

    /// Returns the name of the view.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the class this view serves.
    #[must_use]
    pub fn class(&self) -> Class {
        self.class
    }
}

//------------ ViewRegistry --------------------------------------------------

/// The ordered list of configured views.
///
/// Matching takes the list read lock for the duration of one walk, so
/// concurrent reconfiguration can never tear a walk. Writers are rare
/// (configuration changes); readers are every request.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: RwLock<Vec<Arc<View>>>,
}

impl ViewRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a view to the end of the list.
    pub fn push(&self, view: View) {
        if let Ok(mut views) = self.views.write() {
            views.push(Arc::new(view));
        }
    }

    /// Returns the first view whose class matches, if any.
    #[must_use]
    pub fn find(&self, class: Class) -> Option<Arc<View>> {
        let views = self.views.read().ok()?;
        views.iter().find(|view| view.class() == class).cloned()
    }

    /// Returns the number of configured views.
    #[must_use]
    pub fn len(&self) -> usize {
        self.views.read().map(|views| views.len()).unwrap_or(0)
    }

    /// Returns whether no views are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_view_wins() {
        let registry = ViewRegistry::new();
        registry.push(View::new("internal", Class::IN));
        registry.push(View::new("external", Class::IN));
        registry.push(View::new("chaosnet", Class::CH));

        let view = registry.find(Class::IN).unwrap();
        assert_eq!(view.name(), "internal");
        let view = registry.find(Class::CH).unwrap();
        assert_eq!(view.name(), "chaosnet");
    }

    #[test]
    fn unmatched_class_finds_nothing() {
        let registry = ViewRegistry::new();
        registry.push(View::new("internal", Class::IN));
        assert!(registry.find(Class::HS).is_none());
        assert!(ViewRegistry::new().find(Class::IN).is_none());
    }
}
