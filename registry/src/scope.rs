//! Scope and ScopeSet: normalized access units used throughout token
//! issuance and the authorization pipeline.

use once_cell_regex::repository_name_regex;
use serde::{Deserialize, Serialize};

/// The repository-path rule from the OCI distribution spec: lowercase
/// alphanumerics and separators (`.`, `_`, `__`, `-`), path components
/// joined by `/`. 256 octets max.
const MAX_REPOSITORY_NAME_OCTETS: usize = 256;

mod once_cell_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    pub fn repository_name_regex() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$")
                .expect("static repository name regex is valid")
        })
    }
}

/// A single `type:name:actions` access unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl Scope {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>, actions: Vec<String>) -> Self {
        let mut scope = Self {
            resource_type: resource_type.into(),
            name: name.into(),
            actions,
        };
        scope.blank_invalid_repository_name();
        scope
    }

    fn blank_invalid_repository_name(&mut self) {
        if self.resource_type == "repository" {
            let valid = self.name.as_bytes().len() <= MAX_REPOSITORY_NAME_OCTETS
                && repository_name_regex().is_match(&self.name);
            if !valid {
                self.name.clear();
            }
        }
    }

    /// Parses the wire form `type:name:action1,action2,...`.
    pub fn parse(wire: &str) -> Option<Self> {
        let mut parts = wire.splitn(3, ':');
        let resource_type = parts.next()?.to_string();
        let name = parts.next()?.to_string();
        let actions_field = parts.next().unwrap_or("");
        let actions: Vec<String> = if actions_field.is_empty() {
            Vec::new()
        } else {
            actions_field.split(',').map(|a| a.to_string()).collect()
        };
        Some(Self::new(resource_type, name, actions))
    }

    pub fn to_wire(&self) -> String {
        format!("{}:{}:{}", self.resource_type, self.name, self.actions.join(","))
    }

    fn same_resource(&self, other: &Scope) -> bool {
        self.resource_type == other.resource_type && self.name == other.name
    }

    fn contains_actions(&self, actions: &[String]) -> bool {
        actions.iter().all(|a| self.actions.iter().any(|x| x == a))
    }
}

/// A list of scopes with no two entries sharing `(type, name)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSet(Vec<Scope>);

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scopes(scopes: impl IntoIterator<Item = Scope>) -> Self {
        let mut set = Self::new();
        for s in scopes {
            set.add(s);
        }
        set
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Merges `scope` into any existing entry with the same resource,
    /// deduplicating actions while preserving first-seen order. Adding an
    /// entry with no actions is a no-op.
    pub fn add(&mut self, scope: Scope) {
        if scope.actions.is_empty() {
            return;
        }
        if let Some(existing) = self.0.iter_mut().find(|e| e.same_resource(&scope)) {
            for action in scope.actions {
                if !existing.actions.contains(&action) {
                    existing.actions.push(action);
                }
            }
        } else {
            self.0.push(scope);
        }
    }

    /// True iff some entry has the same resource and a superset of actions.
    pub fn contains(&self, scope: &Scope) -> bool {
        self.0
            .iter()
            .any(|e| e.same_resource(scope) && e.contains_actions(&scope.actions))
    }

    pub fn into_vec(self) -> Vec<Scope> {
        self.0
    }
}

/// `keppel_api:info:access` is silently skipped by auth-challenge rendering.
pub fn is_info_access_scope(scope: &Scope) -> bool {
    scope.resource_type == "keppel_api" && scope.name == "info" && scope.actions.iter().any(|a| a == "access")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains_is_true() {
        let mut set = ScopeSet::new();
        let s = Scope::new("repository", "test1/foo", vec!["pull".into()]);
        set.add(s.clone());
        assert!(set.contains(&s));
    }

    #[test]
    fn adding_twice_is_a_no_op() {
        let mut set = ScopeSet::new();
        let s = Scope::new("repository", "test1/foo", vec!["pull".into()]);
        set.add(s.clone());
        set.add(s);
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().actions.len(), 1);
    }

    #[test]
    fn merges_actions_on_same_resource() {
        let mut set = ScopeSet::new();
        set.add(Scope::new("repository", "test1/foo", vec!["pull".into()]));
        set.add(Scope::new("repository", "test1/foo", vec!["push".into()]));
        assert_eq!(set.len(), 1);
        let merged = set.iter().next().unwrap();
        assert_eq!(merged.actions, vec!["pull", "push"]);
    }

    #[test]
    fn empty_action_add_is_noop() {
        let mut set = ScopeSet::new();
        set.add(Scope::new("repository", "test1/foo", vec![]));
        assert!(set.is_empty());
    }

    #[test]
    fn invalid_repository_name_is_blanked() {
        let s = Scope::new("repository", "Test1/Foo", vec!["pull".into()]);
        assert_eq!(s.name, "");
    }

    #[test]
    fn parse_wire_form() {
        let s = Scope::parse("repository:test1/foo:pull,push").unwrap();
        assert_eq!(s.resource_type, "repository");
        assert_eq!(s.name, "test1/foo");
        assert_eq!(s.actions, vec!["pull", "push"]);
    }

    #[test]
    fn to_wire_round_trips() {
        let s = Scope::new("repository", "test1/foo", vec!["pull".into(), "push".into()]);
        let wire = s.to_wire();
        let parsed = Scope::parse(&wire).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn info_access_scope_is_recognized() {
        let s = Scope::new("keppel_api", "info", vec!["access".into()]);
        assert!(is_info_access_scope(&s));
    }
}
