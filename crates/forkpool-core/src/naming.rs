//! Mapping between logical identifiers and storage engine dataset paths
//!
//! Layout below the pool root:
//!
//! ```text
//! {pool}/caches/{cache}                       cache dataset
//! {pool}/caches/{cache}@{generation}          cache snapshot
//! {pool}/branches/{cache}                     branch root of a cache
//! {pool}/branches/{cache}/{sha}               branch cloned from the cache
//! {pool}/branches/{cache}/{parent}/{sha}      branch cloned from a branch
//! {pool}/branches/{cache}/{parent}@{gen}      branch snapshot
//! ```
//!
//! Identifiers never contain `/` or `@`, so every path maps back to exactly
//! one (cache, branch lineage, generation) triple.

use crate::error::{ForkpoolError, Result};
use crate::types::Generation;
use serde::{Deserialize, Serialize};

const SEPARATOR: char = '/';
const SNAPSHOT_SEPARATOR: char = '@';
const CACHES: &str = "caches";
const BRANCHES: &str = "branches";

/// A storage engine dataset or snapshot path
///
/// Built by [`NamingScheme`] or parsed from engine output with
/// [`DatasetPath::parse`]; callers never concatenate path strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetPath(String);

impl DatasetPath {
    /// Parse a path as reported by the storage engine
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(ForkpoolError::parse(s, "empty dataset path"));
        }

        let (dataset, snapshot) = match s.split_once(SNAPSHOT_SEPARATOR) {
            Some((dataset, snapshot)) => (dataset, Some(snapshot)),
            None => (s, None),
        };

        for component in dataset.split(SEPARATOR) {
            if !is_valid_component(component) {
                return Err(ForkpoolError::parse(
                    s,
                    format!("invalid path component '{}'", component),
                ));
            }
        }

        if let Some(snapshot) = snapshot {
            if !is_valid_component(snapshot) {
                return Err(ForkpoolError::parse(
                    s,
                    format!("invalid snapshot name '{}'", snapshot),
                ));
            }
        }

        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_snapshot(&self) -> bool {
        self.0.contains(SNAPSHOT_SEPARATOR)
    }

    /// The filesystem part of the path (strips any `@suffix`)
    pub fn dataset(&self) -> DatasetPath {
        match self.0.split_once(SNAPSHOT_SEPARATOR) {
            Some((dataset, _)) => Self(dataset.to_string()),
            None => self.clone(),
        }
    }

    /// Trailing path component: everything after the last `/` of the
    /// filesystem part
    pub fn name(&self) -> &str {
        let dataset = self.dataset_str();
        match dataset.rfind(SEPARATOR) {
            Some(idx) => &dataset[idx + 1..],
            None => dataset,
        }
    }

    /// Everything after the last `@`, if this is a snapshot
    pub fn snapshot_suffix(&self) -> Option<&str> {
        self.0
            .rfind(SNAPSHOT_SEPARATOR)
            .map(|idx| &self.0[idx + 1..])
    }

    /// Parse the snapshot suffix as a generation number
    ///
    /// Non-numeric suffixes and `0` are an error, never a default.
    pub fn generation(&self) -> Result<Generation> {
        let suffix = self
            .snapshot_suffix()
            .ok_or_else(|| ForkpoolError::parse(&self.0, "not a snapshot path"))?;
        let value = suffix.parse::<u64>().map_err(|e| {
            ForkpoolError::parse(
                &self.0,
                format!("snapshot suffix '{}' is not a generation: {}", suffix, e),
            )
        })?;
        if value == 0 {
            return Err(ForkpoolError::parse(&self.0, "generations start at 1"));
        }
        Ok(Generation::new(value))
    }

    /// Parent filesystem, `None` at the pool root
    pub fn parent(&self) -> Option<DatasetPath> {
        if self.is_snapshot() {
            return Some(self.dataset());
        }
        self.0
            .rfind(SEPARATOR)
            .map(|idx| Self(self.0[..idx].to_string()))
    }

    /// True if `self` lives strictly below `ancestor` (snapshots of
    /// `ancestor` itself count as below)
    pub fn is_descendant_of(&self, ancestor: &DatasetPath) -> bool {
        match self.0.strip_prefix(ancestor.as_str()) {
            Some(rest) => rest.starts_with(SEPARATOR) || rest.starts_with(SNAPSHOT_SEPARATOR),
            None => false,
        }
    }

    /// Path below `root` without the leading separator
    pub fn relative_to(&self, root: &DatasetPath) -> Option<&str> {
        self.0
            .strip_prefix(root.as_str())
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
    }

    /// Number of `/` separated levels below `root`
    pub fn depth_below(&self, root: &DatasetPath) -> Option<usize> {
        if self == root {
            return Some(0);
        }
        self.relative_to(&root.dataset())
            .map(|rest| rest.split(SEPARATOR).count())
    }

    /// Replace the `from` prefix with `to`, used when a rename moves a subtree
    pub fn rebase(&self, from: &DatasetPath, to: &DatasetPath) -> Option<DatasetPath> {
        if self == from {
            return Some(to.clone());
        }
        if self.is_descendant_of(from) {
            let rest = &self.0[from.as_str().len()..];
            return Some(Self(format!("{}{}", to.as_str(), rest)));
        }
        None
    }

    fn child(&self, component: &str) -> DatasetPath {
        Self(format!("{}{}{}", self.0, SEPARATOR, component))
    }

    fn with_snapshot(&self, suffix: &str) -> DatasetPath {
        Self(format!("{}{}{}", self.0, SNAPSHOT_SEPARATOR, suffix))
    }

    fn dataset_str(&self) -> &str {
        match self.0.split_once(SNAPSHOT_SEPARATOR) {
            Some((dataset, _)) => dataset,
            None => &self.0,
        }
    }
}

impl std::fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DatasetPath {
    type Error = ForkpoolError;

    fn try_from(value: String) -> Result<Self> {
        DatasetPath::parse(&value)
    }
}

impl From<DatasetPath> for String {
    fn from(path: DatasetPath) -> Self {
        path.0
    }
}

impl AsRef<str> for DatasetPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_valid_component(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && !component.starts_with('-')
        && component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Validate a cache name or branch identifier
///
/// `kind` names the identifier in the error message.
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ForkpoolError::validation(format!(
            "{} must not be empty",
            kind
        )));
    }
    if value.contains(SEPARATOR) || value.contains(SNAPSHOT_SEPARATOR) {
        return Err(ForkpoolError::validation(format!(
            "{} '{}' must not contain '{}' or '{}'",
            kind, value, SEPARATOR, SNAPSHOT_SEPARATOR
        )));
    }
    if !is_valid_component(value) {
        return Err(ForkpoolError::validation(format!(
            "{} '{}' contains characters the storage engine does not accept",
            kind, value
        )));
    }
    Ok(())
}

/// `{target}@{generation}`; needs no pool, so engines use it directly
pub fn snapshot_path(target: &DatasetPath, generation: Generation) -> Result<DatasetPath> {
    if target.is_snapshot() {
        return Err(ForkpoolError::validation(format!(
            "cannot snapshot a snapshot: '{}'",
            target
        )));
    }
    Ok(target.with_snapshot(&generation.to_string()))
}

/// Pure functions from logical identifiers to dataset paths, and back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingScheme {
    pool: DatasetPath,
    caches_root: DatasetPath,
    branches_root: DatasetPath,
}

impl NamingScheme {
    /// `pool` may itself be a nested dataset such as `tank/ci`
    pub fn new(pool: &str) -> Result<Self> {
        let pool = DatasetPath::parse(pool)
            .map_err(|e| ForkpoolError::validation(format!("invalid pool root: {}", e)))?;
        if pool.is_snapshot() {
            return Err(ForkpoolError::validation(format!(
                "pool root '{}' must not be a snapshot",
                pool
            )));
        }
        Ok(Self {
            caches_root: pool.child(CACHES),
            branches_root: pool.child(BRANCHES),
            pool,
        })
    }

    pub fn pool(&self) -> &DatasetPath {
        &self.pool
    }

    /// `{pool}/caches`
    pub fn caches_root(&self) -> &DatasetPath {
        &self.caches_root
    }

    /// `{pool}/branches`
    pub fn branches_root(&self) -> &DatasetPath {
        &self.branches_root
    }

    /// `{pool}/caches/{name}`
    pub fn cache_path(&self, name: &str) -> Result<DatasetPath> {
        validate_identifier("cache name", name)?;
        Ok(self.caches_root.child(name))
    }

    /// `{pool}/branches/{cache}`, the parent of every branch of `cache`
    pub fn branch_root(&self, cache: &str) -> Result<DatasetPath> {
        validate_identifier("cache name", cache)?;
        Ok(self.branches_root.child(cache))
    }

    /// `{target}/{branch_id}`
    pub fn branch_path(&self, target: &DatasetPath, branch_id: &str) -> Result<DatasetPath> {
        validate_identifier("branch identifier", branch_id)?;
        if target.is_snapshot() {
            return Err(ForkpoolError::validation(format!(
                "branch target '{}' must be a filesystem, not a snapshot",
                target
            )));
        }
        Ok(target.child(branch_id))
    }

    /// `{target}@{generation}`
    pub fn snapshot_path(
        &self,
        target: &DatasetPath,
        generation: Generation,
    ) -> Result<DatasetPath> {
        snapshot_path(target, generation)
    }

    /// Cache name for a path directly below the caches root
    pub fn cache_name_of<'a>(&self, path: &'a DatasetPath) -> Option<&'a str> {
        if path.is_snapshot() || path.parent().as_ref() != Some(&self.caches_root) {
            return None;
        }
        Some(path.name())
    }

    /// Split a branch path into its cache name and branch lineage,
    /// outermost parent first
    pub fn parse_branch<'a>(&self, path: &'a DatasetPath) -> Option<(&'a str, Vec<&'a str>)> {
        if path.is_snapshot() {
            return None;
        }
        let rest = path.relative_to(&self.branches_root)?;
        let mut parts = rest.split(SEPARATOR);
        let cache = parts.next()?;
        let lineage: Vec<&str> = parts.collect();
        if lineage.is_empty() {
            return None;
        }
        Some((cache, lineage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> NamingScheme {
        NamingScheme::new("P").unwrap()
    }

    #[test]
    fn test_roots() {
        let s = scheme();
        assert_eq!(s.caches_root().as_str(), "P/caches");
        assert_eq!(s.branches_root().as_str(), "P/branches");
    }

    #[test]
    fn test_cache_and_branch_paths() {
        let s = scheme();
        let cache = s.cache_path("app").unwrap();
        assert_eq!(cache.as_str(), "P/caches/app");

        let root = s.branch_root("app").unwrap();
        assert_eq!(root.as_str(), "P/branches/app");

        let branch = s.branch_path(&root, "abc").unwrap();
        assert_eq!(branch.as_str(), "P/branches/app/abc");

        let nested = s.branch_path(&branch, "def").unwrap();
        assert_eq!(nested.as_str(), "P/branches/app/abc/def");
    }

    #[test]
    fn test_snapshot_path() {
        let s = scheme();
        let cache = s.cache_path("app").unwrap();
        let snap = s.snapshot_path(&cache, Generation::new(3)).unwrap();
        assert_eq!(snap.as_str(), "P/caches/app@3");
        assert!(snap.is_snapshot());
        assert_eq!(snap.dataset(), cache);
        assert!(s.snapshot_path(&snap, Generation::FIRST).is_err());
    }

    #[test]
    fn test_nested_pool_root() {
        let s = NamingScheme::new("tank/ci").unwrap();
        assert_eq!(s.cache_path("x").unwrap().as_str(), "tank/ci/caches/x");
        assert!(NamingScheme::new("tank@1").is_err());
        assert!(NamingScheme::new("").is_err());
    }

    #[test]
    fn test_rejects_ambiguous_identifiers() {
        let s = scheme();
        assert!(matches!(
            s.cache_path("a/b").unwrap_err(),
            ForkpoolError::Validation { .. }
        ));
        assert!(s.cache_path("a@1").is_err());
        assert!(s.cache_path("").is_err());
        assert!(s.cache_path("has space").is_err());
        assert!(s.cache_path("..").is_err());

        let root = s.branch_root("app").unwrap();
        assert!(s.branch_path(&root, "x/y").is_err());
        assert!(s.branch_path(&root, "x@y").is_err());
    }

    #[test]
    fn test_name_and_generation_parsing() {
        let p = DatasetPath::parse("P/branches/app/abc").unwrap();
        assert_eq!(p.name(), "abc");

        let snap = DatasetPath::parse("P/caches/app@12").unwrap();
        assert_eq!(snap.name(), "app");
        assert_eq!(snap.snapshot_suffix(), Some("12"));
        assert_eq!(snap.generation().unwrap(), Generation::new(12));
    }

    #[test]
    fn test_non_numeric_generation_is_parse_error() {
        let snap = DatasetPath::parse("P/caches/app@nightly").unwrap();
        assert!(matches!(
            snap.generation().unwrap_err(),
            ForkpoolError::Parse { .. }
        ));

        let not_snap = DatasetPath::parse("P/caches/app").unwrap();
        assert!(not_snap.generation().is_err());

        let zero = DatasetPath::parse("P/caches/app@0").unwrap();
        assert!(matches!(
            zero.generation().unwrap_err(),
            ForkpoolError::Parse { .. }
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        assert!(DatasetPath::parse("").is_err());
        assert!(DatasetPath::parse("P//x").is_err());
        assert!(DatasetPath::parse("P/x@").is_err());
        assert!(DatasetPath::parse("P/x@1@2").is_err());
        assert!(DatasetPath::parse("P/x y").is_err());
    }

    #[test]
    fn test_inverse_mapping() {
        let s = scheme();
        let cache = s.cache_path("app").unwrap();
        assert_eq!(s.cache_name_of(&cache), Some("app"));
        assert_eq!(s.cache_name_of(s.caches_root()), None);

        let root = s.branch_root("app").unwrap();
        let b1 = s.branch_path(&root, "B1").unwrap();
        let b2 = s.branch_path(&b1, "B2").unwrap();
        assert_eq!(s.parse_branch(&b1), Some(("app", vec!["B1"])));
        assert_eq!(s.parse_branch(&b2), Some(("app", vec!["B1", "B2"])));
        assert_eq!(s.parse_branch(&root), None);
        assert_eq!(s.parse_branch(&cache), None);
    }

    #[test]
    fn test_hierarchy_helpers() {
        let root = DatasetPath::parse("P/branches/app").unwrap();
        let b = DatasetPath::parse("P/branches/app/abc").unwrap();
        let other = DatasetPath::parse("P/branches/apple").unwrap();
        let snap = DatasetPath::parse("P/branches/app@1").unwrap();

        assert!(b.is_descendant_of(&root));
        assert!(snap.is_descendant_of(&root));
        assert!(!other.is_descendant_of(&root));
        assert!(!root.is_descendant_of(&root));

        assert_eq!(b.parent(), Some(root.clone()));
        assert_eq!(b.depth_below(&root), Some(1));
        assert_eq!(root.depth_below(&root), Some(0));

        let target = DatasetPath::parse("P/caches/app").unwrap();
        let moved = b.rebase(&root, &target).unwrap();
        assert_eq!(moved.as_str(), "P/caches/app/abc");
        assert!(other.rebase(&root, &target).is_none());
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let p: DatasetPath = serde_json::from_str("\"P/caches/app\"").unwrap();
        assert_eq!(p.as_str(), "P/caches/app");
        assert!(serde_json::from_str::<DatasetPath>("\"P//x\"").is_err());
    }
}
