//! Core data structures for replica resilience

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{GalleonError, Result};

/// Namespace identifier of a file
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of a pool (storage node holding replicas)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolName(String);

impl PoolName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PoolName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PoolName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Access latency class of a file. Only online files are resilience-managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLatency {
    Online,
    Nearline,
}

/// Enable/disable mode bits reported by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMode {
    pub enabled: bool,
    pub readable: bool,
    pub writable: bool,
}

impl PoolMode {
    pub const ENABLED: PoolMode = PoolMode {
        enabled: true,
        readable: true,
        writable: true,
    };

    pub const DISABLED: PoolMode = PoolMode {
        enabled: false,
        readable: false,
        writable: false,
    };

    pub const READ_ONLY: PoolMode = PoolMode {
        enabled: true,
        readable: true,
        writable: false,
    };

    /// Replicas on the pool can be read (and thus count and serve as sources)
    pub fn is_readable(&self) -> bool {
        self.enabled && self.readable
    }

    /// The pool can accept new replicas
    pub fn is_writable(&self) -> bool {
        self.enabled && self.writable
    }
}

impl Default for PoolMode {
    fn default() -> Self {
        PoolMode::ENABLED
    }
}

/// Space and load figures used for pool selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PoolCost {
    /// Total capacity in bytes
    pub total_space: u64,
    /// Free capacity in bytes
    pub free_space: u64,
    /// Normalized load (0.0 idle, 1.0 saturated)
    pub load: f64,
}

/// Pool information as published by the pool manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: PoolName,
    #[serde(default)]
    pub mode: PoolMode,
    /// Host/rack style tags used for copy exclusivity
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub cost: PoolCost,
    /// Per-pool switch; when off, status changes of this pool never trigger scans
    #[serde(default = "default_true")]
    pub replication_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl PoolInfo {
    pub fn new(name: impl Into<PoolName>) -> Self {
        Self {
            name: name.into(),
            mode: PoolMode::ENABLED,
            tags: BTreeMap::new(),
            cost: PoolCost::default(),
            replication_enabled: true,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Replica bounds and placement exclusivity after merging all overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConstraints {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Tag names whose values must differ between any two replicas
    #[serde(default)]
    pub only_one_copy_per: Vec<String>,
}

impl ReplicaConstraints {
    pub fn new(min_replicas: u32, max_replicas: u32) -> Result<Self> {
        let constraints = Self {
            min_replicas,
            max_replicas,
            only_one_copy_per: Vec::new(),
        };
        constraints.validate()?;
        Ok(constraints)
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.only_one_copy_per = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        crate::ensure!(
            self.min_replicas >= 1,
            ConstraintViolation,
            "minimum replica count must be at least 1, got {}",
            self.min_replicas
        );
        crate::ensure!(
            self.min_replicas <= self.max_replicas,
            ConstraintViolation,
            "minimum replica count {} exceeds maximum {}",
            self.min_replicas,
            self.max_replicas
        );
        Ok(())
    }

    /// A group with more than one required copy is managed by the engine
    pub fn is_resilient(&self) -> bool {
        self.min_replicas > 1
    }
}

/// Builds the `storageClass@hsmName` key of a storage unit
pub fn storage_unit_key(storage_class: &str, hsm: Option<&str>) -> String {
    match hsm {
        Some(hsm) if !hsm.is_empty() => format!("{}@{}", storage_class, hsm),
        _ => storage_class.to_string(),
    }
}

/// Per-storage-unit override of a pool group's replica constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnitConstraint {
    /// `storageClass[@hsmName]`
    pub unit: String,
    #[serde(default)]
    pub min_replicas: Option<u32>,
    #[serde(default)]
    pub max_replicas: Option<u32>,
    #[serde(default)]
    pub only_one_copy_per: Option<Vec<String>>,
}

impl StorageUnitConstraint {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            min_replicas: None,
            max_replicas: None,
            only_one_copy_per: None,
        }
    }

    /// Merges this override over the group defaults; the result is validated.
    pub fn apply(&self, defaults: &ReplicaConstraints) -> Result<ReplicaConstraints> {
        let merged = ReplicaConstraints {
            min_replicas: self.min_replicas.unwrap_or(defaults.min_replicas),
            max_replicas: self.max_replicas.unwrap_or(defaults.max_replicas),
            only_one_copy_per: self
                .only_one_copy_per
                .clone()
                .unwrap_or_else(|| defaults.only_one_copy_per.clone()),
        };
        merged.validate().map_err(|e| match e {
            GalleonError::ConstraintViolation(msg) => {
                GalleonError::ConstraintViolation(format!("storage unit {}: {}", self.unit, msg))
            }
            other => other,
        })?;
        Ok(merged)
    }
}

/// A pool group together with its replica constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolGroupInfo {
    pub name: String,
    pub constraints: ReplicaConstraints,
    pub pools: BTreeSet<PoolName>,
    #[serde(default)]
    pub storage_units: BTreeMap<String, StorageUnitConstraint>,
}

impl PoolGroupInfo {
    /// Creates a group, rejecting malformed constraints and overrides
    pub fn new(
        name: impl Into<String>,
        constraints: ReplicaConstraints,
        pools: impl IntoIterator<Item = PoolName>,
    ) -> Result<Self> {
        constraints.validate()?;
        Ok(Self {
            name: name.into(),
            constraints,
            pools: pools.into_iter().collect(),
            storage_units: BTreeMap::new(),
        })
    }

    pub fn with_storage_unit(mut self, unit: StorageUnitConstraint) -> Result<Self> {
        unit.apply(&self.constraints)?;
        self.storage_units.insert(unit.unit.clone(), unit);
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.constraints.validate()?;
        for unit in self.storage_units.values() {
            unit.apply(&self.constraints)?;
        }
        Ok(())
    }

    pub fn is_resilient(&self) -> bool {
        self.constraints.is_resilient()
    }

    pub fn contains(&self, pool: &PoolName) -> bool {
        self.pools.contains(pool)
    }

    /// Constraints for a file of the given storage unit: the unit override
    /// when one exists, the group defaults otherwise.
    pub fn constraints_for(&self, unit: Option<&str>) -> Result<ReplicaConstraints> {
        match unit.and_then(|u| self.storage_units.get(u)) {
            Some(over) => over.apply(&self.constraints),
            None => Ok(self.constraints.clone()),
        }
    }
}

/// Namespace attributes of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub file_id: FileId,
    pub access_latency: AccessLatency,
    pub storage_class: String,
    #[serde(default)]
    pub hsm: Option<String>,
    /// Pools the namespace lists as holding a replica, in namespace order
    pub locations: Vec<PoolName>,
    #[serde(default)]
    pub size: u64,
}

impl FileAttributes {
    pub fn storage_unit(&self) -> String {
        storage_unit_key(&self.storage_class, self.hsm.as_deref())
    }
}

/// Replica picture of one file relative to one resilient pool group.
/// Built per event and discarded once the triggered work completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReplicaInfo {
    pub file_id: FileId,
    pub group: String,
    pub access_latency: AccessLatency,
    pub constraints: ReplicaConstraints,
    /// Readable, uncorrupted locations inside the group, in namespace order
    pub locations: Vec<PoolName>,
    /// Group locations whose pool is currently unreadable
    pub inaccessible: Vec<PoolName>,
    /// Group locations reported corrupt
    pub corrupt: Vec<PoolName>,
    /// Group members with no replica of the file
    pub free_members: Vec<PoolName>,
}

impl FileReplicaInfo {
    pub fn replica_count(&self) -> usize {
        self.locations.len()
    }

    pub fn is_managed(&self) -> bool {
        self.access_latency == AccessLatency::Online
    }

    pub fn copies_needed(&self) -> usize {
        (self.constraints.min_replicas as usize).saturating_sub(self.replica_count())
    }

    pub fn copies_excess(&self) -> usize {
        self.replica_count()
            .saturating_sub(self.constraints.max_replicas as usize)
    }

    pub fn has_location(&self, pool: &PoolName) -> bool {
        self.locations.contains(pool)
            || self.inaccessible.contains(pool)
            || self.corrupt.contains(pool)
    }
}

/// Owner of the permanent pin marking a replica as resilience-managed
pub const SYSTEM_STICKY_OWNER: &str = "system";

/// Owner of the transient pin held while a copy or removal is in flight
pub const TRANSIENT_STICKY_OWNER: &str = "replica-manager";

/// Named, optionally expiring pin on a replica
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    /// `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl StickyRecord {
    pub fn system() -> Self {
        Self {
            owner: SYSTEM_STICKY_OWNER.to_string(),
            expires_at: None,
        }
    }

    pub fn transient(ttl: std::time::Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(2));
        Self {
            owner: TRANSIENT_STICKY_OWNER.to_string(),
            expires_at: Some(Utc::now() + ttl),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    pub fn is_system(&self) -> bool {
        self.owner == SYSTEM_STICKY_OWNER
    }

    pub fn is_transient(&self) -> bool {
        self.owner == TRANSIENT_STICKY_OWNER
    }
}

/// Comparison used by replica-count scan filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Equal,
}

/// Restricts a pool scan to files whose total replica count satisfies an
/// inequality, e.g. `>2` to target over-replicated files only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCountFilter {
    pub comparison: Comparison,
    pub count: usize,
}

impl ReplicaCountFilter {
    pub fn matches(&self, replicas: usize) -> bool {
        match self.comparison {
            Comparison::Greater => replicas > self.count,
            Comparison::GreaterOrEqual => replicas >= self.count,
            Comparison::Less => replicas < self.count,
            Comparison::LessOrEqual => replicas <= self.count,
            Comparison::Equal => replicas == self.count,
        }
    }
}

impl FromStr for ReplicaCountFilter {
    type Err = GalleonError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (comparison, rest) = if let Some(rest) = s.strip_prefix(">=") {
            (Comparison::GreaterOrEqual, rest)
        } else if let Some(rest) = s.strip_prefix("<=") {
            (Comparison::LessOrEqual, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (Comparison::Greater, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (Comparison::Less, rest)
        } else if let Some(rest) = s.strip_prefix('=') {
            (Comparison::Equal, rest)
        } else {
            crate::bail!(InvalidInput, "replica filter '{}' must start with >, >=, <, <= or =", s);
        };
        let count = rest.trim().parse::<usize>()?;
        Ok(Self { comparison, count })
    }
}

impl fmt::Display for ReplicaCountFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.comparison {
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Equal => "=",
        };
        write!(f, "{}{}", op, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> PoolGroupInfo {
        PoolGroupInfo::new(
            "resilient",
            ReplicaConstraints::new(2, 3).unwrap(),
            ["pool-a", "pool-b", "pool-c"].into_iter().map(PoolName::from),
        )
        .unwrap()
    }

    #[test]
    fn test_constraints_reject_malformed_bounds() {
        assert!(matches!(
            ReplicaConstraints::new(0, 2),
            Err(GalleonError::ConstraintViolation(_))
        ));
        assert!(matches!(
            ReplicaConstraints::new(3, 2),
            Err(GalleonError::ConstraintViolation(_))
        ));
        assert!(ReplicaConstraints::new(2, 2).is_ok());
    }

    #[test]
    fn test_storage_unit_override_supersedes_group() {
        let mut unit = StorageUnitConstraint::new("raw@osm");
        unit.min_replicas = Some(3);
        unit.max_replicas = Some(4);
        let group = group().with_storage_unit(unit).unwrap();

        let overridden = group.constraints_for(Some("raw@osm")).unwrap();
        assert_eq!(overridden.min_replicas, 3);
        assert_eq!(overridden.max_replicas, 4);

        let defaults = group.constraints_for(Some("other@osm")).unwrap();
        assert_eq!(defaults.min_replicas, 2);
        assert_eq!(defaults.max_replicas, 3);
    }

    #[test]
    fn test_storage_unit_override_is_validated() {
        let mut unit = StorageUnitConstraint::new("raw@osm");
        unit.min_replicas = Some(5);
        assert!(matches!(
            group().with_storage_unit(unit),
            Err(GalleonError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_copies_needed_and_excess() {
        let mut info = FileReplicaInfo {
            file_id: FileId::from("0000A1"),
            group: "resilient".into(),
            access_latency: AccessLatency::Online,
            constraints: ReplicaConstraints::new(2, 3).unwrap(),
            locations: vec![PoolName::from("pool-a")],
            inaccessible: vec![],
            corrupt: vec![],
            free_members: vec![],
        };
        assert_eq!(info.copies_needed(), 1);
        assert_eq!(info.copies_excess(), 0);

        info.locations = ["pool-a", "pool-b", "pool-c", "pool-d"]
            .into_iter()
            .map(PoolName::from)
            .collect();
        assert_eq!(info.copies_needed(), 0);
        assert_eq!(info.copies_excess(), 1);
    }

    #[test]
    fn test_storage_unit_key() {
        assert_eq!(storage_unit_key("raw", Some("osm")), "raw@osm");
        assert_eq!(storage_unit_key("raw", None), "raw");
    }

    #[test]
    fn test_replica_filter_parsing() {
        let filter: ReplicaCountFilter = ">2".parse().unwrap();
        assert!(filter.matches(3));
        assert!(!filter.matches(2));

        let filter: ReplicaCountFilter = "<= 1".parse().unwrap();
        assert!(filter.matches(1));
        assert!(!filter.matches(2));
        assert_eq!(filter.to_string(), "<=1");

        assert!("2".parse::<ReplicaCountFilter>().is_err());
        assert!(">x".parse::<ReplicaCountFilter>().is_err());
    }

    #[test]
    fn test_sticky_record_expiry() {
        let now = Utc::now();
        assert!(StickyRecord::system().is_active(now));
        let pin = StickyRecord::transient(std::time::Duration::from_secs(60));
        assert!(pin.is_active(now));
        assert!(!pin.is_active(now + chrono::Duration::minutes(2)));
    }
}
