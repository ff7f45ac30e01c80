//! Reconciler health, as observed by the status reporter.

use std::{collections::BTreeMap, fmt};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceClass {
    IpSets,
    Chains,
    Routes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ClassHealth {
    /// Nothing has been applied yet.
    #[default]
    Unknown,
    InSync,
    /// Some resources are waiting to be (re)applied.
    Dirty,
    /// The retry budget is exhausted; applies are still retried at a reduced rate.
    Degraded { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    pub classes: BTreeMap<ResourceClass, ClassHealth>,

    /// The version of the last intent update the reconciler fully applied.
    pub applied_version: Option<u64>,
}

// === impl ResourceClass ===

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] = [Self::IpSets, Self::Chains, Self::Routes];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpSets => "ip_sets",
            Self::Chains => "chains",
            Self::Routes => "routes",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ClassHealth ===

impl ClassHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::InSync => "in_sync",
            Self::Dirty => "dirty",
            Self::Degraded { .. } => "degraded",
        }
    }
}

// === impl HealthReport ===

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            classes: ResourceClass::ALL
                .into_iter()
                .map(|c| (c, ClassHealth::Unknown))
                .collect(),
            applied_version: None,
        }
    }
}

impl HealthReport {
    pub fn get(&self, class: ResourceClass) -> &ClassHealth {
        const UNKNOWN: &ClassHealth = &ClassHealth::Unknown;
        self.classes.get(&class).unwrap_or(UNKNOWN)
    }

    /// Whether every resource class is in sync.
    pub fn is_in_sync(&self) -> bool {
        ResourceClass::ALL
            .iter()
            .all(|c| *self.get(*c) == ClassHealth::InSync)
    }

    pub fn is_degraded(&self) -> bool {
        self.classes
            .values()
            .any(|h| matches!(h, ClassHealth::Degraded { .. }))
    }
}
