use std::fmt;

use serde::{Deserialize, Serialize};

/// Hierarchical serialization domain for the scheduler, written as a
/// `/`-delimited path. A scope covers itself and every descendant; two
/// operations in unrelated scopes may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchedulingScope(String);

impl SchedulingScope {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let normalized = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self(normalized)
    }

    /// The scope covering everything.
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn child(&self, segment: &str) -> Self {
        if self.0.is_empty() {
            Self::new(segment)
        } else {
            Self::new(format!("{}/{segment}", self.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// True when `self` is `other` or one of its ancestors, segment-wise.
    /// Ancestry is what makes a deferred operation registered for scope `A`
    /// apply to work happening in scope `A/B` but never in a sibling of `A`.
    pub fn covers(&self, other: &SchedulingScope) -> bool {
        let mut mine = self.segments();
        let mut theirs = other.segments();
        loop {
            match (mine.next(), theirs.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(a), Some(b)) if a == b => continue,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for SchedulingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}
