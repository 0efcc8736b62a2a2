//! Hierarchical categories.

use std::fmt;

use horizon_observer_core::Variant;

/// A category path such as `Subject Filters::Naming`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Category {
    levels: Vec<String>,
}

impl Category {
    pub const SEPARATOR: &'static str = "::";

    pub fn new<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            levels: levels.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a `::`-separated path. Empty levels are dropped.
    pub fn parse(path: &str) -> Self {
        Self::new(
            path.split(Self::SEPARATOR)
                .map(str::trim)
                .filter(|level| !level.is_empty()),
        )
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Stored as a string list.
    pub fn to_variant(&self) -> Variant {
        Variant::StringList(self.levels.clone())
    }

    pub fn from_variant(value: &Variant) -> Option<Self> {
        match value {
            Variant::StringList(levels) => Some(Self::new(levels.iter().cloned())),
            Variant::String(path) => Some(Self::parse(path)),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.levels.join(Self::SEPARATOR))
    }
}

impl From<&str> for Category {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}
