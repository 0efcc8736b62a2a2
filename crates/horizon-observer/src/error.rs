//! Error types for observer contexts, subject filters and the object manager.

use horizon_observer_core::{CodecError, ContextId};

/// Errors raised by subject filters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// The filter is already bound to an observer context.
    #[error("Filter '{0}' is already bound to an observer context")]
    AlreadyBound(String),
    /// The filter has not been installed in an observer context yet.
    #[error("Filter '{0}' is not bound to an observer context")]
    NotBound(String),
    /// Policy changes are only allowed while the context has no subjects.
    #[error("Filter '{filter}' policy cannot change while context {context} has subjects")]
    PolicyLocked {
        filter: String,
        context: ContextId,
    },
    /// The subject type is already part of the filter list.
    #[error("Subject type '{0}' is already registered")]
    DuplicateSubjectType(String),
    /// The naming validity pattern does not compile.
    #[error("Invalid naming pattern: {0}")]
    InvalidPattern(String),
}

impl FilterError {
    pub fn policy_locked(filter: impl Into<String>, context: ContextId) -> Self {
        Self::PolicyLocked {
            filter: filter.into(),
            context,
        }
    }
}

/// Errors raised by observers and the object manager.
///
/// For attach and detach failures, `Display` yields the human-readable
/// rejection message.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// The object does not exist.
    #[error("Invalid or destroyed object")]
    InvalidObject,
    /// No observer is registered under the context id.
    #[error("Observer context {0} does not exist")]
    ContextNotFound(ContextId),
    /// The observer is being deleted.
    #[error("Observer context {0} is being deleted")]
    ObserverDeleted(ContextId),
    /// The object is already a subject of the context.
    #[error("Object is already attached to context {0}")]
    AlreadyAttached(ContextId),
    /// The object is not a subject of the context.
    #[error("Object is not attached to context {0}")]
    NotAttached(ContextId),
    /// A subject filter or an internal check rejected the operation.
    #[error("{reason}")]
    Rejected {
        context: ContextId,
        reason: String,
    },
    /// The context reached its subject limit.
    #[error("Context {context} reached its limit of {limit} subjects")]
    SubjectLimitReached {
        context: ContextId,
        limit: usize,
    },
    /// The object reached its limit of observing contexts.
    #[error("Object reached its limit of {0} observing contexts")]
    ObserverLimitReached(u64),
    /// Attaching would create a cycle in the context tree.
    #[error("Attaching the object to context {0} would create a cycle")]
    CircularAttachment(ContextId),
    /// The object is already owned by another specific context.
    #[error("Object is already owned by context {0}")]
    OwnerConflict(ContextId),
    /// Filters can only change while the context has no subjects.
    #[error("Subject filters of context {0} cannot change while it has subjects")]
    FiltersLocked(ContextId),
    /// A filter with the same name is already installed.
    #[error("A filter named '{0}' is already installed")]
    DuplicateFilter(String),
    /// The filter is not installed in the context.
    #[error("Filter '{0}' is not installed")]
    FilterNotInstalled(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    /// The property name is empty or otherwise unusable.
    #[error("Invalid property '{0}'")]
    InvalidProperty(String),
    /// The shared property is read-only.
    #[error("Property '{0}' is read-only")]
    ReadOnlyProperty(String),
    /// The property is reserved by a subject filter of an observing context.
    #[error("Property '{name}' is reserved by context {context}")]
    ReservedProperty {
        name: String,
        context: ContextId,
    },
    /// A factory name is already claimed by another provider.
    #[error("Factory '{0}' is already provided")]
    FactoryConflict(String),
    /// Source and destination of a move are the same context.
    #[error("Source and destination context are both {0}")]
    SameContext(ContextId),
    /// The object manager owning the observer has been dropped.
    #[error("Object manager has been dropped")]
    ManagerDropped,
    /// One or more default properties could not be constructed.
    #[error("Failed to construct default properties: {}", .0.join("; "))]
    DefaultProperties(Vec<String>),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ObserverError {
    pub fn rejected(context: ContextId, reason: impl Into<String>) -> Self {
        Self::Rejected {
            context,
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configured export version is outside the supported range.
    #[error("Unsupported export version {0}")]
    UnsupportedExportVersion(u32),
}

/// Result type for observer operations.
pub type Result<T> = std::result::Result<T, ObserverError>;
