//! Subject filters.
//!
//! A subject filter is installed in exactly one observer context and takes
//! part in every attach and detach on that context. The observer drives each
//! operation through a fixed sequence of hooks:
//!
//! 1. `evaluate_*` on every filter, in installation order. Any rejection
//!    aborts the operation before anything changes.
//! 2. `initialize_*` on every filter. A failure aborts the operation and every
//!    filter receives `finalize_*(successful = false)`.
//! 3. The observer updates its subject list and the object's bookkeeping
//!    properties.
//! 4. `finalize_*(successful = true)` on every filter, where business rules
//!    such as default activity are applied.
//!
//! Filters also name the properties the observer must protect
//! ([`SubjectFilterHooks::reserved_properties`]) and the properties whose
//! changes are routed to them ([`SubjectFilterHooks::monitored_properties`]).

mod activity;
mod naming;
mod subject_type;

use std::sync::{Arc, OnceLock, Weak};

use horizon_observer_core::{ContextId, ObjectId, PropertyValue, SharedObjectRegistry};

use crate::error::FilterError;
use crate::observer::Observer;

pub use activity::{
    ActivityPolicy, ActivityPolicyFilter, MinimumActivityPolicy, NewSubjectActivityPolicy,
    ParentTrackingPolicy,
};
pub use naming::{NamingPolicyFilter, ResolutionPolicy, UniquenessPolicy};
pub use subject_type::{SubjectTypeFilter, SubjectTypeInfo};

/// Outcome of an attach or detach evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Allowed,
    /// Allowed, but a filter will adjust the object while attaching
    /// (for example by renaming it).
    Conditional,
    /// Rejected with a human-readable reason.
    Rejected(String),
}

impl Evaluation {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// The once-only link between a filter and its observer context.
#[derive(Debug, Default)]
pub struct FilterBinding {
    observer: OnceLock<(Weak<Observer>, ContextId)>,
}

impl FilterBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to `observer`. Fails if already bound.
    pub fn bind(&self, observer: &Observer, filter_name: &str) -> Result<(), FilterError> {
        self.observer
            .set((observer.weak_ref(), observer.context_id()))
            .map_err(|_| FilterError::AlreadyBound(filter_name.to_string()))
    }

    pub fn is_bound(&self) -> bool {
        self.observer.get().is_some()
    }

    /// The bound observer, if bound and still alive.
    pub fn observer(&self) -> Option<Arc<Observer>> {
        self.observer.get().and_then(|(weak, _)| weak.upgrade())
    }

    /// The bound context id.
    pub fn context(&self) -> Option<ContextId> {
        self.observer.get().map(|(_, ctx)| *ctx)
    }

    /// Whether policy changes are currently locked because the context has subjects.
    pub(crate) fn ensure_unlocked(&self, filter_name: &str) -> Result<(), FilterError> {
        match self.observer() {
            Some(observer) if observer.subject_count() > 0 => Err(FilterError::policy_locked(
                filter_name,
                observer.context_id(),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn registry(&self) -> Option<Arc<SharedObjectRegistry>> {
        self.observer().map(|observer| observer.registry().clone())
    }
}

/// The hooks an observer calls on its installed filters.
///
/// Every hook has a permissive default so custom filters only implement
/// the parts they care about.
#[allow(unused_variables)]
pub trait SubjectFilterHooks: Send + Sync {
    /// Name identifying the filter inside its context.
    fn filter_name(&self) -> &str;

    fn binding(&self) -> &FilterBinding;

    /// Bind the filter to its observer context. Fails if already bound.
    fn set_observer_context(&self, observer: &Observer) -> Result<(), FilterError> {
        self.binding().bind(observer, self.filter_name())
    }

    /// Read-only check before attaching `obj`.
    ///
    /// `silent` is set when the caller cannot tolerate interactive prompts.
    fn evaluate_attachment(&self, obj: ObjectId, silent: bool) -> Evaluation {
        Evaluation::Allowed
    }

    /// Called before the observer attaches `obj`.
    ///
    /// `import_cycle` is set when the object's properties come from an import
    /// stream, so exportable bookkeeping must not be overwritten.
    fn initialize_attachment(&self, obj: ObjectId, import_cycle: bool) -> Result<(), String> {
        Ok(())
    }

    /// Called after the attach completed or was aborted.
    fn finalize_attachment(&self, obj: ObjectId, attach_successful: bool, import_cycle: bool) {}

    /// Read-only check before detaching `obj`.
    fn evaluate_detachment(&self, obj: ObjectId) -> Evaluation {
        Evaluation::Allowed
    }

    /// Called before the observer detaches `obj`.
    ///
    /// `subject_deleted` is set when the object is being destroyed; a failure
    /// is then logged but cannot stop the detach.
    fn initialize_detachment(&self, obj: ObjectId, subject_deleted: bool) -> Result<(), String> {
        Ok(())
    }

    /// Called after the detach completed or was aborted.
    fn finalize_detachment(&self, obj: ObjectId, detach_successful: bool, subject_deleted: bool) {}

    /// Property names whose changes are routed to this filter.
    fn monitored_properties(&self) -> Vec<String> {
        Vec::new()
    }

    /// Property names that may not be changed from outside.
    fn reserved_properties(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handle a routed change of a monitored property.
    ///
    /// Returns `true` to intercept the change, in which case it is not
    /// written by the caller.
    fn handle_monitored_property_change(
        &self,
        obj: ObjectId,
        name: &str,
        value: &PropertyValue,
    ) -> bool {
        false
    }

    fn processing_cycle_started(&self) {}

    fn processing_cycle_ended(&self) {}
}

/// An installed subject filter.
#[derive(Clone)]
pub enum SubjectFilter {
    Activity(Arc<ActivityPolicyFilter>),
    SubjectType(Arc<SubjectTypeFilter>),
    Naming(Arc<NamingPolicyFilter>),
    Custom(Arc<dyn SubjectFilterHooks>),
}

impl SubjectFilter {
    /// Wrap a custom filter implementation.
    pub fn custom<F: SubjectFilterHooks + 'static>(filter: F) -> Self {
        Self::Custom(Arc::new(filter))
    }

    pub fn hooks(&self) -> &dyn SubjectFilterHooks {
        match self {
            Self::Activity(f) => f.as_ref(),
            Self::SubjectType(f) => f.as_ref(),
            Self::Naming(f) => f.as_ref(),
            Self::Custom(f) => f.as_ref(),
        }
    }

    pub fn name(&self) -> &str {
        self.hooks().filter_name()
    }

    /// Whether both handles refer to the same filter instance.
    pub fn same_instance(&self, other: &SubjectFilter) -> bool {
        std::ptr::addr_eq(self.hooks(), other.hooks())
    }

    pub fn as_activity(&self) -> Option<&Arc<ActivityPolicyFilter>> {
        match self {
            Self::Activity(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_subject_type(&self) -> Option<&Arc<SubjectTypeFilter>> {
        match self {
            Self::SubjectType(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_naming(&self) -> Option<&Arc<NamingPolicyFilter>> {
        match self {
            Self::Naming(f) => Some(f),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SubjectFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SubjectFilter").field(&self.name()).finish()
    }
}

impl From<Arc<ActivityPolicyFilter>> for SubjectFilter {
    fn from(filter: Arc<ActivityPolicyFilter>) -> Self {
        Self::Activity(filter)
    }
}

impl From<ActivityPolicyFilter> for SubjectFilter {
    fn from(filter: ActivityPolicyFilter) -> Self {
        Self::Activity(Arc::new(filter))
    }
}

impl From<Arc<SubjectTypeFilter>> for SubjectFilter {
    fn from(filter: Arc<SubjectTypeFilter>) -> Self {
        Self::SubjectType(filter)
    }
}

impl From<SubjectTypeFilter> for SubjectFilter {
    fn from(filter: SubjectTypeFilter) -> Self {
        Self::SubjectType(Arc::new(filter))
    }
}

impl From<Arc<NamingPolicyFilter>> for SubjectFilter {
    fn from(filter: Arc<NamingPolicyFilter>) -> Self {
        Self::Naming(filter)
    }
}

impl From<NamingPolicyFilter> for SubjectFilter {
    fn from(filter: NamingPolicyFilter) -> Self {
        Self::Naming(Arc::new(filter))
    }
}

impl From<Arc<dyn SubjectFilterHooks>> for SubjectFilter {
    fn from(filter: Arc<dyn SubjectFilterHooks>) -> Self {
        Self::Custom(filter)
    }
}

/// Tag under which [`ActivityPolicyFilter`] is registered in the filter factory.
pub const ACTIVITY_POLICY_FILTER_TAG: &str = "ActivityPolicyFilter";
/// Tag under which [`SubjectTypeFilter`] is registered in the filter factory.
pub const SUBJECT_TYPE_FILTER_TAG: &str = "SubjectTypeFilter";
/// Tag under which [`NamingPolicyFilter`] is registered in the filter factory.
pub const NAMING_POLICY_FILTER_TAG: &str = "NamingPolicyFilter";
/// Category of the built-in subject filters.
pub const SUBJECT_FILTERS_CATEGORY: &str = "Subject Filters";
