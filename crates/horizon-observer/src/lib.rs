//! Horizon Observer - observer contexts and object management.
//!
//! Objects live in the registry of an [`ObjectManager`]. An [`Observer`] is a
//! named context that tracks a set of subject objects; every attach and
//! detach is vetted by the context's subject filters
//! ([`ActivityPolicyFilter`], [`SubjectTypeFilter`], [`NamingPolicyFilter`]
//! or custom [`SubjectFilterHooks`] implementations). Per-context state is
//! kept in multi-context properties on the subjects themselves and stripped
//! again when a subject leaves a context.
//!
//! The core object model (registry, properties, export envelopes, signals)
//! is re-exported from `horizon-observer-core`.
//!
//! # Example
//!
//! ```
//! use horizon_observer::{ActivityPolicyFilter, ObjectManager, Ownership};
//! use horizon_observer_core::TypeInfo;
//!
//! let manager = ObjectManager::new();
//! let root = manager.create_observer("Root");
//! root.install_subject_filter(ActivityPolicyFilter::new()).unwrap();
//!
//! let obj = manager.create_object("A", TypeInfo::new("Item"));
//! root.attach_subject(obj, Ownership::Manual).unwrap();
//! assert!(root.activity_filter().unwrap().is_active(obj));
//! ```

pub mod category;
pub mod config;
pub mod error;
pub mod factory;
pub mod filter;
pub mod manager;
pub mod observer;
pub mod provider;
pub mod relational;

pub use category::Category;
pub use config::{DEFAULT_GLOBAL_POOL_NAME, ObjectManagerBuilder, ObjectManagerConfig};
pub use error::{ConfigError, FilterError, ObserverError, Result};
pub use factory::{Factory, FactoryItemId, FactoryProvider, InstanceFactoryInfo};
pub use filter::{
    ACTIVITY_POLICY_FILTER_TAG, ActivityPolicy, ActivityPolicyFilter, Evaluation, FilterBinding,
    MinimumActivityPolicy, NAMING_POLICY_FILTER_TAG, NamingPolicyFilter, NewSubjectActivityPolicy,
    ParentTrackingPolicy, ResolutionPolicy, SUBJECT_FILTERS_CATEGORY, SUBJECT_TYPE_FILTER_TAG,
    SubjectFilter, SubjectFilterHooks, SubjectTypeFilter, SubjectTypeInfo, UniquenessPolicy,
};
pub use manager::{
    MoveOutcome, MoveReport, OBSERVER_FACTORY_TAG, OBSERVER_TYPE, OBSERVERS_FACTORY, ObjectManager,
    PropertyChangeOutcome, StaleContextEntry,
};
pub use observer::{
    ActivityControl, ActivityDisplay, AttachOptions, DetachEvaluation, DisplayHints,
    HierarchicalDisplay, NamingControl, Observer, Ownership, SubjectChange,
};
pub use provider::{AVAILABLE_PROPERTY_PROVIDER_TAG, AvailablePropertyProvider, PropertySpecification};
pub use relational::{RelationalEntry, RelationalTable};
