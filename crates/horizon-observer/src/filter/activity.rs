//! Activity policy filter.
//!
//! Tracks which subjects of a context are *active*. Activity is stored on
//! each subject in the multi-context [`names::OBJECT_ACTIVITY`] property, so
//! an object can be active in one context and inactive in another.

use std::collections::HashSet;

use horizon_observer_core::{ObjectId, PropertyValue, Signal, names, store};
use parking_lot::Mutex;

use super::{Evaluation, FilterBinding, SubjectFilterHooks};
use crate::error::FilterError;

const TARGET: &str = "horizon_observer::filter";
const FILTER_NAME: &str = "Activity Policy Filter";

/// Whether more than one subject may be active at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityPolicy {
    UniqueActivity,
    #[default]
    MultipleActivity,
}

/// Whether a non-empty context must keep at least one subject active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinimumActivityPolicy {
    #[default]
    AllowNoneActive,
    ProhibitNoneActive,
}

/// Activity given to newly attached subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewSubjectActivityPolicy {
    #[default]
    SetNewActive,
    SetNewInactive,
}

/// Whether the context's host object follows the activity of its subjects
/// in its single parent context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentTrackingPolicy {
    #[default]
    ParentIgnoreActivity,
    /// The host object is active in its parent context iff any subject is active.
    ParentFollowActivity,
}

#[derive(Debug, Default)]
struct ActivityState {
    activity: ActivityPolicy,
    minimum: MinimumActivityPolicy,
    new_subject: NewSubjectActivityPolicy,
    parent_tracking: ParentTrackingPolicy,
    /// Activity changed inside the current processing cycle.
    pending_change: bool,
    /// Subjects that were active when their detachment started.
    detaching_active: HashSet<ObjectId>,
}

/// Subject filter managing per-context subject activity.
///
/// # Example
///
/// ```
/// use horizon_observer::{ActivityPolicyFilter, ActivityPolicy, ObjectManager};
/// use horizon_observer_core::TypeInfo;
///
/// let manager = ObjectManager::new();
/// let observer = manager.create_observer("Documents");
/// let filter = std::sync::Arc::new(ActivityPolicyFilter::new());
/// filter.set_activity_policy(ActivityPolicy::UniqueActivity).unwrap();
/// observer.install_subject_filter(filter.clone()).unwrap();
///
/// let doc = manager.create_object("a", TypeInfo::new("Document"));
/// observer.attach_subject(doc, Default::default()).unwrap();
/// assert_eq!(filter.active_subjects(), vec![doc]);
/// ```
pub struct ActivityPolicyFilter {
    binding: FilterBinding,
    state: Mutex<ActivityState>,
    /// Emitted with `(active, inactive)` subjects after each settled change.
    pub active_subjects_changed: Signal<(Vec<ObjectId>, Vec<ObjectId>)>,
}

impl Default for ActivityPolicyFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityPolicyFilter {
    pub fn new() -> Self {
        Self {
            binding: FilterBinding::new(),
            state: Mutex::new(ActivityState::default()),
            active_subjects_changed: Signal::new(),
        }
    }

    // =========================================================================
    // Policies
    // =========================================================================

    pub fn activity_policy(&self) -> ActivityPolicy {
        self.state.lock().activity
    }

    pub fn set_activity_policy(&self, policy: ActivityPolicy) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        self.state.lock().activity = policy;
        Ok(())
    }

    pub fn minimum_activity_policy(&self) -> MinimumActivityPolicy {
        self.state.lock().minimum
    }

    pub fn set_minimum_activity_policy(
        &self,
        policy: MinimumActivityPolicy,
    ) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        self.state.lock().minimum = policy;
        Ok(())
    }

    pub fn new_subject_activity_policy(&self) -> NewSubjectActivityPolicy {
        self.state.lock().new_subject
    }

    pub fn set_new_subject_activity_policy(
        &self,
        policy: NewSubjectActivityPolicy,
    ) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        self.state.lock().new_subject = policy;
        Ok(())
    }

    pub fn parent_tracking_policy(&self) -> ParentTrackingPolicy {
        self.state.lock().parent_tracking
    }

    pub fn set_parent_tracking_policy(
        &self,
        policy: ParentTrackingPolicy,
    ) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        self.state.lock().parent_tracking = policy;
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn subjects(&self) -> Vec<ObjectId> {
        self.binding
            .observer()
            .map(|observer| observer.subjects())
            .unwrap_or_default()
    }

    /// Whether `obj` is active in the bound context.
    pub fn is_active(&self, obj: ObjectId) -> bool {
        let (Some(registry), Some(ctx)) = (self.binding.registry(), self.binding.context()) else {
            return false;
        };
        store::multi_context_value(&registry, obj, names::OBJECT_ACTIVITY, ctx)
            .to_bool()
            .unwrap_or(false)
    }

    /// Active subjects, in attachment order.
    pub fn active_subjects(&self) -> Vec<ObjectId> {
        self.subjects()
            .into_iter()
            .filter(|obj| self.is_active(*obj))
            .collect()
    }

    /// Inactive subjects, in attachment order.
    pub fn inactive_subjects(&self) -> Vec<ObjectId> {
        self.subjects()
            .into_iter()
            .filter(|obj| !self.is_active(*obj))
            .collect()
    }

    // =========================================================================
    // Guards
    // =========================================================================

    /// Whether `active` is an acceptable set of active subjects.
    pub fn can_set_active_subjects(&self, active: &[ObjectId]) -> bool {
        let Some(observer) = self.binding.observer() else {
            return false;
        };
        if !active.iter().all(|obj| observer.contains(*obj)) {
            return false;
        }
        let state = self.state.lock();
        if state.activity == ActivityPolicy::UniqueActivity && active.len() > 1 {
            return false;
        }
        if state.minimum == MinimumActivityPolicy::ProhibitNoneActive
            && active.is_empty()
            && observer.subject_count() > 0
        {
            return false;
        }
        true
    }

    pub fn can_invert_activity(&self) -> bool {
        let state = self.state.lock();
        self.binding.is_bound()
            && state.activity == ActivityPolicy::MultipleActivity
            && state.minimum == MinimumActivityPolicy::AllowNoneActive
            && state.parent_tracking == ParentTrackingPolicy::ParentIgnoreActivity
    }

    pub fn can_set_all_active(&self) -> bool {
        self.binding.is_bound() && self.state.lock().activity == ActivityPolicy::MultipleActivity
    }

    pub fn can_set_none_active(&self) -> bool {
        self.binding.is_bound()
            && self.state.lock().minimum == MinimumActivityPolicy::AllowNoneActive
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Make `obj` the only active subject.
    pub fn set_active_subject(&self, obj: ObjectId) -> bool {
        self.set_active_subjects(&[obj])
    }

    /// Make exactly the listed subjects active.
    ///
    /// Returns `false` without changing anything if the list violates the
    /// current policies.
    pub fn set_active_subjects(&self, active: &[ObjectId]) -> bool {
        if !self.can_set_active_subjects(active) {
            tracing::debug!(target: TARGET, count = active.len(), "active subject list rejected by policy");
            return false;
        }
        if self.write_activity(active) {
            self.notify_change();
        }
        true
    }

    /// Flip the activity of one subject, if the policies allow the result.
    pub fn toggle_subject_activity(&self, obj: ObjectId) -> bool {
        let mut active = self.active_subjects();
        if let Some(pos) = active.iter().position(|o| *o == obj) {
            active.remove(pos);
        } else if self.activity_policy() == ActivityPolicy::UniqueActivity {
            active = vec![obj];
        } else {
            active.push(obj);
        }
        self.set_active_subjects(&active)
    }

    /// Swap active and inactive subjects.
    pub fn invert_activity(&self) -> bool {
        if !self.can_invert_activity() {
            return false;
        }
        let inactive = self.inactive_subjects();
        self.set_active_subjects(&inactive)
    }

    pub fn set_all_active(&self) -> bool {
        if !self.can_set_all_active() {
            return false;
        }
        let all = self.subjects();
        self.set_active_subjects(&all)
    }

    pub fn set_none_active(&self) -> bool {
        if !self.can_set_none_active() {
            return false;
        }
        self.set_active_subjects(&[])
    }

    /// Set one subject's activity, adjusting the others as the policies require.
    ///
    /// Used for routed property changes and parent tracking.
    pub fn apply_subject_activity(&self, obj: ObjectId, active: bool) -> bool {
        if self.is_active(obj) == active {
            return true;
        }
        self.toggle_subject_activity(obj)
    }

    /// Write activity for every subject. Returns whether the active set changed.
    fn write_activity(&self, active: &[ObjectId]) -> bool {
        let (Some(observer), Some(ctx)) = (self.binding.observer(), self.binding.context()) else {
            return false;
        };
        let registry = observer.registry();
        let mut changed = false;
        for subject in observer.subjects() {
            let want = active.contains(&subject);
            if self.is_active(subject) != want {
                changed = true;
            }
            store::set_multi_context_value(registry, subject, names::OBJECT_ACTIVITY, ctx, want, true);
        }
        changed
    }

    /// Announce a settled change, or defer it to the end of the processing cycle.
    fn notify_change(&self) {
        let in_cycle = self
            .binding
            .observer()
            .is_some_and(|observer| observer.is_processing_cycle_active());
        if in_cycle {
            self.state.lock().pending_change = true;
            return;
        }
        self.emit_change();
    }

    fn emit_change(&self) {
        let active = self.active_subjects();
        let inactive = self.inactive_subjects();
        tracing::debug!(target: TARGET, context = ?self.binding.context(), active = active.len(), inactive = inactive.len(), "active subjects changed");
        self.active_subjects_changed.emit((active.clone(), inactive));
        if self.parent_tracking_policy() == ParentTrackingPolicy::ParentFollowActivity {
            self.sync_parent_activity(!active.is_empty());
        }
    }

    /// Mirror this context's activity onto its host object in the single parent context.
    fn sync_parent_activity(&self, any_active: bool) {
        let Some(observer) = self.binding.observer() else {
            return;
        };
        let Some(manager) = observer.manager() else {
            return;
        };
        let host = observer.host_object();
        let parents = manager.parent_contexts(host);
        let [parent] = parents.as_slice() else {
            tracing::trace!(target: TARGET, parents = parents.len(), "parent tracking needs exactly one parent context");
            return;
        };
        let Some(parent_filter) = manager
            .observer_reference(*parent)
            .and_then(|parent| parent.activity_filter())
        else {
            return;
        };
        if !parent_filter.apply_subject_activity(host, any_active) {
            tracing::debug!(target: TARGET, parent = %parent, "parent context refused activity change");
        }
    }
}

impl SubjectFilterHooks for ActivityPolicyFilter {
    fn filter_name(&self) -> &str {
        FILTER_NAME
    }

    fn binding(&self) -> &FilterBinding {
        &self.binding
    }

    fn evaluate_attachment(&self, _obj: ObjectId, _silent: bool) -> Evaluation {
        Evaluation::Allowed
    }

    fn finalize_attachment(&self, obj: ObjectId, attach_successful: bool, import_cycle: bool) {
        if !attach_successful {
            return;
        }
        let (Some(observer), Some(ctx)) = (self.binding.observer(), self.binding.context()) else {
            return;
        };
        let registry = observer.registry();

        // Imported activity is kept as-is.
        if import_cycle {
            let existing = store::get_multi_context_property(registry, obj, names::OBJECT_ACTIVITY);
            if existing.has_context(ctx) {
                return;
            }
        }

        let (activity, minimum, new_subject) = {
            let state = self.state.lock();
            (state.activity, state.minimum, state.new_subject)
        };
        let others_active: Vec<ObjectId> = self
            .active_subjects()
            .into_iter()
            .filter(|o| *o != obj)
            .collect();

        let make_active = match new_subject {
            NewSubjectActivityPolicy::SetNewActive => true,
            NewSubjectActivityPolicy::SetNewInactive => {
                minimum == MinimumActivityPolicy::ProhibitNoneActive && others_active.is_empty()
            }
        };

        let changed = if make_active {
            let mut active = if activity == ActivityPolicy::UniqueActivity {
                Vec::new()
            } else {
                others_active
            };
            active.push(obj);
            self.write_activity(&active)
        } else {
            store::set_multi_context_value(registry, obj, names::OBJECT_ACTIVITY, ctx, false, true);
            false
        };
        if changed {
            self.notify_change();
        }
    }

    fn initialize_detachment(&self, obj: ObjectId, _subject_deleted: bool) -> Result<(), String> {
        if self.is_active(obj) {
            self.state.lock().detaching_active.insert(obj);
        }
        Ok(())
    }

    fn finalize_detachment(&self, obj: ObjectId, detach_successful: bool, _subject_deleted: bool) {
        let was_active = self.state.lock().detaching_active.remove(&obj);
        if !detach_successful {
            return;
        }
        let mut changed = was_active;
        if self.minimum_activity_policy() == MinimumActivityPolicy::ProhibitNoneActive
            && self.active_subjects().is_empty()
        {
            if let Some(first) = self.subjects().first().copied() {
                changed |= self.write_activity(&[first]);
            }
        }
        if changed {
            self.notify_change();
        }
    }

    fn monitored_properties(&self) -> Vec<String> {
        vec![names::OBJECT_ACTIVITY.to_string()]
    }

    fn handle_monitored_property_change(
        &self,
        obj: ObjectId,
        name: &str,
        value: &PropertyValue,
    ) -> bool {
        if name != names::OBJECT_ACTIVITY {
            return false;
        }
        let Some(ctx) = self.binding.context() else {
            return false;
        };
        if let PropertyValue::MultiContext(prop) = value {
            if let Some(want) = prop.value(ctx).to_bool() {
                if !self.apply_subject_activity(obj, want) {
                    tracing::debug!(target: TARGET, ?obj, context = %ctx, want, "activity change vetoed by policy");
                }
            }
        }
        true
    }

    fn processing_cycle_ended(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending_change);
        if pending {
            self.emit_change();
        }
    }
}

impl std::fmt::Debug for ActivityPolicyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ActivityPolicyFilter")
            .field("context", &self.binding.context())
            .field("activity", &state.activity)
            .field("minimum", &state.minimum)
            .field("new_subject", &state.new_subject)
            .field("parent_tracking", &state.parent_tracking)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use horizon_observer_core::{TypeInfo, Variant};
    use parking_lot::Mutex;

    use super::*;
    use crate::{ObjectManager, Observer, Ownership};

    fn setup(
        configure: impl FnOnce(&ActivityPolicyFilter),
    ) -> (ObjectManager, Arc<Observer>, Arc<ActivityPolicyFilter>) {
        let manager = ObjectManager::new();
        let observer = manager.create_observer("Root");
        let filter = Arc::new(ActivityPolicyFilter::new());
        configure(&filter);
        observer.install_subject_filter(filter.clone()).unwrap();
        (manager, observer, filter)
    }

    fn attach(manager: &ObjectManager, observer: &Observer, name: &str) -> ObjectId {
        let obj = manager.create_object(name, TypeInfo::new("Thing"));
        observer.attach_subject(obj, Ownership::Manual).unwrap();
        obj
    }

    #[test]
    fn test_defaults() {
        let filter = ActivityPolicyFilter::new();
        assert_eq!(filter.activity_policy(), ActivityPolicy::MultipleActivity);
        assert_eq!(filter.minimum_activity_policy(), MinimumActivityPolicy::AllowNoneActive);
        assert_eq!(filter.new_subject_activity_policy(), NewSubjectActivityPolicy::SetNewActive);
        assert_eq!(filter.parent_tracking_policy(), ParentTrackingPolicy::ParentIgnoreActivity);
        assert!(!filter.can_invert_activity());
    }

    #[test]
    fn test_new_subjects_active_by_default() {
        let (manager, observer, filter) = setup(|_| {});
        let a = attach(&manager, &observer, "a");
        let b = attach(&manager, &observer, "b");
        assert_eq!(filter.active_subjects(), vec![a, b]);
    }

    #[test]
    fn test_unique_activity_keeps_one_active() {
        let (manager, observer, filter) = setup(|f| {
            f.set_activity_policy(ActivityPolicy::UniqueActivity).unwrap();
        });
        let a = attach(&manager, &observer, "a");
        let b = attach(&manager, &observer, "b");
        assert_eq!(filter.active_subjects(), vec![b]);

        assert!(filter.set_active_subject(a));
        assert_eq!(filter.active_subjects(), vec![a]);
        assert!(!filter.set_active_subjects(&[a, b]));
        assert_eq!(filter.active_subjects(), vec![a]);
    }

    #[test]
    fn test_prohibit_none_active() {
        let (manager, observer, filter) = setup(|f| {
            f.set_minimum_activity_policy(MinimumActivityPolicy::ProhibitNoneActive)
                .unwrap();
            f.set_new_subject_activity_policy(NewSubjectActivityPolicy::SetNewInactive)
                .unwrap();
        });
        let a = attach(&manager, &observer, "a");
        let b = attach(&manager, &observer, "b");
        assert_eq!(filter.active_subjects(), vec![a]);

        assert!(!filter.set_none_active());
        assert!(!filter.toggle_subject_activity(a));
        assert_eq!(filter.active_subjects(), vec![a]);

        observer.detach_subject(a).unwrap();
        assert_eq!(filter.active_subjects(), vec![b]);
    }

    #[test]
    fn test_policy_locked_with_subjects() {
        let (manager, observer, filter) = setup(|_| {});
        attach(&manager, &observer, "a");
        let err = filter
            .set_activity_policy(ActivityPolicy::UniqueActivity)
            .unwrap_err();
        assert!(matches!(err, FilterError::PolicyLocked { .. }));
        assert_eq!(filter.activity_policy(), ActivityPolicy::MultipleActivity);
    }

    #[test]
    fn test_change_signal_deferred_in_processing_cycle() {
        let (manager, observer, filter) = setup(|_| {});
        let emissions = Arc::new(Mutex::new(Vec::new()));
        let sink = emissions.clone();
        filter.active_subjects_changed.connect(move |(active, _)| {
            sink.lock().push(active.len());
        });

        observer.start_processing_cycle();
        attach(&manager, &observer, "a");
        attach(&manager, &observer, "b");
        attach(&manager, &observer, "c");
        assert!(emissions.lock().is_empty());
        observer.end_processing_cycle(true);
        assert_eq!(*emissions.lock(), vec![3]);

        // No change inside the cycle means no emission at its end.
        observer.start_processing_cycle();
        observer.end_processing_cycle(true);
        assert_eq!(emissions.lock().len(), 1);
    }

    #[test]
    fn test_activity_is_per_context() {
        let manager = ObjectManager::new();
        let first = manager.create_observer("First");
        let second = manager.create_observer("Second");
        let f1 = Arc::new(ActivityPolicyFilter::new());
        let f2 = Arc::new(ActivityPolicyFilter::new());
        f2.set_new_subject_activity_policy(NewSubjectActivityPolicy::SetNewInactive)
            .unwrap();
        first.install_subject_filter(f1.clone()).unwrap();
        second.install_subject_filter(f2.clone()).unwrap();

        let obj = manager.create_object("shared", TypeInfo::new("Thing"));
        first.attach_subject(obj, Ownership::Manual).unwrap();
        second.attach_subject(obj, Ownership::Manual).unwrap();
        assert!(f1.is_active(obj));
        assert!(!f2.is_active(obj));
        assert_eq!(
            store::multi_context_value(manager.registry(), obj, names::OBJECT_ACTIVITY, second.context_id()),
            Variant::Bool(false)
        );
    }

    #[test]
    fn test_parent_follow_activity() {
        let manager = ObjectManager::new();
        let parent = manager.create_observer("Parent");
        let parent_filter = Arc::new(ActivityPolicyFilter::new());
        parent_filter
            .set_new_subject_activity_policy(NewSubjectActivityPolicy::SetNewInactive)
            .unwrap();
        parent.install_subject_filter(parent_filter.clone()).unwrap();

        let child = manager.create_observer("Child");
        let child_filter = Arc::new(ActivityPolicyFilter::new());
        child_filter
            .set_parent_tracking_policy(ParentTrackingPolicy::ParentFollowActivity)
            .unwrap();
        child_filter
            .set_new_subject_activity_policy(NewSubjectActivityPolicy::SetNewInactive)
            .unwrap();
        child.install_subject_filter(child_filter.clone()).unwrap();
        parent
            .attach_subject(child.host_object(), Ownership::Manual)
            .unwrap();
        assert!(!parent_filter.is_active(child.host_object()));

        let leaf = attach(&manager, &child, "leaf");
        assert!(child_filter.set_active_subject(leaf));
        assert!(parent_filter.is_active(child.host_object()));

        assert!(child_filter.set_none_active());
        assert!(!parent_filter.is_active(child.host_object()));
    }
}
