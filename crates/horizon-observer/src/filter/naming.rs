//! Naming policy filter.
//!
//! The first naming-filtered context an object joins becomes its *name
//! manager*: it owns [`names::OBJECT_NAME`] and records itself in
//! [`names::OBJECT_NAME_MANAGER_ID`]. Other contexts resolve name conflicts
//! through per-context instance names in [`names::INSTANCE_NAMES`].

use horizon_observer_core::{
    ContextId, ObjectId, PropertyValue, SharedObjectRegistry, SharedProperty, Variant, names,
    store,
};
use parking_lot::RwLock;
use regex::Regex;

use super::{Evaluation, FilterBinding, SubjectFilterHooks};
use crate::error::FilterError;

const TARGET: &str = "horizon_observer::filter";
const FILTER_NAME: &str = "Naming Policy Filter";

/// Whether two subjects of one context may share a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UniquenessPolicy {
    AllowDuplicateNames,
    #[default]
    ProhibitDuplicateNames,
}

/// What happens to a subject whose name conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionPolicy {
    /// Give the subject a unique name such as `"Name (2)"`.
    #[default]
    AutoRename,
    Reject,
}

#[derive(Debug, Default)]
struct NamingState {
    uniqueness: UniquenessPolicy,
    resolution: ResolutionPolicy,
    validity: Option<Regex>,
}

/// Subject filter enforcing valid and unique subject names.
#[derive(Debug, Default)]
pub struct NamingPolicyFilter {
    binding: FilterBinding,
    state: RwLock<NamingState>,
}

impl NamingPolicyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uniqueness_policy(&self) -> UniquenessPolicy {
        self.state.read().uniqueness
    }

    pub fn set_uniqueness_policy(&self, policy: UniquenessPolicy) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        self.state.write().uniqueness = policy;
        Ok(())
    }

    pub fn resolution_policy(&self) -> ResolutionPolicy {
        self.state.read().resolution
    }

    pub fn set_resolution_policy(&self, policy: ResolutionPolicy) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        self.state.write().resolution = policy;
        Ok(())
    }

    /// Require names to match `pattern`. The whole name must match.
    pub fn set_validity_pattern(&self, pattern: &str) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        let regex = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|err| FilterError::InvalidPattern(err.to_string()))?;
        self.state.write().validity = Some(regex);
        Ok(())
    }

    pub fn clear_validity_pattern(&self) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        self.state.write().validity = None;
        Ok(())
    }

    /// Whether `name` is non-empty and matches the validity pattern.
    pub fn is_valid_name(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.state
            .read()
            .validity
            .as_ref()
            .is_none_or(|regex| regex.is_match(name))
    }

    /// The name `obj` carries in the bound context.
    pub fn object_name_in_context(&self, obj: ObjectId) -> String {
        match (self.binding.registry(), self.binding.context()) {
            (Some(registry), Some(ctx)) => name_in_context(&registry, obj, ctx),
            _ => String::new(),
        }
    }

    /// Whether another subject of the context already uses `name`.
    fn is_duplicate(&self, obj: ObjectId, name: &str) -> bool {
        let (Some(observer), Some(ctx)) = (self.binding.observer(), self.binding.context()) else {
            return false;
        };
        let registry = observer.registry();
        observer
            .subjects()
            .into_iter()
            .filter(|subject| *subject != obj)
            .any(|subject| name_in_context(registry, subject, ctx) == name)
    }

    fn unique_name(&self, obj: ObjectId, base: &str) -> String {
        let mut n = 2;
        loop {
            let candidate = format!("{base} ({n})");
            if !self.is_duplicate(obj, &candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn conflicts(&self, obj: ObjectId, name: &str) -> bool {
        self.uniqueness_policy() == UniquenessPolicy::ProhibitDuplicateNames
            && self.is_duplicate(obj, name)
    }
}

/// The global object name: the managed name if set, otherwise the registry name.
fn object_name(registry: &SharedObjectRegistry, obj: ObjectId) -> String {
    let managed = store::get_shared_property(registry, obj, names::OBJECT_NAME);
    match managed.value().as_str() {
        Some(name) => name.to_string(),
        None => registry.object_name(obj).unwrap_or_default(),
    }
}

fn name_in_context(registry: &SharedObjectRegistry, obj: ObjectId, ctx: ContextId) -> String {
    match store::multi_context_value(registry, obj, names::INSTANCE_NAMES, ctx) {
        Variant::String(name) => name,
        _ => object_name(registry, obj),
    }
}

fn name_manager(registry: &SharedObjectRegistry, obj: ObjectId) -> Option<ContextId> {
    let prop = store::get_shared_property(registry, obj, names::OBJECT_NAME_MANAGER_ID);
    prop.value()
        .to_uint()
        .and_then(|raw| u32::try_from(raw).ok())
        .map(ContextId::new)
}

impl SubjectFilterHooks for NamingPolicyFilter {
    fn filter_name(&self) -> &str {
        FILTER_NAME
    }

    fn binding(&self) -> &FilterBinding {
        &self.binding
    }

    fn evaluate_attachment(&self, obj: ObjectId, _silent: bool) -> Evaluation {
        let Some(registry) = self.binding.registry() else {
            return Evaluation::Rejected(format!("{FILTER_NAME} is not bound to a context"));
        };
        let name = object_name(&registry, obj);
        if !self.is_valid_name(&name) {
            tracing::debug!(target: TARGET, ?obj, %name, "invalid subject name");
            return Evaluation::Rejected(format!("\"{name}\" is not a valid name in this context"));
        }
        if !self.conflicts(obj, &name) {
            return Evaluation::Allowed;
        }
        match self.resolution_policy() {
            ResolutionPolicy::AutoRename => Evaluation::Conditional,
            ResolutionPolicy::Reject => {
                tracing::debug!(target: TARGET, ?obj, %name, "duplicate subject name");
                Evaluation::Rejected(format!(
                    "A subject named \"{name}\" already exists in this context"
                ))
            }
        }
    }

    fn finalize_attachment(&self, obj: ObjectId, attach_successful: bool, import_cycle: bool) {
        if !attach_successful {
            return;
        }
        let (Some(registry), Some(ctx)) = (self.binding.registry(), self.binding.context()) else {
            return;
        };

        // Names supplied by an import stream are kept as-is.
        let imported_instance = import_cycle
            && matches!(
                store::multi_context_value(&registry, obj, names::INSTANCE_NAMES, ctx),
                Variant::String(_)
            );
        let imported_name = import_cycle
            && store::get_shared_property(&registry, obj, names::OBJECT_NAME)
                .value()
                .as_str()
                .is_some();

        let name = object_name(&registry, obj);
        let resolved = if imported_instance || imported_name || !self.conflicts(obj, &name) {
            name.clone()
        } else {
            self.unique_name(obj, &name)
        };

        if name_manager(&registry, obj).is_none() {
            store::set_shared_property(
                &registry,
                obj,
                SharedProperty::new(names::OBJECT_NAME_MANAGER_ID, u64::from(ctx.raw()))
                    .with_exportable(false),
            );
            if !imported_name {
                store::set_shared_property(
                    &registry,
                    obj,
                    SharedProperty::new(names::OBJECT_NAME, resolved.clone()),
                );
            }
            if registry.set_object_name(obj, resolved.clone()).is_err() {
                return;
            }
            tracing::trace!(target: TARGET, ?obj, context = %ctx, name = %resolved, "became name manager");
        } else if !imported_instance && resolved != name {
            store::set_multi_context_value(
                &registry,
                obj,
                names::INSTANCE_NAMES,
                ctx,
                resolved.clone(),
                true,
            );
            tracing::trace!(target: TARGET, ?obj, context = %ctx, name = %resolved, "assigned instance name");
        }
    }

    fn finalize_detachment(&self, obj: ObjectId, detach_successful: bool, subject_deleted: bool) {
        if !detach_successful || subject_deleted {
            return;
        }
        let (Some(registry), Some(ctx)) = (self.binding.registry(), self.binding.context()) else {
            return;
        };
        if name_manager(&registry, obj) == Some(ctx) {
            store::remove_property(&registry, obj, names::OBJECT_NAME_MANAGER_ID);
        }
    }

    fn monitored_properties(&self) -> Vec<String> {
        vec![names::OBJECT_NAME.to_string()]
    }

    fn reserved_properties(&self) -> Vec<String> {
        vec![
            names::OBJECT_NAME_MANAGER_ID.to_string(),
            names::INSTANCE_NAMES.to_string(),
        ]
    }

    fn handle_monitored_property_change(
        &self,
        obj: ObjectId,
        name: &str,
        value: &PropertyValue,
    ) -> bool {
        if name != names::OBJECT_NAME {
            return false;
        }
        let new_name = match value {
            PropertyValue::Shared(prop) => prop.value().as_str().unwrap_or_default().to_string(),
            PropertyValue::Plain(value) => value.as_str().unwrap_or_default().to_string(),
            PropertyValue::MultiContext(_) => return true,
        };
        if !self.is_valid_name(&new_name) {
            tracing::debug!(target: TARGET, ?obj, name = %new_name, "rename vetoed: invalid name");
            return true;
        }
        if self.conflicts(obj, &new_name) {
            tracing::debug!(target: TARGET, ?obj, name = %new_name, "rename vetoed: duplicate name");
            return true;
        }
        false
    }
}
