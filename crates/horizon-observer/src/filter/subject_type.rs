//! Type-based attach filtering.

use horizon_observer_core::ObjectId;
use parking_lot::RwLock;

use super::{Evaluation, FilterBinding, SubjectFilterHooks};
use crate::error::FilterError;

const TARGET: &str = "horizon_observer::filter";
const FILTER_NAME: &str = "Subject Type Filter";

/// One allowed (or, when inverted, denied) subject type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectTypeInfo {
    /// Registered type tag tested with [`TypeInfo::inherits`](horizon_observer_core::TypeInfo::inherits).
    pub meta_type: String,
    pub display_name: String,
}

impl SubjectTypeInfo {
    pub fn new(meta_type: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            meta_type: meta_type.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Default)]
struct TypeList {
    group_name: String,
    types: Vec<SubjectTypeInfo>,
    inverse: bool,
}

/// Restricts which object types may attach to a context.
///
/// The type list and the inverse flag are locked once the context has subjects.
#[derive(Debug, Default)]
pub struct SubjectTypeFilter {
    binding: FilterBinding,
    list: RwLock<TypeList>,
}

impl SubjectTypeFilter {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            binding: FilterBinding::new(),
            list: RwLock::new(TypeList {
                group_name: group_name.into(),
                ..TypeList::default()
            }),
        }
    }

    /// Display name for the group of allowed types.
    pub fn group_name(&self) -> String {
        self.list.read().group_name.clone()
    }

    pub fn set_group_name(&self, name: impl Into<String>) {
        self.list.write().group_name = name.into();
    }

    /// Add a type to the list.
    pub fn add_subject_type(&self, info: SubjectTypeInfo) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        let mut list = self.list.write();
        if list.types.iter().any(|t| t.meta_type == info.meta_type) {
            return Err(FilterError::DuplicateSubjectType(info.meta_type));
        }
        list.types.push(info);
        Ok(())
    }

    pub fn known_subject_types(&self) -> Vec<SubjectTypeInfo> {
        self.list.read().types.clone()
    }

    /// Whether `meta_type` is in the list, regardless of the inverse flag.
    pub fn is_known_type(&self, meta_type: &str) -> bool {
        self.list.read().types.iter().any(|t| t.meta_type == meta_type)
    }

    /// Turn the list into a deny-list (or back).
    pub fn enable_inverse_filtering(&self, inverse: bool) -> Result<(), FilterError> {
        self.binding.ensure_unlocked(FILTER_NAME)?;
        self.list.write().inverse = inverse;
        Ok(())
    }

    pub fn inverse_filtering_enabled(&self) -> bool {
        self.list.read().inverse
    }
}

impl SubjectFilterHooks for SubjectTypeFilter {
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
        let list = self.list.read();
        let matched = list
            .types
            .iter()
            .any(|t| registry.inherits(obj, &t.meta_type));
        if matched != list.inverse {
            return Evaluation::Allowed;
        }
        let type_name = registry
            .type_info(obj)
            .map(|info| info.name().to_string())
            .unwrap_or_default();
        let reason = if list.inverse {
            format!("subjects of type \"{type_name}\" are not allowed in this context")
        } else {
            format!("subjects of type \"{type_name}\" are not supported by this context")
        };
        tracing::debug!(target: TARGET, ?obj, %type_name, inverse = list.inverse, "subject type rejected");
        Evaluation::Rejected(reason)
    }
}
