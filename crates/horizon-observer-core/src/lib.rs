//! Core object model for Horizon Observer.
//!
//! This crate provides the object registry that observer contexts operate on:
//!
//! - [`ObjectRegistry`] / [`SharedObjectRegistry`]: arena storage for objects
//!   with names, registered type tags, capability interfaces and property bags
//! - [`SharedProperty`], [`MultiContextProperty`] and plain [`Variant`] values
//! - [`store`]: the typed property store operations (get/set, bulk remove,
//!   clone, compare/diff, per-context cleanup)
//! - [`export`] and [`xml`]: versioned binary and XML property envelopes
//! - [`Signal`]: direct-dispatch change notifications
//! - [`logging`]: tracing targets and debug rendering

pub mod error;
pub mod export;
pub mod logging;
pub mod object;
pub mod property;
pub mod signal;
pub mod store;
pub mod variant;
pub mod xml;

pub use error::{CodecError, CodecResult, ObjectError, ObjectResult};
pub use export::{
    EXPORT_MARKER, ExportOptions, ExportVersion, ImportCompleteness, PropertyEnvelope,
    export_properties_binary, import_properties_binary,
};
pub use logging::{ObjectDebug, TreeFormatOptions, TreeStyle};
pub use object::{ContextId, ObjectId, ObjectRegistry, SharedObjectRegistry, TypeInfo};
pub use property::{
    MultiContextProperty, PropertyDiff, PropertyKind, PropertyKinds, PropertyValue, SharedProperty,
    names,
};
pub use signal::{ConnectionId, Signal};
pub use variant::{NON_EXPORTABLE_RENDERING, OpaqueValue, Variant};
pub use xml::{XmlElement, export_properties_xml, import_properties_xml};
