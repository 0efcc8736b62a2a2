//! Log targets and diagnostic rendering.
//!
//! Every `tracing` event in the workspace uses one of the [`targets`]
//! constants, so subsystems can be filtered independently:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("horizon_observer=debug,horizon_observer_core::export=warn")
//!     .init();
//! ```

use std::fmt::Write as FmtWrite;

use crate::object::{ObjectId, SharedObjectRegistry};
use crate::error::ObjectResult;

/// `tracing` targets, one per subsystem.
pub mod targets {
    /// Object registry target.
    pub const OBJECT: &str = "horizon_observer_core::object";
    /// Property store target.
    pub const PROPERTY: &str = "horizon_observer_core::property";
    /// Binary and XML envelope target.
    pub const EXPORT: &str = "horizon_observer_core::export";
    /// Signal emission target.
    pub const SIGNAL: &str = "horizon_observer_core::signal";
    /// Observer attach/detach target.
    pub const OBSERVER: &str = "horizon_observer::observer";
    /// Subject filter target.
    pub const FILTER: &str = "horizon_observer::filter";
    /// Object manager target.
    pub const MANAGER: &str = "horizon_observer::manager";
    /// Relational table target.
    pub const RELATIONAL: &str = "horizon_observer::relational";
}

/// Branch glyphs used by [`ObjectDebug::tree_prefix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeStyle {
    Ascii,
    #[default]
    Unicode,
}

/// What [`ObjectDebug`] includes.
#[derive(Debug, Clone)]
pub struct TreeFormatOptions {
    pub style: TreeStyle,
    /// Append `[id]`.
    pub show_ids: bool,
    /// Append the short type name.
    pub show_types: bool,
    /// Whether to list properties with their rendered values.
    pub show_properties: bool,
    /// Whether internal bookkeeping properties are listed.
    pub show_internal: bool,
    /// Spaces between branch glyphs per level.
    pub indent_size: usize,
}

impl Default for TreeFormatOptions {
    fn default() -> Self {
        Self {
            style: TreeStyle::default(),
            show_ids: true,
            show_types: true,
            show_properties: false,
            show_internal: false,
            indent_size: 2,
        }
    }
}

impl TreeFormatOptions {
    /// Options for detailed debugging output.
    pub fn detailed() -> Self {
        Self {
            show_properties: true,
            show_internal: true,
            ..Default::default()
        }
    }

    /// Options for minimal output: names only.
    pub fn minimal() -> Self {
        Self {
            show_ids: false,
            show_types: false,
            ..Default::default()
        }
    }
}

/// Renders objects and tree nodes for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ObjectDebug {
    options: TreeFormatOptions,
}

impl ObjectDebug {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: TreeFormatOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TreeFormatOptions {
        &self.options
    }

    /// Describe one object on a single line: `name [id] (type)`.
    pub fn describe(&self, registry: &SharedObjectRegistry, id: ObjectId) -> ObjectResult<String> {
        let name = registry.object_name(id)?;
        let type_info = registry.type_info(id)?;

        let mut out = String::new();
        out.push_str(if name.is_empty() { "(unnamed)" } else { &name });
        if self.options.show_ids {
            let _ = write!(out, " [{id:?}]");
        }
        if self.options.show_types {
            let type_name = type_info.name();
            let short = type_name.rsplit("::").next().unwrap_or(type_name);
            let _ = write!(out, " ({short})");
        }
        Ok(out)
    }

    /// Describe one object with its properties, one per line.
    pub fn format_object(&self, registry: &SharedObjectRegistry, id: ObjectId) -> ObjectResult<String> {
        let mut out = self.describe(registry, id)?;
        out.push('\n');
        if self.options.show_properties {
            for line in self.property_lines(registry, id)? {
                let _ = writeln!(out, "  .{line}");
            }
        }
        Ok(out)
    }

    /// Rendered `name = value` lines for the object's properties.
    pub fn property_lines(
        &self,
        registry: &SharedObjectRegistry,
        id: ObjectId,
    ) -> ObjectResult<Vec<String>> {
        registry.with_read(|r| {
            Ok(r.properties(id)?
                .iter()
                .filter(|(name, _)| self.options.show_internal || !crate::property::names::is_internal(name))
                .map(|(name, value)| format!("{name} = {}", value.render()))
                .collect())
        })
    }

    /// Build the branch prefix for a tree node at `depth`.
    pub fn tree_prefix(&self, depth: usize, is_last: bool) -> String {
        if depth == 0 {
            return String::new();
        }
        let (branch, tee, corner) = match self.options.style {
            TreeStyle::Ascii => ("|", "+--", "`--"),
            TreeStyle::Unicode => ("\u{2502}", "\u{251c}\u{2500}\u{2500}", "\u{2514}\u{2500}\u{2500}"),
        };

        let mut prefix = String::new();
        for _ in 0..(depth - 1) {
            prefix.push_str(branch);
            prefix.push_str(&" ".repeat(self.options.indent_size));
        }
        prefix.push_str(if is_last { corner } else { tee });
        prefix.push(' ');
        prefix
    }
}
