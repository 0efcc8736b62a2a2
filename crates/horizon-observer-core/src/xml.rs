//! XML property envelopes.
//!
//! The XML form of a [`PropertyEnvelope`] looks like:
//!
//! ```xml
//! <Properties ExportVersion="2" ProducerVersion="0.1.0">
//!   <PropertyS_0 Name="Title" Type="String" Value="report" ReadOnly="false" Removable="true"/>
//!   <PropertyM_0 Name="Weight">
//!     <Context ID="1" Type="Double" Value="2.5"/>
//!   </PropertyM_0>
//!   <PropertyN Name="Tags" Type="StringList" Value="a,b"/>
//! </Properties>
//! ```
//!
//! String lists are comma-joined and byte arrays base64 encoded, see
//! [`Variant::render`].

use std::fmt;
use std::io::Write;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{CodecError, CodecResult};
use crate::export::{ExportOptions, ExportVersion, ImportCompleteness, PropertyEnvelope};
use crate::object::{ContextId, ObjectId, SharedObjectRegistry};
use crate::property::{MultiContextProperty, SharedProperty};
use crate::variant::Variant;

const ROOT: &str = "Properties";
const SHARED_PREFIX: &str = "PropertyS_";
const MULTI_PREFIX: &str = "PropertyM_";
const PLAIN: &str = "PropertyN";
const CONTEXT: &str = "Context";

/// A minimal XML element tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder form of [`XmlElement::set_attribute`].
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing one with the same name.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn children(&self) -> &[XmlElement] {
        &self.children
    }

    pub fn add_child(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    fn write_to<W: Write>(&self, writer: &mut Writer<W>) -> CodecResult<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }
        if self.children.is_empty() {
            writer
                .write_event(Event::Empty(start))
                .map_err(CodecError::xml)?;
        } else {
            writer
                .write_event(Event::Start(start))
                .map_err(CodecError::xml)?;
            for child in &self.children {
                child.write_to(writer)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new(self.name.as_str())))
                .map_err(CodecError::xml)?;
        }
        Ok(())
    }

    /// Serialize the element and its children, indented by two spaces.
    pub fn to_xml_string(&self) -> CodecResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write_to(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Parse a document and return its root element.
    pub fn parse(text: &str) -> CodecResult<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut root: Option<XmlElement> = None;
        let mut stack: Vec<XmlElement> = Vec::new();
        loop {
            match reader.read_event().map_err(CodecError::xml)? {
                Event::Eof => break,
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(empty) => {
                    let element = element_from_start(&empty)?;
                    match stack.last_mut() {
                        Some(parent) => parent.add_child(element),
                        None => root = Some(element),
                    }
                }
                Event::End(_) => {
                    let Some(element) = stack.pop() else {
                        return Err(CodecError::malformed("unbalanced end tag"));
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.add_child(element),
                        None => root = Some(element),
                    }
                }
                _ => {}
            }
        }
        if !stack.is_empty() {
            return Err(CodecError::malformed("unclosed element"));
        }
        root.ok_or_else(|| CodecError::malformed("document has no root element"))
    }
}

impl fmt::Display for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_xml_string() {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> CodecResult<XmlElement> {
    let name = String::from_utf8(start.name().as_ref().to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
    let mut element = XmlElement::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(CodecError::xml)?;
        let key = String::from_utf8(attr.key.as_ref().to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
        let value = attr.unescape_value().map_err(CodecError::xml)?;
        element.set_attribute(key, value.into_owned());
    }
    Ok(element)
}

fn value_element(name: impl Into<String>, value: &Variant) -> XmlElement {
    XmlElement::new(name)
        .with_attribute("Type", value.type_name())
        .with_attribute("Value", value.render())
}

fn decode_value(element: &XmlElement) -> Option<Variant> {
    let type_name = element.attribute("Type")?;
    let text = element.attribute("Value").unwrap_or_default();
    Variant::from_rendered(type_name, text)
}

impl PropertyEnvelope {
    /// Encode the envelope as an XML element tree.
    pub fn to_xml(&self) -> XmlElement {
        let version = self.version.unwrap_or_default();
        let mut root = XmlElement::new(ROOT)
            .with_attribute("ExportVersion", version.as_u32().to_string())
            .with_attribute("ProducerVersion", self.producer_version.as_str());

        for (i, prop) in self.shared.iter().enumerate() {
            let mut element = value_element(format!("{SHARED_PREFIX}{i}"), prop.value())
                .with_attribute("Name", prop.name());
            if version >= ExportVersion::V2 {
                element.set_attribute("ReadOnly", prop.is_read_only().to_string());
                element.set_attribute("Removable", prop.is_removable().to_string());
            }
            root.add_child(element);
        }
        for (i, prop) in self.multi_context.iter().enumerate() {
            let mut element =
                XmlElement::new(format!("{MULTI_PREFIX}{i}")).with_attribute("Name", prop.name());
            for (ctx, value) in prop.values() {
                element.add_child(value_element(CONTEXT, value).with_attribute("ID", ctx.raw().to_string()));
            }
            root.add_child(element);
        }
        for (name, value) in &self.plain {
            root.add_child(value_element(PLAIN, value).with_attribute("Name", name.as_str()));
        }
        root
    }

    /// Decode an XML element tree.
    ///
    /// A wrong root element or an unsupported version fails the decode.
    /// Individual entries that cannot be decoded are recorded in
    /// [`PropertyEnvelope::skipped`].
    pub fn from_xml(root: &XmlElement) -> CodecResult<Self> {
        if root.name() != ROOT {
            return Err(CodecError::malformed(format!(
                "expected <{ROOT}> root, found <{}>",
                root.name()
            )));
        }
        let version = root
            .attribute("ExportVersion")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| CodecError::malformed("missing or invalid ExportVersion"))?;
        let version = ExportVersion::from_u32(version)?;

        let mut envelope = Self {
            version: Some(version),
            producer_version: root.attribute("ProducerVersion").unwrap_or_default().to_string(),
            ..Self::default()
        };
        for child in root.children() {
            let label = child.attribute("Name").unwrap_or(child.name()).to_string();
            let decoded = if child.name().starts_with(SHARED_PREFIX) {
                decode_shared(child, version).map(|p| envelope.shared.push(p))
            } else if child.name().starts_with(MULTI_PREFIX) {
                decode_multi(child).map(|p| envelope.multi_context.push(p))
            } else if child.name() == PLAIN {
                decode_plain(child).map(|p| envelope.plain.push(p))
            } else {
                None
            };
            if decoded.is_none() {
                envelope.skipped.push(label);
            }
        }
        Ok(envelope)
    }
}

fn decode_shared(element: &XmlElement, version: ExportVersion) -> Option<SharedProperty> {
    let name = element.attribute("Name")?;
    let mut prop = SharedProperty::new(name, decode_value(element)?);
    if version >= ExportVersion::V2 {
        let flag = |attr: &str, default: bool| {
            element
                .attribute(attr)
                .map_or(Some(default), |v| v.parse::<bool>().ok())
        };
        prop = prop
            .with_read_only(flag("ReadOnly", false)?)
            .with_removable(flag("Removable", true)?);
    }
    Some(prop)
}

fn decode_multi(element: &XmlElement) -> Option<MultiContextProperty> {
    let mut prop = MultiContextProperty::new(element.attribute("Name")?);
    for context in element.children() {
        if context.name() != CONTEXT {
            return None;
        }
        let id = context.attribute("ID")?.parse::<u32>().ok()?;
        prop.set_value(ContextId::new(id), decode_value(context)?);
    }
    Some(prop)
}

fn decode_plain(element: &XmlElement) -> Option<(String, Variant)> {
    let name = element.attribute("Name")?;
    Some((name.to_string(), decode_value(element)?))
}

/// Export the exportable properties of `obj` as an XML document.
#[tracing::instrument(skip(registry), target = "horizon_observer_core::export", level = "trace")]
pub fn export_properties_xml(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    options: &ExportOptions,
) -> CodecResult<String> {
    PropertyEnvelope::collect(registry, obj, options)?
        .to_xml()
        .to_xml_string()
}

/// Import an XML document onto `obj`.
///
/// Same outcome rules as [`crate::export::import_properties_binary`].
#[tracing::instrument(skip(registry, document), target = "horizon_observer_core::export", level = "trace")]
pub fn import_properties_xml(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    document: &str,
) -> CodecResult<ImportCompleteness> {
    let envelope = XmlElement::parse(document)
        .and_then(|root| PropertyEnvelope::from_xml(&root))
        .inspect_err(|err| {
            tracing::warn!(target: "horizon_observer_core::export", ?obj, %err, "XML property import failed");
        })?;
    envelope.apply(registry, obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::TypeInfo;
    use crate::property::PropertyKinds;
    use crate::store;

    fn populated() -> (SharedObjectRegistry, ObjectId) {
        let registry = SharedObjectRegistry::new();
        let obj = registry.register(TypeInfo::new("Thing"));
        store::set_shared_property(
            &registry,
            obj,
            SharedProperty::new("Title", "a \"quoted\" <title>").with_removable(false),
        );
        store::set_multi_context_value(&registry, obj, "Weight", ContextId::new(1), 2.5, true);
        store::set_multi_context_value(&registry, obj, "Weight", ContextId::new(3), true, true);
        store::set_plain_property(&registry, obj, "Tags", vec!["a".to_string(), "b".to_string()]);
        store::set_plain_property(&registry, obj, "Blob", b"bytes".to_vec());
        (registry, obj)
    }

    #[test]
    fn test_xml_round_trip() {
        let (registry, obj) = populated();
        let document = export_properties_xml(&registry, obj, &ExportOptions::default()).unwrap();
        assert!(document.contains("<PropertyS_0"));
        assert!(document.contains("<PropertyM_0"));
        assert!(document.contains("Value=\"a,b\""));

        let fresh = registry.register(TypeInfo::new("Thing"));
        let outcome = import_properties_xml(&registry, fresh, &document).unwrap();
        assert_eq!(outcome, ImportCompleteness::Complete);
        assert!(store::compare_dynamic_properties(
            &registry,
            obj,
            fresh,
            PropertyKinds::ALL,
            None,
            &[],
        ));
    }

    #[test]
    fn test_wrong_root_fails() {
        let registry = SharedObjectRegistry::new();
        let obj = registry.register(TypeInfo::default());
        let err = import_properties_xml(&registry, obj, "<Other ExportVersion=\"2\"/>").unwrap_err();
        assert!(matches!(err, CodecError::MalformedDocument(_)));
    }

    #[test]
    fn test_unsupported_version_fails() {
        let registry = SharedObjectRegistry::new();
        let obj = registry.register(TypeInfo::default());
        let err = import_properties_xml(&registry, obj, "<Properties ExportVersion=\"7\"/>").unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion { version: 7, .. }));
    }

    #[test]
    fn test_bad_entry_is_incomplete() {
        let registry = SharedObjectRegistry::new();
        let obj = registry.register(TypeInfo::default());
        let document = r#"<Properties ExportVersion="2" ProducerVersion="x">
            <PropertyN Name="Good" Type="Int" Value="4"/>
            <PropertyN Name="Bad" Type="Int" Value="four"/>
        </Properties>"#;
        let outcome = import_properties_xml(&registry, obj, document).unwrap();
        assert_eq!(outcome, ImportCompleteness::Incomplete);
        assert_eq!(store::get_plain_property(&registry, obj, "Good"), Variant::Int(4));
        assert!(!store::property_exists(&registry, obj, "Bad"));
    }

    #[test]
    fn test_unclosed_document_fails() {
        assert!(XmlElement::parse("<Properties ExportVersion=\"2\">").is_err());
    }
}
