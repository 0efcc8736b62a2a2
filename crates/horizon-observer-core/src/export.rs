//! Versioned property envelopes.
//!
//! All exportable properties of an object are gathered into a
//! [`PropertyEnvelope`], which is then encoded as a binary stream (this
//! module) or an XML document ([`crate::xml`]).
//!
//! # Binary layout
//!
//! All integers are big-endian. Strings are a `u32` byte length followed by
//! UTF-8 bytes.
//!
//! ```text
//! u32 MARKER | u32 version | string producer
//! u32 shared_count | { string name, variant value [, u8 read_only, u8 removable] (V2) }*
//! u32 multi_count  | { string name, u32 n, { u32 context, variant value }* }*
//! u32 plain_count  | { string name, variant value }*
//! u32 MARKER
//! ```
//!
//! A variant is a tag byte followed by its payload.
//!
//! Imports decode the complete envelope before touching the target object,
//! so an `Err` never leaves partially imported state behind.

use std::io::{self, Read, Write};

use crate::error::{CodecError, CodecResult};
use crate::object::{ContextId, ObjectId, SharedObjectRegistry};
use crate::property::{MultiContextProperty, PropertyValue, SharedProperty};
use crate::store;
use crate::variant::Variant;

/// Marker written at the start and end of every binary envelope.
pub const EXPORT_MARKER: u32 = 0xDEAD_BEEF;

/// Envelope format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExportVersion {
    /// Shared properties carry name and value only.
    V1 = 1,
    /// Shared properties also carry their read-only and removable flags.
    V2 = 2,
}

impl ExportVersion {
    pub const CURRENT: Self = Self::V2;
    pub const MINIMUM: Self = Self::V1;

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Look up a version number, failing for numbers outside the supported range.
    pub fn from_u32(version: u32) -> CodecResult<Self> {
        match version {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            _ => Err(CodecError::UnsupportedVersion {
                version,
                min: Self::MINIMUM.as_u32(),
                max: Self::CURRENT.as_u32(),
            }),
        }
    }
}

impl Default for ExportVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Options controlling how envelopes are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub version: ExportVersion,
    /// Version string of the producing application.
    pub producer_version: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            version: ExportVersion::CURRENT,
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Outcome of an import that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportCompleteness {
    /// Every property in the envelope was applied.
    Complete,
    /// The envelope was valid but some properties could not be applied.
    Incomplete,
}

/// The exportable properties of one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyEnvelope {
    pub version: Option<ExportVersion>,
    pub producer_version: String,
    pub shared: Vec<SharedProperty>,
    pub multi_context: Vec<MultiContextProperty>,
    pub plain: Vec<(String, Variant)>,
    /// Entries present in the source document that could not be decoded.
    pub skipped: Vec<String>,
}

impl PropertyEnvelope {
    /// Gather the exportable properties of `obj`.
    ///
    /// Opaque values are left out, including individual opaque entries of
    /// multi-context properties. A multi-context property left without
    /// entries is not collected at all.
    pub fn collect(
        registry: &SharedObjectRegistry,
        obj: ObjectId,
        options: &ExportOptions,
    ) -> CodecResult<Self> {
        let mut envelope = Self {
            version: Some(options.version),
            producer_version: options.producer_version.clone(),
            ..Self::default()
        };
        registry.with_read(|r| -> CodecResult<()> {
            let properties = r.properties(obj).map_err(|_| CodecError::InvalidObject)?;
            for (name, value) in properties {
                if !value.is_exportable() {
                    continue;
                }
                match value {
                    PropertyValue::Shared(prop) => envelope.shared.push(prop.clone()),
                    PropertyValue::MultiContext(prop) => {
                        let mut copy = MultiContextProperty::new(name.clone());
                        for (ctx, v) in prop.values().filter(|(_, v)| v.is_exportable()) {
                            copy.set_value(ctx, v.clone());
                        }
                        if !copy.is_empty() {
                            envelope.multi_context.push(copy);
                        }
                    }
                    PropertyValue::Plain(v) => envelope.plain.push((name.clone(), v.clone())),
                }
            }
            Ok(())
        })?;
        Ok(envelope)
    }

    /// Write every property in the envelope onto `obj`.
    pub fn apply(
        self,
        registry: &SharedObjectRegistry,
        obj: ObjectId,
    ) -> CodecResult<ImportCompleteness> {
        if !registry.contains(obj) {
            return Err(CodecError::InvalidObject);
        }
        let mut failures = self.skipped.len();
        for name in &self.skipped {
            tracing::warn!(target: "horizon_observer_core::export", ?obj, %name, "skipped undecodable property");
        }
        for prop in self.shared {
            let name = prop.name().to_string();
            if !store::set_shared_property(registry, obj, prop) {
                tracing::warn!(target: "horizon_observer_core::export", ?obj, %name, "could not import shared property");
                failures += 1;
            }
        }
        for prop in self.multi_context {
            let name = prop.name().to_string();
            if !store::set_multi_context_property(registry, obj, prop) {
                tracing::warn!(target: "horizon_observer_core::export", ?obj, %name, "could not import multi-context property");
                failures += 1;
            }
        }
        for (name, value) in self.plain {
            if name.is_empty() || !store::set_plain_property(registry, obj, &name, value) {
                tracing::warn!(target: "horizon_observer_core::export", ?obj, %name, "could not import plain property");
                failures += 1;
            }
        }
        if failures == 0 {
            Ok(ImportCompleteness::Complete)
        } else {
            Ok(ImportCompleteness::Incomplete)
        }
    }

    // =========================================================================
    // Binary encoding
    // =========================================================================

    /// Encode the envelope as a binary stream.
    pub fn write_binary<W: Write>(&self, writer: &mut W) -> CodecResult<()> {
        let version = self.version.unwrap_or_default();
        write_u32(writer, EXPORT_MARKER)?;
        write_u32(writer, version.as_u32())?;
        write_string(writer, &self.producer_version)?;

        write_len(writer, self.shared.len())?;
        for prop in &self.shared {
            write_string(writer, prop.name())?;
            write_variant(writer, prop.value())?;
            if version >= ExportVersion::V2 {
                writer.write_all(&[u8::from(prop.is_read_only()), u8::from(prop.is_removable())])?;
            }
        }

        write_len(writer, self.multi_context.len())?;
        for prop in &self.multi_context {
            write_string(writer, prop.name())?;
            write_len(writer, prop.len())?;
            for (ctx, value) in prop.values() {
                write_u32(writer, ctx.raw())?;
                write_variant(writer, value)?;
            }
        }

        write_len(writer, self.plain.len())?;
        for (name, value) in &self.plain {
            write_string(writer, name)?;
            write_variant(writer, value)?;
        }

        write_u32(writer, EXPORT_MARKER)?;
        Ok(())
    }

    /// Decode a binary stream into an envelope.
    pub fn read_binary<R: Read>(reader: &mut R) -> CodecResult<Self> {
        expect_marker(reader)?;
        let version = ExportVersion::from_u32(read_u32(reader)?)?;
        let producer_version = read_string(reader)?;

        let mut shared = Vec::new();
        for _ in 0..read_u32(reader)? {
            let name = read_string(reader)?;
            let value = read_variant(reader)?;
            let mut prop = SharedProperty::new(name, value);
            if version >= ExportVersion::V2 {
                let mut flags = [0u8; 2];
                reader.read_exact(&mut flags)?;
                prop = prop.with_read_only(flags[0] != 0).with_removable(flags[1] != 0);
            }
            shared.push(prop);
        }

        let mut multi_context = Vec::new();
        for _ in 0..read_u32(reader)? {
            let mut prop = MultiContextProperty::new(read_string(reader)?);
            for _ in 0..read_u32(reader)? {
                let ctx = ContextId::new(read_u32(reader)?);
                prop.set_value(ctx, read_variant(reader)?);
            }
            multi_context.push(prop);
        }

        let mut plain = Vec::new();
        for _ in 0..read_u32(reader)? {
            let name = read_string(reader)?;
            plain.push((name, read_variant(reader)?));
        }

        expect_marker(reader)?;
        Ok(Self {
            version: Some(version),
            producer_version,
            shared,
            multi_context,
            plain,
            skipped: Vec::new(),
        })
    }
}

/// Export the exportable properties of `obj` as a binary envelope.
#[tracing::instrument(skip(registry, writer), target = "horizon_observer_core::export", level = "trace")]
pub fn export_properties_binary<W: Write>(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    writer: &mut W,
    options: &ExportOptions,
) -> CodecResult<()> {
    PropertyEnvelope::collect(registry, obj, options)?.write_binary(writer)
}

/// Import a binary envelope onto `obj`.
///
/// Returns `Err` (nothing imported) for a corrupt envelope, and
/// [`ImportCompleteness::Incomplete`] if some properties could not be applied.
#[tracing::instrument(skip(registry, reader), target = "horizon_observer_core::export", level = "trace")]
pub fn import_properties_binary<R: Read>(
    registry: &SharedObjectRegistry,
    obj: ObjectId,
    reader: &mut R,
) -> CodecResult<ImportCompleteness> {
    let envelope = PropertyEnvelope::read_binary(reader).inspect_err(|err| {
        tracing::warn!(target: "horizon_observer_core::export", ?obj, %err, "binary property import failed");
    })?;
    envelope.apply(registry, obj)
}

// =============================================================================
// Primitive codecs
// =============================================================================

const TAG_INVALID: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_STRING_LIST: u8 = 6;
const TAG_BYTES: u8 = 7;

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_be_bytes())
}

fn write_len<W: Write>(writer: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds u32"))?;
    write_u32(writer, len)
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_len(writer, bytes.len())?;
    writer.write_all(bytes)
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_bytes(writer, value.as_bytes())
}

fn write_variant<W: Write>(writer: &mut W, value: &Variant) -> CodecResult<()> {
    match value {
        Variant::Invalid => writer.write_all(&[TAG_INVALID])?,
        Variant::Bool(b) => writer.write_all(&[TAG_BOOL, u8::from(*b)])?,
        Variant::Int(i) => {
            writer.write_all(&[TAG_INT])?;
            writer.write_all(&i.to_be_bytes())?;
        }
        Variant::UInt(u) => {
            writer.write_all(&[TAG_UINT])?;
            writer.write_all(&u.to_be_bytes())?;
        }
        Variant::Double(d) => {
            writer.write_all(&[TAG_DOUBLE])?;
            writer.write_all(&d.to_bits().to_be_bytes())?;
        }
        Variant::String(s) => {
            writer.write_all(&[TAG_STRING])?;
            write_string(writer, s)?;
        }
        Variant::StringList(list) => {
            writer.write_all(&[TAG_STRING_LIST])?;
            write_len(writer, list.len())?;
            for item in list {
                write_string(writer, item)?;
            }
        }
        Variant::Bytes(bytes) => {
            writer.write_all(&[TAG_BYTES])?;
            write_bytes(writer, bytes)?;
        }
        Variant::Opaque(_) => return Err(CodecError::malformed("opaque values cannot be exported")),
    }
    Ok(())
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    read_array::<4, _>(reader).map(u32::from_be_bytes)
}

fn read_bytes<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u32(reader)? as usize;
    let mut buf = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated property stream"));
    }
    Ok(buf)
}

fn read_string<R: Read>(reader: &mut R) -> CodecResult<String> {
    String::from_utf8(read_bytes(reader)?).map_err(|_| CodecError::InvalidUtf8)
}

fn read_variant<R: Read>(reader: &mut R) -> CodecResult<Variant> {
    let [tag] = read_array::<1, _>(reader)?;
    let value = match tag {
        TAG_INVALID => Variant::Invalid,
        TAG_BOOL => Variant::Bool(read_array::<1, _>(reader)?[0] != 0),
        TAG_INT => Variant::Int(i64::from_be_bytes(read_array(reader)?)),
        TAG_UINT => Variant::UInt(u64::from_be_bytes(read_array(reader)?)),
        TAG_DOUBLE => Variant::Double(f64::from_bits(u64::from_be_bytes(read_array(reader)?))),
        TAG_STRING => Variant::String(read_string(reader)?),
        TAG_STRING_LIST => {
            let mut list = Vec::new();
            for _ in 0..read_u32(reader)? {
                list.push(read_string(reader)?);
            }
            Variant::StringList(list)
        }
        TAG_BYTES => Variant::Bytes(read_bytes(reader)?),
        other => return Err(CodecError::UnknownVariantTag(other)),
    };
    Ok(value)
}

fn expect_marker<R: Read>(reader: &mut R) -> CodecResult<()> {
    let found = read_u32(reader)?;
    if found != EXPORT_MARKER {
        return Err(CodecError::MissingMarker {
            expected: EXPORT_MARKER,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::TypeInfo;
    use crate::property::{PropertyKinds, names};

    fn populated() -> (SharedObjectRegistry, ObjectId) {
        let registry = SharedObjectRegistry::new();
        let obj = registry.register(TypeInfo::new("Thing"));
        store::set_shared_property(
            &registry,
            obj,
            SharedProperty::new("Title", "report").with_read_only(true),
        );
        store::set_multi_context_value(&registry, obj, "Weight", ContextId::new(1), 2.5, true);
        store::set_multi_context_value(&registry, obj, "Weight", ContextId::new(4), -1, true);
        store::set_plain_property(&registry, obj, "Tags", vec!["a".to_string(), "b".to_string()]);
        store::set_plain_property(&registry, obj, "Blob", vec![0u8, 255, 7]);
        store::set_plain_property(&registry, obj, "Handle", Variant::opaque(3u8));
        store::set_multi_context_value(&registry, obj, names::OBSERVER_MAP, ContextId::new(1), 9u64, false);
        (registry, obj)
    }

    #[test]
    fn test_binary_round_trip() {
        let (registry, obj) = populated();
        let mut buf = Vec::new();
        export_properties_binary(&registry, obj, &mut buf, &ExportOptions::default()).unwrap();

        let fresh = registry.register(TypeInfo::new("Thing"));
        let outcome = import_properties_binary(&registry, fresh, &mut buf.as_slice()).unwrap();
        assert_eq!(outcome, ImportCompleteness::Complete);
        assert!(store::compare_dynamic_properties(
            &registry,
            obj,
            fresh,
            PropertyKinds::ALL,
            None,
            &["Handle"],
        ));
        assert!(!store::property_exists(&registry, fresh, "Handle"));
        assert!(!store::property_exists(&registry, fresh, names::OBSERVER_MAP));
        assert!(store::get_shared_property(&registry, fresh, "Title").is_read_only());
    }

    #[test]
    fn test_opaque_only_multi_context_property_is_not_collected() {
        let (registry, obj) = populated();
        store::set_multi_context_value(&registry, obj, "Cache", ContextId::new(1), Variant::opaque(1u8), true);
        store::set_multi_context_value(&registry, obj, "Cache", ContextId::new(4), Variant::opaque(2u8), true);

        let envelope = PropertyEnvelope::collect(&registry, obj, &ExportOptions::default()).unwrap();
        assert!(envelope.multi_context.iter().all(|p| p.name() != "Cache"));
        assert!(envelope.multi_context.iter().any(|p| p.name() == "Weight"));

        let mut buf = Vec::new();
        export_properties_binary(&registry, obj, &mut buf, &ExportOptions::default()).unwrap();
        let fresh = registry.register(TypeInfo::new("Thing"));
        import_properties_binary(&registry, fresh, &mut buf.as_slice()).unwrap();
        assert!(!store::property_exists(&registry, fresh, "Cache"));
    }

    #[test]
    fn test_v1_drops_shared_flags() {
        let (registry, obj) = populated();
        let options = ExportOptions {
            version: ExportVersion::V1,
            ..ExportOptions::default()
        };
        let mut buf = Vec::new();
        export_properties_binary(&registry, obj, &mut buf, &options).unwrap();

        let envelope = PropertyEnvelope::read_binary(&mut buf.as_slice()).unwrap();
        assert_eq!(envelope.version, Some(ExportVersion::V1));
        assert!(!envelope.shared[0].is_read_only());
    }

    #[test]
    fn test_corrupt_marker_fails_without_side_effects() {
        let (registry, obj) = populated();
        let mut buf = Vec::new();
        export_properties_binary(&registry, obj, &mut buf, &ExportOptions::default()).unwrap();
        buf[0] = 0;

        let fresh = registry.register(TypeInfo::default());
        let err = import_properties_binary(&registry, fresh, &mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CodecError::MissingMarker { .. }));
        assert!(registry.property_names(fresh).unwrap().is_empty());
    }

    #[test]
    fn test_trailing_marker_is_checked() {
        let (registry, obj) = populated();
        let mut buf = Vec::new();
        export_properties_binary(&registry, obj, &mut buf, &ExportOptions::default()).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let fresh = registry.register(TypeInfo::default());
        assert!(import_properties_binary(&registry, fresh, &mut buf.as_slice()).is_err());
        assert!(registry.property_names(fresh).unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_version_fails() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&EXPORT_MARKER.to_be_bytes());
        buf.extend_from_slice(&99u32.to_be_bytes());
        let err = PropertyEnvelope::read_binary(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion { version: 99, .. }));
    }

    #[test]
    fn test_unnamed_entry_is_incomplete() {
        let registry = SharedObjectRegistry::new();
        let obj = registry.register(TypeInfo::default());
        let envelope = PropertyEnvelope {
            version: Some(ExportVersion::V2),
            plain: vec![(String::new(), Variant::Int(1)), ("ok".to_string(), Variant::Int(2))],
            ..PropertyEnvelope::default()
        };
        let mut buf = Vec::new();
        envelope.write_binary(&mut buf).unwrap();

        let outcome = import_properties_binary(&registry, obj, &mut buf.as_slice()).unwrap();
        assert_eq!(outcome, ImportCompleteness::Incomplete);
        assert_eq!(store::get_plain_property(&registry, obj, "ok"), Variant::Int(2));
    }

    #[test]
    fn test_truncated_stream_is_io_error() {
        let (registry, obj) = populated();
        let mut buf = Vec::new();
        export_properties_binary(&registry, obj, &mut buf, &ExportOptions::default()).unwrap();
        buf.truncate(buf.len() / 2);
        let err = PropertyEnvelope::read_binary(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }
}
