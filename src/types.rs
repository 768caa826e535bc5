use crate::error::WireError;
use crate::name::Name;
use crate::wire::{WireReader, WireWriter};
use crate::SmallKeyHashMap;

/// Reference to a value type.
///
/// Three reserved sentinels describe the non-value node kinds; every other
/// value is an index into a [`TypeRegistry`]. Folding kind and concrete type
/// into one field lets delta records carry both in a single varint.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TypeRef(u16);

impl TypeRef {
    pub const EMPTY: TypeRef = TypeRef(0);
    pub const ARRAY: TypeRef = TypeRef(1);
    pub const MAP: TypeRef = TypeRef(2);
    /// First raw value that denotes a concrete registry type.
    pub const FIRST_CONCRETE: u16 = 3;

    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_concrete(self) -> bool {
        self.0 >= Self::FIRST_CONCRETE
    }

    pub fn is_container(self) -> bool {
        self == Self::ARRAY || self == Self::MAP
    }

    pub fn write(self, w: &mut WireWriter) {
        w.write_u32v(u32::from(self.0));
    }

    pub fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let raw = r.read_u32v()?;
        u16::try_from(raw)
            .map(TypeRef)
            .map_err(|_| WireError::VarintOverflow)
    }
}

impl Default for TypeRef {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Operations a registered value type provides: default construction, compare,
/// the wire codec, and a display hook for tree dumps. Payloads are opaque byte
/// strings; the registry is the only party that interprets them.
#[derive(Clone, Copy)]
pub struct ValueOps {
    pub default_bytes: fn() -> Box<[u8]>,
    pub equals: fn(&[u8], &[u8]) -> bool,
    pub write: fn(&mut WireWriter, &[u8]),
    pub read: fn(&mut WireReader<'_>) -> Result<Box<[u8]>, WireError>,
    pub display: fn(&[u8]) -> String,
}

impl ValueOps {
    /// Plain-binary codec: byte equality, length-prefixed payload. The
    /// fallback for types without a net-aware serializer.
    pub fn plain_binary() -> Self {
        Self {
            default_bytes: || Box::from([].as_slice()),
            equals: |a, b| a == b,
            write: |w, bytes| w.write_bytes(bytes),
            read: |r| Ok(Box::from(r.read_bytes()?)),
            display: |bytes| format!("<{} bytes>", bytes.len()),
        }
    }
}

pub struct TypeInfo {
    pub name: Name,
    pub ops: ValueOps,
}

/// Descriptions of the concrete value types a tree can hold.
///
/// Server and client must register the same types in the same order; the wire
/// carries [`TypeRef`] indices, and an index the receiver has not registered
/// yet is the "unmapped type" condition that defers the packet.
#[derive(Default)]
pub struct TypeRegistry {
    infos: Vec<TypeInfo>,
    by_name: SmallKeyHashMap<Name, TypeRef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the builtin wrapper types in their
    /// canonical order (see [`builtin`]).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("bool", builtin::bool_ops());
        registry.register("i64", builtin::i64_ops());
        registry.register("f32", builtin::f32_ops());
        registry.register("name", builtin::name_ops());
        registry.register("str", builtin::str_ops());
        registry.register("vec3", builtin::vec3_ops());
        registry.register("rot3", builtin::rot3_ops());
        registry
    }

    pub fn register(&mut self, name: &str, ops: ValueOps) -> TypeRef {
        let name = Name::new(name);
        if let Some(existing) = self.by_name.get(&name) {
            return *existing;
        }
        let type_ref = TypeRef(TypeRef::FIRST_CONCRETE + self.infos.len() as u16);
        self.infos.push(TypeInfo {
            name: name.clone(),
            ops,
        });
        self.by_name.insert(name, type_ref);
        type_ref
    }

    pub fn type_count(&self) -> usize {
        self.infos.len()
    }

    /// The [`TypeInfo`] of a concrete type, or `None` for sentinels and
    /// unmapped indices.
    pub fn resolve(&self, type_ref: TypeRef) -> Option<&TypeInfo> {
        if !type_ref.is_concrete() {
            return None;
        }
        self.infos
            .get(usize::from(type_ref.raw() - TypeRef::FIRST_CONCRETE))
    }

    /// Whether this registry can interpret `type_ref`. Sentinels always map.
    pub fn is_mapped(&self, type_ref: TypeRef) -> bool {
        !type_ref.is_concrete() || self.resolve(type_ref).is_some()
    }

    pub fn find(&self, name: &str) -> Option<TypeRef> {
        self.by_name.get(&Name::new(name)).copied()
    }

    pub fn display_name(&self, type_ref: TypeRef) -> String {
        match type_ref {
            TypeRef::EMPTY => "Empty".to_owned(),
            TypeRef::ARRAY => "Array".to_owned(),
            TypeRef::MAP => "Map".to_owned(),
            other => match self.resolve(other) {
                Some(info) => info.name.to_string(),
                None => format!("<unmapped:{}>", other.raw()),
            },
        }
    }
}

/// Builtin wrapper types and their byte encodings.
///
/// The [`TypeRef`] constants assume the registration order of
/// [`TypeRegistry::with_builtins`].
pub mod builtin {
    use super::*;

    pub const BOOL: TypeRef = TypeRef(TypeRef::FIRST_CONCRETE);
    pub const I64: TypeRef = TypeRef(TypeRef::FIRST_CONCRETE + 1);
    pub const F32: TypeRef = TypeRef(TypeRef::FIRST_CONCRETE + 2);
    pub const NAME: TypeRef = TypeRef(TypeRef::FIRST_CONCRETE + 3);
    pub const STR: TypeRef = TypeRef(TypeRef::FIRST_CONCRETE + 4);
    pub const VEC3: TypeRef = TypeRef(TypeRef::FIRST_CONCRETE + 5);
    pub const ROT3: TypeRef = TypeRef(TypeRef::FIRST_CONCRETE + 6);

    pub fn bool_bytes(value: bool) -> Box<[u8]> {
        Box::from([value as u8].as_slice())
    }

    pub fn bytes_bool(bytes: &[u8]) -> Option<bool> {
        bytes.first().map(|b| *b != 0)
    }

    pub fn i64_bytes(value: i64) -> Box<[u8]> {
        Box::from(value.to_le_bytes().as_slice())
    }

    pub fn bytes_i64(bytes: &[u8]) -> Option<i64> {
        bytes.try_into().ok().map(i64::from_le_bytes)
    }

    pub fn f32_bytes(value: f32) -> Box<[u8]> {
        Box::from(value.to_le_bytes().as_slice())
    }

    pub fn bytes_f32(bytes: &[u8]) -> Option<f32> {
        bytes.try_into().ok().map(f32::from_le_bytes)
    }

    pub fn name_bytes(value: &Name) -> Box<[u8]> {
        Box::from(value.as_str().as_bytes())
    }

    pub fn bytes_name(bytes: &[u8]) -> Option<Name> {
        std::str::from_utf8(bytes).ok().map(Name::new)
    }

    pub fn str_bytes(value: &str) -> Box<[u8]> {
        Box::from(value.as_bytes())
    }

    pub fn bytes_str(bytes: &[u8]) -> Option<String> {
        std::str::from_utf8(bytes).ok().map(str::to_owned)
    }

    pub fn triple_bytes(value: [f32; 3]) -> Box<[u8]> {
        let mut out = Vec::with_capacity(12);
        for component in value {
            out.extend_from_slice(&component.to_le_bytes());
        }
        out.into_boxed_slice()
    }

    pub fn bytes_triple(bytes: &[u8]) -> Option<[f32; 3]> {
        if bytes.len() != 12 {
            return None;
        }
        let mut out = [0.0f32; 3];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            out[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(out)
    }

    pub(super) fn bool_ops() -> ValueOps {
        ValueOps {
            default_bytes: || bool_bytes(false),
            equals: |a, b| a == b,
            write: |w, bytes| w.write_u8(bytes.first().copied().unwrap_or(0)),
            read: |r| Ok(Box::from([r.read_u8()?].as_slice())),
            display: |bytes| match bytes_bool(bytes) {
                Some(v) => v.to_string(),
                None => "<bad bool>".to_owned(),
            },
        }
    }

    pub(super) fn i64_ops() -> ValueOps {
        ValueOps {
            default_bytes: || i64_bytes(0),
            equals: |a, b| a == b,
            // Net-aware form: zigzag varint instead of the 8 stored bytes.
            write: |w, bytes| w.write_i64v(bytes_i64(bytes).unwrap_or(0)),
            read: |r| Ok(i64_bytes(r.read_i64v()?)),
            display: |bytes| match bytes_i64(bytes) {
                Some(v) => v.to_string(),
                None => "<bad i64>".to_owned(),
            },
        }
    }

    pub(super) fn f32_ops() -> ValueOps {
        ValueOps {
            default_bytes: || f32_bytes(0.0),
            equals: |a, b| a == b,
            write: |w, bytes| w.write_raw(bytes),
            read: |r| Ok(f32_bytes(r.read_f32()?)),
            display: |bytes| match bytes_f32(bytes) {
                Some(v) => v.to_string(),
                None => "<bad f32>".to_owned(),
            },
        }
    }

    pub(super) fn name_ops() -> ValueOps {
        ValueOps {
            default_bytes: || Box::from([].as_slice()),
            equals: |a, b| a == b,
            write: |w, bytes| w.write_bytes(bytes),
            read: |r| Ok(Box::from(r.read_bytes()?)),
            display: |bytes| match bytes_name(bytes) {
                Some(v) => format!("{:?}", v.as_str()),
                None => "<bad name>".to_owned(),
            },
        }
    }

    pub(super) fn str_ops() -> ValueOps {
        ValueOps {
            default_bytes: || Box::from([].as_slice()),
            equals: |a, b| a == b,
            write: |w, bytes| w.write_bytes(bytes),
            read: |r| Ok(Box::from(r.read_bytes()?)),
            display: |bytes| match bytes_str(bytes) {
                Some(v) => format!("{v:?}"),
                None => "<bad str>".to_owned(),
            },
        }
    }

    pub(super) fn vec3_ops() -> ValueOps {
        triple_ops()
    }

    pub(super) fn rot3_ops() -> ValueOps {
        triple_ops()
    }

    fn triple_ops() -> ValueOps {
        ValueOps {
            default_bytes: || triple_bytes([0.0; 3]),
            equals: |a, b| a == b,
            write: |w, bytes| w.write_raw(bytes),
            read: |r| Ok(Box::from(r.read_exact(12)?)),
            display: |bytes| match bytes_triple(bytes) {
                Some([x, y, z]) => format!("({x}, {y}, {z})"),
                None => "<bad triple>".to_owned(),
            },
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_not_concrete() {
        assert!(!TypeRef::EMPTY.is_concrete());
        assert!(!TypeRef::ARRAY.is_concrete());
        assert!(!TypeRef::MAP.is_concrete());
        assert!(TypeRef::ARRAY.is_container());
        assert!(!TypeRef::EMPTY.is_container());
        assert!(builtin::BOOL.is_concrete());
    }

    #[test]
    fn builtin_constants_match_registration_order() {
        let registry = TypeRegistry::with_builtins();
        assert_eq!(registry.find("bool"), Some(builtin::BOOL));
        assert_eq!(registry.find("i64"), Some(builtin::I64));
        assert_eq!(registry.find("f32"), Some(builtin::F32));
        assert_eq!(registry.find("name"), Some(builtin::NAME));
        assert_eq!(registry.find("str"), Some(builtin::STR));
        assert_eq!(registry.find("vec3"), Some(builtin::VEC3));
        assert_eq!(registry.find("rot3"), Some(builtin::ROT3));
    }

    #[test]
    fn unmapped_indices_do_not_resolve() {
        let registry = TypeRegistry::with_builtins();
        let beyond = TypeRef::from_raw(TypeRef::FIRST_CONCRETE + registry.type_count() as u16);
        assert!(registry.resolve(beyond).is_none());
        assert!(!registry.is_mapped(beyond));
        assert!(registry.is_mapped(TypeRef::MAP));
    }

    #[test]
    fn i64_codec_uses_varints() {
        let registry = TypeRegistry::with_builtins();
        let ops = registry.resolve(builtin::I64).unwrap().ops;

        let mut w = WireWriter::new();
        (ops.write)(&mut w, &builtin::i64_bytes(-2));
        // Zigzag varint of a small negative number is one byte, not eight.
        assert_eq!(w.len(), 1);

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        let payload = (ops.read)(&mut r).unwrap();
        assert_eq!(builtin::bytes_i64(&payload), Some(-2));
    }

    #[test]
    fn triple_codec_round_trip() {
        let payload = builtin::triple_bytes([1.0, -2.5, 0.125]);
        assert_eq!(builtin::bytes_triple(&payload), Some([1.0, -2.5, 0.125]));
        assert_eq!(builtin::bytes_triple(&payload[..8]), None);
    }

    #[test]
    fn duplicate_registration_returns_existing_ref() {
        let mut registry = TypeRegistry::with_builtins();
        assert_eq!(registry.register("bool", ValueOps::plain_binary()), builtin::BOOL);
        assert_eq!(registry.type_count(), 7);
    }
}
