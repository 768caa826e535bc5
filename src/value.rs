use crate::types::{TypeRef, TypeRegistry};

/// Inline capacity of a [`SmallValue`] payload.
pub const INLINE_SIZE: usize = 32;
/// Alignment of the inline buffer.
pub const INLINE_ALIGN: usize = 16;

#[derive(Clone, Copy)]
#[repr(align(16))]
struct InlineBuf([u8; INLINE_SIZE]);

/// A typed value payload stored inline: up to 32 bytes in a 16-byte-aligned
/// buffer. Keeps small types (bool, int, vector) cache-local with no heap
/// indirection.
#[derive(Clone)]
pub struct SmallValue {
    type_ref: TypeRef,
    len: u8,
    data: InlineBuf,
}

impl SmallValue {
    pub fn fits(bytes: &[u8]) -> bool {
        bytes.len() <= INLINE_SIZE
    }

    /// Payload must satisfy [`SmallValue::fits`].
    pub fn new(type_ref: TypeRef, bytes: &[u8]) -> Self {
        debug_assert!(Self::fits(bytes));
        let mut data = InlineBuf([0; INLINE_SIZE]);
        data.0[..bytes.len()].copy_from_slice(bytes);
        Self {
            type_ref,
            len: bytes.len() as u8,
            data,
        }
    }

    pub fn type_ref(&self) -> TypeRef {
        self.type_ref
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data.0[..usize::from(self.len)]
    }

    pub fn set_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(Self::fits(bytes));
        self.data.0[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len() as u8;
    }
}

/// A typed value payload boxed on the heap; holds any size.
#[derive(Clone)]
pub struct HeapValue {
    type_ref: TypeRef,
    bytes: Box<[u8]>,
}

impl HeapValue {
    pub fn new(type_ref: TypeRef, bytes: &[u8]) -> Self {
        Self {
            type_ref,
            bytes: Box::from(bytes),
        }
    }

    pub fn type_ref(&self) -> TypeRef {
        self.type_ref
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn set_bytes(&mut self, bytes: &[u8]) {
        self.bytes = Box::from(bytes);
    }
}

/// Compare two payloads of the same type through the registry's compare op,
/// falling back to byte equality for types this registry cannot resolve.
pub(crate) fn payload_equals(
    registry: &TypeRegistry,
    type_ref: TypeRef,
    a: &[u8],
    b: &[u8],
) -> bool {
    match registry.resolve(type_ref) {
        Some(info) => (info.ops.equals)(a, b),
        None => a == b,
    }
}

const _: () = assert!(std::mem::align_of::<SmallValue>() >= INLINE_ALIGN);

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
