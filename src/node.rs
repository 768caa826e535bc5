use crate::error::OpStatus;
use crate::types::{TypeRef, TypeRegistry};
use crate::value::{payload_equals, HeapValue, SmallValue};
use crate::{ArrayChildren, MapChildren};

/// A tree cell: exactly one of empty, an inline value, a boxed value, an
/// ordered array of children, or a named map of children.
///
/// The variant carries the data; kind-level metadata (the [`TypeRef`] mirror,
/// parent links, versions) lives in the arena's per-slot records.
#[derive(Clone, Default)]
pub enum Node {
    #[default]
    Empty,
    Small(SmallValue),
    Heap(HeapValue),
    Array(ArrayChildren),
    Map(MapChildren),
}

impl Node {
    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Node::Small(_) | Node::Heap(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Node::Array(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Node::Map(_))
    }

    pub fn is_compound(&self) -> bool {
        self.is_array() || self.is_map()
    }

    pub fn is_empty_array(&self) -> bool {
        matches!(self, Node::Array(children) if children.is_empty())
    }

    pub fn is_empty_map(&self) -> bool {
        matches!(self, Node::Map(children) if children.is_empty())
    }

    /// The [`TypeRef`] this variant implies: a sentinel for empty and the
    /// containers, the payload's type for values.
    pub fn kind_type(&self) -> TypeRef {
        match self {
            Node::Empty => TypeRef::EMPTY,
            Node::Small(v) => v.type_ref(),
            Node::Heap(v) => v.type_ref(),
            Node::Array(_) => TypeRef::ARRAY,
            Node::Map(_) => TypeRef::MAP,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayChildren> {
        match self {
            Node::Array(children) => Some(children),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayChildren> {
        match self {
            Node::Array(children) => Some(children),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapChildren> {
        match self {
            Node::Map(children) => Some(children),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MapChildren> {
        match self {
            Node::Map(children) => Some(children),
            _ => None,
        }
    }

    /// Transition to the empty variant.
    ///
    /// The caller is responsible for releasing container children first; this
    /// only switches the variant.
    pub fn reset_empty(&mut self) -> OpStatus {
        if self.is_empty() {
            return OpStatus::SameValueNoChange;
        }
        let was_empty_container = self.is_empty_array() || self.is_empty_map();
        *self = Node::Empty;
        if was_empty_container {
            OpStatus::SuccessOverrideEmpty
        } else {
            OpStatus::SuccessChangeValueAndType
        }
    }

    /// Transition to (or empty out) the array variant.
    pub fn reset_empty_array(&mut self) -> OpStatus {
        match self {
            Node::Array(children) => {
                if children.is_empty() {
                    OpStatus::SameValueNoChange
                } else {
                    children.clear();
                    OpStatus::SuccessChangeValue
                }
            }
            Node::Empty => {
                *self = Node::Array(ArrayChildren::default());
                OpStatus::SuccessOverrideEmpty
            }
            _ => {
                *self = Node::Array(ArrayChildren::default());
                OpStatus::SuccessChangeValueAndType
            }
        }
    }

    /// Transition to (or empty out) the map variant.
    pub fn reset_empty_map(&mut self) -> OpStatus {
        match self {
            Node::Map(children) => {
                if children.is_empty() {
                    OpStatus::SameValueNoChange
                } else {
                    children.clear();
                    OpStatus::SuccessChangeValue
                }
            }
            Node::Empty => {
                *self = Node::Map(MapChildren::default());
                OpStatus::SuccessOverrideEmpty
            }
            _ => {
                *self = Node::Map(MapChildren::default());
                OpStatus::SuccessChangeValueAndType
            }
        }
    }

    /// Set a typed value payload.
    ///
    /// Empty nodes accept any type (inline when the payload fits, boxed
    /// otherwise). Value nodes accept only the same type, with a
    /// compare-and-skip. Containers reject.
    pub fn try_set_value(
        &mut self,
        registry: &TypeRegistry,
        type_ref: TypeRef,
        bytes: &[u8],
    ) -> OpStatus {
        if !type_ref.is_concrete() {
            return OpStatus::InvalidTargetValue;
        }
        match self {
            Node::Empty => {
                *self = Node::new_value(type_ref, bytes);
                OpStatus::SuccessChangeValueAndType
            }
            Node::Small(v) => {
                if v.type_ref() != type_ref {
                    return OpStatus::ValueTypeMismatch;
                }
                if payload_equals(registry, type_ref, v.bytes(), bytes) {
                    return OpStatus::SameValueNoChange;
                }
                if SmallValue::fits(bytes) {
                    v.set_bytes(bytes);
                } else {
                    *self = Node::Heap(HeapValue::new(type_ref, bytes));
                }
                OpStatus::SuccessChangeValue
            }
            Node::Heap(v) => {
                if v.type_ref() != type_ref {
                    return OpStatus::ValueTypeMismatch;
                }
                if payload_equals(registry, type_ref, v.bytes(), bytes) {
                    return OpStatus::SameValueNoChange;
                }
                v.set_bytes(bytes);
                OpStatus::SuccessChangeValue
            }
            Node::Array(_) | Node::Map(_) => OpStatus::ValueTypeMismatch,
        }
    }

    /// The payload if this is a value of exactly `type_ref`.
    pub fn try_get_value(&self, type_ref: TypeRef) -> Option<&[u8]> {
        let (actual, bytes) = self.value_payload()?;
        (actual == type_ref).then_some(bytes)
    }

    /// The payload and its type, whatever the type is.
    pub fn value_payload(&self) -> Option<(TypeRef, &[u8])> {
        match self {
            Node::Small(v) => Some((v.type_ref(), v.bytes())),
            Node::Heap(v) => Some((v.type_ref(), v.bytes())),
            _ => None,
        }
    }

    /// Build a value node, placing the payload inline when it fits.
    pub fn new_value(type_ref: TypeRef, bytes: &[u8]) -> Node {
        if SmallValue::fits(bytes) {
            Node::Small(SmallValue::new(type_ref, bytes))
        } else {
            Node::Heap(HeapValue::new(type_ref, bytes))
        }
    }

    /// Structural equality: arrays compare child ids elementwise, maps by
    /// key set and per-key ids, values through the registry's compare op.
    pub fn identical(&self, other: &Node, registry: &TypeRegistry) -> bool {
        match (self, other) {
            (Node::Empty, Node::Empty) => true,
            (Node::Array(a), Node::Array(b)) => a == b,
            (Node::Map(a), Node::Map(b)) => a == b,
            _ => match (self.value_payload(), other.value_payload()) {
                (Some((ta, ba)), Some((tb, bb))) => {
                    ta == tb && payload_equals(registry, ta, ba, bb)
                }
                _ => false,
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
    use crate::node_id::NodeId;
    use crate::types::builtin;
    use crate::Name;

    fn registry() -> TypeRegistry {
        TypeRegistry::with_builtins()
    }

    #[test]
    fn reset_transitions_report_the_right_grade() {
        let mut node = Node::Empty;
        assert_eq!(node.reset_empty(), OpStatus::SameValueNoChange);
        assert_eq!(node.reset_empty_array(), OpStatus::SuccessOverrideEmpty);
        assert_eq!(node.reset_empty_array(), OpStatus::SameValueNoChange);

        node.as_array_mut().unwrap().push(NodeId::new(0, 1));
        assert_eq!(node.reset_empty_array(), OpStatus::SuccessChangeValue);

        assert_eq!(node.reset_empty_map(), OpStatus::SuccessChangeValueAndType);
        assert_eq!(node.reset_empty(), OpStatus::SuccessOverrideEmpty);

        let mut value = Node::new_value(builtin::BOOL, &builtin::bool_bytes(true));
        assert_eq!(value.reset_empty(), OpStatus::SuccessChangeValueAndType);
    }

    #[test]
    fn set_value_places_small_payloads_inline() {
        let registry = registry();
        let mut node = Node::Empty;
        assert_eq!(
            node.try_set_value(&registry, builtin::I64, &builtin::i64_bytes(7)),
            OpStatus::SuccessChangeValueAndType
        );
        assert!(matches!(node, Node::Small(_)));
        assert_eq!(
            node.try_get_value(builtin::I64),
            Some(builtin::i64_bytes(7).as_ref())
        );
    }

    #[test]
    fn set_value_boxes_large_payloads() {
        let registry = registry();
        let mut node = Node::Empty;
        let long = "a string well past the inline capacity of a small value";
        node.try_set_value(&registry, builtin::STR, &builtin::str_bytes(long));
        assert!(matches!(node, Node::Heap(_)));
    }

    #[test]
    fn growing_value_migrates_to_the_heap() {
        let registry = registry();
        let mut node = Node::new_value(builtin::STR, b"short");
        assert!(matches!(node, Node::Small(_)));
        let long = builtin::str_bytes("now much longer than thirty-two bytes in total");
        assert_eq!(
            node.try_set_value(&registry, builtin::STR, &long),
            OpStatus::SuccessChangeValue
        );
        assert!(matches!(node, Node::Heap(_)));
    }

    #[test]
    fn set_value_rejects_type_changes_and_skips_same_values() {
        let registry = registry();
        let mut node = Node::new_value(builtin::I64, &builtin::i64_bytes(7));
        assert_eq!(
            node.try_set_value(&registry, builtin::BOOL, &builtin::bool_bytes(true)),
            OpStatus::ValueTypeMismatch
        );
        assert_eq!(
            node.try_set_value(&registry, builtin::I64, &builtin::i64_bytes(7)),
            OpStatus::SameValueNoChange
        );
        assert_eq!(
            node.try_set_value(&registry, builtin::I64, &builtin::i64_bytes(8)),
            OpStatus::SuccessChangeValue
        );

        let mut array = Node::Array(ArrayChildren::default());
        assert_eq!(
            array.try_set_value(&registry, builtin::I64, &builtin::i64_bytes(1)),
            OpStatus::ValueTypeMismatch
        );
    }

    #[test]
    fn identical_compares_structurally() {
        let registry = registry();
        let a = Node::new_value(builtin::I64, &builtin::i64_bytes(3));
        let b = Node::new_value(builtin::I64, &builtin::i64_bytes(3));
        let c = Node::new_value(builtin::I64, &builtin::i64_bytes(4));
        assert!(a.identical(&b, &registry));
        assert!(!a.identical(&c, &registry));

        let mut m1 = MapChildren::default();
        m1.insert(Name::new("x"), NodeId::new(1, 1));
        let mut m2 = MapChildren::default();
        m2.insert(Name::new("x"), NodeId::new(1, 1));
        assert!(Node::Map(m1).identical(&Node::Map(m2), &registry));

        assert!(!Node::Empty.identical(&a, &registry));
    }

    #[test]
    fn kind_type_mirrors_the_variant() {
        assert_eq!(Node::Empty.kind_type(), TypeRef::EMPTY);
        assert_eq!(Node::Array(ArrayChildren::default()).kind_type(), TypeRef::ARRAY);
        assert_eq!(Node::Map(MapChildren::default()).kind_type(), TypeRef::MAP);
        assert_eq!(
            Node::new_value(builtin::F32, &builtin::f32_bytes(1.5)).kind_type(),
            builtin::F32
        );
    }
}
