use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::WireError;
use crate::wire::{WireReader, WireWriter};

/// Sentinel for "no index" / "no generation".
pub const INVALID_INDEX: u16 = 0xFFFF;

/// Opaque 32-bit handle to a node slot: 16-bit global index plus 16-bit
/// generation.
///
/// A `NodeId` never touches memory directly; it must be resolved through the
/// arena, which rejects stale generations. The all-ones value is the unique
/// invalid id (the arena never hands out global index `0xFFFF`).
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct NodeId {
    index: u16,
    generation: u16,
}

impl NodeId {
    pub const INVALID: NodeId = NodeId {
        index: INVALID_INDEX,
        generation: INVALID_INDEX,
    };

    pub fn new(index: u16, generation: u16) -> Self {
        Self { index, generation }
    }

    pub fn is_valid(self) -> bool {
        self.index != INVALID_INDEX
    }

    pub fn index(self) -> u16 {
        self.index
    }

    pub fn generation(self) -> u16 {
        self.generation
    }

    pub fn write(self, w: &mut WireWriter) {
        w.write_u32v(u32::from(self.index));
        w.write_u32v(u32::from(self.generation));
    }

    pub fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let index = r.read_u32v()?;
        let generation = r.read_u32v()?;
        if index > u32::from(INVALID_INDEX) || generation > u32::from(INVALID_INDEX) {
            return Err(WireError::VarintOverflow);
        }
        Ok(Self {
            index: index as u16,
            generation: generation as u16,
        })
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Hash for NodeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32((u32::from(self.index) << 16) | u32::from(self.generation));
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}@{}", self.index, self.generation)
        } else {
            f.write_str("#invalid")
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
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
    fn invalid_is_distinguishable() {
        assert!(!NodeId::INVALID.is_valid());
        assert!(!NodeId::default().is_valid());
        assert!(NodeId::new(0, 1).is_valid());
    }

    #[test]
    fn equality_is_bitwise() {
        assert_eq!(NodeId::new(3, 7), NodeId::new(3, 7));
        assert_ne!(NodeId::new(3, 7), NodeId::new(3, 8));
        assert_ne!(NodeId::new(4, 7), NodeId::new(3, 7));
    }

    #[test]
    fn wire_round_trip() {
        let mut w = WireWriter::new();
        NodeId::new(513, 2).write(&mut w);
        NodeId::INVALID.write(&mut w);

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(NodeId::read(&mut r).unwrap(), NodeId::new(513, 2));
        assert_eq!(NodeId::read(&mut r).unwrap(), NodeId::INVALID);
    }
}
