use std::fmt;

use thiserror::Error;

/// Status code returned by every tree and visitor operation.
///
/// The first five variants are outcome grades and count as "ok"; everything
/// else is a failure. `PathEmptyResolvedToRoot` is the special ok-status for
/// resolving an empty path (the visitor refers to the root).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OpStatus {
    #[default]
    Success,
    SuccessOverrideEmpty,
    SuccessChangeValue,
    SuccessChangeValueAndType,
    SameValueNoChange,
    PathEmptyResolvedToRoot,

    ValueTypeMismatch,
    InvalidTargetValue,
    InvalidSourceValue,
    PermissionDenied,

    InvalidVisitor,
    InvalidNode,
    InvalidRootNode,
    ResolvePathTooDeep,
    SegmentNameButNodeNotMap,
    SegmentIndexButNodeNotArray,
    ResolveMapKeyNotFound,
    ResolveArrayIndexNegative,
    ResolveArrayIndexOutOfRange,
    ResolveOperatorFailure,
    ResolveInternalNullMap,
    ResolveInternalNullArray,
    ResolveAllocateFailed,
    UnknownFailure,
}

impl OpStatus {
    pub fn is_ok(self) -> bool {
        matches!(
            self,
            OpStatus::Success
                | OpStatus::SuccessOverrideEmpty
                | OpStatus::SuccessChangeValue
                | OpStatus::SuccessChangeValueAndType
                | OpStatus::SameValueNoChange
                | OpStatus::PathEmptyResolvedToRoot
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Success => "Success",
            OpStatus::SuccessOverrideEmpty => "SuccessOverrideEmpty",
            OpStatus::SuccessChangeValue => "SuccessChangeValue",
            OpStatus::SuccessChangeValueAndType => "SuccessChangeValueAndType",
            OpStatus::SameValueNoChange => "SameValueNoChange",
            OpStatus::PathEmptyResolvedToRoot => "PathEmptyResolvedToRoot",
            OpStatus::ValueTypeMismatch => "ValueTypeMismatch",
            OpStatus::InvalidTargetValue => "InvalidTargetValue",
            OpStatus::InvalidSourceValue => "InvalidSourceValue",
            OpStatus::PermissionDenied => "PermissionDenied",
            OpStatus::InvalidVisitor => "InvalidVisitor",
            OpStatus::InvalidNode => "InvalidNode",
            OpStatus::InvalidRootNode => "InvalidRootNode",
            OpStatus::ResolvePathTooDeep => "ResolvePathTooDeep",
            OpStatus::SegmentNameButNodeNotMap => "SegmentNameButNodeNotMap",
            OpStatus::SegmentIndexButNodeNotArray => "SegmentIndexButNodeNotArray",
            OpStatus::ResolveMapKeyNotFound => "ResolveMapKeyNotFound",
            OpStatus::ResolveArrayIndexNegative => "ResolveArrayIndexNegative",
            OpStatus::ResolveArrayIndexOutOfRange => "ResolveArrayIndexOutOfRange",
            OpStatus::ResolveOperatorFailure => "ResolveOperatorFailure",
            OpStatus::ResolveInternalNullMap => "ResolveInternalNullMap",
            OpStatus::ResolveInternalNullArray => "ResolveInternalNullArray",
            OpStatus::ResolveAllocateFailed => "ResolveAllocateFailed",
            OpStatus::UnknownFailure => "UnknownFailure",
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An [`OpStatus`] plus an optional human-readable message for failures.
#[derive(Clone, Debug, Default)]
pub struct OpReport {
    pub status: OpStatus,
    pub message: String,
}

impl OpReport {
    pub fn with_message(status: OpStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

impl From<OpStatus> for OpReport {
    fn from(status: OpStatus) -> Self {
        Self {
            status,
            message: String::new(),
        }
    }
}

impl fmt::Display for OpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{}: {}", self.status, self.message)
        }
    }
}

/// Failures while decoding a replication or visitor byte stream.
///
/// These are stream-shape errors; an unmapped value type is *not* an error
/// (see the defer-and-retry contract on the delta reader).
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WireError {
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("varint does not fit the target width")]
    VarintOverflow,
    #[error("name bytes are not valid UTF-8")]
    NonUtf8Name,
    #[error("unknown path segment tag {0}")]
    BadSegmentTag(u8),
    #[error("unknown record flags {0:#04x}")]
    BadFlags(u8),
    #[error("unknown container delta kind {0}")]
    BadContainerDeltaKind(u8),
    #[error("record references an unusable node id")]
    BadNodeId,
    #[error("visitor path has {0} segments, limit is {1}")]
    PathTooLong(u32, u32),
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
    fn outcome_grades_are_ok() {
        assert!(OpStatus::Success.is_ok());
        assert!(OpStatus::SuccessOverrideEmpty.is_ok());
        assert!(OpStatus::SuccessChangeValue.is_ok());
        assert!(OpStatus::SuccessChangeValueAndType.is_ok());
        assert!(OpStatus::SameValueNoChange.is_ok());
        assert!(OpStatus::PathEmptyResolvedToRoot.is_ok());
    }

    #[test]
    fn failures_are_not_ok() {
        assert!(!OpStatus::ValueTypeMismatch.is_ok());
        assert!(!OpStatus::PermissionDenied.is_ok());
        assert!(!OpStatus::ResolveArrayIndexOutOfRange.is_ok());
        assert!(!OpStatus::UnknownFailure.is_ok());
    }

    #[test]
    fn report_formats_status_and_message() {
        let plain = OpReport::from(OpStatus::InvalidNode);
        assert_eq!(plain.to_string(), "InvalidNode");
        let detailed = OpReport::with_message(OpStatus::ResolveMapKeyNotFound, "no key 'hp'");
        assert_eq!(detailed.to_string(), "ResolveMapKeyNotFound: no key 'hp'");
    }
}
