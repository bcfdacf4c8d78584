use thiserror::Error;

/// Library error taxonomy. Every variant maps to a stable negative integer
/// code at the handle-based surface; the codes never change across backends.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("general failure")]
    General,

    #[error("allocation of {0} bytes failed")]
    OutOfMemory(usize),

    #[error("unidentified exception")]
    Unidentified,

    #[error("instance handle refers to no live instance")]
    UninitializedInstance,

    #[error("{kind} index {index} out of range (count {count})")]
    InvalidIndex {
        kind: &'static str,
        index: i64,
        count: usize,
    },

    #[error("no resource satisfies the requirement flags")]
    NoResource,

    #[error("{0} is not supported by the selected backend")]
    Unsupported(&'static str),

    #[error("non-finite value produced in {0}")]
    NumericalFailure(&'static str),

    #[error("{kind}: expected {expected} values, got {actual}")]
    SizeMismatch {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl Error {
    /// Stable integer code reported at the handle surface.
    pub fn code(&self) -> i32 {
        match self {
            Error::General => -1,
            Error::OutOfMemory(_) => -2,
            Error::Unidentified => -3,
            Error::UninitializedInstance => -4,
            Error::InvalidIndex { .. } => -5,
            Error::NoResource => -6,
            Error::Unsupported(_) => -7,
            Error::NumericalFailure(_) => -8,
            Error::SizeMismatch { .. } => -9,
        }
    }

    pub(crate) fn bad_index(kind: &'static str, index: i64, count: usize) -> Error {
        Error::InvalidIndex { kind, index, count }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Validate that `index` addresses one of `count` slots of the named kind.
pub(crate) fn check_index(kind: &'static str, index: usize, count: usize) -> Result<usize> {
    if index < count {
        Ok(index)
    } else {
        Err(Error::bad_index(kind, index as i64, count))
    }
}

/// Validate that a supplied slice has exactly the declared length.
pub(crate) fn check_len(kind: &'static str, actual: usize, expected: usize) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::SizeMismatch {
            kind,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::General.code(), -1);
        assert_eq!(Error::OutOfMemory(16).code(), -2);
        assert_eq!(Error::UninitializedInstance.code(), -4);
        assert_eq!(Error::bad_index("matrix", 9, 4).code(), -5);
        assert_eq!(Error::NoResource.code(), -6);
        assert_eq!(Error::Unsupported("updatePrePartials").code(), -7);
        assert_eq!(Error::NumericalFailure("root reduction").code(), -8);
        assert_eq!(
            Error::SizeMismatch {
                kind: "partials",
                expected: 8,
                actual: 4
            }
            .code(),
            -9
        );
    }

    #[test]
    fn check_index_bounds() {
        assert_eq!(check_index("scale", 3, 4).unwrap(), 3);
        assert!(check_index("scale", 4, 4).is_err());
    }
}
