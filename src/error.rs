use thiserror::Error;

/// Failures raised by the model.
///
/// Operations return [`anyhow::Result`]; these variants travel inside
/// `anyhow::Error` and can be recovered with `downcast_ref::<Error>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Two operands of a fusion or residual add disagree, or an input has the
    /// wrong width. Never resolved by broadcasting.
    #[error("shape mismatch in {op}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Invalid configuration, detected at construction time.
    #[error("invalid config: {0}")]
    Config(String),

    /// A component was invoked without a body.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl Error {
    pub fn shape_mismatch(op: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Returns the crate error carried by `err`, if any.
pub fn kind(err: &anyhow::Error) -> Option<&Error> {
    err.downcast_ref::<Error>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = Error::shape_mismatch("residual", &[2, 4, 8], &[2, 4, 6]);
        assert_eq!(
            err.to_string(),
            "shape mismatch in residual: expected [2, 4, 8], got [2, 4, 6]"
        );
        assert_eq!(
            Error::config("num_heads must be > 0").to_string(),
            "invalid config: num_heads must be > 0"
        );
        assert_eq!(
            Error::NotImplemented("decoder cell").to_string(),
            "not implemented: decoder cell"
        );
    }

    #[test]
    fn kind_recovers_from_anyhow() {
        let err: anyhow::Error = Error::NotImplemented("decoder cell").into();
        assert_eq!(kind(&err), Some(&Error::NotImplemented("decoder cell")));

        let other = anyhow::anyhow!("plain");
        assert!(kind(&other).is_none());
    }
}
