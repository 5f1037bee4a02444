use thiserror::Error;

/// Canonical error taxonomy shared by every `vq` crate.
///
/// Classification guidance:
/// - [`VqError::TypeMismatch`]: a row value disagrees with the declared field type
/// - [`VqError::UnsupportedType`]: a codec or vector payload has no builder/decoder for a type
/// - [`VqError::NotSupported`]: a structural limit, such as list nesting deeper than one level
/// - [`VqError::SchemaMismatch`] / [`VqError::MissingColumn`]: merge and rerank preconditions
/// - [`VqError::Remote`] / [`VqError::Query`]: the engine answered with a negative status
/// - [`VqError::ConnectionClosed`]: a handle was used after release
#[derive(Debug, Error)]
pub enum VqError {
    /// A row value does not match the field's declared type, or names an unknown field.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The codec or vector payload has no builder/decoder for the given type.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Structurally valid input the codec refuses, e.g. a list of lists.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Merge/rerank inputs do not share one schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A required column is absent.
    #[error("missing column: {0}")]
    MissingColumn(String),

    /// Negative engine status outside the query path.
    ///
    /// The message carries the stage prefix, e.g.
    /// `Failed to add record batch: table is closed`.
    #[error("remote error: {0}")]
    Remote(String),

    /// Negative engine status while streaming or explaining a query.
    #[error("query error: {0}")]
    Query(String),

    /// A connection or table handle was used after it was released.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Builder combinations that have no execution path yet.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Caller supplied arguments that cannot form a valid request.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration values or sources.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Arrow kernel, builder or IPC failure.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VqError {
    /// Wraps an engine message with the stage that produced it.
    pub fn remote(stage: &str, message: impl AsRef<str>) -> Self {
        VqError::Remote(format!("{stage}: {}", message.as_ref()))
    }

    /// Wraps a query-path engine message with the stage that produced it.
    pub fn query(stage: &str, message: impl AsRef<str>) -> Self {
        VqError::Query(format!("{stage}: {}", message.as_ref()))
    }
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, VqError>;

#[cfg(test)]
mod tests {
    use super::VqError;

    #[test]
    fn remote_errors_carry_stage_prefix() {
        let err = VqError::remote("Failed to add record batch", "table is closed");
        assert_eq!(
            err.to_string(),
            "remote error: Failed to add record batch: table is closed"
        );
    }

    #[test]
    fn arrow_errors_convert_transparently() {
        let err: VqError = arrow_schema::ArrowError::SchemaError("bad".to_string()).into();
        assert!(matches!(err, VqError::Arrow(_)));
    }
}
