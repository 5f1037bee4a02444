//! Signed status convention used by every engine call.

use std::fmt;

use vq_common::{Result, VqError};

/// Engine result code: negative is an error with a message, non-negative is
/// success and may carry a handle or a count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Raw result code.
    pub code: i64,
    /// Human-readable message; set for errors.
    pub message: Option<String>,
}

/// Reply of an engine call that returns a value on success.
pub type Reply<T> = std::result::Result<T, Status>;

impl Status {
    /// Success carrying `value`.
    pub fn ok(value: i64) -> Self {
        Self {
            code: value.max(0),
            message: None,
        }
    }

    /// Generic failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: -1,
            message: Some(message.into()),
        }
    }

    /// Whether the code is non-negative.
    pub fn is_ok(&self) -> bool {
        self.code >= 0
    }

    /// Message text, empty when none was attached.
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Converts to the carried value, wrapping failures as [`VqError::Remote`].
    pub fn check(&self, stage: &str) -> Result<i64> {
        if self.is_ok() {
            Ok(self.code)
        } else {
            Err(VqError::remote(stage, self.message()))
        }
    }

    /// Like [`Status::check`] but for the query path ([`VqError::Query`]).
    pub fn check_query(&self, stage: &str) -> Result<i64> {
        if self.is_ok() {
            Ok(self.code)
        } else {
            Err(VqError::query(stage, self.message()))
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "status {}: {msg}", self.code),
            None => write!(f, "status {}", self.code),
        }
    }
}

/// Converts a [`Reply`], wrapping failures as [`VqError::Remote`].
pub fn check_reply<T>(reply: Reply<T>, stage: &str) -> Result<T> {
    reply.map_err(|status| VqError::remote(stage, status.message()))
}

/// Converts a [`Reply`], wrapping failures as [`VqError::Query`].
pub fn check_query_reply<T>(reply: Reply<T>, stage: &str) -> Result<T> {
    reply.map_err(|status| VqError::query(stage, status.message()))
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn negative_codes_surface_stage_and_message() {
        let err = Status::error("table is closed")
            .check("Failed to add record batch")
            .expect_err("negative");
        assert_eq!(
            err.to_string(),
            "remote error: Failed to add record batch: table is closed"
        );
        assert_eq!(Status::ok(7).check("count").expect("ok"), 7);
    }
}
