//! Error types for firmware image parsing and composition.
//!
//! Every failure carries an [`ErrorKind`], the message raised at the point of failure, and a stack of
//! context strings pushed as the error propagates out of nested containers. Displaying the error prints
//! the context outermost first, e.g. `failed to parse nested volume: checksum invalid, got 0x1234`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;

/// Result type used throughout the crate.
pub type Result<T> = core::result::Result<T, FirmwareError>;

/// Broad classification of a codec failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The data is structurally too small, or a length or offset is nonsensical.
    InvalidData,
    /// A checksum did not match, or a count or size ceiling was exceeded.
    InvalidFile,
    /// A format invariant was violated.
    Internal,
    /// A recognized encapsulation or operation that cannot be handled.
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidData => "invalid data",
            ErrorKind::InvalidFile => "invalid file",
            ErrorKind::Internal => "internal error",
            ErrorKind::NotSupported => "not supported",
        };
        f.write_str(name)
    }
}

/// A structured codec error: a kind plus a chain of context strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareError {
    kind: ErrorKind,
    message: String,
    // innermost first, in the order the prefixes were pushed
    context: Vec<String>,
}

impl FirmwareError {
    /// Creates a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), context: Vec::new() }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, message)
    }

    pub fn invalid_file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFile, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    /// The kind of failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The message raised where the failure was detected, without any context.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Context strings, outermost first.
    pub fn context(&self) -> impl Iterator<Item = &str> {
        self.context.iter().rev().map(String::as_str)
    }

    /// Pushes a context prefix onto the error.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.context.push(prefix.into());
        self
    }
}

impl fmt::Display for FirmwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for prefix in self.context() {
            write!(f, "{prefix}: ")?;
        }
        f.write_str(&self.message)
    }
}

impl core::error::Error for FirmwareError {}

impl From<scroll::Error> for FirmwareError {
    fn from(value: scroll::Error) -> Self {
        FirmwareError::invalid_data(value.to_string())
    }
}

/// Adds context prefixes to a [`Result`] as it propagates.
pub trait ResultExt<T> {
    /// Prefixes the error, if any, with `prefix`.
    fn context(self, prefix: &str) -> Result<T>;

    /// Prefixes the error, if any, with a lazily built string.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, prefix: &str) -> Result<T> {
        self.map_err(|err| err.with_prefix(prefix))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|err| err.with_prefix(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_displayed_outermost_first() {
        let err: Result<()> = Err(FirmwareError::internal("revision invalid, got 0x1, expected 0x2"));
        let err = err.context("failed to parse nested volume").context("failed to parse section 0x0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.message(), "revision invalid, got 0x1, expected 0x2");
        assert_eq!(
            err.to_string(),
            "failed to parse section 0x0: failed to parse nested volume: revision invalid, got 0x1, expected 0x2"
        );
        assert_eq!(err.context().collect::<Vec<_>>(), ["failed to parse section 0x0", "failed to parse nested volume"]);
    }

    #[test]
    fn scroll_errors_are_invalid_data() {
        use scroll::Pread;
        let bytes = [0u8; 2];
        let err: FirmwareError = bytes[..].pread_with::<u32>(0, scroll::LE).unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
