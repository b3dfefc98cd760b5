//! Error types for the PFS image builder.

use thiserror::Error;

/// Errors that can occur while building a PFS image.
///
/// All of these are fatal to the build: there is no partial-retry path, and a caller that gets
/// one back should assume the sink is left in a partially-written state.
#[derive(Debug, Error)]
pub enum PfsError {
	/// The supplied filesystem tree is not well-formed: a cycle, a missing parent link, or a
	/// duplicate name within one directory.
	#[error("invalid filesystem tree: {0}")]
	InvalidTree(String),

	/// `Sign` or `Encrypt` was requested without the key material they require.
	#[error("configuration mismatch: {0}")]
	ConfigMismatch(String),

	/// A content producer or the output sink failed.
	#[error("i/o failure: {0}")]
	IoFailure(#[from] std::io::Error),

	/// A node requires more indirection than the builder supports (e.g. a file so large its
	/// doubly-indirect block would need a triply-indirect one, or an inode table bigger than
	/// the header's signature descriptor can address).
	#[error("layout overflow: {0}")]
	LayoutOverflow(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PfsError>;
