use std::io;

use thiserror::Error;

use crate::except::Exception;

/// An error raised while driving a guest instance.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The guest or the platform could not provide the requested memory
	#[error("Allocation failed: {0}")]
	Alloc(String),

	/// The guest threw a C++ exception
	#[error("{0}")]
	Exception(#[from] Exception),

	/// A host reader ran dry before the guest was satisfied
	#[error("Unexpected end of input")]
	UnexpectedEof,

	/// A host reader or writer failed
	#[error("I/O error: {0}")]
	Io(#[source] io::Error),

	/// The platform does not support the requested operation
	#[error("Unsupported: {0}")]
	Unsupported(String),

	/// The guest module could not be compiled, linked or instantiated
	#[error("Guest runtime error: {0:#}")]
	Runtime(anyhow::Error),
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Self {
		match err.kind() {
			io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
			_ => Error::Io(err),
		}
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
