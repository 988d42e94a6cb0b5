use std::io;

use marisa_runtime::Exception;
use thiserror::Error;

/// An error raised by a dictionary operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The guest or the platform ran out of memory
	#[error("Allocation failed: {0}")]
	Alloc(String),

	/// The guest threw a C++ exception
	#[error("{0}")]
	Exception(#[from] Exception),

	/// The dictionary image ended early
	#[error("Unexpected end of input")]
	UnexpectedEof,

	/// A reader or writer failed
	#[error("I/O error: {0}")]
	Io(#[source] io::Error),

	/// The platform cannot perform the operation
	#[error("Unsupported: {0}")]
	Unsupported(String),

	/// The build options are out of range
	#[error("Invalid config: {0}")]
	InvalidConfig(String),

	/// The dictionary does not fit in guest memory
	#[error("Dictionary too large")]
	TooLarge,

	/// The dictionary has not been built or loaded
	#[error("Dictionary not initialized")]
	Uninitialized,

	/// No guest module is available
	#[error("No guest module installed, call marisa::initialize or set MARISA_WASM")]
	NoGuest,

	/// The guest module could not be compiled or instantiated
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

impl From<marisa_runtime::Error> for Error {
	fn from(err: marisa_runtime::Error) -> Self {
		use marisa_runtime::Error as E;
		match err {
			E::Alloc(msg) => Error::Alloc(msg),
			E::Exception(ex) => Error::Exception(ex),
			E::UnexpectedEof => Error::UnexpectedEof,
			E::Io(err) => Error::Io(err),
			E::Unsupported(msg) => Error::Unsupported(msg),
			E::Runtime(err) => Error::Runtime(err),
			err => Error::Runtime(anyhow::Error::new(err)),
		}
	}
}

impl Error {
	/// Whether the error is a `std::runtime_error` whose message contains `needle`.
	pub(crate) fn is_runtime_error(&self, needle: &str) -> bool {
		match self {
			Error::Exception(ex) => {
				ex.matches(marisa_runtime::StdException::RuntimeError) && ex.what().contains(needle)
			}
			_ => false,
		}
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
