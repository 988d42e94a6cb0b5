//! C++ exceptions thrown by the guest.
//!
//! The guest's throw hook hands the host three strings: the (usually
//! mangled) type of the exception, the name of the first standard library
//! class it derives from, and the result of `what()`. The host builds an
//! [`Exception`] from them and unwinds the guest with a [`Thrown`] error,
//! which the controller turns back into an [`Error`] at the call boundary.

use std::fmt;

use crate::err::Error;

const STD_PREFIX: &str = "std::";

/// A standard library exception class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StdException {
	Exception,
	LogicError,
	RuntimeError,
	BadTypeid,
	BadCast,
	BadAlloc,
	BadException,
	BadVariantAccess,
	BadWeakPtr,
	BadFunctionCall,
	InvalidArgument,
	DomainError,
	LengthError,
	OutOfRange,
	FutureError,
	RangeError,
	OverflowError,
	UnderflowError,
	RegexError,
	SystemError,
	NonexistentLocalTime,
	AmbiguousLocalTime,
	FormatError,
	IosBaseFailure,
	FilesystemError,
	BadAnyCast,
	BadArrayNewLength,
}

impl StdException {
	const ALL: [StdException; 27] = [
		Self::Exception,
		Self::LogicError,
		Self::RuntimeError,
		Self::BadTypeid,
		Self::BadCast,
		Self::BadAlloc,
		Self::BadException,
		Self::BadVariantAccess,
		Self::BadWeakPtr,
		Self::BadFunctionCall,
		Self::InvalidArgument,
		Self::DomainError,
		Self::LengthError,
		Self::OutOfRange,
		Self::FutureError,
		Self::RangeError,
		Self::OverflowError,
		Self::UnderflowError,
		Self::RegexError,
		Self::SystemError,
		Self::NonexistentLocalTime,
		Self::AmbiguousLocalTime,
		Self::FormatError,
		Self::IosBaseFailure,
		Self::FilesystemError,
		Self::BadAnyCast,
		Self::BadArrayNewLength,
	];

	/// The class name without the `std::` namespace.
	pub fn name(self) -> &'static str {
		match self {
			Self::Exception => "exception",
			Self::LogicError => "logic_error",
			Self::RuntimeError => "runtime_error",
			Self::BadTypeid => "bad_typeid",
			Self::BadCast => "bad_cast",
			Self::BadAlloc => "bad_alloc",
			Self::BadException => "bad_exception",
			Self::BadVariantAccess => "bad_variant_access",
			Self::BadWeakPtr => "bad_weak_ptr",
			Self::BadFunctionCall => "bad_function_call",
			Self::InvalidArgument => "invalid_argument",
			Self::DomainError => "domain_error",
			Self::LengthError => "length_error",
			Self::OutOfRange => "out_of_range",
			Self::FutureError => "future_error",
			Self::RangeError => "range_error",
			Self::OverflowError => "overflow_error",
			Self::UnderflowError => "underflow_error",
			Self::RegexError => "regex_error",
			Self::SystemError => "system_error",
			Self::NonexistentLocalTime => "nonexistent_local_time",
			Self::AmbiguousLocalTime => "ambiguous_local_time",
			Self::FormatError => "format_error",
			Self::IosBaseFailure => "ios_base::failure",
			Self::FilesystemError => "filesystem::filesystem_error",
			Self::BadAnyCast => "bad_any_cast",
			Self::BadArrayNewLength => "bad_array_new_length",
		}
	}

	/// The class this one directly derives from.
	pub fn parent(self) -> Option<Self> {
		match self {
			Self::Exception => None,
			Self::LogicError
			| Self::RuntimeError
			| Self::BadTypeid
			| Self::BadCast
			| Self::BadAlloc
			| Self::BadException
			| Self::BadVariantAccess
			| Self::BadWeakPtr
			| Self::BadFunctionCall => Some(Self::Exception),
			Self::InvalidArgument
			| Self::DomainError
			| Self::LengthError
			| Self::OutOfRange
			| Self::FutureError => Some(Self::LogicError),
			Self::RangeError
			| Self::OverflowError
			| Self::UnderflowError
			| Self::RegexError
			| Self::SystemError
			| Self::NonexistentLocalTime
			| Self::AmbiguousLocalTime
			| Self::FormatError => Some(Self::RuntimeError),
			Self::IosBaseFailure | Self::FilesystemError => Some(Self::SystemError),
			Self::BadAnyCast => Some(Self::BadCast),
			Self::BadArrayNewLength => Some(Self::BadAlloc),
		}
	}

	/// Parses a class name given without the `std::` namespace.
	pub fn from_name(name: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|s| s.name() == name)
	}

	/// This class followed by each of its ancestors.
	pub fn ancestors(self) -> impl Iterator<Item = Self> {
		std::iter::successors(Some(self), |s| s.parent())
	}

	/// Whether this class is `target` or derives from it.
	pub fn is(self, target: Self) -> bool {
		self.ancestors().any(|s| s == target)
	}
}

impl fmt::Display for StdException {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{STD_PREFIX}{}", self.name())
	}
}

/// A C++ exception.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exception {
	ty: String,
	what: String,
	std: Option<StdException>,
}

impl Exception {
	/// Creates a standard library exception.
	pub fn new(std: StdException, what: impl Into<String>) -> Self {
		Self {
			ty: std.to_string(),
			what: what.into(),
			std: Some(std),
		}
	}

	/// Creates an exception from the strings passed to the throw hook.
	///
	/// The type is demangled when it is a simple class name and kept as is
	/// otherwise. The std class must carry the `std::` namespace; unknown
	/// standard classes are treated as `std::exception`. If no type is given
	/// the std class name takes its place.
	pub fn from_guest(ty: &str, std: &str, what: &str) -> Self {
		let class = std.strip_prefix(STD_PREFIX).map(|name| {
			StdException::from_name(name).unwrap_or(StdException::Exception)
		});
		let mut ty = demangle_class(ty).unwrap_or_else(|| ty.to_owned());
		if ty.is_empty() && class.is_some() {
			ty = std.to_owned();
		}
		Self {
			ty,
			what: what.to_owned(),
			std: class,
		}
	}

	/// The C++ type of the exception.
	pub fn type_name(&self) -> &str {
		&self.ty
	}

	/// The message of the exception.
	pub fn what(&self) -> &str {
		&self.what
	}

	/// The first standard library class the exception derives from.
	pub fn std(&self) -> Option<StdException> {
		self.std
	}

	/// Whether the exception derives from the standard class `target`.
	pub fn matches(&self, target: StdException) -> bool {
		self.std.is_some_and(|s| s.is(target))
	}

	/// The standard classes named after the type, excluding `std::exception`.
	fn chain(&self) -> impl Iterator<Item = StdException> {
		let first = match self.std {
			Some(s) if self.ty == s.to_string() => s.parent(),
			s => s,
		};
		std::iter::successors(first, |s| s.parent()).take_while(|s| *s != StdException::Exception)
	}
}

impl fmt::Display for Exception {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.ty.is_empty() {
			write!(f, "{}", StdException::Exception)?;
		} else {
			f.write_str(&self.ty)?;
		}
		let mut chain = self.chain().peekable();
		if chain.peek().is_some() {
			f.write_str(" (")?;
			for (i, s) in chain.enumerate() {
				if i > 0 {
					f.write_str(" ")?;
				}
				write!(f, "{s}")?;
			}
			f.write_str(")")?;
		}
		if !self.what.is_empty() {
			write!(f, ": {}", self.what)?;
		}
		Ok(())
	}
}

impl std::error::Error for Exception {}

/// An error unwinding through the guest back to the calling controller.
#[derive(Debug)]
pub(crate) struct Thrown(pub(crate) Error);

impl fmt::Display for Thrown {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "guest unwound with: {}", self.0)
	}
}

impl std::error::Error for Thrown {}

/// Demangles a class name in the Itanium C++ ABI.
///
/// Only plain and nested class names are understood (`_ZSt9exception`,
/// `N4test3abcE`, `_ZNSt3__18ios_base7failureE`). Returns `None` for
/// anything else.
pub fn demangle_class(s: &str) -> Option<String> {
	let s = s.strip_prefix("_Z").unwrap_or(s);
	let (mut s, nested) = match s.strip_prefix('N') {
		Some(s) => (s, true),
		None => (s, false),
	};
	let mut out = String::new();
	if let Some(rest) = s.strip_prefix("St") {
		out.push_str("std");
		s = rest;
	}
	loop {
		// Parse the length prefix, which must not have leading zeros
		let bytes = s.as_bytes();
		let mut n = 0usize;
		let mut i = 0;
		while i < bytes.len() && bytes[i].is_ascii_digit() && !(n == 0 && bytes[i] == b'0') {
			n = n * 10 + usize::from(bytes[i] - b'0');
			i += 1;
			if n > bytes.len() {
				return None;
			}
		}
		let rest = &s[i..];
		if n == 0 || n > rest.len() || !rest.is_char_boundary(n) {
			return None;
		}
		// Append the name component
		if !out.is_empty() {
			out.push_str("::");
		}
		out.push_str(&rest[..n]);
		s = &rest[n..];
		// Check for the end of the name
		match (nested, s) {
			(false, "") => return Some(out),
			(false, _) => return None,
			(true, "E") => return Some(out),
			(true, "") => return None,
			(true, _) => continue,
		}
	}
}
