use std::fs::File;

use crate::err::{Error, Result};

pub fn page_size() -> usize {
	4096
}

/// Address space reservation is not available on this platform.
pub(crate) enum Reservation {}

impl Reservation {
	pub(crate) fn new(_cap: usize, _max: usize) -> Result<Self> {
		Err(Error::Unsupported("virtual memory reservation is not available on this platform".to_owned()))
	}

	pub(crate) fn base(&self) -> *mut u8 {
		match *self {}
	}

	pub(crate) fn reserved(&self) -> usize {
		match *self {}
	}

	pub(crate) fn page(&self) -> usize {
		match *self {}
	}

	pub(crate) fn commit(&self, _size: usize) -> Result<()> {
		match *self {}
	}

	pub(crate) fn map_file(&self, _file: &File, _addr: usize, _offset: u64, _length: usize, _writable: bool) -> Result<()> {
		match *self {}
	}
}
