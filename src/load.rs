use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use marisa_runtime::{Controller, MovableAllocator, VirtualAllocator};

use crate::cnf::{MAX_ALLOC, SCRATCH_SPACE};
use crate::err::{Error, Result};
use crate::io::Counting;
use crate::trie::Trie;

const TARGET: &str = "marisa::load";

impl Trie {
	/// Opens a dictionary file.
	///
	/// On 64-bit Linux and macOS the file is mapped into guest memory when
	/// possible; otherwise, or if mapping fails, it is read in full.
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		if cfg!(all(any(target_os = "linux", target_os = "macos"), target_pointer_width = "64")) {
			let mut file = File::open(path)?;
			// A file which cannot seek is unlikely to be mappable
			if let Ok(size) = file.seek(SeekFrom::End(0)) {
				let mut trie = Self::new();
				match trie.map_file(&file, 0, size) {
					Ok(()) => return Ok(trie),
					Err(err) => {
						debug!(target: TARGET, "Reading {} after failing to map it: {err}", path.display());
					}
				}
			}
		}
		Self::from_bytes(&std::fs::read(path)?)
	}

	/// Loads a dictionary from a serialized image.
	pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
		let mut trie = Self::new();
		trie.load_bytes(bytes)?;
		Ok(trie)
	}

	/// Reads a dictionary from `reader`.
	pub fn read_from<R: Read + Send>(reader: R) -> Result<Self> {
		let mut trie = Self::new();
		trie.load_from(reader)?;
		Ok(trie)
	}

	/// Replaces the dictionary with a copy of the serialized image `bytes`.
	///
	/// The dictionary is used straight from the copy, which is faster than
	/// [`Trie::load_from`] but may leave a less compact layout. On error the
	/// trie keeps its previous contents.
	pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
		if bytes.len() > MAX_ALLOC {
			return Err(Error::TooLarge);
		}
		let alloc = MovableAllocator::new(bytes.len().saturating_add(*SCRATCH_SPACE));
		let mut ctl = crate::instantiate(Arc::new(alloc))?;
		let (addr, buf) = ctl.alloc(bytes.len())?;
		buf.copy_from_slice(bytes);
		parse(&mut ctl, addr, bytes.len())?;
		self.swap(ctl)
	}

	/// Replaces the dictionary with one read from `reader`, returning the
	/// number of bytes read.
	///
	/// Exactly the bytes of the dictionary are consumed. Pass `&mut reader`
	/// to keep using the reader afterwards; after an error it has advanced
	/// past the bytes consumed so far. On error the trie keeps its previous
	/// contents.
	pub fn load_from<R: Read + Send>(&mut self, reader: R) -> Result<u64> {
		let mut ctl = crate::instantiate(Arc::new(MovableAllocator::new(MAX_ALLOC)))?;
		let mut reader = Counting::new(reader);
		let res = ctl.call_reading("marisa_load", &[], &mut reader);
		match res {
			Ok(_) => {
				self.swap(ctl)?;
				Ok(reader.count())
			}
			Err(err) => {
				debug!(target: TARGET, "Loading failed after {} bytes: {err}", reader.count());
				Err(eof_if(err.into(), "!stream_->read"))
			}
		}
	}

	/// Replaces the dictionary with one mapped from `length` bytes of `file`
	/// starting at `offset`.
	///
	/// The file must not change while the dictionary is in use. A range
	/// extending past the end of the file is [`Error::UnexpectedEof`]. On
	/// error the trie keeps its previous contents; platforms without memory
	/// mapping return [`Error::Unsupported`].
	pub fn map_file(&mut self, file: &File, offset: u64, length: u64) -> Result<()> {
		let Some(length) = usize::try_from(length).ok().filter(|n| *n <= MAX_ALLOC) else {
			return Err(Error::TooLarge);
		};
		// Pages past the end of the file cannot be read once mapped
		let size = file.metadata()?.len();
		if offset.checked_add(length as u64).is_none_or(|end| end > size) {
			return Err(Error::UnexpectedEof);
		}
		// Step 1: reserve room for the file and the guest's own allocations
		let alloc = Arc::new(
			VirtualAllocator::new(length.saturating_add(*SCRATCH_SPACE))
				.with_fallback(MovableAllocator::new(*SCRATCH_SPACE)),
		);
		let mut ctl = crate::instantiate(alloc.clone())?;
		if let Some(err) = alloc.take_error() {
			return Err(err.into());
		}
		// Step 2: map the file and parse it in place
		let addr = alloc.map_file(&mut ctl, file, offset, length, false)?;
		parse(&mut ctl, addr, length)?;
		self.swap(ctl)
	}
}

/// Parses the image at `[addr, addr+len)` in place.
fn parse(ctl: &mut Controller, addr: u32, len: usize) -> Result<()> {
	let Ok(len) = u32::try_from(len) else {
		return Err(Error::TooLarge);
	};
	match ctl.call("marisa_new", &[addr, len]) {
		Ok(_) => Ok(()),
		Err(err) => Err(eof_if(err.into(), "size > avail_")),
	}
}

/// Turns the guest's complaint about a truncated image into [`Error::UnexpectedEof`].
fn eof_if(err: Error, what: &str) -> Error {
	if err.is_runtime_error(what) {
		Error::UnexpectedEof
	} else {
		err
	}
}
