//! Building dictionaries from keys.
//!
//! Keys reach the guest in chunks to keep the number of calls down. Each
//! chunk is a guest buffer of records laid out as
//!
//! ```text
//! [u32 key length][f32 weight][key bytes]
//! ```
//!
//! in little-endian order, handed over with `marisa_build_push_chunk` once
//! the next record no longer fits. A key too large for a chunk hands over
//! the current chunk first, then is copied into its own buffer and pushed
//! with `marisa_build_push`, so the guest sees keys in the order given.
//! The guest keeps referring to the buffers until the dictionary is built,
//! so they are only released afterwards.

use std::sync::Arc;

use bytes::BufMut;
use marisa_runtime::{Controller, MovableAllocator};

use crate::cnf::{CHUNK_BUILD, CHUNK_SIZE, MAX_ALLOC};
use crate::err::{Error, Result};
use crate::flags::Config;
use crate::trie::Trie;

const TARGET: &str = "marisa::build";

/// The bytes preceding each key in a chunk
const RECORD_HEADER: usize = 8;

/// Streams keys into a new dictionary.
///
/// ```no_run
/// # fn main() -> marisa::Result<()> {
/// let mut builder = marisa::Builder::new(marisa::Config::default())?;
/// builder.push("apple")?;
/// builder.push_weighted("banana", 2.5)?;
/// let trie = builder.finish()?;
/// assert_eq!(trie.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct Builder {
	ctl: Controller,
	flags: u32,
	chunk_size: usize,
	chunk: Option<Chunk>,
	/// Guest buffers to release once built
	allocs: Vec<u32>,
	pushed: u64,
}

#[derive(Clone, Copy, Debug)]
struct Chunk {
	addr: u32,
	used: usize,
	count: u32,
}

impl Builder {
	/// Starts a dictionary built with `config`.
	pub fn new(config: Config) -> Result<Self> {
		let flags = config.flags()?;
		let ctl = crate::instantiate(Arc::new(MovableAllocator::new(MAX_ALLOC)))?;
		Ok(Self {
			ctl,
			flags,
			chunk_size: if *CHUNK_BUILD {
				*CHUNK_SIZE
			} else {
				0
			},
			chunk: None,
			allocs: Vec::new(),
			pushed: 0,
		})
	}

	/// Sets the size of the buffers keys are batched into. Keys whose record
	/// does not fit are pushed on their own; a size of zero pushes every key
	/// on its own.
	pub fn chunk_size(mut self, chunk_size: usize) -> Self {
		self.chunk_size = chunk_size.min(u32::MAX as usize);
		self
	}

	/// Adds a key with a weight of 1.
	pub fn push(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
		self.push_weighted(key, 1.0)
	}

	/// Adds a key. The weights of keys added more than once accumulate.
	pub fn push_weighted(&mut self, key: impl AsRef<[u8]>, weight: f32) -> Result<()> {
		let key = key.as_ref();
		let len = u32::try_from(key.len()).map_err(|_| Error::TooLarge)?;
		let size = RECORD_HEADER + key.len();
		if size < self.chunk_size {
			// Step 1: hand over the current chunk if the record does not fit
			if self.chunk.is_some_and(|c| size > self.chunk_size - c.used) {
				self.flush()?;
			}
			// Step 2: append the record to the current chunk
			let mut chunk = match self.chunk.take() {
				Some(chunk) => chunk,
				None => self.new_chunk()?,
			};
			let mut buf = self.ctl.slice_mut(chunk.addr + chunk.used as u32, size);
			buf.put_u32_le(len);
			buf.put_f32_le(weight);
			buf.put_slice(key);
			chunk.used += size;
			chunk.count += 1;
			self.chunk = Some(chunk);
		} else {
			// Records already batched go first
			self.flush()?;
			let (addr, buf) = self.ctl.alloc(key.len())?;
			buf.copy_from_slice(key);
			if addr != 0 {
				self.allocs.push(addr);
			}
			self.ctl.call("marisa_build_push", &[addr, len, weight.to_bits()])?;
		}
		self.pushed += 1;
		Ok(())
	}

	fn new_chunk(&mut self) -> Result<Chunk> {
		let (addr, _) = self.ctl.alloc(self.chunk_size)?;
		self.allocs.push(addr);
		Ok(Chunk {
			addr,
			used: 0,
			count: 0,
		})
	}

	fn flush(&mut self) -> Result<()> {
		if let Some(chunk) = self.chunk.take() {
			self.ctl.call("marisa_build_push_chunk", &[chunk.addr, chunk.count])?;
			trace!(target: TARGET, "Pushed a chunk of {} keys in {} bytes", chunk.count, chunk.used);
		}
		Ok(())
	}

	/// Builds the dictionary.
	pub fn finish(mut self) -> Result<Trie> {
		self.flush()?;
		self.ctl.call("marisa_build", &[self.flags])?;
		for addr in std::mem::take(&mut self.allocs) {
			self.ctl.free(addr);
		}
		debug!(target: TARGET, "Built a dictionary from {} keys", self.pushed);
		let mut trie = Trie::new();
		trie.swap(self.ctl)?;
		Ok(trie)
	}
}

impl Trie {
	/// Builds the dictionary from `keys`, each with a weight of 1.
	///
	/// On error the trie keeps its previous contents.
	pub fn build<I>(&mut self, keys: I, config: Config) -> Result<()>
	where
		I: IntoIterator,
		I::Item: AsRef<[u8]>,
	{
		let mut builder = Builder::new(config)?;
		for key in keys {
			builder.push(key)?;
		}
		*self = builder.finish()?;
		Ok(())
	}

	/// Builds the dictionary from keys and their weights. The weights of
	/// keys given more than once accumulate.
	///
	/// On error the trie keeps its previous contents.
	pub fn build_weighted<I, K>(&mut self, keys: I, config: Config) -> Result<()>
	where
		I: IntoIterator<Item = (K, f32)>,
		K: AsRef<[u8]>,
	{
		let mut builder = Builder::new(config)?;
		for (key, weight) in keys {
			builder.push_weighted(key, weight)?;
		}
		*self = builder.finish()?;
		Ok(())
	}
}
