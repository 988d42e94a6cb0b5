use anyhow::bail;
use wasmtime::LinearMemory;

use super::{Allocator, limit};
use crate::err::{Error, Result};

/// Allocates linear memory on the heap, moving it whenever it has to grow
/// past its capacity.
#[derive(Clone, Copy, Debug, Default)]
pub struct MovableAllocator {
	/// Replaces the maximum size declared by the guest when non-zero
	pub override_max: usize,
}

impl MovableAllocator {
	pub fn new(override_max: usize) -> Self {
		Self {
			override_max,
		}
	}
}

impl Allocator for MovableAllocator {
	fn allocate(&self, cap: usize, max: usize) -> Result<Box<dyn LinearMemory>> {
		let max = limit(self.override_max, cap, max);
		if cap > max {
			return Err(Error::Alloc(format!("initial size {cap} exceeds the maximum of {max}")));
		}
		let mut buf = Vec::new();
		buf.try_reserve_exact(cap).map_err(|err| Error::Alloc(err.to_string()))?;
		buf.resize(cap, 0);
		Ok(Box::new(MovableMemory {
			buf,
			max,
		}))
	}
}

struct MovableMemory {
	buf: Vec<u8>,
	max: usize,
}

unsafe impl LinearMemory for MovableMemory {
	fn byte_size(&self) -> usize {
		self.buf.len()
	}

	fn byte_capacity(&self) -> usize {
		self.buf.capacity()
	}

	fn grow_to(&mut self, new_size: usize) -> anyhow::Result<()> {
		if new_size > self.max {
			bail!("cannot grow memory to {new_size} bytes, the maximum is {}", self.max);
		}
		if let Some(additional) = new_size.checked_sub(self.buf.len()) {
			self.buf.try_reserve(additional)?;
			self.buf.resize(new_size, 0);
		}
		Ok(())
	}

	fn as_ptr(&self) -> *mut u8 {
		self.buf.as_ptr().cast_mut()
	}
}
