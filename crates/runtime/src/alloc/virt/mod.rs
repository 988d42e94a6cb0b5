use std::fs::File;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use wasmtime::LinearMemory;

use super::{Allocator, MovableAllocator, TARGET, limit, round_up};
use crate::controller::Controller;
use crate::err::{Error, Result};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix::Reservation;
#[cfg(unix)]
pub use unix::page_size;

#[cfg(not(unix))]
mod unsupported;
#[cfg(not(unix))]
use unsupported::Reservation;
#[cfg(not(unix))]
pub use unsupported::page_size;

/// Allocates linear memory inside an address range reserved up front.
///
/// The range never moves, so files can be mapped straight into guest memory
/// with [`VirtualAllocator::map_file`]. Pages are committed as the guest
/// grows its memory. When the range cannot be reserved the failure is
/// recorded and the allocation is handed to the fallback allocator.
pub struct VirtualAllocator {
	override_max: usize,
	fallback: Box<dyn Allocator>,
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	memories: Vec<Weak<Reservation>>,
	errors: Vec<Error>,
}

impl VirtualAllocator {
	/// Creates an allocator which reserves `override_max` bytes (or the
	/// guest's declared maximum if zero) and falls back to a movable memory.
	pub fn new(override_max: usize) -> Self {
		Self {
			override_max,
			fallback: Box::new(MovableAllocator::default()),
			state: Mutex::new(State::default()),
		}
	}

	/// Replaces the allocator used when reservation fails.
	pub fn with_fallback(mut self, fallback: impl Allocator + 'static) -> Self {
		self.fallback = Box::new(fallback);
		self
	}

	/// Takes the first recorded reservation failure, if any.
	pub fn take_error(&self) -> Option<Error> {
		let mut state = self.state.lock();
		if state.errors.is_empty() {
			return None;
		}
		let err = state.errors.swap_remove(0);
		state.errors.clear();
		Some(err)
	}

	/// Maps `length` bytes of `file` starting at `offset` into the guest
	/// memory of `ctl`, returning the guest address of the first byte.
	///
	/// The destination is allocated with the guest's `aligned_alloc` so the
	/// guest heap will not hand it out again. The mapping is released along
	/// with the reservation.
	pub fn map_file(&self, ctl: &mut Controller, file: &File, offset: u64, length: usize, writable: bool) -> Result<u32> {
		// Step 1: find the reservation backing the instance
		if ctl.memory_size() == 0 {
			ctl.grow(1)?;
		}
		let Some(res) = self.find(ctl.memory_base()) else {
			return Err(Error::Unsupported("guest memory is not backed by a virtual reservation".to_owned()));
		};
		if length == 0 {
			return Ok(0);
		}
		// Step 2: align the mapping to the page size
		let page = res.page();
		let mask = page as u64 - 1;
		let file_offset = offset & !mask;
		let misalign = (offset & mask) as usize;
		let Some(file_len) = misalign.checked_add(length) else {
			return Err(Error::Alloc("mapping too large".to_owned()));
		};
		let Some(map_len) = round_up(file_len, page).and_then(|n| u32::try_from(n).ok()) else {
			return Err(Error::Alloc("mapping too large".to_owned()));
		};
		// Step 3: carve the destination out of the guest heap
		let ptr = ctl.aligned_alloc(page as u32, map_len)?;
		// Step 4: replace the destination pages with the file
		if let Err(err) = res.map_file(file, ptr as usize, file_offset, file_len, writable) {
			ctl.free(ptr);
			return Err(err);
		}
		debug!(target: TARGET, "Mapped {length} bytes at offset {offset} to guest address {ptr:#x}");
		Ok(ptr + misalign as u32)
	}

	fn find(&self, base: *const u8) -> Option<Arc<Reservation>> {
		self.state
			.lock()
			.memories
			.iter()
			.filter_map(Weak::upgrade)
			.find(|res| res.base().cast_const() == base)
	}
}

impl Allocator for VirtualAllocator {
	fn allocate(&self, cap: usize, max: usize) -> Result<Box<dyn LinearMemory>> {
		let max = limit(self.override_max, cap, max);
		match Reservation::new(cap, max) {
			Ok(res) => {
				let res = Arc::new(res);
				let mut state = self.state.lock();
				state.memories.retain(|m| m.strong_count() > 0);
				state.memories.push(Arc::downgrade(&res));
				trace!(target: TARGET, "Reserved {} bytes of address space", res.reserved());
				Ok(Box::new(VirtualMemory {
					res,
					size: cap,
				}))
			}
			Err(err) => {
				warn!(target: TARGET, "Falling back after failing to reserve {max} bytes: {err}");
				self.state.lock().errors.push(err);
				self.fallback.allocate(cap, max)
			}
		}
	}
}

struct VirtualMemory {
	res: Arc<Reservation>,
	size: usize,
}

unsafe impl LinearMemory for VirtualMemory {
	fn byte_size(&self) -> usize {
		self.size
	}

	fn byte_capacity(&self) -> usize {
		self.res.reserved()
	}

	fn grow_to(&mut self, new_size: usize) -> anyhow::Result<()> {
		self.res.commit(new_size)?;
		self.size = self.size.max(new_size);
		Ok(())
	}

	fn as_ptr(&self) -> *mut u8 {
		self.res.base()
	}
}
