//! Backing storage for guest linear memory.
//!
//! Wasmtime asks a single engine-wide [`MemoryCreator`] for every linear
//! memory it creates. [`HostMemory`] forwards each request to the
//! [`Allocator`] selected for the instantiation running on the current
//! thread, so instances sharing one compiled module can still pick their own
//! allocation strategy.

mod movable;
mod virt;

use std::cell::RefCell;
use std::sync::Arc;

use wasmtime::{LinearMemory, MemoryCreator, MemoryType};

pub use movable::MovableAllocator;
pub use virt::{VirtualAllocator, page_size};

use crate::cnf::MAX_ALLOC;
use crate::err::{Error, Result};

const TARGET: &str = "marisa::runtime::alloc";

/// Supplies the linear memory of a guest instance.
pub trait Allocator: Send + Sync {
	/// Creates a memory of `cap` bytes which may grow up to `max` bytes.
	fn allocate(&self, cap: usize, max: usize) -> Result<Box<dyn LinearMemory>>;
}

/// Replaces the declared maximum with `override_max` when it is set and can
/// hold the initial size.
pub(crate) fn limit(override_max: usize, cap: usize, max: usize) -> usize {
	if override_max != 0 && override_max >= cap {
		override_max
	} else {
		max
	}
}

/// Rounds `n` up to a multiple of the power of two `align`.
pub(crate) fn round_up(n: usize, align: usize) -> Option<usize> {
	n.checked_add(align - 1).map(|n| n & !(align - 1))
}

struct Active {
	alloc: Arc<dyn Allocator>,
	error: Option<Error>,
}

thread_local! {
	static ACTIVE: RefCell<Option<Active>> = const { RefCell::new(None) };
}

/// Restores the previously active allocator, even when unwinding.
struct Restore(Option<Option<Active>>);

impl Restore {
	fn finish(mut self) -> Option<Active> {
		let prev = self.0.take().flatten();
		ACTIVE.with(|a| a.replace(prev))
	}
}

impl Drop for Restore {
	fn drop(&mut self) {
		if let Some(prev) = self.0.take() {
			ACTIVE.with(|a| a.replace(prev));
		}
	}
}

/// Runs `f` with `alloc` supplying any linear memory created on this thread.
///
/// Returns the result of `f` along with the error of the first failed allocation.
pub(crate) fn scoped<R>(alloc: Arc<dyn Allocator>, f: impl FnOnce() -> R) -> (R, Option<Error>) {
	let prev = ACTIVE.with(|a| {
		a.replace(Some(Active {
			alloc,
			error: None,
		}))
	});
	let guard = Restore(Some(prev));
	let res = f();
	let active = guard.finish();
	(res, active.and_then(|a| a.error))
}

/// The engine-wide memory creator.
pub(crate) struct HostMemory;

unsafe impl MemoryCreator for HostMemory {
	fn new_memory(
		&self,
		_ty: MemoryType,
		minimum: usize,
		maximum: Option<usize>,
		_reserved_size_in_bytes: Option<usize>,
		_guard_size_in_bytes: usize,
	) -> std::result::Result<Box<dyn LinearMemory>, String> {
		let max = maximum.unwrap_or(MAX_ALLOC);
		ACTIVE.with(|a| match a.borrow_mut().as_mut() {
			Some(active) => match active.alloc.allocate(minimum, max) {
				Ok(memory) => Ok(memory),
				Err(err) => {
					let msg = err.to_string();
					if active.error.is_none() {
						active.error = Some(err);
					}
					Err(msg)
				}
			},
			None => {
				trace!(target: TARGET, "No allocator selected, using a movable memory");
				MovableAllocator::default().allocate(minimum, max).map_err(|err| err.to_string())
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[rstest]
	#[case::unset(0, 10, 100, 100)]
	#[case::raises(1000, 10, 100, 1000)]
	#[case::lowers(50, 10, 100, 50)]
	#[case::too_small(5, 10, 100, 100)]
	fn limits(#[case] override_max: usize, #[case] cap: usize, #[case] max: usize, #[case] expected: usize) {
		assert_eq!(limit(override_max, cap, max), expected);
	}

	#[rstest]
	#[case(0, 4096, Some(0))]
	#[case(1, 4096, Some(4096))]
	#[case(4096, 4096, Some(4096))]
	#[case(4097, 4096, Some(8192))]
	#[case(usize::MAX, 4096, None)]
	fn rounding(#[case] n: usize, #[case] align: usize, #[case] expected: Option<usize>) {
		assert_eq!(round_up(n, align), expected);
	}

	#[test]
	fn scoped_allocator_is_restored() {
		let alloc: Arc<dyn Allocator> = Arc::new(MovableAllocator::new(1 << 20));
		let (inside, err) = scoped(alloc, || ACTIVE.with(|a| a.borrow().is_some()));
		assert!(inside);
		assert!(err.is_none());
		assert!(ACTIVE.with(|a| a.borrow().is_none()));
	}

	#[test]
	fn scoped_allocator_records_failures() {
		let alloc: Arc<dyn Allocator> = Arc::new(MovableAllocator::new(1 << 16));
		let (res, err) = scoped(alloc, || {
			HostMemory.new_memory(
				MemoryType::new(1, None),
				1 << 20,
				Some(1 << 16),
				None,
				0,
			)
		});
		assert!(res.is_err());
		assert!(matches!(err, Some(Error::Alloc(_))));
	}
}
