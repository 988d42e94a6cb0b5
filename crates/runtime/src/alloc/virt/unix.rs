use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::errno::Errno;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, mprotect, munmap};
use nix::unistd::{SysconfVar, sysconf};

use super::round_up;
use crate::err::{Error, Result};

/// The size of a host memory page.
pub fn page_size() -> usize {
	static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
	*PAGE_SIZE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
		Ok(Some(n)) if n > 0 => n as usize,
		_ => 4096,
	})
}

fn os_error(op: &str, err: Errno) -> Error {
	match err {
		Errno::ENOTSUP | Errno::ENOSYS | Errno::ENODEV => Error::Unsupported(format!("{op}: {err}")),
		_ => Error::Alloc(format!("{op}: {err}")),
	}
}

/// A range of address space of which a prefix is readable and writable.
pub(crate) struct Reservation {
	base: NonNull<u8>,
	reserved: usize,
	committed: AtomicUsize,
	page: usize,
}

// SAFETY: the range is only reached through the guest memory and the
// committed watermark is atomic
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
	/// Reserves `max` bytes rounded up to the page size and commits `cap` of them.
	pub(crate) fn new(cap: usize, max: usize) -> Result<Self> {
		let page = page_size();
		if cap > max {
			return Err(Error::Alloc(format!("initial size {cap} exceeds the maximum of {max}")));
		}
		let Some(len) = round_up(max, page).and_then(NonZeroUsize::new) else {
			return Err(Error::Alloc(format!("cannot reserve {max} bytes")));
		};
		// Commit everything up front when the final size is known
		let prot = if cap == max {
			ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
		} else {
			ProtFlags::PROT_NONE
		};
		// SAFETY: a fresh private anonymous mapping does not alias anything
		let base = unsafe { mmap_anonymous(None, len, prot, MapFlags::MAP_PRIVATE) }
			.map_err(|err| os_error("mmap", err))?;
		let res = Self {
			base: base.cast(),
			reserved: len.get(),
			committed: AtomicUsize::new(if cap == max {
				len.get()
			} else {
				0
			}),
			page,
		};
		res.commit(cap)?;
		Ok(res)
	}

	pub(crate) fn base(&self) -> *mut u8 {
		self.base.as_ptr()
	}

	pub(crate) fn reserved(&self) -> usize {
		self.reserved
	}

	pub(crate) fn committed(&self) -> usize {
		self.committed.load(Ordering::Acquire)
	}

	pub(crate) fn page(&self) -> usize {
		self.page
	}

	/// Makes at least the first `size` bytes accessible.
	///
	/// The watermark grows by an eighth at a time, clamped to the reservation.
	pub(crate) fn commit(&self, size: usize) -> Result<()> {
		if size > self.reserved {
			return Err(Error::Alloc(format!(
				"cannot commit {size} bytes of a {} byte reservation",
				self.reserved
			)));
		}
		let committed = self.committed();
		if committed >= size {
			return Ok(());
		}
		let target = committed.saturating_add(committed >> 3).clamp(size, self.reserved);
		let target = round_up(target, self.page).unwrap_or(self.reserved).min(self.reserved);
		// SAFETY: committed is below the reservation so the address is inside it
		let addr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(committed)) };
		// SAFETY: the range lies within our own reservation
		unsafe { mprotect(addr.cast(), target - committed, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }
			.map_err(|err| os_error("mprotect", err))?;
		self.committed.store(target, Ordering::Release);
		Ok(())
	}

	/// Maps `length` bytes of `file` at `offset` over the committed range at `addr`.
	pub(crate) fn map_file(&self, file: &File, addr: usize, offset: u64, length: usize, writable: bool) -> Result<()> {
		let Some(len) = NonZeroUsize::new(length) else {
			return Ok(());
		};
		let committed = self.committed();
		if addr > committed || committed - addr < length {
			return Err(Error::Alloc(format!("mapping {addr:#x}+{length} lies outside committed memory")));
		}
		if addr % self.page != 0 || offset % self.page as u64 != 0 {
			return Err(Error::Alloc(format!("mapping {addr:#x} at offset {offset} is not page aligned")));
		}
		let Ok(offset) = nix::libc::off_t::try_from(offset) else {
			return Err(Error::Alloc(format!("offset {offset} out of range")));
		};
		let mut prot = ProtFlags::PROT_READ;
		if writable {
			prot |= ProtFlags::PROT_WRITE;
		}
		let target = NonZeroUsize::new(self.base.as_ptr() as usize + addr);
		// SAFETY: the target range is committed memory owned by this reservation
		unsafe { mmap(target, len, prot, MapFlags::MAP_SHARED | MapFlags::MAP_FIXED, file, offset) }
			.map_err(|err| os_error("mmap", err))?;
		Ok(())
	}
}

impl Drop for Reservation {
	fn drop(&mut self) {
		// SAFETY: the whole range, file mappings included, belongs to us
		if let Err(err) = unsafe { munmap(self.base.cast(), self.reserved) } {
			error!(target: "marisa::runtime::alloc", "Failed to release {} bytes of address space: {err}", self.reserved);
		}
	}
}
