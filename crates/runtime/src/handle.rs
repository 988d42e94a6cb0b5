//! Scoped handles standing in for host readers and writers.
//!
//! The guest never sees a host address. Before a call which streams data the
//! host registers its reader or writer here, and the callbacks the guest
//! invokes resolve the active handle back to the object. A handle is only
//! valid inside the outermost call it was registered for; once that call
//! returns every object is dropped, and the counter keeps increasing so a
//! stale handle never resolves to a newer object.

use std::any::Any;
use std::fmt;
use std::io::{self, Read, Write};
use std::ptr::NonNull;

/// An opaque reference to a host object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
	/// The handle which never refers to anything
	pub const NIL: Handle = Handle(0);

	pub fn is_nil(self) -> bool {
		self.0 == 0
	}

	pub fn get(self) -> u32 {
		self.0
	}
}

impl fmt::Display for Handle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// A reader which can be recovered as its concrete type.
pub trait ReadAny: Read + Send {
	fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Read + Send + 'static> ReadAny for T {
	fn into_any(self: Box<Self>) -> Box<dyn Any> {
		self
	}
}

/// A writer which can be recovered as its concrete type.
pub trait WriteAny: Write + Send {
	fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Write + Send + 'static> WriteAny for T {
	fn into_any(self: Box<Self>) -> Box<dyn Any> {
		self
	}
}

/// A host object reachable from guest callbacks.
pub enum HostObject {
	Reader(Box<dyn ReadAny>),
	Writer(Box<dyn WriteAny>),
}

impl HostObject {
	pub fn reader<R: Read + Send + 'static>(reader: R) -> Self {
		Self::Reader(Box::new(reader))
	}

	pub fn writer<W: Write + Send + 'static>(writer: W) -> Self {
		Self::Writer(Box::new(writer))
	}

	/// Recovers a reader registered with [`HostObject::reader`].
	pub fn into_reader<R: 'static>(self) -> Option<R> {
		match self {
			Self::Reader(r) => r.into_any().downcast::<R>().ok().map(|r| *r),
			Self::Writer(_) => None,
		}
	}

	/// Recovers a writer registered with [`HostObject::writer`].
	pub fn into_writer<W: 'static>(self) -> Option<W> {
		match self {
			Self::Writer(w) => w.into_any().downcast::<W>().ok().map(|w| *w),
			Self::Reader(_) => None,
		}
	}
}

/// A reader or writer borrowed for the extent of one call.
///
/// The borrow's lifetime is erased so the object can sit in the table like
/// an owned one. Whoever lends it must take it out of the table again before
/// the borrow ends, also when the call unwinds.
pub(crate) struct Lent<T: ?Sized>(NonNull<T>);

// SAFETY: a `Lent` is the only way to reach the borrowed object while it is lent
unsafe impl<T: ?Sized + Send> Send for Lent<T> {}

impl Lent<dyn Read + Send> {
	/// # Safety
	///
	/// The returned object must be dropped before `reader`'s borrow ends.
	pub(crate) unsafe fn reader<'a>(reader: &'a mut (dyn Read + Send + 'a)) -> Self {
		let ptr: NonNull<dyn Read + Send + 'a> = NonNull::from(reader);
		// SAFETY: only the trait object's lifetime bound changes
		Self(unsafe { std::mem::transmute::<NonNull<dyn Read + Send + 'a>, NonNull<dyn Read + Send>>(ptr) })
	}
}

impl Lent<dyn Write + Send> {
	/// # Safety
	///
	/// The returned object must be dropped before `writer`'s borrow ends.
	pub(crate) unsafe fn writer<'a>(writer: &'a mut (dyn Write + Send + 'a)) -> Self {
		let ptr: NonNull<dyn Write + Send + 'a> = NonNull::from(writer);
		// SAFETY: only the trait object's lifetime bound changes
		Self(unsafe { std::mem::transmute::<NonNull<dyn Write + Send + 'a>, NonNull<dyn Write + Send>>(ptr) })
	}
}

impl Read for Lent<dyn Read + Send> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		// SAFETY: the borrow outlives the lent object
		unsafe { self.0.as_mut() }.read(buf)
	}

	fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
		// SAFETY: as above
		unsafe { self.0.as_mut() }.read_exact(buf)
	}
}

impl Write for Lent<dyn Write + Send> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		// SAFETY: the borrow outlives the lent object
		unsafe { self.0.as_mut() }.write(buf)
	}

	fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
		// SAFETY: as above
		unsafe { self.0.as_mut() }.write_all(buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		// SAFETY: as above
		unsafe { self.0.as_mut() }.flush()
	}
}

impl fmt::Debug for HostObject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Reader(_) => f.write_str("HostObject::Reader"),
			Self::Writer(_) => f.write_str("HostObject::Writer"),
		}
	}
}

/// The registry of host objects for one guest instance.
#[derive(Debug, Default)]
pub struct HandleTable {
	next: u32,
	depth: usize,
	objects: Vec<(Handle, HostObject)>,
	reader: Handle,
	writer: Handle,
}

impl HandleTable {
	/// Opens a call scope.
	pub fn enter(&mut self) {
		self.depth += 1;
	}

	/// Closes a call scope, dropping every object once the outermost one closes.
	pub fn exit(&mut self) {
		assert!(self.depth > 0, "unbalanced handle scope");
		self.depth -= 1;
		if self.depth == 0 {
			if !self.objects.is_empty() {
				trace!(target: TARGET, "Releasing {} host objects", self.objects.len());
			}
			self.objects.clear();
			self.reader = Handle::NIL;
			self.writer = Handle::NIL;
		}
	}

	/// Registers an object for the current scope.
	pub fn register(&mut self, obj: HostObject) -> Handle {
		self.next = self.next.wrapping_add(1);
		if self.next == 0 {
			self.next = 1;
		}
		let handle = Handle(self.next);
		self.objects.push((handle, obj));
		handle
	}

	/// Removes an object before its scope closes.
	pub fn take(&mut self, handle: Handle) -> Option<HostObject> {
		let idx = self.objects.iter().position(|(h, _)| *h == handle)?;
		if self.reader == handle {
			self.reader = Handle::NIL;
		}
		if self.writer == handle {
			self.writer = Handle::NIL;
		}
		Some(self.objects.swap_remove(idx).1)
	}

	/// Selects the reader the guest's read callback streams from.
	pub fn set_reader(&mut self, handle: Handle) {
		self.reader = handle;
	}

	/// Selects the writer the guest's write callback streams to.
	pub fn set_writer(&mut self, handle: Handle) {
		self.writer = handle;
	}

	pub fn active_reader(&mut self) -> &mut dyn ReadAny {
		if self.reader.is_nil() {
			panic!("no active reader");
		}
		self.reader(self.reader)
	}

	pub fn active_writer(&mut self) -> &mut dyn WriteAny {
		if self.writer.is_nil() {
			panic!("no active writer");
		}
		self.writer(self.writer)
	}

	/// Resolves a reader.
	///
	/// # Panics
	///
	/// If the handle is nil, expired, unknown or does not refer to a reader.
	pub fn reader(&mut self, handle: Handle) -> &mut dyn ReadAny {
		match self.resolve(handle) {
			HostObject::Reader(r) => r.as_mut(),
			HostObject::Writer(_) => panic!("handle {handle} is not a reader"),
		}
	}

	/// Resolves a writer.
	///
	/// # Panics
	///
	/// If the handle is nil, expired, unknown or does not refer to a writer.
	pub fn writer(&mut self, handle: Handle) -> &mut dyn WriteAny {
		match self.resolve(handle) {
			HostObject::Writer(w) => w.as_mut(),
			HostObject::Reader(_) => panic!("handle {handle} is not a writer"),
		}
	}

	pub fn len(&self) -> usize {
		self.objects.len()
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	fn resolve(&mut self, handle: Handle) -> &mut HostObject {
		if handle.is_nil() {
			panic!("nil handle");
		}
		match self.objects.iter_mut().find(|(h, _)| *h == handle) {
			Some((_, obj)) => obj,
			None => panic!("unknown handle {handle}"),
		}
	}
}

const TARGET: &str = "marisa::runtime::handle";

#[cfg(test)]
mod tests {
	use std::io::{Cursor, Read, Write};

	use super::*;

	#[test]
	fn handles_are_never_nil() {
		let mut table = HandleTable::default();
		table.enter();
		let a = table.register(HostObject::reader(Cursor::new(vec![1u8])));
		let b = table.register(HostObject::writer(Vec::<u8>::new()));
		assert!(!a.is_nil());
		assert!(!b.is_nil());
		assert_ne!(a, b);
		table.exit();
	}

	#[test]
	fn handles_are_not_reused_across_scopes() {
		let mut table = HandleTable::default();
		table.enter();
		let first = table.register(HostObject::writer(Vec::<u8>::new()));
		table.exit();
		table.enter();
		let second = table.register(HostObject::writer(Vec::<u8>::new()));
		table.exit();
		assert!(second.get() > first.get());
	}

	#[test]
	fn objects_survive_nested_scopes() {
		let mut table = HandleTable::default();
		table.enter();
		let h = table.register(HostObject::reader(Cursor::new(b"abc".to_vec())));
		table.enter();
		table.exit();
		let mut buf = [0u8; 3];
		table.reader(h).read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"abc");
		table.exit();
		assert!(table.is_empty());
	}

	#[test]
	#[should_panic(expected = "unknown handle")]
	fn expired_handle_panics() {
		let mut table = HandleTable::default();
		table.enter();
		let h = table.register(HostObject::reader(Cursor::new(Vec::new())));
		table.exit();
		table.reader(h);
	}

	#[test]
	#[should_panic(expected = "nil handle")]
	fn nil_handle_panics() {
		let mut table = HandleTable::default();
		table.writer(Handle::NIL);
	}

	#[test]
	#[should_panic(expected = "is not a writer")]
	fn wrong_kind_panics() {
		let mut table = HandleTable::default();
		table.enter();
		let h = table.register(HostObject::reader(Cursor::new(Vec::new())));
		table.writer(h);
	}

	#[test]
	#[should_panic(expected = "no active reader")]
	fn missing_reader_panics() {
		let mut table = HandleTable::default();
		table.enter();
		table.active_reader();
	}

	#[test]
	fn objects_can_be_recovered() {
		let mut table = HandleTable::default();
		table.enter();
		let h = table.register(HostObject::writer(Vec::<u8>::new()));
		table.set_writer(h);
		table.active_writer().write_all(b"hello").unwrap();
		let obj = table.take(h).unwrap();
		table.exit();
		assert_eq!(obj.into_writer::<Vec<u8>>().unwrap(), b"hello");
	}

	#[test]
	fn recovery_checks_the_type() {
		let obj = HostObject::reader(Cursor::new(Vec::<u8>::new()));
		assert!(obj.into_reader::<std::fs::File>().is_none());
		let obj = HostObject::reader(Cursor::new(Vec::<u8>::new()));
		assert!(obj.into_writer::<Vec<u8>>().is_none());
	}
}
