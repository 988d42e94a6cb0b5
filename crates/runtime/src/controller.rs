use std::io::{Read, Write};
use std::ops::Deref;

use wasmtime::{Func, Instance, Memory, Store, Val, ValType};

use crate::err::{Error, Result};
use crate::except::Thrown;
use crate::handle::{Handle, HandleTable, HostObject, Lent};

const TARGET: &str = "marisa::runtime::controller";

/// Slots on the argument stack; the widest guest call takes 3 words and returns 7.
pub const STACK_SIZE: usize = 16;

/// Number of resolved exports kept around.
const CACHE_SIZE: usize = 32;

/// Per-instance state reachable from host functions.
#[derive(Default)]
pub struct StoreData {
	pub(crate) handles: HandleTable,
	pub(crate) throwing: bool,
}

/// A guest instance and the machinery to call into it.
pub struct Controller {
	store: Store<StoreData>,
	instance: Instance,
	memory: Memory,
	funcs: FuncCache,
	stack: [Val; STACK_SIZE],
}

/// The raw words returned by a guest call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Returns {
	words: [u32; STACK_SIZE],
	len: usize,
}

impl Deref for Returns {
	type Target = [u32];
	fn deref(&self) -> &[u32] {
		&self.words[..self.len]
	}
}

impl Controller {
	pub(crate) fn new(mut store: Store<StoreData>, instance: Instance) -> Result<Self> {
		let memory = instance.get_memory(&mut store, "memory").ok_or_else(|| {
			Error::Runtime(anyhow::anyhow!("WASM module must export 'memory'"))
		})?;
		trace!(target: TARGET, "Instantiated guest with {} bytes of memory", memory.data_size(&store));
		Ok(Self {
			store,
			instance,
			memory,
			funcs: FuncCache::default(),
			stack: std::array::from_fn(|_| Val::I32(0)),
		})
	}

	/// Calls a guest export.
	///
	/// Arguments and results are raw 32-bit words: integers are passed as
	/// is and floats by their bit pattern. Export handles are cached by the
	/// address of `name`, so call sites should pass string literals.
	///
	/// # Panics
	///
	/// If the export does not exist, the argument count does not match, or
	/// the guest fails for any reason other than a thrown exception.
	pub fn call(&mut self, name: &'static str, params: &[u32]) -> Result<Returns> {
		// Step 1: resolve the export, preferring a cached handle
		let func = match self.funcs.take(name) {
			Some(func) => func,
			None => self.resolve(name),
		};
		if params.len() != func.params.len() {
			panic!("{name} takes {} arguments, got {}", func.params.len(), params.len());
		}
		// Step 2: marshal the arguments onto the stack
		let (args, rest) = self.stack.split_at_mut(func.params.len());
		for ((slot, word), param) in args.iter_mut().zip(params).zip(func.params.iter()) {
			*slot = param.to_val(*word);
		}
		let results = &mut rest[..func.results];
		// Step 3: call into the guest
		self.store.data_mut().handles.enter();
		let res = func.func.call(&mut self.store, args, results);
		self.store.data_mut().handles.exit();
		// Step 4: unmarshal the results or recover the thrown error
		match res {
			Ok(()) => {
				let mut out = Returns {
					len: results.len(),
					..Default::default()
				};
				for (word, val) in out.words.iter_mut().zip(results.iter()) {
					*word = from_val(val, name);
				}
				self.funcs.put(func);
				Ok(out)
			}
			Err(err) => match err.downcast::<Thrown>() {
				Ok(Thrown(err)) => {
					self.funcs.put(func);
					Err(err)
				}
				Err(err) => panic!("guest call to {name} failed: {err:?}"),
			},
		}
	}

	/// Calls a guest export with `obj` as the active reader or writer.
	///
	/// The object is handed back once the call returns, whatever the outcome.
	pub fn call_with(&mut self, name: &'static str, params: &[u32], obj: HostObject) -> (Result<Returns>, HostObject) {
		let reader = matches!(obj, HostObject::Reader(_));
		// Step 1: register the object for the extent of the call
		let handles = &mut self.store.data_mut().handles;
		handles.enter();
		let handle = handles.register(obj);
		if reader {
			handles.set_reader(handle);
		} else {
			handles.set_writer(handle);
		}
		// Step 2: run the call, closing the scope even if it unwinds
		let mut scope = Scope {
			ctl: self,
			handle,
			open: true,
		};
		let res = scope.ctl.call(name, params);
		// Step 3: take the object back before the scope closes
		match scope.close() {
			Some(obj) => (res, obj),
			None => panic!("host object {handle} vanished during {name}"),
		}
	}

	/// Calls a guest export streaming from the borrowed `reader`.
	pub fn call_reading(&mut self, name: &'static str, params: &[u32], reader: &mut (dyn Read + Send)) -> Result<Returns> {
		// SAFETY: call_with removes the object from the table before returning
		// or unwinding, and it is dropped here while `reader` is still borrowed
		let obj = HostObject::reader(unsafe { Lent::reader(reader) });
		self.call_with(name, params, obj).0
	}

	/// Calls a guest export streaming to the borrowed `writer`.
	pub fn call_writing(&mut self, name: &'static str, params: &[u32], writer: &mut (dyn Write + Send)) -> Result<Returns> {
		// SAFETY: as in call_reading
		let obj = HostObject::writer(unsafe { Lent::writer(writer) });
		self.call_with(name, params, obj).0
	}

	/// Allocates `n` bytes of guest memory with the guest's `malloc`.
	///
	/// Allocating zero bytes returns a null address without calling the guest.
	pub fn alloc(&mut self, n: usize) -> Result<(u32, &mut [u8])> {
		if n == 0 {
			return Ok((0, Default::default()));
		}
		let Some(size) = u32::try_from(n).ok().filter(|n| *n != u32::MAX) else {
			return Err(Error::Alloc(format!("size {n} out of range")));
		};
		let addr = self.call("malloc", &[size])?[0];
		if addr == 0 {
			return Err(Error::Alloc(format!("guest could not allocate {n} bytes")));
		}
		Ok((addr, self.slice_mut(addr, n)))
	}

	/// Allocates `n` bytes aligned to `align` with the guest's `aligned_alloc`.
	pub fn aligned_alloc(&mut self, align: u32, n: u32) -> Result<u32> {
		if !self.has_export("aligned_alloc") {
			return Err(Error::Unsupported("guest does not export aligned_alloc".to_owned()));
		}
		let addr = self.call("aligned_alloc", &[align, n])?[0];
		if addr == 0 {
			return Err(Error::Alloc(format!("guest could not allocate {n} bytes aligned to {align}")));
		}
		Ok(addr)
	}

	/// Releases memory allocated by [`Controller::alloc`] or [`Controller::aligned_alloc`].
	pub fn free(&mut self, addr: u32) {
		if addr == 0 {
			return;
		}
		if let Err(err) = self.call("free", &[addr]) {
			panic!("guest failed to free {addr:#x}: {err}");
		}
	}

	pub fn has_export(&mut self, name: &str) -> bool {
		self.instance.get_export(&mut self.store, name).is_some()
	}

	/// Borrows `len` bytes of guest memory.
	///
	/// The slice is only meaningful until the next call into the guest.
	pub fn read(&self, addr: u32, len: u32) -> &[u8] {
		let start = addr as usize;
		match self.memory.data(&self.store).get(start..start + len as usize) {
			Some(buf) => buf,
			None => panic!("guest range {addr:#x}+{len} is outside its memory"),
		}
	}

	/// Mutably borrows `len` bytes of guest memory.
	pub fn slice_mut(&mut self, addr: u32, len: usize) -> &mut [u8] {
		let start = addr as usize;
		match self.memory.data_mut(&mut self.store).get_mut(start..start + len) {
			Some(buf) => buf,
			None => panic!("guest range {addr:#x}+{len} is outside its memory"),
		}
	}

	/// Copies `bytes` into guest memory at `addr`.
	pub fn write(&mut self, addr: u32, bytes: &[u8]) {
		self.slice_mut(addr, bytes.len()).copy_from_slice(bytes);
	}

	/// The current size of guest memory in bytes.
	pub fn memory_size(&self) -> usize {
		self.memory.data_size(&self.store)
	}

	/// The host address guest memory starts at.
	pub fn memory_base(&self) -> *const u8 {
		self.memory.data_ptr(&self.store).cast_const()
	}

	/// Grows guest memory by `pages` 64 KiB pages.
	pub fn grow(&mut self, pages: u64) -> Result<()> {
		self.memory.grow(&mut self.store, pages).map(|_| ()).map_err(|err| Error::Alloc(format!("{err:#}")))
	}

	/// The handle table, for driving scopes by hand.
	pub fn handles(&mut self) -> &mut HandleTable {
		&mut self.store.data_mut().handles
	}

	fn resolve(&mut self, name: &'static str) -> Cached {
		let Some(func) = self.instance.get_func(&mut self.store, name) else {
			panic!("guest does not export {name}");
		};
		let ty = func.ty(&self.store);
		let params: Box<[Word]> = ty.params().map(|t| Word::of(&t, name)).collect();
		let results = ty.results().len();
		if params.len() + results > STACK_SIZE {
			panic!("{name} does not fit on the call stack");
		}
		Cached {
			id: identity(name),
			func,
			params,
			results,
		}
	}
}

/// The identity of a name: the address and length of its backing storage.
fn identity(name: &'static str) -> (usize, usize) {
	(name.as_ptr() as usize, name.len())
}

fn from_val(val: &Val, name: &str) -> u32 {
	match *val {
		Val::I32(v) => v as u32,
		Val::I64(v) => v as u32,
		Val::F32(bits) => bits,
		Val::F64(bits) => (f64::from_bits(bits) as f32).to_bits(),
		_ => panic!("{name} returned an unsupported value"),
	}
}

/// The wasm type a 32-bit word is passed as.
#[derive(Clone, Copy, Debug)]
enum Word {
	I32,
	I64,
	F32,
	F64,
}

impl Word {
	fn of(ty: &ValType, name: &str) -> Self {
		match ty {
			ValType::I32 => Self::I32,
			ValType::I64 => Self::I64,
			ValType::F32 => Self::F32,
			ValType::F64 => Self::F64,
			_ => panic!("{name} takes an unsupported parameter type"),
		}
	}

	fn to_val(self, word: u32) -> Val {
		match self {
			Self::I32 => Val::I32(word as i32),
			Self::I64 => Val::I64(i64::from(word)),
			Self::F32 => Val::F32(word),
			Self::F64 => Val::F64(f64::from(f32::from_bits(word)).to_bits()),
		}
	}
}

struct Cached {
	id: (usize, usize),
	func: Func,
	params: Box<[Word]>,
	results: usize,
}

/// A small cache of resolved exports keyed by name identity.
///
/// A hit takes the entry out for the duration of the call; a successful
/// call puts it back into the first free slot, starting over once every
/// slot is taken.
struct FuncCache {
	slots: [Option<Cached>; CACHE_SIZE],
	used: u32,
}

impl Default for FuncCache {
	fn default() -> Self {
		Self {
			slots: std::array::from_fn(|_| None),
			used: 0,
		}
	}
}

impl FuncCache {
	fn take(&mut self, name: &'static str) -> Option<Cached> {
		let id = identity(name);
		let idx = self.slots.iter().position(|s| s.as_ref().is_some_and(|c| c.id == id))?;
		self.used &= !(1 << idx);
		self.slots[idx].take()
	}

	fn put(&mut self, func: Cached) {
		let mut idx = (!self.used).trailing_zeros() as usize;
		if idx >= CACHE_SIZE {
			self.used = 0;
			idx = 0;
		}
		self.used |= 1 << idx;
		self.slots[idx] = Some(func);
	}
}

impl Drop for Controller {
	fn drop(&mut self) {
		trace!(target: TARGET, "Releasing guest instance with {} bytes of memory", self.memory_size());
	}
}

/// An open handle scope around a call with a host object.
struct Scope<'a> {
	ctl: &'a mut Controller,
	handle: Handle,
	open: bool,
}

impl Scope<'_> {
	fn close(&mut self) -> Option<HostObject> {
		self.open = false;
		let handles = &mut self.ctl.store.data_mut().handles;
		let obj = handles.take(self.handle);
		handles.exit();
		obj
	}
}

impl Drop for Scope<'_> {
	fn drop(&mut self) {
		if self.open {
			self.close();
		}
	}
}
