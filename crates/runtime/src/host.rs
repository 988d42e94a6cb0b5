use std::io::{self, Read, Write};

use anyhow::Result;
use wasmtime::{Caller, Extern, Linker, Memory};

use crate::controller::StoreData;
use crate::err::Error;
use crate::except::{Exception, Thrown};

const TARGET: &str = "marisa::runtime::host";

/// The import module of the exception hook.
const EXCEPT_MODULE: &str = "wexcept";
/// The guest export which releases a captured exception.
const EXCEPT_DESTROY: &str = "wexcept_cxx_throw_destroy";

const MAX_TYPE_LEN: usize = 256;
const MAX_STD_LEN: usize = 256;
const MAX_WHAT_LEN: usize = 8192;

/// Links the exception hook and the stream callbacks into `linker`.
///
/// The stream callbacks are imported by the guest as `<imports>.read` and
/// `<imports>.write`.
pub(crate) fn implement_host_functions(linker: &mut Linker<StoreData>, imports: &str) -> Result<()> {
	linker.func_wrap(EXCEPT_MODULE, "cxx_throw", cxx_throw)?;
	linker.func_wrap(imports, "read", read)?;
	linker.func_wrap(imports, "write", write)?;
	Ok(())
}

/// Captures a guest exception and unwinds the guest.
fn cxx_throw(mut caller: Caller<'_, StoreData>, ty: u32, std: u32, what: u32) -> Result<()> {
	// Step 1: refuse to recurse while releasing another exception
	if caller.data().throwing {
		panic!("guest threw while releasing an exception");
	}
	// Step 2: copy the exception details out of guest memory
	let memory = guest_memory(&mut caller);
	let data = memory.data(&caller);
	let exception = Exception::from_guest(
		&c_string(data, ty, MAX_TYPE_LEN),
		&c_string(data, std, MAX_STD_LEN),
		&c_string(data, what, MAX_WHAT_LEN),
	);
	trace!(target: TARGET, "Guest threw {exception}");
	// Step 3: let the guest release the exception object
	if let Some(destroy) = caller.get_export(EXCEPT_DESTROY).and_then(Extern::into_func) {
		caller.data_mut().throwing = true;
		let res = destroy.call(&mut caller, &[], &mut []);
		caller.data_mut().throwing = false;
		if let Err(err) = res {
			panic!("failed to release guest exception {exception}: {err:?}");
		}
	}
	// Step 4: unwind back to the controller
	Err(anyhow::Error::new(Thrown(Error::Exception(exception))))
}

/// Fills `[ptr, ptr+len)` from the active reader, or skips `len` bytes if `ptr` is null.
fn read(mut caller: Caller<'_, StoreData>, ptr: u32, len: u32) -> Result<()> {
	if len == 0 {
		return Ok(());
	}
	let memory = guest_memory(&mut caller);
	let (data, store) = memory.data_and_store_mut(&mut caller);
	let reader = store.handles.active_reader();
	let res = if ptr == 0 {
		io::copy(&mut Read::take(reader, u64::from(len)), &mut io::sink()).and_then(|n| {
			if n < u64::from(len) {
				Err(io::ErrorKind::UnexpectedEof.into())
			} else {
				Ok(())
			}
		})
	} else {
		reader.read_exact(guest_slice(data, ptr, len))
	};
	res.map_err(|err| anyhow::Error::new(Thrown(err.into())))
}

/// Writes `[ptr, ptr+len)` to the active writer, or `len` zero bytes if `ptr` is null.
fn write(mut caller: Caller<'_, StoreData>, ptr: u32, len: u32) -> Result<()> {
	if len == 0 {
		return Ok(());
	}
	let memory = guest_memory(&mut caller);
	let (data, store) = memory.data_and_store_mut(&mut caller);
	let writer = store.handles.active_writer();
	let res = if ptr == 0 {
		io::copy(&mut io::repeat(0).take(u64::from(len)), writer).map(|_| ())
	} else {
		writer.write_all(guest_slice(data, ptr, len))
	};
	res.map_err(|err| anyhow::Error::new(Thrown(Error::Io(err))))
}

fn guest_memory(caller: &mut Caller<'_, StoreData>) -> Memory {
	match caller.get_export("memory").and_then(Extern::into_memory) {
		Some(memory) => memory,
		None => panic!("guest does not export its memory"),
	}
}

fn guest_slice(data: &mut [u8], ptr: u32, len: u32) -> &mut [u8] {
	let start = ptr as usize;
	match data.get_mut(start..start + len as usize) {
		Some(buf) => buf,
		None => panic!("guest range {ptr:#x}+{len} is outside its memory"),
	}
}

/// Reads a NUL-terminated string of at most `max` bytes.
fn c_string(data: &[u8], ptr: u32, max: usize) -> String {
	if ptr == 0 {
		return String::new();
	}
	let start = (ptr as usize).min(data.len());
	let end = start.saturating_add(max).min(data.len());
	let bytes = &data[start..end];
	let bytes = match bytes.iter().position(|b| *b == 0) {
		Some(n) => &bytes[..n],
		None => bytes,
	};
	String::from_utf8_lossy(bytes).into_owned()
}
