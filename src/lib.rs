//! Read-only MARISA tries backed by a sandboxed WebAssembly guest.
//!
//! The trie itself is the C++ `marisa-trie` library compiled to a wasm
//! module. This crate drives that guest: it builds dictionaries from keys,
//! loads and maps serialized images, saves them, and turns the guest's
//! agent protocol into Rust iterators.
//!
//! The guest module is compiled once per process. Install it with
//! [`initialize`], or point the `MARISA_WASM` environment variable at it and
//! let the first dictionary operation load it.
//!
//! ```no_run
//! # fn main() -> marisa::Result<()> {
//! marisa::initialize(&std::fs::read("marisa.wasm")?)?;
//! let mut trie = marisa::Trie::new();
//! trie.build(["a", "a/b", "a/b/c", "b"], marisa::Config::default())?;
//! for hit in trie.predictive_search("a/") {
//! 	let (id, key) = hit?;
//! 	println!("{id} {}", String::from_utf8_lossy(&key));
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod build;
pub mod cnf;
pub mod err;
pub mod flags;
mod io;
mod load;
mod query;
mod save;
mod trie;

use std::sync::{Arc, OnceLock};

use marisa_runtime::{Allocator, Controller, Runtime};
use parking_lot::Mutex;

pub use build::Builder;
pub use err::{Error, Result};
pub use flags::{CacheLevel, Config, NodeOrder, TailMode};
pub use marisa_runtime::{Exception, StdException};
pub use query::{Entry, Search};
pub use trie::{Stats, Trie};

const TARGET: &str = "marisa";

/// The import module the guest's stream callbacks live in.
const IMPORTS: &str = "marisa";

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Compiles the guest module, given in binary or text format.
///
/// Only the first successful call has an effect; later calls return
/// immediately.
pub fn initialize(wasm: &[u8]) -> Result<()> {
	let _guard = INIT.lock();
	if RUNTIME.get().is_some() {
		return Ok(());
	}
	let runtime = Runtime::new(wasm, IMPORTS)?;
	if RUNTIME.set(runtime).is_ok() {
		info!(target: TARGET, "Initialised guest module of {} bytes", wasm.len());
	}
	Ok(())
}

/// The compiled guest, loaded from `MARISA_WASM` on first use.
fn runtime() -> Result<&'static Runtime> {
	if let Some(runtime) = RUNTIME.get() {
		return Ok(runtime);
	}
	let Some(path) = cnf::GUEST_PATH.as_deref() else {
		return Err(Error::NoGuest);
	};
	debug!(target: TARGET, "Loading guest module from {path}");
	initialize(&std::fs::read(path)?)?;
	RUNTIME.get().ok_or(Error::NoGuest)
}

/// Creates a guest instance with memory from `alloc`.
pub(crate) fn instantiate(alloc: Arc<dyn Allocator>) -> Result<Controller> {
	Ok(runtime()?.instantiate(alloc)?)
}
