use std::sync::Arc;

use anyhow::Context;
use wasmtime::{Config, Engine, InstancePre, Linker, Module, Store, Strategy};

use crate::alloc::{self, Allocator, HostMemory};
use crate::cnf::COMPILER;
use crate::controller::{Controller, StoreData};
use crate::err::{Error, Result};
use crate::host::implement_host_functions;

const TARGET: &str = "marisa::runtime";

/// A compiled guest module with its host functions linked in.
///
/// Compilation happens once; every instance created from the runtime shares
/// the compiled code but owns its memory.
pub struct Runtime {
	engine: Engine,
	pre: InstancePre<StoreData>,
}

impl Runtime {
	/// Compiles `wasm`, given either as a binary module or in text format.
	///
	/// The guest's stream callbacks are imported from the module named `imports`.
	pub fn new(wasm: &[u8], imports: &str) -> Result<Self> {
		// Step 1: configure an engine whose memories come from our allocators
		let mut config = Config::new();
		config
			.with_host_memory(Arc::new(HostMemory))
			.memory_reservation(0)
			.memory_guard_size(0)
			.memory_reservation_for_growth(0)
			.memory_may_move(true)
			.memory_init_cow(false)
			.wasm_multi_value(true)
			.strategy(strategy());
		let engine = Engine::new(&config).context("Failed to create the guest engine").map_err(Error::Runtime)?;
		// Step 2: compile the module
		let module =
			Module::new(&engine, wasm).context("Failed to construct module from bytes").map_err(Error::Runtime)?;
		// Step 3: link the host functions
		let mut linker: Linker<StoreData> = Linker::new(&engine);
		implement_host_functions(&mut linker, imports)
			.context("Failed to implement host functions")
			.map_err(Error::Runtime)?;
		let pre = linker.instantiate_pre(&module).context("Failed to link WASM module").map_err(Error::Runtime)?;
		debug!(target: TARGET, "Compiled guest module of {} bytes", wasm.len());
		Ok(Self {
			engine,
			pre,
		})
	}

	/// Creates a guest instance whose linear memory is supplied by `alloc`.
	///
	/// If the allocator fails, its error is returned rather than the
	/// generic instantiation failure.
	pub fn instantiate(&self, alloc: Arc<dyn Allocator>) -> Result<Controller> {
		let mut store = Store::new(&self.engine, StoreData::default());
		let (res, alloc_err) = alloc::scoped(alloc, || self.pre.instantiate(&mut store));
		let instance = match (res, alloc_err) {
			(Ok(instance), _) => instance,
			(Err(_), Some(err)) => return Err(err),
			(Err(err), None) => {
				return Err(Error::Runtime(err.context("Failed to instantiate WASM module")));
			}
		};
		Controller::new(store, instance)
	}
}

fn strategy() -> Strategy {
	match COMPILER.as_str() {
		"winch" => Strategy::Winch,
		"cranelift" => Strategy::Cranelift,
		other => {
			warn!(target: TARGET, "Unknown compiler {other:?}, using cranelift");
			Strategy::Cranelift
		}
	}
}
