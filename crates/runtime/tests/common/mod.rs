#![allow(dead_code)]
use std::sync::{Arc, OnceLock};

use marisa_runtime::{Allocator, Controller, MovableAllocator, Runtime};

pub const GUEST: &str = include_str!("../fixtures/guest.wat");

/// The guest runtime, compiled once per test binary.
pub fn runtime() -> &'static Runtime {
	static RUNTIME: OnceLock<Runtime> = OnceLock::new();
	RUNTIME.get_or_init(|| Runtime::new(GUEST.as_bytes(), "io").unwrap())
}

/// A fresh guest instance with movable memory of at most `max` bytes.
pub fn instance(max: usize) -> Controller {
	instance_with(Arc::new(MovableAllocator::new(max)))
}

pub fn instance_with(alloc: Arc<dyn Allocator>) -> Controller {
	runtime().instantiate(alloc).unwrap()
}

/// Reads a counter exported by the guest.
pub fn counter(ctl: &mut Controller, name: &'static str) -> u32 {
	ctl.call(name, &[]).unwrap()[0]
}
