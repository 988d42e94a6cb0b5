use std::sync::LazyLock;

/// The largest linear memory a guest may use on this platform
///
/// On 64-bit hosts this is just under the 4 GiB a 32-bit guest can address,
/// on 32-bit hosts it is limited to 2 GiB.
pub const MAX_ALLOC: usize = if (u32::MAX as u64) < (isize::MAX as u64) {
	u32::MAX as usize
} else {
	isize::MAX as usize
};

/// Which compiler translates guest code (default: cranelift)
///
/// `winch` compiles faster but produces slower code.
pub static COMPILER: LazyLock<String> =
	lazy_env_parse!("MARISA_COMPILER", String, || "cranelift".to_owned());
