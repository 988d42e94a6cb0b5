use std::sync::LazyLock;

use marisa_runtime::lazy_env_parse;

pub use marisa_runtime::cnf::MAX_ALLOC;

/// Queries shorter than this reuse a buffer kept with the cached agent
pub const SHORT_QUERY_LEN: usize = 128;

/// Path of the guest module loaded on first use unless one was installed
/// with [`crate::initialize`]
pub static GUEST_PATH: LazyLock<Option<String>> = lazy_env_parse!("MARISA_WASM", Option<String>);

/// The size of the buffers keys are batched into while building (default: 4 MiB)
pub static CHUNK_SIZE: LazyLock<usize> = lazy_env_parse!("MARISA_CHUNK_SIZE", usize, 4 << 20);

/// Whether keys are batched into chunks while building (default: true)
pub static CHUNK_BUILD: LazyLock<bool> = lazy_env_parse!("MARISA_CHUNK_BUILD", bool, true);

/// Whether an agent and its query buffer are kept for the next query (default: true)
pub static QUERY_CACHE: LazyLock<bool> = lazy_env_parse!("MARISA_QUERY_CACHE", bool, true);

/// Memory reserved above the size of a dictionary image when loading it (default: 32 MiB)
pub static SCRATCH_SPACE: LazyLock<usize> = lazy_env_parse!("MARISA_SCRATCH_SPACE", usize, 32 << 20);
