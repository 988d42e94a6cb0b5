/// Lazily reads a setting from an environment variable.
///
/// Expands to a `std::sync::LazyLock`. With a type and default, an unset or
/// unparsable variable yields the default; the default may also be given as
/// a closure. `Option<String>` settings have no default and treat an empty
/// variable as unset.
#[macro_export]
macro_rules! lazy_env_parse {
	($key:expr_2021, Option<String>) => {
		std::sync::LazyLock::new(|| std::env::var($key).ok().filter(|s| !s.is_empty()))
	};
	($key:expr_2021, $t:ty, || $default:expr_2021) => {
		std::sync::LazyLock::new(|| {
			std::env::var($key).ok().and_then(|s| s.parse::<$t>().ok()).unwrap_or_else(|| $default)
		})
	};
	($key:expr_2021, $t:ty, $default:expr_2021) => {
		std::sync::LazyLock::new(|| {
			std::env::var($key).ok().and_then(|s| s.parse::<$t>().ok()).unwrap_or($default)
		})
	};
}
