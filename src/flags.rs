//! Build options and their packed flag representation.

use std::fmt;

use crate::err::{Error, Result};

pub const MIN_NUM_TRIES: u32 = 1;
pub const MAX_NUM_TRIES: u32 = 127;
pub const DEFAULT_NUM_TRIES: u32 = 3;

const NUM_TRIES_MASK: u32 = 0x0007f;
const CACHE_LEVEL_MASK: u32 = 0x00f80;
const TAIL_MODE_MASK: u32 = 0x0f000;
const NODE_ORDER_MASK: u32 = 0xf0000;
const CONFIG_MASK: u32 = 0xfffff;

/// The size of the cache kept by each trie. A larger cache speeds up
/// searches at the cost of space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CacheLevel {
	Huge,
	Large,
	#[default]
	Normal,
	Small,
	Tiny,
}

/// How the last labels of keys are stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TailMode {
	/// Merge last labels as NUL-terminated strings. Switches to
	/// [`TailMode::Binary`] automatically if a label contains a NUL byte.
	#[default]
	Text,
	/// Merge last labels as byte sequences, marking their ends in a bit vector.
	Binary,
}

/// The arrangement of nodes, which decides the order of predictive search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum NodeOrder {
	/// Ascending label order
	Label,
	/// Descending weight order, which makes matching faster
	#[default]
	Weight,
}

/// Options for building a dictionary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Config {
	/// The number of tries, between 1 and 127. More tries usually make a
	/// dictionary smaller and slower.
	pub num_tries: u32,
	pub cache_level: CacheLevel,
	pub tail_mode: TailMode,
	pub node_order: NodeOrder,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			num_tries: DEFAULT_NUM_TRIES,
			cache_level: CacheLevel::default(),
			tail_mode: TailMode::default(),
			node_order: NodeOrder::default(),
		}
	}
}

impl Config {
	pub fn num_tries(mut self, num_tries: u32) -> Self {
		self.num_tries = num_tries;
		self
	}

	pub fn cache_level(mut self, cache_level: CacheLevel) -> Self {
		self.cache_level = cache_level;
		self
	}

	pub fn tail_mode(mut self, tail_mode: TailMode) -> Self {
		self.tail_mode = tail_mode;
		self
	}

	pub fn node_order(mut self, node_order: NodeOrder) -> Self {
		self.node_order = node_order;
		self
	}

	/// Packs the options into the flags passed to the guest.
	pub fn flags(&self) -> Result<u32> {
		if !(MIN_NUM_TRIES..=MAX_NUM_TRIES).contains(&self.num_tries) {
			return Err(Error::InvalidConfig(format!(
				"num_tries must be between {MIN_NUM_TRIES} and {MAX_NUM_TRIES}, got {}",
				self.num_tries
			)));
		}
		Ok(self.num_tries | self.cache_level.flag() | self.tail_mode.flag() | self.node_order.flag())
	}

	/// Unpacks guest flags. Fields left at zero take their default.
	pub fn from_flags(flags: u32) -> Result<Self> {
		if flags & !CONFIG_MASK != 0 {
			return Err(Error::InvalidConfig(format!("unknown flags {:#x}", flags & !CONFIG_MASK)));
		}
		let num_tries = match flags & NUM_TRIES_MASK {
			0 => DEFAULT_NUM_TRIES,
			n => n,
		};
		Ok(Self {
			num_tries,
			cache_level: CacheLevel::from_flag(flags & CACHE_LEVEL_MASK)?,
			tail_mode: TailMode::from_flag(flags & TAIL_MODE_MASK)?,
			node_order: NodeOrder::from_flag(flags & NODE_ORDER_MASK)?,
		})
	}
}

macro_rules! flag_enum {
	($ty:ident, $what:literal, $($variant:ident => ($flag:literal, $name:literal)),+ $(,)?) => {
		impl $ty {
			fn flag(self) -> u32 {
				match self {
					$(Self::$variant => $flag,)+
				}
			}

			fn from_flag(flag: u32) -> Result<Self> {
				match flag {
					0 => Ok(Self::default()),
					$($flag => Ok(Self::$variant),)+
					_ => Err(Error::InvalidConfig(format!(concat!("unknown ", $what, " {:#x}"), flag))),
				}
			}
		}

		impl fmt::Display for $ty {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(match self {
					$(Self::$variant => $name,)+
				})
			}
		}
	};
}

flag_enum!(CacheLevel, "cache level",
	Huge => (0x00080, "huge"),
	Large => (0x00100, "large"),
	Normal => (0x00200, "normal"),
	Small => (0x00400, "small"),
	Tiny => (0x00800, "tiny"),
);

flag_enum!(TailMode, "tail mode",
	Text => (0x01000, "text"),
	Binary => (0x02000, "binary"),
);

flag_enum!(NodeOrder, "node order",
	Label => (0x10000, "label"),
	Weight => (0x20000, "weight"),
);

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	#[test]
	fn default_flags() {
		assert_eq!(Config::default().flags().unwrap(), 0x21203);
	}

	#[rstest]
	#[case::min(Config::default().num_tries(1), 0x21201)]
	#[case::max(Config::default().num_tries(127), 0x2127f)]
	#[case::huge(Config::default().cache_level(CacheLevel::Huge), 0x21083)]
	#[case::tiny(Config::default().cache_level(CacheLevel::Tiny), 0x21803)]
	#[case::binary(Config::default().tail_mode(TailMode::Binary), 0x22203)]
	#[case::label(Config::default().node_order(NodeOrder::Label), 0x11203)]
	fn packing(#[case] config: Config, #[case] expected: u32) {
		assert_eq!(config.flags().unwrap(), expected);
		assert_eq!(Config::from_flags(expected).unwrap(), config);
	}

	#[rstest]
	#[case::zero(0)]
	#[case::too_many(128)]
	#[case::huge(u32::MAX)]
	fn invalid_num_tries(#[case] num_tries: u32) {
		let res = Config::default().num_tries(num_tries).flags();
		assert!(matches!(res, Err(Error::InvalidConfig(_))));
	}

	#[test]
	fn zero_fields_take_defaults() {
		assert_eq!(Config::from_flags(0).unwrap(), Config::default());
		let config = Config::from_flags(0x00400).unwrap();
		assert_eq!(config.cache_level, CacheLevel::Small);
		assert_eq!(config.num_tries, DEFAULT_NUM_TRIES);
		assert_eq!(config.node_order, NodeOrder::Weight);
	}

	#[rstest]
	#[case::outside_mask(0x100000)]
	#[case::two_cache_levels(0x00180)]
	#[case::unknown_tail(0x04000)]
	#[case::unknown_order(0x40000)]
	fn invalid_flags(#[case] flags: u32) {
		assert!(matches!(Config::from_flags(flags), Err(Error::InvalidConfig(_))));
	}

	#[test]
	fn every_field_stays_within_its_mask() {
		for level in [CacheLevel::Huge, CacheLevel::Large, CacheLevel::Normal, CacheLevel::Small, CacheLevel::Tiny] {
			assert_eq!(level.flag() & !CACHE_LEVEL_MASK, 0);
		}
		for mode in [TailMode::Text, TailMode::Binary] {
			assert_eq!(mode.flag() & !TAIL_MODE_MASK, 0);
		}
		for order in [NodeOrder::Label, NodeOrder::Weight] {
			assert_eq!(order.flag() & !NODE_ORDER_MASK, 0);
		}
	}

	#[test]
	fn display_names() {
		assert_eq!(CacheLevel::Normal.to_string(), "normal");
		assert_eq!(TailMode::Binary.to_string(), "binary");
		assert_eq!(NodeOrder::Label.to_string(), "label");
	}
}
