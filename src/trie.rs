use std::cell::{RefCell, RefMut};
use std::fmt;

use marisa_runtime::Controller;

use crate::err::Result;
use crate::query::Agent;

const TARGET: &str = "marisa::trie";

/// A read-only MARISA dictionary.
///
/// Keys are numbered from 0 to `len() - 1`. A trie which has not been built
/// or loaded behaves as an empty dictionary for queries and refuses to be
/// saved.
///
/// Building or loading into an existing trie only replaces its contents
/// once the new dictionary is complete; on error the trie is left as it
/// was. While both exist, the memory of both dictionaries is held.
///
/// A trie can be sent between threads but not shared. Searches borrow it
/// immutably, so other queries can run while iterating.
#[derive(Default)]
pub struct Trie {
	pub(crate) dict: Option<Dict>,
}

/// A loaded dictionary and the guest instance holding it.
pub(crate) struct Dict {
	pub(crate) stats: Stats,
	pub(crate) state: RefCell<State>,
}

pub(crate) struct State {
	pub(crate) ctl: Controller,
	/// An agent kept for the next query
	pub(crate) agent: Option<Agent>,
}

/// Size statistics reported by the guest after building or loading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Stats {
	/// The number of keys
	pub keys: u32,
	/// The size of the serialized dictionary in bytes
	pub disk_size: u32,
	/// The size of the dictionary in guest memory in bytes
	pub total_size: u32,
	pub num_tries: u32,
	pub num_nodes: u32,
}

impl Dict {
	/// Borrows the instance for a guest call.
	///
	/// # Panics
	///
	/// If a key lent by [`crate::Search::advance`] is still alive.
	pub(crate) fn state(&self) -> RefMut<'_, State> {
		match self.state.try_borrow_mut() {
			Ok(state) => state,
			Err(_) => panic!("query issued while a key lent by Search::advance is alive"),
		}
	}
}

impl Trie {
	/// Creates an empty, uninitialized trie.
	pub const fn new() -> Self {
		Self {
			dict: None,
		}
	}

	/// Replaces the dictionary with the one held by `ctl`.
	pub(crate) fn swap(&mut self, mut ctl: Controller) -> Result<()> {
		let res = ctl.call("marisa_stat", &[])?;
		if res.len() < 5 {
			panic!("marisa_stat returned {} values, expected at least 5", res.len());
		}
		let stats = Stats {
			keys: res[0],
			disk_size: res[1],
			total_size: res[2],
			num_tries: res[3],
			num_nodes: res[4],
		};
		debug!(target: TARGET, "Swapping in dictionary with {} keys", stats.keys);
		self.dict = Some(Dict {
			stats,
			state: RefCell::new(State {
				ctl,
				agent: None,
			}),
		});
		Ok(())
	}

	/// Whether the trie has been built or loaded.
	pub fn is_initialized(&self) -> bool {
		self.dict.is_some()
	}

	/// The statistics of the dictionary, all zero when uninitialized.
	pub fn stats(&self) -> Stats {
		self.dict.as_ref().map(|d| d.stats).unwrap_or_default()
	}

	/// The number of keys.
	pub fn len(&self) -> usize {
		self.stats().keys as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The size of the serialized dictionary in bytes.
	pub fn disk_size(&self) -> usize {
		self.stats().disk_size as usize
	}

	/// The size of the dictionary in memory in bytes.
	pub fn total_size(&self) -> usize {
		self.stats().total_size as usize
	}

	pub fn num_tries(&self) -> u32 {
		self.stats().num_tries
	}

	pub fn num_nodes(&self) -> u32 {
		self.stats().num_nodes
	}
}

impl fmt::Display for Trie {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.dict {
			None => f.write_str("Trie(uninitialized)"),
			Some(dict) => {
				let s = &dict.stats;
				write!(
					f,
					"Trie(size={} io_size={} total_size={} num_tries={} num_nodes={})",
					s.keys, s.disk_size, s.total_size, s.num_tries, s.num_nodes
				)
			}
		}
	}
}

impl fmt::Debug for Trie {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}
