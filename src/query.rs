//! Queries against a dictionary.
//!
//! Every query runs through a guest agent: the host sets the agent's query,
//! steps it with one of the search operations and reads each result out of
//! guest memory. Creating agents is comparatively expensive, so the last
//! finished agent is kept together with a small buffer for short query
//! strings. Nested queries create their own agents and only the first one to
//! finish is cached.

use std::cell::{Ref, RefMut};
use std::fmt;

use crate::cnf::{QUERY_CACHE, SHORT_QUERY_LEN};
use crate::err::{Error, Result};
use crate::trie::{Dict, State, Trie};

const TARGET: &str = "marisa::query";

/// A guest agent and the query buffers it owns.
#[derive(Debug)]
pub(crate) struct Agent {
	ptr: u32,
	/// A reusable buffer of `SHORT_QUERY_LEN` bytes
	short: u32,
	/// A buffer holding a query too long for the short one
	long: u32,
}

/// A search operation exported by the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Op {
	Lookup,
	ReverseLookup,
	CommonPrefixSearch,
	PredictiveSearch,
}

impl Op {
	fn export(self) -> &'static str {
		match self {
			Self::Lookup => "marisa_query_lookup",
			Self::ReverseLookup => "marisa_query_reverse_lookup",
			Self::CommonPrefixSearch => "marisa_query_common_prefix_search",
			Self::PredictiveSearch => "marisa_query_predictive_search",
		}
	}
}

/// A result as it sits in guest memory: the key id and the address and
/// length of the key bytes.
type Hit = (u32, u32, u32);

impl State {
	/// Takes the cached agent or creates a new one.
	fn agent(&mut self) -> Result<Agent> {
		if *QUERY_CACHE {
			if let Some(agent) = self.agent.take() {
				return Ok(agent);
			}
		}
		let ptr = self.ctl.call("marisa_query_new", &[])?[0];
		if ptr == 0 {
			return Err(Error::Alloc("guest could not create a query".to_owned()));
		}
		trace!(target: TARGET, "Created agent {ptr:#x}");
		Ok(Agent {
			ptr,
			short: 0,
			long: 0,
		})
	}

	/// Starts a query for `key`.
	pub(crate) fn begin_str(&mut self, key: &[u8]) -> Result<Agent> {
		let mut agent = self.agent()?;
		match self.set_str(&mut agent, key) {
			Ok(()) => Ok(agent),
			Err(err) => {
				self.end(agent);
				Err(err)
			}
		}
	}

	fn set_str(&mut self, agent: &mut Agent, key: &[u8]) -> Result<()> {
		let len = u32::try_from(key.len()).map_err(|_| Error::TooLarge)?;
		let addr = if *QUERY_CACHE && key.len() < SHORT_QUERY_LEN {
			if agent.short == 0 {
				agent.short = self.ctl.alloc(SHORT_QUERY_LEN)?.0;
			}
			agent.short
		} else {
			let (addr, _) = self.ctl.alloc(key.len())?;
			agent.long = addr;
			addr
		};
		self.ctl.write(addr, key);
		self.ctl.call("marisa_query_set_str", &[agent.ptr, addr, len])?;
		Ok(())
	}

	/// Starts a query for the key numbered `id`.
	pub(crate) fn begin_id(&mut self, id: u32) -> Result<Agent> {
		let agent = self.agent()?;
		match self.ctl.call("marisa_query_set_id", &[agent.ptr, id]) {
			Ok(_) => Ok(agent),
			Err(err) => {
				self.end(agent);
				Err(err.into())
			}
		}
	}

	/// Advances the agent to its next result.
	pub(crate) fn fetch(&mut self, agent: &Agent, op: Op) -> Result<Option<Hit>> {
		if self.ctl.call(op.export(), &[agent.ptr])?[0] == 0 {
			return Ok(None);
		}
		let res = self.ctl.call("marisa_query_result", &[agent.ptr])?;
		Ok(Some((res[0], res[1], res[2])))
	}

	/// Finishes a query, keeping the agent for the next one if the cache is free.
	///
	/// # Panics
	///
	/// If the guest fails to reset or release the agent.
	pub(crate) fn end(&mut self, mut agent: Agent) {
		if let Err(err) = self.ctl.call("marisa_query_clear", &[agent.ptr]) {
			panic!("failed to clear query {:#x}: {err}", agent.ptr);
		}
		if agent.long != 0 {
			self.ctl.free(agent.long);
			agent.long = 0;
		}
		if *QUERY_CACHE && self.agent.is_none() {
			self.agent = Some(agent);
			return;
		}
		self.ctl.free(agent.short);
		if let Err(err) = self.ctl.call("marisa_query_free", &[agent.ptr]) {
			panic!("failed to free query {:#x}: {err}", agent.ptr);
		}
		trace!(target: TARGET, "Released agent {:#x}", agent.ptr);
	}

	/// Runs a query expecting at most one result.
	fn single(&mut self, agent: Agent, op: Op) -> Result<Option<Hit>> {
		let res = self.fetch(&agent, op);
		self.end(agent);
		res
	}
}

impl Trie {
	/// Finds the id of `key`.
	pub fn lookup(&self, key: impl AsRef<[u8]>) -> Result<Option<u32>> {
		let Some(dict) = &self.dict else {
			return Ok(None);
		};
		let mut state = dict.state();
		let agent = state.begin_str(key.as_ref())?;
		Ok(state.single(agent, Op::Lookup)?.map(|(id, _, _)| id))
	}

	/// Finds the key numbered `id`.
	pub fn reverse_lookup(&self, id: u32) -> Result<Option<Vec<u8>>> {
		let Some(dict) = &self.dict else {
			return Ok(None);
		};
		if id >= dict.stats.keys {
			return Ok(None);
		}
		let mut state = dict.state();
		let agent = state.begin_id(id)?;
		let hit = state.fetch(&agent, Op::ReverseLookup);
		let res = hit.map(|hit| hit.map(|(_, ptr, len)| state.ctl.read(ptr, len).to_vec()));
		state.end(agent);
		res
	}

	/// Iterates over the keys which are prefixes of `query`, shortest first.
	pub fn common_prefix_search(&self, query: impl AsRef<[u8]>) -> Search<'_> {
		Search::new(self, Op::CommonPrefixSearch, query.as_ref())
	}

	/// Iterates over the keys starting with `prefix`.
	///
	/// The order depends on the node order the dictionary was built with.
	pub fn predictive_search(&self, prefix: impl AsRef<[u8]>) -> Search<'_> {
		Search::new(self, Op::PredictiveSearch, prefix.as_ref())
	}

	/// Iterates over every key.
	pub fn dump(&self) -> Search<'_> {
		self.predictive_search(b"")
	}
}

/// An iterator over the results of a search.
///
/// The search starts on the first call to [`Search::advance`] or
/// [`Iterator::next`] and releases its agent as soon as the results run
/// out, or when dropped.
///
/// [`Search::advance`] lends each key straight out of guest memory. While
/// an [`Entry`] is alive no other query can run on the same trie; issuing
/// one panics. The [`Iterator`] implementation copies each key instead, so
/// other queries can be issued between items.
pub struct Search<'a> {
	dict: Option<&'a Dict>,
	op: Op,
	query: Vec<u8>,
	agent: Option<Agent>,
	done: bool,
}

/// A result lent by [`Search::advance`].
pub struct Entry<'a> {
	id: u32,
	key: Ref<'a, [u8]>,
}

impl Entry<'_> {
	pub fn id(&self) -> u32 {
		self.id
	}

	pub fn key(&self) -> &[u8] {
		&self.key
	}
}

impl fmt::Debug for Entry<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Entry").field("id", &self.id).field("key", &String::from_utf8_lossy(&self.key)).finish()
	}
}

impl<'a> Search<'a> {
	fn new(trie: &'a Trie, op: Op, query: &[u8]) -> Self {
		Self {
			dict: trie.dict.as_ref(),
			op,
			query: query.to_vec(),
			agent: None,
			done: false,
		}
	}

	/// Moves to the next result, lending its key.
	pub fn advance(&mut self) -> Result<Option<Entry<'_>>> {
		let Some(dict) = self.dict else {
			return Ok(None);
		};
		let Some((id, ptr, len)) = self.step(dict.state())? else {
			return Ok(None);
		};
		let key = Ref::map(dict.state.borrow(), |s| s.ctl.read(ptr, len));
		Ok(Some(Entry {
			id,
			key,
		}))
	}

	fn step(&mut self, mut state: RefMut<'_, State>) -> Result<Option<Hit>> {
		if self.done {
			return Ok(None);
		}
		// Step 1: start the query on the first call
		let agent = match self.agent.take() {
			Some(agent) => agent,
			None => match state.begin_str(&self.query) {
				Ok(agent) => agent,
				Err(err) => {
					self.done = true;
					return Err(err);
				}
			},
		};
		// Step 2: fetch the next result, finishing the query once exhausted
		match state.fetch(&agent, self.op) {
			Ok(Some(hit)) => {
				self.agent = Some(agent);
				Ok(Some(hit))
			}
			res => {
				self.done = true;
				state.end(agent);
				res
			}
		}
	}
}

impl Iterator for Search<'_> {
	type Item = Result<(u32, Vec<u8>)>;

	fn next(&mut self) -> Option<Self::Item> {
		match self.advance() {
			Ok(Some(entry)) => Some(Ok((entry.id, entry.key.to_vec()))),
			Ok(None) => None,
			Err(err) => Some(Err(err)),
		}
	}
}

impl Drop for Search<'_> {
	fn drop(&mut self) {
		let (Some(agent), Some(dict)) = (self.agent.take(), self.dict) else {
			return;
		};
		match dict.state.try_borrow_mut() {
			Ok(mut state) => state.end(agent),
			Err(_) => warn!(target: TARGET, "Leaking agent {:#x} of a search dropped mid-query", agent.ptr),
		}
	}
}

#[cfg(test)]
mod tests {
	use test_log::test;

	use super::*;
	use crate::Config;
	use crate::test_guest::install;

	fn trie(keys: usize) -> Trie {
		install();
		let mut trie = Trie::new();
		let keys = (1..=keys).map(|n| &"abcdefghijklmnopqrstuvwxyz"[..n]);
		trie.build(keys, Config::default()).unwrap();
		trie
	}

	fn live(trie: &Trie) -> u32 {
		let dict = trie.dict.as_ref().unwrap();
		dict.state.borrow_mut().ctl.call("mock_live", &[]).unwrap()[0]
	}

	#[test]
	fn uninitialized_tries_are_empty() {
		let trie = Trie::new();
		assert_eq!(trie.lookup("a").unwrap(), None);
		assert_eq!(trie.reverse_lookup(0).unwrap(), None);
		assert_eq!(trie.dump().count(), 0);
		assert!(trie.predictive_search("a").advance().unwrap().is_none());
	}

	#[test]
	fn the_last_agent_is_cached() {
		let trie = trie(3);
		assert_eq!(trie.lookup("ab").unwrap(), Some(1));
		let before = live(&trie);
		for _ in 0..10 {
			assert_eq!(trie.lookup("abc").unwrap(), Some(2));
			assert_eq!(trie.reverse_lookup(0).unwrap().as_deref(), Some(&b"a"[..]));
		}
		// One agent and its short buffer stay alive
		assert_eq!(live(&trie), before);
		let state = trie.dict.as_ref().unwrap().state.borrow();
		let agent = state.agent.as_ref().unwrap();
		assert_ne!(agent.short, 0);
		assert_eq!(agent.long, 0);
	}

	#[test]
	fn long_queries_use_their_own_buffer() {
		let trie = trie(3);
		let before = live(&trie);
		let mut key = b"abc".to_vec();
		key.resize(SHORT_QUERY_LEN * 2, b'x');
		assert_eq!(trie.lookup(&key).unwrap(), None);
		assert_eq!(trie.common_prefix_search(&key).count(), 3);
		// Only the cached agent remains, without a short buffer
		assert_eq!(live(&trie), before + 1);
	}

	#[test]
	fn nested_searches_release_extra_agents() {
		let trie = trie(4);
		let mut seen = Vec::new();
		for outer in trie.dump() {
			let (id, key) = outer.unwrap();
			assert_eq!(trie.lookup(&key).unwrap(), Some(id));
			for inner in trie.common_prefix_search(&key) {
				seen.push(inner.unwrap().0);
			}
		}
		assert_eq!(seen.len(), 1 + 2 + 3 + 4);
		// Only the cached agent and its short buffer remain
		assert_eq!(live(&trie), 2);
	}

	#[test]
	fn dropping_a_search_releases_its_agent() {
		let trie = trie(5);
		let mut search = trie.dump();
		assert!(search.next().is_some());
		let mut other = trie.predictive_search("a");
		assert!(other.next().is_some());
		drop(search);
		drop(other);
		assert_eq!(live(&trie), 2);
	}

	#[test]
	fn entries_borrow_guest_memory() {
		let trie = trie(3);
		let mut search = trie.predictive_search("ab");
		let mut keys = Vec::new();
		while let Some(entry) = search.advance().unwrap() {
			keys.push((entry.id(), entry.key().to_vec()));
		}
		assert_eq!(keys, vec![(1, b"ab".to_vec()), (2, b"abc".to_vec())]);
		assert!(search.advance().unwrap().is_none());
	}

	#[test]
	#[should_panic(expected = "query issued while a key lent by Search::advance is alive")]
	fn queries_during_a_lent_key_panic() {
		let trie = trie(3);
		let mut search = trie.predictive_search("a");
		let entry = search.advance().unwrap().unwrap();
		let _ = trie.lookup(entry.key());
	}
}
