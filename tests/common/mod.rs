#![allow(dead_code)]
use marisa::{Config, Trie};

pub const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz";

/// Installs the toy guest, which answers queries from alphabet prefixes.
pub fn install() {
	marisa::initialize(include_bytes!("../fixtures/marisa.wat")).unwrap();
}

/// The first `n` prefixes of the alphabet.
pub fn prefixes(n: usize) -> impl Iterator<Item = &'static str> {
	(1..=n).map(|len| &ALPHABET[..len])
}

/// A dictionary of the first `n` alphabet prefixes.
pub fn built(n: usize) -> Trie {
	install();
	let mut trie = Trie::new();
	trie.build(prefixes(n), Config::default()).unwrap();
	trie
}

/// Collects the results of a search as strings.
pub fn collect(search: marisa::Search<'_>) -> Vec<(u32, String)> {
	search.map(|r| r.map(|(id, key)| (id, String::from_utf8(key).unwrap()))).collect::<Result<_, _>>().unwrap()
}
