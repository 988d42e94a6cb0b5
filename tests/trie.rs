mod common;

use std::io::{Cursor, Write};

use common::{built, collect, install, prefixes};
use marisa::{Config, Error, StdException, Trie};
use test_log::test;

/// The size of a serialized toy dictionary.
const IMAGE_SIZE: usize = 20;

#[test]
fn statistics() {
	let trie = built(3);
	assert_eq!(trie.len(), 3);
	assert!(!trie.is_empty());
	assert_eq!(trie.disk_size(), IMAGE_SIZE);
	assert_eq!(trie.total_size(), IMAGE_SIZE + 3);
	assert_eq!(trie.num_tries(), 3);
	assert_eq!(trie.num_nodes(), 4);
	assert_eq!(trie.to_string(), "Trie(size=3 io_size=20 total_size=23 num_tries=3 num_nodes=4)");
}

#[test]
fn lookups() {
	let trie = built(4);
	assert_eq!(trie.lookup("a").unwrap(), Some(0));
	assert_eq!(trie.lookup("abcd").unwrap(), Some(3));
	assert_eq!(trie.lookup("abcde").unwrap(), None);
	assert_eq!(trie.lookup("b").unwrap(), None);
	assert_eq!(trie.lookup("").unwrap(), None);
	assert_eq!(trie.reverse_lookup(2).unwrap().as_deref(), Some(&b"abc"[..]));
	assert_eq!(trie.reverse_lookup(4).unwrap(), None);
	assert_eq!(trie.reverse_lookup(u32::MAX).unwrap(), None);
}

#[test]
fn searches() {
	let trie = built(4);
	assert_eq!(collect(trie.common_prefix_search("abcx")), vec![
		(0, "a".to_owned()),
		(1, "ab".to_owned()),
		(2, "abc".to_owned())
	]);
	assert_eq!(collect(trie.common_prefix_search("x")), vec![]);
	assert_eq!(collect(trie.predictive_search("abc")), vec![(2, "abc".to_owned()), (3, "abcd".to_owned())]);
	assert_eq!(collect(trie.predictive_search("abx")), vec![]);
	let all = collect(trie.dump());
	assert_eq!(all.len(), 4);
	assert!(all.iter().zip(prefixes(4)).all(|((_, key), expected)| key == expected));
}

#[test]
fn searches_can_be_limited() {
	let trie = built(10);
	let first: Vec<_> = trie.dump().take(3).collect::<Result<_, _>>().unwrap();
	assert_eq!(first.len(), 3);
	// The abandoned search does not disturb the next one
	assert_eq!(trie.dump().count(), 10);
}

#[test]
fn round_trip() {
	let trie = built(5);
	let image = trie.to_bytes().unwrap();
	assert_eq!(image.len(), IMAGE_SIZE);
	let copy = Trie::from_bytes(&image).unwrap();
	assert_eq!(copy.stats(), trie.stats());
	assert_eq!(copy.to_bytes().unwrap(), image);
	let read = Trie::read_from(Cursor::new(image.clone())).unwrap();
	assert_eq!(read.to_bytes().unwrap(), image);
	assert_eq!(read.lookup("abcde").unwrap(), Some(4));
}

#[test]
fn streams_consume_exactly_the_dictionary() {
	let trie = built(2);
	let mut image = trie.to_bytes().unwrap();
	assert_eq!(trie.write_to(Vec::new()).unwrap(), IMAGE_SIZE as u64);
	image.extend_from_slice(b"trailing data");
	let mut copy = Trie::new();
	assert_eq!(copy.load_from(Cursor::new(image)).unwrap(), IMAGE_SIZE as u64);
	assert_eq!(copy.len(), 2);
}

#[test]
fn borrowed_streams_show_how_far_loading_got() {
	let mut trie = built(2);
	let mut image = Vec::new();
	assert_eq!(trie.write_to(&mut image).unwrap(), IMAGE_SIZE as u64);
	assert_eq!(trie.write_to(&mut image).unwrap(), IMAGE_SIZE as u64);
	assert_eq!(image.len(), 2 * IMAGE_SIZE);
	// Two dictionaries back to back load one after the other
	let mut input = Cursor::new(&image[..]);
	assert_eq!(trie.load_from(&mut input).unwrap(), IMAGE_SIZE as u64);
	assert_eq!(input.position(), IMAGE_SIZE as u64);
	assert_eq!(trie.load_from(&mut input).unwrap(), IMAGE_SIZE as u64);
	// A failed load leaves the reader after the bytes it consumed
	let mut short = Cursor::new(&image[..IMAGE_SIZE - 2]);
	assert!(matches!(trie.load_from(&mut short), Err(Error::UnexpectedEof)));
	assert_eq!(short.position(), IMAGE_SIZE as u64 - 2);
	assert_eq!(trie.len(), 2);
	let mut file = tempfile::tempfile().unwrap();
	trie.write_to(&mut file).unwrap();
	file.flush().unwrap();
}

#[test]
fn truncated_images_are_unexpected_eof() {
	let mut trie = built(3);
	let image = trie.to_bytes().unwrap();
	for len in [0, 4, 16, IMAGE_SIZE - 1] {
		let short = &image[..len];
		assert!(matches!(Trie::from_bytes(short), Err(Error::UnexpectedEof)), "from_bytes({len})");
		let res = trie.load_from(Cursor::new(short.to_vec()));
		assert!(matches!(res, Err(Error::UnexpectedEof)), "load_from({len})");
		assert!(matches!(trie.load_bytes(short), Err(Error::UnexpectedEof)));
	}
	// The failed loads left the dictionary alone
	assert_eq!(trie.len(), 3);
	assert_eq!(trie.lookup("abc").unwrap(), Some(2));
}

#[test]
fn corrupt_images_are_exceptions() {
	let mut trie = built(3);
	let mut image = trie.to_bytes().unwrap();
	image[0] ^= 0xff;
	let Err(Error::Exception(ex)) = trie.load_bytes(&image) else {
		panic!("expected an exception");
	};
	assert!(ex.matches(StdException::RuntimeError));
	assert_eq!(ex.to_string(), "std::runtime_error: invalid magic");
	assert!(matches!(trie.load_from(Cursor::new(image)), Err(Error::Exception(_))));
	assert_eq!(trie.len(), 3);
}

#[test]
fn rebuilding_replaces_the_dictionary() {
	let mut trie = built(3);
	trie.build(prefixes(7), Config::default()).unwrap();
	assert_eq!(trie.len(), 7);
	let res = trie.build(prefixes(2), Config::default().num_tries(200));
	assert!(matches!(res, Err(Error::InvalidConfig(_))));
	assert_eq!(trie.len(), 7);
}

#[test]
fn allocation_failures_keep_the_dictionary() {
	let mut trie = built(3);
	let image = trie.to_bytes().unwrap();
	// The toy guest refuses allocations above 16 MiB
	let huge = vec![b'a'; 17 << 20];
	assert!(matches!(trie.build([&huge[..]], Config::default()), Err(Error::Alloc(_))));
	assert_eq!(trie.len(), 3);
	let mut padded = image.clone();
	padded.resize(huge.len(), 0);
	assert!(matches!(trie.load_bytes(&padded), Err(Error::Alloc(_))));
	assert_eq!(trie.len(), 3);
	assert_eq!(trie.lookup("abc").unwrap(), Some(2));
	assert_eq!(trie.to_bytes().unwrap(), image);
}

#[test]
fn weights_change_the_dictionary() {
	install();
	let mut a = Trie::new();
	a.build_weighted([("a", 1.0), ("ab", 1.0)], Config::default()).unwrap();
	let mut b = Trie::new();
	b.build_weighted([("a", 1.0), ("ab", 2.0)], Config::default()).unwrap();
	let mut c = Trie::new();
	c.build(["a", "ab"], Config::default()).unwrap();
	assert_ne!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
	assert_eq!(a.to_bytes().unwrap(), c.to_bytes().unwrap());
}

#[test]
fn uninitialized_tries() {
	let trie = Trie::new();
	assert!(!trie.is_initialized());
	assert_eq!(trie.to_string(), "Trie(uninitialized)");
	assert!(matches!(trie.to_bytes(), Err(Error::Uninitialized)));
	assert!(matches!(trie.write_to(Vec::new()), Err(Error::Uninitialized)));
	let dir = tempfile::tempdir().unwrap();
	assert!(matches!(trie.save(dir.path().join("empty.marisa")), Err(Error::Uninitialized)));
	assert!(!dir.path().join("empty.marisa").exists());
	assert_eq!(trie.lookup("a").unwrap(), None);
	assert_eq!(trie.dump().count(), 0);
}

#[test]
fn save_and_open() {
	let trie = built(6);
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("dict.marisa");
	assert_eq!(trie.save(&path).unwrap(), IMAGE_SIZE as u64);
	let opened = Trie::open(&path).unwrap();
	assert_eq!(opened.stats(), trie.stats());
	assert_eq!(opened.reverse_lookup(5).unwrap().as_deref(), Some(&b"abcdef"[..]));
	assert!(matches!(Trie::open(dir.path().join("missing")), Err(Error::Io(_))));
}

#[cfg(unix)]
#[test]
fn map_file_at_an_offset() {
	let trie = built(4);
	let image = trie.to_bytes().unwrap();
	let mut file = tempfile::tempfile().unwrap();
	file.write_all(&[0xaa; 1000]).unwrap();
	file.write_all(&image).unwrap();
	file.write_all(b"trailer").unwrap();
	let mut mapped = Trie::new();
	mapped.map_file(&file, 1000, IMAGE_SIZE as u64).unwrap();
	assert_eq!(mapped.stats(), trie.stats());
	assert_eq!(mapped.to_bytes().unwrap(), image);
	assert_eq!(collect(mapped.predictive_search("abc")).len(), 2);
	// A short mapping is a truncated dictionary
	assert!(matches!(mapped.map_file(&file, 1000, 10), Err(Error::UnexpectedEof)));
	assert!(matches!(mapped.map_file(&file, 1000, 0), Err(Error::UnexpectedEof)));
	assert_eq!(mapped.len(), 4);
}

#[cfg(unix)]
#[test]
fn map_file_past_the_end_of_the_file() {
	let trie = built(4);
	let image = trie.to_bytes().unwrap();
	let mut file = tempfile::tempfile().unwrap();
	file.write_all(&image).unwrap();
	let mut mapped = built(2);
	let page = marisa_runtime::alloc::page_size() as u64;
	assert!(matches!(mapped.map_file(&file, 0, 3 * page), Err(Error::UnexpectedEof)));
	assert!(matches!(mapped.map_file(&file, 1, IMAGE_SIZE as u64), Err(Error::UnexpectedEof)));
	assert!(matches!(mapped.map_file(&file, u64::MAX, 1), Err(Error::UnexpectedEof)));
	assert_eq!(mapped.len(), 2);
	mapped.map_file(&file, 0, IMAGE_SIZE as u64).unwrap();
	assert_eq!(mapped.len(), 4);
}

#[test]
fn map_file_rejects_huge_lengths() {
	install();
	let file = tempfile::tempfile().unwrap();
	let mut trie = Trie::new();
	assert!(matches!(trie.map_file(&file, 0, u64::MAX), Err(Error::TooLarge)));
}

#[test]
fn nested_queries() {
	let trie = built(5);
	let mut pairs = 0;
	for outer in trie.dump() {
		let (id, key) = outer.unwrap();
		assert_eq!(trie.reverse_lookup(id).unwrap().unwrap(), key);
		for inner in trie.predictive_search(&key) {
			let (inner_id, inner_key) = inner.unwrap();
			assert!(inner_key.starts_with(&key));
			assert_eq!(trie.lookup(&inner_key).unwrap(), Some(inner_id));
			pairs += 1;
		}
	}
	assert_eq!(pairs, 5 + 4 + 3 + 2 + 1);
}

#[test]
fn lending_searches() {
	let trie = built(3);
	let mut search = trie.common_prefix_search("abc");
	let mut ids = Vec::new();
	while let Some(entry) = search.advance().unwrap() {
		assert_eq!(entry.key().len(), entry.id() as usize + 1);
		ids.push(entry.id());
	}
	assert_eq!(ids, [0, 1, 2]);
}

#[test]
fn tries_move_between_threads() {
	let trie = built(3);
	let found = std::thread::spawn(move || trie.lookup("ab").unwrap()).join().unwrap();
	assert_eq!(found, Some(1));
}
