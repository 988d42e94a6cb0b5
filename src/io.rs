use std::io::{self, Read, Write};

/// Counts the bytes passing through a reader or writer.
#[derive(Debug)]
pub(crate) struct Counting<T> {
	inner: T,
	count: u64,
}

impl<T> Counting<T> {
	pub(crate) fn new(inner: T) -> Self {
		Self {
			inner,
			count: 0,
		}
	}

	pub(crate) fn count(&self) -> u64 {
		self.count
	}
}

impl<R: Read> Read for Counting<R> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		let n = self.inner.read(buf)?;
		self.count += n as u64;
		Ok(n)
	}
}

impl<W: Write> Write for Counting<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		let n = self.inner.write(buf)?;
		self.count += n as u64;
		Ok(n)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.inner.flush()
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;

	#[test]
	fn counts_both_directions() {
		let mut r = Counting::new(Cursor::new(b"hello world".to_vec()));
		let mut buf = [0u8; 5];
		r.read_exact(&mut buf).unwrap();
		assert_eq!(r.count(), 5);
		let mut w = Counting::new(Vec::new());
		w.write_all(b"abc").unwrap();
		w.write_all(b"de").unwrap();
		assert_eq!(w.count(), 5);
		assert_eq!(w.inner, b"abcde");
	}
}
