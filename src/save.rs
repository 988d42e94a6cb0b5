use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::err::{Error, Result};
use crate::io::Counting;
use crate::trie::{Dict, Trie};

const TARGET: &str = "marisa::save";

impl Trie {
	/// Serializes the dictionary.
	pub fn to_bytes(&self) -> Result<Vec<u8>> {
		let dict = self.dict.as_ref().ok_or(Error::Uninitialized)?;
		let mut buf = Vec::with_capacity(dict.stats.disk_size as usize);
		dict.save(&mut buf)?;
		Ok(buf)
	}

	/// Serializes the dictionary to `writer`, returning the number of bytes
	/// written. Pass `&mut writer` to keep using the writer afterwards.
	pub fn write_to<W: Write + Send>(&self, writer: W) -> Result<u64> {
		let dict = self.dict.as_ref().ok_or(Error::Uninitialized)?;
		let mut writer = Counting::new(writer);
		dict.save(&mut writer)?;
		writer.flush()?;
		Ok(writer.count())
	}

	/// Saves the dictionary to a file at `path`, replacing any existing file.
	pub fn save(&self, path: impl AsRef<Path>) -> Result<u64> {
		let path = path.as_ref();
		if self.dict.is_none() {
			return Err(Error::Uninitialized);
		}
		let n = self.write_to(BufWriter::new(File::create(path)?))?;
		debug!(target: TARGET, "Saved {n} bytes to {}", path.display());
		Ok(n)
	}
}

impl Dict {
	fn save(&self, writer: &mut (dyn Write + Send)) -> Result<()> {
		let mut state = self.state();
		state.ctl.call_writing("marisa_save", &[], writer)?;
		Ok(())
	}
}
