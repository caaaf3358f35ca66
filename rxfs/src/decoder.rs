use std::io::{BufRead, Error, ErrorKind, Result, Seek, SeekFrom, Write};

use bincode::{
	config::{BigEndian, Configuration, Fixint, NoLimit},
	Decode, Encode,
};

/// Everything on an XFS volume is big-endian.
pub type Config = Configuration<BigEndian, Fixint, NoLimit>;

pub const fn config() -> Config {
	bincode::config::standard()
		.with_fixed_int_encoding()
		.with_big_endian()
}

fn decode<T: Decode>(mut rdr: &mut dyn BufRead) -> Result<T> {
	bincode::decode_from_std_read(&mut rdr, config())
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to decode"))
}

/// Decode a record from the front of a byte slice.
pub fn decode_slice<T: Decode>(buf: &[u8]) -> Result<T> {
	bincode::decode_from_slice(buf, config())
		.map(|(v, _)| v)
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to decode"))
}

/// Encode a record over the front of a byte slice.
pub fn encode_slice<T: Encode>(buf: &mut [u8], val: &T) -> Result<()> {
	bincode::encode_into_slice(val, buf, config())
		.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to encode"))?;
	Ok(())
}

/// Codec for on-disk scalars and records, layered over any positioned
/// byte stream (the block layer, or a `Cursor` over a single buffer).
pub struct Decoder<T> {
	inner: T,
}

impl<T: BufRead> Decoder<T> {
	pub fn new(inner: T) -> Self {
		Self {
			inner,
		}
	}

	pub fn inner(&self) -> &T {
		&self.inner
	}

	pub fn inner_mut(&mut self) -> &mut T {
		&mut self.inner
	}

	pub fn decode<X: Decode>(&mut self) -> Result<X> {
		decode(&mut self.inner)
	}

	pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
		self.inner.read_exact(buf)
	}
}

impl<T: BufRead + Seek> Decoder<T> {
	pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
		self.seek(pos)?;
		self.read(buf)
	}

	pub fn decode_at<X: Decode>(&mut self, pos: u64) -> Result<X> {
		self.seek(pos)?;
		self.decode()
	}

	pub fn seek(&mut self, pos: u64) -> Result<()> {
		self.inner.seek(SeekFrom::Start(pos))?;
		Ok(())
	}

	pub fn seek_relative(&mut self, off: i64) -> Result<()> {
		self.inner.seek_relative(off)
	}

	pub fn align_to(&mut self, align: u64) -> Result<()> {
		assert_eq!(align.count_ones(), 1);
		let pos = self.inner.stream_position()?;
		let new_pos = (pos + align - 1) & !(align - 1);
		self.seek(new_pos)
	}

	pub fn pos(&mut self) -> Result<u64> {
		self.inner.stream_position()
	}
}

impl<T: BufRead + Write + Seek> Decoder<T> {
	pub fn encode<X: Encode>(&mut self, val: &X) -> Result<()> {
		bincode::encode_into_std_write(val, &mut self.inner, config())
			.map_err(|_| Error::new(ErrorKind::InvalidInput, "failed to encode"))?;
		Ok(())
	}

	pub fn encode_at<X: Encode>(&mut self, pos: u64, val: &X) -> Result<()> {
		self.seek(pos)?;
		self.encode(val)
	}

	pub fn write(&mut self, buf: &[u8]) -> Result<()> {
		self.inner.write_all(buf)
	}

	pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
		self.seek(pos)?;
		self.write(buf)
	}

	pub fn fill(&mut self, byte: u8, len: usize) -> Result<()> {
		// bounded scratch; the fill lengths here are at most one fs block
		const CHUNK: usize = 512;
		let chunk = [byte; CHUNK];
		let mut left = len;
		while left > 0 {
			let n = left.min(CHUNK);
			self.inner.write_all(&chunk[0..n])?;
			left -= n;
		}
		Ok(())
	}

	pub fn fill_at(&mut self, pos: u64, byte: u8, len: usize) -> Result<()> {
		self.seek(pos)?;
		self.fill(byte, len)
	}
}

#[cfg(test)]
mod t {
	use std::io::Cursor;

	use super::*;

	#[test]
	fn scalars_are_big_endian() {
		let buf = [0x12u8, 0x34, 0x56, 0x78];
		let mut d = Decoder::new(Cursor::new(&buf[..]));
		let v: u32 = d.decode().unwrap();
		assert_eq!(v, 0x12345678);
	}

	#[test]
	fn encode_roundtrip() {
		let mut buf = vec![0u8; 16];
		{
			let mut d = Decoder::new(Cursor::new(&mut buf));
			d.encode_at(4, &0xdeadbeefu32).unwrap();
		}
		assert_eq!(&buf[4..8], &[0xde, 0xad, 0xbe, 0xef]);
		let mut d = Decoder::new(Cursor::new(&buf[..]));
		let v: u32 = d.decode_at(4).unwrap();
		assert_eq!(v, 0xdeadbeef);
	}

	#[test]
	fn fill_at() {
		let mut buf = vec![0u8; 2048];
		{
			let mut d = Decoder::new(Cursor::new(&mut buf));
			d.fill_at(1, 0xaa, 1030).unwrap();
		}
		assert_eq!(buf[0], 0);
		assert!(buf[1..1031].iter().all(|b| *b == 0xaa));
		assert_eq!(buf[1031], 0);
	}

	#[test]
	fn align_to() {
		let buf = [0u8; 64];
		let mut d = Decoder::new(Cursor::new(&buf[..]));
		d.seek(3).unwrap();
		d.align_to(8).unwrap();
		assert_eq!(d.pos().unwrap(), 8);
		d.align_to(8).unwrap();
		assert_eq!(d.pos().unwrap(), 8);
	}
}
