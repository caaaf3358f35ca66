//! Extended attribute read support: the shortform (in-inode) and leaf
//! layouts.  Attribute writes are not offered.

use std::{ffi::OsStr, io::Result as IoResult};

use super::{buf::BufKind, *};
use crate::err;

const ATTR_ROOT: u8 = 0x04;
const ATTR_SECURE: u8 = 0x08;
/// Entry's value lives in remote blocks rather than the leaf.
const ATTR_LOCAL: u8 = 0x01;

fn prefix(flags: u8) -> &'static str {
	if flags & ATTR_ROOT != 0 {
		"trusted."
	} else if flags & ATTR_SECURE != 0 {
		"security."
	} else {
		"user."
	}
}

fn attr_leaf_hdr_len(v5: bool) -> usize {
	if v5 {
		80
	} else {
		32
	}
}

struct AttrEnt {
	name:  Vec<u8>,
	value: Option<Vec<u8>>,
	flags: u8,
}

impl<R: Backend> Xfs<R> {
	fn attr_entries(&mut self, inr: InodeNum, want_values: bool) -> IoResult<Vec<AttrEnt>> {
		let ino = self.iget(inr)?;
		match &ino.attr {
			Fork::None => Ok(Vec::new()),
			Fork::Local(sf) => parse_attr_sf(sf),
			Fork::Extents(_) | Fork::Btree { .. } => {
				let mut out = Vec::new();
				let bs = self.superblock.blocksize as usize;
				// attribute leaf blocks sit in the fork's dablk space; a
				// single-leaf fork keeps everything at dablk 0
				for e in ino.attr.extents().to_vec() {
					for i in 0..e.blockcount {
						// remote value blocks are reached via the leaf
						// entries, not scanned here
						if e.startoff + i != 0 {
							continue;
						}
						let pos = self.superblock.fsb_to_byte(e.startblock + i);
						let blk = self.read_buf(pos, bs, BufKind::AttrLeaf)?;
						parse_attr_leaf(
							&blk,
							self.superblock.is_v5(),
							want_values,
							&mut out,
						)?;
					}
				}
				Ok(out)
			}
			Fork::Dev(_) => Err(err!(EIO)),
		}
	}

	/// List attribute names, each with its namespace prefix.
	pub fn attr_list(&mut self, inr: InodeNum) -> IoResult<Vec<Vec<u8>>> {
		log::trace!("attr_list({inr});");
		Ok(self
			.attr_entries(inr, false)?
			.into_iter()
			.map(|e| {
				let mut name = prefix(e.flags).as_bytes().to_vec();
				name.extend_from_slice(&e.name);
				name
			})
			.collect())
	}

	/// Read one attribute value by its prefixed name.
	pub fn attr_get(&mut self, inr: InodeNum, name: &OsStr) -> IoResult<Vec<u8>> {
		log::trace!("attr_get({inr}, {name:?});");
		let full = name.as_encoded_bytes();
		for e in self.attr_entries(inr, true)? {
			let mut cand = prefix(e.flags).as_bytes().to_vec();
			cand.extend_from_slice(&e.name);
			if cand == full {
				return match e.value {
					Some(v) => Ok(v),
					None => {
						log::warn!("attr_get({inr}): remote attribute values are unsupported");
						Err(err!(EIO))
					}
				};
			}
		}
		Err(crate::enoattr())
	}
}

fn parse_attr_sf(sf: &[u8]) -> IoResult<Vec<AttrEnt>> {
	if sf.len() < 4 {
		return Err(err!(EIO));
	}
	let totsize = u16::from_be_bytes(sf[0..2].try_into().unwrap()) as usize;
	let count = sf[2] as usize;
	if totsize > sf.len() {
		return Err(err!(EIO));
	}
	let mut off = 4;
	let mut out = Vec::with_capacity(count);
	for _ in 0..count {
		if off + 3 > totsize {
			return Err(err!(EIO));
		}
		let namelen = sf[off] as usize;
		let valuelen = sf[off + 1] as usize;
		let flags = sf[off + 2];
		off += 3;
		if off + namelen + valuelen > totsize {
			return Err(err!(EIO));
		}
		out.push(AttrEnt {
			name:  sf[off..off + namelen].to_vec(),
			value: Some(sf[off + namelen..off + namelen + valuelen].to_vec()),
			flags,
		});
		off += namelen + valuelen;
	}
	Ok(out)
}

fn parse_attr_leaf(
	blk: &[u8],
	v5: bool,
	want_values: bool,
	out: &mut Vec<AttrEnt>,
) -> IoResult<()> {
	let magic = u16::from_be_bytes(blk[8..10].try_into().unwrap());
	if magic != XFS_ATTR_LEAF_MAGIC && magic != XFS_ATTR3_LEAF_MAGIC {
		log::error!("attribute leaf has a bad magic {magic:#x}");
		return Err(err!(EIO));
	}
	let hdr = attr_leaf_hdr_len(v5);
	let count_off = if v5 { 56 } else { 12 };
	let count = u16::from_be_bytes(blk[count_off..count_off + 2].try_into().unwrap()) as usize;
	if hdr + count * 8 > blk.len() {
		return Err(err!(EIO));
	}

	for i in 0..count {
		let o = hdr + i * 8;
		let nameidx = u16::from_be_bytes(blk[o + 4..o + 6].try_into().unwrap()) as usize;
		let flags = blk[o + 6];
		if nameidx + 3 > blk.len() {
			return Err(err!(EIO));
		}
		if flags & ATTR_LOCAL != 0 {
			let valuelen =
				u16::from_be_bytes(blk[nameidx..nameidx + 2].try_into().unwrap()) as usize;
			let namelen = blk[nameidx + 2] as usize;
			let nstart = nameidx + 3;
			if nstart + namelen + valuelen > blk.len() {
				return Err(err!(EIO));
			}
			out.push(AttrEnt {
				name:  blk[nstart..nstart + namelen].to_vec(),
				value: want_values
					.then(|| blk[nstart + namelen..nstart + namelen + valuelen].to_vec()),
				flags,
			});
		} else {
			// remote value: name is inline, the value is not
			let namelen = blk[nameidx + 8] as usize;
			let nstart = nameidx + 9;
			if nstart + namelen > blk.len() {
				return Err(err!(EIO));
			}
			out.push(AttrEnt {
				name: blk[nstart..nstart + namelen].to_vec(),
				value: None,
				flags,
			});
		}
	}
	Ok(())
}
