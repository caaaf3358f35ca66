//! Byte-level codec for directory data blocks: the entry/unused record
//! stream, the three best-free slots, and the single-block ("block")
//! form with its trailing leaf index.

use std::io::Result as IoResult;

use super::*;
use crate::err;

/// Directory geometry snapshot, detached from the mount so the codec is
/// testable on raw buffers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirGeom {
	pub blksize:   usize,
	pub v5:        bool,
	pub has_ftype: bool,
}

impl DirGeom {
	pub fn new(sb: &Superblock) -> Self {
		Self {
			blksize:   sb.dirblksize(),
			v5:        sb.is_v5(),
			has_ftype: sb.has_ftype(),
		}
	}

	/// Header length of a data or block-form block.
	pub fn data_hdr(&self) -> usize {
		if self.v5 {
			DIR3_DATA_HDR_LEN
		} else {
			DIR2_DATA_HDR_LEN
		}
	}

	/// Offset of the three best-free slots within the header.
	pub fn bestfree_off(&self) -> usize {
		if self.v5 {
			48
		} else {
			4
		}
	}

	/// Bytes a data entry occupies, including alignment padding.
	pub fn entsize(&self, namelen: usize) -> usize {
		// inumber + namelen byte + name + (ftype) + tag
		let raw = 8 + 1 + namelen + usize::from(self.has_ftype) + 2;
		raw.next_multiple_of(DIR2_DATA_ALIGN)
	}

	pub fn data_magic(&self) -> u32 {
		if self.v5 {
			XFS_DIR3_DATA_MAGIC
		} else {
			XFS_DIR2_DATA_MAGIC
		}
	}

	pub fn block_magic(&self) -> u32 {
		if self.v5 {
			XFS_DIR3_BLOCK_MAGIC
		} else {
			XFS_DIR2_BLOCK_MAGIC
		}
	}

	/// Offset of the first entry: where `.` lands in block form.
	pub fn first_entry_off(&self) -> usize {
		self.data_hdr()
	}

	/// Encode a (block, offset) pair as a readdir cookie / leaf address.
	pub fn dataptr(&self, dbno: u64, off: usize) -> u32 {
		((dbno * self.blksize as u64 + off as u64) >> 3) as u32
	}

	pub fn dataptr_decode(&self, ptr: u32) -> (u64, usize) {
		let byte = (ptr as u64) << 3;
		(byte / self.blksize as u64, (byte % self.blksize as u64) as usize)
	}
}

/// An in-use directory data entry, positioned within its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DataEntry {
	pub off:   usize,
	pub ino:   u64,
	pub name:  Vec<u8>,
	pub ftype: u8,
}

impl DataEntry {
	pub fn hash(&self) -> XfsDahash {
		da_hashname(&self.name)
	}
}

/// The rol32-based name hash every directory index uses.
pub(crate) fn da_hashname(name: &[u8]) -> XfsDahash {
	let mut hash: u32 = 0;
	let mut chunks = name.chunks_exact(4);
	for c in &mut chunks {
		hash = (u32::from(c[0]) << 21)
			^ (u32::from(c[1]) << 14)
			^ (u32::from(c[2]) << 7)
			^ u32::from(c[3])
			^ hash.rotate_left(7 * 4);
	}
	let rest = chunks.remainder();
	match rest.len() {
		3 => {
			(u32::from(rest[0]) << 14)
				^ (u32::from(rest[1]) << 7)
				^ u32::from(rest[2])
				^ hash.rotate_left(7 * 3)
		}
		2 => (u32::from(rest[0]) << 7) ^ u32::from(rest[1]) ^ hash.rotate_left(7 * 2),
		1 => u32::from(rest[0]) ^ hash.rotate_left(7),
		_ => hash,
	}
}

/// Walk the entry/unused stream of `buf[hdr..data_end]`.
pub(crate) fn parse_data(geom: &DirGeom, buf: &[u8], data_end: usize) -> IoResult<Vec<DataEntry>> {
	let mut entries = Vec::new();
	let mut off = geom.data_hdr();
	while off < data_end {
		if off + 8 > data_end {
			log::error!("directory data record overruns its block");
			return Err(err!(EIO));
		}
		let tag = u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
		if tag == DIR2_DATA_FREE_TAG {
			let len = u16::from_be_bytes(buf[off + 2..off + 4].try_into().unwrap()) as usize;
			if len < 8 || off + len > data_end {
				log::error!("directory unused record has a bad length");
				return Err(err!(EIO));
			}
			off += len;
			continue;
		}
		let ino = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
		let namelen = buf[off + 8] as usize;
		if namelen == 0 || namelen > MAXNAMELEN {
			log::error!("directory entry has a bad name length");
			return Err(err!(EIO));
		}
		let esize = geom.entsize(namelen);
		if off + esize > data_end {
			log::error!("directory entry overruns its block");
			return Err(err!(EIO));
		}
		let name = buf[off + 9..off + 9 + namelen].to_vec();
		let ftype = if geom.has_ftype {
			buf[off + 9 + namelen]
		} else {
			XFS_DIR3_FT_UNKNOWN
		};
		let stored_tag = u16::from_be_bytes(buf[off + esize - 2..off + esize].try_into().unwrap());
		if stored_tag as usize != off {
			log::error!("directory entry tag does not match its offset");
			return Err(err!(EIO));
		}
		entries.push(DataEntry {
			off,
			ino,
			name,
			ftype,
		});
		off += esize;
	}
	Ok(entries)
}

/// Decode the single entry at `off`, if one is in use there.
pub(crate) fn entry_at(geom: &DirGeom, buf: &[u8], off: usize) -> Option<DataEntry> {
	if off + 11 > buf.len() {
		return None;
	}
	let tag = u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
	if tag == DIR2_DATA_FREE_TAG {
		return None;
	}
	let ino = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
	let namelen = buf[off + 8] as usize;
	if namelen == 0 || namelen > MAXNAMELEN || off + geom.entsize(namelen) > buf.len() {
		return None;
	}
	let name = buf[off + 9..off + 9 + namelen].to_vec();
	let ftype = if geom.has_ftype {
		buf[off + 9 + namelen]
	} else {
		XFS_DIR3_FT_UNKNOWN
	};
	Some(DataEntry {
		off,
		ino,
		name,
		ftype,
	})
}

/// Free spans between entries, as (offset, length) pairs.
fn gaps(geom: &DirGeom, entries: &[DataEntry], data_end: usize) -> Vec<(usize, usize)> {
	debug_assert!(entries.windows(2).all(|w| w[0].off < w[1].off));
	let mut out = Vec::new();
	let mut cursor = geom.data_hdr();
	for e in entries {
		if e.off > cursor {
			out.push((cursor, e.off - cursor));
		}
		cursor = e.off + geom.entsize(e.name.len());
	}
	if data_end > cursor {
		out.push((cursor, data_end - cursor));
	}
	out
}

/// Largest free span in the region.
pub(crate) fn best_free(geom: &DirGeom, entries: &[DataEntry], data_end: usize) -> usize {
	gaps(geom, entries, data_end)
		.iter()
		.map(|g| g.1)
		.max()
		.unwrap_or(0)
}

/// First free offset that can hold an entry of `esize` bytes.
pub(crate) fn find_slot(
	geom: &DirGeom,
	entries: &[DataEntry],
	esize: usize,
	data_end: usize,
) -> Option<usize> {
	gaps(geom, entries, data_end)
		.iter()
		.find(|g| g.1 >= esize)
		.map(|g| g.0)
}

/// Serialize the entry stream into `buf[hdr..data_end]`: entries at their
/// offsets, one unused record per gap, and a fresh best-free table in the
/// header.  The header magic and V5 identity fields are the caller's job.
pub(crate) fn build_data(
	geom: &DirGeom,
	buf: &mut [u8],
	entries: &[DataEntry],
	data_end: usize,
) -> IoResult<()> {
	buf[geom.data_hdr()..data_end].fill(0);

	for e in entries {
		let esize = geom.entsize(e.name.len());
		if e.off + esize > data_end {
			log::error!("directory entry does not fit its block");
			return Err(err!(EIO));
		}
		let off = e.off;
		buf[off..off + 8].copy_from_slice(&e.ino.to_be_bytes());
		buf[off + 9..off + 9 + e.name.len()].copy_from_slice(&e.name);
		buf[off + 8] = e.name.len() as u8;
		if geom.has_ftype {
			buf[off + 9 + e.name.len()] = e.ftype;
		}
		buf[off + esize - 2..off + esize].copy_from_slice(&(off as u16).to_be_bytes());
	}

	let gaps = gaps(geom, entries, data_end);
	for (off, len) in &gaps {
		buf[*off..*off + 2].copy_from_slice(&DIR2_DATA_FREE_TAG.to_be_bytes());
		buf[*off + 2..*off + 4].copy_from_slice(&(*len as u16).to_be_bytes());
		buf[*off + len - 2..*off + *len].copy_from_slice(&(*off as u16).to_be_bytes());
	}

	// three largest spans, descending
	let mut best = gaps;
	best.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
	best.truncate(DIR2_DATA_FD_COUNT);
	let bf = geom.bestfree_off();
	buf[bf..bf + 12].fill(0);
	for (i, (off, len)) in best.iter().enumerate() {
		let o = bf + i * 4;
		buf[o..o + 2].copy_from_slice(&(*off as u16).to_be_bytes());
		buf[o + 2..o + 4].copy_from_slice(&(*len as u16).to_be_bytes());
	}
	Ok(())
}

/// Data region end for the single-block form, given the entry count: the
/// trailing leaf array plus its tail eat the top of the block.
pub(crate) fn block_data_end(geom: &DirGeom, nentries: usize) -> usize {
	geom.blksize - 8 - nentries * 8
}

/// Parse the single-block form: entries plus the count recorded in the
/// tail.
pub(crate) fn parse_block(geom: &DirGeom, buf: &[u8]) -> IoResult<Vec<DataEntry>> {
	let count =
		u32::from_be_bytes(buf[geom.blksize - 8..geom.blksize - 4].try_into().unwrap()) as usize;
	let stale =
		u32::from_be_bytes(buf[geom.blksize - 4..geom.blksize].try_into().unwrap()) as usize;
	if count > geom.blksize / 8 || stale > count {
		log::error!("block directory tail is corrupt");
		return Err(err!(EIO));
	}
	parse_data(geom, buf, block_data_end(geom, count))
}

/// Rebuild the single-block form around the given entries: data region,
/// sorted leaf array, and tail.  Fails when the block cannot hold them.
pub(crate) fn build_block(geom: &DirGeom, buf: &mut [u8], entries: &[DataEntry]) -> IoResult<()> {
	let data_end = block_data_end(geom, entries.len());
	if data_end <= geom.data_hdr() {
		return Err(err!(ENOSPC));
	}
	build_data(geom, buf, entries, data_end)?;

	let mut leaf: Vec<(u32, u32)> = entries
		.iter()
		.map(|e| (e.hash(), geom.dataptr(0, e.off)))
		.collect();
	leaf.sort();
	for (i, (hash, addr)) in leaf.iter().enumerate() {
		let o = data_end + i * 8;
		buf[o..o + 4].copy_from_slice(&hash.to_be_bytes());
		buf[o + 4..o + 8].copy_from_slice(&addr.to_be_bytes());
	}
	let t = geom.blksize - 8;
	buf[t..t + 4].copy_from_slice(&(entries.len() as u32).to_be_bytes());
	buf[t + 4..t + 8].copy_from_slice(&0u32.to_be_bytes());
	Ok(())
}

/// Stamp a data/block header: magic plus the V5 self-describing fields.
pub(crate) fn init_data_hdr(
	geom: &DirGeom,
	buf: &mut [u8],
	magic: u32,
	owner: u64,
	daddr: u64,
	uuid: &[u8; 16],
) {
	buf[0..4].copy_from_slice(&magic.to_be_bytes());
	if geom.v5 {
		buf[8..16].copy_from_slice(&daddr.to_be_bytes());
		buf[24..40].copy_from_slice(uuid);
		buf[40..48].copy_from_slice(&owner.to_be_bytes());
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn geom() -> DirGeom {
		DirGeom {
			blksize:   4096,
			v5:        true,
			has_ftype: true,
		}
	}

	fn entry(off: usize, ino: u64, name: &str) -> DataEntry {
		DataEntry {
			off,
			ino,
			name: name.as_bytes().to_vec(),
			ftype: XFS_DIR3_FT_REG_FILE,
		}
	}

	#[test]
	fn hash_matches_reference() {
		// values computed by the reference rol32 hash
		assert_eq!(da_hashname(b"."), 0x2e);
		assert_eq!(da_hashname(b".."), 0x172e);
		let h1 = da_hashname(b"frame000042.tst");
		let h2 = da_hashname(b"frame000043.tst");
		assert_ne!(h1, h2);
	}

	#[test]
	fn entsize_alignment() {
		let g = geom();
		// 8 + 1 + 1 + 1 + 2 = 13 -> 16
		assert_eq!(g.entsize(1), 16);
		// 8 + 1 + 4 + 1 + 2 = 16 -> 16
		assert_eq!(g.entsize(4), 16);
		assert_eq!(g.entsize(5), 24);
		let g4 = DirGeom {
			has_ftype: false,
			..g
		};
		// 8 + 1 + 5 + 2 = 16 -> 16
		assert_eq!(g4.entsize(5), 16);
	}

	#[test]
	fn dataptr_roundtrip() {
		let g = geom();
		let ptr = g.dataptr(3, 128);
		assert_eq!(g.dataptr_decode(ptr), (3, 128));
	}

	#[test]
	fn data_roundtrip_with_gaps() {
		let g = geom();
		let mut buf = vec![0u8; g.blksize];
		let e1 = entry(g.first_entry_off(), 128, "alpha");
		// a hole, then another entry
		let e2 = entry(g.first_entry_off() + 3 * g.entsize(5), 129, "beta");
		let entries = vec![e1.clone(), e2.clone()];
		build_data(&g, &mut buf, &entries, g.blksize).unwrap();
		let parsed = parse_data(&g, &buf, g.blksize).unwrap();
		assert_eq!(parsed, entries);

		// the hole is findable and the tail gap is the largest
		let esize = g.entsize(5);
		assert_eq!(find_slot(&g, &entries, esize, g.blksize), Some(e1.off + esize));
		assert!(best_free(&g, &entries, g.blksize) > 2 * esize);
	}

	#[test]
	fn block_form_roundtrip() {
		let g = geom();
		let mut buf = vec![0u8; g.blksize];
		let mut entries = vec![
			entry(g.first_entry_off(), 128, "."),
			entry(g.first_entry_off() + g.entsize(1), 64, ".."),
		];
		let mut off = entries[1].off + g.entsize(2);
		for i in 0..10 {
			let name = format!("file{i}");
			entries.push(entry(off, 200 + i, &name));
			off += g.entsize(name.len());
		}
		build_block(&g, &mut buf, &entries).unwrap();
		let parsed = parse_block(&g, &buf).unwrap();
		assert_eq!(parsed, entries);
	}
}
