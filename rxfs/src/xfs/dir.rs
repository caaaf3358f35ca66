//! The directory engine: name lookup, iteration, insert, remove and
//! replace across the shortform, block, leaf and node layouts.

use std::io::Result as IoResult;

use super::{
	bmap::extent_at,
	buf::BufKind,
	dir_data::{self, DataEntry, DirGeom},
	*,
};
use crate::err;

/// Which on-disk shape a directory currently has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirForm {
	Sf,
	Block,
	Leaf,
	Node,
}

/// A shortform directory, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SfDir {
	pub parent:  u64,
	pub entries: Vec<SfEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SfEntry {
	pub name:   Vec<u8>,
	pub ino:    u64,
	pub ftype:  u8,
	/// The offset this entry will occupy in block form; keeps readdir
	/// cookies stable across the shortform boundary.
	pub offset: u16,
}

pub(crate) fn parse_sf(fork: &[u8], has_ftype: bool) -> IoResult<SfDir> {
	if fork.len() < 6 {
		log::error!("shortform directory header is truncated");
		return Err(err!(EIO));
	}
	let count = fork[0] as usize;
	let i8count = fork[1];
	let wide = i8count != 0;
	let isz = if wide { 8 } else { 4 };

	let rd_ino = |b: &[u8]| -> u64 {
		if wide {
			u64::from_be_bytes(b[0..8].try_into().unwrap())
		} else {
			u32::from_be_bytes(b[0..4].try_into().unwrap()).into()
		}
	};

	let parent = rd_ino(&fork[2..]);
	let mut off = 2 + isz;
	let mut entries = Vec::with_capacity(count);
	for _ in 0..count {
		if off + 3 > fork.len() {
			log::error!("shortform directory entry is truncated");
			return Err(err!(EIO));
		}
		let namelen = fork[off] as usize;
		let offset = u16::from_be_bytes(fork[off + 1..off + 3].try_into().unwrap());
		off += 3;
		if off + namelen + usize::from(has_ftype) + isz > fork.len() {
			log::error!("shortform directory entry is truncated");
			return Err(err!(EIO));
		}
		let name = fork[off..off + namelen].to_vec();
		off += namelen;
		let ftype = if has_ftype {
			let f = fork[off];
			off += 1;
			f
		} else {
			XFS_DIR3_FT_UNKNOWN
		};
		let ino = rd_ino(&fork[off..]);
		off += isz;
		entries.push(SfEntry {
			name,
			ino,
			ftype,
			offset,
		});
	}
	Ok(SfDir {
		parent,
		entries,
	})
}

pub(crate) fn encode_sf(sf: &SfDir, has_ftype: bool) -> Vec<u8> {
	let wide = sf.parent > u32::MAX.into() || sf.entries.iter().any(|e| e.ino > u32::MAX.into());
	let isz = if wide { 8 } else { 4 };
	let i8count = if wide {
		(sf.entries.iter().filter(|e| e.ino > u32::MAX.into()).count()
			+ usize::from(sf.parent > u32::MAX.into()))
		.max(1)
	} else {
		0
	};

	let mut out = Vec::with_capacity(sf_size(sf, has_ftype));
	out.push(sf.entries.len() as u8);
	out.push(i8count as u8);
	if wide {
		out.extend_from_slice(&sf.parent.to_be_bytes());
	} else {
		out.extend_from_slice(&(sf.parent as u32).to_be_bytes());
	}
	for e in &sf.entries {
		out.push(e.name.len() as u8);
		out.extend_from_slice(&e.offset.to_be_bytes());
		out.extend_from_slice(&e.name);
		if has_ftype {
			out.push(e.ftype);
		}
		if wide {
			out.extend_from_slice(&e.ino.to_be_bytes());
		} else {
			out.extend_from_slice(&(e.ino as u32).to_be_bytes());
		}
	}
	debug_assert_eq!(out.len(), sf_size(sf, has_ftype));
	let _ = isz;
	out
}

/// Encoded size of a shortform directory.
pub(crate) fn sf_size(sf: &SfDir, has_ftype: bool) -> usize {
	let wide = sf.parent > u32::MAX.into() || sf.entries.iter().any(|e| e.ino > u32::MAX.into());
	let isz = if wide { 8 } else { 4 };
	2 + isz
		+ sf
			.entries
			.iter()
			.map(|e| 3 + e.name.len() + usize::from(has_ftype) + isz)
			.sum::<usize>()
}

/// The block-form offset the next shortform insertion will take.
fn sf_next_offset(geom: &DirGeom, sf: &SfDir) -> usize {
	// `.` and `..` occupy the front of the virtual block
	let base = geom.first_entry_off() + geom.entsize(1) + geom.entsize(2);
	sf.entries
		.iter()
		.map(|e| e.offset as usize + geom.entsize(e.name.len()))
		.max()
		.unwrap_or(base)
		.max(base)
}

/// First directory block index of the leaf (hash index) address space.
pub(crate) fn leaf_dbno(geom: &DirGeom) -> u64 {
	DIR2_LEAF_OFFSET / geom.blksize as u64
}

/// First directory block index of the free-index address space.
pub(crate) fn free_dbno(geom: &DirGeom) -> u64 {
	DIR2_FREE_OFFSET / geom.blksize as u64
}

impl<R: Backend> Xfs<R> {
	pub(crate) fn dir_geom(&self) -> DirGeom {
		DirGeom::new(&self.superblock)
	}

	/// Map one directory block to its first filesystem block, checking
	/// that the whole directory block is contiguously mapped.
	fn dir_map_dblock(&self, ino: &Inode, dbno: u64) -> Option<(XfsFsblock, bool)> {
		let fsbs = self.superblock.dirblkfsbs();
		let start = dbno * fsbs;
		let e = extent_at(ino.data.extents(), start)?;
		let contiguous = e.end_off() >= start + fsbs;
		Some((e.startblock + (start - e.startoff), contiguous))
	}

	/// Read one directory block, gathering discontiguous pieces, and
	/// verify it.  `None` when the block is not mapped.
	pub(crate) fn dir_read_dblock(
		&mut self,
		inr: InodeNum,
		ino: &Inode,
		dbno: u64,
		kind: BufKind,
	) -> IoResult<Option<Vec<u8>>> {
		let sb = &self.superblock;
		let fsbs = sb.dirblkfsbs();
		let bs = sb.blocksize as usize;
		let start = dbno * fsbs;
		if extent_at(ino.data.extents(), start).is_none() {
			return Ok(None);
		}
		let mut buf = vec![0u8; self.superblock.dirblksize()];
		for i in 0..fsbs {
			let Some(e) = extent_at(ino.data.extents(), start + i) else {
				log::error!("directory {inr} has a hole inside block {dbno}");
				return Err(err!(EIO));
			};
			let fsbno = e.startblock + (start + i - e.startoff);
			let pos = self.superblock.fsb_to_byte(fsbno);
			let off = i as usize * bs;
			self.file.read_at(pos, &mut buf[off..off + bs])?;
		}
		self.verify_buf(dbno, &buf, kind)?;
		Ok(Some(buf))
	}

	/// Pin one directory block to the transaction.  `None` when unmapped.
	pub(crate) fn dir_tx_dblock(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &Inode,
		dbno: u64,
		kind: BufKind,
	) -> IoResult<Option<usize>> {
		let Some((fsbno, contiguous)) = self.dir_map_dblock(ino, dbno) else {
			return Ok(None);
		};
		if !contiguous {
			log::error!("directory {inr} block {dbno} is fragmented; cannot rewrite it");
			return Err(err!(EIO));
		}
		let pos = self.superblock.fsb_to_byte(fsbno);
		let len = self.superblock.dirblksize();
		Ok(Some(self.trans_read_buf(tx, pos, len, kind)?))
	}

	/// Allocate, map and pin a fresh directory block.
	pub(crate) fn dir_grow_dblock(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &mut Inode,
		dbno: u64,
		kind: BufKind,
	) -> IoResult<usize> {
		let fsbs = self.superblock.dirblkfsbs();
		let hint = match ino.data.extents().first() {
			Some(e) => e.startblock,
			None => {
				let agno = self.superblock.ino_to_agno(inr.get());
				self.superblock.agb_to_fsb(agno, 0)
			}
		};
		let (fsbno, got) = self.alloc_extent(tx, hint, fsbs, fsbs, 1)?;
		assert_eq!(got, fsbs);
		super::bmap::fork_insert_for_dir(ino, dbno * fsbs, fsbno, fsbs);
		ino.nblocks += fsbs;
		self.fork_writeback(tx, inr, ino)?;

		let pos = self.superblock.fsb_to_byte(fsbno);
		let len = self.superblock.dirblksize();
		Ok(self.trans_get_buf(tx, pos, len, kind))
	}

	/// Unmap and free one directory block.
	pub(crate) fn dir_shrink_dblock(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &mut Inode,
		dbno: u64,
	) -> IoResult<()> {
		let fsbs = self.superblock.dirblkfsbs();
		self.punch_range(tx, inr, ino, dbno * fsbs, fsbs)
	}

	/// Which layout the directory currently uses.
	pub(crate) fn dir_form(&mut self, inr: InodeNum, ino: &Inode) -> IoResult<DirForm> {
		match self.dir_form_common(inr, ino)? {
			Ok(form) => Ok(form),
			Err(ldb) => {
				// level-one leaf or a da-tree root lives at the leaf origin
				let Some(buf) = self.dir_read_dblock(inr, ino, ldb, BufKind::DirLeaf)? else {
					return Ok(DirForm::Block);
				};
				let magic = u16::from_be_bytes(buf[8..10].try_into().unwrap());
				dir_form_from_magic(inr, magic)
			}
		}
	}

	/// As [`Xfs::dir_form`], but reading through the transaction so a
	/// layout promoted earlier in the same transaction is seen.
	pub(crate) fn dir_form_tx(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &Inode,
	) -> IoResult<DirForm> {
		match self.dir_form_common(inr, ino)? {
			Ok(form) => Ok(form),
			Err(ldb) => {
				let Some(bi) = self.dir_tx_dblock(tx, inr, ino, ldb, BufKind::DirLeaf)? else {
					return Ok(DirForm::Block);
				};
				let magic = u16::from_be_bytes(tx.buf(bi)[8..10].try_into().unwrap());
				dir_form_from_magic(inr, magic)
			}
		}
	}

	/// Fork-shape part of the form check; `Err(ldb)` means the leaf block
	/// at `ldb` must be consulted.
	fn dir_form_common(
		&mut self,
		inr: InodeNum,
		ino: &Inode,
	) -> IoResult<Result<DirForm, u64>> {
		match &ino.data {
			Fork::Local(_) => return Ok(Ok(DirForm::Sf)),
			Fork::Extents(_) | Fork::Btree { .. } => {}
			_ => {
				log::error!("directory {inr} has an invalid fork format");
				return Err(err!(EIO));
			}
		}
		let geom = self.dir_geom();
		let ldb = leaf_dbno(&geom);
		if extent_at(ino.data.extents(), ldb * self.superblock.dirblkfsbs()).is_none() {
			return Ok(Ok(DirForm::Block));
		}
		Ok(Err(ldb))
	}

	/// Number of directory blocks in the data section.
	pub(crate) fn dir_data_blocks(&self, ino: &Inode) -> u64 {
		let geom = self.dir_geom();
		let fsbs = self.superblock.dirblkfsbs();
		let limit = leaf_dbno(&geom) * fsbs;
		ino.data
			.extents()
			.iter()
			.filter(|e| e.startoff < limit)
			.map(|e| e.end_off().min(limit))
			.max()
			.map(|fsb| fsb / fsbs)
			.unwrap_or(0)
	}

	/// Find a file named `name` in the directory referenced by `pinr`.
	pub fn dir_lookup(&mut self, pinr: InodeNum, name: &std::ffi::OsStr) -> IoResult<InodeNum> {
		log::trace!("dir_lookup({pinr}, {name:?});");
		let bytes = name.as_encoded_bytes();
		if bytes.len() > MAXNAMELEN {
			return Err(err!(ENAMETOOLONG));
		}

		// `..` moves under rename, so only plain names are cached
		let cacheable = bytes != b"." && bytes != b"..";

		#[cfg(feature = "dcache")]
		if cacheable {
			if let Some(inr) = self.dcache.get(&(pinr, name.to_os_string())) {
				return Ok(*inr);
			}
		}

		let ino = self.iget(pinr)?;
		if !ino.is_dir() {
			return Err(err!(ENOTDIR));
		}

		let found = self.dir_lookup_raw(pinr, &ino, bytes)?;
		match found {
			Some(inr) => {
				#[cfg(feature = "dcache")]
				if cacheable {
					self.dcache.put((pinr, name.to_os_string()), inr);
				}
				Ok(inr)
			}
			None => Err(err!(ENOENT)),
		}
	}

	fn dir_lookup_raw(
		&mut self,
		pinr: InodeNum,
		ino: &Inode,
		name: &[u8],
	) -> IoResult<Option<InodeNum>> {
		if name == b"." {
			return Ok(Some(pinr));
		}

		match self.dir_form(pinr, ino)? {
			DirForm::Sf => {
				let sf = parse_sf(fork_local(ino)?, self.superblock.has_ftype())?;
				if name == b".." {
					return Ok(InodeNum::new(sf.parent));
				}
				Ok(sf
					.entries
					.iter()
					.find(|e| e.name == name)
					.and_then(|e| InodeNum::new(e.ino)))
			}
			DirForm::Block => {
				let geom = self.dir_geom();
				let buf = self
					.dir_read_dblock(pinr, ino, 0, BufKind::DirData)?
					.ok_or_else(|| err!(EIO))?;
				let entries = dir_data::parse_block(&geom, &buf)?;
				Ok(entries
					.iter()
					.find(|e| e.name == name)
					.and_then(|e| InodeNum::new(e.ino)))
			}
			DirForm::Leaf => self.leaf_lookup(pinr, ino, name),
			DirForm::Node => {
				// the hash index may be arbitrarily deep; a data scan is
				// always correct
				self.scan_lookup(pinr, ino, name)
			}
		}
	}

	/// Brute-force lookup over the data section.
	fn scan_lookup(
		&mut self,
		pinr: InodeNum,
		ino: &Inode,
		name: &[u8],
	) -> IoResult<Option<InodeNum>> {
		let geom = self.dir_geom();
		for dbno in 0..self.dir_data_blocks(ino) {
			let Some(buf) = self.dir_read_dblock(pinr, ino, dbno, BufKind::DirData)? else {
				continue;
			};
			let entries = dir_data::parse_data(&geom, &buf, geom.blksize)?;
			if let Some(e) = entries.iter().find(|e| e.name == name) {
				return Ok(InodeNum::new(e.ino));
			}
		}
		Ok(None)
	}

	/// Iterate a directory from `start` (a cookie from a previous call, or
	/// 0).  `.` and `..` come first.  The callback gets each entry and the
	/// cookie to resume after it; returning `Some` stops the walk.
	pub fn dir_iter<T>(
		&mut self,
		inr: InodeNum,
		start: u64,
		mut f: impl FnMut(&std::ffi::OsStr, InodeNum, Option<InodeType>, u64) -> Option<T>,
	) -> IoResult<Option<T>> {
		log::trace!("dir_iter({inr}, {start});");
		let ino = self.iget(inr)?;
		if !ino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		let geom = self.dir_geom();

		let mut emit = |name: &[u8], e_ino: u64, ftype: u8, ptr: u32| -> Option<T> {
			if (ptr as u64) < start {
				return None;
			}
			let inr = InodeNum::new(e_ino)?;
			let kind = InodeType::from_ftype(ftype);
			let name = unsafe { std::ffi::OsStr::from_encoded_bytes_unchecked(name) };
			f(name, inr, kind, ptr as u64 + 1)
		};

		match self.dir_form(inr, &ino)? {
			DirForm::Sf => {
				let sf = parse_sf(fork_local(&ino)?, self.superblock.has_ftype())?;
				let dot = geom.first_entry_off();
				let dotdot = dot + geom.entsize(1);
				if let Some(x) = emit(b".", inr.get(), XFS_DIR3_FT_DIR, geom.dataptr(0, dot)) {
					return Ok(Some(x));
				}
				if let Some(x) = emit(b"..", sf.parent, XFS_DIR3_FT_DIR, geom.dataptr(0, dotdot))
				{
					return Ok(Some(x));
				}
				let mut entries = sf.entries;
				entries.sort_by_key(|e| e.offset);
				for e in &entries {
					if let Some(x) =
						emit(&e.name, e.ino, e.ftype, geom.dataptr(0, e.offset.into()))
					{
						return Ok(Some(x));
					}
				}
				Ok(None)
			}
			form => {
				let nblocks = self.dir_data_blocks(&ino);
				let (first_dbno, _) = geom.dataptr_decode(start as u32);
				for dbno in first_dbno..nblocks {
					let Some(buf) = self.dir_read_dblock(inr, &ino, dbno, BufKind::DirData)?
					else {
						continue;
					};
					let entries = if form == DirForm::Block {
						dir_data::parse_block(&geom, &buf)?
					} else {
						dir_data::parse_data(&geom, &buf, geom.blksize)?
					};
					for e in &entries {
						if let Some(x) =
							emit(&e.name, e.ino, e.ftype, geom.dataptr(dbno, e.off))
						{
							return Ok(Some(x));
						}
					}
				}
				Ok(None)
			}
		}
	}

	/// True when the directory holds nothing but `.` and `..`.
	pub(crate) fn dir_is_empty(&mut self, inr: InodeNum, ino: &Inode) -> IoResult<bool> {
		match self.dir_form(inr, ino)? {
			DirForm::Sf => {
				let sf = parse_sf(fork_local(ino)?, self.superblock.has_ftype())?;
				Ok(sf.entries.is_empty())
			}
			form => {
				let geom = self.dir_geom();
				for dbno in 0..self.dir_data_blocks(ino) {
					let Some(buf) = self.dir_read_dblock(inr, ino, dbno, BufKind::DirData)?
					else {
						continue;
					};
					let entries = if form == DirForm::Block {
						dir_data::parse_block(&geom, &buf)?
					} else {
						dir_data::parse_data(&geom, &buf, geom.blksize)?
					};
					if entries.iter().any(|e| e.name != b"." && e.name != b"..") {
						return Ok(false);
					}
				}
				Ok(true)
			}
		}
	}

	/// Add an entry.  May promote the layout (shortform → block → leaf →
	/// node) within the same transaction.
	pub(crate) fn dir_insert(
		&mut self,
		tx: &mut Trans,
		dinr: InodeNum,
		dino: &mut Inode,
		name: &[u8],
		ino: u64,
		ftype: u8,
	) -> IoResult<()> {
		log::trace!("dir_insert({dinr}, {:?});", String::from_utf8_lossy(name));
		let geom = self.dir_geom();
		match self.dir_form_tx(tx, dinr, dino)? {
			DirForm::Sf => {
				let mut sf = parse_sf(fork_local(dino)?, geom.has_ftype)?;
				if sf.entries.iter().any(|e| e.name == name) {
					return Err(err!(EEXIST));
				}
				let offset = sf_next_offset(&geom, &sf);
				sf.entries.push(SfEntry {
					name:   name.to_vec(),
					ino,
					ftype,
					offset: offset as u16,
				});
				let encoded_size = sf_size(&sf, geom.has_ftype);
				let cap = super::inode::data_fork_size(
					&self.superblock,
					dino.version,
					dino.forkoff,
				);
				let fits_block = offset + geom.entsize(name.len())
					<= dir_data::block_data_end(&geom, sf.entries.len() + 2);
				if encoded_size <= cap && fits_block {
					dino.data = Fork::Local(encode_sf(&sf, geom.has_ftype));
					dino.size = encoded_size as u64;
					return Ok(());
				}
				sf.entries.pop();
				self.sf_to_block(tx, dinr, dino, &sf)?;
				self.block_insert(tx, dinr, dino, name, ino, ftype)
			}
			DirForm::Block => self.block_insert(tx, dinr, dino, name, ino, ftype),
			DirForm::Leaf => self.leaf_insert(tx, dinr, dino, name, ino, ftype),
			DirForm::Node => self.node_insert(tx, dinr, dino, name, ino, ftype),
		}
	}

	/// Insert into the single-block form, promoting to leaf form when the
	/// block cannot take one more entry.
	fn block_insert(
		&mut self,
		tx: &mut Trans,
		dinr: InodeNum,
		dino: &mut Inode,
		name: &[u8],
		ino: u64,
		ftype: u8,
	) -> IoResult<()> {
		let geom = self.dir_geom();
		let bi = self
			.dir_tx_dblock(tx, dinr, dino, 0, BufKind::DirData)?
			.ok_or_else(|| err!(EIO))?;
		let mut entries = dir_data::parse_block(&geom, tx.buf(bi))?;
		if entries.iter().any(|e| e.name == name) {
			return Err(err!(EEXIST));
		}

		let esize = geom.entsize(name.len());
		// the grown leaf tail eats the top of the block; the survivors
		// must clear it too
		let data_end = dir_data::block_data_end(&geom, entries.len() + 1);
		let survivors_fit = entries
			.iter()
			.all(|e| e.off + geom.entsize(e.name.len()) <= data_end);
		if survivors_fit {
			if let Some(off) = dir_data::find_slot(&geom, &entries, esize, data_end) {
				entries.push(DataEntry {
					off,
					ino,
					name: name.to_vec(),
					ftype,
				});
				entries.sort_by_key(|e| e.off);
				dir_data::build_block(&geom, tx.buf_mut(bi), &entries)?;
				tx.log_buf_full(bi);
				return Ok(());
			}
		}

		self.block_to_leaf(tx, dinr, dino, entries)?;
		self.leaf_insert(tx, dinr, dino, name, ino, ftype)
	}

	/// Remove an entry by name, returning the inode it referenced.  May
	/// demote the layout.
	pub(crate) fn dir_remove(
		&mut self,
		tx: &mut Trans,
		dinr: InodeNum,
		dino: &mut Inode,
		name: &[u8],
	) -> IoResult<InodeNum> {
		log::trace!("dir_remove({dinr}, {:?});", String::from_utf8_lossy(name));
		let geom = self.dir_geom();
		match self.dir_form_tx(tx, dinr, dino)? {
			DirForm::Sf => {
				let mut sf = parse_sf(fork_local(dino)?, geom.has_ftype)?;
				let i = sf
					.entries
					.iter()
					.position(|e| e.name == name)
					.ok_or_else(|| err!(ENOENT))?;
				let gone = sf.entries.remove(i);
				dino.data = Fork::Local(encode_sf(&sf, geom.has_ftype));
				dino.size = sf_size(&sf, geom.has_ftype) as u64;
				InodeNum::new(gone.ino).ok_or_else(|| err!(EIO))
			}
			DirForm::Block => {
				let bi = self
					.dir_tx_dblock(tx, dinr, dino, 0, BufKind::DirData)?
					.ok_or_else(|| err!(EIO))?;
				let mut entries = dir_data::parse_block(&geom, tx.buf(bi))?;
				let i = entries
					.iter()
					.position(|e| e.name == name)
					.ok_or_else(|| err!(ENOENT))?;
				let gone = entries.remove(i);
				self.block_maybe_to_sf(tx, dinr, dino, bi, entries)?;
				InodeNum::new(gone.ino).ok_or_else(|| err!(EIO))
			}
			DirForm::Leaf => self.leaf_remove(tx, dinr, dino, name),
			DirForm::Node => self.node_remove(tx, dinr, dino, name),
		}
	}

	/// Retarget an existing entry at a new inode; returns the old target.
	/// Rename uses this for `..` and for overwriting renames.
	pub(crate) fn dir_replace(
		&mut self,
		tx: &mut Trans,
		dinr: InodeNum,
		dino: &mut Inode,
		name: &[u8],
		new_ino: u64,
	) -> IoResult<InodeNum> {
		log::trace!("dir_replace({dinr}, {:?}, {new_ino});", String::from_utf8_lossy(name));
		let geom = self.dir_geom();
		match self.dir_form_tx(tx, dinr, dino)? {
			DirForm::Sf => {
				let mut sf = parse_sf(fork_local(dino)?, geom.has_ftype)?;
				let old = if name == b".." {
					let old = sf.parent;
					sf.parent = new_ino;
					old
				} else {
					let e = sf
						.entries
						.iter_mut()
						.find(|e| e.name == name)
						.ok_or_else(|| err!(ENOENT))?;
					std::mem::replace(&mut e.ino, new_ino)
				};
				dino.data = Fork::Local(encode_sf(&sf, geom.has_ftype));
				dino.size = sf_size(&sf, geom.has_ftype) as u64;
				InodeNum::new(old).ok_or_else(|| err!(EIO))
			}
			form => {
				// every other form stores `..` as a plain entry in the
				// data section
				for dbno in 0..self.dir_data_blocks(dino) {
					let Some(bi) = self.dir_tx_dblock(tx, dinr, dino, dbno, BufKind::DirData)?
					else {
						continue;
					};
					let mut entries = if form == DirForm::Block {
						dir_data::parse_block(&geom, tx.buf(bi))?
					} else {
						dir_data::parse_data(&geom, tx.buf(bi), geom.blksize)?
					};
					if let Some(e) = entries.iter_mut().find(|e| e.name == name) {
						let old = std::mem::replace(&mut e.ino, new_ino);
						if form == DirForm::Block {
							dir_data::build_block(&geom, tx.buf_mut(bi), &entries)?;
						} else {
							dir_data::build_data(&geom, tx.buf_mut(bi), &entries, geom.blksize)?;
						}
						tx.log_buf_full(bi);
						return InodeNum::new(old).ok_or_else(|| err!(EIO));
					}
				}
				Err(err!(ENOENT))
			}
		}
	}

	/// Convert a shortform directory to the single-block form.
	fn sf_to_block(
		&mut self,
		tx: &mut Trans,
		dinr: InodeNum,
		dino: &mut Inode,
		sf: &SfDir,
	) -> IoResult<()> {
		log::trace!("sf_to_block({dinr});");
		let geom = self.dir_geom();

		// the fork must be extent-shaped before blocks can be mapped
		dino.data = Fork::Extents(Vec::new());
		let bi = self.dir_grow_dblock(tx, dinr, dino, 0, BufKind::DirData)?;

		let dot = geom.first_entry_off();
		let dotdot = dot + geom.entsize(1);
		let mut entries = vec![
			DataEntry {
				off:   dot,
				ino:   dinr.get(),
				name:  b".".to_vec(),
				ftype: XFS_DIR3_FT_DIR,
			},
			DataEntry {
				off:   dotdot,
				ino:   sf.parent,
				name:  b"..".to_vec(),
				ftype: XFS_DIR3_FT_DIR,
			},
		];
		for e in &sf.entries {
			entries.push(DataEntry {
				off:   e.offset as usize,
				ino:   e.ino,
				name:  e.name.clone(),
				ftype: e.ftype,
			});
		}
		entries.sort_by_key(|e| e.off);

		let (fsbno, _) = self.dir_map_dblock(dino, 0).ok_or_else(|| err!(EIO))?;
		let daddr = self.superblock.fsb_to_byte(fsbno) / 512;
		let uuid = *self.superblock.meta_uuid().as_bytes();
		dir_data::init_data_hdr(
			&geom,
			tx.buf_mut(bi),
			geom.block_magic(),
			dinr.get(),
			daddr,
			&uuid,
		);
		dir_data::build_block(&geom, tx.buf_mut(bi), &entries)?;
		tx.log_buf_full(bi);
		dino.size = geom.blksize as u64;
		Ok(())
	}

	/// Demote the single-block form back to shortform when the survivors
	/// fit inline; otherwise just rewrite the block.
	fn block_maybe_to_sf(
		&mut self,
		tx: &mut Trans,
		dinr: InodeNum,
		dino: &mut Inode,
		bi: usize,
		entries: Vec<DataEntry>,
	) -> IoResult<()> {
		let geom = self.dir_geom();
		let parent = entries
			.iter()
			.find(|e| e.name == b"..")
			.map(|e| e.ino)
			.unwrap_or(dinr.get());
		let sf = SfDir {
			parent,
			entries: entries
				.iter()
				.filter(|e| e.name != b"." && e.name != b"..")
				.map(|e| SfEntry {
					name:   e.name.clone(),
					ino:    e.ino,
					ftype:  e.ftype,
					offset: e.off as u16,
				})
				.collect(),
		};
		let cap = super::inode::data_fork_size(&self.superblock, dino.version, dino.forkoff);
		if sf_size(&sf, geom.has_ftype) <= cap {
			log::trace!("block_to_sf({dinr});");
			self.dir_shrink_dblock(tx, dinr, dino, 0)?;
			dino.data = Fork::Local(encode_sf(&sf, geom.has_ftype));
			dino.size = sf_size(&sf, geom.has_ftype) as u64;
			return Ok(());
		}
		dir_data::build_block(&geom, tx.buf_mut(bi), &entries)?;
		tx.log_buf_full(bi);
		Ok(())
	}
}


fn dir_form_from_magic(inr: InodeNum, magic: u16) -> IoResult<DirForm> {
	match magic {
		XFS_DIR2_LEAF1_MAGIC | XFS_DIR3_LEAF1_MAGIC => Ok(DirForm::Leaf),
		XFS_DA_NODE_MAGIC | XFS_DA3_NODE_MAGIC => Ok(DirForm::Node),
		_ => {
			log::error!("directory {inr} has a bad leaf magic {magic:#x}");
			Err(crate::err!(EIO))
		}
	}
}

/// The inline bytes of a local-format fork.
pub(crate) fn fork_local(ino: &Inode) -> IoResult<&[u8]> {
	match &ino.data {
		Fork::Local(b) => Ok(b),
		_ => Err(err!(EIO)),
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn sf_fixture() -> SfDir {
		SfDir {
			parent:  128,
			entries: vec![
				SfEntry {
					name:   b"kernel".to_vec(),
					ino:    131,
					ftype:  XFS_DIR3_FT_REG_FILE,
					offset: 96,
				},
				SfEntry {
					name:   b"modules".to_vec(),
					ino:    4_294_967_400,
					ftype:  XFS_DIR3_FT_DIR,
					offset: 120,
				},
			],
		}
	}

	#[test]
	fn sf_roundtrip_narrow_and_wide() {
		let mut sf = sf_fixture();
		// one inumber above 2^32 forces the wide encoding
		let enc = encode_sf(&sf, true);
		assert_eq!(enc[1], 1, "one 8-byte inumber");
		assert_eq!(parse_sf(&enc, true).unwrap(), sf);

		sf.entries[1].ino = 200;
		let enc = encode_sf(&sf, true);
		assert_eq!(enc[1], 0, "narrow encoding");
		assert_eq!(enc.len(), sf_size(&sf, true));
		assert_eq!(parse_sf(&enc, true).unwrap(), sf);
	}

	#[test]
	fn sf_roundtrip_without_ftype() {
		let sf = sf_fixture();
		let enc = encode_sf(&sf, false);
		let back = parse_sf(&enc, false).unwrap();
		assert_eq!(back.parent, sf.parent);
		assert_eq!(back.entries[0].ftype, XFS_DIR3_FT_UNKNOWN);
		assert_eq!(back.entries[0].name, sf.entries[0].name);
	}

	#[test]
	fn sf_offsets_advance() {
		let geom = DirGeom {
			blksize:   4096,
			v5:        true,
			has_ftype: true,
		};
		let mut sf = SfDir {
			parent:  128,
			entries: Vec::new(),
		};
		let first = sf_next_offset(&geom, &sf);
		assert_eq!(first, geom.first_entry_off() + geom.entsize(1) + geom.entsize(2));
		sf.entries.push(SfEntry {
			name:   b"a".to_vec(),
			ino:    129,
			ftype:  XFS_DIR3_FT_REG_FILE,
			offset: first as u16,
		});
		assert_eq!(sf_next_offset(&geom, &sf), first + geom.entsize(1));
	}
}
