//! Short-form (AG-relative) B+trees: the two free-space trees rooted in
//! the AGF and the inode trees rooted in the AGI.
//!
//! Records live in leaves (level 0); interior nodes hold key/pointer
//! pairs where key[i] is the smallest key under child[i].  All four trees
//! share this geometry and differ only in record layout and ordering.

use std::{cmp::Ordering, io::Result as IoResult};

use super::{buf::BufKind, *};
use crate::err;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BtKind {
	/// Free space by block number.
	Bno,
	/// Free space by extent size.
	Cnt,
	/// Inode chunks.
	Ino,
	/// Inode chunks with free slots.
	Fino,
}

impl BtKind {
	pub fn rec_size(self) -> usize {
		match self {
			BtKind::Bno | BtKind::Cnt => 8,
			BtKind::Ino | BtKind::Fino => 16,
		}
	}

	pub fn key_size(self) -> usize {
		match self {
			BtKind::Bno | BtKind::Cnt => 8,
			BtKind::Ino | BtKind::Fino => 4,
		}
	}

	pub fn magic(self, v5: bool) -> u32 {
		match (self, v5) {
			(BtKind::Bno, false) => XFS_ABTB_MAGIC,
			(BtKind::Bno, true) => XFS_ABTB_CRC_MAGIC,
			(BtKind::Cnt, false) => XFS_ABTC_MAGIC,
			(BtKind::Cnt, true) => XFS_ABTC_CRC_MAGIC,
			(BtKind::Ino, false) => XFS_IBT_MAGIC,
			(BtKind::Ino, true) => XFS_IBT_CRC_MAGIC,
			(BtKind::Fino, false) => XFS_FIBT_MAGIC,
			(BtKind::Fino, true) => XFS_FIBT_CRC_MAGIC,
		}
	}

	pub fn buf_kind(self) -> BufKind {
		match self {
			BtKind::Bno | BtKind::Cnt => BufKind::AllocBtree,
			BtKind::Ino | BtKind::Fino => BufKind::InoBtree,
		}
	}

	fn is_alloc(self) -> bool {
		matches!(self, BtKind::Bno | BtKind::Cnt)
	}

	/// Record (and key) ordering within the tree.  Keys reuse the record
	/// layout prefix, so one comparator serves both.
	pub fn cmp(self, a: &[u8], b: &[u8]) -> Ordering {
		let be32 = |x: &[u8], off: usize| u32::from_be_bytes(x[off..off + 4].try_into().unwrap());
		match self {
			BtKind::Bno => be32(a, 0).cmp(&be32(b, 0)),
			BtKind::Cnt => (be32(a, 4), be32(a, 0)).cmp(&(be32(b, 4), be32(b, 0))),
			BtKind::Ino | BtKind::Fino => be32(a, 0).cmp(&be32(b, 0)),
		}
	}
}

/// A free-space record: AG-relative start and length in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AllocRec {
	pub bno: XfsAgblock,
	pub len: XfsExtlen,
}

impl AllocRec {
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			bno: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
			len: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
		}
	}

	pub fn encode(&self) -> [u8; 8] {
		let mut out = [0u8; 8];
		out[0..4].copy_from_slice(&self.bno.to_be_bytes());
		out[4..8].copy_from_slice(&self.len.to_be_bytes());
		out
	}
}

/// An inode-chunk record covering 64 inode slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InoRec {
	pub startino:  XfsAgino,
	pub holemask:  u16,
	pub count:     u8,
	pub freecount: u8,
	/// Bit i set means slot i is free.
	pub free: u64,
}

impl InoRec {
	pub fn decode(buf: &[u8], sparse: bool) -> Self {
		let startino = u32::from_be_bytes(buf[0..4].try_into().unwrap());
		let free = u64::from_be_bytes(buf[8..16].try_into().unwrap());
		if sparse {
			Self {
				startino,
				holemask: u16::from_be_bytes(buf[4..6].try_into().unwrap()),
				count: buf[6],
				freecount: buf[7],
				free,
			}
		} else {
			let freecount = u32::from_be_bytes(buf[4..8].try_into().unwrap());
			Self {
				startino,
				holemask: 0,
				count: INODES_PER_CHUNK as u8,
				freecount: freecount as u8,
				free,
			}
		}
	}

	pub fn encode(&self, sparse: bool) -> [u8; 16] {
		let mut out = [0u8; 16];
		out[0..4].copy_from_slice(&self.startino.to_be_bytes());
		if sparse {
			out[4..6].copy_from_slice(&self.holemask.to_be_bytes());
			out[6] = self.count;
			out[7] = self.freecount;
		} else {
			out[4..8].copy_from_slice(&(self.freecount as u32).to_be_bytes());
		}
		out[8..16].copy_from_slice(&self.free.to_be_bytes());
		out
	}
}

/// A position within one tree.
pub(crate) struct BtCursor {
	pub kind: BtKind,
	pub agno: XfsAgnumber,
	/// Pinned leaf and record index.
	bi:  usize,
	idx: usize,
}

type Path = Vec<PathStep>;

#[derive(Clone, Copy)]
struct PathStep {
	bi:    usize,
	idx:   usize,
	level: u32,
	agbno: XfsAgblock,
}

// header accessors over a raw btree block
fn hdr_len(v5: bool) -> usize {
	if v5 {
		BTREE_SBLOCK_CRC_LEN
	} else {
		BTREE_SBLOCK_LEN
	}
}

fn get_level(buf: &[u8]) -> u32 {
	u16::from_be_bytes(buf[4..6].try_into().unwrap()).into()
}

fn get_numrecs(buf: &[u8]) -> usize {
	u16::from_be_bytes(buf[6..8].try_into().unwrap()).into()
}

fn set_numrecs(buf: &mut [u8], n: usize) {
	buf[6..8].copy_from_slice(&(n as u16).to_be_bytes());
}

fn get_leftsib(buf: &[u8]) -> u32 {
	u32::from_be_bytes(buf[8..12].try_into().unwrap())
}

fn get_rightsib(buf: &[u8]) -> u32 {
	u32::from_be_bytes(buf[12..16].try_into().unwrap())
}

fn set_leftsib(buf: &mut [u8], v: u32) {
	buf[8..12].copy_from_slice(&v.to_be_bytes());
}

fn set_rightsib(buf: &mut [u8], v: u32) {
	buf[12..16].copy_from_slice(&v.to_be_bytes());
}

impl<R: Backend> Xfs<R> {
	fn bt_leaf_maxrecs(&self, kind: BtKind) -> usize {
		let bs = self.superblock.blocksize as usize;
		(bs - hdr_len(self.superblock.is_v5())) / kind.rec_size()
	}

	fn bt_node_maxrecs(&self, kind: BtKind) -> usize {
		let bs = self.superblock.blocksize as usize;
		(bs - hdr_len(self.superblock.is_v5())) / (kind.key_size() + 4)
	}

	fn bt_rec_range(&self, kind: BtKind, idx: usize) -> std::ops::Range<usize> {
		let base = hdr_len(self.superblock.is_v5()) + idx * kind.rec_size();
		base..base + kind.rec_size()
	}

	fn bt_key_range(&self, kind: BtKind, idx: usize) -> std::ops::Range<usize> {
		let base = hdr_len(self.superblock.is_v5()) + idx * kind.key_size();
		base..base + kind.key_size()
	}

	fn bt_ptr_off(&self, kind: BtKind, idx: usize) -> usize {
		hdr_len(self.superblock.is_v5()) + self.bt_node_maxrecs(kind) * kind.key_size() + idx * 4
	}

	/// Initialize a fresh btree block in place.
	pub(crate) fn bt_init_block(
		&self,
		buf: &mut [u8],
		kind: BtKind,
		level: u32,
		agno: XfsAgnumber,
		agbno: XfsAgblock,
	) {
		let sb = &self.superblock;
		buf.fill(0);
		buf[0..4].copy_from_slice(&kind.magic(sb.is_v5()).to_be_bytes());
		buf[4..6].copy_from_slice(&(level as u16).to_be_bytes());
		set_numrecs(buf, 0);
		set_leftsib(buf, NULLAGBLOCK);
		set_rightsib(buf, NULLAGBLOCK);
		if sb.is_v5() {
			// blkno (daddr), uuid, owner
			let daddr = (sb.ag_byte(agno) + ((agbno as u64) << sb.blocklog)) / 512;
			buf[16..24].copy_from_slice(&daddr.to_be_bytes());
			buf[32..48].copy_from_slice(sb.meta_uuid().as_bytes());
			buf[48..52].copy_from_slice(&agno.to_be_bytes());
		}
	}

	fn bt_block_pos(&self, agno: XfsAgnumber, agbno: XfsAgblock) -> u64 {
		self.superblock.ag_byte(agno) + ((agbno as u64) << self.superblock.blocklog)
	}

	/// Tree root and height from the owning AG header.
	fn bt_root(&mut self, tx: &mut Trans, agno: XfsAgnumber, kind: BtKind) -> IoResult<(u32, u32)> {
		if kind.is_alloc() {
			let (_, agf) = self.agf(tx, agno)?;
			Ok(match kind {
				BtKind::Bno => (agf.bno_root, agf.bno_level),
				_ => (agf.cnt_root, agf.cnt_level),
			})
		} else {
			let (_, agi) = self.agi(tx, agno)?;
			Ok(match kind {
				BtKind::Ino => (agi.root, agi.level),
				_ => (agi.free_root, agi.free_level),
			})
		}
	}

	fn bt_set_root(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
		kind: BtKind,
		root: u32,
		level: u32,
	) -> IoResult<()> {
		if kind.is_alloc() {
			let (bi, mut agf) = self.agf(tx, agno)?;
			match kind {
				BtKind::Bno => {
					agf.bno_root = root;
					agf.bno_level = level;
				}
				_ => {
					agf.cnt_root = root;
					agf.cnt_level = level;
				}
			}
			self.agf_update(tx, bi, &agf)
		} else {
			let (bi, mut agi) = self.agi(tx, agno)?;
			match kind {
				BtKind::Ino => {
					agi.root = root;
					agi.level = level;
				}
				_ => {
					agi.free_root = root;
					agi.free_level = level;
				}
			}
			self.agi_update(tx, bi, &agi)
		}
	}

	/// Descend to the leaf that would hold `key`, remembering the path.
	fn bt_descend(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
		kind: BtKind,
		key: &[u8],
	) -> IoResult<Option<Path>> {
		let (root, levels) = self.bt_root(tx, agno, kind)?;
		if root == 0 || root == NULLAGBLOCK || levels == 0 {
			return Ok(None);
		}
		let bs = self.superblock.blocksize as usize;
		let mut path = Path::new();
		let mut agbno = root;
		let mut level = levels - 1;
		loop {
			let pos = self.bt_block_pos(agno, agbno);
			let bi = self.trans_read_buf(tx, pos, bs, kind.buf_kind())?;
			if get_level(tx.buf(bi)) != level {
				log::error!("btree level mismatch in AG {agno}");
				return Err(err!(EIO));
			}
			let nrecs = get_numrecs(tx.buf(bi));

			if level == 0 {
				// first record >= key; may be one past the end
				let mut idx = nrecs;
				for i in 0..nrecs {
					let r = self.bt_rec_range(kind, i);
					if kind.cmp(&tx.buf(bi)[r], key) != Ordering::Less {
						idx = i;
						break;
					}
				}
				path.push(PathStep {
					bi,
					idx,
					level: 0,
					agbno,
				});
				return Ok(Some(path));
			}

			// last child whose key <= target; 0 when the target sorts first
			let mut idx = 0;
			for i in (0..nrecs).rev() {
				let r = self.bt_key_range(kind, i);
				if kind.cmp(&tx.buf(bi)[r], key) != Ordering::Greater {
					idx = i;
					break;
				}
			}
			path.push(PathStep {
				bi,
				idx,
				level,
				agbno,
			});
			let p = self.bt_ptr_off(kind, idx);
			agbno = u32::from_be_bytes(tx.buf(bi)[p..p + 4].try_into().unwrap());
			level -= 1;
		}
	}

	/// Position at the first record with key >= `key`, following the
	/// sibling chain past a leaf boundary.  `None` when no such record.
	pub(crate) fn bt_lookup_ge(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
		kind: BtKind,
		key: &[u8],
	) -> IoResult<Option<BtCursor>> {
		let Some(path) = self.bt_descend(tx, agno, kind, key)? else {
			return Ok(None);
		};
		let leaf = *path.last().unwrap();
		if leaf.idx < get_numrecs(tx.buf(leaf.bi)) {
			return Ok(Some(BtCursor {
				kind,
				agno,
				bi: leaf.bi,
				idx: leaf.idx,
			}));
		}
		// everything in this leaf is smaller; the next record, if any,
		// is the first one of the right sibling
		let right = get_rightsib(tx.buf(leaf.bi));
		if right == NULLAGBLOCK {
			return Ok(None);
		}
		let bs = self.superblock.blocksize as usize;
		let pos = self.bt_block_pos(agno, right);
		let bi = self.trans_read_buf(tx, pos, bs, kind.buf_kind())?;
		if get_numrecs(tx.buf(bi)) == 0 {
			return Ok(None);
		}
		Ok(Some(BtCursor {
			kind,
			agno,
			bi,
			idx: 0,
		}))
	}

	/// Position at the last record with key <= `key`.
	pub(crate) fn bt_lookup_le(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
		kind: BtKind,
		key: &[u8],
	) -> IoResult<Option<BtCursor>> {
		let Some(path) = self.bt_descend(tx, agno, kind, key)? else {
			return Ok(None);
		};
		let leaf = *path.last().unwrap();
		let nrecs = get_numrecs(tx.buf(leaf.bi));
		// the first >= position; step one back unless it's an exact match
		let mut idx = leaf.idx;
		if idx < nrecs {
			let r = self.bt_rec_range(kind, idx);
			if kind.cmp(&tx.buf(leaf.bi)[r], key) == Ordering::Equal {
				return Ok(Some(BtCursor {
					kind,
					agno,
					bi: leaf.bi,
					idx,
				}));
			}
		}
		if idx == 0 {
			// all records here are greater; the previous record lives in
			// the left sibling
			let left = get_leftsib(tx.buf(leaf.bi));
			if left == NULLAGBLOCK {
				return Ok(None);
			}
			let bs = self.superblock.blocksize as usize;
			let pos = self.bt_block_pos(agno, left);
			let bi = self.trans_read_buf(tx, pos, bs, kind.buf_kind())?;
			let n = get_numrecs(tx.buf(bi));
			if n == 0 {
				return Ok(None);
			}
			return Ok(Some(BtCursor {
				kind,
				agno,
				bi,
				idx: n - 1,
			}));
		}
		idx -= 1;
		Ok(Some(BtCursor {
			kind,
			agno,
			bi: leaf.bi,
			idx,
		}))
	}

	/// Copy out the record under the cursor.
	pub(crate) fn bt_get_rec(&self, tx: &Trans, cur: &BtCursor) -> Vec<u8> {
		let r = self.bt_rec_range(cur.kind, cur.idx);
		tx.buf(cur.bi)[r].to_vec()
	}

	/// Advance to the next record, following the sibling chain.
	pub(crate) fn bt_next(&mut self, tx: &mut Trans, cur: &mut BtCursor) -> IoResult<bool> {
		let nrecs = get_numrecs(tx.buf(cur.bi));
		if cur.idx + 1 < nrecs {
			cur.idx += 1;
			return Ok(true);
		}
		let right = get_rightsib(tx.buf(cur.bi));
		if right == NULLAGBLOCK {
			return Ok(false);
		}
		let bs = self.superblock.blocksize as usize;
		let pos = self.bt_block_pos(cur.agno, right);
		let bi = self.trans_read_buf(tx, pos, bs, cur.kind.buf_kind())?;
		if get_numrecs(tx.buf(bi)) == 0 {
			return Ok(false);
		}
		cur.bi = bi;
		cur.idx = 0;
		Ok(true)
	}

	/// Replace the record under the cursor.  The replacement must sort at
	/// the same position.  Ancestor keys are repaired when the leaf's
	/// first record changes.
	pub(crate) fn bt_update(&mut self, tx: &mut Trans, cur: &BtCursor, rec: &[u8]) -> IoResult<()> {
		let old = self.bt_get_rec(tx, cur);
		let r = self.bt_rec_range(cur.kind, cur.idx);
		tx.buf_mut(cur.bi)[r].copy_from_slice(rec);
		tx.log_buf_full(cur.bi);
		if cur.idx == 0 {
			// re-descend by the old key for a correct ancestor path
			if let Some(path) = self.bt_descend(tx, cur.agno, cur.kind, &old)? {
				self.bt_fix_keys(tx, cur.kind, &path);
			}
		}
		Ok(())
	}

	/// Propagate the leaf's first key into ancestor nodes.
	fn bt_fix_keys(&self, tx: &mut Trans, kind: BtKind, path: &Path) {
		let leaf = *path.last().unwrap();
		if get_numrecs(tx.buf(leaf.bi)) == 0 {
			return;
		}
		let first = self.bt_rec_range(kind, 0);
		let key = tx.buf(leaf.bi)[first][..kind.key_size()].to_vec();
		for step in path.iter().rev().skip(1) {
			let kr = self.bt_key_range(kind, step.idx);
			tx.buf_mut(step.bi)[kr].copy_from_slice(&key);
			tx.log_buf_full(step.bi);
			if step.idx != 0 {
				break;
			}
		}
	}

	/// Take a block for btree growth: the AGFL feeds the free-space trees,
	/// the space allocator feeds the inode trees.
	fn bt_new_block(&mut self, tx: &mut Trans, agno: XfsAgnumber, kind: BtKind) -> IoResult<u32> {
		if kind.is_alloc() {
			self.agfl_pop(tx, agno)
		} else {
			let fsbno = self.alloc_ag_block(tx, agno)?;
			let (a, agbno) = self.superblock.fsb_to_agb(fsbno);
			assert_eq!(a, agno);
			Ok(agbno)
		}
	}

	/// Insert a record.  Handles in-leaf inserts, leaf splits, one level
	/// of parent insert, and growing a new root over a split root.
	pub(crate) fn bt_insert(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
		kind: BtKind,
		rec: &[u8],
	) -> IoResult<()> {
		assert_eq!(rec.len(), kind.rec_size());
		let bs = self.superblock.blocksize as usize;
		let Some(path) = self.bt_descend(tx, agno, kind, rec)? else {
			log::error!("insert into an uninitialized btree in AG {agno}");
			return Err(err!(EIO));
		};
		let (_, levels) = self.bt_root(tx, agno, kind)?;

		let leaf = *path.last().unwrap();
		{
			// reject duplicates
			let nrecs = get_numrecs(tx.buf(leaf.bi));
			if leaf.idx < nrecs {
				let r = self.bt_rec_range(kind, leaf.idx);
				if kind.cmp(&tx.buf(leaf.bi)[r], rec) == Ordering::Equal {
					log::error!("duplicate btree record in AG {agno}");
					return Err(err!(EIO));
				}
			}
		}

		let maxrecs = self.bt_leaf_maxrecs(kind);
		let nrecs = get_numrecs(tx.buf(leaf.bi));

		if nrecs < maxrecs {
			self.bt_leaf_insert_at(tx, kind, leaf.bi, leaf.idx, rec);
			if leaf.idx == 0 {
				self.bt_fix_keys(tx, kind, &path);
			}
			return Ok(());
		}

		// leaf split: move the right half into a new block
		let new_agbno = self.bt_new_block(tx, agno, kind)?;
		let new_pos = self.bt_block_pos(agno, new_agbno);
		let new_bi = self.trans_get_buf(tx, new_pos, bs, kind.buf_kind());
		{
			let mut fresh = vec![0u8; bs];
			self.bt_init_block(&mut fresh, kind, 0, agno, new_agbno);
			tx.buf_mut(new_bi).copy_from_slice(&fresh);
		}

		let keep = nrecs / 2;
		let moved = nrecs - keep;
		for i in 0..moved {
			let src = self.bt_rec_range(kind, keep + i);
			let bytes = tx.buf(leaf.bi)[src].to_vec();
			let dst = self.bt_rec_range(kind, i);
			tx.buf_mut(new_bi)[dst].copy_from_slice(&bytes);
		}
		set_numrecs(tx.buf_mut(leaf.bi), keep);
		set_numrecs(tx.buf_mut(new_bi), moved);

		// relink the sibling chain
		let old_right = get_rightsib(tx.buf(leaf.bi));
		set_rightsib(tx.buf_mut(leaf.bi), new_agbno);
		set_leftsib(tx.buf_mut(new_bi), leaf.agbno);
		set_rightsib(tx.buf_mut(new_bi), old_right);
		if old_right != NULLAGBLOCK {
			let rp = self.bt_block_pos(agno, old_right);
			let rbi = self.trans_read_buf(tx, rp, bs, kind.buf_kind())?;
			set_leftsib(tx.buf_mut(rbi), new_agbno);
			tx.log_buf_full(rbi);
		}

		// insert into the proper half
		if leaf.idx <= keep {
			self.bt_leaf_insert_at(tx, kind, leaf.bi, leaf.idx, rec);
			if leaf.idx == 0 {
				self.bt_fix_keys(tx, kind, &path);
			}
		} else {
			self.bt_leaf_insert_at(tx, kind, new_bi, leaf.idx - keep, rec);
		}
		tx.log_buf_full(leaf.bi);
		tx.log_buf_full(new_bi);

		// hook the new block into the parent
		let first = self.bt_rec_range(kind, 0);
		let new_key = tx.buf(new_bi)[first][..kind.key_size()].to_vec();

		if path.len() == 1 {
			// the root itself split; grow a new root above it
			let root_agbno = self.bt_new_block(tx, agno, kind)?;
			let root_pos = self.bt_block_pos(agno, root_agbno);
			let root_bi = self.trans_get_buf(tx, root_pos, bs, kind.buf_kind());
			{
				let mut fresh = vec![0u8; bs];
				self.bt_init_block(&mut fresh, kind, 1, agno, root_agbno);
				tx.buf_mut(root_bi).copy_from_slice(&fresh);
			}
			let lf = self.bt_rec_range(kind, 0);
			let left_key = tx.buf(leaf.bi)[lf][..kind.key_size()].to_vec();
			let k0 = self.bt_key_range(kind, 0);
			tx.buf_mut(root_bi)[k0].copy_from_slice(&left_key);
			let k1 = self.bt_key_range(kind, 1);
			tx.buf_mut(root_bi)[k1].copy_from_slice(&new_key);
			let p0 = self.bt_ptr_off(kind, 0);
			tx.buf_mut(root_bi)[p0..p0 + 4].copy_from_slice(&leaf.agbno.to_be_bytes());
			let p1 = self.bt_ptr_off(kind, 1);
			tx.buf_mut(root_bi)[p1..p1 + 4].copy_from_slice(&new_agbno.to_be_bytes());
			set_numrecs(tx.buf_mut(root_bi), 2);
			tx.log_buf_full(root_bi);
			self.bt_set_root(tx, agno, kind, root_agbno, levels + 1)?;
			return Ok(());
		}

		// insert (key, ptr) after the leaf's slot in its parent
		let parent = path[path.len() - 2];
		let pn = get_numrecs(tx.buf(parent.bi));
		if pn >= self.bt_node_maxrecs(kind) {
			log::error!("btree node split beyond the supported height");
			return Err(err!(ENOSPC));
		}
		let at = parent.idx + 1;
		for i in (at..pn).rev() {
			let src_k = self.bt_key_range(kind, i);
			let k = tx.buf(parent.bi)[src_k].to_vec();
			let dst_k = self.bt_key_range(kind, i + 1);
			tx.buf_mut(parent.bi)[dst_k].copy_from_slice(&k);
			let src_p = self.bt_ptr_off(kind, i);
			let p = tx.buf(parent.bi)[src_p..src_p + 4].to_vec();
			let dst_p = self.bt_ptr_off(kind, i + 1);
			tx.buf_mut(parent.bi)[dst_p..dst_p + 4].copy_from_slice(&p);
		}
		let kr = self.bt_key_range(kind, at);
		tx.buf_mut(parent.bi)[kr].copy_from_slice(&new_key);
		let pr = self.bt_ptr_off(kind, at);
		tx.buf_mut(parent.bi)[pr..pr + 4].copy_from_slice(&new_agbno.to_be_bytes());
		set_numrecs(tx.buf_mut(parent.bi), pn + 1);
		tx.log_buf_full(parent.bi);
		Ok(())
	}

	fn bt_leaf_insert_at(&self, tx: &mut Trans, kind: BtKind, bi: usize, idx: usize, rec: &[u8]) {
		let nrecs = get_numrecs(tx.buf(bi));
		for i in (idx..nrecs).rev() {
			let src = self.bt_rec_range(kind, i);
			let bytes = tx.buf(bi)[src].to_vec();
			let dst = self.bt_rec_range(kind, i + 1);
			tx.buf_mut(bi)[dst].copy_from_slice(&bytes);
		}
		let r = self.bt_rec_range(kind, idx);
		tx.buf_mut(bi)[r].copy_from_slice(rec);
		set_numrecs(tx.buf_mut(bi), nrecs + 1);
		tx.log_buf_full(bi);
	}

	/// Delete the record under the cursor.  An emptied non-root leaf is
	/// unhooked from its parent and its block returned to the free list.
	pub(crate) fn bt_delete(&mut self, tx: &mut Trans, cur: &BtCursor) -> IoResult<()> {
		let kind = cur.kind;
		let agno = cur.agno;
		let bs = self.superblock.blocksize as usize;

		// re-descend by the record's own key for a correct ancestor path
		let rec = self.bt_get_rec(tx, cur);
		let path = self
			.bt_descend(tx, agno, kind, &rec)?
			.ok_or_else(|| err!(EIO))?;
		let leaf = *path.last().unwrap();
		let nrecs = get_numrecs(tx.buf(leaf.bi));
		if leaf.idx >= nrecs {
			log::error!("btree delete: record vanished in AG {agno}");
			return Err(err!(EIO));
		}

		for i in leaf.idx..nrecs - 1 {
			let src = self.bt_rec_range(kind, i + 1);
			let bytes = tx.buf(leaf.bi)[src].to_vec();
			let dst = self.bt_rec_range(kind, i);
			tx.buf_mut(leaf.bi)[dst].copy_from_slice(&bytes);
		}
		set_numrecs(tx.buf_mut(leaf.bi), nrecs - 1);
		tx.log_buf_full(leaf.bi);

		if nrecs - 1 == 0 && path.len() > 1 {
			// unlink the empty leaf from the sibling chain
			let left = get_leftsib(tx.buf(leaf.bi));
			let right = get_rightsib(tx.buf(leaf.bi));
			if left != NULLAGBLOCK {
				let lp = self.bt_block_pos(agno, left);
				let lbi = self.trans_read_buf(tx, lp, bs, kind.buf_kind())?;
				set_rightsib(tx.buf_mut(lbi), right);
				tx.log_buf_full(lbi);
			}
			if right != NULLAGBLOCK {
				let rp = self.bt_block_pos(agno, right);
				let rbi = self.trans_read_buf(tx, rp, bs, kind.buf_kind())?;
				set_leftsib(tx.buf_mut(rbi), left);
				tx.log_buf_full(rbi);
			}

			// and from its parent
			let parent = path[path.len() - 2];
			let pn = get_numrecs(tx.buf(parent.bi));
			for i in parent.idx..pn - 1 {
				let src_k = self.bt_key_range(kind, i + 1);
				let k = tx.buf(parent.bi)[src_k].to_vec();
				let dst_k = self.bt_key_range(kind, i);
				tx.buf_mut(parent.bi)[dst_k].copy_from_slice(&k);
				let src_p = self.bt_ptr_off(kind, i + 1);
				let p = tx.buf(parent.bi)[src_p..src_p + 4].to_vec();
				let dst_p = self.bt_ptr_off(kind, i);
				tx.buf_mut(parent.bi)[dst_p..dst_p + 4].copy_from_slice(&p);
			}
			set_numrecs(tx.buf_mut(parent.bi), pn - 1);
			tx.log_buf_full(parent.bi);

			if kind.is_alloc() {
				self.agfl_push(tx, agno, leaf.agbno)?;
			} else {
				tx.defer_free(self.superblock.agb_to_fsb(agno, leaf.agbno), 1);
			}
			return Ok(());
		}

		if leaf.idx == 0 && nrecs - 1 > 0 {
			self.bt_fix_keys(tx, kind, &path);
		}
		Ok(())
	}

	/// Walk every record of a tree outside any transaction; used by
	/// consistency checks.
	pub(crate) fn bt_walk<F: FnMut(&[u8])>(
		&mut self,
		agno: XfsAgnumber,
		kind: BtKind,
		root: u32,
		levels: u32,
		mut f: F,
	) -> IoResult<()> {
		if root == 0 || root == NULLAGBLOCK || levels == 0 {
			return Ok(());
		}
		let bs = self.superblock.blocksize as usize;
		// descend along the leftmost spine
		let mut agbno = root;
		for _ in 1..levels {
			let pos = self.bt_block_pos(agno, agbno);
			let blk = self.read_buf(pos, bs, kind.buf_kind())?;
			let p = self.bt_ptr_off(kind, 0);
			agbno = u32::from_be_bytes(blk[p..p + 4].try_into().unwrap());
		}
		// then sweep the leaf chain
		loop {
			let pos = self.bt_block_pos(agno, agbno);
			let blk = self.read_buf(pos, bs, kind.buf_kind())?;
			assert_eq!(get_level(&blk), 0);
			for i in 0..get_numrecs(&blk) {
				let r = self.bt_rec_range(kind, i);
				f(&blk[r]);
			}
			let right = get_rightsib(&blk);
			if right == NULLAGBLOCK {
				return Ok(());
			}
			agbno = right;
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn alloc_rec_roundtrip() {
		let r = AllocRec {
			bno: 1234,
			len: 88,
		};
		assert_eq!(AllocRec::decode(&r.encode()), r);
	}

	#[test]
	fn ino_rec_roundtrip_both_layouts() {
		let r = InoRec {
			startino:  64,
			holemask:  0,
			count:     64,
			freecount: 61,
			free:      0xfff8_0000_0000_0007,
		};
		assert_eq!(InoRec::decode(&r.encode(true), true), r);
		assert_eq!(InoRec::decode(&r.encode(false), false), r);
	}

	#[test]
	fn cnt_ordering() {
		let small = AllocRec {
			bno: 900,
			len: 4,
		}
		.encode();
		let big = AllocRec {
			bno: 10,
			len: 90,
		}
		.encode();
		assert_eq!(BtKind::Cnt.cmp(&small, &big), Ordering::Less);
		assert_eq!(BtKind::Bno.cmp(&small, &big), Ordering::Greater);
	}
}
