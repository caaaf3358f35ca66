//! Extent mapping for the data fork: reads over holes and unwritten
//! extents, hole materialization for writes, and the in-inode extent
//! list ↔ bmbt conversions.

use std::io::Result as IoResult;

use super::{buf::BufKind, inode::data_fork_size, *};
use crate::err;

/// Find the extent covering a file block, if any.
pub(crate) fn extent_at(extents: &[Extent], off: XfsFileoff) -> Option<&Extent> {
	let i = extents.partition_point(|e| e.end_off() <= off);
	extents.get(i).filter(|e| e.startoff <= off)
}

/// Longest run one on-disk extent record can describe.
const MAX_EXTLEN: u64 = (1 << 21) - 1;

/// Merge a freshly-allocated extent into an ordered list.
fn insert_extent(extents: &mut Vec<Extent>, new: Extent) {
	let i = extents.partition_point(|e| e.startoff < new.startoff);

	// coalesce with the left neighbor
	if i > 0 {
		let left = extents[i - 1];
		if !left.unwritten
			&& !new.unwritten
			&& left.end_off() == new.startoff
			&& left.startblock + left.blockcount == new.startblock
			&& left.blockcount + new.blockcount <= MAX_EXTLEN
		{
			extents[i - 1].blockcount += new.blockcount;
			// and maybe the right one collapses too
			if i < extents.len() {
				let l = extents[i - 1];
				let right = extents[i];
				if !right.unwritten
					&& l.end_off() == right.startoff
					&& l.startblock + l.blockcount == right.startblock
					&& l.blockcount + right.blockcount <= MAX_EXTLEN
				{
					extents[i - 1].blockcount += right.blockcount;
					extents.remove(i);
				}
			}
			return;
		}
	}
	// or the right neighbor
	if i < extents.len() {
		let right = extents[i];
		if !right.unwritten
			&& !new.unwritten
			&& new.end_off() == right.startoff
			&& new.startblock + new.blockcount == right.startblock
			&& new.blockcount + right.blockcount <= MAX_EXTLEN
		{
			extents[i].startoff = new.startoff;
			extents[i].startblock = new.startblock;
			extents[i].blockcount += new.blockcount;
			return;
		}
	}
	extents.insert(i, new);
}

/// Map a fresh directory block into the data fork.
pub(crate) fn fork_insert_for_dir(ino: &mut Inode, startoff: XfsFileoff, fsbno: XfsFsblock, len: u64) {
	insert_extent(
		fork_extents_mut(&mut ino.data),
		Extent {
			startoff,
			startblock: fsbno,
			blockcount: len,
			unwritten: false,
		},
	);
}

fn fork_extents_mut(fork: &mut Fork) -> &mut Vec<Extent> {
	match fork {
		Fork::Extents(x) => x,
		Fork::Btree {
			extents, ..
		} => extents,
		_ => panic!("fork holds no extents"),
	}
}

impl<R: Backend> Xfs<R> {
	/// Read file content.  Holes and unwritten extents read as zeroes;
	/// reads past EOF are clipped.
	pub fn inode_read(
		&mut self,
		inr: InodeNum,
		offset: u64,
		buffer: &mut [u8],
	) -> IoResult<usize> {
		log::trace!("inode_read({inr}, {offset}, {})", buffer.len());
		let ino = self.iget(inr)?;
		if ino.is_dir() {
			return Err(err!(EISDIR));
		}
		if offset >= ino.size {
			return Ok(0);
		}

		let bs = self.superblock.blocksize as u64;
		let len = (buffer.len() as u64).min(ino.size - offset);
		let end = offset + len;
		let mut pos = offset;
		let mut boff = 0usize;

		while pos < end {
			let fsb = pos / bs;
			let off_in_blk = pos % bs;
			let n = match extent_at(ino.data.extents(), fsb) {
				Some(e) if !e.unwritten => {
					// contiguous bytes left in this extent
					let ext_left = (e.end_off() - fsb) * bs - off_in_blk;
					let n = ext_left.min(end - pos) as usize;
					let blk = e.startblock + (fsb - e.startoff);
					let byte = self.superblock.fsb_to_byte(blk) + off_in_blk;
					self.file.read_at(byte, &mut buffer[boff..boff + n])?;
					n
				}
				Some(e) => {
					// unwritten: zeroes up to the extent's end
					let ext_left = (e.end_off() - fsb) * bs - off_in_blk;
					let n = ext_left.min(end - pos) as usize;
					buffer[boff..boff + n].fill(0);
					n
				}
				None => {
					// hole: zeroes up to the next extent
					let next = ino
						.data
						.extents()
						.iter()
						.find(|e| e.startoff > fsb)
						.map(|e| e.startoff * bs)
						.unwrap_or(end);
					let n = (next.max(pos + 1) - pos).min(end - pos) as usize;
					buffer[boff..boff + n].fill(0);
					n
				}
			};
			pos += n as u64;
			boff += n;
		}

		Ok(boff)
	}

	/// Back `[off_fsb, off_fsb + count_fsb)` of the data fork with real
	/// extents, allocating over any holes.  The inode's block count moves
	/// with the allocations; the caller logs the inode.
	pub(crate) fn ensure_mapped(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &mut Inode,
		off_fsb: XfsFileoff,
		count_fsb: u64,
	) -> IoResult<()> {
		assert!(count_fsb > 0);
		let end = off_fsb + count_fsb;
		let mut pos = off_fsb;
		let mut changed = false;

		while pos < end {
			if let Some(e) = extent_at(ino.data.extents(), pos) {
				pos = e.end_off();
				continue;
			}
			// size of the hole from here
			let hole_end = ino
				.data
				.extents()
				.iter()
				.find(|e| e.startoff > pos)
				.map(|e| e.startoff)
				.unwrap_or(end)
				.min(end);
			let want = hole_end - pos;

			// hint: after the previous extent, else near the inode
			let hint = match extent_at(ino.data.extents(), pos.saturating_sub(1)) {
				Some(p) => p.startblock + p.blockcount,
				None => {
					let agno = self.superblock.ino_to_agno(inr.get());
					self.superblock.agb_to_fsb(agno, 0)
				}
			};

			let (fsbno, got) = self.alloc_extent(tx, hint, 1, want, 1)?;
			insert_extent(
				fork_extents_mut(&mut ino.data),
				Extent {
					startoff:   pos,
					startblock: fsbno,
					blockcount: got,
					unwritten:  false,
				},
			);
			ino.nblocks += got;
			pos += got;
			changed = true;
		}

		if changed {
			self.fork_writeback(tx, inr, ino)?;
		}
		Ok(())
	}

	/// Pick the on-disk representation for the data fork: inline extent
	/// list when it fits, otherwise a one-level bmbt.
	pub(crate) fn fork_writeback(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &mut Inode,
	) -> IoResult<()> {
		let dsize = data_fork_size(&self.superblock, ino.version, ino.forkoff);
		let extents = ino.data.extents().to_vec();
		let old_tree_blocks: Vec<XfsFsblock> = match &ino.data {
			Fork::Btree {
				blocks, ..
			} => blocks.clone(),
			_ => Vec::new(),
		};

		if extents.len() * 16 <= dsize {
			for b in &old_tree_blocks {
				tx.defer_free(*b, 1);
			}
			ino.nblocks -= old_tree_blocks.len() as u64;
			ino.data = Fork::Extents(extents);
			return Ok(());
		}

		// rebuild as root -> leaves
		let sb = &self.superblock;
		let bs = sb.blocksize as usize;
		let v5 = sb.is_v5();
		let lhdr = if v5 {
			BTREE_LBLOCK_CRC_LEN
		} else {
			BTREE_LBLOCK_LEN
		};
		let per_leaf = (bs - lhdr) / 16;
		let nleaves = extents.len().div_ceil(per_leaf);
		let maxrecs = (dsize - 4) / 16;
		if nleaves > maxrecs {
			log::error!("inode {inr}: extent btree would exceed the supported height");
			return Err(err!(ENOSPC));
		}

		for b in &old_tree_blocks {
			tx.defer_free(*b, 1);
		}
		ino.nblocks -= old_tree_blocks.len() as u64;

		let hint = extents[0].startblock;
		let mut leaves = Vec::with_capacity(nleaves);
		for _ in 0..nleaves {
			let (fsbno, got) = self.alloc_extent(tx, hint, 1, 1, 1)?;
			assert_eq!(got, 1);
			leaves.push(fsbno);
		}
		ino.nblocks += nleaves as u64;

		let magic = if v5 { XFS_BMAP_CRC_MAGIC } else { XFS_BMAP_MAGIC };
		for (li, chunk) in extents.chunks(per_leaf).enumerate() {
			let fsbno = leaves[li];
			let pos = self.superblock.fsb_to_byte(fsbno);
			let bi = self.trans_get_buf(tx, pos, bs, BufKind::BmapBtree);
			let buf = tx.buf_mut(bi);
			buf[0..4].copy_from_slice(&magic.to_be_bytes());
			buf[4..6].copy_from_slice(&0u16.to_be_bytes());
			buf[6..8].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
			let left = if li == 0 { NULLFSBLOCK } else { leaves[li - 1] };
			let right = if li + 1 == nleaves {
				NULLFSBLOCK
			} else {
				leaves[li + 1]
			};
			buf[8..16].copy_from_slice(&left.to_be_bytes());
			buf[16..24].copy_from_slice(&right.to_be_bytes());
			if v5 {
				buf[24..32].copy_from_slice(&(pos / 512).to_be_bytes());
				buf[40..56].copy_from_slice(self.superblock.meta_uuid().as_bytes());
				buf[56..64].copy_from_slice(&inr.get().to_be_bytes());
			}
			for (i, e) in chunk.iter().enumerate() {
				let (l0, l1) = e.pack();
				let off = lhdr + i * 16;
				buf[off..off + 8].copy_from_slice(&l0.to_be_bytes());
				buf[off + 8..off + 16].copy_from_slice(&l1.to_be_bytes());
			}
			tx.log_buf_full(bi);
		}

		let mut root = vec![0u8; dsize];
		root[0..2].copy_from_slice(&1u16.to_be_bytes());
		root[2..4].copy_from_slice(&(nleaves as u16).to_be_bytes());
		let ptr_base = 4 + maxrecs * 8;
		for (li, chunk) in extents.chunks(per_leaf).enumerate() {
			let koff = 4 + li * 8;
			root[koff..koff + 8].copy_from_slice(&chunk[0].startoff.to_be_bytes());
			let poff = ptr_base + li * 8;
			root[poff..poff + 8].copy_from_slice(&leaves[li].to_be_bytes());
		}

		ino.data = Fork::Btree {
			extents,
			blocks: leaves,
			root,
		};
		Ok(())
	}

	/// Drop every data-fork mapping at or past `first_gone` file blocks,
	/// splitting a straddling extent.  Freed space is deferred to commit.
	pub(crate) fn shrink_extents(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &mut Inode,
		first_gone: XfsFileoff,
	) -> IoResult<()> {
		let mut freed = 0u64;
		{
			let extents = fork_extents_mut(&mut ino.data);
			let mut keep = Vec::with_capacity(extents.len());
			for e in extents.iter() {
				if e.end_off() <= first_gone {
					keep.push(*e);
				} else if e.startoff >= first_gone {
					tx.defer_free(e.startblock, e.blockcount);
					freed += e.blockcount;
				} else {
					let head = first_gone - e.startoff;
					keep.push(Extent {
						blockcount: head,
						..*e
					});
					tx.defer_free(e.startblock + head, e.blockcount - head);
					freed += e.blockcount - head;
				}
			}
			*extents = keep;
		}
		ino.nblocks -= freed;
		self.fork_writeback(tx, inr, ino)
	}

	/// Unmap `[off, off+len)` file blocks, freeing the disk space and
	/// splitting straddling extents.  Used by directory shrinking.
	pub(crate) fn punch_range(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &mut Inode,
		off: XfsFileoff,
		len: u64,
	) -> IoResult<()> {
		let end = off + len;
		let mut freed = 0u64;
		{
			let extents = fork_extents_mut(&mut ino.data);
			let mut keep = Vec::with_capacity(extents.len());
			for e in extents.iter() {
				if e.end_off() <= off || e.startoff >= end {
					keep.push(*e);
					continue;
				}
				let cut_from = e.startoff.max(off);
				let cut_to = e.end_off().min(end);
				if cut_from > e.startoff {
					keep.push(Extent {
						blockcount: cut_from - e.startoff,
						..*e
					});
				}
				tx.defer_free(e.startblock + (cut_from - e.startoff), cut_to - cut_from);
				freed += cut_to - cut_from;
				if cut_to < e.end_off() {
					keep.push(Extent {
						startoff:   cut_to,
						startblock: e.startblock + (cut_to - e.startoff),
						blockcount: e.end_off() - cut_to,
						unwritten:  e.unwritten,
					});
				}
			}
			*extents = keep;
		}
		ino.nblocks -= freed;
		self.fork_writeback(tx, inr, ino)
	}

	/// Release every block owned by the inode (data extents, attribute
	/// extents, and any btree blocks of both forks).
	pub(crate) fn free_all_blocks(&mut self, tx: &mut Trans, ino: &mut Inode) -> IoResult<()> {
		for fork in [&ino.data, &ino.attr] {
			for e in fork.extents() {
				tx.defer_free(e.startblock, e.blockcount);
			}
			if let Fork::Btree {
				blocks, ..
			} = fork
			{
				for b in blocks {
					tx.defer_free(*b, 1);
				}
			}
		}
		ino.data = Fork::Extents(Vec::new());
		ino.attr = Fork::None;
		ino.nblocks = 0;
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn ext(startoff: u64, startblock: u64, blockcount: u64) -> Extent {
		Extent {
			startoff,
			startblock,
			blockcount,
			unwritten: false,
		}
	}

	#[test]
	fn extent_at_finds_holes() {
		let list = vec![ext(0, 100, 2), ext(5, 200, 3)];
		assert_eq!(extent_at(&list, 0), Some(&list[0]));
		assert_eq!(extent_at(&list, 1), Some(&list[0]));
		assert_eq!(extent_at(&list, 2), None);
		assert_eq!(extent_at(&list, 5), Some(&list[1]));
		assert_eq!(extent_at(&list, 7), Some(&list[1]));
		assert_eq!(extent_at(&list, 8), None);
	}

	#[test]
	fn insert_coalesces_both_sides() {
		let mut list = vec![ext(0, 100, 2), ext(3, 103, 2)];
		insert_extent(&mut list, ext(2, 102, 1));
		assert_eq!(list, vec![ext(0, 100, 5)]);
	}

	#[test]
	fn insert_keeps_discontiguous_apart() {
		let mut list = vec![ext(0, 100, 2)];
		insert_extent(&mut list, ext(10, 500, 4));
		assert_eq!(list.len(), 2);
		assert_eq!(list[1], ext(10, 500, 4));
	}

	#[test]
	fn insert_merges_left_only_when_disk_contiguous() {
		let mut list = vec![ext(0, 100, 2)];
		// file-contiguous but not disk-contiguous
		insert_extent(&mut list, ext(2, 900, 1));
		assert_eq!(list.len(), 2);
	}
}
