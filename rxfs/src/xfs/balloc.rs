//! The space allocator facade: contiguous extent allocation and free over
//! the per-AG free-space B+trees, with the AGFL feeding btree growth.

use std::io::Result as IoResult;

use super::{
	btree::{AllocRec, BtKind},
	buf::BufKind,
	*,
};
use crate::{decoder, err};

impl<R: Backend> Xfs<R> {
	/// Read the AGF of an AG under the transaction.
	pub(crate) fn agf(&mut self, tx: &mut Trans, agno: XfsAgnumber) -> IoResult<(usize, Agf)> {
		let pos = self.superblock.agf_byte(agno);
		let len = self.superblock.sectsize as usize;
		let bi = self.trans_read_buf(tx, pos, len, BufKind::Agf)?;
		let agf: Agf = decoder::decode_slice(tx.buf(bi))?;
		if agf.magicnum != XFS_AGF_MAGIC || agf.seqno != agno {
			log::error!("AGF {agno} is corrupt");
			return Err(err!(EIO));
		}
		Ok((bi, agf))
	}

	pub(crate) fn agf_update(&mut self, tx: &mut Trans, bi: usize, agf: &Agf) -> IoResult<()> {
		decoder::encode_slice(tx.buf_mut(bi), agf)?;
		tx.log_buf_full(bi);
		Ok(())
	}

	/// Pop one block off the AG free list for btree growth.
	pub(crate) fn agfl_pop(&mut self, tx: &mut Trans, agno: XfsAgnumber) -> IoResult<XfsAgblock> {
		let (agf_bi, mut agf) = self.agf(tx, agno)?;
		if agf.flcount == 0 {
			log::error!("AG {agno} free list is empty");
			return Err(err!(ENOSPC));
		}
		let sb = &self.superblock;
		let hdr = if sb.is_v5() { AGFL_HDR_SIZE_V5 } else { 0 };
		let size = sb.agfl_size() as u32;
		let pos = sb.agfl_byte(agno);
		let len = sb.sectsize as usize;
		let fl_bi = self.trans_read_buf(tx, pos, len, BufKind::Agfl)?;

		let off = hdr + agf.flfirst as usize * 4;
		let bno = u32::from_be_bytes(tx.buf(fl_bi)[off..off + 4].try_into().unwrap());
		agf.flfirst = (agf.flfirst + 1) % size;
		agf.flcount -= 1;
		agf.btreeblks += 1;
		self.agf_update(tx, agf_bi, &agf)?;
		log::trace!("agfl_pop({agno}) = {bno}");
		Ok(bno)
	}

	/// Return a btree block to the AG free list; overflows spill into the
	/// free-space trees instead.
	pub(crate) fn agfl_push(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
		bno: XfsAgblock,
	) -> IoResult<()> {
		let (agf_bi, mut agf) = self.agf(tx, agno)?;
		let size = self.superblock.agfl_size() as u32;
		if agf.flcount >= size {
			tx.defer_free(self.superblock.agb_to_fsb(agno, bno), 1);
			return Ok(());
		}
		let sb = &self.superblock;
		let hdr = if sb.is_v5() { AGFL_HDR_SIZE_V5 } else { 0 };
		let pos = sb.agfl_byte(agno);
		let len = sb.sectsize as usize;
		let fl_bi = self.trans_read_buf(tx, pos, len, BufKind::Agfl)?;

		agf.fllast = (agf.fllast + 1) % size;
		let off = hdr + agf.fllast as usize * 4;
		tx.buf_mut(fl_bi)[off..off + 4].copy_from_slice(&bno.to_be_bytes());
		tx.log_buf_full(fl_bi);
		agf.flcount += 1;
		agf.btreeblks = agf.btreeblks.saturating_sub(1);
		self.agf_update(tx, agf_bi, &agf)
	}

	/// Largest free extent currently recorded in the AG.
	fn ag_longest(&mut self, tx: &mut Trans, agno: XfsAgnumber) -> IoResult<u32> {
		let max = AllocRec {
			bno: u32::MAX,
			len: u32::MAX,
		}
		.encode();
		match self.bt_lookup_le(tx, agno, BtKind::Cnt, &max)? {
			Some(cur) => Ok(AllocRec::decode(&self.bt_get_rec(tx, &cur)).len),
			None => Ok(0),
		}
	}

	/// Carve `[bno, bno+take)` out of the free record `rec`, maintaining
	/// both trees and the AGF counters.
	fn cut_from_record(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
		rec: AllocRec,
		bno: XfsAgblock,
		take: XfsExtlen,
	) -> IoResult<()> {
		assert!(bno >= rec.bno && bno + take <= rec.bno + rec.len);

		// remove the old record from both trees
		for kind in [BtKind::Bno, BtKind::Cnt] {
			let cur = self
				.bt_lookup_ge(tx, agno, kind, &rec.encode())?
				.ok_or_else(|| err!(EIO))?;
			let found = AllocRec::decode(&self.bt_get_rec(tx, &cur));
			if found != rec {
				log::error!("free-space trees disagree in AG {agno}: {found:?} != {rec:?}");
				return Err(err!(EIO));
			}
			self.bt_delete(tx, &cur)?;
		}

		// put back what we did not take
		let left = AllocRec {
			bno: rec.bno,
			len: bno - rec.bno,
		};
		let right = AllocRec {
			bno: bno + take,
			len: rec.bno + rec.len - (bno + take),
		};
		for rem in [left, right] {
			if rem.len == 0 {
				continue;
			}
			self.bt_insert(tx, agno, BtKind::Bno, &rem.encode())?;
			self.bt_insert(tx, agno, BtKind::Cnt, &rem.encode())?;
		}

		let (agf_bi, mut agf) = self.agf(tx, agno)?;
		agf.freeblks -= take;
		agf.longest = self.ag_longest(tx, agno)?;
		self.agf_update(tx, agf_bi, &agf)?;
		tx.sb_fdblocks -= take as i64;
		Ok(())
	}

	/// Allocate up to `maxlen` contiguous blocks in one AG.  Returns the
	/// extent found, which may be shorter than `maxlen` but never shorter
	/// than `minlen`.
	fn alloc_in_ag(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
		minlen: XfsExtlen,
		maxlen: XfsExtlen,
		align: u32,
	) -> IoResult<Option<(XfsAgblock, XfsExtlen)>> {
		let want = AllocRec {
			bno: 0,
			len: maxlen,
		}
		.encode();

		// prefer the first size-fit record; otherwise take the largest
		let mut cur = match self.bt_lookup_ge(tx, agno, BtKind::Cnt, &want)? {
			Some(cur) => cur,
			None => {
				let max = AllocRec {
					bno: u32::MAX,
					len: u32::MAX,
				}
				.encode();
				match self.bt_lookup_le(tx, agno, BtKind::Cnt, &max)? {
					Some(cur) => cur,
					None => return Ok(None),
				}
			}
		};

		loop {
			let rec = AllocRec::decode(&self.bt_get_rec(tx, &cur));
			let aligned = rec.bno.next_multiple_of(align.max(1));
			let waste = aligned - rec.bno;
			if rec.len > waste && rec.len - waste >= minlen {
				let take = (rec.len - waste).min(maxlen);
				self.cut_from_record(tx, agno, rec, aligned, take)?;
				return Ok(Some((aligned, take)));
			}
			// alignment ate the fit; walk up the size order
			if !self.bt_next(tx, &mut cur)? {
				return Ok(None);
			}
		}
	}

	/// Allocate a contiguous extent of `[minlen, maxlen]` blocks, starting
	/// the search at the hint's AG.  ENOSPC when no AG can satisfy
	/// `minlen`.
	pub(crate) fn alloc_extent(
		&mut self,
		tx: &mut Trans,
		hint: XfsFsblock,
		minlen: u64,
		maxlen: u64,
		align: u32,
	) -> IoResult<(XfsFsblock, u64)> {
		assert!(minlen > 0 && minlen <= maxlen);
		let agcount = self.superblock.agcount;
		let hint_ag = self.superblock.fsb_to_agb(hint).0.min(agcount - 1);
		let minlen32 = minlen.min(u32::MAX as u64) as u32;
		let maxlen32 = maxlen.min((1 << 20) as u64) as u32;

		for i in 0..agcount {
			let agno = (hint_ag + i) % agcount;
			if let Some((agbno, got)) = self.alloc_in_ag(tx, agno, minlen32, maxlen32, align)? {
				let fsbno = self.superblock.agb_to_fsb(agno, agbno);
				log::trace!("alloc_extent(min={minlen}, max={maxlen}) = ({fsbno:#x}, {got})");
				return Ok((fsbno, got as u64));
			}
		}
		Err(err!(ENOSPC))
	}

	/// Allocate a single block in a specific AG (btree growth).
	pub(crate) fn alloc_ag_block(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
	) -> IoResult<XfsFsblock> {
		match self.alloc_in_ag(tx, agno, 1, 1, 1)? {
			Some((agbno, _)) => Ok(self.superblock.agb_to_fsb(agno, agbno)),
			None => Err(err!(ENOSPC)),
		}
	}

	/// Give an extent back, coalescing with its neighbors.  Runs at
	/// commit time via the transaction's deferred-free queue.
	pub(crate) fn free_extent_now(
		&mut self,
		tx: &mut Trans,
		fsbno: XfsFsblock,
		len: u64,
	) -> IoResult<()> {
		assert!(len > 0);
		let (agno, bno) = self.superblock.fsb_to_agb(fsbno);
		let len = len as u32;
		log::trace!("free_extent_now(ag={agno}, bno={bno}, len={len})");

		let me = AllocRec {
			bno,
			len,
		};

		// neighbor on the left: last record starting at or before us
		let mut merged = me;
		if let Some(cur) = self.bt_lookup_le(tx, agno, BtKind::Bno, &me.encode())? {
			let left = AllocRec::decode(&self.bt_get_rec(tx, &cur));
			if left.bno + left.len > bno {
				log::error!("freeing free space in AG {agno}: {left:?} overlaps {me:?}");
				return Err(err!(EIO));
			}
			if left.bno + left.len == bno {
				self.bt_delete(tx, &cur)?;
				let ccur = self
					.bt_lookup_ge(tx, agno, BtKind::Cnt, &left.encode())?
					.ok_or_else(|| err!(EIO))?;
				self.bt_delete(tx, &ccur)?;
				merged = AllocRec {
					bno: left.bno,
					len: left.len + len,
				};
			}
		}

		// neighbor on the right: first record starting after us
		if let Some(cur) = self.bt_lookup_ge(tx, agno, BtKind::Bno, &me.encode())? {
			let right = AllocRec::decode(&self.bt_get_rec(tx, &cur));
			if right.bno < bno + len {
				log::error!("freeing free space in AG {agno}: {right:?} overlaps {me:?}");
				return Err(err!(EIO));
			}
			if right.bno == bno + len {
				self.bt_delete(tx, &cur)?;
				let ccur = self
					.bt_lookup_ge(tx, agno, BtKind::Cnt, &right.encode())?
					.ok_or_else(|| err!(EIO))?;
				self.bt_delete(tx, &ccur)?;
				merged = AllocRec {
					bno: merged.bno,
					len: merged.len + right.len,
				};
			}
		}

		self.bt_insert(tx, agno, BtKind::Bno, &merged.encode())?;
		self.bt_insert(tx, agno, BtKind::Cnt, &merged.encode())?;

		let (agf_bi, mut agf) = self.agf(tx, agno)?;
		agf.freeblks += len;
		agf.longest = agf.longest.max(merged.len);
		self.agf_update(tx, agf_bi, &agf)?;
		tx.sb_fdblocks += len as i64;
		Ok(())
	}
}
