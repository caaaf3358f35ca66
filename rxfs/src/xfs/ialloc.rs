//! Inode slot allocation: AGI headers plus the inobt (and finobt when the
//! volume carries one) of 64-slot chunk records.

use std::io::Result as IoResult;

use super::{
	btree::{BtKind, InoRec},
	buf::BufKind,
	*,
};
use crate::{decoder, err};

impl<R: Backend> Xfs<R> {
	/// Read the AGI of an AG under the transaction.
	pub(crate) fn agi(&mut self, tx: &mut Trans, agno: XfsAgnumber) -> IoResult<(usize, Agi)> {
		let pos = self.superblock.agi_byte(agno);
		let len = self.superblock.sectsize as usize;
		let bi = self.trans_read_buf(tx, pos, len, BufKind::Agi)?;
		let agi: Agi = decoder::decode_slice(tx.buf(bi))?;
		if agi.magicnum != XFS_AGI_MAGIC || agi.seqno != agno {
			log::error!("AGI {agno} is corrupt");
			return Err(err!(EIO));
		}
		Ok((bi, agi))
	}

	pub(crate) fn agi_update(&mut self, tx: &mut Trans, bi: usize, agi: &Agi) -> IoResult<()> {
		decoder::encode_slice(tx.buf_mut(bi), agi)?;
		tx.log_buf_full(bi);
		Ok(())
	}

	fn sparse(&self) -> bool {
		self.superblock.incompat().contains(SbIncompat::SPINODES)
	}

	/// First usable free slot of a chunk record, skipping sparse holes.
	fn first_free_slot(rec: &InoRec) -> Option<u32> {
		for i in 0..INODES_PER_CHUNK as u32 {
			if rec.holemask & (1 << (i / 4)) != 0 {
				continue;
			}
			if rec.free & (1 << i) != 0 {
				return Some(i);
			}
		}
		None
	}

	/// Allocate an inode slot, preferring the hint's AG.  Returns the new
	/// inode number; the caller initializes and logs the inode itself.
	pub(crate) fn ialloc(&mut self, tx: &mut Trans, hint: InodeNum) -> IoResult<InodeNum> {
		let agcount = self.superblock.agcount;
		let hint_ag = self
			.superblock
			.ino_to_agno(hint.get())
			.min(agcount - 1);

		if self.superblock.icount >= self.superblock.max_icount()
			&& self.superblock.ifree == 0
		{
			return Err(err!(ENOSPC));
		}

		for i in 0..agcount {
			let agno = (hint_ag + i) % agcount;
			if let Some(inr) = self.ialloc_ag(tx, agno)? {
				return Ok(inr);
			}
		}
		Err(err!(ENOSPC))
	}

	fn ialloc_ag(&mut self, tx: &mut Trans, agno: XfsAgnumber) -> IoResult<Option<InodeNum>> {
		let sparse = self.sparse();

		// a chunk with free slots, via the finobt when there is one
		let kind = if self.superblock.has_finobt() {
			BtKind::Fino
		} else {
			BtKind::Ino
		};
		let mut found: Option<InoRec> = None;
		if let Some(mut cur) = self.bt_lookup_ge(tx, agno, kind, &[0u8; 4])? {
			loop {
				let rec = InoRec::decode(&self.bt_get_rec(tx, &cur), sparse);
				if rec.freecount > 0 && Self::first_free_slot(&rec).is_some() {
					found = Some(rec);
					break;
				}
				if !self.bt_next(tx, &mut cur)? {
					break;
				}
			}
		}

		let rec = match found {
			Some(rec) => rec,
			None => match self.ialloc_new_chunk(tx, agno)? {
				Some(rec) => rec,
				None => return Ok(None),
			},
		};

		let slot = Self::first_free_slot(&rec).expect("record has a free slot");
		let mut newrec = rec;
		newrec.free &= !(1u64 << slot);
		newrec.freecount -= 1;

		// inobt always tracks the chunk
		let cur = self
			.bt_lookup_ge(tx, agno, BtKind::Ino, &rec.startino.to_be_bytes())?
			.ok_or_else(|| err!(EIO))?;
		self.bt_update(tx, &cur, &newrec.encode(sparse))?;

		if self.superblock.has_finobt() {
			let cur = self
				.bt_lookup_ge(tx, agno, BtKind::Fino, &rec.startino.to_be_bytes())?
				.ok_or_else(|| err!(EIO))?;
			let frec = InoRec::decode(&self.bt_get_rec(tx, &cur), sparse);
			if frec.startino != rec.startino {
				log::error!("finobt out of sync with inobt in AG {agno}");
				return Err(err!(EIO));
			}
			if newrec.freecount == 0 {
				self.bt_delete(tx, &cur)?;
			} else {
				self.bt_update(tx, &cur, &newrec.encode(sparse))?;
			}
		}

		let (agi_bi, mut agi) = self.agi(tx, agno)?;
		agi.freecount -= 1;
		self.agi_update(tx, agi_bi, &agi)?;
		tx.sb_ifree -= 1;

		let agino = rec.startino + slot;
		let ino = self.superblock.agino_to_ino(agno, agino);
		log::trace!("ialloc(ag={agno}) = {ino}");
		Ok(InodeNum::new(ino))
	}

	/// Carve a fresh, fully-free inode chunk out of the AG and hook it
	/// into the trees.
	fn ialloc_new_chunk(
		&mut self,
		tx: &mut Trans,
		agno: XfsAgnumber,
	) -> IoResult<Option<InoRec>> {
		let sb = &self.superblock;
		let blocks = sb.chunk_blocks();
		let align = sb.inoalignmt.max(1);
		if self.superblock.icount + INODES_PER_CHUNK as u64 > self.superblock.max_icount() {
			return Ok(None);
		}

		// the chunk must live in this AG for its record to index it
		let hint = self.superblock.agb_to_fsb(agno, 0);
		let Ok((fsbno, got)) = self.alloc_extent(tx, hint, blocks, blocks, align) else {
			return Ok(None);
		};
		assert_eq!(got, blocks);
		let (chunk_ag, agbno) = self.superblock.fsb_to_agb(fsbno);
		if chunk_ag != agno {
			// allocator fell over to another AG; undo and give up here
			tx.defer_free(fsbno, blocks);
			return Ok(None);
		}

		// initialize every slot on disk
		let bs = self.superblock.blocksize as usize;
		let isize = self.superblock.inodesize as usize;
		let ag_base = self.superblock.ag_byte(agno);
		let blocklog = self.superblock.blocklog;
		let startino = (agbno as u64) << self.superblock.inopblog;
		for blk in 0..blocks {
			let pos = ag_base + ((agbno as u64 + blk) << blocklog);
			let bi = self.trans_get_buf(tx, pos, bs, BufKind::InodeBlock);
			for slot in 0..(bs / isize) {
				let agino = startino + blk * (bs / isize) as u64 + slot as u64;
				let ino = self.superblock.agino_to_ino(agno, agino as u32);
				let off = slot * isize;
				init_inode_record(&mut tx.buf_mut(bi)[off..off + isize], &self.superblock, ino);
			}
			tx.log_buf_full(bi);
		}

		let rec = InoRec {
			startino:  startino as u32,
			holemask:  0,
			count:     INODES_PER_CHUNK as u8,
			freecount: INODES_PER_CHUNK as u8,
			free:      u64::MAX,
		};
		let sparse = self.sparse();
		self.bt_insert(tx, agno, BtKind::Ino, &rec.encode(sparse))?;
		if self.superblock.has_finobt() {
			self.bt_insert(tx, agno, BtKind::Fino, &rec.encode(sparse))?;
		}

		let (agi_bi, mut agi) = self.agi(tx, agno)?;
		agi.count += INODES_PER_CHUNK as u32;
		agi.freecount += INODES_PER_CHUNK as u32;
		agi.newino = rec.startino;
		self.agi_update(tx, agi_bi, &agi)?;
		tx.sb_icount += INODES_PER_CHUNK as i64;
		tx.sb_ifree += INODES_PER_CHUNK as i64;
		Ok(Some(rec))
	}

	/// Return an inode slot to its chunk.  Chunks are kept allocated even
	/// when they become fully free.
	pub(crate) fn ifree(&mut self, tx: &mut Trans, inr: InodeNum) -> IoResult<()> {
		let sparse = self.sparse();
		let agno = self.superblock.ino_to_agno(inr.get());
		let agino = self.superblock.ino_to_agino(inr.get());
		log::trace!("ifree({inr});");

		let cur = self
			.bt_lookup_le(tx, agno, BtKind::Ino, &agino.to_be_bytes())?
			.ok_or_else(|| err!(EIO))?;
		let rec = InoRec::decode(&self.bt_get_rec(tx, &cur), sparse);
		let slot = agino.checked_sub(rec.startino).ok_or_else(|| err!(EIO))?;
		if slot >= rec.count as u32 {
			log::error!("ifree({inr}): inode is outside its chunk record");
			return Err(err!(EIO));
		}
		if rec.free & (1 << slot) != 0 {
			log::error!("ifree({inr}): double free");
			return Err(err!(EIO));
		}

		let mut newrec = rec;
		newrec.free |= 1 << slot;
		newrec.freecount += 1;
		self.bt_update(tx, &cur, &newrec.encode(sparse))?;

		if self.superblock.has_finobt() {
			match self.bt_lookup_ge(tx, agno, BtKind::Fino, &rec.startino.to_be_bytes())? {
				Some(fcur) => {
					let frec = InoRec::decode(&self.bt_get_rec(tx, &fcur), sparse);
					if frec.startino == rec.startino {
						self.bt_update(tx, &fcur, &newrec.encode(sparse))?;
					} else {
						self.bt_insert(tx, agno, BtKind::Fino, &newrec.encode(sparse))?;
					}
				}
				None => {
					self.bt_insert(tx, agno, BtKind::Fino, &newrec.encode(sparse))?;
				}
			}
		}

		let (agi_bi, mut agi) = self.agi(tx, agno)?;
		agi.freecount += 1;
		self.agi_update(tx, agi_bi, &agi)?;
		tx.sb_ifree += 1;
		Ok(())
	}
}

/// Write a freshly-allocated (mode 0) dinode skeleton.
pub(crate) fn init_inode_record(buf: &mut [u8], sb: &Superblock, ino: u64) {
	buf.fill(0);
	buf[0..2].copy_from_slice(&XFS_DINODE_MAGIC.to_be_bytes());
	// mode 0, format 0
	let version: u8 = if sb.is_v5() { 3 } else { 2 };
	buf[4] = version;
	buf[5] = XFS_DINODE_FMT_EXTENTS;
	buf[DINODE_NEXT_UNLINKED_OFF..DINODE_NEXT_UNLINKED_OFF + 4]
		.copy_from_slice(&NULLAGINO.to_be_bytes());
	if sb.is_v5() {
		buf[152..160].copy_from_slice(&ino.to_be_bytes());
		buf[160..176].copy_from_slice(sb.meta_uuid().as_bytes());
		crate::cksum::update(buf, DINODE_CRC_OFF);
	}
}
