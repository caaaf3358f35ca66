use std::{io::Result as IoResult, mem::take};

use bitflags::bitflags;

use super::{buf::BufKind, *};
use crate::{cksum, err};

bitflags! {
	/// Field classes an operation may dirty on an inode.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub(crate) struct LogFlags: u32 {
		const CORE = 1 << 0;
		const DDATA = 1 << 1;
		const DEXT = 1 << 2;
		const DBROOT = 1 << 3;
		const DEV = 1 << 4;
		const ADATA = 1 << 5;
		const AEXT = 1 << 6;
		const ABROOT = 1 << 7;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransState {
	Allocated,
	Reserved,
	Committing,
	Committed,
	Aborted,
}

pub(crate) struct TransBuf {
	pub pos:  u64,
	pub data: Vec<u8>,
	pub kind: BufKind,
	/// Dirtied byte range, or `None` while only pinned for reading.
	pub logged: Option<(usize, usize)>,
}

struct TransInode {
	inr:    InodeNum,
	inode:  Inode,
	logged: LogFlags,
}

/// The ACID boundary of one metadata mutation.
///
/// All mutation happens on staged copies owned by the transaction; the
/// shared caches and the backing store see nothing until commit, so
/// cancel (and drop) revert by simply discarding the staging area.
pub(crate) struct Trans {
	kind:   &'static str,
	state:  TransState,
	blocks: u64,
	logres: u32,
	bufs:   Vec<TransBuf>,
	inodes: Vec<TransInode>,
	/// Extent frees deferred to the commit's finish step.
	frees: Vec<(XfsFsblock, u64)>,
	/// Inodes to drop from the caches once the commit lands.
	pub(crate) drop_inodes: Vec<InodeNum>,
	// superblock counter deltas
	pub(crate) sb_fdblocks: i64,
	pub(crate) sb_icount:   i64,
	pub(crate) sb_ifree:    i64,
}

impl Trans {
	pub fn find_buf(&self, pos: u64) -> Option<usize> {
		self.bufs.iter().position(|b| b.pos == pos)
	}

	pub fn buf(&self, bi: usize) -> &[u8] {
		&self.bufs[bi].data
	}

	pub fn buf_mut(&mut self, bi: usize) -> &mut Vec<u8> {
		&mut self.bufs[bi].data
	}

	/// Record that bytes `[first..=last]` of a pinned buffer are dirty.
	pub fn log_buf(&mut self, bi: usize, first: usize, last: usize) {
		let b = &mut self.bufs[bi];
		b.logged = match b.logged {
			None => Some((first, last)),
			Some((f, l)) => Some((f.min(first), l.max(last))),
		};
	}

	pub fn log_buf_full(&mut self, bi: usize) {
		let len = self.bufs[bi].data.len();
		self.log_buf(bi, 0, len - 1);
	}

	/// Pin an in-core inode to this transaction.  No-op if already joined.
	pub fn join_inode(&mut self, inr: InodeNum, inode: Inode) {
		assert_eq!(self.state, TransState::Reserved, "{}: join before reserve", self.kind);
		if self.inodes.iter().any(|ti| ti.inr == inr) {
			return;
		}
		self.inodes.push(TransInode {
			inr,
			inode,
			logged: LogFlags::empty(),
		});
	}

	pub fn log_inode(&mut self, inr: InodeNum, flags: LogFlags) {
		let ti = self
			.inodes
			.iter_mut()
			.find(|ti| ti.inr == inr)
			.expect("inode was not joined to the transaction");
		ti.logged |= flags;
	}

	/// Queue an extent free; performed at commit, after all other staging.
	pub fn defer_free(&mut self, fsbno: XfsFsblock, len: u64) {
		assert_eq!(self.state, TransState::Reserved);
		self.frees.push((fsbno, len));
	}
}

impl Drop for Trans {
	fn drop(&mut self) {
		if matches!(self.state, TransState::Allocated | TransState::Reserved) {
			// Dropping an uncommitted transaction is the caller's bug, but
			// nothing was applied, so it degrades to an abort.
			log::warn!("transaction {:?} dropped without commit or cancel", self.kind);
		}
	}
}

/// Block reservations per operation, derived from the mount geometry.
/// Deliberately generous; reservation failure is ENOSPC up front.
pub(crate) struct Reservation;

impl Reservation {
	/// Directory growth: a few directory blocks plus leaf/free blocks.
	fn dir_grow(sb: &Superblock) -> u64 {
		4 * sb.dirblkfsbs() + 4
	}

	pub fn create(sb: &Superblock) -> u64 {
		sb.chunk_blocks() + Self::dir_grow(sb)
	}

	pub fn mkdir(sb: &Superblock) -> u64 {
		sb.chunk_blocks() + Self::dir_grow(sb)
	}

	pub fn symlink(sb: &Superblock) -> u64 {
		sb.chunk_blocks() + Self::dir_grow(sb) + SYMLINK_MAXLEN as u64 / sb.blocksize as u64 + 1
	}

	pub fn link(sb: &Superblock) -> u64 {
		Self::dir_grow(sb)
	}

	pub fn remove(_sb: &Superblock) -> u64 {
		0
	}

	pub fn rename(sb: &Superblock) -> u64 {
		2 * Self::dir_grow(sb)
	}

	pub fn setattr(_sb: &Superblock) -> u64 {
		0
	}

	pub fn truncate(_sb: &Superblock) -> u64 {
		0
	}

	pub fn write(_sb: &Superblock, blocks: u64) -> u64 {
		// data blocks plus possible bmbt leaves
		blocks + blocks / 128 + 2
	}
}

impl<R: Backend> Xfs<R> {
	pub(crate) fn trans_alloc(&self, kind: &'static str) -> Trans {
		log::trace!("trans_alloc({kind});");
		Trans {
			kind,
			state: TransState::Allocated,
			blocks: 0,
			logres: 0,
			bufs: Vec::new(),
			inodes: Vec::new(),
			frees: Vec::new(),
			drop_inodes: Vec::new(),
			sb_fdblocks: 0,
			sb_icount: 0,
			sb_ifree: 0,
		}
	}

	/// Reserve space for a transaction.  Fails with ENOSPC when the free
	/// counter cannot cover the worst case; the caller cancels.
	pub(crate) fn trans_reserve(&self, tx: &mut Trans, blocks: u64, logres: u32) -> IoResult<()> {
		assert_eq!(tx.state, TransState::Allocated, "{}: double reserve", tx.kind);
		if blocks > self.superblock.fdblocks {
			return Err(err!(ENOSPC));
		}
		tx.blocks = blocks;
		tx.logres = logres;
		tx.state = TransState::Reserved;
		Ok(())
	}

	/// Pin the buffer at `pos` to the transaction, reading it through the
	/// verified path on first touch.  Returns its index in the pinned set.
	pub(crate) fn trans_read_buf(
		&mut self,
		tx: &mut Trans,
		pos: u64,
		len: usize,
		kind: BufKind,
	) -> IoResult<usize> {
		assert_eq!(tx.state, TransState::Reserved);
		if let Some(bi) = tx.find_buf(pos) {
			assert_eq!(tx.bufs[bi].data.len(), len, "buffer length mismatch at {pos:#x}");
			return Ok(bi);
		}
		let data = self.read_buf(pos, len, kind)?;
		tx.bufs.push(TransBuf {
			pos,
			data,
			kind,
			logged: None,
		});
		Ok(tx.bufs.len() - 1)
	}

	/// Pin a fresh (just-allocated) buffer without reading the store.
	pub(crate) fn trans_get_buf(
		&mut self,
		tx: &mut Trans,
		pos: u64,
		len: usize,
		kind: BufKind,
	) -> usize {
		assert_eq!(tx.state, TransState::Reserved);
		if let Some(bi) = tx.find_buf(pos) {
			assert_eq!(tx.bufs[bi].data.len(), len);
			tx.bufs[bi].kind = kind;
			tx.bufs[bi].data.fill(0);
			return bi;
		}
		tx.bufs.push(TransBuf {
			pos,
			data: vec![0u8; len],
			kind,
			logged: None,
		});
		tx.bufs.len() - 1
	}

	/// Commit: finish deferred work, write logged deltas with fresh V5
	/// checksums, persist counter changes, release all pins.
	pub(crate) fn trans_commit(&mut self, mut tx: Trans) -> IoResult<()> {
		log::trace!(
			"trans_commit({}): res {} blocks / {} log bytes",
			tx.kind,
			tx.blocks,
			tx.logres
		);
		assert!(
			matches!(tx.state, TransState::Reserved),
			"{}: commit from state {:?}",
			tx.kind,
			tx.state
		);
		tx.state = TransState::Committing;

		// finish the allocator's deferred frees
		let frees = take(&mut tx.frees);
		for (fsbno, len) in frees {
			self.free_extent_now(&mut tx, fsbno, len)?;
		}

		// re-encode logged inodes into their table blocks
		let inodes = take(&mut tx.inodes);
		for ti in &inodes {
			if !ti.logged.is_empty() {
				self.stage_inode(&mut tx, ti.inr, &ti.inode)?;
			}
		}

		// write logged buffers through, updating V5 checksums
		let v5 = self.superblock.has_crc();
		for b in &mut tx.bufs {
			if b.logged.is_none() {
				continue;
			}
			if v5 {
				if let Some(off) = b.kind.crc_off() {
					cksum::update(&mut b.data, off);
				}
			}
			self.file.write_at(b.pos, &b.data)?;
		}

		// persist superblock counter deltas
		if tx.sb_fdblocks != 0 || tx.sb_icount != 0 || tx.sb_ifree != 0 {
			let sb = &mut self.superblock;
			sb.fdblocks = sb.fdblocks.wrapping_add_signed(tx.sb_fdblocks);
			sb.icount = sb.icount.wrapping_add_signed(tx.sb_icount);
			sb.ifree = sb.ifree.wrapping_add_signed(tx.sb_ifree);
			self.write_superblock()?;
		}

		self.sync()?;

		// the shared caches may now observe the new state
		#[cfg(feature = "icache")]
		{
			for ti in inodes {
				if ti.logged.is_empty() {
					continue;
				}
				self.icache.put(ti.inr, ti.inode);
			}
			for inr in take(&mut tx.drop_inodes) {
				self.icache.pop(&inr);
			}
		}
		#[cfg(not(feature = "icache"))]
		drop(inodes);

		tx.state = TransState::Committed;
		Ok(())
	}

	/// Abort: discard all staged state.  Nothing was applied, so nothing
	/// needs reverting.  Idempotent.
	pub(crate) fn trans_cancel(&mut self, mut tx: Trans) {
		log::trace!("trans_cancel({});", tx.kind);
		tx.state = TransState::Aborted;
		tx.bufs.clear();
		tx.inodes.clear();
		tx.frees.clear();
	}
}
