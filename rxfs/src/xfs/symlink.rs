use std::io::Result as IoResult;

use super::{buf::BufKind, *};
use crate::err;

impl<R: Backend> Xfs<R> {
	/// Read the contents of a symbolic link.
	#[doc(alias = "readlink")]
	pub fn symlink_read(&mut self, inr: InodeNum) -> IoResult<Vec<u8>> {
		let ino = self.iget(inr)?;
		if !ino.is_symlink() {
			return Err(err!(EINVAL));
		}
		let len = ino.size as usize;
		if len == 0 || len > SYMLINK_MAXLEN {
			log::error!("symlink {inr} has a bad length {len}");
			return Err(err!(EIO));
		}

		match &ino.data {
			Fork::Local(body) => {
				if body.len() < len {
					return Err(err!(EIO));
				}
				Ok(body[0..len].to_vec())
			}
			_ => {
				let sb = &self.superblock;
				let bs = sb.blocksize as usize;
				let hdr = if sb.is_v5() { SYMLINK_HDR_LEN } else { 0 };
				let per_block = bs - hdr;
				let mut out = Vec::with_capacity(len);
				for e in ino.data.extents() {
					for i in 0..e.blockcount {
						let pos = self.superblock.fsb_to_byte(e.startblock + i);
						let blk = self.read_buf(pos, bs, BufKind::Symlink)?;
						let take = per_block.min(len - out.len());
						out.extend_from_slice(&blk[hdr..hdr + take]);
						if out.len() == len {
							return Ok(out);
						}
					}
				}
				if out.len() != len {
					log::error!("symlink {inr} is shorter than its inode claims");
					return Err(err!(EIO));
				}
				Ok(out)
			}
		}
	}

	/// Store a link body: inline while it fits the fork, otherwise in
	/// freshly-allocated remote blocks.
	pub(crate) fn symlink_store(
		&mut self,
		tx: &mut Trans,
		inr: InodeNum,
		ino: &mut Inode,
		target: &[u8],
	) -> IoResult<()> {
		let cap = super::inode::data_fork_size(&self.superblock, ino.version, ino.forkoff);
		ino.size = target.len() as u64;
		if target.len() <= cap {
			ino.data = Fork::Local(target.to_vec());
			return Ok(());
		}

		let sb = &self.superblock;
		let bs = sb.blocksize as usize;
		let v5 = sb.is_v5();
		let hdr = if v5 { SYMLINK_HDR_LEN } else { 0 };
		let per_block = bs - hdr;
		let nblocks = target.len().div_ceil(per_block) as u64;

		let agno = self.superblock.ino_to_agno(inr.get());
		let hint = self.superblock.agb_to_fsb(agno, 0);
		let mut mapped = 0u64;
		while mapped < nblocks {
			let (fsbno, got) = self.alloc_extent(tx, hint, 1, nblocks - mapped, 1)?;
			super::bmap::fork_insert_for_dir(ino, mapped, fsbno, got);
			mapped += got;
		}
		ino.nblocks += nblocks;

		let uuid = *self.superblock.meta_uuid().as_bytes();
		let extents = ino.data.extents().to_vec();
		let mut written = 0usize;
		for e in &extents {
			for i in 0..e.blockcount {
				let fsbno = e.startblock + i;
				let pos = self.superblock.fsb_to_byte(fsbno);
				let bi = self.trans_get_buf(tx, pos, bs, BufKind::Symlink);
				let take = per_block.min(target.len() - written);
				{
					let buf = tx.buf_mut(bi);
					if v5 {
						buf[0..4].copy_from_slice(&XFS_SYMLINK_MAGIC.to_be_bytes());
						buf[4..8].copy_from_slice(&(written as u32).to_be_bytes());
						buf[8..12].copy_from_slice(&(take as u32).to_be_bytes());
						buf[16..32].copy_from_slice(&uuid);
						buf[32..40].copy_from_slice(&inr.get().to_be_bytes());
						buf[40..48].copy_from_slice(&(pos / 512).to_be_bytes());
					}
					buf[hdr..hdr + take].copy_from_slice(&target[written..written + take]);
				}
				tx.log_buf_full(bi);
				written += take;
				if written == target.len() {
					break;
				}
			}
		}
		self.fork_writeback(tx, inr, ino)
	}
}
