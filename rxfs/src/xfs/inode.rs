//! Dinode decode/encode and the inode cache.

use std::io::{Cursor, Result as IoResult};

use super::{buf::BufKind, *};
use crate::{cksum, err};

/// Byte offset of the data fork within an inode record.
pub(crate) fn literal_off(version: u8) -> usize {
	if version >= 3 {
		DINODE_LITERAL_V3
	} else {
		DINODE_LITERAL_V2
	}
}

/// Size of the data fork region.
pub(crate) fn data_fork_size(sb: &Superblock, version: u8, forkoff: u8) -> usize {
	let total = sb.inodesize as usize - literal_off(version);
	if forkoff == 0 {
		total
	} else {
		forkoff as usize * 8
	}
}

/// Offset and size of the attribute fork region, if any.
fn attr_fork_region(sb: &Superblock, version: u8, forkoff: u8) -> Option<(usize, usize)> {
	if forkoff == 0 {
		return None;
	}
	let off = literal_off(version) + forkoff as usize * 8;
	Some((off, sb.inodesize as usize - off))
}

impl<R: Backend> Xfs<R> {
	/// Get metadata about an inode.
	#[doc(alias("stat", "getattr"))]
	pub fn inode_attr(&mut self, inr: InodeNum) -> IoResult<InodeAttr> {
		log::trace!("inode_attr({inr});");
		let ino = self.iget(inr)?;
		Ok(ino.as_attr(inr, self.superblock.blocksize))
	}

	/// Fetch an in-core inode, through the cache.
	pub(crate) fn iget(&mut self, inr: InodeNum) -> IoResult<Inode> {
		#[cfg(feature = "icache")]
		if let Some(ino) = self.icache.get(&inr) {
			return Ok(ino.clone());
		}
		let ino = self.read_inode_disk(inr)?;
		#[cfg(feature = "icache")]
		self.icache.put(inr, ino.clone());
		Ok(ino)
	}

	fn read_inode_disk(&mut self, inr: InodeNum) -> IoResult<Inode> {
		log::trace!("read_inode_disk({inr});");
		let sb = &self.superblock;
		if sb.ino_to_agno(inr.get()) >= sb.agcount {
			return Err(err!(EINVAL));
		}
		let pos = sb.ino_to_byte(inr.get());
		let isize = sb.inodesize as usize;
		let mut buf = vec![0u8; isize];
		self.file.read_at(pos, &mut buf)?;
		self.decode_dinode(&buf, inr)
	}

	/// Decode a raw dinode record, reading btree fork leaves as needed.
	pub(crate) fn decode_dinode(&mut self, buf: &[u8], inr: InodeNum) -> IoResult<Inode> {
		let magic = u16::from_be_bytes(buf[0..2].try_into().unwrap());
		if magic != XFS_DINODE_MAGIC {
			log::warn!("inode {inr} has a bad magic number {magic:#x}");
			return Err(err!(EIO));
		}
		let version = buf[4];
		if version >= 3 {
			if !self.superblock.is_v5() {
				log::warn!("v3 inode {inr} on a V4 filesystem");
				return Err(err!(EIO));
			}
			if !cksum::verify(buf, DINODE_CRC_OFF) {
				log::error!("filesystem corrupt: inode {inr} failed checksum, read aborted");
				return Err(err!(EIO));
			}
			let stamped = u64::from_be_bytes(buf[152..160].try_into().unwrap());
			if stamped != inr.get() {
				log::error!("inode {inr} claims to be {stamped}");
				return Err(err!(EIO));
			}
		}

		let mut d = crate::decoder::Decoder::new(Cursor::new(buf));
		d.seek(2)?;
		let mode: u16 = d.decode()?;
		let _version: u8 = d.decode()?;
		let format: u8 = d.decode()?;
		let onlink: u16 = d.decode()?;
		let uid: u32 = d.decode()?;
		let gid: u32 = d.decode()?;
		let nlink: u32 = d.decode()?;
		let projid_lo: u16 = d.decode()?;
		let projid_hi: u16 = d.decode()?;
		d.seek_relative(6)?; // pad
		let flushiter: u16 = d.decode()?;
		let atime: Timestamp = d.decode()?;
		let mtime: Timestamp = d.decode()?;
		let ctime: Timestamp = d.decode()?;
		let size: u64 = d.decode()?;
		let nblocks: u64 = d.decode()?;
		let extsize: u32 = d.decode()?;
		let nextents: u32 = d.decode()?;
		let anextents: u16 = d.decode()?;
		let forkoff: u8 = d.decode()?;
		let aformat: u8 = d.decode()?;
		let dmevmask: u32 = d.decode()?;
		let dmstate: u16 = d.decode()?;
		let flags: u16 = d.decode()?;
		let gen: u32 = d.decode()?;
		let next_unlinked: u32 = d.decode()?;

		let (changecount, lsn, flags2, cowextsize, crtime) = if version >= 3 {
			let _crc: u32 = d.decode()?;
			let changecount: u64 = d.decode()?;
			let lsn: i64 = d.decode()?;
			let flags2: u64 = d.decode()?;
			let cowextsize: u32 = d.decode()?;
			d.seek_relative(12)?; // pad2
			let crtime: Timestamp = d.decode()?;
			(changecount, lsn, flags2, cowextsize, crtime)
		} else {
			(0, 0, 0, 0, Timestamp::ZERO)
		};

		if mode & S_IFMT == 0 {
			log::warn!("inode {inr} is not allocated");
			return Err(err!(EINVAL));
		}

		let nlink = if version == 1 { onlink.into() } else { nlink };

		let lit = literal_off(version);
		let dsize = data_fork_size(&self.superblock, version, forkoff);
		let data = self.decode_fork(
			inr,
			&buf[lit..lit + dsize],
			format,
			size,
			nextents as usize,
		)?;

		let attr = match attr_fork_region(&self.superblock, version, forkoff) {
			None => Fork::None,
			Some((off, len)) => {
				self.decode_attr_fork(inr, &buf[off..off + len], aformat, anextents as usize)?
			}
		};

		Ok(Inode {
			version,
			mode,
			nlink,
			uid,
			gid,
			projid: (projid_hi as u32) << 16 | projid_lo as u32,
			flushiter,
			atime,
			mtime,
			ctime,
			crtime,
			size,
			nblocks,
			extsize,
			forkoff,
			dmevmask,
			dmstate,
			flags,
			gen,
			next_unlinked,
			changecount,
			lsn,
			flags2,
			cowextsize,
			data,
			attr,
		})
	}

	fn decode_fork(
		&mut self,
		inr: InodeNum,
		fork: &[u8],
		format: u8,
		size: u64,
		nextents: usize,
	) -> IoResult<Fork> {
		match format {
			XFS_DINODE_FMT_DEV => {
				Ok(Fork::Dev(u32::from_be_bytes(fork[0..4].try_into().unwrap())))
			}
			XFS_DINODE_FMT_LOCAL => {
				let len = size as usize;
				if len > fork.len() {
					log::error!("inode {inr}: local fork overflows the inode");
					return Err(err!(EIO));
				}
				Ok(Fork::Local(fork[0..len].to_vec()))
			}
			XFS_DINODE_FMT_EXTENTS => {
				if nextents * 16 > fork.len() {
					log::error!("inode {inr}: {nextents} extents overflow the inode");
					return Err(err!(EIO));
				}
				let mut extents = Vec::with_capacity(nextents);
				for i in 0..nextents {
					let off = i * 16;
					let l0 = u64::from_be_bytes(fork[off..off + 8].try_into().unwrap());
					let l1 = u64::from_be_bytes(fork[off + 8..off + 16].try_into().unwrap());
					extents.push(Extent::unpack(l0, l1));
				}
				check_extent_order(inr, &extents)?;
				Ok(Fork::Extents(extents))
			}
			XFS_DINODE_FMT_BTREE => {
				let (extents, blocks) = self.walk_bmbt_root(inr, fork)?;
				check_extent_order(inr, &extents)?;
				Ok(Fork::Btree {
					extents,
					blocks,
					root: fork.to_vec(),
				})
			}
			_ => {
				log::error!("inode {inr}: unknown fork format {format}");
				Err(err!(EIO))
			}
		}
	}

	fn decode_attr_fork(
		&mut self,
		inr: InodeNum,
		fork: &[u8],
		format: u8,
		nextents: usize,
	) -> IoResult<Fork> {
		match format {
			XFS_DINODE_FMT_LOCAL => {
				// the shortform header leads with the total size
				let totsize = u16::from_be_bytes(fork[0..2].try_into().unwrap()) as usize;
				if totsize > fork.len() {
					log::error!("inode {inr}: local attr fork overflows the inode");
					return Err(err!(EIO));
				}
				Ok(Fork::Local(fork[0..totsize].to_vec()))
			}
			XFS_DINODE_FMT_EXTENTS => {
				let mut extents = Vec::with_capacity(nextents);
				if nextents * 16 > fork.len() {
					log::error!("inode {inr}: attr extents overflow the inode");
					return Err(err!(EIO));
				}
				for i in 0..nextents {
					let off = i * 16;
					let l0 = u64::from_be_bytes(fork[off..off + 8].try_into().unwrap());
					let l1 = u64::from_be_bytes(fork[off + 8..off + 16].try_into().unwrap());
					extents.push(Extent::unpack(l0, l1));
				}
				Ok(Fork::Extents(extents))
			}
			XFS_DINODE_FMT_BTREE => {
				let (extents, blocks) = self.walk_bmbt_root(inr, fork)?;
				Ok(Fork::Btree {
					extents,
					blocks,
					root: fork.to_vec(),
				})
			}
			_ => {
				log::error!("inode {inr}: unknown attr fork format {format}");
				Err(err!(EIO))
			}
		}
	}

	/// Walk an in-inode bmbt root down to the extent records.
	fn walk_bmbt_root(
		&mut self,
		inr: InodeNum,
		fork: &[u8],
	) -> IoResult<(Vec<Extent>, Vec<XfsFsblock>)> {
		let level = u16::from_be_bytes(fork[0..2].try_into().unwrap());
		let numrecs = u16::from_be_bytes(fork[2..4].try_into().unwrap()) as usize;
		if level == 0 || numrecs == 0 {
			log::error!("inode {inr}: degenerate bmbt root");
			return Err(err!(EIO));
		}
		let maxrecs = (fork.len() - 4) / 16;
		if numrecs > maxrecs {
			return Err(err!(EIO));
		}
		let ptr_base = 4 + maxrecs * 8;

		let mut extents = Vec::new();
		let mut blocks = Vec::new();
		for i in 0..numrecs {
			let off = ptr_base + i * 8;
			let fsbno = u64::from_be_bytes(fork[off..off + 8].try_into().unwrap());
			self.walk_bmbt_block(inr, fsbno, level - 1, &mut extents, &mut blocks)?;
		}
		Ok((extents, blocks))
	}

	fn walk_bmbt_block(
		&mut self,
		inr: InodeNum,
		fsbno: XfsFsblock,
		level: u16,
		extents: &mut Vec<Extent>,
		blocks: &mut Vec<XfsFsblock>,
	) -> IoResult<()> {
		let sb = &self.superblock;
		let bs = sb.blocksize as usize;
		let hdr = if sb.is_v5() {
			BTREE_LBLOCK_CRC_LEN
		} else {
			BTREE_LBLOCK_LEN
		};
		let pos = sb.fsb_to_byte(fsbno);
		let blk = self.read_buf(pos, bs, BufKind::BmapBtree)?;
		blocks.push(fsbno);

		let blk_level = u16::from_be_bytes(blk[4..6].try_into().unwrap());
		let numrecs = u16::from_be_bytes(blk[6..8].try_into().unwrap()) as usize;
		if blk_level != level {
			log::error!("inode {inr}: bmbt level mismatch");
			return Err(err!(EIO));
		}

		if level == 0 {
			for i in 0..numrecs {
				let off = hdr + i * 16;
				let l0 = u64::from_be_bytes(blk[off..off + 8].try_into().unwrap());
				let l1 = u64::from_be_bytes(blk[off + 8..off + 16].try_into().unwrap());
				extents.push(Extent::unpack(l0, l1));
			}
			return Ok(());
		}

		let maxrecs = (bs - hdr) / 16;
		if numrecs > maxrecs {
			return Err(err!(EIO));
		}
		let ptr_base = hdr + maxrecs * 8;
		for i in 0..numrecs {
			let off = ptr_base + i * 8;
			let child = u64::from_be_bytes(blk[off..off + 8].try_into().unwrap());
			self.walk_bmbt_block(inr, child, level - 1, extents, blocks)?;
		}
		Ok(())
	}

	/// The generation number currently stored in an inode slot.
	pub(crate) fn inode_slot_gen(&mut self, tx: &mut Trans, inr: InodeNum) -> IoResult<u32> {
		let (bi, off) = self.inode_cluster(tx, inr)?;
		let b = tx.buf(bi);
		Ok(u32::from_be_bytes(b[off + 92..off + 96].try_into().unwrap()))
	}

	/// Pin the inode's table block; returns (buffer index, record offset).
	fn inode_cluster(&mut self, tx: &mut Trans, inr: InodeNum) -> IoResult<(usize, usize)> {
		let sb = &self.superblock;
		let bs = sb.blocksize as usize;
		let pos = sb.ino_to_byte(inr.get());
		let blk_pos = pos & !(bs as u64 - 1);
		let off = (pos - blk_pos) as usize;
		let bi = self.trans_read_buf(tx, blk_pos, bs, BufKind::InodeBlock)?;
		Ok((bi, off))
	}

	/// Re-encode a logged inode into its table block at commit.
	pub(crate) fn stage_inode(&mut self, tx: &mut Trans, inr: InodeNum, ino: &Inode) -> IoResult<()> {
		let isize = self.superblock.inodesize as usize;
		let (bi, off) = self.inode_cluster(tx, inr)?;
		encode_dinode(&mut tx.buf_mut(bi)[off..off + isize], &self.superblock, inr, ino)?;
		tx.log_buf_full(bi);
		Ok(())
	}
}

fn check_extent_order(inr: InodeNum, extents: &[Extent]) -> IoResult<()> {
	for w in extents.windows(2) {
		if w[1].startoff < w[0].end_off() {
			log::error!("inode {inr}: extent list out of order");
			return Err(err!(EIO));
		}
	}
	Ok(())
}

/// Serialize an in-core inode over an inode record, updating the V3
/// checksum.  Fork contents must fit the inline areas; the extent mapper
/// converts oversized lists to btree form before logging.
pub(crate) fn encode_dinode(
	buf: &mut [u8],
	sb: &Superblock,
	inr: InodeNum,
	ino: &Inode,
) -> IoResult<()> {
	let isize = sb.inodesize as usize;
	assert_eq!(buf.len(), isize);
	buf.fill(0);

	{
		let mut d = crate::decoder::Decoder::new(Cursor::new(&mut buf[..]));
		d.encode(&XFS_DINODE_MAGIC)?;
		d.encode(&ino.mode)?;
		d.encode(&ino.version)?;
		d.encode(&fork_format(&ino.data))?;
		// di_onlink is dead in v2+
		d.encode(&0u16)?;
		d.encode(&ino.uid)?;
		d.encode(&ino.gid)?;
		d.encode(&ino.nlink)?;
		d.encode(&(ino.projid as u16))?;
		d.encode(&((ino.projid >> 16) as u16))?;
		d.fill(0, 6)?;
		d.encode(&ino.flushiter)?;
		d.encode(&ino.atime)?;
		d.encode(&ino.mtime)?;
		d.encode(&ino.ctime)?;
		d.encode(&ino.size)?;
		d.encode(&ino.nblocks)?;
		d.encode(&ino.extsize)?;
		d.encode(&(ino.data.nextents() as u32))?;
		d.encode(&(ino.attr.nextents() as u16))?;
		d.encode(&ino.forkoff)?;
		d.encode(&attr_fork_format(&ino.attr))?;
		d.encode(&ino.dmevmask)?;
		d.encode(&ino.dmstate)?;
		d.encode(&ino.flags)?;
		d.encode(&ino.gen)?;
		d.encode(&ino.next_unlinked)?;

		if ino.version >= 3 {
			// crc placeholder
			d.encode(&0u32)?;
			d.encode(&ino.changecount)?;
			d.encode(&ino.lsn)?;
			d.encode(&ino.flags2)?;
			d.encode(&ino.cowextsize)?;
			d.fill(0, 12)?;
			d.encode(&ino.crtime)?;
			d.encode(&inr.get())?;
			d.write(sb.meta_uuid().as_bytes())?;
		}
	}

	let lit = literal_off(ino.version);
	let dsize = data_fork_size(sb, ino.version, ino.forkoff);
	encode_fork(&mut buf[lit..lit + dsize], &ino.data)?;
	if let Some((off, len)) = attr_fork_region(sb, ino.version, ino.forkoff) {
		encode_fork(&mut buf[off..off + len], &ino.attr)?;
	}

	if ino.version >= 3 {
		cksum::update(buf, DINODE_CRC_OFF);
	}
	Ok(())
}

fn fork_format(fork: &Fork) -> u8 {
	match fork {
		Fork::Dev(_) => XFS_DINODE_FMT_DEV,
		Fork::Local(_) => XFS_DINODE_FMT_LOCAL,
		Fork::Extents(_) | Fork::None => XFS_DINODE_FMT_EXTENTS,
		Fork::Btree { .. } => XFS_DINODE_FMT_BTREE,
	}
}

fn attr_fork_format(fork: &Fork) -> u8 {
	match fork {
		// aformat is EXTENTS when there is no attr fork at all
		Fork::None => XFS_DINODE_FMT_EXTENTS,
		_ => fork_format(fork),
	}
}

fn encode_fork(out: &mut [u8], fork: &Fork) -> IoResult<()> {
	match fork {
		Fork::None => Ok(()),
		Fork::Dev(dev) => {
			out[0..4].copy_from_slice(&dev.to_be_bytes());
			Ok(())
		}
		Fork::Local(bytes) => {
			if bytes.len() > out.len() {
				log::error!("local fork no longer fits its inode");
				return Err(err!(EIO));
			}
			out[0..bytes.len()].copy_from_slice(bytes);
			Ok(())
		}
		Fork::Extents(extents) => {
			if extents.len() * 16 > out.len() {
				log::error!("inline extent list no longer fits its inode");
				return Err(err!(EIO));
			}
			for (i, e) in extents.iter().enumerate() {
				let (l0, l1) = e.pack();
				out[i * 16..i * 16 + 8].copy_from_slice(&l0.to_be_bytes());
				out[i * 16 + 8..i * 16 + 16].copy_from_slice(&l1.to_be_bytes());
			}
			Ok(())
		}
		Fork::Btree {
			root, ..
		} => {
			if root.len() != out.len() {
				log::error!("bmbt root does not match the fork area");
				return Err(err!(EIO));
			}
			out.copy_from_slice(root);
			Ok(())
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn fork_formats() {
		assert_eq!(fork_format(&Fork::Dev(5)), XFS_DINODE_FMT_DEV);
		assert_eq!(fork_format(&Fork::Local(vec![1])), XFS_DINODE_FMT_LOCAL);
		assert_eq!(fork_format(&Fork::Extents(Vec::new())), XFS_DINODE_FMT_EXTENTS);
		assert_eq!(attr_fork_format(&Fork::None), XFS_DINODE_FMT_EXTENTS);
	}

	#[test]
	fn literal_offsets() {
		assert_eq!(literal_off(2), 100);
		assert_eq!(literal_off(3), 176);
	}

	#[test]
	fn encode_decode_extents_fork() {
		let mut out = vec![0u8; 64];
		let extents = vec![
			Extent {
				startoff:   0,
				startblock: 100,
				blockcount: 3,
				unwritten:  false,
			},
			Extent {
				startoff:   10,
				startblock: 400,
				blockcount: 1,
				unwritten:  true,
			},
		];
		encode_fork(&mut out, &Fork::Extents(extents.clone())).unwrap();
		for (i, want) in extents.iter().enumerate() {
			let l0 = u64::from_be_bytes(out[i * 16..i * 16 + 8].try_into().unwrap());
			let l1 = u64::from_be_bytes(out[i * 16 + 8..i * 16 + 16].try_into().unwrap());
			assert_eq!(Extent::unpack(l0, l1), *want);
		}
	}
}
