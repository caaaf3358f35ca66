use std::io::Result as IoResult;

use super::*;
use crate::{cksum, err};

/// What a staged or verified buffer holds.  Selects the magic set and the
/// V5 checksum offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufKind {
	Agf,
	Agi,
	Agfl,
	/// A block of the inode table.  Checksums are per inode record and
	/// maintained by the inode encoder, not here.
	InodeBlock,
	/// Directory data, both single-block ("block") and multi-block
	/// ("data") forms.
	DirData,
	/// Directory leaf (leaf1 or leafn).
	DirLeaf,
	/// Directory/attribute intermediate node.
	DaNode,
	/// Directory free-index block.
	DirFree,
	/// Long-form (file extent) btree block.
	BmapBtree,
	/// Short-form free-space btree block (by-bno or by-size).
	AllocBtree,
	/// Short-form inode btree block (inobt or finobt).
	InoBtree,
	/// Remote symlink target block.
	Symlink,
	/// Attribute leaf block.
	AttrLeaf,
	/// File content; never verified.
	FileData,
}

impl BufKind {
	pub(crate) fn crc_off(self) -> Option<usize> {
		match self {
			BufKind::Agf => Some(AGF_CRC_OFF),
			BufKind::Agi => Some(AGI_CRC_OFF),
			BufKind::Agfl => Some(AGFL_CRC_OFF),
			BufKind::DirData => Some(DIR3_DATA_CRC_OFF),
			BufKind::DirLeaf | BufKind::DaNode | BufKind::AttrLeaf => Some(DA3_CRC_OFF),
			BufKind::DirFree => Some(DIR3_DATA_CRC_OFF),
			BufKind::BmapBtree => Some(BTREE_LBLOCK_CRC_OFF),
			BufKind::AllocBtree | BufKind::InoBtree => Some(BTREE_SBLOCK_CRC_OFF),
			BufKind::Symlink => Some(SYMLINK_CRC_OFF),
			BufKind::InodeBlock | BufKind::FileData => None,
		}
	}

	/// Accepted magic values, as (byte offset, width, value) triples.
	fn magic_ok(self, buf: &[u8]) -> bool {
		let be32 = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
		let be16 = |off: usize| u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());

		match self {
			BufKind::Agf => be32(0) == XFS_AGF_MAGIC,
			BufKind::Agi => be32(0) == XFS_AGI_MAGIC,
			// V4 has no AGFL header at all
			BufKind::Agfl => be32(0) == XFS_AGFL_MAGIC,
			BufKind::DirData => matches!(
				be32(0),
				XFS_DIR2_BLOCK_MAGIC
					| XFS_DIR3_BLOCK_MAGIC
					| XFS_DIR2_DATA_MAGIC
					| XFS_DIR3_DATA_MAGIC
			),
			BufKind::DirLeaf => matches!(
				be16(8),
				XFS_DIR2_LEAF1_MAGIC
					| XFS_DIR3_LEAF1_MAGIC
					| XFS_DIR2_LEAFN_MAGIC
					| XFS_DIR3_LEAFN_MAGIC
			),
			BufKind::DaNode => matches!(be16(8), XFS_DA_NODE_MAGIC | XFS_DA3_NODE_MAGIC),
			BufKind::AttrLeaf => matches!(be16(8), XFS_ATTR_LEAF_MAGIC | XFS_ATTR3_LEAF_MAGIC),
			BufKind::DirFree => matches!(be32(0), XFS_DIR2_FREE_MAGIC | XFS_DIR3_FREE_MAGIC),
			BufKind::BmapBtree => matches!(be32(0), XFS_BMAP_MAGIC | XFS_BMAP_CRC_MAGIC),
			BufKind::AllocBtree => matches!(
				be32(0),
				XFS_ABTB_MAGIC | XFS_ABTB_CRC_MAGIC | XFS_ABTC_MAGIC | XFS_ABTC_CRC_MAGIC
			),
			BufKind::InoBtree => matches!(
				be32(0),
				XFS_IBT_MAGIC | XFS_IBT_CRC_MAGIC | XFS_FIBT_MAGIC | XFS_FIBT_CRC_MAGIC
			),
			BufKind::Symlink => be32(0) == XFS_SYMLINK_MAGIC,
			BufKind::InodeBlock | BufKind::FileData => true,
		}
	}
}

impl<R: Backend> Xfs<R> {
	/// Read a metadata region and verify it: magic always, CRC on V5.
	/// A mismatch is an EIO for this read; the mount stays up.
	pub(crate) fn read_buf(&mut self, pos: u64, len: usize, kind: BufKind) -> IoResult<Vec<u8>> {
		let mut buf = vec![0u8; len];
		self.file.read_at(pos, &mut buf)?;
		self.verify_buf(pos, &buf, kind)?;
		Ok(buf)
	}

	pub(crate) fn verify_buf(&self, pos: u64, buf: &[u8], kind: BufKind) -> IoResult<()> {
		if kind == BufKind::FileData {
			return Ok(());
		}
		// V4 symlink blocks and AGFLs are headerless
		if !self.superblock.is_v5() && matches!(kind, BufKind::Symlink | BufKind::Agfl) {
			return Ok(());
		}
		if !kind.magic_ok(buf) {
			log::error!("{kind:?} buffer at {pos:#x} has a bad magic number");
			return Err(err!(EIO));
		}
		if self.superblock.has_crc() {
			if let Some(off) = kind.crc_off() {
				if !cksum::verify(buf, off) {
					log::error!("filesystem corrupt: {kind:?} at {pos:#x} failed checksum, read aborted");
					return Err(err!(EIO));
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn crc_offsets() {
		assert_eq!(BufKind::Agf.crc_off(), Some(216));
		assert_eq!(BufKind::Agi.crc_off(), Some(312));
		assert_eq!(BufKind::DirData.crc_off(), Some(4));
		assert_eq!(BufKind::DirLeaf.crc_off(), Some(12));
		assert_eq!(BufKind::AllocBtree.crc_off(), Some(52));
		assert_eq!(BufKind::BmapBtree.crc_off(), Some(64));
		assert_eq!(BufKind::FileData.crc_off(), None);
	}

	#[test]
	fn dir_magic_accepts_all_generations() {
		let mut buf = vec![0u8; 64];
		buf[0..4].copy_from_slice(&XFS_DIR3_BLOCK_MAGIC.to_be_bytes());
		assert!(BufKind::DirData.magic_ok(&buf));
		buf[0..4].copy_from_slice(&XFS_DIR2_DATA_MAGIC.to_be_bytes());
		assert!(BufKind::DirData.magic_ok(&buf));
		buf[0..4].copy_from_slice(&XFS_AGF_MAGIC.to_be_bytes());
		assert!(!BufKind::DirData.magic_ok(&buf));
	}
}
