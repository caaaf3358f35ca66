// TODO: remove once write support for multi-level da-trees lands
#![allow(dead_code)]

use std::{fmt, num::NonZeroU64, time::SystemTime};

use bincode::{Decode, Encode};
use bitflags::bitflags;
use uuid::Uuid;

/// "XFSB"
pub const XFS_SB_MAGIC: u32 = 0x58465342;
/// "XAGF"
pub const XFS_AGF_MAGIC: u32 = 0x58414746;
/// "XAGI"
pub const XFS_AGI_MAGIC: u32 = 0x58414749;
/// "XAFL"
pub const XFS_AGFL_MAGIC: u32 = 0x5841464c;
/// "IN"
pub const XFS_DINODE_MAGIC: u16 = 0x494e;
/// "XSLM"
pub const XFS_SYMLINK_MAGIC: u32 = 0x58534c4d;
/// Free Space by Block B+tree, V4 and V5
pub const XFS_ABTB_MAGIC: u32 = 0x41425442;
pub const XFS_ABTB_CRC_MAGIC: u32 = 0x41423342;
/// Free Space by Size B+tree, V4 and V5
pub const XFS_ABTC_MAGIC: u32 = 0x41425443;
pub const XFS_ABTC_CRC_MAGIC: u32 = 0x41423343;
/// Inode B+tree, V4 and V5
pub const XFS_IBT_MAGIC: u32 = 0x49414254;
pub const XFS_IBT_CRC_MAGIC: u32 = 0x49414233;
/// Free Inode B+tree, V4 and V5
pub const XFS_FIBT_MAGIC: u32 = 0x46494254;
pub const XFS_FIBT_CRC_MAGIC: u32 = 0x46494233;
/// B+tree extent list, V4 and V5
pub const XFS_BMAP_MAGIC: u32 = 0x424d4150;
pub const XFS_BMAP_CRC_MAGIC: u32 = 0x424d4133;
/// Directory/attribute intermediate node, V4 and V5
pub const XFS_DA_NODE_MAGIC: u16 = 0xfebe;
pub const XFS_DA3_NODE_MAGIC: u16 = 0x3ebe;
/// Block directory data, V4 and V5
pub const XFS_DIR2_BLOCK_MAGIC: u32 = 0x58443242;
pub const XFS_DIR3_BLOCK_MAGIC: u32 = 0x58444233;
/// Leaf directory data, V4 and V5
pub const XFS_DIR2_DATA_MAGIC: u32 = 0x58443244;
pub const XFS_DIR3_DATA_MAGIC: u32 = 0x58444433;
/// Leaf directory, V4 and V5
pub const XFS_DIR2_LEAF1_MAGIC: u16 = 0xd2f1;
pub const XFS_DIR3_LEAF1_MAGIC: u16 = 0x3df1;
/// Node directory, V4 and V5
pub const XFS_DIR2_LEAFN_MAGIC: u16 = 0xd2ff;
pub const XFS_DIR3_LEAFN_MAGIC: u16 = 0x3dff;
/// Node directory free space, V4 and V5
pub const XFS_DIR2_FREE_MAGIC: u32 = 0x58443246;
pub const XFS_DIR3_FREE_MAGIC: u32 = 0x58444633;
/// Leaf attribute, V4 and V5
pub const XFS_ATTR_LEAF_MAGIC: u16 = 0xfbee;
pub const XFS_ATTR3_LEAF_MAGIC: u16 = 0x3bee;

pub type XfsIno = u64; // absolute inode number
pub type XfsFsblock = u64; // filesystem block number encoding the AG
pub type XfsAgnumber = u32; // AG number
pub type XfsAgblock = u32; // AG relative block number
pub type XfsAgino = u32; // AG relative inode number
pub type XfsExtlen = u32; // extent length in blocks
pub type XfsDablk = u32; // da-tree logical block number
pub type XfsDahash = u32; // hash of a directory or attribute name
pub type XfsFileoff = u64; // block offset into a file
pub type XfsLsn = i64; // log sequence number

/// AG-relative inode number of "no inode" (unlinked buckets, etc.).
pub const NULLAGINO: u32 = u32::MAX;
/// Filesystem block number of "no block".
pub const NULLFSBLOCK: u64 = u64::MAX;
/// AG-relative block number of "no block" (btree sibling terminators).
pub const NULLAGBLOCK: u32 = u32::MAX;
/// Stale directory leaf entry address.
pub const NULL_DATAPTR: u32 = 0;

/// Maximum length of a directory entry or attribute name.
pub const MAXNAMELEN: usize = 255;
/// Maximum length of a symbolic link target.
pub const SYMLINK_MAXLEN: usize = 1024;
/// Maximum link count of an inode.
pub const MAXLINK: u32 = (1 << 31) - 1;
/// Inodes per allocation chunk (one inobt record).
pub const INODES_PER_CHUNK: usize = 64;

/// `st_blocks` unit.
pub const STAT_BLKSIZE: u64 = 512;

/// type of file mask
pub const S_IFMT: u16 = 0o170000;
/// named pipe (fifo)
pub const S_IFIFO: u16 = 0o010000;
/// character special
pub const S_IFCHR: u16 = 0o020000;
/// directory
pub const S_IFDIR: u16 = 0o040000;
/// block special
pub const S_IFBLK: u16 = 0o060000;
/// regular
pub const S_IFREG: u16 = 0o100000;
/// symbolic link
pub const S_IFLNK: u16 = 0o120000;
/// socket
pub const S_IFSOCK: u16 = 0o140000;

pub const S_ISUID: u16 = 0o4000;
pub const S_ISGID: u16 = 0o2000;

/// Directory entry file type tags (FTYPE feature).
pub const XFS_DIR3_FT_UNKNOWN: u8 = 0;
pub const XFS_DIR3_FT_REG_FILE: u8 = 1;
pub const XFS_DIR3_FT_DIR: u8 = 2;
pub const XFS_DIR3_FT_CHRDEV: u8 = 3;
pub const XFS_DIR3_FT_BLKDEV: u8 = 4;
pub const XFS_DIR3_FT_FIFO: u8 = 5;
pub const XFS_DIR3_FT_SOCK: u8 = 6;
pub const XFS_DIR3_FT_SYMLINK: u8 = 7;
pub const XFS_DIR3_FT_WHT: u8 = 8;

/// Inode fork format codes.
pub const XFS_DINODE_FMT_DEV: u8 = 0;
pub const XFS_DINODE_FMT_LOCAL: u8 = 1;
pub const XFS_DINODE_FMT_EXTENTS: u8 = 2;
pub const XFS_DINODE_FMT_BTREE: u8 = 3;
pub const XFS_DINODE_FMT_UUID: u8 = 4;

/// Offset of the literal area (data fork) for v1/v2 inodes.
pub const DINODE_LITERAL_V2: usize = 100;
/// Offset of the literal area (data fork) for v3 inodes.
pub const DINODE_LITERAL_V3: usize = 176;
/// Offset of `di_next_unlinked` (all inode versions).
pub const DINODE_NEXT_UNLINKED_OFF: usize = 96;
/// Offset of the inode CRC (v3 only).
pub const DINODE_CRC_OFF: usize = 100;

/// Superblock CRC offset.
pub const SB_CRC_OFF: usize = 224;
/// AGF CRC offset.
pub const AGF_CRC_OFF: usize = 216;
/// AGI CRC offset.
pub const AGI_CRC_OFF: usize = 312;
/// AGFL CRC offset; the free-list array follows the V5 header.
pub const AGFL_CRC_OFF: usize = 32;
pub const AGFL_HDR_SIZE_V5: usize = 36;
/// CRC offset within `xfs_dir3_blk_hdr` (dir data and block blocks).
pub const DIR3_DATA_CRC_OFF: usize = 4;
/// CRC offset within `xfs_da3_blkinfo` (leaf, node, attr blocks).
pub const DA3_CRC_OFF: usize = 12;
/// CRC offset within `xfs_dsymlink_hdr`.
pub const SYMLINK_CRC_OFF: usize = 12;
/// CRC offset within a V5 short-form btree block header.
pub const BTREE_SBLOCK_CRC_OFF: usize = 52;
/// CRC offset within a V5 long-form btree block header.
pub const BTREE_LBLOCK_CRC_OFF: usize = 64;

/// Short-form btree block header sizes.
pub const BTREE_SBLOCK_LEN: usize = 16;
pub const BTREE_SBLOCK_CRC_LEN: usize = 56;
/// Long-form btree block header sizes.
pub const BTREE_LBLOCK_LEN: usize = 24;
pub const BTREE_LBLOCK_CRC_LEN: usize = 72;

/// Directory data block header sizes.
pub const DIR2_DATA_HDR_LEN: usize = 16;
pub const DIR3_DATA_HDR_LEN: usize = 64;
/// Directory leaf/node block header sizes.
pub const DIR2_LEAF_HDR_LEN: usize = 16;
pub const DIR3_LEAF_HDR_LEN: usize = 64;
pub const DA_NODE_HDR_LEN: usize = 16;
pub const DA3_NODE_HDR_LEN: usize = 64;
/// Directory free-index block header sizes.
pub const DIR2_FREE_HDR_LEN: usize = 16;
pub const DIR3_FREE_HDR_LEN: usize = 64;
/// V5 symlink remote block header size.
pub const SYMLINK_HDR_LEN: usize = 56;

/// Byte offset of the leaf section of the directory address space.
pub const DIR2_LEAF_OFFSET: u64 = 1 << 35;
/// Byte offset of the free-index section of the directory address space.
pub const DIR2_FREE_OFFSET: u64 = 2 << 35;
/// Directory entry alignment.
pub const DIR2_DATA_ALIGN: usize = 8;
/// Tag of an unused directory data record.
pub const DIR2_DATA_FREE_TAG: u16 = 0xffff;
/// Number of best-free slots in a data block header.
pub const DIR2_DATA_FD_COUNT: usize = 3;

bitflags! {
	/// `sb_versionnum` bits beyond the version number in the low nibble.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SbVersion: u16 {
		const ATTRBIT = 0x0010;
		const NLINKBIT = 0x0020;
		const QUOTABIT = 0x0040;
		const ALIGNBIT = 0x0080;
		const DALIGNBIT = 0x0100;
		const SHAREDBIT = 0x0200;
		const LOGV2BIT = 0x0400;
		const SECTORBIT = 0x0800;
		const EXTFLGBIT = 0x1000;
		const DIRV2BIT = 0x2000;
		const BORGBIT = 0x4000;
		const MOREBITSBIT = 0x8000;
	}
}

bitflags! {
	/// `sb_features2` bits.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SbFeatures2: u32 {
		const LAZYSBCOUNT = 0x0002;
		const ATTR2 = 0x0008;
		const PARENT = 0x0010;
		const PROJID32 = 0x0080;
		const CRC = 0x0100;
		const FTYPE = 0x0200;
	}
}

bitflags! {
	/// `sb_features_ro_compat` bits (V5).
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SbRoCompat: u32 {
		const FINOBT = 1 << 0;
		const RMAPBT = 1 << 1;
		const REFLINK = 1 << 2;
		const INOBTCNT = 1 << 3;
	}
}

bitflags! {
	/// `sb_features_incompat` bits (V5).
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SbIncompat: u32 {
		const FTYPE = 1 << 0;
		const SPINODES = 1 << 1;
		const META_UUID = 1 << 2;
		const BIGTIME = 1 << 3;
		const NEEDSREPAIR = 1 << 4;
		const NREXT64 = 1 << 5;
	}
}

/// XFS-native inode number: nonzero, encodes (AG, AG-relative position).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeNum(NonZeroU64);

impl InodeNum {
	pub fn new(ino: u64) -> Option<Self> {
		NonZeroU64::new(ino).map(Self)
	}

	/// # Safety
	/// `ino` must be nonzero.
	pub const unsafe fn new_unchecked(ino: u64) -> Self {
		Self(NonZeroU64::new_unchecked(ino))
	}

	pub fn get(self) -> u64 {
		self.0.get()
	}
}

impl fmt::Display for InodeNum {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl fmt::Debug for InodeNum {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// On-disk timestamp: signed seconds since the epoch plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub struct Timestamp {
	pub sec:  i32,
	pub nsec: u32,
}

/// `utimens` sentinel: set the field to the current wall clock.
pub const UTIME_NOW: u32 = 0x3fffffff;
/// `utimens` sentinel: leave the field unchanged.
pub const UTIME_OMIT: u32 = 0x3ffffffe;

impl Timestamp {
	pub const ZERO: Timestamp = Timestamp {
		sec: 0, nsec: 0,
	};

	pub fn now() -> Self {
		let d = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.unwrap_or_default();
		Timestamp {
			sec:  d.as_secs() as i32,
			nsec: d.subsec_nanos(),
		}
	}
}

impl From<Timestamp> for SystemTime {
	fn from(t: Timestamp) -> Self {
		let dur = std::time::Duration::new(t.sec.unsigned_abs().into(), t.nsec);
		if t.sec < 0 {
			SystemTime::UNIX_EPOCH - dur
		} else {
			SystemTime::UNIX_EPOCH + dur
		}
	}
}

impl From<SystemTime> for Timestamp {
	fn from(t: SystemTime) -> Self {
		match t.duration_since(SystemTime::UNIX_EPOCH) {
			Ok(d) => Timestamp {
				sec:  d.as_secs() as i32,
				nsec: d.subsec_nanos(),
			},
			Err(e) => {
				let d = e.duration();
				Timestamp {
					sec:  -(d.as_secs() as i32),
					nsec: d.subsec_nanos(),
				}
			}
		}
	}
}

/// On-disk superblock, V4 body plus the V5 tail.
/// `struct xfs_dsb` in xfsprogs.
#[derive(Debug, Clone, Decode, Encode)]
pub struct Superblock {
	pub magicnum:              u32, // "XFSB"
	pub blocksize:             u32, // bytes
	pub dblocks:               u64, // data blocks
	pub rblocks:               u64, // realtime blocks
	pub rextents:              u64, // realtime extents
	pub uuid:                  [u8; 16],
	pub logstart:              u64, // first block of the internal log
	pub rootino:               u64,
	pub rbmino:                u64,
	pub rsumino:               u64,
	pub rextsize:              u32,
	pub agblocks:              u32, // blocks per AG
	pub agcount:               u32,
	pub rbmblocks:             u32,
	pub logblocks:             u32,
	pub versionnum:            u16,
	pub sectsize:              u16,
	pub inodesize:             u16,
	pub inopblock:             u16,
	pub fname:                 [u8; 12],
	pub blocklog:              u8,
	pub sectlog:               u8,
	pub inodelog:              u8,
	pub inopblog:              u8,
	pub agblklog:              u8,
	pub rextslog:              u8,
	pub inprogress:            u8,
	pub imax_pct:              u8,
	pub icount:                u64, // allocated inodes
	pub ifree:                 u64, // free inodes
	pub fdblocks:              u64, // free data blocks
	pub frextents:             u64,
	pub uquotino:              u64,
	pub gquotino:              u64,
	pub qflags:                u16,
	pub flags:                 u8,
	pub shared_vn:             u8,
	pub inoalignmt:            u32, // inode chunk alignment in blocks
	pub unit:                  u32,
	pub width:                 u32,
	pub dirblklog:             u8, // dir block size log2, in fs blocks
	pub logsectlog:            u8,
	pub logsectsize:           u16,
	pub logsunit:              u32,
	pub features2:             u32,
	pub bad_features2:         u32,
	// V5 fields; zero on V4
	pub features_compat:       u32,
	pub features_ro_compat:    u32,
	pub features_incompat:     u32,
	pub features_log_incompat: u32,
	pub crc:                   u32,
	pub spino_align:           u32,
	pub pquotino:              u64,
	pub lsn:                   i64,
	pub meta_uuid:             [u8; 16],
}

impl Superblock {
	pub fn version(&self) -> u16 {
		self.versionnum & 0x000f
	}

	pub fn is_v5(&self) -> bool {
		self.version() == 5
	}

	pub fn has_crc(&self) -> bool {
		self.is_v5()
	}

	pub fn has_ftype(&self) -> bool {
		if self.is_v5() {
			self.incompat().contains(SbIncompat::FTYPE)
		} else {
			SbVersion::from_bits_truncate(self.versionnum).contains(SbVersion::MOREBITSBIT)
				&& self.features2_flags().contains(SbFeatures2::FTYPE)
		}
	}

	pub fn has_finobt(&self) -> bool {
		self.is_v5() && self.ro_compat().contains(SbRoCompat::FINOBT)
	}

	pub fn features2_flags(&self) -> SbFeatures2 {
		SbFeatures2::from_bits_truncate(self.features2)
	}

	pub fn ro_compat(&self) -> SbRoCompat {
		SbRoCompat::from_bits_truncate(self.features_ro_compat)
	}

	pub fn incompat(&self) -> SbIncompat {
		SbIncompat::from_bits_truncate(self.features_incompat)
	}

	pub fn uuid(&self) -> Uuid {
		Uuid::from_bytes(self.uuid)
	}

	/// The UUID stamped into V5 metadata blocks.
	pub fn meta_uuid(&self) -> Uuid {
		if self.incompat().contains(SbIncompat::META_UUID) {
			Uuid::from_bytes(self.meta_uuid)
		} else {
			Uuid::from_bytes(self.uuid)
		}
	}

	/// Size of a directory block in bytes.
	pub fn dirblksize(&self) -> usize {
		(self.blocksize as usize) << self.dirblklog
	}

	/// Directory block size in fs blocks.
	pub fn dirblkfsbs(&self) -> u64 {
		1 << self.dirblklog
	}

	pub fn ino_to_agno(&self, ino: u64) -> XfsAgnumber {
		(ino >> (self.inopblog as u64 + self.agblklog as u64)) as u32
	}

	pub fn ino_to_agino(&self, ino: u64) -> XfsAgino {
		let mask = (1u64 << (self.inopblog as u64 + self.agblklog as u64)) - 1;
		(ino & mask) as u32
	}

	pub fn agino_to_ino(&self, agno: XfsAgnumber, agino: XfsAgino) -> u64 {
		((agno as u64) << (self.inopblog as u64 + self.agblklog as u64)) | agino as u64
	}

	/// Split a filesystem block number into (AG, AG-relative block).
	pub fn fsb_to_agb(&self, fsbno: XfsFsblock) -> (XfsAgnumber, XfsAgblock) {
		let agno = (fsbno >> self.agblklog) as u32;
		let agbno = (fsbno & ((1u64 << self.agblklog) - 1)) as u32;
		(agno, agbno)
	}

	pub fn agb_to_fsb(&self, agno: XfsAgnumber, agbno: XfsAgblock) -> XfsFsblock {
		((agno as u64) << self.agblklog) | agbno as u64
	}

	/// Byte offset of the start of an AG.
	pub fn ag_byte(&self, agno: XfsAgnumber) -> u64 {
		agno as u64 * self.agblocks as u64 * self.blocksize as u64
	}

	/// Byte offset of a filesystem block.
	pub fn fsb_to_byte(&self, fsbno: XfsFsblock) -> u64 {
		let (agno, agbno) = self.fsb_to_agb(fsbno);
		self.ag_byte(agno) + ((agbno as u64) << self.blocklog)
	}

	/// Byte offset of an inode record.
	pub fn ino_to_byte(&self, ino: u64) -> u64 {
		let agno = self.ino_to_agno(ino);
		let agino = self.ino_to_agino(ino);
		let agbno = agino >> self.inopblog;
		let slot = (agino & ((1 << self.inopblog) - 1)) as u64;
		self.ag_byte(agno) + ((agbno as u64) << self.blocklog) + slot * self.inodesize as u64
	}

	/// Byte offset of the AGF header of an AG.
	pub fn agf_byte(&self, agno: XfsAgnumber) -> u64 {
		self.ag_byte(agno) + self.sectsize as u64
	}

	/// Byte offset of the AGI header of an AG.
	pub fn agi_byte(&self, agno: XfsAgnumber) -> u64 {
		self.ag_byte(agno) + 2 * self.sectsize as u64
	}

	/// Byte offset of the AGFL of an AG.
	pub fn agfl_byte(&self, agno: XfsAgnumber) -> u64 {
		self.ag_byte(agno) + 3 * self.sectsize as u64
	}

	/// Number of entries in the AGFL.
	pub fn agfl_size(&self) -> usize {
		let hdr = if self.is_v5() { AGFL_HDR_SIZE_V5 } else { 0 };
		(self.sectsize as usize - hdr) / 4
	}

	/// Inode chunk size in fs blocks.
	pub fn chunk_blocks(&self) -> u64 {
		(INODES_PER_CHUNK as u64 * self.inodesize as u64) >> self.blocklog
	}

	/// Maximum inode count permitted by `sb_imax_pct`.
	pub fn max_icount(&self) -> u64 {
		let max_blocks = self.dblocks * self.imax_pct as u64 / 100;
		(max_blocks << self.blocklog) / self.inodesize as u64
	}
}

/// On-disk AG free-space header.
/// `struct xfs_agf` in xfsprogs.
#[derive(Debug, Clone, Decode, Encode)]
pub struct Agf {
	pub magicnum:        u32,
	pub versionnum:      u32,
	pub seqno:           u32,
	pub length:          u32, // blocks in this AG
	pub bno_root:        u32,
	pub cnt_root:        u32,
	pub rmap_root:       u32,
	pub bno_level:       u32,
	pub cnt_level:       u32,
	pub rmap_level:      u32,
	pub flfirst:         u32,
	pub fllast:          u32,
	pub flcount:         u32,
	pub freeblks:        u32,
	pub longest:         u32,
	pub btreeblks:       u32,
	pub uuid:            [u8; 16],
	pub rmap_blocks:     u32,
	pub refcount_blocks: u32,
	pub refcount_root:   u32,
	pub refcount_level:  u32,
	pub spare64:         [u64; 14],
	pub lsn:             i64,
	pub crc:             u32,
	pub spare2:          u32,
}

/// On-disk AG inode header.
/// `struct xfs_agi` in xfsprogs.
#[derive(Debug, Clone, Decode, Encode)]
pub struct Agi {
	pub magicnum:   u32,
	pub versionnum: u32,
	pub seqno:      u32,
	pub length:     u32,
	pub count:      u32, // allocated inodes in this AG
	pub root:       u32, // inobt root block
	pub level:      u32,
	pub freecount:  u32,
	pub newino:     u32,
	pub dirino:     u32,
	pub unlinked:   [u32; 64],
	pub uuid:       [u8; 16],
	pub crc:        u32,
	pub pad32:      u32,
	pub lsn:        i64,
	pub free_root:  u32, // finobt root block
	pub free_level: u32,
	pub iblocks:    u32,
	pub fblocks:    u32,
}

/// A decoded data-fork or attr-fork extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
	pub startoff:   XfsFileoff,
	pub startblock: XfsFsblock,
	pub blockcount: u64,
	/// Unwritten extents read back as zeroes.
	pub unwritten:  bool,
}

impl Extent {
	/// Unpack the 128-bit on-disk record.
	pub fn unpack(l0: u64, l1: u64) -> Self {
		Extent {
			startoff:   (l0 >> 9) & ((1 << 54) - 1),
			startblock: ((l0 & 0x1ff) << 43) | (l1 >> 21),
			blockcount: l1 & ((1 << 21) - 1),
			unwritten:  (l0 >> 63) != 0,
		}
	}

	pub fn pack(&self) -> (u64, u64) {
		debug_assert!(self.startoff < (1 << 54));
		debug_assert!(self.startblock < (1 << 52));
		debug_assert!(self.blockcount < (1 << 21));
		let l0 = ((self.unwritten as u64) << 63)
			| ((self.startoff & ((1 << 54) - 1)) << 9)
			| (self.startblock >> 43);
		let l1 = ((self.startblock & ((1 << 43) - 1)) << 21) | (self.blockcount & ((1 << 21) - 1));
		(l0, l1)
	}

	/// One past the last file block covered by this extent.
	pub fn end_off(&self) -> XfsFileoff {
		self.startoff + self.blockcount
	}
}

/// The kind of a file, as reported by `stat` and FTYPE directory tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
	RegularFile,
	Directory,
	Symlink,
	Socket,
	CharDevice,
	BlockDevice,
	NamedPipe,
}

impl InodeType {
	pub fn from_mode(mode: u16) -> Option<Self> {
		match mode & S_IFMT {
			S_IFIFO => Some(InodeType::NamedPipe),
			S_IFCHR => Some(InodeType::CharDevice),
			S_IFDIR => Some(InodeType::Directory),
			S_IFBLK => Some(InodeType::BlockDevice),
			S_IFREG => Some(InodeType::RegularFile),
			S_IFLNK => Some(InodeType::Symlink),
			S_IFSOCK => Some(InodeType::Socket),
			_ => None,
		}
	}

	pub fn to_ftype(self) -> u8 {
		match self {
			InodeType::RegularFile => XFS_DIR3_FT_REG_FILE,
			InodeType::Directory => XFS_DIR3_FT_DIR,
			InodeType::CharDevice => XFS_DIR3_FT_CHRDEV,
			InodeType::BlockDevice => XFS_DIR3_FT_BLKDEV,
			InodeType::NamedPipe => XFS_DIR3_FT_FIFO,
			InodeType::Socket => XFS_DIR3_FT_SOCK,
			InodeType::Symlink => XFS_DIR3_FT_SYMLINK,
		}
	}

	pub fn from_ftype(ftype: u8) -> Option<Self> {
		match ftype {
			XFS_DIR3_FT_REG_FILE => Some(InodeType::RegularFile),
			XFS_DIR3_FT_DIR => Some(InodeType::Directory),
			XFS_DIR3_FT_CHRDEV => Some(InodeType::CharDevice),
			XFS_DIR3_FT_BLKDEV => Some(InodeType::BlockDevice),
			XFS_DIR3_FT_FIFO => Some(InodeType::NamedPipe),
			XFS_DIR3_FT_SOCK => Some(InodeType::Socket),
			XFS_DIR3_FT_SYMLINK => Some(InodeType::Symlink),
			_ => None,
		}
	}
}

/// Contents of one inode fork.
#[derive(Debug, Clone)]
pub enum Fork {
	/// No attribute fork.
	None,
	/// Device number of a char/block special file.
	Dev(u32),
	/// Inline bytes: small directories, short symlinks.
	Local(Vec<u8>),
	/// Inline extent list.
	Extents(Vec<Extent>),
	/// B+tree-rooted extent list, fully materialized in core.  The tree's
	/// own blocks are retained so truncate/free can release them, and the
	/// raw in-inode root so an untouched tree re-encodes verbatim.
	Btree {
		extents: Vec<Extent>,
		blocks:  Vec<XfsFsblock>,
		root:    Vec<u8>,
	},
}

impl Fork {
	pub fn extents(&self) -> &[Extent] {
		match self {
			Fork::Extents(x) => x,
			Fork::Btree {
				extents, ..
			} => extents,
			_ => &[],
		}
	}

	pub fn nextents(&self) -> usize {
		self.extents().len()
	}
}

/// In-core inode: decoded dinode core plus both forks.
#[derive(Debug, Clone)]
pub struct Inode {
	pub version:       u8,
	pub mode:          u16,
	pub nlink:         u32,
	pub uid:           u32,
	pub gid:           u32,
	pub projid:        u32,
	pub flushiter:     u16,
	pub atime:         Timestamp,
	pub mtime:         Timestamp,
	pub ctime:         Timestamp,
	pub crtime:        Timestamp, // v3 only; zero otherwise
	pub size:          u64,
	pub nblocks:       u64,
	pub extsize:       u32,
	pub forkoff:       u8, // attr fork offset in 8-byte units
	pub dmevmask:      u32,
	pub dmstate:       u16,
	pub flags:         u16,
	pub gen:           u32,
	pub next_unlinked: u32,
	// v3 only
	pub changecount:   u64,
	pub lsn:           XfsLsn,
	pub flags2:        u64,
	pub cowextsize:    u32,
	pub data:          Fork,
	pub attr:          Fork,
}

/// Inode metadata, in the shape `stat` wants it.
#[derive(Debug, Clone)]
pub struct InodeAttr {
	pub inr:     InodeNum,
	pub kind:    InodeType,
	pub perm:    u16,
	pub nlink:   u32,
	pub uid:     u32,
	pub gid:     u32,
	pub size:    u64,
	pub blocks:  u64, // 512-byte units
	pub blksize: u32,
	pub rdev:    u32,
	pub atime:   SystemTime,
	pub mtime:   SystemTime,
	pub ctime:   SystemTime,
	pub btime:   SystemTime,
	pub gen:     u32,
	pub flags:   u32,
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn extent_pack_unpack() {
		let e = Extent {
			startoff:   0x2_0000_1234,
			startblock: 0x7_feed_beef,
			blockcount: 0x1f_ffff,
			unwritten:  false,
		};
		let (l0, l1) = e.pack();
		assert_eq!(Extent::unpack(l0, l1), e);
	}

	#[test]
	fn extent_unwritten_flag() {
		let e = Extent {
			startoff:   7,
			startblock: 1,
			blockcount: 2,
			unwritten:  true,
		};
		let (l0, l1) = e.pack();
		assert_eq!(l0 >> 63, 1);
		assert_eq!(Extent::unpack(l0, l1), e);
	}

	#[test]
	fn extent_unpack_known() {
		// startoff=0, startblock=12, blockcount=1, written
		let l0 = 0u64;
		let l1 = (12u64 << 21) | 1;
		let e = Extent::unpack(l0, l1);
		assert_eq!(e.startoff, 0);
		assert_eq!(e.startblock, 12);
		assert_eq!(e.blockcount, 1);
		assert!(!e.unwritten);
	}

	#[test]
	fn ino_geometry() {
		// 4K blocks, 512-byte inodes (8/block => inopblog 3), agblklog 10
		let mut sb = test_sb();
		sb.inopblog = 3;
		sb.agblklog = 10;
		let ino = sb.agino_to_ino(2, 0x1234);
		assert_eq!(sb.ino_to_agno(ino), 2);
		assert_eq!(sb.ino_to_agino(ino), 0x1234);
	}

	#[test]
	fn fsb_geometry() {
		let mut sb = test_sb();
		sb.agblklog = 10;
		let fsb = sb.agb_to_fsb(3, 17);
		assert_eq!(sb.fsb_to_agb(fsb), (3, 17));
	}

	pub(super) fn test_sb() -> Superblock {
		Superblock {
			magicnum:              XFS_SB_MAGIC,
			blocksize:             4096,
			dblocks:               4096,
			rblocks:               0,
			rextents:              0,
			uuid:                  [0x11; 16],
			logstart:              512,
			rootino:               128,
			rbmino:                0,
			rsumino:               0,
			rextsize:              16,
			agblocks:              1024,
			agcount:               4,
			rbmblocks:             0,
			logblocks:             512,
			versionnum:            0x8005 | 0x0010 | 0x0020 | 0x1000,
			sectsize:              512,
			inodesize:             512,
			inopblock:             8,
			fname:                 [0; 12],
			blocklog:              12,
			sectlog:               9,
			inodelog:              9,
			inopblog:              3,
			agblklog:              10,
			rextslog:              0,
			inprogress:            0,
			imax_pct:              25,
			icount:                64,
			ifree:                 61,
			fdblocks:              3000,
			frextents:             0,
			uquotino:              0,
			gquotino:              0,
			qflags:                0,
			flags:                 0,
			shared_vn:             0,
			inoalignmt:            4,
			unit:                  0,
			width:                 0,
			dirblklog:             0,
			logsectlog:            0,
			logsectsize:           0,
			logsunit:              1,
			features2:             (SbFeatures2::LAZYSBCOUNT | SbFeatures2::ATTR2).bits(),
			bad_features2:         0,
			features_compat:       0,
			features_ro_compat:    SbRoCompat::FINOBT.bits(),
			features_incompat:     SbIncompat::FTYPE.bits(),
			features_log_incompat: 0,
			crc:                   0,
			spino_align:           0,
			pquotino:              0,
			lsn:                   0,
			meta_uuid:             [0; 16],
		}
	}
}
