use std::{
	ffi::{OsStr, OsString},
	fs::File,
	io::{Error as IoError, ErrorKind, Result as IoResult},
	path::Path,
};

mod attr;
mod balloc;
mod bmap;
mod btree;
mod buf;
pub(crate) mod dir;
mod dir_data;
mod dir_leaf;
mod ialloc;
mod inode;
mod ops;
mod symlink;
mod trans;

pub use ops::Cred;
pub(crate) use {ialloc::init_inode_record, inode::encode_dinode, trans::Trans};

use crate::{
	blockreader::{Backend, BlockReader},
	cksum,
	data::*,
	decoder::Decoder,
};

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		std::io::Error::from_raw_os_error(libc::$name)
	};
}

macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(IoError::new($kind, format!($($tk)+)))
	};
}

/// Summary of filesystem statistics.
#[derive(Debug, Clone)]
#[doc(alias = "Statfs")]
pub struct Info {
	/// Number of data blocks.
	pub blocks: u64,

	/// Number of free blocks.
	pub bfree: u64,

	/// Number of allocated inodes.
	pub files: u64,

	/// Number of free inode slots.
	pub ffree: u64,

	/// Block size.
	pub bsize: u32,

	/// Maximum name length.
	pub namelen: u32,
}

/// A mounted XFS volume (V4 or V5).
pub struct Xfs<R: Backend> {
	pub(crate) file:       Decoder<BlockReader<R>>,
	pub(crate) superblock: Superblock,

	/// Set after repeated superblock write failures; all further
	/// mutations fail with EROFS.
	degraded:        bool,
	sb_write_errors: u32,
	unmounted:       bool,

	// inode cache
	#[cfg(feature = "icache")]
	pub(crate) icache: lru::LruCache<InodeNum, Inode>,

	// directory name cache
	#[cfg(feature = "dcache")]
	pub(crate) dcache: lru::LruCache<(InodeNum, OsString), InodeNum>,
}

impl Xfs<File> {
	pub fn open(path: &Path, rw: bool) -> IoResult<Self> {
		let file = BlockReader::open(path, rw)?;
		Self::new(file)
	}
}

impl<R: Backend> Xfs<R> {
	pub fn new(file: BlockReader<R>) -> IoResult<Self> {
		let rw = file.write_enabled();
		let mut file = Decoder::new(file);

		let superblock: Superblock = file.decode_at(0)?;
		if superblock.magicnum != XFS_SB_MAGIC {
			iobail!(
				ErrorKind::InvalidInput,
				"invalid superblock magic number: {:#x}",
				superblock.magicnum
			);
		}

		if superblock.is_v5() {
			let mut sector = vec![0u8; superblock.sectsize as usize];
			file.read_at(0, &mut sector)?;
			if !cksum::verify(&sector, SB_CRC_OFF) {
				iobail!(ErrorKind::InvalidData, "superblock checksum mismatch");
			}
		}

		let mut s = Self {
			file,
			superblock,
			degraded: false,
			sb_write_errors: 0,
			unmounted: false,
			#[cfg(feature = "icache")]
			icache: crate::new_lru(crate::ICACHE_SIZE),
			#[cfg(feature = "dcache")]
			dcache: crate::new_lru(crate::DCACHE_SIZE),
		};
		s.check(rw)?;
		Ok(s)
	}

	pub fn write_enabled(&self) -> bool {
		self.file.inner().write_enabled() && !self.degraded && !self.unmounted
	}

	#[doc(alias = "is_readonly")]
	pub fn readonly(&self) -> bool {
		!self.write_enabled()
	}

	pub(crate) fn assert_rw(&self) -> IoResult<()> {
		if self.write_enabled() {
			Ok(())
		} else {
			Err(err!(EROFS))
		}
	}

	/// The inode number of the root directory.
	pub fn root(&self) -> InodeNum {
		InodeNum::new(self.superblock.rootino).expect("superblock was validated at mount")
	}

	/// Get filesystem metadata.
	#[doc(alias("statfs", "statvfs"))]
	pub fn info(&self) -> Info {
		let sb = &self.superblock;
		Info {
			blocks:  sb.dblocks,
			bfree:   sb.fdblocks,
			files:   sb.icount,
			ffree:   sb.ifree,
			bsize:   sb.blocksize,
			namelen: MAXNAMELEN as u32,
		}
	}

	fn check(&mut self, rw: bool) -> IoResult<()> {
		let sb = &self.superblock;
		log::debug!("Superblock: {sb:#?}");

		log::info!("Summary:");
		log::info!("Version: {}", sb.version());
		log::info!("UUID: {}", sb.uuid());
		log::info!("Block Size: {}", sb.blocksize);
		log::info!("Directory Block Size: {}", sb.dirblksize());
		log::info!("Inode Size: {}", sb.inodesize);
		log::info!("# Blocks: {}", sb.dblocks);
		log::info!("# AGs: {} x {} blocks", sb.agcount, sb.agblocks);
		log::info!("Root Inode: {}", sb.rootino);
		log::info!("FTYPE: {}", sb.has_ftype());

		macro_rules! sbassert {
			($e:expr) => {
				if !($e) {
					log::error!("superblock corrupted: {}", stringify!($e));
					return Err(err!(EIO));
				}
			};
		}

		let version = sb.version();
		if version != 4 && version != 5 {
			iobail!(ErrorKind::Unsupported, "unsupported XFS version: {version}");
		}
		if sb.inprogress != 0 {
			iobail!(ErrorKind::InvalidInput, "filesystem creation in progress");
		}
		if sb.logstart == 0 {
			iobail!(ErrorKind::Unsupported, "external log devices are not supported");
		}
		if sb.rextents != 0 || sb.rblocks != 0 {
			iobail!(ErrorKind::Unsupported, "realtime sections are not supported");
		}

		sbassert!(sb.blocksize.is_power_of_two());
		sbassert!((512..=65536).contains(&sb.blocksize));
		sbassert!(Some(sb.blocksize) == 1u32.checked_shl(sb.blocklog.into()));
		sbassert!(sb.sectsize.is_power_of_two());
		sbassert!(Some(sb.sectsize) == 1u16.checked_shl(sb.sectlog.into()));
		sbassert!(sb.inodesize.is_power_of_two());
		sbassert!(Some(sb.inodesize) == 1u16.checked_shl(sb.inodelog.into()));
		sbassert!(sb.inopblock as u32 == sb.blocksize / sb.inodesize as u32);
		sbassert!(Some(sb.inopblock) == 1u16.checked_shl(sb.inopblog.into()));
		sbassert!(sb.agcount > 0);
		sbassert!(sb.agblocks > 0);
		sbassert!(sb.agblocks as u64 <= 1u64 << sb.agblklog);
		sbassert!(sb.dirblklog < 8);
		sbassert!(sb.dblocks > 0);
		sbassert!(sb.dblocks <= sb.agcount as u64 * sb.agblocks as u64);
		sbassert!(sb.rootino != 0);

		if sb.is_v5() {
			let supported = SbIncompat::FTYPE | SbIncompat::SPINODES | SbIncompat::META_UUID;
			let unknown =
				SbIncompat::from_bits_retain(sb.features_incompat).difference(supported);
			if !unknown.is_empty() {
				iobail!(
					ErrorKind::Unsupported,
					"unsupported incompatible features: {:#x}",
					unknown.bits()
				);
			}

			if rw {
				let supported = SbRoCompat::FINOBT;
				let unknown =
					SbRoCompat::from_bits_retain(sb.features_ro_compat).difference(supported);
				if !unknown.is_empty() {
					iobail!(
						ErrorKind::Unsupported,
						"features {:#x} permit read-only mounting only",
						unknown.bits()
					);
				}
			}
		}

		log::info!("OK");
		Ok(())
	}

	/// Cross-check the allocation bookkeeping: per-AG btree sums against
	/// the AG headers, and the AG headers against the superblock
	/// counters.  Read-only; EIO on any mismatch.
	pub fn check_consistency(&mut self) -> IoResult<()> {
		use btree::{AllocRec, BtKind, InoRec};

		let sb = self.superblock.clone();
		let sectsize = sb.sectsize as usize;
		let sparse = sb.incompat().contains(SbIncompat::SPINODES);
		let mut free_blocks = 0u64;
		let mut icount = 0u64;
		let mut ifree = 0u64;

		macro_rules! corrupt {
			($($tk:tt)+) => {{
				log::error!($($tk)+);
				return Err(err!(EIO));
			}};
		}

		for agno in 0..sb.agcount {
			let agf: Agf = crate::decoder::decode_slice(&self.read_buf(
				sb.agf_byte(agno),
				sectsize,
				buf::BufKind::Agf,
			)?)?;

			let mut by_bno = 0u64;
			let mut longest = 0u32;
			self.bt_walk(agno, BtKind::Bno, agf.bno_root, agf.bno_level, |rec| {
				let r = AllocRec::decode(rec);
				by_bno += r.len as u64;
				longest = longest.max(r.len);
			})?;
			let mut by_cnt = 0u64;
			self.bt_walk(agno, BtKind::Cnt, agf.cnt_root, agf.cnt_level, |rec| {
				by_cnt += AllocRec::decode(rec).len as u64;
			})?;
			if by_bno != by_cnt {
				corrupt!("AG {agno}: free-space trees disagree ({by_bno} != {by_cnt})");
			}
			if by_bno != agf.freeblks as u64 {
				corrupt!("AG {agno}: freeblks {} != tree sum {by_bno}", agf.freeblks);
			}
			if longest != agf.longest {
				corrupt!("AG {agno}: longest {} != tree max {longest}", agf.longest);
			}
			free_blocks += by_bno;

			let agi: Agi = crate::decoder::decode_slice(&self.read_buf(
				sb.agi_byte(agno),
				sectsize,
				buf::BufKind::Agi,
			)?)?;
			let mut ag_icount = 0u64;
			let mut ag_ifree = 0u64;
			self.bt_walk(agno, BtKind::Ino, agi.root, agi.level, |rec| {
				let r = InoRec::decode(rec, sparse);
				ag_icount += r.count as u64;
				ag_ifree += r.freecount as u64;
			})?;
			if ag_icount != agi.count as u64 || ag_ifree != agi.freecount as u64 {
				corrupt!(
					"AG {agno}: inode counters ({}, {}) != tree sums ({ag_icount}, {ag_ifree})",
					agi.count,
					agi.freecount
				);
			}
			icount += ag_icount;
			ifree += ag_ifree;
		}

		if free_blocks != sb.fdblocks {
			corrupt!("sb_fdblocks {} != AG sum {free_blocks}", sb.fdblocks);
		}
		if icount != sb.icount || ifree != sb.ifree {
			corrupt!(
				"sb inode counters ({}, {}) != AG sums ({icount}, {ifree})",
				sb.icount,
				sb.ifree
			);
		}
		Ok(())
	}

	/// Persist the in-core superblock.  The unparsed tail of the sector is
	/// preserved.
	pub(crate) fn write_superblock(&mut self) -> IoResult<()> {
		self.assert_rw()?;
		let mut sector = vec![0u8; self.superblock.sectsize as usize];
		let res = (|| {
			self.file.read_at(0, &mut sector)?;
			let mut d = Decoder::new(std::io::Cursor::new(&mut sector[..]));
			d.encode_at(0, &self.superblock)?;
			if self.superblock.is_v5() {
				cksum::update(&mut sector, SB_CRC_OFF);
			}
			self.file.write_at(0, &sector)
		})();

		match res {
			Ok(()) => {
				self.sb_write_errors = 0;
				Ok(())
			}
			Err(e) => {
				self.sb_write_errors += 1;
				if self.sb_write_errors >= 2 {
					log::error!("repeated superblock write failures; mount degraded to read-only");
					self.degraded = true;
				}
				Err(e)
			}
		}
	}

	/// Force all completed transactions onto the backing store.
	///
	/// Commits are write-through, so this only drains the block layer.
	pub fn sync(&mut self) -> IoResult<()> {
		use std::io::Write;
		self.file.inner_mut().flush()
	}

	/// See [`Xfs::sync`]; per-file durability degenerates to the same flush.
	pub fn fsync(&mut self, _inr: InodeNum) -> IoResult<()> {
		self.sync()
	}

	/// Flush everything and detach from the backing store.  Idempotent;
	/// best-effort on a read-only mount.
	pub fn unmount(&mut self) -> IoResult<()> {
		if self.unmounted {
			return Ok(());
		}
		if self.write_enabled() {
			if let Err(e) = self.write_superblock() {
				log::warn!("unmount: superblock write failed: {e}");
			}
		}
		let res = self.sync();
		self.unmounted = true;
		#[cfg(feature = "icache")]
		self.icache.clear();
		#[cfg(feature = "dcache")]
		self.dcache.clear();
		res
	}
}

impl<R: Backend> Drop for Xfs<R> {
	fn drop(&mut self) {
		if !self.unmounted {
			if let Err(e) = self.unmount() {
				log::warn!("unmount on drop failed: {e}");
			}
		}
	}
}

/// Validate a directory entry name: nonempty, at most 255 bytes, no `/`
/// or NUL, and not one of the two reserved names.
pub(crate) fn check_name(name: &OsStr) -> IoResult<()> {
	let b = name.as_encoded_bytes();

	if b.is_empty() {
		return Err(err!(EINVAL));
	}
	if b.len() > MAXNAMELEN {
		return Err(err!(ENAMETOOLONG));
	}
	if b.contains(&b'/') || b.contains(&b'\0') || name == "." || name == ".." {
		return Err(err!(EINVAL));
	}
	Ok(())
}

#[cfg(test)]
pub(crate) fn test_inode(mode: u16) -> Inode {
	Inode {
		version: 3,
		mode,
		nlink: 1,
		uid: 0,
		gid: 0,
		projid: 0,
		flushiter: 0,
		atime: Timestamp::ZERO,
		mtime: Timestamp::ZERO,
		ctime: Timestamp::ZERO,
		crtime: Timestamp::ZERO,
		size: 0,
		nblocks: 0,
		extsize: 0,
		forkoff: 0,
		dmevmask: 0,
		dmstate: 0,
		flags: 0,
		gen: 1,
		next_unlinked: NULLAGINO,
		changecount: 1,
		lsn: 0,
		flags2: 0,
		cowextsize: 0,
		data: Fork::Extents(Vec::new()),
		attr: Fork::None,
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn name_checks() {
		assert_eq!(
			check_name(OsStr::new("")).unwrap_err().raw_os_error(),
			Some(libc::EINVAL)
		);
		assert_eq!(
			check_name(OsStr::new("a/b")).unwrap_err().raw_os_error(),
			Some(libc::EINVAL)
		);
		assert_eq!(
			check_name(OsStr::new(".")).unwrap_err().raw_os_error(),
			Some(libc::EINVAL)
		);
		let long = "x".repeat(256);
		assert_eq!(
			check_name(OsStr::new(&long)).unwrap_err().raw_os_error(),
			Some(libc::ENAMETOOLONG)
		);
		let max = "x".repeat(255);
		assert!(check_name(OsStr::new(&max)).is_ok());
		assert!(check_name(OsStr::new("regular.txt")).is_ok());
	}
}
