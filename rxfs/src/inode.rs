use std::time::SystemTime;

use crate::data::*;

impl Inode {
	pub fn perm(&self) -> u16 {
		self.mode & 0o7777
	}

	pub fn kind(&self) -> InodeType {
		InodeType::from_mode(self.mode).expect("invalid file mode")
	}

	pub fn is_dir(&self) -> bool {
		self.mode & S_IFMT == S_IFDIR
	}

	pub fn is_reg(&self) -> bool {
		self.mode & S_IFMT == S_IFREG
	}

	pub fn is_symlink(&self) -> bool {
		self.mode & S_IFMT == S_IFLNK
	}

	pub fn rdev(&self) -> u32 {
		match self.data {
			Fork::Dev(dev) => dev,
			_ => 0,
		}
	}

	/// Bump the timestamps of a content mutation.  Every metadata mutation
	/// refreshes ctime; content mutations refresh mtime as well.
	pub fn touch_mtime(&mut self) {
		let now = Timestamp::now();
		self.mtime = now;
		self.ctime = now;
	}

	pub fn touch_ctime(&mut self) {
		self.ctime = Timestamp::now();
	}

	pub fn as_attr(&self, inr: InodeNum, blksize: u32) -> InodeAttr {
		InodeAttr {
			inr,
			kind: self.kind(),
			perm: self.perm(),
			nlink: self.nlink,
			uid: self.uid,
			gid: self.gid,
			size: self.size,
			blocks: self.nblocks * (blksize as u64 / STAT_BLKSIZE),
			blksize,
			rdev: self.rdev(),
			atime: self.atime.into(),
			mtime: self.mtime.into(),
			ctime: self.ctime.into(),
			btime: if self.version >= 3 {
				self.crtime.into()
			} else {
				SystemTime::UNIX_EPOCH
			},
			gen: self.gen,
			flags: self.flags.into(),
		}
	}
}

#[cfg(feature = "fuser")]
mod f {
	use fuser::{FileAttr, FileType};

	use super::*;

	impl From<InodeType> for FileType {
		fn from(t: InodeType) -> Self {
			match t {
				InodeType::RegularFile => Self::RegularFile,
				InodeType::Directory => Self::Directory,
				InodeType::Symlink => Self::Symlink,
				InodeType::Socket => Self::Socket,
				InodeType::CharDevice => Self::CharDevice,
				InodeType::BlockDevice => Self::BlockDevice,
				InodeType::NamedPipe => Self::NamedPipe,
			}
		}
	}

	impl From<InodeAttr> for FileAttr {
		fn from(a: InodeAttr) -> Self {
			Self {
				ino:     a.inr.get(),
				size:    a.size,
				blocks:  a.blocks,
				atime:   a.atime,
				mtime:   a.mtime,
				ctime:   a.ctime,
				crtime:  a.btime,
				kind:    a.kind.into(),
				perm:    a.perm,
				nlink:   a.nlink,
				uid:     a.uid,
				gid:     a.gid,
				rdev:    a.rdev,
				blksize: a.blksize,
				flags:   a.flags,
			}
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn kind_from_mode() {
		let mut ino = crate::xfs::test_inode(S_IFREG | 0o644);
		assert_eq!(ino.kind(), InodeType::RegularFile);
		assert_eq!(ino.perm(), 0o644);
		ino.mode = S_IFDIR | 0o755;
		assert!(ino.is_dir());
		assert_eq!(ino.kind(), InodeType::Directory);
	}

	#[test]
	fn rdev_only_for_devices() {
		let mut ino = crate::xfs::test_inode(S_IFCHR | 0o600);
		ino.data = Fork::Dev(0x0501);
		assert_eq!(ino.rdev(), 0x0501);
		ino.data = Fork::Local(Vec::new());
		assert_eq!(ino.rdev(), 0);
	}
}
