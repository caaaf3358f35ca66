use std::{
	ffi::{c_int, OsStr},
	io::{Error as IoError, ErrorKind, Result as IoResult},
	path::Path,
	time::Duration,
};

use fuser::{FileAttr, Filesystem, KernelConfig, ReplyEmpty, Request, TimeOrNow};
use rxfs::{Cred, InodeNum, Timestamp, Xfs, UTIME_NOW};

const MAX_CACHE: Duration = Duration::from_secs(1);

pub struct Fs {
	xfs:  Xfs<std::fs::File>,
	root: InodeNum,
}

impl Fs {
	pub fn open(path: &Path, rw: bool) -> IoResult<Self> {
		let xfs = Xfs::open(path, rw)?;
		let root = xfs.root();
		Ok(Self {
			xfs,
			root,
		})
	}

	fn transino(&self, inr: u64) -> IoResult<InodeNum> {
		if inr == fuser::FUSE_ROOT_ID {
			Ok(self.root)
		} else {
			InodeNum::new(inr).ok_or_else(|| IoError::from_raw_os_error(libc::EINVAL))
		}
	}

	/// FUSE reports the root under its own well-known id.
	fn fuseino(&self, inr: InodeNum) -> u64 {
		if inr == self.root {
			fuser::FUSE_ROOT_ID
		} else {
			inr.get()
		}
	}

	fn attr(&mut self, inr: InodeNum) -> IoResult<FileAttr> {
		let st = self.xfs.inode_attr(inr)?;
		let mut attr: FileAttr = st.into();
		attr.ino = self.fuseino(inr);
		Ok(attr)
	}
}

fn run<T>(f: impl FnOnce() -> IoResult<T>) -> Result<T, c_int> {
	f().map_err(|e| {
		if e.kind() != ErrorKind::NotFound {
			log::error!("Error: {e}");
		}
		e.raw_os_error().unwrap_or(libc::EIO)
	})
}

fn cred(req: &Request<'_>) -> Cred {
	Cred {
		uid: req.uid(),
		gid: req.gid(),
	}
}

fn timespec(t: TimeOrNow) -> Timestamp {
	match t {
		TimeOrNow::SpecificTime(t) => t.into(),
		TimeOrNow::Now => Timestamp {
			sec:  0,
			nsec: UTIME_NOW,
		},
	}
}

impl Filesystem for Fs {
	fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
		Ok(())
	}

	fn destroy(&mut self) {
		if let Err(e) = self.xfs.unmount() {
			log::error!("unmount: {e}");
		}
	}

	fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: fuser::ReplyAttr) {
		let f = || {
			let inr = self.transino(ino)?;
			self.attr(inr)
		};
		match run(f) {
			Ok(st) => reply.attr(&MAX_CACHE, &st),
			Err(e) => reply.error(e),
		}
	}

	fn lookup(&mut self, _req: &Request<'_>, pinr: u64, name: &OsStr, reply: fuser::ReplyEntry) {
		let f = || {
			let pinr = self.transino(pinr)?;
			let inr = self.xfs.dir_lookup(pinr, name)?;
			let st = self.attr(inr)?;
			Ok::<_, IoError>(st)
		};
		match run(f) {
			Ok(st) => reply.entry(&Duration::ZERO, &st, 0),
			Err(e) => reply.error(e),
		}
	}

	fn readdir(
		&mut self,
		_req: &Request<'_>,
		inr: u64,
		_fh: u64,
		offset: i64,
		mut reply: fuser::ReplyDirectory,
	) {
		let f = || {
			let inr = self.transino(inr)?;
			let root = self.root;
			let out_ino = move |e: rxfs::InodeNum| {
				if e == root {
					fuser::FUSE_ROOT_ID
				} else {
					e.get()
				}
			};
			let mut deferred: Option<(u64, i64, Vec<u8>)> = None;

			self.xfs.dir_iter(inr, offset as u64, |name, e_inr, kind, next| {
				let kind = match kind {
					Some(k) => k,
					// without FTYPE the tag is learned from the inode,
					// which cannot happen inside the walk
					None => {
						deferred = Some((
							e_inr.get(),
							next as i64,
							name.as_encoded_bytes().to_vec(),
						));
						return Some(());
					}
				};
				if reply.add(out_ino(e_inr), next as i64, kind.into(), name) {
					return Some(());
				}
				None
			})?;

			// resolve one deferred entry at a time; the kernel re-enters
			// with the cookie we handed out
			while let Some((ino, next, name)) = deferred.take() {
				let kind = match InodeNum::new(ino) {
					Some(t) => self.xfs.inode_attr(t)?.kind,
					None => break,
				};
				let name = unsafe { OsStr::from_encoded_bytes_unchecked(&name) };
				if reply.add(ino, next, kind.into(), name) {
					break;
				}
				self.xfs.dir_iter(inr, next as u64, |name, e_inr, kind, next| {
					let kind = match kind {
						Some(k) => k,
						None => {
							deferred = Some((
								e_inr.get(),
								next as i64,
								name.as_encoded_bytes().to_vec(),
							));
							return Some(());
						}
					};
					if reply.add(out_ino(e_inr), next as i64, kind.into(), name) {
						return Some(());
					}
					None
				})?;
			}
			Ok(())
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn read(
		&mut self,
		_req: &Request<'_>,
		inr: u64,
		_fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: fuser::ReplyData,
	) {
		let f = || {
			let inr = self.transino(inr)?;
			let mut buffer = vec![0u8; size as usize];
			let n = self.xfs.inode_read(inr, offset as u64, &mut buffer)?;
			buffer.truncate(n);
			Ok(buffer)
		};
		match run(f) {
			Ok(buf) => reply.data(&buf),
			Err(e) => reply.error(e),
		}
	}

	fn write(
		&mut self,
		_req: &Request<'_>,
		inr: u64,
		_fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: fuser::ReplyWrite,
	) {
		let f = || {
			let inr = self.transino(inr)?;
			self.xfs.inode_write(inr, offset as u64, data)
		};
		match run(f) {
			Ok(n) => reply.written(n as u32),
			Err(e) => reply.error(e),
		}
	}

	fn readlink(&mut self, _req: &Request<'_>, inr: u64, reply: fuser::ReplyData) {
		let f = || {
			let inr = self.transino(inr)?;
			self.xfs.symlink_read(inr)
		};
		match run(f) {
			Ok(x) => reply.data(&x),
			Err(e) => reply.error(e),
		}
	}

	fn mknod(
		&mut self,
		req: &Request<'_>,
		pinr: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		rdev: u32,
		reply: fuser::ReplyEntry,
	) {
		let f = || {
			let pinr = self.transino(pinr)?;
			let inr = self.xfs.create(pinr, name, mode, rdev, cred(req))?;
			self.attr(inr)
		};
		match run(f) {
			Ok(st) => reply.entry(&Duration::ZERO, &st, 0),
			Err(e) => reply.error(e),
		}
	}

	fn create(
		&mut self,
		req: &Request<'_>,
		pinr: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		_flags: i32,
		reply: fuser::ReplyCreate,
	) {
		let f = || {
			let pinr = self.transino(pinr)?;
			let mode = mode | libc::S_IFREG as u32;
			let inr = self.xfs.create(pinr, name, mode, 0, cred(req))?;
			self.attr(inr)
		};
		match run(f) {
			Ok(st) => reply.created(&Duration::ZERO, &st, 0, 0, 0),
			Err(e) => reply.error(e),
		}
	}

	fn mkdir(
		&mut self,
		req: &Request<'_>,
		pinr: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		reply: fuser::ReplyEntry,
	) {
		let f = || {
			let pinr = self.transino(pinr)?;
			let inr = self.xfs.mkdir(pinr, name, mode, cred(req))?;
			self.attr(inr)
		};
		match run(f) {
			Ok(st) => reply.entry(&Duration::ZERO, &st, 0),
			Err(e) => reply.error(e),
		}
	}

	fn symlink(
		&mut self,
		req: &Request<'_>,
		pinr: u64,
		link_name: &OsStr,
		target: &Path,
		reply: fuser::ReplyEntry,
	) {
		let f = || {
			let pinr = self.transino(pinr)?;
			let inr = self
				.xfs
				.symlink(pinr, link_name, target.as_os_str(), cred(req))?;
			self.attr(inr)
		};
		match run(f) {
			Ok(st) => reply.entry(&Duration::ZERO, &st, 0),
			Err(e) => reply.error(e),
		}
	}

	fn link(
		&mut self,
		_req: &Request<'_>,
		inr: u64,
		pinr: u64,
		name: &OsStr,
		reply: fuser::ReplyEntry,
	) {
		let f = || {
			let inr = self.transino(inr)?;
			let pinr = self.transino(pinr)?;
			self.xfs.link(inr, pinr, name)?;
			self.attr(inr)
		};
		match run(f) {
			Ok(st) => reply.entry(&Duration::ZERO, &st, 0),
			Err(e) => reply.error(e),
		}
	}

	fn unlink(&mut self, _req: &Request<'_>, pinr: u64, name: &OsStr, reply: ReplyEmpty) {
		let f = || {
			let pinr = self.transino(pinr)?;
			self.xfs.unlink(pinr, name)
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn rmdir(&mut self, _req: &Request<'_>, pinr: u64, name: &OsStr, reply: ReplyEmpty) {
		let f = || {
			let pinr = self.transino(pinr)?;
			self.xfs.rmdir(pinr, name)
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn rename(
		&mut self,
		_req: &Request<'_>,
		pinr: u64,
		name: &OsStr,
		npinr: u64,
		newname: &OsStr,
		_flags: u32,
		reply: ReplyEmpty,
	) {
		let f = || {
			let pinr = self.transino(pinr)?;
			let npinr = self.transino(npinr)?;
			self.xfs.rename(pinr, name, npinr, newname)
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn setattr(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		mode: Option<u32>,
		uid: Option<u32>,
		gid: Option<u32>,
		size: Option<u64>,
		atime: Option<TimeOrNow>,
		mtime: Option<TimeOrNow>,
		_ctime: Option<std::time::SystemTime>,
		_fh: Option<u64>,
		_crtime: Option<std::time::SystemTime>,
		_chgtime: Option<std::time::SystemTime>,
		_bkuptime: Option<std::time::SystemTime>,
		_flags: Option<u32>,
		reply: fuser::ReplyAttr,
	) {
		let f = || {
			let inr = self.transino(ino)?;
			if let Some(mode) = mode {
				self.xfs.setattr_mode(inr, mode)?;
			}
			if uid.is_some() || gid.is_some() {
				self.xfs.setattr_owner(inr, uid, gid)?;
			}
			if let Some(size) = size {
				self.xfs.truncate(inr, size)?;
			}
			if atime.is_some() || mtime.is_some() {
				self.xfs
					.setattr_time(inr, atime.map(timespec), mtime.map(timespec))?;
			}
			self.attr(inr)
		};
		match run(f) {
			Ok(st) => reply.attr(&MAX_CACHE, &st),
			Err(e) => reply.error(e),
		}
	}

	fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
		let _ = self.transino(ino);
		reply.opened(0, 0);
	}

	fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
		let _ = self.transino(ino);
		reply.opened(0, 0);
	}

	fn flush(
		&mut self,
		_req: &Request<'_>,
		_ino: u64,
		_fh: u64,
		_lock_owner: u64,
		reply: ReplyEmpty,
	) {
		match run(|| self.xfs.sync()) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn fsync(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		_datasync: bool,
		reply: ReplyEmpty,
	) {
		let f = || {
			let inr = self.transino(ino)?;
			self.xfs.fsync(inr)
		};
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
		let info = self.xfs.info();
		reply.statfs(
			info.blocks,
			info.bfree,
			info.bfree,
			info.files,
			info.ffree,
			info.bsize,
			info.namelen,
			info.bsize,
		)
	}

	fn listxattr(&mut self, _req: &Request<'_>, inr: u64, size: u32, reply: fuser::ReplyXattr) {
		enum R {
			Len(u32),
			Data(Vec<u8>),
		}

		let f = || {
			let inr = self.transino(inr)?;
			let names = self.xfs.attr_list(inr)?;
			let mut data = Vec::new();
			for mut n in names {
				data.append(&mut n);
				data.push(0);
			}
			if size == 0 {
				Ok(R::Len(data.len() as u32))
			} else if data.len() > size as usize {
				Err(IoError::from_raw_os_error(libc::ERANGE))
			} else {
				Ok(R::Data(data))
			}
		};

		match run(f) {
			Ok(R::Data(data)) => reply.data(&data),
			Ok(R::Len(len)) => reply.size(len),
			Err(e) => reply.error(e),
		}
	}

	fn getxattr(
		&mut self,
		_req: &Request<'_>,
		inr: u64,
		name: &OsStr,
		size: u32,
		reply: fuser::ReplyXattr,
	) {
		enum R {
			Len(u32),
			Data(Vec<u8>),
		}

		let f = || {
			let inr = self.transino(inr)?;
			let data = self.xfs.attr_get(inr, name)?;
			if size == 0 {
				Ok(R::Len(data.len() as u32))
			} else if data.len() > size as usize {
				Err(IoError::from_raw_os_error(libc::ERANGE))
			} else {
				Ok(R::Data(data))
			}
		};

		match run(f) {
			Ok(R::Data(x)) => reply.data(&x),
			Ok(R::Len(l)) => reply.size(l),
			Err(e) => reply.error(e),
		}
	}
}
