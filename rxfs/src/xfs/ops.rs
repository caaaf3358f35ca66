//! Namespace operations: path resolution and the mutating calls a mount
//! daemon drives.  Every mutation runs inside one transaction; any error
//! cancels it and leaves no trace.

use std::{
	ffi::{OsStr, OsString},
	io::Result as IoResult,
	path::{Component, Path},
};

use super::{
	buf::BufKind,
	trans::{LogFlags, Reservation},
	*,
};
use crate::err;

/// Credentials applied to newly-created inodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cred {
	pub uid: u32,
	pub gid: u32,
}

impl<R: Backend> Xfs<R> {
	/// Resolve an absolute `/`-separated path to an inode number.
	pub fn lookup_by_path(&mut self, path: &Path) -> IoResult<InodeNum> {
		log::trace!("lookup_by_path({path:?});");
		let mut cur = self.root();
		for comp in path.components() {
			match comp {
				Component::RootDir | Component::CurDir => {}
				Component::ParentDir => {
					cur = self.dir_lookup(cur, OsStr::new(".."))?;
				}
				Component::Normal(name) => {
					cur = self.dir_lookup(cur, name)?;
				}
				Component::Prefix(_) => return Err(err!(EINVAL)),
			}
		}
		Ok(cur)
	}

	/// Resolve a path to its parent directory and leaf name.
	pub fn lookup_parent(&mut self, path: &Path) -> IoResult<(InodeNum, OsString)> {
		let name = path.file_name().ok_or_else(|| err!(EINVAL))?;
		let parent = match path.parent() {
			Some(p) if !p.as_os_str().is_empty() => self.lookup_by_path(p)?,
			_ => self.root(),
		};
		Ok((parent, name.to_os_string()))
	}

	/// `stat` by path.
	pub fn stat(&mut self, path: &Path) -> IoResult<InodeAttr> {
		let inr = self.lookup_by_path(path)?;
		self.inode_attr(inr)
	}

	/// The parent of a directory, via its `..` entry.
	pub(crate) fn dir_parent(&mut self, inr: InodeNum) -> IoResult<InodeNum> {
		self.dir_lookup(inr, OsStr::new(".."))
	}

	/// Pin inodes to the transaction in increasing inode-number order.
	fn join_sorted(&self, tx: &mut Trans, mut pairs: Vec<(InodeNum, Inode)>) {
		pairs.sort_by_key(|(inr, _)| *inr);
		pairs.dedup_by_key(|(inr, _)| *inr);
		for (inr, ino) in pairs {
			tx.join_inode(inr, ino);
		}
	}

	fn new_inode(&self, mode: u16, cred: Cred, gen: u32, data: Fork) -> Inode {
		let now = Timestamp::now();
		Inode {
			version: if self.superblock.is_v5() { 3 } else { 2 },
			mode,
			nlink: 1,
			uid: cred.uid,
			gid: cred.gid,
			projid: 0,
			flushiter: 0,
			atime: now,
			mtime: now,
			ctime: now,
			crtime: now,
			size: 0,
			nblocks: 0,
			extsize: 0,
			forkoff: 0,
			dmevmask: 0,
			dmstate: 0,
			flags: 0,
			gen,
			next_unlinked: NULLAGINO,
			changecount: 1,
			lsn: 0,
			flags2: 0,
			cowextsize: 0,
			data,
			attr: Fork::None,
		}
	}

	/// Create a file, fifo, socket or device node.
	#[doc(alias = "mknod")]
	pub fn create(
		&mut self,
		pinr: InodeNum,
		name: &OsStr,
		mode: u32,
		rdev: u32,
		cred: Cred,
	) -> IoResult<InodeNum> {
		log::trace!("create({pinr}, {name:?}, {mode:#o});");
		self.assert_rw()?;
		check_name(name)?;
		let mode = mode as u16;
		let kind = InodeType::from_mode(mode).ok_or_else(|| err!(EINVAL))?;
		if kind == InodeType::Directory || kind == InodeType::Symlink {
			return Err(err!(EINVAL));
		}

		let mut pino = self.iget(pinr)?;
		if !pino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		if self.dir_lookup(pinr, name).is_ok() {
			return Err(err!(EEXIST));
		}

		let mut tx = self.trans_alloc("create");
		let res = Reservation::create(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, (res * 128) as u32) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			let inr = self.ialloc(&mut tx, pinr)?;
			let gen = self.inode_slot_gen(&mut tx, inr)?.wrapping_add(1);
			let data = match kind {
				InodeType::CharDevice
				| InodeType::BlockDevice
				| InodeType::NamedPipe
				| InodeType::Socket => Fork::Dev(rdev),
				_ => Fork::Extents(Vec::new()),
			};
			let ino = self.new_inode(mode, cred, gen, data);

			self.dir_insert(&mut tx, pinr, &mut pino, name.as_encoded_bytes(), inr.get(), kind.to_ftype())?;
			pino.touch_mtime();

			self.join_sorted(&mut tx, vec![(pinr, pino.clone()), (inr, ino)]);
			tx.log_inode(pinr, LogFlags::CORE | LogFlags::DDATA);
			tx.log_inode(inr, LogFlags::CORE | LogFlags::DDATA | LogFlags::DEV);
			Ok(inr)
		})();

		match r {
			Ok(inr) => {
				self.trans_commit(tx)?;
				#[cfg(feature = "dcache")]
				self.dcache.put((pinr, name.to_os_string()), inr);
				Ok(inr)
			}
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}

	pub fn mkdir(
		&mut self,
		pinr: InodeNum,
		name: &OsStr,
		mode: u32,
		cred: Cred,
	) -> IoResult<InodeNum> {
		log::trace!("mkdir({pinr}, {name:?}, {mode:#o});");
		self.assert_rw()?;
		check_name(name)?;

		let mut pino = self.iget(pinr)?;
		if !pino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		if pino.nlink >= MAXLINK {
			return Err(err!(EMLINK));
		}
		if self.dir_lookup(pinr, name).is_ok() {
			return Err(err!(EEXIST));
		}

		let mut tx = self.trans_alloc("mkdir");
		let res = Reservation::mkdir(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, (res * 128) as u32) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			let inr = self.ialloc(&mut tx, pinr)?;
			let gen = self.inode_slot_gen(&mut tx, inr)?.wrapping_add(1);
			let sf = super::dir::SfDir {
				parent:  pinr.get(),
				entries: Vec::new(),
			};
			let body = super::dir::encode_sf(&sf, self.superblock.has_ftype());
			let mut ino = self.new_inode(
				(mode as u16 & 0o7777) | S_IFDIR,
				cred,
				gen,
				Fork::Local(body.clone()),
			);
			ino.size = body.len() as u64;
			ino.nlink = 2;

			self.dir_insert(
				&mut tx,
				pinr,
				&mut pino,
				name.as_encoded_bytes(),
				inr.get(),
				XFS_DIR3_FT_DIR,
			)?;
			pino.nlink += 1;
			pino.touch_mtime();

			self.join_sorted(&mut tx, vec![(pinr, pino.clone()), (inr, ino)]);
			tx.log_inode(pinr, LogFlags::CORE | LogFlags::DDATA);
			tx.log_inode(inr, LogFlags::CORE | LogFlags::DDATA);
			Ok(inr)
		})();

		match r {
			Ok(inr) => {
				self.trans_commit(tx)?;
				#[cfg(feature = "dcache")]
				self.dcache.put((pinr, name.to_os_string()), inr);
				Ok(inr)
			}
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}

	pub fn symlink(
		&mut self,
		pinr: InodeNum,
		name: &OsStr,
		target: &OsStr,
		cred: Cred,
	) -> IoResult<InodeNum> {
		log::trace!("symlink({pinr}, {name:?}, {target:?});");
		self.assert_rw()?;
		check_name(name)?;
		let body = target.as_encoded_bytes();
		if body.is_empty() {
			return Err(err!(EINVAL));
		}
		if body.len() > SYMLINK_MAXLEN {
			return Err(err!(ENAMETOOLONG));
		}

		let mut pino = self.iget(pinr)?;
		if !pino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		if self.dir_lookup(pinr, name).is_ok() {
			return Err(err!(EEXIST));
		}

		let mut tx = self.trans_alloc("symlink");
		let res = Reservation::symlink(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, (res * 128) as u32) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			let inr = self.ialloc(&mut tx, pinr)?;
			let gen = self.inode_slot_gen(&mut tx, inr)?.wrapping_add(1);
			let mut ino = self.new_inode(S_IFLNK | 0o777, cred, gen, Fork::Extents(Vec::new()));
			self.symlink_store(&mut tx, inr, &mut ino, body)?;

			self.dir_insert(
				&mut tx,
				pinr,
				&mut pino,
				name.as_encoded_bytes(),
				inr.get(),
				XFS_DIR3_FT_SYMLINK,
			)?;
			pino.touch_mtime();

			self.join_sorted(&mut tx, vec![(pinr, pino.clone()), (inr, ino)]);
			tx.log_inode(pinr, LogFlags::CORE | LogFlags::DDATA);
			tx.log_inode(inr, LogFlags::CORE | LogFlags::DDATA | LogFlags::DEXT);
			Ok(inr)
		})();

		match r {
			Ok(inr) => {
				self.trans_commit(tx)?;
				#[cfg(feature = "dcache")]
				self.dcache.put((pinr, name.to_os_string()), inr);
				Ok(inr)
			}
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}

	/// Add a hard link to an existing non-directory.
	pub fn link(&mut self, inr: InodeNum, pinr: InodeNum, name: &OsStr) -> IoResult<()> {
		log::trace!("link({inr}, {pinr}, {name:?});");
		self.assert_rw()?;
		check_name(name)?;

		let mut ino = self.iget(inr)?;
		if ino.is_dir() {
			return Err(err!(EPERM));
		}
		if ino.nlink >= MAXLINK {
			return Err(err!(EMLINK));
		}
		let mut pino = self.iget(pinr)?;
		if !pino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		if self.dir_lookup(pinr, name).is_ok() {
			return Err(err!(EEXIST));
		}

		let mut tx = self.trans_alloc("link");
		let res = Reservation::link(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, (res * 128) as u32) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			self.dir_insert(
				&mut tx,
				pinr,
				&mut pino,
				name.as_encoded_bytes(),
				inr.get(),
				ino.kind().to_ftype(),
			)?;
			ino.nlink += 1;
			ino.touch_ctime();
			pino.touch_mtime();

			self.join_sorted(&mut tx, vec![(pinr, pino.clone()), (inr, ino.clone())]);
			tx.log_inode(pinr, LogFlags::CORE | LogFlags::DDATA);
			tx.log_inode(inr, LogFlags::CORE);
			Ok(())
		})();

		match r {
			Ok(()) => {
				self.trans_commit(tx)?;
				#[cfg(feature = "dcache")]
				self.dcache.put((pinr, name.to_os_string()), inr);
				Ok(())
			}
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}

	/// Remove a non-directory name; the inode's space is released in the
	/// same transaction when the last link goes.
	pub fn unlink(&mut self, pinr: InodeNum, name: &OsStr) -> IoResult<()> {
		log::trace!("unlink({pinr}, {name:?});");
		self.assert_rw()?;
		check_name(name)?;

		let mut pino = self.iget(pinr)?;
		if !pino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		let inr = self.dir_lookup(pinr, name)?;
		let mut ino = self.iget(inr)?;
		if ino.is_dir() {
			return Err(err!(EISDIR));
		}

		let mut tx = self.trans_alloc("unlink");
		let res = Reservation::remove(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, 4096) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			let removed = self.dir_remove(&mut tx, pinr, &mut pino, name.as_encoded_bytes())?;
			if removed != inr {
				log::error!("unlink({pinr}, {name:?}): directory entry changed underneath us");
				return Err(err!(EIO));
			}
			pino.touch_mtime();

			ino.nlink -= 1;
			ino.touch_ctime();
			if ino.nlink == 0 {
				self.free_all_blocks(&mut tx, &mut ino)?;
				self.ifree(&mut tx, inr)?;
				ino.mode = 0;
				ino.size = 0;
				tx.drop_inodes.push(inr);
			}

			self.join_sorted(&mut tx, vec![(pinr, pino.clone()), (inr, ino.clone())]);
			tx.log_inode(pinr, LogFlags::CORE | LogFlags::DDATA);
			tx.log_inode(inr, LogFlags::CORE | LogFlags::DEXT);
			Ok(())
		})();

		match r {
			Ok(()) => {
				self.trans_commit(tx)?;
				#[cfg(feature = "dcache")]
				self.dcache.pop(&(pinr, name.to_os_string()));
				Ok(())
			}
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}

	/// Remove an empty directory.
	pub fn rmdir(&mut self, pinr: InodeNum, name: &OsStr) -> IoResult<()> {
		log::trace!("rmdir({pinr}, {name:?});");
		self.assert_rw()?;
		check_name(name)?;

		let mut pino = self.iget(pinr)?;
		if !pino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		let inr = self.dir_lookup(pinr, name)?;
		let mut ino = self.iget(inr)?;
		if !ino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		if !self.dir_is_empty(inr, &ino)? {
			return Err(err!(ENOTEMPTY));
		}

		let mut tx = self.trans_alloc("rmdir");
		let res = Reservation::remove(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, 4096) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			let removed = self.dir_remove(&mut tx, pinr, &mut pino, name.as_encoded_bytes())?;
			if removed != inr {
				return Err(err!(EIO));
			}
			// the child's `..` no longer counts against the parent
			pino.nlink -= 1;
			pino.touch_mtime();

			ino.nlink = 0;
			self.free_all_blocks(&mut tx, &mut ino)?;
			self.ifree(&mut tx, inr)?;
			ino.mode = 0;
			ino.size = 0;
			tx.drop_inodes.push(inr);

			self.join_sorted(&mut tx, vec![(pinr, pino.clone()), (inr, ino.clone())]);
			tx.log_inode(pinr, LogFlags::CORE | LogFlags::DDATA);
			tx.log_inode(inr, LogFlags::CORE | LogFlags::DDATA | LogFlags::DEXT);
			Ok(())
		})();

		match r {
			Ok(()) => {
				self.trans_commit(tx)?;
				#[cfg(feature = "dcache")]
				self.dcache.pop(&(pinr, name.to_os_string()));
				Ok(())
			}
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}

	/// Rename, overwriting a compatible destination.  Same-name renames
	/// and renames onto another link of the same inode are no-ops.
	pub fn rename(
		&mut self,
		spinr: InodeNum,
		sname: &OsStr,
		dpinr: InodeNum,
		dname: &OsStr,
	) -> IoResult<()> {
		log::trace!("rename({spinr}, {sname:?}, {dpinr}, {dname:?});");
		self.assert_rw()?;
		check_name(sname)?;
		check_name(dname)?;

		let mut spino = self.iget(spinr)?;
		if !spino.is_dir() {
			return Err(err!(ENOTDIR));
		}
		let src = self.dir_lookup(spinr, sname)?;
		let mut sino = self.iget(src)?;

		if spinr == dpinr && sname == dname {
			return Ok(());
		}

		// a directory may not move under itself
		if sino.is_dir() && spinr != dpinr {
			if dpinr == src {
				return Err(err!(EINVAL));
			}
			let mut walk = dpinr;
			while walk != self.root() {
				let up = self.dir_parent(walk)?;
				if up == src {
					return Err(err!(EINVAL));
				}
				if up == walk {
					break;
				}
				walk = up;
			}
		}

		let mut dpino = if dpinr == spinr {
			spino.clone()
		} else {
			let d = self.iget(dpinr)?;
			if !d.is_dir() {
				return Err(err!(ENOTDIR));
			}
			d
		};

		let dst = match self.dir_lookup(dpinr, dname) {
			Ok(d) => Some(d),
			Err(e) if e.raw_os_error() == Some(libc::ENOENT) => None,
			Err(e) => return Err(e),
		};
		if dst == Some(src) {
			return Ok(());
		}

		let mut dino = None;
		if let Some(dst) = dst {
			let d = self.iget(dst)?;
			match (sino.is_dir(), d.is_dir()) {
				(true, false) => return Err(err!(ENOTDIR)),
				(false, true) => return Err(err!(EISDIR)),
				(true, true) => {
					if !self.dir_is_empty(dst, &d)? {
						return Err(err!(ENOTEMPTY));
					}
				}
				(false, false) => {}
			}
			dino = Some(d);
		}

		let mut tx = self.trans_alloc("rename");
		let res = Reservation::rename(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, (res * 128) as u32) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			let same_parent = spinr == dpinr;

			if let Some(dst) = dst {
				let mut d = dino.take().expect("destination inode was fetched");
				// retarget the destination entry, then drop the old target
				let old = self.dir_replace(
					&mut tx,
					dpinr,
					&mut dpino,
					dname.as_encoded_bytes(),
					src.get(),
				)?;
				if old != dst {
					return Err(err!(EIO));
				}
				if d.is_dir() {
					dpino.nlink -= 1;
					d.nlink = 0;
					self.free_all_blocks(&mut tx, &mut d)?;
					self.ifree(&mut tx, dst)?;
					d.mode = 0;
					d.size = 0;
					tx.drop_inodes.push(dst);
				} else {
					d.nlink -= 1;
					d.touch_ctime();
					if d.nlink == 0 {
						self.free_all_blocks(&mut tx, &mut d)?;
						self.ifree(&mut tx, dst)?;
						d.mode = 0;
						d.size = 0;
						tx.drop_inodes.push(dst);
					}
				}
				dino = Some(d);
			} else {
				self.dir_insert(
					&mut tx,
					dpinr,
					&mut dpino,
					dname.as_encoded_bytes(),
					src.get(),
					sino.kind().to_ftype(),
				)?;
			}

			// keep the two views of one parent coherent
			if same_parent {
				spino = dpino.clone();
			}

			let removed =
				self.dir_remove(&mut tx, spinr, &mut spino, sname.as_encoded_bytes())?;
			if removed != src {
				return Err(err!(EIO));
			}
			if same_parent {
				dpino = spino.clone();
			}

			if sino.is_dir() && !same_parent {
				// `..` of the moved directory follows it
				self.dir_replace(&mut tx, src, &mut sino, b"..", dpinr.get())?;
				spino.nlink -= 1;
				dpino.nlink += 1;
			}

			spino.touch_mtime();
			if !same_parent {
				dpino.touch_mtime();
			}
			sino.touch_ctime();

			// `spino` is authoritative for a same-parent rename
			let mut joins = vec![(spinr, spino.clone()), (src, sino.clone())];
			if !same_parent {
				joins.push((dpinr, dpino.clone()));
			}
			if let (Some(dst), Some(d)) = (dst, dino.clone()) {
				joins.push((dst, d));
			}
			self.join_sorted(&mut tx, joins);
			tx.log_inode(spinr, LogFlags::CORE | LogFlags::DDATA);
			if !same_parent {
				tx.log_inode(dpinr, LogFlags::CORE | LogFlags::DDATA);
			}
			tx.log_inode(src, LogFlags::CORE | LogFlags::DDATA);
			if let Some(dst) = dst {
				tx.log_inode(dst, LogFlags::CORE | LogFlags::DEXT);
			}
			Ok(())
		})();

		match r {
			Ok(()) => {
				self.trans_commit(tx)?;
				#[cfg(feature = "dcache")]
				{
					self.dcache.pop(&(spinr, sname.to_os_string()));
					self.dcache.pop(&(dpinr, dname.to_os_string()));
					self.dcache.put((dpinr, dname.to_os_string()), src);
				}
				Ok(())
			}
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}

	/// Change the permission bits; the file type bits never change.
	#[doc(alias = "chmod")]
	pub fn setattr_mode(&mut self, inr: InodeNum, mode: u32) -> IoResult<InodeAttr> {
		log::trace!("setattr_mode({inr}, {mode:#o});");
		self.assert_rw()?;
		let mut ino = self.iget(inr)?;
		ino.mode = (ino.mode & S_IFMT) | (mode as u16 & 0o7777);
		ino.touch_ctime();
		self.setattr_commit(inr, ino)
	}

	/// Change the owner; setuid and setgid drop whenever either id
	/// actually changes.
	#[doc(alias = "chown")]
	pub fn setattr_owner(
		&mut self,
		inr: InodeNum,
		uid: Option<u32>,
		gid: Option<u32>,
	) -> IoResult<InodeAttr> {
		log::trace!("setattr_owner({inr}, {uid:?}, {gid:?});");
		self.assert_rw()?;
		let mut ino = self.iget(inr)?;
		let mut changed = false;
		if let Some(uid) = uid {
			changed |= ino.uid != uid;
			ino.uid = uid;
		}
		if let Some(gid) = gid {
			changed |= ino.gid != gid;
			ino.gid = gid;
		}
		if changed {
			ino.mode &= !(S_ISUID | S_ISGID);
		}
		ino.touch_ctime();
		self.setattr_commit(inr, ino)
	}

	/// Set timestamps.  A nanosecond field of [`UTIME_NOW`] takes the
	/// current clock; [`UTIME_OMIT`] leaves the field alone.  ctime always
	/// moves.
	#[doc(alias = "utimens")]
	pub fn setattr_time(
		&mut self,
		inr: InodeNum,
		atime: Option<Timestamp>,
		mtime: Option<Timestamp>,
	) -> IoResult<InodeAttr> {
		log::trace!("setattr_time({inr});");
		self.assert_rw()?;
		let mut ino = self.iget(inr)?;
		let now = Timestamp::now();
		for (slot, new) in [(&mut ino.atime, atime), (&mut ino.mtime, mtime)] {
			match new {
				None => {}
				Some(t) if t.nsec == UTIME_OMIT => {}
				Some(t) if t.nsec == UTIME_NOW => *slot = now,
				Some(t) => *slot = t,
			}
		}
		ino.ctime = now;
		self.setattr_commit(inr, ino)
	}

	fn setattr_commit(&mut self, inr: InodeNum, ino: Inode) -> IoResult<InodeAttr> {
		let mut tx = self.trans_alloc("setattr");
		let res = Reservation::setattr(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, 1024) {
			self.trans_cancel(tx);
			return Err(e);
		}
		let attr = ino.as_attr(inr, self.superblock.blocksize);
		tx.join_inode(inr, ino);
		tx.log_inode(inr, LogFlags::CORE);
		self.trans_commit(tx)?;
		Ok(attr)
	}

	/// Change a regular file's length.  Shrinking frees every whole block
	/// past the boundary; growing is sparse.
	pub fn truncate(&mut self, inr: InodeNum, new_size: u64) -> IoResult<()> {
		log::trace!("truncate({inr}, {new_size});");
		self.assert_rw()?;
		let mut ino = self.iget(inr)?;
		if !ino.is_reg() {
			return Err(err!(EINVAL));
		}

		let mut tx = self.trans_alloc("truncate");
		let res = Reservation::truncate(&self.superblock);
		if let Err(e) = self.trans_reserve(&mut tx, res, 4096) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			if new_size < ino.size {
				let bs = self.superblock.blocksize as u64;
				self.shrink_extents(&mut tx, inr, &mut ino, new_size.div_ceil(bs))?;
			}
			ino.size = new_size;
			ino.touch_mtime();
			tx.join_inode(inr, ino.clone());
			tx.log_inode(inr, LogFlags::CORE | LogFlags::DEXT | LogFlags::DBROOT);
			Ok(())
		})();

		match r {
			Ok(()) => self.trans_commit(tx),
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}

	/// Write file content, materializing holes.  Returns the byte count
	/// actually written; once anything is written, later chunk failures
	/// surface as a short count instead of an error.
	pub fn inode_write(&mut self, inr: InodeNum, offset: u64, data: &[u8]) -> IoResult<usize> {
		log::trace!("inode_write({inr}, {offset}, {});", data.len());
		self.assert_rw()?;
		{
			let ino = self.iget(inr)?;
			if ino.is_dir() {
				return Err(err!(EISDIR));
			}
			if !ino.is_reg() {
				return Err(err!(EINVAL));
			}
		}
		if data.is_empty() {
			return Ok(0);
		}

		let bs = self.superblock.blocksize as u64;
		// chunks end on block boundaries so later chunks never rewrite
		// finished blocks
		let max_chunk_blocks = 256u64;

		let mut written = 0usize;
		while written < data.len() {
			let pos = offset + written as u64;
			let chunk_end = ((pos / bs + max_chunk_blocks) * bs).min(offset + data.len() as u64);
			let chunk = &data[written..(chunk_end - offset) as usize];

			match self.write_chunk(inr, pos, chunk) {
				Ok(()) => written += chunk.len(),
				Err(e) => {
					log::warn!("inode_write({inr}): chunk at {pos} failed: {e}");
					return if written > 0 { Ok(written) } else { Err(e) };
				}
			}
		}
		Ok(written)
	}

	fn write_chunk(&mut self, inr: InodeNum, offset: u64, data: &[u8]) -> IoResult<()> {
		let bs = self.superblock.blocksize as u64;
		let off_fsb = offset / bs;
		let end_fsb = (offset + data.len() as u64).div_ceil(bs);
		let count_fsb = end_fsb - off_fsb;

		let mut tx = self.trans_alloc("write");
		let res = Reservation::write(&self.superblock, count_fsb);
		if let Err(e) = self.trans_reserve(&mut tx, res, (res * 128) as u32) {
			self.trans_cancel(tx);
			return Err(e);
		}

		let r = (|| {
			let mut ino = self.iget(inr)?;
			let old_extents = ino.data.extents().to_vec();
			let old_size = ino.size;
			self.ensure_mapped(&mut tx, inr, &mut ino, off_fsb, count_fsb)?;

			let mut done = 0usize;
			while done < data.len() {
				let pos = offset + done as u64;
				let fsb = pos / bs;
				let in_blk = (pos % bs) as usize;
				let n = (bs as usize - in_blk).min(data.len() - done);

				let e = super::bmap::extent_at(ino.data.extents(), fsb)
					.copied()
					.ok_or_else(|| err!(EIO))?;
				let blkno = e.startblock + (fsb - e.startoff);
				let blk_pos = self.superblock.fsb_to_byte(blkno);

				// whole-block overwrites and freshly-materialized holes
				// skip the read; the latter must read back as zeroes
				let was_hole = super::bmap::extent_at(&old_extents, fsb).is_none();
				let bi = if was_hole || (in_blk == 0 && n == bs as usize) {
					self.trans_get_buf(&mut tx, blk_pos, bs as usize, BufKind::FileData)
				} else {
					self.trans_read_buf(&mut tx, blk_pos, bs as usize, BufKind::FileData)?
				};
				{
					let buf = tx.buf_mut(bi);
					buf[in_blk..in_blk + n].copy_from_slice(&data[done..done + n]);
					// a write past EOF must not expose stale bytes between
					// the old end and the new data
					let blk_byte = fsb * bs;
					if !was_hole && old_size < pos {
						let from = old_size.saturating_sub(blk_byte) as usize;
						if from < in_blk {
							buf[from..in_blk].fill(0);
						}
					}
				}
				tx.log_buf_full(bi);
				done += n;
			}

			if offset + data.len() as u64 > ino.size {
				ino.size = offset + data.len() as u64;
			}
			ino.touch_mtime();
			tx.join_inode(inr, ino.clone());
			tx.log_inode(
				inr,
				LogFlags::CORE | LogFlags::DEXT | LogFlags::DBROOT,
			);
			Ok(())
		})();

		match r {
			Ok(()) => self.trans_commit(tx),
			Err(e) => {
				self.trans_cancel(tx);
				Err(e)
			}
		}
	}
}
