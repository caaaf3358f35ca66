//! End-to-end tests over synthesized images.

use std::{collections::HashMap, ffi::OsStr, path::Path};

use crate::{
	testfs::{self, ImageOpts, ROOT_INO},
	Backend, Cred, InodeNum, InodeType, Timestamp, Xfs, UTIME_NOW, UTIME_OMIT,
};

fn errno(e: std::io::Error) -> i32 {
	e.raw_os_error().unwrap_or(0)
}

fn cred() -> Cred {
	Cred {
		uid: 1000,
		gid: 100,
	}
}

fn create<R: Backend>(x: &mut Xfs<R>, pinr: InodeNum, name: &str, mode: u32) -> InodeNum {
	x.create(pinr, OsStr::new(name), libc::S_IFREG as u32 | mode, 0, cred())
		.unwrap()
}

fn readdir_all<R: Backend>(x: &mut Xfs<R>, inr: InodeNum, batch: usize) -> Vec<(String, u64)> {
	let mut out: Vec<(String, u64)> = Vec::new();
	let mut cookie = 0u64;
	loop {
		let mut n = 0usize;
		let mut last = cookie;
		x.dir_iter(inr, cookie, |name, ino, _kind, next| {
			out.push((name.to_string_lossy().into_owned(), ino.get()));
			last = next;
			n += 1;
			if n >= batch {
				Some(())
			} else {
				None
			}
		})
		.unwrap();
		if n < batch {
			break;
		}
		cookie = last;
	}
	out
}

mod mount {
	use super::*;

	#[test]
	fn fresh_v5_geometry() {
		let mut x = testfs::mount();
		let root = x.root();
		assert_eq!(root.get(), ROOT_INO);

		let st = x.inode_attr(root).unwrap();
		assert_eq!(st.kind, InodeType::Directory);
		assert_eq!(st.perm, 0o755);
		assert_eq!(st.nlink, 2);

		let info = x.info();
		assert_eq!(info.bsize, testfs::BS as u32);
		assert!(info.bfree > 0);
		assert_eq!(info.files, 64);
		assert_eq!(info.ffree, 63);

		x.check_consistency().unwrap();
	}

	#[test]
	fn fresh_v4_geometry() {
		let mut x = testfs::mount_opts(ImageOpts {
			v5:    false,
			ftype: true,
		});
		let st = x.inode_attr(x.root()).unwrap();
		assert_eq!(st.kind, InodeType::Directory);
		x.check_consistency().unwrap();
	}

	#[test]
	fn corrupt_superblock_magic_fails() {
		let mut img = testfs::mkimage(ImageOpts::default());
		img[0] ^= 0xff;
		let br = crate::BlockReader::new(std::io::Cursor::new(img), testfs::BS, false);
		assert!(Xfs::new(br).is_err());
	}

	#[test]
	fn corrupt_superblock_crc_fails() {
		let mut img = testfs::mkimage(ImageOpts::default());
		// flip a byte the decoder itself does not reject
		img[108] ^= 0x01; // sb_fname
		let br = crate::BlockReader::new(std::io::Cursor::new(img), testfs::BS, false);
		assert!(Xfs::new(br).is_err());
	}

	#[test]
	fn readonly_mount_refuses_writes() {
		let img = testfs::mkimage(ImageOpts::default());
		let br = crate::BlockReader::new(std::io::Cursor::new(img), testfs::BS, false);
		let mut x = Xfs::new(br).unwrap();
		assert!(x.readonly());
		let root = x.root();
		let e = x
			.create(root, OsStr::new("z"), libc::S_IFREG as u32 | 0o644, 0, cred())
			.unwrap_err();
		assert_eq!(errno(e), libc::EROFS);
		// reads still work
		x.inode_attr(root).unwrap();
	}

	#[test]
	fn unmount_is_idempotent() {
		let mut x = testfs::mount();
		x.unmount().unwrap();
		x.unmount().unwrap();
	}
}

mod files {
	use super::*;

	#[test]
	fn create_write_read() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "a.txt", 0o644);

		let st = x.inode_attr(f).unwrap();
		assert_eq!(st.kind, InodeType::RegularFile);
		assert_eq!(st.perm, 0o644);
		assert_eq!(st.uid, 1000);
		assert_eq!(st.gid, 100);
		assert_eq!(st.nlink, 1);

		assert_eq!(x.inode_write(f, 0, b"hello").unwrap(), 5);
		let mut buf = [0u8; 5];
		assert_eq!(x.inode_read(f, 0, &mut buf).unwrap(), 5);
		assert_eq!(&buf, b"hello");
		assert_eq!(x.inode_attr(f).unwrap().size, 5);

		assert_eq!(x.lookup_by_path(Path::new("/a.txt")).unwrap(), f);
		x.check_consistency().unwrap();
	}

	#[test]
	fn large_write_roundtrip() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "big", 0o600);

		let data: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
		assert_eq!(x.inode_write(f, 0, &data).unwrap(), data.len());

		let mut back = vec![0u8; data.len()];
		assert_eq!(x.inode_read(f, 0, &mut back).unwrap(), data.len());
		assert_eq!(back, data);

		let st = x.inode_attr(f).unwrap();
		assert_eq!(st.size, data.len() as u64);
		assert!(st.blocks >= (data.len() as u64 / 512));
		x.check_consistency().unwrap();
	}

	#[test]
	fn sparse_write_reads_zeroes() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "sparse", 0o644);

		let far = 10 * testfs::BS as u64 + 17;
		assert_eq!(x.inode_write(f, far, b"tail").unwrap(), 4);
		assert_eq!(x.inode_attr(f).unwrap().size, far + 4);

		// the hole reads as zeroes
		let mut buf = vec![0xaau8; 2 * testfs::BS];
		let n = x.inode_read(f, 0, &mut buf).unwrap();
		assert_eq!(n, buf.len());
		assert!(buf.iter().all(|b| *b == 0));

		// and the tail reads back
		let mut tail = [0u8; 4];
		assert_eq!(x.inode_read(f, far, &mut tail).unwrap(), 4);
		assert_eq!(&tail, b"tail");
		x.check_consistency().unwrap();
	}

	#[test]
	fn overwrite_middle_of_block() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "mid", 0o644);

		x.inode_write(f, 0, &vec![b'x'; 1000]).unwrap();
		x.inode_write(f, 100, b"YANK").unwrap();

		let mut buf = vec![0u8; 1000];
		x.inode_read(f, 0, &mut buf).unwrap();
		assert_eq!(&buf[100..104], b"YANK");
		assert!(buf[..100].iter().all(|b| *b == b'x'));
		assert!(buf[104..].iter().all(|b| *b == b'x'));
		assert_eq!(x.inode_attr(f).unwrap().size, 1000);
	}

	#[test]
	fn truncate_to_zero_frees_blocks() {
		let mut x = testfs::mount();
		let root = x.root();
		let before = x.info().bfree;
		let f = create(&mut x, root, "t", 0o644);

		x.inode_write(f, 0, &vec![7u8; 5 * testfs::BS]).unwrap();
		assert!(x.info().bfree < before);

		x.truncate(f, 0).unwrap();
		let st = x.inode_attr(f).unwrap();
		assert_eq!(st.size, 0);
		assert_eq!(st.blocks, 0);
		assert_eq!(x.info().bfree, before);
		x.check_consistency().unwrap();
	}

	#[test]
	fn truncate_partial_and_sparse_grow() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "t2", 0o644);

		x.inode_write(f, 0, &vec![9u8; 3 * testfs::BS]).unwrap();
		x.truncate(f, testfs::BS as u64 + 10).unwrap();
		let st = x.inode_attr(f).unwrap();
		assert_eq!(st.size, testfs::BS as u64 + 10);

		// grow is sparse: size moves, blocks do not
		let blocks = st.blocks;
		x.truncate(f, 100 * testfs::BS as u64).unwrap();
		let st = x.inode_attr(f).unwrap();
		assert_eq!(st.size, 100 * testfs::BS as u64);
		assert_eq!(st.blocks, blocks);
		x.check_consistency().unwrap();
	}

	#[test]
	fn unlink_returns_space() {
		let mut x = testfs::mount();
		let root = x.root();
		let bfree = x.info().bfree;
		let ffree = x.info().ffree;

		let f = create(&mut x, root, "gone", 0o644);
		x.inode_write(f, 0, &vec![1u8; 64 * 1024]).unwrap();
		x.unlink(root, OsStr::new("gone")).unwrap();

		assert_eq!(
			errno(x.lookup_by_path(Path::new("/gone")).unwrap_err()),
			libc::ENOENT
		);
		assert_eq!(x.info().bfree, bfree);
		assert_eq!(x.info().ffree, ffree);
		x.check_consistency().unwrap();
	}

	#[test]
	fn mknod_devices() {
		let mut x = testfs::mount();
		let root = x.root();
		let dev = x
			.create(root, OsStr::new("null"), libc::S_IFCHR as u32 | 0o666, 0x0103, cred())
			.unwrap();
		let st = x.inode_attr(dev).unwrap();
		assert_eq!(st.kind, InodeType::CharDevice);
		assert_eq!(st.rdev, 0x0103);

		let fifo = x
			.create(root, OsStr::new("pipe"), libc::S_IFIFO as u32 | 0o600, 0, cred())
			.unwrap();
		assert_eq!(x.inode_attr(fifo).unwrap().kind, InodeType::NamedPipe);
		x.check_consistency().unwrap();
	}
}

mod links {
	use super::*;

	#[test]
	fn hard_link_survives_unlink() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "orig", 0o644);
		x.inode_write(f, 0, &[b'A'; 10]).unwrap();

		x.link(f, root, OsStr::new("hard")).unwrap();
		assert_eq!(x.inode_attr(f).unwrap().nlink, 2);

		x.unlink(root, OsStr::new("orig")).unwrap();
		let hard = x.lookup_by_path(Path::new("/hard")).unwrap();
		assert_eq!(hard, f);
		assert_eq!(x.inode_attr(hard).unwrap().nlink, 1);

		let mut buf = [0u8; 10];
		x.inode_read(hard, 0, &mut buf).unwrap();
		assert_eq!(&buf, b"AAAAAAAAAA");
		x.check_consistency().unwrap();
	}

	#[test]
	fn link_to_directory_is_eperm() {
		let mut x = testfs::mount();
		let root = x.root();
		let d = x.mkdir(root, OsStr::new("d"), 0o755, cred()).unwrap();
		let e = x.link(d, root, OsStr::new("d2")).unwrap_err();
		assert_eq!(errno(e), libc::EPERM);
	}

	#[test]
	fn symlink_roundtrip_inline() {
		let mut x = testfs::mount();
		let root = x.root();
		let s = x
			.symlink(root, OsStr::new("sym"), OsStr::new("../somewhere"), cred())
			.unwrap();
		assert_eq!(x.symlink_read(s).unwrap(), b"../somewhere");
		let st = x.inode_attr(s).unwrap();
		assert_eq!(st.kind, InodeType::Symlink);
		assert_eq!(st.size, 12);
		x.check_consistency().unwrap();
	}

	#[test]
	fn symlink_roundtrip_remote() {
		let mut x = testfs::mount();
		let root = x.root();
		// longer than the 336-byte inline fork of a 512-byte v3 inode
		let target: String = std::iter::repeat("../dir/").take(120).collect();
		let s = x
			.symlink(root, OsStr::new("far"), OsStr::new(&target), cred())
			.unwrap();
		assert_eq!(x.symlink_read(s).unwrap(), target.as_bytes());
		assert_eq!(x.inode_attr(s).unwrap().size, target.len() as u64);
		x.check_consistency().unwrap();
	}

	#[test]
	fn symlink_length_limits() {
		let mut x = testfs::mount();
		let root = x.root();
		let long = "x".repeat(1025);
		let e = x
			.symlink(root, OsStr::new("toolong"), OsStr::new(&long), cred())
			.unwrap_err();
		assert_eq!(errno(e), libc::ENAMETOOLONG);
		let e = x
			.symlink(root, OsStr::new("empty"), OsStr::new(""), cred())
			.unwrap_err();
		assert_eq!(errno(e), libc::EINVAL);
	}
}

mod dirs {
	use super::*;

	#[test]
	fn mkdir_rmdir_lifecycle() {
		let mut x = testfs::mount();
		let root = x.root();

		let dx = x.mkdir(root, OsStr::new("x"), 0o755, cred()).unwrap();
		assert_eq!(x.inode_attr(root).unwrap().nlink, 3);
		assert_eq!(x.inode_attr(dx).unwrap().nlink, 2);

		let dy = x.mkdir(dx, OsStr::new("y"), 0o755, cred()).unwrap();
		assert_eq!(x.inode_attr(dx).unwrap().nlink, 3);
		assert_eq!(x.lookup_by_path(Path::new("/x/y")).unwrap(), dy);

		let e = x.rmdir(root, OsStr::new("x")).unwrap_err();
		assert_eq!(errno(e), libc::ENOTEMPTY);

		x.rmdir(dx, OsStr::new("y")).unwrap();
		assert_eq!(x.inode_attr(dx).unwrap().nlink, 2);
		x.rmdir(root, OsStr::new("x")).unwrap();
		assert_eq!(x.inode_attr(root).unwrap().nlink, 2);
		assert_eq!(
			errno(x.lookup_by_path(Path::new("/x")).unwrap_err()),
			libc::ENOENT
		);
		x.check_consistency().unwrap();
	}

	#[test]
	fn name_rules() {
		let mut x = testfs::mount();
		let root = x.root();

		let e = x
			.create(root, OsStr::new(""), libc::S_IFREG as u32 | 0o644, 0, cred())
			.unwrap_err();
		assert_eq!(errno(e), libc::EINVAL);

		let max = "n".repeat(255);
		x.create(root, OsStr::new(&max), libc::S_IFREG as u32 | 0o644, 0, cred())
			.unwrap();

		let over = "n".repeat(256);
		let e = x
			.create(root, OsStr::new(&over), libc::S_IFREG as u32 | 0o644, 0, cred())
			.unwrap_err();
		assert_eq!(errno(e), libc::ENAMETOOLONG);

		let e = x
			.create(root, OsStr::new(&max), libc::S_IFREG as u32 | 0o644, 0, cred())
			.unwrap_err();
		assert_eq!(errno(e), libc::EEXIST);
	}

	#[test]
	fn readdir_emits_dot_first_in_every_form() {
		let mut x = testfs::mount();
		let root = x.root();
		let d = x.mkdir(root, OsStr::new("d"), 0o755, cred()).unwrap();

		// shortform
		for i in 0..4 {
			create(&mut x, d, &format!("sf{i}"), 0o644);
		}
		let got = readdir_all(&mut x, d, 100);
		assert_eq!(got[0].0, ".");
		assert_eq!(got[0].1, d.get());
		assert_eq!(got[1].0, "..");
		assert_eq!(got[1].1, root.get());
		assert_eq!(got.len(), 6);

		// grow into block form and beyond
		for i in 4..200 {
			create(&mut x, d, &format!("sf{i}"), 0o644);
		}
		let got = readdir_all(&mut x, d, 7);
		assert_eq!(got[0].0, ".");
		assert_eq!(got[1].0, "..");
		assert_eq!(got.len(), 202);
		x.check_consistency().unwrap();
	}

	#[test]
	fn readdir_block_form_pagination() {
		let mut x = testfs::mount();
		let root = x.root();
		let d = x.mkdir(root, OsStr::new("blk"), 0o755, cred()).unwrap();

		let mut want = HashMap::new();
		for i in 0..80 {
			let name = format!("entry{i:03}");
			let inr = create(&mut x, d, &name, 0o644);
			want.insert(name, inr.get());
		}

		for batch in [1, 3, 7, 1000] {
			let got = readdir_all(&mut x, d, batch);
			assert_eq!(got[0].0, ".");
			assert_eq!(got[1].0, "..");
			let got_map: HashMap<String, u64> = got[2..].iter().cloned().collect();
			assert_eq!(got_map, want, "batch size {batch}");
			assert_eq!(got.len(), want.len() + 2, "no duplicates at batch {batch}");
		}
	}

	#[test]
	fn many_entries_node_form() {
		let mut x = testfs::mount();
		let root = x.root();
		let d = x.mkdir(root, OsStr::new("many"), 0o755, cred()).unwrap();

		let mut want = HashMap::new();
		for i in 0..1200 {
			let name = format!("frame{i:06}.tst");
			let inr = create(&mut x, d, &name, 0o644);
			want.insert(name, inr.get());
		}
		x.check_consistency().unwrap();

		// every name resolves through the hash path
		for (name, ino) in &want {
			let inr = x.dir_lookup(d, OsStr::new(name)).unwrap();
			assert_eq!(inr.get(), *ino, "lookup of {name}");
		}

		// pagination covers the whole set exactly once
		let got = readdir_all(&mut x, d, 128);
		assert_eq!(got[0].0, ".");
		assert_eq!(got[1].0, "..");
		let got_map: HashMap<String, u64> = got[2..].iter().cloned().collect();
		assert_eq!(got_map.len(), got.len() - 2, "no duplicate names");
		assert_eq!(got_map, want);

		// and the directory drains cleanly
		for name in want.keys() {
			x.unlink(d, OsStr::new(name)).unwrap();
		}
		assert_eq!(readdir_all(&mut x, d, 100).len(), 2);
		x.rmdir(root, OsStr::new("many")).unwrap();
		x.check_consistency().unwrap();
	}

	#[test]
	fn shrink_back_to_shortform() {
		let mut x = testfs::mount();
		let root = x.root();
		let d = x.mkdir(root, OsStr::new("shrink"), 0o755, cred()).unwrap();

		for i in 0..60 {
			create(&mut x, d, &format!("f{i}"), 0o644);
		}
		for i in 0..60 {
			x.unlink(d, &std::ffi::OsString::from(format!("f{i}"))).unwrap();
		}
		assert_eq!(readdir_all(&mut x, d, 100).len(), 2);
		x.rmdir(root, OsStr::new("shrink")).unwrap();
		x.check_consistency().unwrap();
	}
}

mod rename {
	use super::*;

	#[test]
	fn simple_rename() {
		let mut x = testfs::mount();
		let root = x.root();
		let d = x.mkdir(root, OsStr::new("d"), 0o755, cred()).unwrap();
		let f = create(&mut x, d, "f", 0o600);

		x.rename(d, OsStr::new("f"), d, OsStr::new("g")).unwrap();
		assert_eq!(x.lookup_by_path(Path::new("/d/g")).unwrap(), f);
		assert_eq!(
			errno(x.lookup_by_path(Path::new("/d/f")).unwrap_err()),
			libc::ENOENT
		);
		x.check_consistency().unwrap();
	}

	#[test]
	fn rename_same_name_is_noop() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "same", 0o644);
		x.rename(root, OsStr::new("same"), root, OsStr::new("same"))
			.unwrap();
		assert_eq!(x.lookup_by_path(Path::new("/same")).unwrap(), f);
	}

	#[test]
	fn rename_overwrites_file() {
		let mut x = testfs::mount();
		let root = x.root();
		let ffree = x.info().ffree;
		let a = create(&mut x, root, "a", 0o644);
		let _b = create(&mut x, root, "b", 0o644);

		x.rename(root, OsStr::new("a"), root, OsStr::new("b")).unwrap();
		assert_eq!(x.lookup_by_path(Path::new("/b")).unwrap(), a);
		assert_eq!(
			errno(x.lookup_by_path(Path::new("/a")).unwrap_err()),
			libc::ENOENT
		);
		// the old `b` went away entirely
		assert_eq!(x.info().ffree, ffree - 1);
		x.check_consistency().unwrap();
	}

	#[test]
	fn rename_directory_updates_dotdot_and_links() {
		let mut x = testfs::mount();
		let root = x.root();
		let d1 = x.mkdir(root, OsStr::new("d1"), 0o755, cred()).unwrap();
		let d2 = x.mkdir(root, OsStr::new("d2"), 0o755, cred()).unwrap();
		let sub = x.mkdir(d1, OsStr::new("sub"), 0o755, cred()).unwrap();
		assert_eq!(x.inode_attr(d1).unwrap().nlink, 3);

		x.rename(d1, OsStr::new("sub"), d2, OsStr::new("moved")).unwrap();
		assert_eq!(x.lookup_by_path(Path::new("/d2/moved")).unwrap(), sub);
		assert_eq!(x.inode_attr(d1).unwrap().nlink, 2);
		assert_eq!(x.inode_attr(d2).unwrap().nlink, 3);
		// `..` follows the move
		assert_eq!(x.dir_lookup(sub, OsStr::new("..")).unwrap(), d2);
		x.check_consistency().unwrap();
	}

	#[test]
	fn rename_into_own_subtree_is_einval() {
		let mut x = testfs::mount();
		let root = x.root();
		let a = x.mkdir(root, OsStr::new("a"), 0o755, cred()).unwrap();
		let b = x.mkdir(a, OsStr::new("b"), 0o755, cred()).unwrap();

		let e = x.rename(root, OsStr::new("a"), b, OsStr::new("in")).unwrap_err();
		assert_eq!(errno(e), libc::EINVAL);
		let e = x.rename(root, OsStr::new("a"), a, OsStr::new("in")).unwrap_err();
		assert_eq!(errno(e), libc::EINVAL);
	}

	#[test]
	fn rename_dir_over_nonempty_dir_fails() {
		let mut x = testfs::mount();
		let root = x.root();
		let a = x.mkdir(root, OsStr::new("a"), 0o755, cred()).unwrap();
		let b = x.mkdir(root, OsStr::new("b"), 0o755, cred()).unwrap();
		create(&mut x, b, "occupied", 0o644);
		let _ = a;

		let e = x.rename(root, OsStr::new("a"), root, OsStr::new("b")).unwrap_err();
		assert_eq!(errno(e), libc::ENOTEMPTY);

		// empty destination is fair game
		x.unlink(b, OsStr::new("occupied")).unwrap();
		x.rename(root, OsStr::new("a"), root, OsStr::new("b")).unwrap();
		assert_eq!(x.inode_attr(root).unwrap().nlink, 3);
		x.check_consistency().unwrap();
	}
}

mod attrs {
	use super::*;

	#[test]
	fn chmod_preserves_type() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "m", 0o644);
		let st = x.setattr_mode(f, 0o4711).unwrap();
		assert_eq!(st.perm, 0o4711);
		assert_eq!(st.kind, InodeType::RegularFile);
	}

	#[test]
	fn chown_clears_setuid() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "s", 0o644);
		x.setattr_mode(f, 0o6755).unwrap();

		// chown to the same ids keeps the bits
		let st = x.setattr_owner(f, Some(1000), Some(100)).unwrap();
		assert_eq!(st.perm & 0o6000, 0o6000);

		let st = x.setattr_owner(f, Some(0), None).unwrap();
		assert_eq!(st.uid, 0);
		assert_eq!(st.perm & 0o6000, 0);
	}

	#[test]
	fn utimens_sentinels() {
		let mut x = testfs::mount();
		let root = x.root();
		let f = create(&mut x, root, "times", 0o644);

		let past = Timestamp {
			sec:  1_000_000,
			nsec: 42,
		};
		let st = x.setattr_time(f, Some(past), None).unwrap();
		assert_eq!(
			st.atime,
			std::time::SystemTime::UNIX_EPOCH + std::time::Duration::new(1_000_000, 42)
		);

		let omit = Timestamp {
			sec:  0,
			nsec: UTIME_OMIT,
		};
		let now = Timestamp {
			sec:  0,
			nsec: UTIME_NOW,
		};
		let st2 = x.setattr_time(f, Some(omit), Some(now)).unwrap();
		assert_eq!(st2.atime, st.atime, "omitted field is untouched");
		assert!(st2.mtime > st.atime);
	}
}

mod persistence {
	use super::*;

	#[test]
	fn remount_preserves_everything() {
		let path = testfs::image_file(ImageOpts::default());

		let (f_ino, d_ino, s_ino);
		{
			let mut x = Xfs::open(&path, true).unwrap();
			let root = x.root();
			f_ino = create(&mut x, root, "file", 0o640);
			x.inode_write(f_ino, 0, b"persist me").unwrap();
			d_ino = x.mkdir(root, OsStr::new("dir"), 0o700, cred()).unwrap();
			s_ino = x
				.symlink(root, OsStr::new("ln"), OsStr::new("file"), cred())
				.unwrap();
			for i in 0..50 {
				create(&mut x, d_ino, &format!("inner{i}"), 0o644);
			}
			x.unmount().unwrap();
		}

		let mut x = Xfs::open(&path, true).unwrap();
		x.check_consistency().unwrap();
		assert_eq!(x.lookup_by_path(Path::new("/file")).unwrap(), f_ino);
		assert_eq!(x.lookup_by_path(Path::new("/dir")).unwrap(), d_ino);
		assert_eq!(x.lookup_by_path(Path::new("/ln")).unwrap(), s_ino);

		let mut buf = [0u8; 10];
		x.inode_read(f_ino, 0, &mut buf).unwrap();
		assert_eq!(&buf, b"persist me");
		assert_eq!(x.symlink_read(s_ino).unwrap(), b"file");
		assert_eq!(x.inode_attr(f_ino).unwrap().perm, 0o640);
		assert_eq!(readdir_all(&mut x, d_ino, 16).len(), 52);
		assert_eq!(x.dir_lookup(d_ino, OsStr::new("..")).unwrap(), x.root());
	}

	#[test]
	fn failed_operation_leaves_no_trace() {
		let mut x = testfs::mount();
		let root = x.root();
		let bfree = x.info().bfree;
		let ffree = x.info().ffree;

		create(&mut x, root, "present", 0o644);
		// creating it again fails before anything is staged
		let e = x
			.create(root, OsStr::new("present"), libc::S_IFREG as u32 | 0o644, 0, cred())
			.unwrap_err();
		assert_eq!(errno(e), libc::EEXIST);
		assert_eq!(x.info().bfree, bfree);
		assert_eq!(x.info().ffree, ffree - 1);
		x.check_consistency().unwrap();
	}

	#[test]
	fn v4_image_full_lifecycle() {
		let mut x = testfs::mount_opts(ImageOpts {
			v5:    false,
			ftype: false,
		});
		let root = x.root();
		let f = create(&mut x, root, "old-school", 0o644);
		x.inode_write(f, 0, b"v4").unwrap();
		let mut buf = [0u8; 2];
		x.inode_read(f, 0, &mut buf).unwrap();
		assert_eq!(&buf, b"v4");
		let d = x.mkdir(root, OsStr::new("dir"), 0o755, cred()).unwrap();
		for i in 0..40 {
			create(&mut x, d, &format!("e{i}"), 0o644);
		}
		// without FTYPE the engine reports unknown kinds
		x.dir_iter(d, 0, |name, _ino, kind, _next| {
			if name != "." && name != ".." {
				assert_eq!(kind, None);
			}
			None::<()>
		})
		.unwrap();
		x.unlink(d, OsStr::new("e7")).unwrap();
		x.check_consistency().unwrap();
	}
}
