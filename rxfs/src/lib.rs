#![cfg_attr(fuzzing, allow(dead_code, unused_imports, unused_mut))]

mod blockreader;
mod cksum;
mod data;
mod decoder;
mod inode;
#[cfg(test)]
mod testfs;
#[cfg(test)]
mod tests;
mod xfs;

#[cfg(feature = "lru")]
use std::num::NonZeroUsize;

#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "macos"))]
pub const ENOATTR: i32 = libc::ENOATTR;
#[cfg(target_os = "linux")]
pub const ENOATTR: i32 = libc::ENODATA;

pub(crate) fn enoattr() -> std::io::Error {
	std::io::Error::from_raw_os_error(ENOATTR)
}

#[cfg(feature = "icache")]
const ICACHE_SIZE: usize = 1024;

#[cfg(feature = "dcache")]
const DCACHE_SIZE: usize = 4096;

#[cfg(feature = "bcache")]
const BCACHE_SIZE: usize = 256;

#[cfg(feature = "lru")]
fn new_lru<K: std::hash::Hash + Eq, V>(size: usize) -> lru::LruCache<K, V> {
	lru::LruCache::new(NonZeroUsize::new(size).unwrap())
}

pub use crate::{
	blockreader::{Backend, BlockReader},
	data::{InodeAttr, InodeNum, InodeType, Timestamp, UTIME_NOW, UTIME_OMIT},
	xfs::{Cred, Info, Xfs},
};
