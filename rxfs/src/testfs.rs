//! Miniature volume formatter for the test suite.  Builds a 2-AG image
//! in memory with the crate's own encoders; geometry mirrors a small
//! `mkfs.xfs` run (4K blocks, 512-byte inodes, 64-inode root chunk).

use std::io::Cursor;

use crate::{
	cksum,
	data::*,
	decoder,
	xfs::{encode_dinode, init_inode_record},
};

pub const BS: usize = 4096;
pub const SECT: usize = 512;
pub const ISIZE: usize = 512;
pub const AGBLOCKS: u32 = 1024;
pub const AGCOUNT: u32 = 2;
pub const ROOT_INO: u64 = 128;

const LOG_START: u64 = 512;
const LOG_BLOCKS: u32 = 64;
const CHUNK_START: u32 = 16; // agbno of the root inode chunk
const AGFL_BLOCKS: [u32; 4] = [5, 6, 7, 8];

/// AG0 free extents: between the AGFL reserve and the chunk, between the
/// chunk and the log, and after the log.
const AG0_FREE: [(u32, u32); 3] = [
	(9, 7),
	(24, LOG_START as u32 - 24),
	(LOG_START as u32 + LOG_BLOCKS, AGBLOCKS - (LOG_START as u32 + LOG_BLOCKS)),
];
/// AG1 free extents: everything past the headers and btree roots.
const AG1_FREE: [(u32, u32); 1] = [(9, AGBLOCKS - 9)];

pub struct ImageOpts {
	pub v5:    bool,
	pub ftype: bool,
}

impl Default for ImageOpts {
	fn default() -> Self {
		Self {
			v5:    true,
			ftype: true,
		}
	}
}

fn build_sb(opts: &ImageOpts) -> Superblock {
	let mut versionnum: u16 = if opts.v5 { 5 } else { 4 };
	versionnum |= (SbVersion::ATTRBIT
		| SbVersion::NLINKBIT
		| SbVersion::ALIGNBIT
		| SbVersion::EXTFLGBIT
		| SbVersion::DIRV2BIT
		| SbVersion::MOREBITSBIT)
		.bits();

	let mut features2 = (SbFeatures2::LAZYSBCOUNT | SbFeatures2::ATTR2 | SbFeatures2::PROJID32).bits();
	if opts.v5 {
		features2 |= SbFeatures2::CRC.bits();
	} else if opts.ftype {
		features2 |= SbFeatures2::FTYPE.bits();
	}

	let ag0_free: u64 = AG0_FREE.iter().map(|(_, l)| *l as u64).sum();
	let ag1_free: u64 = AG1_FREE.iter().map(|(_, l)| *l as u64).sum();

	Superblock {
		magicnum: XFS_SB_MAGIC,
		blocksize: BS as u32,
		dblocks: (AGCOUNT * AGBLOCKS) as u64,
		rblocks: 0,
		rextents: 0,
		uuid: *uuid::Uuid::from_u128(0x53a0_5b1c_9d02_4cf3_93f1_d1b544c3a1aa).as_bytes(),
		logstart: LOG_START,
		rootino: ROOT_INO,
		rbmino: 0,
		rsumino: 0,
		rextsize: 16,
		agblocks: AGBLOCKS,
		agcount: AGCOUNT,
		rbmblocks: 0,
		logblocks: LOG_BLOCKS,
		versionnum,
		sectsize: SECT as u16,
		inodesize: ISIZE as u16,
		inopblock: (BS / ISIZE) as u16,
		fname: *b"rxfs-test\0\0\0",
		blocklog: 12,
		sectlog: 9,
		inodelog: 9,
		inopblog: 3,
		agblklog: 10,
		rextslog: 0,
		inprogress: 0,
		imax_pct: 25,
		icount: 64,
		ifree: 63,
		fdblocks: ag0_free + ag1_free,
		frextents: 0,
		uquotino: 0,
		gquotino: 0,
		qflags: 0,
		flags: 0,
		shared_vn: 0,
		inoalignmt: 8,
		unit: 0,
		width: 0,
		dirblklog: 0,
		logsectlog: 0,
		logsectsize: 0,
		logsunit: 1,
		features2,
		bad_features2: features2,
		features_compat: 0,
		features_ro_compat: if opts.v5 { SbRoCompat::FINOBT.bits() } else { 0 },
		features_incompat: if opts.v5 && opts.ftype {
			SbIncompat::FTYPE.bits()
		} else {
			0
		},
		features_log_incompat: 0,
		crc: 0,
		spino_align: 0,
		pquotino: 0,
		lsn: 0,
		meta_uuid: [0; 16],
	}
}

fn write_at(img: &mut [u8], pos: u64, bytes: &[u8]) {
	img[pos as usize..pos as usize + bytes.len()].copy_from_slice(bytes);
}

/// Serialize a short-form btree root leaf.
fn btree_block(
	sb: &Superblock,
	magic: u32,
	agno: u32,
	agbno: u32,
	recs: &[Vec<u8>],
	crc_off: Option<usize>,
) -> Vec<u8> {
	let mut blk = vec![0u8; BS];
	blk[0..4].copy_from_slice(&magic.to_be_bytes());
	blk[4..6].copy_from_slice(&0u16.to_be_bytes()); // leaf level
	blk[6..8].copy_from_slice(&(recs.len() as u16).to_be_bytes());
	blk[8..12].copy_from_slice(&NULLAGBLOCK.to_be_bytes());
	blk[12..16].copy_from_slice(&NULLAGBLOCK.to_be_bytes());
	let hdr = if sb.is_v5() {
		let daddr = (sb.ag_byte(agno) + ((agbno as u64) << sb.blocklog)) / 512;
		blk[16..24].copy_from_slice(&daddr.to_be_bytes());
		blk[32..48].copy_from_slice(&sb.uuid);
		blk[48..52].copy_from_slice(&agno.to_be_bytes());
		BTREE_SBLOCK_CRC_LEN
	} else {
		BTREE_SBLOCK_LEN
	};
	for (i, rec) in recs.iter().enumerate() {
		let o = hdr + i * rec.len();
		blk[o..o + rec.len()].copy_from_slice(rec);
	}
	if let Some(off) = crc_off {
		cksum::update(&mut blk, off);
	}
	blk
}

fn alloc_rec(bno: u32, len: u32) -> Vec<u8> {
	let mut r = vec![0u8; 8];
	r[0..4].copy_from_slice(&bno.to_be_bytes());
	r[4..8].copy_from_slice(&len.to_be_bytes());
	r
}

fn ino_rec(startino: u32, freecount: u32, free: u64) -> Vec<u8> {
	let mut r = vec![0u8; 16];
	r[0..4].copy_from_slice(&startino.to_be_bytes());
	r[4..8].copy_from_slice(&freecount.to_be_bytes());
	r[8..16].copy_from_slice(&free.to_be_bytes());
	r
}

fn format_ag(img: &mut [u8], sb: &Superblock, agno: u32, free: &[(u32, u32)], with_inodes: bool) {
	let v5 = sb.is_v5();
	let base = sb.ag_byte(agno);

	// AGF
	let agf = Agf {
		magicnum: XFS_AGF_MAGIC,
		versionnum: 1,
		seqno: agno,
		length: AGBLOCKS,
		bno_root: 1,
		cnt_root: 2,
		rmap_root: 0,
		bno_level: 1,
		cnt_level: 1,
		rmap_level: 0,
		flfirst: 0,
		fllast: AGFL_BLOCKS.len() as u32 - 1,
		flcount: AGFL_BLOCKS.len() as u32,
		freeblks: free.iter().map(|(_, l)| *l).sum(),
		longest: free.iter().map(|(_, l)| *l).max().unwrap_or(0),
		btreeblks: 0,
		uuid: sb.uuid,
		rmap_blocks: 0,
		refcount_blocks: 0,
		refcount_root: 0,
		refcount_level: 0,
		spare64: [0; 14],
		lsn: 0,
		crc: 0,
		spare2: 0,
	};
	let mut sector = vec![0u8; SECT];
	decoder::encode_slice(&mut sector, &agf).unwrap();
	if v5 {
		cksum::update(&mut sector, AGF_CRC_OFF);
	}
	write_at(img, base + SECT as u64, &sector);

	// AGI
	let (count, freecount) = if with_inodes { (64, 63) } else { (0, 0) };
	let agi = Agi {
		magicnum: XFS_AGI_MAGIC,
		versionnum: 1,
		seqno: agno,
		length: AGBLOCKS,
		count,
		root: 3,
		level: 1,
		freecount,
		newino: if with_inodes { (CHUNK_START as u64 * 8) as u32 } else { NULLAGINO },
		dirino: NULLAGINO,
		unlinked: [NULLAGINO; 64],
		uuid: sb.uuid,
		crc: 0,
		pad32: 0,
		lsn: 0,
		free_root: if v5 { 4 } else { 0 },
		free_level: if v5 { 1 } else { 0 },
		iblocks: 1,
		fblocks: 1,
	};
	let mut sector = vec![0u8; SECT];
	decoder::encode_slice(&mut sector, &agi).unwrap();
	if v5 {
		cksum::update(&mut sector, AGI_CRC_OFF);
	}
	write_at(img, base + 2 * SECT as u64, &sector);

	// AGFL
	let mut sector = vec![0u8; SECT];
	let hdr = if v5 {
		sector[0..4].copy_from_slice(&XFS_AGFL_MAGIC.to_be_bytes());
		sector[4..8].copy_from_slice(&agno.to_be_bytes());
		sector[8..24].copy_from_slice(&sb.uuid);
		AGFL_HDR_SIZE_V5
	} else {
		0
	};
	for (i, b) in AGFL_BLOCKS.iter().enumerate() {
		sector[hdr + i * 4..hdr + i * 4 + 4].copy_from_slice(&b.to_be_bytes());
	}
	// unused slots are NULL
	let slots = (SECT - hdr) / 4;
	for i in AGFL_BLOCKS.len()..slots {
		sector[hdr + i * 4..hdr + i * 4 + 4].copy_from_slice(&NULLAGBLOCK.to_be_bytes());
	}
	if v5 {
		cksum::update(&mut sector, AGFL_CRC_OFF);
	}
	write_at(img, base + 3 * SECT as u64, &sector);

	// free-space trees
	let bno_recs: Vec<Vec<u8>> = free.iter().map(|(b, l)| alloc_rec(*b, *l)).collect();
	let mut cnt_sorted = free.to_vec();
	cnt_sorted.sort_by_key(|(b, l)| (*l, *b));
	let cnt_recs: Vec<Vec<u8>> = cnt_sorted.iter().map(|(b, l)| alloc_rec(*b, *l)).collect();
	let (bno_magic, cnt_magic, crc_off) = if v5 {
		(XFS_ABTB_CRC_MAGIC, XFS_ABTC_CRC_MAGIC, Some(BTREE_SBLOCK_CRC_OFF))
	} else {
		(XFS_ABTB_MAGIC, XFS_ABTC_MAGIC, None)
	};
	write_at(img, base + BS as u64, &btree_block(sb, bno_magic, agno, 1, &bno_recs, crc_off));
	write_at(img, base + 2 * BS as u64, &btree_block(sb, cnt_magic, agno, 2, &cnt_recs, crc_off));

	// inode trees
	let chunk = if with_inodes {
		vec![ino_rec(CHUNK_START * 8, 63, u64::MAX & !1)]
	} else {
		Vec::new()
	};
	let (ibt_magic, fibt_magic) = if v5 {
		(XFS_IBT_CRC_MAGIC, XFS_FIBT_CRC_MAGIC)
	} else {
		(XFS_IBT_MAGIC, XFS_FIBT_MAGIC)
	};
	write_at(img, base + 3 * BS as u64, &btree_block(sb, ibt_magic, agno, 3, &chunk, crc_off));
	if v5 {
		write_at(img, base + 4 * BS as u64, &btree_block(sb, fibt_magic, agno, 4, &chunk, crc_off));
	}
}

/// Build a complete image.
pub fn mkimage(opts: ImageOpts) -> Vec<u8> {
	let sb = build_sb(&opts);
	let mut img = vec![0u8; AGCOUNT as usize * AGBLOCKS as usize * BS];

	// primary superblock plus one copy per AG
	let mut sector = vec![0u8; SECT];
	decoder::encode_slice(&mut sector, &sb).unwrap();
	if sb.is_v5() {
		cksum::update(&mut sector, SB_CRC_OFF);
	}
	for agno in 0..AGCOUNT {
		write_at(&mut img, sb.ag_byte(agno), &sector);
	}

	format_ag(&mut img, &sb, 0, &AG0_FREE, true);
	format_ag(&mut img, &sb, 1, &AG1_FREE, false);

	// the root inode chunk
	for slot in 0..64u64 {
		let agino = CHUNK_START as u64 * 8 + slot;
		let ino = sb.agino_to_ino(0, agino as u32);
		let pos = sb.ino_to_byte(ino) as usize;
		init_inode_record(&mut img[pos..pos + ISIZE], &sb, ino);
	}

	// the root directory
	let root = InodeNum::new(ROOT_INO).unwrap();
	let sf = crate::xfs::dir::SfDir {
		parent:  ROOT_INO,
		entries: Vec::new(),
	};
	let body = crate::xfs::dir::encode_sf(&sf, sb.has_ftype());
	let mut ino = crate::xfs::test_inode(S_IFDIR | 0o755);
	ino.version = if sb.is_v5() { 3 } else { 2 };
	ino.nlink = 2;
	ino.size = body.len() as u64;
	ino.data = Fork::Local(body);
	let pos = sb.ino_to_byte(ROOT_INO) as usize;
	encode_dinode(&mut img[pos..pos + ISIZE], &sb, root, &ino).unwrap();

	img
}

/// Mount a freshly-formatted image read-write.
pub fn mount() -> crate::Xfs<Cursor<Vec<u8>>> {
	mount_opts(ImageOpts::default())
}

pub fn mount_opts(opts: ImageOpts) -> crate::Xfs<Cursor<Vec<u8>>> {
	let img = mkimage(opts);
	let br = crate::BlockReader::new(Cursor::new(img), BS, true);
	crate::Xfs::new(br).expect("the synthesized image mounts")
}

/// Write a fresh image into a temporary file, for open/remount tests.
pub fn image_file(opts: ImageOpts) -> tempfile::TempPath {
	use std::io::Write;
	let mut f = tempfile::NamedTempFile::new().unwrap();
	f.write_all(&mkimage(opts)).unwrap();
	f.flush().unwrap();
	f.into_temp_path()
}
