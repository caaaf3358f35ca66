//! CRC32C (Castagnoli) checksums over V5 metadata blocks.
//!
//! Every checksummed block type stores its CRC at a fixed offset; the
//! checksum is computed over the whole buffer with that 4-byte window
//! treated as zero.

/// Compute the finalized CRC32C of `buf` with the four bytes at
/// `cksum_off` taken as zero.
pub fn crc(buf: &[u8], cksum_off: usize) -> u32 {
	assert!(cksum_off + 4 <= buf.len());
	let c = crc32c::crc32c(&buf[..cksum_off]);
	let c = crc32c::crc32c_append(c, &[0u8; 4]);
	crc32c::crc32c_append(c, &buf[cksum_off + 4..])
}

/// Check the stored checksum of a metadata buffer.
pub fn verify(buf: &[u8], cksum_off: usize) -> bool {
	let stored = u32::from_be_bytes([
		buf[cksum_off],
		buf[cksum_off + 1],
		buf[cksum_off + 2],
		buf[cksum_off + 3],
	]);
	stored == crc(buf, cksum_off)
}

/// Recompute and store the checksum of a metadata buffer.
pub fn update(buf: &mut [u8], cksum_off: usize) {
	let c = crc(buf, cksum_off);
	buf[cksum_off..cksum_off + 4].copy_from_slice(&c.to_be_bytes());
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn window_is_ignored() {
		let mut buf = vec![0x5au8; 128];
		update(&mut buf, 32);
		assert!(verify(&buf, 32));

		// the stored checksum itself must not influence the value
		let with_window = crc(&buf, 32);
		buf[32..36].copy_from_slice(&[0u8; 4]);
		assert_eq!(with_window, crc(&buf, 32));
	}

	#[test]
	fn corruption_is_detected() {
		let mut buf = vec![0u8; 64];
		for (i, b) in buf.iter_mut().enumerate() {
			*b = i as u8;
		}
		update(&mut buf, 8);
		assert!(verify(&buf, 8));
		buf[63] ^= 1;
		assert!(!verify(&buf, 8));
	}

	#[test]
	fn castagnoli_vector() {
		// "123456789" has a well-known CRC32C of 0xE3069283; place the
		// window past the payload so it doesn't contribute.
		let mut buf = Vec::from(&b"123456789"[..]);
		buf.extend_from_slice(&[0u8; 4]);
		assert_eq!(crc(&buf, 9), 0xE3069283);
	}
}
