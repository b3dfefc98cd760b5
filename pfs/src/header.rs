//! The image header occupying block 0.

use crate::inode::SigSlot;
use memoffset::offset_of;
use static_assertions::const_assert_eq;
use std::io;
use std::io::Write;
use std::mem::size_of;

/// Mode flag: the image carries HMAC-SHA256 block signatures.
pub const MODE_SIGNED: u32 = 1 << 0;
/// Mode flag: the image's data sectors are XTS-AES-128 encrypted.
pub const MODE_ENCRYPTED: u32 = 1 << 1;
/// Mode flag observed always-set on images produced by the reference tool. Preserved verbatim.
pub const MODE_ALWAYS_SET: u32 = 1 << 2;

/// Number of direct pointers (and signature slots) the inode-block-signature descriptor can
/// address. See `SPEC_FULL.md` §11.6 for why this is bounded rather than chained through an
/// indirect block.
pub const IBS_DIRECT_CAP: usize = 16;

/// Absolute offset within block 0 of the per-inode-block signature array.
pub const IBS_SIG_AREA_OFFSET: u64 = 0xB8;
/// Absolute offset within block 0 of the header's own self-covering signature slot.
pub const HEADER_SIG_OFFSET: u64 = 0x380;
/// Span, in bytes, covered by the header's own self-covering signature.
pub const HEADER_SIG_SPAN: u64 = 0x5A0;

/// The on-disk header record. Fields beyond [`Self`]'s size are zero-filled by the writer out to
/// `BlockSize` bytes.
#[repr(C)]
pub struct HeaderRaw {
	pub block_size: u32,
	pub mode: u32,
	pub ndblock: u64,
	pub inode_count: u32,
	pub inode_block_count: u32,
	pub empty_block: u32,
	pub seed: [u8; 16],
	pub ibs_direct_blocks: [i32; IBS_DIRECT_CAP],
	_reserved0: [u8; (IBS_SIG_AREA_OFFSET as usize) - 108],
	pub ibs_sig_area: [SigSlot; IBS_DIRECT_CAP],
	_reserved1: [u8; (HEADER_SIG_OFFSET as usize) - 760],
	pub header_sig: SigSlot,
}

const_assert_eq!(offset_of!(HeaderRaw, ibs_sig_area), IBS_SIG_AREA_OFFSET as usize);
const_assert_eq!(offset_of!(HeaderRaw, header_sig), HEADER_SIG_OFFSET as usize);
const_assert_eq!(size_of::<SigSlot>() * IBS_DIRECT_CAP, 576);

impl HeaderRaw {
	pub fn new(block_size: u32, seed: [u8; 16]) -> Self {
		Self {
			block_size,
			mode: MODE_ALWAYS_SET,
			ndblock: 0,
			inode_count: 0,
			inode_block_count: 0,
			empty_block: 0,
			seed,
			ibs_direct_blocks: [0; IBS_DIRECT_CAP],
			_reserved0: [0; (IBS_SIG_AREA_OFFSET as usize) - 108],
			ibs_sig_area: [SigSlot::default(); IBS_DIRECT_CAP],
			_reserved1: [0; (HEADER_SIG_OFFSET as usize) - 760],
			header_sig: SigSlot::default(),
		}
	}

	pub fn set_signed(&mut self, signed: bool) {
		self.mode = if signed {
			self.mode | MODE_SIGNED
		} else {
			self.mode & !MODE_SIGNED
		};
	}

	pub fn set_encrypted(&mut self, encrypted: bool) {
		self.mode = if encrypted {
			self.mode | MODE_ENCRYPTED
		} else {
			self.mode & !MODE_ENCRYPTED
		};
	}

	pub fn write(&self, out: &mut dyn Write) -> io::Result<()> {
		out.write_all(unsafe { putils::util::reinterpret(self) })
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn offsets_match_spec_constants() {
		assert_eq!(IBS_SIG_AREA_OFFSET, 0xB8);
		assert_eq!(HEADER_SIG_OFFSET, 0x380);
		assert_eq!(HEADER_SIG_SPAN, 0x5A0);
	}

	#[test]
	fn mode_flags_round_trip() {
		let mut h = HeaderRaw::new(65536, [0; 16]);
		h.set_signed(true);
		h.set_encrypted(true);
		assert_ne!(h.mode & MODE_SIGNED, 0);
		assert_ne!(h.mode & MODE_ENCRYPTED, 0);
		h.set_encrypted(false);
		assert_eq!(h.mode & MODE_ENCRYPTED, 0);
		assert_ne!(h.mode & MODE_SIGNED, 0);
	}
}
