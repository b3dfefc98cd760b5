//! On-disk inode records.
//!
//! Two encodings exist, selected once at setup from `Properties::sign`: [`DinodeS32`] (signed
//! profile) reserves a per-direct-block HMAC slot area at a fixed internal offset; [`DinodeD32`]
//! (unsigned profile) is the same record without that area. [`Dinode`] is the tagged variant the
//! rest of the crate talks to, per the "common trait/interface" design note.

use bitflags::bitflags;
use memoffset::offset_of;
use static_assertions::const_assert_eq;
use std::io;
use std::io::Write;
use std::mem::size_of;

use crate::crypto::HMAC_SIZE;

/// Directory inode type bit (top nibble of `mode`, matching the teacher's ext2 convention).
pub const MODE_DIR: u16 = 0x4000;
/// File inode type bit.
pub const MODE_FILE: u16 = 0x8000;
/// Default permission bits for both directories and files in this builder (`r-xr-xr-x`).
pub const MODE_RX_ONLY: u16 = 0o555;

bitflags! {
	/// Per-inode flags, independent of the type/permission `mode` field.
	#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
	pub struct InodeFlags: u32 {
		/// The inode's content may not be modified.
		const READONLY = 1 << 0;
		/// The inode is part of the fixed PFS skeleton (super-root, FPT), not user content.
		const INTERNAL = 1 << 1;
		/// The node's content is compressed.
		const COMPRESSED = 1 << 2;
		/// Unknown bit, observed always-set on signed images. Preserved verbatim.
		const UNK_SIGNED_0 = 1 << 3;
		/// Unknown bit, observed always-set on signed images. Preserved verbatim.
		const UNK_SIGNED_1 = 1 << 4;
	}
}

/// Index of the single-indirect pointer within an inode's block array.
pub const INDIRECT_SLOT: usize = 12;
/// Index of the doubly-indirect pointer within an inode's block array.
pub const DOUBLY_INDIRECT_SLOT: usize = 13;
/// Number of direct (data) block pointer slots.
pub const DIRECT_BLOCK_COUNT: usize = 12;
/// Total number of pointer slots (direct + indirect + doubly-indirect).
pub const BLOCK_PTR_COUNT: usize = 14;
/// Sentinel written into unused pointer slots in the unsigned profile.
pub const UNUSED_BLOCK: i32 = -1;

/// One signature slot: a 32-byte HMAC tag followed by the little-endian index of the block it
/// covers, 36 bytes total.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigSlot {
	pub hmac: [u8; HMAC_SIZE],
	pub block_index: u32,
}

impl Default for SigSlot {
	fn default() -> Self {
		Self {
			hmac: [0; HMAC_SIZE],
			block_index: 0,
		}
	}
}

/// Number of bytes occupied by one [`SigSlot`] on disk.
pub const SIG_SLOT_SIZE: u64 = 36;
const_assert_eq!(size_of::<SigSlot>(), SIG_SLOT_SIZE as usize);

/// Plain (unsigned-profile) on-disk inode record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DinodeD32 {
	pub size: u64,
	pub size_compressed: u64,
	pub atime: u64,
	pub mtime: u64,
	pub ctime: u64,
	pub birthtime: u64,
	pub mode: u16,
	_pad_mode: u16,
	pub flags_bits: u32,
	pub nlink: u32,
	pub block_count: u32,
	pub number: u32,
	pub uid: u32,
	pub gid: u32,
	_reserved0: [u8; 24],
	pub blocks: [i32; BLOCK_PTR_COUNT],
}

/// Signed-profile on-disk inode record: the same prefix as [`DinodeD32`] plus a reserved area of
/// twelve signature slots, one per direct data block, at a fixed offset (`0x64`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DinodeS32 {
	pub size: u64,
	pub size_compressed: u64,
	pub atime: u64,
	pub mtime: u64,
	pub ctime: u64,
	pub birthtime: u64,
	pub mode: u16,
	_pad_mode: u16,
	pub flags_bits: u32,
	pub nlink: u32,
	pub block_count: u32,
	pub number: u32,
	pub uid: u32,
	pub gid: u32,
	_reserved0: [u8; 24],
	/// One signature slot per pointer slot (direct, indirect, doubly-indirect): the owning
	/// inode stores the HMAC (and, for the indirect slots, the block number of the indirect
	/// block itself) for everything it directly points to.
	pub sig_area: [SigSlot; BLOCK_PTR_COUNT],
	pub blocks: [i32; BLOCK_PTR_COUNT],
}

/// Offset, in bytes, of the signature area within a [`DinodeS32`] record. Referenced directly by
/// the layout planner's offset formula (`SPEC_FULL.md` §4.5 step 2).
pub const SIG_AREA_OFFSET: u64 = 0x64;
const_assert_eq!(offset_of!(DinodeS32, sig_area), SIG_AREA_OFFSET as usize);

pub const DINODE_S32_SIZE: u64 = size_of::<DinodeS32>() as u64;
pub const DINODE_D32_SIZE: u64 = size_of::<DinodeD32>() as u64;

macro_rules! common_impl {
	($t:ty) => {
		impl $t {
			pub fn flags(&self) -> InodeFlags {
				InodeFlags::from_bits_truncate(self.flags_bits)
			}

			pub fn set_flags(&mut self, flags: InodeFlags) {
				self.flags_bits = flags.bits();
			}

			pub fn set_direct_block(&mut self, i: usize, block: i32) {
				self.blocks[i] = block;
			}

			pub fn direct_block(&self, i: usize) -> i32 {
				self.blocks[i]
			}

			pub fn write(&self, out: &mut dyn Write) -> io::Result<()> {
				out.write_all(unsafe { putils::util::reinterpret(self) })
			}
		}
	};
}

common_impl!(DinodeD32);
common_impl!(DinodeS32);

impl DinodeS32 {
	/// Absolute disk offset of the signature slot for direct-block index `i` of inode number
	/// `number`, inside this inode's own record (`SPEC_FULL.md` §4.5 step 2).
	pub fn direct_block_sig_offset(block_size: u64, number: u32, i: usize) -> u64 {
		block_size + DINODE_S32_SIZE * number as u64 + SIG_AREA_OFFSET + SIG_SLOT_SIZE * i as u64
	}
}

/// Builds a fresh, zeroed inode record for either profile with the given common attributes. The
/// pointer array starts fully unused (`0` for the signed profile's direct/indirect slots pending
/// assignment, [`UNUSED_BLOCK`] for the unsigned profile, per the invariant that direct-block
/// slots beyond a file's block count are stamped with the sentinel in the unsigned profile).
#[derive(Clone, Copy)]
pub enum Dinode {
	Signed(DinodeS32),
	Plain(DinodeD32),
}

impl Dinode {
	pub fn new(signed: bool, number: u32, mode: u16, flags: InodeFlags, timestamp: u64) -> Self {
		let blocks = if signed {
			[0i32; BLOCK_PTR_COUNT]
		} else {
			[UNUSED_BLOCK; BLOCK_PTR_COUNT]
		};
		if signed {
			Dinode::Signed(DinodeS32 {
				size: 0,
				size_compressed: 0,
				atime: timestamp,
				mtime: timestamp,
				ctime: timestamp,
				birthtime: timestamp,
				mode,
				_pad_mode: 0,
				flags_bits: flags.bits(),
				nlink: 0,
				block_count: 0,
				number,
				uid: 0,
				gid: 0,
				_reserved0: [0; 24],
				sig_area: [SigSlot::default(); BLOCK_PTR_COUNT],
				blocks,
			})
		} else {
			Dinode::Plain(DinodeD32 {
				size: 0,
				size_compressed: 0,
				atime: timestamp,
				mtime: timestamp,
				ctime: timestamp,
				birthtime: timestamp,
				mode,
				_pad_mode: 0,
				flags_bits: flags.bits(),
				nlink: 0,
				block_count: 0,
				number,
				uid: 0,
				gid: 0,
				_reserved0: [0; 24],
				blocks,
			})
		}
	}

	pub fn is_signed(&self) -> bool {
		matches!(self, Dinode::Signed(_))
	}

	pub fn number(&self) -> u32 {
		match self {
			Dinode::Signed(i) => i.number,
			Dinode::Plain(i) => i.number,
		}
	}

	pub fn flags(&self) -> InodeFlags {
		match self {
			Dinode::Signed(i) => i.flags(),
			Dinode::Plain(i) => i.flags(),
		}
	}

	pub fn set_flags(&mut self, flags: InodeFlags) {
		match self {
			Dinode::Signed(i) => i.set_flags(flags),
			Dinode::Plain(i) => i.set_flags(flags),
		}
	}

	pub fn size(&self) -> u64 {
		match self {
			Dinode::Signed(i) => i.size,
			Dinode::Plain(i) => i.size,
		}
	}

	pub fn set_size(&mut self, size: u64) {
		match self {
			Dinode::Signed(i) => i.size = size,
			Dinode::Plain(i) => i.size = size,
		}
	}

	pub fn set_size_compressed(&mut self, size: u64) {
		match self {
			Dinode::Signed(i) => i.size_compressed = size,
			Dinode::Plain(i) => i.size_compressed = size,
		}
	}

	pub fn block_count(&self) -> u32 {
		match self {
			Dinode::Signed(i) => i.block_count,
			Dinode::Plain(i) => i.block_count,
		}
	}

	pub fn set_block_count(&mut self, n: u32) {
		match self {
			Dinode::Signed(i) => i.block_count = n,
			Dinode::Plain(i) => i.block_count = n,
		}
	}

	pub fn nlink(&self) -> u32 {
		match self {
			Dinode::Signed(i) => i.nlink,
			Dinode::Plain(i) => i.nlink,
		}
	}

	pub fn set_nlink(&mut self, n: u32) {
		match self {
			Dinode::Signed(i) => i.nlink = n,
			Dinode::Plain(i) => i.nlink = n,
		}
	}

	pub fn set_direct_block(&mut self, i: usize, block: i32) {
		match self {
			Dinode::Signed(ino) => ino.set_direct_block(i, block),
			Dinode::Plain(ino) => ino.set_direct_block(i, block),
		}
	}

	pub fn direct_block(&self, i: usize) -> i32 {
		match self {
			Dinode::Signed(ino) => ino.direct_block(i),
			Dinode::Plain(ino) => ino.direct_block(i),
		}
	}

	/// Size in bytes of this inode's on-disk encoding.
	pub fn size_of(&self) -> u64 {
		match self {
			Dinode::Signed(_) => DINODE_S32_SIZE,
			Dinode::Plain(_) => DINODE_D32_SIZE,
		}
	}

	pub fn write(&self, out: &mut dyn Write) -> io::Result<()> {
		match self {
			Dinode::Signed(i) => i.write(out),
			Dinode::Plain(i) => i.write(out),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn signed_is_larger_than_plain() {
		assert!(DINODE_S32_SIZE > DINODE_D32_SIZE);
		assert_eq!(DINODE_S32_SIZE - DINODE_D32_SIZE, 14 * SIG_SLOT_SIZE);
	}

	#[test]
	fn sig_area_offset_matches_spec_constant() {
		assert_eq!(SIG_AREA_OFFSET, 0x64);
	}

	#[test]
	fn unsigned_profile_uses_sentinel() {
		let ino = Dinode::new(false, 3, MODE_FILE | MODE_RX_ONLY, InodeFlags::READONLY, 0);
		for i in 0..BLOCK_PTR_COUNT {
			assert_eq!(ino.direct_block(i), UNUSED_BLOCK);
		}
	}

	#[test]
	fn signed_profile_starts_zeroed() {
		let ino = Dinode::new(true, 3, MODE_FILE | MODE_RX_ONLY, InodeFlags::READONLY, 0);
		for i in 0..BLOCK_PTR_COUNT {
			assert_eq!(ino.direct_block(i), 0);
		}
	}

	#[test]
	fn direct_block_sig_offset_layout() {
		let off0 = DinodeS32::direct_block_sig_offset(65536, 5, 0);
		let off1 = DinodeS32::direct_block_sig_offset(65536, 5, 1);
		assert_eq!(off1 - off0, SIG_SLOT_SIZE);
	}
}
