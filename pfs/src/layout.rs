//! The layout planner: assigns every inode a number, every inode's data a block range, and
//! (signed profile only) builds the ordered HMAC signing queue. Runs in one of two modes
//! selected once at setup from `Properties::sign`; see `SPEC_FULL.md` §4.5.

use crate::dirent::{Dirent, DirentKind};
use crate::fpt::{self, FptEntry};
use crate::fstree::FsTree;
use crate::header::{HeaderRaw, IBS_DIRECT_CAP, IBS_SIG_AREA_OFFSET};
use crate::inode::{
	Dinode, DinodeS32, InodeFlags, DINODE_D32_SIZE, DINODE_S32_SIZE, DOUBLY_INDIRECT_SLOT,
	INDIRECT_SLOT, MODE_DIR, MODE_FILE, MODE_RX_ONLY, SIG_SLOT_SIZE, UNUSED_BLOCK,
};
use crate::{PfsError, Properties, Result};

/// Reserved inode number of the synthetic super-root.
pub const SUPER_ROOT_INO: u32 = 0;
/// Reserved inode number of the flat path table.
pub const FPT_INO: u32 = 1;
/// Reserved inode number of the image root (the caller's tree root).
pub const UROOT_INO: u32 = 2;
/// First inode number available to the caller's own directories and files.
pub const FIRST_USER_INO: u32 = 3;

/// One entry of the LIFO signing queue: sign `span` bytes starting at `block * block_size`
/// (always exactly one block's worth), and store the resulting HMAC (plus `block_index` in the
/// trailing four bytes) at `sig_offset`.
#[derive(Clone, Copy, Debug)]
pub struct SignEntry {
	pub block: u64,
	pub sig_offset: u64,
	pub span: u64,
	pub block_index: u32,
}

/// The fully planned, not-yet-written image: every inode's final on-disk state, the flat path
/// table's serialized bytes, and (signed profile) the queue the signer replays in reverse.
pub struct PlannedLayout {
	pub header: HeaderRaw,
	pub signed: bool,
	pub block_size: u64,
	pub ndblock: u64,
	pub empty_block: u64,
	/// Indexed by inode number.
	pub inodes: Vec<Dinode>,
	pub fpt_bytes: Vec<u8>,
	pub dirent_blocks: std::collections::HashMap<u32, Vec<u8>>,
	/// Every inode's content blocks, in stream order, indexed by inode number.
	pub data_blocks: std::collections::HashMap<u32, Vec<u64>>,
	/// Assigned inode number for every tree node, indexed by [`crate::fstree::NodeId`].
	pub ino_of: std::collections::HashMap<crate::fstree::NodeId, u32>,
	/// Signing queue in push order; the signer must replay it back-to-front (LIFO), so that a
	/// block whose signature covers another block's signing area is only hashed after that area
	/// has been finalized.
	pub signing_queue: Vec<SignEntry>,
}

/// Number of blocks used to index a file's data beyond the twelve direct pointers: one
/// single-indirect block, and — once the single-indirect block's own capacity is exceeded — one
/// doubly-indirect block plus a chain of second-level indirect blocks (`SPEC_FULL.md` §4.5 step
/// 5).
fn calculate_indirect_blocks(blocks: u64, sigs_per_block: u64) -> u64 {
	if blocks <= 12 {
		return 0;
	}
	let mut n = 1;
	if blocks > 12 + sigs_per_block {
		let remaining = blocks - 12 - sigs_per_block;
		let second_level = (remaining + sigs_per_block - 1) / sigs_per_block;
		n += second_level + 1;
	}
	n
}

fn ceil_div(n: u64, d: u64) -> u64 {
	(n + d - 1) / d
}

struct Planner {
	signed: bool,
	block_size: u64,
	sigs_per_block: u64,
	inodes: Vec<Dinode>,
	queue: Vec<SignEntry>,
	ndblock: u64,
	/// Every inode's content blocks, in stream order, regardless of how they're addressed
	/// on disk (direct slots, or — signed profile only — through the indirect region).
	data_blocks: std::collections::HashMap<u32, Vec<u64>>,
}

impl Planner {
	fn push_sign(&mut self, block: u64, sig_offset: u64, span: u64, block_index: u32) {
		if self.signed {
			self.queue.push(SignEntry {
				block,
				sig_offset,
				span,
				block_index,
			});
		}
	}

	fn record_data_block(&mut self, ino_num: u32, block: u64) {
		self.data_blocks.entry(ino_num).or_default().push(block);
	}

	/// Assigns `count` fresh blocks starting at the inode's data cursor to pointer slots
	/// `first..first+count`, advancing `self.ndblock` and (signed profile) pushing one signing
	/// entry per slot pointing back into the owning inode's own signature area.
	fn assign_direct_run(&mut self, ino_num: u32, first: usize, count: usize) {
		for slot in first..first + count {
			let block = self.ndblock;
			self.ndblock += 1;
			self.inodes[ino_num as usize].set_direct_block(slot, block as i32);
			let sig_offset = DinodeS32::direct_block_sig_offset(self.block_size, ino_num, slot);
			self.push_sign(block, sig_offset, self.block_size, block as u32);
			self.record_data_block(ino_num, block);
		}
	}

	/// Lays out the data blocks for one node (`uroot`, a user directory, or a user file) that
	/// needs exactly `blocks` blocks of storage, assuming the signed profile's reserved
	/// indirect-block region starts at `ib_cursor` and has enough room left (guaranteed by the
	/// earlier reservation pass, which used the same [`calculate_indirect_blocks`] formula).
	fn place_signed(&mut self, ino_num: u32, blocks: u64, ib_cursor: &mut u64) {
		let direct = blocks.min(12) as usize;
		self.assign_direct_run(ino_num, 0, direct);
		if blocks <= 12 {
			return;
		}

		let single_indirect = *ib_cursor;
		*ib_cursor += 1;
		self.inodes[ino_num as usize].set_direct_block(INDIRECT_SLOT, single_indirect as i32);
		let slot12_sig_offset =
			DinodeS32::direct_block_sig_offset(self.block_size, ino_num, INDIRECT_SLOT);
		self.push_sign(single_indirect, slot12_sig_offset, self.block_size, single_indirect as u32);

		let remaining_after_direct = blocks - 12;
		let first_level_count = remaining_after_direct.min(self.sigs_per_block);
		for offset in 0..first_level_count {
			let data_block = self.ndblock;
			self.ndblock += 1;
			let sig_offset = single_indirect * self.block_size + SIG_SLOT_SIZE * offset;
			self.push_sign(data_block, sig_offset, self.block_size, data_block as u32);
			self.record_data_block(ino_num, data_block);
		}

		if remaining_after_direct <= self.sigs_per_block {
			return;
		}

		let doubly_indirect = *ib_cursor;
		*ib_cursor += 1;
		self.inodes[ino_num as usize].set_direct_block(DOUBLY_INDIRECT_SLOT, doubly_indirect as i32);
		let slot13_sig_offset =
			DinodeS32::direct_block_sig_offset(self.block_size, ino_num, DOUBLY_INDIRECT_SLOT);
		self.push_sign(doubly_indirect, slot13_sig_offset, self.block_size, doubly_indirect as u32);

		let mut remaining = remaining_after_direct - self.sigs_per_block;
		let mut level = 0u64;
		while remaining > 0 {
			let second_level = *ib_cursor;
			*ib_cursor += 1;
			let ptr_sig_offset = doubly_indirect * self.block_size + SIG_SLOT_SIZE * level;
			self.push_sign(second_level, ptr_sig_offset, self.block_size, second_level as u32);

			let count_here = remaining.min(self.sigs_per_block);
			for offset in 0..count_here {
				let data_block = self.ndblock;
				self.ndblock += 1;
				let sig_offset = second_level * self.block_size + SIG_SLOT_SIZE * offset;
				self.push_sign(data_block, sig_offset, self.block_size, data_block as u32);
				self.record_data_block(ino_num, data_block);
			}
			remaining -= count_here;
			level += 1;
		}
	}

	/// Unsigned profile: data is laid out contiguously from slot 0, with no pointer chain and no
	/// signing queue; every slot beyond 0 keeps the sentinel set by [`Dinode::new`].
	fn place_unsigned(&mut self, ino_num: u32, blocks: u64) {
		let start = self.ndblock;
		let count = blocks.max(1);
		self.ndblock += count;
		self.inodes[ino_num as usize].set_direct_block(0, start as i32);
		for block in start..start + count {
			self.record_data_block(ino_num, block);
		}
	}
}

/// Builds the full static skeleton (super-root, flat path table, `uroot`, every directory and
/// file inode) and its signing queue, per `SPEC_FULL.md` §4.2–§4.5.
pub fn plan(tree: &FsTree, props: &Properties) -> Result<PlannedLayout> {
	tree.validate()?;
	props.log("Setting up root structure");

	let signed = props.sign;
	let block_size = props.block_size.unwrap_or(crate::DEFAULT_BLOCK_SIZE);
	let timestamp = props
		.timestamp
		.unwrap_or_else(|| putils::util::get_timestamp().as_secs());

	let dirs = tree.dirs_preorder();
	let files = tree.files_path_sorted();
	let inode_count = FIRST_USER_INO + (dirs.len() as u32 - 1) + files.len() as u32;

	let mut ino_of = std::collections::HashMap::new();
	ino_of.insert(tree.root, UROOT_INO);
	let mut next = FIRST_USER_INO;
	for &d in dirs.iter().filter(|&&d| d != tree.root) {
		ino_of.insert(d, next);
		next += 1;
	}
	for &f in &files {
		ino_of.insert(f, next);
		next += 1;
	}

	let dinode_size = if signed { DINODE_S32_SIZE } else { DINODE_D32_SIZE };
	let sigs_per_block = block_size / SIG_SLOT_SIZE;
	let inode_block_count = ceil_div(inode_count as u64 * dinode_size, block_size);
	if inode_block_count as usize > IBS_DIRECT_CAP {
		return Err(PfsError::LayoutOverflow(format!(
			"inode table needs {} blocks, more than the {} the header can address directly",
			inode_block_count, IBS_DIRECT_CAP
		)));
	}

	let seed = props.seed.unwrap_or([0u8; 16]);
	let mut header = HeaderRaw::new(block_size as u32, seed);
	header.set_signed(signed);
	header.set_encrypted(props.encrypt);
	header.inode_count = inode_count;
	header.inode_block_count = inode_block_count as u32;
	for i in 0..inode_block_count as usize {
		header.ibs_direct_blocks[i] = 1 + i as i32;
	}

	// The header signs each inode-table block into its own `ibs_sig_area`, then signs itself
	// (covering that area in turn). Pushed header-self-signature first so it is processed last,
	// once the per-block entries below have filled in the area it hashes.
	let mut pending_queue: Vec<SignEntry> = Vec::new();
	if signed {
		pending_queue.push(SignEntry {
			block: 0,
			sig_offset: crate::header::HEADER_SIG_OFFSET,
			span: crate::header::HEADER_SIG_SPAN,
			block_index: 0,
		});
		for i in 0..inode_block_count as usize {
			pending_queue.push(SignEntry {
				block: 1 + i as u64,
				sig_offset: IBS_SIG_AREA_OFFSET + SIG_SLOT_SIZE * i as u64,
				span: block_size,
				block_index: 1 + i as u32,
			});
		}
	}

	// `readonly` is cleared in the signed profile on super_root, flat_path_table, uroot, and every
	// file; plain directories keep it regardless of profile (`SPEC_FULL.md` §3, §4.3).
	let mut internal_flags = InodeFlags::INTERNAL;
	let mut dir_flags = InodeFlags::READONLY;
	let mut uroot_flags = InodeFlags::empty();
	let mut file_flags = InodeFlags::empty();
	if !signed {
		internal_flags |= InodeFlags::READONLY;
		uroot_flags |= InodeFlags::READONLY;
		file_flags |= InodeFlags::READONLY;
	} else {
		internal_flags |= InodeFlags::UNK_SIGNED_0 | InodeFlags::UNK_SIGNED_1;
		dir_flags |= InodeFlags::UNK_SIGNED_0 | InodeFlags::UNK_SIGNED_1;
		uroot_flags |= InodeFlags::UNK_SIGNED_0 | InodeFlags::UNK_SIGNED_1;
		file_flags |= InodeFlags::UNK_SIGNED_0 | InodeFlags::UNK_SIGNED_1;
	}

	props.log("Writing inodes");
	let mut inodes: Vec<Dinode> = Vec::with_capacity(inode_count as usize);
	inodes.push(Dinode::new(signed, SUPER_ROOT_INO, MODE_DIR | MODE_RX_ONLY, internal_flags, timestamp));
	inodes.push(Dinode::new(signed, FPT_INO, MODE_FILE | MODE_RX_ONLY, internal_flags, timestamp));
	for &d in &dirs {
		let ino = ino_of[&d];
		let flags = if d == tree.root { uroot_flags } else { dir_flags };
		while inodes.len() <= ino as usize {
			inodes.push(Dinode::new(signed, inodes.len() as u32, MODE_DIR | MODE_RX_ONLY, flags, timestamp));
		}
	}
	for &f in &files {
		let ino = ino_of[&f];
		let mut flags = file_flags;
		let node = tree.nodes[f].as_file().unwrap();
		if node.compress {
			flags |= InodeFlags::COMPRESSED;
		}
		while inodes.len() <= ino as usize {
			inodes.push(Dinode::new(signed, inodes.len() as u32, MODE_FILE | MODE_RX_ONLY, flags, timestamp));
		}
	}
	debug_assert_eq!(inodes.len(), inode_count as usize);

	// Directories: exactly one block, sized to the block size, with `.`/`..` plus one entry per
	// child, and `Nlink = 2 + count(child directories)` (`SPEC_FULL.md` §3, §8; see
	// `SPEC_FULL.md` §11.7 for why the literal `Nlink 3` of `uroot` at setup is not special-cased
	// here).
	let mut dirents_by_dir: std::collections::HashMap<NodeIdAlias, Vec<Dirent>> =
		std::collections::HashMap::new();
	{
		let super_root_dirents = vec![
			Dirent::new(".", SUPER_ROOT_INO, DirentKind::Dot),
			Dirent::new("..", SUPER_ROOT_INO, DirentKind::DotDot),
			Dirent::new("flat_path_table", FPT_INO, DirentKind::File),
			Dirent::new("uroot", UROOT_INO, DirentKind::Directory),
		];
		dirents_by_dir.insert(usize::MAX, super_root_dirents);
	}
	for &d in &dirs {
		let ino = ino_of[&d];
		let dir = tree.nodes[d].as_dir().unwrap();
		let parent_ino = if d == tree.root {
			SUPER_ROOT_INO
		} else {
			ino_of[&dir.parent.unwrap()]
		};
		let mut entries = vec![
			Dirent::new(".", ino, DirentKind::Dot),
			Dirent::new("..", parent_ino, DirentKind::DotDot),
		];
		for &child in &dir.child_dirs {
			let name = tree.nodes[child].name().to_string();
			entries.push(Dirent::new(name, ino_of[&child], DirentKind::Directory));
		}
		for &child in &dir.child_files {
			let name = tree.nodes[child].name().to_string();
			entries.push(Dirent::new(name, ino_of[&child], DirentKind::File));
		}
		dirents_by_dir.insert(d, entries);
	}

	for (&key, entries) in &dirents_by_dir {
		let ino = if key == usize::MAX { SUPER_ROOT_INO } else { ino_of[&key] };
		let child_dir_count = entries
			.iter()
			.filter(|e| matches!(e.kind, DirentKind::Directory))
			.count() as u32;
		inodes[ino as usize].set_nlink(2 + child_dir_count);
		inodes[ino as usize].set_size(block_size);
		inodes[ino as usize].set_block_count(1);
	}

	let mut entries_for_fpt: Vec<FptEntry> = Vec::with_capacity(1 + dirs.len() + files.len());
	entries_for_fpt.push(FptEntry {
		ino: UROOT_INO,
		path: "/".to_string(),
	});
	for &d in dirs.iter().filter(|&&d| d != tree.root) {
		entries_for_fpt.push(FptEntry {
			ino: ino_of[&d],
			path: tree.full_path(d),
		});
	}
	for &f in &files {
		entries_for_fpt.push(FptEntry {
			ino: ino_of[&f],
			path: tree.full_path(f),
		});
	}
	props.log("Building the flat path table");
	let fpt_bytes = fpt::serialize(&entries_for_fpt);

	for &f in &files {
		let ino = ino_of[&f];
		let node = tree.nodes[f].as_file().unwrap();
		inodes[ino as usize].set_size(node.size);
		inodes[ino as usize].set_size_compressed(node.size_compressed);
		let blocks = if node.size == 0 { 1 } else { ceil_div(node.size, block_size) };
		inodes[ino as usize].set_block_count(blocks as u32);
	}

	let mut planner = Planner {
		signed,
		block_size,
		sigs_per_block,
		inodes,
		queue: pending_queue,
		ndblock: 1 + inode_block_count,
		data_blocks: std::collections::HashMap::new(),
	};

	// Block 1 + inode_block_count: super-root's single directory block.
	planner.assign_direct_run(SUPER_ROOT_INO, 0, 1);

	// The flat path table: up to 12 direct blocks, no indirect region (`SPEC_FULL.md` §4.5 step
	// 3). Larger tables are out of scope for this builder.
	let fpt_blocks = ceil_div(fpt_bytes.len().max(1) as u64, block_size);
	if fpt_blocks > 12 {
		return Err(PfsError::LayoutOverflow(format!(
			"flat path table needs {} blocks, more than the 12 supported without an indirect region",
			fpt_blocks
		)));
	}
	planner.inodes[FPT_INO as usize].set_size(fpt_bytes.len() as u64);
	planner.inodes[FPT_INO as usize].set_block_count(fpt_blocks as u32);
	planner.assign_direct_run(FPT_INO, 0, fpt_blocks as usize);

	// One block skipped, matching the reference tool's layout (`SPEC_FULL.md` §11.2).
	planner.ndblock += 1;

	let empty_block = planner.ndblock;
	planner.ndblock += 1;

	let mut ib_cursor = planner.ndblock;
	if signed {
		let total_indirect: u64 = {
			let uroot_blocks = 1u64;
			let mut sum = calculate_indirect_blocks(uroot_blocks, sigs_per_block);
			for _ in dirs.iter().filter(|&&d| d != tree.root) {
				sum += calculate_indirect_blocks(1, sigs_per_block);
			}
			for &f in &files {
				let ino = ino_of[&f];
				let blocks = planner.inodes[ino as usize].block_count() as u64;
				sum += calculate_indirect_blocks(blocks, sigs_per_block);
			}
			sum
		};
		planner.ndblock += total_indirect;
	}

	planner.place_signed_or_unsigned(UROOT_INO, 1, &mut ib_cursor);
	for &d in dirs.iter().filter(|&&d| d != tree.root) {
		planner.place_signed_or_unsigned(ino_of[&d], 1, &mut ib_cursor);
	}
	for &f in &files {
		let ino = ino_of[&f];
		let blocks = planner.inodes[ino as usize].block_count() as u64;
		planner.place_signed_or_unsigned(ino, blocks, &mut ib_cursor);
	}

	header.ndblock = planner.ndblock;
	header.empty_block = empty_block as u32;

	props.log("Writing directory entries");
	let mut dirent_blocks = std::collections::HashMap::new();
	for (&key, entries) in &dirents_by_dir {
		let ino = if key == usize::MAX { SUPER_ROOT_INO } else { ino_of[&key] };
		let mut buf = Vec::new();
		for e in entries {
			e.write(&mut buf).map_err(PfsError::IoFailure)?;
		}
		if buf.len() as u64 > block_size {
			return Err(PfsError::LayoutOverflow(format!(
				"directory (inode {ino}) needs {} bytes of dirents, more than one {block_size}-byte block",
				buf.len()
			)));
		}
		buf.resize(block_size as usize, 0);
		dirent_blocks.insert(ino, buf);
	}

	Ok(PlannedLayout {
		header,
		signed,
		block_size,
		ndblock: planner.ndblock,
		empty_block,
		inodes: planner.inodes,
		fpt_bytes,
		dirent_blocks,
		data_blocks: planner.data_blocks,
		ino_of,
		signing_queue: planner.queue,
	})
}

/// Key type for the super-root pseudo-entry in the dirent map (it has no [`NodeId`] of its own).
type NodeIdAlias = crate::fstree::NodeId;

impl Planner {
	fn place_signed_or_unsigned(&mut self, ino_num: u32, blocks: u64, ib_cursor: &mut u64) {
		if self.signed {
			self.place_signed(ino_num, blocks, ib_cursor);
		} else {
			self.place_unsigned(ino_num, blocks);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::fstree::MemFile;

	fn default_props() -> Properties {
		let mut p = Properties::default();
		p.block_size = Some(65536);
		p.timestamp = Some(0);
		p
	}

	#[test]
	fn empty_tree_inner() {
		let tree = FsTree::new("uroot");
		let mut props = default_props();
		props.sign = false;
		let planned = plan(&tree, &props).unwrap();
		assert!(!planned.signed);
		assert!(planned.signing_queue.is_empty());
		assert_eq!(planned.inodes.len(), 3);
		assert_eq!(planned.inodes[UROOT_INO as usize].nlink(), 2);
	}

	#[test]
	fn single_file_inner() {
		let mut tree = FsTree::new("uroot");
		tree.add_file(tree.root, "a", 4, false, Box::new(MemFile::new(vec![1, 2, 3, 4])));
		let mut props = default_props();
		props.sign = false;
		let planned = plan(&tree, &props).unwrap();
		assert_eq!(planned.inodes.len(), 4);
		assert_eq!(planned.inodes[UROOT_INO as usize].nlink(), 2);
		let file_ino = &planned.inodes[FIRST_USER_INO as usize];
		assert_eq!(file_ino.size(), 4);
		assert_eq!(file_ino.block_count(), 1);
		for i in 1..BLOCK_PTR_LEN {
			assert_eq!(file_ino.direct_block(i), UNUSED_BLOCK);
		}
	}

	const BLOCK_PTR_LEN: usize = 14;

	#[test]
	fn deep_tree_nlink() {
		let mut tree = FsTree::new("uroot");
		let d1 = tree.add_dir(tree.root, "d1");
		let d2 = tree.add_dir(d1, "d2");
		tree.add_file(d2, "f", 4, false, Box::new(MemFile::new(vec![0; 4])));
		let mut props = default_props();
		props.sign = false;
		let planned = plan(&tree, &props).unwrap();
		let ino_of_uroot = &planned.inodes[UROOT_INO as usize];
		assert_eq!(ino_of_uroot.nlink(), 3);
		let ino_of_d1 = &planned.inodes[(FIRST_USER_INO) as usize];
		assert_eq!(ino_of_d1.nlink(), 3);
		let ino_of_d2 = &planned.inodes[(FIRST_USER_INO + 1) as usize];
		assert_eq!(ino_of_d2.nlink(), 2);
	}

	#[test]
	fn signed_large_file_uses_indirect_slot() {
		let mut tree = FsTree::new("uroot");
		let data = vec![0u8; 13 * 65536];
		tree.add_file(tree.root, "big", data.len() as u64, false, Box::new(MemFile::new(data)));
		let mut props = default_props();
		props.sign = true;
		let planned = plan(&tree, &props).unwrap();
		assert!(planned.signed);
		let file_ino = &planned.inodes[FIRST_USER_INO as usize];
		assert_eq!(file_ino.block_count(), 13);
		assert!(file_ino.direct_block(INDIRECT_SLOT) > 0);
		assert_eq!(file_ino.direct_block(DOUBLY_INDIRECT_SLOT), UNUSED_BLOCK);
		assert!(!planned.signing_queue.is_empty());
	}

	#[test]
	fn calculate_indirect_blocks_matches_thresholds() {
		let sigs_per_block = 65536 / 36;
		assert_eq!(calculate_indirect_blocks(12, sigs_per_block), 0);
		assert_eq!(calculate_indirect_blocks(13, sigs_per_block), 1);
		assert_eq!(calculate_indirect_blocks(12 + sigs_per_block + 1, sigs_per_block), 1 + 1 + 1);
	}
}
