//! Writes a planned image to a sink, then (signed profile) replays the HMAC signing queue, then
//! (encrypted profile) runs XTS-AES-128 over every data sector but the reserved empty block.
//!
//! Three phases, always in this order: write, sign, encrypt. Each only runs if the prior ones
//! would have produced the bytes it depends on.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::crypto::{self, SectorCipher, HMAC_SIZE, SECTOR_SIZE};
use crate::error::{PfsError, Result};
use crate::fstree::FsTree;
use crate::layout::{PlannedLayout, FPT_INO};
use crate::Properties;

fn seek_to_block(out: &mut impl Seek, block: u64, block_size: u64) -> Result<()> {
	out.seek(SeekFrom::Start(block * block_size))
		.map_err(PfsError::IoFailure)?;
	Ok(())
}

/// Phase 1: zero-fills the whole image, then overwrites every block whose content is known
/// (header, inode table, directories, the flat path table, and every file's data), in the
/// planner's own block order.
fn write_blocks(
	planned: &PlannedLayout,
	tree: &FsTree,
	props: &Properties,
	out: &mut (impl Write + Seek),
) -> Result<()> {
	props.log("Writing file data");
	let block_size = planned.block_size as usize;
	let zero = vec![0u8; block_size];
	out.seek(SeekFrom::Start(0)).map_err(PfsError::IoFailure)?;
	for _ in 0..planned.ndblock {
		out.write_all(&zero).map_err(PfsError::IoFailure)?;
	}

	seek_to_block(out, 0, planned.block_size)?;
	let mut header_buf = Vec::with_capacity(block_size);
	planned.header.write(&mut header_buf).map_err(PfsError::IoFailure)?;
	header_buf.resize(block_size, 0);
	out.write_all(&header_buf).map_err(PfsError::IoFailure)?;

	seek_to_block(out, 1, planned.block_size)?;
	let dinode_size = planned.inodes.first().map(|i| i.size_of()).unwrap_or(0) as usize;
	let inodes_per_block = block_size / dinode_size.max(1);
	let mut table_buf = Vec::new();
	for (i, inode) in planned.inodes.iter().enumerate() {
		inode.write(&mut table_buf).map_err(PfsError::IoFailure)?;
		let is_last_in_block = (i + 1) % inodes_per_block == 0;
		let is_last_overall = i + 1 == planned.inodes.len();
		if is_last_in_block || is_last_overall {
			table_buf.resize(
				((table_buf.len() + block_size - 1) / block_size) * block_size,
				0,
			);
			out.write_all(&table_buf).map_err(PfsError::IoFailure)?;
			table_buf.clear();
		}
	}

	for (&ino, bytes) in &planned.dirent_blocks {
		write_at_block(out, planned.inodes[ino as usize].direct_block(0), block_size, bytes)?;
	}

	write_chunked(
		out,
		&planned.data_blocks[&FPT_INO],
		block_size,
		&planned.fpt_bytes,
	)?;

	for &file_id in &tree.files_path_sorted() {
		let ino = planned.ino_of[&file_id];
		let blocks = &planned.data_blocks[&ino];
		let node = tree.nodes[file_id].as_file().unwrap();
		let mut content = Vec::with_capacity(node.size as usize);
		node.producer.write_to(&mut content).map_err(PfsError::IoFailure)?;
		write_chunked(out, blocks, block_size, &content)?;
	}

	Ok(())
}

fn write_at_block(
	out: &mut (impl Write + Seek),
	block: i32,
	block_size: usize,
	bytes: &[u8],
) -> Result<()> {
	seek_to_block(out, block as u64, block_size as u64)?;
	out.write_all(bytes).map_err(PfsError::IoFailure)
}

/// Writes `content`, split into `block_size`-byte chunks, across `blocks` in order. The final
/// chunk is zero-padded if `content` doesn't fill it.
fn write_chunked(
	out: &mut (impl Write + Seek),
	blocks: &[u64],
	block_size: usize,
	content: &[u8],
) -> Result<()> {
	for (i, &block) in blocks.iter().enumerate() {
		let start = i * block_size;
		if start >= content.len() {
			break;
		}
		let end = (start + block_size).min(content.len());
		let mut chunk = content[start..end].to_vec();
		chunk.resize(block_size, 0);
		seek_to_block(out, block, block_size as u64)?;
		out.write_all(&chunk).map_err(PfsError::IoFailure)?;
	}
	Ok(())
}

/// Phase 2: replays the signing queue back-to-front (LIFO), so that a block whose signature
/// covers another entry's write target is only hashed once that entry has landed.
fn sign_blocks(planned: &PlannedLayout, props: &Properties, out: &mut (impl Read + Write + Seek)) -> Result<()> {
	if !planned.signed {
		return Ok(());
	}
	props.log("Signing blocks");
	let ekpfs = props.ekpfs.ok_or_else(|| {
		PfsError::ConfigMismatch("signed image requested without ekpfs key material".to_string())
	})?;
	let seed = props.seed.unwrap_or([0u8; 16]);
	let sign_key = crypto::gen_sign_key(&ekpfs, &seed);

	for entry in planned.signing_queue.iter().rev() {
		seek_to_block(out, entry.block, planned.block_size)?;
		let mut buf = vec![0u8; entry.span as usize];
		out.read_exact(&mut buf).map_err(PfsError::IoFailure)?;
		let tag = crypto::hmac_sha256(&sign_key, &buf);

		out.seek(SeekFrom::Start(entry.sig_offset)).map_err(PfsError::IoFailure)?;
		out.write_all(&tag).map_err(PfsError::IoFailure)?;
		out.write_all(&entry.block_index.to_le_bytes()).map_err(PfsError::IoFailure)?;
	}
	Ok(())
}

/// Phase 3: encrypts every [`SECTOR_SIZE`]-byte sector of the image except sectors `[0, 16)`
/// (the header region) and the reserved empty block, both of which the reference tool leaves as
/// a plaintext "safe" region.
fn encrypt_sectors(planned: &PlannedLayout, props: &Properties, out: &mut (impl Read + Write + Seek)) -> Result<()> {
	if !props.encrypt {
		return Ok(());
	}
	props.log("Encrypting sectors");
	let ekpfs = props.ekpfs.ok_or_else(|| {
		PfsError::ConfigMismatch("encrypted image requested without ekpfs key material".to_string())
	})?;
	let seed = props.seed.unwrap_or([0u8; 16]);
	let enc_key = crypto::gen_enc_key(&ekpfs, &seed);
	let cipher = SectorCipher::new(&enc_key);

	let sectors_per_block = planned.block_size as usize / SECTOR_SIZE;
	let empty_block = planned.empty_block;
	let total_sectors = planned.ndblock as usize * sectors_per_block;

	let mut buf = [0u8; SECTOR_SIZE];
	for sector in 16..total_sectors {
		let block = (sector / sectors_per_block) as u64;
		if block == empty_block {
			continue;
		}
		out.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
			.map_err(PfsError::IoFailure)?;
		out.read_exact(&mut buf).map_err(PfsError::IoFailure)?;
		cipher.encrypt_sector(sector as u128, &mut buf);
		out.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
			.map_err(PfsError::IoFailure)?;
		out.write_all(&buf).map_err(PfsError::IoFailure)?;
	}
	Ok(())
}

pub fn write_image(
	planned: &PlannedLayout,
	tree: &FsTree,
	props: &Properties,
	out: &mut (impl Read + Write + Seek),
) -> Result<()> {
	write_blocks(planned, tree, props, out)?;
	sign_blocks(planned, props, out)?;
	encrypt_sectors(planned, props, out)?;
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::fstree::MemFile;
	use crate::Properties as Props;
	use std::io::Cursor;

	fn cursor() -> Cursor<Vec<u8>> {
		Cursor::new(Vec::new())
	}

	#[test]
	fn unsigned_build_round_trips_fpt_bytes() {
		let mut tree = FsTree::new("uroot");
		tree.add_file(tree.root, "a", 4, false, Box::new(MemFile::new(vec![1, 2, 3, 4])));
		let mut props = Props::default();
		props.block_size = Some(65536);
		props.timestamp = Some(0);
		let planned = crate::layout::plan(&tree, &props).unwrap();

		let mut out = cursor();
		write_image(&planned, &tree, &props, &mut out).unwrap();
		assert_eq!(out.get_ref().len() as u64, planned.ndblock * planned.block_size);
	}

	#[test]
	fn signed_build_stamps_header_signature() {
		let mut tree = FsTree::new("uroot");
		tree.add_file(tree.root, "a", 4, false, Box::new(MemFile::new(vec![1, 2, 3, 4])));
		let mut props = Props::default();
		props.block_size = Some(65536);
		props.timestamp = Some(0);
		props.sign = true;
		props.ekpfs = Some([0x42; crypto::EKPFS_SIZE]);
		let planned = crate::layout::plan(&tree, &props).unwrap();

		let mut out = cursor();
		write_image(&planned, &tree, &props, &mut out).unwrap();

		let bytes = out.into_inner();
		let sig_start = crate::header::HEADER_SIG_OFFSET as usize;
		let tag = &bytes[sig_start..sig_start + HMAC_SIZE];
		assert!(tag.iter().any(|&b| b != 0));
	}
}
