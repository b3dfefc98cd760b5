//! End-to-end coverage of the concrete build scenarios: every combination of profile
//! (unsigned/signed/signed+encrypted) against trees ranging from empty to deep to
//! indirect-block-forcing.

use std::io::Cursor;

use pfs::{Builder, FsTree, MemFile, Properties};

fn build(tree: &FsTree, props: Properties) -> Vec<u8> {
	let builder = Builder::new(props);
	let mut out = Cursor::new(Vec::new());
	builder.build(tree, &mut out).expect("build should succeed");
	out.into_inner()
}

#[test]
fn empty_tree_inner_produces_a_nonempty_image() {
	let tree = FsTree::new("uroot");
	let bytes = build(&tree, Properties::default().block_size(65536));
	assert!(!bytes.is_empty());
	assert_eq!(bytes.len() % 65536, 0);
}

#[test]
fn single_file_inner_stream_contains_file_bytes() {
	let mut tree = FsTree::new("uroot");
	tree.add_file(tree.root, "hello.txt", 5, false, Box::new(MemFile::new(b"world".to_vec())));
	let bytes = build(&tree, Properties::default().block_size(65536));
	assert!(bytes.windows(5).any(|w| w == b"world"));
}

#[test]
fn deep_tree_inner_nests_three_levels() {
	let mut tree = FsTree::new("uroot");
	let d1 = tree.add_dir(tree.root, "d1");
	let d2 = tree.add_dir(d1, "d2");
	tree.add_file(d2, "f", 4, false, Box::new(MemFile::new(vec![0xAA; 4])));
	let bytes = build(&tree, Properties::default().block_size(65536));
	assert!(bytes.windows(4).any(|w| w == [0xAA; 4]));
}

#[test]
fn sign_only_stamps_a_nonzero_header_signature() {
	let mut tree = FsTree::new("uroot");
	tree.add_file(tree.root, "a", 4, false, Box::new(MemFile::new(vec![1; 4])));
	let props = Properties::default()
		.block_size(65536)
		.sign(true)
		.ekpfs([0x5A; pfs::crypto::EKPFS_SIZE]);
	let bytes = build(&tree, props);
	let sig_start = pfs::header::HEADER_SIG_OFFSET as usize;
	assert!(bytes[sig_start..sig_start + 32].iter().any(|&b| b != 0));
}

#[test]
fn sign_and_encrypt_leaves_header_block_untouched() {
	let mut tree = FsTree::new("uroot");
	tree.add_file(tree.root, "a", 4, false, Box::new(MemFile::new(vec![1; 4])));
	let props = Properties::default().block_size(65536).sign(true).encrypt(true).ekpfs([0x5A; pfs::crypto::EKPFS_SIZE]);

	let plain_props = Properties::default().block_size(65536).sign(true).ekpfs([0x5A; pfs::crypto::EKPFS_SIZE]);
	let plain = build(&tree, plain_props);
	let encrypted = build(&tree, props);
	assert_eq!(plain[..65536], encrypted[..65536]);
}

#[test]
fn sign_and_encrypt_changes_data_sectors() {
	let mut tree = FsTree::new("uroot");
	tree.add_file(tree.root, "a", 4, false, Box::new(MemFile::new(vec![1; 4])));
	let props = Properties::default().block_size(65536).sign(true).encrypt(true).ekpfs([0x5A; pfs::crypto::EKPFS_SIZE]);

	let plain_props = Properties::default().block_size(65536).sign(true).ekpfs([0x5A; pfs::crypto::EKPFS_SIZE]);
	let plain = build(&tree, plain_props);
	let encrypted = build(&tree, props);
	assert_ne!(plain[65536..], encrypted[65536..]);
}

#[test]
fn large_file_forces_indirect_block_when_signed() {
	let mut tree = FsTree::new("uroot");
	let data = vec![0x7Bu8; 13 * 65536];
	tree.add_file(tree.root, "big", data.len() as u64, false, Box::new(MemFile::new(data)));
	let props = Properties::default().block_size(65536).sign(true).ekpfs([0x11; pfs::crypto::EKPFS_SIZE]);
	let bytes = build(&tree, props);
	assert_eq!(bytes.len() % 65536, 0);
	assert!(bytes.len() / 65536 > 13);
}

#[test]
fn reject_encrypt_without_sign() {
	let tree = FsTree::new("uroot");
	let props = Properties::default().block_size(65536).encrypt(true).ekpfs([0; pfs::crypto::EKPFS_SIZE]);
	let mut out = Cursor::new(Vec::new());
	assert!(Builder::new(props).build(&tree, &mut out).is_err());
}
