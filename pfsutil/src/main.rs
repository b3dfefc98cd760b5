//! The `pfsutil` tool builds a PS4 PFS disk image from a host directory.

use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::exit;

use pfs::{Builder, FsTree, HostFile, NodeId, Properties};
use putils::util::ByteSize;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,
	/// If true, print command line help.
	help: bool,
	/// The host directory to pack.
	source_dir: Option<PathBuf>,
	/// The output image path.
	output_path: Option<PathBuf>,
	/// Emit the signed profile with a full HMAC signing queue.
	sign: bool,
	/// Encrypt data sectors with XTS-AES-128 (implies `sign`).
	encrypt: bool,
	/// Hex-encoded EKPFS key material, required by `sign`/`encrypt`.
	ekpfs_hex: Option<String>,
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();

	args.prog = iter.next().unwrap_or_else(|| "pfsutil".to_owned());

	let mut positional = Vec::new();
	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"--sign" => args.sign = true,
			"--encrypt" => args.encrypt = true,
			"--ekpfs" => args.ekpfs_hex = iter.next(),
			_ => positional.push(arg),
		}
	}

	let mut positional = positional.into_iter();
	args.source_dir = positional.next().map(PathBuf::from);
	args.output_path = positional.next().map(PathBuf::from);

	args
}

fn print_usage(prog: &str) {
	eprintln!("usage: {prog} [--sign] [--encrypt] [--ekpfs <hex>] <source-dir> <output-image>");
}

fn parse_ekpfs(hex: &str) -> Option<[u8; pfs::crypto::EKPFS_SIZE]> {
	if hex.len() != pfs::crypto::EKPFS_SIZE * 2 {
		return None;
	}
	let mut out = [0u8; pfs::crypto::EKPFS_SIZE];
	for (i, byte) in out.iter_mut().enumerate() {
		*byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
	}
	Some(out)
}

/// Recursively adds every entry of `host_dir` under `parent` in `tree`, in directory-read order
/// (the tree's own path-sort pass at build time makes the final on-disk order deterministic
/// regardless).
fn add_tree(tree: &mut FsTree, parent: NodeId, host_dir: &Path) -> std::io::Result<()> {
	let mut entries: Vec<_> = std::fs::read_dir(host_dir)?.collect::<Result<_, _>>()?;
	entries.sort_by_key(|e| e.file_name());

	for entry in entries {
		let name = entry.file_name().to_string_lossy().into_owned();
		let meta = entry.metadata()?;
		if meta.is_dir() {
			let child = tree.add_dir(parent, name);
			add_tree(tree, child, &entry.path())?;
		} else {
			let size = meta.len();
			tree.add_file(parent, name, size, false, Box::new(HostFile::new(entry.path())));
		}
	}
	Ok(())
}

fn main() {
	let args = parse_args();
	if args.help {
		print_usage(&args.prog);
		return;
	}

	let source_dir = args.source_dir.unwrap_or_else(|| {
		print_usage(&args.prog);
		exit(1);
	});
	let output_path = args.output_path.unwrap_or_else(|| {
		print_usage(&args.prog);
		exit(1);
	});

	let sign = args.sign || args.encrypt;
	let mut props = Properties::default().sign(sign).encrypt(args.encrypt);
	if let Some(hex) = &args.ekpfs_hex {
		match parse_ekpfs(hex) {
			Some(key) => props = props.ekpfs(key),
			None => {
				eprintln!("{}: --ekpfs expects {} hex bytes", args.prog, pfs::crypto::EKPFS_SIZE);
				exit(1);
			}
		}
	}

	let mut tree = FsTree::new("uroot");
	let root = tree.root;
	add_tree(&mut tree, root, &source_dir).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, source_dir.display(), e);
		exit(1);
	});

	let builder = Builder::new(props);
	let size = builder.calculate_size(&tree).unwrap_or_else(|e| {
		eprintln!("{}: failed to plan image: {}", args.prog, e);
		exit(1);
	});

	let mut out = OpenOptions::new()
		.read(true)
		.write(true)
		.create(true)
		.truncate(true)
		.open(&output_path)
		.unwrap_or_else(|e| {
			eprintln!("{}: {}: {}", args.prog, output_path.display(), e);
			exit(1);
		});

	builder.build(&tree, &mut out).unwrap_or_else(|e| {
		eprintln!("{}: failed to build image: {}", args.prog, e);
		exit(1);
	});

	println!("{}: wrote {} to {}", args.prog, ByteSize(size), output_path.display());
}
