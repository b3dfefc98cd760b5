//! Cryptographic primitives: HMAC-SHA256 block signing, XTS-AES-128 sector encryption, and the
//! key derivation functions that turn an EKPFS + seed into a sign key and an encryption key.
//!
//! The reference implementation (`LibOrbisPkg`, C#) was not available to ground these against
//! (see `SPEC_FULL.md` §11.4): the KDFs below are a documented stand-in, not a verified bit-exact
//! match.

use aes::Aes128;
use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;
use xts_mode::Xts128;

/// Size in bytes of an HMAC-SHA256 tag.
pub const HMAC_SIZE: usize = 32;
/// Size of the EKPFS key material.
pub const EKPFS_SIZE: usize = 32;
/// Size of the per-image seed.
pub const SEED_SIZE: usize = 16;
/// XTS sector size, independent of the PFS block size.
pub const SECTOR_SIZE: usize = 4096;

type HmacSha256 = Hmac<Sha256>;

/// Derives the key used to sign blocks (`PfsGenSignKey` in the reference tool).
pub fn gen_sign_key(ekpfs: &[u8; EKPFS_SIZE], seed: &[u8; SEED_SIZE]) -> [u8; HMAC_SIZE] {
	derive(ekpfs, seed, b"sign")
}

/// Derives the key used to encrypt sectors (`PfsGenEncKey` in the reference tool).
///
/// The first 16 bytes of the output are the XTS tweak key; the last 16 are the XTS data key.
pub fn gen_enc_key(ekpfs: &[u8; EKPFS_SIZE], seed: &[u8; SEED_SIZE]) -> [u8; HMAC_SIZE] {
	derive(ekpfs, seed, b"enc")
}

fn derive(ekpfs: &[u8; EKPFS_SIZE], seed: &[u8; SEED_SIZE], label: &[u8]) -> [u8; HMAC_SIZE] {
	let mut mac = HmacSha256::new_from_slice(ekpfs).expect("HMAC accepts keys of any length");
	mac.update(seed);
	mac.update(label);
	let tag = mac.finalize().into_bytes();
	let mut out = [0u8; HMAC_SIZE];
	out.copy_from_slice(&tag);
	out
}

/// Computes the HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8; HMAC_SIZE], data: &[u8]) -> [u8; HMAC_SIZE] {
	let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
	mac.update(data);
	let tag = mac.finalize().into_bytes();
	let mut out = [0u8; HMAC_SIZE];
	out.copy_from_slice(&tag);
	out
}

/// XTS-AES-128 sector cipher over a `[tweak_key, data_key]` pair derived from [`gen_enc_key`].
pub struct SectorCipher {
	xts: Xts128<Aes128>,
}

impl SectorCipher {
	/// Builds the cipher from the 32-byte output of [`gen_enc_key`].
	pub fn new(enc_key: &[u8; HMAC_SIZE]) -> Self {
		let mut data_key = [0u8; 16];
		let mut tweak_key = [0u8; 16];
		tweak_key.copy_from_slice(&enc_key[0..16]);
		data_key.copy_from_slice(&enc_key[16..32]);

		use aes::cipher::KeyInit;
		let cipher_1 = Aes128::new(&data_key.into());
		let cipher_2 = Aes128::new(&tweak_key.into());
		Self {
			xts: Xts128::new(cipher_1, cipher_2),
		}
	}

	/// Encrypts a single [`SECTOR_SIZE`]-byte sector in place, keyed to its absolute sector index.
	pub fn encrypt_sector(&self, sector_index: u128, buf: &mut [u8]) {
		debug_assert_eq!(buf.len(), SECTOR_SIZE);
		self.xts.encrypt_sector(buf, sector_index);
	}

	/// Decrypts a single [`SECTOR_SIZE`]-byte sector in place, keyed to its absolute sector index.
	pub fn decrypt_sector(&self, sector_index: u128, buf: &mut [u8]) {
		debug_assert_eq!(buf.len(), SECTOR_SIZE);
		self.xts.decrypt_sector(buf, sector_index);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn kdf_is_deterministic() {
		let ekpfs = [0x11u8; EKPFS_SIZE];
		let seed = [0x22u8; SEED_SIZE];
		assert_eq!(gen_sign_key(&ekpfs, &seed), gen_sign_key(&ekpfs, &seed));
		assert_eq!(gen_enc_key(&ekpfs, &seed), gen_enc_key(&ekpfs, &seed));
	}

	#[test]
	fn sign_and_enc_keys_differ() {
		let ekpfs = [0x33u8; EKPFS_SIZE];
		let seed = [0x44u8; SEED_SIZE];
		assert_ne!(gen_sign_key(&ekpfs, &seed), gen_enc_key(&ekpfs, &seed));
	}

	#[test]
	fn hmac_changes_with_data() {
		let key = [0x55u8; HMAC_SIZE];
		let a = hmac_sha256(&key, b"hello");
		let b = hmac_sha256(&key, b"hellp");
		assert_ne!(a, b);
	}

	#[test]
	fn xts_round_trips() {
		let ekpfs = [0x66u8; EKPFS_SIZE];
		let seed = [0x77u8; SEED_SIZE];
		let enc_key = gen_enc_key(&ekpfs, &seed);
		let cipher = SectorCipher::new(&enc_key);

		let mut plaintext = [0xABu8; SECTOR_SIZE];
		let original = plaintext;
		cipher.encrypt_sector(16, &mut plaintext);
		assert_ne!(plaintext, original);
		cipher.decrypt_sector(16, &mut plaintext);
		assert_eq!(plaintext, original);
	}
}
