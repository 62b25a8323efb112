//! Cryptographic helpers: keccak-256 hashing, contract address derivation,
//! and the ECDSA plumbing used by the cheat actions.

use ethnum::U256;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha3::{Digest, Keccak256};

use crate::{
    expr::{Addr, W256},
    rlp,
};

/// Computes the keccak-256 hash of `bytes`.
#[must_use]
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Computes the keccak-256 hash of `bytes` as a word.
#[must_use]
pub fn keccak256_word(bytes: &[u8]) -> W256 {
    U256::from_be_bytes(keccak256(bytes))
}

/// Computes the four-byte ABI selector for a function `signature` such as
/// `"warp(uint256)"`.
#[must_use]
pub fn abi_selector(signature: &str) -> u32 {
    let hash = keccak256(signature.as_bytes());
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Derives the address of a contract created with `CREATE` by `sender` at
/// `nonce`: the low 20 bytes of `keccak256(rlp([sender, nonce]))`.
#[must_use]
pub fn create_address(sender: Addr, nonce: u64) -> Addr {
    let encoded = rlp::Item::List(vec![
        rlp::Item::Bytes(sender.to_fixed_bytes().to_vec()),
        rlp::from_word(U256::from(nonce)),
    ])
    .encode();
    Addr::from_hash(&keccak256(&encoded))
}

/// Derives the address of a contract created with `CREATE2`: the low 20 bytes
/// of `keccak256(0xff ++ sender ++ salt ++ keccak256(init_code))`.
#[must_use]
pub fn create2_address(sender: Addr, salt: W256, init_code_hash: [u8; 32]) -> Addr {
    let mut preimage = Vec::with_capacity(85);
    preimage.push(0xff);
    preimage.extend_from_slice(&sender.to_fixed_bytes());
    preimage.extend_from_slice(&salt.to_be_bytes());
    preimage.extend_from_slice(&init_code_hash);
    Addr::from_hash(&keccak256(&preimage))
}

/// Derives the Ethereum address controlled by `private_key`: the low 20 bytes
/// of the keccak-256 hash of the uncompressed public key.
///
/// Returns [`None`] when `private_key` is not a valid secp256k1 scalar.
#[must_use]
pub fn address_from_private_key(private_key: W256) -> Option<Addr> {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&private_key.to_be_bytes()).ok()?;
    let public = PublicKey::from_secret_key(&secp, &key);
    Some(Addr::from_hash(&keccak256(
        &public.serialize_uncompressed()[1..],
    )))
}

/// Signs the 32-byte `digest` with `private_key`, returning the signature as
/// `(v, r, s)` with `v` derived from the recovery id.
///
/// Returns [`None`] when `private_key` is not a valid secp256k1 scalar.
#[must_use]
pub fn sign_digest(private_key: W256, digest: [u8; 32]) -> Option<(u8, W256, W256)> {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&private_key.to_be_bytes()).ok()?;
    let message = Message::from_digest_slice(&digest).ok()?;
    let (recovery_id, compact) = secp
        .sign_ecdsa_recoverable(&message, &key)
        .serialize_compact();

    let r = U256::from_be_bytes(compact[..32].try_into().expect("slice is 32 bytes"));
    let s = U256::from_be_bytes(compact[32..].try_into().expect("slice is 32 bytes"));
    let v = 27 + u8::try_from(recovery_id.to_i32()).expect("recovery id is 0..=3");
    Some((v, r, s))
}

/// Computes the synthetic hash the engine answers for `BLOCKHASH` queries on
/// concrete block numbers inside the history window: the keccak-256 hash of
/// the decimal string of the number.
///
/// Real chain data is unavailable to a symbolic engine, so the answer only
/// needs to be deterministic and collision-free across nearby blocks.
#[must_use]
pub fn synthetic_block_hash(number: W256) -> W256 {
    keccak256_word(number.to_string().as_bytes())
}
