//! This module contains the precompiled contracts at addresses `0x01`
//! through `0x09`: their gas costs, and executable semantics for those whose
//! mathematics does not require a pairing library.
//!
//! `ECADD`, `ECMUL` and `ECPAIRING` are priced in full but only execute their
//! identity cases; anything that needs real alt_bn128 arithmetic reports
//! [`EvmError::PrecompileFailure`].

use ethnum::U256;
use num_bigint::BigUint;
use ripemd::Ripemd160;
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, Secp256k1,
};
use sha2::Sha256;
use sha3::{Digest, Keccak256};

use crate::{
    error::EvmError,
    gas::{ceil_div, FeeSchedule},
};

/// The largest operand length MODEXP will actually compute with, in bytes.
/// Larger requests are priced so high that they can never afford execution,
/// but a guard keeps a mispriced call from allocating unboundedly.
const MODEXP_MAXIMUM_OPERAND_BYTES: usize = 1 << 20;

/// The exact input length of the BLAKE2 compression precompile, per EIP-152.
const BLAKE2_INPUT_BYTES: usize = 213;

/// Gets the gas cost of running precompile `which` on `input`.
#[must_use]
pub(crate) fn cost(fees: &FeeSchedule, which: u64, input: &[u8]) -> u64 {
    let len = input.len() as u64;
    match which {
        1 => 3000,
        2 => 60 + 12 * ceil_div(len, 32),
        3 => 600 + 120 * ceil_div(len, 32),
        4 => 15 + 3 * ceil_div(len, 32),
        5 => modexp_cost(fees, input),
        6 => fees.g_ecadd,
        7 => fees.g_ecmul,
        8 => fees.g_pairing_base + fees.g_pairing_point * (len / 192),
        9 => {
            let rounds = input
                .get(..4)
                .map_or(0, |bytes| {
                    u64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                });
            fees.g_fround * rounds
        }
        _ => 0,
    }
}

/// Runs precompile `which` on `input`.
///
/// # Errors
///
/// Returns [`EvmError::PrecompileFailure`] when the input is malformed or
/// when the operation needs curve arithmetic this engine does not carry.
pub(crate) fn execute(which: u64, input: &[u8]) -> Result<Vec<u8>, EvmError> {
    match which {
        1 => Ok(ecrecover(input)),
        2 => {
            let mut hasher = Sha256::new();
            hasher.update(input);
            Ok(hasher.finalize().to_vec())
        }
        3 => {
            let mut hasher = Ripemd160::new();
            hasher.update(input);
            let mut out = vec![0u8; 12];
            out.extend_from_slice(&hasher.finalize());
            Ok(out)
        }
        4 => Ok(input.to_vec()),
        5 => modexp(input),
        6 => ecadd(input),
        7 => ecmul(input),
        8 => ecpairing(input),
        9 => blake2f(input),
        _ => Err(EvmError::PrecompileFailure),
    }
}

/// `ECRECOVER`: recovers the signing address of a 32-byte digest.
///
/// As on the chain, a failed recovery is not an error: the output is simply
/// empty.
fn ecrecover(input: &[u8]) -> Vec<u8> {
    let mut padded = [0u8; 128];
    let len = input.len().min(128);
    padded[..len].copy_from_slice(&input[..len]);

    // v must be 27 or 28, zero-extended to a word.
    if padded[32..63].iter().any(|byte| *byte != 0) {
        return Vec::new();
    }
    let Ok(recovery_id) = RecoveryId::from_i32(i32::from(padded[63]) - 27) else {
        return Vec::new();
    };
    let Ok(signature) = RecoverableSignature::from_compact(&padded[64..128], recovery_id) else {
        return Vec::new();
    };
    let Ok(message) = Message::from_digest_slice(&padded[..32]) else {
        return Vec::new();
    };
    let Ok(public_key) = Secp256k1::new().recover_ecdsa(&message, &signature) else {
        return Vec::new();
    };

    let mut hasher = Keccak256::new();
    hasher.update(&public_key.serialize_uncompressed()[1..]);
    let hash = hasher.finalize();

    let mut out = vec![0u8; 32];
    out[12..].copy_from_slice(&hash[12..]);
    out
}

/// The EIP-2565 price of a `MODEXP` call.
fn modexp_cost(fees: &FeeSchedule, input: &[u8]) -> u64 {
    let base_len = read_length(input, 0);
    let exponent_len = read_length(input, 32);
    let modulus_len = read_length(input, 64);

    let words = ceil_div(base_len.max(modulus_len), 8);
    let multiplication_complexity = words.saturating_mul(words);

    let exponent_offset = 96usize.saturating_add(usize::try_from(base_len).unwrap_or(usize::MAX));
    let exponent_head = padded_slice(input, exponent_offset, exponent_len.min(32) as usize);
    let exponent_head = BigUint::from_bytes_be(&exponent_head);
    let iteration_count = if exponent_len <= 32 {
        exponent_head.bits().saturating_sub(1)
    } else {
        8u64.saturating_mul(exponent_len - 32)
            .saturating_add(exponent_head.bits().saturating_sub(1))
    }
    .max(1);

    (multiplication_complexity.saturating_mul(iteration_count) / fees.g_quaddivisor).max(200)
}

/// `MODEXP`: arbitrary-precision modular exponentiation, per EIP-198.
fn modexp(input: &[u8]) -> Result<Vec<u8>, EvmError> {
    let base_len = read_length(input, 0) as usize;
    let exponent_len = read_length(input, 32) as usize;
    let modulus_len = read_length(input, 64) as usize;
    if base_len.max(exponent_len).max(modulus_len) > MODEXP_MAXIMUM_OPERAND_BYTES {
        return Err(EvmError::PrecompileFailure);
    }

    let base = BigUint::from_bytes_be(&padded_slice(input, 96, base_len));
    let exponent = BigUint::from_bytes_be(&padded_slice(input, 96 + base_len, exponent_len));
    let modulus = BigUint::from_bytes_be(&padded_slice(
        input,
        96 + base_len + exponent_len,
        modulus_len,
    ));

    let result = if modulus == BigUint::from(0u8) {
        BigUint::from(0u8)
    } else {
        base.modpow(&exponent, &modulus)
    };

    // The output is the result left-padded to the modulus length.
    let bytes = result.to_bytes_be();
    let mut out = vec![0u8; modulus_len];
    if bytes.len() <= modulus_len {
        out[modulus_len - bytes.len()..].copy_from_slice(&bytes);
    }
    Ok(out)
}

/// `ECADD` over alt_bn128: only the identity cases execute.
fn ecadd(input: &[u8]) -> Result<Vec<u8>, EvmError> {
    let a = padded_slice(input, 0, 64);
    let b = padded_slice(input, 64, 64);
    let a_is_zero = a.iter().all(|byte| *byte == 0);
    let b_is_zero = b.iter().all(|byte| *byte == 0);
    match (a_is_zero, b_is_zero) {
        (true, true) => Ok(vec![0u8; 64]),
        (true, false) => Ok(b),
        (false, true) => Ok(a),
        (false, false) => Err(EvmError::PrecompileFailure),
    }
}

/// `ECMUL` over alt_bn128: only the identity cases execute.
fn ecmul(input: &[u8]) -> Result<Vec<u8>, EvmError> {
    let point = padded_slice(input, 0, 64);
    let scalar = BigUint::from_bytes_be(&padded_slice(input, 64, 32));
    if point.iter().all(|byte| *byte == 0) || scalar == BigUint::from(0u8) {
        return Ok(vec![0u8; 64]);
    }
    if scalar == BigUint::from(1u8) {
        return Ok(point);
    }
    Err(EvmError::PrecompileFailure)
}

/// `ECPAIRING` over alt_bn128: only the identity cases execute.
fn ecpairing(input: &[u8]) -> Result<Vec<u8>, EvmError> {
    if input.len() % 192 != 0 {
        return Err(EvmError::PrecompileFailure);
    }

    // Every pair containing a point at infinity contributes the identity;
    // if that is all of them, the product is trivially one.
    let all_trivial = input.chunks_exact(192).all(|pair| {
        let g1_zero = pair[..64].iter().all(|byte| *byte == 0);
        let g2_zero = pair[64..].iter().all(|byte| *byte == 0);
        g1_zero || g2_zero
    });
    if all_trivial {
        let mut out = vec![0u8; 32];
        out[31] = 1;
        Ok(out)
    } else {
        Err(EvmError::PrecompileFailure)
    }
}

/// `BLAKE2F`: the BLAKE2b compression function, per EIP-152.
fn blake2f(input: &[u8]) -> Result<Vec<u8>, EvmError> {
    if input.len() != BLAKE2_INPUT_BYTES {
        return Err(EvmError::PrecompileFailure);
    }
    let rounds = u32::from_be_bytes(input[..4].try_into().expect("length was checked"));
    let final_flag = match input[212] {
        0 => false,
        1 => true,
        _ => return Err(EvmError::PrecompileFailure),
    };

    let mut h = [0u64; 8];
    for (i, slot) in h.iter_mut().enumerate() {
        *slot = u64::from_le_bytes(input[4 + i * 8..12 + i * 8].try_into().expect("in range"));
    }
    let mut m = [0u64; 16];
    for (i, slot) in m.iter_mut().enumerate() {
        *slot = u64::from_le_bytes(input[68 + i * 8..76 + i * 8].try_into().expect("in range"));
    }
    let t = [
        u64::from_le_bytes(input[196..204].try_into().expect("in range")),
        u64::from_le_bytes(input[204..212].try_into().expect("in range")),
    ];

    blake2_compress(&mut h, &m, t, final_flag, rounds);

    let mut out = Vec::with_capacity(64);
    for word in h {
        out.extend_from_slice(&word.to_le_bytes());
    }
    Ok(out)
}

/// The BLAKE2b initialization vector.
const BLAKE2_IV: [u64; 8] = [
    0x6a09_e667_f3bc_c908,
    0xbb67_ae85_84ca_a73b,
    0x3c6e_f372_fe94_f82b,
    0xa54f_f53a_5f1d_36f1,
    0x510e_527f_ade6_82d1,
    0x9b05_688c_2b3e_6c1f,
    0x1f83_d9ab_fb41_bd6b,
    0x5be0_cd19_137e_2179,
];

/// The BLAKE2b message schedule.
const BLAKE2_SIGMA: [[usize; 16]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [14, 10, 4, 8, 9, 15, 13, 6, 1, 12, 0, 2, 11, 7, 5, 3],
    [11, 8, 12, 0, 5, 2, 15, 13, 10, 14, 3, 6, 7, 1, 9, 4],
    [7, 9, 3, 1, 13, 12, 11, 14, 2, 6, 5, 10, 4, 0, 15, 8],
    [9, 0, 5, 7, 2, 4, 10, 15, 14, 1, 11, 12, 6, 8, 3, 13],
    [2, 12, 6, 10, 0, 11, 8, 3, 4, 13, 7, 5, 15, 14, 1, 9],
    [12, 5, 1, 15, 14, 13, 4, 10, 0, 7, 6, 3, 9, 2, 8, 11],
    [13, 11, 7, 14, 12, 1, 3, 9, 5, 0, 15, 4, 8, 6, 2, 10],
    [6, 15, 14, 9, 11, 3, 0, 8, 12, 2, 13, 7, 1, 4, 10, 5],
    [10, 2, 8, 4, 7, 6, 1, 5, 15, 11, 9, 14, 3, 12, 13, 0],
];

/// The core compression function of BLAKE2b with a caller-chosen round
/// count.
fn blake2_compress(h: &mut [u64; 8], m: &[u64; 16], t: [u64; 2], last: bool, rounds: u32) {
    let mut v = [0u64; 16];
    v[..8].copy_from_slice(h);
    v[8..].copy_from_slice(&BLAKE2_IV);
    v[12] ^= t[0];
    v[13] ^= t[1];
    if last {
        v[14] = !v[14];
    }

    for round in 0..rounds {
        let s = &BLAKE2_SIGMA[(round as usize) % 10];
        g(&mut v, 0, 4, 8, 12, m[s[0]], m[s[1]]);
        g(&mut v, 1, 5, 9, 13, m[s[2]], m[s[3]]);
        g(&mut v, 2, 6, 10, 14, m[s[4]], m[s[5]]);
        g(&mut v, 3, 7, 11, 15, m[s[6]], m[s[7]]);
        g(&mut v, 0, 5, 10, 15, m[s[8]], m[s[9]]);
        g(&mut v, 1, 6, 11, 12, m[s[10]], m[s[11]]);
        g(&mut v, 2, 7, 8, 13, m[s[12]], m[s[13]]);
        g(&mut v, 3, 4, 9, 14, m[s[14]], m[s[15]]);
    }

    for (i, slot) in h.iter_mut().enumerate() {
        *slot ^= v[i] ^ v[i + 8];
    }
}

/// The BLAKE2b mixing function.
#[allow(clippy::many_single_char_names)] // The names are from RFC 7693.
fn g(v: &mut [u64; 16], a: usize, b: usize, c: usize, d: usize, x: u64, y: u64) {
    v[a] = v[a].wrapping_add(v[b]).wrapping_add(x);
    v[d] = (v[d] ^ v[a]).rotate_right(32);
    v[c] = v[c].wrapping_add(v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(24);
    v[a] = v[a].wrapping_add(v[b]).wrapping_add(y);
    v[d] = (v[d] ^ v[a]).rotate_right(16);
    v[c] = v[c].wrapping_add(v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(63);
}

/// Reads the length word at `offset`, clamped into `u64`.
fn read_length(input: &[u8], offset: usize) -> u64 {
    let word = U256::from_be_bytes(
        padded_slice(input, offset, 32)
            .try_into()
            .expect("the slice is exactly 32 bytes"),
    );
    if word > U256::from(u64::MAX) {
        u64::MAX
    } else {
        word.as_u64()
    }
}

/// Extracts `len` bytes at `offset` from `input`, zero-extending past its
/// end.
fn padded_slice(input: &[u8], offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = offset
            .checked_add(i)
            .and_then(|index| input.get(index))
            .copied()
            .unwrap_or(0);
    }
    out
}

#[cfg(test)]
mod test {
    use crate::{
        gas::FeeSchedule,
        vm::precompile::{cost, execute},
    };

    #[test]
    fn sha256_hashes() {
        let out = execute(2, b"").unwrap();
        assert_eq!(
            hex::encode(out),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn ripemd_output_is_left_padded() {
        let out = execute(3, b"").unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(&out[..12], &[0u8; 12]);
        assert_eq!(
            hex::encode(&out[12..]),
            "9c1185a5c5e9fc54612808977ee8f548b2258d31"
        );
    }

    #[test]
    fn identity_copies() {
        assert_eq!(execute(4, b"hello").unwrap(), b"hello");
    }

    #[test]
    fn ecrecover_of_garbage_is_empty() {
        assert_eq!(execute(1, &[0u8; 128]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn modexp_computes_small_cases() {
        // 3 ^ 5 mod 7 == 5, with one-byte operands.
        let mut input = Vec::new();
        let word = |n: u64| ethnum::U256::from(n).to_be_bytes();
        input.extend_from_slice(&word(1));
        input.extend_from_slice(&word(1));
        input.extend_from_slice(&word(1));
        input.extend_from_slice(&[3, 5, 7]);
        assert_eq!(execute(5, &input).unwrap(), vec![5]);
    }

    #[test]
    fn modexp_with_zero_modulus_is_zero() {
        let mut input = Vec::new();
        let word = |n: u64| ethnum::U256::from(n).to_be_bytes();
        input.extend_from_slice(&word(1));
        input.extend_from_slice(&word(1));
        input.extend_from_slice(&word(1));
        input.extend_from_slice(&[3, 5, 0]);
        assert_eq!(execute(5, &input).unwrap(), vec![0]);
    }

    #[test]
    fn modexp_floor_price_is_two_hundred(){
        let fees = FeeSchedule::london();
        assert_eq!(cost(&fees, 5, &[]), 200);
    }

    #[test]
    fn hash_precompile_costs_scale_by_word() {
        let fees = FeeSchedule::london();
        assert_eq!(cost(&fees, 2, &[0; 32]), 72);
        assert_eq!(cost(&fees, 2, &[0; 33]), 84);
        assert_eq!(cost(&fees, 3, &[0; 32]), 720);
        assert_eq!(cost(&fees, 4, &[0; 64]), 21);
    }

    #[test]
    fn pairing_of_nothing_is_true() {
        let out = execute(8, &[]).unwrap();
        assert_eq!(out[31], 1);
    }

    #[test]
    fn blake2f_matches_the_eip_152_vector() {
        // Test vector 5 from EIP-152: compressing the block "abc".
        let mut input = Vec::with_capacity(213);
        input.extend_from_slice(&12u32.to_be_bytes());
        input.extend_from_slice(
            &hex::decode(
                "48c9bdf267e6096a3ba7ca8485ae67bb2bf894fe72f36e3cf1361d5f3af54fa5\
                 d182e6ad7f520e511f6c3e2b8c68059b6bbd41fbabd9831f79217e1319cde05b",
            )
            .unwrap(),
        );
        let mut message = [0u8; 128];
        message[..3].copy_from_slice(b"abc");
        input.extend_from_slice(&message);
        input.extend_from_slice(&3u64.to_le_bytes());
        input.extend_from_slice(&0u64.to_le_bytes());
        input.push(1);
        assert_eq!(input.len(), 213);

        let out = execute(9, &input).unwrap();
        assert_eq!(
            hex::encode(&out),
            "ba80a53f981c4d0d6a2797b69f12f6e94c212f14685ac4b74b12bb6fdbffa2d1\
             7d87c5392aab792dc252d5de4533cc9518d38aa8dbf1925ab92386edd4009923"
        );
    }
}
