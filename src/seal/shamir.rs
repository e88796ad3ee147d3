//! Threshold secret sharing over GF(2^8).
//!
//! Each byte of the secret is the constant term of an independent random
//! polynomial of degree `threshold - 1`; share `x` holds the polynomial values at
//! `x` for every byte. Any `threshold` shares recover the constant terms by
//! Lagrange interpolation at zero, while fewer shares are consistent with every
//! possible secret byte.

use base64::Engine;
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{Error, Result};
use crate::secrets::SecretString;

/// Largest number of shares addressable with one-byte share indexes.
pub const MAX_SHARES: u8 = 255;

/// One share of a split secret.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    index: u8,
    value: Vec<u8>,
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("value", &format!("[{} bytes]", self.value.len()))
            .finish()
    }
}

impl Share {
    /// Share index (the x coordinate); always non-zero.
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Wire form: base64 of `[index, value...]`.
    pub fn encode(&self) -> SecretString {
        let mut raw = Vec::with_capacity(self.value.len() + 1);
        raw.push(self.index);
        raw.extend_from_slice(&self.value);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&raw);
        raw.zeroize();
        SecretString::new(encoded)
    }

    /// Parse the wire form produced by [`Share::encode`].
    pub fn decode(encoded: &str) -> Result<Self> {
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::validation(format!("share is not valid base64: {}", e)))?;

        if raw.len() < 2 {
            raw.zeroize();
            return Err(Error::validation("share is too short"));
        }
        let index = raw[0];
        if index == 0 {
            raw.zeroize();
            return Err(Error::validation("share index must be non-zero"));
        }

        let share = Share { index, value: raw[1..].to_vec() };
        raw.zeroize();
        Ok(share)
    }
}

/// Split `secret` into `shares` shares, any `threshold` of which reconstruct it.
pub fn split<R: RngCore + CryptoRng>(
    secret: &[u8],
    threshold: u8,
    shares: u8,
    rng: &mut R,
) -> Result<Vec<Share>> {
    if secret.is_empty() {
        return Err(Error::validation("cannot split an empty secret"));
    }
    if threshold == 0 {
        return Err(Error::validation("threshold must be at least 1"));
    }
    if threshold > shares {
        return Err(Error::validation(format!(
            "threshold ({}) cannot exceed share count ({})",
            threshold, shares
        )));
    }

    let mut out: Vec<Share> = (1..=shares)
        .map(|index| Share { index, value: Vec::with_capacity(secret.len()) })
        .collect();

    let mut coefficients = vec![0u8; threshold as usize];
    for &byte in secret {
        coefficients[0] = byte;
        rng.fill_bytes(&mut coefficients[1..]);
        for share in out.iter_mut() {
            share.value.push(evaluate(&coefficients, share.index));
        }
    }
    coefficients.zeroize();

    Ok(out)
}

/// Reconstruct the secret from shares.
///
/// The caller is responsible for supplying at least `threshold` shares; with
/// fewer, the result is a well-formed but unrelated byte string.
pub fn combine(shares: &[Share]) -> Result<Vec<u8>> {
    let first = shares.first().ok_or_else(|| Error::validation("no shares supplied"))?;
    let len = first.value.len();

    for (i, share) in shares.iter().enumerate() {
        if share.index == 0 {
            return Err(Error::validation("share index must be non-zero"));
        }
        if share.value.len() != len {
            return Err(Error::validation("shares have mismatched lengths"));
        }
        if shares[..i].iter().any(|other| other.index == share.index) {
            return Err(Error::validation(format!("duplicate share index {}", share.index)));
        }
    }

    let basis: Vec<u8> = shares
        .iter()
        .map(|share| {
            shares.iter().filter(|other| other.index != share.index).fold(1u8, |acc, other| {
                gf_mul(acc, gf_div(other.index, other.index ^ share.index))
            })
        })
        .collect();

    let mut secret = vec![0u8; len];
    for (position, byte) in secret.iter_mut().enumerate() {
        *byte = shares
            .iter()
            .zip(&basis)
            .fold(0u8, |acc, (share, weight)| acc ^ gf_mul(share.value[position], *weight));
    }
    Ok(secret)
}

fn evaluate(coefficients: &[u8], x: u8) -> u8 {
    coefficients.iter().rev().fold(0u8, |acc, &c| gf_mul(acc, x) ^ c)
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    for _ in 0..8 {
        let mask = 0u8.wrapping_sub(b & 1);
        product ^= a & mask;
        let carry = 0u8.wrapping_sub(a >> 7);
        a = (a << 1) ^ (0x1b & carry);
        b >>= 1;
    }
    product
}

fn gf_inv(a: u8) -> u8 {
    // a^254 == a^-1 in GF(2^8); gf_inv(0) is 0 and never reached with distinct indexes.
    let mut result = 1u8;
    let mut base = a;
    let mut exp = 254u8;
    while exp > 0 {
        if exp & 1 == 1 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

fn gf_div(a: u8, b: u8) -> u8 {
    gf_mul(a, gf_inv(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::OsRng;
    use rand::seq::SliceRandom;

    #[test]
    fn test_field_inverse() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "inverse failed for {}", a);
        }
    }

    #[test]
    fn test_five_of_three_any_subset() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let shares = split(secret, 3, 5, &mut OsRng).unwrap();
        assert_eq!(shares.len(), 5);

        let pick = |idx: &[usize]| idx.iter().map(|&i| shares[i].clone()).collect::<Vec<_>>();
        assert_eq!(combine(&pick(&[0, 2, 4])).unwrap(), secret);
        assert_eq!(combine(&pick(&[4, 1, 3])).unwrap(), secret);
        assert_eq!(combine(&pick(&[0, 1, 2, 3, 4])).unwrap(), secret);
        assert_ne!(combine(&pick(&[1, 3])).unwrap(), secret);
    }

    #[test]
    fn test_threshold_one_shares_equal_secret() {
        let shares = split(b"k", 1, 3, &mut OsRng).unwrap();
        for share in &shares {
            assert_eq!(combine(std::slice::from_ref(share)).unwrap(), b"k");
        }
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(split(b"secret", 0, 3, &mut OsRng).is_err());
        assert!(split(b"secret", 4, 3, &mut OsRng).is_err());
        assert!(split(b"", 2, 3, &mut OsRng).is_err());
    }

    #[test]
    fn test_combine_rejects_duplicates_and_mismatches() {
        let shares = split(b"secret", 2, 3, &mut OsRng).unwrap();
        assert!(combine(&[shares[0].clone(), shares[0].clone()]).is_err());
        assert!(combine(&[]).is_err());

        let other = split(b"longer secret", 2, 3, &mut OsRng).unwrap();
        assert!(combine(&[shares[0].clone(), other[1].clone()]).is_err());
    }

    #[test]
    fn test_encode_decode() {
        let shares = split(b"master-key", 2, 2, &mut OsRng).unwrap();
        let encoded = shares[1].encode();
        let decoded = Share::decode(encoded.expose_secret()).unwrap();
        assert_eq!(decoded, shares[1]);
        assert_eq!(decoded.index(), 2);

        assert!(Share::decode("not base64!!").is_err());
        assert!(Share::decode("AA==").is_err());
        assert!(Share::decode("AAEC").is_err());
    }

    #[test]
    fn test_debug_hides_share_bytes() {
        let shares = split(b"master-key", 2, 2, &mut OsRng).unwrap();
        let debug = format!("{:?}", shares[0]);
        assert!(debug.contains("[10 bytes]"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_any_threshold_subset_reconstructs(
            secret in proptest::collection::vec(any::<u8>(), 1..48),
            total in 1u8..10,
            threshold_seed in any::<u8>(),
            shuffle_seed in any::<u64>(),
        ) {
            let threshold = threshold_seed % total + 1;
            let mut shares = split(&secret, threshold, total, &mut OsRng).unwrap();

            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(shuffle_seed);
            shares.shuffle(&mut rng);

            let subset: Vec<Share> = shares.into_iter().take(threshold as usize).collect();
            prop_assert_eq!(combine(&subset).unwrap(), secret);
        }
    }
}
