//! RFC 6238 time-based one-time passwords
//!
//! The login form's OTP step accepts codes from an authenticator app; the
//! shared secret is the usual base32 string, 30-second steps, 6 digits.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

const STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

#[derive(Debug, Error)]
pub enum TotpError {
    #[error("TOTP shared secret is not valid base32")]
    InvalidSecret,
}

/// Current code for a base32-encoded shared secret.
pub fn generate(secret_base32: &str, at: SystemTime) -> Result<String, TotpError> {
    let key = decode_base32(secret_base32).ok_or(TotpError::InvalidSecret)?;
    if key.is_empty() {
        return Err(TotpError::InvalidSecret);
    }
    let counter = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / STEP_SECS)
        .unwrap_or(0);
    Ok(hotp(&key, counter))
}

fn hotp(key: &[u8], counter: u64) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC key length is valid");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 §5.3).
    let offset = (digest[19] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    format!("{:01$}", binary % 10u32.pow(DIGITS), DIGITS as usize)
}

/// RFC 4648 base32 decode; case-insensitive, padding and whitespace ignored.
fn decode_base32(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut bits: u32 = 0;
    let mut bit_count: u32 = 0;
    let mut out = Vec::with_capacity(s.len() * 5 / 8);

    for c in s.bytes() {
        if c == b'=' || c.is_ascii_whitespace() {
            continue;
        }
        let value = ALPHABET
            .iter()
            .position(|&a| a == c.to_ascii_uppercase())? as u32;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Some(out)
}
