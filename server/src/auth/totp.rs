//! RFC 6238 TOTP verification: SHA-1, 6 digits, 30-second step, current
//! step ±1 for clock skew. Secrets are 160 random bits, base32-encoded.

use base32::Alphabet;
use totp_rs::{Algorithm, TOTP};

const SECRET_BYTES: usize = 20;
const STEP_SECONDS: i64 = 30;
const DIGITS: usize = 6;

/// Generate a fresh base32-encoded TOTP secret.
pub fn generate_secret() -> String {
    let bytes: [u8; SECRET_BYTES] = rand::random();
    base32::encode(Alphabet::Rfc4648 { padding: true }, &bytes)
}

fn build(secret: &str, account: &str) -> Option<TOTP> {
    let bytes = base32::decode(Alphabet::Rfc4648 { padding: true }, secret)?;
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        1,
        STEP_SECONDS as u64,
        bytes,
        Some("Besedka".to_string()),
        account.to_string(),
    )
    .ok()
}

/// The numeric code for `secret` at `time` (unix seconds).
/// Exposed for tests and tooling; verification goes through [`check`].
pub fn generate_at(secret: &str, time: i64) -> Option<i64> {
    let totp = build(secret, "totp")?;
    totp.generate(time.max(0) as u64).parse().ok()
}

/// Verify `code` against `secret` at `now`, accepting the current step and
/// one step either side. A code equal to `last_totp` is rejected outright:
/// codes are single-use even inside their validity window.
pub fn check(secret: &str, code: i64, last_totp: i64, now: i64) -> bool {
    if code == last_totp {
        return false;
    }
    for step in -1..=1 {
        let t = now + step * STEP_SECONDS;
        if generate_at(secret, t) == Some(code) {
            return true;
        }
    }
    false
}
