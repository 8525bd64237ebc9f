//! Confirmation token generation.

use rand::rngs::OsRng;
use rand::RngCore;

/// Produce `account-{user_id}-{4B}-{2B}-{2B}-{2B}-{6B}` from 16 bytes of OS
/// randomness, each group hex encoded.
pub fn confirmation_token(user_id: i64) -> Result<String, rand::Error> {
    confirmation_token_from(&mut OsRng, user_id)
}

pub fn confirmation_token_from<R: RngCore + ?Sized>(
    rng: &mut R,
    user_id: i64,
) -> Result<String, rand::Error> {
    let mut b = [0u8; 16];
    rng.try_fill_bytes(&mut b)?;
    Ok(format!(
        "account-{}-{}-{}-{}-{}-{}",
        user_id,
        hex::encode(&b[0..4]),
        hex::encode(&b[4..6]),
        hex::encode(&b[6..8]),
        hex::encode(&b[8..10]),
        hex::encode(&b[10..16]),
    ))
}
