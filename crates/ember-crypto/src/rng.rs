use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Fill `buf` from the operating system's CSPRNG.
///
/// A failing randomness source is fatal for key generation: the error is
/// surfaced rather than falling back to a weaker generator.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CryptoError::KeyGeneration(format!("OS randomness unavailable: {e}")))
}

/// Return `N` fresh random bytes.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}
