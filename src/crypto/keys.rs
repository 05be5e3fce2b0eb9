//! Vault key material and HKDF-SHA256 helpers.
//!
//! A `VaultKeys` holds the symmetric keys that protect one user's home
//! directory: the file encryption key (FEK), the filename encryption key
//! (FNEK), their salts, and a key reserved for the user's token store.
//! Every key slot of a user wraps the *same* `VaultKeys`.
//!
//! Key signatures (the names under which the FEK/FNEK are inserted into
//! the kernel keyring) are derived with HKDF so the raw keys never leave
//! this module in printable form.

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::{HomeVaultError, Result};

/// Length of the FEK, FNEK and token key (256 bits).
pub const KEY_LEN: usize = 32;

/// Length of the FEK/FNEK salts.
pub const KEY_SALT_LEN: usize = 16;

/// Length of a key signature in bytes before hex encoding.
const SIGNATURE_LEN: usize = 8;

/// Serialized size of a `VaultKeys`.
const SERIALIZED_LEN: usize = KEY_LEN * 3 + KEY_SALT_LEN * 2;

/// Decrypted key material of one vault, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKeys {
    fek: [u8; KEY_LEN],
    fek_salt: [u8; KEY_SALT_LEN],
    fnek: [u8; KEY_LEN],
    fnek_salt: [u8; KEY_SALT_LEN],
    chaps_key: [u8; KEY_LEN],
}

impl VaultKeys {
    /// Generate fresh random key material.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut keys = Self {
            fek: [0u8; KEY_LEN],
            fek_salt: [0u8; KEY_SALT_LEN],
            fnek: [0u8; KEY_LEN],
            fnek_salt: [0u8; KEY_SALT_LEN],
            chaps_key: [0u8; KEY_LEN],
        };
        rng.fill_bytes(&mut keys.fek);
        rng.fill_bytes(&mut keys.fek_salt);
        rng.fill_bytes(&mut keys.fnek);
        rng.fill_bytes(&mut keys.fnek_salt);
        rng.fill_bytes(&mut keys.chaps_key);
        keys
    }

    /// Serialize into a fixed-layout plaintext blob.
    ///
    /// Layout: `fek | fek_salt | fnek | fnek_salt | chaps_key`.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(SERIALIZED_LEN));
        out.extend_from_slice(&self.fek);
        out.extend_from_slice(&self.fek_salt);
        out.extend_from_slice(&self.fnek);
        out.extend_from_slice(&self.fnek_salt);
        out.extend_from_slice(&self.chaps_key);
        out
    }

    /// Parse a blob produced by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SERIALIZED_LEN {
            return Err(HomeVaultError::CorruptKeyset(format!(
                "key material is {} bytes, expected {SERIALIZED_LEN}",
                bytes.len()
            )));
        }
        let mut keys = Self {
            fek: [0u8; KEY_LEN],
            fek_salt: [0u8; KEY_SALT_LEN],
            fnek: [0u8; KEY_LEN],
            fnek_salt: [0u8; KEY_SALT_LEN],
            chaps_key: [0u8; KEY_LEN],
        };
        let (fek, rest) = bytes.split_at(KEY_LEN);
        let (fek_salt, rest) = rest.split_at(KEY_SALT_LEN);
        let (fnek, rest) = rest.split_at(KEY_LEN);
        let (fnek_salt, chaps_key) = rest.split_at(KEY_SALT_LEN);
        keys.fek.copy_from_slice(fek);
        keys.fek_salt.copy_from_slice(fek_salt);
        keys.fnek.copy_from_slice(fnek);
        keys.fnek_salt.copy_from_slice(fnek_salt);
        keys.chaps_key.copy_from_slice(chaps_key);
        Ok(keys)
    }

    pub fn fek(&self) -> &[u8; KEY_LEN] {
        &self.fek
    }

    pub fn fek_salt(&self) -> &[u8; KEY_SALT_LEN] {
        &self.fek_salt
    }

    pub fn fnek(&self) -> &[u8; KEY_LEN] {
        &self.fnek
    }

    pub fn fnek_salt(&self) -> &[u8; KEY_SALT_LEN] {
        &self.fnek_salt
    }

    pub fn chaps_key(&self) -> &[u8; KEY_LEN] {
        &self.chaps_key
    }

    /// Keyring signature of the file encryption key.
    pub fn fek_signature(&self) -> Result<String> {
        key_signature(&self.fek, b"homevault-fek-signature")
    }

    /// Keyring signature of the filename encryption key.
    pub fn fnek_signature(&self) -> Result<String> {
        key_signature(&self.fnek, b"homevault-fnek-signature")
    }
}

impl std::fmt::Debug for VaultKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKeys(..)")
    }
}

fn key_signature(key: &[u8], info: &[u8]) -> Result<String> {
    let okm = hkdf_derive::<SIGNATURE_LEN>(None, key, info)?;
    Ok(okm.iter().map(|b| format!("{b:02x}")).collect())
}

/// Run HKDF-SHA256 extract + expand with the given `salt` and `info`.
pub fn hkdf_derive<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; N]> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);

    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|e| HomeVaultError::KeyDerivationFailed(format!("HKDF expand failed: {e}")))?;

    Ok(okm)
}
