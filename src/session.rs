//! Hardware-free re-authentication of an unlocked user.
//!
//! On mount, a random blob is sealed under a key derived from the user's
//! passkey.  Later checks re-derive the key from a candidate passkey and
//! try to open the blob, which needs no wrapping-engine round trip.

use subtle::ConstantTimeEq;

use crate::crypto::encryption::{decrypt, encrypt};
use crate::crypto::kdf::random_bytes;
use crate::crypto::keys::hkdf_derive;
use crate::errors::Result;

const SESSION_SALT_LEN: usize = 16;
const SESSION_BLOB_LEN: usize = 32;
const SESSION_INFO: &[u8] = b"homevault-reauth-session";

#[derive(Debug)]
pub struct ReauthSession {
    obfuscated_username: String,
    salt: Vec<u8>,
    cipher: Vec<u8>,
}

impl ReauthSession {
    pub fn start(obfuscated_username: &str, passkey: &[u8]) -> Result<Self> {
        let salt = random_bytes(SESSION_SALT_LEN);
        let key = zeroize::Zeroizing::new(hkdf_derive::<32>(Some(&salt), passkey, SESSION_INFO)?);
        let blob = zeroize::Zeroizing::new(random_bytes(SESSION_BLOB_LEN));
        let cipher = encrypt(key.as_slice(), &blob, obfuscated_username.as_bytes())?;
        Ok(Self {
            obfuscated_username: obfuscated_username.to_string(),
            salt,
            cipher,
        })
    }

    pub fn obfuscated_username(&self) -> &str {
        &self.obfuscated_username
    }

    pub fn check_user(&self, obfuscated_username: &str) -> bool {
        self.obfuscated_username
            .as_bytes()
            .ct_eq(obfuscated_username.as_bytes())
            .into()
    }

    /// Whether `passkey` is the secret the session was started with.
    pub fn verify(&self, obfuscated_username: &str, passkey: &[u8]) -> bool {
        if !self.check_user(obfuscated_username) {
            return false;
        }
        let Ok(key) = hkdf_derive::<32>(Some(&self.salt), passkey, SESSION_INFO) else {
            return false;
        };
        let key = zeroize::Zeroizing::new(key);
        decrypt(key.as_slice(), &self.cipher, self.obfuscated_username.as_bytes()).is_ok()
    }
}
