use anyhow::Result;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

const MASTER_LABEL: &[u8] = b"quickshare/content-key/master";
const PASSWORD_LABEL: &[u8] = b"quickshare/content-key/password";

/// 32-byte server master key. Process-wide and read-only after startup.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generate a fresh random master key.
pub fn generate_key() -> MasterKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    MasterKey(key)
}

/// Load a master key from raw bytes. Returns `None` unless exactly 32 bytes.
pub fn load_key(bytes: &[u8]) -> Option<MasterKey> {
    let key: [u8; 32] = bytes.try_into().ok()?;
    Some(MasterKey(key))
}

/// Derive a master key from an operator passphrase and a persisted salt.
pub fn derive_master_key(passphrase: &str, salt: &[u8; 32], kdf: KdfParams) -> Result<MasterKey> {
    let mut key = [0u8; 32];
    kdf.argon2()?
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;
    Ok(MasterKey(key))
}

/// Generate a fresh 32-byte random salt for master key derivation.
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Argon2id cost parameters. Stored with every password-protected paste so a
/// configuration change never strands existing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536, // 64 MiB
            iterations: 3,
            lanes: 1,
        }
    }
}

impl KdfParams {
    fn argon2(&self) -> Result<Argon2<'static>> {
        let params = Params::new(self.memory_kib, self.iterations, self.lanes, Some(32))
            .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Reject parameters argon2 would refuse, so bad configuration fails at startup.
    pub fn validate(&self) -> Result<()> {
        self.argon2().map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    /// Content key = HMAC-SHA256(master, salt).
    MasterChaCha20Poly1305,
    /// Content key = HMAC-SHA256(master, Argon2id(password, salt)).
    Argon2idChaCha20Poly1305,
}

/// Everything needed to reverse a seal, except the key material itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherMeta {
    pub algorithm: CipherAlgorithm,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    /// Present only for `Argon2idChaCha20Poly1305`.
    pub kdf: Option<KdfParams>,
}

/// Wrong password, tampered ciphertext or unusable metadata. Deliberately carries
/// no detail about which.
#[derive(Debug, thiserror::Error)]
#[error("decryption failed")]
pub struct DecryptionFailed;

/// Seals and opens paste content. Holds the master key and the KDF cost used
/// for new password-protected pastes.
pub struct Envelope {
    master: MasterKey,
    kdf: KdfParams,
}

impl Envelope {
    pub fn new(master: MasterKey, kdf: KdfParams) -> Self {
        Self { master, kdf }
    }

    /// Encrypt `plaintext`, optionally under a user password.
    pub fn seal(&self, plaintext: &[u8], password: Option<&str>) -> Result<(Vec<u8>, CipherMeta)> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let meta = match password {
            Some(_) => CipherMeta {
                algorithm: CipherAlgorithm::Argon2idChaCha20Poly1305,
                salt,
                nonce,
                kdf: Some(self.kdf),
            },
            None => CipherMeta {
                algorithm: CipherAlgorithm::MasterChaCha20Poly1305,
                salt,
                nonce,
                kdf: None,
            },
        };

        let key = self.content_key(&meta, password)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&meta.nonce), plaintext)
            .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

        Ok((ciphertext, meta))
    }

    /// Decrypt content sealed by [`Envelope::seal`]. Any mismatch between the
    /// metadata and the supplied password is a `DecryptionFailed`.
    pub fn open(
        &self,
        ciphertext: &[u8],
        meta: &CipherMeta,
        password: Option<&str>,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionFailed> {
        let key = self
            .content_key(meta, password)
            .map_err(|_| DecryptionFailed)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        cipher
            .decrypt(Nonce::from_slice(&meta.nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| DecryptionFailed)
    }

    fn content_key(&self, meta: &CipherMeta, password: Option<&str>) -> Result<Zeroizing<[u8; 32]>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.master.as_bytes())
            .map_err(|e| anyhow::anyhow!("hmac key: {e}"))?;

        match (meta.algorithm, password, meta.kdf) {
            (CipherAlgorithm::MasterChaCha20Poly1305, None, None) => {
                mac.update(MASTER_LABEL);
                mac.update(&meta.salt);
            }
            (CipherAlgorithm::Argon2idChaCha20Poly1305, Some(password), Some(kdf)) => {
                let mut stretched = Zeroizing::new([0u8; 32]);
                kdf.argon2()?
                    .hash_password_into(password.as_bytes(), &meta.salt, stretched.as_mut_slice())
                    .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;
                mac.update(PASSWORD_LABEL);
                mac.update(stretched.as_slice());
            }
            _ => anyhow::bail!("cipher metadata does not match supplied credentials"),
        }

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(key)
    }
}

/// Cheapest parameters argon2 accepts. Only for tests.
#[cfg(test)]
pub(crate) fn test_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 8,
        iterations: 1,
        lanes: 1,
    }
}
