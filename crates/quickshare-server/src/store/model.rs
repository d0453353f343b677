use serde::{Deserialize, Serialize};

use super::crypto::CipherMeta;

/// Stored in redb as bincode-encoded bytes, keyed by paste id.
/// `ciphertext` is ChaCha20Poly1305 output; see [`CipherMeta`] for how to reverse it.
/// Lifecycle metadata stays plaintext so the sweep can evict without decrypting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasteRecord {
    /// ChaCha20Poly1305 ciphertext (content + tag).
    pub ciphertext: Vec<u8>,
    pub cipher: CipherMeta,
    /// Whether opening requires a caller-supplied password.
    pub has_password: bool,
    /// Unix timestamp (seconds) when the paste was created.
    pub created_at: i64,
    /// Optional Unix timestamp (seconds) at which the paste expires.
    pub expires_at: Option<i64>,
    /// Optional view limit. `None` is unlimited.
    pub max_views: Option<u32>,
    /// Committed views so far.
    pub view_count: u32,
    /// Set on the snapshot handed out by the terminal view. Never persisted as true.
    pub destroyed: bool,
}
