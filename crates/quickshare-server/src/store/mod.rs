pub mod crypto;
pub mod db;
pub mod expiry;
pub mod model;

pub use crypto::{CipherMeta, DecryptionFailed, Envelope, KdfParams, MasterKey};
pub use db::{CommitGate, ConsumeResult, PutResult, Store};
pub use model::PasteRecord;
