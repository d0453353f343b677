pub mod access;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: access::PasteService,
}

pub use access::{Created, Delivered, NewPaste, PasteService};
pub use error::AccessError;
pub use server::{read_key_file, router, run, ServerConfig};
