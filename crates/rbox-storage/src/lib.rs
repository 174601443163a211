//! # RemoteBox – Storage
//!
//! The persisted server list (`servers.json`) and the passphrase-based
//! vault that encrypts the credentials stored in it.

pub mod error;
pub mod servers;
pub mod vault;

pub use error::{StorageError, StorageResult};
pub use servers::{load_records, load_servers, save_records, ServerRecord};
pub use vault::Vault;
