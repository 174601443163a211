//! # RemoteBox – VirtualBox Management
//!
//! Drives `VBoxManage` on the local machine or over SSH. Provides:
//!
//! - **Transport** – one command contract for local processes and remote
//!   shell channels, with live output and progress
//! - **Parsing** – every `VBoxManage` output dialect into property maps and
//!   records (machine-readable, record blocks, media trees, colon fields)
//! - **State cache** – per-VM and per-server property maps with
//!   refresh-or-skip semantics and bounded command transcripts
//! - **Mutators** – lifecycle, `modifyvm` settings, snapshots, storage,
//!   USB filters, shared folders, media, appliances
//! - **Reconciler** – diff an edited child collection against the observed
//!   one and apply the commands in dependency order
//! - **Tasks** – handles for background work with progress

pub mod types;
pub mod error;
pub mod parse;
pub mod transport;
pub mod task;
pub mod entity;
pub mod projection;
pub mod machine;
pub mod server;
pub mod vm;
pub mod snapshot;
pub mod storage;
pub mod devices;
pub mod reconcile;
pub mod poller;
pub mod service;
pub mod testing;

pub use entity::RefreshOutcome;
pub use error::{VboxError, VboxErrorKind, VboxResult};
pub use machine::Machine;
pub use server::{Server, ServerParams};
pub use service::{VboxService, VboxServiceState};
pub use task::{Operation, Task};
pub use transport::{CommandRunner, LocalRunner, SshRunner, Transport};
pub use vm::{VmContext, VmManager, VmSetting};
