//! Remote synchronization: SigV4 signing, the S3 client, listing
//! parsers, change events, and the per-vault reconciliation loops.

pub mod client;
pub mod controller;
pub mod events;
pub mod remote;
pub mod sigv4;

pub use client::{MultipartTransport, S3Client, ValidateResult};
pub use controller::SyncController;
pub use events::{ChangeEvent, SyncEvent};
pub use remote::RemoteObject;
