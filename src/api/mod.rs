//! This mod is meant to hold most of the code for the library's client-facing API.
mod client;
pub(crate) mod options;
pub(crate) mod types;
mod wiring;

pub use client::DeviceHandle;
pub use options::MirrorOptions;
pub use types::ConnState;
pub use types::DeviceStatus;
pub use types::DiskState;
pub use types::OnCongestion;
pub use types::Protocol;
pub use types::ReadBalancing;
pub use types::Role;
pub use wiring::try_create_device;
pub use wiring::DeviceConfig;
pub use wiring::DeviceCreationError;
