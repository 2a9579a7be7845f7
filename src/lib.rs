mod actor;
mod api;
mod blockdev;
mod device;
mod wire;
mod workers;

pub use api::try_create_device;
pub use api::ConnState;
pub use api::DeviceConfig;
pub use api::DeviceCreationError;
pub use api::DeviceHandle;
pub use api::DeviceStatus;
pub use api::DiskState;
pub use api::MirrorOptions;
pub use api::OnCongestion;
pub use api::Protocol;
pub use api::ReadBalancing;
pub use api::Role;
pub use blockdev::BlockTarget;
pub use blockdev::MemDisk;
pub use blockdev::SECTOR_SIZE;
pub use device::AdminError;
pub use device::FileMetadataStore;
pub use device::GenCounts;
pub use device::MetadataStore;
pub use device::RequestError;
pub use device::VolatileMetadataStore;
