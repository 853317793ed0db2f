// FAT12/FAT16/FAT32 read/write driver over a sector-granular block
// device: image files, MBR partitions, or any source with the same
// semantics.

pub mod adapters;
pub mod alloc;
pub mod api;
pub mod boot;
pub mod chain;
pub mod codec;
pub mod dir;
pub mod names;
pub mod table;
pub mod volume;

pub use adapters::{ChunkingDevice, FileDevice, OverlayDevice, PartitionDevice};
pub use api::File;
pub use boot::FatType;
pub use fathom_core::{BlockDevice, DeviceAccess, FsError, FsResult, MemDevice};
pub use volume::{FatVolume, Located, MountOptions, VolumeInfo, VolumeStats};
