pub mod device;
pub mod error;

pub use device::{BlockDevice, DeviceAccess, MemDevice};
pub use error::{FsError, FsResult};
