//! Device slot discovery and kernel device path resolution.

mod enumerate;
mod local;
mod resolver;
mod slot;

pub use enumerate::{render as render_slots, reserved_slots, visible_devices};
pub use local::{
    DEFAULT_LSBLK_BIN, DEFAULT_SETTLE_TIMEOUT, DEFAULT_UDEVADM_BIN, DeviceError, LocalDevices,
    SystemDevices,
};
pub use resolver::{DeviceDiff, DevicePathResolver, ResolvedDevice};
pub use slot::{BOOT_DEVICE_LETTER, DEFAULT_LOWEST_LETTER, DeviceSlot, SlotPolicy};
