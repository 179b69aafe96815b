//! Loop 设备的用户态控制库
//!
//! [`LoopContext`] 表示一个 loop 设备，负责读取属性（优先 sysfs，其次 ioctl）、
//! 发现空闲或已用设备，以及把普通文件绑定到设备上。
//!
//! ```no_run
//! use loopdev::{LoopContext, LoopdevFlags};
//!
//! let mut ctx = LoopContext::new(LoopdevFlags::empty());
//! loop {
//!     if ctx.find_unused()?.is_none() {
//!         break;
//!     }
//!     ctx.set_backing_file("disk.img")?;
//!     match ctx.setup_device() {
//!         Err(e) if e.is_busy() => continue,
//!         r => break r?,
//!     }
//! }
//! # Ok::<(), loopdev::SystemError>(())
//! ```

pub mod constants;
pub mod context;
pub mod ioctl;
pub mod iter;
pub mod platform;
pub mod setup;
pub mod sysfs;
pub mod utils;

#[cfg(test)]
mod mock;

pub use constants::{LoFlags, LoopInfo64};
pub use context::{AttrValue, LoopAttr, LoopContext, LoopdevFlags};
pub use iter::{IterFlags, LoopScan};
pub use platform::{Platform, PlatformBuilder};
pub use system_error::SystemError;
