use std::{fs::File, os::unix::io::AsRawFd};

use log::trace;
use system_error::SystemError;

use crate::constants::{LoopInfo64, LoopIoctl};

/// legacy 控制通道：直接对已打开的 loop 设备描述符发 ioctl
///
/// 所有请求都使用固定布局的 [`LoopInfo64`]。实现必须把内核返回的 errno
/// 原样转换为 [`SystemError`]，不做重试。
pub trait LoopControl: Send + Sync {
    /// `LOOP_GET_STATUS64`
    fn get_status64(&self, dev: &File) -> Result<LoopInfo64, SystemError>;

    /// `LOOP_SET_STATUS64`
    fn set_status64(&self, dev: &File, info: &LoopInfo64) -> Result<(), SystemError>;

    /// `LOOP_SET_FD`：把 `backing` 绑定到设备
    fn set_fd(&self, dev: &File, backing: &File) -> Result<(), SystemError>;

    /// `LOOP_CLR_FD`：解除绑定
    fn clr_fd(&self, dev: &File) -> Result<(), SystemError>;
}

/// 通过 libc 调用真实内核的实现
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelLoopControl;

impl KernelLoopControl {
    fn ioctl(dev: &File, cmd: LoopIoctl, arg: libc::c_ulong) -> Result<(), SystemError> {
        // ioctl 的 request 参数在 glibc/musl 上类型不同，用 `as _` 适配
        let ret = unsafe { libc::ioctl(dev.as_raw_fd(), cmd as u32 as _, arg) };
        if ret < 0 {
            let err = SystemError::last_os_error();
            trace!("{:?} on fd {} failed: {:?}", cmd, dev.as_raw_fd(), err);
            return Err(err);
        }
        Ok(())
    }
}

impl LoopControl for KernelLoopControl {
    fn get_status64(&self, dev: &File) -> Result<LoopInfo64, SystemError> {
        let mut info = LoopInfo64::default();
        Self::ioctl(
            dev,
            LoopIoctl::LoopGetStatus64,
            &mut info as *mut LoopInfo64 as libc::c_ulong,
        )?;
        Ok(info)
    }

    fn set_status64(&self, dev: &File, info: &LoopInfo64) -> Result<(), SystemError> {
        Self::ioctl(
            dev,
            LoopIoctl::LoopSetStatus64,
            info as *const LoopInfo64 as libc::c_ulong,
        )
    }

    fn set_fd(&self, dev: &File, backing: &File) -> Result<(), SystemError> {
        Self::ioctl(
            dev,
            LoopIoctl::LoopSetFd,
            backing.as_raw_fd() as libc::c_ulong,
        )
    }

    fn clr_fd(&self, dev: &File) -> Result<(), SystemError> {
        Self::ioctl(dev, LoopIoctl::LoopClrFd, 0)
    }
}
