//! 绑定与解绑
//!
//! 绑定流程：打开后端文件 -> 打开设备 -> `LOOP_SET_FD` -> `LOOP_SET_STATUS64`。
//! 任意一步在 `LOOP_SET_FD` 之后失败，都会对设备发一次 `LOOP_CLR_FD` 回滚。

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use log::{debug, trace, warn};
use system_error::SystemError;

use crate::{
    constants::LoFlags,
    context::{LoopContext, LoopdevFlags},
    ioctl::LoopControl,
    iter::IterFlags,
};

/// 打开文件，第二个参数为是否需要写权限
pub(crate) type OpenFn = fn(&Path, bool) -> io::Result<File>;

fn open_file(path: &Path, write: bool) -> io::Result<File> {
    OpenOptions::new().read(true).write(write).open(path)
}

/// # 功能
///
/// 打开后端文件。非只读模式下先尝试读写打开，遇到 `EROFS`/`EACCES` 时退回只读，
/// 其它错误原样返回。
///
/// ## 返回值
/// - `Ok((File, bool))`: 文件及其是否为只读打开。
/// - `Err(SystemError)`: open 失败的原因。
fn open_backing_file(
    path: &Path,
    read_only: bool,
    open: OpenFn,
) -> Result<(File, bool), SystemError> {
    if !read_only {
        match open(path, true) {
            Ok(file) => return Ok((file, false)),
            Err(e) => {
                let err = SystemError::from(e);
                if !matches!(err, SystemError::EROFS | SystemError::EACCES) {
                    return Err(err);
                }
                debug!("{} is not writable ({:?}), using read-only", path.display(), err);
            }
        }
    }
    Ok((open(path, false)?, true))
}

/// 回滚时的解绑，失败只记录日志
fn rollback(control: &dyn LoopControl, dev: &File) {
    if let Err(e) = control.clr_fd(dev) {
        warn!("loop rollback: LOOP_CLR_FD failed: {:?}", e);
    }
}

impl LoopContext {
    /// # 功能
    ///
    /// 把 [`LoopContext::set_backing_file`] 设置的文件绑定到当前设备，
    /// 并写入待绑定状态（offset、sizelimit、flags 以及 legacy 加密参数）。
    ///
    /// 无论成败都会丢弃状态缓存。成功时待绑定状态整体清零、后端文件路径被释放；
    /// 失败时只清除 key，其余字段保留，调用者可以换一个设备重试。
    ///
    /// ## 返回值
    /// - `Ok(())`: 绑定成功。
    /// - `Err(SystemError::EINVAL)`: 没有设置设备或后端文件。
    /// - `Err(SystemError::EBUSY)`: 设备已被占用，调用者应重新查找空闲设备后重试。
    /// - `Err(SystemError)`: 其它失败，设备已被解绑。
    pub fn setup_device(&mut self) -> Result<(), SystemError> {
        self.setup_device_with(open_file)
    }

    /// 同 [`LoopContext::setup_device`]，后端文件用 `open` 打开
    pub(crate) fn setup_device_with(&mut self, open: OpenFn) -> Result<(), SystemError> {
        let result = self.bind_pending(open);
        match result {
            Ok(()) => {
                self.info.clear();
                self.filename = None;
            }
            Err(_) => self.info.wipe_key(),
        }
        self.invalidate_status();
        result
    }

    fn bind_pending(&mut self, open: OpenFn) -> Result<(), SystemError> {
        if self.device.is_none() {
            return Err(SystemError::EINVAL);
        }
        let filename = self.filename.clone().ok_or(SystemError::EINVAL)?;

        let (backing, read_only) =
            open_backing_file(&filename, self.flags.contains(LoopdevFlags::RDONLY), open)?;
        if read_only {
            self.flags.remove(LoopdevFlags::RDWR);
            self.flags.insert(LoopdevFlags::RDONLY);
            self.info.lo_flags |= LoFlags::READ_ONLY.bits();
        } else {
            self.flags.remove(LoopdevFlags::RDONLY);
            self.flags.insert(LoopdevFlags::RDWR);
            if self.fd.is_some() && !self.fd_rdwr {
                trace!("reopening {:?} read-write", self.device);
                self.fd = None;
            }
        }

        // 打开设备失败时 backing 随返回被关闭
        self.get_fd()?;
        let dev = self.fd.as_ref().ok_or(SystemError::EBADF)?;
        let control = &*self.control;

        if let Err(e) = control.set_fd(dev, &backing) {
            drop(backing);
            debug!("LOOP_SET_FD on {:?} failed: {:?}", self.device, e);
            rollback(control, dev);
            return Err(e);
        }
        drop(backing);

        if let Err(e) = control.set_status64(dev, &self.info) {
            debug!("LOOP_SET_STATUS64 on {:?} failed: {:?}, unbinding", self.device, e);
            rollback(control, dev);
            return Err(e);
        }

        debug!("{} bound to {:?}", filename.display(), self.device);
        Ok(())
    }

    /// # 功能
    ///
    /// 解除当前设备的绑定（`LOOP_CLR_FD`）。
    ///
    /// ## 返回值
    /// - `Ok(())`: 解绑成功，状态缓存已失效。
    /// - `Err(SystemError)`: 打开设备或 ioctl 失败的原因，例如未绑定时为 `ENXIO`。
    pub fn delete_device(&mut self) -> Result<(), SystemError> {
        let control = self.control.clone();
        let dev = self.get_fd()?;
        control.clr_fd(dev)?;
        self.invalidate_status();
        debug!("{:?} unbound", self.device);
        Ok(())
    }

    /// 找到第一个空闲设备并设为当前设备
    pub fn find_unused(&mut self) -> Result<Option<PathBuf>, SystemError> {
        self.init_iterator(IterFlags::FREE);
        let result = self.next_device();
        self.deinit_iterator();
        result
    }

    /// # 功能
    ///
    /// 在已用设备中查找绑定了 `filename` 的设备，找到后设为当前设备。
    ///
    /// ## 参数
    ///
    /// - `filename`: 与设备的 backing_file 属性逐字节比较，不做规范化。
    /// - `offset`: 为 `Some` 时设备的 offset 也必须相同。
    pub fn find_by_backing_file(
        &mut self,
        filename: impl AsRef<Path>,
        offset: Option<u64>,
    ) -> Result<Option<PathBuf>, SystemError> {
        self.init_iterator(IterFlags::USED);
        let result = self.scan_for_backing_file(filename.as_ref(), offset);
        self.deinit_iterator();
        result
    }

    fn scan_for_backing_file(
        &mut self,
        filename: &Path,
        offset: Option<u64>,
    ) -> Result<Option<PathBuf>, SystemError> {
        while let Some(device) = self.next_device()? {
            match self.backing_file() {
                Ok(Some(backing)) if backing.as_os_str() == filename.as_os_str() => {}
                _ => continue,
            }
            if let Some(want) = offset {
                if !matches!(self.offset(), Ok(Some(off)) if off == want) {
                    continue;
                }
            }
            return Ok(Some(device));
        }
        Ok(None)
    }
}
