use std::{
    ffi::CStr,
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use derive_builder::Builder;
use lazy_static::lazy_static;
use log::debug;
use system_error::SystemError;

use crate::constants::{LOOP_BASENAME, LOOP_MAJOR};

/// 与内核 `KERNEL_VERSION(a, b, c)` 宏相同的编码
pub const fn kernel_version(a: u32, b: u32, c: u32) -> u32 {
    (a << 16) + (b << 8) + if c > 255 { 255 } else { c }
}

/// 从该版本起，sysfs 的 `/sys/block/loop<N>/loop/` 提供了全部基础属性
pub const KERNEL_VERSION_LOOP_SYSFS: u32 = kernel_version(2, 6, 37);

/// 宿主机的 loop 相关能力
///
/// 进程内只探测一次（见 [`Platform::host`]），之后显式传给每个设备上下文；
/// 测试可以用 [`PlatformBuilder`] 构造任意目录布局。
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(setter(into))]
pub struct Platform {
    /// 设备目录，通常为 `/dev`
    #[builder(default = "PathBuf::from(\"/dev\")")]
    pub dev_dir: PathBuf,

    /// loop 设备节点是否放在 `<dev_dir>/loop/<N>` 子目录下
    #[builder(default)]
    pub dev_subdir: bool,

    #[builder(default = "PathBuf::from(\"/sys\")")]
    pub sysfs_dir: PathBuf,

    /// 块设备清单文件
    #[builder(default = "PathBuf::from(\"/proc/partitions\")")]
    pub partitions: PathBuf,

    /// 按 [`kernel_version`] 编码的内核版本，0 表示未知
    #[builder(default)]
    pub kernel_version: u32,
}

lazy_static! {
    static ref HOST_PLATFORM: Arc<Platform> = Arc::new(Platform::detect());
}

impl Platform {
    /// 进程内共享的宿主机探测结果
    pub fn host() -> Arc<Platform> {
        HOST_PLATFORM.clone()
    }

    /// # 功能
    ///
    /// 探测宿主机：检查 `/dev/loop/` 子目录是否存在，并读取内核版本。
    ///
    /// 一般不直接调用，使用 [`Platform::host`] 获取缓存的结果。
    pub fn detect() -> Self {
        let dev_dir = PathBuf::from("/dev");
        let dev_subdir = fs::metadata(dev_dir.join(LOOP_BASENAME))
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let kernel_version = host_kernel_release()
            .and_then(|r| parse_kernel_release(&r))
            .unwrap_or(0);

        let platform = Self {
            dev_dir,
            dev_subdir,
            sysfs_dir: PathBuf::from("/sys"),
            partitions: PathBuf::from("/proc/partitions"),
            kernel_version,
        };
        debug!("detected loop platform: {:?}", platform);
        platform
    }

    /// `<dev_dir>/loop`
    pub fn loop_dir(&self) -> PathBuf {
        self.dev_dir.join(LOOP_BASENAME)
    }

    /// 内核是否足够新，可以只依赖 sysfs 读取设备属性
    pub fn has_loop_sysfs(&self) -> bool {
        self.kernel_version >= KERNEL_VERSION_LOOP_SYSFS
    }

    /// # 功能
    ///
    /// 把设备名（`loop<N>`）转换为设备节点路径。
    ///
    /// ## 返回值
    /// - `Ok(PathBuf)`: `<dev>/loop<N>`，子目录布局下为 `<dev>/loop/<N>`。
    /// - `Err(SystemError::EINVAL)`: 子目录布局下名字短于 `loop` 前缀加一位编号。
    pub fn resolve_name(&self, name: &str) -> Result<PathBuf, SystemError> {
        if !self.dev_subdir {
            return Ok(self.dev_dir.join(name));
        }
        match name.strip_prefix(LOOP_BASENAME) {
            Some(number) if !number.is_empty() => Ok(self.loop_dir().join(number)),
            _ => Err(SystemError::EINVAL),
        }
    }

    /// # 功能
    ///
    /// 确定设备节点对应的 loop 编号。
    ///
    /// 节点是主设备号为 `LOOP_MAJOR` 的块设备时以设备号为准（见 [`Platform::number_from_devno`]），
    /// 其它情况下先按路径名解析，再按符号链接最终指向的路径名解析。
    pub fn device_number(&self, device: &Path) -> Option<u32> {
        if let Ok(meta) = fs::metadata(device) {
            if meta.file_type().is_block_device() {
                if let Some(n) = self.number_from_devno(meta.rdev()) {
                    return Some(n);
                }
            }
        }
        self.loop_number(device).or_else(|| {
            let target = fs::canonicalize(device).ok()?;
            self.loop_number(&target)
        })
    }

    /// # 功能
    ///
    /// 把 loop 块设备号转换为 loop 编号。
    ///
    /// 优先读取 `<sysfs>/dev/block/<major>:<minor>` 链接指向的设备名
    /// （启用分区时次设备号不等于编号），链接不存在时使用次设备号。
    ///
    /// ## 返回值
    /// - `Some(u32)`: loop 编号。
    /// - `None`: 主设备号不是 `LOOP_MAJOR`，或链接指向的不是 `loop<N>`。
    pub fn number_from_devno(&self, rdev: u64) -> Option<u32> {
        let (major, minor) = (libc::major(rdev), libc::minor(rdev));
        if major != LOOP_MAJOR {
            return None;
        }
        let link = self.sysfs_dir.join(format!("dev/block/{major}:{minor}"));
        match fs::read_link(&link) {
            Ok(target) => {
                let name = target.file_name()?.to_str()?;
                parse_number(name.strip_prefix(LOOP_BASENAME)?)
            }
            Err(_) => Some(minor),
        }
    }

    /// 从设备节点路径解析出 loop 编号（`/dev/loop3`、`/dev/loop/3` 都得到 3）。
    pub fn loop_number(&self, device: &Path) -> Option<u32> {
        let name = device.file_name()?.to_str()?;
        if let Some(n) = name.strip_prefix(LOOP_BASENAME) {
            return parse_number(n);
        }
        let parent = device.parent()?;
        if parent.file_name()?.to_str()? == LOOP_BASENAME {
            return parse_number(name);
        }
        None
    }
}

/// 仅由十进制数字组成的编号
pub(crate) fn parse_number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn host_kernel_release() -> Option<String> {
    let mut uts: libc::utsname = unsafe { core::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Some(release.to_string_lossy().into_owned())
}

/// 解析 `uname -r` 形式的版本串，例如 `6.1.0-13-amd64`。
pub fn parse_kernel_release(release: &str) -> Option<u32> {
    let mut parts = [0u32; 3];
    let mut found = 0;
    for (i, field) in release.split('.').take(3).enumerate() {
        let digits: String = field.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            break;
        }
        parts[i] = digits.parse().ok()?;
        found += 1;
        if digits.len() != field.len() {
            break;
        }
    }
    if found < 2 {
        return None;
    }
    Some(kernel_version(parts[0], parts[1], parts[2]))
}
