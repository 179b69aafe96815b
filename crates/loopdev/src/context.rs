use std::{
    cell::OnceCell,
    fs::{self, File, OpenOptions},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use bitflags::bitflags;
use log::{debug, trace};
use system_error::SystemError;

use crate::{
    constants::{LoCryptType, LoFlags, LoopInfo64, LOOPDEV_PATH_SIZE, LO_KEY_SIZE},
    ioctl::{KernelLoopControl, LoopControl},
    iter::LoopIter,
    platform::{parse_number, Platform},
    sysfs::{AttributeStore, SysfsStore},
};

bitflags! {
    /// 设备上下文的行为标志
    #[derive(Default)]
    pub struct LoopdevFlags: u32 {
        /// 以只读方式打开设备（默认）
        const RDONLY = 1 << 0;
        /// 以读写方式打开设备
        const RDWR = 1 << 1;
        /// 不读取 sysfs
        const NOSYSFS = 1 << 2;
        /// 读取属性时不使用 ioctl
        const NOIOCTL = 1 << 3;
    }
}

/// 可以从设备读取的属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAttr {
    Offset,
    SizeLimit,
    BackingFile,
    Autoclear,
}

impl LoopAttr {
    /// `/sys/block/loop<N>/loop/` 下对应的文件名
    pub fn sysfs_name(self) -> &'static str {
        match self {
            LoopAttr::Offset => "offset",
            LoopAttr::SizeLimit => "sizelimit",
            LoopAttr::BackingFile => "backing_file",
            LoopAttr::Autoclear => "autoclear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Number(u64),
    Flag(bool),
    /// 原始字节，不一定是合法的 UTF-8
    Path(PathBuf),
}

/// 单个属性来源的查询结果
#[derive(Debug)]
enum Lookup {
    Resolved(AttrValue),
    /// 来源被禁用、无法定位设备或没有该属性，尝试下一个来源
    Unavailable,
}

type Attempt = fn(&mut LoopContext, LoopAttr) -> Result<Lookup, SystemError>;

/// 属性来源，按优先级排列
const ATTR_SOURCES: [(&str, Attempt); 2] = [
    ("sysfs", LoopContext::attr_from_sysfs),
    ("ioctl", LoopContext::attr_from_ioctl),
];

/// Loop 设备上下文
///
/// 一个上下文对应一个设备，缓存该设备的描述符和状态以减少系统调用。
/// 上下文独占其描述符和缓存，不能在线程间共享（所有会修改它们的操作都需要 `&mut self`）。
pub struct LoopContext {
    /// 设备节点路径，为空表示未配置
    pub(crate) device: Option<PathBuf>,
    /// 设备对应的 loop 编号，首次读取 sysfs 时确定
    pub(crate) number: OnceCell<Option<u32>>,
    pub(crate) fd: Option<File>,
    /// 当前缓存的描述符是否以读写方式打开
    pub(crate) fd_rdwr: bool,
    /// 待写入设备的状态（由 `set_*` 修改，绑定时下发）
    pub(crate) info: LoopInfo64,
    /// 从设备读取的状态缓存
    pub(crate) status: Option<LoopInfo64>,
    pub(crate) flags: LoopdevFlags,
    /// 规范化后的后端文件路径
    pub(crate) filename: Option<PathBuf>,
    pub(crate) iter: Option<LoopIter>,
    pub(crate) platform: Arc<Platform>,
    pub(crate) control: Arc<dyn LoopControl>,
    pub(crate) store: Arc<dyn AttributeStore>,
}

impl core::fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopContext")
            .field("device", &self.device)
            .field("fd_open", &self.fd.is_some())
            .field("has_status", &self.status.is_some())
            .field("flags", &self.flags)
            .field("filename", &self.filename)
            .finish()
    }
}

impl LoopContext {
    /// 使用宿主机的平台信息、内核 ioctl 和 sysfs 创建上下文
    pub fn new(flags: LoopdevFlags) -> Self {
        let platform = Platform::host();
        let store = Arc::new(SysfsStore::new(platform.sysfs_dir.clone()));
        Self::with_backends(flags, platform, Arc::new(KernelLoopControl), store)
    }

    /// # 功能
    ///
    /// 使用指定的平台信息和后端创建一个未配置的上下文。
    ///
    /// 如果没有设置 `NOSYSFS` 且内核足够新（>= 2.6.37），
    /// 读取属性时只使用 sysfs，自动加上 `NOIOCTL`。
    pub fn with_backends(
        flags: LoopdevFlags,
        platform: Arc<Platform>,
        control: Arc<dyn LoopControl>,
        store: Arc<dyn AttributeStore>,
    ) -> Self {
        let mut flags = flags;
        if !flags.contains(LoopdevFlags::NOSYSFS) && platform.has_loop_sysfs() {
            flags |= LoopdevFlags::NOIOCTL;
        }

        Self {
            device: None,
            number: OnceCell::new(),
            fd: None,
            fd_rdwr: false,
            info: LoopInfo64::default(),
            status: None,
            flags,
            filename: None,
            iter: None,
            platform,
            control,
            store,
        }
    }

    pub fn flags(&self) -> LoopdevFlags {
        self.flags
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// # 功能
    ///
    /// 设置当前设备。
    ///
    /// 关闭已打开的描述符并丢弃状态缓存。绝对路径原样保存（超过缓冲区容量时截断），
    /// 设备名 `loop<N>` 被转换为 `/dev/loop<N>` 或 `/dev/loop/<N>`。
    ///
    /// ## 参数
    ///
    /// - `device`: 设备名、绝对路径，`None` 或空串表示重置为未配置状态。
    ///
    /// ## 返回值
    /// - `Ok(())`: 设置成功。
    /// - `Err(SystemError::EINVAL)`: 设备名无法转换为路径，此时上下文处于未配置状态。
    pub fn set_device(&mut self, device: Option<&str>) -> Result<(), SystemError> {
        self.fd = None;
        self.fd_rdwr = false;
        self.status = None;
        self.device = None;
        self.number = OnceCell::new();

        let Some(device) = device.filter(|d| !d.is_empty()) else {
            return Ok(());
        };

        let path = if device.starts_with('/') {
            PathBuf::from(device)
        } else {
            self.platform.resolve_name(device)?
        };
        self.device = Some(truncate_device_path(path));
        Ok(())
    }

    /// 当前设备路径
    pub fn device(&self) -> Option<&Path> {
        self.device.as_deref()
    }

    /// 当前设备的 loop 编号（见 [`Platform::device_number`]），无法确定时为 `None`
    pub fn loop_number(&self) -> Option<u32> {
        let device = self.device.as_deref()?;
        *self
            .number
            .get_or_init(|| self.platform.device_number(device))
    }

    /// # 功能
    ///
    /// 获取设备描述符，未打开时按 `RDWR`/`RDONLY` 标志打开并缓存。
    ///
    /// ## 返回值
    /// - `Ok(&File)`: 已打开的设备。
    /// - `Err(SystemError::EINVAL)`: 未设置设备。
    /// - `Err(SystemError)`: open 失败的原因。
    pub fn get_fd(&mut self) -> Result<&File, SystemError> {
        let device = self.device.as_ref().ok_or(SystemError::EINVAL)?;
        if self.fd.is_none() {
            let rdwr = self.flags.contains(LoopdevFlags::RDWR);
            let file = OpenOptions::new().read(true).write(rdwr).open(device)?;
            trace!("opened {} (rdwr={})", device.display(), rdwr);
            self.fd = Some(file);
            self.fd_rdwr = rdwr;
        }
        self.fd.as_ref().ok_or(SystemError::EBADF)
    }

    /// # 功能
    ///
    /// 获取设备状态（`LOOP_GET_STATUS64`），结果会被缓存。
    ///
    /// 在设备或绑定关系改变之前，重复调用只会发出一次 ioctl。
    /// 请求失败时缓存保持为空，错误原样返回；未绑定的设备返回 `ENXIO`。
    pub fn get_info(&mut self) -> Result<&LoopInfo64, SystemError> {
        if self.status.is_none() {
            let control = self.control.clone();
            let fd = self.get_fd()?;
            let info = control.get_status64(fd)?;
            self.status = Some(info);
        } else {
            trace!("status cache hit for {:?}", self.device);
        }
        self.status.as_ref().ok_or(SystemError::ENXIO)
    }

    /// # 功能
    ///
    /// 读取设备属性：依次尝试 sysfs 和 ioctl，第一个给出结果的来源胜出。
    ///
    /// ## 返回值
    /// - `Ok(Some(AttrValue))`: 读取成功。
    /// - `Ok(None)`: 所有来源都不可用（例如设备未绑定或来源被禁用）。
    /// - `Err(SystemError)`: 某个来源发生了硬错误。
    pub fn get_attribute(&mut self, attr: LoopAttr) -> Result<Option<AttrValue>, SystemError> {
        for (name, attempt) in ATTR_SOURCES {
            match attempt(self, attr)? {
                Lookup::Resolved(value) => {
                    trace!("{:?} of {:?} resolved by {}", attr, self.device, name);
                    return Ok(Some(value));
                }
                Lookup::Unavailable => continue,
            }
        }
        Ok(None)
    }

    fn attr_from_sysfs(&mut self, attr: LoopAttr) -> Result<Lookup, SystemError> {
        if self.flags.contains(LoopdevFlags::NOSYSFS) {
            return Ok(Lookup::Unavailable);
        }
        let Some(number) = self.loop_number() else {
            return Ok(Lookup::Unavailable);
        };

        let name = attr.sysfs_name();
        let value = match attr {
            LoopAttr::Offset | LoopAttr::SizeLimit => {
                self.store.read_u64(number, name)?.map(AttrValue::Number)
            }
            LoopAttr::Autoclear => self
                .store
                .read_int(number, name)?
                .map(|v| AttrValue::Flag(v != 0)),
            LoopAttr::BackingFile => self.store.read_path(number, name).map(AttrValue::Path),
        };
        Ok(value.map_or(Lookup::Unavailable, Lookup::Resolved))
    }

    fn attr_from_ioctl(&mut self, attr: LoopAttr) -> Result<Lookup, SystemError> {
        if self.flags.contains(LoopdevFlags::NOIOCTL) {
            return Ok(Lookup::Unavailable);
        }
        let info = match self.get_info() {
            Ok(info) => info,
            // 设备未绑定
            Err(SystemError::ENXIO) => return Ok(Lookup::Unavailable),
            Err(e) => return Err(e),
        };

        let value = match attr {
            LoopAttr::Offset => AttrValue::Number(info.lo_offset),
            LoopAttr::SizeLimit => AttrValue::Number(info.lo_sizelimit),
            LoopAttr::Autoclear => AttrValue::Flag(info.flags().contains(LoFlags::AUTOCLEAR)),
            // 内核只保存 63 字节，超长路径带 `*` 标记返回
            LoopAttr::BackingFile => AttrValue::Path(info.file_name_marked()),
        };
        Ok(Lookup::Resolved(value))
    }

    /// 设备在后端文件中的偏移量
    pub fn offset(&mut self) -> Result<Option<u64>, SystemError> {
        match self.get_attribute(LoopAttr::Offset)? {
            Some(AttrValue::Number(n)) => Ok(Some(n)),
            _ => Ok(None),
        }
    }

    pub fn size_limit(&mut self) -> Result<Option<u64>, SystemError> {
        match self.get_attribute(LoopAttr::SizeLimit)? {
            Some(AttrValue::Number(n)) => Ok(Some(n)),
            _ => Ok(None),
        }
    }

    /// 当前绑定的后端文件，字节与内核记录的一致。只能通过 ioctl 读取时，超长路径以 `*` 结尾。
    pub fn backing_file(&mut self) -> Result<Option<PathBuf>, SystemError> {
        match self.get_attribute(LoopAttr::BackingFile)? {
            Some(AttrValue::Path(p)) => Ok(Some(p)),
            _ => Ok(None),
        }
    }

    /// 是否设置了 autoclear，无法读取时视为未设置
    pub fn is_autoclear(&mut self) -> Result<bool, SystemError> {
        match self.get_attribute(LoopAttr::Autoclear)? {
            Some(AttrValue::Flag(f)) => Ok(f),
            _ => Ok(false),
        }
    }

    /// 待绑定状态中的偏移量，不访问内核
    pub fn set_offset(&mut self, offset: u64) {
        self.info.lo_offset = offset;
    }

    pub fn set_size_limit(&mut self, size_limit: u64) {
        self.info.lo_sizelimit = size_limit;
    }

    pub fn set_flags(&mut self, flags: LoFlags) {
        self.info.lo_flags = flags.bits();
    }

    /// # 功能
    ///
    /// 设置待绑定的后端文件。路径会被规范化（解析符号链接和相对路径），
    /// 绑定时使用的以及 `lo_file_name` 中记录的都是规范化后的路径。
    ///
    /// ## 返回值
    /// - `Ok(())`: 设置成功。
    /// - `Err(SystemError)`: 规范化失败，例如文件不存在（`ENOENT`）。
    pub fn set_backing_file(&mut self, path: impl AsRef<Path>) -> Result<(), SystemError> {
        let canonical = fs::canonicalize(path.as_ref())?;
        self.info.set_file_name(canonical.as_os_str().as_bytes());
        debug!("backing file set to {}", canonical.display());
        self.filename = Some(canonical);
        Ok(())
    }

    /// 规范化后的后端文件路径（绑定成功后清空）
    pub fn backing_file_path(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// 待写入设备的状态
    pub fn pending_info(&self) -> &LoopInfo64 {
        &self.info
    }

    /// # 功能
    ///
    /// 设置 legacy 加密参数。
    ///
    /// `scheme` 为纯数字时作为加密类型编号，`none` 表示不加密，其它名字按
    /// `LO_CRYPT_CRYPTOAPI` 处理并记录到 `lo_crypt_name`。key 槽位先清零，
    /// `password` 至多复制 `LO_KEY_SIZE - 1` 字节；不加密时 key 长度为 0。
    #[deprecated(note = "loop 加密已不再维护，请改用 dm-crypt/cryptsetup")]
    pub fn set_encryption(&mut self, scheme: Option<&str>, password: &[u8]) {
        if let Some(scheme) = scheme.filter(|s| !s.is_empty()) {
            if let Some(n) = parse_number(scheme) {
                self.info.lo_encrypt_type = n;
            } else if scheme.eq_ignore_ascii_case("none") {
                self.info.lo_encrypt_type = LoCryptType::NONE;
            } else {
                self.info.lo_encrypt_type = LoCryptType::CRYPTOAPI;
                self.info.set_crypt_name(scheme.as_bytes());
            }
        }

        self.info.wipe_key();
        if self.info.lo_encrypt_type != LoCryptType::NONE {
            let n = password.len().min(LO_KEY_SIZE - 1);
            self.info.lo_encrypt_key[..n].copy_from_slice(&password[..n]);
            self.info.lo_encrypt_key_size = LO_KEY_SIZE as u32;
        }
    }

    /// 丢弃状态缓存
    pub(crate) fn invalidate_status(&mut self) {
        self.status = None;
    }
}

impl Drop for LoopContext {
    fn drop(&mut self) {
        self.info.clear();
    }
}

/// 按设备路径缓冲区容量截断（保留 `LOOPDEV_PATH_SIZE - 1` 字节）
fn truncate_device_path(path: PathBuf) -> PathBuf {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() < LOOPDEV_PATH_SIZE {
        return path;
    }
    let cut = &bytes[..LOOPDEV_PATH_SIZE - 1];
    PathBuf::from(std::ffi::OsStr::from_bytes(cut))
}
