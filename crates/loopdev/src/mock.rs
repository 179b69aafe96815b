//! 测试用的假 loop 设备
//!
//! 设备节点是临时目录里的普通文件（或指向普通文件的符号链接），
//! [`MockControl`] 按打开文件的 inode 识别设备，并把绑定状态同步到假的 sysfs 目录。

use std::{
    collections::HashMap,
    fs::{self, File},
    os::unix::{
        ffi::OsStrExt,
        fs::{symlink, MetadataExt},
        io::AsRawFd,
    },
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use system_error::SystemError;
use tempfile::TempDir;

use crate::{
    constants::{LoFlags, LoopInfo64},
    context::{LoopContext, LoopdevFlags},
    ioctl::LoopControl,
    platform::{Platform, PlatformBuilder},
    sysfs::SysfsStore,
};

#[derive(Debug, Default)]
struct MockLoop {
    number: u32,
    /// `None` 表示未绑定
    info: Option<LoopInfo64>,
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<u64, MockLoop>,
    get_status_calls: usize,
    set_status_calls: usize,
    set_fd_calls: usize,
    clr_fd_calls: usize,
    fail_set_status: Option<SystemError>,
    fail_set_fd: Option<SystemError>,
}

#[derive(Debug)]
pub(crate) struct MockControl {
    sys_dir: PathBuf,
    state: Mutex<MockState>,
}

impl MockControl {
    pub fn new(sys_dir: impl Into<PathBuf>) -> Self {
        Self {
            sys_dir: sys_dir.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn register(&self, ino: u64, number: u32) {
        let mut state = self.state.lock().unwrap();
        state.devices.insert(
            ino,
            MockLoop {
                number,
                info: None,
            },
        );
    }

    /// 直接修改设备状态，不经过 ioctl，也不同步 sysfs
    pub fn force_bind(&self, ino: u64, f: impl FnOnce(&mut LoopInfo64)) {
        let mut state = self.state.lock().unwrap();
        let dev = state.devices.get_mut(&ino).expect("device not registered");
        let mut info = LoopInfo64 {
            lo_number: dev.number,
            ..LoopInfo64::default()
        };
        f(&mut info);
        dev.info = Some(info);
    }

    pub fn is_bound(&self, ino: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.devices.get(&ino).map_or(false, |d| d.info.is_some())
    }

    pub fn status_of(&self, ino: u64) -> Option<LoopInfo64> {
        let state = self.state.lock().unwrap();
        state.devices.get(&ino).and_then(|d| d.info)
    }

    pub fn fail_next_set_status(&self, err: SystemError) {
        self.state.lock().unwrap().fail_set_status = Some(err);
    }

    pub fn fail_next_set_fd(&self, err: SystemError) {
        self.state.lock().unwrap().fail_set_fd = Some(err);
    }

    pub fn get_status_calls(&self) -> usize {
        self.state.lock().unwrap().get_status_calls
    }

    pub fn set_fd_calls(&self) -> usize {
        self.state.lock().unwrap().set_fd_calls
    }

    pub fn clr_fd_calls(&self) -> usize {
        self.state.lock().unwrap().clr_fd_calls
    }

    pub fn total_calls(&self) -> usize {
        let s = self.state.lock().unwrap();
        s.get_status_calls + s.set_status_calls + s.set_fd_calls + s.clr_fd_calls
    }

    fn attr_dir(&self, number: u32) -> PathBuf {
        self.sys_dir.join(format!("block/loop{number}/loop"))
    }

    fn write_attr(&self, number: u32, attr: &str, value: impl AsRef<[u8]>) {
        let dir = self.attr_dir(number);
        fs::create_dir_all(&dir).unwrap();
        let mut content = value.as_ref().to_vec();
        content.push(b'\n');
        fs::write(dir.join(attr), content).unwrap();
    }

    fn mirror_status(&self, number: u32, info: &LoopInfo64) {
        self.write_attr(number, "offset", info.lo_offset.to_string());
        self.write_attr(number, "sizelimit", info.lo_sizelimit.to_string());
        let autoclear = info.flags().contains(LoFlags::AUTOCLEAR) as u8;
        self.write_attr(number, "autoclear", autoclear.to_string());
    }
}

fn ino_of(file: &File) -> u64 {
    file.metadata().unwrap().ino()
}

impl LoopControl for MockControl {
    fn get_status64(&self, dev: &File) -> Result<LoopInfo64, SystemError> {
        let mut state = self.state.lock().unwrap();
        state.get_status_calls += 1;
        let dev = state
            .devices
            .get(&ino_of(dev))
            .ok_or(SystemError::ENOTTY)?;
        dev.info.ok_or(SystemError::ENXIO)
    }

    fn set_status64(&self, dev: &File, info: &LoopInfo64) -> Result<(), SystemError> {
        let mut state = self.state.lock().unwrap();
        state.set_status_calls += 1;
        if let Some(err) = state.fail_set_status.take() {
            return Err(err);
        }
        let dev = state
            .devices
            .get_mut(&ino_of(dev))
            .ok_or(SystemError::ENOTTY)?;
        let cur = dev.info.as_mut().ok_or(SystemError::ENXIO)?;

        cur.lo_offset = info.lo_offset;
        cur.lo_sizelimit = info.lo_sizelimit;
        cur.lo_flags = info.lo_flags;
        cur.lo_file_name = info.lo_file_name;
        cur.lo_crypt_name = info.lo_crypt_name;
        cur.lo_encrypt_type = info.lo_encrypt_type;
        cur.lo_encrypt_key_size = info.lo_encrypt_key_size;
        let (number, snapshot) = (dev.number, *cur);
        drop(state);

        self.mirror_status(number, &snapshot);
        Ok(())
    }

    fn set_fd(&self, dev: &File, backing: &File) -> Result<(), SystemError> {
        let mut state = self.state.lock().unwrap();
        state.set_fd_calls += 1;
        if let Some(err) = state.fail_set_fd.take() {
            return Err(err);
        }
        let meta = backing.metadata().unwrap();
        let dev = state
            .devices
            .get_mut(&ino_of(dev))
            .ok_or(SystemError::ENOTTY)?;
        if dev.info.is_some() {
            return Err(SystemError::EBUSY);
        }
        dev.info = Some(LoopInfo64 {
            lo_number: dev.number,
            lo_device: meta.dev(),
            lo_inode: meta.ino(),
            ..LoopInfo64::default()
        });
        let number = dev.number;
        drop(state);

        let path = fs::read_link(format!("/proc/self/fd/{}", backing.as_raw_fd())).unwrap();
        self.write_attr(number, "backing_file", path.as_os_str().as_bytes());
        self.mirror_status(number, &LoopInfo64::default());
        Ok(())
    }

    fn clr_fd(&self, dev: &File) -> Result<(), SystemError> {
        let mut state = self.state.lock().unwrap();
        state.clr_fd_calls += 1;
        let dev = state
            .devices
            .get_mut(&ino_of(dev))
            .ok_or(SystemError::ENOTTY)?;
        if dev.info.take().is_none() {
            return Err(SystemError::ENXIO);
        }
        let number = dev.number;
        drop(state);

        let _ = fs::remove_dir_all(self.attr_dir(number));
        Ok(())
    }
}

/// 临时的 `/dev`、`/sys`、`/proc/partitions` 目录树以及配套的 [`Platform`]
pub(crate) struct Fixture {
    tmp: TempDir,
    platform: Arc<Platform>,
    pub control: Arc<MockControl>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(false, 0)
    }

    pub fn with_subdir() -> Self {
        Self::build(true, 0)
    }

    pub fn with_kernel(kernel_version: u32) -> Self {
        Self::build(false, kernel_version)
    }

    fn build(dev_subdir: bool, kernel_version: u32) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let dev_dir = root.join("dev");
        let sys_dir = root.join("sys");
        fs::create_dir_all(&dev_dir).unwrap();
        fs::create_dir_all(&sys_dir).unwrap();
        fs::create_dir_all(root.join("proc")).unwrap();
        fs::create_dir_all(root.join("nodes")).unwrap();
        if dev_subdir {
            fs::create_dir_all(dev_dir.join("loop")).unwrap();
        }

        let platform = PlatformBuilder::default()
            .dev_dir(dev_dir)
            .dev_subdir(dev_subdir)
            .sysfs_dir(sys_dir.clone())
            .partitions(root.join("proc/partitions"))
            .kernel_version(kernel_version)
            .build()
            .unwrap();

        Self {
            tmp,
            platform: Arc::new(platform),
            control: Arc::new(MockControl::new(sys_dir)),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.tmp.path().canonicalize().unwrap()
    }

    pub fn dev_dir(&self) -> &Path {
        &self.platform.dev_dir
    }

    pub fn device_path(&self, number: u32) -> PathBuf {
        if self.platform.dev_subdir {
            self.platform.loop_dir().join(number.to_string())
        } else {
            self.platform.dev_dir.join(format!("loop{number}"))
        }
    }

    /// 创建设备节点（普通文件）并登记
    pub fn add_device(&self, number: u32) -> PathBuf {
        let path = self.device_path(number);
        File::create(&path).unwrap();
        self.control.register(self.ino(number), number);
        path
    }

    /// 创建指向普通文件的符号链接作为设备节点，目录扫描只接受这种类型
    pub fn add_linked_device(&self, number: u32) -> PathBuf {
        let target = self.root().join(format!("nodes/loop{number}"));
        File::create(&target).unwrap();
        let path = self.device_path(number);
        symlink(&target, &path).unwrap();
        self.control.register(self.ino(number), number);
        path
    }

    pub fn ino(&self, number: u32) -> u64 {
        fs::metadata(self.device_path(number)).unwrap().ino()
    }

    pub fn bind(&self, number: u32, file_name: &str, offset: u64) {
        self.bind_with(number, |info| {
            info.set_file_name(file_name.as_bytes());
            info.lo_offset = offset;
        });
    }

    pub fn bind_with(&self, number: u32, f: impl FnOnce(&mut LoopInfo64)) {
        self.control.force_bind(self.ino(number), f);
    }

    pub fn is_bound(&self, number: u32) -> bool {
        self.control.is_bound(self.ino(number))
    }

    pub fn status_of(&self, number: u32) -> Option<LoopInfo64> {
        self.control.status_of(self.ino(number))
    }

    pub fn write_sysfs(&self, number: u32, attr: &str, value: impl AsRef<[u8]>) {
        let dir = self.platform.sysfs_dir.join(format!("block/loop{number}/loop"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(attr), value).unwrap();
    }

    pub fn sysfs_attr(&self, number: u32, attr: &str) -> Option<String> {
        let path = self
            .platform
            .sysfs_dir
            .join(format!("block/loop{number}/loop/{attr}"));
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim_end().to_string())
    }

    pub fn set_partitions(&self, content: &str) {
        fs::write(&self.platform.partitions, content).unwrap();
    }

    /// 在临时目录下创建指定大小的后端文件
    pub fn backing_file(&self, name: &str, size: u64) -> PathBuf {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let f = File::create(&path).unwrap();
        f.set_len(size).unwrap();
        path
    }

    pub fn context(&self, flags: LoopdevFlags) -> LoopContext {
        LoopContext::with_backends(
            flags,
            self.platform.clone(),
            self.control.clone(),
            Arc::new(SysfsStore::new(self.platform.sysfs_dir.clone())),
        )
    }
}
