//! 结构化属性存储（sysfs）
//!
//! 新内核在 `/sys/block/loop<N>/loop/` 下导出已绑定设备的属性：
//! `backing_file`、`offset`、`sizelimit`、`autoclear` 等。
//! 设备未绑定时这些文件不存在，读取失败视为"未命中"，由调用者回退到 ioctl。

use std::{ffi::OsString, fs, os::unix::ffi::OsStringExt, path::PathBuf, str::FromStr};

use log::trace;
use system_error::SystemError;

/// 按 loop 编号读取单个属性的后端
pub trait AttributeStore: Send + Sync {
    /// # 功能
    ///
    /// 读取 `loop<number>` 的属性 `attr` 的原始内容。
    ///
    /// ## 返回值
    /// - `Some(Vec<u8>)`: 命中，内容已去掉结尾换行，不做编码转换。
    /// - `None`: 属性不存在或无法读取。
    fn read_attr(&self, number: u32, attr: &str) -> Option<Vec<u8>>;

    /// 读取无符号整数属性。内容无法解析时返回 `EINVAL`。
    fn read_u64(&self, number: u32, attr: &str) -> Result<Option<u64>, SystemError> {
        match self.read_attr(number, attr) {
            Some(raw) => parse_scalar(&raw).map(Some),
            None => Ok(None),
        }
    }

    fn read_int(&self, number: u32, attr: &str) -> Result<Option<i64>, SystemError> {
        match self.read_attr(number, attr) {
            Some(raw) => parse_scalar(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// 读取路径属性，字节原样保留（路径不一定是合法的 UTF-8）。
    fn read_path(&self, number: u32, attr: &str) -> Option<PathBuf> {
        self.read_attr(number, attr)
            .map(|raw| PathBuf::from(OsString::from_vec(raw)))
    }
}

fn parse_scalar<T: FromStr>(raw: &[u8]) -> Result<T, SystemError> {
    core::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(SystemError::EINVAL)
}

/// 基于 sysfs 目录树的实现
#[derive(Debug, Clone)]
pub struct SysfsStore {
    root: PathBuf,
}

impl SysfsStore {
    /// `root` 为 sysfs 挂载点，通常为 `/sys`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn attr_path(&self, number: u32, attr: &str) -> PathBuf {
        self.root
            .join("block")
            .join(format!("{}{}", crate::constants::LOOP_BASENAME, number))
            .join("loop")
            .join(attr)
    }
}

impl AttributeStore for SysfsStore {
    fn read_attr(&self, number: u32, attr: &str) -> Option<Vec<u8>> {
        let path = self.attr_path(number, attr);
        match fs::read(&path) {
            Ok(mut raw) => {
                while raw.last() == Some(&b'\n') {
                    raw.pop();
                }
                Some(raw)
            }
            Err(e) => {
                trace!("sysfs miss {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::ffi::OsStrExt;

    use super::*;

    fn write_attr(root: &std::path::Path, n: u32, attr: &str, val: impl AsRef<[u8]>) {
        let dir = root.join(format!("block/loop{n}/loop"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(attr), val).unwrap();
    }

    #[test]
    fn reads_scalar_and_string_attributes() {
        let tmp = tempfile::tempdir().unwrap();
        write_attr(tmp.path(), 2, "offset", "4096\n");
        write_attr(tmp.path(), 2, "backing_file", "/data/img.bin\n");
        write_attr(tmp.path(), 2, "autoclear", "1\n");

        let store = SysfsStore::new(tmp.path());
        assert_eq!(store.read_u64(2, "offset"), Ok(Some(4096)));
        assert_eq!(store.read_int(2, "autoclear"), Ok(Some(1)));
        assert_eq!(
            store.read_path(2, "backing_file"),
            Some(PathBuf::from("/data/img.bin"))
        );
    }

    #[test]
    fn path_attribute_keeps_raw_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        write_attr(tmp.path(), 3, "backing_file", b"/data/\xffimg.bin\n");
        let store = SysfsStore::new(tmp.path());

        let path = store.read_path(3, "backing_file").unwrap();
        assert_eq!(path.as_os_str().as_bytes(), b"/data/\xffimg.bin");
    }

    #[test]
    fn missing_attribute_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SysfsStore::new(tmp.path());
        assert_eq!(store.read_u64(0, "offset"), Ok(None));
        assert_eq!(store.read_path(0, "backing_file"), None);
    }

    #[test]
    fn garbage_scalar_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        write_attr(tmp.path(), 1, "sizelimit", "lots\n");
        let store = SysfsStore::new(tmp.path());
        assert_eq!(store.read_u64(1, "sizelimit"), Err(SystemError::EINVAL));
    }
}
