use std::{ffi::OsStr, os::unix::ffi::OsStrExt, path::PathBuf};

use bitflags::bitflags;

/// Loop 设备基础名称
pub const LOOP_BASENAME: &str = "loop";

/// Loop 设备的主设备号（`include/uapi/linux/major.h` 中的 `LOOP_MAJOR`）
pub const LOOP_MAJOR: u32 = 7;

/// 内核默认创建的 loop 设备数量（loop0 ~ loop7）
pub const LOOPDEV_DEFAULT_NNODES: u32 = 8;

/// 设备路径缓冲区大小（含结尾的 NUL）
pub const LOOPDEV_PATH_SIZE: usize = 128;

/// `loop_info64` 中 name 字段长度
pub const LO_NAME_SIZE: usize = 64;

/// `loop_info64` 中加密 key 字段长度
pub const LO_KEY_SIZE: usize = 32;

/// Loop 设备 ioctl 命令
///
/// 只支持 64 位版本的状态读写，旧的 `LOOP_SET_STATUS`/`LOOP_GET_STATUS`
/// (0x4C02/0x4C03) 只能携带 32 位 offset，这里故意不提供。
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopIoctl {
    /// 设置后端文件描述符
    LoopSetFd = 0x4C00,
    /// 清除后端文件绑定
    LoopClrFd = 0x4C01,
    /// 设置设备状态 (64位)
    LoopSetStatus64 = 0x4C04,
    /// 获取设备状态 (64位)
    LoopGetStatus64 = 0x4C05,
}

bitflags! {
    /// 内核 `LO_FLAGS_*` 标志位
    #[derive(Default)]
    pub struct LoFlags: u32 {
        /// 只读模式
        const READ_ONLY = 1 << 0;
        const USE_AOPS = 1 << 1;
        /// 最后一个使用者关闭设备时自动解绑
        const AUTOCLEAR = 1 << 2;
        const PARTSCAN = 1 << 3;
        const DIRECT_IO = 1 << 4;
    }
}

/// 已废弃的 loop 加密类型（`LO_CRYPT_*`）
///
/// 仅为兼容旧的 `loop_info64` 布局而保留，新功能不应依赖它，
/// 需要加密请使用 dm-crypt/cryptsetup。
pub struct LoCryptType;

impl LoCryptType {
    pub const NONE: u32 = 0;
    pub const XOR: u32 = 1;
    pub const DES: u32 = 2;
    pub const FISH2: u32 = 3;
    pub const BLOW: u32 = 4;
    pub const CAST128: u32 = 5;
    pub const IDEA: u32 = 6;
    pub const DUMMY: u32 = 9;
    pub const SKIPJACK: u32 = 10;
    pub const CRYPTOAPI: u32 = 18;
}

/// Loop 设备状态信息结构体 (64位版本)
///
/// Linux ABI: 对应 uapi `struct loop_info64`，字段顺序/大小必须匹配。
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LoopInfo64 {
    /// ioctl r/o
    pub lo_device: u64,
    /// ioctl r/o
    pub lo_inode: u64,
    /// ioctl r/o
    pub lo_rdevice: u64,
    /// 文件内偏移量
    pub lo_offset: u64,
    /// 大小限制 (0 表示无限制)
    pub lo_sizelimit: u64,
    /// ioctl r/o
    pub lo_number: u32,
    /// obsolete, ignored
    pub lo_encrypt_type: u32,
    /// ioctl w/o
    pub lo_encrypt_key_size: u32,
    /// `LO_FLAGS_*`
    pub lo_flags: u32,
    pub lo_file_name: [u8; LO_NAME_SIZE],
    pub lo_crypt_name: [u8; LO_NAME_SIZE],
    pub lo_encrypt_key: [u8; LO_KEY_SIZE],
    pub lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0u8; LO_NAME_SIZE],
            lo_crypt_name: [0u8; LO_NAME_SIZE],
            lo_encrypt_key: [0u8; LO_KEY_SIZE],
            lo_init: [0u64; 2],
        }
    }
}

impl core::fmt::Debug for LoopInfo64 {
    // 不打印 key
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopInfo64")
            .field("lo_number", &self.lo_number)
            .field("lo_offset", &self.lo_offset)
            .field("lo_sizelimit", &self.lo_sizelimit)
            .field("lo_flags", &self.flags())
            .field("lo_file_name", &self.file_name())
            .field("lo_encrypt_type", &self.lo_encrypt_type)
            .finish_non_exhaustive()
    }
}

impl LoopInfo64 {
    pub fn flags(&self) -> LoFlags {
        LoFlags::from_bits_truncate(self.lo_flags)
    }

    /// 读取 `lo_file_name`，遇到第一个 NUL 为止。内容按原始字节返回，不做编码转换。
    pub fn file_name(&self) -> PathBuf {
        c_buf_to_path(&self.lo_file_name)
    }

    /// # 功能
    ///
    /// 读取 `lo_file_name`，并按 legacy 约定标记可能的截断。
    ///
    /// 内核只保存 `LO_NAME_SIZE - 1` 个字节，无法判断原始路径是否更长，
    /// 因此倒数第二个字节总是被替换为 `*`：长度达到字段上限的路径会以 `*` 结尾，
    /// 较短的路径不受影响。这是有损但被接受的回退结果。
    pub fn file_name_marked(&self) -> PathBuf {
        let mut name = self.lo_file_name;
        name[LO_NAME_SIZE - 2] = b'*';
        name[LO_NAME_SIZE - 1] = 0;
        c_buf_to_path(&name)
    }

    /// 写入 `lo_file_name`，超长部分被截断，最后一个字节保证为 NUL。
    pub fn set_file_name(&mut self, name: &[u8]) {
        copy_to_c_buf(&mut self.lo_file_name, name);
    }

    pub fn set_crypt_name(&mut self, name: &[u8]) {
        copy_to_c_buf(&mut self.lo_crypt_name, name);
    }

    /// 清零 key 及其长度。
    pub fn wipe_key(&mut self) {
        for b in self.lo_encrypt_key.iter_mut() {
            // 用 volatile 写，避免被优化掉
            unsafe { core::ptr::write_volatile(b, 0) };
        }
        self.lo_encrypt_key_size = 0;
    }

    /// 整个结构体清零（包括 key）。
    pub fn clear(&mut self) {
        self.wipe_key();
        *self = Self::default();
    }
}

/// 按 C 字符串语义截断（至多 `buf.len() - 1` 字节）并补 NUL。
fn copy_to_c_buf(buf: &mut [u8], src: &[u8]) {
    buf.fill(0);
    let n = src.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&src[..n]);
}

fn c_buf_to_path(buf: &[u8]) -> PathBuf {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    PathBuf::from(OsStr::from_bytes(&buf[..end]))
}
