#![allow(clippy::needless_return)]
#![allow(clippy::upper_case_acronyms)]

use core::fmt;
use std::io;

use num_derive::{FromPrimitive, ToPrimitive};

/// Linux 错误码
///
/// 取值与 `asm-generic/errno-base.h`、`asm-generic/errno.h` 一致，
/// 由 syscall/ioctl 失败时的 errno 直接转换而来，不做任何改写。
#[repr(i32)]
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, Clone, Copy, Hash)]
#[allow(dead_code, non_camel_case_types)]
pub enum SystemError {
    /// 操作不被允许 Operation not permitted.
    EPERM = 1,
    /// 文件或目录不存在 No such file or directory.
    ENOENT = 2,
    ESRCH = 3,
    /// 系统调用被中断 Interrupted system call.
    EINTR = 4,
    /// I/O 错误
    EIO = 5,
    /// 没有这样的设备或地址 No such device or address.
    ///
    /// 对未绑定的 loop 设备执行 `LOOP_GET_STATUS64` 时内核返回此错误。
    ENXIO = 6,
    E2BIG = 7,
    ENOEXEC = 8,
    /// 错误的文件描述符 Bad file descriptor.
    EBADF = 9,
    ECHILD = 10,
    /// 资源暂不可用 Try again / Operation would block.
    EAGAIN_OR_EWOULDBLOCK = 11,
    /// 内存不足 Out of memory.
    ENOMEM = 12,
    /// 访问被拒绝 Permission denied.
    EACCES = 13,
    EFAULT = 14,
    /// 需要块设备 Block device required.
    ENOTBLK = 15,
    /// 设备或资源忙 Device or resource busy.
    ///
    /// 绑定 loop 设备时表示该设备已被其他进程占用，调用者应换一个设备重试。
    EBUSY = 16,
    EEXIST = 17,
    EXDEV = 18,
    /// 没有这样的设备 No such device.
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    /// 无效参数 Invalid argument.
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    /// 不支持的 ioctl Inappropriate ioctl for device.
    ENOTTY = 25,
    ETXTBSY = 26,
    EFBIG = 27,
    ENOSPC = 28,
    ESPIPE = 29,
    /// 只读文件系统 Read-only file system.
    EROFS = 30,
    EMLINK = 31,
    EPIPE = 32,
    EDOM = 33,
    ERANGE = 34,
    EDEADLK_OR_EDEADLOCK = 35,
    ENAMETOOLONG = 36,
    ENOLCK = 37,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    ELOOP = 40,
    ENOMSG = 42,
    EIDRM = 43,
    ECHRNG = 44,
    EL2NSYNC = 45,
    EL3HLT = 46,
    EL3RST = 47,
    ELNRNG = 48,
    EUNATCH = 49,
    ENOCSI = 50,
    EL2HLT = 51,
    EBADE = 52,
    EBADR = 53,
    EXFULL = 54,
    ENOANO = 55,
    EBADRQC = 56,
    EBADSLT = 57,
    EBFONT = 59,
    ENOSTR = 60,
    ENODATA = 61,
    ETIME = 62,
    ENOSR = 63,
    ENONET = 64,
    ENOPKG = 65,
    EREMOTE = 66,
    ENOLINK = 67,
    EADV = 68,
    ESRMNT = 69,
    ECOMM = 70,
    EPROTO = 71,
    EMULTIHOP = 72,
    EDOTDOT = 73,
    EBADMSG = 74,
    EOVERFLOW = 75,
    ENOTUNIQ = 76,
    EBADFD = 77,
    EREMCHG = 78,
    ELIBACC = 79,
    ELIBBAD = 80,
    ELIBSCN = 81,
    ELIBMAX = 82,
    ELIBEXEC = 83,
    EILSEQ = 84,
    ERESTART = 85,
    ESTRPIPE = 86,
    EUSERS = 87,
    ENOTSOCK = 88,
    EDESTADDRREQ = 89,
    EMSGSIZE = 90,
    EPROTOTYPE = 91,
    ENOPROTOOPT = 92,
    EPROTONOSUPPORT = 93,
    ESOCKTNOSUPPORT = 94,
    EOPNOTSUPP_OR_ENOTSUP = 95,
    EPFNOSUPPORT = 96,
    EAFNOSUPPORT = 97,
    EADDRINUSE = 98,
    EADDRNOTAVAIL = 99,
    ENETDOWN = 100,
    ENETUNREACH = 101,
    ENETRESET = 102,
    ECONNABORTED = 103,
    ECONNRESET = 104,
    ENOBUFS = 105,
    EISCONN = 106,
    ENOTCONN = 107,
    ESHUTDOWN = 108,
    ETOOMANYREFS = 109,
    ETIMEDOUT = 110,
    ECONNREFUSED = 111,
    EHOSTDOWN = 112,
    EHOSTUNREACH = 113,
    EALREADY = 114,
    EINPROGRESS = 115,
    ESTALE = 116,
    EUCLEAN = 117,
    ENOTNAM = 118,
    ENAVAIL = 119,
    EISNAM = 120,
    EREMOTEIO = 121,
    EDQUOT = 122,
    ENOMEDIUM = 123,
    EMEDIUMTYPE = 124,
    ECANCELED = 125,
    ENOKEY = 126,
    EKEYEXPIRED = 127,
    EKEYREVOKED = 128,
    EKEYREJECTED = 129,
    EOWNERDEAD = 130,
    ENOTRECOVERABLE = 131,
    ERFKILL = 132,
    EHWPOISON = 133,
}

impl SystemError {
    /// 把负数形式的 posix 错误码转换为错误枚举。
    pub fn from_posix_errno(errno: i32) -> Option<SystemError> {
        // posix 错误码是小于0的
        if errno >= 0 {
            return None;
        }
        return <Self as num_traits::FromPrimitive>::from_i32(-errno);
    }

    /// 把错误枚举转换为负数 posix 错误码。
    pub fn to_posix_errno(&self) -> i32 {
        return -self.errno();
    }

    /// 正数形式的 errno，与 `std::io::Error::raw_os_error()` 相同。
    pub fn errno(&self) -> i32 {
        return *self as i32;
    }

    /// # 功能
    ///
    /// 读取当前线程的 errno 并转换为错误枚举。
    ///
    /// 仅应在 libc 调用返回失败之后立即调用。
    pub fn last_os_error() -> SystemError {
        return SystemError::from(io::Error::last_os_error());
    }

    /// 设备被占用，调用者可以换一个设备重试
    pub fn is_busy(&self) -> bool {
        *self == SystemError::EBUSY
    }
}

impl From<io::Error> for SystemError {
    /// 优先使用 raw errno；没有 errno 的错误（例如 std 内部构造的错误）按 kind 粗略映射。
    fn from(err: io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            if let Some(e) = <Self as num_traits::FromPrimitive>::from_i32(code) {
                return e;
            }
        }
        match err.kind() {
            io::ErrorKind::NotFound => SystemError::ENOENT,
            io::ErrorKind::PermissionDenied => SystemError::EACCES,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => SystemError::EINVAL,
            io::ErrorKind::WouldBlock => SystemError::EAGAIN_OR_EWOULDBLOCK,
            io::ErrorKind::Interrupted => SystemError::EINTR,
            io::ErrorKind::OutOfMemory => SystemError::ENOMEM,
            _ => SystemError::EIO,
        }
    }
}

impl From<SystemError> for io::Error {
    fn from(err: SystemError) -> Self {
        io::Error::from_raw_os_error(err.errno())
    }
}

impl fmt::Display for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self, io::Error::from_raw_os_error(self.errno()))
    }
}

impl std::error::Error for SystemError {}
