//! 针对单个设备路径的便捷函数
//!
//! 每个函数都创建一个临时的 [`LoopContext`]，查询或操作完成后立即释放。

use std::{
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use system_error::SystemError;

use crate::{
    constants::LOOP_MAJOR,
    context::{LoopContext, LoopdevFlags},
};

fn open_context(device: &str) -> Result<LoopContext, SystemError> {
    let mut ctx = LoopContext::new(LoopdevFlags::empty());
    ctx.set_device(Some(device))?;
    Ok(ctx)
}

/// 设备是否设置了 autoclear，设备无法访问时为 `false`
pub fn is_autoclear(device: &str) -> bool {
    open_context(device)
        .and_then(|mut ctx| ctx.is_autoclear())
        .unwrap_or(false)
}

/// 设备当前绑定的后端文件
pub fn get_backing_file(device: &str) -> Result<Option<PathBuf>, SystemError> {
    open_context(device)?.backing_file()
}

/// # 功能
///
/// 判断设备是否已绑定，并可同时检查后端文件和 offset。
///
/// ## 参数
///
/// - `filename`: 为 `Some` 时 backing_file 必须与之逐字节相同。
/// - `offset`: 为 `Some` 时设备的 offset 必须与之相同。
pub fn is_used(device: &str, filename: Option<&Path>, offset: Option<u64>) -> bool {
    match open_context(device) {
        Ok(mut ctx) => matches_backing(&mut ctx, filename, offset),
        Err(_) => false,
    }
}

fn matches_backing(ctx: &mut LoopContext, filename: Option<&Path>, offset: Option<u64>) -> bool {
    let backing = match ctx.backing_file() {
        Ok(Some(backing)) => backing,
        _ => return false,
    };
    if filename.map_or(false, |f| f.as_os_str() != backing.as_os_str()) {
        return false;
    }
    match offset {
        Some(want) => matches!(ctx.offset(), Ok(Some(off)) if off == want),
        None => true,
    }
}

/// 解除设备的绑定
pub fn delete(device: &str) -> Result<(), SystemError> {
    open_context(device)?.delete_device()
}

/// 查找绑定了 `filename` 的设备，返回设备路径
pub fn find_by_backing_file(
    filename: impl AsRef<Path>,
    offset: Option<u64>,
) -> Result<Option<PathBuf>, SystemError> {
    LoopContext::new(LoopdevFlags::empty()).find_by_backing_file(filename, offset)
}

/// `path` 是否为 loop 块设备（主设备号为 7）
pub fn is_loopdev(path: impl AsRef<Path>) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.file_type().is_block_device() && libc::major(meta.rdev()) == LOOP_MAJOR,
        Err(_) => false,
    }
}
