//! 设备发现
//!
//! 一次扫描按代价从低到高依次使用三种策略：
//!
//! 1. `/proc/partitions` 中主设备号为 7 的行（仅在只找已用设备时）；
//! 2. 默认的 `loop0` ~ `loop7`；
//! 3. 列出 `/dev`（或 `/dev/loop/`）目录，得到其余编号。
//!
//! 已耗尽的策略在同一次扫描中不会再被使用。

use std::{
    fs::{self, File, FileType},
    io::{self, BufRead, BufReader, Lines},
    os::unix::fs::FileTypeExt,
    path::PathBuf,
};

use bitflags::bitflags;
use log::{debug, trace};
use system_error::SystemError;

use crate::{
    constants::{LOOPDEV_DEFAULT_NNODES, LOOP_BASENAME, LOOP_MAJOR},
    context::LoopContext,
    platform::{parse_number, Platform},
};

bitflags! {
    /// 扫描时的过滤条件
    #[derive(Default)]
    pub struct IterFlags: u32 {
        /// 只返回已绑定的设备
        const USED = 1 << 0;
        /// 只返回空闲的设备
        const FREE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Census,
    DefaultRange,
    FullScan,
    Done,
}

/// 一次扫描的状态
#[derive(Debug)]
pub struct LoopIter {
    flags: IterFlags,
    strategy: Strategy,
    /// 默认范围内下一个要探测的编号
    ncur: u32,
    /// 目录扫描得到的编号（升序、去重）
    minors: Option<std::vec::IntoIter<u32>>,
    census: Option<Lines<BufReader<File>>>,
}

impl LoopIter {
    fn new(flags: IterFlags, platform: &Platform) -> Self {
        let mut census = None;
        let strategy = if flags.contains(IterFlags::USED) {
            match File::open(&platform.partitions) {
                Ok(f) => {
                    census = Some(BufReader::new(f).lines());
                    Strategy::Census
                }
                Err(e) => {
                    debug!(
                        "{} unavailable ({}), probing devices directly",
                        platform.partitions.display(),
                        e
                    );
                    Strategy::DefaultRange
                }
            }
        } else {
            Strategy::DefaultRange
        };

        Self {
            flags,
            strategy,
            ncur: 0,
            minors: None,
            census,
        }
    }

    /// 释放清单文件和编号缓存，之后的 `next` 都返回扫描结束
    fn finish(&mut self) {
        self.strategy = Strategy::Done;
        self.census = None;
        self.minors = None;
    }

    /// 清单中下一个 loop 设备的次设备号
    fn next_census(&mut self) -> Result<Option<u32>, SystemError> {
        let Some(lines) = self.census.as_mut() else {
            return Ok(None);
        };
        for line in lines {
            let line = line?;
            if let Some(minor) = parse_partitions_line(&line) {
                return Ok(Some(minor));
            }
        }
        Ok(None)
    }

    /// 按当前策略产生下一个候选编号，所有策略耗尽时返回 `None`
    fn next_candidate(&mut self, platform: &Platform) -> Result<Option<u32>, SystemError> {
        loop {
            match self.strategy {
                Strategy::Census => {
                    if let Some(minor) = self.next_census()? {
                        return Ok(Some(minor));
                    }
                    // 清单中的设备就是全部已用设备
                    debug!("census exhausted, scan finished");
                    self.finish();
                }
                Strategy::DefaultRange => {
                    if self.ncur < LOOPDEV_DEFAULT_NNODES {
                        let n = self.ncur;
                        self.ncur += 1;
                        return Ok(Some(n));
                    }
                    debug!("default range exhausted, scanning device directory");
                    self.strategy = Strategy::FullScan;
                }
                Strategy::FullScan => {
                    if self.minors.is_none() {
                        self.minors = Some(scan_loop_numbers(platform)?.into_iter());
                    }
                    if let Some(n) = self.minors.as_mut().and_then(|m| m.next()) {
                        return Ok(Some(n));
                    }
                    self.finish();
                }
                Strategy::Done => return Ok(None),
            }
        }
    }
}

/// 解析 `major minor #blocks name` 行，主设备号为 loop 时返回次设备号
fn parse_partitions_line(line: &str) -> Option<u32> {
    let mut fields = line.split_whitespace();
    let major: u32 = fields.next()?.parse().ok()?;
    let minor: u32 = fields.next()?.parse().ok()?;
    // #blocks 和 name 也必须存在
    fields.next()?;
    fields.next()?;
    (major == LOOP_MAJOR).then_some(minor)
}

/// # 功能
///
/// 列出设备目录，收集编号不小于默认节点数的 loop 设备。
///
/// 平铺布局下匹配 `loop<N>`，子目录布局下匹配纯数字文件名。
/// 目录项类型的取舍见 [`accepts_entry_type`]。
///
/// ## 返回值
/// - `Ok(Vec<u32>)`: 升序且去重的编号，目录不存在时为空。
/// - `Err(SystemError)`: 读取目录失败。
fn scan_loop_numbers(platform: &Platform) -> Result<Vec<u32>, SystemError> {
    let (dir, prefixed) = if platform.dev_subdir {
        (platform.loop_dir(), false)
    } else {
        (platform.dev_dir.clone(), true)
    };

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            trace!("{} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut numbers = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !accepts_entry_type(entry.file_type()) {
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let number = if prefixed {
            name.strip_prefix(LOOP_BASENAME).and_then(parse_number)
        } else {
            parse_number(name)
        };
        match number {
            // 0 ~ 7 已经由默认范围探测过
            Some(n) if n >= LOOPDEV_DEFAULT_NNODES => numbers.push(n),
            _ => {}
        }
    }

    numbers.sort_unstable();
    numbers.dedup();
    debug!("found {} loop nodes in {}", numbers.len(), dir.display());
    Ok(numbers)
}

/// # 功能
///
/// 判断目录项的类型能否是 loop 设备节点：块设备和符号链接可以，类型无法判断时也可以。
///
/// `readdir` 没有给出类型（`DT_UNKNOWN`）时，[`fs::DirEntry::file_type`] 会用 `lstat`
/// 补全，因此只有 `lstat` 也失败的目录项才按"无法判断"接受；`lstat` 得到的普通文件、
/// 目录等仍被跳过。
fn accepts_entry_type(file_type: io::Result<FileType>) -> bool {
    match file_type {
        Ok(t) => t.is_block_device() || t.is_symlink(),
        Err(_) => true,
    }
}

impl LoopContext {
    /// # 功能
    ///
    /// 开始一次新的扫描，丢弃之前的扫描状态。
    ///
    /// ## 参数
    ///
    /// - `flags`: `USED` 只返回已绑定设备，`FREE` 只返回空闲设备，为空则不过滤。
    pub fn init_iterator(&mut self, flags: IterFlags) {
        trace!("init iterator with {:?}", flags);
        self.iter = Some(LoopIter::new(flags, &self.platform));
    }

    /// 结束扫描并释放相关资源
    pub fn deinit_iterator(&mut self) {
        self.iter = None;
    }

    /// # 功能
    ///
    /// 取得下一个符合条件的设备，并把它设为上下文的当前设备。
    ///
    /// ## 返回值
    /// - `Ok(Some(PathBuf))`: 当前设备的路径。
    /// - `Ok(None)`: 扫描结束，扫描资源已释放。
    /// - `Err(SystemError::EINVAL)`: 没有调用 [`LoopContext::init_iterator`]。
    /// - `Err(SystemError)`: 扫描过程中的其它错误，扫描随之结束。
    pub fn next_device(&mut self) -> Result<Option<PathBuf>, SystemError> {
        let mut iter = self.iter.take().ok_or(SystemError::EINVAL)?;
        let result = self.advance(&mut iter);
        if !matches!(result, Ok(Some(_))) {
            iter.finish();
        }
        self.iter = Some(iter);
        result
    }

    /// 以迭代器形式扫描，迭代结束后扫描状态被释放
    pub fn scan(&mut self, flags: IterFlags) -> LoopScan<'_> {
        self.init_iterator(flags);
        LoopScan {
            ctx: self,
            done: false,
        }
    }

    fn advance(&mut self, iter: &mut LoopIter) -> Result<Option<PathBuf>, SystemError> {
        while let Some(number) = iter.next_candidate(&self.platform)? {
            if self.try_candidate(iter.flags, number)? {
                return Ok(self.device.clone());
            }
        }
        Ok(None)
    }

    /// 把候选设为当前设备并按过滤条件检查，不符合时重置当前设备
    fn try_candidate(&mut self, flags: IterFlags, number: u32) -> Result<bool, SystemError> {
        self.set_device(Some(&format!("{}{}", LOOP_BASENAME, number)))?;
        if !flags.intersects(IterFlags::USED | IterFlags::FREE) {
            return Ok(true);
        }

        // 近似判断：offset 不为 0 才算已用。offset 为 0 的已绑定设备会被当成空闲，
        // 读取失败或没有结果的设备也算空闲。
        let used = matches!(self.offset(), Ok(Some(offset)) if offset != 0);

        let accepted = (flags.contains(IterFlags::USED) && used)
            || (flags.contains(IterFlags::FREE) && !used);
        if !accepted {
            trace!("loop{} rejected (used={})", number, used);
            self.set_device(None)?;
        }
        Ok(accepted)
    }
}

/// [`LoopContext::scan`] 返回的迭代器
pub struct LoopScan<'a> {
    ctx: &'a mut LoopContext,
    done: bool,
}

impl Iterator for LoopScan<'_> {
    type Item = Result<PathBuf, SystemError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.ctx.next_device() {
            Ok(Some(path)) => Some(Ok(path)),
            Ok(None) => {
                self.done = true;
                self.ctx.deinit_iterator();
                None
            }
            Err(e) => {
                self.done = true;
                self.ctx.deinit_iterator();
                Some(Err(e))
            }
        }
    }
}

impl Drop for LoopScan<'_> {
    fn drop(&mut self) {
        self.ctx.deinit_iterator();
    }
}
