//! # 索引节点层
//!
//! 同一扇区的所有打开者共享同一个内存对象：打开表以扇区号为键，
//! 保证经由任一句柄的写入对其它句柄即刻可见。
//! 句柄本身就是引用计数的"再打开"，最后一个句柄释放时，
//! 若 inode 已被标记删除，才真正归还它占用的全部扇区。

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use enumflags2::bitflags;
use spin::{Mutex, MutexGuard};

use crate::buffer_cache::BufferCache;
use crate::error::Error;
use crate::free_map::FreeMap;
use crate::layout::{DiskInode, InodeKind};
use crate::SECTOR_SIZE;

/// 初始化一个全新的磁盘 inode 并写入 `sector`：
/// 为 `length` 字节分配恰好足够的清零块，全部成功后才落到缓存；
/// 中途分配失败则整体回滚，`sector` 的旧内容不受影响。
pub(crate) fn create_inode(
    cache: &BufferCache,
    free_map: &mut FreeMap,
    sector: u32,
    length: u64,
    kind: InodeKind,
) -> Result<(), Error> {
    // inode 必须恰好占满一个扇区
    assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);

    let mut disk_inode = DiskInode::new(kind);
    disk_inode.resize(length, cache, free_map)?;
    cache.with_mut(sector, |on_disk: &mut DiskInode| *on_disk = disk_inode);
    Ok(())
}

/// 打开表：扇区号到共享体的身份映射。
/// 查找、插入与摘除都在同一把锁下进行。
pub(crate) struct InodeTable {
    cache: Arc<BufferCache>,
    free_map: Arc<Mutex<FreeMap>>,
    map: Arc<Mutex<BTreeMap<u32, Weak<Shared>>>>,
}

impl InodeTable {
    pub fn new(cache: Arc<BufferCache>, free_map: Arc<Mutex<FreeMap>>) -> Self {
        Self {
            cache,
            free_map,
            map: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// 取得 `sector` 的共享句柄；已打开则复用，否则从磁盘载入
    pub fn open(&self, sector: u32) -> Inode {
        let mut map = self.map.lock();

        if let Some(shared) = map.get(&sector).and_then(Weak::upgrade) {
            return Inode { shared };
        }

        // 首次打开：校验标志值，失配即磁盘损坏
        let kind = self.cache.with(sector, |disk_inode: &DiskInode| {
            assert!(
                disk_inode.is_valid(),
                "inode magic mismatch at sector {sector}"
            );
            disk_inode.kind()
        });

        let shared = Arc::new(Shared {
            sector,
            kind,
            removed: AtomicBool::new(false),
            deny_write: AtomicU32::new(0),
            resize_lock: Mutex::new(()),
            dir_lock: Mutex::new(()),
            cache: self.cache.clone(),
            free_map: self.free_map.clone(),
            table: Arc::downgrade(&self.map),
        });
        map.insert(sector, Arc::downgrade(&shared));

        Inode { shared }
    }
}

/// 索引节点句柄；克隆即"再打开"
#[derive(Clone)]
pub struct Inode {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("sector", &self.shared.sector)
            .field("kind", &self.shared.kind)
            .finish()
    }
}

struct Shared {
    /// inode 所在扇区，也是它的编号
    sector: u32,
    kind: InodeKind,
    /// 已标记删除，物理回收推迟到最后一个句柄释放
    removed: AtomicBool,
    /// 拒绝写计数，可执行文件加载期间用
    deny_write: AtomicU32,
    /// 串行化同一文件的扩容与截断
    resize_lock: Mutex<()>,
    /// 串行化目录项修改
    dir_lock: Mutex<()>,
    cache: Arc<BufferCache>,
    free_map: Arc<Mutex<FreeMap>>,
    table: Weak<Mutex<BTreeMap<u32, Weak<Shared>>>>,
}

impl Inode {
    /// inode 编号，即所在扇区号
    #[inline]
    pub fn inumber(&self) -> u32 {
        self.shared.sector
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.shared.kind == InodeKind::Directory
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.shared.removed.load(Ordering::Relaxed)
    }

    /// 标记删除；见 [`Shared`] 的释放逻辑
    pub fn remove(&self) {
        self.shared.removed.store(true, Ordering::Relaxed);
    }

    pub fn length(&self) -> u64 {
        self.on_disk(|disk_inode| disk_inode.length)
    }

    /// 从指定偏移读出至多 `buf.len()` 字节，返回实际读到的字节数；
    /// 抵达文件末尾时可能少于请求量
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let disk_inode = self.on_disk(DiskInode::clone);
        disk_inode.read_at(offset, buf, &self.shared.cache)
    }

    /// 向指定偏移写入 `buf`，返回实际写入的字节数。
    /// 写入末端超过当前长度时先行扩容；扩容按 inode 串行，
    /// 空间不足则整体回滚并返回0。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if self.shared.deny_write.load(Ordering::Relaxed) > 0 {
            return 0;
        }

        let resize_guard = self.shared.resize_lock.lock();
        let mut disk_inode = self.on_disk(DiskInode::clone);
        let end = (offset + buf.len()) as u64;
        if end > disk_inode.length {
            let mut free_map = self.shared.free_map.lock();
            if let Err(e) = disk_inode.resize(end, &self.shared.cache, &mut free_map) {
                log::debug!("grow of inode {} to {end} failed: {e:?}", self.inumber());
                return 0;
            }
            drop(free_map);
            // 索引块已先行落到缓存，此刻才更新 inode 本体
            self.on_disk_mut(|on_disk| *on_disk = disk_inode.clone());
        }
        drop(resize_guard);

        disk_inode.write_at(offset, buf, &self.shared.cache)
    }

    /// 把文件调整到指定长度，增删块均经由一次串行化的 resize
    pub fn truncate(&self, new_length: u64) -> Result<(), Error> {
        if self.is_dir() {
            return Err(Error::IsADirectory);
        }
        if self.shared.deny_write.load(Ordering::Relaxed) > 0 {
            return Err(Error::WriteDenied);
        }

        let _resize_guard = self.shared.resize_lock.lock();
        let mut disk_inode = self.on_disk(DiskInode::clone);
        let mut free_map = self.shared.free_map.lock();
        disk_inode.resize(new_length, &self.shared.cache, &mut free_map)?;
        drop(free_map);
        self.on_disk_mut(|on_disk| *on_disk = disk_inode);
        Ok(())
    }

    /// 拒绝后续写入；每个打开者至多调用一次
    pub fn deny_write(&self) {
        self.shared.deny_write.fetch_add(1, Ordering::Relaxed);
    }

    /// 恢复写入；与 [`Inode::deny_write`] 一一配对
    pub fn allow_write(&self) {
        let prev = self.shared.deny_write.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0);
    }

    pub fn stat(&self) -> Stat {
        Stat::new(
            self.inumber() as u64,
            match self.shared.kind {
                InodeKind::Directory => StatKind::DIR,
                InodeKind::File => StatKind::FILE,
            },
            self.length(),
        )
    }
}

impl Inode {
    /// 读取对磁盘的映射并处理
    pub(crate) fn on_disk<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> V {
        self.shared.cache.with(self.shared.sector, f)
    }

    /// 以某种方式修改对磁盘的映射
    fn on_disk_mut<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        self.shared.cache.with_mut(self.shared.sector, f)
    }

    pub(crate) fn dir_lock(&self) -> MutexGuard<'_, ()> {
        self.shared.dir_lock.lock()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // 先把打开表里本扇区的死项摘掉；
        // 若竞争的打开者已抢先换上新项，保持原样
        if let Some(map) = self.table.upgrade() {
            let mut map = map.lock();
            if map
                .get(&self.sector)
                .is_some_and(|weak| weak.strong_count() == 0)
            {
                map.remove(&self.sector);
            }
        }

        if self.removed.load(Ordering::Relaxed) {
            // 延迟到此刻的物理删除：归还全部数据块与 inode 自身扇区
            let mut disk_inode = self.cache.with(self.sector, DiskInode::clone);
            let mut free_map = self.free_map.lock();
            disk_inode
                .resize(0, &self.cache, &mut free_map)
                .expect("shrink never fails");
            free_map.release(self.sector, 1);
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct Stat {
    pub dev: u64,
    pub inode: u64,
    pub kind: StatKind,
    pub size: u64,
    pad: [u64; 7],
}

impl Stat {
    #[inline]
    pub fn new(inode: u64, kind: StatKind, size: u64) -> Self {
        Self {
            dev: 0,
            inode,
            kind,
            size,
            pad: Default::default(),
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatKind {
    DIR = 0o040000,
    #[default]
    FILE = 0o100000,
}
