//! 索引节点的磁盘形式与多级块索引
//!
//! 每个 inode 独占一个扇区，内含三档块指针：
//! - 直接指针：`DIRECT_COUNT` 个，直接存**数据块**的扇区号
//! - 一级间接指针：指向一个索引块，整块连续存数据块扇区号
//! - 二级间接指针：指向一个索引块，其中每个编号又指向一个一级索引块
//!
//! 指针值为0表示"未分配"，读到它即视为稀疏区域。
//!
//! ## 块索引编码
//!
//! 逻辑块号先按档位区间归类，再减去前档容量得到档内索引；
//! 二级档内索引除以/模 `INDIRECT_COUNT` 可得两层索引块内的位置。

use crate::buffer_cache::BufferCache;
use crate::error::Error;
use crate::free_map::FreeMap;
use crate::DataBlock;
use crate::SECTOR_SIZE;

/// 直接指针个数
pub(crate) const DIRECT_COUNT: usize = 122;
/// 索引块的编号容量
pub(crate) const INDIRECT_COUNT: usize = SECTOR_SIZE / 4;
/// 索引块
type IndexBlock = [u32; INDIRECT_COUNT];

/// 仅用直接指针时的编号容量
const DIRECT_CAP: usize = DIRECT_COUNT;
/// 用上一级间接指针时的编号容量
const INDIRECT1_CAP: usize = DIRECT_CAP + INDIRECT_COUNT;
/// 用上二级间接指针时的编号容量，也是单文件数据块数上限
pub(crate) const INDIRECT2_CAP: usize = INDIRECT1_CAP + INDIRECT_COUNT * INDIRECT_COUNT;

/// 辨识 inode 扇区的标志值；失配说明磁盘已损坏
const INODE_MAGIC: u32 = 0x494e_4f44;

const KIND_FILE: u32 = 0;
const KIND_DIRECTORY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InodeKind {
    File,
    Directory,
}

/// 索引节点的磁盘形式，恰好占满一个扇区
#[derive(Clone)]
#[repr(C)]
pub struct DiskInode {
    /// 文件字节长度
    pub(crate) length: u64,
    /// 直接指针，存储容量 DIRECT_COUNT * SECTOR_SIZE 字节
    direct: [u32; DIRECT_COUNT],
    /// 指向一个一级索引块
    indirect: u32,
    /// 指向一个二级索引块
    doubly_indirect: u32,
    // 不用枚举是为了容忍任意磁盘字节
    kind: u32,
    magic: u32,
}

/// 逻辑块号的档位归类
enum Tier {
    Direct(usize),
    Indirect(usize),
    DoublyIndirect(usize, usize),
}

impl Tier {
    /// 把逻辑块号归入三档之一；超出单文件上限返回空
    fn classify(block_index: usize) -> Option<Self> {
        if block_index < DIRECT_CAP {
            Some(Self::Direct(block_index))
        } else if block_index < INDIRECT1_CAP {
            Some(Self::Indirect(block_index - DIRECT_CAP))
        } else if block_index < INDIRECT2_CAP {
            let index = block_index - INDIRECT1_CAP;
            Some(Self::DoublyIndirect(
                index / INDIRECT_COUNT,
                index % INDIRECT_COUNT,
            ))
        } else {
            None
        }
    }
}

impl DiskInode {
    pub(crate) fn new(kind: InodeKind) -> Self {
        Self {
            length: 0,
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            doubly_indirect: 0,
            kind: match kind {
                InodeKind::File => KIND_FILE,
                InodeKind::Directory => KIND_DIRECTORY,
            },
            magic: INODE_MAGIC,
        }
    }

    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    #[inline]
    pub(crate) fn is_dir(&self) -> bool {
        self.kind == KIND_DIRECTORY
    }

    #[inline]
    pub(crate) fn kind(&self) -> InodeKind {
        if self.is_dir() {
            InodeKind::Directory
        } else {
            InodeKind::File
        }
    }

    /// 容纳指定数据量需要多少个**数据块**
    #[inline]
    pub(crate) fn sector_count(length: u64) -> usize {
        (length as usize).div_ceil(SECTOR_SIZE)
    }

    /// 逻辑上 inode 指向一系列数据块，此处传入这些数据块的索引(逻辑块号)，
    /// 返回给**块缓存层**使用的扇区号。
    /// 索引链上任何一环未分配都返回空，与文件末尾是两回事。
    pub(crate) fn sector_at(&self, block_index: usize, cache: &BufferCache) -> Option<u32> {
        let sector = match Tier::classify(block_index)? {
            Tier::Direct(i) => self.direct[i],
            Tier::Indirect(i) => {
                if self.indirect == 0 {
                    return None;
                }
                cache.with(self.indirect, |index_block: &IndexBlock| index_block[i])
            }
            Tier::DoublyIndirect(i, j) => {
                if self.doubly_indirect == 0 {
                    return None;
                }
                let level1 = cache.with(self.doubly_indirect, |index_block: &IndexBlock| {
                    index_block[i]
                });
                if level1 == 0 {
                    return None;
                }
                cache.with(level1, |index_block: &IndexBlock| index_block[j])
            }
        };

        (sector != 0).then_some(sector)
    }

    /// 调整文件长度并增删对应的块。
    ///
    /// 增长按逻辑块号逐块进行，途中分配失败会把本次已分配的
    /// 全部块(含索引块)原路释放，inode 自身分毫不动；
    /// 收缩按逻辑块号降序释放，索引块在最后一个子指针清空时随之释放。
    /// 长度字段只在整个操作确定成功后更新。
    pub(crate) fn resize(
        &mut self,
        new_length: u64,
        cache: &BufferCache,
        free_map: &mut FreeMap,
    ) -> Result<(), Error> {
        let current = Self::sector_count(self.length);
        let target = Self::sector_count(new_length);

        if target > current {
            for block in current..target {
                if let Err(e) = self.map_block(block, cache, free_map) {
                    for mapped in (current..block).rev() {
                        self.unmap_block(mapped, cache, free_map);
                    }
                    return Err(e);
                }
            }
        } else if current > target {
            for block in (target..current).rev() {
                self.unmap_block(block, cache, free_map);
            }
        }

        self.length = new_length;
        Ok(())
    }

    /// 从指定位置(字节偏移)读出数据填充 `buf`，
    /// 遇到文件末尾或稀疏区域提前结束
    pub(crate) fn read_at(&self, offset: usize, buf: &mut [u8], cache: &BufferCache) -> usize {
        let mut start = offset;
        let end = (start + buf.len()).min(self.length as usize);

        if start >= end {
            return 0;
        }

        // 已读取多少字节
        let mut read_size = 0;
        loop {
            // 当前块的逻辑块号，见 `DiskInode::sector_at`
            let block_index = start / SECTOR_SIZE;
            // 当前块内可读的末地址(字节)
            let current_block_end = ((block_index + 1) * SECTOR_SIZE).min(end);
            let block_read_size = current_block_end - start;

            let Some(sector) = self.sector_at(block_index, cache) else {
                break;
            };

            let dest = &mut buf[read_size..read_size + block_read_size];
            cache.with(sector, |data_block: &DataBlock| {
                // 绝对地址 % 扇区大小 = 扇区内偏移
                let src = &data_block[start % SECTOR_SIZE..start % SECTOR_SIZE + block_read_size];
                dest.copy_from_slice(src);
            });

            read_size += block_read_size;

            if current_block_end == end {
                break;
            }

            start = current_block_end;
        }

        read_size
    }

    /// 向指定位置(字节偏移)写入 `buf`；
    /// 超出长度的部分须先经 [`DiskInode::resize`] 扩容
    pub(crate) fn write_at(&self, offset: usize, buf: &[u8], cache: &BufferCache) -> usize {
        let mut start = offset;
        let end = (start + buf.len()).min(self.length as usize);

        if start >= end {
            return 0;
        }

        let mut written_size = 0;
        loop {
            let block_index = start / SECTOR_SIZE;
            let current_block_end = ((block_index + 1) * SECTOR_SIZE).min(end);
            let block_write_size = current_block_end - start;

            let Some(sector) = self.sector_at(block_index, cache) else {
                break;
            };

            let src = &buf[written_size..written_size + block_write_size];
            cache.with_mut(sector, |data_block: &mut DataBlock| {
                let dest =
                    &mut data_block[start % SECTOR_SIZE..start % SECTOR_SIZE + block_write_size];
                dest.copy_from_slice(src);
            });

            written_size += block_write_size;

            if current_block_end == end {
                break;
            }

            start = current_block_end;
        }

        written_size
    }
}

impl DiskInode {
    /// 分配一个清零的扇区
    fn alloc_zeroed(cache: &BufferCache, free_map: &mut FreeMap) -> Result<u32, Error> {
        let sector = free_map.allocate(1).ok_or(Error::NoSpace)?;
        cache.with_mut(sector, |data_block: &mut DataBlock| data_block.fill(0));
        Ok(sector)
    }

    /// 为逻辑块号分配数据块，缺失的索引块顺带建立。
    /// 失败时本函数内新建的索引块同样被回收，调用方只需回滚更早的块。
    fn map_block(
        &mut self,
        block_index: usize,
        cache: &BufferCache,
        free_map: &mut FreeMap,
    ) -> Result<(), Error> {
        match Tier::classify(block_index).ok_or(Error::NoSpace)? {
            Tier::Direct(i) => {
                self.direct[i] = Self::alloc_zeroed(cache, free_map)?;
            }
            Tier::Indirect(i) => {
                let created = self.indirect == 0;
                if created {
                    self.indirect = Self::alloc_zeroed(cache, free_map)?;
                }
                let data = match Self::alloc_zeroed(cache, free_map) {
                    Ok(sector) => sector,
                    Err(e) => {
                        if created {
                            free_map.release(self.indirect, 1);
                            self.indirect = 0;
                        }
                        return Err(e);
                    }
                };
                cache.with_mut(self.indirect, |index_block: &mut IndexBlock| {
                    index_block[i] = data;
                });
            }
            Tier::DoublyIndirect(i, j) => {
                let created2 = self.doubly_indirect == 0;
                if created2 {
                    self.doubly_indirect = Self::alloc_zeroed(cache, free_map)?;
                }
                let doubly = self.doubly_indirect;

                let mut level1 = cache.with(doubly, |index_block: &IndexBlock| index_block[i]);
                let created1 = level1 == 0;
                if created1 {
                    match Self::alloc_zeroed(cache, free_map) {
                        Ok(sector) => {
                            level1 = sector;
                            cache.with_mut(doubly, |index_block: &mut IndexBlock| {
                                index_block[i] = sector;
                            });
                        }
                        Err(e) => {
                            if created2 {
                                free_map.release(doubly, 1);
                                self.doubly_indirect = 0;
                            }
                            return Err(e);
                        }
                    }
                }

                let data = match Self::alloc_zeroed(cache, free_map) {
                    Ok(sector) => sector,
                    Err(e) => {
                        if created1 {
                            cache.with_mut(doubly, |index_block: &mut IndexBlock| {
                                index_block[i] = 0;
                            });
                            free_map.release(level1, 1);
                        }
                        if created2 {
                            free_map.release(doubly, 1);
                            self.doubly_indirect = 0;
                        }
                        return Err(e);
                    }
                };
                cache.with_mut(level1, |index_block: &mut IndexBlock| index_block[j] = data);
            }
        }

        Ok(())
    }

    /// 释放逻辑块号对应的数据块；
    /// 清掉索引块的0号子指针时(即降序释放到头)索引块一并释放
    fn unmap_block(&mut self, block_index: usize, cache: &BufferCache, free_map: &mut FreeMap) {
        match Tier::classify(block_index).unwrap() {
            Tier::Direct(i) => {
                free_map.release(self.direct[i], 1);
                self.direct[i] = 0;
            }
            Tier::Indirect(i) => {
                let data = cache.with(self.indirect, |index_block: &IndexBlock| index_block[i]);
                free_map.release(data, 1);
                if i == 0 {
                    free_map.release(self.indirect, 1);
                    self.indirect = 0;
                } else {
                    cache.with_mut(self.indirect, |index_block: &mut IndexBlock| {
                        index_block[i] = 0;
                    });
                }
            }
            Tier::DoublyIndirect(i, j) => {
                let doubly = self.doubly_indirect;
                let level1 = cache.with(doubly, |index_block: &IndexBlock| index_block[i]);
                let data = cache.with(level1, |index_block: &IndexBlock| index_block[j]);
                free_map.release(data, 1);
                if j == 0 {
                    free_map.release(level1, 1);
                    if i == 0 {
                        free_map.release(doubly, 1);
                        self.doubly_indirect = 0;
                    } else {
                        cache.with_mut(doubly, |index_block: &mut IndexBlock| index_block[i] = 0);
                    }
                } else {
                    cache.with_mut(level1, |index_block: &mut IndexBlock| index_block[j] = 0);
                }
            }
        }
    }
}
