//! # 空闲扇区管理
//!
//! 以位图记录每个扇区是否已被占用：1为占用，0为空闲。
//! 位图常驻内存，挂载时从空闲图文件载入，落盘时写回；
//! 哪些扇区已分配，以这里为唯一事实。

use alloc::vec;
use alloc::vec::Vec;

/// 空闲扇区位图
pub(crate) struct FreeMap {
    /// 以64位为一组的位面
    groups: Vec<u64>,
    /// 可编号的扇区总数(含尾部填充位)
    sectors: u32,
}

impl FreeMap {
    /// 新建全空闲的位图；不足一组的尾部填充位标为占用，
    /// 永远不会被分配出去。
    pub fn new(sectors: u32) -> Self {
        let bits = (sectors as usize).div_ceil(64) * 64;
        let mut map = Self {
            groups: vec![0; bits / 64],
            sectors: bits as u32,
        };
        for s in sectors..bits as u32 {
            map.mark(s);
        }
        map
    }

    /// 从落盘字节恢复位图
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len() % 8, 0);
        let groups: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let sectors = (groups.len() * 64) as u32;
        Self { groups, sectors }
    }

    /// 位图的落盘形式
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.groups.len() * 8);
        for group in &self.groups {
            bytes.extend_from_slice(&group.to_le_bytes());
        }
        bytes
    }

    /// 落盘后占用的字节数
    pub fn file_len(&self) -> u64 {
        (self.groups.len() * 8) as u64
    }

    /// 分配 `count` 个连续扇区，返回首扇区号；空间不足返回空。
    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        assert!(count > 0);

        let mut run = 0;
        let mut start = 0;
        for s in 0..self.sectors {
            if self.is_used(s) {
                run = 0;
                continue;
            }
            if run == 0 {
                start = s;
            }
            run += 1;
            if run == count {
                for t in start..start + count {
                    self.mark(t);
                }
                return Some(start);
            }
        }
        None
    }

    /// 归还从 `sector` 起的 `count` 个扇区
    pub fn release(&mut self, sector: u32, count: u32) {
        for s in sector..sector + count {
            // 归还的扇区一定处于占用状态
            assert!(self.is_used(s), "double release of sector {s}");
            self.groups[s as usize / 64] &= !(1 << (s % 64));
        }
    }

    /// 把单个扇区标为占用；格式化引导阶段也用它圈走保留扇区
    pub fn mark(&mut self, sector: u32) {
        debug_assert!(!self.is_used(sector));
        self.groups[sector as usize / 64] |= 1 << (sector % 64);
    }

    pub fn free_count(&self) -> u32 {
        self.groups.iter().map(|g| g.count_zeros()).sum()
    }

    #[inline]
    fn is_used(&self, sector: u32) -> bool {
        self.groups[sector as usize / 64] & (1 << (sector % 64)) != 0
    }
}
