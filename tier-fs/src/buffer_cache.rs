//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟缓冲区，
//! 把即将操作的扇区复制到内存中，提高对块设备的操作效率。
//! 同时，块缓存层也会尝试返回已缓存的扇区。
//!
//! 缓存槽在启动时一次性分配，数量固定；装满之后按**最久未访问**
//! 原则挑选牺牲槽，脏槽先写回设备再改装新扇区(写回制)。
//!
//! 锁分两层：粗粒度的准入锁只在裁决"哪个槽"时持有，
//! 细粒度的槽锁保护数据搬运与装填，
//! 因此单个槽的设备I/O不会阻塞无关扇区的查找。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};

use block_dev::BlockDevice;
use spin::Mutex;

use crate::DataBlock;
use crate::SECTOR_SIZE;

/// 缓存槽个数的上限
const CAPACITY: usize = 64;

/// 槽从未装填过扇区
const UNUSED: u32 = u32::MAX;

/// 对齐到 8 字节，保证能以 [`DiskInode`](crate::layout::DiskInode)
/// 等磁盘结构的引用形式访问缓冲区
#[repr(C, align(8))]
struct SectorBuf([u8; SECTOR_SIZE]);

/// 槽内受槽锁保护的部分
struct SlotState {
    /// 当前装载的扇区号
    sector: u32,
    data: SectorBuf,
    /// 是否为脏槽
    dirty: bool,
}

struct Slot {
    state: Mutex<SlotState>,
    /// 最近一次访问的时刻，用于淘汰裁决
    last_use: AtomicU64,
}

/// 缓存命中情况与设备流量的累计值
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub device_reads: u64,
    pub device_writes: u64,
}

/// 准入表，坐镇粗粒度锁之下
struct AdmitState {
    /// 每个槽当前对外公示的扇区号。
    /// 装填期间旧扇区号保持公示，读它的人会在槽锁上等到装填结束
    sectors: [u32; CAPACITY],
    /// 正被装填的槽，不参与牺牲裁决
    pinned: [bool; CAPACITY],
}

/// 扇区缓存池，所有对块设备的访问都从这里经过
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    slots: Vec<Slot>,
    /// 粗粒度准入锁：只在裁决"扇区在哪个槽"时持有，绝不跨设备I/O
    assign: Mutex<AdmitState>,
    /// 单调递增的访问时刻源
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    device_reads: AtomicU64,
    device_writes: AtomicU64,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = (0..CAPACITY)
            .map(|_| Slot {
                state: Mutex::new(SlotState {
                    sector: UNUSED,
                    data: SectorBuf([0; SECTOR_SIZE]),
                    dirty: false,
                }),
                last_use: AtomicU64::new(0),
            })
            .collect();

        Self {
            device,
            slots,
            assign: Mutex::new(AdmitState {
                sectors: [UNUSED; CAPACITY],
                pinned: [false; CAPACITY],
            }),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            device_reads: AtomicU64::new(0),
            device_writes: AtomicU64::new(0),
        }
    }

    /// 读出整个扇区。`buf` 长度必须恰为一个扇区。
    pub fn read(&self, sector: u32, buf: &mut [u8]) {
        self.with(sector, |data: &DataBlock| buf.copy_from_slice(data));
    }

    /// 覆写整个扇区，只改缓存并标脏，不触发设备写。
    pub fn write(&self, sector: u32, buf: &[u8]) {
        self.with_mut(sector, |data: &mut DataBlock| data.copy_from_slice(buf));
    }

    /// 以 `&T` 视角处理缓存中的扇区内容
    pub fn with<T: Sized, V>(&self, sector: u32, f: impl FnOnce(&T) -> V) -> V {
        loop {
            let index = self.admit(sector);
            let slot = &self.slots[index];
            let state = slot.state.lock();
            // 裁决与上锁之间槽可能已被改装，重走准入
            if state.sector != sector {
                continue;
            }
            self.touch(slot);
            return f(state.get());
        }
    }

    /// 以 `&mut T` 视角处理缓存中的扇区内容，槽随即标脏
    pub fn with_mut<T: Sized, V>(&self, sector: u32, f: impl FnOnce(&mut T) -> V) -> V {
        loop {
            let index = self.admit(sector);
            let slot = &self.slots[index];
            let mut state = slot.state.lock();
            if state.sector != sector {
                continue;
            }
            self.touch(slot);
            return f(state.get_mut());
        }
    }

    /// 把所有脏槽写回设备；关机路径调用
    pub fn flush_all(&self) {
        for slot in &self.slots {
            let mut state = slot.state.lock();
            if state.sector != UNUSED && state.dirty {
                state.dirty = false;
                self.device_writes.fetch_add(1, Ordering::Relaxed);
                self.device.write_block(state.sector as usize, &state.data.0);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            device_reads: self.device_reads.load(Ordering::Relaxed),
            device_writes: self.device_writes.load(Ordering::Relaxed),
        }
    }
}

impl BufferCache {
    /// 准入：裁决 `sector` 落在哪个槽，未缓存则淘汰一个槽并装填。
    ///
    /// 返回槽下标。由于返回后到上槽锁之前槽仍可能被改装，
    /// 调用方需要校验扇区号并在失配时重试。
    fn admit(&self, sector: u32) -> usize {
        loop {
            let mut assign = self.assign.lock();

            if let Some(index) = assign.sectors.iter().position(|&s| s == sector) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return index;
            }

            self.misses.fetch_add(1, Ordering::Relaxed);

            // 最久未访问的槽充当牺牲者，时刻相同时取最小下标；
            // 装填中的槽不参与
            let mut victim = None;
            let mut oldest = u64::MAX;
            for (i, slot) in self.slots.iter().enumerate() {
                if assign.pinned[i] {
                    continue;
                }
                let t = slot.last_use.load(Ordering::Relaxed);
                if t < oldest {
                    oldest = t;
                    victim = Some(i);
                }
            }
            let Some(victim) = victim else {
                // 所有槽都在装填中，放开准入锁稍后再试
                drop(assign);
                core::hint::spin_loop();
                continue;
            };

            // 旧扇区号保持公示直到写回完成，追着它来的读者
            // 会堵在槽锁上，绝不会从设备上读到落后的数据
            assign.pinned[victim] = true;
            drop(assign);

            let slot = &self.slots[victim];
            let mut state = slot.state.lock();
            if state.dirty {
                log::trace!("evict dirty sector {} from slot {}", state.sector, victim);
                state.dirty = false;
                self.device_writes.fetch_add(1, Ordering::Relaxed);
                self.device.write_block(state.sector as usize, &state.data.0);
            }
            self.device_reads.fetch_add(1, Ordering::Relaxed);
            self.device.read_block(sector as usize, &mut state.data.0);
            state.sector = sector;

            // 装填期间别的线程可能已把同一扇区装进其它槽，
            // I/O 后复查一次，竞争失败则废弃刚装好的槽
            let mut assign = self.assign.lock();
            assign.pinned[victim] = false;
            if let Some(other) = assign.sectors.iter().position(|&s| s == sector) {
                state.sector = UNUSED;
                state.dirty = false;
                slot.last_use.store(0, Ordering::Relaxed);
                assign.sectors[victim] = UNUSED;
                return other;
            }
            assign.sectors[victim] = sector;
            self.touch(slot);
            return victim;
        }
    }

    /// 记录一次访问；在槽锁内调用
    fn touch(&self, slot: &Slot) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        slot.last_use.store(now, Ordering::Relaxed);
    }
}

impl SlotState {
    fn get<T: Sized>(&self) -> &T {
        Self::check_layout::<T>();
        let addr = self.data.0.as_ptr().cast();
        unsafe { &*addr }
    }

    fn get_mut<T: Sized>(&mut self) -> &mut T {
        Self::check_layout::<T>();
        self.dirty = true;
        let addr = self.data.0.as_mut_ptr().cast();
        unsafe { &mut *addr }
    }

    fn check_layout<T: Sized>() {
        assert!(mem::size_of::<T>() <= SECTOR_SIZE);
        assert!(mem::align_of::<T>() <= mem::align_of::<SectorBuf>());
    }
}
