//! # 文件存储门面
//!
//! 把块缓存、空闲图、打开表与路径解析串成一个完整的文件存储：
//! 格式化/挂载设备，再按路径创建、打开、删除文件与目录。
//! 所有按路径的操作都以调用方提供的当前目录为相对起点。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use block_dev::BlockDevice;
use spin::Mutex;

use crate::buffer_cache::{BufferCache, CacheStats};
use crate::dir::{Dir, PARENT_NAME, SELF_NAME};
use crate::error::Error;
use crate::free_map::FreeMap;
use crate::inode::{self, Inode, InodeTable};
use crate::layout::{DiskInode, InodeKind};
use crate::path;
use crate::DataBlock;
use crate::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub struct FileStore {
    cache: Arc<BufferCache>,
    free_map: Arc<Mutex<FreeMap>>,
    inodes: InodeTable,
}

impl FileStore {
    /// 格式化设备并挂载：清零全部扇区，建立空闲图文件(扇区0)
    /// 与带"."、".."两项的根目录(扇区1)，随即落盘。
    pub fn format(device: Arc<dyn BlockDevice>, total_sectors: u32) -> Result<Self, Error> {
        assert!(total_sectors > 2, "device too small to hold a file store");

        let cache = Arc::new(BufferCache::new(device));
        for sector in 0..total_sectors {
            cache.with_mut(sector, |data_block: &mut DataBlock| data_block.fill(0));
        }

        let mut free_map = FreeMap::new(total_sectors);
        free_map.mark(FREE_MAP_SECTOR);
        free_map.mark(ROOT_DIR_SECTOR);

        inode::create_inode(&cache, &mut free_map, ROOT_DIR_SECTOR, 0, InodeKind::Directory)?;
        // 空闲图文件的长度即位图字节数，挂载时反推出扇区总数
        let map_len = free_map.file_len();
        inode::create_inode(&cache, &mut free_map, FREE_MAP_SECTOR, map_len, InodeKind::File)?;

        let store = Self::assemble(cache, free_map);

        let root = store.root_dir();
        root.add(SELF_NAME, ROOT_DIR_SECTOR)?;
        root.add(PARENT_NAME, ROOT_DIR_SECTOR)?;

        store.flush();
        log::debug!("formatted file store with {total_sectors} sectors");
        Ok(store)
    }

    /// 挂载已格式化的设备：载入空闲图，校验根目录
    pub fn mount(device: Arc<dyn BlockDevice>) -> Self {
        let cache = Arc::new(BufferCache::new(device));

        let map_inode = cache.with(FREE_MAP_SECTOR, |disk_inode: &DiskInode| {
            assert!(disk_inode.is_valid(), "free map inode is corrupted");
            disk_inode.clone()
        });
        let map_len = map_inode.length as usize;
        let mut bytes = vec![0; map_len];
        assert_eq!(map_inode.read_at(0, &mut bytes, &cache), map_len);
        let free_map = FreeMap::from_bytes(&bytes);

        cache.with(ROOT_DIR_SECTOR, |disk_inode: &DiskInode| {
            assert!(
                disk_inode.is_valid() && disk_inode.is_dir(),
                "root directory inode is corrupted"
            );
        });

        log::debug!("mounted file store, {} sectors free", free_map.free_count());
        Self::assemble(cache, free_map)
    }

    /// 根目录句柄，绝对路径与默认相对起点都从这里出发
    pub fn root_dir(&self) -> Dir {
        Dir::new(self.inodes.open(ROOT_DIR_SECTOR)).expect("root is a directory")
    }

    /// 在 `path` 指示的位置创建长度为 `length` 的新文件，
    /// 返回其句柄。所需块全部就位后文件才可见，
    /// 任何一步失败都会把已占用的扇区原路归还。
    pub fn create(&self, cwd: &Dir, path: &str, length: u64) -> Result<Inode, Error> {
        let (dir, leaf) = path::resolve(self, cwd, path)?;
        if leaf == SELF_NAME {
            return Err(Error::AlreadyExists);
        }

        let mut free_map = self.free_map.lock();
        let sector = free_map.allocate(1).ok_or(Error::NoSpace)?;
        if let Err(e) = inode::create_inode(&self.cache, &mut free_map, sector, length, InodeKind::File)
        {
            free_map.release(sector, 1);
            return Err(e);
        }
        drop(free_map);

        if let Err(e) = dir.add(leaf, sector) {
            self.discard_inode(sector);
            return Err(e);
        }

        Ok(self.inodes.open(sector))
    }

    /// 打开 `path` 指示的文件或目录
    pub fn open(&self, cwd: &Dir, path: &str) -> Result<Inode, Error> {
        let (dir, leaf) = path::resolve(self, cwd, path)?;
        if leaf == SELF_NAME {
            return Ok(dir.into_inode());
        }
        let sector = dir.lookup(leaf).ok_or(Error::NotFound)?;
        Ok(self.inodes.open(sector))
    }

    /// 打开 `path` 指示的目录；把返回值用作后续操作的
    /// 相对起点即是"切换当前目录"
    pub fn open_dir(&self, cwd: &Dir, path: &str) -> Result<Dir, Error> {
        Dir::new(self.open(cwd, path)?)
    }

    /// 列出 `path` 指示目录的项名，"."与".."除外
    pub fn read_dir(&self, cwd: &Dir, path: &str) -> Result<Vec<String>, Error> {
        Ok(self.open_dir(cwd, path)?.entries())
    }

    /// 在 `path` 指示的位置创建新目录，自动写入"."与".."
    pub fn mkdir(&self, cwd: &Dir, path: &str) -> Result<(), Error> {
        let (dir, leaf) = path::resolve(self, cwd, path)?;
        if leaf == SELF_NAME {
            return Err(Error::AlreadyExists);
        }

        let mut free_map = self.free_map.lock();
        let sector = free_map.allocate(1).ok_or(Error::NoSpace)?;
        if let Err(e) =
            inode::create_inode(&self.cache, &mut free_map, sector, 0, InodeKind::Directory)
        {
            free_map.release(sector, 1);
            return Err(e);
        }
        drop(free_map);

        let result = (|| {
            let new_dir = Dir::new(self.inodes.open(sector))?;
            new_dir.add(SELF_NAME, sector)?;
            new_dir.add(PARENT_NAME, dir.inode().inumber())?;
            dir.add(leaf, sector)
        })();
        if let Err(e) = result {
            self.discard_inode(sector);
            return Err(e);
        }

        Ok(())
    }

    /// 删除 `path` 指示的文件或空目录。
    /// 目录项即刻摘除，扇区回收推迟到最后一个打开者关闭；
    /// 非空目录与根目录拒绝删除。
    pub fn remove(&self, cwd: &Dir, path: &str) -> Result<(), Error> {
        let (dir, leaf) = path::resolve(self, cwd, path)?;

        if leaf == SELF_NAME {
            // 带尾分隔符的路径指向目录自身，需回到上级目录摘除
            let target = dir;
            let parent_sector = target.lookup(PARENT_NAME).ok_or(Error::NotFound)?;
            let parent = Dir::new(self.inodes.open(parent_sector))?;
            let name = parent
                .entry_name_of(target.inode().inumber())
                .ok_or(Error::NotFound)?;
            return self.remove_from(&parent, &name);
        }

        self.remove_from(&dir, leaf)
    }

    /// 所有脏数据与空闲图落盘
    pub fn flush(&self) {
        let bytes = self.free_map.lock().to_bytes();
        let map_inode = self.inodes.open(FREE_MAP_SECTOR);
        let written = map_inode.write_at(0, &bytes);
        debug_assert_eq!(written, bytes.len());
        self.cache.flush_all();
    }

    /// 关停文件存储；落盘后整个实例失效
    pub fn close(self) {
        self.flush();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// 当前空闲扇区数
    pub fn free_sectors(&self) -> u32 {
        self.free_map.lock().free_count()
    }
}

impl FileStore {
    fn assemble(cache: Arc<BufferCache>, free_map: FreeMap) -> Self {
        let free_map = Arc::new(Mutex::new(free_map));
        let inodes = InodeTable::new(cache.clone(), free_map.clone());
        Self {
            cache,
            free_map,
            inodes,
        }
    }

    pub(crate) fn open_inode(&self, sector: u32) -> Inode {
        self.inodes.open(sector)
    }

    fn remove_from(&self, dir: &Dir, name: &str) -> Result<(), Error> {
        if name == SELF_NAME || name == PARENT_NAME {
            return Err(Error::NotFound);
        }

        let sector = dir.lookup(name).ok_or(Error::NotFound)?;
        let inode = self.inodes.open(sector);

        if inode.is_dir() {
            let target = Dir::new(inode.clone())?;
            if !target.is_empty() {
                return Err(Error::DirectoryNotEmpty);
            }
        }

        dir.remove_entry(name)?;
        inode.remove();
        Ok(())
    }

    /// 回滚一个尚未挂进目录的 inode：退掉数据块并归还自身扇区
    fn discard_inode(&self, sector: u32) {
        let mut disk_inode = self.cache.with(sector, DiskInode::clone);
        let mut free_map = self.free_map.lock();
        disk_inode
            .resize(0, &self.cache, &mut free_map)
            .expect("shrink never fails");
        free_map.release(sector, 1);
    }
}
