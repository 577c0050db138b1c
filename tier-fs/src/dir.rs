//! # 目录层
//!
//! 目录就是数据区存放定长[`DirEntry`]数组的 inode，
//! 增删查全部化为对 inode 的字节读写加线性扫描。
//! 每个目录在创建时写入指向自身的"."与指向上级的".."两项。

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::Error;
use crate::inode::Inode;
use crate::layout::DirEntry;
use crate::layout::NAME_MAX_LEN;

/// 目录里指向自身的项名
pub const SELF_NAME: &str = ".";
/// 目录里指向上级目录的项名
pub const PARENT_NAME: &str = "..";

/// 目录句柄，包装一个目录类型的 inode
#[derive(Debug, Clone)]
pub struct Dir {
    inode: Inode,
}

impl Dir {
    pub(crate) fn new(inode: Inode) -> Result<Self, Error> {
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }
        Ok(Self { inode })
    }

    #[inline]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    #[inline]
    pub fn into_inode(self) -> Inode {
        self.inode
    }

    /// 按名字查出目录项指向的 inode 扇区号
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.find(name).map(|(_, entry)| entry.sector())
    }

    /// 挂入一条新目录项；优先重用空槽，没有空槽则在末尾追加
    pub(crate) fn add(&self, name: &str, sector: u32) -> Result<(), Error> {
        if name.is_empty() || name.len() > NAME_MAX_LEN || name.contains('/') {
            return Err(Error::NameTooLong);
        }

        let _dir_guard = self.inode.dir_lock();

        if self.find(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        let entry = DirEntry::new(name, sector);
        let offset = self.free_slot();
        if self.inode.write_at(offset, entry.as_bytes()) != DirEntry::SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// 摘除一条目录项，返回它指向的扇区号
    pub(crate) fn remove_entry(&self, name: &str) -> Result<u32, Error> {
        let _dir_guard = self.inode.dir_lock();

        let (offset, entry) = self.find(name).ok_or(Error::NotFound)?;
        self.inode.write_at(offset, &[0; DirEntry::SIZE]);
        Ok(entry.sector())
    }

    /// 列出目录项名，跳过"."与".."
    pub fn entries(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.scan(|_, entry| {
            let name = entry.name();
            if name != SELF_NAME && name != PARENT_NAME {
                names.push(name.into());
            }
            false
        });
        names
    }

    /// 目录是否只剩"."与".."两项
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.scan(|_, entry| {
            let name = entry.name();
            if name != SELF_NAME && name != PARENT_NAME {
                empty = false;
                return true;
            }
            false
        });
        empty
    }

    /// 反查指向 `sector` 的项名，"."与".."不算
    pub(crate) fn entry_name_of(&self, sector: u32) -> Option<String> {
        let mut found = None;
        self.scan(|_, entry| {
            let name = entry.name();
            if entry.sector() == sector && name != SELF_NAME && name != PARENT_NAME {
                found = Some(name.into());
                return true;
            }
            false
        });
        found
    }
}

impl Dir {
    /// 线性扫描在用的目录项；`f` 返回真则提前终止
    fn scan(&self, mut f: impl FnMut(usize, &DirEntry) -> bool) {
        let size = self.inode.length() as usize;
        let mut entry = DirEntry::default();

        for offset in (0..size).step_by(DirEntry::SIZE) {
            assert_eq!(
                self.inode.read_at(offset, entry.as_bytes_mut()),
                DirEntry::SIZE
            );
            if entry.is_in_use() && f(offset, &entry) {
                return;
            }
        }
    }

    fn find(&self, name: &str) -> Option<(usize, DirEntry)> {
        let mut found = None;
        self.scan(|offset, entry| {
            if entry.name() == name {
                found = Some((offset, entry.clone()));
                return true;
            }
            false
        });
        found
    }

    /// 寻找空槽位；找不到就以文件末尾作新槽位
    fn free_slot(&self) -> usize {
        let size = self.inode.length() as usize;
        let mut entry = DirEntry::default();

        for offset in (0..size).step_by(DirEntry::SIZE) {
            assert_eq!(
                self.inode.read_at(offset, entry.as_bytes_mut()),
                DirEntry::SIZE
            );
            if !entry.is_in_use() {
                return offset;
            }
        }

        size
    }
}
