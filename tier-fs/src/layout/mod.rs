//! # 磁盘数据结构层
//!
//! tier-fs 的磁盘布局：
//! 扇区0 空闲图 inode | 扇区1 根目录 inode | 其余扇区由分配动态决定，
//! 可能是 inode 扇区、索引块扇区或文件数据扇区。

mod dir_entry;
pub use dir_entry::DirEntry;
pub(crate) use dir_entry::NAME_MAX_LEN;

mod inode;
pub use inode::DiskInode;
pub(crate) use inode::InodeKind;
