use std::mem;

use tier_fs::{layout::DiskInode, DirEntry, SECTOR_SIZE};

#[test]
fn on_disk_layout() {
    // an inode must occupy exactly one sector
    assert_eq!(SECTOR_SIZE, mem::size_of::<DiskInode>());
    assert_eq!(DirEntry::SIZE, mem::size_of::<DirEntry>());
    assert_eq!(32, DirEntry::SIZE);
}
