#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::{Read, Write};
use std::io::{Seek, SeekFrom};
use std::sync::Mutex;

use block_dev::BlockDevice;
use tier_fs::SECTOR_SIZE;

pub struct BlockFile(pub Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(file.read(buf).unwrap(), SECTOR_SIZE, "not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(
            file.write(buf).unwrap(),
            SECTOR_SIZE,
            "not a complete block!"
        );
    }
}

/// In-memory block device, with per-sector transfer counters so tests can
/// observe which accesses actually reached the device.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    reads: Mutex<Vec<u64>>,
    writes: Mutex<Vec<u64>>,
}

impl MemDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; sectors * SECTOR_SIZE]),
            reads: Mutex::new(vec![0; sectors]),
            writes: Mutex::new(vec![0; sectors]),
        }
    }

    pub fn reads_of(&self, sector: usize) -> u64 {
        self.reads.lock().unwrap()[sector]
    }

    pub fn writes_of(&self, sector: usize) -> u64 {
        self.writes.lock().unwrap()[sector]
    }

    pub fn total_reads(&self) -> u64 {
        self.reads.lock().unwrap().iter().sum()
    }

    pub fn total_writes(&self) -> u64 {
        self.writes.lock().unwrap().iter().sum()
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let data = self.data.lock().unwrap();
        let start = block_id * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        self.reads.lock().unwrap()[block_id] += 1;
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut data = self.data.lock().unwrap();
        let start = block_id * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        self.writes.lock().unwrap()[block_id] += 1;
    }
}
