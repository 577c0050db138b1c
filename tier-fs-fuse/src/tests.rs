use std::sync::Arc;
use std::thread;

use tier_fs::{BufferCache, Dir, Error, FileStore, StatKind, SECTOR_SIZE};

use crate::MemDisk;

fn new_store(sectors: u32) -> (Arc<MemDisk>, FileStore) {
    let disk = Arc::new(MemDisk::new(sectors as usize));
    let store = FileStore::format(disk.clone(), sectors).unwrap();
    (disk, store)
}

fn root(store: &FileStore) -> Dir {
    store.root_dir()
}

/* 块缓存 */

#[test]
fn cache_coherence_across_eviction() {
    // 200 distinct sectors against 64 slots forces plenty of evictions
    let disk = Arc::new(MemDisk::new(256));
    let cache = BufferCache::new(disk);

    for sector in 0..200u32 {
        let buf = [sector as u8; SECTOR_SIZE];
        cache.write(sector, &buf);
    }

    let mut buf = [0; SECTOR_SIZE];
    for sector in 0..200u32 {
        cache.read(sector, &mut buf);
        assert_eq!(buf, [sector as u8; SECTOR_SIZE], "sector {sector}");
    }
}

#[test]
fn cache_lru_victim_selection() {
    let disk = Arc::new(MemDisk::new(256));
    let cache = BufferCache::new(disk.clone());

    let mut buf = [0; SECTOR_SIZE];
    for sector in 0..64u32 {
        cache.read(sector, &mut buf);
        assert_eq!(disk.reads_of(sector as usize), 1);
    }

    // sector 0 is touched, sector 1 becomes the oldest
    cache.read(0, &mut buf);
    cache.read(100, &mut buf);

    cache.read(0, &mut buf);
    assert_eq!(disk.reads_of(0), 1, "recently touched sector was evicted");
    cache.read(1, &mut buf);
    assert_eq!(disk.reads_of(1), 2, "least recently used sector survived");
}

#[test]
fn cache_write_back_is_deferred() {
    let disk = Arc::new(MemDisk::new(256));
    let cache = BufferCache::new(disk.clone());

    cache.write(5, &[0xAB; SECTOR_SIZE]);
    assert_eq!(disk.writes_of(5), 0);

    cache.flush_all();
    assert_eq!(disk.writes_of(5), 1);

    // an eviction storm must write the dirty sector back before reuse
    cache.write(7, &[0x17; SECTOR_SIZE]);
    let mut buf = [0; SECTOR_SIZE];
    for sector in 100..200u32 {
        cache.read(sector, &mut buf);
    }
    assert_eq!(disk.writes_of(7), 1);
    cache.read(7, &mut buf);
    assert_eq!(buf, [0x17; SECTOR_SIZE]);
}

#[test]
fn cache_counters_add_up() {
    let disk = Arc::new(MemDisk::new(256));
    let cache = BufferCache::new(disk);

    let mut buf = [0; SECTOR_SIZE];
    cache.read(3, &mut buf);
    cache.read(3, &mut buf);
    cache.read(4, &mut buf);

    let stats = cache.stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.device_reads, 2);
}

/* 文件读写 */

#[test]
fn create_write_read_roundtrip() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    let file = store.create(&root, "hello", 0).unwrap();
    let data = b"tier-fs says hello";
    assert_eq!(file.write_at(0, data), data.len());

    let mut buf = vec![0; data.len()];
    assert_eq!(file.read_at(0, &mut buf), data.len());
    assert_eq!(&buf, data);

    // a second handle opened by path shares the same bytes
    let reopened = store.open(&root, "/hello").unwrap();
    assert_eq!(reopened.inumber(), file.inumber());
    let mut buf = vec![0; data.len()];
    assert_eq!(reopened.read_at(0, &mut buf), data.len());
    assert_eq!(&buf, data);
}

#[test]
fn byte_at_a_time_writes_coalesce() {
    let (_, store) = new_store(8192);
    let root = root(&store);
    let file = store.create(&root, "big", 0).unwrap();

    let before = store.cache_stats().device_writes;
    for offset in 0..64 * 1024usize {
        let byte = [(offset % 251) as u8];
        assert_eq!(file.write_at(offset, &byte), 1);
    }
    store.flush();
    let written = store.cache_stats().device_writes - before;

    // 64 KiB spans 128 sectors; the cache must coalesce the 65536
    // single-byte writes down to that order of magnitude
    assert!(written >= 128, "only {written} device writes");
    assert!(written < 400, "{written} device writes, coalescing failed");

    for offset in (0..64 * 1024usize).step_by(1021) {
        let mut byte = [0];
        assert_eq!(file.read_at(offset, &mut byte), 1);
        assert_eq!(byte[0], (offset % 251) as u8, "offset {offset}");
    }
}

#[test]
fn survives_remount() {
    let disk = Arc::new(MemDisk::new(4096));
    let store = FileStore::format(disk.clone(), 4096).unwrap();
    let root = store.root_dir();

    store.mkdir(&root, "sub").unwrap();
    let file = store.create(&root, "sub/keep", 0).unwrap();
    let data: Vec<u8> = (0..40_000).map(|i| (i % 241) as u8).collect();
    assert_eq!(file.write_at(0, &data), data.len());
    let free_before = store.free_sectors();
    drop(file);
    drop(root);
    store.close();

    let store = FileStore::mount(disk);
    let root = store.root_dir();
    assert_eq!(store.free_sectors(), free_before);
    let file = store.open(&root, "/sub/keep").unwrap();
    assert_eq!(file.length(), data.len() as u64);
    let mut buf = vec![0; data.len()];
    assert_eq!(file.read_at(0, &mut buf), data.len());
    assert_eq!(buf, data);
}

#[test]
fn doubly_indirect_tier_reachable() {
    // 300 data blocks reach past the single-indirect bound of 250
    let (_, store) = new_store(2048);
    let root = root(&store);
    let file = store.create(&root, "deep", 0).unwrap();

    let len = 300 * SECTOR_SIZE;
    let chunk: Vec<u8> = (0..4096).map(|i| (i % 239) as u8).collect();
    let mut offset = 0;
    while offset < len {
        let n = chunk.len().min(len - offset);
        assert_eq!(file.write_at(offset, &chunk[..n]), n);
        offset += n;
    }
    assert_eq!(file.length() as usize, len);

    for probe in [0, 121 * SECTOR_SIZE, 249 * SECTOR_SIZE, 299 * SECTOR_SIZE + 511] {
        let mut byte = [0];
        assert_eq!(file.read_at(probe, &mut byte), 1);
        assert_eq!(byte[0], (probe % 4096 % 239) as u8, "offset {probe}");
    }

    // shrinking back releases every data and index sector
    let free_small = {
        file.truncate(SECTOR_SIZE as u64).unwrap();
        store.free_sectors()
    };
    file.truncate(len as u64).unwrap();
    assert!(store.free_sectors() < free_small);
    file.truncate(SECTOR_SIZE as u64).unwrap();
    assert_eq!(store.free_sectors(), free_small);
}

#[test]
fn reads_stop_at_end_of_file() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    let len = 1000;
    let file = store.create(&root, "short", len as u64).unwrap();
    assert_eq!(file.write_at(len - 1, &[0xAB]), 1);

    let mut byte = [0];
    assert_eq!(file.read_at(len - 1, &mut byte), 1);
    assert_eq!(byte[0], 0xAB);

    // at or past the end there is nothing, not garbage
    assert_eq!(file.read_at(len, &mut byte), 0);
    assert_eq!(file.read_at(5000, &mut byte), 0);

    // a fresh file reads back as zeroes
    let mut buf = vec![0xFF; len];
    assert_eq!(file.read_at(0, &mut buf), len);
    assert!(buf[..len - 1].iter().all(|&b| b == 0));
}

#[test]
fn failed_grow_rolls_back_completely() {
    let (_, store) = new_store(128);
    let root = root(&store);

    let free = store.free_sectors();
    // 125 data blocks plus an index block cannot fit
    assert_eq!(
        store.create(&root, "big", 125 * SECTOR_SIZE as u64).unwrap_err(),
        Error::NoSpace
    );
    assert_eq!(store.free_sectors(), free);
    assert!(store.open(&root, "big").is_err());

    let file = store.create(&root, "f", 0).unwrap();
    let free = store.free_sectors();
    let huge = vec![0u8; free as usize * SECTOR_SIZE + SECTOR_SIZE];
    assert_eq!(file.write_at(0, &huge), 0);
    assert_eq!(file.length(), 0);
    assert_eq!(store.free_sectors(), free);

    // the store keeps working after the failure
    assert_eq!(file.write_at(0, &[1; 512]), 512);
    assert_eq!(file.length(), 512);
}

/* 目录与路径 */

#[test]
fn paths_resolve_identically_from_root_and_cwd() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    store.mkdir(&root, "/a").unwrap();
    store.mkdir(&root, "/a/b").unwrap();
    store.create(&root, "/a/b/c", 0).unwrap();

    let cwd = store.open_dir(&root, "/a").unwrap();
    let absolute = store.open(&root, "/a/b/c").unwrap();
    let relative = store.open(&cwd, "b/c").unwrap();
    assert_eq!(absolute.inumber(), relative.inumber());

    // "." and ".." walk like any other component
    let via_dots = store.open(&cwd, "./b/../b/c").unwrap();
    assert_eq!(via_dots.inumber(), absolute.inumber());
}

#[test]
fn trailing_separator_names_the_directory_itself() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    store.mkdir(&root, "a").unwrap();
    store.mkdir(&root, "a/b").unwrap();

    let plain = store.open(&root, "/a/b").unwrap();
    let trailing = store.open(&root, "/a/b/").unwrap();
    assert!(trailing.is_dir());
    assert_eq!(plain.inumber(), trailing.inumber());

    let slash = store.open(&root, "/").unwrap();
    assert_eq!(slash.inumber(), root.inode().inumber());
}

#[test]
fn resolution_failures() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    store.mkdir(&root, "a").unwrap();
    store.create(&root, "a/f", 0).unwrap();

    assert_eq!(store.open(&root, "missing").unwrap_err(), Error::NotFound);
    assert_eq!(store.open(&root, "a/x/y").unwrap_err(), Error::NotFound);
    // a file in directory position fails the walk
    assert_eq!(
        store.open(&root, "a/f/deeper").unwrap_err(),
        Error::NotADirectory
    );
    assert_eq!(store.open(&root, "").unwrap_err(), Error::NotFound);
}

#[test]
fn removed_cwd_stops_relative_resolution() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    store.mkdir(&root, "d").unwrap();
    let cwd = store.open_dir(&root, "d").unwrap();
    store.remove(&root, "d").unwrap();

    assert_eq!(store.open(&cwd, "x").unwrap_err(), Error::NotFound);
    assert_eq!(store.create(&cwd, "x", 0).unwrap_err(), Error::NotFound);
    // absolute paths do not depend on the dead directory
    assert!(store.open(&cwd, "/").is_ok());
}

#[test]
fn directory_listing_and_limits() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    store.mkdir(&root, "a").unwrap();
    store.create(&root, "x", 0).unwrap();
    store.create(&root, "y", 0).unwrap();

    let mut names = store.read_dir(&root, "/").unwrap();
    names.sort();
    assert_eq!(names, ["a", "x", "y"]);
    assert!(store.read_dir(&root, "a").unwrap().is_empty());

    assert_eq!(store.create(&root, "x", 0).unwrap_err(), Error::AlreadyExists);
    assert_eq!(store.mkdir(&root, "a").unwrap_err(), Error::AlreadyExists);
    assert_eq!(store.create(&root, "a/", 0).unwrap_err(), Error::AlreadyExists);

    let long = "n".repeat(27);
    assert_eq!(
        store.create(&root, &long, 0).unwrap_err(),
        Error::NameTooLong
    );
}

#[test]
fn remove_semantics() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    store.mkdir(&root, "d").unwrap();
    store.create(&root, "d/f", 0).unwrap();

    assert_eq!(
        store.remove(&root, "d").unwrap_err(),
        Error::DirectoryNotEmpty
    );
    store.remove(&root, "d/f").unwrap();
    // trailing separator variant reaches the parent through ".."
    store.remove(&root, "d/").unwrap();
    assert_eq!(store.open(&root, "d").unwrap_err(), Error::NotFound);

    assert_eq!(store.remove(&root, "/").unwrap_err(), Error::NotFound);
    assert_eq!(store.remove(&root, "ghost").unwrap_err(), Error::NotFound);
}

#[test]
fn removal_is_deferred_until_last_close() {
    let (_, store) = new_store(1024);
    let root = root(&store);

    // first cycle lets the root directory reach its final size
    store.create(&root, "warmup", 0).unwrap();
    store.remove(&root, "warmup").unwrap();

    let baseline = store.free_sectors();
    let file = store.create(&root, "t", 4 * SECTOR_SIZE as u64).unwrap();
    assert_eq!(store.free_sectors(), baseline - 5);

    store.remove(&root, "t").unwrap();
    // the open handle keeps the bytes alive
    assert!(file.is_removed());
    let mut buf = [0; 16];
    assert_eq!(file.read_at(0, &mut buf), 16);
    assert_eq!(store.free_sectors(), baseline - 5);

    drop(file);
    assert_eq!(store.free_sectors(), baseline);
}

#[test]
fn deny_write_is_counted() {
    let (_, store) = new_store(1024);
    let root = root(&store);
    let file = store.create(&root, "exe", 0).unwrap();
    assert_eq!(file.write_at(0, b"ok"), 2);

    file.deny_write();
    file.deny_write();
    assert_eq!(file.write_at(0, b"no"), 0);
    assert_eq!(file.truncate(0).unwrap_err(), Error::WriteDenied);

    file.allow_write();
    assert_eq!(file.write_at(0, b"no"), 0, "one denial still active");
    file.allow_write();
    assert_eq!(file.write_at(2, b"!!"), 2);
}

#[test]
fn stat_reports_kind_and_size() {
    let (_, store) = new_store(1024);
    let root = root(&store);
    store.mkdir(&root, "d").unwrap();
    let file = store.create(&root, "f", 100).unwrap();

    let stat = file.stat();
    assert_eq!(stat.kind, StatKind::FILE);
    assert_eq!(stat.size, 100);
    assert_eq!(stat.inode, file.inumber() as u64);

    let dir = store.open(&root, "d").unwrap();
    assert_eq!(dir.stat().kind, StatKind::DIR);
}

/* 并发 */

#[test]
fn parallel_writers_on_distinct_files() {
    let (_, store) = new_store(4096);
    let store = Arc::new(store);
    let root = store.root_dir();

    let mut handles = Vec::new();
    for i in 0..4 {
        let store = store.clone();
        let root = root.clone();
        handles.push(thread::spawn(move || {
            let name = format!("t{i}");
            let file = store.create(&root, &name, 0).unwrap();
            let data: Vec<u8> = (0..8192).map(|b| ((b + i * 37) % 251) as u8).collect();
            assert_eq!(file.write_at(0, &data), data.len());
            let mut buf = vec![0; data.len()];
            assert_eq!(file.read_at(0, &mut buf), data.len());
            assert_eq!(buf, data);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.read_dir(&root, "/").unwrap().len(), 4);
}

#[test]
fn concurrent_extension_serializes() {
    let (_, store) = new_store(4096);
    let store = Arc::new(store);
    let root = store.root_dir();
    store.create(&root, "shared", 0).unwrap();

    let mut handles = Vec::new();
    for i in 0..2usize {
        let store = store.clone();
        let root = root.clone();
        handles.push(thread::spawn(move || {
            let file = store.open(&root, "shared").unwrap();
            let data = vec![i as u8 + 1; 8192];
            assert_eq!(file.write_at(i * 8192, &data), data.len());
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let file = store.open(&root, "shared").unwrap();
    assert_eq!(file.length(), 16384);
    let mut buf = vec![0; 16384];
    assert_eq!(file.read_at(0, &mut buf), 16384);
    assert!(buf[..8192].iter().all(|&b| b == 1));
    assert!(buf[8192..].iter().all(|&b| b == 2));
}
