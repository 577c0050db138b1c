mod cli;

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use cli::Cli;
use tier_fs::{Dir, FileStore, SECTOR_SIZE};
use tier_fs_fuse::BlockFile;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    println!("source={:?}\nimage={:?}", cli.source, cli.image);

    let block_file = Arc::new(BlockFile(Mutex::new({
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&cli.image)?;
        fd.set_len(cli.sectors as u64 * SECTOR_SIZE as u64)?;

        fd
    })));

    let store = FileStore::format(block_file, cli.sectors).expect("formatting failed");
    let root = store.root_dir();
    pack(&store, &root, &cli.source)?;
    store.close();

    Ok(())
}

/// Mirror one host directory level into the image, recursing into
/// subdirectories.
fn pack(store: &FileStore, dir: &Dir, host: &Path) -> io::Result<()> {
    for item in fs::read_dir(host)? {
        let item = item?;
        let name = item
            .file_name()
            .into_string()
            .expect("file name is not unicode");

        if item.file_type()?.is_dir() {
            store
                .mkdir(dir, &name)
                .unwrap_or_else(|e| panic!("mkdir {name:?} failed: {e:?}"));
            let sub = store
                .open_dir(dir, &name)
                .expect("directory was just created");
            pack(store, &sub, &item.path())?;
        } else {
            let data = fs::read(item.path())?;
            println!("file: {name:?} ({} bytes)", data.len());
            let inode = store
                .create(dir, &name, 0)
                .unwrap_or_else(|e| panic!("create {name:?} failed: {e:?}"));
            assert_eq!(inode.write_at(0, &data), data.len());
        }
    }

    Ok(())
}
