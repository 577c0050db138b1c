//! # 路径解析层
//!
//! 把斜杠分隔的路径解析为"所在目录 + 末项名"。
//! 绝对路径从根目录出发，相对路径从调用方给定的当前目录出发；
//! 末项一律不解析，交由调用方创建、删除或打开。

use crate::dir::{Dir, SELF_NAME};
use crate::error::Error;
use crate::store::FileStore;

/// 解析 `path`，返回末项所在的目录与末项名。
///
/// 除末项外的每一段都必须经查找得到一个目录，否则解析失败；
/// 路径以分隔符结尾(或只有分隔符)表示目录自身，
/// 此时末项名报告为"."，所在目录就是目标目录。
/// 相对解析的起点已被标记删除时同样失败。
pub(crate) fn resolve<'p>(
    store: &FileStore,
    start: &Dir,
    path: &'p str,
) -> Result<(Dir, &'p str), Error> {
    if path.is_empty() {
        return Err(Error::NotFound);
    }

    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/');

    // 再打开一份起点，防止解析中途目录被并发删除后失效
    let mut dir = if absolute {
        store.root_dir()
    } else {
        if start.inode().is_removed() {
            return Err(Error::NotFound);
        }
        start.clone()
    };

    // 连续的分隔符视同一个
    let mut components = path.split('/').filter(|c| !c.is_empty());

    let Some(mut leaf) = components.next() else {
        // 路径只有分隔符，指向起点目录自身
        return Ok((dir, SELF_NAME));
    };

    for component in components {
        dir = descend(store, &dir, leaf)?;
        leaf = component;
    }

    if trailing {
        dir = descend(store, &dir, leaf)?;
        leaf = SELF_NAME;
    }

    Ok((dir, leaf))
}

/// 走进下一级：`name` 必须查得到且确实是目录
fn descend(store: &FileStore, dir: &Dir, name: &str) -> Result<Dir, Error> {
    let sector = dir.lookup(name).ok_or(Error::NotFound)?;
    Dir::new(store.open_inode(sector))
}
