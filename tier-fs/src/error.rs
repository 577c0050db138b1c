#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    AlreadyExists,
    NotFound,
    IsADirectory,
    NotADirectory,
    DirectoryNotEmpty,
    NameTooLong,
    /// 空闲扇区耗尽，操作已整体回滚
    NoSpace,
    WriteDenied,
}
