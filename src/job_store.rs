use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::JobError;
use crate::library::BookId;
use crate::parser::ChapterRecord;

/// 解析中标记文件名
const MARKER_FILE: &str = "parse";
/// 目录结果文件名
const INDEX_FILE: &str = "content.json";

/// 任务状态存储
///
/// 每本书一个目录 `<root>/<book_id>/`：
/// - `parse`：空文件，存在即表示正在解析，修改时间为租约起点
/// - `content.json`：解析结果，存在即表示解析完成
///
/// 文件本身就是状态，进程重启后仍然有效
#[derive(Debug, Clone)]
pub struct JobStateStore {
    root: PathBuf,
}

impl JobStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, book_id: BookId) -> PathBuf {
        self.root.join(book_id.to_string())
    }

    pub fn marker_path(&self, book_id: BookId) -> PathBuf {
        self.job_dir(book_id).join(MARKER_FILE)
    }

    pub fn index_path(&self, book_id: BookId) -> PathBuf {
        self.job_dir(book_id).join(INDEX_FILE)
    }

    pub fn has_index(&self, book_id: BookId) -> bool {
        self.index_path(book_id).is_file()
    }

    pub fn has_marker(&self, book_id: BookId) -> bool {
        self.marker_path(book_id).is_file()
    }

    /// 创建标记文件
    ///
    /// 检查与创建是同一个原子操作（create_new）
    ///
    /// # 返回
    /// - Ok(true): 创建成功
    /// - Ok(false): 标记文件已存在
    pub fn create_marker(&self, book_id: BookId) -> io::Result<bool> {
        fs::create_dir_all(self.job_dir(book_id))?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.marker_path(book_id))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 删除标记文件，文件不存在时返回 Ok(false)
    pub fn remove_marker(&self, book_id: BookId) -> io::Result<bool> {
        match fs::remove_file(self.marker_path(book_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 标记文件存在了多久，没有标记文件时返回 None
    pub fn marker_age(&self, book_id: BookId) -> io::Result<Option<Duration>> {
        let metadata = match fs::metadata(self.marker_path(book_id)) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        // 修改时间在未来（时钟回拨）时按 0 处理
        let age = metadata.modified()?.elapsed().unwrap_or(Duration::ZERO);
        Ok(Some(age))
    }

    /// 列出所有带标记文件的书籍
    ///
    /// 根目录不存在时返回空列表；非数字目录名被忽略
    pub fn list_markers(&self) -> io::Result<Vec<BookId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut book_ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(book_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<BookId>().ok())
            else {
                continue;
            };
            if entry.path().join(MARKER_FILE).is_file() {
                book_ids.push(book_id);
            }
        }
        book_ids.sort_unstable();
        Ok(book_ids)
    }

    /// 写入目录结果
    ///
    /// 先写同目录下的临时文件再重命名，读者不会看到写了一半的结果
    pub fn write_index(&self, book_id: BookId, records: &[ChapterRecord]) -> Result<(), JobError> {
        let dir = self.job_dir(book_id);
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, records)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.index_path(book_id)).map_err(|e| e.error)?;
        Ok(())
    }

    /// 读取目录结果，尚未解析完成时返回 Ok(None)
    pub fn read_index(&self, book_id: BookId) -> Result<Option<Vec<ChapterRecord>>, JobError> {
        let content = match fs::read(self.index_path(book_id)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&content)?))
    }
}

/// 标记文件守卫
///
/// 创建成功后持有，离开作用域（包括出错和 panic 展开）时删除标记文件
pub(crate) struct MarkerGuard<'a> {
    store: &'a JobStateStore,
    book_id: BookId,
}

impl<'a> MarkerGuard<'a> {
    /// 尝试创建标记文件，已存在时返回 Ok(None)
    pub(crate) fn acquire(store: &'a JobStateStore, book_id: BookId) -> io::Result<Option<Self>> {
        if store.create_marker(book_id)? {
            Ok(Some(Self { store, book_id }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for MarkerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.remove_marker(self.book_id) {
            warn!(book_id = self.book_id, "删除标记文件失败: {}", e);
        }
    }
}
