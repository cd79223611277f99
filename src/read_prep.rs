//! 在线阅读准备
//!
//! 阅读器直接读取解压后的 epub 目录 `extract_path/<book_id>`。
//! 非 epub 书籍先转换为 epub 并登记到书库，再解压到同一目录

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context};
use chrono::Utc;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::config::Settings;
use crate::converter::{progress_log_path, ProcessRunner};
use crate::error::ReadError;
use crate::job_store::JobStateStore;
use crate::library::{BookId, BookRecord, BookStore, MessageLevel, MessageSink};
use crate::task_launcher::TaskLauncher;

/// 在线阅读器能处理的格式，按优先级排列
const READ_FORMATS: [&str; 5] = ["epub", "mobi", "azw", "azw3", "txt"];
const TARGET_FORMAT: &str = "epub";
/// epub 入口文件，解压时最后写入
const CONTAINER_FILE: &str = "META-INF/container.xml";

const CONVERT_FAILED_MSG: &str = "文件格式转换失败，请联系管理员。";

/// 阅读请求的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPlan {
    /// 已解压或已有目录，可以直接阅读
    Ready,
    /// 后台正在准备，`format` 为使用的源格式
    Preparing { format: String },
    /// 只有 pdf，交给 pdf 阅读器
    Pdf { path: PathBuf },
}

/// 在线阅读准备
///
/// 同一本书同时只有一个准备任务
pub struct ReadPreparer {
    books: Arc<dyn BookStore>,
    messages: Arc<dyn MessageSink>,
    runner: ProcessRunner,
    store: JobStateStore,
    convert_path: PathBuf,
    in_flight: Mutex<HashSet<BookId>>,
}

impl ReadPreparer {
    pub fn new(
        books: Arc<dyn BookStore>,
        messages: Arc<dyn MessageSink>,
        runner: ProcessRunner,
        store: JobStateStore,
        settings: &Settings,
    ) -> Self {
        Self {
            books,
            messages,
            runner,
            store,
            convert_path: settings.convert_path.clone(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// 书籍是否可以阅读
    ///
    /// epub 已解压（存在 `META-INF/container.xml`），或 txt 书籍已有目录
    pub fn is_ready(&self, book_id: BookId) -> bool {
        self.store.job_dir(book_id).join(CONTAINER_FILE).is_file() || self.store.has_index(book_id)
    }

    /// 发起阅读准备
    ///
    /// # 参数
    /// - `launcher`: 后台任务启动器
    /// - `book_id`: 书籍 ID
    ///
    /// # 返回
    /// 处理方式；书籍不存在或没有可阅读的格式时返回错误
    pub fn prepare(
        self: &Arc<Self>,
        launcher: &TaskLauncher,
        book_id: BookId,
    ) -> Result<ReadPlan, ReadError> {
        let book = self
            .books
            .get_book(book_id)?
            .ok_or(ReadError::NotFound(book_id))?;

        let Some(format) = READ_FORMATS.iter().find(|f| book.has_format(f)) else {
            return match book.format_path("pdf") {
                Some(path) => Ok(ReadPlan::Pdf {
                    path: path.to_path_buf(),
                }),
                None => Err(ReadError::UnsupportedFormat),
            };
        };
        let format = format.to_string();

        if self.is_ready(book_id) {
            return Ok(ReadPlan::Ready);
        }
        if !self.lock_in_flight().insert(book_id) {
            return Ok(ReadPlan::Preparing { format });
        }

        let preparer = self.clone();
        let source_format = format.clone();
        launcher.launch(format!("extract-book-{}", book_id), async move {
            let _slot = InFlightSlot {
                preparer: &preparer,
                book_id,
            };
            preparer.extract_book(&book, &source_format).await
        });

        info!(book_id, format = %format, "阅读准备任务已提交");
        Ok(ReadPlan::Preparing { format })
    }

    /// 转换（如有需要）并解压
    pub async fn extract_book(&self, book: &BookRecord, format: &str) -> anyhow::Result<()> {
        let source = book
            .format_path(format)
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("书籍 {} 缺少 {} 格式", book.id, format))?;
        let dir = self.store.job_dir(book.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("创建解压目录失败: {:?}", dir))?;
        if dir.join(CONTAINER_FILE).is_file() {
            return Ok(());
        }
        let log_path = progress_log_path(&self.convert_path, book.id);

        let converted = if format == TARGET_FORMAT {
            None
        } else {
            let output = self.convert_path.join(format!(
                "book-{}-{}.{}",
                book.id,
                Utc::now().timestamp(),
                TARGET_FORMAT
            ));
            info!(book_id = book.id, "convert book: {:?} => {:?}, progress: {:?}", source, output, log_path);

            if let Err(e) = self.runner.run(&source, &output, &log_path).await {
                self.messages
                    .add_msg(MessageLevel::Danger, CONVERT_FAILED_MSG.to_string());
                return Err(e).with_context(|| format!("书籍 {} 格式转换失败", book.id));
            }

            let books = self.books.clone();
            let (book_id, registered) = (book.id, output.clone());
            tokio::task::spawn_blocking(move || books.add_format(book_id, TARGET_FORMAT, &registered))
                .await??;
            Some(output)
        };

        let epub = converted.clone().unwrap_or(source);
        let (target, log) = (dir.clone(), log_path);
        let count = tokio::task::spawn_blocking(move || unpack_epub(&epub, &target, &log)).await??;
        info!(book_id = book.id, count, "extract book into {:?}", dir);

        if let Some(path) = converted {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(book_id = book.id, "删除转换中间文件失败 {:?}: {}", path, e);
            }
        }
        Ok(())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<BookId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 任务结束（包括 panic）时释放书籍
struct InFlightSlot<'a> {
    preparer: &'a ReadPreparer,
    book_id: BookId,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.preparer.lock_in_flight().remove(&self.book_id);
    }
}

/// 解压 epub，每个文件追加一行到进度日志
///
/// `META-INF/container.xml` 最后写入，它存在即表示解压完整
///
/// # 返回
/// 写出的文件数
fn unpack_epub(epub: &Path, target: &Path, log_path: &Path) -> anyhow::Result<usize> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("打开进度日志失败: {:?}", log_path))?;
    writeln!(log, "Dir: {}", target.display())?;

    let file = File::open(epub).with_context(|| format!("打开 epub 失败: {:?}", epub))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("不是有效的 epub 文件: {:?}", epub))?;

    let mut container = None;
    let mut count = 0;
    for index in 0..archive.len() {
        if archive.by_index(index)?.name() == CONTAINER_FILE {
            container = Some(index);
            continue;
        }
        if unpack_entry(&mut archive, index, target, &mut log)? {
            count += 1;
        }
    }
    if let Some(index) = container {
        if unpack_entry(&mut archive, index, target, &mut log)? {
            count += 1;
        }
    }
    Ok(count)
}

fn unpack_entry(
    archive: &mut ZipArchive<File>,
    index: usize,
    target: &Path,
    log: &mut File,
) -> anyhow::Result<bool> {
    let mut entry = archive.by_index(index)?;
    let Some(relative) = entry.enclosed_name() else {
        warn!("跳过不安全的路径: {}", entry.name());
        return Ok(false);
    };
    let out = target.join(relative);

    if entry.is_dir() {
        fs::create_dir_all(&out)?;
        return Ok(false);
    }
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&out).with_context(|| format!("写入文件失败: {:?}", out))?;
    io::copy(&mut entry, &mut file)?;
    writeln!(log, "  inflating: {}", out.display())?;
    Ok(true)
}
