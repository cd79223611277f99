use std::collections::{HashSet, VecDeque};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::JobError;
use crate::job_store::{JobStateStore, MarkerGuard};
use crate::library::{BookId, BookStore};
use crate::parser::ChapterDetector;
use crate::reaper::{ReapedMarker, StalenessReaper};
use crate::task_launcher::panic_message;

/// 预计等待时间下限
const MIN_WAIT: Duration = Duration::from_secs(120);
/// 每 MiB 文本的预计解析时间（秒）
const SECS_PER_MIB: f64 = 15.0;

/// 队列条目
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub book_id: BookId,
    pub enqueued_at: DateTime<Utc>,
}

/// 工作线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Running(BookId),
}

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 新加入队列，位置从 1 开始
    Queued { position: usize },
    /// 已经在队列中
    AlreadyQueued { position: usize },
    /// 正在解析
    AlreadyRunning,
}

/// 单本书的解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Extracted { chapters: usize },
    /// 目录已存在，跳过
    AlreadyExtracted,
    /// 标记文件已存在，跳过
    MarkerPresent,
    Failed(String),
}

/// 面向请求方的解析状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Ready,
    /// position 为 0 表示正在解析
    Queued { position: usize, wait: Duration },
    Pending,
}

/// 一次唤醒处理的所有任务，按完成顺序排列
#[derive(Debug, Default)]
pub struct DrainReport {
    pub processed: Vec<(BookId, JobOutcome)>,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<QueueEntry>,
    current: Option<BookId>,
}

impl QueueState {
    fn position(&self, book_id: BookId) -> Option<usize> {
        self.queue
            .iter()
            .position(|entry| entry.book_id == book_id)
            .map(|i| i + 1)
    }

    fn live_set(&self) -> HashSet<BookId> {
        self.queue
            .iter()
            .map(|entry| entry.book_id)
            .chain(self.current)
            .collect()
    }
}

/// 根据文件大小估算等待时间：每 MiB 15 秒，最少 120 秒
pub fn estimate_wait(file_size: u64) -> Duration {
    let estimate = Duration::from_secs_f64(file_size as f64 / (1024.0 * 1024.0) * SECS_PER_MIB);
    estimate.max(MIN_WAIT)
}

/// 目录解析工作线程
///
/// 同一时刻最多只有一个线程在处理队列：
/// - `enqueue` 只负责排队，不执行任何解析
/// - `trigger` 在空闲时原子地取出队首并进入运行状态，然后依次处理队列直到为空
/// - 运行期间新加入的书籍由同一次唤醒处理，其他 `trigger` 调用直接返回
pub struct ExtractionWorker {
    state: Mutex<QueueState>,
    store: JobStateStore,
    reaper: StalenessReaper,
    detector: ChapterDetector,
    books: Arc<dyn BookStore>,
}

impl ExtractionWorker {
    pub fn new(
        store: JobStateStore,
        reaper: StalenessReaper,
        detector: ChapterDetector,
        books: Arc<dyn BookStore>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store,
            reaper,
            detector,
            books,
        }
    }

    pub fn store(&self) -> &JobStateStore {
        &self.store
    }

    /// 将书籍加入解析队列
    ///
    /// 已在队列中或正在解析的书籍不会重复加入
    pub fn enqueue(&self, book_id: BookId) -> EnqueueOutcome {
        let mut state = self.lock_state();

        if state.current == Some(book_id) {
            return EnqueueOutcome::AlreadyRunning;
        }
        if let Some(position) = state.position(book_id) {
            return EnqueueOutcome::AlreadyQueued { position };
        }

        state.queue.push_back(QueueEntry {
            book_id,
            enqueued_at: Utc::now(),
        });
        info!(book_id, "列入解析队列");
        EnqueueOutcome::Queued {
            position: state.queue.len(),
        }
    }

    /// 唤醒工作线程
    ///
    /// 阻塞执行，应在后台线程中调用
    ///
    /// # 返回
    /// - Some(report): 本次调用处理了队列
    /// - None: 已有线程在处理，或队列为空
    pub fn trigger(&self) -> Option<DrainReport> {
        let (mut book_id, live) = {
            let mut state = self.lock_state();
            if state.current.is_some() {
                return None;
            }
            let entry = state.queue.pop_front()?;
            state.current = Some(entry.book_id);
            (entry.book_id, state.live_set())
        };

        // 此时没有任务在执行，不属于队列的标记文件都是孤儿
        self.reaper.reap(&live);

        let mut report = DrainReport::default();
        loop {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.run_job(book_id))) {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(book_id, "目录解析任务 panic: {}", message);
                    JobOutcome::Failed(message)
                }
            };
            report.processed.push((book_id, outcome));

            let mut state = self.lock_state();
            match state.queue.pop_front() {
                Some(next) => {
                    state.current = Some(next.book_id);
                    book_id = next.book_id;
                }
                None => {
                    state.current = None;
                    break;
                }
            }
        }

        info!(count = report.processed.len(), "解析队列已清空");
        Some(report)
    }

    /// 启动时清理上次进程留下的标记文件
    ///
    /// 此时还没有任务在执行，不属于队列的标记文件都是孤儿
    pub fn recover(&self) -> Vec<ReapedMarker> {
        let live = self.lock_state().live_set();
        let reaped = self.reaper.reap(&live);
        if !reaped.is_empty() {
            info!(count = reaped.len(), "启动时清理孤儿标记文件");
        }
        reaped
    }

    pub fn state(&self) -> WorkerState {
        match self.lock_state().current {
            Some(book_id) => WorkerState::Running(book_id),
            None => WorkerState::Idle,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// 队列位置：正在解析为 0，排队中从 1 开始，其他为 None
    pub fn position(&self, book_id: BookId) -> Option<usize> {
        let state = self.lock_state();
        if state.current == Some(book_id) {
            return Some(0);
        }
        state.position(book_id)
    }

    /// 查询书籍的解析状态，不产生副作用
    pub fn status(&self, book_id: BookId) -> JobStatus {
        if self.store.has_index(book_id) {
            return JobStatus::Ready;
        }
        match self.position(book_id) {
            Some(position) => JobStatus::Queued {
                position,
                wait: estimate_wait(self.txt_size(book_id).unwrap_or(0)),
            },
            None => JobStatus::Pending,
        }
    }

    /// 书籍 txt 文件大小，查询失败时返回 None
    pub(crate) fn txt_size(&self, book_id: BookId) -> Option<u64> {
        let book = self.books.get_book(book_id).ok()??;
        let path = book.format_path("txt")?;
        std::fs::metadata(path).ok().map(|m| m.len())
    }

    fn run_job(&self, book_id: BookId) -> JobOutcome {
        if self.store.has_index(book_id) {
            info!(book_id, "目录已存在，跳过解析");
            return JobOutcome::AlreadyExtracted;
        }

        let guard = match self.acquire_marker(book_id) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                warn!(book_id, "标记文件已存在，跳过解析");
                return JobOutcome::MarkerPresent;
            }
            Err(e) => {
                error!(book_id, "创建标记文件失败: {}", e);
                return JobOutcome::Failed(e.to_string());
            }
        };

        let result = self.extract(book_id);
        drop(guard);

        match result {
            Ok(chapters) => {
                info!(book_id, chapters, "目录解析完成");
                JobOutcome::Extracted { chapters }
            }
            Err(e) => {
                error!(book_id, "目录解析失败: {}", e);
                JobOutcome::Failed(e.to_string())
            }
        }
    }

    /// 创建标记文件；已存在但超过租约时回收后重新创建
    ///
    /// 队列由单个线程处理，已有的标记文件不属于本进程中的任何任务
    fn acquire_marker(&self, book_id: BookId) -> io::Result<Option<MarkerGuard<'_>>> {
        if let Some(guard) = MarkerGuard::acquire(&self.store, book_id)? {
            return Ok(Some(guard));
        }
        match self.reaper.reclaim_expired(book_id) {
            Some(_) => MarkerGuard::acquire(&self.store, book_id),
            None => Ok(None),
        }
    }

    fn extract(&self, book_id: BookId) -> Result<usize, JobError> {
        let book = self
            .books
            .get_book(book_id)?
            .ok_or(JobError::NotFound(book_id))?;
        let path = book
            .format_path("txt")
            .ok_or(JobError::InvalidFormat(book_id))?;

        info!(book_id, "开始解析目录: {:?}", path);
        let records = self.detector.detect_file(path)?;
        self.store.write_index(book_id, &records)?;
        Ok(records.len())
    }

    /// 获取状态锁
    ///
    /// 状态只在锁内做简单的增删，即使持锁线程 panic 也保持一致，直接取回
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
