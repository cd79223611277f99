/// 后台任务引擎
///
/// 把目录解析、格式转换推送和任务启动器组装在一起，供请求处理层调用。
/// 所有方法都立即返回，实际工作在后台执行

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::book_push::{BookPusher, PushPlan};
use crate::config::Settings;
use crate::converter::ProcessRunner;
use crate::error::{JobError, PushError, ReadError};
use crate::extract_queue::{estimate_wait, EnqueueOutcome, ExtractionWorker, JobStatus};
use crate::job_store::JobStateStore;
use crate::library::{BookId, BookStore, MailSender, MessageSink};
use crate::parser::{ChapterDetector, ChapterRecord, TxtParser};
use crate::read_prep::{ReadPlan, ReadPreparer};
use crate::reaper::StalenessReaper;
use crate::task_launcher::{TaskFault, TaskLauncher};

/// 目录请求结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TocRequest {
    /// 目录已解析
    Ready { content: Vec<ChapterRecord> },
    /// 已加入解析队列（正在解析时 position 为 0）
    Queued { position: usize, wait: Duration },
}

pub struct JobEngine {
    settings: Settings,
    books: Arc<dyn BookStore>,
    worker: Arc<ExtractionWorker>,
    launcher: TaskLauncher,
    /// 目录解析专用，不与格式转换争抢槽位
    extract_lane: TaskLauncher,
    pusher: Arc<BookPusher>,
    preparer: Arc<ReadPreparer>,
    txt: TxtParser,
}

impl JobEngine {
    /// 启动引擎
    ///
    /// 必须在 tokio 运行时中调用。启动时清理上次进程留下的标记文件
    ///
    /// # 返回
    /// 引擎和后台任务故障接收端
    pub fn start(
        settings: Settings,
        books: Arc<dyn BookStore>,
        mailer: Arc<dyn MailSender>,
        messages: Arc<dyn MessageSink>,
    ) -> anyhow::Result<(Self, UnboundedReceiver<TaskFault>)> {
        let handle = Handle::try_current().context("JobEngine must be started inside a tokio runtime")?;

        for dir in [&settings.extract_path, &settings.convert_path] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        }

        let rules = settings.rule_set();
        if rules.is_empty() {
            warn!("没有可用的目录规则，所有书籍都将作为单章节处理");
        }

        let store = JobStateStore::new(settings.extract_path.clone());
        let reaper = StalenessReaper::new(store.clone(), settings.marker_lease());
        let worker = Arc::new(ExtractionWorker::new(
            store.clone(),
            reaper,
            ChapterDetector::with_rules(rules),
            books.clone(),
        ));
        worker.recover();

        let (launcher, faults) = TaskLauncher::new(handle, settings.max_background_tasks);
        // 解析队列同一时刻只有一个线程在处理
        let extract_lane = launcher.lane(1);
        let pusher = Arc::new(BookPusher::new(
            books.clone(),
            mailer,
            messages.clone(),
            ProcessRunner::from_settings(&settings),
            &settings,
        ));
        let preparer = Arc::new(ReadPreparer::new(
            books.clone(),
            messages,
            ProcessRunner::from_settings(&settings),
            store,
            &settings,
        ));

        info!(
            extract_path = ?settings.extract_path,
            max_background_tasks = settings.max_background_tasks,
            "后台任务引擎已启动"
        );

        let engine = Self {
            settings,
            books,
            worker,
            launcher,
            extract_lane,
            pusher,
            preparer,
            txt: TxtParser::new(),
        };
        Ok((engine, faults))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn worker(&self) -> &Arc<ExtractionWorker> {
        &self.worker
    }

    pub fn launcher(&self) -> &TaskLauncher {
        &self.launcher
    }

    /// 查询目录状态，不会触发解析
    pub fn contents_status(&self, book_id: BookId) -> JobStatus {
        self.worker.status(book_id)
    }

    /// 请求目录
    ///
    /// 已解析时直接返回目录；否则加入解析队列并唤醒后台工作线程
    pub fn request_contents(&self, book_id: BookId) -> Result<TocRequest, JobError> {
        if let Some(content) = self.worker.store().read_index(book_id)? {
            return Ok(TocRequest::Ready { content });
        }

        let path = self.txt_path(book_id)?;
        let wait = estimate_wait(std::fs::metadata(&path)?.len());

        let position = match self.worker.enqueue(book_id) {
            EnqueueOutcome::Queued { position } | EnqueueOutcome::AlreadyQueued { position } => position,
            EnqueueOutcome::AlreadyRunning => 0,
        };
        self.wake_worker();

        Ok(TocRequest::Queued { position, wait })
    }

    /// 读取章节原文，`end` 为 -1 时读到文件末尾
    ///
    /// 章节范围从标题行开始，返回的正文第一行就是标题，显示时不需要再单独加标题
    pub fn read_chapter(&self, book_id: BookId, start: u64, end: i64) -> Result<String, JobError> {
        let path = self.txt_path(book_id)?;
        Ok(self.txt.read_range(&path, start, end)?)
    }

    /// 读取章节并转为 HTML（转义后换行替换为 `<br>`）
    pub fn read_chapter_html(&self, book_id: BookId, start: u64, end: i64) -> Result<String, JobError> {
        let path = self.txt_path(book_id)?;
        Ok(self.txt.read_range_html(&path, start, end)?)
    }

    /// 推送到 Kindle 邮箱
    pub fn push_book(&self, book_id: BookId, mail_to: &str) -> Result<PushPlan, PushError> {
        self.pusher.push(&self.launcher, book_id, mail_to)
    }

    /// 准备在线阅读
    ///
    /// 非 epub 书籍在后台转换为 epub 并解压，失败时通过用户消息告知
    pub fn prepare_read(&self, book_id: BookId) -> Result<ReadPlan, ReadError> {
        self.preparer.prepare(&self.launcher, book_id)
    }

    pub fn read_ready(&self, book_id: BookId) -> bool {
        self.preparer.is_ready(book_id)
    }

    fn wake_worker(&self) {
        let worker = self.worker.clone();
        self.extract_lane.launch_blocking("extract-toc", move || {
            if let Some(report) = worker.trigger() {
                debug!(processed = ?report.processed, "解析队列处理完毕");
            }
            Ok(())
        });
    }

    fn txt_path(&self, book_id: BookId) -> Result<PathBuf, JobError> {
        let book = self
            .books
            .get_book(book_id)?
            .ok_or(JobError::NotFound(book_id))?;
        book.format_path("txt")
            .map(|p| p.to_path_buf())
            .ok_or(JobError::InvalidFormat(book_id))
    }
}
