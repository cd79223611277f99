//! 书库后台任务引擎
//!
//! - 目录解析：大体积 txt 书籍按规则识别章节，结果写入磁盘后重复请求直接读取
//! - 格式转换：调用外部转换工具，带超时和进度日志；用于 Kindle 推送和在线阅读准备
//! - 后台任务：请求线程只负责提交，故障在任务边界拦截

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod book_push;
pub mod config;
pub mod converter;
pub mod engine;
pub mod error;
pub mod extract_queue;
pub mod job_store;
pub mod library;
pub mod parser;
pub mod read_prep;
pub mod reaper;
pub mod task_launcher;

#[cfg(test)]
mod test_support;

pub use book_push::{BookPusher, PushPlan};
pub use config::Settings;
pub use converter::{ConversionReport, ProcessRunner};
pub use engine::{JobEngine, TocRequest};
pub use error::{ConvertError, JobError, PushError, ReadError, ScanFault};
pub use extract_queue::{EnqueueOutcome, ExtractionWorker, JobOutcome, JobStatus, WorkerState};
pub use job_store::JobStateStore;
pub use library::{BookId, BookRecord, BookStore, MailSender, MessageLevel, MessageSink};
pub use parser::{ChapterDetector, ChapterRecord, PatternRuleSet};
pub use read_prep::{ReadPlan, ReadPreparer};
pub use reaper::StalenessReaper;
pub use task_launcher::{TaskFault, TaskLauncher};

/// 初始化日志
///
/// 默认级别可被 `LOG_LEVEL` 环境变量覆盖（支持 EnvFilter 语法）。
/// 已经安装过全局 subscriber 时返回 false
pub fn init_tracing(default_level: &str) -> bool {
    let default_level = default_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .is_ok()
}
