use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

/// 被后台任务边界拦截的故障
#[derive(Debug, Clone)]
pub struct TaskFault {
    /// 任务名称
    pub task: String,
    pub message: String,
    /// true 表示 panic，false 表示返回了错误
    pub panicked: bool,
    pub occurred_at: DateTime<Utc>,
}

/// 后台任务启动器
///
/// 调用方立即返回，任务在构造时捕获的 tokio 运行时上执行：
/// - 同时执行的任务数受信号量限制
/// - 任务返回的错误和 panic 都在边界处拦截，记录日志并发送到故障通道
/// - 故障从不传播给调用方
#[derive(Clone)]
pub struct TaskLauncher {
    handle: Handle,
    permits: Arc<Semaphore>,
    faults: UnboundedSender<TaskFault>,
}

impl TaskLauncher {
    /// 创建启动器
    ///
    /// # 参数
    /// - `handle`: 执行任务的运行时
    /// - `max_concurrent`: 同时执行的任务上限（至少为 1）
    ///
    /// # 返回
    /// 启动器和故障接收端；接收端被丢弃后故障只记录日志
    pub fn new(handle: Handle, max_concurrent: usize) -> (Self, UnboundedReceiver<TaskFault>) {
        let (faults, receiver) = mpsc::unbounded_channel();
        let launcher = Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            faults,
        };
        (launcher, receiver)
    }

    /// 创建共享故障通道、使用独立槽位的启动器
    ///
    /// 不同类型的任务互不占用执行槽位，例如目录解析不必等待格式转换
    pub fn lane(&self, max_concurrent: usize) -> Self {
        Self {
            handle: self.handle.clone(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            faults: self.faults.clone(),
        }
    }

    /// 当前空闲的执行槽位
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// 启动异步任务
    pub fn launch<F>(&self, task: impl Into<String>, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task = task.into();
        let permits = self.permits.clone();
        let faults = self.faults.clone();

        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let started = Instant::now();
            // 在独立任务中执行，panic 变成 JoinError
            let result = tokio::spawn(future).await;
            settle(&faults, task, started, result);
        });
    }

    /// 启动阻塞任务（在阻塞线程池上执行）
    pub fn launch_blocking<F>(&self, task: impl Into<String>, work: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let task = task.into();
        let permits = self.permits.clone();
        let faults = self.faults.clone();

        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let started = Instant::now();
            let result = tokio::task::spawn_blocking(work).await;
            settle(&faults, task, started, result);
        });
    }
}

fn settle(
    faults: &UnboundedSender<TaskFault>,
    task: String,
    started: Instant,
    result: Result<anyhow::Result<()>, JoinError>,
) {
    let elapsed = started.elapsed();
    let (message, panicked) = match result {
        Ok(Ok(())) => {
            debug!(task = %task, ?elapsed, "后台任务完成");
            return;
        }
        Ok(Err(e)) => {
            error!(task = %task, ?elapsed, "后台任务失败: {:#}", e);
            (format!("{:#}", e), false)
        }
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic().as_ref());
            error!(task = %task, ?elapsed, "后台任务 panic: {}", message);
            (message, true)
        }
        Err(e) => {
            warn!(task = %task, "后台任务被取消: {}", e);
            (e.to_string(), false)
        }
    };

    // 接收端可能已被丢弃
    let _ = faults.send(TaskFault {
        task,
        message,
        panicked,
        occurred_at: Utc::now(),
    });
}

/// 从 panic 载荷中取出文本
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
