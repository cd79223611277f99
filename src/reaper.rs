use std::collections::HashSet;
use std::time::Duration;

use tracing::{info, warn};

use crate::job_store::JobStateStore;
use crate::library::BookId;

/// 清理原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    /// 书籍既不在队列中也不是当前任务
    NotLive,
    /// 标记文件超过租约
    LeaseExpired,
}

/// 被清理的标记文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedMarker {
    pub book_id: BookId,
    pub reason: ReapReason,
}

/// 孤儿标记清理器
///
/// 解析中途进程退出时标记文件会留在磁盘上，之后同一本书会一直被视为「正在解析」。
/// 清理器删除不属于任何活动任务的标记文件。所有 IO 错误只记录日志
pub struct StalenessReaper {
    store: JobStateStore,
    lease: Duration,
}

impl StalenessReaper {
    pub fn new(store: JobStateStore, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// 标记文件超过租约时删除，返回被删除的记录
    ///
    /// 只能由处理队列的线程在开始任务前调用
    pub fn reclaim_expired(&self, book_id: BookId) -> Option<ReapedMarker> {
        let age = match self.store.marker_age(book_id) {
            Ok(Some(age)) => age,
            Ok(None) => return None,
            Err(e) => {
                warn!(book_id, "读取标记文件时间失败: {}", e);
                return None;
            }
        };
        if age <= self.lease {
            return None;
        }
        match self.store.remove_marker(book_id) {
            Ok(true) => {
                info!(book_id, ?age, "标记文件超过租约，重新解析");
                Some(ReapedMarker {
                    book_id,
                    reason: ReapReason::LeaseExpired,
                })
            }
            Ok(false) => None,
            Err(e) => {
                warn!(book_id, "删除过期标记文件失败: {}", e);
                None
            }
        }
    }

    /// 删除所有不在 `live` 中的标记文件
    ///
    /// 只能在没有任务正在执行时调用（启动时，以及工作线程每次唤醒、开始第一个任务之前）
    ///
    /// # 参数
    /// - `live`: 当前任务与队列中所有书籍
    pub fn reap(&self, live: &HashSet<BookId>) -> Vec<ReapedMarker> {
        let book_ids = match self.store.list_markers() {
            Ok(book_ids) => book_ids,
            Err(e) => {
                warn!("扫描标记文件失败 {:?}: {}", self.store.root(), e);
                return Vec::new();
            }
        };

        let mut reaped = Vec::new();
        for book_id in book_ids {
            if live.contains(&book_id) {
                continue;
            }
            match self.store.remove_marker(book_id) {
                Ok(true) => {
                    info!(book_id, "清理孤儿标记文件");
                    reaped.push(ReapedMarker {
                        book_id,
                        reason: ReapReason::NotLive,
                    });
                }
                Ok(false) => {}
                Err(e) => warn!(book_id, "删除孤儿标记文件失败: {}", e),
            }
        }
        reaped
    }
}
