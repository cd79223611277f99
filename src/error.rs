use std::path::PathBuf;

use thiserror::Error;

use crate::library::{BookId, LibraryError};

/// 目录解析任务错误
///
/// 任务级错误只记录日志并清理标记文件，不会自动重试
#[derive(Debug, Error)]
pub enum JobError {
    /// 书籍没有可扫描的 txt 格式
    #[error("书籍 {0} 没有可解析的 txt 格式")]
    InvalidFormat(BookId),

    #[error("找不到书籍 {0}")]
    NotFound(BookId),

    #[error("读写文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("目录序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("书库访问失败: {0}")]
    Library(#[from] LibraryError),
}

/// 单条目录规则的故障
///
/// 只影响当前规则：编译失败的规则被跳过，匹配失败视为未匹配
#[derive(Debug, Error)]
pub enum ScanFault {
    #[error("目录规则「{rule}」编译失败: {source}")]
    Compile {
        rule: String,
        #[source]
        source: Box<fancy_regex::Error>,
    },

    #[error("目录规则「{rule}」匹配失败: {source}")]
    Evaluate {
        rule: String,
        #[source]
        source: Box<fancy_regex::Error>,
    },
}

/// 外部格式转换错误
#[derive(Debug, Error)]
pub enum ConvertError {
    /// 超时后进程已被终止并回收
    #[error("格式转换超时（{secs} 秒）")]
    Timeout { secs: u64, pid: Option<u32> },

    #[error("无法启动转换工具 {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("转换工具异常退出（{status}）: {stderr}")]
    ToolFailed { status: String, stderr: String },

    #[error("转换完成但没有生成输出文件: {0}")]
    MissingOutput(PathBuf),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 推送请求错误（在请求线程同步返回）
#[derive(Debug, Error)]
pub enum PushError {
    #[error("找不到书籍 {0}")]
    NotFound(BookId),

    #[error("抱歉，该书无可用于kindle阅读的格式")]
    NoKindleFormat,

    #[error("书库访问失败: {0}")]
    Library(#[from] LibraryError),
}

/// 在线阅读请求错误（在请求线程同步返回）
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("找不到书籍 {0}")]
    NotFound(BookId),

    #[error("抱歉，在线阅读器暂不支持该格式的书籍")]
    UnsupportedFormat,

    #[error("书库访问失败: {0}")]
    Library(#[from] LibraryError),
}
