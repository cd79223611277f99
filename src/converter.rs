//! 外部格式转换进程
//!
//! 调用 ebook-convert 一类的命令行工具，标准输出写入进度日志，超时后终止进程

use std::borrow::Cow;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::ConvertError;
use crate::library::BookId;

/// 超时后追加到进度日志的提示，`[FINISH]` 告诉前端停止轮询
pub const TIMEOUT_NOTICE: &str =
    "\n服务器转换书本格式时超时了。请在配置管理页面调大超时时间。\n[FINISH]";

/// 书籍的转换进度日志：`<convert_path>/progress-<book_id>.log`
pub fn progress_log_path(convert_path: &Path, book_id: BookId) -> PathBuf {
    convert_path.join(format!("progress-{}.log", book_id))
}

/// 转换成功的结果
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub elapsed: Duration,
    /// 工具的标准错误输出
    pub stderr: String,
}

/// 外部进程执行器
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    leading_args: Vec<String>,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            leading_args,
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.convert_program.clone(),
            settings.convert_args.clone(),
            settings.convert_timeout(),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 命令行参数：固定参数、输入、输出，输出为 epub 时追加 `--flow-size 0`
    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.leading_args.iter().map(OsString::from).collect();
        args.push(input.into());
        args.push(output.into());

        let is_epub = output
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("epub"))
            .unwrap_or(false);
        if is_epub {
            args.push("--flow-size".into());
            args.push("0".into());
        }
        args
    }

    /// 执行转换并等待结束
    ///
    /// # 参数
    /// - `input`: 源文件
    /// - `output`: 目标文件，格式由扩展名决定
    /// - `log_path`: 进度日志，每次转换都会清空重写
    ///
    /// # 返回
    /// 超时返回 `ConvertError::Timeout`，此时进程已被终止并回收
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        log_path: &Path,
    ) -> Result<ConversionReport, ConvertError> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::File::create(log_path)?;

        let args = self.build_args(input, output);
        let cmd = std::iter::once(Cow::Borrowed(self.program.as_str()))
            .chain(args.iter().map(|a| a.to_string_lossy()))
            .map(|a| format!("'{}'", a))
            .collect::<Vec<_>>()
            .join(" ");
        info!("CMD: {}", cmd);

        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConvertError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let pid = child.id();

        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let stderr = stderr_task.await.unwrap_or_default();
                let elapsed = started.elapsed();
                if !status.success() {
                    warn!(?elapsed, "ebook-convert failed: {}, err: {}", status, stderr.trim());
                    return Err(ConvertError::ToolFailed {
                        status: status.to_string(),
                        stderr,
                    });
                }
                if !output.exists() {
                    return Err(ConvertError::MissingOutput(output.to_path_buf()));
                }
                info!(?elapsed, "ebook-convert finish: {:?}, err: {}", output, stderr.trim());
                Ok(ConversionReport { elapsed, stderr })
            }
            Ok(Err(e)) => {
                kill_and_reap(&mut child).await;
                stderr_task.abort();
                Err(e.into())
            }
            Err(_) => {
                kill_and_reap(&mut child).await;
                stderr_task.abort();
                warn!(pid, "ebook-convert timeout: {:?}", output);

                let mut log = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(log_path)
                    .await?;
                log.write_all(TIMEOUT_NOTICE.as_bytes()).await?;
                log.flush().await?;

                Err(ConvertError::Timeout {
                    secs: self.timeout.as_secs(),
                    pid,
                })
            }
        }
    }
}

/// 终止进程并等待回收，避免留下僵尸进程
async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("终止转换进程失败: {}", e);
    }
}
