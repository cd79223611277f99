use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{error, info};

use crate::config::Settings;
use crate::converter::{progress_log_path, ProcessRunner};
use crate::error::PushError;
use crate::library::{
    BookId, BookRecord, BookStore, MailSender, MessageLevel, MessageSink, OutgoingMail,
};
use crate::task_launcher::TaskLauncher;

/// 可以直接推送到 Kindle 的格式，按优先级排列
const DIRECT_FORMATS: [&str; 2] = ["epub", "pdf"];
/// 需要先转换的源格式，按优先级排列
const CONVERT_SOURCES: [&str; 2] = ["azw3", "txt"];
/// 转换目标格式
const TARGET_FORMAT: &str = "epub";

const CONVERT_FAILED_MSG: &str = "文件格式转换失败，请联系管理员。";

/// 推送方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushPlan {
    /// 直接发送已有格式
    Direct { format: String },
    /// 先从 `source_format` 转换为 epub 再发送
    Convert { source_format: String },
}

impl PushPlan {
    /// 根据书籍已有格式选择推送方式，没有可用格式时返回 None
    pub fn for_book(book: &BookRecord) -> Option<Self> {
        if let Some(format) = DIRECT_FORMATS.iter().find(|f| book.has_format(f)) {
            return Some(Self::Direct {
                format: format.to_string(),
            });
        }
        CONVERT_SOURCES
            .iter()
            .find(|f| book.has_format(f))
            .map(|f| Self::Convert {
                source_format: f.to_string(),
            })
    }
}

/// 邮件模板参数
#[derive(Debug, Clone)]
struct MailTemplate {
    from: String,
    subject: String,
    body: String,
    site_title: String,
    site_url: String,
}

impl MailTemplate {
    fn render(&self, template: &str, title: &str) -> String {
        template
            .replace("{title}", title)
            .replace("{site_title}", &self.site_title)
            .replace("{site_url}", &self.site_url)
    }
}

/// 推送到 Kindle 邮箱
///
/// 请求线程只做格式判断，转换和发信都交给后台任务，结果通过用户消息告知
pub struct BookPusher {
    books: Arc<dyn BookStore>,
    mailer: Arc<dyn MailSender>,
    messages: Arc<dyn MessageSink>,
    runner: ProcessRunner,
    convert_path: PathBuf,
    template: MailTemplate,
}

impl BookPusher {
    pub fn new(
        books: Arc<dyn BookStore>,
        mailer: Arc<dyn MailSender>,
        messages: Arc<dyn MessageSink>,
        runner: ProcessRunner,
        settings: &Settings,
    ) -> Self {
        Self {
            books,
            mailer,
            messages,
            runner,
            convert_path: settings.convert_path.clone(),
            template: MailTemplate {
                from: settings.mail_from.clone(),
                subject: settings.push_title.clone(),
                body: settings.push_content.clone(),
                site_title: settings.site_title.clone(),
                site_url: settings.site_url.clone(),
            },
        }
    }

    /// 发起推送
    ///
    /// # 参数
    /// - `launcher`: 后台任务启动器
    /// - `book_id`: 书籍 ID
    /// - `mail_to`: Kindle 邮箱
    ///
    /// # 返回
    /// 选定的推送方式；书籍不存在或没有可用格式时返回错误
    pub fn push(
        self: &Arc<Self>,
        launcher: &TaskLauncher,
        book_id: BookId,
        mail_to: &str,
    ) -> Result<PushPlan, PushError> {
        let book = self
            .books
            .get_book(book_id)?
            .ok_or(PushError::NotFound(book_id))?;
        let plan = PushPlan::for_book(&book).ok_or(PushError::NoKindleFormat)?;

        let pusher = self.clone();
        let mail_to = mail_to.to_string();
        match &plan {
            PushPlan::Direct { format } => {
                let format = format.clone();
                launcher.launch(format!("push-{}", book_id), async move {
                    let path = book
                        .format_path(&format)
                        .map(Path::to_path_buf)
                        .ok_or_else(|| anyhow!("书籍 {} 缺少 {} 格式", book.id, format))?;
                    pusher.send_book(&book, &mail_to, &format, &path).await
                });
            }
            PushPlan::Convert { .. } => {
                self.messages.add_msg(
                    MessageLevel::Success,
                    format!("服务器正在推送《{}》到{}", book.display_title(), mail_to),
                );
                launcher.launch(format!("convert-{}", book_id), async move {
                    pusher.convert_and_send(book, mail_to).await
                });
            }
        }

        info!(book_id, ?plan, "推送任务已提交");
        Ok(plan)
    }

    /// 转换进度日志路径
    pub fn progress_log_path(&self, book_id: BookId) -> PathBuf {
        progress_log_path(&self.convert_path, book_id)
    }

    /// 转换输出路径：`<convert_path>/<book_id>-<标题>.epub`
    pub fn converted_path(&self, book: &BookRecord) -> PathBuf {
        self.convert_path.join(format!(
            "{}-{}.{}",
            book.id,
            safe_file_stem(book.display_title()),
            TARGET_FORMAT
        ))
    }

    /// 转换为 epub，登记新格式后发送
    pub async fn convert_and_send(&self, book: BookRecord, mail_to: String) -> anyhow::Result<()> {
        let source = CONVERT_SOURCES
            .iter()
            .find_map(|f| book.format_path(f))
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("书籍 {} 没有可转换的格式", book.id))?;
        let output = self.converted_path(&book);
        let log_path = self.progress_log_path(book.id);

        tracing::debug!(book_id = book.id, "convert book from {:?} to {:?}", source, output);
        if let Err(e) = self.runner.run(&source, &output, &log_path).await {
            self.messages
                .add_msg(MessageLevel::Danger, CONVERT_FAILED_MSG.to_string());
            return Err(e).with_context(|| format!("书籍 {} 格式转换失败", book.id));
        }

        let books = self.books.clone();
        let (book_id, registered) = (book.id, output.clone());
        tokio::task::spawn_blocking(move || books.add_format(book_id, TARGET_FORMAT, &registered))
            .await??;

        self.send_book(&book, &mail_to, TARGET_FORMAT, &output).await
    }

    /// 发送邮件，成功或失败都会通知用户
    pub async fn send_book(
        &self,
        book: &BookRecord,
        mail_to: &str,
        format: &str,
        path: &Path,
    ) -> anyhow::Result<()> {
        let attachment = tokio::fs::read(path)
            .await
            .with_context(|| format!("读取待发送文件失败: {:?}", path))?;
        let mail = self.build_mail(book, mail_to, format, attachment);
        let title = book.display_title().to_string();

        info!(book_id = book.id, "send {} to {}", title, mail_to);
        let mailer = self.mailer.clone();
        let sent = tokio::task::spawn_blocking(move || mailer.send(&mail)).await?;

        match sent {
            Ok(()) => {
                let msg = format!("[{}] 已成功发送至Kindle邮箱 [{}] !!", title, mail_to);
                info!(book_id = book.id, "{}", msg);
                self.messages.add_msg(MessageLevel::Success, msg);
                Ok(())
            }
            Err(e) => {
                error!(book_id = book.id, "Failed to send to kindle: {}: {}", mail_to, e);
                self.messages.add_msg(
                    MessageLevel::Danger,
                    format!("《{}》推送到 {} 失败: {}", title, mail_to, e),
                );
                Err(anyhow!(e).context(format!("发送到 {} 失败", mail_to)))
            }
        }
    }

    fn build_mail(&self, book: &BookRecord, mail_to: &str, format: &str, attachment: Vec<u8>) -> OutgoingMail {
        let title = book.display_title();
        OutgoingMail {
            from: self.template.from.clone(),
            to: mail_to.to_string(),
            subject: self.template.render(&self.template.subject, title),
            body: self.template.render(&self.template.body, title),
            attachment_name: format!("{} - {}.{}", title, book.display_authors(), format),
            attachment,
        }
    }
}

/// 去掉文件名中不允许的字符
fn safe_file_stem(title: &str) -> String {
    let stem: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let stem = stem.trim().trim_matches('.');
    if stem.is_empty() {
        "book".to_string()
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryBookStore, RecordingMailer, RecordingMessages};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::runtime::Handle;

    struct Fixture {
        dir: tempfile::TempDir,
        books: Arc<MemoryBookStore>,
        mailer: Arc<RecordingMailer>,
        messages: Arc<RecordingMessages>,
        pusher: Arc<BookPusher>,
    }

    fn create_fixture(script: &str, mailer: RecordingMailer) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let books = Arc::new(MemoryBookStore::new());
        let mailer = Arc::new(mailer);
        let messages = Arc::new(RecordingMessages::default());
        let settings = Settings {
            convert_path: dir.path().join("convert"),
            site_title: "书屋".to_string(),
            site_url: "https://books.example".to_string(),
            mail_from: "robot@books.example".to_string(),
            ..Settings::default()
        };
        let runner = ProcessRunner::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "convert".to_string()],
            Duration::from_secs(10),
        );
        let pusher = Arc::new(BookPusher::new(
            books.clone(),
            mailer.clone(),
            messages.clone(),
            runner,
            &settings,
        ));
        Fixture {
            dir,
            books,
            mailer,
            messages,
            pusher,
        }
    }

    fn add_book(fixture: &Fixture, id: BookId, formats: &[&str]) {
        let mut paths = Vec::new();
        for fmt in formats {
            let path = fixture.dir.path().join(format!("{}.{}", id, fmt));
            std::fs::write(&path, format!("{} data", fmt)).unwrap();
            paths.push((*fmt, path));
        }
        let mut book = MemoryBookStore::book(id, "三体", paths);
        book.authors = vec!["刘慈欣".to_string()];
        fixture.books.insert(book);
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_plan_prefers_direct_formats() {
        let book = |formats: &[&str]| BookRecord {
            id: 1,
            title: "书".to_string(),
            authors: vec![],
            formats: formats
                .iter()
                .map(|f| (f.to_string(), PathBuf::from(format!("/b/1.{}", f))))
                .collect::<HashMap<_, _>>(),
        };

        assert_eq!(
            PushPlan::for_book(&book(&["pdf", "epub", "txt"])),
            Some(PushPlan::Direct {
                format: "epub".to_string()
            })
        );
        assert_eq!(
            PushPlan::for_book(&book(&["pdf", "txt"])),
            Some(PushPlan::Direct {
                format: "pdf".to_string()
            })
        );
        assert_eq!(
            PushPlan::for_book(&book(&["txt", "azw3"])),
            Some(PushPlan::Convert {
                source_format: "azw3".to_string()
            })
        );
        assert_eq!(PushPlan::for_book(&book(&["mobi"])), None);
    }

    #[test]
    fn test_safe_file_stem() {
        assert_eq!(safe_file_stem("a/b:c?"), "a_b_c_");
        assert_eq!(safe_file_stem(" 三体 "), "三体");
        assert_eq!(safe_file_stem(".."), "book");
    }

    #[tokio::test]
    async fn test_push_unknown_or_unsupported() {
        let fixture = create_fixture("exit 0", RecordingMailer::default());
        let (launcher, _faults) = TaskLauncher::new(Handle::current(), 2);
        add_book(&fixture, 2, &["mobi"]);

        assert!(matches!(
            fixture.pusher.push(&launcher, 1, "me@kindle.com"),
            Err(PushError::NotFound(1))
        ));
        assert!(matches!(
            fixture.pusher.push(&launcher, 2, "me@kindle.com"),
            Err(PushError::NoKindleFormat)
        ));
    }

    #[tokio::test]
    async fn test_direct_push_sends_mail() {
        let fixture = create_fixture("exit 1", RecordingMailer::default());
        let (launcher, _faults) = TaskLauncher::new(Handle::current(), 2);
        add_book(&fixture, 3, &["epub"]);

        let plan = fixture.pusher.push(&launcher, 3, "me@kindle.com").unwrap();
        assert_eq!(
            plan,
            PushPlan::Direct {
                format: "epub".to_string()
            }
        );

        let mailer = fixture.mailer.clone();
        wait_until(move || !mailer.sent.lock().unwrap().is_empty()).await;
        let mail = fixture.mailer.sent.lock().unwrap()[0].clone();
        assert_eq!(mail.to, "me@kindle.com");
        assert_eq!(mail.from, "robot@books.example");
        assert_eq!(mail.subject, "[书屋] 三体");
        assert_eq!(mail.body, "《三体》来自 书屋 https://books.example");
        assert_eq!(mail.attachment_name, "三体 - 刘慈欣.epub");
        assert_eq!(mail.attachment, b"epub data");

        let messages = fixture.messages.clone();
        wait_until(move || !messages.snapshot().is_empty()).await;
        assert_eq!(fixture.messages.snapshot()[0].0, MessageLevel::Success);
    }

    #[tokio::test]
    async fn test_convert_then_send() {
        let fixture = create_fixture(r#"echo converting; cp "$1" "$2""#, RecordingMailer::default());
        let (launcher, _faults) = TaskLauncher::new(Handle::current(), 2);
        add_book(&fixture, 4, &["txt"]);

        let plan = fixture.pusher.push(&launcher, 4, "me@kindle.com").unwrap();
        assert_eq!(
            plan,
            PushPlan::Convert {
                source_format: "txt".to_string()
            }
        );
        assert_eq!(
            fixture.messages.snapshot()[0],
            (
                MessageLevel::Success,
                "服务器正在推送《三体》到me@kindle.com".to_string()
            )
        );

        let mailer = fixture.mailer.clone();
        wait_until(move || !mailer.sent.lock().unwrap().is_empty()).await;
        let mail = fixture.mailer.sent.lock().unwrap()[0].clone();
        assert_eq!(mail.attachment_name, "三体 - 刘慈欣.epub");
        assert_eq!(mail.attachment, b"txt data");

        let output = fixture.pusher.converted_path(&MemoryBookStore::book(4, "三体", vec![]));
        assert_eq!(
            fixture.books.added_formats(),
            vec![(4, "epub".to_string(), output)]
        );
        let log = std::fs::read_to_string(fixture.pusher.progress_log_path(4)).unwrap();
        assert_eq!(log, "converting\n");
    }

    #[tokio::test]
    async fn test_conversion_failure_notifies_user() {
        let fixture = create_fixture("exit 2", RecordingMailer::default());
        let (launcher, mut faults) = TaskLauncher::new(Handle::current(), 2);
        add_book(&fixture, 5, &["azw3"]);

        fixture.pusher.push(&launcher, 5, "me@kindle.com").unwrap();

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.task, "convert-5");
        assert!(!fault.panicked);
        let messages = fixture.messages.snapshot();
        assert_eq!(
            messages.last().unwrap(),
            &(MessageLevel::Danger, CONVERT_FAILED_MSG.to_string())
        );
        assert!(fixture.mailer.sent.lock().unwrap().is_empty());
        assert!(fixture.books.added_formats().is_empty());
    }

    #[tokio::test]
    async fn test_mail_failure_notifies_user() {
        let fixture = create_fixture(
            "exit 0",
            RecordingMailer {
                fail: true,
                ..RecordingMailer::default()
            },
        );
        let (launcher, mut faults) = TaskLauncher::new(Handle::current(), 2);
        add_book(&fixture, 6, &["pdf"]);

        fixture.pusher.push(&launcher, 6, "me@kindle.com").unwrap();

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.task, "push-6");
        let messages = fixture.messages.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, MessageLevel::Danger);
        assert!(messages[0].1.contains("SMTP 连接失败"));
    }
}
