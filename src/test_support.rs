//! 测试用的内存协作方

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::library::{
    BookId, BookRecord, BookStore, LibraryError, MailSender, MessageLevel, MessageSink,
    OutgoingMail,
};

type Hook = Box<dyn Fn(BookId) + Send + Sync>;

/// 内存书库
///
/// `hook` 在每次 `get_book` 前调用（不持有内部锁），用于模拟慢查询或崩溃
pub(crate) struct MemoryBookStore {
    books: Mutex<HashMap<BookId, BookRecord>>,
    added: Mutex<Vec<(BookId, String, PathBuf)>>,
    hook: Option<Hook>,
}

impl MemoryBookStore {
    pub(crate) fn new() -> Self {
        Self {
            books: Mutex::new(HashMap::new()),
            added: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    pub(crate) fn with_hook<F>(hook: F) -> Self
    where
        F: Fn(BookId) + Send + Sync + 'static,
    {
        Self {
            hook: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    pub(crate) fn book(id: BookId, title: &str, formats: Vec<(&str, PathBuf)>) -> BookRecord {
        BookRecord {
            id,
            title: title.to_string(),
            authors: vec!["作者".to_string()],
            formats: formats
                .into_iter()
                .map(|(fmt, path)| (fmt.to_string(), path))
                .collect(),
        }
    }

    pub(crate) fn insert(&self, book: BookRecord) {
        self.books.lock().unwrap().insert(book.id, book);
    }

    /// 在 `dir` 下写入 txt 文件并登记书籍
    pub(crate) fn add_txt(&self, dir: &Path, id: BookId, title: &str, content: &str) -> PathBuf {
        let path = dir.join(format!("book-{}.txt", id));
        std::fs::write(&path, content).unwrap();
        self.insert(Self::book(id, title, vec![("txt", path.clone())]));
        path
    }

    pub(crate) fn added_formats(&self) -> Vec<(BookId, String, PathBuf)> {
        self.added.lock().unwrap().clone()
    }
}

impl BookStore for MemoryBookStore {
    fn get_book(&self, book_id: BookId) -> Result<Option<BookRecord>, LibraryError> {
        if let Some(hook) = &self.hook {
            hook(book_id);
        }
        Ok(self.books.lock().unwrap().get(&book_id).cloned())
    }

    fn add_format(&self, book_id: BookId, format: &str, source: &Path) -> Result<(), LibraryError> {
        let mut books = self.books.lock().unwrap();
        let book = books.get_mut(&book_id).ok_or(LibraryError::NotFound(book_id))?;
        book.formats.insert(format.to_string(), source.to_path_buf());
        self.added
            .lock()
            .unwrap()
            .push((book_id, format.to_string(), source.to_path_buf()));
        Ok(())
    }
}

/// 记录所有邮件，`fail` 为 true 时发送失败
#[derive(Default)]
pub(crate) struct RecordingMailer {
    pub(crate) sent: Mutex<Vec<OutgoingMail>>,
    pub(crate) fail: bool,
}

impl MailSender for RecordingMailer {
    fn send(&self, mail: &OutgoingMail) -> Result<(), LibraryError> {
        if self.fail {
            return Err(LibraryError::Backend("SMTP 连接失败".to_string()));
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingMessages {
    pub(crate) messages: Mutex<Vec<(MessageLevel, String)>>,
}

impl RecordingMessages {
    pub(crate) fn snapshot(&self) -> Vec<(MessageLevel, String)> {
        self.messages.lock().unwrap().clone()
    }
}

impl MessageSink for RecordingMessages {
    fn add_msg(&self, level: MessageLevel, text: String) {
        self.messages.lock().unwrap().push((level, text));
    }
}
