//! 外部协作方接口
//!
//! 书库元数据、邮件发送和用户消息队列都由宿主程序实现，这里只定义边界

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 书籍 ID
pub type BookId = i32;

/// 协作方返回的错误
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("书籍 {0} 不存在")]
    NotFound(BookId),

    #[error("{0}")]
    Backend(String),
}

/// 书籍记录
///
/// 只包含后台任务需要的字段
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookRecord {
    pub id: BookId,
    pub title: String,
    pub authors: Vec<String>,
    /// 小写格式名 -> 文件路径，例如 "txt" -> /books/1/a.txt
    pub formats: HashMap<String, PathBuf>,
}

impl BookRecord {
    /// 获取指定格式的文件路径（格式名不区分大小写）
    pub fn format_path(&self, format: &str) -> Option<&Path> {
        self.formats
            .get(&format.to_lowercase())
            .map(|p| p.as_path())
    }

    pub fn has_format(&self, format: &str) -> bool {
        self.format_path(format).is_some()
    }

    /// 显示用标题，空标题回退为「无名书籍」
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            "无名书籍"
        } else {
            &self.title
        }
    }

    /// 作者列表拼接，没有作者时回退为「佚名」
    pub fn display_authors(&self) -> String {
        if self.authors.is_empty() {
            "佚名".to_string()
        } else {
            self.authors.join(" & ")
        }
    }
}

/// 书库元数据存储
pub trait BookStore: Send + Sync {
    /// 按 ID 查询书籍，不存在时返回 Ok(None)
    fn get_book(&self, book_id: BookId) -> Result<Option<BookRecord>, LibraryError>;

    /// 将新格式文件登记到书籍名下
    ///
    /// # 参数
    /// - `book_id`: 书籍 ID
    /// - `format`: 格式名（小写）
    /// - `source`: 新格式文件路径，实现方负责复制或移动
    fn add_format(&self, book_id: BookId, format: &str, source: &Path) -> Result<(), LibraryError>;
}

/// 待发送邮件
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub attachment: Vec<u8>,
}

/// 邮件发送
pub trait MailSender: Send + Sync {
    fn send(&self, mail: &OutgoingMail) -> Result<(), LibraryError>;
}

/// 用户消息级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Success,
    Danger,
}

/// 面向用户的消息队列
///
/// 后台任务没有返回通道，结果只能通过这里告知用户
pub trait MessageSink: Send + Sync {
    fn add_msg(&self, level: MessageLevel, text: String);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_book(title: &str, authors: &[&str]) -> BookRecord {
        BookRecord {
            id: 1,
            title: title.to_string(),
            authors: authors.iter().map(|a| a.to_string()).collect(),
            formats: HashMap::from([("txt".to_string(), PathBuf::from("/books/1.txt"))]),
        }
    }

    #[test]
    fn test_format_lookup_ignores_case() {
        let book = create_book("三体", &["刘慈欣"]);
        assert_eq!(book.format_path("TXT"), Some(Path::new("/books/1.txt")));
        assert!(!book.has_format("epub"));
    }

    #[test]
    fn test_display_fallbacks() {
        let book = create_book("  ", &[]);
        assert_eq!(book.display_title(), "无名书籍");
        assert_eq!(book.display_authors(), "佚名");

        let book = create_book("三体", &["刘慈欣", "Ken Liu"]);
        assert_eq!(book.display_title(), "三体");
        assert_eq!(book.display_authors(), "刘慈欣 & Ken Liu");
    }
}
