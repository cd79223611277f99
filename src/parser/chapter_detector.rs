use std::io::{self, BufRead};
use std::path::Path;

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rules::PatternRuleSet;
use super::txt_parser::{OffsetLines, TxtParser};

/// 最后一章的 `end`，表示读到文件末尾
pub const OPEN_END: i64 = -1;

/// 没有识别出任何章节时的整本书标题
pub const WHOLE_DOCUMENT_TITLE: &str = "全部";

/// 目录条目
///
/// `start`/`end` 是文件中的字节偏移，`end` 为 -1 表示到文件末尾
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRecord {
    /// 章节序号，从 1 开始
    pub id: u32,
    pub title: String,
    pub start: u64,
    pub end: i64,
}

impl ChapterRecord {
    /// 整本书作为单章节
    pub fn whole_document() -> Self {
        Self {
            id: 1,
            title: WHOLE_DOCUMENT_TITLE.to_string(),
            start: 0,
            end: OPEN_END,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end == OPEN_END
    }
}

/// 章节检测器
///
/// 逐行扫描文本，用有序规则集识别标题行，生成带字节偏移的目录：
/// 1. 每行按规则优先级匹配，第一条命中的规则生效
/// 2. 命中时关闭上一章（end = 当前标题行的行首偏移），从当前标题行开始新章节
/// 3. 全书没有命中任何规则时，整本书作为单章节
pub struct ChapterDetector {
    rules: PatternRuleSet,
    txt: TxtParser,
}

impl ChapterDetector {
    /// 使用内置规则创建检测器
    pub fn new() -> Self {
        Self::with_rules(PatternRuleSet::default())
    }

    pub fn with_rules(rules: PatternRuleSet) -> Self {
        Self {
            rules,
            txt: TxtParser::new(),
        }
    }

    pub fn rules(&self) -> &PatternRuleSet {
        &self.rules
    }

    /// 扫描逐行读取器，生成目录
    ///
    /// # 参数
    /// - `lines`: 带字节偏移的逐行读取器
    ///
    /// # 返回
    /// 目录条目列表，至少包含一条
    pub fn detect<R: BufRead>(&self, lines: OffsetLines<R>) -> io::Result<Vec<ChapterRecord>> {
        let mut records: Vec<ChapterRecord> = Vec::new();

        for line in lines {
            let line = line?;
            let Some(hit) = self.rules.first_match(&line.text) else {
                continue;
            };

            if let Some(prev) = records.last_mut() {
                prev.end = line.start as i64;
            }

            let id = records.len() as u32 + 1;
            debug!(id, rule = hit.rule, offset = line.start, "识别到章节: {}", hit.title);
            records.push(ChapterRecord {
                id,
                title: hit.title,
                start: line.start,
                end: OPEN_END,
            });
        }

        if records.is_empty() {
            records.push(ChapterRecord::whole_document());
        }

        Ok(records)
    }

    /// 扫描内存中的字节，`encoding` 为文本编码
    pub fn detect_bytes(&self, bytes: &[u8], encoding: &'static Encoding) -> io::Result<Vec<ChapterRecord>> {
        self.detect(OffsetLines::new(bytes, encoding))
    }

    /// 扫描 TXT 文件（自动检测编码）
    pub fn detect_file(&self, file_path: &Path) -> io::Result<Vec<ChapterRecord>> {
        let lines = self.txt.open(file_path)?;
        self.detect(lines)
    }
}

impl Default for ChapterDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::rules::RuleSpec;
    use encoding_rs::{GBK, UTF_8};
    use std::io::Write;

    fn assert_contiguous(records: &[ChapterRecord]) {
        for pair in records.windows(2) {
            assert_eq!(pair[0].end, pair[1].start as i64);
        }
        assert!(records.last().unwrap().is_open());
    }

    #[test]
    fn test_detect_chinese_chapters() {
        let detector = ChapterDetector::new();
        let text = "第一章 开始\n这是第一章的内容。\n第二章 继续\n这是第二章的内容。\n";

        let records = detector.detect_bytes(text.as_bytes(), UTF_8).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            ChapterRecord {
                id: 1,
                title: "第一章 开始".to_string(),
                start: 0,
                end: 45,
            }
        );
        assert_eq!(records[1].id, 2);
        assert_eq!(records[1].title, "第二章 继续");
        assert_eq!(records[1].start, 45);
        assert_eq!(records[1].end, OPEN_END);
    }

    #[test]
    fn test_no_heading_yields_whole_document() {
        let detector = ChapterDetector::new();
        let text = "很久很久以前，有一座山。\n山里有一座庙。\n";

        let records = detector.detect_bytes(text.as_bytes(), UTF_8).unwrap();

        assert_eq!(records, vec![ChapterRecord::whole_document()]);
        assert_eq!(records[0].title, WHOLE_DOCUMENT_TITLE);
    }

    #[test]
    fn test_empty_input() {
        let detector = ChapterDetector::new();
        let records = detector.detect_bytes(b"", UTF_8).unwrap();
        assert_eq!(records, vec![ChapterRecord::whole_document()]);
    }

    #[test]
    fn test_contiguity_with_preface() {
        let detector = ChapterDetector::new();
        let text = "\
A short preface without any heading.
Chapter 1 Departure
The ship left the harbour at dawn.
Chapter 2 Storm
The sea turned grey.
Chapter 3 Landfall
They saw the island.
";
        let records = detector.detect_bytes(text.as_bytes(), UTF_8).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].title, "Chapter 1 Departure");
        // 序言不属于任何章节，第一章从标题行开始
        assert_eq!(records[0].start, 37);
        assert_eq!(records[2].title, "Chapter 3 Landfall");
        assert_contiguous(&records);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.id as usize, i + 1);
        }
    }

    #[test]
    fn test_gbk_offsets() {
        let detector = ChapterDetector::new();
        let (bytes, _, _) = GBK.encode("第一章 开始\n内容。\n第二章 继续\n内容。\n");

        let records = detector.detect_bytes(&bytes, GBK).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "第一章 开始");
        // GBK: "第一章 开始\n" 12 字节, "内容。\n" 7 字节
        assert_eq!(records[0].end, 19);
        assert_eq!(records[1].start, 19);
    }

    #[test]
    fn test_custom_rules() {
        let rules = PatternRuleSet::from_specs(
            &[RuleSpec {
                name: "卷".to_string(),
                example: String::new(),
                pattern: r"^=+\s*(.+?)\s*=+$".to_string(),
            }],
            1_000_000,
        );
        let detector = ChapterDetector::with_rules(rules);

        let records = detector
            .detect_bytes("== 上卷 ==\nabc\n== 下卷 ==\n".as_bytes(), UTF_8)
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "上卷");
        assert_eq!(records[1].title, "下卷");
        assert_contiguous(&records);
    }

    #[test]
    fn test_detect_file_matches_read_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all("第一章 开始\n内容一。\n第二章 继续\n内容二。\n".as_bytes())
            .unwrap();
        let detector = ChapterDetector::new();
        let txt = TxtParser::new();

        let records = detector.detect_file(file.path()).unwrap();
        let second = txt
            .read_range(file.path(), records[1].start, records[1].end)
            .unwrap();

        assert_eq!(second, "第二章 继续\n内容二。\n");
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_string(&ChapterRecord::whole_document()).unwrap();
        assert_eq!(json, r#"{"id":1,"title":"全部","start":0,"end":-1}"#);
    }
}
