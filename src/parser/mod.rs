// 纯文本目录解析：编码检测、按字节偏移逐行读取、有序规则匹配

pub mod chapter_detector;
pub mod rules;
pub mod txt_parser;

pub use chapter_detector::{ChapterDetector, ChapterRecord, OPEN_END, WHOLE_DOCUMENT_TITLE};
pub use rules::{HeadingMatch, HeadingRule, PatternRuleSet, RuleSpec};
pub use txt_parser::{DecodedLine, OffsetLines, TxtParser};
