use encoding_rs::*;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// 编码检测时读取的文件头长度
const SNIFF_LEN: u64 = 64 * 1024;

/// TXT 解析器
///
/// 负责纯文本书籍的编码检测、按行读取（带字节偏移）和按字节区间读取
#[derive(Clone)]
pub struct TxtParser;

impl TxtParser {
    /// 创建新的 TXT 解析器实例
    pub fn new() -> Self {
        Self
    }

    /// 检测文件编码
    ///
    /// 尝试检测文件的字符编码，支持 BOM、UTF-8、GBK
    ///
    /// # 参数
    /// - `bytes`: 文件头部字节（可以是截断的）
    ///
    /// # 返回
    /// (检测到的编码, BOM 长度)
    pub fn detect_encoding(&self, bytes: &[u8]) -> (&'static Encoding, usize) {
        // 1. 检查 BOM (Byte Order Mark)
        if let Some((encoding, bom_length)) = Encoding::for_bom(bytes) {
            return (encoding, bom_length);
        }

        // 2. 尝试 UTF-8 解码，末尾被截断的多字节字符不算错误
        match std::str::from_utf8(bytes) {
            Ok(_) => return (UTF_8, 0),
            Err(e) if e.error_len().is_none() => return (UTF_8, 0),
            Err(_) => {}
        }

        // 3. 检测是否为 GBK
        if self.looks_like_gbk(bytes) {
            return (GBK, 0);
        }

        // 4. 默认使用 UTF-8
        (UTF_8, 0)
    }

    /// 检测字节序列是否像 GBK 编码
    ///
    /// GBK 编码特征：
    /// - 第一字节范围：0x81-0xFE
    /// - 第二字节范围：0x40-0xFE
    fn looks_like_gbk(&self, bytes: &[u8]) -> bool {
        let mut gbk_pairs = 0;
        let mut total_pairs = 0;

        let mut i = 0;
        while i < bytes.len().saturating_sub(1) {
            let b1 = bytes[i];
            let b2 = bytes[i + 1];

            if b1 < 0x80 {
                i += 1;
                continue;
            }

            total_pairs += 1;

            if (0x81..=0xFE).contains(&b1) && (0x40..=0xFE).contains(&b2) {
                gbk_pairs += 1;
                i += 2;
            } else {
                i += 1;
            }
        }

        // 超过 50% 的非 ASCII 字节对符合 GBK 规则则认为是 GBK
        total_pairs > 0 && (gbk_pairs as f32 / total_pairs as f32) > 0.5
    }

    /// 读取文件头并检测编码，文件指针停在 BOM 之后
    fn sniff(&self, file: &mut File) -> io::Result<(&'static Encoding, u64)> {
        let mut head = Vec::with_capacity(SNIFF_LEN as usize);
        Read::by_ref(file).take(SNIFF_LEN).read_to_end(&mut head)?;
        let (encoding, bom_len) = self.detect_encoding(&head);
        file.seek(SeekFrom::Start(bom_len as u64))?;
        Ok((encoding, bom_len as u64))
    }

    /// 打开 TXT 文件，返回带字节偏移的逐行读取器
    ///
    /// 偏移是文件中的原始字节位置（包含 BOM），不是字符数
    pub fn open(&self, file_path: &Path) -> io::Result<OffsetLines<BufReader<File>>> {
        let mut file = File::open(file_path)?;
        let (encoding, bom_len) = self.sniff(&mut file)?;
        Ok(OffsetLines::with_offset(BufReader::new(file), encoding, bom_len))
    }

    /// 按字节区间读取文本
    ///
    /// # 参数
    /// - `file_path`: 文件路径
    /// - `start`: 起始字节偏移
    /// - `end`: 结束字节偏移（不含），-1 表示读到文件末尾
    ///
    /// # 返回
    /// 使用文件编码解码后的文本，无法解码的字节被替换
    pub fn read_range(&self, file_path: &Path, start: u64, end: i64) -> io::Result<String> {
        let mut file = File::open(file_path)?;
        let (encoding, bom_len) = self.sniff(&mut file)?;

        let start = start.max(bom_len);
        file.seek(SeekFrom::Start(start))?;

        let mut bytes = Vec::new();
        if end < 0 {
            file.read_to_end(&mut bytes)?;
        } else {
            let len = (end as u64).saturating_sub(start);
            file.take(len).read_to_end(&mut bytes)?;
        }

        let (content, _had_errors) = encoding.decode_without_bom_handling(&bytes);
        Ok(content.into_owned())
    }

    /// 按字节区间读取文本并转换为 HTML 片段（转义后换行替换为 <br>）
    pub fn read_range_html(&self, file_path: &Path, start: u64, end: i64) -> io::Result<String> {
        let content = self.read_range(file_path, start, end)?;
        Ok(html_escape::encode_text(&content).replace('\n', "<br>"))
    }
}

impl Default for TxtParser {
    fn default() -> Self {
        Self::new()
    }
}

/// 解码后的一行文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    /// 去掉行尾换行符后的文本
    pub text: String,
    /// 行首字节偏移
    pub start: u64,
    /// 行尾（含换行符）之后的字节偏移
    pub end: u64,
}

/// 带字节偏移的逐行读取器
///
/// 按原始字节切分行再逐行解码，因此偏移始终是字节位置。
/// UTF-16 按两字节单元寻找换行，其余编码按 `\n` 字节切分。
pub struct OffsetLines<R> {
    reader: R,
    encoding: &'static Encoding,
    offset: u64,
    buf: Vec<u8>,
}

impl<R: BufRead> OffsetLines<R> {
    pub fn new(reader: R, encoding: &'static Encoding) -> Self {
        Self::with_offset(reader, encoding, 0)
    }

    /// `offset` 是 reader 当前位置在文件中的字节偏移
    pub fn with_offset(reader: R, encoding: &'static Encoding, offset: u64) -> Self {
        Self {
            reader,
            encoding,
            offset,
            buf: Vec::new(),
        }
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// 下一行的起始字节偏移
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// 读取下一行，文件结束时返回 Ok(None)
    pub fn next_line(&mut self) -> io::Result<Option<DecodedLine>> {
        self.buf.clear();
        let read = if self.encoding == UTF_16LE || self.encoding == UTF_16BE {
            self.read_utf16_line()?
        } else {
            self.reader.read_until(b'\n', &mut self.buf)?
        };
        if read == 0 {
            return Ok(None);
        }

        let start = self.offset;
        self.offset += read as u64;

        let (text, _had_errors) = self.encoding.decode_without_bom_handling(&self.buf);
        let text = text.trim_end_matches(|c| c == '\n' || c == '\r').to_string();

        Ok(Some(DecodedLine {
            text,
            start,
            end: self.offset,
        }))
    }

    fn read_utf16_line(&mut self) -> io::Result<usize> {
        let newline: [u8; 2] = if self.encoding == UTF_16LE {
            [0x0A, 0x00]
        } else {
            [0x00, 0x0A]
        };

        let mut unit = [0u8; 2];
        loop {
            let n = read_unit(&mut self.reader, &mut unit)?;
            self.buf.extend_from_slice(&unit[..n]);
            if n < unit.len() || unit == newline {
                break;
            }
        }
        Ok(self.buf.len())
    }
}

impl<R: BufRead> Iterator for OffsetLines<R> {
    type Item = io::Result<DecodedLine>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

/// 尽量读满 `unit`，返回实际读到的字节数（文件结束时可能小于长度）
fn read_unit<R: Read>(reader: &mut R, unit: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < unit.len() {
        match reader.read(&mut unit[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn collect_lines(bytes: &[u8], encoding: &'static Encoding) -> Vec<DecodedLine> {
        OffsetLines::new(Cursor::new(bytes.to_vec()), encoding)
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_detect_utf8_encoding() {
        let parser = TxtParser::new();
        assert_eq!(parser.detect_encoding("测试文本".as_bytes()), (UTF_8, 0));
    }

    #[test]
    fn test_detect_ascii_encoding() {
        let parser = TxtParser::new();
        // ASCII 兼容 UTF-8
        assert_eq!(parser.detect_encoding(b"Hello World"), (UTF_8, 0));
    }

    #[test]
    fn test_detect_truncated_utf8_sample() {
        let parser = TxtParser::new();
        let bytes = "测试文本".as_bytes();
        // 截断在多字节字符中间
        assert_eq!(parser.detect_encoding(&bytes[..bytes.len() - 1]), (UTF_8, 0));
    }

    #[test]
    fn test_detect_bom() {
        let parser = TxtParser::new();
        assert_eq!(parser.detect_encoding(b"\xEF\xBB\xBFabc"), (UTF_8, 3));
        assert_eq!(parser.detect_encoding(b"\xFF\xFEa\x00"), (UTF_16LE, 2));
    }

    #[test]
    fn test_detect_gbk_encoding() {
        let parser = TxtParser::new();
        let (bytes, _, _) = GBK.encode("第一章 开始\n这是正文。\n");
        assert_eq!(parser.detect_encoding(&bytes), (GBK, 0));
    }

    #[test]
    fn test_looks_like_gbk() {
        let parser = TxtParser::new();

        // GBK 编码的 "测试" (0xB2E2 0xCAD4)
        let gbk_bytes = vec![0xB2, 0xE2, 0xCA, 0xD4];
        assert!(parser.looks_like_gbk(&gbk_bytes));

        // 纯 ASCII 不应该被识别为 GBK
        assert!(!parser.looks_like_gbk(b"This is a test"));
    }

    #[test]
    fn test_offsets_are_bytes_not_chars() {
        let lines = collect_lines("第一章 开始\n正文\n".as_bytes(), UTF_8);

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "第一章 开始");
        assert_eq!(lines[0].start, 0);
        // 6 个汉字各 3 字节 + 空格 + 换行
        assert_eq!(lines[0].end, 17);
        assert_eq!(lines[1].start, 17);
        assert_eq!(lines[1].end, 24);
    }

    #[test]
    fn test_crlf_and_missing_trailing_newline() {
        let lines = collect_lines(b"one\r\ntwo", UTF_8);

        assert_eq!(lines[0].text, "one");
        assert_eq!(lines[0].end, 5);
        assert_eq!(lines[1].text, "two");
        assert_eq!(lines[1].start, 5);
        assert_eq!(lines[1].end, 8);
    }

    #[test]
    fn test_gbk_lines_keep_gbk_offsets() {
        let (bytes, _, _) = GBK.encode("第一章\n正文\n");
        let lines = collect_lines(&bytes, GBK);

        assert_eq!(lines[0].text, "第一章");
        // GBK 每个汉字 2 字节
        assert_eq!(lines[0].end, 7);
        assert_eq!(lines[1].text, "正文");
        assert_eq!(lines[1].start, 7);
    }

    #[test]
    fn test_utf16le_lines() {
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend("第一章\n正文".encode_utf16().flat_map(|u| u.to_le_bytes()));
        let file = write_temp(&bytes);

        let parser = TxtParser::new();
        let lines = parser
            .open(file.path())
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "第一章");
        assert_eq!(lines[0].start, 2);
        assert_eq!(lines[0].end, 10);
        assert_eq!(lines[1].text, "正文");
        assert_eq!(lines[1].end, 14);
    }

    #[test]
    fn test_open_skips_utf8_bom() {
        let file = write_temp(b"\xEF\xBB\xBFhello\n");
        let parser = TxtParser::new();
        let mut lines = parser.open(file.path()).unwrap();

        let line = lines.next_line().unwrap().unwrap();
        assert_eq!(line.text, "hello");
        assert_eq!(line.start, 3);
        assert!(lines.next_line().unwrap().is_none());
    }

    #[test]
    fn test_read_range() {
        let file = write_temp("第一章\n内容一\n第二章\n内容二\n".as_bytes());
        let parser = TxtParser::new();

        assert_eq!(parser.read_range(file.path(), 0, 20).unwrap(), "第一章\n内容一\n");
        assert_eq!(parser.read_range(file.path(), 20, -1).unwrap(), "第二章\n内容二\n");
    }

    #[test]
    fn test_read_range_gbk() {
        let (bytes, _, _) = GBK.encode("第一章\n内容一\n");
        let file = write_temp(&bytes);
        let parser = TxtParser::new();

        assert_eq!(parser.read_range(file.path(), 7, -1).unwrap(), "内容一\n");
    }

    #[test]
    fn test_read_range_html() {
        let file = write_temp("a < b\nc & d\n".as_bytes());
        let parser = TxtParser::new();

        let html = parser.read_range_html(file.path(), 0, -1).unwrap();
        assert_eq!(html, "a &lt; b<br>c &amp; d<br>");
    }
}
