use fancy_regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ScanFault;

/// 目录规则描述（可来自配置文件）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub example: String,
    pub pattern: String,
}

/// 内置目录规则，按优先级排列：(名称, 示例, 正则)
const BUILTIN_RULES: &[(&str, &str, &str)] = &[
    (
        "目录(去空白)",
        "第一章 假装第一章前面有空白但我不要",
        r"(?<=[　\s])(?:序章|楔子|正文(?!完|结)|终章|后记|尾声|番外|第\s{0,4}[\d〇零一二两三四五六七八九十百千万壹贰叁肆伍陆柒捌玖拾佰仟]+?\s{0,4}(?:章|节(?!课)|卷|集(?![合和]))).{0,30}$",
    ),
    (
        "目录",
        "第一章 标准的粤语就是这样",
        r"^[ 　\t]{0,4}(?:序章|楔子|正文(?!完|结)|终章|后记|尾声|番外|第\s{0,4}[\d〇零一二两三四五六七八九十百千万壹贰叁肆伍陆柒捌玖拾佰仟]+?\s{0,4}(?:章|节(?!课)|卷|集(?![合和])|部(?![分赛游])|篇(?!张))).{0,30}$",
    ),
    (
        "数字 分隔符 标题名称",
        "1、这个就是标题",
        r"^[ 　\t]{0,4}\d{1,5}[:：,.， 、_—\-].{1,30}$",
    ),
    (
        "大写数字 分隔符 标题名称",
        "一、只有前面的数字有差别",
        r"^[ 　\t]{0,4}(?:序章|楔子|正文(?!完|结)|终章|后记|尾声|番外|[零一二两三四五六七八九十百千万壹贰叁肆伍陆柒捌玖拾佰仟]{1,8}章?)[ 、_—\-].{1,30}$",
    ),
    (
        "正文 标题/序号",
        "正文 我奶常山赵子龙",
        r"^[ 　\t]{0,4}正文[ 　]{1,4}.{0,20}$",
    ),
    (
        "Chapter/Section/Part/Episode 序号 标题",
        "Chapter 1 MyGrandmaIsNB",
        r"^[ 　\t]{0,4}(?:[Cc]hapter|[Ss]ection|[Pp]art|ＰＡＲＴ|[Nn][oO][.、]|[Ee]pisode|(?:内容|文章)?简介|文案|前言|序章|楔子|正文(?!完|结)|终章|后记|尾声|番外)\s{0,4}\d{1,4}.{0,30}$",
    ),
    (
        "特殊符号 序号 标题",
        "　【第一章 后面的符号可以没有",
        r"(?<=[\s　])[【〔〖「『〈［\[](?:第|[Cc]hapter)[\d零一二两三四五六七八九十百千万壹贰叁肆伍陆柒捌玖拾佰仟]{1,10}[章节].{0,20}$",
    ),
    (
        "特殊符号 标题(成对)",
        "『加个直角引号更专业』",
        r"^[ 　\t]{0,4}(?:[\[〈「『〖〔《（【\(].{1,30}[\)】）》〕〗』」〉\]]|(?:内容|文章)?简介|文案|前言|序章|楔子|正文(?!完|结)|终章|后记|尾声|番外)[ 　]{0,4}$",
    ),
    (
        "特殊符号 标题(单个)",
        "☆、晋江作者最喜欢的格式",
        r"^[ 　\t]{0,4}(?:[☆★✦✧].{1,30}|(?:内容|文章)?简介|文案|前言|序章|楔子|正文(?!完|结)|终章|后记|尾声|番外)[ 　]{0,4}$",
    ),
    (
        "章/卷 序号 标题",
        "卷五 开源盛世",
        r"^[ \t　]{0,4}(?:(?:内容|文章)?简介|文案|前言|序章|楔子|正文(?!完|结)|终章|后记|尾声|番外|[卷章][\d零一二两三四五六七八九十百千万壹贰叁肆伍陆柒捌玖拾佰仟]{1,8})[ 　]{0,4}.{0,30}$",
    ),
    (
        "书名 括号 序号",
        "标题后面数字有括号(12)",
        r"^.{1,20}[(（][\d〇零一二两三四五六七八九十百千万壹贰叁肆伍陆柒捌玖拾佰仟]{1,8}[)）][ 　\t]{0,4}$",
    ),
    (
        "书名 序号",
        "标题后面数字没有括号124",
        r"^.{1,20}[\d〇零一二两三四五六七八九十百千万壹贰叁肆伍陆柒捌玖拾佰仟]{1,8}[ 　\t]{0,4}$",
    ),
    (
        "字数分割 分节阅读",
        "第一页",
        r"^[ 　\t]{0,4}(?:.{0,15}分[页节章段]阅读[-_ ]|第\s{0,4}[\d零一二三四五六七八九十百千万]{1,6}\s{0,4}[页节]).{0,30}$",
    ),
];

/// 单条目录规则
pub struct HeadingRule {
    name: String,
    example: String,
    regex: Regex,
}

impl HeadingRule {
    /// 编译目录规则
    ///
    /// # 参数
    /// - `spec`: 规则描述
    /// - `backtrack_limit`: 回溯上限，超过后本次匹配视为失败
    pub fn compile(spec: &RuleSpec, backtrack_limit: usize) -> Result<Self, ScanFault> {
        let regex = RegexBuilder::new(&spec.pattern)
            .backtrack_limit(backtrack_limit)
            .build()
            .map_err(|e| ScanFault::Compile {
                rule: spec.name.clone(),
                source: Box::new(e),
            })?;

        Ok(Self {
            name: spec.name.clone(),
            example: spec.example.clone(),
            regex,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn example(&self) -> &str {
        &self.example
    }

    /// 对一行文本尝试匹配
    ///
    /// 标题取第一个捕获组；规则没有捕获组时取整个匹配
    ///
    /// # 返回
    /// - Ok(Some(title)): 匹配成功
    /// - Ok(None): 未匹配
    /// - Err(fault): 匹配过程出错（例如超过回溯上限）
    pub fn try_match(&self, line: &str) -> Result<Option<String>, ScanFault> {
        let captures = self
            .regex
            .captures(line)
            .map_err(|e| ScanFault::Evaluate {
                rule: self.name.clone(),
                source: Box::new(e),
            })?;

        Ok(captures.and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().trim().to_string())
        }))
    }
}

impl std::fmt::Debug for HeadingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadingRule")
            .field("name", &self.name)
            .field("pattern", &self.regex.as_str())
            .finish()
    }
}

/// 一次成功的标题匹配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingMatch<'a> {
    /// 命中的规则名
    pub rule: &'a str,
    pub title: String,
}

/// 有序目录规则集
///
/// 每行按固定优先级依次尝试，第一条命中的规则生效
#[derive(Debug)]
pub struct PatternRuleSet {
    rules: Vec<HeadingRule>,
}

impl PatternRuleSet {
    /// 内置规则集
    pub fn builtin(backtrack_limit: usize) -> Self {
        let specs: Vec<RuleSpec> = BUILTIN_RULES
            .iter()
            .map(|(name, example, pattern)| RuleSpec {
                name: name.to_string(),
                example: example.to_string(),
                pattern: pattern.to_string(),
            })
            .collect();
        Self::from_specs(&specs, backtrack_limit)
    }

    /// 从规则描述构建规则集
    ///
    /// 编译失败的规则记录警告后跳过，不影响其余规则
    pub fn from_specs(specs: &[RuleSpec], backtrack_limit: usize) -> Self {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            match HeadingRule::compile(spec, backtrack_limit) {
                Ok(rule) => rules.push(rule),
                Err(fault) => warn!("跳过目录规则: {}", fault),
            }
        }
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[HeadingRule] {
        &self.rules
    }

    /// 查找第一条命中的规则
    ///
    /// 规则匹配出错时只跳过该规则，继续尝试后面的规则
    pub fn first_match(&self, line: &str) -> Option<HeadingMatch<'_>> {
        for rule in &self.rules {
            match rule.try_match(line) {
                Ok(Some(title)) => {
                    return Some(HeadingMatch {
                        rule: rule.name(),
                        title,
                    })
                }
                Ok(None) => continue,
                Err(fault) => {
                    debug!("{}", fault);
                    continue;
                }
            }
        }
        None
    }
}

impl Default for PatternRuleSet {
    fn default() -> Self {
        Self::builtin(1_000_000)
    }
}
