//! 配置
//!
//! 所有字段都有默认值，配置文件只需要写出要覆盖的项

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::parser::rules::{PatternRuleSet, RuleSpec};

/// 后台任务配置
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// 目录解析结果和标记文件的根目录，每本书一个子目录
    pub extract_path: PathBuf,
    /// 格式转换输出和转换日志目录
    pub convert_path: PathBuf,
    /// 格式转换工具
    pub convert_program: String,
    /// 放在输入/输出路径之前的固定参数
    pub convert_args: Vec<String>,
    /// 格式转换超时（秒）
    pub convert_timeout: u64,
    /// 标记文件租约（秒），启动时超过租约的标记文件视为孤儿
    pub marker_lease_secs: u64,
    /// 同时执行的后台任务上限
    pub max_background_tasks: usize,
    /// 单条目录规则的回溯上限
    pub rule_backtrack_limit: usize,
    /// 自定义目录规则，设置后替换内置规则
    pub heading_rules: Option<Vec<RuleSpec>>,
    pub site_title: String,
    pub site_url: String,
    pub mail_from: String,
    /// 推送邮件标题模板，支持 {title} {site_title} {site_url}
    pub push_title: String,
    pub push_content: String,
    /// 默认日志级别，可被 LOG_LEVEL 环境变量覆盖
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            extract_path: PathBuf::from("data/extract"),
            convert_path: PathBuf::from("data/convert"),
            convert_program: "ebook-convert".to_string(),
            convert_args: Vec::new(),
            convert_timeout: 300,
            marker_lease_secs: 6 * 3600,
            max_background_tasks: 4,
            rule_backtrack_limit: 1_000_000,
            heading_rules: None,
            site_title: "Shelf".to_string(),
            site_url: String::new(),
            mail_from: String::new(),
            push_title: "[{site_title}] {title}".to_string(),
            push_content: "《{title}》来自 {site_title} {site_url}".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// 从 TOML 文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        if settings.max_background_tasks == 0 {
            anyhow::bail!("max_background_tasks must be at least 1");
        }
        Ok(settings)
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout)
    }

    pub fn marker_lease(&self) -> Duration {
        Duration::from_secs(self.marker_lease_secs)
    }

    /// 编译目录规则：配置了 heading_rules 时使用自定义规则，否则使用内置规则
    pub fn rule_set(&self) -> PatternRuleSet {
        match &self.heading_rules {
            Some(specs) => PatternRuleSet::from_specs(specs, self.rule_backtrack_limit),
            None => PatternRuleSet::builtin(self.rule_backtrack_limit),
        }
    }
}
