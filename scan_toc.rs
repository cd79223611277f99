/// 扫描 TXT 文件并输出目录
///
/// 用法: scan_toc <txt 文件> [配置文件]
///
/// 配置文件中的 heading_rules 会替换内置规则，用于调试自定义规则

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use shelf_jobs::parser::{ChapterDetector, TxtParser};
use shelf_jobs::Settings;
use tracing::info;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(txt_path) = args.next().map(PathBuf::from) else {
        eprintln!("用法: scan_toc <txt 文件> [配置文件]");
        std::process::exit(2);
    };
    let settings = match args.next() {
        Some(config) => Settings::load(Path::new(&config))?,
        None => Settings::default(),
    };
    shelf_jobs::init_tracing(&settings.log_level);

    let rules = settings.rule_set();
    info!(rules = rules.len(), "正在解析 TXT 文件: {:?}", txt_path);

    let mut head = Vec::new();
    File::open(&txt_path)
        .with_context(|| format!("无法打开文件: {:?}", txt_path))?
        .take(64 * 1024)
        .read_to_end(&mut head)?;
    let (encoding, _) = TxtParser::new().detect_encoding(&head);
    info!("检测到编码: {}", encoding.name());

    let detector = ChapterDetector::with_rules(rules);
    let records = detector
        .detect_file(&txt_path)
        .with_context(|| format!("解析失败: {:?}", txt_path))?;

    println!("{}", serde_json::to_string_pretty(&records)?);
    info!(chapters = records.len(), "解析完成");
    Ok(())
}
