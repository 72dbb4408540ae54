//! 日志配置.
//!
//! 支持从 JSON 加载, 缺省字段使用默认值.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 日志级别过滤表达式, 如 "info" 或 "tao_codec=trace,info"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志文件目录
    #[serde(default = "default_directory")]
    pub directory: String,
    /// 日志文件前缀
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// 是否同时输出到控制台
    #[serde(default = "default_true")]
    pub console: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_directory() -> String {
    "logs".to_string()
}

fn default_file_prefix() -> String {
    "tao-packet".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            directory: default_directory(),
            file_prefix: default_file_prefix(),
            console: true,
        }
    }
}

impl LoggingConfig {
    /// 从 JSON 字符串解析
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("解析日志配置失败")
    }

    /// 从 JSON 文件加载
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取日志配置失败, path={}", path.display()))?;
        Self::from_json_str(&text)
    }

    /// 指定日期的日志文件路径
    pub fn log_path(&self, date: NaiveDate) -> PathBuf {
        build_current_log_path(Path::new(&self.directory), &self.file_prefix, date)
    }
}

/// 与按日滚动的文件写入器保持一致: {prefix}.{YYYY-MM-DD}.log
pub(crate) fn build_current_log_path(directory: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    directory.join(format!("{}.{}.log", prefix, date.format("%Y-%m-%d")))
}
