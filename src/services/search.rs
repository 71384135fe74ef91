//! 包搜索
//!
//! 调用外部搜索命令（默认 `nix search nixpkgs <query>`）查找目标主机可安装的包

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::infra::{CommandError, CommandRunner};

/// 查询串最大长度
const MAX_QUERY_LEN: usize = 100;

/// 包搜索错误
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search query '{0}'")]
    InvalidQuery(String),

    #[error("search program '{program}' could not run: {reason}")]
    Unavailable { program: String, reason: String },

    #[error("package search timed out after {0:?}")]
    Timeout(Duration),

    #[error("search program exited with code {exit_code}")]
    Failed { exit_code: i32, stderr: String },
}

/// 搜索结果
#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub query: String,
    /// markdown 格式，便于直接展示
    pub formatted: String,
    pub raw: String,
}

/// 包搜索
pub struct PackageSearch {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl PackageSearch {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub async fn search(&self, query: &str) -> Result<SearchResult, SearchError> {
        let query = query.trim();
        if !is_valid_query(query) {
            return Err(SearchError::InvalidQuery(query.to_string()));
        }

        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{query}", query))
            .collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(program = %self.program, args = ?args, "Searching packages");

        let output = CommandRunner::run_simple(&self.program, &args, &std::env::temp_dir(), self.timeout)
            .await
            .map_err(|e| match e {
                CommandError::Timeout { after, .. } => SearchError::Timeout(after),
                other => SearchError::Unavailable {
                    program: self.program.clone(),
                    reason: other.to_string(),
                },
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(query, stderr = %stderr, "Package search failed");
            return Err(SearchError::Failed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(SearchResult {
            formatted: format!(
                "### Nix package search results for \"{}\"\n\n```\n{}\n```\n",
                query, raw
            ),
            query: query.to_string(),
            raw,
        })
    }
}

/// 只允许包名常见字符，且不能被当作命令行选项
fn is_valid_query(query: &str) -> bool {
    !query.is_empty()
        && query.len() <= MAX_QUERY_LEN
        && !query.starts_with('-')
        && query
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_with(script: &str, timeout_secs: u64) -> PackageSearch {
        PackageSearch::new(&SearchConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "{query}".to_string()],
            timeout_secs,
        })
    }

    #[test]
    fn test_query_validation() {
        assert!(is_valid_query("ripgrep"));
        assert!(is_valid_query("python3.12-numpy"));
        assert!(is_valid_query("gtk+"));
        assert!(!is_valid_query(""));
        assert!(!is_valid_query("--file=/etc/shadow"));
        assert!(!is_valid_query("a b"));
        assert!(!is_valid_query("x;rm"));
        assert!(!is_valid_query(&"a".repeat(101)));
    }

    #[tokio::test]
    async fn test_search_formats_output() {
        let search = search_with(r#"echo "* legacyPackages.x86_64-linux.$0 (14.1.0)""#, 10);
        let result = search.search(" ripgrep ").await.unwrap();

        assert_eq!(result.query, "ripgrep");
        assert_eq!(result.raw, "* legacyPackages.x86_64-linux.ripgrep (14.1.0)");
        assert!(result.formatted.contains("results for \"ripgrep\""));
        assert!(result.formatted.contains("```\n* legacyPackages"));
    }

    #[tokio::test]
    async fn test_search_errors() {
        let failing = search_with("echo 'error: no results' >&2; exit 1", 10);
        match failing.search("nothing").await {
            Err(SearchError::Failed { exit_code, stderr }) => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "error: no results");
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.raw)),
        }

        assert!(matches!(
            search_with("sleep 5", 1).search("slow").await,
            Err(SearchError::Timeout(_))
        ));

        let missing = PackageSearch::new(&SearchConfig {
            program: "/nonexistent/search".to_string(),
            ..SearchConfig::default()
        });
        assert!(matches!(
            missing.search("ripgrep").await,
            Err(SearchError::Unavailable { .. })
        ));
        assert!(matches!(
            missing.search("-rf").await,
            Err(SearchError::InvalidQuery(_))
        ));
    }
}
