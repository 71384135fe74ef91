//! 配置文件集合领域模型
//!
//! `ConfigurationFileSet` 是目标主机配置目录的完整快照：相对路径 -> 文件内容。

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// 配置入口文件
pub const ENTRY_POINT: &str = "configuration.nix";

/// 保留目录（git 版本管理），不属于文件集合
pub const RESERVED_DIR: &str = ".git";

/// 初始化时写入的最小配置骨架
pub const SKELETON_CONTENT: &str = r#"# Entry point created by nix-deploy-agent
{ config, lib, pkgs, ... }:

{
  imports = lib.optional (builtins.pathExists ./hardware-configuration.nix) ./hardware-configuration.nix;
}
"#;

/// 路径校验错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("file path is empty")]
    Empty,
    #[error("file path '{0}' is absolute")]
    Absolute(String),
    #[error("file path '{0}' contains an empty, '.' or '..' component")]
    Traversal(String),
    #[error("file path '{0}' contains an invalid character")]
    InvalidCharacter(String),
    #[error("file path '{0}' is inside the reserved .git directory")]
    Reserved(String),
    #[error("file path '{0}' is used both as a file and as a directory")]
    Conflict(String),
}

/// markdown 文档解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkdownError {
    #[error("document contains no fenced code block")]
    NoCodeBlock,
    #[error("code block for '{0}' is not closed")]
    Unterminated(String),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// 校验单个相对路径
///
/// 只允许 `/` 分隔的相对路径，不允许跳出配置根目录
pub fn validate_path(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.starts_with('/') {
        return Err(PathError::Absolute(path.to_string()));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(PathError::InvalidCharacter(path.to_string()));
    }
    if path
        .split('/')
        .any(|c| c.is_empty() || c == "." || c == "..")
    {
        return Err(PathError::Traversal(path.to_string()));
    }
    if path.split('/').next() == Some(RESERVED_DIR) {
        return Err(PathError::Reserved(path.to_string()));
    }
    Ok(())
}

/// 配置文件集合
///
/// 反序列化时会校验所有路径，非法集合无法被构造出来
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct ConfigurationFileSet {
    files: BTreeMap<String, String>,
}

impl ConfigurationFileSet {
    /// 创建空集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 最小骨架：只有一个入口文件
    pub fn skeleton() -> Self {
        let mut files = BTreeMap::new();
        files.insert(ENTRY_POINT.to_string(), SKELETON_CONTENT.to_string());
        Self { files }
    }

    /// 从映射构造并校验
    pub fn from_map(files: BTreeMap<String, String>) -> Result<Self, PathError> {
        let set = Self { files };
        set.validate()?;
        Ok(set)
    }

    /// 插入单个文件
    pub fn insert(
        &mut self,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), PathError> {
        let path = path.into();
        validate_path(&path)?;
        self.files.insert(path.clone(), content.into());
        if let Err(e) = self.check_conflicts() {
            self.files.remove(&path);
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// 按字典序返回所有路径
    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 是否包含配置入口文件
    pub fn has_entry_point(&self) -> bool {
        self.files.contains_key(ENTRY_POINT)
    }

    /// 校验所有路径以及文件/目录冲突
    pub fn validate(&self) -> Result<(), PathError> {
        for path in self.files.keys() {
            validate_path(path)?;
        }
        self.check_conflicts()
    }

    fn check_conflicts(&self) -> Result<(), PathError> {
        for path in self.files.keys() {
            let prefix = format!("{}/", path);
            if let Some((next, _)) = self.files.range(prefix.clone()..).next() {
                if next.starts_with(&prefix) {
                    return Err(PathError::Conflict(path.clone()));
                }
            }
        }
        Ok(())
    }

    /// 快照哈希（SHA-256，十六进制）
    ///
    /// BuildAttempt 通过该哈希引用构建时的文件集合
    pub fn snapshot_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, content) in &self.files {
            hasher.update((path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(content.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// 导出为单个 markdown 文档
    pub fn to_markdown(&self) -> String {
        let mut doc = String::new();
        for (path, content) in &self.files {
            let lang = if path.ends_with(".nix") { "nix" } else { "" };
            let _ = write!(doc, "### {}\n\n```{}\n{}\n```\n\n", path, lang, content);
        }
        doc
    }

    /// 从 markdown 文档解析文件集合，`to_markdown` 的逆操作
    ///
    /// 每个 `### <path>` 标题之后的第一个代码块是该文件的内容。
    /// 没有标题的代码块作为入口文件，只取第一个
    pub fn from_markdown(doc: &str) -> Result<Self, MarkdownError> {
        let mut files = BTreeMap::new();
        let mut heading: Option<String> = None;
        let mut found = false;
        let mut lines = doc.split('\n');

        while let Some(line) = lines.next() {
            let line = line.trim_end_matches('\r');
            if let Some(title) = line.strip_prefix("### ") {
                heading = Some(title.trim().trim_matches('`').to_string());
                continue;
            }
            if !line.starts_with("```") {
                continue;
            }

            let target = heading.take();
            let mut body = Vec::new();
            let mut closed = false;
            for inner in lines.by_ref() {
                if inner.trim_end_matches('\r').trim_end() == "```" {
                    closed = true;
                    break;
                }
                body.push(inner);
            }
            if !closed {
                return Err(MarkdownError::Unterminated(
                    target.unwrap_or_else(|| ENTRY_POINT.to_string()),
                ));
            }

            found = true;
            let content = body.join("\n");
            match target {
                Some(path) => {
                    validate_path(&path)?;
                    files.insert(path, content);
                }
                None => {
                    files.entry(ENTRY_POINT.to_string()).or_insert(content);
                }
            }
        }

        if !found {
            return Err(MarkdownError::NoCodeBlock);
        }
        Ok(Self::from_map(files)?)
    }
}

impl TryFrom<BTreeMap<String, String>> for ConfigurationFileSet {
    type Error = PathError;

    fn try_from(files: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::from_map(files)
    }
}

impl From<ConfigurationFileSet> for BTreeMap<String, String> {
    fn from(set: ConfigurationFileSet) -> Self {
        set.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("configuration.nix").is_ok());
        assert!(validate_path("modules/nginx.nix").is_ok());
        assert_eq!(validate_path(""), Err(PathError::Empty));
        assert!(matches!(validate_path("/etc/passwd"), Err(PathError::Absolute(_))));
        assert!(matches!(validate_path("../x.nix"), Err(PathError::Traversal(_))));
        assert!(matches!(validate_path("a//b.nix"), Err(PathError::Traversal(_))));
        assert!(matches!(validate_path("a/./b.nix"), Err(PathError::Traversal(_))));
        assert!(matches!(validate_path("a\\b.nix"), Err(PathError::InvalidCharacter(_))));
        assert!(matches!(validate_path(".git/config"), Err(PathError::Reserved(_))));
    }

    #[test]
    fn test_file_directory_conflict() {
        let result = ConfigurationFileSet::from_map(map(&[("a", "x"), ("a/b.nix", "y")]));
        assert_eq!(result, Err(PathError::Conflict("a".to_string())));

        // 前缀相同但不是目录关系
        let ok = ConfigurationFileSet::from_map(map(&[("a", "x"), ("ab.nix", "y")]));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_insert_rolls_back_on_conflict() {
        let mut set = ConfigurationFileSet::new();
        set.insert("hosts/web.nix", "{}").unwrap();
        assert!(set.insert("hosts", "{}").is_err());
        assert_eq!(set.paths(), vec!["hosts/web.nix".to_string()]);
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: ConfigurationFileSet =
            serde_json::from_str(r#"{"configuration.nix": "{ }"}"#).unwrap();
        assert!(ok.has_entry_point());

        let bad = serde_json::from_str::<ConfigurationFileSet>(r#"{"../escape.nix": "{ }"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_snapshot_hash_is_content_sensitive() {
        let a = ConfigurationFileSet::from_map(map(&[("configuration.nix", "A")])).unwrap();
        let a2 = ConfigurationFileSet::from_map(map(&[("configuration.nix", "A")])).unwrap();
        let b = ConfigurationFileSet::from_map(map(&[("configuration.nix", "B")])).unwrap();

        assert_eq!(a.snapshot_hash(), a2.snapshot_hash());
        assert_ne!(a.snapshot_hash(), b.snapshot_hash());
        assert_eq!(a.snapshot_hash().len(), 64);
    }

    #[test]
    fn test_markdown_export() {
        let set = ConfigurationFileSet::from_map(map(&[
            ("configuration.nix", "{ }"),
            ("notes.txt", "hello"),
        ]))
        .unwrap();

        let doc = set.to_markdown();
        assert!(doc.starts_with("### configuration.nix\n\n```nix\n{ }\n```"));
        assert!(doc.contains("### notes.txt\n\n```\nhello\n```"));
    }

    #[test]
    fn test_markdown_parses_back_to_same_set() {
        let set = ConfigurationFileSet::from_map(map(&[
            ("configuration.nix", "{ imports = [ ./hosts/web.nix ]; }\n"),
            ("hosts/web.nix", "{\n  services.nginx.enable = true;\n}"),
            ("README", ""),
        ]))
        .unwrap();

        let parsed = ConfigurationFileSet::from_markdown(&set.to_markdown()).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_markdown_reply_without_headings() {
        let reply = "Here is the updated configuration:\n\n```nix\n{ services.openssh.enable = true; }\n```\n\nDone.";
        let set = ConfigurationFileSet::from_markdown(reply).unwrap();
        assert_eq!(set.paths(), vec![ENTRY_POINT.to_string()]);
        assert_eq!(set.get(ENTRY_POINT), Some("{ services.openssh.enable = true; }"));
    }

    #[test]
    fn test_markdown_errors() {
        assert_eq!(
            ConfigurationFileSet::from_markdown("no code here"),
            Err(MarkdownError::NoCodeBlock)
        );
        assert_eq!(
            ConfigurationFileSet::from_markdown("### a.nix\n\n```nix\n{ }\n"),
            Err(MarkdownError::Unterminated("a.nix".to_string()))
        );
        assert!(matches!(
            ConfigurationFileSet::from_markdown("### ../etc/passwd\n\n```\nx\n```\n"),
            Err(MarkdownError::Path(PathError::Traversal(_)))
        ));
    }

    #[test]
    fn test_skeleton() {
        let set = ConfigurationFileSet::skeleton();
        assert_eq!(set.len(), 1);
        assert!(set.has_entry_point());
    }
}
