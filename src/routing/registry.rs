//! 目标注册表：名称 → A2A 端点，以及消息中的目标名检测
//!
//! 启动时从配置构建并校验（端点可解析、默认目标必须在集合内），之后只读。
//! 检测规则：整词、大小写不敏感；先匹配目标名，再匹配别名；
//! 消息中最靠左的命中胜出，无命中返回 None（由调用方回退默认目标）。

use regex::{Regex, RegexBuilder};

use crate::core::RelayError;

/// 一个远端目标（每个受管集群/环境一个）
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub endpoint: String,
    pub aliases: Vec<String>,
}

/// 常见环境名的内置别名（目标未显式配置别名时使用）
fn default_aliases(name: &str) -> Vec<String> {
    let aliases: &[&str] = match name.to_lowercase().as_str() {
        "prod" => &["production", "prd"],
        "dev" => &["development", "develop"],
        "test" => &["testing", "tst"],
        "stage" | "staging" => &["staging", "stage", "stg"],
        "qa" => &["quality"],
        _ => &[],
    };
    aliases
        .iter()
        .filter(|a| !a.eq_ignore_ascii_case(name))
        .map(|a| a.to_string())
        .collect()
}

/// 整词、大小写不敏感匹配器
fn word_pattern(word: &str) -> Result<Regex, RelayError> {
    RegexBuilder::new(&format!(r"\b{}\b", regex::escape(word)))
        .case_insensitive(true)
        .build()
        .map_err(|e| RelayError::Config(format!("Bad target keyword '{}': {}", word, e)))
}

/// 目标注册表（进程级单例，构建后不可变）
#[derive(Debug)]
pub struct TargetRegistry {
    targets: Vec<Target>,
    default_target: Option<String>,
    /// 预编译匹配器：(目标名, 匹配器)，名称在前、别名在后
    name_patterns: Vec<(String, Regex)>,
    alias_patterns: Vec<(String, Regex)>,
}

impl TargetRegistry {
    pub fn new(
        mut targets: Vec<Target>,
        default_target: Option<String>,
    ) -> Result<Self, RelayError> {
        if targets.is_empty() {
            return Err(RelayError::Config(
                "Multi-target mode requires at least one target".to_string(),
            ));
        }

        for target in &mut targets {
            if target.endpoint.trim().is_empty() {
                return Err(RelayError::Config(format!(
                    "Target '{}' has no resolvable endpoint",
                    target.name
                )));
            }
            if target.aliases.is_empty() {
                target.aliases = default_aliases(&target.name);
            }
        }

        for (i, a) in targets.iter().enumerate() {
            if targets[..i]
                .iter()
                .any(|b| b.name.eq_ignore_ascii_case(&a.name))
            {
                return Err(RelayError::Config(format!(
                    "Duplicate target name '{}'",
                    a.name
                )));
            }
        }

        if let Some(ref default) = default_target {
            if !targets.iter().any(|t| t.name.eq_ignore_ascii_case(default)) {
                return Err(RelayError::Config(format!(
                    "Default target '{}' is not in the target set",
                    default
                )));
            }
        }

        let mut name_patterns = Vec::with_capacity(targets.len());
        let mut alias_patterns = Vec::new();
        for target in &targets {
            name_patterns.push((target.name.clone(), word_pattern(&target.name)?));
            for alias in &target.aliases {
                alias_patterns.push((target.name.clone(), word_pattern(alias)?));
            }
        }

        Ok(Self {
            targets,
            default_target,
            name_patterns,
            alias_patterns,
        })
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name.clone()).collect()
    }

    pub fn default_target(&self) -> Option<&str> {
        self.default_target.as_deref()
    }

    /// 按名称查找（大小写不敏感）
    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn endpoint_of(&self, name: &str) -> Option<&str> {
        self.get(name).map(|t| t.endpoint.as_str())
    }

    /// 在消息中检测目标名：先目标名后别名，每一轮取消息中最靠左的命中
    pub fn detect(&self, message: &str) -> Option<&str> {
        for patterns in [&self.name_patterns, &self.alias_patterns] {
            let hit = patterns
                .iter()
                .filter_map(|(name, re)| re.find(message).map(|m| (m.start(), name)))
                .min_by_key(|(start, _)| *start);
            if let Some((_, name)) = hit {
                tracing::debug!("Detected target '{}' in message", name);
                return self.get(name).map(|t| t.name.as_str());
            }
        }
        tracing::debug!("No target detected in message");
        None
    }
}
