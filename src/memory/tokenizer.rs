//! Token 估算（无外部分词器依赖）
//!
//! 简单字符启发式：ASCII 约 4 字符/token，非 ASCII 约 1.5 字符/token。
//! 只保证确定性、单调性与对文本长度的粗略成比例，调用方不得假设精确值。

/// Token 估算器
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量；空文本为 0，非空至少为 1
    pub fn estimate(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}
