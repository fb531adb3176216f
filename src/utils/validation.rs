use crate::error::{AppError, Result};
use url::Url;

/// 验证 OAuth 回跳地址：必须是绝对的 http(s) 地址
pub fn validate_redirect_target(target: &str) -> Result<Url> {
    if target.trim().is_empty() {
        return Err(AppError::Validation("回跳地址不能为空".to_string()));
    }

    let url = Url::parse(target.trim())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AppError::Validation(format!(
            "回跳地址必须使用 http 或 https，而不是 {}",
            other
        ))),
    }
}

/// 验证书签 ID
pub fn validate_bookmark_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(AppError::Validation("书签 ID 不能为空".to_string()));
    }

    // PostgREST filters are comma/paren delimited
    if id.contains(|c: char| c == ',' || c == '(' || c == ')' || c.is_whitespace()) {
        return Err(AppError::Validation("书签 ID 包含非法字符".to_string()));
    }

    Ok(())
}
