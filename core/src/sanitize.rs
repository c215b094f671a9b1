//! Intake hygiene for submitted code.
//!
//! Callers frequently paste code wrapped in Markdown fences, or relay it from
//! a model that emits them. Stripping happens before validation so the policy
//! walk sees what will actually run, and the size cap bounds parser work.

use crate::error::ExecuteErr;
use crate::error::Result;

/// Strip a single surrounding Markdown code fence (with an optional language
/// tag), normalize line endings, and enforce the size cap.
pub fn sanitize_code(code: &str, max_code_bytes: usize) -> Result<String> {
    let code = code.replace("\r\n", "\n");
    let code = strip_fence(code.trim());

    if code.is_empty() {
        return Err(ExecuteErr::PolicyViolation(
            "submitted code is empty".to_string(),
        ));
    }
    if code.len() > max_code_bytes {
        return Err(ExecuteErr::PolicyViolation(format!(
            "code exceeds the {max_code_bytes} byte limit"
        )));
    }
    Ok(code.to_string())
}

fn strip_fence(code: &str) -> &str {
    let Some(rest) = code.strip_prefix("```") else {
        return code;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return code;
    };
    // Drop the language tag line, if any ("```python\n...").
    match body.split_once('\n') {
        Some((first_line, tail)) if is_language_tag(first_line.trim()) => tail.trim_matches('\n'),
        _ => body.trim_matches('\n'),
    }
}

fn is_language_tag(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| c.is_ascii_alphanumeric())
}
