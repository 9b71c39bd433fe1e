//! Secret redaction for source text sent to an inference backend.

use std::sync::OnceLock;

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

/// (pattern, replacement). Replacements may reference capture groups.
const PATTERNS: &[(&str, &str)] = &[
    (r"\bsk-[A-Za-z0-9_\-]{16,}", REDACTED),
    (r"AIza[0-9A-Za-z_\-]{20,}", REDACTED),
    (r"gh[pousr]_[A-Za-z0-9]{20,}", REDACTED),
    (r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", REDACTED),
    (r"xox[bpas]-[A-Za-z0-9\-]{10,}", REDACTED),
    (r"(?i)\b(bearer\s+)[A-Za-z0-9._~+/\-]{8,}=*", "${1}[REDACTED]"),
    (
        r#"(?i)\b((?:api[_\-]?key|secret(?:[_\-]?key)?|password|passwd|access[_\-]?token|auth[_\-]?token)\s*[:=]\s*)(["'])[^"'\r\n]+(["'])"#,
        "${1}${2}[REDACTED]${3}",
    ),
];

fn compiled() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        PATTERNS
            .iter()
            .filter_map(|(pattern, replacement)| {
                Regex::new(pattern).ok().map(|re| (re, *replacement))
            })
            .collect()
    })
}

/// Replace secret-shaped substrings with `[REDACTED]`.
pub fn redact_secrets(text: &str) -> String {
    let mut out = text.to_string();
    for (re, replacement) in compiled() {
        if re.is_match(&out) {
            out = re.replace_all(&out, *replacement).into_owned();
        }
    }
    out
}
