use regex::Regex;
use std::sync::LazyLock;

/// How upstream "thinking" markup is rewritten before it reaches the caller.
/// One rendering function per variant, selected once from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningMode {
    Think,
    Pure,
    Raw,
}

impl std::str::FromStr for ReasoningMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "think" => Ok(Self::Think),
            "pure" => Ok(Self::Pure),
            "raw" => Ok(Self::Raw),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ReasoningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Think => "think",
            Self::Pure => "pure",
            Self::Raw => "raw",
        })
    }
}

const THINK_PREFIX: &str = "\u{1F914}\n\n";
const RAW_OPEN: &str = "<details type=\"reasoning\" open><div>\n\n";

static DETAILS_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?details[^>]*>").expect("details regex"));
static SUMMARY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<summary[^>]*>.*?</summary>\n?").expect("summary regex"));

/// Render an accumulated thinking buffer for the configured mode.
///
/// `thinking_secs` is the wall time from the first thinking frame to the
/// call; only `raw` uses it. Every mode is idempotent: markup is removed
/// only when present, and already-rendered input passes through unchanged.
pub fn render(text: &str, mode: ReasoningMode, thinking_secs: u64) -> String {
    match mode {
        ReasoningMode::Think => {
            let stripped = strip_markup(text);
            if stripped.starts_with(THINK_PREFIX) {
                stripped
            } else {
                format!("{}{}", THINK_PREFIX, stripped)
            }
        }
        ReasoningMode::Pure => {
            let stripped = strip_markup(text);
            stripped
                .lines()
                .map(|line| {
                    if line.is_empty() {
                        line.to_string()
                    } else {
                        format!("> {}", line)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        ReasoningMode::Raw => {
            if text.starts_with(RAW_OPEN) && text.ends_with("</details>") {
                return text.to_string();
            }
            format!(
                "{}{}\n\n</div><summary>Thought for {} seconds</summary></details>",
                RAW_OPEN, text, thinking_secs
            )
        }
    }
}

/// Remove `<details>` / `<summary>` wrappers first, then leading `> ` quote
/// markers. The order matters when both are present.
pub fn strip_markup(text: &str) -> String {
    let without_summary = SUMMARY_TAG.replace_all(text, "");
    let without_details = DETAILS_TAG.replace_all(&without_summary, "");
    let dequoted: Vec<&str> = without_details
        .lines()
        .map(|line| line.strip_prefix("> ").unwrap_or(line))
        .collect();
    dequoted.join("\n").trim().to_string()
}

/// Inverse of the `raw` wrapper; used to verify reversibility.
pub fn strip_raw_wrapper(wrapped: &str) -> Option<&str> {
    let inner = wrapped.strip_prefix(RAW_OPEN)?;
    let div_end = inner.find("\n\n</div><summary>")?;
    Some(&inner[..div_end])
}

/// Per-delta cleanup applied while streaming thinking content: wrappers are
/// dropped the moment they arrive so callers never see partial markup.
pub fn clean_streaming_delta(delta: &str) -> String {
    if delta.contains("<details") || delta.contains("</details>") || delta.contains("<summary") {
        let without_summary = SUMMARY_TAG.replace_all(delta, "");
        DETAILS_TAG.replace_all(&without_summary, "").into_owned()
    } else {
        delta.to_string()
    }
}

/// Cache key for memoized whole-buffer renders. Only a bounded prefix feeds
/// the hash so pathological buffers stay cheap.
pub fn render_fingerprint(text: &str, mode: ReasoningMode) -> String {
    let prefix: String = text.chars().take(100).collect();
    format!(
        "render:{}",
        crate::cache::fingerprint(&[&prefix, &mode.to_string()])
    )
}
