//! Category suppression for draft and user-space pages.
//!
//! A live category marker (`[[Category:Foo]]`) is turned into a plain link
//! (`[[:Category:Foo]]`) so the page stops showing up in article categories.
//! Categories meant for drafts stay live, and the first
//! `{{Draft categories|...}}` block is left exactly as written.

use std::sync::LazyLock;

use regex::{Captures, NoExpand, Regex};

/// Stands in for the protected block while markers are rewritten.
const EXEMPT_PLACEHOLDER: &str = "\u{1}DRAFTNOCATPROTECTEDBLOCK\u{1}";

static EXEMPTION_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\{\{Draft categories\|[^{}]+\}\}").expect("exemption block pattern")
});

static CATEGORY_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\[(Category:)").expect("category marker pattern"));

/// Rewrite every live category marker outside the protected block into a
/// plain category link.
///
/// Markers whose name starts with `Draft`, or whose link text ends with
/// `drafts`, are kept. Matching is case-insensitive and the output keeps the
/// case of the input. Text that is already suppressed is never touched, so
/// applying this twice gives the same result as applying it once.
pub fn suppress_categories(text: &str) -> String {
    let exempt = exemption_block(text).unwrap_or("");
    let neutralized = EXEMPTION_BLOCK_RE.replace(text, NoExpand(EXEMPT_PLACEHOLDER));

    let suppressed = CATEGORY_MARKER_RE.replace_all(&neutralized, |caps: &Captures<'_>| {
        let marker = caps.get_match();
        if is_exempt_target(&neutralized[marker.end()..]) {
            marker.as_str().to_string()
        } else {
            format!("[[:{}", &caps[1])
        }
    });

    suppressed.replacen(EXEMPT_PLACEHOLDER, exempt, 1)
}

/// Returns the `{{Draft categories|...}}` block that [`suppress_categories`]
/// protects, if the text has one. Only the first block counts.
pub fn exemption_block(text: &str) -> Option<&str> {
    EXEMPTION_BLOCK_RE.find(text).map(|found| found.as_str())
}

/// Number of markers [`suppress_categories`] would rewrite.
pub fn count_live_categories(text: &str) -> usize {
    let neutralized = EXEMPTION_BLOCK_RE.replace(text, NoExpand(EXEMPT_PLACEHOLDER));
    CATEGORY_MARKER_RE
        .find_iter(&neutralized)
        .filter(|marker| !is_exempt_target(&neutralized[marker.end()..]))
        .count()
}

/// `rest` is everything after `Category:`. The link is exempt when its name
/// starts with "draft", or when the link text up to the closing `]]` on the
/// same line ends with "drafts".
fn is_exempt_target(rest: &str) -> bool {
    if starts_with_ignore_ascii_case(rest, "draft") {
        return true;
    }
    let line_end = rest.find(['\n', '\r']).unwrap_or(rest.len());
    let line = &rest[..line_end];
    match line.find("]]") {
        Some(close) => ends_with_ignore_ascii_case(&line[..close], "drafts"),
        None => false,
    }
}

fn starts_with_ignore_ascii_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn ends_with_ignore_ascii_case(value: &str, suffix: &str) -> bool {
    value.len() >= suffix.len()
        && value
            .get(value.len() - suffix.len()..)
            .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
}
