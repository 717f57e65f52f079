//! Glob quoting for rdiff-backup file lists.
//!
//! rdiff-backup's glob matcher treats a backslash as a regex escape, so on
//! Windows every pattern is rewritten before it is written to a file list:
//! the base directory keeps its backslashes (escaped), everything after it
//! switches to forward slashes. On POSIX systems patterns pass unchanged.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    Posix,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Base,
    Remainder,
}

struct Rule {
    segment: Segment,
    from: &'static str,
    to: &'static str,
}

const WINDOWS_RULES: &[Rule] = &[
    Rule {
        segment: Segment::Base,
        from: "\\",
        to: "\\\\",
    },
    Rule {
        segment: Segment::Remainder,
        from: "\\",
        to: "/",
    },
];

fn rules(style: PathStyle) -> &'static [Rule] {
    match style {
        PathStyle::Posix => &[],
        PathStyle::Windows => WINDOWS_RULES,
    }
}

fn apply(style: PathStyle, segment: Segment, text: &str, forward: bool) -> String {
    let mut out = text.to_string();
    for rule in rules(style).iter().filter(|r| r.segment == segment) {
        out = if forward {
            out.replace(rule.from, rule.to)
        } else {
            out.replace(rule.to, rule.from)
        };
    }
    out
}

/// Quotes `pattern`; the leading `base` directory, when present, is treated
/// as the base segment.
pub fn quote(style: PathStyle, base: &str, pattern: &str) -> String {
    match pattern.strip_prefix(base).filter(|_| !base.is_empty()) {
        Some(rest) => format!(
            "{}{}",
            apply(style, Segment::Base, base, true),
            apply(style, Segment::Remainder, rest, true)
        ),
        None => apply(style, Segment::Remainder, pattern, true),
    }
}

/// Reverses [`quote`] for a pattern quoted against the same `base`.
pub fn unquote(style: PathStyle, base: &str, quoted: &str) -> String {
    let quoted_base = apply(style, Segment::Base, base, true);
    match quoted.strip_prefix(&quoted_base).filter(|_| !base.is_empty()) {
        Some(rest) => format!("{}{}", base, apply(style, Segment::Remainder, rest, false)),
        None => apply(style, Segment::Remainder, quoted, false),
    }
}
