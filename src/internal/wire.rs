//! Datagram format for the sampling backend.
//!
//! One datagram per sample: `{name}#{k1=v1,k2=v2}:{value}|{kind}`, with the `#...` tag suffix
//! omitted for an empty tag set.

use std::{borrow::Cow, fmt::Display, fmt::Write as _, sync::LazyLock};

use regex::Regex;

use crate::TagSet;

static INVALID_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("name regex is known to be valid"));

// reserved by the datagram format itself
static INVALID_TAG_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,=#|:\s]").expect("tag regex is known to be valid"));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MetricKind {
    Count,
    Timing,
    Gauge,
}

impl MetricKind {
    fn suffix(self) -> &'static str {
        match self {
            MetricKind::Count => "c",
            MetricKind::Timing => "ms",
            MetricKind::Gauge => "g",
        }
    }
}

pub(crate) fn sanitize_name(name: &str) -> Cow<'_, str> {
    INVALID_NAME_CHARS.replace_all(name, "_")
}

fn sanitize_tag_part(part: &str) -> Cow<'_, str> {
    INVALID_TAG_CHARS.replace_all(part, "_")
}

pub(crate) fn format_sample(name: &str, value: impl Display, kind: MetricKind, tags: &TagSet) -> String {
    let mut line = String::with_capacity(64);
    line.push_str(&sanitize_name(name));
    if !tags.is_empty() {
        // keys that only differ in reserved characters collapse into one; the later value wins
        let sanitized: TagSet = tags
            .iter()
            .map(|(key, value)| {
                (
                    sanitize_tag_part(key).into_owned(),
                    sanitize_tag_part(value).into_owned(),
                )
            })
            .collect();
        // writing to a String cannot fail
        let _ = write!(line, "#{sanitized}");
    }
    let _ = write!(line, ":{value}|{}", kind.suffix());
    line
}
