//! Token substitution for backup destination names.
//!
//! Patterns such as `{SERVER_NAME}/{YYYY}-{MM}-{DD}` are expanded against the
//! server, the profile and a point in time. Expansion is a single left-to-right
//! pass: substituted text is never re-scanned, so a profile called `{date}`
//! stays `{date}` in the output. Unknown tokens are copied through verbatim.

use chrono::{DateTime, TimeZone};
use std::fmt::Display;

/// Live values a pattern can refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingContext<'a> {
    pub server_name: &'a str,
    pub server_host: &'a str,
    pub profile_name: &'a str,
}

/// Placeholder values used by [`preview`].
pub const PREVIEW_CONTEXT: NamingContext<'static> = NamingContext {
    server_name: "my-server",
    server_host: "192.168.1.100",
    profile_name: "my_database",
};

/// Every recognized token with a short description.
pub const TOKENS: &[(&str, &str)] = &[
    ("{date}", "calendar date, YYYY-MM-DD"),
    ("{time}", "clock time, HH-MM-SS"),
    ("{YYYY}", "4-digit year"),
    ("{YY}", "2-digit year"),
    ("{MM}", "2-digit month"),
    ("{DD}", "2-digit day of month"),
    ("{HH}", "2-digit hour (24h)"),
    ("{mm}", "2-digit minute"),
    ("{SS}", "2-digit second"),
    ("{TIMESTAMP}", "seconds since the Unix epoch"),
    ("{SERVER_NAME}", "configured server name"),
    ("{SERVER_HOST}", "configured server host"),
    ("{profile}", "backup profile name"),
];

pub fn tokens() -> &'static [(&'static str, &'static str)] {
    TOKENS
}

fn expand<Tz>(token: &str, ctx: &NamingContext<'_>, now: &DateTime<Tz>) -> Option<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let value = match token {
        "date" => now.format("%Y-%m-%d").to_string(),
        "time" => now.format("%H-%M-%S").to_string(),
        "YYYY" => now.format("%Y").to_string(),
        "YY" => now.format("%y").to_string(),
        "MM" => now.format("%m").to_string(),
        "DD" => now.format("%d").to_string(),
        "HH" => now.format("%H").to_string(),
        "mm" => now.format("%M").to_string(),
        "SS" => now.format("%S").to_string(),
        "TIMESTAMP" => now.timestamp().to_string(),
        "SERVER_NAME" => ctx.server_name.to_string(),
        "SERVER_HOST" => ctx.server_host.to_string(),
        "profile" => ctx.profile_name.to_string(),
        _ => return None,
    };
    Some(value)
}

/// Expand every recognized `{TOKEN}` in `pattern`.
pub fn translate<Tz>(pattern: &str, ctx: &NamingContext<'_>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open..];
        match candidate[1..].find(['{', '}']) {
            Some(close) if candidate.as_bytes()[close + 1] == b'}' => {
                let token = &candidate[1..close + 1];
                match expand(token, ctx, now) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&candidate[..close + 2]),
                }
                rest = &candidate[close + 2..];
            }
            _ => {
                // unbalanced or nested brace: emit the '{' and keep scanning after it
                out.push('{');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand `pattern` with placeholder server and profile values.
pub fn preview<Tz>(pattern: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    translate(pattern, &PREVIEW_CONTEXT, now)
}
