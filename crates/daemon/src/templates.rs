//! Session log lines built from configurable templates.
//!
//! A template is first run through `strftime` (local time), then its
//! `{placeholder}` fields are filled in. Unknown placeholders are left as
//! they are. Missing values render as the configured null text, missing
//! ports and ids as `-1`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::format::{Item, StrftimeItems};
use protocol::{RealUser, RequestHeaders};

use crate::config::TemplatesConfig;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

/// Time since a session began.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    started: Instant,
}

/// Elapsed time expressed in each unit. Every field is a total, not a remainder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elapsed {
    pub seconds: f64,
    pub minutes: u64,
    pub hours: u64,
    pub days: u64,
    pub weeks: u64,
}

impl Elapsed {
    pub fn from_duration(elapsed: Duration) -> Self {
        let secs = elapsed.as_secs();
        Self {
            seconds: elapsed.as_secs_f64(),
            minutes: secs / MINUTE,
            hours: secs / HOUR,
            days: secs / DAY,
            weeks: secs / WEEK,
        }
    }
}

impl Counter {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Elapsed {
        Elapsed::from_duration(self.started.elapsed())
    }
}

/// What is known about the session when a line is rendered.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateFields<'a> {
    pub address: Option<SocketAddr>,
    pub request: Option<&'a RequestHeaders>,
    pub username: Option<&'a str>,
    pub userid: Option<i64>,
    pub real_user: Option<&'a RealUser>,
}

/// Renders the session begin, per-request and session end lines.
#[derive(Debug, Clone)]
pub struct Templates {
    config: TemplatesConfig,
    counter: Counter,
}

impl Templates {
    /// Starts the elapsed-time counter.
    pub fn new(config: TemplatesConfig) -> Self {
        Self {
            config,
            counter: Counter::start(),
        }
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    pub fn preface(&self, fields: &TemplateFields<'_>) -> String {
        self.render(&self.config.preface, fields)
    }

    pub fn intro(&self, fields: &TemplateFields<'_>) -> String {
        self.render(&self.config.intro, fields)
    }

    pub fn end(&self, fields: &TemplateFields<'_>) -> String {
        self.render(&self.config.end, fields)
    }

    pub fn render(&self, template: &str, fields: &TemplateFields<'_>) -> String {
        substitute(&strftime(template), &self.values(fields))
    }

    fn flag(&self, value: bool) -> String {
        if value {
            self.config.true_data.clone()
        } else {
            self.config.false_data.clone()
        }
    }

    fn or_null(&self, value: Option<String>) -> String {
        value.unwrap_or_else(|| self.config.null_data.clone())
    }

    fn values(&self, fields: &TemplateFields<'_>) -> HashMap<&'static str, String> {
        let elapsed = self.counter.elapsed();
        let request = fields.request;
        let node = request.and_then(RequestHeaders::node);

        HashMap::from([
            ("seconds", format!("{:.2}", elapsed.seconds)),
            ("minutes", elapsed.minutes.to_string()),
            ("hours", elapsed.hours.to_string()),
            ("days", elapsed.days.to_string()),
            ("weeks", elapsed.weeks.to_string()),
            (
                "address",
                self.or_null(fields.address.map(|a| a.ip().to_string())),
            ),
            (
                "port",
                fields.address.map_or(-1, |a| i64::from(a.port())).to_string(),
            ),
            (
                "path",
                self.or_null(request.map(|r| r.path().to_string())),
            ),
            (
                "action",
                self.or_null(request.map(|r| r.action().to_string())),
            ),
            ("force", self.flag(request.is_some_and(RequestHeaders::force))),
            ("node_addr", self.or_null(node.map(|n| n.address.clone()))),
            (
                "node_port",
                node.map_or(-1, |n| i64::from(n.port)).to_string(),
            ),
            (
                "username",
                self.or_null(
                    fields
                        .username
                        .filter(|name| !name.is_empty())
                        .map(str::to_string),
                ),
            ),
            ("userid", fields.userid.unwrap_or(-1).to_string()),
            ("real_user", self.or_null(fields.real_user.map(RealUser::to_hex))),
            // Bearer tokens never reach the logs, only a prefix of their hash.
            (
                "token",
                self.or_null(
                    request
                        .and_then(RequestHeaders::token_hash)
                        .map(|hash| hash.chars().take(12).collect()),
                ),
            ),
            (
                "is_packed",
                self.flag(request.map_or(true, RequestHeaders::is_packed)),
            ),
        ])
    }
}

/// Formats `strftime` sequences with the local time. Invalid sequences leave
/// the template untouched.
fn strftime(template: &str) -> String {
    if StrftimeItems::new(template).any(|item| matches!(item, Item::Error)) {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len());
    let now = chrono::Local::now();
    match write!(out, "{}", now.format_with_items(StrftimeItems::new(template))) {
        Ok(()) => out,
        Err(_) => template.to_string(),
    }
}

/// Replaces `{name}` with its value in a single pass.
fn substitute(template: &str, values: &HashMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail.find('}') {
            Some(close) => match values.get(&tail[1..close]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            },
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Node;

    fn templates() -> Templates {
        Templates::new(TemplatesConfig::default())
    }

    #[test]
    fn test_elapsed_units_are_totals() {
        let elapsed = Elapsed::from_duration(Duration::from_secs(WEEK + DAY + 90));
        assert_eq!(elapsed.weeks, 1);
        assert_eq!(elapsed.days, 8);
        assert_eq!(elapsed.hours, 8 * 24);
        assert_eq!(elapsed.minutes, (WEEK + DAY + 90) / 60);
    }

    #[test]
    fn test_missing_values_use_null_text() {
        let line = templates().render(
            "{address}:{port} {username}:{userid} {path}",
            &TemplateFields::default(),
        );
        assert_eq!(line, "null:-1 null:-1 null");
    }

    #[test]
    fn test_request_fields() {
        let mut request = RequestHeaders::new("/echo", "ping");
        request.set_force(true);
        request.set_node(Some(Node::new("10.0.0.2", 17000).unwrap()));
        let fields = TemplateFields {
            address: Some("192.168.1.5:40000".parse().unwrap()),
            request: Some(&request),
            username: Some("alice"),
            userid: Some(7),
            real_user: None,
        };
        let template = concat!(
            "{address}:{port} {path} {action} {force} ",
            "{node_addr}:{node_port} {username}:{userid} {token}",
        );
        let line = templates().render(template, &fields);
        assert_eq!(
            line,
            "192.168.1.5:40000 /echo ping true 10.0.0.2:17000 alice:7 null"
        );
    }

    #[test]
    fn test_token_is_not_logged() {
        let token = "ab".repeat(32);
        let mut request = RequestHeaders::new("/echo", "ping");
        request.set_token(Some(token.clone())).unwrap();
        let fields = TemplateFields {
            request: Some(&request),
            ..TemplateFields::default()
        };
        let line = templates().render("{token}", &fields);
        assert_eq!(line.len(), 12);
        assert!(!token.contains(&line));
    }

    #[test]
    fn test_unknown_placeholders_and_braces_survive() {
        let line = templates().render("{nope} {userid} {", &TemplateFields::default());
        assert_eq!(line, "{nope} -1 {");
    }

    #[test]
    fn test_values_are_not_reinterpreted() {
        let request = RequestHeaders::new("/{port}/%Y", "ping");
        let fields = TemplateFields {
            request: Some(&request),
            ..TemplateFields::default()
        };
        assert_eq!(templates().render("{path}", &fields), "/{port}/%Y");
    }

    #[test]
    fn test_strftime_applies() {
        let line = templates().render("%Y", &TemplateFields::default());
        assert_eq!(line.len(), 4);
        assert!(line.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_invalid_strftime_is_kept() {
        let line = templates().render("100%! {userid}", &TemplateFields::default());
        assert_eq!(line, "100%! -1");
    }
}
