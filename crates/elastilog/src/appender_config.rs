//! 🔧 Appender Configuration, the six knobs between a log line and a cluster.
//!
//! 📡 "Mandatory appender index name setting should be provided", the error message
//! every on-call engineer has seen at least once, usually at 3am, usually in prod. 🦆
//!
//! 🧠 Knowledge graph:
//! - Input: a flat string-keyed table (`retry`, `index`, `_type`, `hosts`, `port`, `ttl`).
//!   This is what a logging framework hands an appender. Strings. All of it. Always strings.
//! - Output: an immutable [`AppenderConfig`], or a [`ConfigError`] that names the field
//!   you got wrong. No guessing. No "invalid configuration" with zero context.
//! - Numbers that are absent or blank take their default. Numbers that are present must
//!   parse AND land inside their range, or construction fails.
//! - Hosts are comma separated, trimmed, and empty entries are dropped. Nothing left? localhost.

use std::collections::HashMap;

use thiserror::Error;

/// ⏱️ Seconds between retry attempts. Optional, [0, 60], default 1.
pub const PARAM_RETRY: &str = "retry";
/// 📦 Target index name. Mandatory.
pub const PARAM_INDEX: &str = "index";
/// 🏷️ Target document type. Mandatory. The underscore is load-bearing.
pub const PARAM_TYPE: &str = "_type";
/// 📡 Comma separated hosts, e.g. `"192.168.1.1, 192.168.1.2"`. Optional, default localhost.
pub const PARAM_HOSTS: &str = "hosts";
/// 🔌 Backend port. Optional, [1000, 65535], default 9200.
pub const PARAM_PORT: &str = "port";
/// 🗑️ Document time-to-live, passed through untouched. Optional, default "".
pub const PARAM_TTL: &str = "ttl";

const RETRY_RANGE: (i64, i64) = (0, 60);
const PORT_RANGE: (i64, i64) = (1000, 65535);
const DEFAULT_RETRY_SECONDS: u64 = 1;
const DEFAULT_PORT: u16 = 9200;
const DEFAULT_HOST: &str = "localhost";

/// 💀 Everything that can go wrong while turning strings into settings.
///
/// Each variant carries the offending field so the caller can point a finger.
/// Politely. With a line number, ideally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("💀 Mandatory appender setting '{field}' is missing or blank")]
    Missing { field: &'static str },

    #[error("💀 Invalid '{field}' value '{value}': not an integer, no matter how hard you squint")]
    NotANumber { field: &'static str, value: String },

    #[error("💀 Invalid '{field}' value '{value}': expected an integer in [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: i64,
        max: i64,
    },
}

impl ConfigError {
    /// 🎯 The field that ruined everything.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigError::Missing { field }
            | ConfigError::NotANumber { field, .. }
            | ConfigError::OutOfRange { field, .. } => field,
        }
    }
}

/// 📦 Validated, immutable appender settings.
///
/// There are no setters that skip validation. The `with_*` methods consume `self`
/// and hand back a fresh, re-validated value, so an invalid `AppenderConfig`
/// cannot exist outside of this module. The borrow checker and I agree on this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppenderConfig {
    retry_seconds: u64,
    index: String,
    doc_type: String,
    hosts: Vec<String>,
    port: u16,
    ttl: String,
}

impl AppenderConfig {
    /// 🚀 Programmatic constructor: index + type, everything else defaulted.
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>) -> Result<Self, ConfigError> {
        let index = required(PARAM_INDEX, &index.into())?;
        let doc_type = required(PARAM_TYPE, &doc_type.into())?;
        Ok(Self {
            retry_seconds: DEFAULT_RETRY_SECONDS,
            index,
            doc_type,
            hosts: vec![DEFAULT_HOST.to_string()],
            port: DEFAULT_PORT,
            ttl: String::new(),
        })
    }

    /// 🔧 The string-keyed front door. Takes exactly what a logging framework would
    /// hand an appender and either returns settings or names the culprit.
    ///
    /// | Key | Default |
    /// |---|---|
    /// | `retry` | 1 |
    /// | `index` | required |
    /// | `_type` | required |
    /// | `hosts` | localhost |
    /// | `port` | 9200 |
    /// | `ttl` | "" |
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| params.get(key).map(String::as_str).unwrap_or("");

        // -- 🔢 numbers first, so a bad retry is reported even when the index is missing too
        let retry_seconds = parse_bounded(
            PARAM_RETRY,
            lookup(PARAM_RETRY),
            RETRY_RANGE,
            DEFAULT_RETRY_SECONDS as i64,
        )?;
        let index = required(PARAM_INDEX, lookup(PARAM_INDEX))?;
        let doc_type = required(PARAM_TYPE, lookup(PARAM_TYPE))?;
        let hosts = parse_hosts(lookup(PARAM_HOSTS));
        let port = parse_bounded(PARAM_PORT, lookup(PARAM_PORT), PORT_RANGE, DEFAULT_PORT as i64)?;

        Ok(Self {
            // -- ✅ both ranges are non-negative and fit, the casts cannot truncate
            retry_seconds: retry_seconds as u64,
            index,
            doc_type,
            hosts,
            port: port as u16,
            ttl: lookup(PARAM_TTL).to_string(),
        })
    }

    pub fn with_retry_seconds(mut self, retry_seconds: u64) -> Result<Self, ConfigError> {
        check_range(PARAM_RETRY, retry_seconds as i64, RETRY_RANGE)?;
        self.retry_seconds = retry_seconds;
        Ok(self)
    }

    pub fn with_port(mut self, port: u16) -> Result<Self, ConfigError> {
        check_range(PARAM_PORT, port as i64, PORT_RANGE)?;
        self.port = port;
        Ok(self)
    }

    /// 📡 Replace the host list. Entries are trimmed, blanks dropped, and an empty
    /// list quietly becomes `["localhost"]`. Hosts cannot fail validation.
    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: Vec<String> = hosts.into_iter().map(|h| h.as_ref().to_string()).collect();
        self.hosts = parse_hosts(&joined.join(","));
        self
    }

    pub fn with_ttl(mut self, ttl: impl Into<String>) -> Self {
        self.ttl = ttl.into();
        self
    }

    pub fn retry_seconds(&self) -> u64 {
        self.retry_seconds
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ttl(&self) -> &str {
        &self.ttl
    }
}

fn required(field: &'static str, raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Missing { field });
    }
    Ok(trimmed.to_string())
}

/// 🔢 Blank means default. Anything else must parse and fit. No third option.
fn parse_bounded(
    field: &'static str,
    raw: &str,
    range: (i64, i64),
    default: i64,
) -> Result<i64, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(default);
    }
    let value: i64 = trimmed.parse().map_err(|_| ConfigError::NotANumber {
        field,
        value: trimmed.to_string(),
    })?;
    check_range(field, value, range)?;
    Ok(value)
}

fn check_range(field: &'static str, value: i64, (min, max): (i64, i64)) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            min,
            max,
        });
    }
    Ok(())
}

fn parse_hosts(raw: &str) -> Vec<String> {
    let hosts: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect();
    if hosts.is_empty() {
        // -- 🏠 no hosts? there's no place like localhost
        vec![DEFAULT_HOST.to_string()]
    } else {
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn the_one_where_only_the_mandatory_bits_show_up_and_defaults_fill_the_rest() {
        let config = AppenderConfig::from_params(&params(&[("index", "logs"), ("_type", "event")]))
            .expect("💀 index + type should be enough to get through the door");

        assert_eq!(config.index(), "logs");
        assert_eq!(config.doc_type(), "event");
        assert_eq!(config.retry_seconds(), 1);
        assert_eq!(config.port(), 9200);
        assert_eq!(config.hosts(), ["localhost"]);
        assert_eq!(config.ttl(), "");
    }

    #[test]
    fn the_one_where_index_or_type_go_missing() {
        for broken in [
            params(&[("_type", "event")]),
            params(&[("index", "   "), ("_type", "event")]),
            params(&[("index", "logs")]),
            params(&[("index", "logs"), ("_type", "")]),
        ] {
            let err = AppenderConfig::from_params(&broken)
                .expect_err("💀 a config without a name is a config without a purpose");
            assert!(matches!(err, ConfigError::Missing { .. }));
            assert!(err.field() == PARAM_INDEX || err.field() == PARAM_TYPE);
        }

        let err = AppenderConfig::new("logs", " ").expect_err("blank type must fail");
        assert_eq!(err.field(), PARAM_TYPE);
    }

    #[test]
    fn the_one_where_retry_wanders_outside_its_fence() {
        for bad in ["-1", "61", "1000"] {
            let err = AppenderConfig::from_params(&params(&[
                ("index", "logs"),
                ("_type", "event"),
                ("retry", bad),
            ]))
            .expect_err("💀 retry outside [0,60] should be rejected");
            assert_eq!(err.field(), PARAM_RETRY);
        }
        for good in ["0", "30", "60", " 7 "] {
            let config = AppenderConfig::from_params(&params(&[
                ("index", "logs"),
                ("_type", "event"),
                ("retry", good),
            ]))
            .expect("retry inside the range is fine");
            assert_eq!(config.retry_seconds(), good.trim().parse::<u64>().unwrap());
        }
    }

    #[test]
    fn the_one_where_port_must_be_between_1000_and_65535() {
        for bad in ["999", "65536", "0", "-9200"] {
            let err = AppenderConfig::from_params(&params(&[
                ("index", "logs"),
                ("_type", "event"),
                ("port", bad),
            ]))
            .expect_err("💀 port outside the range should be rejected");
            assert_eq!(err.field(), PARAM_PORT);
            assert!(matches!(err, ConfigError::OutOfRange { .. }));
        }
        for good in ["1000", "9243", "65535"] {
            let config = AppenderConfig::from_params(&params(&[
                ("index", "logs"),
                ("_type", "event"),
                ("port", good),
            ]))
            .expect("port in range is fine");
            assert_eq!(config.port().to_string(), good);
        }
    }

    #[test]
    fn the_one_where_port_is_not_even_a_number() {
        let err = AppenderConfig::from_params(&params(&[
            ("index", "logs"),
            ("_type", "event"),
            ("port", "ninety-two hundred"),
        ]))
        .expect_err("words are not ports");
        assert_eq!(
            err,
            ConfigError::NotANumber {
                field: PARAM_PORT,
                value: "ninety-two hundred".to_string()
            }
        );
    }

    #[test]
    fn the_one_where_hosts_get_a_haircut() {
        let config = AppenderConfig::from_params(&params(&[
            ("index", "logs"),
            ("_type", "event"),
            ("hosts", "h1, h2"),
        ]))
        .expect("hosts parse");
        assert_eq!(config.hosts(), ["h1", "h2"]);

        let config = AppenderConfig::from_params(&params(&[
            ("index", "logs"),
            ("_type", "event"),
            ("hosts", " , ,"),
        ]))
        .expect("hosts parse");
        assert_eq!(config.hosts(), ["localhost"]);
    }

    #[test]
    fn the_one_where_the_builder_keeps_the_same_rules() {
        let config = AppenderConfig::new(" logs ", "event")
            .and_then(|c| c.with_retry_seconds(0))
            .and_then(|c| c.with_port(1234))
            .expect("builder happy path")
            .with_hosts(["a ", "", " b"])
            .with_ttl("1d");

        assert_eq!(config.index(), "logs");
        assert_eq!(config.retry_seconds(), 0);
        assert_eq!(config.port(), 1234);
        assert_eq!(config.hosts(), ["a", "b"]);
        assert_eq!(config.ttl(), "1d");

        let config = AppenderConfig::new("logs", "event").unwrap();
        assert!(config.clone().with_port(80).is_err());
        assert!(config.with_retry_seconds(61).is_err());
    }
}
