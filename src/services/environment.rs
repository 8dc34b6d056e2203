//! Environment materializer
//!
//! Turns the `.env` template shipped with the application into the live
//! environment file: placeholder tokens are substituted with the public domain
//! and freshly generated secrets, then the result is scanned for leftovers.

use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{DeployError, DeployResult};

/// Generic marker that must never reach a live environment
const CHANGE_ME_MARKER: &str = "change-me";

/// Keys the application cannot start without
pub const REQUIRED_KEYS: &[&str] = &["SECRET_KEY", "DATABASE_URL", "ALLOWED_HOSTS"];

/// Keys the application reads when present
pub const OPTIONAL_KEYS: &[&str] = &[
    "REDIS_URL",
    "EMAIL_HOST",
    "EMAIL_PORT",
    "EMAIL_HOST_USER",
    "EMAIL_HOST_PASSWORD",
    "SENTRY_DSN",
];

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// No '-' (every marker contains one), no quotes, '$', '#', '&', '`' or spaces
// (the file is sourced by sh).
const SECRET_KEY_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@%^*_+=";

/// Placeholder tokens substituted during materialization
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Placeholder {
    Domain,
    SecretKey,
    DbPassword,
}

impl Placeholder {
    pub const ALL: [Placeholder; 3] = [
        Placeholder::Domain,
        Placeholder::SecretKey,
        Placeholder::DbPassword,
    ];

    /// Literal token in the template
    pub fn token(&self) -> &'static str {
        match self {
            Placeholder::Domain => "your-domain.com",
            Placeholder::SecretKey => "your-secret-key-here",
            Placeholder::DbPassword => "your-db-password",
        }
    }
}

/// Every string whose presence in a live environment is fatal
pub fn leak_markers() -> Vec<&'static str> {
    Placeholder::ALL
        .iter()
        .map(|p| p.token())
        .chain(std::iter::once(CHANGE_ME_MARKER))
        .collect()
}

/// One line of an environment file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvLine {
    Blank,
    Comment(String),
    Entry { key: String, value: String },
}

/// Parsed environment file, line order preserved
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvFile {
    lines: Vec<EnvLine>,
}

impl EnvFile {
    /// Parse `KEY=VALUE` lines; `export ` prefixes are dropped
    pub fn parse(text: &str) -> DeployResult<Self> {
        let mut lines = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                lines.push(EnvLine::Blank);
                continue;
            }
            if trimmed.starts_with('#') {
                lines.push(EnvLine::Comment(trimmed.to_string()));
                continue;
            }

            let body = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            let (key, value) = body.split_once('=').ok_or_else(|| DeployError::Template {
                line: idx + 1,
                message: format!("expected KEY=VALUE, got {:?}", trimmed),
            })?;
            let key = key.trim();
            if key.is_empty()
                || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                || key.starts_with(|c: char| c.is_ascii_digit())
            {
                return Err(DeployError::Template {
                    line: idx + 1,
                    message: format!("invalid key {:?}", key),
                });
            }
            lines.push(EnvLine::Entry {
                key: key.to_string(),
                value: value.trim().to_string(),
            });
        }
        Ok(Self { lines })
    }

    pub fn lines(&self) -> &[EnvLine] {
        &self.lines
    }

    /// Value of the last assignment to `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            EnvLine::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            EnvLine::Entry { key, .. } => Some(key.as_str()),
            _ => None,
        })
    }

    /// Serialize; identical input always gives identical bytes
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                EnvLine::Blank => out.push('\n'),
                EnvLine::Comment(c) => {
                    let _ = writeln!(out, "{}", c);
                }
                EnvLine::Entry { key, value } => {
                    let _ = writeln!(out, "{}={}", key, value);
                }
            }
        }
        out
    }

    /// SHA-256 of the rendered file
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Required keys that are missing or empty
    pub fn missing_required(&self) -> Vec<String> {
        REQUIRED_KEYS
            .iter()
            .filter(|k| self.get(k).map_or(true, |v| v.is_empty()))
            .map(|k| k.to_string())
            .collect()
    }

    /// Optional keys that are absent
    pub fn missing_optional(&self) -> Vec<&'static str> {
        OPTIONAL_KEYS
            .iter()
            .copied()
            .filter(|k| self.get(k).is_none())
            .collect()
    }
}

/// Markers present anywhere in `text`
pub fn scan_for_leaks(text: &str) -> Vec<String> {
    leak_markers()
        .into_iter()
        .filter(|m| text.contains(m))
        .map(|m| m.to_string())
        .collect()
}

/// Fail on leaked markers or missing required keys
pub fn validate(env: &EnvFile) -> DeployResult<()> {
    let leaks = scan_for_leaks(&env.render());
    if !leaks.is_empty() {
        return Err(DeployError::PlaceholderLeak { markers: leaks });
    }
    let missing = env.missing_required();
    if !missing.is_empty() {
        return Err(DeployError::MissingKeys { keys: missing });
    }
    Ok(())
}

/// Substitution values for one materialization
#[derive(Clone, Debug)]
pub struct Substitutions {
    values: BTreeMap<Placeholder, String>,
}

impl Substitutions {
    /// Domain plus freshly generated secrets
    pub fn generate(domain: &str) -> Self {
        let mut values = BTreeMap::new();
        values.insert(Placeholder::Domain, domain.to_string());
        values.insert(Placeholder::SecretKey, generate_secret(SECRET_KEY_CHARSET, 50));
        values.insert(Placeholder::DbPassword, generate_secret(ALPHANUMERIC, 32));
        Self { values }
    }

    /// Fixed values
    pub fn from_values(values: impl IntoIterator<Item = (Placeholder, String)>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    pub fn get(&self, placeholder: Placeholder) -> Option<&str> {
        self.values.get(&placeholder).map(String::as_str)
    }

    /// Replace every token occurrence in `value` in a single left-to-right pass
    ///
    /// Replacement text is never scanned again, so each occurrence is replaced
    /// exactly once even if a value happened to contain a token.
    fn substitute(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        loop {
            let next = self
                .values
                .iter()
                .filter_map(|(p, v)| rest.find(p.token()).map(|pos| (pos, p.token(), v)))
                .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())));

            match next {
                Some((pos, token, replacement)) => {
                    out.push_str(&rest[..pos]);
                    out.push_str(replacement);
                    rest = &rest[pos + token.len()..];
                }
                None => {
                    out.push_str(rest);
                    return out;
                }
            }
        }
    }
}

/// Random string from `charset`, drawn from the operating system CSPRNG
pub fn generate_secret(charset: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| charset[OsRng.gen_range(0..charset.len())] as char)
        .collect()
}

/// Materialize `template` and validate the result
pub fn materialize(template: &EnvFile, subs: &Substitutions) -> DeployResult<EnvFile> {
    let lines = template
        .lines
        .iter()
        .map(|line| match line {
            EnvLine::Entry { key, value } => EnvLine::Entry {
                key: key.clone(),
                value: subs.substitute(value),
            },
            other => other.clone(),
        })
        .collect();
    let env = EnvFile { lines };

    let missing = env.missing_optional();
    if !missing.is_empty() {
        tracing::warn!(keys = ?missing, "Optional environment keys not set");
    }

    validate(&env)?;
    Ok(env)
}
