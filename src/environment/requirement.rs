//! Requirement strings and version constraint matching.
//!
//! Covers the subset of Python packaging rules needed to cross-check a
//! manifest against an installed-package inventory: canonical names, extras
//! and environment markers (ignored), and the comparison operators
//! `==`, `!=`, `>=`, `<=`, `>`, `<`, `~=`, `===`, including `==X.*` prefixes.

use std::cmp::Ordering;
use std::fmt;

/// Canonical package name: lowercase, runs of `-`, `_` and `.` collapsed to `-`.
pub fn canonicalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_sep {
                out.push('-');
                in_sep = true;
            }
        } else {
            out.push(c.to_ascii_lowercase());
            in_sep = false;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
    Compatible,
    Arbitrary,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::GreaterEqual => ">=",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::Less => "<",
            Self::Compatible => "~=",
            Self::Arbitrary => "===",
        }
    }
}

// Longest tokens first so `===` is not read as `==`.
const OPERATORS: [(&str, Operator); 8] = [
    ("===", Operator::Arbitrary),
    ("~=", Operator::Compatible),
    ("==", Operator::Equal),
    ("!=", Operator::NotEqual),
    (">=", Operator::GreaterEqual),
    ("<=", Operator::LessEqual),
    (">", Operator::Greater),
    ("<", Operator::Less),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specifier {
    pub op: Operator,
    pub version: String,
}

impl Specifier {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (op, rest) = OPERATORS
            .iter()
            .find_map(|(tok, op)| raw.strip_prefix(tok).map(|rest| (*op, rest)))?;
        let version = rest.trim();
        if version.is_empty() {
            return None;
        }
        Some(Self {
            op,
            version: version.to_string(),
        })
    }

    /// Whether `installed` satisfies this constraint.
    pub fn matches(&self, installed: &str) -> bool {
        if self.op == Operator::Arbitrary {
            return self.version.eq_ignore_ascii_case(installed.trim());
        }

        let Some(have) = Version::parse(installed) else {
            return false;
        };

        if let Some(prefix) = self.version.strip_suffix(".*") {
            let Some(want) = Version::parse(prefix) else {
                return false;
            };
            let hit = have.epoch == want.epoch && have.release_starts_with(&want.release);
            return match self.op {
                Operator::Equal => hit,
                Operator::NotEqual => !hit,
                _ => false,
            };
        }

        let Some(want) = Version::parse(&self.version) else {
            return false;
        };
        let ord = have.cmp(&want);

        match self.op {
            Operator::Equal => ord == Ordering::Equal,
            Operator::NotEqual => ord != Ordering::Equal,
            Operator::GreaterEqual => ord != Ordering::Less,
            Operator::LessEqual => ord != Ordering::Greater,
            Operator::Greater => ord == Ordering::Greater,
            Operator::Less => ord == Ordering::Less,
            Operator::Compatible => {
                if ord == Ordering::Less {
                    return false;
                }
                if want.release.len() < 2 {
                    return true;
                }
                let prefix = &want.release[..want.release.len() - 1];
                have.epoch == want.epoch && have.release_starts_with(prefix)
            }
            Operator::Arbitrary => self.version.eq_ignore_ascii_case(installed.trim()),
        }
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// A single dependency requirement: canonical name plus version constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub specifiers: Vec<Specifier>,
}

impl Requirement {
    /// Parse a requirement line such as `numpy>=1.20,<2; python_version>"3.8"`.
    ///
    /// Returns `None` for installer options, URLs, editable installs and
    /// anything else that does not name a package.
    pub fn parse(line: &str) -> Option<Self> {
        // environment markers are ignored
        let line = line.split(';').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with('-') || (line.contains("://") && !line.contains('@')) {
            return None;
        }

        let name_end = line
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(line.len());
        let name = &line[..name_end];
        if name.is_empty() {
            return None;
        }

        let mut rest = line[name_end..].trim_start();
        if rest.starts_with('[') {
            let close = rest.find(']')?;
            rest = rest[close + 1..].trim_start();
        }

        // `name @ url` direct references carry no version constraint
        if rest.starts_with('@') {
            return Some(Self {
                name: canonicalize_name(name),
                specifiers: Vec::new(),
            });
        }

        let rest = rest
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .trim();

        let mut specifiers = Vec::new();
        if !rest.is_empty() {
            for part in rest.split(',') {
                specifiers.push(Specifier::parse(part)?);
            }
        }

        Some(Self {
            name: canonicalize_name(name),
            specifiers,
        })
    }

    pub fn is_satisfied_by(&self, installed_version: &str) -> bool {
        self.specifiers.iter().all(|s| s.matches(installed_version))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        let specs: Vec<String> = self.specifiers.iter().map(|s| s.to_string()).collect();
        if !specs.is_empty() {
            write!(f, "{}", specs.join(","))?;
        }
        Ok(())
    }
}

/// Parsed version. Local labels (`+cpu`) are dropped.
#[derive(Debug, Clone)]
pub struct Version {
    epoch: u64,
    release: Vec<u64>,
    pre: Option<(u8, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
}

impl Version {
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        let mut s = lowered.strip_prefix('v').unwrap_or(&lowered);
        if let Some(idx) = s.find('+') {
            s = &s[..idx];
        }

        let mut epoch = 0;
        if let Some((e, rest)) = s.split_once('!') {
            epoch = e.parse().ok()?;
            s = rest;
        }

        let release_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let release_str = s[..release_end].trim_end_matches('.');
        if release_str.is_empty() {
            return None;
        }
        let release = release_str
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;

        let mut version = Self {
            epoch,
            release,
            pre: None,
            post: None,
            dev: None,
        };

        let mut rest = &s[release_end..];
        while !rest.is_empty() {
            rest = rest.trim_start_matches(['.', '-', '_']);
            if rest.is_empty() {
                break;
            }
            let label_end = rest
                .find(|c: char| !c.is_ascii_alphabetic())
                .unwrap_or(rest.len());
            let label = &rest[..label_end];
            rest = rest[label_end..].trim_start_matches(['.', '-', '_']);
            let num_end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            let num = if num_end == 0 { 0 } else { rest[..num_end].parse().ok()? };
            rest = &rest[num_end..];

            match label {
                "a" | "alpha" => version.pre = Some((0, num)),
                "b" | "beta" => version.pre = Some((1, num)),
                "rc" | "c" | "pre" | "preview" => version.pre = Some((2, num)),
                "post" | "rev" | "r" => version.post = Some(num),
                // implicit post release: `1.0-1`
                "" if num_end > 0 => version.post = Some(num),
                "dev" => version.dev = Some(num),
                _ => return None,
            }
        }

        Some(version)
    }

    fn release_starts_with(&self, prefix: &[u64]) -> bool {
        prefix
            .iter()
            .enumerate()
            .all(|(i, p)| self.release.get(i).copied().unwrap_or(0) == *p)
    }

    fn trimmed_release(&self) -> &[u64] {
        let mut end = self.release.len();
        while end > 1 && self.release[end - 1] == 0 {
            end -= 1;
        }
        &self.release[..end]
    }

    // (pre, post, dev) keys ordered the way packaging tools order them:
    // 1.0.dev0 < 1.0a1 < 1.0 < 1.0.post1
    fn suffix_key(&self) -> ((i8, u64), (i8, u64), (i8, u64)) {
        let pre = match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => (-1, 0),
            (None, _, _) => (1, 0),
            (Some((rank, n)), _, _) => (0, (rank as u64) << 32 | n),
        };
        let post = match self.post {
            None => (-1, 0),
            Some(n) => (0, n),
        };
        let dev = match self.dev {
            None => (1, 0),
            Some(n) => (0, n),
        };
        (pre, post, dev)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.trimmed_release().cmp(other.trimmed_release()))
            .then_with(|| self.suffix_key().cmp(&other.suffix_key()))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
