//! PEP 440 style version specifiers (`>=2.40, <3`, `~=1.4`, `==6.*`).
//!
//! Release segments are normalized to `major.minor.patch` and compared with
//! `semver` ordering. Pre-release and local version suffixes are not part of
//! the grammar, and releases with more than three segments (`2.40.0.1`) are
//! rejected rather than truncated.

use std::fmt;
use std::str::FromStr;

use semver::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEq,
    LessEq,
    Greater,
    Less,
    Compatible,
    Arbitrary,
}

// Longest tokens first so `===` is not read as `==`.
const OPERATORS: [(&str, Operator); 8] = [
    ("===", Operator::Arbitrary),
    ("~=", Operator::Compatible),
    ("==", Operator::Equal),
    ("!=", Operator::NotEqual),
    (">=", Operator::GreaterEq),
    ("<=", Operator::LessEq),
    (">", Operator::Greater),
    ("<", Operator::Less),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub op: Operator,
    pub version: Version,
    /// Number of release segments written (`1.4` has two).
    pub segments: usize,
    pub wildcard: bool,
    raw_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintError {
    #[error("version constraint is empty")]
    Empty,
    #[error("empty clause")]
    EmptyClause,
    #[error("clause {0:?} has no comparison operator")]
    MissingOperator(String),
    #[error("clause {0:?} has no version")]
    MissingVersion(String),
    #[error("invalid version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },
    #[error("wildcard in {0:?} is only allowed with == or !=")]
    MisplacedWildcard(String),
    #[error("~= in {0:?} needs at least two release segments")]
    CompatibleTooShort(String),
}

impl VersionConstraint {
    pub fn matches(&self, version: &Version) -> bool {
        self.clauses.iter().all(|clause| clause.matches(version))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionConstraint {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(ConstraintError::Empty);
        }

        let clauses = raw
            .split(',')
            .map(parse_clause)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            clauses,
        })
    }
}

impl Clause {
    pub fn matches(&self, version: &Version) -> bool {
        let candidate = release_only(version);
        match self.op {
            Operator::Equal if self.wildcard => self.prefix_matches(&candidate, self.segments),
            Operator::NotEqual if self.wildcard => !self.prefix_matches(&candidate, self.segments),
            Operator::Equal => candidate == self.version,
            Operator::NotEqual => candidate != self.version,
            Operator::GreaterEq => candidate >= self.version,
            Operator::LessEq => candidate <= self.version,
            Operator::Greater => candidate > self.version,
            Operator::Less => candidate < self.version,
            Operator::Compatible => {
                candidate >= self.version && self.prefix_matches(&candidate, self.segments - 1)
            }
            Operator::Arbitrary => version.to_string() == self.raw_version,
        }
    }

    fn prefix_matches(&self, candidate: &Version, segments: usize) -> bool {
        let wanted = [self.version.major, self.version.minor, self.version.patch];
        let actual = [candidate.major, candidate.minor, candidate.patch];
        wanted[..segments.min(3)] == actual[..segments.min(3)]
    }
}

fn parse_clause(clause: &str) -> Result<Clause, ConstraintError> {
    let clause = clause.trim();
    if clause.is_empty() {
        return Err(ConstraintError::EmptyClause);
    }

    let (op, rest) = OPERATORS
        .iter()
        .find_map(|(token, op)| clause.strip_prefix(token).map(|rest| (*op, rest)))
        .ok_or_else(|| ConstraintError::MissingOperator(clause.to_string()))?;

    let mut text = rest.trim();
    if text.is_empty() {
        return Err(ConstraintError::MissingVersion(clause.to_string()));
    }

    if op == Operator::Arbitrary {
        return Ok(Clause {
            op,
            version: Version::new(0, 0, 0),
            segments: 0,
            wildcard: false,
            raw_version: text.to_string(),
        });
    }

    let wildcard = text.ends_with(".*");
    if wildcard {
        if !matches!(op, Operator::Equal | Operator::NotEqual) {
            return Err(ConstraintError::MisplacedWildcard(clause.to_string()));
        }
        text = &text[..text.len() - 2];
    }

    let (version, segments) = parse_release(text)?;
    if op == Operator::Compatible && segments < 2 {
        return Err(ConstraintError::CompatibleTooShort(clause.to_string()));
    }

    Ok(Clause {
        op,
        version,
        segments,
        wildcard,
        raw_version: text.to_string(),
    })
}

fn parse_release(text: &str) -> Result<(Version, usize), ConstraintError> {
    let trimmed = text.strip_prefix('v').unwrap_or(text);
    let segments = trimmed.split('.').count();
    if segments > 3 {
        return Err(ConstraintError::InvalidVersion {
            version: text.to_string(),
            reason: "at most three release segments are supported".to_string(),
        });
    }
    let padded = match segments {
        1 => format!("{trimmed}.0.0"),
        2 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };

    Version::parse(&padded)
        .map(|version| (version, segments))
        .map_err(|err| ConstraintError::InvalidVersion {
            version: text.to_string(),
            reason: err.to_string(),
        })
}

fn release_only(version: &Version) -> Version {
    Version::new(version.major, version.minor, version.patch)
}
