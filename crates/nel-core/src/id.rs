//! Invocation and job identifiers.
//!
//! An invocation id is 16 lowercase hex characters minted at submit time. A
//! job id is `<invocation_id>.<zero-based task index>`. Both encodings are
//! stable: they appear in the database, in directory names, and on the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier for one submission of a run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    /// Mint a fresh invocation id (16 hex chars of v4 UUID entropy).
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(hex[..16].to_string())
    }

    /// Parse and validate an invocation id.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            Ok(Self(s.to_string()))
        } else {
            Err(crate::Error::InvalidIdentifier {
                value: s.to_string(),
                reason: "expected 16 lowercase hex characters".to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The job id for the task at `index` within this invocation.
    pub fn job(&self, index: usize) -> JobId {
        JobId {
            invocation: self.clone(),
            index,
        }
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for one (task x execution) unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId {
    pub invocation: InvocationId,
    pub index: usize,
}

impl JobId {
    /// Parse `<invocation>.<index>`.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (inv, idx) = s.split_once('.').ok_or_else(|| crate::Error::InvalidIdentifier {
            value: s.to_string(),
            reason: "expected <invocation>.<index>".to_string(),
        })?;
        let invocation = InvocationId::parse(inv)?;
        let index = idx.parse::<usize>().map_err(|_| crate::Error::InvalidIdentifier {
            value: s.to_string(),
            reason: "task index is not a non-negative integer".to_string(),
        })?;
        Ok(Self { invocation, index })
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.invocation, self.index)
    }
}

/// Either a whole invocation or a single job, as accepted by the API facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Invocation(InvocationId),
    Job(JobId),
}

impl Identifier {
    pub fn invocation(&self) -> &InvocationId {
        match self {
            Identifier::Invocation(inv) => inv,
            Identifier::Job(job) => &job.invocation,
        }
    }
}

impl FromStr for Identifier {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        if s.contains('.') {
            Ok(Identifier::Job(JobId::parse(s)?))
        } else {
            Ok(Identifier::Invocation(InvocationId::parse(s)?))
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Invocation(inv) => inv.fmt(f),
            Identifier::Job(job) => job.fmt(f),
        }
    }
}
