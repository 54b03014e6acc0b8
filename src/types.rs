use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Upper bound on concurrently running jobs.
///
/// Accepts an integer (`jobs = 4`), `"unbounded"`, or `true` (meaning
/// unbounded) in config files and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawMaxJobs")]
pub enum MaxJobs {
    Unbounded,
    Limited(usize),
}

impl MaxJobs {
    /// Limit as a number, `None` when unbounded.
    pub fn limit(self) -> Option<usize> {
        match self {
            MaxJobs::Unbounded => None,
            MaxJobs::Limited(n) => Some(n),
        }
    }

    /// Whether more than one job may run at once.
    pub fn allows_parallelism(self) -> bool {
        match self {
            MaxJobs::Unbounded => true,
            MaxJobs::Limited(n) => n > 1,
        }
    }
}

impl Default for MaxJobs {
    fn default() -> Self {
        MaxJobs::Limited(1)
    }
}

impl fmt::Display for MaxJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxJobs::Unbounded => f.write_str("unbounded"),
            MaxJobs::Limited(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for MaxJobs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "unbounded" | "unlimited" | "true" => Ok(MaxJobs::Unbounded),
            other => match other.parse::<usize>() {
                Ok(0) => Err("jobs must be >= 1 (got 0)".to_string()),
                Ok(n) => Ok(MaxJobs::Limited(n)),
                Err(_) => Err(format!(
                    "invalid jobs value: {other} (expected a positive integer or \"unbounded\")"
                )),
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMaxJobs {
    Count(i64),
    Flag(bool),
    Word(String),
}

impl TryFrom<RawMaxJobs> for MaxJobs {
    type Error = String;

    fn try_from(raw: RawMaxJobs) -> Result<Self, Self::Error> {
        match raw {
            RawMaxJobs::Count(n) if n >= 1 => Ok(MaxJobs::Limited(n as usize)),
            RawMaxJobs::Count(n) => Err(format!("jobs must be >= 1 (got {n})")),
            RawMaxJobs::Flag(true) => Ok(MaxJobs::Unbounded),
            RawMaxJobs::Flag(false) => Ok(MaxJobs::Limited(1)),
            RawMaxJobs::Word(w) => w.parse(),
        }
    }
}

/// Whether a spawned process should get a pseudo-terminal for its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyMode {
    /// Use a pty only when stdout is a terminal and the job is in the
    /// foreground.
    #[default]
    Auto,
    Always,
    Never,
}

impl FromStr for PtyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(PtyMode::Auto),
            "always" => Ok(PtyMode::Always),
            "never" => Ok(PtyMode::Never),
            other => Err(format!(
                "invalid pty mode: {other} (expected \"auto\", \"always\" or \"never\")"
            )),
        }
    }
}

/// How relayed output is written to a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogWriteMode {
    /// Write every chunk as soon as it is read.
    #[default]
    Block,
    /// Only write complete lines; a trailing partial line is flushed at EOF.
    Line,
}

impl FromStr for LogWriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(LogWriteMode::Block),
            "line" => Ok(LogWriteMode::Line),
            other => Err(format!(
                "invalid log mode: {other} (expected \"block\" or \"line\")"
            )),
        }
    }
}
