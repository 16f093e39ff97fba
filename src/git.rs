//! Git repository operations.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::commit::{CommitRecord, ParseError};

/// Which commits to rewrite, counted back from `HEAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRange {
    /// The last `n` commits.
    Tail(usize),
    /// Everything reachable from `HEAD`.
    All,
}

/// Where `HEAD` points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadRef {
    /// A branch, by full ref name (`refs/heads/main`).
    Branch(String),
    Detached,
}

impl HeadRef {
    /// The ref to move once the rewrite is done.
    pub fn refname(&self) -> &str {
        match self {
            HeadRef::Branch(name) => name,
            HeadRef::Detached => "HEAD",
        }
    }

    /// Short branch name, `detached` when there is none.
    pub fn short_name(&self) -> &str {
        match self {
            HeadRef::Branch(name) => name.strip_prefix("refs/heads/").unwrap_or(name),
            HeadRef::Detached => "detached",
        }
    }
}

/// The operations the rewriter needs from a version-control engine.
pub trait Repository {
    /// Full id of the commit `HEAD` resolves to.
    fn head(&self) -> Result<String, Error>;

    fn head_ref(&self) -> Result<HeadRef, Error>;

    /// Ids in `range`, oldest first.
    fn commit_ids(&self, range: CommitRange) -> Result<Vec<String>, Error>;

    fn read_commit(&self, id: &str) -> Result<CommitRecord, Error>;

    /// Store `record` and return its new content-addressed id.
    fn write_commit(&self, record: &CommitRecord) -> Result<String, Error>;

    fn ref_exists(&self, refname: &str) -> bool;

    /// Create branch `name` at `target`. Fails if it already exists.
    fn create_branch(&self, name: &str, target: &str) -> Result<(), Error>;

    /// Point `refname` at `new`, but only if it still points at `old`.
    fn update_ref(&self, refname: &str, new: &str, old: &str) -> Result<(), Error>;

    /// Full records in `range`, oldest first.
    fn list_commits(&self, range: CommitRange) -> Result<Vec<CommitRecord>, Error> {
        self.commit_ids(range)?
            .iter()
            .map(|id| self.read_commit(id))
            .collect()
    }
}

/// A git repository handle that drives the `git` executable.
pub struct Git {
    root: PathBuf,
}

impl Git {
    /// Find the git repository root containing the given directory.
    pub fn discover(start: &Path) -> Result<Self, Error> {
        if !start.is_dir() {
            return Err(Error::NotARepo(start.display().to_string()));
        }

        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(start)
            .output()
            .map_err(|e| Error::Exec(format!("git rev-parse: {e}")))?;

        if !output.status.success() {
            return Err(Error::NotARepo(start.display().to_string()));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self {
            root: PathBuf::from(root),
        })
    }

    /// Get the repository root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Run a git command that produces no output we care about.
    fn run(&self, args: &[&str]) -> Result<(), Error> {
        self.run_raw(args, None).map(|_| ())
    }

    /// Run a git command and capture its stdout.
    fn run_output(&self, args: &[&str]) -> Result<String, Error> {
        let stdout = self.run_raw(args, None)?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    /// Run a git command, optionally feeding `input` on stdin, and return raw stdout.
    fn run_raw(&self, args: &[&str], input: Option<&[u8]>) -> Result<Vec<u8>, Error> {
        tracing::debug!(args = ?args, "git");
        let command = args.first().copied().unwrap_or_default();
        let exec_err = |e: std::io::Error| Error::Exec(format!("git {command}: {e}"));

        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(exec_err)?;

        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).map_err(exec_err)?;
        }

        let output = child.wait_with_output().map_err(exec_err)?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Failed(format!("git {}: {}", args.join(" "), stderr.trim())))
        }
    }
}

impl Repository for Git {
    fn head(&self) -> Result<String, Error> {
        let hash = self.run_output(&["rev-parse", "--verify", "HEAD^{commit}"])?;
        Ok(hash.trim().to_string())
    }

    fn head_ref(&self) -> Result<HeadRef, Error> {
        // `symbolic-ref -q` exits 1 with no output on a detached HEAD.
        match self.run_output(&["symbolic-ref", "-q", "HEAD"]) {
            Ok(name) => Ok(HeadRef::Branch(name.trim().to_string())),
            Err(Error::Failed(_)) => Ok(HeadRef::Detached),
            Err(e) => Err(e),
        }
    }

    fn commit_ids(&self, range: CommitRange) -> Result<Vec<String>, Error> {
        let limit;
        let mut args = vec!["rev-list", "--topo-order"];
        if let CommitRange::Tail(n) = range {
            limit = format!("--max-count={n}");
            args.push(limit.as_str());
        }
        args.push("HEAD");

        let output = self.run_output(&args)?;
        let mut ids: Vec<String> = output.lines().map(str::to_string).collect();
        ids.reverse();
        Ok(ids)
    }

    fn read_commit(&self, id: &str) -> Result<CommitRecord, Error> {
        let raw = self.run_raw(&["cat-file", "commit", id], None)?;
        Ok(CommitRecord::parse(id, &raw)?)
    }

    fn write_commit(&self, record: &CommitRecord) -> Result<String, Error> {
        let raw = record.to_raw();
        let stdout = self.run_raw(&["hash-object", "-t", "commit", "-w", "--stdin"], Some(&raw))?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    fn ref_exists(&self, refname: &str) -> bool {
        self.run(&["rev-parse", "--verify", "--quiet", refname]).is_ok()
    }

    fn create_branch(&self, name: &str, target: &str) -> Result<(), Error> {
        self.run(&["branch", name, target])
    }

    fn update_ref(&self, refname: &str, new: &str, old: &str) -> Result<(), Error> {
        self.run(&["update-ref", "-m", "punchclock: rewrite commit dates", refname, new, old])
    }
}

/// Errors from git operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to execute: {0}")]
    Exec(String),

    #[error("not a git repository: '{0}'")]
    NotARepo(String),

    #[error("{0}")]
    Failed(String),

    #[error("unreadable commit: {0}")]
    Parse(#[from] ParseError),
}
