//! Commit records in git's loose object format.

use chrono::{DateTime, FixedOffset};

/// A person and the moment they touched a commit.
///
/// Name and email are kept as raw bytes: a commit with an `encoding` header
/// may carry them in something other than UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: Vec<u8>,
    pub email: Vec<u8>,
    pub when: DateTime<FixedOffset>,
}

impl Signature {
    /// Parse `Name <email> 1700000000 +0100`.
    pub fn parse(line: &[u8]) -> Result<Self, ParseError> {
        let bad = || {
            ParseError(format!(
                "malformed signature '{}'",
                String::from_utf8_lossy(line)
            ))
        };

        let open = line.iter().position(|&b| b == b'<').ok_or_else(bad)?;
        let close = line.iter().rposition(|&b| b == b'>').ok_or_else(bad)?;
        if close < open {
            return Err(bad());
        }

        let name = line[..open].trim_ascii_end().to_vec();
        let email = line[open + 1..close].to_vec();

        let date = std::str::from_utf8(&line[close + 1..]).map_err(|_| bad())?;
        let mut rest = date.split_whitespace();
        let seconds: i64 = rest.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let offset = rest.next().and_then(parse_offset).ok_or_else(bad)?;

        let when = DateTime::from_timestamp(seconds, 0)
            .ok_or_else(bad)?
            .with_timezone(&offset);

        Ok(Self { name, email, when })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name);
        out.extend_from_slice(b" <");
        out.extend_from_slice(&self.email);
        let date = format!("> {} {}", self.when.timestamp(), self.when.format("%z"));
        out.extend_from_slice(date.as_bytes());
    }
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, digits) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Replacement identity for rewritten commits. Either half may be absent,
/// in which case the original value is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityOverride {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl IdentityOverride {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none()
    }

    fn apply(&self, signature: &mut Signature) {
        if let Some(name) = &self.name {
            signature.name = name.as_bytes().to_vec();
        }
        if let Some(email) = &self.email {
            signature.email = email.as_bytes().to_vec();
        }
    }
}

/// Headers that sign the object bytes and therefore cannot survive a rewrite.
const SIGNATURE_HEADERS: &[&str] = &["gpgsig", "gpgsig-sha256"];

/// A full commit as stored in the object database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Object id this record was read from. Empty for records not yet written.
    pub id: String,
    pub tree: String,
    pub parents: Vec<String>,
    pub author: Signature,
    pub committer: Signature,
    /// Any other headers (`encoding`, `gpgsig`, ...) in their original order.
    /// Multi-line values are joined with `\n`.
    pub extra_headers: Vec<(String, Vec<u8>)>,
    pub message: Vec<u8>,
}

impl CommitRecord {
    /// Parse the body of `git cat-file commit <id>`.
    pub fn parse(id: &str, raw: &[u8]) -> Result<Self, ParseError> {
        let split = raw
            .windows(2)
            .position(|w| w == b"\n\n")
            .ok_or_else(|| ParseError(format!("commit {id} has no message separator")))?;
        let header = &raw[..split];
        let message = raw[split + 2..].to_vec();

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers: Vec<(String, Vec<u8>)> = Vec::new();
        let mut last_was_extra = false;

        for line in header.split(|&b| b == b'\n') {
            if let Some(continuation) = line.strip_prefix(b" ") {
                match extra_headers.last_mut() {
                    Some((_, value)) if last_was_extra => {
                        value.push(b'\n');
                        value.extend_from_slice(continuation);
                    }
                    _ => {
                        return Err(ParseError(format!(
                            "commit {id} has a stray continuation line"
                        )));
                    }
                }
                continue;
            }

            let (key, value) = match line.iter().position(|&b| b == b' ') {
                Some(space) => (&line[..space], &line[space + 1..]),
                None => (line, &line[line.len()..]),
            };
            let key = std::str::from_utf8(key)
                .map_err(|_| ParseError(format!("commit {id} has a non-ASCII header name")))?;
            last_was_extra = false;
            match key {
                "tree" => tree = Some(object_id(id, value)?),
                "parent" => parents.push(object_id(id, value)?),
                "author" => author = Some(Signature::parse(value)?),
                "committer" => committer = Some(Signature::parse(value)?),
                _ => {
                    extra_headers.push((key.to_string(), value.to_vec()));
                    last_was_extra = true;
                }
            }
        }

        let missing = |what: &str| ParseError(format!("commit {id} has no {what} header"));
        Ok(Self {
            id: id.to_string(),
            tree: tree.ok_or_else(|| missing("tree"))?,
            parents,
            author: author.ok_or_else(|| missing("author"))?,
            committer: committer.ok_or_else(|| missing("committer"))?,
            extra_headers,
            message,
        })
    }

    /// Serialize into the bytes `git hash-object -t commit` expects.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut raw = format!("tree {}\n", self.tree).into_bytes();
        for parent in &self.parents {
            raw.extend_from_slice(format!("parent {parent}\n").as_bytes());
        }
        raw.extend_from_slice(b"author ");
        self.author.write_to(&mut raw);
        raw.extend_from_slice(b"\ncommitter ");
        self.committer.write_to(&mut raw);
        raw.push(b'\n');
        for (key, value) in &self.extra_headers {
            raw.extend_from_slice(key.as_bytes());
            raw.push(b' ');
            for &byte in value {
                raw.push(byte);
                if byte == b'\n' {
                    raw.push(b' ');
                }
            }
            raw.push(b'\n');
        }
        raw.push(b'\n');
        raw.extend_from_slice(&self.message);
        raw
    }

    /// First line of the message, for display.
    pub fn subject(&self) -> String {
        let message = String::from_utf8_lossy(&self.message);
        message.lines().next().unwrap_or_default().to_string()
    }

    pub fn short_id(&self) -> &str {
        short(&self.id)
    }

    /// A copy of this commit moved to `when`, optionally re-attributed, and
    /// re-parented onto `parent`.
    ///
    /// Tree, message and non-signature headers are carried over untouched.
    pub fn retimed(
        &self,
        when: DateTime<FixedOffset>,
        identity: Option<&IdentityOverride>,
        parent: Option<String>,
    ) -> Self {
        let mut author = Signature { when, ..self.author.clone() };
        let mut committer = Signature { when, ..self.committer.clone() };
        if let Some(identity) = identity {
            identity.apply(&mut author);
            identity.apply(&mut committer);
        }

        let (signatures, extra_headers): (Vec<_>, Vec<_>) = self
            .extra_headers
            .iter()
            .cloned()
            .partition(|(key, _)| SIGNATURE_HEADERS.contains(&key.as_str()));
        if !signatures.is_empty() {
            tracing::warn!(commit = %self.short_id(), "dropping commit signature");
        }

        Self {
            id: String::new(),
            tree: self.tree.clone(),
            parents: parent.into_iter().collect(),
            author,
            committer,
            extra_headers,
            message: self.message.clone(),
        }
    }
}

/// Tree and parent ids are hex, so they must be ASCII.
fn object_id(commit: &str, value: &[u8]) -> Result<String, ParseError> {
    match std::str::from_utf8(value) {
        Ok(hex) if hex.is_ascii() => Ok(hex.to_string()),
        _ => Err(ParseError(format!("commit {commit} has a malformed object id"))),
    }
}

/// Abbreviate an object id for display.
pub fn short(id: &str) -> &str {
    &id[..8.min(id.len())]
}

/// A commit object that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(pub String);
