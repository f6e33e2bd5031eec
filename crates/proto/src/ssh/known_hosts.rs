//! OpenSSH `known_hosts` database and host key policy.
//!
//! Each line has the form:
//!
//! ```text
//! [@marker] hostnames keytype base64-key [comment]
//! ```
//!
//! Host patterns may be plain (`example.com`), bracketed with a port
//! (`[example.com]:2222`), hashed (`|1|salt|hash`), wildcarded (`*.example.com`)
//! or negated (`!bad.example.com`). A comma separates alternatives; an entry
//! applies when any positive alternative matches and no negated one does.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::known_hosts::{HostKeyStatus, KnownHostsFile, StrictHostKeyChecking, Verdict};
//!
//! let mut db = KnownHostsFile::new("/tmp/unused_known_hosts");
//! db.add_host("example.com", 22, "ssh-ed25519", &[1, 2, 3], false);
//!
//! let status = db.verify_host_key("example.com", 22, "ssh-ed25519", &[1, 2, 3]);
//! assert_eq!(status, HostKeyStatus::Known);
//! assert_eq!(StrictHostKeyChecking::Strict.decide(&status), Verdict::Accept);
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use wisp_platform::{WispError, WispResult};

type HmacSha1 = Hmac<Sha1>;

const HASH_MAGIC: &str = "|1|";

/// Line marker preceding the host pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// `@revoked`: the key must never be accepted.
    Revoked,
    /// `@cert-authority`: the key signs host certificates. Kept but not used.
    CertAuthority,
}

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    marker: Option<Marker>,
    hostname_pattern: String,
    key_type: String,
    key_data: Vec<u8>,
    comment: String,
}

impl KnownHost {
    /// Creates an entry without marker or comment.
    pub fn new(
        hostname_pattern: impl Into<String>,
        key_type: impl Into<String>,
        key_data: Vec<u8>,
    ) -> Self {
        Self {
            marker: None,
            hostname_pattern: hostname_pattern.into(),
            key_type: key_type.into(),
            key_data,
            comment: String::new(),
        }
    }

    /// Returns the line marker, if any.
    pub fn marker(&self) -> Option<Marker> {
        self.marker
    }

    /// Returns the host pattern list as written.
    pub fn hostname_pattern(&self) -> &str {
        &self.hostname_pattern
    }

    /// Returns the key type name.
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Returns the public key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the trailing comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Returns true if this entry applies to `hostname` on `port`.
    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        let target = host_token(hostname, port);
        let mut matched = false;

        for pattern in self.hostname_pattern.split(',').map(str::trim) {
            let (negated, pattern) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            if matches_pattern(pattern, &target) {
                if negated {
                    return false;
                }
                matched = true;
            }
        }

        matched
    }

    /// Parses one line. Blank lines and comments are errors; callers skip them.
    pub fn parse_line(line: &str) -> WispResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(WispError::Config("known_hosts: not an entry".into()));
        }

        let mut fields = line.split_whitespace();
        let mut first = fields.next().unwrap_or_default();
        let marker = match first {
            "@revoked" => Some(Marker::Revoked),
            "@cert-authority" => Some(Marker::CertAuthority),
            other if other.starts_with('@') => {
                return Err(WispError::Config(format!(
                    "known_hosts: unknown marker {}",
                    other
                )))
            }
            _ => None,
        };
        if marker.is_some() {
            first = fields.next().unwrap_or_default();
        }

        let key_type = fields.next();
        let key_b64 = fields.next();
        let (key_type, key_b64) = match (key_type, key_b64) {
            (Some(t), Some(k)) if !first.is_empty() => (t, k),
            _ => {
                return Err(WispError::Config(
                    "known_hosts: expected host, key type and key".into(),
                ))
            }
        };

        let key_data = STANDARD
            .decode(key_b64)
            .map_err(|e| WispError::Config(format!("known_hosts: invalid key base64: {}", e)))?;

        Ok(Self {
            marker,
            hostname_pattern: first.to_string(),
            key_type: key_type.to_string(),
            key_data,
            comment: fields.collect::<Vec<_>>().join(" "),
        })
    }

    fn to_line(&self) -> String {
        let mut line = String::new();
        match self.marker {
            Some(Marker::Revoked) => line.push_str("@revoked "),
            Some(Marker::CertAuthority) => line.push_str("@cert-authority "),
            None => {}
        }
        line.push_str(&self.hostname_pattern);
        line.push(' ');
        line.push_str(&self.key_type);
        line.push(' ');
        line.push_str(&STANDARD.encode(&self.key_data));
        if !self.comment.is_empty() {
            line.push(' ');
            line.push_str(&self.comment);
        }
        line
    }
}

/// `host` on port 22, `[host]:port` otherwise.
fn host_token(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

fn matches_pattern(pattern: &str, target: &str) -> bool {
    if pattern.starts_with(HASH_MAGIC) {
        return hashed_matches(pattern, target);
    }
    if pattern.contains(['*', '?']) {
        return wildcard_match(pattern.as_bytes(), target.as_bytes());
    }
    pattern.eq_ignore_ascii_case(target)
}

fn hashed_matches(pattern: &str, target: &str) -> bool {
    let mut parts = pattern[HASH_MAGIC.len()..].splitn(2, '|');
    let (salt, expected) = match (parts.next(), parts.next()) {
        (Some(salt), Some(hash)) => (salt, hash),
        _ => return false,
    };
    let (Ok(salt), Ok(expected)) = (STANDARD.decode(salt), STANDARD.decode(expected)) else {
        debug!("Skipping malformed hashed host pattern");
        return false;
    };

    let computed = hmac_host(&salt, target);
    computed.ct_eq(&expected).into()
}

fn hmac_host(salt: &[u8], host: &str) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha1::new_from_slice(salt) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(host.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Glob match supporting `*` and `?`.
fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p].eq_ignore_ascii_case(&text[t])) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Hashes a host token the way `ssh-keygen -H` does.
pub fn hash_hostname(hostname: &str, port: u16) -> String {
    let salt: [u8; 20] = rand::random();
    let hash = hmac_host(&salt, &host_token(hostname, port));
    format!(
        "{}{}|{}",
        HASH_MAGIC,
        STANDARD.encode(salt),
        STANDARD.encode(hash)
    )
}

/// Outcome of looking a presented host key up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// A matching entry holds this exact key.
    Known,
    /// An entry for this host holds a different key of the same type.
    Changed {
        /// Key type of the recorded key.
        old_key_type: String,
        /// Blob of the recorded key.
        old_key_data: Vec<u8>,
    },
    /// The key is listed under `@revoked`.
    Revoked,
    /// No entry covers this host and key type.
    Unknown,
}

/// `StrictHostKeyChecking` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    /// Refuse unknown and changed keys.
    Strict,
    /// Ask the user about unknown keys; refuse changed keys.
    Ask,
    /// Record unknown keys silently; refuse changed keys.
    #[default]
    AcceptNew,
    /// Accept everything. Changed keys are logged.
    No,
}

impl StrictHostKeyChecking {
    /// Returns the OpenSSH option spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "yes",
            Self::Ask => "ask",
            Self::AcceptNew => "accept-new",
            Self::No => "no",
        }
    }

    /// Maps a lookup result to what the client should do.
    pub fn decide(&self, status: &HostKeyStatus) -> Verdict {
        match (self, status) {
            (_, HostKeyStatus::Known) => Verdict::Accept,
            (_, HostKeyStatus::Revoked) => {
                Verdict::Reject("host key has been revoked".to_string())
            }
            (Self::No, HostKeyStatus::Changed { old_key_type, .. }) => {
                warn!(old_key_type = %old_key_type, "Host key changed, continuing anyway");
                Verdict::Accept
            }
            (_, HostKeyStatus::Changed { old_key_type, .. }) => Verdict::Reject(format!(
                "REMOTE HOST IDENTIFICATION HAS CHANGED (recorded {} key differs)",
                old_key_type
            )),
            (Self::Strict, HostKeyStatus::Unknown) => {
                Verdict::Reject("host key is not known and strict checking is enabled".to_string())
            }
            (Self::Ask, HostKeyStatus::Unknown) => Verdict::Confirm,
            (Self::AcceptNew | Self::No, HostKeyStatus::Unknown) => Verdict::AcceptAndRecord,
        }
    }
}

impl FromStr for StrictHostKeyChecking {
    type Err = WispError;

    fn from_str(s: &str) -> WispResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yes" | "strict" => Ok(Self::Strict),
            "ask" => Ok(Self::Ask),
            "accept-new" => Ok(Self::AcceptNew),
            "no" | "off" => Ok(Self::No),
            other => Err(WispError::Config(format!(
                "unknown StrictHostKeyChecking value '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for StrictHostKeyChecking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client does with a presented host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed.
    Accept,
    /// Proceed and append the key to the database.
    AcceptAndRecord,
    /// Ask the user; record the key if they agree.
    Confirm,
    /// Abort with the given reason.
    Reject(String),
}

/// An in-memory known_hosts database bound to a file path.
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    entries: Vec<KnownHost>,
    path: PathBuf,
}

impl KnownHostsFile {
    /// Creates an empty database that saves to `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            entries: Vec::new(),
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Loads `path`. A missing file yields an empty database.
    pub fn from_file<P: AsRef<Path>>(path: P) -> WispResult<Self> {
        let path = path.as_ref();
        let mut db = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_string(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::new(path),
            Err(e) => return Err(e.into()),
        };
        db.path = path.to_path_buf();
        Ok(db)
    }

    /// Parses file contents. Unparsable lines are logged and skipped.
    pub fn from_string(content: &str) -> Self {
        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match KnownHost::parse_line(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = index + 1, error = %e, "Skipping known_hosts line"),
            }
        }
        Self {
            entries,
            path: PathBuf::new(),
        }
    }

    /// Returns the path the database saves to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all entries in file order.
    pub fn entries(&self) -> &[KnownHost] {
        &self.entries
    }

    /// Appends an entry.
    pub fn add_entry(&mut self, entry: KnownHost) {
        self.entries.push(entry);
    }

    /// Looks a presented key up.
    pub fn verify_host_key(
        &self,
        hostname: &str,
        port: u16,
        key_type: &str,
        key_data: &[u8],
    ) -> HostKeyStatus {
        let applicable = self.entries.iter().filter(|e| e.matches(hostname, port));
        let mut changed = None;

        for entry in applicable {
            let same_key = entry.key_type == key_type && entry.key_data == key_data;
            match entry.marker {
                Some(Marker::Revoked) if same_key => return HostKeyStatus::Revoked,
                Some(_) => {}
                None if same_key => return HostKeyStatus::Known,
                None if entry.key_type == key_type && changed.is_none() => {
                    changed = Some(HostKeyStatus::Changed {
                        old_key_type: entry.key_type.clone(),
                        old_key_data: entry.key_data.clone(),
                    });
                }
                None => {}
            }
        }

        changed.unwrap_or(HostKeyStatus::Unknown)
    }

    /// Records a key for `hostname:port`, optionally hashing the host name.
    pub fn add_host(
        &mut self,
        hostname: &str,
        port: u16,
        key_type: &str,
        key_data: &[u8],
        hashed: bool,
    ) {
        let pattern = if hashed {
            hash_hostname(hostname, port)
        } else {
            host_token(hostname, port)
        };
        self.entries
            .push(KnownHost::new(pattern, key_type, key_data.to_vec()));
    }

    /// Removes every plain entry that applies to `hostname:port`.
    ///
    /// Returns the number of entries removed.
    pub fn remove_host(&mut self, hostname: &str, port: u16) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.marker.is_some() || !e.matches(hostname, port));
        before - self.entries.len()
    }

    /// Removes the entry at `index` (file order, comments excluded).
    pub fn remove_index(&mut self, index: usize) -> WispResult<KnownHost> {
        if index >= self.entries.len() {
            return Err(WispError::InvalidParameters(format!(
                "no known_hosts entry at index {}",
                index
            )));
        }
        Ok(self.entries.remove(index))
    }

    /// Drops every entry.
    pub fn remove_all(&mut self) {
        self.entries.clear();
    }

    /// Replaces the keys of type `key_type` recorded for `hostname:port`.
    pub fn update_host(&mut self, hostname: &str, port: u16, key_type: &str, key_data: &[u8]) {
        self.entries.retain(|e| {
            e.marker.is_some() || e.key_type != key_type || !e.matches(hostname, port)
        });
        self.add_host(hostname, port, key_type, key_data, false);
    }

    /// Writes the database back, replacing the file atomically.
    pub fn save(&self) -> WispResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(WispError::Config("known_hosts database has no path".into()));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut content = String::new();
        for entry in &self.entries {
            content.push_str(&entry.to_line());
            content.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "Saved known_hosts");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_B64: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIBRanDK33/M2A9M0Lc/TQ/pF5kfd8rplxF34cupZF1gD";

    fn key() -> Vec<u8> {
        STANDARD.decode(ED25519_B64).unwrap()
    }

    #[test]
    fn test_parse_standard_line() {
        let line = format!("example.com ssh-ed25519 {} user@host extra", ED25519_B64);
        let entry = KnownHost::parse_line(&line).unwrap();

        assert_eq!(entry.hostname_pattern(), "example.com");
        assert_eq!(entry.key_type(), "ssh-ed25519");
        assert_eq!(entry.key_data(), &key()[..]);
        assert_eq!(entry.comment(), "user@host extra");
        assert_eq!(entry.marker(), None);
    }

    #[test]
    fn test_parse_rejects_non_entries() {
        assert!(KnownHost::parse_line("# comment").is_err());
        assert!(KnownHost::parse_line("   ").is_err());
        assert!(KnownHost::parse_line("example.com ssh-ed25519").is_err());
        assert!(KnownHost::parse_line("example.com ssh-ed25519 !!!").is_err());
        assert!(KnownHost::parse_line("@bogus example.com ssh-ed25519 AAAA").is_err());
    }

    #[test]
    fn test_port_matching() {
        let entry = KnownHost::new("[example.com]:2222", "ssh-ed25519", key());
        assert!(entry.matches("example.com", 2222));
        assert!(!entry.matches("example.com", 22));

        let entry = KnownHost::new("example.com", "ssh-ed25519", key());
        assert!(entry.matches("EXAMPLE.com", 22));
        assert!(!entry.matches("example.com", 2222));
    }

    #[test]
    fn test_wildcards_and_negation() {
        assert!(wildcard_match(b"*.example.com", b"host.example.com"));
        assert!(wildcard_match(b"*.example.com", b"a.b.example.com"));
        assert!(!wildcard_match(b"*.example.com", b"example.com"));
        assert!(wildcard_match(b"host?.lan", b"host1.lan"));
        assert!(!wildcard_match(b"host?.lan", b"host12.lan"));
        assert!(wildcard_match(b"*", b"anything"));

        // Negation wins regardless of position in the list.
        let entry = KnownHost::new("*.example.com,!bad.example.com", "ssh-ed25519", key());
        assert!(entry.matches("good.example.com", 22));
        assert!(!entry.matches("bad.example.com", 22));

        let entry = KnownHost::new("!bad.example.com,*.example.com", "ssh-ed25519", key());
        assert!(!entry.matches("bad.example.com", 22));
    }

    #[test]
    fn test_hashed_hostname() {
        let pattern = hash_hostname("secret.example.com", 2200);
        assert!(pattern.starts_with("|1|"));

        let entry = KnownHost::new(pattern, "ssh-ed25519", key());
        assert!(entry.matches("secret.example.com", 2200));
        assert!(!entry.matches("secret.example.com", 22));
        assert!(!entry.matches("other.example.com", 2200));

        let broken = KnownHost::new("|1|not base64|x", "ssh-ed25519", key());
        assert!(!broken.matches("secret.example.com", 22));
    }

    #[test]
    fn test_verify_statuses() {
        let content = format!(
            "# hosts\nexample.com ssh-ed25519 {k}\n\nnot a valid line\nother.com ecdsa-sha2-nistp256 AQID\n",
            k = ED25519_B64
        );
        let db = KnownHostsFile::from_string(&content);
        assert_eq!(db.entries().len(), 2);

        assert_eq!(
            db.verify_host_key("example.com", 22, "ssh-ed25519", &key()),
            HostKeyStatus::Known
        );
        assert!(matches!(
            db.verify_host_key("example.com", 22, "ssh-ed25519", &[9, 9]),
            HostKeyStatus::Changed { .. }
        ));
        // A different key type is a new key, not a changed one.
        assert_eq!(
            db.verify_host_key("other.com", 22, "ssh-ed25519", &key()),
            HostKeyStatus::Unknown
        );
        assert_eq!(
            db.verify_host_key("nowhere.org", 22, "ssh-ed25519", &key()),
            HostKeyStatus::Unknown
        );
    }

    #[test]
    fn test_revoked_key() {
        let content = format!(
            "@revoked * ssh-ed25519 {k}\nexample.com ssh-ed25519 {k}\n",
            k = ED25519_B64
        );
        let db = KnownHostsFile::from_string(&content);
        assert_eq!(db.entries()[0].marker(), Some(Marker::Revoked));
        assert_eq!(
            db.verify_host_key("example.com", 22, "ssh-ed25519", &key()),
            HostKeyStatus::Revoked
        );
    }

    #[test]
    fn test_policy_decisions() {
        let changed = HostKeyStatus::Changed {
            old_key_type: "ssh-ed25519".into(),
            old_key_data: vec![1],
        };

        assert_eq!(StrictHostKeyChecking::Strict.decide(&HostKeyStatus::Known), Verdict::Accept);
        assert!(matches!(
            StrictHostKeyChecking::Strict.decide(&HostKeyStatus::Unknown),
            Verdict::Reject(_)
        ));
        assert_eq!(StrictHostKeyChecking::Ask.decide(&HostKeyStatus::Unknown), Verdict::Confirm);
        assert_eq!(
            StrictHostKeyChecking::AcceptNew.decide(&HostKeyStatus::Unknown),
            Verdict::AcceptAndRecord
        );
        assert!(matches!(StrictHostKeyChecking::AcceptNew.decide(&changed), Verdict::Reject(_)));
        assert_eq!(StrictHostKeyChecking::No.decide(&changed), Verdict::Accept);
        assert!(matches!(
            StrictHostKeyChecking::No.decide(&HostKeyStatus::Revoked),
            Verdict::Reject(_)
        ));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("yes".parse::<StrictHostKeyChecking>().unwrap(), StrictHostKeyChecking::Strict);
        assert_eq!(
            "accept-new".parse::<StrictHostKeyChecking>().unwrap(),
            StrictHostKeyChecking::AcceptNew
        );
        assert!("maybe".parse::<StrictHostKeyChecking>().is_err());
        assert_eq!(StrictHostKeyChecking::default().to_string(), "accept-new");
    }

    #[test]
    fn test_add_remove_update() {
        let mut db = KnownHostsFile::new("unused");
        db.add_host("example.com", 22, "ssh-ed25519", &[1, 2], false);
        db.add_host("other.com", 2222, "ssh-ed25519", &[3, 4], false);
        db.add_host("third.com", 22, "ssh-ed25519", &[5], true);
        assert_eq!(db.entries()[1].hostname_pattern(), "[other.com]:2222");
        assert_eq!(
            db.verify_host_key("third.com", 22, "ssh-ed25519", &[5]),
            HostKeyStatus::Known
        );

        db.update_host("example.com", 22, "ssh-ed25519", &[7]);
        assert_eq!(db.entries().len(), 3);
        assert_eq!(
            db.verify_host_key("example.com", 22, "ssh-ed25519", &[7]),
            HostKeyStatus::Known
        );

        assert_eq!(db.remove_host("other.com", 2222), 1);
        assert_eq!(db.remove_host("missing.com", 22), 0);

        let removed = db.remove_index(0).unwrap();
        assert!(removed.matches("third.com", 22));
        assert!(matches!(db.remove_index(5), Err(WispError::InvalidParameters(_))));

        db.remove_all();
        assert!(db.entries().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");

        let mut db = KnownHostsFile::from_file(&path).unwrap();
        assert!(db.entries().is_empty());
        db.add_host("example.com", 22, "ssh-ed25519", &key(), false);
        db.add_entry(KnownHost::parse_line(&format!("@revoked old.host ssh-ed25519 {} gone", ED25519_B64)).unwrap());
        db.save().unwrap();

        let loaded = KnownHostsFile::from_file(&path).unwrap();
        assert_eq!(loaded.entries(), db.entries());
        assert_eq!(loaded.entries()[1].comment(), "gone");
        assert_eq!(loaded.path(), path.as_path());
    }

    #[test]
    fn test_save_without_path_fails() {
        let db = KnownHostsFile::from_string("");
        assert!(matches!(db.save(), Err(WispError::Config(_))));
    }
}
