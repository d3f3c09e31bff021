//! The saved-state log: an append-only journal of subscriptions.
//!
//! Each line is one record:
//!
//! ```text
//! ADD 3 "def" "/apps/eog" "unix:/run/user/1000/eog.sock"
//! REMOVE 3 "def" "/apps/eog" "unix:/run/user/1000/eog.sock"
//! CLIENTADD "unix:/run/user/1000/eog.sock"
//! CLIENTREMOVE "unix:/run/user/1000/eog.sock"
//! ```
//!
//! Replaying the log yields the subscriptions that were live when the daemon
//! stopped. Compaction rewrites the file to hold only the current state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::daemon::database::DatabaseSignature;
use crate::daemon::listeners::{ConnectionId, SubscriptionJournal};
use crate::daemon::peer::PeerToken;
use crate::key::Key;

/// File name of the log inside the state directory.
pub const STATE_LOG_NAME: &str = "saved_state";

/// Errors reading or writing the saved-state log
#[derive(Debug, Error)]
pub enum StateLogError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bad log line `{line}`: {reason}")]
    Parse { line: String, reason: String },
}

impl StateLogError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(line: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

/// Wrap `raw` in double quotes, escaping quotes, backslashes and line breaks.
pub fn quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Read one quoted string from the front of `input`. Returns the unescaped
/// text and whatever follows the closing quote.
pub fn unquote(input: &str) -> Result<(String, &str), String> {
    let input = input.trim_start();
    let Some(body) = input.strip_prefix('"') else {
        return Err("expected opening quote".to_string());
    };

    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &body[idx + 1..])),
            '\\' => match chars.next() {
                Some((_, '"')) => out.push('"'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, 'n')) => out.push('\n'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, 't')) => out.push('\t'),
                Some((_, other)) => return Err(format!("unknown escape `\\{}`", other)),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err("unterminated quoted string".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    Add,
    Remove,
}

/// One subscription, as the log sees it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerRecord {
    pub connection_id: ConnectionId,
    pub database: DatabaseSignature,
    pub location: Key,
    pub peer: PeerToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Listener { op: LogOp, record: ListenerRecord },
    Client { op: LogOp, peer: PeerToken },
}

impl LogEntry {
    pub fn add(record: ListenerRecord) -> Self {
        LogEntry::Listener {
            op: LogOp::Add,
            record,
        }
    }

    pub fn remove(record: ListenerRecord) -> Self {
        LogEntry::Listener {
            op: LogOp::Remove,
            record,
        }
    }

    pub fn client_add(peer: PeerToken) -> Self {
        LogEntry::Client {
            op: LogOp::Add,
            peer,
        }
    }

    pub fn client_remove(peer: PeerToken) -> Self {
        LogEntry::Client {
            op: LogOp::Remove,
            peer,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntry::Listener { op, record } => {
                let word = match op {
                    LogOp::Add => "ADD",
                    LogOp::Remove => "REMOVE",
                };
                write!(
                    f,
                    "{} {} {} {} {}",
                    word,
                    record.connection_id,
                    quote(record.database.as_str()),
                    quote(record.location.as_str()),
                    quote(record.peer.as_str())
                )
            }
            LogEntry::Client { op, peer } => {
                let word = match op {
                    LogOp::Add => "CLIENTADD",
                    LogOp::Remove => "CLIENTREMOVE",
                };
                write!(f, "{} {}", word, quote(peer.as_str()))
            }
        }
    }
}

impl FromStr for LogEntry {
    type Err = StateLogError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let trimmed = line.trim();
        let (word, rest) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));

        let entry = match word {
            "ADD" | "REMOVE" => {
                let rest = rest.trim_start();
                let (id, rest) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| StateLogError::parse(line, "missing fields"))?;
                let connection_id: ConnectionId = id
                    .parse()
                    .map_err(|_| StateLogError::parse(line, "connection id is not a number"))?;
                if connection_id.0 == 0 {
                    return Err(StateLogError::parse(line, "connection id 0 is invalid"));
                }
                let (database, rest) = unquote(rest).map_err(|r| StateLogError::parse(line, r))?;
                let (location, rest) = unquote(rest).map_err(|r| StateLogError::parse(line, r))?;
                let (peer, rest) = unquote(rest).map_err(|r| StateLogError::parse(line, r))?;
                if !rest.trim().is_empty() {
                    return Err(StateLogError::parse(line, "trailing garbage"));
                }
                let location = Key::parse(&location)
                    .map_err(|e| StateLogError::parse(line, e.to_string()))?;
                let record = ListenerRecord {
                    connection_id,
                    database: DatabaseSignature::new(database),
                    location,
                    peer: PeerToken::new(peer),
                };
                if word == "ADD" {
                    LogEntry::add(record)
                } else {
                    LogEntry::remove(record)
                }
            }
            "CLIENTADD" | "CLIENTREMOVE" => {
                let (peer, rest) = unquote(rest).map_err(|r| StateLogError::parse(line, r))?;
                if !rest.trim().is_empty() {
                    return Err(StateLogError::parse(line, "trailing garbage"));
                }
                let peer = PeerToken::new(peer);
                if word == "CLIENTADD" {
                    LogEntry::client_add(peer)
                } else {
                    LogEntry::client_remove(peer)
                }
            }
            other => {
                return Err(StateLogError::parse(
                    line,
                    format!("unknown record type `{}`", other),
                ))
            }
        };
        Ok(entry)
    }
}

/// What survived a replay of the log.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveredState {
    pub clients: BTreeSet<PeerToken>,
    /// Live subscriptions, in connection-id order.
    pub listeners: BTreeSet<ListenerRecord>,
    /// Highest id seen per database, including removed ones.
    pub max_ids: BTreeMap<DatabaseSignature, ConnectionId>,
}

/// Replay log text into the set of subscriptions it describes.
///
/// A remove cancels a matching earlier add. Duplicate adds, orphan removes
/// and unparseable lines are skipped.
pub fn replay(content: &str) -> RecoveredState {
    let mut state = RecoveredState::default();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = match line.parse::<LogEntry>() {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping saved state line");
                continue;
            }
        };
        match entry {
            LogEntry::Listener { op, record } => {
                let max = state
                    .max_ids
                    .entry(record.database.clone())
                    .or_insert(record.connection_id);
                if record.connection_id > *max {
                    *max = record.connection_id;
                }
                match op {
                    LogOp::Add => {
                        if !state.listeners.insert(record.clone()) {
                            debug!(id = %record.connection_id, "Ignoring duplicate listener add");
                        }
                    }
                    LogOp::Remove => {
                        if !state.listeners.remove(&record) {
                            debug!(id = %record.connection_id, "Ignoring removal of unknown listener");
                        }
                    }
                }
            }
            LogEntry::Client { op, peer } => match op {
                LogOp::Add => {
                    if !state.clients.insert(peer.clone()) {
                        debug!(peer = %peer, "Ignoring duplicate client add");
                    }
                }
                LogOp::Remove => {
                    if !state.clients.remove(&peer) {
                        debug!(peer = %peer, "Ignoring removal of unknown client");
                    }
                }
            },
        }
    }
    state
}

#[cfg(unix)]
fn create_state_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_state_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Append handle and compaction for the saved-state file.
pub struct StateLog {
    path: PathBuf,
    file: Option<File>,
    last_write: Option<Instant>,
    needs_compaction: bool,
}

impl StateLog {
    /// A log at `<state_dir>/saved_state`. Nothing is touched until the
    /// first write.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(STATE_LOG_NAME))
    }

    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            last_write: None,
            needs_compaction: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.path.display(), suffix))
    }

    fn ensure_dir(&self) -> Result<(), StateLogError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                create_state_dir(dir).map_err(|e| StateLogError::io(dir, e))
            }
            _ => Ok(()),
        }
    }

    fn handle(&mut self) -> Result<&mut File, StateLogError> {
        if self.file.is_none() {
            self.ensure_dir()?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| StateLogError::io(&self.path, e))?;
            debug!(path = %self.path.display(), "Opened saved state log");
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(StateLogError::io(
                &self.path,
                io::Error::new(io::ErrorKind::Other, "log handle unavailable"),
            )),
        }
    }

    /// Append one record and flush it.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), StateLogError> {
        let path = self.path.clone();
        let file = self.handle()?;
        writeln!(file, "{}", entry).map_err(|e| StateLogError::io(&path, e))?;
        file.flush().map_err(|e| StateLogError::io(&path, e))?;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    /// Close the append handle. Returns whether one was open.
    pub fn close(&mut self) -> bool {
        let was_open = self.file.take().is_some();
        if was_open {
            debug!(path = %self.path.display(), "Closed saved state log");
        }
        was_open
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn last_write(&self) -> Option<Instant> {
        self.last_write
    }

    pub fn needs_compaction(&self) -> bool {
        self.needs_compaction
    }

    pub fn mark_needs_compaction(&mut self) {
        self.needs_compaction = true;
    }

    /// Replay the log from disk. A missing file is an empty state.
    pub fn read(&self) -> Result<RecoveredState, StateLogError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(replay(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved state to restore");
                Ok(RecoveredState::default())
            }
            Err(e) => Err(StateLogError::io(&self.path, e)),
        }
    }

    /// Replace the log with exactly `snapshot`.
    ///
    /// On failure the previous file stays in place and the log keeps asking
    /// for compaction.
    pub fn compact(&mut self, snapshot: &[LogEntry]) -> Result<(), StateLogError> {
        self.close();
        match self.write_snapshot(snapshot) {
            Ok(()) => {
                self.needs_compaction = false;
                info!(path = %self.path.display(), records = snapshot.len(), "Compacted saved state");
                Ok(())
            }
            Err(e) => {
                self.needs_compaction = true;
                Err(e)
            }
        }
    }

    fn write_snapshot(&self, snapshot: &[LogEntry]) -> Result<(), StateLogError> {
        self.ensure_dir()?;
        let tmp = self.sibling(".tmp");
        let orig = self.sibling(".orig");

        let write_tmp = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            for entry in snapshot {
                writeln!(file, "{}", entry)?;
            }
            file.sync_all()
        };
        if let Err(e) = write_tmp() {
            let _ = fs::remove_file(&tmp);
            return Err(StateLogError::io(&tmp, e));
        }

        let had_previous = self.path.exists();
        if had_previous {
            if let Err(e) = fs::rename(&self.path, &orig) {
                let _ = fs::remove_file(&tmp);
                return Err(StateLogError::io(&self.path, e));
            }
        }

        if let Err(e) = fs::rename(&tmp, &self.path) {
            if had_previous {
                if let Err(restore) = fs::rename(&orig, &self.path) {
                    error!(
                        path = %self.path.display(),
                        error = %restore,
                        "Failed to restore previous saved state"
                    );
                }
            }
            return Err(StateLogError::io(&tmp, e));
        }

        if had_previous {
            if let Err(e) = fs::remove_file(&orig) {
                warn!(path = %orig.display(), error = %e, "Failed to remove old saved state");
            }
        }
        Ok(())
    }
}

impl SubscriptionJournal for StateLog {
    fn record(&mut self, entry: &LogEntry) {
        if let Err(e) = self.append(entry) {
            error!(error = %e, entry = %entry, "Failed to log subscription change");
            self.needs_compaction = true;
            return;
        }
        if matches!(
            entry,
            LogEntry::Listener {
                op: LogOp::Remove,
                ..
            } | LogEntry::Client {
                op: LogOp::Remove,
                ..
            }
        ) {
            self.needs_compaction = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: u64, location: &str, peer: &str) -> ListenerRecord {
        ListenerRecord {
            connection_id: ConnectionId(id),
            database: DatabaseSignature::default_database(),
            location: Key::parse(location).unwrap(),
            peer: PeerToken::new(peer),
        }
    }

    #[test]
    fn quoting_escapes_specials() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b\\c\nd"), "\"a\\\"b\\\\c\\nd\"");
        let (text, rest) = unquote("\"a\\\"b\\\\c\\nd\\te\" tail").unwrap();
        assert_eq!(text, "a\"b\\c\nd\te");
        assert_eq!(rest, " tail");
        assert!(unquote("\"open").is_err());
        assert!(unquote("bare").is_err());
    }

    #[test]
    fn log_line_format() {
        let entry = LogEntry::add(record(5, "/apps/x", "peerA"));
        assert_eq!(entry.to_string(), r#"ADD 5 "def" "/apps/x" "peerA""#);
        let client = LogEntry::client_remove(PeerToken::new("unix:/tmp/s"));
        assert_eq!(client.to_string(), r#"CLIENTREMOVE "unix:/tmp/s""#);
    }

    #[test]
    fn entries_survive_text_form() {
        let entries = vec![
            LogEntry::add(record(1, "/apps", "has \"quotes\" and\nnewline")),
            LogEntry::remove(record(12, "/", "unix:/run/a b.sock")),
            LogEntry::client_add(PeerToken::new("tab\there")),
        ];
        for entry in entries {
            let parsed: LogEntry = entry.to_string().parse().unwrap();
            assert_eq!(parsed, entry);
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        for bad in [
            "",
            "ADD",
            "ADD x \"def\" \"/a\" \"p\"",
            "ADD 0 \"def\" \"/a\" \"p\"",
            "ADD 1 \"def\" \"/a\"",
            "ADD 1 \"def\" \"no-slash\" \"p\"",
            "ADD 1 \"def\" \"/a\" \"p\" extra",
            "MOVE 1 \"def\" \"/a\" \"p\"",
            "CLIENTADD unquoted",
        ] {
            assert!(bad.parse::<LogEntry>().is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn replay_cancels_and_ignores() {
        let log = [
            r#"ADD 1 "def" "/a" "p1""#,
            r#"ADD 1 "def" "/a" "p1""#,
            r#"ADD 2 "def" "/b" "p2""#,
            r#"REMOVE 1 "def" "/a" "p1""#,
            r#"REMOVE 9 "def" "/z" "p9""#,
            "garbage line",
            r#"ADD 0 "def" "/c" "p0""#,
            r#"CLIENTADD "c1""#,
            r#"CLIENTADD "c2""#,
            r#"CLIENTREMOVE "c1""#,
        ]
        .join("\n");

        let state = replay(&log);
        assert_eq!(
            state.listeners.into_iter().collect::<Vec<_>>(),
            vec![record(2, "/b", "p2")]
        );
        assert_eq!(
            state.clients.into_iter().collect::<Vec<_>>(),
            vec![PeerToken::new("c2")]
        );
        assert_eq!(
            state.max_ids.get(&DatabaseSignature::default_database()),
            Some(&ConnectionId(9))
        );
    }

    #[test]
    fn replay_is_idempotent_over_compacted_output() {
        let log = [
            r#"ADD 1 "def" "/a" "p1""#,
            r#"ADD 2 "def" "/b" "p2""#,
            r#"REMOVE 1 "def" "/a" "p1""#,
        ]
        .join("\n");
        let first = replay(&log);
        let rewritten: String = first
            .listeners
            .iter()
            .map(|r| format!("{}\n", LogEntry::add(r.clone())))
            .collect();
        let second = replay(&rewritten);
        assert_eq!(first.listeners, second.listeners);
    }

    #[test]
    fn append_creates_private_dir_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        let mut log = StateLog::in_dir(&state_dir);
        assert!(log.read().unwrap().listeners.is_empty());

        log.append(&LogEntry::add(record(1, "/a", "p1"))).unwrap();
        assert!(log.is_open());
        assert!(log.last_write().is_some());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&state_dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        assert!(log.close());
        assert!(!log.close());
        let state = log.read().unwrap();
        assert_eq!(state.listeners.len(), 1);
    }

    #[test]
    fn compact_rewrites_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut log = StateLog::in_dir(dir.path());
        log.record(&LogEntry::add(record(1, "/a", "p1")));
        log.record(&LogEntry::add(record(2, "/b", "p2")));
        log.record(&LogEntry::remove(record(1, "/a", "p1")));
        assert!(log.needs_compaction());

        let snapshot = vec![
            LogEntry::client_add(PeerToken::new("p2")),
            LogEntry::add(record(2, "/b", "p2")),
        ];
        log.compact(&snapshot).unwrap();
        assert!(!log.needs_compaction());
        assert!(!log.is_open());

        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text, "CLIENTADD \"p2\"\nADD 2 \"def\" \"/b\" \"p2\"\n");
        assert!(!dir.path().join("saved_state.tmp").exists());
        assert!(!dir.path().join("saved_state.orig").exists());

        // Appends after compaction reopen the file.
        log.record(&LogEntry::add(record(3, "/c", "p3")));
        assert_eq!(log.read().unwrap().listeners.len(), 2);
    }

    #[test]
    fn failed_compaction_keeps_previous_log() {
        let dir = TempDir::new().unwrap();
        let mut log = StateLog::in_dir(dir.path());
        log.record(&LogEntry::add(record(1, "/a", "p1")));

        // A directory squatting on the temp path makes the write fail.
        fs::create_dir(dir.path().join("saved_state.tmp")).unwrap();
        assert!(log.compact(&[]).is_err());
        assert!(log.needs_compaction());
        assert_eq!(log.read().unwrap().listeners.len(), 1);
    }
}
