use rexec_protocol::ProcessOutput;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Script output addressed by sequence number, mirrored to a JSON-lines
/// file inside the workspace so it survives an agent restart.
#[derive(Debug, Default)]
pub struct ScriptLog {
    entries: Vec<ProcessOutput>,
    file: Option<File>,
}

impl ScriptLog {
    /// Open (or create) the log at `path`, loading any entries already there.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let (entries, torn) = Self::load(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if torn {
            writeln!(file)?;
        }
        Ok(Self {
            entries,
            file: Some(file),
        })
    }

    /// Entries persisted at `path`. A missing file is an empty log.
    pub fn read(path: &Path) -> std::io::Result<Vec<ProcessOutput>> {
        Self::load(path).map(|(entries, _)| entries)
    }

    /// Parsed entries plus whether the file ends mid-line.
    fn load(path: &Path) -> std::io::Result<(Vec<ProcessOutput>, bool)> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), false));
            }
            Err(err) => return Err(err),
        };
        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line after a crash.
                Err(err) => warn!(path = %path.display(), "skipping corrupt log line: {err}"),
            }
        }
        let torn = !contents.is_empty() && !contents.ends_with('\n');
        Ok((entries, torn))
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: ProcessOutput) {
        if let Some(file) = self.file.as_mut() {
            let written = serde_json::to_string(&entry)
                .map_err(std::io::Error::other)
                .and_then(|line| writeln!(file, "{line}"));
            if let Err(err) = written {
                warn!("failed to persist log line: {err}");
                self.file = None;
            }
        }
        self.entries.push(entry);
    }

    /// Entries from `sequence` on, and the sequence to ask for next time.
    pub fn since(&self, sequence: u64) -> (Vec<ProcessOutput>, u64) {
        tail(&self.entries, sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entries from `sequence` on, and the sequence that follows them.
pub fn tail(entries: &[ProcessOutput], sequence: u64) -> (Vec<ProcessOutput>, u64) {
    let start = (sequence as usize).min(entries.len());
    (entries[start..].to_vec(), entries.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_protocol::OutputSource;

    #[test]
    fn since_returns_tail_and_next_sequence() {
        let mut log = ScriptLog::in_memory();
        for text in ["a", "b", "c"] {
            log.append(ProcessOutput::new(OutputSource::Stdout, text));
        }

        let (tail, next) = log.since(1);
        assert_eq!(tail.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(), ["b", "c"]);
        assert_eq!(next, 3);

        let (tail, next) = log.since(10);
        assert!(tail.is_empty());
        assert_eq!(next, 3);
    }

    #[test]
    fn reopened_log_keeps_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.log");
        {
            let mut log = ScriptLog::open(&path).unwrap();
            log.append(ProcessOutput::new(OutputSource::Stdout, "first"));
            log.append(ProcessOutput::new(OutputSource::Stderr, "second"));
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"source\":\"std")
            .unwrap();

        let mut log = ScriptLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        log.append(ProcessOutput::new(OutputSource::Agent, "third"));
        let (tail, next) = log.since(2);
        assert_eq!(tail[0].text, "third");
        assert_eq!(next, 3);
        drop(log);

        assert_eq!(ScriptLog::read(&path).unwrap().len(), 3);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ScriptLog::read(&dir.path().join("nope.log")).unwrap().is_empty());
    }
}
