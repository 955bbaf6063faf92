//! Conversation and record persistence.
//!
//! Writers are shared by every worker and must tolerate concurrent calls.
//! Failures are returned to the caller, which logs and counts them; they
//! never stop the pipeline.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::decoder::DecodedRecord;
use crate::error::{Result, SetupError};
use crate::flow::TransportProtocol;
use crate::stream::Conversation;

pub trait ConversationWriter: Send + Sync {
    /// Persist a fully merged conversation.
    fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Persist one decoded record.
    fn write_record(&self, record: &DecodedRecord) -> Result<()>;

    /// Flush buffered output.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWriter;

impl ConversationWriter for NullWriter {
    fn save_conversation(&self, _conversation: &Conversation) -> Result<()> {
        Ok(())
    }

    fn write_record(&self, _record: &DecodedRecord) -> Result<()> {
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    conversations: Mutex<Vec<Conversation>>,
    records: Mutex<Vec<DecodedRecord>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.lock().clone()
    }

    pub fn records(&self) -> Vec<DecodedRecord> {
        self.records.lock().clone()
    }
}

impl ConversationWriter for MemoryWriter {
    fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conversations.lock().push(conversation.clone());
        Ok(())
    }

    fn write_record(&self, record: &DecodedRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Writes conversations under `<root>/<tcp|udp>/` and records as JSON lines
/// to `<root>/records.jsonl`.
#[derive(Debug)]
pub struct FileWriter {
    root: PathBuf,
    records: Mutex<BufWriter<File>>,
}

impl FileWriter {
    /// Create the output layout. Failing here is fatal.
    pub fn create(root: impl AsRef<Path>) -> std::result::Result<Self, SetupError> {
        let root = root.as_ref().to_path_buf();
        for dir in [
            root.clone(),
            root.join(TransportProtocol::Tcp.as_str()),
            root.join(TransportProtocol::Udp.as_str()),
        ] {
            fs::create_dir_all(&dir).map_err(|source| SetupError::OutputDirectory { path: dir.clone(), source })?;
        }

        let path = root.join("records.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SetupError::OutputFile { path, source })?;

        tracing::info!(root = %root.display(), "writing output");
        Ok(Self {
            root,
            records: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding a conversation's interleaved bytes.
    pub fn conversation_path(&self, conversation: &Conversation) -> PathBuf {
        self.root
            .join(conversation.transport().as_str())
            .join(format!("{}.bin", conversation.ident().file_name()))
    }
}

impl ConversationWriter for FileWriter {
    fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let path = self.conversation_path(conversation);
        // Port reuse can map two connections onto one file
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        for fragment in conversation.fragments() {
            file.write_all(fragment.data())?;
        }
        Ok(())
    }

    fn write_record(&self, record: &DecodedRecord) -> Result<()> {
        let mut out = self.records.lock();
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.records.lock().flush()?;
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.records.get_mut().flush() {
            tracing::warn!(error = %e, "failed to flush records");
        }
    }
}
