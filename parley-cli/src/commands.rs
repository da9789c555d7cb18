use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parley_agent::{ParleyConfig, ParleyConfigBuilder, Session};
use parley_core::{
    ConversationId, ConversationRecord, MemoryStore, Message, Recipients, TranscriptStore,
};
use parley_memory::{FileMemoryStore, FileTranscriptStore};
use tracing::{info, warn};

use crate::error::CliResult;
use crate::scenario::Scenario;

/// File-backed stores under a `--store` directory
pub struct Stores {
    pub memory: Arc<dyn MemoryStore>,
    pub transcripts: Arc<dyn TranscriptStore>,
}

impl Stores {
    /// Memory snapshot at `<dir>/memory/memory.json`, transcripts in
    /// `<dir>/transcripts/`
    pub fn open(dir: &Path) -> CliResult<Self> {
        let memory = FileMemoryStore::open(dir.join("memory").join("memory.json"))?;
        let transcripts = FileTranscriptStore::open(dir.join("transcripts"))?;
        Ok(Self {
            memory: Arc::new(memory),
            transcripts: Arc::new(transcripts),
        })
    }

    fn session(self, config: ParleyConfig) -> CliResult<Session> {
        Ok(Session::with_stores(config, self.memory, self.transcripts)?)
    }
}

pub fn load_config(path: Option<&PathBuf>) -> CliResult<ParleyConfig> {
    let builder = match path {
        Some(path) => ParleyConfigBuilder::from_file(path)?,
        None => ParleyConfigBuilder::new(),
    };
    Ok(builder.with_env()?.build()?)
}

/// Run a scenario to archival and return its final record.
///
/// Prints the conversation id as soon as it exists. Ctrl-C terminates the
/// conversation with reason `external`.
pub async fn run(
    scenario: &Path,
    store: &Path,
    config: ParleyConfig,
    out: &mut impl Write,
) -> CliResult<ConversationRecord> {
    let scenario = Scenario::load(scenario)?;
    let spec = scenario.spec()?;
    let session = Stores::open(store)?.session(config)?;
    scenario.install(&session).await?;

    let id = match scenario.conversation_id()? {
        Some(id) => session.create_conversation_with_id(id, spec).await?,
        None => session.create_conversation(spec).await?,
    };
    writeln!(out, "{}", id)?;

    let record = tokio::select! {
        record = session.wait(&id) => record?,
        _ = tokio::signal::ctrl_c() => {
            warn!(conversation = %id, "Interrupted, terminating conversation");
            session.terminate(&id).await?;
            session.wait(&id).await?
        }
    };
    session.shutdown().await;

    let reason = record
        .reason
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    info!(conversation = %id, reason = %reason, turns = record.turns, messages = record.messages, "Conversation archived");
    writeln!(
        out,
        "{} {} after {} turns, {} messages",
        record.state, reason, record.turns, record.messages
    )?;
    for fault in &record.faults {
        writeln!(out, "  fault: {}", fault)?;
    }
    Ok(record)
}

pub async fn transcript(
    id: &ConversationId,
    store: &Path,
    json: bool,
    out: &mut impl Write,
) -> CliResult<()> {
    let session = Stores::open(store)?.session(ParleyConfig::default())?;
    let transcript = session.transcript(id).await?;
    for message in transcript.messages() {
        if json {
            writeln!(out, "{}", serde_json::to_string(message)?)?;
        } else {
            writeln!(out, "{}", render(message))?;
        }
    }
    Ok(())
}

pub async fn terminate(id: &ConversationId, store: &Path, out: &mut impl Write) -> CliResult<()> {
    let session = Stores::open(store)?.session(ParleyConfig::default())?;
    session.terminate(id).await?;
    writeln!(out, "{} archived", id)?;
    Ok(())
}

pub fn list(store: &Path, out: &mut impl Write) -> CliResult<()> {
    let session = Stores::open(store)?.session(ParleyConfig::default())?;
    for id in session.list()? {
        match session.transcripts().load_record(&id)? {
            Some(record) => writeln!(
                out,
                "{}  {:<11}  {:>4} messages  created {}",
                id,
                record.state.to_string(),
                record.messages,
                record.created_at.format("%Y-%m-%d %H:%M:%S")
            )?,
            None => writeln!(out, "{}  (no record)", id)?,
        }
    }
    Ok(())
}

fn render(message: &Message) -> String {
    let recipients = match &message.recipients {
        Recipients::Broadcast => "all".to_string(),
        Recipients::Agents(agents) => agents
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(","),
    };
    format!(
        "{:>4}  {}  {} -> {}  [{}]  {}",
        message.sequence,
        message.timestamp.format("%H:%M:%S%.3f"),
        message.sender,
        recipients,
        message.kind,
        message.payload.to_text()
    )
}
