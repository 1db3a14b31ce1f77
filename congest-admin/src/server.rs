//! Unix socket control server.
//!
//! Line protocol: one [`ControlCommand`] per line, answered by zero or more
//! text lines and a final line holding a single `.`.

use congest_core::{EntrySnapshot, SharedCongestionService};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::command::{alive, remove, ControlCommand};
use crate::listing::{format_entry, ListingFormat};

/// Terminates every response.
pub const END_OF_RESPONSE: &str = ".";

/// How long a listing waits for a busy partition.
const PARTITION_WAIT: Duration = Duration::from_secs(2);

/// Control server failures.
#[derive(Error, Debug)]
pub enum AdminError {
    /// The socket could not be bound.
    #[error("Failed to bind admin socket '{path}': {source}")]
    Bind {
        /// Socket path.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Accepting or serving a connection failed.
    #[error("Admin socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Answers operator commands against one [`congest_core::CongestionService`].
#[derive(Debug, Clone)]
pub struct AdminServer {
    service: SharedCongestionService,
    local_time: bool,
}

impl AdminServer {
    /// A server for `service`; listing times use local time when `local_time`.
    pub fn new(service: SharedCongestionService, local_time: bool) -> Self {
        Self {
            service,
            local_time,
        }
    }

    /// Bind `path`, replacing a stale socket file, and serve until the
    /// listener fails.
    pub async fn run(self, path: impl AsRef<Path>) -> Result<(), AdminError> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path).map_err(|source| AdminError::Bind {
            path: path.display().to_string(),
            source,
        })?;
        info!("Admin socket listening on {}", path.display());
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: UnixListener) -> Result<(), AdminError> {
        let mut incoming = UnixListenerStream::new(listener);
        while let Some(stream) = incoming.next().await {
            let stream = stream?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!("Admin connection failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<(), AdminError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            debug!(command = %line.trim(), "admin command");
            let mut response = self.execute(&line).await;
            response.push(END_OF_RESPONSE.to_string());
            let mut out = response.join("\n");
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
        }
        Ok(())
    }

    /// Run one command line and return the response lines.
    pub async fn execute(&self, line: &str) -> Vec<String> {
        let command = match line.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(e) => return vec![format!("error: {}", e)],
        };
        match command {
            ControlCommand::List { all, verbosity } => {
                let format = ListingFormat {
                    verbosity,
                    local_time: self.local_time,
                };
                self.list(all)
                    .await
                    .iter()
                    .map(|snap| format_entry(snap, format))
                    .collect()
            }
            ControlCommand::Clear(target) => {
                let message = remove(&self.service, &target);
                info!("admin clear: {}", message);
                vec![message]
            }
            ControlCommand::Alive(target) => match alive(&self.service, &target) {
                Ok(message) => {
                    info!("admin alive: {}", message);
                    vec![message]
                }
                Err(e) => vec![format!("error: {}", e)],
            },
        }
    }

    async fn list(&self, all: bool) -> Vec<EntrySnapshot> {
        let mut entries = Vec::new();
        for (idx, ticket) in self.service.snapshot_entries(all).into_iter().enumerate() {
            match tokio::time::timeout(PARTITION_WAIT, ticket).await {
                Ok(Ok(mut part)) => entries.append(&mut part),
                _ => warn!(partition = idx, "partition busy, left out of listing"),
            }
        }
        entries.sort_by_key(|snap| (snap.rule_line, snap.key));
        entries
    }
}
