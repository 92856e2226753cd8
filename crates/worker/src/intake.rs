//! Line-delimited JSON command intake.
//!
//! Each input line is one [`Command`]; each produces exactly one [`Reply`]
//! line on the output. Blank lines are skipped. The worker binary reads
//! stdin and answers on stdout.
//!
//! ```text
//! {"op":"queue","prompt":"a lighthouse at dusk","preset":"realistic","layout":"portrait"}
//! {"op":"status","job_id":"5b6f..."}
//! {"op":"recent","limit":10}
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use atelier_core::layout::Layout;
use atelier_core::preset::Preset;
use atelier_core::types::JobId;
use atelier_pipeline::service::{JobService, QueueRequest, ServiceError};

/// Results listed by `recent` when no limit is given.
pub const DEFAULT_RECENT_LIMIT: u32 = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Queue {
        prompt: String,
        #[serde(default)]
        enhanced_prompt: Option<String>,
        preset: Preset,
        #[serde(default)]
        layout: Option<Layout>,
        #[serde(default)]
        seed: Option<u32>,
    },
    Status {
        job_id: JobId,
    },
    Recent {
        #[serde(default)]
        limit: Option<u32>,
    },
}

#[derive(Debug, Serialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    fn success(result: serde_json::Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Answer commands from `reader` until it ends. Returns the number of
/// commands handled.
pub async fn serve<R, W>(service: &JobService, reader: R, mut writer: W) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut handled = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Command>(line) {
            Ok(command) => execute(service, command).await,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected malformed command");
                Reply::failure(format!("invalid command: {e}"))
            }
        };

        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
        handled += 1;
    }

    Ok(handled)
}

async fn execute(service: &JobService, command: Command) -> Reply {
    match command {
        Command::Queue {
            prompt,
            enhanced_prompt,
            preset,
            layout,
            seed,
        } => {
            let request = QueueRequest {
                prompt,
                enhanced_prompt,
                preset,
                layout,
                seed,
            };
            reply(service.queue(request).await)
        }
        Command::Status { job_id } => reply(service.status(&job_id).await),
        Command::Recent { limit } => {
            reply(service.recent(limit.unwrap_or(DEFAULT_RECENT_LIMIT)).await)
        }
    }
}

fn reply<T: Serialize>(result: Result<T, ServiceError>) -> Reply {
    let value = match result {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Command failed");
            return Reply::failure(e.to_string());
        }
    };
    match serde_json::to_value(value) {
        Ok(value) => Reply::success(value),
        Err(e) => Reply::failure(format!("failed to encode reply: {e}")),
    }
}
