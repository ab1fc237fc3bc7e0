//! Wire protocol for the client<->daemon socket (§6). Framing is
//! length-prefixed JSON: `<uint32 length, big-endian><UTF-8 JSON body>`,
//! distinct from the newline-delimited framing of the pattern this is
//! adapted from, so a single connection can carry arbitrarily large
//! request/response bodies (a `start` call's full `AgentConfig`, a
//! `list` response with many records) without line-based ambiguity.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{HarnessError, Result};
use crate::model::{AgentConfig, AgentRecord, Verdict};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Request {
    List,
    Start(AgentConfig),
    Stop { agent_id: u64 },
    Status { agent_id: u64 },
    Remove { agent_id: u64 },
    Subscribe { agent_id: Option<u64> },
    ResolveCheckpoint {
        agent_id: u64,
        checkpoint_id: String,
        verdict: Verdict,
        #[serde(default)]
        modifications: Option<serde_json::Value>,
        #[serde(default)]
        human_notes: Option<String>,
    },
}

/// `{ok, value|error}` per §6: `ok` is a plain boolean, not a tagged
/// variant name, so clients in any language can branch on it trivially.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(value: &T) -> Self {
        Response {
            ok: true,
            value: Some(serde_json::to_value(value).unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response {
            ok: false,
            value: None,
            error: Some(message.into()),
        }
    }
}

impl From<HarnessError> for Response {
    fn from(e: HarnessError) -> Self {
        Response::err(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    StatusChanged { agent: AgentRecord },
    LogLine { agent_id: u64, line: String },
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value).map_err(|source| HarnessError::Json {
        path: "<socket>".into(),
        source,
    })?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| HarnessError::protocol("frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame. Returns `Ok(None)` on a clean EOF
/// before any bytes of the next frame arrive (the connection closed).
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(HarnessError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let value = serde_json::from_slice(&body).map_err(|source| HarnessError::Json {
        path: "<socket>".into(),
        source,
    })?;
    Ok(Some(value))
}
