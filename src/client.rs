//! Thin synchronous-feeling client over the daemon socket, used by the
//! one-shot CLI commands (§4.4a). Each call connects, writes one framed
//! request, reads one framed response, and disconnects — no async
//! runtime needed beyond the `#[tokio::main]` wrapper `main` already
//! sets up for the daemon subcommand.

use std::path::Path;

use tokio::net::UnixStream;

use crate::daemon::protocol::{read_frame, write_frame, Request, Response};
use crate::error::{HarnessError, Result};

pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            HarnessError::protocol(format!(
                "could not connect to daemon at {}: {e} (is it running?)",
                socket_path.display()
            ))
        })?;
        Ok(Client { stream })
    }

    pub async fn call(&mut self, request: Request) -> Result<Response> {
        write_frame(&mut self.stream, &request).await?;
        read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| HarnessError::protocol("daemon closed the connection without responding"))
    }
}
