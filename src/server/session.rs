//! Per-connection session: read request → dispatch → write response.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::codec::{read_message, write_message};
use crate::protocol::{Request, Response};
use crate::registry::Registry;
use crate::types::{Error, ServerConfig, DEFAULT_MAX_MESSAGE_BYTES};

/// Owns one accepted stream and serves its requests strictly in order.
#[derive(Debug)]
pub struct Session<S> {
    stream: BufReader<S>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    max_message_bytes: usize,
    write_timeout: Option<Duration>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, registry: Arc<Registry>) -> Self {
        Self {
            stream: BufReader::new(stream),
            registry,
            cancel: CancellationToken::new(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            write_timeout: None,
        }
    }

    /// Apply message size and write timeout limits from `config`.
    pub fn with_config(mut self, config: &ServerConfig) -> Self {
        self.max_message_bytes = config.max_message_bytes;
        self.write_timeout = config.write_timeout;
        self
    }

    /// Stop serving when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Serve until the peer disconnects, the stream fails, or the session is
    /// cancelled. The stream is shut down on the way out.
    ///
    /// A malformed or failing call only produces an error response; only
    /// transport errors end the session.
    pub async fn serve(mut self) -> std::io::Result<()> {
        let result = self.run().await;
        let _ = self.stream.shutdown().await;
        result
    }

    async fn run(&mut self) -> std::io::Result<()> {
        loop {
            let request: Request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                read = read_message::<_, Request>(&mut self.stream, self.max_message_bytes) => match read? {
                    Some(request) => request,
                    None => return Ok(()), // clean EOF
                },
            };

            let response = self.dispatch(request).await;
            self.reply(&response).await?;
        }
    }

    /// Methods are plain blocking functions, so they run on the blocking
    /// pool and never stall other connections on this worker.
    async fn dispatch(&self, request: Request) -> Response {
        let registry = self.registry.clone();
        let id = request.id;
        tokio::task::spawn_blocking(move || registry.dispatch(&request))
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Request {} did not complete: {}", id, e);
                Response::failure(id, Error::internal("method panicked"))
            })
    }

    async fn reply(&mut self, response: &Response) -> std::io::Result<()> {
        match self.write_timeout {
            None => write_message(&mut self.stream, response).await,
            Some(timeout) => tokio::time::timeout(timeout, write_message(&mut self.stream, response))
                .await
                .map_err(|_| {
                    tracing::warn!("Write timeout ({:?}), dropping connection", timeout);
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
                })?,
        }
    }
}
