//! Frames JSON messages over any `AsyncRead + AsyncWrite` duplex connection
//! (a TCP socket to a remote admin client, a Unix socket, an in-process
//! pipe in tests) using a 4-byte big-endian length prefix.

use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{ProxyError, Result};

/// A bidirectional, message-framed connection carrying `Tx` messages out and
/// `Rx` messages in.
pub struct MessageChannel<IO, Tx, Rx> {
    framed: Framed<IO, LengthDelimitedCodec>,
    _tx: std::marker::PhantomData<Tx>,
    _rx: std::marker::PhantomData<Rx>,
}

impl<IO, Tx, Rx> MessageChannel<IO, Tx, Rx>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    Tx: Serialize,
    Rx: DeserializeOwned,
{
    pub fn new(io: IO) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(64 * 1024 * 1024)
            .new_codec();
        Self {
            framed: Framed::new(io, codec),
            _tx: std::marker::PhantomData,
            _rx: std::marker::PhantomData,
        }
    }

    pub async fn send(&mut self, message: &Tx) -> Result<()> {
        let bytes = serde_json::to_vec(message).map_err(|e| ProxyError::Channel(e.to_string()))?;
        self.framed
            .send(bytes.into())
            .await
            .map_err(|e| ProxyError::Channel(e.to_string()))
    }

    pub async fn recv(&mut self) -> Result<Option<Rx>> {
        match self.framed.next().await {
            Some(Ok(bytes)) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| ProxyError::Channel(format!("malformed frame: {e}")))?;
                Ok(Some(value))
            }
            Some(Err(e)) => Err(ProxyError::Channel(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::duplex;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (client_io, server_io) = duplex(4096);
        let mut client: MessageChannel<_, Ping, Ping> = MessageChannel::new(client_io);
        let mut server: MessageChannel<_, Ping, Ping> = MessageChannel::new(server_io);

        client.send(&Ping { n: 7 }).await.unwrap();
        let received = server.recv().await.unwrap().unwrap();
        assert_eq!(received, Ping { n: 7 });
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_close() {
        let (client_io, server_io) = duplex(4096);
        drop(client_io);
        let mut server: MessageChannel<_, Ping, Ping> = MessageChannel::new(server_io);
        assert!(server.recv().await.unwrap().is_none());
    }
}
