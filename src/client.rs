//! A thin async client for the cache protocol.

use crate::protocol::{NOT_FOUND, Request};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with something other than `ok`.
    #[error("{0}")]
    Server(String),

    #[error("connection closed by server")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Server(msg) if msg == NOT_FOUND)
    }
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect and wait for the server's admission greeting.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(reader),
            writer,
        };
        client.expect_ok().await?;
        Ok(client)
    }

    pub async fn set(&mut self, key: &str, value: &str, expire_secs: i64) -> Result<(), ClientError> {
        self.send(&Request::set(key, value, expire_secs)).await?;
        self.expect_ok().await
    }

    pub async fn get(&mut self, key: &str) -> Result<String, ClientError> {
        self.send(&Request::get(key)).await?;
        self.expect_ok().await?;
        self.read_line().await
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), ClientError> {
        self.send(&Request::delete(key)).await?;
        self.expect_ok().await
    }

    async fn send(&mut self, req: &Request) -> Result<(), ClientError> {
        self.writer.write_all(&req.serialize()).await?;
        Ok(())
    }

    async fn expect_ok(&mut self) -> Result<(), ClientError> {
        let line = self.read_line().await?;
        if line == "ok" {
            Ok(())
        } else {
            Err(ClientError::Server(line))
        }
    }

    async fn read_line(&mut self) -> Result<String, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(line)
    }
}
