//! Async chat client
//!
//! This module provides a client for connecting to the chat server over
//! TCP, sending fully populated messages, and receiving whatever the server
//! pushes back. A background task decodes inbound frames and forwards them
//! as [`ClientEvent`]s.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{ChatError, Result};
use crate::protocol::codec::{self, MessageCodec};
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::protocol::message::{Message, MessageKind};
use crate::transport::buffer::{ReadBuffer, DEFAULT_READ_CAPACITY};

/// Chat client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Largest frame accepted from the server
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            connect_timeout: Duration::from_secs(10),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ..Self::default()
        }
    }
}

/// Events that the client can receive
#[derive(Debug)]
pub enum ClientEvent {
    /// A message pushed by the server
    Message(Message),
    /// The server stream could not be decoded any further
    Error(ChatError),
    /// Connection is gone
    Disconnected(String),
}

/// TCP chat client
#[derive(Debug)]
pub struct ChatClient {
    config: ClientConfig,
    name: Option<String>,
    writer: Option<OwnedWriteHalf>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    reader: JoinHandle<()>,
}

impl ChatClient {
    /// Connect to the chat server
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        info!("Connecting to chat server at {}", config.server_addr);

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(config.server_addr),
        )
        .await
        .map_err(|_| ChatError::timeout("Connection timeout"))?
        .map_err(|e| ChatError::connection(format!("Failed to connect: {}", e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(receive_loop(
            read_half,
            MessageCodec::new(config.max_frame_size),
            event_tx,
        ));

        info!("Connected to {}", config.server_addr);
        Ok(Self {
            config,
            name: None,
            writer: Some(write_half),
            events: event_rx,
            reader,
        })
    }

    /// Name sent with the last login, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.config.server_addr
    }

    /// Check if the write side is still open
    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    /// Encode and send one message
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ChatError::connection("Not connected to server"))?;

        let frame = codec::encode(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;

        debug!("Sent {:?} {}", message.kind, message.id);
        Ok(())
    }

    /// Next event from the server; `None` once the receiver task is done
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Wait up to `timeout` for the next message from the server
    pub async fn recv(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| ChatError::timeout("No message from server"))?;

            match event {
                Some(ClientEvent::Message(message)) => return Ok(message),
                Some(ClientEvent::Error(e)) => error!("Server stream error: {}", e),
                Some(ClientEvent::Disconnected(reason)) => {
                    return Err(ChatError::connection(reason));
                }
                None => return Err(ChatError::connection("Connection closed")),
            }
        }
    }

    /// Log in as `name`
    pub async fn login(&mut self, name: &str) -> Result<()> {
        self.name = Some(name.to_string());
        self.send(&Message::login(name)).await
    }

    /// Log out and close the write side
    pub async fn logout(&mut self) -> Result<()> {
        let message = Message::logout(self.sender());
        self.send(&message).await?;
        self.disconnect().await
    }

    pub async fn direct(&mut self, recipient: &str, content: &str) -> Result<()> {
        let message = Message::direct(self.sender(), recipient, content);
        self.send(&message).await
    }

    pub async fn group(&mut self, group_name: &str, content: &str) -> Result<()> {
        let message = Message::group(self.sender(), group_name, content);
        self.send(&message).await
    }

    /// Send `bytes` as `file_name` to a single user
    pub async fn send_file_to_user(
        &mut self,
        recipient: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let message = Message::file_to_user(self.sender(), recipient, file_name, bytes);
        self.send(&message).await
    }

    /// Send `bytes` as `file_name` to every other member of a group
    pub async fn send_file_to_group(
        &mut self,
        group_name: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let message = Message::file_to_group(self.sender(), group_name, file_name, bytes);
        self.send(&message).await
    }

    pub async fn create_group(&mut self, group_name: &str) -> Result<()> {
        let message = Message::create_group(self.sender(), group_name);
        self.send(&message).await
    }

    pub async fn join_group(&mut self, group_name: &str) -> Result<()> {
        let message = Message::join_group(self.sender(), group_name);
        self.send(&message).await
    }

    /// Shut down the write side; the receiver keeps draining until the
    /// server closes
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
            info!("Disconnected from chat server");
        }
        Ok(())
    }

    fn sender(&self) -> String {
        self.name.clone().unwrap_or_default()
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Decode frames from the server until the stream ends
async fn receive_loop(
    mut reader: OwnedReadHalf,
    mut codec: MessageCodec,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut buf = ReadBuffer::new();
    let mut batch = Vec::new();

    loop {
        buf.reserve(DEFAULT_READ_CAPACITY);
        match reader.read_buf(buf.bytes_mut()).await {
            Ok(0) => {
                let reason = "Server closed the connection".to_string();
                let _ = events.send(ClientEvent::Disconnected(reason));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let reason = format!("Connection lost: {}", e);
                let _ = events.send(ClientEvent::Disconnected(reason));
                return;
            }
        }

        let result = codec.decode_all(&mut buf, &mut batch);
        for message in batch.drain(..) {
            if message.kind == MessageKind::Error {
                debug!("Server error reply: {}", message.content_str());
            }
            if events.send(ClientEvent::Message(message)).is_err() {
                return;
            }
        }

        if let Err(e) = result {
            error!("Failed to decode server stream: {}", e);
            let _ = events.send(ClientEvent::Error(e));
            let reason = "Undecodable server stream".to_string();
            let _ = events.send(ClientEvent::Disconnected(reason));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_frame(stream: &mut TcpStream) -> Message {
        let len = stream.read_u32().await.unwrap();
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await.unwrap();
        codec::decode_payload(&payload).unwrap()
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_addr.port(), 8080);
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(2),
            ..ClientConfig::new(addr)
        };
        assert!(ChatClient::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let login = read_frame(&mut stream).await;
            let reply = Message::success(format!("Logged in as {}", login.sender));
            let frame = codec::encode(&reply).unwrap();
            stream.write_all(&frame).await.unwrap();

            let file = read_frame(&mut stream).await;
            let frame = codec::encode(&file).unwrap();
            stream.write_all(&frame).await.unwrap();
            login
        });

        let mut client = ChatClient::connect(ClientConfig::new(addr)).await.unwrap();
        client.login("alice").await.unwrap();

        let reply = client.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.kind, MessageKind::Success);
        assert_eq!(reply.content_str(), "Logged in as alice");

        let payload = vec![0u8, 1, 2, 0xFE, 0xFF];
        client
            .send_file_to_user("bob", "raw.bin", payload.clone())
            .await
            .unwrap();
        let echoed = client.recv(Duration::from_secs(5)).await.unwrap();
        assert_eq!(echoed.sender, "alice");
        assert_eq!(echoed.file_bytes, Some(payload));

        let login = server.await.unwrap();
        assert_eq!(login.kind, MessageKind::Login);
        assert_eq!(login.sender, "alice");
    }

    #[tokio::test]
    async fn test_disconnect_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut client = ChatClient::connect(ClientConfig::new(addr)).await.unwrap();
        server.await.unwrap();

        let err = client.recv(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ChatError::Connection(_)));
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move { listener.accept().await });

        let mut client = ChatClient::connect(ClientConfig::new(addr)).await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
        assert!(client.direct("bob", "hi").await.is_err());
    }
}
