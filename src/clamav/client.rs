use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use super::parser::Parser;
use super::types::{EngineVerdict, Version};
use crate::config::ClamAVConfig;
use crate::error::{Error, Result};

/// clamd accepts at most `StreamMaxLength` per INSTREAM; chunks stay small.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub enum ClamAVConnection {
    Unix { path: String },
    Tcp { host: String, port: u16 },
}

impl ClamAVConnection {
    pub fn from_config(config: &ClamAVConfig) -> Result<Self> {
        if let Some(socket_path) = &config.socket_path {
            Ok(ClamAVConnection::Unix {
                path: socket_path.clone(),
            })
        } else if let (Some(host), Some(port)) = (&config.tcp_host, config.tcp_port) {
            Ok(ClamAVConnection::Tcp {
                host: host.clone(),
                port,
            })
        } else {
            Err(Error::Config("No ClamAV connection configured".to_string()))
        }
    }
}

/// How file contents reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// `SCAN <path>`: clamd opens the file itself.
    Path,
    /// `INSTREAM`: the bytes are sent over the socket.
    Stream,
}

#[async_trait]
pub trait ClamAVClient: Send + Sync {
    async fn ping(&self) -> Result<bool>;
    async fn version(&self) -> Result<Version>;
    async fn scan(&self, path: &Path) -> Result<EngineVerdict>;
    async fn reload(&self) -> Result<()>;
}

pub struct ClamAVClientImpl {
    connection: ClamAVConnection,
    timeout: Duration,
    mode: ScanMode,
}

impl ClamAVClientImpl {
    pub fn new(connection: ClamAVConnection) -> Self {
        Self {
            connection,
            timeout: Duration::from_secs(30),
            mode: ScanMode::Stream,
        }
    }

    pub fn from_config(config: &ClamAVConfig) -> Result<Self> {
        let mode = if config.stream {
            ScanMode::Stream
        } else {
            ScanMode::Path
        };
        Ok(Self::new(ClamAVConnection::from_config(config)?)
            .with_timeout(Duration::from_secs(config.scan_timeout_seconds))
            .with_mode(mode))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    async fn send_command(&self, command: &str, payload: Option<&Path>) -> Result<String> {
        match &self.connection {
            #[cfg(unix)]
            ClamAVConnection::Unix { path } => {
                let stream = timeout(self.timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| Error::Timeout(format!("Connection to {} timed out", path)))?
                    .map_err(|e| {
                        Error::Connection(format!("Failed to connect to {}: {}", path, e))
                    })?;
                self.exchange(stream, command, payload).await
            }
            #[cfg(not(unix))]
            ClamAVConnection::Unix { .. } => Err(Error::Connection(
                "Unix sockets not supported on Windows".to_string(),
            )),
            ClamAVConnection::Tcp { host, port } => {
                let addr = format!("{}:{}", host, port);
                let stream = timeout(self.timeout, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| Error::Timeout(format!("Connection to {} timed out", addr)))?
                    .map_err(|e| {
                        Error::Connection(format!("Failed to connect to {}: {}", addr, e))
                    })?;
                self.exchange(stream, command, payload).await
            }
        }
    }

    async fn exchange<S>(&self, stream: S, command: &str, payload: Option<&Path>) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("Sending command to ClamAV: {}", command);

        let mut reader = BufReader::new(stream);
        let cmd = format!("z{}\0", command);
        reader.get_mut().write_all(cmd.as_bytes()).await?;

        if let Some(path) = payload {
            timeout(self.timeout, Self::write_stream(reader.get_mut(), path))
                .await
                .map_err(|_| Error::Timeout("Streaming file to ClamAV timed out".to_string()))??;
        }

        let mut response = Vec::new();
        timeout(self.timeout, reader.read_until(b'\0', &mut response))
            .await
            .map_err(|_| Error::Timeout("Read response timed out".to_string()))??;

        if response.last() == Some(&0) {
            response.pop();
        }

        String::from_utf8(response)
            .map_err(|e| Error::Parse(format!("Invalid UTF-8 in response: {}", e)))
    }

    async fn write_stream<W>(writer: &mut W, path: &Path) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];

        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&(read as u32).to_be_bytes()).await?;
            writer.write_all(&buf[..read]).await?;
        }

        writer.write_all(&[0, 0, 0, 0]).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ClamAVClient for ClamAVClientImpl {
    async fn ping(&self) -> Result<bool> {
        let response = self.send_command("PING", None).await?;
        Ok(response.trim() == "PONG")
    }

    async fn version(&self) -> Result<Version> {
        let response = self.send_command("VERSION", None).await?;
        Parser::parse_version(&response)
    }

    async fn scan(&self, path: &Path) -> Result<EngineVerdict> {
        let response = match self.mode {
            ScanMode::Path => {
                let command = format!("SCAN {}", path.to_string_lossy());
                self.send_command(&command, None).await?
            }
            ScanMode::Stream => self.send_command("INSTREAM", Some(path)).await?,
        };
        Ok(Parser::parse_scan_reply(&response))
    }

    async fn reload(&self) -> Result<()> {
        let response = self.send_command("RELOAD", None).await?;
        if response.trim() == "RELOADING" {
            Ok(())
        } else {
            Err(Error::ClamAV(format!(
                "Unexpected reload response: {}",
                response
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::net::TcpListener;

    /// Accepts one connection, records the command and any INSTREAM chunks,
    /// then answers with `reply`.
    async fn fake_clamd(reply: &'static str) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            loop {
                let byte = socket.read_u8().await.unwrap();
                received.push(byte);
                if byte == 0 {
                    break;
                }
            }
            if received.starts_with(b"zINSTREAM") {
                loop {
                    let len = socket.read_u32().await.unwrap();
                    received.extend_from_slice(&len.to_be_bytes());
                    if len == 0 {
                        break;
                    }
                    let mut chunk = vec![0u8; len as usize];
                    socket.read_exact(&mut chunk).await.unwrap();
                    received.extend_from_slice(&chunk);
                }
            }
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.write_all(b"\0").await.unwrap();
            received
        });

        (port, handle)
    }

    fn tcp_client(port: u16) -> ClamAVClientImpl {
        ClamAVClientImpl::new(ClamAVConnection::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        })
        .with_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_clamav_client_new() {
        let client = ClamAVClientImpl::new(ClamAVConnection::Tcp {
            host: "localhost".to_string(),
            port: 3310,
        });

        match client.connection {
            ClamAVConnection::Tcp { host, port } => {
                assert_eq!(host, "localhost");
                assert_eq!(port, 3310);
            }
            _ => panic!("Expected TCP connection"),
        }
        assert_eq!(client.timeout, Duration::from_secs(30));
        assert_eq!(client.mode, ScanMode::Stream);
    }

    #[test]
    fn test_client_from_config() {
        let config = ClamAVConfig {
            socket_path: None,
            tcp_host: Some("10.0.0.5".to_string()),
            tcp_port: Some(3310),
            scan_timeout_seconds: 12,
            stream: false,
        };
        let client = ClamAVClientImpl::from_config(&config).unwrap();
        assert_eq!(client.timeout, Duration::from_secs(12));
        assert_eq!(client.mode, ScanMode::Path);

        let unusable = ClamAVConfig {
            socket_path: None,
            tcp_host: None,
            tcp_port: None,
            scan_timeout_seconds: 12,
            stream: true,
        };
        assert!(matches!(
            ClamAVClientImpl::from_config(&unusable),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_connection_prefers_socket() {
        let config = ClamAVConfig {
            socket_path: Some("/var/run/clamav/clamd.ctl".to_string()),
            tcp_host: Some("127.0.0.1".to_string()),
            tcp_port: Some(3310),
            scan_timeout_seconds: 60,
            stream: true,
        };
        match ClamAVConnection::from_config(&config).unwrap() {
            ClamAVConnection::Unix { path } => assert_eq!(path, "/var/run/clamav/clamd.ctl"),
            _ => panic!("Expected Unix connection"),
        }
    }

    #[tokio::test]
    async fn test_ping_against_fake_daemon() {
        let (port, server) = fake_clamd("PONG").await;
        let client = tcp_client(port);

        assert!(client.ping().await.unwrap());
        assert_eq!(server.await.unwrap(), b"zPING\0".to_vec());
    }

    #[tokio::test]
    async fn test_instream_scan_sends_chunked_payload() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello quarantine").unwrap();
        file.flush().unwrap();

        let (port, server) = fake_clamd("stream: OK").await;
        let client = tcp_client(port);

        let verdict = client.scan(file.path()).await.unwrap();
        assert_eq!(verdict, EngineVerdict::Clean);

        let received = server.await.unwrap();
        let mut expected = b"zINSTREAM\0".to_vec();
        expected.extend_from_slice(&16u32.to_be_bytes());
        expected.extend_from_slice(b"hello quarantine");
        expected.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_path_scan_reports_signature() {
        let (port, server) = fake_clamd("/q/scanning/x.pdf: Eicar-Test-Signature FOUND").await;
        let client = tcp_client(port).with_mode(ScanMode::Path);

        let verdict = client.scan(Path::new("/q/scanning/x.pdf")).await.unwrap();
        assert_eq!(
            verdict,
            EngineVerdict::SignatureFound {
                name: "Eicar-Test-Signature".to_string()
            }
        );
        assert_eq!(server.await.unwrap(), b"zSCAN /q/scanning/x.pdf\0".to_vec());
    }

    #[tokio::test]
    async fn test_reload_unexpected_reply() {
        let (port, _server) = fake_clamd("NOPE").await;
        let client = tcp_client(port);

        match client.reload().await.unwrap_err() {
            Error::ClamAV(msg) => assert!(msg.contains("Unexpected reload response")),
            other => panic!("Expected ClamAV error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reload_success() {
        let (port, _server) = fake_clamd("RELOADING").await;
        assert!(tcp_client(port).reload().await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_connection_error_handling() {
        let connection = ClamAVConnection::Tcp {
            host: "192.0.2.1".to_string(), // RFC5737 test address (won't connect)
            port: 12345,
        };
        let client = ClamAVClientImpl::new(connection).with_timeout(Duration::from_millis(100));

        match client.ping().await.unwrap_err() {
            Error::Timeout(_) | Error::Connection(_) => {}
            other => panic!("Unexpected error type: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_error_handling() {
        let connection = ClamAVConnection::Unix {
            path: "/tmp/nonexistent_quarantine_clamd.sock".to_string(),
        };
        let client = ClamAVClientImpl::new(connection).with_timeout(Duration::from_millis(100));

        match client.ping().await.unwrap_err() {
            Error::Connection(_) => {}
            other => panic!("Expected connection error, got {:?}", other),
        }
    }
}
