//! Out-of-band command interface: a reply socket speaking null terminated
//! text requests (`QUERY=`, `READ=<tag>`, `WRITE=<tag>:<value>`) over the
//! tag set of one protocol client.

use super::{CommsClient, CommsError, Endpoint, RegisterKind};
use log::{debug, error};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct CommandInterface;

impl CommandInterface {
    /// Binds the reply socket and spawns the accept loop. A bind failure is
    /// fatal for this interface only.
    pub async fn spawn(
        endpoint: &Endpoint,
        client: Arc<dyn CommsClient>,
    ) -> Result<JoinHandle<()>, CommsError> {
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| CommsError::InvalidEndpoint(endpoint.to_string()))?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|_| CommsError::BindFailed(addr.clone()))?;
        debug!("command interface listening on {}", addr);

        Ok(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(value) => value,
                    Err(err) => {
                        error!("command interface accept failed: {}", err);
                        continue;
                    }
                };
                debug!("command connection from {}", peer);
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, client).await {
                        error!("command connection error: {}", err);
                    }
                });
            }
        }))
    }
}

async fn handle_connection(
    stream: TcpStream,
    client: Arc<dyn CommsClient>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let read = reader.read_until(0, &mut buffer).await?;
        if read == 0 {
            return Ok(());
        }
        if buffer.last() == Some(&0) {
            buffer.pop();
        }
        let request = String::from_utf8_lossy(&buffer);
        let request = request.trim();
        debug!("received command request: {}", request);
        let mut reply = handle_request(client.as_ref(), request).await;
        reply.push('\0');
        writer.write_all(reply.as_bytes()).await?;
    }
}

async fn handle_request(client: &dyn CommsClient, request: &str) -> String {
    let (op, rest) = match request.split_once('=') {
        Some((op, rest)) => (op, rest),
        None => ("", request),
    };

    match op.to_ascii_uppercase().as_str() {
        "QUERY" => {
            let tags = client.tags();
            if tags.is_empty() {
                return "ERR=Client does not have any tag mappings".to_string();
            }
            let mut reply = String::from("ACK=");
            for tag in tags {
                reply.push_str(&tag);
                reply.push(',');
            }
            reply
        }
        "READ" => {
            let tag = rest;
            if !client.is_valid_tag(tag) {
                return format!("ERR=Client does not have a mapping for tag '{}'", tag);
            }
            match client.read_tag(tag) {
                Ok(register) => match register.kind {
                    RegisterKind::ValueReadOnly | RegisterKind::ValueReadWrite => {
                        format!("ACK={}:{}", tag, register.float_value)
                    }
                    RegisterKind::StatusReadOnly | RegisterKind::StatusReadWrite => {
                        format!("ACK={}:{}", tag, register.status)
                    }
                    _ => format!("ERR=Client had a problem reading tag '{}'", tag),
                },
                Err(err) => format!("ERR=Failed reading tag '{}': {}", tag, err),
            }
        }
        "WRITE" => {
            let (tag, value) = match rest.split_once(':') {
                Some((tag, value)) => (tag, value),
                None => {
                    return format!("ERR=Malformed write request '{}'", rest);
                }
            };
            if !client.is_valid_tag(tag) {
                return format!("ERR=Client does not have a mapping for tag '{}'", tag);
            }
            let result = if value == "true" || value == "false" {
                client.write_binary_tag(tag, value == "true").await
            } else {
                match value.parse::<f64>() {
                    Ok(parsed) => client.write_analog_tag(tag, parsed).await,
                    Err(_) => {
                        return format!("ERR=Malformed write value '{}'", value);
                    }
                }
            };
            match result {
                Ok(()) => format!("ACK=Wrote tag {} -- {}", tag, value),
                Err(err) => format!("ERR=Failed writing tag '{}': {}", tag, err),
            }
        }
        _ => "ERR=Unknown command type (must be QUERY|READ|WRITE)".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::CommandInterface;
    use crate::comms::{
        CommsClient, CommsError, Endpoint, RegisterBank, RegisterDescriptor, RegisterKind,
    };
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct StubClient {
        bank: RegisterBank,
    }

    impl StubClient {
        fn new() -> Self {
            let bank = RegisterBank::default();
            let mut power = RegisterDescriptor::analog(3, "load-power", RegisterKind::ValueReadOnly);
            power.float_value = 512.5;
            bank.add_analog("load-power", power);
            bank.add_binary(
                "load-breaker-toggle",
                RegisterDescriptor::binary(1, "load-breaker-toggle", RegisterKind::StatusReadWrite),
            );
            Self { bank }
        }
    }

    #[async_trait]
    impl CommsClient for StubClient {
        fn tags(&self) -> Vec<String> {
            self.bank.tags()
        }

        fn is_valid_tag(&self, tag: &str) -> bool {
            self.bank.has_tag(tag)
        }

        fn read_tag(&self, tag: &str) -> Result<RegisterDescriptor, CommsError> {
            self.bank.read_by_tag(tag)
        }

        async fn write_binary_tag(&self, tag: &str, status: bool) -> Result<(), CommsError> {
            let register = self.bank.read_by_tag(tag)?;
            self.bank.update_binary(register.address, status);
            Ok(())
        }

        async fn write_analog_tag(&self, tag: &str, value: f64) -> Result<(), CommsError> {
            let register = self.bank.read_by_tag(tag)?;
            self.bank.update_analog(register.address, value as f32);
            Ok(())
        }
    }

    async fn request(stream: &mut TcpStream, request: &str) -> String {
        let mut framed = request.as_bytes().to_vec();
        framed.push(0);
        stream.write_all(&framed).await.unwrap();
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0 {
                break;
            }
            reply.push(byte[0]);
        }
        String::from_utf8(reply).unwrap()
    }

    #[tokio::test]
    async fn test_query_read_write() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:35071").unwrap();
        let client = Arc::new(StubClient::new());
        let _handle = CommandInterface::spawn(&endpoint, client)
            .await
            .unwrap();

        let mut stream = TcpStream::connect("127.0.0.1:35071").await.unwrap();

        assert_eq!(
            request(&mut stream, "QUERY=").await,
            "ACK=load-breaker-toggle,load-power,"
        );
        assert_eq!(
            request(&mut stream, "READ=load-power").await,
            "ACK=load-power:512.5"
        );
        assert_eq!(
            request(&mut stream, "WRITE=load-breaker-toggle:false").await,
            "ACK=Wrote tag load-breaker-toggle -- false"
        );
        assert_eq!(
            request(&mut stream, "READ=load-breaker-toggle").await,
            "ACK=load-breaker-toggle:false"
        );
        assert_eq!(
            request(&mut stream, "READ=unknown").await,
            "ERR=Client does not have a mapping for tag 'unknown'"
        );
        assert_eq!(
            request(&mut stream, "PING=").await,
            "ERR=Unknown command type (must be QUERY|READ|WRITE)"
        );
    }
}
