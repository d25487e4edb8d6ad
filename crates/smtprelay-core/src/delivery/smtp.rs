//! Outbound SMTP relay delivery
//!
//! Drives a full client-side SMTP dialogue against the relay host named
//! by the tenant: implicit TLS on port 465, otherwise plaintext with an
//! optional STARTTLS upgrade. The upstream is an explicitly configured
//! smarthost, so its certificate is not verified. When the relay
//! definition carries credentials the envelope sender is rewritten to
//! the authenticated identity; message headers are relayed untouched.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use smtprelay_common::config::{RelayServer, ServiceConfig, SmtpDelivery};
use smtprelay_common::RelayError;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::DeliveryRequest;

const IMPLICIT_TLS_PORT: u16 = 465;
const DIALOGUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay one message to the tenant's configured smarthost.
pub async fn send(
    service: &ServiceConfig,
    cfg: &SmtpDelivery,
    request: &DeliveryRequest<'_>,
) -> Result<(), RelayError> {
    let relay = service.relay_server(&cfg.smtp_server).ok_or_else(|| {
        RelayError::Config(format!("unknown smtpServer: {}", cfg.smtp_server))
    })?;

    let tcp = connect(service, relay).await?;
    let mut dialogue = if relay.port == IMPLICIT_TLS_PORT {
        let tls = tls_connect(relay, tcp).await?;
        Dialogue::new(MaybeTls::Tls(Box::new(tls)), &relay.name)
    } else {
        Dialogue::new(MaybeTls::Plain(tcp), &relay.name)
    };

    // Greeting, then EHLO.
    expect(&relay.name, dialogue.read_reply().await?, 220)?;
    let hostname = service.hostname().to_string();
    let reply = dialogue.command(&format!("EHLO {hostname}")).await?;
    expect(&relay.name, reply, 250)?;

    // Explicit upgrade on submission-style ports.
    if relay.port != IMPLICIT_TLS_PORT && relay.require_tls {
        let reply = dialogue.command("STARTTLS").await?;
        expect(&relay.name, reply, 220)?;
        dialogue = dialogue.upgrade(relay).await?;
        let reply = dialogue.command(&format!("EHLO {hostname}")).await?;
        expect(&relay.name, reply, 250)?;
    }

    let envelope_from = match &relay.auth {
        Some(auth) => {
            authenticate(&mut dialogue, relay, &auth.user, &auth.pass).await?;
            auth.user.as_str()
        }
        None => request.envelope_from,
    };
    if envelope_from != request.envelope_from {
        debug!(
            server = %relay.name,
            from = %envelope_from,
            "envelope sender rewritten to authenticated identity"
        );
    }

    let reply = dialogue
        .command(&format!("MAIL FROM:<{envelope_from}>"))
        .await?;
    if reply.code != 250 {
        return Err(RelayError::SmtpSenderRejected {
            server: relay.name.clone(),
            reply: reply.text,
        });
    }

    // Envelope carries the archive copy; headers stay as received.
    let mut rcpts = request.rcpts.to_vec();
    if let Some(archive) = request.bcc_archive {
        if !rcpts.iter().any(|r| r.eq_ignore_ascii_case(archive)) {
            rcpts.push(archive.to_string());
        }
    }
    for rcpt in &rcpts {
        let reply = dialogue.command(&format!("RCPT TO:<{rcpt}>")).await?;
        if reply.code != 250 && reply.code != 251 {
            return Err(RelayError::SmtpRelayDenied {
                server: relay.name.clone(),
                reply: reply.text,
            });
        }
    }

    let reply = dialogue.command("DATA").await?;
    expect(&relay.name, reply, 354)?;
    dialogue
        .write_raw(&dot_stuff(request.message.raw_message()))
        .await?;
    let reply = dialogue.read_reply().await?;
    expect(&relay.name, reply, 250)?;

    // Best-effort; the message is already accepted.
    let _ = dialogue.command("QUIT").await;
    Ok(())
}

fn expect(server: &str, reply: Reply, code: u16) -> Result<(), RelayError> {
    if reply.code == code {
        Ok(())
    } else {
        Err(RelayError::SmtpSendFailed {
            server: server.to_string(),
            detail: reply.text,
        })
    }
}

async fn authenticate(
    dialogue: &mut Dialogue<MaybeTls>,
    relay: &RelayServer,
    user: &str,
    pass: &str,
) -> Result<(), RelayError> {
    let reply = dialogue.command("AUTH LOGIN").await?;
    if reply.code != 334 {
        return auth_failed(relay, reply);
    }
    let reply = dialogue.command(&BASE64.encode(user)).await?;
    if reply.code != 334 {
        return auth_failed(relay, reply);
    }
    let reply = dialogue.command(&BASE64.encode(pass)).await?;
    if reply.code != 235 {
        return auth_failed(relay, reply);
    }
    Ok(())
}

fn auth_failed(relay: &RelayServer, reply: Reply) -> Result<(), RelayError> {
    Err(RelayError::SmtpRelayDenied {
        server: relay.name.clone(),
        reply: format!("authentication failed: {}", reply.text),
    })
}

/// Open the TCP connection, bound to the configured egress address when
/// one is set. A successful connect from a different local address is
/// reported but not fatal.
async fn connect(service: &ServiceConfig, relay: &RelayServer) -> Result<TcpStream, RelayError> {
    let egress: Option<IpAddr> = service.server_ip.as_deref().and_then(|s| s.parse().ok());

    let mut addrs = timed(&relay.name, lookup_host((relay.host.as_str(), relay.port))).await?;
    let addr = match egress {
        Some(ip) => addrs
            .find(|a| a.is_ipv4() == ip.is_ipv4())
            .ok_or_else(|| RelayError::SmtpSendFailed {
                server: relay.name.clone(),
                detail: format!("no address family match for {}", relay.host),
            })?,
        None => addrs.next().ok_or_else(|| RelayError::SmtpSendFailed {
            server: relay.name.clone(),
            detail: format!("no addresses for {}", relay.host),
        })?,
    };

    let socket = io_result(&relay.name, if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    })?;
    if let Some(ip) = egress {
        io_result(&relay.name, socket.bind(SocketAddr::new(ip, 0)))?;
    }

    let stream = timed(&relay.name, socket.connect(addr)).await?;
    if let (Some(expected), Ok(local)) = (egress, stream.local_addr()) {
        if local.ip() != expected {
            warn!(
                server = %relay.name,
                expected = %expected,
                actual = %local.ip(),
                "egress address differs from configured serverIP"
            );
        }
    }
    Ok(stream)
}

async fn tls_connect(
    relay: &RelayServer,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, RelayError> {
    let connector = TlsConnector::from(Arc::new(insecure_client_config()));
    let name = ServerName::try_from(relay.host.clone()).map_err(|e| RelayError::SmtpSendFailed {
        server: relay.name.clone(),
        detail: format!("invalid server name {}: {e}", relay.host),
    })?;
    timed(&relay.name, connector.connect(name, tcp)).await
}

fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
        .with_no_client_auth()
}

/// Accepts whatever certificate the configured smarthost presents.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Either side of the optional TLS upgrade, one read/write surface
enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One SMTP reply, multi-line continuations folded into `text`
#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

/// Line-oriented client dialogue with per-step deadlines
struct Dialogue<S> {
    stream: S,
    buf: Vec<u8>,
    server: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Dialogue<S> {
    fn new(stream: S, server: &str) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            server: server.to_string(),
        }
    }

    async fn command(&mut self, line: &str) -> Result<Reply, RelayError> {
        self.write_raw(format!("{line}\r\n").as_bytes()).await?;
        self.read_reply().await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        let server = self.server.clone();
        timed(&server, async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        })
        .await
    }

    async fn read_reply(&mut self) -> Result<Reply, RelayError> {
        let mut code = 0;
        let mut text = String::new();
        loop {
            let line = self.read_line().await?;
            if line.len() < 3 {
                return Err(self.protocol_error(&line));
            }
            let Ok(parsed) = line[..3].parse::<u16>() else {
                return Err(self.protocol_error(&line));
            };
            code = parsed;
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(line.get(4..).unwrap_or("").trim());
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(Reply { code, text });
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, RelayError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                return Ok(text.trim_end_matches(['\r', '\n']).to_string());
            }
            let mut chunk = [0u8; 512];
            let server = self.server.clone();
            let n = timed(&server, self.stream.read(&mut chunk)).await?;
            if n == 0 {
                return Err(RelayError::SmtpSendFailed {
                    server: self.server.clone(),
                    detail: "connection closed by relay".to_string(),
                });
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn protocol_error(&self, line: &str) -> RelayError {
        RelayError::SmtpSendFailed {
            server: self.server.clone(),
            detail: format!("malformed reply: {line}"),
        }
    }
}

impl Dialogue<MaybeTls> {
    async fn upgrade(self, relay: &RelayServer) -> Result<Self, RelayError> {
        let Dialogue { stream, buf, server } = self;
        let stream = match stream {
            MaybeTls::Plain(tcp) => MaybeTls::Tls(Box::new(tls_connect(relay, tcp).await?)),
            tls @ MaybeTls::Tls(_) => tls,
        };
        Ok(Dialogue { stream, buf, server })
    }
}

async fn timed<T, F>(server: &str, fut: F) -> Result<T, RelayError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(DIALOGUE_TIMEOUT, fut).await {
        Ok(result) => io_result(server, result),
        Err(_) => Err(RelayError::SmtpSendFailed {
            server: server.to_string(),
            detail: "timed out".to_string(),
        }),
    }
}

fn io_result<T>(server: &str, result: io::Result<T>) -> Result<T, RelayError> {
    result.map_err(|e| RelayError::SmtpSendFailed {
        server: server.to_string(),
        detail: e.to_string(),
    })
}

/// Prepare message bytes for the DATA phase: CRLF line endings, leading
/// dots doubled, terminating `.` line appended.
fn dot_stuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 8);
    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    // split() yields a trailing empty slice when raw ends in \n
    if raw.last() == Some(&b'\n') {
        out.truncate(out.len() - 2);
    }
    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_parser::MessageParser;
    use smtprelay_common::config::{
        Delivery, Policy, RelayAuth, Routing, Tenant,
    };
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_dot_stuffing() {
        let raw = b"Subject: x\r\n\r\n.hidden\r\nplain\r\n";
        let stuffed = dot_stuff(raw);
        assert_eq!(
            stuffed,
            b"Subject: x\r\n\r\n..hidden\r\nplain\r\n.\r\n".to_vec()
        );
    }

    #[test]
    fn test_dot_stuffing_normalizes_bare_lf() {
        let stuffed = dot_stuff(b"a\nb");
        assert_eq!(stuffed, b"a\r\nb\r\n.\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_multiline_reply_parsing() {
        let (client, server) = tokio::io::duplex(1024);
        let mut dialogue = Dialogue::new(client, "fake");

        let (mut read_half, mut write_half) = tokio::io::split(server);
        write_half
            .write_all(b"250-relay.example\r\n250-SIZE 10485760\r\n250 AUTH LOGIN\r\n")
            .await
            .unwrap();

        let reply = dialogue.read_reply().await.unwrap();
        assert_eq!(reply.code, 250);
        assert!(reply.text.contains("AUTH LOGIN"));

        // Command write reaches the peer verbatim.
        write_half.write_all(b"221 bye\r\n").await.unwrap();
        let reply = dialogue.command("QUIT").await.unwrap();
        assert_eq!(reply.code, 221);
        let mut echoed = [0u8; 6];
        read_half.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"QUIT\r\n");
    }

    struct FakeRelay {
        port: u16,
        seen: mpsc::UnboundedReceiver<String>,
    }

    /// Minimal upstream accepting one transaction; every client line is
    /// forwarded on the channel.
    async fn fake_relay(deny_rcpt: bool) -> FakeRelay {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, seen) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            write_half.write_all(b"220 fake ESMTP\r\n").await.unwrap();
            let mut in_data = false;
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(line.clone());
                if in_data {
                    if line == "." {
                        in_data = false;
                        write_half.write_all(b"250 queued\r\n").await.unwrap();
                    }
                    continue;
                }
                let upper = line.to_ascii_uppercase();
                let response: &[u8] = if upper.starts_with("EHLO") {
                    b"250-fake\r\n250 AUTH LOGIN\r\n"
                } else if upper == "AUTH LOGIN" {
                    b"334 VXNlcm5hbWU6\r\n"
                } else if upper.starts_with("MAIL FROM") {
                    b"250 ok\r\n"
                } else if upper.starts_with("RCPT TO") {
                    if deny_rcpt {
                        b"554 relay access denied\r\n"
                    } else {
                        b"250 ok\r\n"
                    }
                } else if upper == "DATA" {
                    in_data = true;
                    b"354 go ahead\r\n"
                } else if upper == "QUIT" {
                    write_half.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                } else {
                    // AUTH LOGIN base64 exchanges
                    if BASE64.decode(&line).is_ok() {
                        if line == BASE64.encode("relay-pass") {
                            b"235 authenticated\r\n"
                        } else {
                            b"334 UGFzc3dvcmQ6\r\n"
                        }
                    } else {
                        b"500 what\r\n"
                    }
                };
                write_half.write_all(response).await.unwrap();
            }
        });

        FakeRelay { port, seen }
    }

    fn service_with_relay(port: u16, auth: Option<RelayAuth>) -> (ServiceConfig, SmtpDelivery) {
        let service = ServiceConfig {
            host_name: Some("relay.test".to_string()),
            smtp_servers: vec![RelayServer {
                name: "upstream".to_string(),
                host: "127.0.0.1".to_string(),
                port,
                auth,
                require_tls: false,
            }],
            ..Default::default()
        };
        let delivery = SmtpDelivery {
            smtp_server: "upstream".to_string(),
        };
        (service, delivery)
    }

    fn tenant() -> Tenant {
        Tenant {
            name: "acme".into(),
            allowed_senders: vec![],
            routing: Routing::default(),
            policy: Policy::default(),
            delivery: Delivery::Smtp(SmtpDelivery {
                smtp_server: "upstream".into(),
            }),
        }
    }

    #[tokio::test]
    async fn test_relay_with_auth_rewrites_envelope() {
        let mut fake = fake_relay(false).await;
        let (service, delivery) = service_with_relay(
            fake.port,
            Some(RelayAuth {
                user: "relay-user@example.net".to_string(),
                pass: "relay-pass".to_string(),
            }),
        );

        let message = MessageParser::default()
            .parse(b"Subject: hi\r\n\r\n.leading dot\r\nbody\r\n".as_slice())
            .unwrap();
        let tenant = tenant();
        let rcpts = vec!["dest@remote.example".to_string()];
        let request = DeliveryRequest {
            tenant: &tenant,
            message: &message,
            rcpts: &rcpts,
            envelope_from: "orig@acme.example",
            bcc_archive: Some("archive@acme.example"),
            save_to_sent: false,
        };

        send(&service, &delivery, &request).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(line) = fake.seen.try_recv() {
            seen.push(line);
        }
        assert!(seen
            .iter()
            .any(|l| l == "MAIL FROM:<relay-user@example.net>"));
        assert!(seen.iter().any(|l| l == "RCPT TO:<dest@remote.example>"));
        assert!(seen.iter().any(|l| l == "RCPT TO:<archive@acme.example>"));
        // Dot-stuffed in transit.
        assert!(seen.iter().any(|l| l == "..leading dot"));
    }

    #[tokio::test]
    async fn test_auth_rejection_is_relay_denied() {
        let fake = fake_relay(false).await;
        let (service, delivery) = service_with_relay(
            fake.port,
            Some(RelayAuth {
                user: "relay-user@example.net".to_string(),
                pass: "wrong-pass".to_string(),
            }),
        );

        let message = MessageParser::default()
            .parse(b"Subject: hi\r\n\r\nbody\r\n".as_slice())
            .unwrap();
        let tenant = tenant();
        let rcpts = vec!["dest@remote.example".to_string()];
        let request = DeliveryRequest {
            tenant: &tenant,
            message: &message,
            rcpts: &rcpts,
            envelope_from: "orig@acme.example",
            bcc_archive: None,
            save_to_sent: false,
        };

        let err = send(&service, &delivery, &request).await.unwrap_err();
        match err {
            RelayError::SmtpRelayDenied { reply, .. } => {
                assert!(reply.contains("authentication failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rcpt_rejection_is_relay_denied() {
        let fake = fake_relay(true).await;
        let (service, delivery) = service_with_relay(fake.port, None);

        let message = MessageParser::default()
            .parse(b"Subject: hi\r\n\r\nbody\r\n".as_slice())
            .unwrap();
        let tenant = tenant();
        let rcpts = vec!["dest@remote.example".to_string()];
        let request = DeliveryRequest {
            tenant: &tenant,
            message: &message,
            rcpts: &rcpts,
            envelope_from: "orig@acme.example",
            bcc_archive: None,
            save_to_sent: false,
        };

        let err = send(&service, &delivery, &request).await.unwrap_err();
        match err {
            RelayError::SmtpRelayDenied { reply, .. } => {
                assert!(reply.contains("relay access denied"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
