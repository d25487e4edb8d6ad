//! SMTP session handler
//!
//! One task per connection. Commands are accepted permissively (AUTH is
//! advisory, MAIL/RCPT always succeed); all policy runs in one place at
//! end-of-DATA, against a single configuration snapshot, and ends in
//! exactly one delivery event. Rejections answer with a generic 554;
//! the reason goes to the event stream, not the wire.

use crate::cidr;
use crate::delivery::{self, DeliveryRequest};
use crate::resolver::resolve;
use crate::smtp::server::SmtpServer;
use crate::store::LoadedConfig;
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use mail_parser::MessageParser;
use smtprelay_common::config::{ServiceConfig, Tenant, TlsMode};
use smtprelay_common::event::{DeliveryEvent, EventLevel};
use smtprelay_common::{Reason, RelayError};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_LINE_BYTES: usize = 65_536;
// Transport ceiling; the per-tenant policy limit applies after resolution.
const MAX_DATA_BYTES: usize = 52_428_800;

#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

pub(crate) struct Session {
    server: Arc<SmtpServer>,
    peer: SocketAddr,
}

impl Session {
    pub(crate) fn new(server: Arc<SmtpServer>, peer: SocketAddr) -> Self {
        Self { server, peer }
    }

    pub(crate) async fn run(self, stream: TcpStream) -> Result<()> {
        let snapshot = self.server.store.snapshot();
        let service = &snapshot.service;
        let ip = self.peer.ip();

        if let Some(denial) = connect_denial(&snapshot, ip) {
            warn!(peer = %ip, error = %denial, "connection denied");
            let scope = EventScope {
                msg_id: Uuid::new_v4(),
                rcpt_count: 0,
                rcpts: String::new(),
                size_kb: 0,
                remote_ip: ip.to_string(),
            };
            self.server.events.emit(&scope.event(
                EventLevel::Err,
                String::new(),
                String::new(),
                None,
                Some(denial.reason()),
                Some(denial.to_string()),
            ));
            let mut io = SessionIo::new(SessionStream::Plain(stream));
            let _ = io.write_line("554 5.7.1 Access denied").await;
            return Ok(());
        }

        let mut tls_active = false;
        let mut io = if service.tls_mode() == TlsMode::Implicit {
            match &self.server.tls_acceptor {
                Some(acceptor) => {
                    let tls = acceptor.accept(stream).await?;
                    tls_active = true;
                    SessionIo::new(SessionStream::Tls(Box::new(tls)))
                }
                None => {
                    warn!("implicit TLS configured but no usable certificate, serving plaintext");
                    SessionIo::new(SessionStream::Plain(stream))
                }
            }
        } else {
            SessionIo::new(SessionStream::Plain(stream))
        };

        let hostname = service.hostname().to_string();
        io.write_line(&format!("220 {hostname} ESMTP smtprelay"))
            .await?;

        let mut state = SessionState::Connected;
        let mut mail_from: Option<String> = None;
        let mut rcpts: Vec<String> = Vec::new();
        let mut authenticated: Option<String> = None;

        loop {
            let Some(line) = io.read_line().await? else {
                debug!(peer = %self.peer, "client disconnected");
                break;
            };
            let line = line.trim().to_string();
            debug!(peer = %self.peer, %line, "smtp command");

            let (command, args) = parse_command(&line);
            match command.to_ascii_uppercase().as_str() {
                "HELO" => {
                    state = SessionState::Greeted;
                    io.write_line(&format!("250 {hostname} Hello {args}")).await?;
                }

                "EHLO" => {
                    state = SessionState::Greeted;
                    let mut extensions = vec![format!("{hostname} Hello {args}"), "8BITMIME".to_string()];
                    if self.server.tls_acceptor.is_some()
                        && !tls_active
                        && service.tls_mode() == TlsMode::Starttls
                    {
                        extensions.push("STARTTLS".to_string());
                    }
                    if !service.auth_users.is_empty() {
                        extensions.push("AUTH PLAIN LOGIN".to_string());
                    }
                    let last = extensions.len() - 1;
                    for (i, ext) in extensions.iter().enumerate() {
                        if i == last {
                            io.write_line(&format!("250 {ext}")).await?;
                        } else {
                            io.write_line(&format!("250-{ext}")).await?;
                        }
                    }
                }

                "STARTTLS" => {
                    let Some(acceptor) = &self.server.tls_acceptor else {
                        io.write_line("502 5.5.1 STARTTLS not supported").await?;
                        continue;
                    };
                    if tls_active {
                        io.write_line("503 5.5.1 TLS already active").await?;
                        continue;
                    }
                    io.write_line("220 2.0.0 Ready to start TLS").await?;
                    let upgraded = match io.into_stream() {
                        SessionStream::Plain(tcp) => {
                            SessionStream::Tls(Box::new(acceptor.accept(tcp).await?))
                        }
                        tls @ SessionStream::Tls(_) => tls,
                    };
                    io = SessionIo::new(upgraded);
                    tls_active = true;
                    // Fresh handshake, fresh session.
                    state = SessionState::Connected;
                    mail_from = None;
                    rcpts.clear();
                    authenticated = None;
                }

                "AUTH" => {
                    if state == SessionState::Connected {
                        io.write_line("503 5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    self.handle_auth(&mut io, args, service, &mut authenticated)
                        .await?;
                }

                "MAIL" => {
                    if state == SessionState::Connected {
                        io.write_line("503 5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    match parse_mail_from(args) {
                        Some(from) => {
                            mail_from = Some(from.unwrap_or_default());
                            rcpts.clear();
                            state = SessionState::MailFrom;
                            io.write_line("250 2.1.0 OK").await?;
                        }
                        None => {
                            io.write_line("501 5.1.7 Bad sender address syntax").await?;
                        }
                    }
                }

                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        io.write_line("503 5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    match parse_rcpt_to(args) {
                        Some(rcpt) => {
                            rcpts.push(rcpt);
                            state = SessionState::RcptTo;
                            io.write_line("250 2.1.5 OK").await?;
                        }
                        None => {
                            io.write_line("501 5.1.3 Bad recipient address syntax").await?;
                        }
                    }
                }

                "DATA" => {
                    if state != SessionState::RcptTo || rcpts.is_empty() {
                        io.write_line("503 5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    io.write_line("354 Start mail input; end with <CRLF>.<CRLF>")
                        .await?;
                    match read_data(&mut io).await {
                        Ok(data) => {
                            let accepted = self
                                .process_transaction(&data, &mail_from, &rcpts, tls_active)
                                .await;
                            if accepted {
                                io.write_line("250 2.0.0 OK").await?;
                            } else {
                                io.write_line("554 5.0.0 Delivery failed").await?;
                            }
                        }
                        Err(e) => {
                            warn!(peer = %self.peer, error = %e, "failed to read message data");
                            io.write_line("451 4.3.0 Error reading message").await?;
                        }
                    }
                    state = SessionState::Greeted;
                    mail_from = None;
                    rcpts.clear();
                }

                "RSET" => {
                    mail_from = None;
                    rcpts.clear();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    io.write_line("250 2.0.0 OK").await?;
                }

                "NOOP" => {
                    io.write_line("250 2.0.0 OK").await?;
                }

                "QUIT" => {
                    io.write_line("221 2.0.0 Bye").await?;
                    break;
                }

                "VRFY" => {
                    io.write_line("252 2.5.2 Cannot VRFY user").await?;
                }

                _ => {
                    io.write_line("500 5.5.2 Command not recognized").await?;
                }
            }
        }

        Ok(())
    }

    /// Advisory authentication: the exchange is honored and logged, but
    /// bad or unknown credentials leave the session anonymous instead
    /// of rejecting it.
    async fn handle_auth<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        io: &mut SessionIo<S>,
        args: &str,
        service: &ServiceConfig,
        authenticated: &mut Option<String>,
    ) -> Result<()> {
        let mut parts = args.splitn(2, ' ');
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();

        match mechanism.as_str() {
            "PLAIN" => {
                let payload = match parts.next().map(str::trim).filter(|s| !s.is_empty()) {
                    Some(initial) => initial.to_string(),
                    None => {
                        io.write_line("334 ").await?;
                        match io.read_line().await? {
                            Some(line) => line.trim().to_string(),
                            None => return Ok(()),
                        }
                    }
                };
                *authenticated = decode_auth_plain(&payload)
                    .and_then(|(user, pass)| verify_credentials(service, &user, &pass));
                io.write_line("235 2.7.0 Authentication successful").await?;
            }
            "LOGIN" => {
                io.write_line("334 VXNlcm5hbWU6").await?;
                let Some(user_line) = io.read_line().await? else {
                    return Ok(());
                };
                io.write_line("334 UGFzc3dvcmQ6").await?;
                let Some(pass_line) = io.read_line().await? else {
                    return Ok(());
                };
                let user = decode_base64(user_line.trim());
                let pass = decode_base64(pass_line.trim());
                *authenticated = match (user, pass) {
                    (Some(user), Some(pass)) => verify_credentials(service, &user, &pass),
                    _ => None,
                };
                io.write_line("235 2.7.0 Authentication successful").await?;
            }
            _ => {
                io.write_line("504 5.5.4 Unrecognized authentication mechanism")
                    .await?;
            }
        }
        if let Some(user) = authenticated {
            debug!(peer = %self.peer, %user, "authenticated");
        }
        Ok(())
    }

    /// End-of-DATA pipeline. Emits exactly one `deliver.ok` or
    /// `deliver.err` event (plus `deliver.warn` for a degraded
    /// resolution) and reports whether the message was accepted.
    async fn process_transaction(
        &self,
        data: &[u8],
        mail_from: &Option<String>,
        rcpts: &[String],
        tls_active: bool,
    ) -> bool {
        let snapshot = self.server.store.snapshot();
        let scope = EventScope {
            msg_id: Uuid::new_v4(),
            rcpt_count: rcpts.len(),
            rcpts: rcpts.join(", "),
            size_kb: (data.len() as u64).div_ceil(1024),
            remote_ip: self.peer.ip().to_string(),
        };

        let Some(parsed) = MessageParser::default().parse(data) else {
            let from = mail_from.clone().unwrap_or_default();
            self.server.events.emit(&scope.event(
                EventLevel::Err,
                String::new(),
                from,
                None,
                Some(Reason::Unknown),
                Some(RelayError::ParseFailed.to_string()),
            ));
            return false;
        };

        // Null envelope sender falls back to the parsed From: header.
        let observed_from = mail_from
            .clone()
            .filter(|f| !f.is_empty())
            .or_else(|| {
                parsed
                    .from()
                    .and_then(|a| a.first())
                    .and_then(|a| a.address())
                    .map(|a| a.to_string())
            })
            .unwrap_or_default();

        let plan = match plan_transaction(
            &snapshot,
            self.peer.ip(),
            tls_active,
            &observed_from,
            rcpts,
            scope.size_kb,
        ) {
            Ok(plan) => plan,
            Err(failure) => {
                self.server.events.emit(&scope.event(
                    EventLevel::Err,
                    failure.tenant.unwrap_or_default(),
                    observed_from,
                    None,
                    Some(failure.error.reason()),
                    Some(failure.error.to_string()),
                ));
                return false;
            }
        };
        let tenant = plan.tenant;
        let method = tenant.delivery.method();

        if plan.fallback {
            self.server.events.emit(&scope.event(
                EventLevel::Warn,
                tenant.name.clone(),
                observed_from.clone(),
                Some(method),
                Some(Reason::Fallback),
                None,
            ));
        }

        if let Err(e) = self
            .server
            .limiter
            .check(&tenant.name, tenant.policy.rate_limit.as_ref())
        {
            self.server.events.emit(&scope.event(
                EventLevel::Err,
                tenant.name.clone(),
                observed_from,
                Some(method),
                Some(e.reason()),
                Some(e.to_string()),
            ));
            return false;
        }

        let request = DeliveryRequest {
            tenant,
            message: &parsed,
            rcpts,
            envelope_from: &plan.effective_from,
            bcc_archive: tenant.policy.bcc_archive.as_deref(),
            save_to_sent: tenant.policy.save_to_sent_items,
        };
        match delivery::deliver(&self.server.graph, &snapshot.service, &request).await {
            Ok(()) => {
                self.server.events.emit(&scope.event(
                    EventLevel::Ok,
                    tenant.name.clone(),
                    plan.effective_from.clone(),
                    Some(method),
                    None,
                    None,
                ));
                true
            }
            Err(e) => {
                self.server.events.emit(&scope.event(
                    EventLevel::Err,
                    tenant.name.clone(),
                    plan.effective_from.clone(),
                    Some(method),
                    Some(e.reason()),
                    Some(e.to_string()),
                ));
                false
            }
        }
    }
}

/// Connect-time admission. Returns the denial, if any; both gates map
/// to the `ip_not_allowed` reason on the event stream.
fn connect_denial(cfg: &LoadedConfig, ip: IpAddr) -> Option<RelayError> {
    let service = &cfg.service;
    if !service.allowlist_ips.is_empty() && !cidr::contains(ip, &service.allowlist_ips) {
        return Some(RelayError::IpNotAllowed(format!(
            "{ip} not on service allowlist"
        )));
    }
    // Only gates when some tenant restricts by IP at all.
    if cfg.any_tenant_ip_ranges()
        && !cfg
            .tenants
            .iter()
            .any(|t| cidr::contains(ip, &t.routing.ip_ranges))
    {
        return Some(RelayError::IpNotAllowed(format!(
            "no tenant ipRange covers {ip}"
        )));
    }
    None
}

/// Everything decided before any delivery I/O
#[derive(Debug)]
pub(crate) struct TransactionPlan<'a> {
    pub tenant: &'a Tenant,
    pub fallback: bool,
    /// Envelope sender after any `forceFrom` override
    pub effective_from: String,
}

#[derive(Debug)]
pub(crate) struct PlanFailure {
    /// Resolved tenant, when the failure happened after resolution
    pub tenant: Option<String>,
    pub error: RelayError,
}

/// The policy pipeline between parse and dispatch, as a pure function
/// over one configuration snapshot.
pub(crate) fn plan_transaction<'a>(
    cfg: &'a LoadedConfig,
    remote_ip: IpAddr,
    tls_active: bool,
    observed_from: &str,
    rcpts: &[String],
    size_kb: u64,
) -> Result<TransactionPlan<'a>, PlanFailure> {
    let resolution = resolve(&cfg.tenants, remote_ip, rcpts, &cfg.service.routing_priority)
        .map_err(|error| PlanFailure {
            tenant: None,
            error,
        })?;
    let tenant = resolution.tenant;
    let fail = |error| PlanFailure {
        tenant: Some(tenant.name.clone()),
        error,
    };

    if cfg.service.require_tls && !tls_active {
        return Err(fail(RelayError::TlsRequired));
    }
    if !tenant.routing.ip_ranges.is_empty()
        && !cidr::contains(remote_ip, &tenant.routing.ip_ranges)
    {
        return Err(fail(RelayError::TenantIpNotAllowed {
            tenant: tenant.name.clone(),
            ip: remote_ip.to_string(),
        }));
    }
    if !tenant.allowed_senders.is_empty()
        && !tenant
            .allowed_senders
            .iter()
            .any(|a| a.eq_ignore_ascii_case(observed_from))
    {
        return Err(fail(RelayError::SenderNotAllowed {
            sender: observed_from.to_string(),
            tenant: tenant.name.clone(),
        }));
    }
    if let Some(limit_kb) = tenant.policy.max_message_size_kb {
        if size_kb > limit_kb {
            return Err(fail(RelayError::MessageTooLarge { size_kb, limit_kb }));
        }
    }

    let effective_from = tenant
        .policy
        .force_from
        .clone()
        .unwrap_or_else(|| observed_from.to_string());
    Ok(TransactionPlan {
        tenant,
        fallback: resolution.is_fallback(),
        effective_from,
    })
}

/// Per-transaction constants shared by every event it emits
struct EventScope {
    msg_id: Uuid,
    rcpt_count: usize,
    rcpts: String,
    size_kb: u64,
    remote_ip: String,
}

impl EventScope {
    fn event(
        &self,
        level: EventLevel,
        tenant: String,
        from: String,
        delivery_method: Option<&'static str>,
        reason: Option<Reason>,
        error: Option<String>,
    ) -> DeliveryEvent {
        DeliveryEvent {
            ts: Utc::now(),
            level,
            msg_id: self.msg_id,
            tenant,
            from,
            rcpt_count: self.rcpt_count,
            rcpts: self.rcpts.clone(),
            size_kb: self.size_kb,
            remote_ip: self.remote_ip.clone(),
            delivery_method,
            reason,
            error,
        }
    }
}

fn verify_credentials(service: &ServiceConfig, user: &str, pass: &str) -> Option<String> {
    let known = service
        .auth_users
        .iter()
        .any(|u| u.username == user && u.password == pass);
    if known {
        Some(user.to_string())
    } else {
        debug!(%user, "credentials not recognized, session stays anonymous");
        None
    }
}

fn decode_base64(payload: &str) -> Option<String> {
    let decoded = BASE64.decode(payload).ok()?;
    String::from_utf8(decoded).ok()
}

fn decode_auth_plain(payload: &str) -> Option<(String, String)> {
    let text = decode_base64(payload)?;
    let mut fields = text.split('\0');
    let _authzid = fields.next()?;
    let user = fields.next()?.to_string();
    let pass = fields.next()?.to_string();
    Some((user, pass))
}

/// Read message data until `<CRLF>.<CRLF>`, undoing dot-stuffing.
async fn read_data<S: AsyncRead + AsyncWrite + Unpin>(
    io: &mut SessionIo<S>,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let Some(line) = io.read_line().await? else {
            anyhow::bail!("connection closed during DATA");
        };
        if line.trim() == "." {
            break;
        }
        let bytes = if line.starts_with("..") {
            &line.as_bytes()[1..]
        } else {
            line.as_bytes()
        };
        data.extend_from_slice(bytes);
        data.extend_from_slice(b"\r\n");
        if data.len() > MAX_DATA_BYTES {
            anyhow::bail!("message exceeds transport limit");
        }
    }
    Ok(data)
}

/// Split a command line into verb and arguments.
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Parse `MAIL FROM:<address>`; `Some(None)` is the null sender.
fn parse_mail_from(args: &str) -> Option<Option<String>> {
    let args = args.trim();
    let addr_part = match args.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("FROM:") => args[5..].trim(),
        _ => return None,
    };

    if addr_part == "<>" {
        return Some(None);
    }
    let email = extract_address(addr_part)?;
    if email.is_empty() {
        Some(None)
    } else {
        Some(Some(email.to_string()))
    }
}

/// Parse `RCPT TO:<address>`.
fn parse_rcpt_to(args: &str) -> Option<String> {
    let args = args.trim();
    let addr_part = match args.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("TO:") => args[3..].trim(),
        _ => return None,
    };
    let email = extract_address(addr_part)?;
    if email.is_empty() || !email.contains('@') {
        return None;
    }
    Some(email.to_string())
}

fn extract_address(part: &str) -> Option<&str> {
    if let Some(rest) = part.strip_prefix('<') {
        let end = rest.find('>')?;
        Some(&rest[..end])
    } else {
        part.split_whitespace().next()
    }
}

/// Either side of the STARTTLS upgrade, one read/write surface
pub(crate) enum SessionStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Line-oriented session transport
pub(crate) struct SessionIo<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SessionIo<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn into_stream(self) -> S {
        self.stream
    }

    /// Next line without its terminator; `None` on a clean EOF.
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                return Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()));
            }
            if self.buf.len() > MAX_LINE_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await
    }
}
