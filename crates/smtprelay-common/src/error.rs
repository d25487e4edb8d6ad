//! Error types for smtprelay

use serde::Serialize;
use thiserror::Error;

/// Main error type for the relay engine
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IP not allowed: {0}")]
    IpNotAllowed(String),

    #[error("IP not allowed for tenant {tenant}: {ip}")]
    TenantIpNotAllowed { tenant: String, ip: String },

    #[error("Sender not allowed: {sender} for tenant: {tenant}")]
    SenderNotAllowed { sender: String, tenant: String },

    #[error("Message too large ({size_kb}KB > {limit_kb}KB)")]
    MessageTooLarge { size_kb: u64, limit_kb: u64 },

    #[error("TLS required")]
    TlsRequired,

    #[error("Rate limit exceeded for tenant {0}")]
    RateLimited(String),

    #[error("Graph authentication failed: {0}")]
    GraphAuth(String),

    #[error("Graph send failed {status}: {body}")]
    GraphSend { status: u16, body: String },

    #[error("Relay denied [{server}]: {reply}")]
    SmtpRelayDenied { server: String, reply: String },

    #[error("Sender rejected [{server}]: {reply}")]
    SmtpSenderRejected { server: String, reply: String },

    #[error("SMTP send failed [{server}]: {detail}")]
    SmtpSendFailed { server: String, detail: String },

    #[error("Message parse failed")]
    ParseFailed,

    #[error("No tenants configured")]
    NoTenants,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Reason code attached to the terminal delivery event.
    pub fn reason(&self) -> Reason {
        match self {
            RelayError::IpNotAllowed(_) => Reason::IpNotAllowed,
            RelayError::TenantIpNotAllowed { .. } => Reason::TenantIpNotAllowed,
            RelayError::SenderNotAllowed { .. } => Reason::SenderNotAllowed,
            RelayError::MessageTooLarge { .. } => Reason::MessageTooLarge,
            RelayError::TlsRequired => Reason::TlsRequired,
            RelayError::RateLimited(_) => Reason::RateLimited,
            RelayError::GraphAuth(_) | RelayError::GraphSend { .. } => Reason::GraphApiError,
            RelayError::SmtpRelayDenied { .. } => Reason::SmtpRelayDenied,
            RelayError::SmtpSenderRejected { .. } => Reason::SmtpSenderRejected,
            RelayError::SmtpSendFailed { .. } => Reason::SmtpSendFailed,
            RelayError::ParseFailed | RelayError::NoTenants | RelayError::Config(_) => {
                Reason::Unknown
            }
        }
    }
}

/// Reason codes carried on terminal transaction events.
///
/// `Fallback` is the one non-fatal member: it marks a resolution that
/// degraded to the default tenant but still proceeded to delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    IpNotAllowed,
    TenantIpNotAllowed,
    SenderNotAllowed,
    MessageTooLarge,
    TlsRequired,
    RateLimited,
    GraphApiError,
    SmtpRelayDenied,
    SmtpSenderRejected,
    SmtpSendFailed,
    Fallback,
    Unknown,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::IpNotAllowed => "ip_not_allowed",
            Reason::TenantIpNotAllowed => "tenant_ip_not_allowed",
            Reason::SenderNotAllowed => "sender_not_allowed",
            Reason::MessageTooLarge => "message_too_large",
            Reason::TlsRequired => "tls_required",
            Reason::RateLimited => "rate_limited",
            Reason::GraphApiError => "graph_api_error",
            Reason::SmtpRelayDenied => "smtp_relay_denied",
            Reason::SmtpSenderRejected => "smtp_sender_rejected",
            Reason::SmtpSendFailed => "smtp_send_failed",
            Reason::Fallback => "fallback",
            Reason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
