//! Delivery adapters
//!
//! Two pluggable backends share one contract: given a resolved tenant,
//! the parsed message, and the policy-approved envelope, transmit the
//! message or fail with an adapter-specific error. Neither adapter
//! retries; resubmission is the sending client's decision.

pub mod graph;
pub mod smtp;

pub use graph::GraphClient;

use mail_parser::{Address, Message};
use smtprelay_common::config::{Delivery, ServiceConfig, Tenant};
use smtprelay_common::RelayError;

/// Everything an adapter needs to transmit one message
pub struct DeliveryRequest<'a> {
    pub tenant: &'a Tenant,
    pub message: &'a Message<'a>,
    /// Envelope recipients as received
    pub rcpts: &'a [String],
    /// Effective envelope sender (after any forceFrom override)
    pub envelope_from: &'a str,
    /// Archive address appended to the bcc list
    pub bcc_archive: Option<&'a str>,
    pub save_to_sent: bool,
}

/// Dispatch to the backend named by the tenant's delivery method.
pub async fn deliver(
    graph: &GraphClient,
    service: &ServiceConfig,
    request: &DeliveryRequest<'_>,
) -> Result<(), RelayError> {
    match &request.tenant.delivery {
        Delivery::Graph(cfg) => graph.send(cfg, request).await,
        Delivery::Smtp(cfg) => smtp::send(service, cfg, request).await,
    }
}

/// Flatten an address header into bare addresses.
pub(crate) fn header_addresses(header: Option<&Address<'_>>) -> Vec<String> {
    header.map_or_else(Vec::new, |a| {
        a.iter()
            .filter_map(|addr| addr.address())
            .map(|addr| addr.to_string())
            .collect()
    })
}

/// To-recipients: the parsed To: header when present, the envelope
/// recipient list otherwise.
pub(crate) fn to_addresses(request: &DeliveryRequest<'_>) -> Vec<String> {
    let to_header = header_addresses(request.message.to());
    if to_header.is_empty() {
        request.rcpts.to_vec()
    } else {
        to_header
    }
}

/// Bcc list: parsed Bcc: header plus the tenant's archive address.
pub(crate) fn bcc_addresses(request: &DeliveryRequest<'_>) -> Vec<String> {
    let mut bcc = header_addresses(request.message.bcc());
    if let Some(archive) = request.bcc_archive {
        bcc.push(archive.to_string());
    }
    bcc
}
