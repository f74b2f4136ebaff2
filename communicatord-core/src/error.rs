//! Crate-wide error aggregate. Most modules return their own specific
//! error type (`AddressError`, `MessageError`, `TlsSetupError`, ...); this
//! exists for call sites — chiefly the `communicatord` binary — that need
//! to handle several of them uniformly.

use thiserror::Error;

use crate::address::AddressError;
use crate::message::MessageError;
use crate::transport::tls::TlsSetupError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("address error: {0}")]
    Address(#[from] AddressError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("tls setup error: {0}")]
    Tls(#[from] TlsSetupError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
