// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Client traits for the updater's three collaborating services: the
//! storage authority, the CA-side CRL generator, and the CRL storer.
//! Transports implement these; the pipeline only ever sees the traits.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use core_types::types::{IssuerNameID, UnixNanos};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("call cancelled")]
    Cancelled,
    #[error("transport error: {source}")]
    Transport {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("remote error: {0}")]
    Remote(String),
}

impl ServiceError {
    pub fn transport(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ServiceError::Transport {
            source: source.into(),
        }
    }
}

/// Query for one shard's revocation entries. `revoked_before` pins the
/// result set to revocations visible at tick time, so re-running a tick
/// reproduces the same CRL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedCertsRequest {
    pub issuer_name_id: IssuerNameID,
    pub expires_after: UnixNanos,
    pub expires_before: UnixNanos,
    pub revoked_before: UnixNanos,
}

/// One revocation entry. The updater forwards these to the generator
/// verbatim; it never inspects them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedCertEntry {
    pub serial: String,
    pub reason: i64,
    pub revoked_at: UnixNanos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrlMetadata {
    pub issuer_name_id: IssuerNameID,
    pub this_update: UnixNanos,
    pub shard_idx: i64,
}

/// Frames sent to the CRL generator. Exactly one metadata frame, first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum GenerateCrlFrame {
    Metadata(CrlMetadata),
    Entry(RevokedCertEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrlStorerMetadata {
    pub issuer_name_id: IssuerNameID,
    pub number: UnixNanos,
    pub shard_idx: i64,
}

/// Frames sent to the CRL storer. Exactly one metadata frame, first.
#[derive(Debug, Clone)]
pub enum UploadCrlFrame {
    Metadata(CrlStorerMetadata),
    Chunk(Bytes),
}

pub type EntryStream = Pin<Box<dyn Stream<Item = ServiceResult<RevokedCertEntry>> + Send>>;

#[async_trait]
pub trait StorageAuthority: Send + Sync {
    /// Server-streaming query for every revocation in one shard window.
    async fn revoked_certs(&self, req: RevokedCertsRequest) -> ServiceResult<EntryStream>;
}

/// One open bidirectional exchange with the CRL generator.
///
/// The generator is allowed to buffer every input frame before emitting its
/// first chunk, so callers may finish sending (and half-close) before they
/// start receiving.
#[async_trait]
pub trait GenerateCrlStream: Send {
    async fn send(&mut self, frame: GenerateCrlFrame) -> ServiceResult<()>;
    /// Half-close the send side; no further frames will follow.
    async fn close_send(&mut self) -> ServiceResult<()>;
    /// Next signed-CRL chunk, or `None` once the stream is complete.
    async fn next_chunk(&mut self) -> ServiceResult<Option<Bytes>>;
}

#[async_trait]
pub trait CrlGenerator: Send + Sync {
    async fn generate_crl(&self) -> ServiceResult<Box<dyn GenerateCrlStream>>;
}

/// One open client-streaming upload to the CRL storer.
#[async_trait]
pub trait UploadCrlStream: Send {
    async fn send(&mut self, frame: UploadCrlFrame) -> ServiceResult<()>;
    /// Close the upload and wait for the storer's ack.
    async fn close_and_recv(self: Box<Self>) -> ServiceResult<()>;
}

#[async_trait]
pub trait CrlStorer: Send + Sync {
    async fn upload_crl(&self) -> ServiceResult<Box<dyn UploadCrlStream>>;
}
