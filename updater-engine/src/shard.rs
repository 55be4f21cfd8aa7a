// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Single-shard CRL production: relay the storage authority's revocation
//! entries into the generator, then relay the generator's signed bytes into
//! the storer, hashing and counting as they pass.

use chrono::{DateTime, Utc};
use core_types::types::{unix_nanos, CrlId, IssuerNameID};
use futures::StreamExt;
use log::{debug, info};
use service_api::{
    CrlMetadata, CrlStorerMetadata, EntryStream, GenerateCrlFrame, RevokedCertEntry,
    RevokedCertsRequest, ServiceError, ServiceResult, UploadCrlFrame,
};
use sha2::{Digest, Sha256};
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::boundaries::ShardCalendar;
use crate::ServiceClients;

/// A failed pipeline step, annotated with the shard's CRL id. Nothing here
/// is retried; the next tick covers the same shard again.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("connecting to SA for {crl_id}: {source}")]
    SaConnect {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("retrieving entry from SA for {crl_id}: {source}")]
    SaRecv {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("connecting to CA for {crl_id}: {source}")]
    CaConnect {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("sending CA metadata for {crl_id}: {source}")]
    CaMetadata {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("sending entry to CA for {crl_id}: {source}")]
    CaEntry {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("closing CA request stream for {crl_id}: {source}")]
    CaCloseSend {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("receiving CRL bytes for {crl_id}: {source}")]
    CaRecv {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("connecting to CRLStorer for {crl_id}: {source}")]
    StorerConnect {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("sending CRLStorer metadata for {crl_id}: {source}")]
    StorerMetadata {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("uploading CRL bytes for {crl_id}: {source}")]
    StorerChunk {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
    #[error("closing CRLStorer upload stream for {crl_id}: {source}")]
    StorerClose {
        crl_id: CrlId,
        #[source]
        source: ServiceError,
    },
}

/// Size and digest of one produced CRL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShardOutcome {
    pub len: usize,
    pub sha256: [u8; 32],
}

/// Runs one service call, surfacing ambient cancellation as a service
/// error. Cancellation wins when both are ready.
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = ServiceResult<T>>,
) -> ServiceResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        out = fut => out,
    }
}

async fn guarded_next(
    cancel: &CancellationToken,
    entries: &mut EntryStream,
) -> ServiceResult<Option<RevokedCertEntry>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        next = entries.next() => next.transpose(),
    }
}

/// One complete CRL production for one shard. All three streams are scoped
/// to this call and released on every exit path.
pub(crate) async fn tick_shard(
    cancel: &CancellationToken,
    clients: &ServiceClients,
    calendar: &ShardCalendar,
    at_time: DateTime<Utc>,
    issuer_name_id: IssuerNameID,
    shard_idx: usize,
) -> Result<ShardOutcome, ShardError> {
    let at_ns = unix_nanos(at_time);
    let crl_id = CrlId::new(issuer_name_id, at_ns, shard_idx);
    debug!(
        "ticking shard {} of issuer {} at time {}",
        shard_idx, issuer_name_id, at_time
    );

    let (expires_after, expires_before) = calendar.shard_boundaries(at_ns, shard_idx);

    let mut entries = guarded(
        cancel,
        clients.sa.revoked_certs(RevokedCertsRequest {
            issuer_name_id,
            expires_after,
            expires_before,
            revoked_before: at_ns,
        }),
    )
    .await
    .map_err(|source| ShardError::SaConnect { crl_id, source })?;

    let mut ca_stream = guarded(cancel, clients.ca.generate_crl())
        .await
        .map_err(|source| ShardError::CaConnect { crl_id, source })?;

    guarded(
        cancel,
        ca_stream.send(GenerateCrlFrame::Metadata(CrlMetadata {
            issuer_name_id,
            this_update: at_ns,
            shard_idx: shard_idx as i64,
        })),
    )
    .await
    .map_err(|source| ShardError::CaMetadata { crl_id, source })?;

    loop {
        let entry = guarded_next(cancel, &mut entries)
            .await
            .map_err(|source| ShardError::SaRecv { crl_id, source })?;
        let Some(entry) = entry else {
            break;
        };
        guarded(cancel, ca_stream.send(GenerateCrlFrame::Entry(entry)))
            .await
            .map_err(|source| ShardError::CaEntry { crl_id, source })?;
    }

    // The generator holds the whole to-be-signed CRL in memory before it can
    // sign, so closing our send side before reading any chunks is safe.
    guarded(cancel, ca_stream.close_send())
        .await
        .map_err(|source| ShardError::CaCloseSend { crl_id, source })?;

    let mut upload = guarded(cancel, clients.storer.upload_crl())
        .await
        .map_err(|source| ShardError::StorerConnect { crl_id, source })?;

    guarded(
        cancel,
        upload.send(UploadCrlFrame::Metadata(CrlStorerMetadata {
            issuer_name_id,
            number: at_ns,
            shard_idx: shard_idx as i64,
        })),
    )
    .await
    .map_err(|source| ShardError::StorerMetadata { crl_id, source })?;

    let mut crl_len = 0usize;
    let mut crl_hash = Sha256::new();
    loop {
        let chunk = guarded(cancel, ca_stream.next_chunk())
            .await
            .map_err(|source| ShardError::CaRecv { crl_id, source })?;
        let Some(chunk) = chunk else {
            break;
        };
        guarded(cancel, upload.send(UploadCrlFrame::Chunk(chunk.clone())))
            .await
            .map_err(|source| ShardError::StorerChunk { crl_id, source })?;
        crl_len += chunk.len();
        crl_hash.update(&chunk);
    }

    let digest = crl_hash.finalize();
    info!(
        "generated CRL: id=[{}] size=[{}] hash=[{:x}]",
        crl_id, crl_len, digest
    );

    guarded(cancel, upload.close_and_recv())
        .await
        .map_err(|source| ShardError::StorerClose { crl_id, source })?;

    Ok(ShardOutcome {
        len: crl_len,
        sha256: digest.into(),
    })
}
