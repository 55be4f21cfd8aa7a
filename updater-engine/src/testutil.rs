// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Scriptable in-memory fakes for the three collaborating services.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use core_types::types::IssuerNameID;
use futures::stream;
use parking_lot::Mutex;
use service_api::{
    CrlGenerator, CrlStorer, EntryStream, GenerateCrlFrame, GenerateCrlStream, RevokedCertEntry,
    RevokedCertsRequest, ServiceError, ServiceResult, StorageAuthority, UploadCrlFrame,
    UploadCrlStream,
};
use tokio::time::sleep;

/// Tracks how many shard pipelines are inside the instrumented section at
/// once, and the high-water mark.
pub(crate) struct ActiveCounter {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ActiveCounter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        })
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct FakeStorageAuthority {
    pub(crate) entries: Vec<RevokedCertEntry>,
    /// Yield this many entries, then a remote error with this message.
    pub(crate) fail_after: Option<(usize, String)>,
    pub(crate) connect_error: Option<String>,
    /// Refuse connections for one issuer only.
    pub(crate) fail_for_issuer: Option<(IssuerNameID, String)>,
    pub(crate) delay: Option<Duration>,
    pub(crate) active: Option<Arc<ActiveCounter>>,
    requests: Mutex<Vec<RevokedCertsRequest>>,
}

impl FakeStorageAuthority {
    pub(crate) fn with_entries(entries: Vec<RevokedCertEntry>) -> Self {
        Self {
            entries,
            ..Default::default()
        }
    }

    pub(crate) fn requests(&self) -> Vec<RevokedCertsRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl StorageAuthority for FakeStorageAuthority {
    async fn revoked_certs(&self, req: RevokedCertsRequest) -> ServiceResult<EntryStream> {
        self.requests.lock().push(req);
        if let Some(counter) = &self.active {
            counter.enter();
        }
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        if let Some(counter) = &self.active {
            counter.exit();
        }
        if let Some(msg) = &self.connect_error {
            return Err(ServiceError::Remote(msg.clone()));
        }
        if let Some((issuer, msg)) = &self.fail_for_issuer {
            if req.issuer_name_id == *issuer {
                return Err(ServiceError::Remote(msg.clone()));
            }
        }
        let mut items: Vec<ServiceResult<RevokedCertEntry>> = match &self.fail_after {
            Some((n, _)) => self.entries.iter().take(*n).cloned().map(Ok).collect(),
            None => self.entries.iter().cloned().map(Ok).collect(),
        };
        if let Some((_, msg)) = &self.fail_after {
            items.push(Err(ServiceError::Remote(msg.clone())));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}

#[derive(Default)]
pub(crate) struct FakeCrlGenerator {
    pub(crate) chunks: Vec<Bytes>,
    pub(crate) connect_error: Option<String>,
    frames: Arc<Mutex<Vec<GenerateCrlFrame>>>,
    close_sends: Arc<AtomicUsize>,
}

impl FakeCrlGenerator {
    pub(crate) fn with_chunks(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    pub(crate) fn frames(&self) -> Vec<GenerateCrlFrame> {
        self.frames.lock().clone()
    }

    pub(crate) fn close_sends(&self) -> usize {
        self.close_sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrlGenerator for FakeCrlGenerator {
    async fn generate_crl(&self) -> ServiceResult<Box<dyn GenerateCrlStream>> {
        if let Some(msg) = &self.connect_error {
            return Err(ServiceError::Remote(msg.clone()));
        }
        Ok(Box::new(FakeGenerateCrlStream {
            frames: Arc::clone(&self.frames),
            close_sends: Arc::clone(&self.close_sends),
            chunks: self.chunks.iter().cloned().collect(),
        }))
    }
}

struct FakeGenerateCrlStream {
    frames: Arc<Mutex<Vec<GenerateCrlFrame>>>,
    close_sends: Arc<AtomicUsize>,
    chunks: VecDeque<Bytes>,
}

#[async_trait]
impl GenerateCrlStream for FakeGenerateCrlStream {
    async fn send(&mut self, frame: GenerateCrlFrame) -> ServiceResult<()> {
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn close_send(&mut self) -> ServiceResult<()> {
        self.close_sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_chunk(&mut self) -> ServiceResult<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

#[derive(Default)]
pub(crate) struct FakeCrlStorer {
    /// Accept this many chunks, then refuse the next with this message.
    pub(crate) chunk_fail_after: Option<(usize, String)>,
    pub(crate) connect_error: Option<String>,
    frames: Arc<Mutex<Vec<UploadCrlFrame>>>,
    acks: Arc<AtomicUsize>,
}

impl FakeCrlStorer {
    pub(crate) fn frames(&self) -> Vec<UploadCrlFrame> {
        self.frames.lock().clone()
    }

    pub(crate) fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrlStorer for FakeCrlStorer {
    async fn upload_crl(&self) -> ServiceResult<Box<dyn UploadCrlStream>> {
        if let Some(msg) = &self.connect_error {
            return Err(ServiceError::Remote(msg.clone()));
        }
        Ok(Box::new(FakeUploadCrlStream {
            frames: Arc::clone(&self.frames),
            acks: Arc::clone(&self.acks),
            chunk_fail_after: self.chunk_fail_after.clone(),
            chunks_seen: 0,
        }))
    }
}

struct FakeUploadCrlStream {
    frames: Arc<Mutex<Vec<UploadCrlFrame>>>,
    acks: Arc<AtomicUsize>,
    chunk_fail_after: Option<(usize, String)>,
    chunks_seen: usize,
}

#[async_trait]
impl UploadCrlStream for FakeUploadCrlStream {
    async fn send(&mut self, frame: UploadCrlFrame) -> ServiceResult<()> {
        if let UploadCrlFrame::Chunk(_) = &frame {
            if let Some((limit, msg)) = &self.chunk_fail_after {
                if self.chunks_seen >= *limit {
                    return Err(ServiceError::Remote(msg.clone()));
                }
            }
            self.chunks_seen += 1;
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn close_and_recv(self: Box<Self>) -> ServiceResult<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
