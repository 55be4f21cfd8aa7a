// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! HTTP-backed clients for the three collaborating services.
//!
//! The storage authority streams newline-delimited JSON entries in its
//! response body. The generator exchange streams newline-delimited JSON
//! frames up and raw CRL bytes down over one request. The storer upload is
//! one JSON metadata line followed by raw CRL bytes, acked by the response
//! status. Securing these endpoints is deployment configuration.

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, Stream, StreamExt, TryStreamExt};
use reqwest::{Body, Client, Response, Url};
use serde::Serialize;
use service_api::{
    CrlGenerator, CrlStorer, EntryStream, GenerateCrlFrame, GenerateCrlStream, RevokedCertEntry,
    RevokedCertsRequest, ServiceError, ServiceResult, StorageAuthority, UploadCrlFrame,
    UploadCrlStream,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tokio_util::io::StreamReader;

type PendingResponse = JoinHandle<Result<Response, reqwest::Error>>;

pub struct HttpStorageAuthority {
    client: Client,
    base: Url,
}

impl HttpStorageAuthority {
    pub fn new(client: Client, base_url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            base: Url::parse(base_url)?,
        })
    }
}

#[async_trait]
impl StorageAuthority for HttpStorageAuthority {
    async fn revoked_certs(&self, req: RevokedCertsRequest) -> ServiceResult<EntryStream> {
        let mut url = self.base.clone();
        url.set_path("/sa/revoked-certs");
        let resp = self
            .client
            .post(url)
            .json(&req)
            .send()
            .await
            .map_err(ServiceError::transport)?;
        let resp = ok_response(resp).await?;

        let reader = StreamReader::new(
            resp.bytes_stream()
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err)),
        );
        let entries = LinesStream::new(BufReader::new(reader).lines())
            .map_err(ServiceError::transport)
            .try_filter(|line| future::ready(!line.trim().is_empty()))
            .and_then(|line| {
                future::ready(
                    serde_json::from_str::<RevokedCertEntry>(&line)
                        .map_err(ServiceError::transport),
                )
            });
        Ok(Box::pin(entries))
    }
}

pub struct HttpCrlGenerator {
    client: Client,
    base: Url,
}

impl HttpCrlGenerator {
    pub fn new(client: Client, base_url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            base: Url::parse(base_url)?,
        })
    }
}

#[async_trait]
impl CrlGenerator for HttpCrlGenerator {
    async fn generate_crl(&self) -> ServiceResult<Box<dyn GenerateCrlStream>> {
        let mut url = self.base.clone();
        url.set_path("/ca/generate-crl");
        let (frame_tx, frame_rx) = mpsc::channel::<io::Result<Bytes>>(16);
        let request = self
            .client
            .post(url)
            .header("content-type", "application/x-ndjson")
            .body(Body::wrap_stream(ReceiverStream::new(frame_rx)));
        let pending = tokio::spawn(request.send());
        Ok(Box::new(HttpGenerateCrlStream {
            frames: Some(frame_tx),
            response: ResponseState::Pending(pending),
        }))
    }
}

enum ResponseState {
    Pending(PendingResponse),
    Streaming(Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>),
    Done,
}

struct HttpGenerateCrlStream {
    frames: Option<mpsc::Sender<io::Result<Bytes>>>,
    response: ResponseState,
}

#[async_trait]
impl GenerateCrlStream for HttpGenerateCrlStream {
    async fn send(&mut self, frame: GenerateCrlFrame) -> ServiceResult<()> {
        let tx = self.frames.as_ref().ok_or_else(stream_closed)?;
        let line = ndjson_line(&frame)?;
        tx.send(Ok(line))
            .await
            .map_err(|_| ServiceError::Remote("CA closed the request stream".into()))
    }

    async fn close_send(&mut self) -> ServiceResult<()> {
        // Dropping the sender ends the request body.
        self.frames.take();
        Ok(())
    }

    async fn next_chunk(&mut self) -> ServiceResult<Option<Bytes>> {
        loop {
            match std::mem::replace(&mut self.response, ResponseState::Done) {
                ResponseState::Pending(handle) => {
                    let resp = handle
                        .await
                        .map_err(ServiceError::transport)?
                        .map_err(ServiceError::transport)?;
                    let resp = ok_response(resp).await?;
                    self.response = ResponseState::Streaming(Box::pin(resp.bytes_stream()));
                }
                ResponseState::Streaming(mut stream) => match stream.next().await {
                    Some(Ok(chunk)) => {
                        self.response = ResponseState::Streaming(stream);
                        return Ok(Some(chunk));
                    }
                    Some(Err(err)) => return Err(ServiceError::transport(err)),
                    None => return Ok(None),
                },
                ResponseState::Done => return Ok(None),
            }
        }
    }
}

pub struct HttpCrlStorer {
    client: Client,
    base: Url,
}

impl HttpCrlStorer {
    pub fn new(client: Client, base_url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            base: Url::parse(base_url)?,
        })
    }
}

#[async_trait]
impl CrlStorer for HttpCrlStorer {
    async fn upload_crl(&self) -> ServiceResult<Box<dyn UploadCrlStream>> {
        let mut url = self.base.clone();
        url.set_path("/storer/upload-crl");
        let (frame_tx, frame_rx) = mpsc::channel::<io::Result<Bytes>>(16);
        let request = self
            .client
            .post(url)
            .header("content-type", "application/octet-stream")
            .body(Body::wrap_stream(ReceiverStream::new(frame_rx)));
        let pending = tokio::spawn(request.send());
        Ok(Box::new(HttpUploadCrlStream {
            frames: Some(frame_tx),
            pending,
        }))
    }
}

struct HttpUploadCrlStream {
    frames: Option<mpsc::Sender<io::Result<Bytes>>>,
    pending: PendingResponse,
}

#[async_trait]
impl UploadCrlStream for HttpUploadCrlStream {
    async fn send(&mut self, frame: UploadCrlFrame) -> ServiceResult<()> {
        let tx = self.frames.as_ref().ok_or_else(stream_closed)?;
        let payload = match frame {
            UploadCrlFrame::Metadata(md) => ndjson_line(&md)?,
            UploadCrlFrame::Chunk(chunk) => chunk,
        };
        tx.send(Ok(payload))
            .await
            .map_err(|_| ServiceError::Remote("CRL storer closed the upload stream".into()))
    }

    async fn close_and_recv(self: Box<Self>) -> ServiceResult<()> {
        let HttpUploadCrlStream { frames, pending } = *self;
        drop(frames);
        let resp = pending
            .await
            .map_err(ServiceError::transport)?
            .map_err(ServiceError::transport)?;
        ok_response(resp).await?;
        Ok(())
    }
}

fn ndjson_line<T: Serialize>(value: &T) -> ServiceResult<Bytes> {
    let mut line = serde_json::to_vec(value).map_err(ServiceError::transport)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn stream_closed() -> ServiceError {
    ServiceError::Remote("request stream already closed".into())
}

async fn ok_response(resp: Response) -> ServiceResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = body.trim();
    if detail.is_empty() {
        Err(ServiceError::Remote(status.to_string()))
    } else {
        Err(ServiceError::Remote(format!("{status}: {detail}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::types::IssuerNameID;
    use service_api::CrlStorerMetadata;

    #[test]
    fn ndjson_lines_are_newline_terminated_json() {
        let md = CrlStorerMetadata {
            issuer_name_id: IssuerNameID(5),
            number: 42,
            shard_idx: 1,
        };
        let line = ndjson_line(&md).unwrap();
        assert!(line.ends_with(b"\n"));
        let parsed: CrlStorerMetadata =
            serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed, md);
    }

    #[test]
    fn entry_lines_round_trip() {
        let entry = RevokedCertEntry {
            serial: "03deadbeef".into(),
            reason: 5,
            revoked_at: 1_700_000_000_000_000_000,
        };
        let line = ndjson_line(&entry).unwrap();
        let parsed: RevokedCertEntry = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn rejects_malformed_base_urls() {
        assert!(HttpStorageAuthority::new(Client::new(), "not a url").is_err());
        assert!(HttpCrlGenerator::new(Client::new(), "not a url").is_err());
        assert!(HttpCrlStorer::new(Client::new(), "not a url").is_err());
    }
}
