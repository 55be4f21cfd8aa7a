// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unix-epoch nanosecond timestamp carried on the wire.
pub type UnixNanos = i64;

/// Stable 64-bit identifier derived from an issuer certificate's Subject.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct IssuerNameID(pub i64);

impl fmt::Display for IssuerNameID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable issuer record held by the updater for logging, metric labels,
/// and wire calls. The full certificate stays with the signing side.
#[derive(Debug, Clone)]
pub struct Issuer {
    name_id: IssuerNameID,
    common_name: String,
}

impl Issuer {
    pub fn new(name_id: IssuerNameID, common_name: impl Into<String>) -> Self {
        Self {
            name_id,
            common_name: common_name.into(),
        }
    }

    pub fn name_id(&self) -> IssuerNameID {
        self.name_id
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }
}

/// Identity of one CRL shard within one tick. Appears in every pipeline
/// error and the success log line, and names the storer's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrlId {
    pub issuer_name_id: IssuerNameID,
    pub crl_number: UnixNanos,
    pub shard_idx: usize,
}

impl CrlId {
    pub fn new(issuer_name_id: IssuerNameID, crl_number: UnixNanos, shard_idx: usize) -> Self {
        Self {
            issuer_name_id,
            crl_number,
            shard_idx,
        }
    }
}

impl fmt::Display for CrlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{\"issuerID\":{},\"crlNumber\":{},\"shardIdx\":{}}}",
            self.issuer_name_id, self.crl_number, self.shard_idx
        )
    }
}

/// Unix nanoseconds for a timestamp. CRL numbers and shard windows are all
/// derived from this value, so the conversion must be exact.
pub fn unix_nanos(at: DateTime<Utc>) -> UnixNanos {
    at.timestamp_nanos_opt()
        .expect("timestamp within nanosecond range")
}
