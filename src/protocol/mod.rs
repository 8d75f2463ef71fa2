//! Multiplexed request/response protocol
//!
//! Many logical operations share one connection. Every [`Request`] carries a
//! caller-chosen nonce and every [`Response`] echoes the nonce of the request
//! that produced it, so responses may arrive in any order. A listening
//! download is the one request answered twice: first [`Response::Downloading`],
//! later [`Response::DownloadSuccess`] or [`Response::DownloadFailure`].
//!
//! - [`format`] - wire format negotiation and frame codec
//! - [`server`] - one session per accepted connection
//! - [`client`] - [`RemoteBox`], the calling side

mod client;
mod format;
mod server;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use client::{DownloadOutcome, RemoteBox};
pub use format::WireFormat;
pub use server::ServerSession;

use crate::error::TaskError;
use crate::types::{
    DownloadRequest, FeatureSet, ListenCondition, ProxyConfig, TaskId, TaskInfo,
};
use serde::{Deserialize, Serialize};

/// Correlation token chosen by the caller
pub type Nonce = u64;

/// One message on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Text frame (JSON)
    Text(String),
    /// Binary frame (bincode)
    Binary(Vec<u8>),
}

/// Operations a client may ask of a box
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Start or attach to a download
    Download {
        /// Correlation token
        nonce: Nonce,
        /// What to download
        request: DownloadRequest,
        /// Whether to be told about the outcome
        listen_for: ListenCondition,
    },
    /// Add a proxy to the pool
    AddProxy {
        /// Correlation token
        nonce: Nonce,
        /// Proxy to add
        proxy: ProxyConfig,
    },
    /// Remove a proxy from the pool by address
    RemoveProxy {
        /// Correlation token
        nonce: Nonce,
        /// Address of the proxy to remove
        address: String,
    },
    /// Ask for the box's feature set
    GetServerInfo {
        /// Correlation token
        nonce: Nonce,
    },
    /// Ask for a task snapshot
    GetTaskInfo {
        /// Correlation token
        nonce: Nonce,
        /// Task to describe
        task_id: TaskId,
    },
    /// Ask for a task's log lines
    GetTaskLogs {
        /// Correlation token
        nonce: Nonce,
        /// Task whose log to read
        task_id: TaskId,
    },
    /// Ask for a task's output
    GetTaskDownload {
        /// Correlation token
        nonce: Nonce,
        /// Task whose output to read
        task_id: TaskId,
    },
}

impl Request {
    /// Nonce of this request
    pub fn nonce(&self) -> Nonce {
        match self {
            Request::Download { nonce, .. }
            | Request::AddProxy { nonce, .. }
            | Request::RemoveProxy { nonce, .. }
            | Request::GetServerInfo { nonce }
            | Request::GetTaskInfo { nonce, .. }
            | Request::GetTaskLogs { nonce, .. }
            | Request::GetTaskDownload { nonce, .. } => *nonce,
        }
    }
}

/// Answers sent by a box
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    /// A download was started or attached to
    Downloading {
        /// Nonce of the download request
        nonce: Nonce,
        /// Task serving the download
        task_id: TaskId,
        /// Whether this request started the task
        created: bool,
        /// Task URL
        url: String,
        /// Caller arguments
        args: Vec<String>,
    },
    /// Result of an add-proxy request
    AddedProxy {
        /// Correlation token
        nonce: Nonce,
        /// Proxy that was offered
        proxy: ProxyConfig,
        /// False when a proxy with the same address was already known
        added: bool,
    },
    /// Result of a remove-proxy request
    RemovedProxy {
        /// Correlation token
        nonce: Nonce,
        /// Removed proxy, if one matched
        proxy: Option<ProxyConfig>,
    },
    /// This box has no proxy pool
    NoProxyListener {
        /// Correlation token
        nonce: Nonce,
    },
    /// A listened-for download finished with an output
    DownloadSuccess {
        /// Nonce of the download request
        nonce: Nonce,
        /// Task ID
        task_id: TaskId,
        /// Task URL
        url: String,
        /// Command line of the last attempt
        command_line: Vec<String>,
        /// Output bytes; empty when listening without data
        #[serde(with = "bytes")]
        output: Vec<u8>,
        /// Guessed MIME type of the output
        mime_type: Option<String>,
        /// Log lines of the last attempt
        logs: Vec<String>,
    },
    /// A listened-for download failed
    DownloadFailure {
        /// Nonce of the download request
        nonce: Nonce,
        /// Task ID
        task_id: TaskId,
        /// Task URL
        url: String,
        /// Command line of the last attempt
        command_line: Vec<String>,
        /// Log lines of the last attempt
        logs: Vec<String>,
        /// Classified error, if the tool failed
        error: Option<TaskError>,
    },
    /// Feature set of the box
    ServerInfo {
        /// Correlation token
        nonce: Nonce,
        /// Advertised capabilities
        feature_set: FeatureSet,
    },
    /// The requested task is unknown or expired
    NoTaskWithId {
        /// Correlation token
        nonce: Nonce,
        /// Requested task
        task_id: TaskId,
    },
    /// Task snapshot
    TaskInfo {
        /// Correlation token
        nonce: Nonce,
        /// Snapshot
        task_info: TaskInfo,
    },
    /// Task log lines
    TaskLogs {
        /// Correlation token
        nonce: Nonce,
        /// Task ID
        task_id: TaskId,
        /// Log lines, oldest first
        lines: Vec<String>,
    },
    /// The task exists but has no output
    NoDownloadAvailable {
        /// Correlation token
        nonce: Nonce,
        /// Requested task
        task_id: TaskId,
    },
    /// Task output
    TaskDownload {
        /// Correlation token
        nonce: Nonce,
        /// Task ID
        task_id: TaskId,
        /// Output bytes
        #[serde(with = "bytes")]
        output: Vec<u8>,
        /// Guessed MIME type of the output
        mime_type: Option<String>,
    },
    /// The request could not be served; nonce 0 when it could not be decoded
    Error {
        /// Correlation token
        nonce: Nonce,
        /// Human-readable reason
        message: String,
    },
}

/// Discriminant of a [`Response`], used to match answers to pending calls
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// [`Response::Downloading`]
    Downloading,
    /// [`Response::AddedProxy`]
    AddedProxy,
    /// [`Response::RemovedProxy`]
    RemovedProxy,
    /// [`Response::NoProxyListener`]
    NoProxyListener,
    /// [`Response::DownloadSuccess`]
    DownloadSuccess,
    /// [`Response::DownloadFailure`]
    DownloadFailure,
    /// [`Response::ServerInfo`]
    ServerInfo,
    /// [`Response::NoTaskWithId`]
    NoTaskWithId,
    /// [`Response::TaskInfo`]
    TaskInfo,
    /// [`Response::TaskLogs`]
    TaskLogs,
    /// [`Response::NoDownloadAvailable`]
    NoDownloadAvailable,
    /// [`Response::TaskDownload`]
    TaskDownload,
    /// [`Response::Error`]
    Error,
}

impl Response {
    /// Nonce of the request this answers
    pub fn nonce(&self) -> Nonce {
        match self {
            Response::Downloading { nonce, .. }
            | Response::AddedProxy { nonce, .. }
            | Response::RemovedProxy { nonce, .. }
            | Response::NoProxyListener { nonce }
            | Response::DownloadSuccess { nonce, .. }
            | Response::DownloadFailure { nonce, .. }
            | Response::ServerInfo { nonce, .. }
            | Response::NoTaskWithId { nonce, .. }
            | Response::TaskInfo { nonce, .. }
            | Response::TaskLogs { nonce, .. }
            | Response::NoDownloadAvailable { nonce, .. }
            | Response::TaskDownload { nonce, .. }
            | Response::Error { nonce, .. } => *nonce,
        }
    }

    /// Which variant this is
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Downloading { .. } => ResponseKind::Downloading,
            Response::AddedProxy { .. } => ResponseKind::AddedProxy,
            Response::RemovedProxy { .. } => ResponseKind::RemovedProxy,
            Response::NoProxyListener { .. } => ResponseKind::NoProxyListener,
            Response::DownloadSuccess { .. } => ResponseKind::DownloadSuccess,
            Response::DownloadFailure { .. } => ResponseKind::DownloadFailure,
            Response::ServerInfo { .. } => ResponseKind::ServerInfo,
            Response::NoTaskWithId { .. } => ResponseKind::NoTaskWithId,
            Response::TaskInfo { .. } => ResponseKind::TaskInfo,
            Response::TaskLogs { .. } => ResponseKind::TaskLogs,
            Response::NoDownloadAvailable { .. } => ResponseKind::NoDownloadAvailable,
            Response::TaskDownload { .. } => ResponseKind::TaskDownload,
            Response::Error { .. } => ResponseKind::Error,
        }
    }
}

/// Byte buffers as base64 strings in human-readable formats, raw bytes otherwise
mod bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(Base64Visitor)
        } else {
            deserializer.deserialize_byte_buf(RawVisitor)
        }
    }

    struct Base64Visitor;

    impl Visitor<'_> for Base64Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a base64 string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            STANDARD.decode(v).map_err(E::custom)
        }
    }

    struct RawVisitor;

    impl<'de> Visitor<'de> for RawVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a byte buffer")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}
