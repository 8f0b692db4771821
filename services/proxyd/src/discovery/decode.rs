//! Decoding of pod watch frames.
//!
//! The watch transport hands the proxy newline-delimited JSON frames in the
//! Kubernetes watch shape:
//!
//! ```text
//! {"type":"ADDED","object":{"metadata":{...},"status":{...}}}
//! ```
//!
//! The decoder remembers the last state seen for every pod so a `MODIFIED`
//! frame can be delivered as `Updated { old, new }`. Malformed frames are
//! logged and skipped; the stream keeps going.

use std::collections::{BTreeMap, HashMap};

use futures_util::stream::{self, Stream};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, warn};

use super::pod::{ContainerReadiness, Pod, PodEvent};

/// Reasons a watch frame was skipped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid watch frame JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("watch frame missing object")]
    MissingObject,

    #[error("pod object missing metadata.uid")]
    MissingUid,

    #[error("unknown watch event type {0:?}")]
    UnknownType(String),
}

#[derive(Debug, Deserialize)]
struct WatchFrame {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PodObject {
    #[serde(default)]
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(rename = "podIP", default)]
    pod_ip: Option<String>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    name: String,
    #[serde(default)]
    ready: bool,
}

impl From<PodObject> for Pod {
    fn from(object: PodObject) -> Self {
        Self {
            uid: object.metadata.uid,
            name: object.metadata.name,
            labels: object.metadata.labels,
            ip: object.status.pod_ip,
            containers: object
                .status
                .container_statuses
                .into_iter()
                .map(|c| ContainerReadiness {
                    name: c.name,
                    ready: c.ready,
                })
                .collect(),
        }
    }
}

/// Stateful watch frame decoder.
#[derive(Debug, Default)]
pub struct WatchDecoder {
    seen: HashMap<String, Pod>,
}

impl WatchDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame. `Ok(None)` means the frame carries nothing to act on
    /// (blank line, bookmark, server-side error frame).
    pub fn decode_line(&mut self, line: &str) -> Result<Option<PodEvent>, DecodeError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let frame: WatchFrame = serde_json::from_str(line)?;
        match frame.event_type.as_str() {
            "ADDED" | "MODIFIED" => {
                let pod = decode_pod(frame.object)?;
                let event = match self.seen.insert(pod.uid.clone(), pod.clone()) {
                    Some(old) => PodEvent::Updated { old, new: pod },
                    None => PodEvent::Added(pod),
                };
                Ok(Some(event))
            }
            "DELETED" => {
                let pod = decode_pod(frame.object)?;
                self.seen.remove(&pod.uid);
                Ok(Some(PodEvent::Deleted(pod)))
            }
            "BOOKMARK" => Ok(None),
            "ERROR" => {
                warn!(status = ?frame.object, "Watch stream reported an error frame");
                Ok(None)
            }
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }

    /// Number of pods currently tracked.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

fn decode_pod(object: Option<serde_json::Value>) -> Result<Pod, DecodeError> {
    let object = object.ok_or(DecodeError::MissingObject)?;
    let object: PodObject = serde_json::from_value(object)?;
    if object.metadata.uid.is_empty() {
        return Err(DecodeError::MissingUid);
    }
    Ok(object.into())
}

/// Turn a line-oriented reader into a stream of pod events.
///
/// Ends when the reader reaches EOF or fails.
pub fn pod_events<R>(reader: R) -> impl Stream<Item = PodEvent>
where
    R: AsyncBufRead + Unpin,
{
    stream::unfold(
        (reader.lines(), WatchDecoder::new()),
        |(mut lines, mut decoder): (Lines<R>, WatchDecoder)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decoder.decode_line(&line) {
                        Ok(Some(event)) => return Some((event, (lines, decoder))),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed watch frame");
                            continue;
                        }
                    },
                    Ok(None) => {
                        debug!(tracked_pods = decoder.tracked(), "Watch stream reached EOF");
                        return None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Watch stream read failed");
                        return None;
                    }
                }
            }
        },
    )
}
