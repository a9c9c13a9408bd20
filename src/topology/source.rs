/*!
Capture-facing observation source interface.

This module defines:
- `SourceError`: error type for reading observations from a collaborator.
- `ObservationSource`: an async trait that yields raw observations one at a time.
- `JsonLinesSource`: reads one JSON `RawObservation` per line from any async reader.

Capture/decoding adapters (pcap, netlink dumps, replay files) should implement
`ObservationSource` and keep their transport details to themselves.
*/

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::topology::event::RawObservation;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed observation on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Yields raw observations until the collaborator is exhausted (`None`).
#[async_trait]
pub trait ObservationSource: Send {
    async fn next_observation(&mut self) -> Option<SourceResult<RawObservation>>;
}

pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line: usize,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ObservationSource for JsonLinesSource<R> {
    async fn next_observation(&mut self) -> Option<SourceResult<RawObservation>> {
        loop {
            let text = match self.lines.next_line().await {
                Ok(Some(text)) => text,
                Ok(None) => return None,
                Err(e) => return Some(Err(SourceError::Io(e))),
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&text).map_err(|source| SourceError::Parse {
                    line: self.line,
                    source,
                }),
            );
        }
    }
}
