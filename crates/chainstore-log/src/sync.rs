//! Full-sync replication of a block log over a shared peer stream.
//!
//! All traffic for one log rides the sub-channel tagged with its discovery
//! key. The exchange is a three-message negotiation that converges from
//! any starting point:
//!
//! - `Have { length }` — announce how many blocks this side holds. A side
//!   holding more re-announces, a side holding less requests.
//! - `Request { from }` — ask for every block from `from` upward.
//! - `Data { block }` — one signed block; verified and appended at the tip.
//!
//! Local appends push fresh `Have` announcements, so live peers converge
//! without polling. Ordering races (a `Have` sent before the remote
//! attached) heal on the next announcement from either side.

use std::sync::Arc;

use chainstore::{Chain, PeerStream, StoreError, StoreResult, StreamFrame};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::block::Block;
use crate::error::{LogError, LogResult};
use crate::log::BlockLog;

/// Wire messages exchanged on a log's sub-channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogMessage {
    /// Announce the local block count.
    Have { length: u64 },
    /// Request blocks from `from` to the remote's tip.
    Request { from: u64 },
    /// One signed block.
    Data { block: Block },
}

impl LogMessage {
    /// Encode for a payload frame.
    pub fn encode(&self) -> LogResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| LogError::Serialization(e.to_string()))
    }

    /// Decode from a payload frame.
    pub fn decode(bytes: &[u8]) -> LogResult<Self> {
        bincode::deserialize(bytes).map_err(|e| LogError::Serialization(e.to_string()))
    }
}

/// Start replicating `log` on `stream`: announce the chain, then run the
/// sync exchange in a background task until the stream or the log closes.
pub(crate) fn start(log: Arc<BlockLog>, stream: Arc<dyn PeerStream>) -> StoreResult<()> {
    if log.is_closed() {
        return Err(StoreError::Closed);
    }
    if stream.is_closed() {
        return Err(StoreError::StreamClosed);
    }
    // Subscribe before the task is scheduled so the remote's reply to our
    // announcement cannot be missed.
    let frames = stream.subscribe();
    let task = tokio::spawn(run(Arc::clone(&log), stream, frames));
    log.register_task(task);
    Ok(())
}

async fn run(
    log: Arc<BlockLog>,
    stream: Arc<dyn PeerStream>,
    mut frames: broadcast::Receiver<StreamFrame>,
) {
    let dk = log.discovery_key();
    let mut appended = log.appended();
    let mut closed = stream.closed();

    if stream.send(StreamFrame::Discovery(dk)).is_err() {
        return;
    }
    let hello = LogMessage::Have { length: log.length() };
    if send(&stream, &log, &hello).is_err() {
        return;
    }
    debug!(discovery_key = %dk, length = log.length(), "replication started");

    loop {
        if log.is_closed() || stream.is_closed() {
            break;
        }
        tokio::select! {
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
            length = appended.recv() => match length {
                Ok(length) => {
                    if send(&stream, &log, &LogMessage::Have { length }).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let have = LogMessage::Have { length: log.length() };
                    if send(&stream, &log, &have).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = frames.recv() => match frame {
                Ok(StreamFrame::Payload { discovery_key, bytes }) if discovery_key == dk => {
                    match handle_message(&log, &stream, &bytes) {
                        Ok(()) => {}
                        Err(err) => {
                            warn!(discovery_key = %dk, error = %err, "replication failed; closing channel");
                            stream.close_channel(&dk);
                            break;
                        }
                    }
                }
                Ok(StreamFrame::ChannelClosed(discovery_key)) if discovery_key == dk => {
                    debug!(discovery_key = %dk, "remote closed channel");
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(discovery_key = %dk, skipped, "lagged; re-announcing");
                    let have = LogMessage::Have { length: log.length() };
                    if send(&stream, &log, &have).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn handle_message(log: &BlockLog, stream: &Arc<dyn PeerStream>, bytes: &[u8]) -> LogResult<()> {
    match LogMessage::decode(bytes)? {
        LogMessage::Have { length } => {
            let local = log.length();
            if length > local {
                send(stream, log, &LogMessage::Request { from: local })?;
            } else if length < local {
                // The remote is behind (or attached after our first
                // announcement): re-announce so it can request.
                send(stream, log, &LogMessage::Have { length: local })?;
            }
        }
        LogMessage::Request { from } => {
            let local = log.length();
            trace!(from, to = local, "serving block request");
            for index in from..local {
                let Some(block) = log.read_record(index)? else {
                    break;
                };
                send(stream, log, &LogMessage::Data { block })?;
            }
        }
        LogMessage::Data { block } => {
            let index = block.index;
            let local = log.length();
            if index > local {
                // Out of order: ask for the gap instead.
                send(stream, log, &LogMessage::Request { from: local })?;
            } else if index == local {
                log.append_remote(block)?;
            }
            // Stale blocks are dropped silently.
        }
    }
    Ok(())
}

fn send(stream: &Arc<dyn PeerStream>, log: &BlockLog, msg: &LogMessage) -> LogResult<()> {
    let bytes = msg.encode()?;
    stream
        .send(StreamFrame::Payload {
            discovery_key: log.discovery_key(),
            bytes,
        })
        .map_err(|_| LogError::Closed)
}
