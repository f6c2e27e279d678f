//! Outgoing-operation batching and compression.
//!
//! One pending batch per room. A batch flushes when it reaches the size
//! threshold or when the background tick (four times per timeout) finds
//! it older than the batch timeout, so delivery latency stays bounded
//! even under low traffic.
//!
//! Two compression stages sit in front of the wire:
//! - **field-level deltas** — a stroke already transmitted is re-sent as
//!   just its changed fields, against a per-stroke baseline that always
//!   advances to the latest full payload;
//! - **byte compression** — the serialized JSON batch is LZ4-compressed;
//!   decompress + deserialize is byte-identical to the pre-compression
//!   JSON.
//!
//! The flush callback runs outside every internal lock; delivery belongs
//! to the transport layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use fresco_spatial::Point;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::ops::{now_ms, OpPayload, Operation};

/// Batching and compression knobs.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Flush immediately once a room's batch holds this many operations.
    pub batch_size: usize,
    /// Flush any batch older than this, regardless of size.
    pub batch_timeout: Duration,
    /// Substitute field-level deltas for repeated stroke payloads.
    pub delta_compression: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout: Duration::from_millis(75),
            delta_compression: true,
        }
    }
}

/// A group of operations aggregated for one room since the last flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub room_id: Uuid,
    pub messages: Vec<Operation>,
    pub start_time_ms: u64,
    pub last_update_ms: u64,
    pub size: usize,
}

impl MessageBatch {
    fn new(room_id: Uuid) -> Self {
        let now = now_ms();
        Self {
            room_id,
            messages: Vec::new(),
            start_time_ms: now,
            last_update_ms: now,
            size: 0,
        }
    }
}

/// Pending batch plus the monotonic clock used for aging.
struct PendingBatch {
    batch: MessageBatch,
    started: Instant,
}

impl PendingBatch {
    fn new(room_id: Uuid) -> Self {
        Self {
            batch: MessageBatch::new(room_id),
            started: Instant::now(),
        }
    }
}

/// An LZ4-compressed, JSON-serialized batch ready for transmission.
#[derive(Debug, Clone)]
pub struct CompressedBatch {
    pub room_id: Uuid,
    /// Highest committed version among the batched operations.
    pub last_version: i64,
    pub original_size: usize,
    pub payload: Vec<u8>,
}

impl CompressedBatch {
    /// Serialize the batch to JSON and compress it.
    pub fn compress(batch: &MessageBatch) -> Result<Self, SyncError> {
        let json = serde_json::to_vec(batch)
            .map_err(|e| SyncError::Protocol(format!("batch serialization failed: {e}")))?;
        Ok(Self {
            room_id: batch.room_id,
            last_version: batch.messages.iter().map(|op| op.version).max().unwrap_or(0),
            original_size: json.len(),
            payload: lz4_flex::compress_prepend_size(&json),
        })
    }

    /// Exact inverse of [`CompressedBatch::compress`].
    pub fn decompress(&self) -> Result<MessageBatch, SyncError> {
        Self::decode_payload(&self.payload)
    }

    /// Decompress and deserialize raw batch payload bytes (receiver side).
    pub fn decode_payload(payload: &[u8]) -> Result<MessageBatch, SyncError> {
        let json = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| SyncError::Protocol(format!("batch decompression failed: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| SyncError::Protocol(format!("batch deserialization failed: {e}")))
    }

    /// Compressed bytes over original bytes (lower is better).
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        self.payload.len() as f64 / self.original_size as f64
    }
}

/// Baseline payload for one stroke, advanced on every transmission.
struct Baseline {
    points: Vec<Point>,
    color: [f32; 4],
    thickness: f32,
}

/// Field-level delta substitution against per-stroke baselines.
#[derive(Default)]
struct DeltaCompressor {
    baselines: HashMap<Uuid, Baseline>,
    hits: u64,
    misses: u64,
}

impl DeltaCompressor {
    /// Return a delta payload to substitute for `op`, or `None` to send
    /// the full payload. First sight of a stroke always sends full.
    fn substitute(&mut self, op: &Operation) -> Option<OpPayload> {
        let (stroke_id, points, color, thickness) = match &op.payload {
            OpPayload::StrokeCreate {
                stroke_id,
                points,
                color,
                thickness,
            } => (
                *stroke_id,
                Some(points.clone()),
                Some(*color),
                Some(*thickness),
            ),
            OpPayload::StrokeUpdate {
                stroke_id,
                points,
                color,
                thickness,
            } => (*stroke_id, points.clone(), *color, *thickness),
            OpPayload::StrokeDelete { stroke_id } => {
                self.baselines.remove(stroke_id);
                return None;
            }
            OpPayload::ClearAll => {
                self.baselines.clear();
                return None;
            }
            _ => return None,
        };

        match self.baselines.get_mut(&stroke_id) {
            None => {
                self.misses += 1;
                self.baselines.insert(
                    stroke_id,
                    Baseline {
                        points: points.unwrap_or_default(),
                        color: color.unwrap_or([0.0; 4]),
                        thickness: thickness.unwrap_or(1.0),
                    },
                );
                None
            }
            Some(base) => {
                let d_points = points.filter(|p| *p != base.points);
                let d_color = color.filter(|c| *c != base.color);
                let d_thickness = thickness.filter(|t| *t != base.thickness);
                if d_points.is_none() && d_color.is_none() && d_thickness.is_none() {
                    // Nothing changed relative to the baseline; an empty
                    // delta is not substituted.
                    self.misses += 1;
                    return None;
                }
                if let Some(p) = &d_points {
                    base.points = p.clone();
                }
                if let Some(c) = d_color {
                    base.color = c;
                }
                if let Some(t) = d_thickness {
                    base.thickness = t;
                }
                self.hits += 1;
                Some(OpPayload::StrokeDelta {
                    stroke_id,
                    points: d_points,
                    color: d_color,
                    thickness: d_thickness,
                })
            }
        }
    }
}

/// Compression statistics for capacity planning.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressionStats {
    pub batches_in_flight: usize,
    pub pending_messages: usize,
    pub messages_per_room: HashMap<Uuid, usize>,
    pub flushed_batches: u64,
    pub flushed_messages: u64,
    pub avg_messages_per_batch: f64,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    /// Compressed over original bytes across all flushed batches.
    pub compression_ratio: f64,
    pub delta_hits: u64,
    pub delta_misses: u64,
    pub delta_hit_rate: f64,
}

type FlushCallback = dyn Fn(CompressedBatch) + Send + Sync;

/// Per-room batching with delta and byte compression.
pub struct CompressionManager {
    config: CompressionConfig,
    batches: Mutex<HashMap<Uuid, PendingBatch>>,
    delta: Mutex<DeltaCompressor>,
    callback: RwLock<Option<Arc<FlushCallback>>>,
    flushed_batches: AtomicU64,
    flushed_messages: AtomicU64,
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

impl CompressionManager {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            batches: Mutex::new(HashMap::new()),
            delta: Mutex::new(DeltaCompressor::default()),
            callback: RwLock::new(None),
            flushed_batches: AtomicU64::new(0),
            flushed_messages: AtomicU64::new(0),
            original_bytes: AtomicU64::new(0),
            compressed_bytes: AtomicU64::new(0),
        }
    }

    /// Register the delivery callback invoked with each flushed batch.
    /// The callback runs outside all internal locks.
    pub fn set_flush_callback(&self, callback: impl Fn(CompressedBatch) + Send + Sync + 'static) {
        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Queue a committed operation for delivery, flushing immediately if
    /// the room's batch reaches the size threshold.
    pub fn add_operation(&self, op: Operation) {
        let room_id = op.room_id;
        let op = if self.config.delta_compression {
            let mut delta = self.delta.lock().unwrap_or_else(PoisonError::into_inner);
            match delta.substitute(&op) {
                Some(payload) => {
                    let mut substituted = op;
                    substituted.payload = payload;
                    substituted
                }
                None => op,
            }
        } else {
            op
        };

        let full = {
            let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = batches
                .entry(room_id)
                .or_insert_with(|| PendingBatch::new(room_id));
            pending.batch.messages.push(op);
            pending.batch.size = pending.batch.messages.len();
            pending.batch.last_update_ms = now_ms();
            if pending.batch.messages.len() >= self.config.batch_size {
                batches.remove(&room_id)
            } else {
                None
            }
        };

        if let Some(pending) = full {
            self.flush(pending);
        }
    }

    /// Immediately flush the pending batch for a room, if any.
    pub fn flush_room(&self, room_id: Uuid) -> bool {
        let pending = self
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&room_id);
        match pending {
            Some(pending) => {
                self.flush(pending);
                true
            }
            None => false,
        }
    }

    /// Flush every batch older than the configured timeout.
    pub fn flush_expired(&self) {
        let expired: Vec<PendingBatch> = {
            let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            let rooms: Vec<Uuid> = batches
                .iter()
                .filter(|(_, p)| p.started.elapsed() > self.config.batch_timeout)
                .map(|(room, _)| *room)
                .collect();
            rooms.into_iter().filter_map(|r| batches.remove(&r)).collect()
        };
        for pending in expired {
            self.flush(pending);
        }
    }

    /// Compress and hand off one batch. Never called with a lock held.
    fn flush(&self, pending: PendingBatch) {
        if pending.batch.messages.is_empty() {
            return;
        }
        let count = pending.batch.messages.len();
        match CompressedBatch::compress(&pending.batch) {
            Ok(compressed) => {
                self.flushed_batches.fetch_add(1, Ordering::Relaxed);
                self.flushed_messages.fetch_add(count as u64, Ordering::Relaxed);
                self.original_bytes
                    .fetch_add(compressed.original_size as u64, Ordering::Relaxed);
                self.compressed_bytes
                    .fetch_add(compressed.payload.len() as u64, Ordering::Relaxed);
                log::debug!(
                    "flushed batch for room {}: {count} messages, {} -> {} bytes",
                    compressed.room_id,
                    compressed.original_size,
                    compressed.payload.len()
                );
                let callback = self
                    .callback
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(callback) = callback {
                    callback(compressed);
                }
            }
            Err(e) => {
                log::error!(
                    "failed to compress batch for room {}: {e}",
                    pending.batch.room_id
                );
            }
        }
    }

    /// Spawn the periodic flusher, ticking four times per timeout. The
    /// task ends when the manager is dropped.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let tick = (self.config.batch_timeout / 4).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(manager) => manager.flush_expired(),
                    None => break,
                }
            }
        })
    }

    pub fn stats(&self) -> CompressionStats {
        let (in_flight, pending_messages, messages_per_room) = {
            let batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            let per_room: HashMap<Uuid, usize> = batches
                .iter()
                .map(|(room, p)| (*room, p.batch.messages.len()))
                .collect();
            let total: usize = per_room.values().sum();
            (batches.len(), total, per_room)
        };
        let (delta_hits, delta_misses) = {
            let delta = self.delta.lock().unwrap_or_else(PoisonError::into_inner);
            (delta.hits, delta.misses)
        };

        let flushed_batches = self.flushed_batches.load(Ordering::Relaxed);
        let flushed_messages = self.flushed_messages.load(Ordering::Relaxed);
        let original = self.original_bytes.load(Ordering::Relaxed);
        let compressed = self.compressed_bytes.load(Ordering::Relaxed);
        let delta_total = delta_hits + delta_misses;

        CompressionStats {
            batches_in_flight: in_flight,
            pending_messages,
            messages_per_room,
            flushed_batches,
            flushed_messages,
            avg_messages_per_batch: if flushed_batches == 0 {
                0.0
            } else {
                flushed_messages as f64 / flushed_batches as f64
            },
            original_bytes: original,
            compressed_bytes: compressed,
            compression_ratio: if original == 0 {
                0.0
            } else {
                compressed as f64 / original as f64
            },
            delta_hits,
            delta_misses,
            delta_hit_rate: if delta_total == 0 {
                0.0
            } else {
                delta_hits as f64 / delta_total as f64
            },
        }
    }
}
