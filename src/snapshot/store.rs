//! Compressing state store: the bridge between the sync engine and the
//! emulator's save/load primitives.
//!
//! A save reserves an envelope header at the front of a pool buffer, has the
//! emulator serialize its state into a store-owned scratch buffer, computes
//! a CRC-32 over the uncompressed bytes, DEFLATE-compresses the payload into
//! the region following the header, and finalizes the header last. The
//! scratch buffer lives outside the snapshot pool, so a save consumes
//! exactly one pool buffer and a load consumes none. The checksum covers
//! the *uncompressed* payload so two independently produced snapshots can be
//! compared for divergence without inflating either side.
//!
//! Save and load run on the emulator thread between frames; a few
//! milliseconds of compression there is acceptable.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::debug;
use web_time::Instant;

use crate::emulator::EmulatorHost;
use crate::snapshot::envelope::{SnapshotHeader, HEADER_BYTES};
use crate::snapshot::pool::{BufferPool, PoolBuffer};
use crate::{Frame, FramelockError, FramelockResult};

/// How many saves pass between throughput log lines.
const METRICS_LOG_INTERVAL: u64 = 100;

/// A finished snapshot: one envelope (header plus compressed payload) held
/// in a pool buffer.
///
/// The snapshot owns its buffer for its whole lifetime; the buffer returns
/// to the pool through [`StateStore::release`] when the snapshot is evicted
/// from the ring.
#[derive(Debug)]
pub struct Snapshot {
    frame: Frame,
    input_seq: u32,
    checksum: u32,
    len: usize,
    buffer: PoolBuffer,
}

impl Snapshot {
    /// The frame this snapshot captures, after execution.
    #[inline]
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// The local input sequence number at capture time.
    #[inline]
    #[must_use]
    pub fn input_seq(&self) -> u32 {
        self.input_seq
    }

    /// CRC-32 over the uncompressed emulator state.
    #[inline]
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// The complete envelope bytes (header plus payload).
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.len]
    }
}

/// Rolling save/load throughput counters, logged periodically.
#[derive(Debug, Default, Clone, Copy)]
struct StoreMetrics {
    saves: u64,
    loads: u64,
    save_nanos: u64,
    load_nanos: u64,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
}

impl StoreMetrics {
    fn log_and_reset(&mut self) {
        let avg_save_us = self.save_nanos / self.saves.max(1) / 1_000;
        let avg_load_us = self.load_nanos / self.loads.max(1) / 1_000;
        let ratio = self.uncompressed_bytes as f64 / self.compressed_bytes.max(1) as f64;
        debug!(
            saves = self.saves,
            loads = self.loads,
            avg_save_us,
            avg_load_us,
            compression_ratio = ratio,
            "snapshot throughput"
        );
        *self = Self::default();
    }
}

/// Compresses, checksums and frames emulator state via the buffer pool.
///
/// Raw (uncompressed) state never touches the pool: save and load stage it
/// in a single store-owned scratch buffer, so one save or load consumes
/// exactly one pool buffer - the snapshot's own.
#[derive(Debug)]
pub struct StateStore {
    pool: BufferPool,
    /// Staging area for uncompressed emulator state, allocated once.
    scratch: Box<[u8]>,
    compression: Compression,
    metrics: StoreMetrics,
}

impl StateStore {
    /// Creates a store with its own pool of `pool_max` buffers of
    /// `buffer_size` bytes, compressing at `compression_level` (1..=9).
    #[must_use]
    pub fn new(buffer_size: usize, pool_max: usize, compression_level: u32) -> Self {
        Self {
            pool: BufferPool::new(buffer_size, pool_max),
            scratch: vec![0u8; buffer_size].into_boxed_slice(),
            compression: Compression::new(compression_level),
            metrics: StoreMetrics::default(),
        }
    }

    /// Captures the emulator state for `frame` into a fresh snapshot.
    ///
    /// Builder order: reserve the header region, write the raw payload into
    /// scratch, compress the payload in behind the header, then finalize the
    /// header fields.
    ///
    /// # Errors
    ///
    /// - [`FramelockError::PoolExhausted`] if no snapshot buffer is free.
    ///   Transient.
    /// - [`FramelockError::EmulatorRejected`] if the save callback fails or
    ///   RNG introspection is unavailable.
    /// - [`FramelockError::CompressionFailed`] if the payload does not fit
    ///   or the encoder errors.
    pub fn save<E: EmulatorHost + ?Sized>(
        &mut self,
        emulator: &mut E,
        frame: Frame,
        input_seq: u32,
    ) -> FramelockResult<Snapshot> {
        let started = Instant::now();

        let rng_state = emulator.rng_state().ok_or(FramelockError::EmulatorRejected {
            operation: "query_rng_state",
        })?;

        let mut dest = self.pool.acquire().ok_or(FramelockError::PoolExhausted)?;

        let result = Self::fill_envelope(
            emulator,
            frame,
            input_seq,
            rng_state,
            self.compression,
            &mut dest,
            &mut self.scratch,
        );

        match result {
            Ok((len, checksum, uncompressed)) => {
                self.metrics.saves += 1;
                self.metrics.save_nanos += started.elapsed().as_nanos() as u64;
                self.metrics.uncompressed_bytes += uncompressed as u64;
                self.metrics.compressed_bytes += (len - HEADER_BYTES) as u64;
                if self.metrics.saves % METRICS_LOG_INTERVAL == 0 {
                    self.metrics.log_and_reset();
                }
                Ok(Snapshot {
                    frame,
                    input_seq,
                    checksum,
                    len,
                    buffer: dest,
                })
            },
            Err(error) => {
                self.pool.release(dest);
                Err(error)
            },
        }
    }

    /// The save body, separated so the destination buffer can be released
    /// on every error path. Returns (envelope length, checksum,
    /// uncompressed size).
    fn fill_envelope<E: EmulatorHost + ?Sized>(
        emulator: &mut E,
        frame: Frame,
        input_seq: u32,
        rng_state: u32,
        compression: Compression,
        dest: &mut PoolBuffer,
        scratch: &mut [u8],
    ) -> FramelockResult<(usize, u32, usize)> {
        let raw_len = emulator
            .save_state(frame, scratch)
            .ok_or(FramelockError::EmulatorRejected {
                operation: "save_state",
            })?;
        if raw_len > scratch.len() {
            return Err(FramelockError::EmulatorRejected {
                operation: "save_state",
            });
        }
        let raw = &scratch[..raw_len];
        let checksum = crc32fast::hash(raw);

        let payload_region = &mut dest.as_mut_slice()[HEADER_BYTES..];
        let mut encoder = Compress::new(compression, true);
        let status = encoder
            .compress(raw, payload_region, FlushCompress::Finish)
            .map_err(|error| FramelockError::CompressionFailed {
                context: error.to_string(),
            })?;
        if status != Status::StreamEnd {
            return Err(FramelockError::CompressionFailed {
                context: format!(
                    "payload of {} bytes did not fit into {} bytes",
                    raw_len,
                    payload_region.len()
                ),
            });
        }
        let compressed_len = encoder.total_out() as usize;

        let header = SnapshotHeader {
            frame: frame.as_i32().max(0) as u32,
            uncompressed_size: raw_len as u32,
            compressed_size: compressed_len as u32,
            rng_state,
            input_seq,
        };
        header.write_to(dest.as_mut_slice())?;

        Ok((HEADER_BYTES + compressed_len, checksum, raw_len))
    }

    /// Validates an envelope, inflates its payload and hands the
    /// uncompressed state to the emulator.
    ///
    /// Returns the parsed header so the caller can restore bookkeeping (the
    /// input sequence in particular). The envelope is fully validated before
    /// any emulator callback runs.
    ///
    /// # Errors
    ///
    /// - [`FramelockError::BadMagic`], [`FramelockError::UnsupportedVersion`]
    ///   or [`FramelockError::Truncated`] for a malformed envelope.
    /// - [`FramelockError::DecompressionFailed`] if the payload does not
    ///   inflate to exactly the declared size.
    /// - [`FramelockError::EmulatorRejected`] if the load callback fails.
    pub fn load<E: EmulatorHost + ?Sized>(
        &mut self,
        emulator: &mut E,
        envelope: &[u8],
    ) -> FramelockResult<SnapshotHeader> {
        let started = Instant::now();

        let (header, payload) = SnapshotHeader::parse_with_payload(envelope)?;
        Self::inflate_and_load(emulator, header, payload, &mut self.scratch)?;

        self.metrics.loads += 1;
        self.metrics.load_nanos += started.elapsed().as_nanos() as u64;
        Ok(header)
    }

    fn inflate_and_load<E: EmulatorHost + ?Sized>(
        emulator: &mut E,
        header: SnapshotHeader,
        payload: &[u8],
        scratch: &mut [u8],
    ) -> FramelockResult<()> {
        let mut decoder = Decompress::new(true);
        let status = decoder
            .decompress(payload, scratch, FlushDecompress::Finish)
            .map_err(|error| FramelockError::DecompressionFailed {
                context: error.to_string(),
            })?;
        let inflated = decoder.total_out() as usize;
        if status != Status::StreamEnd || inflated != header.uncompressed_size as usize {
            return Err(FramelockError::DecompressionFailed {
                context: format!(
                    "expected {} uncompressed bytes, got {}",
                    header.uncompressed_size, inflated
                ),
            });
        }
        if !emulator.load_state(&scratch[..inflated]) {
            return Err(FramelockError::EmulatorRejected {
                operation: "load_state",
            });
        }
        Ok(())
    }

    /// Returns a snapshot's buffer to the pool.
    pub fn release(&mut self, snapshot: Snapshot) {
        self.pool.release(snapshot.buffer);
    }

    /// Drops all free pool buffers. Used on shutdown.
    pub fn flush_pool(&mut self) {
        self.pool.flush();
    }

    /// The number of pool buffers currently checked out (live snapshots).
    #[must_use]
    pub fn buffers_in_use(&self) -> usize {
        self.pool.in_use()
    }
}

// #########
// # TESTS #
// #########
