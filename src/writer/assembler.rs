//! Greedy cluster packing.
//!
//! Blobs are appended to a pending cluster in arrival order. Once the
//! pending cluster holds at least `min_chunk_size` bytes of blob data it is
//! sealed, compressed and written out. Blobs are never split across
//! clusters; only the last cluster may be smaller than the threshold.
//!
//! Compression either happens inline or on one background thread fed by a
//! bounded queue, so clusters always reach the output in the order they
//! were sealed.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::debug;

use crate::format::cluster::{self, Compression};

/// Largest blob a single cluster can address with 32-bit offsets.
pub const MAX_BLOB_SIZE: usize = (u32::MAX / 2) as usize;

/// Position of a blob: which cluster, and which blob inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobLocator {
    pub cluster: u32,
    pub blob: u32,
}

/// Result of [`ClusterAssembler::finish`].
#[derive(Debug)]
pub struct ClusterTable<W> {
    /// Start of every cluster, relative to the first byte written to `writer`.
    pub offsets: Vec<u64>,
    /// Total compressed bytes written.
    pub bytes_written: u64,
    pub writer: W,
}

#[derive(Default)]
struct PendingCluster {
    data: Vec<u8>,
    ends: Vec<u32>,
}

impl PendingCluster {
    fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }
}

/// Compresses sealed clusters and appends them to the output.
struct ClusterWriter<W> {
    out: W,
    compression: Compression,
    offsets: Vec<u64>,
    written: Arc<AtomicU64>,
}

impl<W: Write> ClusterWriter<W> {
    fn write_cluster(&mut self, body: Vec<u8>) -> io::Result<()> {
        let raw = cluster::compress(&body, self.compression)?;
        let offset = self.written.load(Ordering::Acquire);
        self.out.write_all(&raw)?;
        self.offsets.push(offset);
        self.written.fetch_add(raw.len() as u64, Ordering::AcqRel);
        debug!(
            cluster = self.offsets.len() - 1,
            offset,
            raw = body.len(),
            compressed = raw.len(),
            "Cluster written"
        );
        Ok(())
    }

    fn into_table(mut self) -> io::Result<ClusterTable<W>> {
        self.out.flush()?;
        Ok(ClusterTable {
            offsets: self.offsets,
            bytes_written: self.written.load(Ordering::Acquire),
            writer: self.out,
        })
    }
}

enum Sink<W> {
    Inline(ClusterWriter<W>),
    Background {
        queue: Option<Sender<Vec<u8>>>,
        worker: Option<JoinHandle<io::Result<ClusterWriter<W>>>>,
    },
    /// Left behind by `finish`.
    Closed,
}

/// Packs blobs into clusters of at least `min_chunk_size` bytes.
pub struct ClusterAssembler<W: Write + Send + 'static> {
    min_chunk_size: usize,
    pending: PendingCluster,
    sealed: u32,
    sink: Sink<W>,
    written: Arc<AtomicU64>,
}

impl<W: Write + Send + 'static> ClusterAssembler<W> {
    /// Assembler that compresses on the calling thread.
    pub fn new(out: W, min_chunk_size: usize, compression: Compression) -> Self {
        let written = Arc::new(AtomicU64::new(0));
        let writer = ClusterWriter {
            out,
            compression,
            offsets: Vec::new(),
            written: Arc::clone(&written),
        };
        Self {
            min_chunk_size: min_chunk_size.max(1),
            pending: PendingCluster::default(),
            sealed: 0,
            sink: Sink::Inline(writer),
            written,
        }
    }

    /// Assembler that compresses on a worker thread.
    ///
    /// At most `queue_depth` sealed clusters wait for the worker; beyond
    /// that `maybe_flush` blocks.
    pub fn with_background(
        out: W,
        min_chunk_size: usize,
        compression: Compression,
        queue_depth: usize,
    ) -> Self {
        let written = Arc::new(AtomicU64::new(0));
        let mut writer = ClusterWriter {
            out,
            compression,
            offsets: Vec::new(),
            written: Arc::clone(&written),
        };
        let (tx, rx) = bounded::<Vec<u8>>(queue_depth.max(1));
        let worker = std::thread::spawn(move || {
            for body in rx {
                writer.write_cluster(body)?;
            }
            Ok(writer)
        });
        Self {
            min_chunk_size: min_chunk_size.max(1),
            pending: PendingCluster::default(),
            sealed: 0,
            sink: Sink::Background {
                queue: Some(tx),
                worker: Some(worker),
            },
            written,
        }
    }

    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk_size
    }

    /// Compressed bytes written to the output so far.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Clusters sealed so far, plus the pending one if it holds any blob.
    pub fn cluster_count(&self) -> u32 {
        self.sealed + u32::from(!self.pending.is_empty())
    }

    /// Append a blob to the pending cluster.
    pub fn add_blob(&mut self, bytes: &[u8]) -> io::Result<BlobLocator> {
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("blob of {} bytes exceeds {MAX_BLOB_SIZE}", bytes.len()),
            ));
        }
        // Keep every offset of the pending cluster addressable as u32.
        if !self.pending.is_empty() && self.pending.data.len() + bytes.len() > MAX_BLOB_SIZE {
            self.flush()?;
        }

        let locator = BlobLocator {
            cluster: self.sealed,
            blob: self.pending.ends.len() as u32,
        };
        self.pending.data.extend_from_slice(bytes);
        self.pending.ends.push(self.pending.data.len() as u32);
        Ok(locator)
    }

    /// Seal the pending cluster if it reached the minimum chunk size.
    ///
    /// Returns whether a cluster was sealed.
    pub fn maybe_flush(&mut self) -> io::Result<bool> {
        if self.pending.is_empty() || self.pending.data.len() < self.min_chunk_size {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Seal whatever is pending and wait until every cluster is written.
    pub fn finish(mut self) -> io::Result<ClusterTable<W>> {
        if !self.pending.is_empty() {
            self.flush()?;
        }
        match std::mem::replace(&mut self.sink, Sink::Closed) {
            Sink::Inline(writer) => writer.into_table(),
            Sink::Background {
                mut queue,
                mut worker,
            } => {
                // Closing the queue ends the worker loop.
                queue.take();
                join(worker.take())?.into_table()
            }
            Sink::Closed => Err(io::Error::other("cluster assembler already finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let body = cluster::encode_body(&pending.data, &pending.ends);
        debug!(
            cluster = self.sealed,
            blobs = pending.ends.len(),
            bytes = pending.data.len(),
            "Sealing cluster"
        );
        match &mut self.sink {
            Sink::Inline(writer) => writer.write_cluster(body)?,
            Sink::Background { queue, worker } => {
                let sent = match queue {
                    Some(tx) => tx.send(body).is_ok(),
                    None => false,
                };
                if !sent {
                    // The worker hung up early: surface its error.
                    queue.take();
                    return Err(match join(worker.take()) {
                        Ok(_) => io::Error::other("compression worker stopped"),
                        Err(e) => e,
                    });
                }
            }
            Sink::Closed => return Err(io::Error::other("cluster assembler already finished")),
        }
        self.sealed += 1;
        Ok(())
    }
}

impl<W: Write + Send + 'static> Drop for ClusterAssembler<W> {
    /// An assembler abandoned mid-build still waits for its worker, so
    /// nothing writes to the output after the caller has moved on.
    fn drop(&mut self) {
        if let Sink::Background { queue, worker } = &mut self.sink {
            queue.take();
            if let Err(e) = join(worker.take()) {
                debug!(error = %e, "Compression worker ended with an error");
            }
        }
    }
}

fn join<W>(worker: Option<JoinHandle<io::Result<ClusterWriter<W>>>>) -> io::Result<ClusterWriter<W>> {
    let worker = worker.ok_or_else(|| io::Error::other("compression worker already joined"))?;
    worker
        .join()
        .map_err(|_| io::Error::other("compression worker panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs_per_cluster(table: &ClusterTable<Vec<u8>>) -> Vec<Vec<Vec<u8>>> {
        let mut bounds = table.offsets.clone();
        bounds.push(table.bytes_written);
        bounds
            .windows(2)
            .map(|w| cluster::decode(&table.writer[w[0] as usize..w[1] as usize]).unwrap())
            .collect()
    }

    #[test]
    fn test_threshold_flush() {
        let mut asm = ClusterAssembler::new(Vec::new(), 15, Compression::None);
        let mut locators = Vec::new();
        for item in [b"aaaaaaaaaa", b"bbbbbbbbbb", b"cccccccccc"] {
            locators.push(asm.add_blob(item).unwrap());
            asm.maybe_flush().unwrap();
        }
        assert_eq!(
            locators,
            vec![
                BlobLocator { cluster: 0, blob: 0 },
                BlobLocator { cluster: 0, blob: 1 },
                BlobLocator { cluster: 1, blob: 0 },
            ]
        );
        let table = asm.finish().unwrap();
        assert_eq!(table.offsets.len(), 2);
        assert_eq!(table.offsets[0], 0);
        let clusters = blobs_per_cluster(&table);
        assert_eq!(clusters[0], vec![b"aaaaaaaaaa".to_vec(), b"bbbbbbbbbb".to_vec()]);
        assert_eq!(clusters[1], vec![b"cccccccccc".to_vec()]);
    }

    #[test]
    fn test_threshold_reached_only_by_last_item() {
        let mut asm = ClusterAssembler::new(Vec::new(), 25, Compression::None);
        let mut flushed = Vec::new();
        for _ in 0..3 {
            asm.add_blob(&[0u8; 10]).unwrap();
            flushed.push(asm.maybe_flush().unwrap());
        }
        assert_eq!(flushed, vec![false, false, true]);
        let table = asm.finish().unwrap();
        assert_eq!(table.offsets.len(), 1);
    }

    #[test]
    fn test_cluster_count_is_ceil_of_total() {
        // 100 blobs of 7 bytes, threshold 70: exactly ten full clusters.
        let mut asm = ClusterAssembler::new(Vec::new(), 70, Compression::Zlib);
        for i in 0..100u8 {
            asm.add_blob(&[i; 7]).unwrap();
            asm.maybe_flush().unwrap();
        }
        let table = asm.finish().unwrap();
        assert_eq!(table.offsets.len(), 10);
        let clusters = blobs_per_cluster(&table);
        assert!(clusters.iter().all(|c| c.len() == 10));
        assert_eq!(clusters[9][9], vec![99u8; 7]);
    }

    #[test]
    fn test_final_cluster_may_be_small() {
        let mut asm = ClusterAssembler::new(Vec::new(), 1000, Compression::Zlib);
        asm.add_blob(b"tiny").unwrap();
        assert!(!asm.maybe_flush().unwrap());
        assert_eq!(asm.cluster_count(), 1);
        let table = asm.finish().unwrap();
        assert_eq!(table.offsets, vec![0]);
        assert_eq!(table.bytes_written, table.writer.len() as u64);
    }

    #[test]
    fn test_empty_finish() {
        let asm = ClusterAssembler::new(Vec::new(), 10, Compression::Zlib);
        let table = asm.finish().unwrap();
        assert!(table.offsets.is_empty());
        assert_eq!(table.bytes_written, 0);
        assert!(table.writer.is_empty());
    }

    #[test]
    fn test_empty_blob_still_occupies_a_slot() {
        let mut asm = ClusterAssembler::new(Vec::new(), 10, Compression::None);
        asm.add_blob(b"").unwrap();
        let table = asm.finish().unwrap();
        assert_eq!(blobs_per_cluster(&table), vec![vec![Vec::<u8>::new()]]);
    }

    #[test]
    fn test_background_matches_inline() {
        let run = |background: bool| {
            let mut asm = if background {
                ClusterAssembler::with_background(Vec::new(), 64, Compression::Zlib, 2)
            } else {
                ClusterAssembler::new(Vec::new(), 64, Compression::Zlib)
            };
            for i in 0..50u32 {
                asm.add_blob(format!("blob number {i}").as_bytes()).unwrap();
                asm.maybe_flush().unwrap();
            }
            asm.finish().unwrap()
        };
        let inline = run(false);
        let background = run(true);
        assert_eq!(inline.offsets, background.offsets);
        assert_eq!(inline.writer, background.writer);
    }

    #[test]
    fn test_offsets_are_increasing() {
        let mut asm = ClusterAssembler::with_background(Vec::new(), 16, Compression::Zlib, 1);
        for i in 0..40u8 {
            asm.add_blob(&[i; 9]).unwrap();
            asm.maybe_flush().unwrap();
        }
        let table = asm.finish().unwrap();
        assert!(table.offsets.windows(2).all(|w| w[0] < w[1]));
    }

    /// Counts bytes written and records when the worker lets go of it.
    struct TrackedWriter {
        written: Arc<AtomicU64>,
        released: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Write for TrackedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // Slow enough that a detached worker would still be busy.
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.written.fetch_add(buf.len() as u64, Ordering::SeqCst);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for TrackedWriter {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_abandoned_background_assembler_joins_worker() {
        let written = Arc::new(AtomicU64::new(0));
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let out = TrackedWriter {
            written: Arc::clone(&written),
            released: Arc::clone(&released),
        };
        let mut asm = ClusterAssembler::with_background(out, 8, Compression::None, 8);
        for i in 0..20u8 {
            asm.add_blob(&[i; 8]).unwrap();
            asm.maybe_flush().unwrap();
        }
        drop(asm);

        assert!(released.load(Ordering::SeqCst));
        let settled = written.load(Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(written.load(Ordering::SeqCst), settled);
        assert!(settled > 0);
    }
}
