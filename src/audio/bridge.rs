//! Full-duplex audio bridge to the SIP-side byte-stream socket.
//!
//! The SIP process exposes a local unix socket carrying raw linear-16
//! 8 kHz mono audio in both directions, one 320-byte frame per 20 ms.
//! The bridge runs two workers: a read loop that converts inbound frames
//! to μ-law and hands them to the backend, and a write loop that plays
//! queued μ-law audio back out at a drift-free 20 ms cadence.
//!
//! Backends burst output audio in 4-16 KB blobs while the SIP side reads
//! one frame per tick, so the write worker meters each blob out in
//! 160-byte chunks. It keeps up to `write_ahead` of audio already written
//! into the socket so scheduler jitter here cannot starve the SIP reader.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ulaw, FRAME_BYTES_LINEAR, FRAME_BYTES_ULAW, FRAME_DURATION};

/// Connection attempts before giving up on the audio socket.
const CONNECT_ATTEMPTS: u32 = 5;

/// Backoff between connection attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// How much audio to keep pre-written into the socket (~5 frames).
const DEFAULT_WRITE_AHEAD: Duration = Duration::from_millis(100);

/// Outbound μ-law FIFO capacity in bytes (~2 minutes of audio).
const QUEUE_CAPACITY: usize = 1 << 20;

/// Grace period for workers to exit after `stop` before they are aborted.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Byte counters shared with the session's stats ticker.
#[derive(Debug, Default)]
struct BridgeCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Handle to a running bridge. Created by [`AudioBridge::start`].
pub struct AudioBridge {
    producer: Mutex<ringbuf::HeapProd<u8>>,
    counters: Arc<BridgeCounters>,
    closed: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioBridge {
    /// Connect to the SIP audio socket and launch both workers.
    ///
    /// Inbound caller audio is delivered on `inbound` as μ-law frames
    /// (160 bytes each). Retries the connection 5 times with 500 ms
    /// backoff; the SIP side creates the socket shortly after dialing.
    pub async fn start(
        socket_path: &Path,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Self> {
        let stream = connect_with_retry(socket_path).await?;
        info!(path = %socket_path.display(), "Audio bridge connected");

        let (read_half, write_half) = stream.into_split();
        let rb = HeapRb::<u8>::new(QUEUE_CAPACITY);
        let (producer, consumer) = rb.split();

        let counters = Arc::new(BridgeCounters::default());
        let closed = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());

        let read_task = tokio::spawn(read_worker(
            read_half,
            inbound,
            counters.clone(),
            closed.clone(),
            stop_notify.clone(),
        ));
        let write_task = tokio::spawn(write_worker(
            write_half,
            consumer,
            counters.clone(),
            closed.clone(),
            DEFAULT_WRITE_AHEAD,
        ));

        Ok(Self {
            producer: Mutex::new(producer),
            counters,
            closed,
            stop_notify,
            read_task: Mutex::new(Some(read_task)),
            write_task: Mutex::new(Some(write_task)),
        })
    }

    /// Queue a blob of μ-law audio for paced playout.
    ///
    /// Backends deliver frame-aligned blobs; the write worker meters them
    /// out one frame per 20 ms.
    pub fn enqueue(&self, mulaw: &[u8]) {
        let mut producer = self.producer.lock().unwrap();
        let pushed = producer.push_slice(mulaw);
        if pushed < mulaw.len() {
            warn!(
                dropped = mulaw.len() - pushed,
                "Write queue full, dropping audio"
            );
        }
    }

    /// Cumulative PCM bytes read from the caller side.
    pub fn bytes_in(&self) -> u64 {
        self.counters.bytes_in.load(Ordering::Relaxed)
    }

    /// Cumulative PCM bytes written to the caller side.
    pub fn bytes_out(&self) -> u64 {
        self.counters.bytes_out.load(Ordering::Relaxed)
    }

    /// Number of complete μ-law frames waiting in the write queue.
    pub fn queued_frames(&self) -> usize {
        self.producer.lock().unwrap().occupied_len() / FRAME_BYTES_ULAW
    }

    /// Close the queue and socket, then join both workers.
    ///
    /// Workers that do not exit within the grace period are aborted,
    /// which drops their socket halves and closes the connection.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();

        let handles = [
            self.read_task.lock().unwrap().take(),
            self.write_task.lock().unwrap().take(),
        ];
        for task in handles.into_iter().flatten() {
            let mut task = task;
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                debug!("Bridge worker did not exit in time, aborting");
                task.abort();
            }
        }
        info!(
            bytes_in = self.bytes_in(),
            bytes_out = self.bytes_out(),
            "Audio bridge stopped"
        );
    }
}

async fn connect_with_retry(path: &Path) -> Result<UnixStream> {
    let mut last_err = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(attempt, error = %e, "Audio socket not ready");
                last_err = Some(e);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
            }
        }
    }
    Err(anyhow!(
        "audio socket {} unavailable after {} attempts: {}",
        path.display(),
        CONNECT_ATTEMPTS,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// Read loop: exact 320-byte frames, converted to μ-law for the backend.
///
/// Any short read (socket closed mid-frame) terminates the worker.
async fn read_worker(
    mut read_half: tokio::net::unix::OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    counters: Arc<BridgeCounters>,
    closed: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) {
    let mut frame = [0u8; FRAME_BYTES_LINEAR];
    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            result = read_half.read_exact(&mut frame) => match result {
                Ok(_) => {
                    counters
                        .bytes_in
                        .fetch_add(FRAME_BYTES_LINEAR as u64, Ordering::Relaxed);
                    if inbound.send(ulaw::linear_to_ulaw(&frame)).is_err() {
                        break; // Receiver gone, session is shutting down.
                    }
                }
                Err(e) => {
                    if !closed.load(Ordering::SeqCst) {
                        info!(error = %e, "Audio socket read ended");
                    }
                    break;
                }
            },
            _ = stop_notify.notified() => break,
        }
    }
    debug!("Bridge read worker exiting");
}

/// Write loop: meters queued μ-law out at a monotonic 20 ms cadence.
///
/// `next_frame_at` tracks the scheduled send time of the next frame. When
/// the schedule has run more than `write_ahead` into the future the worker
/// sleeps off the surplus; otherwise it writes immediately, building up
/// the socket-side reserve. Each written chunk advances the schedule by
/// exactly one frame duration; advancing further per chunk would land one
/// frame per 40 ms and the SIP reader would hear every other frame as
/// silence. A schedule that fell behind real time snaps to now + 20 ms.
async fn write_worker(
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    mut consumer: ringbuf::HeapCons<u8>,
    counters: Arc<BridgeCounters>,
    closed: Arc<AtomicBool>,
    write_ahead: Duration,
) {
    let mut chunk = [0u8; FRAME_BYTES_ULAW];
    let mut next_frame_at: Option<Instant> = None;

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }

        if consumer.occupied_len() < FRAME_BYTES_ULAW {
            // Idle: schedule restarts on the next burst.
            next_frame_at = None;
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        }
        consumer.pop_slice(&mut chunk);

        let now = Instant::now();
        let target = *next_frame_at.get_or_insert(now);
        if target > now + write_ahead {
            tokio::time::sleep(target - now - write_ahead).await;
        }

        let pcm = ulaw::ulaw_to_linear(&chunk);
        if let Err(e) = write_half.write_all(&pcm).await {
            if !closed.load(Ordering::SeqCst) {
                info!(error = %e, "Audio socket write ended");
            }
            break;
        }
        counters
            .bytes_out
            .fetch_add(pcm.len() as u64, Ordering::Relaxed);

        let mut advanced = target + FRAME_DURATION;
        let now = Instant::now();
        if advanced < now {
            advanced = now + FRAME_DURATION;
        }
        next_frame_at = Some(advanced);
    }
    debug!("Bridge write worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn temp_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("callwire-{}-{}.sock", tag, std::process::id()))
    }

    async fn start_pair(tag: &str) -> (AudioBridge, UnixStream, mpsc::UnboundedReceiver<Vec<u8>>) {
        let path = temp_socket(tag);
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (bridge, peer) = tokio::join!(
            AudioBridge::start(&path, inbound_tx),
            async { listener.accept().await.unwrap().0 }
        );
        (bridge.unwrap(), peer, inbound_rx)
    }

    #[tokio::test]
    async fn single_chunk_reaches_socket_promptly() {
        let (bridge, mut peer, _rx) = start_pair("single").await;

        bridge.enqueue(&[0xFFu8; FRAME_BYTES_ULAW]);

        let mut out = [0u8; FRAME_BYTES_LINEAR];
        tokio::time::timeout(Duration::from_millis(100), peer.read_exact(&mut out))
            .await
            .expect("frame not written within 100 ms")
            .unwrap();
        // 0xFF decodes to silence.
        assert!(out.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn burst_is_paced_without_stutter() {
        let (bridge, mut peer, _rx) = start_pair("pacing").await;

        // One second of audio in a single burst (50 frames).
        bridge.enqueue(&vec![0xFFu8; FRAME_BYTES_ULAW * 50]);

        let started = std::time::Instant::now();
        let mut frame = [0u8; FRAME_BYTES_LINEAR];
        let mut last_arrival = started;
        let mut max_gap = Duration::ZERO;
        for i in 0..50 {
            tokio::time::timeout(Duration::from_millis(500), peer.read_exact(&mut frame))
                .await
                .expect("frame stream stalled")
                .unwrap();
            let now = std::time::Instant::now();
            // Skip the write-ahead warmup frames when measuring cadence.
            if i >= 10 {
                max_gap = max_gap.max(now - last_arrival);
            }
            last_arrival = now;
        }

        let elapsed = started.elapsed();
        // 50 frames minus ~5 frames of write-ahead should take ~0.9 s.
        assert!(elapsed >= Duration::from_millis(700), "finished too fast: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1500), "finished too slow: {:?}", elapsed);
        assert!(
            max_gap < Duration::from_millis(45),
            "40 ms stutter observed: {:?}",
            max_gap
        );
    }

    #[tokio::test]
    async fn inbound_frames_are_converted() {
        let (bridge, mut peer, mut rx) = start_pair("inbound").await;

        // Silence frame from the caller side.
        peer.write_all(&[0u8; FRAME_BYTES_LINEAR]).await.unwrap();
        let mulaw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mulaw.len(), FRAME_BYTES_ULAW);
        assert!(mulaw.iter().all(|&b| b == 0xFF));
        assert_eq!(bridge.bytes_in(), FRAME_BYTES_LINEAR as u64);
    }

    #[tokio::test]
    async fn stop_joins_workers_and_closes_socket() {
        let (bridge, mut peer, _rx) = start_pair("stop").await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), bridge.stop()).await;
        assert!(stopped.is_ok(), "stop did not complete within 2 s");

        // Both halves dropped, so the peer sees EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("peer read blocked after stop")
            .unwrap();
        assert_eq!(n, 0);
    }
}
