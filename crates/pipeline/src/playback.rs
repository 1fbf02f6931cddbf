//! Paced real-time audio emission
//!
//! Synthesis produces frames in bursts; listeners need them at wall-clock
//! cadence. The scheduler is a single-consumer actor: producers enqueue
//! control events and frame batches on one FIFO, the consumer buffers a
//! jitter window per sentence and then emits frame *n* at
//! `start + n * frame_duration - buffer_time`.
//!
//! `interrupt()` bumps an epoch counter shared with the consumer; every
//! queued item carries the epoch it was produced under, so stale items are
//! dropped without scanning the queue. The stop notification fires exactly
//! once per interruption, and only if something was actually playing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

use voiceloop_core::{AudioFrame, TtsState, VoiceEvent};

#[derive(Debug)]
enum Cmd {
    /// Reply turn begins
    Start,
    /// A sentence's audio follows
    SentenceStart(String),
    /// Frame batch for the current sentence
    Frames(Vec<AudioFrame>),
    /// No more audio for the current sentence
    SentenceEnd,
    /// Reply turn is complete
    Stop,
    /// Tear the consumer down
    Shutdown,
}

#[derive(Debug)]
struct Item {
    epoch: u64,
    cmd: Cmd,
}

/// Single-consumer paced playback actor
pub struct AudioPlaybackScheduler {
    tx: mpsc::UnboundedSender<Item>,
    epoch: Arc<AtomicU64>,
    playing: Arc<AtomicBool>,
    events: broadcast::Sender<VoiceEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPlaybackScheduler {
    pub fn new(
        frame_duration_ms: f32,
        buffer_time_ms: u64,
        events: broadcast::Sender<VoiceEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let playing = Arc::new(AtomicBool::new(false));

        let consumer = Consumer {
            rx,
            epoch: epoch.clone(),
            playing: playing.clone(),
            events: events.clone(),
            frame_duration: Duration::from_micros((frame_duration_ms * 1000.0) as u64),
            buffer_time: Duration::from_millis(buffer_time_ms),
            buffer_frames: ((buffer_time_ms as f32 / frame_duration_ms) as usize).max(1),
        };
        let handle = tokio::spawn(consumer.run());

        Self {
            tx,
            epoch,
            playing,
            events,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Current interruption epoch; bumped by every [`Self::interrupt`]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Announce the start of a reply turn
    ///
    /// Returns the epoch the turn runs under; once [`Self::epoch`] moves
    /// past it the turn has been interrupted.
    pub fn start(&self) -> u64 {
        self.send(Cmd::Start)
    }

    /// Announce a sentence whose frames follow
    pub fn sentence_start(&self, text: impl Into<String>) {
        self.send(Cmd::SentenceStart(text.into()));
    }

    /// Queue a batch of frames for the current sentence
    pub fn push_frames(&self, frames: Vec<AudioFrame>) {
        if !frames.is_empty() {
            self.send(Cmd::Frames(frames));
        }
    }

    /// Mark the current sentence's audio as complete
    ///
    /// Must be sent even when synthesis failed, or the consumer would wait
    /// for frames that never arrive.
    pub fn sentence_end(&self) {
        self.send(Cmd::SentenceEnd);
    }

    /// Announce the end of the reply turn
    pub fn stop(&self) {
        self.send(Cmd::Stop);
    }

    /// Drop everything queued and stop playback now
    ///
    /// Emits one stop notification only if something was playing; calling
    /// again while stopped is a no-op.
    pub fn interrupt(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.playing.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(VoiceEvent::TtsStatus {
                state: TtsState::Stop,
                text: String::new(),
            });
        }
    }

    /// Stop the consumer task; safe to call more than once
    pub async fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        self.send(Cmd::Shutdown);
        if timeout(Duration::from_secs(1), handle).await.is_err() {
            warn!("playback consumer did not stop in time");
        }
    }

    fn send(&self, cmd: Cmd) -> u64 {
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.tx.send(Item { epoch, cmd }).is_err() {
            debug!("playback consumer gone, dropping command");
        }
        epoch
    }
}

struct Consumer {
    rx: mpsc::UnboundedReceiver<Item>,
    epoch: Arc<AtomicU64>,
    playing: Arc<AtomicBool>,
    events: broadcast::Sender<VoiceEvent>,
    frame_duration: Duration,
    buffer_time: Duration,
    buffer_frames: usize,
}

impl Consumer {
    async fn run(mut self) {
        // An item received inside a sentence but belonging outside it is
        // carried back to this loop instead of being lost.
        let mut carry: Option<Item> = None;
        loop {
            let item = match carry.take() {
                Some(item) => item,
                None => match self.rx.recv().await {
                    Some(item) => item,
                    None => break,
                },
            };

            if item.epoch < self.epoch.load(Ordering::SeqCst) {
                continue;
            }

            match item.cmd {
                Cmd::Start => {
                    if !self.playing.swap(true, Ordering::SeqCst) {
                        self.emit(TtsState::Start, String::new());
                    }
                }
                Cmd::Stop => {
                    if self.playing.swap(false, Ordering::SeqCst) {
                        self.emit(TtsState::Stop, String::new());
                    }
                }
                Cmd::SentenceStart(text) => {
                    carry = self.play_sentence(item.epoch, text).await;
                }
                // Stray frames or sentence-end after a purge
                Cmd::Frames(_) | Cmd::SentenceEnd => {}
                Cmd::Shutdown => break,
            }
        }
    }

    /// Buffer, then pace out one sentence
    ///
    /// Returns an item that belongs to the outer loop, if one was pulled.
    async fn play_sentence(&mut self, my_epoch: u64, text: String) -> Option<Item> {
        self.emit(TtsState::SentenceStart, text.clone());

        let mut queue: VecDeque<AudioFrame> = VecDeque::new();
        let mut ended = false;
        // A same-epoch control item (e.g. the turn's stop) pulled while this
        // sentence still has audio queued; processed by the outer loop after
        // the sentence finishes.
        let mut deferred: Option<Item> = None;

        // Jitter buffering: wait for buffer_frames worth of audio, but never
        // stall past twice the buffer time.
        let stall_deadline = Instant::now() + self.buffer_time * 2;
        while queue.len() < self.buffer_frames && !ended {
            match tokio::time::timeout_at(stall_deadline, self.rx.recv()).await {
                Ok(Some(item)) => match self.ingest(my_epoch, item, &mut queue, &mut ended) {
                    Ingest::Consumed => {}
                    Ingest::Defer(item) => {
                        deferred = Some(item);
                        ended = true;
                    }
                    Ingest::Abort(item) => return Some(item),
                },
                Ok(None) => return None,
                Err(_) => {
                    debug!("buffering stalled, starting playback early");
                    break;
                }
            }
        }

        let clock_start = Instant::now();
        let mut n: u32 = 0;
        loop {
            if self.epoch.load(Ordering::SeqCst) != my_epoch {
                return None;
            }

            // Pull whatever has queued up without blocking; once an item is
            // deferred, nothing more is taken out of turn order.
            while deferred.is_none() {
                match self.rx.try_recv() {
                    Ok(item) => match self.ingest(my_epoch, item, &mut queue, &mut ended) {
                        Ingest::Consumed => {}
                        Ingest::Defer(item) => {
                            deferred = Some(item);
                            ended = true;
                        }
                        Ingest::Abort(item) => return Some(item),
                    },
                    Err(_) => break,
                }
            }

            if let Some(frame) = queue.pop_front() {
                let offset = self.frame_duration * n;
                if offset > self.buffer_time {
                    sleep_until(clock_start + offset - self.buffer_time).await;
                }
                if self.epoch.load(Ordering::SeqCst) != my_epoch {
                    return None;
                }
                let _ = self.events.send(VoiceEvent::AudioStream { frame });
                n += 1;
            } else if ended {
                break;
            } else {
                // Starved mid-sentence; wait for more audio, bounded
                match timeout(self.buffer_time * 2, self.rx.recv()).await {
                    Ok(Some(item)) => match self.ingest(my_epoch, item, &mut queue, &mut ended) {
                        Ingest::Consumed => {}
                        Ingest::Defer(item) => {
                            deferred = Some(item);
                            ended = true;
                        }
                        Ingest::Abort(item) => return Some(item),
                    },
                    Ok(None) => return None,
                    Err(_) => {
                        warn!("sentence audio starved, closing sentence");
                        break;
                    }
                }
            }
        }

        self.emit(TtsState::SentenceEnd, text);
        deferred
    }

    fn ingest(
        &mut self,
        my_epoch: u64,
        item: Item,
        queue: &mut VecDeque<AudioFrame>,
        ended: &mut bool,
    ) -> Ingest {
        if item.epoch < my_epoch {
            return Ingest::Consumed; // stale, drop
        }
        if item.epoch > my_epoch {
            // The sentence was interrupted; hand the item back
            return Ingest::Abort(item);
        }
        match item.cmd {
            Cmd::Frames(frames) => {
                queue.extend(frames);
                Ingest::Consumed
            }
            Cmd::SentenceEnd => {
                *ended = true;
                Ingest::Consumed
            }
            // Control that belongs between sentences; the producer has moved
            // past this sentence, so no more of its audio is coming
            _ => Ingest::Defer(item),
        }
    }

    fn emit(&self, state: TtsState, text: String) {
        let _ = self.events.send(VoiceEvent::TtsStatus { state, text });
    }
}

enum Ingest {
    Consumed,
    Defer(Item),
    Abort(Item),
}

#[cfg(test)]
mod tests {
    use super::*;
    use voiceloop_core::{Channels, SampleRate};

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0u8; 100], 60.0, SampleRate::Hz16000, Channels::Mono)
    }

    async fn next_status(rx: &mut broadcast::Receiver<VoiceEvent>) -> (TtsState, String) {
        loop {
            match rx.recv().await.expect("bus closed") {
                VoiceEvent::TtsStatus { state, text } => return (state, text),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentence_events_in_order() {
        let (events, mut rx) = broadcast::channel(64);
        let scheduler = AudioPlaybackScheduler::new(60.0, 240, events);

        scheduler.start();
        scheduler.sentence_start("hello");
        scheduler.push_frames(vec![frame(), frame(), frame()]);
        scheduler.sentence_end();
        scheduler.stop();

        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let stop = matches!(
                event,
                VoiceEvent::TtsStatus {
                    state: TtsState::Stop,
                    ..
                }
            );
            seen.push(event);
            if stop {
                break;
            }
        }

        let summary: Vec<String> = seen
            .iter()
            .map(|e| match e {
                VoiceEvent::TtsStatus { state, .. } => format!("{:?}", state),
                VoiceEvent::AudioStream { .. } => "Frame".to_string(),
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(
            summary,
            vec!["Start", "SentenceStart", "Frame", "Frame", "Frame", "SentenceEnd", "Stop"]
        );

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_spreads_frames_over_time() {
        let (events, mut rx) = broadcast::channel(64);
        let scheduler = AudioPlaybackScheduler::new(60.0, 240, events);

        scheduler.start();
        scheduler.sentence_start("paced");
        scheduler.push_frames((0..8).map(|_| frame()).collect());
        scheduler.sentence_end();

        let began = Instant::now();
        loop {
            if let (TtsState::SentenceEnd, _) = next_status(&mut rx).await {
                break;
            }
        }
        // 8 frames at 60ms minus the 240ms jitter buffer
        assert!(began.elapsed() >= Duration::from_millis(240));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_stops_exactly_once() {
        let (events, mut rx) = broadcast::channel(64);
        let scheduler = AudioPlaybackScheduler::new(60.0, 240, events);

        scheduler.start();
        let (state, _) = next_status(&mut rx).await;
        assert_eq!(state, TtsState::Start);
        assert!(scheduler.is_playing());

        scheduler.interrupt();
        scheduler.interrupt();
        assert!(!scheduler.is_playing());

        let (state, _) = next_status(&mut rx).await;
        assert_eq!(state, TtsState::Stop);
        // The second interrupt produced nothing
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_while_idle_is_silent() {
        let (events, mut rx) = broadcast::channel(64);
        let scheduler = AudioPlaybackScheduler::new(60.0, 240, events);

        scheduler.interrupt();
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_resumes_after_interrupt() {
        let (events, mut rx) = broadcast::channel(64);
        let scheduler = AudioPlaybackScheduler::new(60.0, 240, events);

        scheduler.start();
        let (state, _) = next_status(&mut rx).await;
        assert_eq!(state, TtsState::Start);
        scheduler.interrupt();
        let (state, _) = next_status(&mut rx).await;
        assert_eq!(state, TtsState::Stop);

        // A fresh turn after the purge still plays through
        scheduler.start();
        scheduler.sentence_start("again");
        scheduler.push_frames(vec![frame()]);
        scheduler.sentence_end();
        scheduler.stop();

        let mut states = Vec::new();
        loop {
            let (state, _) = next_status(&mut rx).await;
            states.push(state);
            if state == TtsState::Stop {
                break;
            }
        }
        assert_eq!(
            states,
            vec![
                TtsState::Start,
                TtsState::SentenceStart,
                TtsState::SentenceEnd,
                TtsState::Stop
            ]
        );

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_idempotent() {
        let (events, _rx) = broadcast::channel(64);
        let scheduler = AudioPlaybackScheduler::new(60.0, 240, events);
        scheduler.shutdown().await;
        scheduler.shutdown().await;
    }
}
