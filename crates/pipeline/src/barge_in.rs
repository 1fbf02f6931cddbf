//! Barge-in control during reply playback
//!
//! While a reply is audible, newly recognized user speech must not blindly
//! become a new turn. The controller asks an external intent classifier
//! whether the user meant to interrupt, was backchanneling, or said
//! something worth answering after the reply finishes. Interrupts are
//! rate-limited; deferred utterances go into a small bounded queue that is
//! drained when playback stops.
//!
//! All state transitions run on the session task; nothing here is shared.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use voiceloop_config::InterruptSettings;
use voiceloop_core::{ClassifyContext, IntentClassifier, IntentLabel, RecognizedUtterance};

/// What the session should do with a recognized utterance
#[derive(Debug)]
pub enum ControllerAction {
    /// Forward the text for reply generation
    Forward(RecognizedUtterance),
    /// Stop playback now
    Interrupt,
}

struct PendingUtterance {
    utterance: RecognizedUtterance,
    queued_at: Instant,
}

/// Per-session interrupt policy state
pub struct BargeInController {
    settings: InterruptSettings,
    classifier: Arc<dyn IntentClassifier>,
    tts_active: bool,
    queue: VecDeque<PendingUtterance>,
    last_interrupt: Option<Instant>,
    context: ClassifyContext,
}

impl BargeInController {
    pub fn new(settings: InterruptSettings, classifier: Arc<dyn IntentClassifier>) -> Self {
        Self {
            settings,
            classifier,
            tts_active: false,
            queue: VecDeque::new(),
            last_interrupt: None,
            context: ClassifyContext::default(),
        }
    }

    pub fn is_tts_active(&self) -> bool {
        self.tts_active
    }

    /// Playback of a reply turn started
    pub fn on_playback_started(&mut self) {
        self.tts_active = true;
        self.context.reply_so_far.clear();
        self.context.current_sentence.clear();
    }

    /// A new sentence became audible
    pub fn on_sentence_started(&mut self, text: &str) {
        if !self.context.reply_so_far.is_empty() {
            self.context.reply_so_far.push(' ');
        }
        self.context.reply_so_far.push_str(text);
        self.context.current_sentence = text.to_string();
    }

    /// Playback stopped; drain the deferred queue
    ///
    /// Expired entries are discarded, and of the remaining ones only the
    /// most recent is forwarded. Users who spoke several times over the
    /// reply want their latest utterance answered, not a backlog replayed.
    pub fn on_playback_stopped(&mut self) -> Option<ControllerAction> {
        self.tts_active = false;

        let timeout = Duration::from_millis(self.settings.queue_timeout_ms);
        let now = Instant::now();
        let mut fresh: Vec<PendingUtterance> = self
            .queue
            .drain(..)
            .filter(|p| now.duration_since(p.queued_at) <= timeout)
            .collect();

        let chosen = fresh.pop()?;
        if !fresh.is_empty() {
            debug!(discarded = fresh.len(), "dropping older deferred utterances");
        }
        self.context.last_user_text = chosen.utterance.text.clone();
        Some(ControllerAction::Forward(chosen.utterance))
    }

    /// Decide what to do with finalized recognized text
    pub async fn on_recognized(&mut self, utterance: RecognizedUtterance) -> Vec<ControllerAction> {
        if utterance.is_empty() {
            return Vec::new();
        }

        if !self.tts_active || !self.settings.enabled {
            self.context.last_user_text = utterance.text.clone();
            return vec![ControllerAction::Forward(utterance)];
        }

        if utterance.confidence < self.settings.min_confidence {
            debug!(
                confidence = utterance.confidence,
                "low-confidence speech during playback, ignored"
            );
            return Vec::new();
        }

        match self.classify(&utterance).await {
            IntentLabel::Interrupt => {
                if self.interrupt_allowed() {
                    self.last_interrupt = Some(Instant::now());
                    self.context.last_user_text = utterance.text.clone();
                    info!("user barge-in, stopping playback");
                    vec![
                        ControllerAction::Interrupt,
                        ControllerAction::Forward(utterance),
                    ]
                } else {
                    debug!("interrupt rate-limited, deferring");
                    self.enqueue(utterance);
                    Vec::new()
                }
            }
            IntentLabel::Ignore => {
                debug!("utterance classified as ignore");
                Vec::new()
            }
            IntentLabel::Wait => {
                self.enqueue(utterance);
                Vec::new()
            }
        }
    }

    /// Classifier call with an explicit deadline; any failure means `wait`
    async fn classify(&self, utterance: &RecognizedUtterance) -> IntentLabel {
        let deadline = Duration::from_millis(self.settings.classifier_timeout_ms);
        match timeout(deadline, self.classifier.classify(&utterance.text, &self.context)).await {
            Ok(Ok(decision)) => decision.label,
            Ok(Err(e)) => {
                warn!("classifier failed, defaulting to wait: {}", e);
                IntentLabel::Wait
            }
            Err(_) => {
                warn!("classifier timed out, defaulting to wait");
                IntentLabel::Wait
            }
        }
    }

    fn interrupt_allowed(&self) -> bool {
        let interval = Duration::from_millis(self.settings.min_interrupt_interval_ms);
        match self.last_interrupt {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }

    fn enqueue(&mut self, utterance: RecognizedUtterance) {
        if self.queue.len() >= self.settings.max_queue_len {
            // Bounded queue, oldest goes first
            self.queue.pop_front();
            debug!("deferred queue full, evicting oldest");
        }
        self.queue.push_back(PendingUtterance {
            utterance,
            queued_at: Instant::now(),
        });
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use voiceloop_core::IntentDecision;

    /// Classifier returning a fixed label and counting calls
    struct FixedClassifier {
        label: IntentLabel,
        calls: AtomicUsize,
    }

    impl FixedClassifier {
        fn new(label: IntentLabel) -> Arc<Self> {
            Arc::new(Self {
                label,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IntentClassifier for FixedClassifier {
        async fn classify(
            &self,
            _text: &str,
            _context: &ClassifyContext,
        ) -> voiceloop_core::Result<IntentDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IntentDecision {
                label: self.label,
                score: 0.9,
            })
        }
    }

    struct HangingClassifier;

    #[async_trait]
    impl IntentClassifier for HangingClassifier {
        async fn classify(
            &self,
            _text: &str,
            _context: &ClassifyContext,
        ) -> voiceloop_core::Result<IntentDecision> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    fn settings() -> InterruptSettings {
        InterruptSettings {
            enabled: true,
            min_confidence: 0.4,
            max_queue_len: 3,
            queue_timeout_ms: 10_000,
            min_interrupt_interval_ms: 800,
            classifier_timeout_ms: 2_000,
        }
    }

    fn utterance(text: &str) -> RecognizedUtterance {
        RecognizedUtterance::new(text, 0.9)
    }

    #[tokio::test]
    async fn test_idle_text_forwarded_without_classification() {
        let classifier = FixedClassifier::new(IntentLabel::Interrupt);
        let mut ctl = BargeInController::new(settings(), classifier.clone());

        let actions = ctl.on_recognized(utterance("hello")).await;
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ControllerAction::Forward(_)));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interrupt_stops_playback_and_forwards() {
        let classifier = FixedClassifier::new(IntentLabel::Interrupt);
        let mut ctl = BargeInController::new(settings(), classifier);
        ctl.on_playback_started();

        let actions = ctl.on_recognized(utterance("stop talking")).await;
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], ControllerAction::Interrupt));
        assert!(matches!(actions[1], ControllerAction::Forward(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_interrupt_rate_limited() {
        let classifier = FixedClassifier::new(IntentLabel::Interrupt);
        let mut ctl = BargeInController::new(settings(), classifier);
        ctl.on_playback_started();

        let first = ctl.on_recognized(utterance("first")).await;
        assert!(matches!(first[0], ControllerAction::Interrupt));

        // 100ms later, well inside the 800ms interval: downgraded to wait
        tokio::time::advance(Duration::from_millis(100)).await;
        let second = ctl.on_recognized(utterance("second")).await;
        assert!(second.is_empty());
        assert_eq!(ctl.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_ignore_is_dropped() {
        let classifier = FixedClassifier::new(IntentLabel::Ignore);
        let mut ctl = BargeInController::new(settings(), classifier);
        ctl.on_playback_started();

        assert!(ctl.on_recognized(utterance("mm-hmm")).await.is_empty());
        assert_eq!(ctl.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_queue_bounded_with_oldest_evicted() {
        let classifier = FixedClassifier::new(IntentLabel::Wait);
        let mut ctl = BargeInController::new(settings(), classifier);
        ctl.on_playback_started();

        for i in 0..5 {
            ctl.on_recognized(utterance(&format!("utt {}", i))).await;
        }
        assert_eq!(ctl.queue_len(), 3);

        // Drain forwards only the most recent entry
        let action = ctl.on_playback_stopped().unwrap();
        match action {
            ControllerAction::Forward(u) => assert_eq!(u.text, "utt 4"),
            other => panic!("expected forward, got {:?}", other),
        }
        assert!(ctl.on_playback_stopped().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_discarded_on_drain() {
        let classifier = FixedClassifier::new(IntentLabel::Wait);
        let mut ctl = BargeInController::new(settings(), classifier);
        ctl.on_playback_started();

        ctl.on_recognized(utterance("stale")).await;
        tokio::time::advance(Duration::from_millis(11_000)).await;
        assert!(ctl.on_playback_stopped().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_timeout_defaults_to_wait() {
        let mut ctl = BargeInController::new(settings(), Arc::new(HangingClassifier));
        ctl.on_playback_started();

        let actions = ctl.on_recognized(utterance("anyone there?")).await;
        assert!(actions.is_empty());
        assert_eq!(ctl.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_ignored_during_playback() {
        let classifier = FixedClassifier::new(IntentLabel::Interrupt);
        let mut ctl = BargeInController::new(settings(), classifier.clone());
        ctl.on_playback_started();

        let actions = ctl.on_recognized(RecognizedUtterance::new("mumble", 0.1)).await;
        assert!(actions.is_empty());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }
}
