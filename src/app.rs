//! Application Coordinator
//!
//! Owns the worker thread that executes pipeline runs. Triggers go through a
//! one-slot channel: a trigger that finds the slot taken is collapsed into the
//! pending run, so runs never overlap and at most one waits.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bank::{self, LoadReport};
use crate::config::BankSourceConfig;
use crate::pipeline::{Outcome, Pipeline, PipelineStage, UnresolvedReason};
use crate::shared::{AppEvent, IndexHandle, RuntimeStats, StatsSnapshot};

/// Receives stage updates, outcomes and fallback answers
pub trait AnswerSink: Send {
    fn present(&mut self, event: &AppEvent);
}

/// Generative answer source used when the bank has no match
pub trait FallbackOracle: Send + Sync {
    fn solve(&self, question: &str) -> Result<String>;
}

/// What happened to a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDisposition {
    /// A run will start for it
    Queued,
    /// A run was already pending; this trigger merged into it
    Collapsed,
    /// The worker is gone
    Closed,
}

/// Main application coordinator
pub struct QuizLensApp {
    trigger_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    index: IndexHandle,
    stats: Arc<RuntimeStats>,
    busy: Arc<AtomicBool>,
}

impl QuizLensApp {
    /// Start the worker thread
    pub fn start(
        pipeline: Pipeline,
        sink: Box<dyn AnswerSink>,
        oracle: Option<Arc<dyn FallbackOracle>>,
    ) -> Result<Self> {
        let (trigger_tx, trigger_rx) = bounded(1);
        let index = pipeline.index().clone();
        let stats = Arc::new(RuntimeStats::default());
        let busy = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            pipeline,
            sink,
            oracle,
            stats: stats.clone(),
            busy: busy.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("pipeline-worker".to_string())
            .spawn(move || worker.run(trigger_rx))?;

        info!("Pipeline worker started");

        Ok(Self {
            trigger_tx: Some(trigger_tx),
            worker: Some(handle),
            index,
            stats,
            busy,
        })
    }

    /// Request one run
    pub fn trigger(&self) -> TriggerDisposition {
        let Some(tx) = &self.trigger_tx else {
            return TriggerDisposition::Closed;
        };
        match tx.try_send(()) {
            Ok(()) => {
                debug!("Trigger queued");
                TriggerDisposition::Queued
            }
            Err(TrySendError::Full(())) => {
                debug!("Run already pending, trigger collapsed");
                self.stats.record_collapsed();
                TriggerDisposition::Collapsed
            }
            Err(TrySendError::Disconnected(())) => {
                warn!("Trigger ignored, worker has stopped");
                TriggerDisposition::Closed
            }
        }
    }

    /// Whether a run is executing right now
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    /// Rebuild the question bank and swap it in.
    ///
    /// When every configured source fails the current index is kept.
    pub fn reload_bank(&self, sources: &[BankSourceConfig], base_dir: Option<&Path>) -> LoadReport {
        let loaded = bank::load(sources, base_dir);
        let report = loaded.report;

        if !sources.is_empty() && report.failures.len() == sources.len() {
            warn!("Reload failed for every source, keeping the current question bank");
            return report;
        }

        let entries = loaded.index.len();
        self.index.replace(loaded.index);
        info!("Question bank reloaded: {} entries", entries);
        report
    }

    /// Finish the pending run, if any, and stop the worker
    pub fn shutdown(mut self) -> StatsSnapshot {
        self.stop();
        self.stats.snapshot()
    }

    fn stop(&mut self) {
        // Dropping the sender ends the worker loop once the slot drains
        self.trigger_tx.take();

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Pipeline worker panicked");
            }
            info!("Pipeline worker stopped");
        }
    }
}

impl Drop for QuizLensApp {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    pipeline: Pipeline,
    sink: Box<dyn AnswerSink>,
    oracle: Option<Arc<dyn FallbackOracle>>,
    stats: Arc<RuntimeStats>,
    busy: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self, triggers: Receiver<()>) {
        for () in triggers.iter() {
            self.busy.store(true, Ordering::SeqCst);
            // A panicking run must not take later triggers down with it
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.handle_trigger())) {
                let message = panic_message(payload.as_ref());
                error!("Pipeline run panicked: {}", message);
                self.stats.set_error(format!("run panicked: {}", message));
            }
            self.busy.store(false, Ordering::SeqCst);
        }
        debug!("Trigger channel closed");
    }

    fn handle_trigger(&mut self) {
        self.stats.record_request();

        let sink = &mut self.sink;
        let outcome = self
            .pipeline
            .run(|stage| sink.present(&AppEvent::Stage(stage)));

        match &outcome {
            Outcome::Resolved(_) => {
                self.stats.record_bank_match();
                self.stats.clear_error();
            }
            Outcome::Unresolved { reason, .. } => match reason {
                UnresolvedReason::CaptureUnavailable
                | UnresolvedReason::EngineUnavailable
                | UnresolvedReason::EmptyCapture => self.stats.set_error(reason.to_string()),
                UnresolvedReason::NoText | UnresolvedReason::NoMatch => {}
            },
        }

        let question = outcome.fallback_question().map(str::to_owned);
        self.sink.present(&AppEvent::Outcome(outcome));

        if let Some(question) = question {
            self.stats.record_fallback();
            match &self.oracle {
                Some(oracle) => {
                    info!("Handing unresolved question to the fallback");
                    let answer = oracle.solve(&question).map_err(|e| {
                        warn!("Fallback failed: {:#}", e);
                        format!("{:#}", e)
                    });
                    self.sink.present(&AppEvent::Fallback { question, answer });
                }
                None => debug!("No fallback configured"),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Prints outcomes to stdout
#[derive(Debug, Default)]
pub struct ConsoleSink {
    pub show_stages: bool,
}

impl AnswerSink for ConsoleSink {
    fn present(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Stage(stage) => {
                if self.show_stages && *stage != PipelineStage::Resolved && *stage != PipelineStage::Unresolved {
                    println!("... {}", stage);
                }
            }
            AppEvent::Outcome(Outcome::Resolved(answer)) => {
                println!("Q: {}", answer.question_text);
                println!(
                    "A: {}. {}  (score {:.2}, source '{}')",
                    answer.matched_answer_label, answer.matched_answer_text, answer.score, answer.source_id
                );
            }
            AppEvent::Outcome(Outcome::Unresolved {
                normalized_text,
                reason,
                closest,
            }) => {
                println!("No answer: {}", reason);
                if !normalized_text.is_empty() {
                    println!("Recognized: {}", normalized_text);
                }
                for candidate in closest {
                    println!(
                        "  {:.2}  {}  -> {}",
                        candidate.score,
                        candidate.entry.original_text,
                        candidate.entry.correct_text().unwrap_or_default()
                    );
                }
            }
            AppEvent::Fallback { answer, .. } => match answer {
                Ok(text) => println!("Fallback answer: {}", text),
                Err(e) => println!("Fallback failed: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::FakeBehavior;
    use crate::pipeline::tests::{config, math_index, pipeline_with};
    use crate::vision::ocr::tests::ScriptedBackend;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<AppEvent>>>,
    }

    impl RecordingSink {
        fn outcomes(&self) -> Vec<Outcome> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    AppEvent::Outcome(o) => Some(o.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl AnswerSink for RecordingSink {
        fn present(&mut self, event: &AppEvent) {
            self.events.lock().push(event.clone());
        }
    }

    /// Panics on its first event, then records like `RecordingSink`
    struct PanicOnceSink {
        panicked: bool,
        inner: RecordingSink,
    }

    impl AnswerSink for PanicOnceSink {
        fn present(&mut self, event: &AppEvent) {
            if !self.panicked {
                self.panicked = true;
                panic!("sink failure");
            }
            self.inner.present(event);
        }
    }

    struct EchoOracle {
        asked: Mutex<Vec<String>>,
    }

    impl FallbackOracle for EchoOracle {
        fn solve(&self, question: &str) -> Result<String> {
            self.asked.lock().push(question.to_string());
            Ok(format!("answer to {}", question))
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_trigger_runs_pipeline() {
        let sink = RecordingSink::default();
        let pipeline = pipeline_with(
            &config(),
            FakeBehavior::Fill(230),
            vec![ScriptedBackend::text("1+1=")],
            math_index(),
        );
        let app = QuizLensApp::start(pipeline, Box::new(sink.clone()), None).unwrap();

        assert_eq!(app.trigger(), TriggerDisposition::Queued);
        let stats = app.shutdown();

        let outcomes = sink.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_resolved());
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.bank_matches, 1);
        assert!(sink
            .events
            .lock()
            .contains(&AppEvent::Stage(PipelineStage::Capturing)));
    }

    #[test]
    fn test_triggers_collapse_while_running() {
        let sink = RecordingSink::default();
        let pipeline = pipeline_with(
            &config(),
            FakeBehavior::Hang(Duration::from_millis(300)),
            vec![],
            math_index(),
        );
        let app = QuizLensApp::start(pipeline, Box::new(sink.clone()), None).unwrap();

        assert_eq!(app.trigger(), TriggerDisposition::Queued);
        assert!(wait_until(|| app.is_busy()));
        assert_eq!(app.trigger(), TriggerDisposition::Queued);
        assert_eq!(app.trigger(), TriggerDisposition::Collapsed);
        assert_eq!(app.trigger(), TriggerDisposition::Collapsed);

        let stats = app.shutdown();
        assert_eq!(sink.outcomes().len(), 2);
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.collapsed_triggers, 2);
    }

    #[test]
    fn test_unresolved_text_goes_to_oracle() {
        let sink = RecordingSink::default();
        let oracle = Arc::new(EchoOracle {
            asked: Mutex::new(Vec::new()),
        });
        let pipeline = pipeline_with(
            &config(),
            FakeBehavior::Fill(230),
            vec![ScriptedBackend::text("富士山の高さは？")],
            math_index(),
        );
        let app = QuizLensApp::start(pipeline, Box::new(sink.clone()), Some(oracle.clone())).unwrap();

        app.trigger();
        let stats = app.shutdown();

        assert_eq!(oracle.asked.lock().as_slice(), ["富士山の高さは？"]);
        assert_eq!(stats.fallback_requests, 1);
        let events = sink.events.lock();
        assert!(matches!(
            events.last(),
            Some(AppEvent::Fallback { answer: Ok(a), .. }) if a == "answer to 富士山の高さは？"
        ));
    }

    #[test]
    fn test_capture_failure_counted() {
        let sink = RecordingSink::default();
        let pipeline = pipeline_with(&config(), FakeBehavior::Fail, vec![], math_index());
        let app = QuizLensApp::start(pipeline, Box::new(sink.clone()), None).unwrap();

        app.trigger();
        let stats = app.shutdown();

        assert_eq!(stats.failures, 1);
        assert!(stats.last_error.is_some());
        assert_eq!(stats.fallback_requests, 0);
    }

    #[test]
    fn test_worker_survives_panicking_run() {
        let sink = RecordingSink::default();
        let pipeline = pipeline_with(
            &config(),
            FakeBehavior::Fill(230),
            vec![ScriptedBackend::text("1+1=")],
            math_index(),
        );
        let app = QuizLensApp::start(
            pipeline,
            Box::new(PanicOnceSink {
                panicked: false,
                inner: sink.clone(),
            }),
            None,
        )
        .unwrap();

        assert_eq!(app.trigger(), TriggerDisposition::Queued);
        assert!(wait_until(|| app
            .stats()
            .last_error
            .is_some_and(|e| e.contains("sink failure"))));
        assert!(wait_until(|| !app.is_busy()));

        assert_eq!(app.trigger(), TriggerDisposition::Queued);
        assert!(wait_until(|| sink.outcomes().len() == 1));

        let stats = app.shutdown();
        assert_eq!(stats.requests, 2);
    }

    fn csv_source(id: &str, path: std::path::PathBuf) -> BankSourceConfig {
        BankSourceConfig {
            id: id.to_string(),
            path,
            format: None,
            priority: 0,
            question_column: "question".to_string(),
            option_columns: vec!["a".to_string(), "b".to_string()],
            option_labels: None,
            answer_column: "answer".to_string(),
        }
    }

    #[test]
    fn test_reload_swaps_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.csv");
        std::fs::write(&path, "question,a,b,answer\n2+2=,4,5,A\n3+3=,6,7,A\n").unwrap();
        let source = csv_source("extra", path);

        let pipeline = pipeline_with(&config(), FakeBehavior::Fill(230), vec![], math_index());
        let app = QuizLensApp::start(pipeline, Box::new(RecordingSink::default()), None).unwrap();

        let report = app.reload_bank(&[source], None);
        assert!(report.failures.is_empty());
        assert_eq!(app.index().snapshot().len(), 2);

        let missing = csv_source("gone", dir.path().join("missing.csv"));
        let report = app.reload_bank(&[missing], None);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(app.index().snapshot().len(), 2);
    }
}
