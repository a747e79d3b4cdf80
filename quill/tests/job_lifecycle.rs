use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use quill::backend::StubBackend;
use quill::job::JobPhase;
use quill::ledger::UsageLedger;
use quill::store::MemoryStore;
use quill::{
    BackendError, ErrorKind, Generation, GenerationBackend, GenerationRequest, JobCallbacks,
    JobController, JobDescriptor, JobOutcome, JobType, KeyValueStore, PriceTable, TokenUsage,
};

enum Step {
    Chunk(&'static str),
    Finish,
    Fail(&'static str),
}

/// Backend driven step by step from the test thread, one script per prompt.
///
/// It never looks at the cancellation token, like a provider that keeps
/// sending after the client gave up.
#[derive(Default)]
struct GatedBackend {
    scripts: Mutex<HashMap<String, Receiver<Step>>>,
}

impl GatedBackend {
    fn script(&self, prompt: &str) -> Sender<Step> {
        let (tx, rx) = mpsc::channel();
        self.scripts.lock().unwrap().insert(prompt.to_string(), rx);
        tx
    }
}

impl GenerationBackend for GatedBackend {
    fn stream(
        &self,
        request: &GenerationRequest,
        on_chunk: &mut dyn FnMut(&str, &str),
    ) -> Result<Generation, BackendError> {
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .remove(&request.prompt)
            .ok_or_else(|| BackendError::Provider(format!("no script for {}", request.prompt)))?;

        let mut full_text = String::new();
        loop {
            match steps.recv() {
                Ok(Step::Chunk(chunk)) => {
                    full_text.push_str(chunk);
                    on_chunk(chunk, &full_text);
                }
                Ok(Step::Finish) | Err(_) => {
                    return Ok(Generation {
                        text: full_text,
                        usage: None,
                    })
                }
                Ok(Step::Fail(message)) => {
                    return Err(BackendError::Transport {
                        provider: "Gated".into(),
                        message: message.into(),
                    })
                }
            }
        }
    }

    fn provider_name(&self) -> &str {
        "Gated"
    }
}

fn progress_channel() -> (Sender<String>, Receiver<String>) {
    mpsc::channel()
}

#[test]
fn second_job_is_rejected_while_one_is_active() -> Result<()> {
    let backend = Arc::new(GatedBackend::default());
    let steps = backend.script("first");
    let controller = JobController::new(backend.clone());
    let controller = &controller;

    thread::scope(|s| {
        let (progress_tx, progress_rx) = progress_channel();
        let job = s.spawn(move || {
            controller.run_job(
                JobDescriptor::new(JobType::LogicCheck, "a", "first"),
                JobCallbacks::new().on_progress(move |st| {
                    let _ = progress_tx.send(st.text.clone());
                }),
            )
        });

        steps.send(Step::Chunk("Hello ")).unwrap();
        assert_eq!(progress_rx.recv().unwrap(), "Hello");

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.loading, Some(JobType::LogicCheck));
        assert_eq!(snapshot.phase, JobPhase::Streaming);

        let started = std::cell::Cell::new(false);
        let rejected = controller.run_job(
            JobDescriptor::new(JobType::Scoring, "b", "second"),
            JobCallbacks::new().on_start(|| started.set(true)),
        );
        assert!(rejected.is_none());
        assert!(!started.get());
        assert_eq!(controller.snapshot().streaming.id.as_deref(), Some("a"));

        steps
            .send(Step::Chunk("world\n<FINAL_JSON>{\"status\":\"pass\",\"score\":11}</FINAL_JSON>"))
            .unwrap();
        steps.send(Step::Finish).unwrap();

        let outcome = job.join().unwrap().unwrap();
        let JobOutcome::Completed(success) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(success.json["score"], 10);
        assert_eq!(success.json["comment"], "Hello world");
    });

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.loading, None);
    assert!(snapshot.streaming.is_empty());
    Ok(())
}

#[test]
fn cancelled_job_cannot_touch_newer_job_state() -> Result<()> {
    let backend = Arc::new(GatedBackend::default());
    let old_steps = backend.script("old");
    let new_steps = backend.script("new");
    let controller = JobController::new(backend.clone());
    let controller = &controller;

    thread::scope(|s| {
        let (old_tx, old_rx) = progress_channel();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let old_errors = errors.clone();
        let old_job = s.spawn(move || {
            controller.run_job(
                JobDescriptor::new(JobType::GrammarCheck, "old", "old"),
                JobCallbacks::new()
                    .on_progress(move |st| {
                        let _ = old_tx.send(st.text.clone());
                    })
                    .on_error(move |e, _| old_errors.lock().unwrap().push(e.clone())),
            )
        });

        old_steps.send(Step::Chunk("Old prose")).unwrap();
        assert_eq!(old_rx.recv().unwrap(), "Old prose");

        controller.cancel();
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.loading, None);
        assert_eq!(snapshot.phase, JobPhase::Idle);
        assert!(snapshot.streaming.is_empty());

        let (new_tx, new_rx) = progress_channel();
        let new_job = s.spawn(move || {
            controller.run_job(
                JobDescriptor::new(JobType::Scoring, "new", "new"),
                JobCallbacks::new().on_progress(move |st| {
                    let _ = new_tx.send(st.text.clone());
                }),
            )
        });
        new_steps.send(Step::Chunk("New prose")).unwrap();
        assert_eq!(new_rx.recv().unwrap(), "New prose");

        // The old stream keeps going and then fails outright.
        old_steps.send(Step::Chunk(" and more")).unwrap();
        old_steps.send(Step::Fail("socket closed")).unwrap();
        assert!(old_job.join().unwrap().is_none());
        assert!(old_rx.try_recv().is_err());
        assert!(errors.lock().unwrap().is_empty());

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.loading, Some(JobType::Scoring));
        assert_eq!(snapshot.streaming.id.as_deref(), Some("new"));
        assert_eq!(snapshot.streaming.text, "New prose");
        assert_eq!(snapshot.error, None);

        new_steps
            .send(Step::Chunk("\n<FINAL_JSON>{\"score\": 15}</FINAL_JSON>"))
            .unwrap();
        new_steps.send(Step::Finish).unwrap();
        let outcome = new_job.join().unwrap().unwrap();
        assert!(outcome.is_ok());
    });

    assert_eq!(controller.snapshot().loading, None);
    Ok(())
}

#[test]
fn transport_failure_keeps_partial_prose() -> Result<()> {
    let backend = Arc::new(GatedBackend::default());
    let steps = backend.script("prompt");
    let controller = JobController::new(backend.clone());

    steps.send(Step::Chunk("The essay argues")).unwrap();
    steps.send(Step::Chunk(" that <FINAL_JS")).unwrap();
    steps.send(Step::Fail("connection reset")).unwrap();

    let outcome = controller
        .run_job(
            JobDescriptor::new(JobType::Scoring, "essay-7", "prompt"),
            JobCallbacks::new(),
        )
        .unwrap();
    let JobOutcome::Failed(failure) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(failure.raw, None);
    assert_eq!(failure.usage, None);
    let error = failure.error;
    assert_eq!(error.kind, ErrorKind::Transport);
    assert_eq!(error.id, "essay-7");
    assert!(error.message.contains("connection reset"), "{}", error.message);
    assert_eq!(error.partial_text.as_deref(), Some("The essay argues that"));

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.error, Some(error));
    assert_eq!(snapshot.loading, None);
    assert!(snapshot.streaming.is_empty());
    Ok(())
}

#[test]
fn cancel_from_progress_callback_reports_nothing() -> Result<()> {
    let text = "A long explanation that streams in many pieces. <FINAL_JSON>{}</FINAL_JSON>";
    let controller = JobController::new(Arc::new(StubBackend::new(text).with_chunk_chars(4)));
    let controller = &controller;

    let mut seen = 0;
    let mut failed = false;
    let mut succeeded = false;
    let outcome = controller.run_job(
        JobDescriptor::new(JobType::LetterLogic, "l1", "prompt"),
        JobCallbacks::new()
            .on_progress(|_| {
                seen += 1;
                if seen == 2 {
                    controller.cancel();
                }
            })
            .on_error(|_, _| failed = true)
            .on_success(|_| succeeded = true),
    );

    assert!(outcome.is_none());
    assert_eq!(seen, 2);
    assert!(!failed);
    assert!(!succeeded);
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.loading, None);
    assert_eq!(snapshot.error, None);
    Ok(())
}

#[test]
fn completed_job_usage_feeds_the_ledger() -> Result<()> {
    let usage = TokenUsage {
        prompt_tokens: 1_000,
        completion_tokens: 500,
    };
    let backend = StubBackend::new("Hello world\n<FINAL_JSON>{\"status\":\"pass\",\"score\":11}</FINAL_JSON>")
        .with_usage(usage);
    let controller = JobController::new(Arc::new(backend));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let ledger = UsageLedger::new(Some(store), PriceTable::built_in());

    let success = match controller.run_job(
        JobDescriptor::new(JobType::LogicCheck, "p", "prompt"),
        JobCallbacks::new(),
    ) {
        Some(JobOutcome::Completed(success)) => success,
        other => panic!("expected success, got {other:?}"),
    };
    assert_eq!(
        success.json,
        serde_json::json!({
            "status": "pass",
            "score": 10,
            "comment": "Hello world",
            "issues": [],
            "suggestions": []
        })
    );

    let reported = success.usage.unwrap();
    let cost = ledger.record_usage(reported.prompt_tokens, reported.completion_tokens, "deepseek-chat");
    let summary = ledger.summary();
    assert_eq!(summary.today.total_tokens(), 1_500);
    assert_eq!(summary.today.request_count, 1);
    assert!((summary.total.cost - cost).abs() < 1e-12);
    Ok(())
}
