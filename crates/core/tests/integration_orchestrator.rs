//! Integration tests for the orchestrator over a durable marker store
//!
//! Every "run" builds a fresh context over the same state directory, the way
//! a re-invocation after a reboot would.

use firstboot_core::config::BootstrapConfig;
use firstboot_core::context::RunContext;
use firstboot_core::errors::{BootstrapError, Result};
use firstboot_core::orchestrator::{finalize, Orchestrator, TerminalAction, TerminalState};
use firstboot_core::redaction::Redactor;
use firstboot_core::report::{Reporter, SummaryEntry, SummaryTag};
use firstboot_core::runner::mock::MockRunner;
use firstboot_core::runner::CommandOutput;
use firstboot_core::step::{FnAction, Step, StepStatus, SKIPPED_ALREADY_DONE};
use firstboot_core::store::{CompletionStore, MarkerStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Invocation counts per step name
#[derive(Clone, Default)]
struct Calls(Arc<Mutex<HashMap<String, u32>>>);

impl Calls {
    fn hit(&self, name: &str) {
        *self.0.lock().unwrap().entry(name.to_string()).or_default() += 1;
    }

    fn get(&self, name: &str) -> u32 {
        self.0.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn total(&self) -> u32 {
        self.0.lock().unwrap().values().sum()
    }
}

fn counted(calls: &Calls, name: &'static str, ok: bool) -> FnAction<impl Fn() -> Result<()>> {
    let calls = calls.clone();
    FnAction::new(move || {
        calls.hit(name);
        if ok {
            Ok(())
        } else {
            Err(BootstrapError::Step(format!("{} failed", name)))
        }
    })
}

fn context(tmp: &TempDir, runner: Arc<MockRunner>) -> RunContext {
    let config = BootstrapConfig {
        state_dir: tmp.path().join("markers"),
        log_file: tmp.path().join("bootstrap.log"),
        summary_file: tmp.path().join("bootstrap.summary"),
        ..BootstrapConfig::default()
    };
    RunContext::new(
        config.clone(),
        Arc::new(MarkerStore::new(config.state_dir.clone())),
        Reporter::new(config.log_file, config.summary_file, Redactor::new()),
        runner,
    )
}

fn summary_lines(tmp: &TempDir) -> Vec<String> {
    std::fs::read_to_string(tmp.path().join("bootstrap.summary"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_second_run_executes_nothing() {
    let tmp = TempDir::new().unwrap();
    let calls = Calls::default();
    let pipeline = || {
        Orchestrator::new(vec![
            Step::critical("a", counted(&calls, "a", true)),
            Step::optional("b", counted(&calls, "b", true)),
            Step::critical("c", counted(&calls, "c", true)),
        ])
        .unwrap()
    };

    let first = pipeline()
        .run(&context(&tmp, Arc::new(MockRunner::new())))
        .await
        .unwrap();
    assert_eq!(first.critical_failure_count(), 0);
    assert_eq!(calls.total(), 3);

    let second = pipeline()
        .run(&context(&tmp, Arc::new(MockRunner::new())))
        .await
        .unwrap();
    assert_eq!(calls.total(), 3);
    assert!(second.results.iter().all(|r| r.status == StepStatus::Ok
        && r.skipped
        && r.detail.as_deref() == Some(SKIPPED_ALREADY_DONE)));
}

#[tokio::test]
async fn test_failed_critical_step_reruns_after_fix() {
    let tmp = TempDir::new().unwrap();
    let calls = Calls::default();
    let fixed = Arc::new(AtomicBool::new(false));

    let pipeline = || {
        let calls_b = calls.clone();
        let fixed = fixed.clone();
        Orchestrator::new(vec![
            Step::critical("a", counted(&calls, "a", true)),
            Step::critical(
                "b",
                FnAction::new(move || {
                    calls_b.hit("b");
                    if fixed.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(BootstrapError::Step("mirror unreachable".to_string()))
                    }
                }),
            ),
            Step::optional("c", counted(&calls, "c", true)),
        ])
        .unwrap()
    };

    let first = pipeline()
        .run(&context(&tmp, Arc::new(MockRunner::new())))
        .await
        .unwrap();
    assert_eq!(first.get("b").unwrap().status, StepStatus::Fail);
    assert_eq!(first.terminal_state(), TerminalState::Held);

    fixed.store(true, Ordering::SeqCst);
    let second = pipeline()
        .run(&context(&tmp, Arc::new(MockRunner::new())))
        .await
        .unwrap();

    assert_eq!(calls.get("a"), 1);
    assert_eq!(calls.get("b"), 2);
    assert_eq!(calls.get("c"), 1);
    assert!(!second.get("b").unwrap().skipped);
    assert_eq!(second.terminal_state(), TerminalState::ReadyPendingRestart);
}

#[tokio::test]
async fn test_optional_failure_does_not_block_readiness() {
    let tmp = TempDir::new().unwrap();
    let calls = Calls::default();
    let runner = Arc::new(MockRunner::new());
    let ctx = context(&tmp, runner.clone());

    let summary = Orchestrator::new(vec![
        Step::critical("a", counted(&calls, "a", true)),
        Step::optional("b", counted(&calls, "b", false)),
        Step::critical("c", counted(&calls, "c", true)),
    ])
    .unwrap()
    .run(&ctx)
    .await
    .unwrap();

    assert_eq!(summary.critical_failure_count(), 0);
    assert_eq!(summary.warning_count(), 1);
    assert_eq!(summary.terminal_state(), TerminalState::ReadyPendingRestart);

    let action = finalize(&ctx, &summary, true).await.unwrap();
    assert_eq!(action, TerminalAction::RestartScheduled { delay_minutes: 1 });
    assert_eq!(runner.command_lines(), vec!["shutdown -r +1"]);
}

#[tokio::test]
async fn test_critical_failure_holds_and_later_steps_still_run() {
    let tmp = TempDir::new().unwrap();
    let calls = Calls::default();
    let runner = Arc::new(MockRunner::new());
    let ctx = context(&tmp, runner.clone());

    let summary = Orchestrator::new(vec![
        Step::critical("a", counted(&calls, "a", true)),
        Step::critical("b", counted(&calls, "b", false)),
        Step::optional("c", counted(&calls, "c", true)),
    ])
    .unwrap()
    .run(&ctx)
    .await
    .unwrap();

    assert_eq!(summary.critical_failure_count(), 1);
    assert_eq!(summary.terminal_state(), TerminalState::Held);
    assert_eq!(calls.get("c"), 1);
    assert!(ctx.store.is_done("c").unwrap());
    assert!(!ctx.store.is_done("b").unwrap());

    let action = finalize(&ctx, &summary, true).await.unwrap();
    assert_eq!(action, TerminalAction::Held);
    assert!(runner.history().is_empty());

    let detail = std::fs::read_to_string(tmp.path().join("bootstrap.log")).unwrap();
    assert!(detail.contains("HELD: 1 critical step(s) failed"));
}

#[tokio::test]
async fn test_restart_can_be_suppressed() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let ctx = context(&tmp, runner.clone());

    let summary = Orchestrator::new(vec![Step::critical("a", FnAction::new(|| Ok(())))])
        .unwrap()
        .run(&ctx)
        .await
        .unwrap();

    let action = finalize(&ctx, &summary, false).await.unwrap();
    assert_eq!(action, TerminalAction::RestartSuppressed);
    assert!(runner.history().is_empty());
}

#[tokio::test]
async fn test_failed_restart_scheduling_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    runner.set_response("shutdown", CommandOutput::failed(1, "Failed to connect to bus"));
    let ctx = context(&tmp, runner);

    let summary = Orchestrator::new(vec![Step::critical("a", FnAction::new(|| Ok(())))])
        .unwrap()
        .run(&ctx)
        .await
        .unwrap();

    assert!(finalize(&ctx, &summary, true).await.is_err());
}

#[tokio::test]
async fn test_deleting_a_marker_reruns_exactly_that_step() {
    let tmp = TempDir::new().unwrap();
    let calls = Calls::default();
    let pipeline = || {
        Orchestrator::new(vec![
            Step::critical("a", counted(&calls, "a", true)),
            Step::critical("b", counted(&calls, "b", true)),
            Step::optional("c", counted(&calls, "c", true)),
        ])
        .unwrap()
    };

    pipeline()
        .run(&context(&tmp, Arc::new(MockRunner::new())))
        .await
        .unwrap();

    let store = MarkerStore::new(tmp.path().join("markers"));
    assert!(store.marker_path("a").exists());
    assert!(store.clear("a").unwrap());

    let second = pipeline()
        .run(&context(&tmp, Arc::new(MockRunner::new())))
        .await
        .unwrap();

    assert_eq!(calls.get("a"), 2);
    assert_eq!(calls.get("b"), 1);
    assert_eq!(calls.get("c"), 1);
    assert!(!second.get("a").unwrap().skipped);
    assert!(second.get("b").unwrap().skipped);
}

#[tokio::test]
async fn test_summary_has_one_line_per_step_in_order() {
    let tmp = TempDir::new().unwrap();
    let calls = Calls::default();
    let ctx = context(&tmp, Arc::new(MockRunner::new()));

    Orchestrator::new(vec![
        Step::critical("system-update", counted(&calls, "system-update", true)),
        Step::optional("disable-nouveau", counted(&calls, "disable-nouveau", false)),
        Step::critical("nvidia-driver", counted(&calls, "nvidia-driver", false)),
        Step::optional("browser", counted(&calls, "browser", true)),
    ])
    .unwrap()
    .run(&ctx)
    .await
    .unwrap();

    let entries: Vec<SummaryEntry> = summary_lines(&tmp)
        .iter()
        .map(|l| SummaryEntry::parse(l).unwrap())
        .collect();
    let tags: Vec<(SummaryTag, &str)> = entries
        .iter()
        .map(|e| (e.tag, e.step.as_str()))
        .collect();
    assert_eq!(
        tags,
        vec![
            (SummaryTag::Ok, "system-update"),
            (SummaryTag::Warn, "disable-nouveau"),
            (SummaryTag::Fail, "nvidia-driver"),
            (SummaryTag::Ok, "browser"),
        ]
    );
    assert_eq!(
        entries[2].extra.as_deref(),
        Some("Step error: nvidia-driver failed")
    );
}

#[tokio::test]
async fn test_store_fault_aborts_the_run() {
    let tmp = TempDir::new().unwrap();
    // a regular file where the marker directory should be
    let blocker = tmp.path().join("markers");
    std::fs::write(&blocker, "").unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let counter = ran.clone();
    let ctx = context(&tmp, Arc::new(MockRunner::new()));

    let err = Orchestrator::new(vec![
        Step::critical(
            "a",
            FnAction::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ),
        Step::critical("b", FnAction::new(|| Ok(()))),
    ])
    .unwrap()
    .run(&ctx)
    .await
    .unwrap_err();

    assert!(matches!(err, BootstrapError::Store(_)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
