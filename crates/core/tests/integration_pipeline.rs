//! Integration tests running the standard pipeline over a mock runner

use firstboot_core::config::{BootstrapConfig, SharedFilesystem};
use firstboot_core::context::RunContext;
use firstboot_core::orchestrator::{finalize, TerminalAction, TerminalState};
use firstboot_core::pipeline::{standard_pipeline, EFS_MOUNT_STEP, STANDARD_STEPS};
use firstboot_core::report::{SummaryEntry, SummaryTag};
use firstboot_core::runner::mock::MockRunner;
use firstboot_core::step::StepStatus;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn config(tmp: &TempDir) -> BootstrapConfig {
    let mut config = BootstrapConfig {
        state_dir: tmp.path().join("markers"),
        log_file: tmp.path().join("bootstrap.log"),
        summary_file: tmp.path().join("bootstrap.summary"),
        password: Some("s3cret-pass".to_string()),
        ..BootstrapConfig::default()
    };
    config.retry.delay_secs = 0;
    config.watcher.binary = Some(PathBuf::from("/usr/local/bin/firstboot"));
    config
}

fn summary(tmp: &TempDir) -> Vec<SummaryEntry> {
    std::fs::read_to_string(tmp.path().join("bootstrap.summary"))
        .unwrap_or_default()
        .lines()
        .filter_map(SummaryEntry::parse)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_clean_run_schedules_restart() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let config = config(&tmp);
    let ctx = RunContext::with_runner(config.clone(), runner.clone());

    let run = standard_pipeline(&config).unwrap().run(&ctx).await.unwrap();
    assert_eq!(run.results.len(), STANDARD_STEPS.len());
    assert_eq!(run.terminal_state(), TerminalState::ReadyPendingRestart);

    let entries = summary(&tmp);
    assert_eq!(entries.len(), 17);
    assert!(entries.iter().all(|e| e.tag == SummaryTag::Ok));

    let action = finalize(&ctx, &run, true).await.unwrap();
    assert_eq!(action, TerminalAction::RestartScheduled { delay_minutes: 1 });
    assert_eq!(runner.command_lines().last().unwrap(), "shutdown -r +1");
}

#[tokio::test(start_paused = true)]
async fn test_failing_driver_holds_then_reruns_alone() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);

    let runner = Arc::new(MockRunner::new());
    runner.fail_always("ubuntu-drivers install");
    let ctx = RunContext::with_runner(config.clone(), runner.clone());
    let first = standard_pipeline(&config).unwrap().run(&ctx).await.unwrap();

    assert_eq!(first.terminal_state(), TerminalState::Held);
    assert_eq!(first.get("nvidia-driver").unwrap().status, StepStatus::Fail);
    // retried under the configured policy
    assert_eq!(runner.count_matching("ubuntu-drivers install"), 5);
    // later independent steps still ran
    assert_eq!(first.get("browser").unwrap().status, StepStatus::Ok);
    assert_eq!(finalize(&ctx, &first, true).await.unwrap(), TerminalAction::Held);
    assert_eq!(runner.count_matching("shutdown"), 0);

    let runner = Arc::new(MockRunner::new());
    let ctx = RunContext::with_runner(config.clone(), runner.clone());
    let second = standard_pipeline(&config).unwrap().run(&ctx).await.unwrap();

    assert_eq!(second.executed_count(), 1);
    assert!(!second.get("nvidia-driver").unwrap().skipped);
    assert_eq!(second.terminal_state(), TerminalState::ReadyPendingRestart);
}

#[tokio::test(start_paused = true)]
async fn test_password_never_reaches_the_logs() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let runner = Arc::new(MockRunner::new());
    runner.fail_always("chpasswd");
    let ctx = RunContext::with_runner(config.clone(), runner.clone());

    standard_pipeline(&config).unwrap().run(&ctx).await.unwrap();

    assert!(runner.command_lines().iter().any(|l| l.contains("s3cret-pass")));
    let detail = std::fs::read_to_string(tmp.path().join("bootstrap.log")).unwrap();
    let summary = std::fs::read_to_string(tmp.path().join("bootstrap.summary")).unwrap();
    assert!(detail.contains("chpasswd"));
    assert!(!detail.contains("s3cret-pass"));
    assert!(!summary.contains("s3cret-pass"));
}

#[tokio::test(start_paused = true)]
async fn test_session_watcher_step_enables_unit() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let runner = Arc::new(MockRunner::new());
    let ctx = RunContext::with_runner(config.clone(), runner.clone());

    standard_pipeline(&config).unwrap().run(&ctx).await.unwrap();

    let lines = runner.command_lines();
    let install = lines
        .iter()
        .position(|l| l.contains("ExecStart=/usr/local/bin/firstboot watch"))
        .unwrap();
    assert!(lines[install].contains("Type=simple"));
    assert_eq!(lines[install + 1], "systemctl daemon-reload");
    assert_eq!(
        lines[install + 2],
        "systemctl enable dcv-session-watcher.service"
    );
    assert_eq!(
        lines[install + 3],
        "systemctl start --no-block dcv-session-watcher.service"
    );
    assert_eq!(runner.count_matching("enable --now dcv-session-watcher"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_robotics_extension_follows_configured_user() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp);
    config.user = "researcher".to_string();
    let runner = Arc::new(MockRunner::new());
    let ctx = RunContext::with_runner(config.clone(), runner.clone());

    let run = standard_pipeline(&config).unwrap().run(&ctx).await.unwrap();
    assert_eq!(run.get("isaac-lab").unwrap().status, StepStatus::Ok);

    let lines = runner.command_lines();
    let clone = lines.iter().find(|l| l.contains("git clone")).unwrap();
    assert!(clone.starts_with("sudo -u researcher -H "));
    assert!(clone.contains("/home/researcher/IsaacLab"));
    assert!(lines.iter().all(|l| !l.contains("/home/ubuntu")));
    assert_eq!(
        runner.count_matching("chown -R researcher:researcher /home/researcher/IsaacLab"),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_shared_filesystem_step_reports_info() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp);
    config.shared_filesystem = Some(SharedFilesystem {
        file_system_id: "fs-0123456789abcdef0".to_string(),
        mount_point: PathBuf::from("/mnt/efs"),
    });
    let runner = Arc::new(MockRunner::new());
    let ctx = RunContext::with_runner(config.clone(), runner.clone());

    let run = standard_pipeline(&config).unwrap().run(&ctx).await.unwrap();
    assert_eq!(run.results.last().unwrap().name, EFS_MOUNT_STEP);

    let entries = summary(&tmp);
    let tags: Vec<(SummaryTag, &str)> = entries
        .iter()
        .rev()
        .take(2)
        .map(|e| (e.tag, e.step.as_str()))
        .collect();
    assert_eq!(
        tags,
        vec![(SummaryTag::Ok, EFS_MOUNT_STEP), (SummaryTag::Info, EFS_MOUNT_STEP)]
    );
    assert_eq!(runner.count_matching("mount -a"), 1);
    assert_eq!(runner.count_matching("chown ubuntu:ubuntu /mnt/efs"), 1);
}
