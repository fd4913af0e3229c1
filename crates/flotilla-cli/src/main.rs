use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flotilla_core::domain::{
    AssignmentId, AssignmentStatus, CapabilitySet, ClaimOutcome, Stage, TaskAssignment, TaskId,
    TaskSpec, WorkerId,
};
use flotilla_core::ports::{Clock, FixedClock};
use flotilla_core::{Fleet, FleetBuilder, FleetConfig};

#[derive(Parser)]
#[command(name = "flotilla", version, about = "Fleet coordination control plane")]
struct Cli {
    /// ログを JSON で出す
    #[arg(long, global = true)]
    json_logs: bool,

    /// RUST_LOG がないときのフィルタ
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// autonomy loop を回す
    Run {
        /// TOML 設定ファイル（省略時は既定値）
        #[arg(long)]
        config: Option<PathBuf>,

        /// 指定した回数だけイテレーションを回して終了する
        #[arg(long)]
        iterations: Option<u32>,

        /// リーダーキーの holder 名
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// 2 worker / 1 task のシナリオ（割り当て → stuck 回収）を時計を進めながら再現する
    Demo,
}

fn init_tracing(json: bool, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs, &cli.log_level);

    match cli.command {
        Command::Run {
            config,
            iterations,
            instance_id,
        } => run(config, iterations, instance_id).await,
        Command::Demo => demo().await,
    }
}

async fn run(
    config: Option<PathBuf>,
    iterations: Option<u32>,
    instance_id: Option<String>,
) -> Result<()> {
    let config = match config {
        Some(path) => FleetConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FleetConfig::default(),
    };

    let mut builder = FleetBuilder::new(config);
    if let Some(id) = instance_id {
        builder = builder.instance_id(id);
    }
    let fleet = builder.build()?;

    match iterations {
        Some(n) => {
            let interval = fleet.config().autonomy.interval();
            for i in 0..n {
                if i > 0 {
                    tokio::time::sleep(interval).await;
                }
                let report = fleet.autonomy().run_once().await;
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        None => {
            fleet.autonomy().start().await;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            tracing::info!("shutdown requested");
            fleet.autonomy().stop().await;
        }
    }

    println!("{}", serde_json::to_string_pretty(&fleet.autonomy().status())?);
    println!("{}", serde_json::to_string_pretty(&fleet.counts().await?)?);
    Ok(())
}

/// 過去 1 時間に終わった assignment を積んで実績を作る
async fn seed_history(fleet: &Fleet, worker_id: WorkerId, completed: u32, failed: u32) -> Result<()> {
    let now = fleet.clock().now();
    let outcomes = std::iter::repeat_n(AssignmentStatus::Completed, completed as usize)
        .chain(std::iter::repeat_n(AssignmentStatus::Failed, failed as usize));
    for status in outcomes {
        let mut assignment = TaskAssignment::new(
            AssignmentId::generate(),
            TaskId::generate(),
            worker_id,
            0,
            now - Duration::hours(2),
        );
        assignment.finish(status, None, now - Duration::hours(1));
        fleet.store().insert_assignment(assignment).await?;
    }
    Ok(())
}

async fn demo() -> Result<()> {
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let mut config = FleetConfig::default();
    config.autonomy.require_leadership = false;
    let fleet = FleetBuilder::new(config)
        .clock(clock.clone())
        .instance_id("demo")
        .build()?;

    let caps = |names: &[&str]| names.iter().copied().collect::<CapabilitySet>();
    let a = fleet.register_worker("worker-a", caps(&["code_analysis"])).await?;
    let b = fleet
        .register_worker("worker-b", caps(&["code_analysis", "debugging"]))
        .await?;
    seed_history(&fleet, a, 9, 1).await?;
    seed_history(&fleet, b, 4, 1).await?;

    // B に 1 件持たせて load = 1 にする
    let warmup = fleet.submit_task(TaskSpec::new("code_review")).await?;
    let warmup = fleet.task(warmup).await?;
    if !matches!(fleet.router().assign(&warmup, b).await?, ClaimOutcome::Claimed(_)) {
        bail!("warm-up assignment was not claimed");
    }

    let task_id = fleet.submit_task(TaskSpec::new("code_fix")).await?;
    let task = fleet.task(task_id).await?;
    let requirements = fleet.router().requirements(&task);
    let capable = fleet.router().find_capable(&requirements).await?;
    for score in fleet.router().rank(&capable).await? {
        println!(
            "candidate {} success_rate={:.2} load={} score={:.1}",
            score.worker_id, score.success_rate, score.load, score.score
        );
    }

    let report = fleet.autonomy().run_once().await;
    let task = fleet.task(task_id).await?;
    println!(
        "iteration 1: assigned={} task={:?} worker={:?}",
        report.tasks_assigned,
        task.status,
        task.assigned_worker.map(|w| w.to_string())
    );

    // 完了の偽装はできない
    if let Err(e) = fleet
        .validator()
        .transition(task_id, Stage::Complete, Some("looks done"), "demo")
        .await
    {
        println!("complete rejected: {e}");
    }

    // 15 分経過。worker は生きているが B は手を付けていない
    clock.advance(Duration::minutes(15));
    fleet.worker_heartbeat(a).await?;
    fleet.worker_heartbeat(b).await?;

    let report = fleet.autonomy().run_once().await;
    let task = fleet.task(task_id).await?;
    let worker_b = fleet.worker(b).await?;
    println!(
        "iteration 2: stuck_released={} task={:?} last_error={:?} worker-b={:?}",
        report.stuck_released, task.status, task.last_error, worker_b.status
    );

    println!("{}", serde_json::to_string_pretty(&fleet.counts().await?)?);
    Ok(())
}
