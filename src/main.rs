use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use data_archive::{
    args::args_handle::{ArgsConfig, PrintMe},
    db::postgres::PgConnectionProvider,
    handle::orchestrator::Orchestrator,
    model::job::JobConfig,
    util::{config::JobLoader, logging},
};

// 有表或数据库组处理失败时的退出码
const EXIT_FAILURES: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // 处理命令行参数
    let args_config = ArgsConfig::parse();
    logging::init_tracing(args_config.log_format);
    args_config.dump();

    // 读取任务配置，配置错误时不连接任何数据库，退出码为1
    let loader = JobLoader::from_process_env(&args_config.tables_dir);
    let job = loader
        .load(&args_config.job_config_path)
        .inspect_err(|e| tracing::error!(error = %e, "failed to load archive job"))
        .context("failed to load archive job")?;
    let settings = args_config.apply_overrides(job.settings);
    let job = JobConfig::new(job.groups, settings).context("invalid run settings")?;
    tracing::info!(
        groups = job.groups.len(),
        tables = job.policy_count(),
        batch_size = job.settings.batch_size,
        parallelism = job.settings.parallelism,
        dry_run = job.settings.dry_run,
        "archive job loaded"
    );

    let report = Orchestrator::new(PgConnectionProvider).run(&job).await;
    report.log_summary();

    if job.settings.fail_on_error && report.failed() {
        return Ok(ExitCode::from(EXIT_FAILURES));
    }
    Ok(ExitCode::SUCCESS)
}
