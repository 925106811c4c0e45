use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::{
    db::connection::ConnectionProvider,
    handle::mover::{RowMover, TableReport},
    model::job::{DatabaseGroup, JobConfig, RunSettings},
};

// 一个数据库组的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub group: String,
    pub tables: Vec<TableReport>,
    // 连接失败等组级别错误
    pub error: Option<String>,
    // 因前面的表失败而未执行的策略数
    pub not_attempted: usize,
}

impl GroupReport {
    fn new(group: &str) -> Self {
        GroupReport {
            group: group.to_string(),
            tables: Vec::new(),
            error: None,
            not_attempted: 0,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some() || self.tables.iter().any(TableReport::failed)
    }

    pub fn table(&self, source_table: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.source_table == source_table)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub groups: Vec<GroupReport>,
}

impl JobReport {
    pub fn failed(&self) -> bool {
        self.groups.iter().any(GroupReport::failed)
    }

    pub fn group(&self, name: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.group == name)
    }

    pub fn failed_groups(&self) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|g| g.failed())
            .map(|g| g.group.as_str())
            .collect()
    }

    fn tables(&self) -> impl Iterator<Item = &TableReport> {
        self.groups.iter().flat_map(|g| g.tables.iter())
    }

    pub fn total_selected(&self) -> u64 {
        self.tables().map(|t| t.selected).sum()
    }

    pub fn total_archived(&self) -> u64 {
        self.tables().map(|t| t.archived).sum()
    }

    pub fn total_duplicates(&self) -> u64 {
        self.tables().map(|t| t.duplicates).sum()
    }

    pub fn total_deleted(&self) -> u64 {
        self.tables().map(|t| t.deleted).sum()
    }

    pub fn log_summary(&self) {
        let failed = self.failed_groups();
        if failed.is_empty() {
            tracing::info!(
                groups = self.groups.len(),
                selected = self.total_selected(),
                archived = self.total_archived(),
                duplicates = self.total_duplicates(),
                deleted = self.total_deleted(),
                "archive job finished"
            );
        } else {
            tracing::warn!(
                groups = self.groups.len(),
                failed_groups = ?failed,
                selected = self.total_selected(),
                archived = self.total_archived(),
                duplicates = self.total_duplicates(),
                deleted = self.total_deleted(),
                "archive job finished with failures"
            );
        }
    }
}

// 每个数据库组一个任务，各自持有连接
// 按配置顺序启动，最多同时运行parallelism个；组内的表按顺序处理
pub struct Orchestrator<P> {
    provider: Arc<P>,
}

impl<P: ConnectionProvider> Orchestrator<P> {
    pub fn new(provider: P) -> Self {
        Orchestrator {
            provider: Arc::new(provider),
        }
    }

    pub async fn run(&self, job: &JobConfig) -> JobReport {
        let settings = &job.settings;
        // 限制同时处理的数据库组数量
        let permits = settings.parallelism.clamp(1, Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks = Vec::with_capacity(job.groups.len());

        for group in &job.groups {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(group = %group.name, error = %e, "cannot schedule database group");
                    break;
                }
            };
            let provider = self.provider.clone();
            let group_cloned = group.clone();
            let settings_cloned = settings.clone();
            let span = tracing::info_span!("group", group = %group.name);
            let task = tokio::spawn(
                async move {
                    let report = run_group(provider.as_ref(), &group_cloned, &settings_cloned).await;
                    // 释放信号量
                    drop(permit);
                    report
                }
                .instrument(span),
            );
            tasks.push((group.name.clone(), task));
        }

        // 按配置顺序收集结果
        let mut report = JobReport::default();
        for (name, task) in tasks {
            match task.await {
                Ok(group_report) => report.groups.push(group_report),
                Err(e) => {
                    tracing::error!(group = %name, error = %e, "database group task failed");
                    let mut failed = GroupReport::new(&name);
                    failed.error = Some(format!("group task failed: {}", e));
                    report.groups.push(failed);
                }
            }
        }
        // 未能调度的组也要体现在结果中
        for group in job.groups.iter().skip(report.groups.len()) {
            let mut skipped = GroupReport::new(&group.name);
            skipped.error = Some("database group was not scheduled".to_string());
            skipped.not_attempted = group.policies.len();
            report.groups.push(skipped);
        }
        report
    }
}

// 用一对源库/归档库连接处理一个数据库组
pub async fn run_group<P: ConnectionProvider>(
    provider: &P,
    group: &DatabaseGroup,
    settings: &RunSettings,
) -> GroupReport {
    let mut report = GroupReport::new(&group.name);

    let mut connections = match provider.open(group).await {
        Ok(connections) => connections,
        Err(e) => {
            tracing::error!(error = %e, "error connecting to the database group");
            report.error = Some(e.to_string());
            report.not_attempted = group.policies.len();
            return report;
        }
    };
    tracing::info!(tables = group.policies.len(), "database connections opened");

    {
        let mut mover = RowMover::new(group, &mut connections, settings);
        for (idx, policy) in group.policies.iter().enumerate() {
            match mover.move_table(policy).await {
                Ok(table) => report.tables.push(table),
                Err(failure) => {
                    report.tables.push(failure.report);
                    if !settings.continue_on_table_error {
                        report.not_attempted = group.policies.len() - idx - 1;
                        tracing::warn!(
                            remaining = report.not_attempted,
                            "stopping database group after table failure"
                        );
                        break;
                    }
                }
            }
        }
    }

    connections.close().await;
    tracing::info!("database connections closed");
    report
}
