// 单表归档：按batch_size分批，每批先提交归档库的插入，再删除源库中对应的行
// 出错时该表停止处理，重复执行时已归档的行会被跳过

use tracing::Instrument;

use crate::{
    db::connection::GroupConnections,
    error::ArchiveError,
    handle::store::{ArchiveStore, ColumnDef, Identity, Row, SourceStore, TableRef},
    model::{
        job::{DatabaseGroup, RunSettings},
        policy::{Operation, Policy},
    },
};

// 单表处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub source_table: String,
    pub archive_table: String,
    pub operation: Operation,
    pub selected: u64,
    pub archived: u64,
    pub duplicates: u64,
    pub deleted: u64,
    pub skipped: bool,
    pub dry_run: bool,
    pub error: Option<String>,
}

impl TableReport {
    fn new(source: &TableRef, archive: &TableRef, operation: Operation) -> Self {
        TableReport {
            source_table: source.to_string(),
            archive_table: archive.to_string(),
            operation,
            selected: 0,
            archived: 0,
            duplicates: 0,
            deleted: 0,
            skipped: false,
            dry_run: false,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

// 中途失败的表，report中是失败前的计数
#[derive(Debug)]
pub struct TableFailure {
    pub report: TableReport,
    pub error: ArchiveError,
}

pub struct RowMover<'a, S, A> {
    group: &'a DatabaseGroup,
    source: &'a mut S,
    archive: &'a mut A,
    settings: &'a RunSettings,
}

impl<'a, S: SourceStore, A: ArchiveStore> RowMover<'a, S, A> {
    pub fn new(
        group: &'a DatabaseGroup,
        connections: &'a mut GroupConnections<S, A>,
        settings: &'a RunSettings,
    ) -> Self {
        RowMover {
            group,
            source: &mut connections.source,
            archive: &mut connections.archive,
            settings,
        }
    }

    pub async fn move_table(&mut self, policy: &Policy) -> Result<TableReport, TableFailure> {
        let source = TableRef::new(&self.group.source.schema, &policy.source_table);
        let archive = TableRef::new(&self.group.archive.schema, &policy.archive_table);
        let mut report = TableReport::new(&source, &archive, policy.operation);
        let span = tracing::info_span!(
            "table",
            group = %self.group.name,
            table = %source,
            operation = %policy.operation
        );

        if policy.operation == Operation::None {
            let _entered = span.enter();
            tracing::info!("skipping archival for table");
            report.skipped = true;
            return Ok(report);
        }

        let outcome = self
            .process(policy, &source, &archive, &mut report)
            .instrument(span.clone())
            .await;
        let _entered = span.enter();
        match outcome {
            Ok(()) => {
                tracing::info!(
                    selected = report.selected,
                    archived = report.archived,
                    duplicates = report.duplicates,
                    deleted = report.deleted,
                    dry_run = report.dry_run,
                    "table processed"
                );
                Ok(report)
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    query = ?error.query_class(),
                    selected = report.selected,
                    archived = report.archived,
                    duplicates = report.duplicates,
                    deleted = report.deleted,
                    "table processing aborted"
                );
                report.error = Some(error.to_string());
                Err(TableFailure { report, error })
            }
        }
    }

    async fn process(
        &mut self,
        policy: &Policy,
        source: &TableRef,
        archive: &TableRef,
        report: &mut TableReport,
    ) -> Result<(), ArchiveError> {
        if policy.age_filter.is_none() {
            tracing::warn!("no age filter configured, every row in the table is eligible");
        }

        let source_columns = self.source.columns(source).await?;
        if source_columns.is_empty() {
            return Err(ArchiveError::TableNotFound {
                table: source.to_string(),
            });
        }
        // 只有删除时才必须能按id定位到行
        let keys = if policy.operation.deletes() {
            key_columns(&source_columns, &policy.id_columns, source)?
        } else {
            Vec::new()
        };
        let order_by: Vec<String> = policy
            .id_columns
            .iter()
            .filter(|id| {
                let found = source_columns.iter().any(|c| &c.name == *id);
                if !found {
                    tracing::warn!(column = %id, "id column not in source table, not ordering by it");
                }
                found
            })
            .cloned()
            .collect();
        if let Some(filter) = &policy.age_filter {
            if !source_columns.iter().any(|c| c.name == filter.date_column) {
                return Err(ArchiveError::UnknownColumn {
                    role: "date",
                    table: source.to_string(),
                    column: filter.date_column.clone(),
                });
            }
        }

        let insert_columns = if policy.operation.archives() {
            let archive_columns = self.archive.columns(archive).await?;
            if archive_columns.is_empty() {
                return Err(ArchiveError::TableNotFound {
                    table: archive.to_string(),
                });
            }
            Some(insert_plan(&source_columns, &archive_columns, source, archive)?)
        } else {
            None
        };

        let rows = self
            .source
            .select_eligible(
                source,
                &source_columns,
                &order_by,
                policy.age_filter.as_ref(),
            )
            .await?;
        report.selected = rows.len() as u64;
        tracing::info!(selected = report.selected, "record(s) selected");

        if self.settings.dry_run {
            report.dry_run = true;
            return Ok(());
        }

        let key_defs: Vec<ColumnDef> = keys.iter().map(|(_, c)| c.clone()).collect();
        for unit in rows.chunks(self.settings.batch_size.max(1)) {
            if let Some(columns) = &insert_columns {
                self.archive_unit(archive, columns, unit, report).await?;
            }
            if policy.operation.deletes() {
                self.delete_unit(source, &keys, &key_defs, unit, report)
                    .await?;
            }
        }
        Ok(())
    }

    async fn archive_unit(
        &mut self,
        archive: &TableRef,
        columns: &[ColumnDef],
        unit: &[Row],
        report: &mut TableReport,
    ) -> Result<(), ArchiveError> {
        let counts = self.archive.insert_rows(archive, columns, unit).await?;
        for (row, inserted) in unit.iter().zip(counts) {
            if inserted == 0 {
                report.duplicates += 1;
                tracing::debug!(
                    values = %row.display_values(),
                    "skipping duplicate record already in {}",
                    archive
                );
            } else {
                report.archived += inserted;
                tracing::debug!(inserted, values = %row.display_values(), "record(s) archived");
            }
        }
        Ok(())
    }

    async fn delete_unit(
        &mut self,
        source: &TableRef,
        keys: &[(usize, ColumnDef)],
        key_defs: &[ColumnDef],
        unit: &[Row],
        report: &mut TableReport,
    ) -> Result<(), ArchiveError> {
        let mut identities: Vec<Identity> = Vec::with_capacity(unit.len());
        for row in unit {
            let identity: Identity = keys
                .iter()
                .map(|(idx, _)| row.get(*idx).map(str::to_string))
                .collect();
            // id为NULL时无法定位到唯一一行
            if identity.iter().any(Option::is_none) {
                tracing::warn!(values = %row.display_values(), "row has a NULL id, not deleting it");
                continue;
            }
            identities.push(identity);
        }
        if identities.is_empty() {
            return Ok(());
        }

        let counts = self.source.delete_rows(source, key_defs, &identities).await?;
        for (identity, deleted) in identities.iter().zip(counts) {
            report.deleted += deleted;
            tracing::debug!(deleted, id = ?identity, "record(s) deleted");
        }
        Ok(())
    }
}

// id列在源表中的位置和类型
fn key_columns(
    source_columns: &[ColumnDef],
    id_columns: &[String],
    source: &TableRef,
) -> Result<Vec<(usize, ColumnDef)>, ArchiveError> {
    id_columns
        .iter()
        .map(|id| {
            source_columns
                .iter()
                .position(|c| &c.name == id)
                .map(|idx| (idx, source_columns[idx].clone()))
                .ok_or_else(|| ArchiveError::UnknownColumn {
                    role: "id",
                    table: source.to_string(),
                    column: id.clone(),
                })
        })
        .collect()
}

// 按源表列顺序找到归档表中的同名列
// 归档表多出的列用默认值，归档表缺少的列一起报错
fn insert_plan(
    source_columns: &[ColumnDef],
    archive_columns: &[ColumnDef],
    source: &TableRef,
    archive: &TableRef,
) -> Result<Vec<ColumnDef>, ArchiveError> {
    let mut plan = Vec::with_capacity(source_columns.len());
    let mut missing = Vec::new();
    for column in source_columns {
        match archive_columns.iter().find(|c| c.name == column.name) {
            Some(target) => plan.push(target.clone()),
            None => missing.push(column.name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(ArchiveError::SchemaMismatch {
            source_table: source.to_string(),
            archive_table: archive.to_string(),
            missing,
        });
    }
    Ok(plan)
}

#[cfg(test)]
mod test_mover {
    use super::*;

    fn cols(names: &[&str]) -> Vec<ColumnDef> {
        names.iter().map(|n| ColumnDef::new(*n, "text")).collect()
    }

    #[test]
    fn insert_plan_follows_source_order() {
        let source = TableRef::new("ida", "t");
        let archive = TableRef::new("archive", "t");
        let archive_columns = vec![
            ColumnDef::new("b", "integer"),
            ColumnDef::new("a", "text"),
            ColumnDef::new("archived_at", "timestamp"),
        ];
        let plan = insert_plan(&cols(&["a", "b"]), &archive_columns, &source, &archive).unwrap();
        assert_eq!(
            plan,
            vec![ColumnDef::new("a", "text"), ColumnDef::new("b", "integer")]
        );
    }

    #[test]
    fn insert_plan_reports_every_missing_column() {
        let source = TableRef::new("ida", "t");
        let archive = TableRef::new("archive", "t");
        let err = insert_plan(&cols(&["a", "b", "c"]), &cols(&["a"]), &source, &archive)
            .unwrap_err();
        match err {
            ArchiveError::SchemaMismatch { missing, .. } => {
                assert_eq!(missing, vec!["b".to_string(), "c".to_string()])
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn key_columns_must_exist() {
        let source = TableRef::new("ida", "t");
        let keys = key_columns(&cols(&["x", "id"]), &["id".to_string()], &source).unwrap();
        assert_eq!(keys[0].0, 1);
        assert!(matches!(
            key_columns(&cols(&["x"]), &["id".to_string()], &source),
            Err(ArchiveError::UnknownColumn { .. })
        ));
    }
}
