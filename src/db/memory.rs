// 内存数据库，供测试使用
// 行为与PostgreSQL一致：按时间过滤、唯一键冲突时跳过、每批全部成功才提交
// 记录执行过的语句，可以按语句类型、表、行注入错误

use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::{
    db::connection::{ConnectionProvider, GroupConnections},
    error::{ArchiveError, QueryClass, Role},
    handle::store::{ArchiveStore, ColumnDef, Identity, Row, SourceStore, TableRef},
    model::{job::DatabaseGroup, policy::AgeFilter},
};

#[derive(Debug, Clone)]
pub struct MemoryTable {
    pub columns: Vec<ColumnDef>,
    pub unique_key: Vec<String>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    fn key_of(&self, row: &Row) -> Option<Vec<Option<String>>> {
        if self.unique_key.is_empty() {
            return None;
        }
        self.unique_key
            .iter()
            .map(|k| self.index_of(k).map(|i| row.values()[i].clone()))
            .collect()
    }
}

// 执行过的语句
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub class: QueryClass,
    pub table: TableRef,
}

#[derive(Debug, Clone)]
struct Fault {
    class: QueryClass,
    table: TableRef,
    // None时该表的所有此类语句都失败
    when: Option<(String, String)>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<TableRef, MemoryTable>,
    statements: Vec<Statement>,
    faults: Vec<Fault>,
    open_handles: usize,
}

impl State {
    fn record(&mut self, class: QueryClass, table: &TableRef) {
        self.statements.push(Statement {
            class,
            table: table.clone(),
        });
    }

    fn check_fault(
        &self,
        class: QueryClass,
        table: &TableRef,
        columns: &[String],
        values: &[Option<String>],
    ) -> Result<(), ArchiveError> {
        for fault in self.faults.iter().filter(|f| f.class == class && &f.table == table) {
            let hit = match &fault.when {
                None => true,
                Some((column, value)) => columns
                    .iter()
                    .position(|c| c == column)
                    .and_then(|i| values.get(i))
                    .is_some_and(|v| v.as_deref() == Some(value.as_str())),
            };
            if hit {
                return Err(injected(class, table));
            }
        }
        Ok(())
    }
}

fn injected(class: QueryClass, table: &TableRef) -> ArchiveError {
    ArchiveError::query(
        class,
        table,
        sqlx::Error::Protocol(format!("injected {} failure on {}", class, table)),
    )
}

fn missing_relation(class: QueryClass, table: &TableRef) -> ArchiveError {
    ArchiveError::query(
        class,
        table,
        sqlx::Error::Protocol(format!("relation \"{}\" does not exist", table)),
    )
}

fn missing_column(class: QueryClass, table: &TableRef, column: &str) -> ArchiveError {
    ArchiveError::query(
        class,
        table,
        sqlx::Error::Protocol(format!("column \"{}\" does not exist", column)),
    )
}

// 支持常见的时间格式，解析失败按NULL处理
fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.naive_utc());
    }
    if let Some(ts) = FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
    {
        return Some(ts);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

// 克隆出的句柄共享同一份数据
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_table(&self, table: TableRef, columns: Vec<ColumnDef>, unique_key: &[&str]) {
        self.lock().tables.insert(
            table,
            MemoryTable {
                columns,
                unique_key: unique_key.iter().map(|k| k.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    // 直接写入数据，不记录语句
    pub fn seed(&self, table: &TableRef, values: Vec<Option<String>>) {
        if let Some(t) = self.lock().tables.get_mut(table) {
            t.rows.push(Row::new(values));
        }
    }

    pub fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.lock().statements.clone()
    }

    pub fn statements_on(&self, table: &TableRef) -> Vec<QueryClass> {
        self.lock()
            .statements
            .iter()
            .filter(|s| &s.table == table)
            .map(|s| s.class)
            .collect()
    }

    pub fn fail_on(&self, class: QueryClass, table: &TableRef) {
        self.lock().faults.push(Fault {
            class,
            table: table.clone(),
            when: None,
        });
    }

    // 当某列等于指定值时语句失败
    pub fn fail_on_row(&self, class: QueryClass, table: &TableRef, column: &str, value: &str) {
        self.lock().faults.push(Fault {
            class,
            table: table.clone(),
            when: Some((column.to_string(), value.to_string())),
        });
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    pub fn source(&self) -> MemorySource {
        self.lock().open_handles += 1;
        MemorySource {
            handle: Handle(self.clone()),
        }
    }

    pub fn archive(&self) -> MemoryArchive {
        self.lock().open_handles += 1;
        MemoryArchive {
            handle: Handle(self.clone()),
        }
    }

    fn columns(&self, table: &TableRef) -> Vec<ColumnDef> {
        let mut state = self.lock();
        state.record(QueryClass::Metadata, table);
        state
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }
}

// 句柄释放时计数减一，panic时也会执行
#[derive(Debug)]
struct Handle(MemoryDatabase);

impl Drop for Handle {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

#[derive(Debug)]
pub struct MemorySource {
    handle: Handle,
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDef>, ArchiveError> {
        Ok(self.handle.0.columns(table))
    }

    async fn select_eligible(
        &mut self,
        table: &TableRef,
        columns: &[ColumnDef],
        order_by: &[String],
        filter: Option<&AgeFilter>,
    ) -> Result<Vec<Row>, ArchiveError> {
        let mut state = self.handle.0.lock();
        state.record(QueryClass::Select, table);
        state.check_fault(QueryClass::Select, table, &[], &[])?;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| missing_relation(QueryClass::Select, table))?;

        let projection = columns
            .iter()
            .map(|c| {
                t.index_of(&c.name)
                    .ok_or_else(|| missing_column(QueryClass::Select, table, &c.name))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let cutoff = match filter {
            Some(f) => {
                let idx = t
                    .index_of(&f.date_column)
                    .ok_or_else(|| missing_column(QueryClass::Select, table, &f.date_column))?;
                let at = Utc::now().naive_utc() - Duration::days(i64::from(f.retention_days));
                Some((idx, at))
            }
            None => None,
        };
        let order = order_by
            .iter()
            .map(|c| {
                t.index_of(c)
                    .ok_or_else(|| missing_column(QueryClass::Select, table, c))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut selected: Vec<&Row> = t
            .rows
            .iter()
            .filter(|row| match cutoff {
                // NULL或无法解析的时间不满足条件
                Some((idx, at)) => row
                    .get(idx)
                    .and_then(parse_timestamp)
                    .is_some_and(|ts| ts < at),
                None => true,
            })
            .collect();
        selected.sort_by(|a, b| {
            order
                .iter()
                .map(|i| a.values()[*i].cmp(&b.values()[*i]))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(selected
            .into_iter()
            .map(|row| Row::new(projection.iter().map(|i| row.values()[*i].clone()).collect()))
            .collect())
    }

    async fn delete_rows(
        &mut self,
        table: &TableRef,
        keys: &[ColumnDef],
        identities: &[Identity],
    ) -> Result<Vec<u64>, ArchiveError> {
        let mut state = self.handle.0.lock();
        let key_names: Vec<String> = keys.iter().map(|k| k.name.clone()).collect();
        if !state.tables.contains_key(table) {
            state.record(QueryClass::Delete, table);
            return Err(missing_relation(QueryClass::Delete, table));
        }
        let t = &state.tables[table];
        let key_idx = key_names
            .iter()
            .map(|k| {
                t.index_of(k)
                    .ok_or_else(|| missing_column(QueryClass::Delete, table, k))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // 整个批次在副本上执行，全部成功才提交
        let mut rows = t.rows.clone();
        let mut counts = Vec::with_capacity(identities.len());
        for identity in identities {
            state.record(QueryClass::Delete, table);
            state.check_fault(QueryClass::Delete, table, &key_names, identity)?;
            let before = rows.len();
            rows.retain(|row| {
                !key_idx
                    .iter()
                    .zip(identity)
                    .all(|(i, v)| v.is_some() && &row.values()[*i] == v)
            });
            counts.push((before - rows.len()) as u64);
        }
        if let Some(t) = state.tables.get_mut(table) {
            t.rows = rows;
        }
        Ok(counts)
    }

    async fn close(self) {}
}

#[derive(Debug)]
pub struct MemoryArchive {
    handle: Handle,
}

#[async_trait]
impl ArchiveStore for MemoryArchive {
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDef>, ArchiveError> {
        Ok(self.handle.0.columns(table))
    }

    async fn insert_rows(
        &mut self,
        table: &TableRef,
        columns: &[ColumnDef],
        rows: &[Row],
    ) -> Result<Vec<u64>, ArchiveError> {
        let mut state = self.handle.0.lock();
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let Some(t) = state.tables.get(table).cloned() else {
            state.record(QueryClass::Insert, table);
            return Err(missing_relation(QueryClass::Insert, table));
        };
        let targets = names
            .iter()
            .map(|n| {
                t.index_of(n)
                    .ok_or_else(|| missing_column(QueryClass::Insert, table, n))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut staged = t.clone();
        let mut keys: HashSet<Vec<Option<String>>> =
            staged.rows.iter().filter_map(|r| staged.key_of(r)).collect();
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            state.record(QueryClass::Insert, table);
            state.check_fault(QueryClass::Insert, table, &names, row.values())?;
            if row.len() != targets.len() {
                return Err(ArchiveError::query(
                    QueryClass::Insert,
                    table,
                    sqlx::Error::Protocol(format!(
                        "expected {} values, got {}",
                        targets.len(),
                        row.len()
                    )),
                ));
            }
            let mut full = vec![None; staged.columns.len()];
            for (value, idx) in row.values().iter().zip(&targets) {
                full[*idx] = value.clone();
            }
            let full = Row::new(full);
            match staged.key_of(&full) {
                // ON CONFLICT DO NOTHING
                Some(key) if keys.contains(&key) => counts.push(0),
                key => {
                    if let Some(key) = key {
                        keys.insert(key);
                    }
                    staged.rows.push(full);
                    counts.push(1);
                }
            }
        }
        state.tables.insert(table.clone(), staged);
        Ok(counts)
    }

    async fn close(self) {}
}

// 按数据库组分配内存库连接
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    sources: HashMap<String, MemoryDatabase>,
    archives: HashMap<String, MemoryDatabase>,
    shared_archive: MemoryDatabase,
    refused: HashSet<(String, Role)>,
}

impl MemoryProvider {
    pub fn new(shared_archive: MemoryDatabase) -> Self {
        MemoryProvider {
            shared_archive,
            ..Self::default()
        }
    }

    pub fn with_source(mut self, group: &str, db: MemoryDatabase) -> Self {
        self.sources.insert(group.to_string(), db);
        self
    }

    // 该组使用单独的归档库
    pub fn with_archive(mut self, group: &str, db: MemoryDatabase) -> Self {
        self.archives.insert(group.to_string(), db);
        self
    }

    // 模拟连接失败
    pub fn refuse(mut self, group: &str, role: Role) -> Self {
        self.refused.insert((group.to_string(), role));
        self
    }

    fn check(&self, group: &DatabaseGroup, role: Role) -> Result<(), ArchiveError> {
        if !self.refused.contains(&(group.name.clone(), role)) {
            return Ok(());
        }
        let info = match role {
            Role::Source => &group.source,
            Role::Archive => &group.archive,
        };
        Err(ArchiveError::Connection {
            role,
            host: info.host.clone(),
            port: info.port,
            database: info.database.clone(),
            source: sqlx::Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
        })
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    type Source = MemorySource;
    type Archive = MemoryArchive;

    async fn open(
        &self,
        group: &DatabaseGroup,
    ) -> Result<GroupConnections<MemorySource, MemoryArchive>, ArchiveError> {
        self.check(group, Role::Source)?;
        let source = self
            .sources
            .get(&group.name)
            .cloned()
            .unwrap_or_default()
            .source();
        self.check(group, Role::Archive)?;
        let archive = self
            .archives
            .get(&group.name)
            .unwrap_or(&self.shared_archive)
            .archive();
        Ok(GroupConnections::new(source, archive))
    }
}

#[cfg(test)]
mod test_memory {
    use super::*;

    fn people() -> (MemoryDatabase, TableRef) {
        let db = MemoryDatabase::new();
        let table = TableRef::new("archive", "people");
        db.create_table(
            table.clone(),
            vec![
                ColumnDef::new("id", "integer"),
                ColumnDef::new("name", "text"),
                ColumnDef::new("note", "text"),
            ],
            &["id"],
        );
        (db, table)
    }

    fn row(id: &str, name: &str) -> Row {
        Row::new(vec![Some(id.to_string()), Some(name.to_string()), None])
    }

    #[tokio::test]
    async fn insert_skips_conflicting_keys() {
        let (db, table) = people();
        let columns = db.columns(&table);
        let mut archive = db.archive();
        let counts = archive
            .insert_rows(&table, &columns, &[row("1", "alice"), row("1", "alice")])
            .await
            .unwrap();
        assert_eq!(counts, vec![1, 0]);
        assert_eq!(db.rows(&table).len(), 1);
    }

    #[tokio::test]
    async fn failed_batch_commits_nothing() {
        let (db, table) = people();
        db.fail_on_row(QueryClass::Insert, &table, "id", "2");
        let columns = db.columns(&table);
        let mut archive = db.archive();
        let result = archive
            .insert_rows(&table, &columns, &[row("1", "alice"), row("2", "bob")])
            .await;
        assert!(result.is_err());
        assert!(db.rows(&table).is_empty());
    }

    #[tokio::test]
    async fn handles_are_counted_until_dropped() {
        let (db, _) = people();
        let source = db.source();
        let archive = db.archive();
        assert_eq!(db.open_handles(), 2);
        source.close().await;
        drop(archive);
        assert_eq!(db.open_handles(), 0);
    }

    #[test]
    fn parses_common_timestamp_forms() {
        assert!(parse_timestamp("2024-01-31 10:00:00").is_some());
        assert!(parse_timestamp("2024-01-31 10:00:00.123456").is_some());
        assert!(parse_timestamp("2024-01-31T10:00:00+02:00").is_some());
        assert!(parse_timestamp("2024-01-31").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
