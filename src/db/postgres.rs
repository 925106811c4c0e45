use async_trait::async_trait;
use sqlx::{
    Connection, PgConnection, Row as _,
    postgres::{PgConnectOptions, PgRow},
};

use crate::{
    db::connection::{ConnectionProvider, GroupConnections},
    error::{ArchiveError, QueryClass, Role},
    handle::{
        sql,
        store::{ArchiveStore, ColumnDef, Identity, Row, SourceStore, TableRef},
    },
    model::{
        job::{ConnectionInfo, DatabaseGroup},
        policy::AgeFilter,
    },
};

const APPLICATION_NAME: &str = "data-archive";

// 建立单条连接，认证或网络失败时立即报错
pub async fn connect(info: &ConnectionInfo, role: Role) -> Result<PgConnection, ArchiveError> {
    let options = PgConnectOptions::new()
        .host(&info.host)
        .port(info.port)
        .username(&info.user)
        .password(&info.password)
        .database(&info.database)
        .application_name(APPLICATION_NAME);
    PgConnection::connect_with(&options)
        .await
        .map_err(|source| ArchiveError::Connection {
            role,
            host: info.host.clone(),
            port: info.port,
            database: info.database.clone(),
            source,
        })
}

// 查询数据库版本
pub async fn server_version(conn: &mut PgConnection) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.0)
}

async fn table_columns(
    conn: &mut PgConnection,
    table: &TableRef,
) -> Result<Vec<ColumnDef>, ArchiveError> {
    let rows: Vec<(String, String)> = sqlx::query_as(sql::COLUMNS_QUERY)
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ArchiveError::query(QueryClass::Metadata, table, e))?;
    Ok(rows
        .into_iter()
        .map(|(name, sql_type)| ColumnDef { name, sql_type })
        .collect())
}

async fn close_connection(conn: PgConnection, role: Role) {
    if let Err(e) = conn.close().await {
        tracing::warn!(%role, error = %e, "failed to close database connection cleanly");
    }
}

fn decode_row(row: &PgRow, width: usize) -> Result<Row, sqlx::Error> {
    let mut values = Vec::with_capacity(width);
    for i in 0..width {
        values.push(row.try_get::<Option<String>, _>(i)?);
    }
    Ok(Row::new(values))
}

pub struct PgSource {
    conn: PgConnection,
}

impl PgSource {
    pub fn new(conn: PgConnection) -> Self {
        PgSource { conn }
    }
}

#[async_trait]
impl SourceStore for PgSource {
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDef>, ArchiveError> {
        table_columns(&mut self.conn, table).await
    }

    async fn select_eligible(
        &mut self,
        table: &TableRef,
        columns: &[ColumnDef],
        order_by: &[String],
        filter: Option<&AgeFilter>,
    ) -> Result<Vec<Row>, ArchiveError> {
        let sql = sql::select_eligible(
            table,
            columns,
            order_by,
            filter.map(|f| f.date_column.as_str()),
        );
        let mut query = sqlx::query(&sql);
        if let Some(filter) = filter {
            query = query.bind(filter.retention_days);
        }
        let rows = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| ArchiveError::query(QueryClass::Select, table, e))?;
        rows.iter()
            .map(|row| decode_row(row, columns.len()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ArchiveError::query(QueryClass::Select, table, e))
    }

    async fn delete_rows(
        &mut self,
        table: &TableRef,
        keys: &[ColumnDef],
        identities: &[Identity],
    ) -> Result<Vec<u64>, ArchiveError> {
        let sql = sql::delete_by_identity(table, keys);
        let to_err = |e: sqlx::Error| ArchiveError::query(QueryClass::Delete, table, e);

        let mut tx = self.conn.begin().await.map_err(to_err)?;
        let mut counts = Vec::with_capacity(identities.len());
        for identity in identities {
            let mut query = sqlx::query(&sql);
            for value in identity {
                query = query.bind(value.as_deref());
            }
            let result = query.execute(&mut *tx).await.map_err(to_err)?;
            counts.push(result.rows_affected());
        }
        tx.commit().await.map_err(to_err)?;
        Ok(counts)
    }

    async fn close(self) {
        close_connection(self.conn, Role::Source).await;
    }
}

pub struct PgArchive {
    conn: PgConnection,
}

impl PgArchive {
    pub fn new(conn: PgConnection) -> Self {
        PgArchive { conn }
    }
}

#[async_trait]
impl ArchiveStore for PgArchive {
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDef>, ArchiveError> {
        table_columns(&mut self.conn, table).await
    }

    async fn insert_rows(
        &mut self,
        table: &TableRef,
        columns: &[ColumnDef],
        rows: &[Row],
    ) -> Result<Vec<u64>, ArchiveError> {
        let sql = sql::insert_ignore(table, columns);
        let to_err = |e: sqlx::Error| ArchiveError::query(QueryClass::Insert, table, e);

        // 事务未提交前出错时，drop会回滚
        let mut tx = self.conn.begin().await.map_err(to_err)?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let mut query = sqlx::query(&sql);
            for value in row.values() {
                query = query.bind(value.as_deref());
            }
            let result = query.execute(&mut *tx).await.map_err(to_err)?;
            counts.push(result.rows_affected());
        }
        tx.commit().await.map_err(to_err)?;
        Ok(counts)
    }

    async fn close(self) {
        close_connection(self.conn, Role::Archive).await;
    }
}

// 每个数据库组使用自己的一对PostgreSQL连接
#[derive(Debug, Clone, Default)]
pub struct PgConnectionProvider;

#[async_trait]
impl ConnectionProvider for PgConnectionProvider {
    type Source = PgSource;
    type Archive = PgArchive;

    async fn open(
        &self,
        group: &DatabaseGroup,
    ) -> Result<GroupConnections<PgSource, PgArchive>, ArchiveError> {
        tracing::info!(
            host = %group.source.host,
            database = %group.source.database,
            "connecting to the source database"
        );
        let mut source = connect(&group.source, Role::Source).await?;

        let mut archive = match connect(&group.archive, Role::Archive).await {
            Ok(conn) => conn,
            Err(e) => {
                close_connection(source, Role::Source).await;
                return Err(e);
            }
        };

        for (role, conn) in [(Role::Source, &mut source), (Role::Archive, &mut archive)] {
            match server_version(conn).await {
                Ok(version) => tracing::debug!(%role, %version, "database version"),
                Err(e) => tracing::warn!(%role, error = %e, "failed to read database version"),
            }
        }

        Ok(GroupConnections::new(
            PgSource::new(source),
            PgArchive::new(archive),
        ))
    }
}
