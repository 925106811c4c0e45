use std::fmt;

use thiserror::Error;

// 连接的角色：源库或归档库
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Archive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Archive => f.write_str("archive"),
        }
    }
}

// 出错的语句类型，用于日志上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Metadata,
    Select,
    Insert,
    Delete,
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryClass::Metadata => f.write_str("metadata"),
            QueryClass::Select => f.write_str("select"),
            QueryClass::Insert => f.write_str("insert"),
            QueryClass::Delete => f.write_str("delete"),
        }
    }
}

// 配置错误时不连接数据库直接退出，连接错误只影响所在的数据库组，其余错误只中止当前表
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to connect to {role} database {database} at {host}:{port}")]
    Connection {
        role: Role,
        host: String,
        port: u16,
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("{class} query failed on {table}")]
    Query {
        class: QueryClass,
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error(
        "archive table {archive_table} cannot hold rows of {source_table}: missing columns [{}]",
        .missing.join(", ")
    )]
    SchemaMismatch {
        source_table: String,
        archive_table: String,
        missing: Vec<String>,
    },

    #[error("{role} column {column} does not exist in {table}")]
    UnknownColumn {
        role: &'static str,
        table: String,
        column: String,
    },

    #[error("table {table} does not exist or has no columns")]
    TableNotFound { table: String },
}

impl ArchiveError {
    pub fn config(msg: impl Into<String>) -> Self {
        ArchiveError::Configuration(msg.into())
    }

    pub fn query(class: QueryClass, table: impl ToString, source: sqlx::Error) -> Self {
        ArchiveError::Query {
            class,
            table: table.to_string(),
            source,
        }
    }

    // 给配置错误加上出处，其他错误原样返回
    pub fn context(self, context: impl fmt::Display) -> Self {
        match self {
            ArchiveError::Configuration(msg) => {
                ArchiveError::Configuration(format!("{}: {}", context, msg))
            }
            other => other,
        }
    }

    // 语句类型，非查询错误返回None
    pub fn query_class(&self) -> Option<QueryClass> {
        match self {
            ArchiveError::Query { class, .. } => Some(*class),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test_error {
    use super::*;

    #[test]
    fn schema_mismatch_lists_missing_columns() {
        let err = ArchiveError::SchemaMismatch {
            source_table: "ida.audit_log".to_string(),
            archive_table: "archive.audit_log".to_string(),
            missing: vec!["cr_by".to_string(), "upd_by".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "archive table archive.audit_log cannot hold rows of ida.audit_log: missing columns [cr_by, upd_by]"
        );
    }

    #[test]
    fn query_error_keeps_class_and_source() {
        let err = ArchiveError::query(
            QueryClass::Insert,
            "archive.audit_log",
            sqlx::Error::Protocol("boom".to_string()),
        );
        assert_eq!(err.query_class(), Some(QueryClass::Insert));
        assert_eq!(err.to_string(), "insert query failed on archive.audit_log");
        assert!(std::error::Error::source(&err).is_some());
    }
}
