// 行搬运与具体数据库之间的接口
// 取值统一用PostgreSQL的文本形式（None表示NULL），插入时再转换回列的类型

use std::fmt;

use async_trait::async_trait;

use crate::{error::ArchiveError, model::policy::AgeFilter};

// schema限定的表名
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        TableRef {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

// 列名及其类型（format_type的输出）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

// 一行数据，顺序与select的列顺序一致
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row(Vec<Option<String>>);

// 用于定位一行的id列取值
pub type Identity = Vec<Option<String>>;

impl Row {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Row(values)
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // 输出成 (1, 'alice', NULL) 的形式，只用于日志
    pub fn display_values(&self) -> String {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|value| match value {
                None => "NULL".to_string(),
                Some(v) if is_plain_number(v) => v.clone(),
                Some(v) => format!("'{}'", v.replace('\'', "''")),
            })
            .collect();
        format!("({})", rendered.join(", "))
    }
}

fn is_plain_number(v: &str) -> bool {
    let digits = v.strip_prefix('-').unwrap_or(v);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

// 源库：查询和删除
#[async_trait]
pub trait SourceStore: Send {
    // 按序号返回列，表不存在时为空
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDef>, ArchiveError>;

    // 没有过滤条件时返回所有行
    async fn select_eligible(
        &mut self,
        table: &TableRef,
        columns: &[ColumnDef],
        order_by: &[String],
        filter: Option<&AgeFilter>,
    ) -> Result<Vec<Row>, ArchiveError>;

    // 在一个事务中逐个删除，返回每条语句影响的行数
    async fn delete_rows(
        &mut self,
        table: &TableRef,
        keys: &[ColumnDef],
        identities: &[Identity],
    ) -> Result<Vec<u64>, ArchiveError>;

    async fn close(self);
}

// 归档库：插入时跳过已存在的行
#[async_trait]
pub trait ArchiveStore: Send {
    async fn columns(&mut self, table: &TableRef) -> Result<Vec<ColumnDef>, ArchiveError>;

    // ON CONFLICT DO NOTHING，影响行数为0表示已归档过
    async fn insert_rows(
        &mut self,
        table: &TableRef,
        columns: &[ColumnDef],
        rows: &[Row],
    ) -> Result<Vec<u64>, ArchiveError>;

    async fn close(self);
}

#[cfg(test)]
mod test_store {
    use super::*;

    #[test]
    fn display_values_keeps_order_and_nulls() {
        let row = Row::new(vec![Some("1".to_string()), Some("alice".to_string()), None]);
        assert_eq!(row.display_values(), "(1, 'alice', NULL)");
    }

    #[test]
    fn display_values_escapes_quotes() {
        let row = Row::new(vec![Some("o'brien".to_string()), Some("-7".to_string())]);
        assert_eq!(row.display_values(), "('o''brien', -7)");
    }

    #[test]
    fn table_ref_display() {
        assert_eq!(TableRef::new("ida", "audit_log").to_string(), "ida.audit_log");
    }
}
