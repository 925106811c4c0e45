// 拼接归档用到的sql语句
// 表名、列名都加双引号，取值全部通过参数绑定

use crate::handle::store::{ColumnDef, TableRef};

// 按序号列出表的列名和类型
pub const COLUMNS_QUERY: &str = r"
    SELECT a.attname::text AS column_name,
           format_type(a.atttypid, a.atttypmod) AS sql_type
    FROM pg_catalog.pg_attribute a
    JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relname = $2
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
";

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.table))
}

// 有过滤条件时保留天数绑定为$1
pub fn select_eligible(
    table: &TableRef,
    columns: &[ColumnDef],
    order_by: &[String],
    date_column: Option<&str>,
) -> String {
    let projection: Vec<String> = columns
        .iter()
        .map(|c| format!("{}::text", quote_ident(&c.name)))
        .collect();
    let mut sql = format!("SELECT {} FROM {}", projection.join(", "), qualified(table));
    if let Some(date_column) = date_column {
        sql.push_str(&format!(
            " WHERE {} < NOW() - make_interval(days => $1)",
            quote_ident(date_column)
        ));
    }
    if !order_by.is_empty() {
        let keys: Vec<String> = order_by.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
    }
    sql
}

pub fn insert_ignore(table: &TableRef, columns: &[ColumnDef]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let values: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("${}::text::{}", i + 1, c.sql_type))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
        qualified(table),
        names.join(", "),
        values.join(", ")
    )
}

pub fn delete_by_identity(table: &TableRef, keys: &[ColumnDef]) -> String {
    let predicates: Vec<String> = keys
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}::text::{}", quote_ident(&c.name), i + 1, c.sql_type))
        .collect();
    format!(
        "DELETE FROM {} WHERE {}",
        qualified(table),
        predicates.join(" AND ")
    )
}
