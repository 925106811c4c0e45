// 单表归档策略

use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::error::ArchiveError;

// 表的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Delete,
    ArchiveThenDelete,
    ArchiveNoDelete,
    None,
}

impl Operation {
    pub fn archives(self) -> bool {
        matches!(self, Operation::ArchiveThenDelete | Operation::ArchiveNoDelete)
    }

    pub fn deletes(self) -> bool {
        matches!(self, Operation::Delete | Operation::ArchiveThenDelete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Delete => "delete",
            Operation::ArchiveThenDelete => "archive_then_delete",
            Operation::ArchiveNoDelete => "archive_no_delete",
            Operation::None => "none",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(Operation::Delete),
            "archive_then_delete" | "archive_delete" => Ok(Operation::ArchiveThenDelete),
            "archive_no_delete" | "archive_nodelete" => Ok(Operation::ArchiveNoDelete),
            "none" => Ok(Operation::None),
            other => Err(ArchiveError::config(format!(
                "invalid operation_type '{}', use 'delete', 'archive_delete', 'archive_nodelete' or 'none'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeFilter {
    pub date_column: String,
    pub retention_days: i32,
}

// 单表策略，没有age_filter时表中所有行都会处理
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub source_table: String,
    pub archive_table: String,
    pub id_columns: Vec<String>,
    pub operation: Operation,
    pub age_filter: Option<AgeFilter>,
}

// json中的保留天数，可以是数字或者 "90d" 这样的字符串
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RetentionValue {
    Days(i64),
    Text(String),
}

impl RetentionValue {
    fn days(&self, table: &str) -> Result<i32, ArchiveError> {
        let days = match self {
            RetentionValue::Days(n) => *n,
            RetentionValue::Text(s) => {
                let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    return Err(ArchiveError::config(format!(
                        "retention '{}' for table {} has no digits",
                        s, table
                    )));
                }
                digits.parse::<i64>().map_err(|_| {
                    ArchiveError::config(format!("retention '{}' for table {} is too large", s, table))
                })?
            }
        };
        i32::try_from(days)
            .ok()
            .filter(|d| *d >= 0)
            .ok_or_else(|| {
                ArchiveError::config(format!(
                    "retention of {} days for table {} is out of range",
                    days, table
                ))
            })
    }
}

// 策略描述文件中的一条记录
#[derive(Debug, Clone, Deserialize)]
pub struct TableDescriptor {
    pub source_table: String,
    #[serde(default)]
    pub archive_table: Option<String>,
    #[serde(default)]
    pub id_column: Option<String>,
    #[serde(default)]
    pub date_column: Option<String>,
    #[serde(default, alias = "older_than_days")]
    pub retention_days: Option<RetentionValue>,
    #[serde(default)]
    pub operation_type: Option<String>,
}

impl TryFrom<TableDescriptor> for Policy {
    type Error = ArchiveError;

    fn try_from(desc: TableDescriptor) -> Result<Self, Self::Error> {
        let source_table = identifier("source_table", &desc.source_table)?;
        let archive_table = match desc.archive_table.as_deref() {
            Some(name) if !name.trim().is_empty() => identifier("archive_table", name)?,
            _ => source_table.clone(),
        };

        // 未配置时默认不处理
        let operation = match desc.operation_type.as_deref() {
            Some(op) => op
                .parse::<Operation>()
                .map_err(|e| e.context(format!("table {}", source_table)))?,
            None => Operation::None,
        };

        let mut id_columns = Vec::new();
        if let Some(raw) = desc.id_column.as_deref() {
            for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
                id_columns.push(identifier("id_column", part)?);
            }
        }
        if id_columns.is_empty() && operation.deletes() {
            return Err(ArchiveError::config(format!(
                "table {} uses operation '{}' but has no id_column",
                source_table, operation
            )));
        }

        // date_column和retention_days缺一个时视为不过滤
        let date_column = desc
            .date_column
            .as_deref()
            .filter(|c| !c.trim().is_empty());
        let age_filter = match (date_column, desc.retention_days.as_ref()) {
            (Some(column), Some(retention)) => Some(AgeFilter {
                date_column: identifier("date_column", column)?,
                retention_days: retention.days(&source_table)?,
            }),
            _ => None,
        };

        Ok(Policy {
            source_table,
            archive_table,
            id_columns,
            operation,
            age_filter,
        })
    }
}

// 校验表名/列名，拼接sql时会加双引号
fn identifier(field: &str, raw: &str) -> Result<String, ArchiveError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ArchiveError::config(format!("{} must not be empty", field)));
    }
    if name.contains('"') || name.contains('\0') {
        return Err(ArchiveError::config(format!(
            "{} '{}' contains a forbidden character",
            field, name
        )));
    }
    Ok(name.to_string())
}

// 解析策略描述，支持 {"tables_info": [...]} 和直接的数组
pub fn parse_policies(json: &str) -> Result<Vec<Policy>, ArchiveError> {
    let document: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ArchiveError::config(format!("malformed policy descriptor: {}", e)))?;
    let records = match document {
        serde_json::Value::Object(mut map) => map.remove("tables_info").ok_or_else(|| {
            ArchiveError::config("policy descriptor has no 'tables_info' list")
        })?,
        list @ serde_json::Value::Array(_) => list,
        _ => {
            return Err(ArchiveError::config(
                "policy descriptor must be an object or an array",
            ));
        }
    };
    let descriptors: Vec<TableDescriptor> = serde_json::from_value(records)
        .map_err(|e| ArchiveError::config(format!("malformed table record: {}", e)))?;
    descriptors.into_iter().map(Policy::try_from).collect()
}

#[cfg(test)]
mod test_policy {
    use super::*;

    fn parse_one(json: &str) -> Result<Policy, ArchiveError> {
        let desc: TableDescriptor = serde_json::from_str(json).expect("valid record");
        Policy::try_from(desc)
    }

    #[test]
    fn parses_full_record() {
        let policy = parse_one(
            r#"{"source_table": "audit_log", "archive_table": "audit_log_arc",
                "id_column": "id", "date_column": "cr_dtimes", "retention_days": 90,
                "operation_type": "archive_delete"}"#,
        )
        .unwrap();
        assert_eq!(policy.source_table, "audit_log");
        assert_eq!(policy.archive_table, "audit_log_arc");
        assert_eq!(policy.id_columns, vec!["id".to_string()]);
        assert_eq!(policy.operation, Operation::ArchiveThenDelete);
        assert_eq!(
            policy.age_filter,
            Some(AgeFilter {
                date_column: "cr_dtimes".to_string(),
                retention_days: 90
            })
        );
    }

    #[test]
    fn operation_spellings() {
        for (raw, op) in [
            ("delete", Operation::Delete),
            ("ARCHIVE_DELETE", Operation::ArchiveThenDelete),
            ("archive_then_delete", Operation::ArchiveThenDelete),
            ("archive_nodelete", Operation::ArchiveNoDelete),
            ("Archive_No_Delete", Operation::ArchiveNoDelete),
            ("none", Operation::None),
        ] {
            assert_eq!(raw.parse::<Operation>().unwrap(), op, "{}", raw);
        }
        assert!(matches!(
            "purge".parse::<Operation>(),
            Err(ArchiveError::Configuration(_))
        ));
    }

    #[test]
    fn missing_operation_defaults_to_none() {
        let policy = parse_one(r#"{"source_table": "t", "archive_table": "t"}"#).unwrap();
        assert_eq!(policy.operation, Operation::None);
        assert!(policy.id_columns.is_empty());
    }

    #[test]
    fn half_age_filter_means_no_filter() {
        let only_date = parse_one(
            r#"{"source_table": "t", "id_column": "id", "date_column": "cr_dtimes",
                "operation_type": "delete"}"#,
        )
        .unwrap();
        assert_eq!(only_date.age_filter, None);

        let only_days = parse_one(
            r#"{"source_table": "t", "id_column": "id", "retention_days": 30,
                "operation_type": "delete"}"#,
        )
        .unwrap();
        assert_eq!(only_days.age_filter, None);
    }

    #[test]
    fn older_than_days_alias_and_text_retention() {
        let policy = parse_one(
            r#"{"source_table": "t", "id_column": "id", "date_column": "cr_dtimes",
                "older_than_days": "180d", "operation_type": "archive_nodelete"}"#,
        )
        .unwrap();
        assert_eq!(policy.age_filter.unwrap().retention_days, 180);
    }

    #[test]
    fn deleting_without_id_column_is_rejected() {
        let err = parse_one(r#"{"source_table": "t", "operation_type": "delete"}"#).unwrap_err();
        assert!(err.to_string().contains("no id_column"));

        // 只归档不删除时可以不配置id
        let policy =
            parse_one(r#"{"source_table": "t", "operation_type": "archive_nodelete"}"#).unwrap();
        assert!(policy.id_columns.is_empty());
    }

    #[test]
    fn composite_id_column() {
        let policy = parse_one(
            r#"{"source_table": "t", "id_column": "reg_id, seq", "operation_type": "delete"}"#,
        )
        .unwrap();
        assert_eq!(policy.id_columns, vec!["reg_id".to_string(), "seq".to_string()]);
    }

    #[test]
    fn archive_table_defaults_to_source_table() {
        let policy = parse_one(r#"{"source_table": "otp_transaction", "id_column": "id"}"#).unwrap();
        assert_eq!(policy.archive_table, "otp_transaction");
    }

    #[test]
    fn rejects_quoted_identifiers_and_bad_retention() {
        assert!(parse_one(r#"{"source_table": "t\"; drop table x; --"}"#).is_err());
        assert!(
            parse_one(
                r#"{"source_table": "t", "id_column": "id", "date_column": "d",
                    "retention_days": "forever", "operation_type": "delete"}"#
            )
            .is_err()
        );
        assert!(
            parse_one(
                r#"{"source_table": "t", "id_column": "id", "date_column": "d",
                    "retention_days": -3, "operation_type": "delete"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn document_forms() {
        let wrapped = parse_policies(
            r#"{"tables_info": [{"source_table": "a", "id_column": "id", "operation_type": "delete"},
                                {"source_table": "b"}]}"#,
        )
        .unwrap();
        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped[1].source_table, "b");

        let bare = parse_policies(r#"[{"source_table": "a"}]"#).unwrap();
        assert_eq!(bare.len(), 1);

        assert!(parse_policies(r#"{"tables": []}"#).is_err());
        assert!(parse_policies("not json").is_err());
        assert!(parse_policies(r#"[{"archive_table": "a"}]"#).is_err());
    }
}
