// 归档任务配置

use std::{collections::HashSet, fmt};

use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::{error::ArchiveError, model::policy::Policy};

// 数据库连接信息
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub schema: String,
    pub user: String,
    pub password: String,
}

// 不打印密码
impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

// 一个源库及其归档库
#[derive(Debug, Clone)]
pub struct DatabaseGroup {
    pub name: String,
    pub source: ConnectionInfo,
    pub archive: ConnectionInfo,
    pub policies: Vec<Policy>,
}

// 运行参数，不影响归档哪些数据
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunSettings {
    // 每个事务提交的行数，1表示逐行提交
    pub batch_size: usize,
    // 同时处理的数据库组数量
    pub parallelism: usize,
    pub continue_on_table_error: bool,
    // 有失败时以非0退出
    pub fail_on_error: bool,
    pub dry_run: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            parallelism: 1,
            continue_on_table_error: true,
            fail_on_error: true,
            dry_run: false,
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.batch_size == 0 {
            return Err(ArchiveError::config("batch_size must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(ArchiveError::config("parallelism must be at least 1"));
        }
        // 超过信号量上限时Semaphore::new会panic
        if self.parallelism > Semaphore::MAX_PERMITS {
            return Err(ArchiveError::config(format!(
                "parallelism must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub groups: Vec<DatabaseGroup>,
    pub settings: RunSettings,
}

impl JobConfig {
    pub fn new(groups: Vec<DatabaseGroup>, settings: RunSettings) -> Result<Self, ArchiveError> {
        settings.validate()?;
        let mut seen = HashSet::new();
        for group in &groups {
            if !seen.insert(group.name.as_str()) {
                return Err(ArchiveError::config(format!(
                    "database group '{}' is configured twice",
                    group.name
                )));
            }
        }
        Ok(JobConfig { groups, settings })
    }

    pub fn policy_count(&self) -> usize {
        self.groups.iter().map(|g| g.policies.len()).sum()
    }
}

#[cfg(test)]
mod test_job {
    use super::*;

    fn conn(host: &str) -> ConnectionInfo {
        ConnectionInfo {
            host: host.to_string(),
            port: 5432,
            database: "mosip_ida".to_string(),
            schema: "ida".to_string(),
            user: "sysadmin".to_string(),
            password: "hunter2".to_string(),
        }
    }

    fn group(name: &str) -> DatabaseGroup {
        DatabaseGroup {
            name: name.to_string(),
            source: conn("ida-db"),
            archive: conn("archive-db"),
            policies: Vec::new(),
        }
    }

    #[test]
    fn debug_hides_password() {
        let printed = format!("{:?}", conn("ida-db"));
        assert!(printed.contains("ida-db"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let err = JobConfig::new(vec![group("IDA"), group("IDA")], RunSettings::default())
            .unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let settings = RunSettings {
            batch_size: 0,
            ..RunSettings::default()
        };
        assert!(JobConfig::new(vec![group("IDA")], settings).is_err());
    }

    #[test]
    fn oversized_parallelism_is_rejected() {
        let settings = RunSettings {
            parallelism: usize::MAX,
            ..RunSettings::default()
        };
        let err = JobConfig::new(vec![group("IDA")], settings).unwrap_err();
        assert!(matches!(err, ArchiveError::Configuration(_)));
        assert!(err.to_string().contains("parallelism must be at most"));

        let settings = RunSettings {
            parallelism: Semaphore::MAX_PERMITS,
            ..RunSettings::default()
        };
        assert!(JobConfig::new(vec![group("IDA")], settings).is_ok());
    }

    #[test]
    fn settings_default_from_empty_toml() {
        let settings: RunSettings = toml::from_str("").unwrap();
        assert_eq!(settings, RunSettings::default());
        let settings: RunSettings = toml::from_str("batch_size = 50\ndry_run = true").unwrap();
        assert_eq!(settings.batch_size, 50);
        assert!(settings.dry_run);
        assert!(settings.fail_on_error);
    }
}
