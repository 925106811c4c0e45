// 载入归档任务配置
// 配置文件为toml格式，节名和键名沿用db.properties的写法（键名不区分大小写）
// 配置文件不存在时，所有参数从环境变量读取

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    error::ArchiveError,
    model::{
        job::{ConnectionInfo, DatabaseGroup, JobConfig, RunSettings},
        policy::{Policy, parse_policies},
    },
};

// 连接参数的键名后缀，前缀为 SOURCE / ARCHIVE
const CONNECTION_KEYS: [&str; 6] = [
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "SCHEMA_NAME",
    "DB_UNAME",
    "DB_PASS",
];

// 读取toml文件并反序列化
pub fn load_job_config<T>(toml_path: &Path) -> Result<T, ArchiveError>
where
    for<'de> T: Deserialize<'de>,
{
    tracing::info!(path = %toml_path.display(), "loading job config");
    let job_str = fs::read_to_string(toml_path).map_err(|e| {
        ArchiveError::config(format!("cannot read {}: {}", toml_path.display(), e))
    })?;
    toml::from_str(&job_str)
        .map_err(|e| ArchiveError::config(format!("invalid {}: {}", toml_path.display(), e)))
}

#[derive(Debug, Deserialize)]
struct JobFile {
    #[serde(default)]
    settings: RunSettings,
    #[serde(flatten)]
    sections: HashMap<String, toml::Value>,
}

impl JobFile {
    fn section(&self, name: &str) -> Option<Section> {
        self.sections
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| Section::from_value(value))
    }
}

// 配置文件中的一个节，键名统一转为大写
#[derive(Debug, Default)]
struct Section {
    values: HashMap<String, String>,
    archive: Option<Box<Section>>,
}

impl Section {
    fn from_value(value: &toml::Value) -> Section {
        let mut section = Section::default();
        if let toml::Value::Table(table) = value {
            for (key, value) in table {
                match value {
                    toml::Value::Table(_) if key.eq_ignore_ascii_case("archive") => {
                        section.archive = Some(Box::new(Section::from_value(value)));
                    }
                    toml::Value::Table(_) => {}
                    other => {
                        if let Some(text) = scalar(other) {
                            section.values.insert(key.to_ascii_uppercase(), text);
                        }
                    }
                }
            }
        }
        section
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(&key.to_ascii_uppercase()).cloned()
    }
}

fn scalar(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(scalar)
                .collect::<Vec<_>>()
                .join(","),
        ),
        toml::Value::Table(_) => None,
    }
}

// 校验过程中收集的所有问题，最后一次性报错
#[derive(Debug, Default)]
struct Problems {
    missing: Vec<String>,
    invalid: Vec<String>,
    other: Vec<String>,
}

impl Problems {
    fn merge(&mut self, other: Problems) {
        self.missing.extend(other.missing);
        self.invalid.extend(other.invalid);
        self.other.extend(other.other);
    }

    fn check(self) -> Result<(), ArchiveError> {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing keys: {}", self.missing.join(", ")));
        }
        if !self.invalid.is_empty() {
            parts.push(format!("invalid values: {}", self.invalid.join(", ")));
        }
        parts.extend(self.other);
        if parts.is_empty() {
            Ok(())
        } else {
            Err(ArchiveError::Configuration(parts.join("; ")))
        }
    }
}

fn connection_info(
    role: &str,
    label: &str,
    lookup: impl Fn(&str) -> Option<String>,
    problems: &mut Problems,
) -> Option<ConnectionInfo> {
    let mut take = |suffix: &str| {
        let key = format!("{}_{}", role, suffix);
        // 密码允许为空
        let value = lookup(&key).filter(|v| suffix == "DB_PASS" || !v.trim().is_empty());
        if value.is_none() {
            problems.missing.push(format!("{}{}", label, key));
        }
        value
    };
    let host = take(CONNECTION_KEYS[0]);
    let port = take(CONNECTION_KEYS[1]);
    let database = take(CONNECTION_KEYS[2]);
    let schema = take(CONNECTION_KEYS[3]);
    let user = take(CONNECTION_KEYS[4]);
    let password = take(CONNECTION_KEYS[5]);

    let port = port.and_then(|p| match p.trim().parse::<u16>() {
        Ok(port) => Some(port),
        Err(_) => {
            problems
                .invalid
                .push(format!("{}{}_DB_PORT='{}' is not a port number", label, role, p));
            None
        }
    });

    Some(ConnectionInfo {
        host: host?.trim().to_string(),
        port: port?,
        database: database?.trim().to_string(),
        schema: schema?.trim().to_string(),
        user: user?.trim().to_string(),
        password: password?,
    })
}

fn split_names(raw: Option<String>) -> Result<Vec<String>, ArchiveError> {
    let raw = raw.ok_or_else(|| ArchiveError::config("DB_NAMES not found"))?;
    let names: Vec<String> = raw
        .split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        return Err(ArchiveError::config("DB_NAMES does not name any database"));
    }
    Ok(names)
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// 从配置文件或环境变量得到JobConfig，env为环境变量查找函数
pub struct JobLoader<F> {
    env: F,
    tables_dir: PathBuf,
}

impl JobLoader<fn(&str) -> Option<String>> {
    pub fn from_process_env(tables_dir: impl Into<PathBuf>) -> Self {
        JobLoader::new(process_env as fn(&str) -> Option<String>, tables_dir)
    }
}

impl<F: Fn(&str) -> Option<String>> JobLoader<F> {
    pub fn new(env: F, tables_dir: impl Into<PathBuf>) -> Self {
        JobLoader {
            env,
            tables_dir: tables_dir.into(),
        }
    }

    // 配置文件存在时优先使用配置文件
    pub fn load(&self, config_path: &Path) -> Result<JobConfig, ArchiveError> {
        if config_path.exists() {
            tracing::info!(
                path = %config_path.display(),
                "using database connection parameters from config file"
            );
            self.load_file(config_path)
        } else {
            tracing::warn!(
                path = %config_path.display(),
                "config file not found, using environment variables"
            );
            self.load_env()
        }
    }

    // 按组名查找环境变量，先原样再大写
    fn group_env(&self, group: &str, key: &str) -> Option<String> {
        (self.env)(&format!("{}_{}", group, key))
            .or_else(|| (self.env)(&format!("{}_{}", group.to_ascii_uppercase(), key)))
    }

    fn load_file(&self, path: &Path) -> Result<JobConfig, ArchiveError> {
        let file: JobFile = load_job_config(path)?;
        let archive_section = file.section("ARCHIVE").ok_or_else(|| {
            ArchiveError::config(format!("section [ARCHIVE] not found in {}", path.display()))
        })?;
        let databases = file.section("Databases").ok_or_else(|| {
            ArchiveError::config(format!("section [Databases] not found in {}", path.display()))
        })?;
        let names = split_names(databases.get("DB_NAMES"))?;

        let mut problems = Problems::default();
        let mut shared_problems = Problems::default();
        let shared = connection_info("ARCHIVE", "", |k| archive_section.get(k), &mut shared_problems);
        let mut needs_shared = false;
        let mut groups = Vec::with_capacity(names.len());

        for name in &names {
            let Some(section) = file.section(name) else {
                problems
                    .other
                    .push(format!("section [{}] not found in {}", name, path.display()));
                continue;
            };
            // 环境变量优先于配置文件
            let source = connection_info(
                "SOURCE",
                &format!("{}_", name),
                |k| {
                    self.group_env(name, k)
                        .or_else(|| section.get(k))
                        .or_else(|| section.get(&format!("{}_{}", name, k)))
                },
                &mut problems,
            );
            let archive = match &section.archive {
                Some(own) => connection_info(
                    "ARCHIVE",
                    &format!("[{}.archive] ", name),
                    |k| own.get(k),
                    &mut problems,
                ),
                None => {
                    needs_shared = true;
                    shared.clone()
                }
            };
            let policies = self.collect_policies(name, &mut problems);
            if let (Some(source), Some(archive), Some(policies)) = (source, archive, policies) {
                groups.push(DatabaseGroup {
                    name: name.clone(),
                    source,
                    archive,
                    policies,
                });
            }
        }

        if needs_shared {
            problems.merge(shared_problems);
        }
        problems.check()?;
        JobConfig::new(groups, file.settings)
    }

    fn load_env(&self) -> Result<JobConfig, ArchiveError> {
        let names = split_names((self.env)("DB_NAMES"))
            .map_err(|e| e.context("environment"))?;

        let mut problems = Problems::default();
        let mut shared_problems = Problems::default();
        let shared = connection_info("ARCHIVE", "", |k| (self.env)(k), &mut shared_problems);
        let mut needs_shared = false;
        let mut groups = Vec::with_capacity(names.len());

        for name in &names {
            let prefix = format!("{}_", name);
            let source = connection_info(
                "SOURCE",
                &prefix,
                |k| self.group_env(name, k),
                &mut problems,
            );
            // 任一 {GROUP}_ARCHIVE_* 存在时，该组使用单独的归档库
            let has_own_archive = CONNECTION_KEYS
                .iter()
                .any(|suffix| self.group_env(name, &format!("ARCHIVE_{}", suffix)).is_some());
            let archive = if has_own_archive {
                connection_info(
                    "ARCHIVE",
                    &prefix,
                    |k| self.group_env(name, k),
                    &mut problems,
                )
            } else {
                needs_shared = true;
                shared.clone()
            };
            let policies = self.collect_policies(name, &mut problems);
            if let (Some(source), Some(archive), Some(policies)) = (source, archive, policies) {
                groups.push(DatabaseGroup {
                    name: name.clone(),
                    source,
                    archive,
                    policies,
                });
            }
        }

        if needs_shared {
            problems.merge(shared_problems);
        }
        problems.check()?;
        JobConfig::new(groups, RunSettings::default())
    }

    fn collect_policies(&self, group: &str, problems: &mut Problems) -> Option<Vec<Policy>> {
        match self.policies_for(group) {
            Ok(policies) => Some(policies),
            Err(ArchiveError::Configuration(msg)) => {
                problems.other.push(msg);
                None
            }
            Err(e) => {
                problems.other.push(e.to_string());
                None
            }
        }
    }

    // 依次查找 {tables_dir}/{group}_archive_table_info.json、
    // $CONTAINER_VOLUME_PATH/{group}_archive_table_info、环境变量 {GROUP}_ARCHIVE_TABLE_INFO
    pub fn policies_for(&self, group: &str) -> Result<Vec<Policy>, ArchiveError> {
        let lower = group.to_lowercase();
        let file_path = self
            .tables_dir
            .join(format!("{}_archive_table_info.json", lower));
        if file_path.exists() {
            tracing::info!(path = %file_path.display(), "table policy file found");
            return read_policy_file(&file_path);
        }
        tracing::debug!(path = %file_path.display(), "table policy file not found");

        if let Some(volume) = (self.env)("CONTAINER_VOLUME_PATH") {
            let volume_path = Path::new(&volume).join(format!("{}_archive_table_info", lower));
            if volume_path.exists() {
                tracing::info!(path = %volume_path.display(), "table policies read from container volume");
                return read_policy_file(&volume_path);
            }
            tracing::debug!(path = %volume_path.display(), "table policies not in container volume");
        }

        if let Some(json) = self.group_env(group, "ARCHIVE_TABLE_INFO") {
            tracing::info!(group, "table policies read from environment");
            return parse_policies(&json)
                .map_err(|e| e.context(format!("{}_ARCHIVE_TABLE_INFO", group)));
        }

        Err(ArchiveError::config(format!(
            "no table policies for database group {}: {} not found, CONTAINER_VOLUME_PATH has no {}_archive_table_info and {}_ARCHIVE_TABLE_INFO is not set",
            group,
            file_path.display(),
            lower,
            group
        )))
    }
}

fn read_policy_file(path: &Path) -> Result<Vec<Policy>, ArchiveError> {
    let json = fs::read_to_string(path)
        .map_err(|e| ArchiveError::config(format!("cannot read {}: {}", path.display(), e)))?;
    parse_policies(&json).map_err(|e| e.context(path.display()))
}
