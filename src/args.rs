// 处理命令行参数
pub mod args_handle {
    use std::path::PathBuf;

    use clap::Parser;

    use crate::{model::job::RunSettings, util::logging::LogFormat};

    /// Moves aged rows from source databases into an archive database.
    #[derive(Debug, Parser)]
    #[command(name = "data-archive", version)]
    pub struct ArgsConfig {
        /// Job config file. When it does not exist, everything is read from the environment.
        #[arg(long = "config", env = "ARCHIVE_CONFIG", default_value = "archive-job.toml")]
        pub job_config_path: PathBuf,

        /// Directory holding the `{group}_archive_table_info.json` policy files.
        #[arg(long, env = "ARCHIVE_TABLES_DIR", default_value = ".")]
        pub tables_dir: PathBuf,

        #[arg(long, env = "ARCHIVE_BATCH_SIZE")]
        pub batch_size: Option<usize>,

        #[arg(long, env = "ARCHIVE_PARALLELISM")]
        pub parallelism: Option<usize>,

        /// Skip the remaining tables of a group after one table fails.
        #[arg(long)]
        pub stop_group_on_error: bool,

        /// Exit 0 even when some groups or tables failed.
        #[arg(long)]
        pub lenient_exit: bool,

        /// Count eligible rows without writing anything.
        #[arg(long)]
        pub dry_run: bool,

        #[arg(long, env = "ARCHIVE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
        pub log_format: LogFormat,
    }

    pub trait PrintMe: std::fmt::Debug {
        fn dump(&self);
    }

    impl PrintMe for ArgsConfig {
        fn dump(&self) {
            tracing::debug!(args = ?self, "args config");
        }
    }

    impl ArgsConfig {
        // 命令行参数覆盖配置文件中的设置
        pub fn apply_overrides(&self, mut settings: RunSettings) -> RunSettings {
            if let Some(batch_size) = self.batch_size {
                settings.batch_size = batch_size;
            }
            if let Some(parallelism) = self.parallelism {
                settings.parallelism = parallelism;
            }
            if self.stop_group_on_error {
                settings.continue_on_table_error = false;
            }
            if self.lenient_exit {
                settings.fail_on_error = false;
            }
            if self.dry_run {
                settings.dry_run = true;
            }
            settings
        }
    }
}

#[cfg(test)]
mod test_args {
    use clap::Parser;

    use super::args_handle::ArgsConfig;
    use crate::{model::job::RunSettings, util::logging::LogFormat};

    #[test]
    fn flags_override_settings() {
        let args = ArgsConfig::try_parse_from([
            "data-archive",
            "--config",
            "/etc/archive/job.toml",
            "--batch-size",
            "500",
            "--stop-group-on-error",
            "--lenient-exit",
            "--dry-run",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.job_config_path.to_str(), Some("/etc/archive/job.toml"));
        assert_eq!(args.log_format, LogFormat::Json);

        let settings = args.apply_overrides(RunSettings::default());
        assert_eq!(settings.batch_size, 500);
        assert_eq!(settings.parallelism, 1);
        assert!(!settings.continue_on_table_error);
        assert!(!settings.fail_on_error);
        assert!(settings.dry_run);
    }

    #[test]
    fn no_flags_keep_file_settings() {
        let args = ArgsConfig::try_parse_from(["data-archive", "--tables-dir", "/srv/tables"]).unwrap();
        let file_settings = RunSettings {
            batch_size: 50,
            parallelism: 4,
            ..RunSettings::default()
        };
        assert_eq!(args.apply_overrides(file_settings.clone()), file_settings);
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(ArgsConfig::try_parse_from(["data-archive", "--log-format", "xml"]).is_err());
    }
}
