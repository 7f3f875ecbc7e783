use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use log::LevelFilter;

use crate::report::MailSettings;
use crate::settings::{BaseConfig, DEFAULT_SETTINGS_FILE};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, disable_version_flag = true, disable_help_flag = true)]
pub struct Cli {
    /// Print help.
    #[arg(short = 'h', long, short_alias = '?', action = ArgAction::Help, global = true)]
    pub help: Option<bool>,

    /// Print version.
    #[arg(short = 'v', long, action = ArgAction::Version)]
    pub version: Option<bool>,

    /// Debug output, same as `--verbose debug`.
    #[arg(short, long)]
    pub debug: bool,

    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Settings file with the databases to back up (`.ini` or `.toml`).
    #[arg(short, long, env = "BACKUP_1C_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: PathBuf,

    /// Interactively edit the databases of the settings file before the backup.
    #[arg(long)]
    pub dlg: bool,

    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub report: ReportArgs,

    /// Directory for dumps and mount points. Defaults to the system temp dir.
    #[arg(long, env = "BACKUP_1C_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Seconds to wait for terminated sessions to close.
    #[arg(long)]
    pub session_drain: Option<u64>,

    /// Seconds to pause after the dump finished.
    #[arg(long)]
    pub after_dump: Option<u64>,

    #[command(subcommand)]
    pub action: Option<Action>,
}

/// A single database given on the command line.
#[derive(Args, Debug, Default)]
pub struct BaseArgs {
    /// Host of the 1C server.
    #[arg(long)]
    pub host: Option<String>,

    /// Port of the ras service.
    #[arg(long)]
    pub port: Option<String>,

    /// Name of the infobase.
    #[arg(long)]
    pub name: Option<String>,

    /// Directory of the 1C platform, e.g. /opt/1cv8/x86_64.
    #[arg(long, alias = "path_1c")]
    pub path_1c: Option<String>,

    /// Share receiving the dump, e.g. nfs://nas:/backup/1c.
    #[arg(long)]
    pub backup: Option<String>,

    /// Remove outdated dumps from the share.
    #[arg(long)]
    pub delete: bool,

    /// Period dumps are kept for, YYYY-MM-DD.
    #[arg(long, alias = "actual_period")]
    pub actual_period: Option<String>,

    /// Infobase administrator.
    #[arg(long)]
    pub admin: Option<String>,

    /// Password of the infobase administrator.
    #[arg(long)]
    pub password: Option<String>,

    /// Deny scheduled jobs during the dump.
    #[arg(long, alias = "scheduled_jobs")]
    pub scheduled_jobs: bool,
}

impl BaseArgs {
    /// The database described by the arguments, if all required ones are given.
    pub fn explicit(&self) -> Option<BaseConfig> {
        self.backup.as_ref()?;
        self.explicit_rac()
    }

    /// Like [explicit](Self::explicit) but without a backup share, enough to
    /// administer the infobase.
    pub fn explicit_rac(&self) -> Option<BaseConfig> {
        let (Some(name), Some(admin), Some(password)) = (&self.name, &self.admin, &self.password) else {
            return None;
        };
        if self.host.is_none() || self.port.is_none() || self.path_1c.is_none() {
            return None;
        }

        Some(BaseConfig {
            section: name.clone(),
            host: self.host.clone(),
            port: self.port.clone(),
            name: Some(name.clone()),
            path_1c: self.path_1c.clone(),
            backup: self.backup.clone(),
            delete: self.delete,
            actual_period: self.actual_period.clone(),
            admin: admin.clone(),
            password: password.clone(),
            scheduled_jobs: self.scheduled_jobs,
            description: String::new(),
        })
    }
}

/// Mailing of the backup report.
#[derive(Args, Debug, Default)]
pub struct ReportArgs {
    /// Send the report. Without it the report settings are read from the settings file.
    #[arg(long, alias = "report_enable")]
    pub report_enable: bool,

    #[arg(long, alias = "report_from")]
    pub report_from: Option<String>,

    /// Receiver of the report, may be repeated.
    #[arg(long, alias = "report_to")]
    pub report_to: Vec<String>,

    /// Subject, `{{ BACKUP_DATE }}` is replaced by the date.
    #[arg(long, alias = "report_subject")]
    pub report_subject: Option<String>,

    #[arg(long, alias = "smtp_server")]
    pub smtp_server: Option<String>,

    #[arg(long, alias = "smtp_server_port")]
    pub smtp_server_port: Option<u16>,

    #[arg(long, alias = "smtp_login")]
    pub smtp_login: Option<String>,

    #[arg(long, alias = "smtp_password", env = "BACKUP_1C_SMTP_PASSWORD", hide_env_values = true)]
    pub smtp_password: Option<String>,
}

impl ReportArgs {
    pub fn mail_settings(&self) -> MailSettings {
        MailSettings {
            enabled: self.report_enable,
            from: self.report_from.clone(),
            to: self.report_to.clone(),
            subject: self.report_subject.clone().unwrap_or_default(),
            server: self.smtp_server.clone(),
            port: self.smtp_server_port,
            login: self.smtp_login.clone(),
            password: self.smtp_password.clone(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Subcommand, Debug, Default)]
pub enum Action {
    /// Backup the configured databases. (Default)
    #[default]
    Backup,
    /// Block or release the scheduled jobs of the configured databases.
    ScheduledJobs(ScheduledJobsArgs),
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct ScheduledJobsArgs {
    /// Turn the block on, scheduled jobs are denied.
    #[arg(long)]
    pub on: bool,

    /// Turn the block off, scheduled jobs run again.
    #[arg(long)]
    pub off: bool,
}

impl ScheduledJobsArgs {
    /// Whether scheduled jobs are to be denied.
    pub fn deny(&self) -> bool {
        self.on
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn explicit_base_needs_all_required_arguments() {
        let cli = Cli::parse_from([
            "backup-1c",
            "--host=srv-1c",
            "--port=1545",
            "--name=SALES",
            "--path_1c=/opt/1cv8/x86_64",
            "--backup=nfs://nas:/backup",
            "--admin=admin",
        ]);
        assert!(cli.base.explicit().is_none());

        let cli = Cli::parse_from([
            "backup-1c",
            "--host=srv-1c",
            "--port=1545",
            "--name=SALES",
            "--path-1c=/opt/1cv8/x86_64",
            "--backup=nfs://nas:/backup",
            "--admin=admin",
            "--password=secret",
            "--scheduled-jobs",
        ]);
        let base = cli.base.explicit().unwrap();
        assert_eq!(base.section, "SALES");
        assert!(base.scheduled_jobs);
        assert_eq!(base.credentials().password, "secret");
    }

    #[test]
    fn scheduled_jobs_base_needs_no_backup_share() {
        let cli = Cli::parse_from([
            "backup-1c",
            "--host=srv-1c",
            "--port=1545",
            "--name=SALES",
            "--path-1c=/opt/1cv8/x86_64",
            "--admin=admin",
            "--password=secret",
            "scheduled-jobs",
            "--on",
        ]);
        assert!(cli.base.explicit().is_none());
        let base = cli.base.explicit_rac().unwrap();
        assert_eq!(base.backup, None);
        assert!(base.rac_target().is_ok());

        let cli = Cli::parse_from(["backup-1c", "--name=SALES", "scheduled-jobs", "--on"]);
        assert!(cli.base.explicit_rac().is_none());
    }

    #[test]
    fn question_mark_prints_help() {
        for flag in ["-?", "-h", "--help"] {
            let err = Cli::try_parse_from(["backup-1c", flag]).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp, "{flag}");
        }
        let err = Cli::try_parse_from(["backup-1c", "scheduled-jobs", "-?"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn scheduled_jobs_requires_a_direction() {
        assert!(Cli::try_parse_from(["backup-1c", "scheduled-jobs"]).is_err());
        assert!(Cli::try_parse_from(["backup-1c", "scheduled-jobs", "--on", "--off"]).is_err());

        let cli = Cli::parse_from(["backup-1c", "scheduled-jobs", "--off"]);
        let Some(Action::ScheduledJobs(args)) = cli.action else {
            panic!("scheduled-jobs not parsed");
        };
        assert!(!args.on && args.off);
        assert!(!args.deny());

        let cli = Cli::parse_from(["backup-1c", "scheduled-jobs", "--on"]);
        assert!(matches!(cli.action, Some(Action::ScheduledJobs(args)) if args.deny()));
    }

    #[test]
    fn repeated_report_receivers() {
        let cli = Cli::parse_from([
            "backup-1c",
            "--report-enable",
            "--report-to=a@example.com",
            "--report-to=b@example.com",
        ]);
        assert!(cli.report.report_enable);
        assert_eq!(cli.report.report_to, vec!["a@example.com", "b@example.com"]);
        assert_eq!(cli.settings, PathBuf::from(DEFAULT_SETTINGS_FILE));
    }
}
