use std::env;
use std::io;
use std::time::Duration;

use backup_1c_lib::backup::{self, Context, Delays};
use backup_1c_lib::cli::{Action, Cli};
use backup_1c_lib::dialog::Dialog;
use backup_1c_lib::exec::SystemRunner;
use backup_1c_lib::report::MailSettings;
use backup_1c_lib::settings::{BaseConfig, GeneralSettings, Settings};

use chrono::Local;
use clap::Parser;
use log::LevelFilter;

fn main() {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    } else if cli.debug {
        env_logger.filter_level(LevelFilter::Debug);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let mut settings = if cli.settings.exists() {
        match Settings::load(&cli.settings) {
            Ok(settings) => settings,
            Err(e) => {
                log::error!(target: "settings", "Reading the settings file failed: {e}");
                return;
            }
        }
    } else {
        log::debug!(target: "settings", "Settings file {} doesn't exist", cli.settings.display());
        Settings::default()
    };
    let general = settings.general().unwrap_or_else(|e| {
        log::warn!(target: "settings", "Ignoring general settings: {e}");
        GeneralSettings::default()
    });

    let work_dir = cli
        .work_dir
        .clone()
        .or_else(|| general.work_dir.clone().map(Into::into))
        .unwrap_or_else(env::temp_dir);
    let defaults = Delays::default();
    let delays = Delays {
        session_drain: cli
            .session_drain
            .or(general.session_drain)
            .map_or(defaults.session_drain, Duration::from_secs),
        after_dump: cli
            .after_dump
            .or(general.after_dump)
            .map_or(defaults.after_dump, Duration::from_secs),
        ..defaults
    };

    if let Some(Action::ScheduledJobs(args)) = &cli.action {
        let bases = match cli.base.explicit_rac() {
            Some(base) => vec![base],
            None => configured_bases(&settings, &general),
        };
        for base in &bases {
            if let Err(e) = backup::set_scheduled_jobs(SystemRunner, base, args.deny()) {
                log::error!(target: "backup", "Switching scheduled jobs of {} failed: {e}", base.display_name());
            }
        }
        return;
    }

    let mut ctx = Context::new(SystemRunner, &work_dir).with_delays(delays);
    if let Some(root_password) = &general.root_password {
        ctx = ctx.with_root_password(root_password);
    }

    if let Some(base) = cli.base.explicit() {
        backup::backup_database(&mut ctx, &base);
    } else if cli.dlg {
        let mut dialog = Dialog::new(io::stdin().lock(), io::stdout());
        match dialog.run(&mut settings, &cli.settings) {
            Ok(bases) => {
                for base in &bases {
                    backup::backup_database(&mut ctx, base);
                }
            }
            Err(e) => log::error!(target: "dialog", "Editing the settings failed: {e}"),
        }
    } else if let Err(e) = backup::run_settings(&mut ctx, &settings) {
        log::error!(target: "backup", "Reading the databases failed: {e}");
    }

    let mail = if cli.report.report_enable {
        cli.report.mail_settings()
    } else {
        MailSettings::from_general(&general)
    };
    let report = ctx.into_report();
    if !mail.enabled {
        log::debug!(target: "report", "Sending the report is disabled");
    } else if report.is_empty() {
        log::info!(target: "report", "Nothing backed up, no report sent");
    } else if let Err(e) = mail.send(&report.body(), Local::now().date_naive()) {
        log::error!(target: "report", "{e}");
    }
}

/// Databases listed in the general settings, invalid sections are skipped.
fn configured_bases(settings: &Settings, general: &GeneralSettings) -> Vec<BaseConfig> {
    general
        .bases
        .iter()
        .filter_map(|section| {
            settings
                .base(section)
                .inspect_err(|e| log::error!(target: "settings", "{e}"))
                .ok()
        })
        .collect()
}
