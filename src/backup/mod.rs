//! Backup of configured databases.
//!
//! For every database the sessions are drained, a dump is taken with the
//! designer and uploaded to the configured share. The result of each
//! database is collected in the [Report] of the [Context].

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};

use crate::exec::{ExecError, Runner};
use crate::onec::{self, Cluster, Designer, DumpFiles, Infobase, Rac, RacError};
use crate::report::{Report, ReportLine};
use crate::settings::{BaseConfig, MissingFields, Settings, SettingsError};
use crate::share::{Retention, ShareError, Uploader, DEFAULT_ROOT_PASSWORD};

#[derive(Debug, Display, Error, From)]
pub enum BackupError {
    #[display("Invalid configuration: {_0}")]
    #[from]
    Invalid(MissingFields),
    #[display("{_0}")]
    #[from]
    Settings(SettingsError),
    #[display("{_0}")]
    #[from]
    Rac(RacError),
    #[display("Running the designer failed: {_0}")]
    Designer(ExecError),
    /// The designer didn't produce a dump file.
    #[display("Dump file {} was not created", _0.display())]
    DumpMissing(#[error(ignore)] PathBuf),
    #[display("Upload failed: {_0}")]
    #[from]
    Upload(ShareError),
}

/// Waiting times between the steps of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delays {
    /// Upper bound of the wait for terminated sessions to disappear.
    pub session_drain: Duration,
    /// Interval in which the session list is queried while draining.
    pub poll_interval: Duration,
    /// Pause after the designer exited.
    pub after_dump: Duration,
    /// Pause after unmounting before the mount point is removed.
    pub unmount_settle: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            session_drain: Duration::from_secs(600),
            poll_interval: Duration::from_secs(10),
            after_dump: Duration::from_secs(3),
            unmount_settle: Duration::from_secs(1),
        }
    }
}

impl Delays {
    /// No waiting at all.
    pub fn none() -> Self {
        Self {
            session_drain: Duration::ZERO,
            poll_interval: Duration::ZERO,
            after_dump: Duration::ZERO,
            unmount_settle: Duration::ZERO,
        }
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Result of the backup of one database.
#[derive(Debug)]
pub enum Outcome {
    Success,
    /// The database was not backed up for an expected reason.
    Skip(String),
    Fatal(BackupError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug)]
pub struct BaseReport {
    pub name: String,
    pub description: String,
    /// File name of the dump, empty if none was attempted.
    pub dump_file: String,
    pub outcome: Outcome,
}

impl From<&BaseReport> for ReportLine {
    fn from(report: &BaseReport) -> Self {
        Self {
            name: report.name.clone(),
            description: report.description.clone(),
            file: report.dump_file.clone(),
            success: report.outcome.is_success(),
        }
    }
}

/// State shared by the backups of one run.
#[derive(Debug)]
pub struct Context<R> {
    runner: R,
    delays: Delays,
    work_dir: PathBuf,
    root_password: String,
    report: Report,
}

impl<R: Runner> Context<R> {
    pub fn new(runner: R, work_dir: &Path) -> Self {
        Self {
            runner,
            delays: Delays::default(),
            work_dir: work_dir.to_path_buf(),
            root_password: DEFAULT_ROOT_PASSWORD.to_string(),
            report: Report::default(),
        }
    }

    pub fn with_delays(mut self, delays: Delays) -> Self {
        self.delays = delays;
        self
    }

    pub fn with_root_password(mut self, root_password: &str) -> Self {
        self.root_password = root_password.to_string();
        self
    }

    pub fn delays(&self) -> &Delays {
        &self.delays
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn into_report(self) -> Report {
        self.report
    }

    fn record(&mut self, report: BaseReport) -> BaseReport {
        match &report.outcome {
            Outcome::Success => {
                log::info!(target: "backup", "Backup of {} finished", report.name)
            }
            Outcome::Skip(reason) => {
                log::warn!(target: "backup", "Backup of {} skipped: {reason}", report.name)
            }
            Outcome::Fatal(e) => {
                log::error!(target: "backup", "Backup of {} failed: {e}", report.name)
            }
        }
        self.report.push(ReportLine::from(&report));
        report
    }
}

/// Backs up a single database and records the result in the report.
pub fn backup_database<R: Runner>(ctx: &mut Context<R>, base: &BaseConfig) -> BaseReport {
    let name = base.display_name().to_string();
    log::info!(target: "backup", "Starting backup of {name}");

    let mut dump_file = String::new();
    let outcome = run_pipeline(ctx, base, &mut dump_file);

    ctx.record(BaseReport {
        name,
        description: base.description.clone(),
        dump_file,
        outcome,
    })
}

fn run_pipeline<R: Runner>(ctx: &Context<R>, base: &BaseConfig, dump_file: &mut String) -> Outcome {
    let target = match base.target() {
        Ok(target) => target,
        Err(e) => return Outcome::Fatal(e.into()),
    };
    let credentials = base.credentials();
    let rac = Rac::new(&ctx.runner, target.path_1c, target.host, target.port);

    let (cluster, infobase) = match rac.find_infobase(target.name) {
        Ok(Some(found)) => found,
        Ok(None) => {
            return Outcome::Skip(format!(
                "infobase {} not found on {}:{}",
                target.name, target.host, target.port
            ))
        }
        Err(e) => return Outcome::Fatal(e.into()),
    };

    let jobs_denied = base.scheduled_jobs
        && warn_on_error(
            rac.set_scheduled_jobs_deny(&cluster, &infobase, &credentials, true),
            "Denying scheduled jobs",
        );

    let sessions_denied = warn_on_error(
        rac.set_sessions_deny(&cluster, &infobase, &credentials, true),
        "Denying new sessions",
    );
    drain_sessions(&rac, &cluster, &infobase, &ctx.delays);
    if sessions_denied {
        warn_on_error(
            rac.set_sessions_deny(&cluster, &infobase, &credentials, false),
            "Allowing new sessions",
        );
    }

    match rac.locks(&cluster, &infobase) {
        Ok(locks) if !locks.is_empty() => {
            log::warn!(target: "backup", "Infobase {} still has {} locks", infobase.name, locks.len());
            for lock in &locks {
                log::debug!(target: "backup", "Lock of session {}: {}", lock.session, lock.descr);
            }
        }
        Ok(_) => {}
        Err(e) => log::warn!(target: "backup", "Listing locks failed: {e}"),
    }

    let files = DumpFiles::generate(&ctx.work_dir, target.name, onec::now());
    *dump_file = files.dump_file_name();

    let designer = Designer::new(&ctx.runner, target.path_1c);
    let dumped = designer.dump(target.host, target.name, &credentials, &files);
    pause(ctx.delays.after_dump);

    if jobs_denied {
        warn_on_error(
            rac.set_scheduled_jobs_deny(&cluster, &infobase, &credentials, false),
            "Allowing scheduled jobs",
        );
    }
    files.discard_logs();

    if let Err(e) = dumped {
        return Outcome::Fatal(BackupError::Designer(e));
    }
    if !files.dump.is_file() {
        return Outcome::Fatal(BackupError::DumpMissing(files.dump));
    }

    let retention = base.delete.then(|| Retention {
        name: target.name.to_string(),
        period: base.actual_period(),
        now: onec::now(),
    });
    let uploader = Uploader::new(
        &ctx.runner,
        &ctx.root_password,
        &ctx.work_dir,
        ctx.delays.unmount_settle,
    );
    if let Err(e) = uploader.upload(target.backup, &files.dump, retention.as_ref()) {
        log::warn!(target: "backup", "Keeping local dump {}", files.dump.display());
        return Outcome::Fatal(e.into());
    }

    if let Err(e) = fs::remove_file(&files.dump) {
        log::warn!(target: "backup", "Removing local dump {} failed: {e}", files.dump.display());
    }

    Outcome::Success
}

/// Logs a failed step as warning and returns whether it succeeded.
fn warn_on_error(result: Result<(), RacError>, step: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::warn!(target: "backup", "{step} failed: {e}");
            false
        }
    }
}

/// Terminates all sessions of `infobase` and waits until they are gone.
///
/// The wait ends as soon as no session is left or after
/// [`Delays::session_drain`].
fn drain_sessions<R: Runner>(rac: &Rac<R>, cluster: &Cluster, infobase: &Infobase, delays: &Delays) {
    let sessions = match rac.sessions(cluster, infobase) {
        Ok(sessions) => sessions,
        Err(e) => {
            log::warn!(target: "backup", "Listing sessions of {} failed: {e}", infobase.name);
            return;
        }
    };
    if sessions.is_empty() {
        log::debug!(target: "backup", "No sessions connected to {}", infobase.name);
        return;
    }

    for session in &sessions {
        if let Err(e) = rac.terminate_session(cluster, session) {
            log::warn!(target: "backup", "Terminating session {} failed: {e}", session.number);
        }
    }

    let deadline = Instant::now() + delays.session_drain;
    let interval = if delays.poll_interval.is_zero() {
        delays.session_drain
    } else {
        delays.poll_interval
    };
    loop {
        let now = Instant::now();
        if now >= deadline {
            log::warn!(target: "backup", "Sessions of {} did not drain in time", infobase.name);
            return;
        }
        pause(interval.min(deadline - now));

        match rac.sessions(cluster, infobase) {
            Ok(remaining) if remaining.is_empty() => {
                log::debug!(target: "backup", "All sessions of {} are closed", infobase.name);
                return;
            }
            Ok(remaining) => {
                log::debug!(target: "backup", "Waiting for {} sessions of {}", remaining.len(), infobase.name)
            }
            Err(e) => log::warn!(target: "backup", "Listing sessions of {} failed: {e}", infobase.name),
        }
    }
}

/// Backs up every database listed in the `bases` of the general settings.
pub fn run_settings<R: Runner>(
    ctx: &mut Context<R>,
    settings: &Settings,
) -> Result<Vec<BaseReport>, SettingsError> {
    let general = settings.general()?;
    if general.bases.is_empty() {
        log::warn!(target: "backup", "No databases listed in the settings");
        return Ok(Vec::new());
    }

    let mut reports = Vec::with_capacity(general.bases.len());
    for section in &general.bases {
        let report = match settings.base(section) {
            Ok(base) => backup_database(ctx, &base),
            Err(e) => ctx.record(BaseReport {
                name: section.clone(),
                description: String::new(),
                dump_file: String::new(),
                outcome: Outcome::Fatal(e.into()),
            }),
        };
        reports.push(report);
    }

    Ok(reports)
}

/// Denies (`deny`) or allows again the scheduled jobs of the database.
///
/// Only the server of the database has to be configured, the backup share
/// isn't needed.
pub fn set_scheduled_jobs<R: Runner>(
    runner: R,
    base: &BaseConfig,
    deny: bool,
) -> Result<(), BackupError> {
    let target = base.rac_target()?;
    let rac = Rac::new(runner, target.path_1c, target.host, target.port);

    let Some((cluster, infobase)) = rac.find_infobase(target.name)? else {
        log::warn!(target: "backup", "Infobase {} not found on {}:{}", target.name, target.host, target.port);
        return Ok(());
    };
    rac.set_scheduled_jobs_deny(&cluster, &infobase, &base.credentials(), deny)?;
    log::info!(
        target: "backup",
        "Scheduled jobs of {} {}",
        infobase.name,
        if deny { "denied" } else { "allowed" }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use clap::Parser;

    use super::*;
    use crate::cli::{Action, Cli};
    use crate::exec::{Captured, Invocation};

    const CLUSTERS: &str = "\
cluster : c-1
host    : srv-1c
port    : 1541
name    : \"Main\"
";

    const INFOBASES: &str = "\
infobase : ib-1
name     : Sales
descr    : \"Sales department\"
";

    const SESSIONS: &str = "\
session    : s-1
session-id : 3
infobase   : ib-1
user-name  : clerk
app-id     : 1CV8C
host       : pc-7
";

    /// Scripted 1C server with sessions that close after a number of polls.
    struct FakeServer {
        infobases: &'static str,
        session_polls: Cell<usize>,
        creates_dump: bool,
        mountable: bool,
        calls: RefCell<Vec<Invocation>>,
    }

    impl FakeServer {
        fn new() -> Self {
            Self {
                infobases: INFOBASES,
                session_polls: Cell::new(1),
                creates_dump: true,
                mountable: true,
                calls: RefCell::default(),
            }
        }

        fn rac_calls(&self, command: &str) -> Vec<Invocation> {
            self.calls
                .borrow()
                .iter()
                .filter(|c| c.program_name() == "rac" && c.get_args().first().map(String::as_str) == Some(command))
                .cloned()
                .collect()
        }

        fn called(&self, program: &str) -> bool {
            self.calls
                .borrow()
                .iter()
                .any(|c| c.program_name() == program || c.has_arg(program))
        }
    }

    impl Runner for FakeServer {
        fn run(&self, invocation: &Invocation) -> Result<Captured, ExecError> {
            self.calls.borrow_mut().push(invocation.clone());
            let args = invocation.get_args();
            let captured = match (invocation.program_name(), args.first().map(String::as_str)) {
                ("rac", Some("cluster")) => Captured::ok(CLUSTERS),
                ("rac", Some("infobase")) if args.iter().any(|a| a == "summary") => {
                    Captured::ok(self.infobases)
                }
                ("rac", Some("session")) if args.iter().any(|a| a == "list") => {
                    let polls = self.session_polls.get();
                    if polls == 0 {
                        Captured::ok("")
                    } else {
                        self.session_polls.set(polls - 1);
                        Captured::ok(SESSIONS)
                    }
                }
                ("1cv8", _) => {
                    if self.creates_dump {
                        let dump = args.iter().skip_while(|a| *a != "/DumpIB").nth(1).unwrap();
                        fs::write(dump, b"dump").unwrap();
                    }
                    Captured::ok("")
                }
                ("sudo", _) if invocation.has_arg("mount") && !self.mountable => {
                    Captured::failed(32, "mount failed")
                }
                _ => Captured::ok(""),
            };
            Ok(captured)
        }
    }

    fn base() -> BaseConfig {
        BaseConfig {
            section: "SALES".to_string(),
            host: Some("srv-1c".to_string()),
            port: Some("1545".to_string()),
            name: Some("SALES".to_string()),
            path_1c: Some("/opt/1cv8/x86_64".to_string()),
            backup: Some("nfs://nas:/backup/1c".to_string()),
            description: "Sales department".to_string(),
            ..Default::default()
        }
    }

    fn dumps(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "dt"))
            .collect()
    }

    #[test]
    fn successful_backup_removes_local_dump() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let mut ctx = Context::new(&server, work.path()).with_delays(Delays::none());

        let report = backup_database(&mut ctx, &base());

        assert!(report.outcome.is_success(), "{:?}", report.outcome);
        assert!(report.dump_file.starts_with("SALES-"));
        assert!(report.dump_file.ends_with(".dt"));
        assert!(dumps(work.path()).is_empty());

        let line = &ctx.report().lines()[0];
        assert!(line.success);
        assert_eq!(line.description, "Sales department");

        // session terminated, sessions denied and allowed again
        let sessions = server.rac_calls("session");
        assert!(sessions.iter().any(|c| c.flag_value("--session") == Some("s-1")));
        let updates: Vec<_> = server
            .rac_calls("infobase")
            .into_iter()
            .filter_map(|c| c.flag_value("--sessions-deny").map(str::to_string))
            .collect();
        assert_eq!(updates, vec!["on", "off"]);
        // scheduled jobs untouched
        assert!(!server
            .rac_calls("infobase")
            .iter()
            .any(|c| c.flag_value("--scheduled-jobs-deny").is_some()));
    }

    #[test]
    fn scheduled_jobs_are_denied_and_restored() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let mut ctx = Context::new(&server, work.path()).with_delays(Delays::none());
        let base = BaseConfig {
            scheduled_jobs: true,
            ..base()
        };

        backup_database(&mut ctx, &base);

        let jobs: Vec<_> = server
            .rac_calls("infobase")
            .into_iter()
            .filter_map(|c| c.flag_value("--scheduled-jobs-deny").map(str::to_string))
            .collect();
        assert_eq!(jobs, vec!["on", "off"]);
    }

    #[test]
    fn missing_dump_skips_upload() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer {
            creates_dump: false,
            ..FakeServer::new()
        };
        let mut ctx = Context::new(&server, work.path()).with_delays(Delays::none());

        let report = backup_database(&mut ctx, &base());

        assert!(matches!(
            report.outcome,
            Outcome::Fatal(BackupError::DumpMissing(_))
        ));
        assert!(!ctx.report().lines()[0].success);
        assert!(!server.called("ping"));
        assert!(!server.called("mount"));
    }

    #[test]
    fn failed_mount_keeps_local_dump() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer {
            mountable: false,
            ..FakeServer::new()
        };
        let mut ctx = Context::new(&server, work.path()).with_delays(Delays::none());

        let report = backup_database(&mut ctx, &base());

        assert!(matches!(
            report.outcome,
            Outcome::Fatal(BackupError::Upload(ShareError::Mount(_)))
        ));
        assert_eq!(dumps(work.path()).len(), 1);
    }

    #[test]
    fn unknown_infobase_is_skipped() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let mut ctx = Context::new(&server, work.path()).with_delays(Delays::none());
        let base = BaseConfig {
            name: Some("PAYROLL".to_string()),
            ..base()
        };

        let report = backup_database(&mut ctx, &base);

        assert!(matches!(report.outcome, Outcome::Skip(_)));
        assert_eq!(report.dump_file, "");
        assert!(!server.called("1cv8"));
        assert_eq!(
            ctx.report().body(),
            "PAYROLL (Sales department) Файл <> - НЕТ\n"
        );
    }

    #[test]
    fn invalid_configuration_runs_nothing() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let mut ctx = Context::new(&server, work.path()).with_delays(Delays::none());
        let base = BaseConfig {
            backup: None,
            ..base()
        };

        let report = backup_database(&mut ctx, &base);

        assert!(matches!(report.outcome, Outcome::Fatal(BackupError::Invalid(_))));
        assert!(server.calls.borrow().is_empty());
    }

    #[test]
    fn drain_polls_until_sessions_are_gone() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        server.session_polls.set(3);
        let delays = Delays {
            session_drain: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            ..Delays::none()
        };
        let mut ctx = Context::new(&server, work.path()).with_delays(delays);

        let report = backup_database(&mut ctx, &base());

        assert!(report.outcome.is_success());
        let lists = server
            .rac_calls("session")
            .into_iter()
            .filter(|c| c.has_arg("list"))
            .count();
        assert_eq!(lists, 4);
    }

    #[test]
    fn run_settings_processes_listed_bases() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let mut ctx = Context::new(&server, work.path()).with_delays(Delays::none());
        let settings = Settings::from_ini_str(
            "\
[SETTINGS]
bases = ['SALES', 'MISSING']

[SALES]
host = srv-1c
port = 1545
name = SALES
path_1c = /opt/1cv8/x86_64
backup = nfs://nas:/backup/1c
",
        )
        .unwrap();

        let reports = run_settings(&mut ctx, &settings).unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports[0].outcome.is_success());
        assert!(matches!(
            reports[1].outcome,
            Outcome::Fatal(BackupError::Settings(SettingsError::UnknownSection(_)))
        ));
        assert!(!ctx.report().all_succeeded());
    }

    #[test]
    fn run_settings_without_bases() {
        let work = tempfile::tempdir().unwrap();
        let server = FakeServer::new();
        let mut ctx = Context::new(&server, work.path());

        let reports = run_settings(&mut ctx, &Settings::default()).unwrap();

        assert!(reports.is_empty());
        assert!(ctx.report().is_empty());
    }

    #[test]
    fn toggle_scheduled_jobs() {
        let server = FakeServer::new();
        set_scheduled_jobs(&server, &base(), true).unwrap();
        set_scheduled_jobs(&server, &base(), false).unwrap();

        assert_eq!(scheduled_jobs_deny(&server), vec!["on", "off"]);
    }

    fn scheduled_jobs_deny(server: &FakeServer) -> Vec<String> {
        server
            .rac_calls("infobase")
            .into_iter()
            .filter_map(|c| c.flag_value("--scheduled-jobs-deny").map(str::to_string))
            .collect()
    }

    #[test]
    fn scheduled_jobs_command_line_on_denies_jobs() {
        for (flag, expected) in [("--on", "on"), ("--off", "off")] {
            let cli = Cli::parse_from(["backup-1c", "scheduled-jobs", flag]);
            let Some(Action::ScheduledJobs(args)) = cli.action else {
                panic!("scheduled-jobs not parsed for {flag}");
            };

            let server = FakeServer::new();
            set_scheduled_jobs(&server, &base(), args.deny()).unwrap();
            assert_eq!(scheduled_jobs_deny(&server), vec![expected], "{flag}");
        }
    }

    #[test]
    fn scheduled_jobs_without_backup_share() {
        let server = FakeServer::new();
        let base = BaseConfig {
            backup: None,
            ..base()
        };
        set_scheduled_jobs(&server, &base, true).unwrap();
        assert_eq!(scheduled_jobs_deny(&server), vec!["on"]);

        let cli = Cli::parse_from([
            "backup-1c",
            "--host=srv-1c",
            "--port=1545",
            "--name=Sales",
            "--path-1c=/opt/1cv8/x86_64",
            "--admin=admin",
            "--password=secret",
            "scheduled-jobs",
            "--off",
        ]);
        let explicit = cli.base.explicit_rac().unwrap();
        let server = FakeServer::new();
        set_scheduled_jobs(&server, &explicit, false).unwrap();
        assert_eq!(scheduled_jobs_deny(&server), vec!["off"]);
    }
}
