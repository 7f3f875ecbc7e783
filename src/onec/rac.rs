use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use super::records::{Cluster, Infobase, Lock, Session};
use super::Credentials;
use crate::exec::{ExecError, Invocation, Runner};

const RAC_BINARY: &str = "rac";

#[derive(Debug, Display, Error, From)]
pub enum RacError {
    /// The `rac` utility couldn't be run or reported a failure.
    #[display("rac command failed: {_0}")]
    Exec(ExecError),
}

/// Interaction with the 1C remote administration service using the
/// [`rac` command](https://its.1c.ru/db/v8320doc#bookmark:adm:TI000000545).
///
/// The `ras` service has to be running on the administered server:
/// `ras cluster --daemon --port=1545`.
#[derive(Debug, Clone)]
pub struct Rac<R> {
    runner: R,
    /// Path to the rac executable.
    rac: PathBuf,
    /// `host:port` of the ras service.
    server: String,
}

impl<R: Runner> Rac<R> {
    pub fn new(runner: R, path_1c: &Path, host: &str, port: &str) -> Self {
        Self {
            runner,
            rac: path_1c.join(RAC_BINARY),
            server: format!("{host}:{port}"),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.rac
    }

    fn invocation(&self) -> Invocation {
        Invocation::new(&self.rac)
    }

    fn execute(&self, invocation: Invocation) -> Result<String, RacError> {
        let invocation = invocation.arg(&self.server);
        let output = self.runner.run_checked(&invocation)?;
        Ok(output.stdout)
    }

    pub fn clusters(&self) -> Result<Vec<Cluster>, RacError> {
        let stdout = self.execute(self.invocation().args(["cluster", "list"]))?;
        Ok(Cluster::parse_list(&stdout))
    }

    pub fn infobases(&self, cluster: &Cluster) -> Result<Vec<Infobase>, RacError> {
        let stdout = self.execute(
            self.invocation()
                .arg("infobase")
                .arg(format!("--cluster={}", cluster.id))
                .args(["summary", "list"]),
        )?;
        Ok(Infobase::parse_list(&stdout))
    }

    /// Searches all clusters for the infobase called `name`.
    ///
    /// Names are compared case-insensitively and the first match wins.
    /// Clusters whose infobases can't be listed are skipped.
    pub fn find_infobase(&self, name: &str) -> Result<Option<(Cluster, Infobase)>, RacError> {
        for cluster in self.clusters()? {
            let infobases = match self.infobases(&cluster) {
                Ok(infobases) => infobases,
                Err(e) => {
                    log::warn!(target: "onec::rac", "Listing infobases of cluster {} failed: {e}", cluster.id);
                    continue;
                }
            };

            if let Some(infobase) = infobases.into_iter().find(|ib| ib.is_named(name)) {
                log::debug!(target: "onec::rac", "Found infobase {name} ({}) in cluster {}", infobase.id, cluster.id);
                return Ok(Some((cluster, infobase)));
            }
        }

        Ok(None)
    }

    /// Sessions connected to `infobase`.
    pub fn sessions(&self, cluster: &Cluster, infobase: &Infobase) -> Result<Vec<Session>, RacError> {
        let stdout = self.execute(
            self.invocation()
                .args(["session", "list"])
                .arg(format!("--cluster={}", cluster.id)),
        )?;

        Ok(Session::parse_list(&stdout)
            .into_iter()
            .filter(|session| session.infobase == infobase.id)
            .collect())
    }

    pub fn terminate_session(&self, cluster: &Cluster, session: &Session) -> Result<(), RacError> {
        self.execute(
            self.invocation()
                .arg("session")
                .arg(format!("--cluster={}", cluster.id))
                .arg("terminate")
                .arg(format!("--session={}", session.id)),
        )?;
        log::info!(target: "onec::rac", "Terminated session {} of user {}", session.number, session.user_name);
        Ok(())
    }

    fn update_infobase(
        &self,
        cluster: &Cluster,
        infobase: &Infobase,
        credentials: &Credentials,
        flag: &str,
        deny: bool,
    ) -> Result<(), RacError> {
        let stdout = self.execute(
            self.invocation()
                .arg("infobase")
                .arg(format!("--cluster={}", cluster.id))
                .arg("update")
                .arg(format!("--infobase={}", infobase.id))
                .arg(format!("--infobase-user={}", credentials.user))
                .secret_arg(format!("--infobase-pwd={}", credentials.password))
                .arg(format!("--{flag}={}", if deny { "on" } else { "off" })),
        )?;

        // rac is silent on success
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            log::warn!(target: "onec::rac", "{}", line.trim());
        }
        Ok(())
    }

    /// Denies or allows the start of scheduled jobs.
    pub fn set_scheduled_jobs_deny(
        &self,
        cluster: &Cluster,
        infobase: &Infobase,
        credentials: &Credentials,
        deny: bool,
    ) -> Result<(), RacError> {
        self.update_infobase(cluster, infobase, credentials, "scheduled-jobs-deny", deny)?;
        log::debug!(target: "onec::rac", "Scheduled jobs of {} denied: {deny}", infobase.name);
        Ok(())
    }

    /// Denies or allows the start of new sessions.
    pub fn set_sessions_deny(
        &self,
        cluster: &Cluster,
        infobase: &Infobase,
        credentials: &Credentials,
        deny: bool,
    ) -> Result<(), RacError> {
        self.update_infobase(cluster, infobase, credentials, "sessions-deny", deny)?;
        log::debug!(target: "onec::rac", "New sessions of {} denied: {deny}", infobase.name);
        Ok(())
    }

    pub fn locks(&self, cluster: &Cluster, infobase: &Infobase) -> Result<Vec<Lock>, RacError> {
        let stdout = self.execute(
            self.invocation()
                .arg("lock")
                .arg(format!("--cluster={}", cluster.id))
                .arg("list")
                .arg(format!("--infobase={}", infobase.id)),
        )?;
        Ok(Lock::parse_list(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::exec::Captured;

    /// Answers `rac` invocations by their first argument and records them.
    #[derive(Default)]
    struct FakeRac {
        calls: RefCell<Vec<Invocation>>,
    }

    impl Runner for FakeRac {
        fn run(&self, invocation: &Invocation) -> Result<Captured, ExecError> {
            self.calls.borrow_mut().push(invocation.clone());
            let args = invocation.get_args();
            let stdout = match (args[0].as_str(), invocation.flag_value("--cluster")) {
                ("cluster", _) => "cluster : c1\nname : \"Main\"\n\ncluster : c2\nname : \"Second\"\n",
                ("infobase", Some("c1")) if args.iter().any(|a| a == "summary") => {
                    "infobase : ib-1\nname : Stock\ndescr :\n"
                }
                ("infobase", Some("c2")) if args.iter().any(|a| a == "summary") => {
                    "infobase : ib-2\nname : SALES\ndescr : \"Sales\"\n\ninfobase : ib-3\nname : sales\ndescr :\n"
                }
                ("session", _) if args.iter().any(|a| a == "list") => {
                    "session : s1\nsession-id : 1\ninfobase : ib-2\nuser-name : Ivanov\n\n\
                     session : s2\nsession-id : 2\ninfobase : ib-1\nuser-name : Petrov\n"
                }
                _ => "",
            };
            Ok(Captured::ok(stdout))
        }
    }

    fn rac(runner: &FakeRac) -> Rac<&FakeRac> {
        Rac::new(runner, Path::new("/opt/1cv8/x86_64"), "srv-1c", "1545")
    }

    #[test]
    fn find_infobase_scans_clusters_and_picks_first_match() {
        let runner = FakeRac::default();
        let (cluster, infobase) = rac(&runner).find_infobase("sales").unwrap().unwrap();

        assert_eq!(cluster.id, "c2");
        assert_eq!(infobase.id, "ib-2");

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].program(), Path::new("/opt/1cv8/x86_64/rac"));
        assert_eq!(calls[0].get_args(), ["cluster", "list", "srv-1c:1545"]);
    }

    #[test]
    fn find_infobase_reports_unknown_name() {
        let runner = FakeRac::default();
        assert_eq!(rac(&runner).find_infobase("payroll").unwrap(), None);
    }

    #[test]
    fn sessions_are_filtered_by_infobase() {
        let runner = FakeRac::default();
        let rac = rac(&runner);
        let (cluster, infobase) = rac.find_infobase("SALES").unwrap().unwrap();

        let sessions = rac.sessions(&cluster, &infobase).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
        assert_eq!(sessions[0].user_name, "Ivanov");
    }

    #[test]
    fn update_passes_credentials_and_switch() {
        let runner = FakeRac::default();
        let rac = rac(&runner);
        let (cluster, infobase) = rac.find_infobase("SALES").unwrap().unwrap();
        let credentials = Credentials::new("Администратор", "secret");

        rac.set_sessions_deny(&cluster, &infobase, &credentials, true)
            .unwrap();
        rac.set_scheduled_jobs_deny(&cluster, &infobase, &credentials, false)
            .unwrap();

        let calls = runner.calls.borrow();
        let sessions_deny = &calls[calls.len() - 2];
        assert_eq!(sessions_deny.flag_value("--infobase"), Some("ib-2"));
        assert_eq!(sessions_deny.flag_value("--infobase-user"), Some("Администратор"));
        assert_eq!(sessions_deny.flag_value("--infobase-pwd"), Some("secret"));
        assert_eq!(sessions_deny.flag_value("--sessions-deny"), Some("on"));
        assert!(!sessions_deny.to_string().contains("secret"));

        let jobs_deny = calls.last().unwrap();
        assert_eq!(jobs_deny.flag_value("--scheduled-jobs-deny"), Some("off"));
        assert_eq!(jobs_deny.get_args().last().map(String::as_str), Some("srv-1c:1545"));
    }
}
