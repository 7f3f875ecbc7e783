use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use derive_more::{Display, Error, From};
use lettre::address::AddressError;
use lettre::message::header::{ContentType, ContentTypeErr};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::settings::GeneralSettings;

/// Replaced by the current date in the mail subject.
pub const BACKUP_DATE_PLACEHOLDER: &str = "{{ BACKUP_DATE }}";
pub const DEFAULT_SMTP_PORT: u16 = 25;

#[derive(Debug, Display, Error, From)]
pub enum ReportError {
    #[display("No sender address configured for the report")]
    MissingSender,
    #[display("No recipients configured for the report")]
    MissingRecipients,
    #[display("No SMTP server configured for the report")]
    MissingServer,
    #[display("Invalid mail address {address}: {source}")]
    Address { address: String, source: AddressError },
    #[display("Reading attachment {} failed: {source}", path.display())]
    Attachment { path: PathBuf, source: io::Error },
    #[display("Invalid content type: {_0}")]
    #[from]
    ContentType(ContentTypeErr),
    #[display("Composing the report failed: {_0}")]
    #[from]
    Compose(lettre::error::Error),
    #[display("Sending the report failed: {_0}")]
    #[from]
    Send(lettre::transport::smtp::Error),
}

/// Where and how to send the report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailSettings {
    pub enabled: bool,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub attachments: Vec<PathBuf>,
}

impl MailSettings {
    /// Mail settings of the general settings section.
    pub fn from_general(general: &GeneralSettings) -> Self {
        let port = general.smtp_server_port.and_then(|port| {
            u16::try_from(port)
                .inspect_err(|_| log::warn!(target: "report", "Ignoring invalid SMTP port {port}"))
                .ok()
        });

        Self {
            enabled: general.report_enable,
            from: general.report_from.clone(),
            to: general.report_to.clone(),
            subject: general.report_subject.clone(),
            server: general.smtp_server.clone(),
            port,
            login: general.smtp_login.clone(),
            password: general.smtp_password.clone(),
            attachments: general.report_attachments.iter().map(PathBuf::from).collect(),
        }
    }

    /// Subject with the backup date filled in.
    pub fn subject_for(&self, date: NaiveDate) -> String {
        self.subject
            .replace(BACKUP_DATE_PLACEHOLDER, &date.format("%Y-%m-%d").to_string())
    }

    fn mailbox(address: &str) -> Result<Mailbox, ReportError> {
        address.trim().parse().map_err(|source| ReportError::Address {
            address: address.to_string(),
            source,
        })
    }

    /// Builds the report message.
    pub fn compose(&self, body: &str, date: NaiveDate) -> Result<Message, ReportError> {
        let from = self.from.as_deref().ok_or(ReportError::MissingSender)?;
        if self.to.is_empty() {
            return Err(ReportError::MissingRecipients);
        }

        let mut builder = Message::builder()
            .from(Self::mailbox(from)?)
            .subject(self.subject_for(date))
            .date_now();
        for to in &self.to {
            builder = builder.to(Self::mailbox(to)?);
        }

        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(body.to_string()));
        for path in &self.attachments {
            parts = parts.singlepart(attachment(path)?);
        }

        Ok(builder.multipart(parts)?)
    }

    /// Sends the report through the configured SMTP relay.
    pub fn send(&self, body: &str, date: NaiveDate) -> Result<(), ReportError> {
        let server = self.server.as_deref().ok_or(ReportError::MissingServer)?;
        let message = self.compose(body, date)?;

        let mut transport = SmtpTransport::builder_dangerous(server)
            .port(self.port.unwrap_or(DEFAULT_SMTP_PORT));
        if let Some(login) = &self.login {
            let password = self.password.clone().unwrap_or_default();
            transport = transport.credentials(Credentials::new(login.clone(), password));
        }

        transport.build().send(&message)?;
        log::info!(target: "report", "Report sent from {:?} to {:?}", self.from, self.to);

        Ok(())
    }
}

fn attachment(path: &Path) -> Result<SinglePart, ReportError> {
    let content = fs::read(path).map_err(|source| ReportError::Attachment {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    log::debug!(target: "report", "Attaching {} ({} bytes)", path.display(), content.len());

    let content_type = ContentType::parse("application/octet-stream")?;
    Ok(Attachment::new(file_name).body(content, content_type))
}
