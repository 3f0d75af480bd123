//! Message composition and delivery seams
//!
//! Rendering templates and substituting placeholders belong to the
//! composition collaborator. The bundled [`FieldComposer`] resolves the
//! recipient and copies subject and body verbatim.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::state::Submission;
use crate::OptInError;

/// Where the recipient address comes from
///
/// Written as `{address: ops@example.com}` or `{field: email}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    /// Literal address
    Address { address: String },
    /// Form field holding the address
    Field { field: String },
}

impl Recipient {
    pub fn address(address: impl Into<String>) -> Self {
        Recipient::Address {
            address: address.into(),
        }
    }

    pub fn field(key: impl Into<String>) -> Self {
        Recipient::Field { field: key.into() }
    }
}

/// Recipient, subject and body used for both the confirmation request and
/// the eventual notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub to_mail: Recipient,
    #[serde(default)]
    pub from_mail: Option<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub html: bool,
}

impl MessageTemplate {
    pub fn new(to_mail: Recipient, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to_mail,
            from_mail: None,
            subject: subject.into(),
            body: body.into(),
            html: false,
        }
    }
}

/// A composed message, ready for dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub to_mail: String,
    pub from_mail: Option<String>,
    pub subject: String,
    pub body: String,
    pub html: bool,
}

/// Builds a message for a submission
///
/// Recipient, subject and body all pass through the composer before either
/// the confirmation request or the notification is dispatched.
pub trait MessageComposer: Send + Sync {
    fn compose(
        &self,
        template: &MessageTemplate,
        submission: &Submission,
    ) -> Result<Message, OptInError>;
}

/// Resolves the recipient from a literal or a form field
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldComposer;

impl MessageComposer for FieldComposer {
    fn compose(
        &self,
        template: &MessageTemplate,
        submission: &Submission,
    ) -> Result<Message, OptInError> {
        let to_mail = match &template.to_mail {
            Recipient::Address { address } => Some(address.as_str()),
            Recipient::Field { field } => submission.field_str(field),
        }
        .map(str::trim)
        .filter(|address| is_plausible_address(address))
        .ok_or(OptInError::MissingRecipient)?;

        Ok(Message {
            to_mail: to_mail.to_string(),
            from_mail: template.from_mail.clone(),
            subject: template.subject.clone(),
            body: template.body.clone(),
            html: template.html,
        })
    }
}

fn is_plausible_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !address.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

/// Sends composed notification messages
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &Message) -> anyhow::Result<()>;
}

/// In-memory outbox
#[derive(Debug, Default)]
pub struct MemoryMailer {
    outbox: Mutex<Vec<Message>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Message> {
        self.outbox.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.outbox.lock().await.len()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &Message) -> anyhow::Result<()> {
        self.outbox.lock().await.push(message.clone());
        Ok(())
    }
}
