use crate::config::Config;
use lettre::{
    message::Mailbox,
    transport::smtp::{authentication::Credentials, response::Response as LettreResponse},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

const SENDER_NAME: &str = "Campus Club Hub";

#[derive(Clone)]
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    address: Address,
}

impl Mailer {
    /// Returns `None` when no SMTP credentials are configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Mailer>> {
        let (Some(username), Some(password)) = (&config.email_username, &config.email_password)
        else {
            return Ok(None);
        };

        let address = username.parse::<Address>()?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_relay)?
            .credentials(Credentials::new(username.clone(), password.clone()))
            .build();

        Ok(Some(Mailer { transport, address }))
    }

    pub async fn sanity_check(&self) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(self.sender())
            .to(Mailbox::new(None, self.address.clone()))
            .subject("Ensuring provided email is valid")
            .body("SANITY CHECK".to_string())?;

        self.transport.send(email).await?;
        Ok(())
    }

    pub async fn send(
        &self,
        to_name: &str,
        to_email: &str,
        email: &Email,
    ) -> anyhow::Result<LettreResponse> {
        let destination = to_email.parse::<Address>()?;
        let msg = Message::builder()
            .from(self.sender())
            .to(Mailbox::new(Some(to_name.to_string()), destination))
            .subject(email.subject.clone())
            .body(email.body.clone())?;

        Ok(self.transport.send(msg).await?)
    }

    fn sender(&self) -> Mailbox {
        Mailbox::new(Some(SENDER_NAME.to_string()), self.address.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub body: String,
}

impl Email {
    pub fn club_approved(name: &str, club: &str, link: &str) -> Email {
        Email {
            subject: format!("{club} has been approved"),
            body: format!(
                r"Hi {name},

Good news! Your club {club} has been approved and is now listed on the Campus Club Hub. Students can find it and request to join here:

{link}

Thanks,
The Campus Club Hub Team."
            ),
        }
    }

    pub fn club_rejected(name: &str, club: &str, reason: Option<&str>) -> Email {
        let reason = reason
            .map(|r| format!("\n\nReason given by the reviewer: {r}"))
            .unwrap_or_default();
        Email {
            subject: format!("{club} was not approved"),
            body: format!(
                r"Hi {name},

Unfortunately your club {club} was not approved.{reason}

You are welcome to update the details and submit it again.

Thanks,
The Campus Club Hub Team."
            ),
        }
    }

    pub fn join_reviewed(name: &str, club: &str, approved: bool, link: &str) -> Email {
        let (subject, outcome) = if approved {
            (
                format!("Welcome to {club}"),
                "has been approved. You are now a member",
            )
        } else {
            (
                format!("Your request to join {club}"),
                "was declined by the club officers",
            )
        };
        Email {
            subject,
            body: format!(
                r"Hi {name},

Your request to join {club} {outcome}.

{link}

Thanks,
The Campus Club Hub Team."
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_mentions_reason_when_given() {
        let email = Email::club_rejected("Ada", "Chess Club", Some("duplicate of Chess Society"));
        assert_eq!(email.subject, "Chess Club was not approved");
        assert!(email.body.contains("duplicate of Chess Society"));

        let email = Email::club_rejected("Ada", "Chess Club", None);
        assert!(!email.body.contains("Reason"));
    }

    #[test]
    fn join_review_outcome_is_worded() {
        let email = Email::join_reviewed("Ada", "Robotics", true, "https://clubs/1");
        assert_eq!(email.subject, "Welcome to Robotics");
        assert!(email.body.contains("You are now a member"));
        assert!(email.body.contains("https://clubs/1"));

        let email = Email::join_reviewed("Ada", "Robotics", false, "https://clubs/1");
        assert!(email.body.contains("declined"));
    }
}
