//! Delivery through the local MTA's sendmail interface.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{MailTransport, OutgoingMail, TransportError, address_of};

/// Pipes each message to `sendmail -i -f <sender> -- <recipient>`.
#[derive(Debug, Clone)]
pub struct Sendmail {
    program: String,
}

impl Sendmail {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Header block, one blank line, body.
fn render_message(mail: &OutgoingMail<'_>) -> String {
    let header = mail.header.trim_end_matches(['\r', '\n']);
    format!("{header}\n\n{}", mail.body)
}

#[async_trait]
impl MailTransport for Sendmail {
    async fn send(&mut self, mail: &OutgoingMail<'_>) -> Result<(), TransportError> {
        let mut child = Command::new(&self.program)
            .arg("-i")
            .arg("-f")
            .arg(address_of(mail.envelope_sender))
            .arg("--")
            .arg(address_of(mail.recipient))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::new(format!("cannot start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(render_message(mail).as_bytes()).await {
                let _ = child.kill().await;
                return Err(TransportError::new(format!("write to {}: {e}", self.program)));
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TransportError::new(format!("wait for {}: {e}", self.program)))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TransportError::new(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_has_single_separator() {
        let mail = OutgoingMail {
            envelope_sender: "a@b",
            recipient: "c@d",
            header: "Subject: hi\r\n",
            body: "body",
        };
        assert_eq!(render_message(&mail), "Subject: hi\n\nbody");
    }

    #[tokio::test]
    async fn missing_program_is_a_send_failure() {
        let mut transport = Sendmail::new("/nonexistent/sendmail");
        let mail = OutgoingMail {
            envelope_sender: "a@b",
            recipient: "c@d",
            header: "",
            body: "",
        };
        let err = transport.send(&mail).await.unwrap_err();
        assert!(err.diagnostic.contains("cannot start"));
    }

    #[tokio::test]
    async fn program_that_ignores_input_fails_without_lingering() {
        // `true` exits without reading, so a body larger than the pipe
        // buffer cannot be written.
        let mut transport = Sendmail::new("true");
        let body = "x".repeat(1 << 20);
        let mail = OutgoingMail {
            envelope_sender: "a@b",
            recipient: "c@d",
            header: "Subject: big",
            body: &body,
        };
        let err = transport.send(&mail).await.unwrap_err();
        assert!(err.diagnostic.contains("write to true"), "{}", err.diagnostic);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_send_failure() {
        let mut transport = Sendmail::new("false");
        let mail = OutgoingMail {
            envelope_sender: "a@b",
            recipient: "c@d",
            header: "",
            body: "",
        };
        let err = transport.send(&mail).await.unwrap_err();
        assert!(err.diagnostic.contains("exited with"), "{}", err.diagnostic);
    }
}
