use std::io::{self, Write};
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;

/// Replaces configured secrets with `[REDACTED]` before text leaves the bot.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Arc<Vec<String>>,
}

impl Redactor {
    pub fn new(secrets: Vec<String>) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(|secret| secret.trim().to_string())
            .filter(|secret| !secret.is_empty())
            .collect();
        // Longest first so a key that contains another is masked whole.
        secrets.sort_by_key(|secret| std::cmp::Reverse(secret.len()));
        Redactor {
            secrets: Arc::new(secrets),
        }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut redacted = text.to_string();
        for secret in self.secrets.iter() {
            redacted = redacted.replace(secret.as_str(), "[REDACTED]");
        }
        redacted
    }
}

pub struct RedactingWriter<W> {
    inner: W,
    redactor: Redactor,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(self.redactor.redact(&text).as_bytes())?;
        // The caller's buffer was consumed even if the redacted line is shorter.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Wraps a log writer so every formatted line goes through a [`Redactor`].
#[derive(Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Redactor,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M, redactor: Redactor) -> Self {
        RedactingMakeWriter { inner, redactor }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: self.redactor.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::logging::test_support::CapturedLogs;

    #[test]
    fn redacts_every_configured_secret() {
        let redactor = Redactor::new(vec![
            "123:abc".to_string(),
            " ".to_string(),
            "sk-live".to_string(),
            "sk-live-extended".to_string(),
        ]);
        let text = "GET https://api.telegram.org/bot123:abc/getMe with sk-live-extended and sk-live";
        assert_eq!(
            redactor.redact(text),
            "GET https://api.telegram.org/bot[REDACTED]/getMe with [REDACTED] and [REDACTED]"
        );
        assert_eq!(Redactor::default().redact("plain"), "plain");
    }

    #[test]
    fn log_lines_are_redacted_before_reaching_the_writer() {
        let logs = CapturedLogs::default();
        let inner = logs.clone();
        let make_writer = RedactingMakeWriter::new(
            move || inner.clone(),
            Redactor::new(vec!["123456:SECRETTOKEN".to_string()]),
        );
        let subscriber = tracing_subscriber::fmt()
            .with_writer(make_writer)
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("Slideshow failed: error sending request for url (https://api.telegram.org/file/bot123456:SECRETTOKEN/a.jpg)");
        });

        let logged = logs.contents();
        assert!(logged.contains("Slideshow failed"));
        assert!(logged.contains("/file/bot[REDACTED]/a.jpg"));
        assert!(!logged.contains("SECRETTOKEN"));
    }
}
