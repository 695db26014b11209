//! IMAP mailbox over TLS.
//!
//! Speaks just enough IMAP4rev1 for intake: LOGIN, SELECT, UID SEARCH,
//! UID FETCH BODY.PEEK[] and UID STORE. All socket I/O is blocking and runs
//! inside `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::{EmailConfig, FetchedEmail, MailSource, store_attachment};
use crate::error::MailError;
use crate::pipeline::types::AttachmentItem;
use crate::storage::StorageLayout;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest `{N}` literal accepted from the server: 64MB.
const MAX_LITERAL_BYTES: usize = 64 * 1024 * 1024;

pub struct ImapMailbox {
    config: EmailConfig,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn fetch_emails(
        &self,
        max: usize,
        unread_only: bool,
        storage: &StorageLayout,
    ) -> Result<Vec<FetchedEmail>, MailError> {
        let config = self.config.clone();
        let storage = storage.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = connect(&config)?;
            let emails = fetch_emails(&mut session, &config, max, unread_only, &storage);
            session.logout();
            emails
        })
        .await
        .map_err(|e| MailError::Connection(format!("IMAP task failed: {e}")))?
    }

    async fn mark_read(&self, email_id: &str) -> Result<(), MailError> {
        let config = self.config.clone();
        let uid = email_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut session = connect(&config)?;
            let result = mark_seen(&mut session, &config, &uid);
            session.logout();
            result
        })
        .await
        .map_err(|e| MailError::Connection(format!("IMAP task failed: {e}")))?
    }
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect(config: &EmailConfig) -> Result<Session<TlsStream>, MailError> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(conn_err)?;
    tcp.set_read_timeout(Some(SOCKET_TIMEOUT)).map_err(conn_err)?;
    tcp.set_write_timeout(Some(SOCKET_TIMEOUT)).map_err(conn_err)?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
        .map_err(conn_err)?;
    let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(conn_err)?;

    let mut session = Session::new(rustls::StreamOwned::new(conn, tcp));
    session.greeting()?;
    debug!(host = %config.host, "IMAP connection established");
    Ok(session)
}

fn conn_err(e: impl std::fmt::Display) -> MailError {
    MailError::Connection(e.to_string())
}

/// Server response to one tagged command.
#[derive(Debug, Default)]
struct Response {
    /// Untagged lines, without CRLF.
    lines: Vec<String>,
    /// Literal payloads in the order they arrived.
    literals: Vec<Vec<u8>>,
}

struct Session<S: Read + Write> {
    stream: BufReader<S>,
    tag: u32,
}

impl<S: Read + Write> Session<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            tag: 0,
        }
    }

    fn greeting(&mut self) -> Result<(), MailError> {
        let line = read_line(&mut self.stream)?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailError::Connection(format!("unexpected greeting: {line}")))
        }
    }

    fn command(&mut self, cmd: &str) -> Result<Response, MailError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        let verb = command_verb(cmd);

        let writer = self.stream.get_mut();
        writer
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .and_then(|()| writer.flush())
            .map_err(conn_err)?;

        let (response, status) = read_response(&mut self.stream, &tag)?;
        if status.split_whitespace().next() == Some("OK") {
            Ok(response)
        } else {
            Err(MailError::Command {
                command: verb,
                reason: status,
            })
        }
    }

    fn login(&mut self, config: &EmailConfig) -> Result<(), MailError> {
        let cmd = format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        );
        self.command(&cmd).map(|_| ()).map_err(|e| match e {
            MailError::Command { .. } => MailError::LoginFailed,
            other => other,
        })
    }

    fn select(&mut self, mailbox: &str) -> Result<(), MailError> {
        self.command(&format!("SELECT {}", quote(mailbox))).map(|_| ())
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, MailError> {
    let mut buf = Vec::new();
    let n = reader
        .read_until(b'\n', &mut buf)
        .map_err(conn_err)?;
    if n == 0 {
        return Err(MailError::Connection("IMAP connection closed".into()));
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
}

/// Read until the tagged status line; returns the response and the status
/// text after the tag (e.g. `OK FETCH completed`).
fn read_response<R: BufRead>(reader: &mut R, tag: &str) -> Result<(Response, String), MailError> {
    let mut response = Response::default();
    let prefix = format!("{tag} ");
    loop {
        let line = read_line(reader)?;
        if let Some(status) = line.strip_prefix(&prefix) {
            return Ok((response, status.to_string()));
        }
        if let Some(len) = literal_len(&line) {
            if len > MAX_LITERAL_BYTES {
                return Err(MailError::Connection(format!(
                    "server announced a {len} byte literal, limit is {MAX_LITERAL_BYTES}"
                )));
            }
            let mut literal = vec![0u8; len];
            reader
                .read_exact(&mut literal)
                .map_err(conn_err)?;
            response.literals.push(literal);
        }
        response.lines.push(line);
    }
}

/// Size announced by a trailing `{N}` literal marker.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

fn command_verb(cmd: &str) -> String {
    let mut words = cmd.split_whitespace();
    match words.next() {
        Some("UID") => format!("UID {}", words.next().unwrap_or_default()),
        Some(verb) => verb.to_string(),
        None => String::new(),
    }
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

// ── Operations ──────────────────────────────────────────────────────

fn fetch_emails<S: Read + Write>(
    session: &mut Session<S>,
    config: &EmailConfig,
    max: usize,
    unread_only: bool,
    storage: &StorageLayout,
) -> Result<Vec<FetchedEmail>, MailError> {
    session.login(config)?;
    session.select(&config.mailbox)?;

    let criteria = if unread_only { "UNSEEN" } else { "ALL" };
    let search = session.command(&format!("UID SEARCH {criteria}"))?;
    let uids = newest_uids(parse_search(&search.lines), max);
    info!(
        mailbox = %config.mailbox,
        count = uids.len(),
        unread_only,
        "Fetching emails"
    );

    let mut emails: Vec<FetchedEmail> = Vec::with_capacity(uids.len());
    for uid in uids {
        // BODY.PEEK leaves \Seen alone; marking read is a separate step.
        let response = match session.command(&format!("UID FETCH {uid} BODY.PEEK[]")) {
            Ok(response) => response,
            Err(e) => {
                // Nothing downstream will own what was already stored.
                discard(emails.iter().flat_map(|email| &email.attachments));
                return Err(e);
            }
        };
        let Some(raw) = response.literals.first() else {
            warn!(uid, "FETCH returned no message body, skipping");
            continue;
        };
        match parse_email(&uid.to_string(), raw, storage) {
            Ok(Some(email)) => emails.push(email),
            Ok(None) => warn!(uid, "Unparseable message, skipping"),
            Err(e) => warn!(uid, error = %e, "Failed to store attachments, skipping email"),
        }
    }
    Ok(emails)
}

fn mark_seen<S: Read + Write>(
    session: &mut Session<S>,
    config: &EmailConfig,
    uid: &str,
) -> Result<(), MailError> {
    if uid.is_empty() || !uid.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MailError::Command {
            command: "UID STORE".into(),
            reason: format!("invalid message id {uid:?}"),
        });
    }
    session.login(config)?;
    session.select(&config.mailbox)?;
    session.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
    debug!(uid, "Marked email as read");
    Ok(())
}

fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// The `max` highest UIDs, oldest first.
fn newest_uids(mut uids: Vec<u32>, max: usize) -> Vec<u32> {
    uids.sort_unstable();
    uids.dedup();
    let skip = uids.len().saturating_sub(max);
    uids.split_off(skip)
}

/// Best-effort removal of stored attachment files.
fn discard<'a>(items: impl IntoIterator<Item = &'a AttachmentItem>) {
    for item in items {
        if let Err(e) = std::fs::remove_file(&item.source_path) {
            debug!(path = %item.source_path.display(), error = %e, "Failed to remove attachment");
        }
    }
}

/// Parse a raw RFC 5322 message and store its attachments in temp storage.
///
/// `Ok(None)` when the bytes are not a parseable message. On a write
/// failure the attachments already stored for this email are removed.
fn parse_email(
    id: &str,
    raw: &[u8],
    storage: &StorageLayout,
) -> Result<Option<FetchedEmail>, MailError> {
    let Some(parsed) = MessageParser::default().parse(raw) else {
        return Ok(None);
    };

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));

    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        let name = part.attachment_name().unwrap_or("attachment");
        let media_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string())
            .to_ascii_lowercase();

        match store_attachment(storage, name, &media_type, part.contents()) {
            Ok(item) => attachments.push(item),
            Err(e) => {
                discard(&attachments);
                return Err(e);
            }
        }
    }

    Ok(Some(FetchedEmail {
        id: id.to_string(),
        subject,
        sender,
        received_at,
        attachments,
    }))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use secrecy::SecretString;

    use super::*;

    /// In-memory server: canned input, captured output.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Scripted {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn config() -> EmailConfig {
        EmailConfig {
            host: "imap.example.com".into(),
            port: 993,
            username: "ap@example.com".into(),
            password: SecretString::from("p\"w".to_string()),
            mailbox: "INBOX".into(),
        }
    }

    fn sent(session: Session<Scripted>) -> String {
        String::from_utf8(session.stream.into_inner().output).unwrap()
    }

    const MESSAGE: &str = "From: Billing <billing@acme.test>\r\n\
Subject: Your invoice\r\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached.\r\n\
--b1\r\n\
Content-Type: text/plain; name=\"inv.txt\"\r\n\
Content-Disposition: attachment; filename=\"inv.txt\"\r\n\
\r\n\
Invoice #42 total 10.00\r\n\
--b1--\r\n";

    #[test]
    fn literal_marker() {
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {1234}"), Some(1234));
        assert_eq!(literal_len("* SEARCH 1 2"), None);
        assert_eq!(literal_len("{x}"), None);
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn verbs() {
        assert_eq!(command_verb("UID FETCH 3 BODY.PEEK[]"), "UID FETCH");
        assert_eq!(command_verb("SELECT \"INBOX\""), "SELECT");
    }

    #[test]
    fn newest_uids_keeps_highest_in_order() {
        assert_eq!(newest_uids(vec![9, 3, 7, 5], 2), vec![7, 9]);
        assert_eq!(newest_uids(vec![2, 1], 10), vec![1, 2]);
        assert!(newest_uids(vec![1, 2], 0).is_empty());
    }

    #[test]
    fn search_lines_parsed() {
        let lines = vec!["* SEARCH 4 8 15".to_string(), "* 3 EXISTS".to_string()];
        assert_eq!(parse_search(&lines), vec![4, 8, 15]);
        assert!(parse_search(&["* SEARCH".to_string()]).is_empty());
    }

    #[test]
    fn response_reads_literal_payload() {
        let body = "line one\r\nline two\r\n";
        let input = format!(
            "* 1 FETCH (UID 7 BODY[] {{{}}}\r\n{body})\r\nA1 OK done\r\n",
            body.len()
        );
        let (response, status) = read_response(&mut Cursor::new(input.into_bytes()), "A1").unwrap();
        assert_eq!(status, "OK done");
        assert_eq!(response.literals, vec![body.as_bytes().to_vec()]);
    }

    #[test]
    fn closed_connection_is_an_error() {
        let err = read_response(&mut Cursor::new(b"* 1 EXISTS\r\n".to_vec()), "A1").unwrap_err();
        assert!(matches!(err, MailError::Connection(_)));
    }

    #[test]
    fn full_fetch_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayout::with_base(dir.path());
        std::fs::create_dir_all(storage.temp_dir()).unwrap();

        let script = format!(
            "* OK IMAP ready\r\n\
A1 OK LOGIN completed\r\n\
* 3 EXISTS\r\nA2 OK SELECT completed\r\n\
* SEARCH 7\r\nA3 OK SEARCH completed\r\n\
* 1 FETCH (UID 7 BODY[] {{{}}}\r\n{MESSAGE})\r\nA4 OK FETCH completed\r\n",
            MESSAGE.len()
        );
        let mut session = Session::new(Scripted::new(script.into_bytes()));
        session.greeting().unwrap();

        let emails = fetch_emails(&mut session, &config(), 10, true, &storage).unwrap();
        assert_eq!(emails.len(), 1);
        let email = &emails[0];
        assert_eq!(email.id, "7");
        assert_eq!(email.subject, "Your invoice");
        assert_eq!(email.sender, "billing@acme.test");
        assert!(email.received_at.is_some());
        assert_eq!(email.attachments.len(), 1);

        let attachment = &email.attachments[0];
        assert_eq!(attachment.declared_filename, "inv.txt");
        assert_eq!(attachment.media_type, "text/plain");
        assert!(storage.is_temp_path(&attachment.source_path));
        let stored = std::fs::read_to_string(&attachment.source_path).unwrap();
        assert!(stored.contains("Invoice #42"));

        let sent = sent(session);
        assert!(sent.contains("A1 LOGIN \"ap@example.com\" \"p\\\"w\""));
        assert!(sent.contains("A3 UID SEARCH UNSEEN"));
        assert!(sent.contains("A4 UID FETCH 7 BODY.PEEK[]"));
        assert!(!sent.contains("STORE"));
    }

    #[test]
    fn failed_fetch_discards_stored_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayout::with_base(dir.path());
        std::fs::create_dir_all(storage.temp_dir()).unwrap();

        let script = format!(
            "* OK IMAP ready\r\n\
A1 OK LOGIN completed\r\n\
A2 OK SELECT completed\r\n\
* SEARCH 7 8\r\nA3 OK SEARCH completed\r\n\
* 1 FETCH (UID 7 BODY[] {{{}}}\r\n{MESSAGE})\r\nA4 OK FETCH completed\r\n\
A5 NO FETCH failed\r\n",
            MESSAGE.len()
        );
        let mut session = Session::new(Scripted::new(script.into_bytes()));
        session.greeting().unwrap();

        let err = fetch_emails(&mut session, &config(), 10, true, &storage).unwrap_err();
        assert!(matches!(err, MailError::Command { ref command, .. } if command == "UID FETCH"));
        assert!(std::fs::read_dir(storage.temp_dir()).unwrap().next().is_none());
    }

    #[test]
    fn oversized_literal_rejected() {
        let input = format!("* 1 FETCH (UID 7 BODY[] {{{}}}\r\n", MAX_LITERAL_BYTES + 1);
        let err = read_response(&mut Cursor::new(input.into_bytes()), "A1").unwrap_err();
        assert!(matches!(err, MailError::Connection(_)));
    }

    #[test]
    fn rejected_login() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayout::with_base(dir.path());
        let script = b"* OK ready\r\nA1 NO [AUTHENTICATIONFAILED] bad credentials\r\n".to_vec();
        let mut session = Session::new(Scripted::new(script));
        session.greeting().unwrap();

        let err = fetch_emails(&mut session, &config(), 10, true, &storage).unwrap_err();
        assert!(matches!(err, MailError::LoginFailed));
    }

    #[test]
    fn mark_seen_stores_flag() {
        let script = b"* OK ready\r\nA1 OK\r\nA2 OK\r\n* 1 FETCH (FLAGS (\\Seen))\r\nA3 OK\r\n".to_vec();
        let mut session = Session::new(Scripted::new(script));
        session.greeting().unwrap();

        mark_seen(&mut session, &config(), "12").unwrap();
        assert!(sent(session).contains("A3 UID STORE 12 +FLAGS (\\Seen)"));
    }

    #[test]
    fn mark_seen_rejects_non_numeric_ids() {
        let mut session = Session::new(Scripted::new(Vec::new()));
        let err = mark_seen(&mut session, &config(), "1 OR 2").unwrap_err();
        assert!(matches!(err, MailError::Command { .. }));
        assert!(sent(session).is_empty());
    }

    #[test]
    fn message_without_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageLayout::with_base(dir.path());
        let raw = b"From: a@b.test\r\nSubject: hi\r\n\r\nhello\r\n";
        let email = parse_email("3", raw, &storage).unwrap().unwrap();
        assert!(email.attachments.is_empty());
        assert_eq!(email.subject, "hi");
    }
}
