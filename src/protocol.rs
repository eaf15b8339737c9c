//! IMAP protocol handling
//!
//! Client lines become [`Request`]s through [`parse`]; server replies are
//! [`Response`]s whose `Display` form is the exact wire text. Parsing is pure:
//! no I/O happens here, and whether a command is allowed at all is decided by
//! the session, not the parser.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;

use crate::error::{Error, Result};
use crate::types::{Credentials, Mail, MailboxName};

/// Upper bound on how many message indices one item set may expand to
pub const MAX_ITEM_SET_LEN: usize = 10_000;

/// The command vocabulary, without payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    StartTls,
    Capability,
    Login,
    Logout,
    Select,
    Fetch,
    Unknown,
}

impl CommandKind {
    pub const ALL: [CommandKind; 6] = [
        CommandKind::StartTls,
        CommandKind::Capability,
        CommandKind::Login,
        CommandKind::Logout,
        CommandKind::Select,
        CommandKind::Fetch,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            CommandKind::StartTls => "STARTTLS",
            CommandKind::Capability => "CAPABILITY",
            CommandKind::Login => "LOGIN",
            CommandKind::Logout => "LOGOUT",
            CommandKind::Select => "SELECT",
            CommandKind::Fetch => "FETCH",
            CommandKind::Unknown => "UNKNOWN",
        }
    }

    /// Case-sensitive keyword lookup. Anything outside the vocabulary is
    /// `Unknown`.
    pub fn from_keyword(word: &str) -> CommandKind {
        KEYWORDS.get(word).copied().unwrap_or(CommandKind::Unknown)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, CommandKind> = CommandKind::ALL
        .iter()
        .map(|kind| (kind.keyword(), *kind))
        .collect();
}

/// IMAP command parsed from client input
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartTls,
    Capability,
    Login { credentials: Credentials },
    Logout,
    Select { mailbox: MailboxName },
    Fetch {
        request_id: String,
        item_set: BTreeSet<u32>,
        attribute: String,
    },
    /// A known keyword whose arguments did not parse
    Malformed { kind: CommandKind, reason: String },
    Unknown,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::StartTls => CommandKind::StartTls,
            Command::Capability => CommandKind::Capability,
            Command::Login { .. } => CommandKind::Login,
            Command::Logout => CommandKind::Logout,
            Command::Select { .. } => CommandKind::Select,
            Command::Fetch { .. } => CommandKind::Fetch,
            Command::Malformed { kind, .. } => *kind,
            Command::Unknown => CommandKind::Unknown,
        }
    }
}

/// One tagged client request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub tag: Option<String>,
    pub command: Command,
}

/// Parse one client line (terminator already stripped).
///
/// Never fails: unrecognised keywords become [`Command::Unknown`] and bad
/// arguments to a known keyword become [`Command::Malformed`].
pub fn parse(line: &str) -> Request {
    let mut tokens = line.split_whitespace();
    let tag = tokens.next().map(str::to_string);
    let kind = tokens
        .next()
        .map(CommandKind::from_keyword)
        .unwrap_or(CommandKind::Unknown);

    let command = match kind {
        CommandKind::StartTls => Command::StartTls,
        CommandKind::Capability => Command::Capability,
        CommandKind::Logout => Command::Logout,
        CommandKind::Unknown => Command::Unknown,
        CommandKind::Login => {
            malformed_or(kind, extract_credentials(line).map(|credentials| Command::Login { credentials }))
        }
        CommandKind::Select => malformed_or(kind, parse_select_payload(line)),
        CommandKind::Fetch => malformed_or(kind, parse_fetch_command(line)),
    };

    Request { tag, command }
}

fn malformed_or(kind: CommandKind, result: Result<Command>) -> Command {
    result.unwrap_or_else(|e| Command::Malformed {
        kind,
        reason: match e {
            Error::Parse(reason) => reason,
            other => other.to_string(),
        },
    })
}

fn parse_select_payload(line: &str) -> Result<Command> {
    let mailbox = line
        .split_whitespace()
        .nth(2)
        .ok_or_else(|| Error::Parse("SELECT requires a mailbox name".to_string()))?;
    Ok(Command::Select {
        mailbox: unquote(mailbox).unwrap_or(mailbox).to_string(),
    })
}

fn parse_fetch_command(line: &str) -> Result<Command> {
    let (request_id, expr, attribute) = parse_fetch_payload(line)?;
    let item_set = parse_item_set(&expr)?;
    Ok(Command::Fetch {
        request_id,
        item_set,
        attribute,
    })
}

/// Pull the username and password out of a `<tag> LOGIN <user> <pass>` line.
///
/// The password may be a quoted string, in which case it may contain spaces
/// and backslash-escaped quotes.
pub fn extract_credentials(line: &str) -> Result<Credentials> {
    let missing = || Error::Parse("LOGIN requires a username and a password".to_string());

    let (_tag, rest) = next_token(line).ok_or_else(missing)?;
    let (keyword, rest) = next_token(rest).ok_or_else(missing)?;
    if keyword != CommandKind::Login.keyword() {
        return Err(Error::Parse(format!("expected LOGIN, found {}", keyword)));
    }
    let (username, rest) = next_token(rest).ok_or_else(missing)?;

    let password = rest.trim();
    if password.is_empty() {
        return Err(missing());
    }
    let password = if password.starts_with('"') {
        decode_quoted(password)?
    } else if password.contains(char::is_whitespace) {
        return Err(too_many_login_arguments());
    } else {
        password.to_string()
    };

    Ok(Credentials::new(unquote(username).unwrap_or(username), password))
}

fn too_many_login_arguments() -> Error {
    Error::Parse("LOGIN takes exactly two arguments".to_string())
}

/// Decode a quoted string that must span all of `token`. Inside the quotes
/// `\` escapes the next character; a bare `"` ends the string.
fn decode_quoted(token: &str) -> Result<String> {
    let mut chars = token.chars();
    chars.next();

    let mut out = String::with_capacity(token.len());
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => out.push(escaped),
                None => break,
            },
            '"' if chars.as_str().is_empty() => return Ok(out),
            '"' => return Err(too_many_login_arguments()),
            c => out.push(c),
        }
    }

    Err(Error::Parse("unterminated quoted string".to_string()))
}

/// Expand an item-set expression such as `1,3:5,9` into its indices.
///
/// A reversed range (`5:3`) contributes nothing.
pub fn parse_item_set(expr: &str) -> Result<BTreeSet<u32>> {
    let mut items = BTreeSet::new();

    for element in expr.split(',') {
        match element.split_once(':') {
            Some((start, end)) => {
                let start = parse_index(start)?;
                let end = parse_index(end)?;
                if start <= end {
                    if (end - start) as usize >= MAX_ITEM_SET_LEN {
                        return Err(item_set_too_large());
                    }
                    items.extend(start..=end);
                }
            }
            None => {
                items.insert(parse_index(element)?);
            }
        }

        if items.len() > MAX_ITEM_SET_LEN {
            return Err(item_set_too_large());
        }
    }

    Ok(items)
}

fn parse_index(token: &str) -> Result<u32> {
    token
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Parse(format!("invalid message index {:?}", token)))
}

fn item_set_too_large() -> Error {
    Error::Parse(format!("item set expands to more than {} messages", MAX_ITEM_SET_LEN))
}

/// Split `<tag> FETCH <item-set> <attribute>` into request id, item-set
/// expression and attribute. Extra trailing tokens are ignored.
pub fn parse_fetch_payload(line: &str) -> Result<(String, String, String)> {
    let mut tokens = line.split_whitespace();
    let request_id = tokens.next();
    let _keyword = tokens.next();
    let item_set = tokens.next();
    let attribute = tokens.next();

    match (request_id, item_set, attribute) {
        (Some(id), Some(set), Some(attr)) => Ok((id.to_string(), set.to_string(), attr.to_string())),
        _ => Err(Error::Parse("FETCH requires an item set and an attribute".to_string())),
    }
}

fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.find(char::is_whitespace) {
        Some(at) => Some((&input[..at], &input[at..])),
        None => Some((input, "")),
    }
}

fn unquote(token: &str) -> Option<&str> {
    token.strip_prefix('"').and_then(|t| t.strip_suffix('"'))
}

/// Message data a FETCH can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAttribute {
    Envelope,
    Rfc822,
    Body,
    Flags,
}

impl FetchAttribute {
    pub fn name(self) -> &'static str {
        match self {
            FetchAttribute::Envelope => "ENVELOPE",
            FetchAttribute::Rfc822 => "RFC822",
            FetchAttribute::Body => "BODY[]",
            FetchAttribute::Flags => "FLAGS",
        }
    }

    /// Render `mail` as the payload of an untagged FETCH response for message
    /// number `sequence`. Bodies go out as IMAP literals.
    pub fn render(self, sequence: u32, mail: &Mail) -> String {
        let value = match self {
            FetchAttribute::Envelope => format!(
                "({} {} {} {})",
                quoted(&mail.sent_at.to_rfc2822()),
                quoted(&mail.subject),
                quoted(&mail.sender),
                quoted(&mail.recipient),
            ),
            FetchAttribute::Rfc822 | FetchAttribute::Body => {
                format!("{{{}}}\r\n{}", mail.body.len(), mail.body)
            }
            // No per-message flag store; everything reads as seen.
            FetchAttribute::Flags => "(\\Seen)".to_string(),
        };
        format!("{} FETCH ({} {})", sequence, self.name(), value)
    }
}

impl FromStr for FetchAttribute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim_matches(|c| c == '(' || c == ')').to_ascii_uppercase();
        match name.as_str() {
            "ENVELOPE" => Ok(FetchAttribute::Envelope),
            "RFC822" => Ok(FetchAttribute::Rfc822),
            "BODY[]" => Ok(FetchAttribute::Body),
            "FLAGS" => Ok(FetchAttribute::Flags),
            _ => Err(Error::UnsupportedAttribute(s.to_string())),
        }
    }
}

fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// IMAP response to send to client
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok { tag: Option<String>, message: String },
    No { tag: Option<String>, message: String },
    Bad { tag: Option<String>, message: String },
    Bye { message: String },
    Untagged { message: String },
}

impl Response {
    /// The reply to a command that is not allowed in the current phase.
    pub fn bad_sequence(tag: Option<String>) -> Self {
        Response::Bad {
            tag,
            message: "Bad sequence of commands".to_string(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok { tag: Some(tag), message } => write!(f, "{} OK {}\r\n", tag, message),
            Response::Ok { tag: None, message } => write!(f, "* OK {}\r\n", message),
            Response::No { tag: Some(tag), message } => write!(f, "{} NO {}\r\n", tag, message),
            Response::No { tag: None, message } => write!(f, "* NO {}\r\n", message),
            Response::Bad { tag: Some(tag), message } => write!(f, "{} BAD {}\r\n", tag, message),
            Response::Bad { tag: None, message } => write!(f, "* BAD {}\r\n", message),
            Response::Bye { message } => write!(f, "* BYE {}\r\n", message),
            Response::Untagged { message } => write!(f, "* {}\r\n", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn set(items: &[u32]) -> BTreeSet<u32> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_parse_capability() {
        let request = parse("A001 CAPABILITY");
        assert_eq!(request.tag.as_deref(), Some("A001"));
        assert_eq!(request.command, Command::Capability);
    }

    #[test]
    fn test_keyword_round_trip() {
        let lines = [
            ("A1 STARTTLS", "STARTTLS"),
            ("A1 CAPABILITY", "CAPABILITY"),
            ("A1 LOGIN alice secret", "LOGIN"),
            ("A1 LOGOUT", "LOGOUT"),
            ("A1 SELECT INBOX", "SELECT"),
            ("A1 FETCH 1:2 ENVELOPE", "FETCH"),
        ];
        for (line, keyword) in lines.iter() {
            assert_eq!(parse(line).command.kind().keyword(), *keyword, "line {:?}", line);
        }
    }

    #[test]
    fn test_keywords_are_case_sensitive() {
        assert_eq!(parse("A1 capability").command, Command::Unknown);
        assert_eq!(parse("A1 Login alice secret").command, Command::Unknown);
    }

    #[test]
    fn test_parse_unknown_and_empty() {
        assert_eq!(parse("A1 NOOP").command, Command::Unknown);
        assert_eq!(parse("A1").command, Command::Unknown);

        let empty = parse("");
        assert_eq!(empty.tag, None);
        assert_eq!(empty.command, Command::Unknown);
    }

    #[test]
    fn test_parse_login() {
        let request = parse("A002 LOGIN username password");
        assert_eq!(
            request.command,
            Command::Login {
                credentials: Credentials::new("username", "password"),
            }
        );
    }

    #[test]
    fn test_parse_login_missing_password_is_malformed() {
        match parse("A002 LOGIN username").command {
            Command::Malformed { kind, .. } => assert_eq!(kind, CommandKind::Login),
            other => panic!("expected malformed LOGIN, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_select() {
        assert_eq!(
            parse("A003 SELECT INBOX").command,
            Command::Select {
                mailbox: "INBOX".to_string(),
            }
        );
        assert_eq!(
            parse("A003 SELECT \"Sent\"").command,
            Command::Select {
                mailbox: "Sent".to_string(),
            }
        );
        assert!(matches!(parse("A003 SELECT").command, Command::Malformed { .. }));
    }

    #[test]
    fn test_parse_fetch() {
        assert_eq!(
            parse("A4 FETCH 1,3:5 ENVELOPE").command,
            Command::Fetch {
                request_id: "A4".to_string(),
                item_set: set(&[1, 3, 4, 5]),
                attribute: "ENVELOPE".to_string(),
            }
        );
        assert!(matches!(
            parse("A4 FETCH x ENVELOPE").command,
            Command::Malformed { kind: CommandKind::Fetch, .. }
        ));
    }

    #[test]
    fn test_extract_credentials() {
        let creds = extract_credentials("A1 LOGIN alice secret").unwrap();
        assert_eq!(creds, Credentials::new("alice", "secret"));
    }

    #[test]
    fn test_extract_credentials_quoted_password() {
        let creds = extract_credentials("A1 LOGIN alice \"two words\"").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "two words");

        let creds = extract_credentials("A1 LOGIN \"alice\" \"secret\"").unwrap();
        assert_eq!(creds, Credentials::new("alice", "secret"));
    }

    #[test]
    fn test_extract_credentials_errors() {
        assert!(matches!(extract_credentials("A1 LOGIN alice"), Err(Error::Parse(_))));
        assert!(matches!(extract_credentials("A1 LOGIN"), Err(Error::Parse(_))));
        assert!(matches!(extract_credentials("A1 LOGIN a b c"), Err(Error::Parse(_))));
        assert!(matches!(extract_credentials("A1 SELECT a b"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_extract_credentials_quoting() {
        // Two quoted tokens are three arguments, not one password
        assert!(matches!(
            extract_credentials("A1 LOGIN alice \"x\" \"y\""),
            Err(Error::Parse(reason)) if reason == "LOGIN takes exactly two arguments"
        ));
        assert!(matches!(
            extract_credentials("A1 LOGIN alice \"open sesame"),
            Err(Error::Parse(_))
        ));

        let creds = extract_credentials(r#"A1 LOGIN alice "say \"hi\" \\o/""#).unwrap();
        assert_eq!(creds.password, r#"say "hi" \o/"#);
    }

    #[test]
    fn test_parse_item_set() {
        assert_eq!(parse_item_set("1,3:5,9").unwrap(), set(&[1, 3, 4, 5, 9]));
        assert_eq!(parse_item_set("4,2,2:3").unwrap(), set(&[2, 3, 4]));
        assert_eq!(parse_item_set("7").unwrap(), set(&[7]));
    }

    #[test]
    fn test_parse_item_set_reversed_range_is_empty() {
        assert_eq!(parse_item_set("5:3").unwrap(), set(&[]));
        assert_eq!(parse_item_set("5:3,8").unwrap(), set(&[8]));
    }

    #[test]
    fn test_parse_item_set_errors() {
        assert!(matches!(parse_item_set(""), Err(Error::Parse(_))));
        assert!(matches!(parse_item_set("1,a"), Err(Error::Parse(_))));
        assert!(matches!(parse_item_set("1:*"), Err(Error::Parse(_))));
        assert!(matches!(parse_item_set("-2"), Err(Error::Parse(_))));
        assert!(matches!(parse_item_set("1:4000000000"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_fetch_payload() {
        let (id, expr, attribute) = parse_fetch_payload("A9 FETCH 2:4 FLAGS").unwrap();
        assert_eq!(id, "A9");
        assert_eq!(expr, "2:4");
        assert_eq!(attribute, "FLAGS");

        assert!(matches!(parse_fetch_payload("A9 FETCH 2:4"), Err(Error::Parse(_))));
        assert!(matches!(parse_fetch_payload("A9 FETCH"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_fetch_attribute_from_str() {
        assert_eq!("ENVELOPE".parse::<FetchAttribute>().unwrap(), FetchAttribute::Envelope);
        assert_eq!("rfc822".parse::<FetchAttribute>().unwrap(), FetchAttribute::Rfc822);
        assert_eq!("(BODY[])".parse::<FetchAttribute>().unwrap(), FetchAttribute::Body);
        assert_eq!("FLAGS".parse::<FetchAttribute>().unwrap(), FetchAttribute::Flags);
        assert!(matches!(
            "BODYSTRUCTURE".parse::<FetchAttribute>(),
            Err(Error::UnsupportedAttribute(_))
        ));
    }

    #[test]
    fn test_render_fetch_attributes() {
        let mail = Mail::new(
            "alice@example.com",
            "bob@example.com",
            "Say \"hi\"",
            Utc.with_ymd_and_hms(2024, 10, 8, 9, 30, 0).unwrap(),
            "Hello Bob",
        );

        assert_eq!(
            FetchAttribute::Envelope.render(1, &mail),
            "1 FETCH (ENVELOPE (\"Tue, 8 Oct 2024 09:30:00 +0000\" \"Say \\\"hi\\\"\" \
             \"alice@example.com\" \"bob@example.com\"))"
        );
        assert_eq!(FetchAttribute::Rfc822.render(2, &mail), "2 FETCH (RFC822 {9}\r\nHello Bob)");
        assert_eq!(FetchAttribute::Body.render(2, &mail), "2 FETCH (BODY[] {9}\r\nHello Bob)");
        assert_eq!(FetchAttribute::Flags.render(3, &mail), "3 FETCH (FLAGS (\\Seen))");
    }

    #[test]
    fn test_response_format() {
        let resp = Response::Ok {
            tag: Some("A001".to_string()),
            message: "CAPABILITY completed".to_string(),
        };
        assert_eq!(resp.to_string(), "A001 OK CAPABILITY completed\r\n");
        assert_eq!(
            Response::bad_sequence(None).to_string(),
            "* BAD Bad sequence of commands\r\n"
        );
        assert_eq!(
            Response::Untagged {
                message: "CAPABILITY STARTTLS CAPABILITY".to_string(),
            }
            .to_string(),
            "* CAPABILITY STARTTLS CAPABILITY\r\n"
        );
    }
}
