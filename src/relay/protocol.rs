use crate::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

/// Terminator appended to every broadcast line: newline, then carriage return.
pub const LINE_END: &str = "\n\r";

/// Default bound on an inbound line, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16384;

static ENVELOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)\|(.*)$").expect("valid envelope pattern"));

static COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/([^ ]+) ? *(.*?) *$").expect("valid command pattern"));

static PSEUDONYM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]{2,25}$").expect("valid pseudonym pattern")
});

#[derive(derive_more::Display, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(u64);

impl ParticipantId {
    /// Well-known identity of the broker. Participants are numbered after it.
    pub const BROKER: ParticipantId = ParticipantId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn parse(input: &str) -> Result<ParticipantId> {
        input
            .parse::<u64>()
            .map(ParticipantId)
            .map_err(|e| Error::InvalidProtocol(format!("bad participant id {input:?}: {e}")))
    }
}

/// Hands out participant ids in accept order. Ids are never reused while the
/// process lives, so a new connection cannot inherit a stale pairing.
#[derive(Debug)]
pub struct ParticipantIds {
    next: AtomicU64,
}

impl ParticipantIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(ParticipantId::BROKER.0 + 1),
        }
    }

    pub fn next(&self) -> ParticipantId {
        ParticipantId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a reader's private mailbox carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Mail {
    /// A formatted line, terminator included, written to the connection verbatim.
    Line(String),
    /// Reserved token: the reader window should say goodbye and close.
    Shutdown,
}

pub type Mailbox = mpsc::UnboundedSender<Mail>;

// The closed set of slash commands understood by the broker
#[derive(derive_more::Display, Debug, Clone, PartialEq)]
pub enum Command {
    #[display("/connect {}", _0)]
    Connect(ParticipantId),
    #[display("/pseudo {}", _0)]
    Pseudo(String),
    #[display("/quit")]
    Quit,
    #[display("/me {}", _0)]
    Me(String),
    #[display("/{}", _0)]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Chat(String),
    Command(Command),
}

impl Payload {
    /// A payload starting with `/` is a command, anything else is chat text.
    pub fn parse(text: &str) -> Result<Payload> {
        if !text.starts_with('/') {
            return Ok(Payload::Chat(text.to_string()));
        }
        let Some(captures) = COMMAND.captures(text) else {
            return Ok(Payload::Command(Command::Unknown(String::new())));
        };
        let name = &captures[1];
        let arg = captures.get(2).map_or("", |m| m.as_str());

        let command = match name {
            "connect" => Command::Connect(ParticipantId::parse(arg)?),
            "pseudo" => Command::Pseudo(arg.trim().to_string()),
            "quit" => Command::Quit,
            "me" => Command::Me(arg.to_string()),
            other => Command::Unknown(other.to_string()),
        };
        Ok(Payload::Command(command))
    }
}

/// One addressed unit on the broker's inbound channel, `<identity>|<text>` on the wire.
#[derive(derive_more::Display, Debug, Clone, PartialEq)]
#[display("{}|{}", sender, text)]
pub struct Envelope {
    pub sender: ParticipantId,
    pub text: String,
}

impl Envelope {
    pub fn chat(sender: ParticipantId, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
        }
    }

    pub fn command(sender: ParticipantId, command: &Command) -> Self {
        Self {
            sender,
            text: command.to_string(),
        }
    }

    pub fn parse(raw: &str) -> Result<Envelope> {
        let captures = ENVELOPE
            .captures(raw)
            .ok_or_else(|| Error::InvalidProtocol(format!("malformed envelope {raw:?}")))?;
        Ok(Envelope {
            sender: ParticipantId::parse(&captures[1])?,
            text: captures[2].to_string(),
        })
    }
}

/// How a line typed before pairing is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginInput {
    Code(String),
    Pseudonym(String),
    Invalid,
}

impl LoginInput {
    pub fn classify(line: &str) -> LoginInput {
        if !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()) {
            LoginInput::Code(line.to_string())
        } else if PSEUDONYM.is_match(line) {
            LoginInput::Pseudonym(line.to_string())
        } else {
            LoginInput::Invalid
        }
    }
}

pub fn is_quit(line: &str) -> bool {
    matches!(line, "/quit" | "/q" | "/exit")
}

// everything the server writes to a connection
#[derive(derive_more::Display, Clone, Debug, PartialEq)]
pub enum OutgoingMessage {
    #[display("Welcome to the relay!\n\n\rEnter a pseudonym or a code: ")]
    Welcome,
    #[display(
        "\n    Thanks, your pseudonym is {}!\n\r\nOpen another terminal and enter the following code: {}\n\rDo not close this window, the conversation is displayed here.\n\n\r",
        name,
        code
    )]
    ReaderReady { name: String, code: ParticipantId },
    #[display("\nType your messages here (/quit to leave): \n\r\n\r> ")]
    WriterReady,
    #[display("Code not found [{}].\n\r", _0)]
    CodeNotFound(String),
    #[display(
        "\nThe chosen pseudonym is not valid, \n\ror the code is wrong.\n\rPlease choose a simple name or enter the code again.\n\n\rCode or pseudonym: "
    )]
    SyntaxError,
    #[display("> ")]
    ChatPrompt,
    #[display("\n\rWindow inactive. You can close your terminal.\n\r")]
    Goodbye,
    #[display("{}", _0)]
    Broadcast(String),
}

/// Newline-delimited input, raw text output. Prompts are written without a
/// terminator so the cursor stays on the prompt line.
///
/// Input bytes that are not UTF-8 (Latin-1 terminals, telnet control
/// sequences) are replaced rather than rejected.
pub struct RelayCodec {
    max_line_length: usize,
    // where the newline search resumes on the next call
    next_index: usize,
}

impl RelayCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
        }
    }

    fn text(line: &[u8]) -> String {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        String::from_utf8_lossy(line).into_owned()
    }
}

impl Encoder<OutgoingMessage> for RelayCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: OutgoingMessage, dst: &mut bytes::BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}

impl Decoder for RelayCodec {
    type Item = String;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>> {
        let read_to = src.len().min(self.max_line_length.saturating_add(1));
        match src[self.next_index..read_to].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = self.next_index + offset;
                self.next_index = 0;
                let line = src.split_to(newline + 1);
                Ok(Some(Self::text(&line[..newline])))
            }
            None if src.len() > self.max_line_length => {
                Err(Error::LineTooLong(self.max_line_length))
            }
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let line = src.split_to(src.len());
        Ok(Some(Self::text(&line)))
    }
}
