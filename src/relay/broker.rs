use super::protocol::*;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug)]
pub enum BrokerMessage {
    /// A raw `<identity>|<text>` line.
    Envelope(String),
    Activate {
        reader: ParticipantId,
        mailbox: Mailbox,
    },
    Deactivate {
        reader: ParticipantId,
    },
    Lookup {
        code: ParticipantId,
        reply: oneshot::Sender<Option<Mailbox>>,
    },
}

/// Handle on the broker's shared inbound channel. Cloned into every session.
#[derive(Debug, Clone)]
pub struct BrokerTx {
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

impl BrokerTx {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            run_broker(rx).instrument(info_span!("broker", id = %ParticipantId::BROKER)),
        );
        BrokerTx { sender: tx }
    }

    fn send(&self, msg: BrokerMessage) -> Result<()> {
        self.sender.send(msg).map_err(|_| Error::BrokerClosed)
    }

    pub fn post(&self, envelope: &Envelope) -> Result<()> {
        self.send(BrokerMessage::Envelope(envelope.to_string()))
    }

    pub fn activate(&self, reader: ParticipantId, mailbox: Mailbox) -> Result<()> {
        self.send(BrokerMessage::Activate { reader, mailbox })
    }

    pub fn deactivate(&self, reader: ParticipantId) -> Result<()> {
        self.send(BrokerMessage::Deactivate { reader })
    }

    /// Mailbox of the reader registered under `code`, if that reader is active.
    pub async fn lookup(&self, code: ParticipantId) -> Result<Option<Mailbox>> {
        let (reply, response) = oneshot::channel();
        self.send(BrokerMessage::Lookup { code, reply })?;
        response.await.map_err(|_| Error::BrokerClosed)
    }
}

/// A formatted line and the readers it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub line: String,
    pub recipients: BTreeSet<ParticipantId>,
}

/// All shared chat state. Only the broker task holds one.
#[derive(Debug, Default)]
pub struct ChatState {
    pseudonyms: HashMap<ParticipantId, String>,
    active: HashMap<ParticipantId, bool>,
    pairings: HashMap<ParticipantId, ParticipantId>,
    mailboxes: HashMap<ParticipantId, Mailbox>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, reader: ParticipantId, mailbox: Mailbox) {
        self.active.insert(reader, true);
        self.mailboxes.insert(reader, mailbox);
    }

    pub fn deactivate(&mut self, reader: ParticipantId) {
        self.active.insert(reader, false);
        self.mailboxes.remove(&reader);
    }

    pub fn lookup(&self, code: ParticipantId) -> Option<Mailbox> {
        match self.active.get(&code) {
            Some(true) => self.mailboxes.get(&code).cloned(),
            _ => None,
        }
    }

    pub fn pseudonym(&self, id: ParticipantId) -> Option<&str> {
        self.pseudonyms.get(&id).map(String::as_str)
    }

    pub fn paired_reader(&self, writer: ParticipantId) -> Option<ParticipantId> {
        self.pairings.get(&writer).copied()
    }

    /// Applies one envelope to the tables and returns the line to fan out, if any.
    pub fn process(&mut self, raw: &str) -> Option<Broadcast> {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("discarding envelope: {}", e);
                return None;
            }
        };
        if envelope.text.is_empty() {
            return None;
        }
        let sender = envelope.sender;

        let payload = match Payload::parse(&envelope.text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("discarding command from {}: {}", sender, e);
                return None;
            }
        };

        let mut explicit_name = None;
        let (is_command, text) = match payload {
            Payload::Chat(text) => (false, text),
            Payload::Command(Command::Connect(reader)) => {
                if let Some(current) = self.paired_reader(sender) {
                    warn!("{} is already paired with {}, ignoring connect", sender, current);
                    return None;
                }
                if self.active.get(&reader) != Some(&true) {
                    warn!("{} tried to pair with inactive reader {}", sender, reader);
                    return None;
                }
                info!("pairing writer {} with reader {}", sender, reader);
                self.pairings.insert(sender, reader);
                (true, "just joined us.".to_string())
            }
            Payload::Command(Command::Pseudo(name)) => {
                // A writer speaks under its reader's name and cannot take one of its own
                if self.pairings.contains_key(&sender) {
                    warn!("writer {} tried to register pseudonym {:?}", sender, name);
                    return None;
                }
                info!("registering pseudonym {:?} for {}", name, sender);
                self.pseudonyms.insert(sender, name.clone());
                explicit_name = Some(name);
                (true, "is joining the channel...".to_string())
            }
            Payload::Command(Command::Quit) => (true, "just left us.".to_string()),
            Payload::Command(Command::Me(text)) => {
                if text.is_empty() {
                    return None;
                }
                (true, text)
            }
            Payload::Command(Command::Unknown(name)) => {
                warn!("command not found: {:?} from {}", name, sender);
                return None;
            }
        };

        if self.pairings.is_empty() {
            return None;
        }

        // Writers speak under their paired reader's name
        let name = match explicit_name {
            Some(name) => name,
            None => {
                let Some(name) = self
                    .paired_reader(sender)
                    .and_then(|reader| self.pseudonym(reader))
                else {
                    warn!("no pseudonym resolvable for {}, dropping {:?}", sender, text);
                    return None;
                };
                name.to_string()
            }
        };

        let line = if is_command {
            format!("* {} {}{}", name, text, LINE_END)
        } else {
            format!("{}> {}{}", name, text, LINE_END)
        };
        let recipients = self.pairings.values().copied().collect();
        Some(Broadcast { line, recipients })
    }

    /// Returns how many readers the line reached.
    pub fn deliver(&self, broadcast: Broadcast) -> usize {
        info!("broadcast: [{}]", broadcast.line.trim());
        let mut delivered = 0;
        for reader in broadcast.recipients {
            // Pairings outlive their readers
            let Some(mailbox) = self.mailboxes.get(&reader) else {
                debug!("reader {} has left, dropping delivery", reader);
                continue;
            };
            if mailbox.send(Mail::Line(broadcast.line.clone())).is_err() {
                warn!("unable to deliver to reader {}: mailbox closed", reader);
                continue;
            }
            delivered += 1;
        }
        delivered
    }
}

// Owns the ChatState; every mutation happens here, one message at a time.
async fn run_broker(mut receiver: mpsc::UnboundedReceiver<BrokerMessage>) {
    info!("message broker started");
    let mut state = ChatState::new();

    while let Some(msg) = receiver.recv().await {
        match msg {
            BrokerMessage::Envelope(raw) => {
                if raw.is_empty() {
                    error!("received an empty envelope, stopping broker");
                    return;
                }
                debug!("received envelope: {}", raw);
                if let Some(broadcast) = state.process(&raw) {
                    state.deliver(broadcast);
                }
            }
            BrokerMessage::Activate { reader, mailbox } => {
                debug!("reader {} is active", reader);
                state.activate(reader, mailbox);
            }
            BrokerMessage::Deactivate { reader } => {
                debug!("reader {} is gone", reader);
                state.deactivate(reader);
            }
            BrokerMessage::Lookup { code, reply } => {
                let _ = reply.send(state.lookup(code));
            }
        }
    }

    error!("broker channel closed, stopping broker");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ParticipantId {
        ParticipantId::new(n)
    }

    fn reader(state: &mut ChatState, n: u64) -> mpsc::UnboundedReceiver<Mail> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.activate(id(n), tx);
        rx
    }

    #[test]
    fn nothing_is_broadcast_before_anyone_pairs() {
        let mut state = ChatState::new();
        let _rx = reader(&mut state, 1);

        assert_eq!(state.process("1|/pseudo alice"), None);
        assert_eq!(state.pseudonym(id(1)), Some("alice"));
        assert_eq!(state.process("2|hello"), None);
    }

    #[test]
    fn connect_announces_the_paired_reader() {
        let mut state = ChatState::new();
        let _rx = reader(&mut state, 1);
        state.process("1|/pseudo alice");

        let broadcast = state.process("2|/connect 1").unwrap();
        assert_eq!(state.paired_reader(id(2)), Some(id(1)));
        assert_eq!(broadcast.line, "* alice just joined us.\n\r");
        assert_eq!(broadcast.recipients, BTreeSet::from([id(1)]));
    }

    #[test]
    fn chat_uses_the_writers_paired_reader_name() {
        let mut state = ChatState::new();
        let _alice = reader(&mut state, 1);
        let _bob = reader(&mut state, 3);
        state.process("1|/pseudo alice");
        state.process("3|/pseudo bob");
        state.process("2|/connect 1");
        state.process("4|/connect 3");

        let broadcast = state.process("2|hello").unwrap();
        assert_eq!(broadcast.line, "alice> hello\n\r");
        assert_eq!(broadcast.recipients, BTreeSet::from([id(1), id(3)]));

        let broadcast = state.process("4|hi alice").unwrap();
        assert_eq!(broadcast.line, "bob> hi alice\n\r");
    }

    #[test]
    fn pseudo_after_pairing_is_announced_under_the_new_name() {
        let mut state = ChatState::new();
        let _alice = reader(&mut state, 1);
        state.process("1|/pseudo alice");
        state.process("2|/connect 1");

        let broadcast = state.process("3|/pseudo   carol ").unwrap();
        assert_eq!(broadcast.line, "* carol is joining the channel...\n\r");
        assert_eq!(state.pseudonym(id(3)), Some("carol"));
    }

    #[test]
    fn re_registering_a_pseudonym_overwrites() {
        let mut state = ChatState::new();
        let _alice = reader(&mut state, 1);
        state.process("1|/pseudo alice");
        state.process("1|/pseudo alicia");
        assert_eq!(state.pseudonym(id(1)), Some("alicia"));

        state.process("2|/connect 1");
        assert_eq!(state.process("2|hey").unwrap().line, "alicia> hey\n\r");
    }

    #[test]
    fn me_and_quit_are_formatted_as_actions() {
        let mut state = ChatState::new();
        let _alice = reader(&mut state, 1);
        state.process("1|/pseudo alice");
        state.process("2|/connect 1");

        assert_eq!(
            state.process("2|/me waves").unwrap().line,
            "* alice waves\n\r"
        );
        assert_eq!(
            state.process("2|/quit ").unwrap().line,
            "* alice just left us.\n\r"
        );
    }

    #[test]
    fn dropped_envelopes() {
        let mut state = ChatState::new();
        let _alice = reader(&mut state, 1);
        state.process("1|/pseudo alice");
        state.process("2|/connect 1");

        // empty /me
        assert_eq!(state.process("2|/me"), None);
        assert_eq!(state.process("2|/me   "), None);
        // unknown command
        assert_eq!(state.process("2|/dance"), None);
        // malformed
        assert_eq!(state.process("hello"), None);
        assert_eq!(state.process("x|hello"), None);
        // empty payload
        assert_eq!(state.process("2|"), None);
        // bad connect argument leaves the table alone
        assert_eq!(state.process("5|/connect alice"), None);
        assert_eq!(state.paired_reader(id(5)), None);
        // sender without a paired reader
        assert_eq!(state.process("9|orphan"), None);
    }

    #[test]
    fn recipients_are_distinct_readers() {
        let mut state = ChatState::new();
        let _alice = reader(&mut state, 1);
        state.process("1|/pseudo alice");
        state.process("2|/connect 1");
        state.process("3|/connect 1");

        let broadcast = state.process("3|hello").unwrap();
        assert_eq!(broadcast.recipients, BTreeSet::from([id(1)]));
    }

    #[test]
    fn connect_requires_an_active_reader() {
        let mut state = ChatState::new();
        let _alice = reader(&mut state, 1);
        state.process("1|/pseudo alice");

        // never active
        assert_eq!(state.process("2|/connect 999"), None);
        assert_eq!(state.paired_reader(id(2)), None);

        // no longer active
        let _bob = reader(&mut state, 3);
        state.deactivate(id(3));
        assert_eq!(state.process("2|/connect 3"), None);
        assert_eq!(state.paired_reader(id(2)), None);
    }

    #[test]
    fn paired_writer_cannot_repair_or_rename() {
        let mut state = ChatState::new();
        let _alice = reader(&mut state, 1);
        let _bob = reader(&mut state, 3);
        state.process("1|/pseudo alice");
        state.process("3|/pseudo bob");
        state.process("2|/connect 1");

        assert_eq!(state.process("2|/connect 999"), None);
        assert_eq!(state.process("2|/connect 3"), None);
        assert_eq!(state.paired_reader(id(2)), Some(id(1)));

        assert_eq!(state.process("2|/pseudo mallory"), None);
        assert_eq!(state.pseudonym(id(2)), None);
        assert_eq!(state.process("2|hi").unwrap().line, "alice> hi\n\r");
    }

    #[test]
    fn departed_readers_get_nothing() {
        let mut state = ChatState::new();
        let mut alice = reader(&mut state, 1);
        let mut bob = reader(&mut state, 3);
        state.process("1|/pseudo alice");
        state.process("3|/pseudo bob");
        state.process("2|/connect 1");
        state.process("4|/connect 3");
        let _ = state.process("2|/quit");
        state.deactivate(id(1));

        let broadcast = state.process("4|anyone there").unwrap();
        assert_eq!(broadcast.recipients, BTreeSet::from([id(1), id(3)]));
        assert_eq!(state.deliver(broadcast), 1);

        assert_eq!(
            bob.try_recv().unwrap(),
            Mail::Line("bob> anyone there\n\r".into())
        );
        assert!(alice.try_recv().is_err());
    }

    #[test]
    fn lookup_requires_an_active_reader() {
        let mut state = ChatState::new();
        assert!(state.lookup(id(1)).is_none());

        let _rx = reader(&mut state, 1);
        assert!(state.lookup(id(1)).is_some());

        state.deactivate(id(1));
        assert!(state.lookup(id(1)).is_none());
    }

    #[test]
    fn delivery_skips_closed_mailboxes() {
        let mut state = ChatState::new();
        let gone = reader(&mut state, 1);
        let mut alive = reader(&mut state, 3);
        drop(gone);
        state.process("1|/pseudo alice");
        state.process("3|/pseudo bob");
        state.process("2|/connect 1");
        state.process("4|/connect 3");

        let broadcast = state.process("4|still here").unwrap();
        assert_eq!(state.deliver(broadcast), 1);

        assert_eq!(
            alive.try_recv().unwrap(),
            Mail::Line("bob> still here\n\r".into())
        );
    }

    #[tokio::test]
    async fn broker_task_fans_out_to_mailboxes() {
        let broker = BrokerTx::spawn();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(broker.lookup(id(1)).await.unwrap().is_none());

        broker.activate(id(1), tx).unwrap();
        assert!(broker.lookup(id(1)).await.unwrap().is_some());

        broker
            .post(&Envelope::command(id(1), &Command::Pseudo("alice".into())))
            .unwrap();
        broker
            .post(&Envelope::command(id(2), &Command::Connect(id(1))))
            .unwrap();
        broker.post(&Envelope::chat(id(2), "/me")).unwrap();
        broker.post(&Envelope::chat(id(2), "hello")).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Mail::Line("* alice just joined us.\n\r".into()))
        );
        assert_eq!(
            rx.recv().await,
            Some(Mail::Line("alice> hello\n\r".into()))
        );
    }

    #[tokio::test]
    async fn empty_envelope_stops_the_broker() {
        let broker = BrokerTx::spawn();
        broker
            .sender
            .send(BrokerMessage::Envelope(String::new()))
            .unwrap();

        assert!(matches!(
            broker.lookup(id(1)).await,
            Err(Error::BrokerClosed)
        ));
    }
}
