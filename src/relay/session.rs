use super::broker::BrokerTx;
use super::protocol::*;
use crate::{Error, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

enum SessionState {
    AwaitingCodeOrName,
    PairedWriter { reader: ParticipantId, mailbox: Mailbox },
}

pub async fn handle_client<T>(
    broker: BrokerTx,
    id: ParticipantId,
    socket: T,
    max_line_length: usize,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = Framed::new(socket, RelayCodec::new(max_line_length)).split();
    handle_client_internal(broker, id, sink, stream).await
}

pub(crate) async fn handle_client_internal<I, O>(
    broker: BrokerTx,
    id: ParticipantId,
    mut sink: O,
    mut stream: I,
) -> Result<()>
where
    I: Stream<Item = Result<String>> + Unpin,
    O: Sink<OutgoingMessage, Error = Error> + Unpin,
{
    sink.send(OutgoingMessage::Welcome).await?;

    let mut state = SessionState::AwaitingCodeOrName;
    while let Some(line) = stream.next().await {
        let line = line?;
        let line = line.trim_end();
        debug!("received line: {:?}", line);

        if let SessionState::PairedWriter { reader, mailbox } = &state {
            if is_quit(line) {
                quit_writer(&broker, id, *reader, mailbox, &mut sink).await;
                return Ok(());
            }
            post(&broker, Envelope::chat(id, line));
            sink.send(OutgoingMessage::ChatPrompt).await?;
            continue;
        }

        match LoginInput::classify(line) {
            LoginInput::Code(code) => match lookup_reader(&broker, &code).await {
                Some((reader, mailbox)) => {
                    info!("paired as writer for reader {}", reader);
                    post(&broker, Envelope::command(id, &Command::Connect(reader)));
                    state = SessionState::PairedWriter { reader, mailbox };
                    sink.send(OutgoingMessage::WriterReady).await?;
                }
                None => {
                    sink.send(OutgoingMessage::CodeNotFound(code)).await?;
                }
            },
            LoginInput::Pseudonym(name) => {
                return run_reader(broker, id, name, sink, stream).await;
            }
            LoginInput::Invalid => {
                sink.send(OutgoingMessage::SyntaxError).await?;
            }
        }
    }

    debug!("connection closed");
    Ok(())
}

async fn lookup_reader(broker: &BrokerTx, code: &str) -> Option<(ParticipantId, Mailbox)> {
    // Codes too large for an id can never match
    let reader = ParticipantId::parse(code).ok()?;
    match broker.lookup(reader).await {
        Ok(mailbox) => mailbox.map(|mailbox| (reader, mailbox)),
        Err(e) => {
            error!("unable to look up code {}: {}", code, e);
            None
        }
    }
}

fn post(broker: &BrokerTx, envelope: Envelope) {
    if let Err(e) = broker.post(&envelope) {
        error!("unable to post {:?} to the broker: {}", envelope.text, e);
    }
}

async fn quit_writer<O>(
    broker: &BrokerTx,
    id: ParticipantId,
    reader: ParticipantId,
    mailbox: &Mailbox,
    sink: &mut O,
) where
    O: Sink<OutgoingMessage, Error = Error> + Unpin,
{
    info!("writer quits, closing reader {}", reader);
    post(broker, Envelope::command(id, &Command::Quit));
    if mailbox.send(Mail::Shutdown).is_err() {
        warn!("reader {} already gone", reader);
    }
    if let Err(e) = sink.send(OutgoingMessage::Goodbye).await {
        warn!("unable to send goodbye to writer: {}", e);
    }
}

// A named reader only displays what lands in its mailbox. Input is ignored
// until the connection closes.
async fn run_reader<I, O>(
    broker: BrokerTx,
    id: ParticipantId,
    name: String,
    mut sink: O,
    mut stream: I,
) -> Result<()>
where
    I: Stream<Item = Result<String>> + Unpin,
    O: Sink<OutgoingMessage, Error = Error> + Unpin,
{
    let (mailbox, mut receiver) = mpsc::unbounded_channel();
    if let Err(e) = broker.activate(id, mailbox) {
        error!("unable to register reader mailbox: {}", e);
    }
    post(&broker, Envelope::command(id, &Command::Pseudo(name.clone())));
    info!("registered as reader {:?}", name);

    let result = reader_loop(id, name, &mut sink, &mut stream, &mut receiver).await;

    if let Err(e) = broker.deactivate(id) {
        debug!("unable to deactivate reader: {}", e);
    }
    result
}

async fn reader_loop<I, O>(
    id: ParticipantId,
    name: String,
    sink: &mut O,
    stream: &mut I,
    receiver: &mut mpsc::UnboundedReceiver<Mail>,
) -> Result<()>
where
    I: Stream<Item = Result<String>> + Unpin,
    O: Sink<OutgoingMessage, Error = Error> + Unpin,
{
    sink.send(OutgoingMessage::ReaderReady { name, code: id }).await?;

    loop {
        tokio::select! {
            mail = receiver.recv() => match mail {
                Some(Mail::Line(line)) => {
                    if let Err(e) = sink.send(OutgoingMessage::Broadcast(line)).await {
                        error!("unable to write to reader: {}", e);
                    }
                }
                Some(Mail::Shutdown) => {
                    info!("shutdown requested by writer");
                    if let Err(e) = sink.send(OutgoingMessage::Goodbye).await {
                        warn!("unable to send goodbye to reader: {}", e);
                    }
                    return Ok(());
                }
                None => {
                    warn!("mailbox closed");
                    return Ok(());
                }
            },
            line = stream.next() => match line {
                Some(Ok(line)) => {
                    debug!("ignoring input on reader window: {:?}", line);
                }
                Some(Err(e)) => {
                    error!("error reading from reader window: {}", e);
                    return Err(e);
                }
                None => {
                    debug!("reader window closed");
                    return Ok(());
                }
            },
        }
    }
}
