pub mod broker;
pub mod protocol;
pub mod session;

use crate::Result;
use broker::BrokerTx;
use protocol::{DEFAULT_MAX_LINE_LENGTH, ParticipantIds};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, error, info, info_span};

pub const HOST: &str = "127.0.0.1";
pub const PORT: u16 = 9999;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub max_line_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: HOST.to_string(),
            port: PORT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

pub async fn run(config: RelayConfig) -> Result<()> {
    let address = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&address).await?;
    info!("relay listening on {}", address);

    serve(listener, config).await
}

/// Accepts connections forever, one session task per connection.
pub async fn serve(listener: TcpListener, config: RelayConfig) -> Result<()> {
    let broker = BrokerTx::spawn();
    let ids = ParticipantIds::new();

    loop {
        let (socket, address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("failed to accept connection: {}", e);
                continue;
            }
        };

        let id = ids.next();
        debug!("connection from {} is participant {}", address, id);

        let span = info_span!("session", participant = %id);
        let session = session::handle_client(broker.clone(), id, socket, config.max_line_length);
        tokio::spawn(
            async move {
                info!("session started");
                match session.await {
                    Ok(()) => info!("session ended"),
                    Err(e) => error!("session ended with error: {}", e),
                }
            }
            .instrument(span),
        );
    }
}
