use crate::relay::{HOST, PORT, RelayConfig, protocol::DEFAULT_MAX_LINE_LENGTH};
use crate::tracer::LogFormat;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(version, about = "Two-window chat relay for telnet clients")]
pub struct Args {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[clap(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the relay server
    Serve {
        #[arg(long, default_value = HOST)]
        host: String,
        #[arg(short, long, default_value_t = PORT)]
        port: u16,
        /// Longest accepted input line, in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
        max_line_length: usize,
    },
}

impl Command {
    pub fn relay_config(&self) -> RelayConfig {
        match self {
            Command::Serve {
                host,
                port,
                max_line_length,
            } => RelayConfig {
                host: host.clone(),
                port: *port,
                max_line_length: *max_line_length,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["relay-chat", "serve"])?;
        assert_eq!(args.log_format, LogFormat::Text);
        let config = args.cmd.relay_config();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9999);
        assert_eq!(config.max_line_length, 16384);
        Ok(())
    }

    #[test]
    fn serve_overrides() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "relay-chat",
            "--log-format",
            "json",
            "serve",
            "--host",
            "0.0.0.0",
            "-p",
            "4000",
            "--max-line-length",
            "512",
        ])?;
        assert_eq!(args.log_format, LogFormat::Json);
        let config = args.cmd.relay_config();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_line_length, 512);
        Ok(())
    }

    #[test]
    fn port_must_be_a_number() {
        assert!(Args::try_parse_from(["relay-chat", "serve", "--port", "telnet"]).is_err());
    }
}
