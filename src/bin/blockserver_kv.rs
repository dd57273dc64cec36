//! CLI entry point for blockserver-kv: read and write records in a cluster.

use blockserver::client::{Client, ClientOutcome};
use blockserver::config::load_peers_file;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "blockserver-kv", about = "Block server key-value client")]
struct Cli {
    /// Comma-separated server addresses.
    #[arg(long, value_delimiter = ',')]
    servers: Vec<String>,

    /// File with one server address per line, used when --servers is empty.
    #[arg(long)]
    servers_file: Option<String>,

    /// Access token issued by the metadata service.
    #[arg(long, env = "BLOCKSERVER_TOKEN")]
    token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stored value of a key
    Get { key: String },
    /// Create (version 0) or update a key with a JSON object
    Put {
        key: String,
        /// JSON object to store.
        value: String,
        /// Version the update is based on; 0 creates.
        #[arg(long, default_value_t = 0)]
        version: u64,
    },
    /// Delete a key
    Delete { key: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let rc = match run(cli).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(err) => {
            eprintln!("error: {err:#}");
            2
        }
    };
    std::process::exit(rc);
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let servers = match (&cli.servers_file, cli.servers.is_empty()) {
        (Some(path), true) => load_peers_file(path)?,
        _ => cli.servers,
    };
    let client = Client::new(servers, cli.token)?;

    let outcome = match cli.command {
        Commands::Get { key } => client.get(&key).await?,
        Commands::Put {
            key,
            value,
            version,
        } => {
            let document = match serde_json::from_str::<serde_json::Value>(&value)? {
                serde_json::Value::Object(map) => map,
                _ => anyhow::bail!("value must be a JSON object"),
            };
            client.put(&key, document, version).await?
        }
        Commands::Delete { key } => client.delete(&key).await?,
    };

    match outcome {
        ClientOutcome::Success(record) => {
            println!("{}\t{}", record.key, record.value);
            Ok(true)
        }
        ClientOutcome::Failed { error, message } => {
            eprintln!("{error}: {message}");
            Ok(false)
        }
    }
}
