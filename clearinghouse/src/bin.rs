use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

/// A distributed clearinghouse node: run it as a branch server or as an
/// interactive client.
#[derive(Parser, Debug)]
#[command(name = "clearinghouse", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Increase log verbosity (-v for debug, -vv for trace). Ignored by
    /// `client`, which never logs to stdout.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run one branch of the clearinghouse, listening for peers and clients.
    Server {
        /// This branch's id, as listed in `config_path`.
        branch_id: String,
        /// Path to the branch config file (`<id> <host> <port>` per line).
        config_path: PathBuf,
    },
    /// Run an interactive client REPL against the first branch in the config.
    Client {
        /// An id identifying this client to the branch it connects to.
        client_id: String,
        /// Path to the branch config file.
        config_path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match &cli.command {
        Cmd::Server { branch_id, config_path } => {
            clearinghouse::run_server(branch_id, config_path, cli.verbose)
        }
        Cmd::Client { client_id, config_path } => {
            clearinghouse::run_client(client_id, config_path)
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("clearinghouse: {e:?}");
            ExitCode::FAILURE
        }
    }
}
