//! Maintenance tool for the VSP server's signing identity.
//!
//! Generates the `sign_key` seed the server is configured with, and shows
//! the public key and address a seed corresponds to.

use clap::{Arg, ArgAction, ArgMatches, Command};

use vspd::crypto::{CryptoError, ServerSigner};
use vspd::model::{
    address::Address,
    network::{NetworkError, NetworkParams},
};

const PROGRAM_NAME: &str = "vspadmin";

const ABOUT_TEXT: &str = "Manage the signing identity of a VSP server.

EXIT CODES:
     0: Success.
     1: Invalid input.";

const SEED: &str = "SEED";
const NETWORK: &str = "network";

/// Construct the CLI configuration.
fn cli() -> Command {
    // Make the build dirty when the toml changes.
    include_str!("../Cargo.toml");

    let network = Arg::new(NETWORK)
        .long(NETWORK)
        .help("Also print the address of the key on this network")
        .value_parser(["mainnet", "testnet", "simnet"])
        .action(ArgAction::Set);

    clap::command!(PROGRAM_NAME)
        .about(ABOUT_TEXT)
        .subcommand_required(true)
        .subcommand(
            Command::new("keygen")
                .about("Generate a new signing seed for the `sign_key` setting")
                .arg(network.clone()),
        )
        .subcommand(
            Command::new("pubkey")
                .about("Print the public key clients will see for a seed")
                .arg(
                    Arg::new(SEED)
                        .help("Hex-encoded 32 byte seed")
                        .action(ArgAction::Set)
                        .required(true),
                )
                .arg(network),
        )
}

/// Errors that this program may produce.
#[derive(Debug)]
enum Error {
    Seed(CryptoError),
    Network(NetworkError),
}

/// The lines to print for a signing identity.
fn describe(signer: &ServerSigner, network: Option<&String>) -> Result<Vec<String>, Error> {
    let mut lines = vec![format!("pubkey: {}", signer.public_key_base64())];
    if let Some(name) = network {
        let params = NetworkParams::from_name(name).map_err(Error::Network)?;
        let address = Address::from_public_key(&params, &signer.public_key());
        lines.push(format!("address: {address}"));
    }
    Ok(lines)
}

fn execute(args: &ArgMatches) -> Result<Vec<String>, Error> {
    match args.subcommand() {
        Some(("keygen", sub)) => {
            let signer = ServerSigner::generate();
            let mut lines = vec![format!("sign_key: {}", signer.seed_hex())];
            lines.extend(describe(&signer, sub.get_one(NETWORK))?);
            Ok(lines)
        }
        Some(("pubkey", sub)) => {
            let seed: &String = sub.get_one(SEED).unwrap(); // Required argument is guaranteed to be present.
            let signer = ServerSigner::from_hex_seed(seed).map_err(Error::Seed)?;
            describe(&signer, sub.get_one(NETWORK))
        }
        _ => unreachable!("subcommand is required"),
    }
}

/// Run the command, report the result, and return the exit code.
fn run(args: &ArgMatches) -> u8 {
    match execute(args) {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            0
        }
        Err(Error::Seed(e)) => {
            eprintln!("Invalid seed: {e}");
            1
        }
        Err(Error::Network(e)) => {
            eprintln!("Invalid network: {e}");
            1
        }
    }
}

fn main() {
    let args = cli().get_matches();
    let exit_code = run(&args);
    std::process::exit(exit_code.into())
}
