use std::path::PathBuf;
use std::process;

use clap::Parser;

use peerback::commands::{backup, encrypt};
use peerback::DEFAULT_STUN_SERVER;

#[derive(Parser)]
#[command(name = "peerback")]
#[command(about = "Peer-to-peer backup over a WebRTC data channel with FILE.io signaling")]
#[command(version)]
struct Cli {
    /// Run in the encryption mode to generate a persistent file with the
    /// encrypted archive passwords for later backup-mode runs
    #[arg(short = 'e', long, requires = "passfile")]
    encrypt: bool,

    /// First-level (inner) zip password
    #[arg(short = '1', long, default_value = "")]
    password1: String,

    /// Second-level (outer) zip password
    #[arg(short = '2', long, default_value = "")]
    password2: String,

    /// Common UUID (session ID) shared by the pair of peers
    #[arg(short = 'u', long, default_value = "")]
    uuid: String,

    /// STUN servers used for ICE
    #[arg(short = 'S', long, default_value = DEFAULT_STUN_SERVER)]
    stun: Vec<String>,

    /// FILE.io API key for signaling
    #[arg(short = 'a', long, default_value = "")]
    apikey: String,

    /// Send the source directory as a doubly-zipped archive
    #[arg(short = 'z', long)]
    zipdir: bool,

    /// Source file or directory to send to the other peer; when unset this
    /// instance receives instead
    #[arg(short = 's', long)]
    srcentry: Option<PathBuf>,

    /// Output filename for the zipped source directory
    #[arg(short = 'o', long)]
    outfile: Option<String>,

    /// Destination directory for received files
    #[arg(short = 'd', long)]
    dstdir: Option<PathBuf>,

    /// Number of retained versions of received files with the same name
    #[arg(short = 'v', long, default_value_t = 1)]
    versions: u16,

    /// Path to the encrypted-password file
    #[arg(short = 'p', long)]
    passfile: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let result = if cli.encrypt {
        encrypt::run(encrypt::EncryptArgs {
            password1: cli.password1,
            password2: cli.password2,
            // `requires` on --encrypt guarantees the flag is present.
            passfile: cli.passfile.unwrap_or_default(),
        })
    } else {
        backup::run(backup::BackupArgs {
            session_id: cli.uuid,
            stun: cli.stun,
            api_key: cli.apikey,
            zip_dir: cli.zipdir,
            source_entry: cli.srcentry,
            output_filename: cli.outfile,
            destination_dir: cli.dstdir,
            versions: cli.versions,
            passfile: cli.passfile,
        })
        .await
    };

    if let Err(e) = result {
        log::error!("{}", e);
        process::exit(1);
    }
}
