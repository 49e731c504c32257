//! Generate a node identity keypair under `<data_dir>/keys/`.

use clap::Parser;
use genesis_mesh::crypto::Keypair;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Generate a Genesis Mesh node identity")]
struct Args {
    /// Data directory; keys land in <data_dir>/keys/
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Overwrite an existing key
    #[arg(long)]
    force: bool,
}

fn main() {
    let args = Args::parse();
    let keys_dir = args.data_dir.join("keys");
    let key_path = keys_dir.join("node.key");

    if key_path.exists() && !args.force {
        eprintln!(
            "refusing to overwrite {} (use --force)",
            key_path.display()
        );
        std::process::exit(1);
    }

    let keypair = Keypair::generate();
    if let Err(e) = keypair.save(&keys_dir) {
        eprintln!("failed to write keys: {e}");
        std::process::exit(1);
    }

    println!("node id: {}", keypair.node_id());
    println!("keys written to {}", keys_dir.display());
}
