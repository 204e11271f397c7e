//! Generate agent keypairs.

use clap::Parser;
use farebid::Keypair;

#[derive(Parser)]
#[command(name = "genkeys")]
#[command(about = "Generate Ed25519 keypairs for farebid agents")]
struct Args {
    /// How many keypairs to generate.
    #[arg(short, long, default_value_t = 1)]
    count: u32,
}

fn main() {
    let args = Args::parse();
    for _ in 0..args.count {
        let keys = Keypair::generate();
        println!("secret: {}", keys.secret_hex());
        println!("public: {}", keys.public_hex());
    }
}
