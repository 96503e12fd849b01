#![forbid(unsafe_code)]

use k256::ecdsa::SigningKey;
use parley_auth::WalletKey;
use rand_core::OsRng;

fn main() -> anyhow::Result<()> {
    let config = parse_args(std::env::args())?;

    let signing_key = SigningKey::random(&mut OsRng);
    let private_key_hex = hex::encode(signing_key.to_bytes());
    let key = WalletKey::new(signing_key);

    println!("Generated node signing key");
    println!("wallet={}", key.wallet());
    println!("peers_entry=<host>={}", key.wallet());
    if config.print_private {
        println!("private_key_hex={private_key_hex}");
    } else {
        println!("private_key_hex=<hidden> (pass --print-private to show)");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeygenConfig {
    print_private: bool,
}

fn parse_args<I>(args: I) -> anyhow::Result<KeygenConfig>
where
    I: IntoIterator<Item = String>,
{
    let mut print_private = false;

    let mut iter = args.into_iter();
    let _program = iter.next();
    for arg in iter {
        match arg.as_str() {
            "--print-private" => {
                print_private = true;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            unknown => {
                return Err(anyhow::anyhow!("unknown argument {unknown:?}"));
            }
        }
    }

    Ok(KeygenConfig { print_private })
}

fn print_usage() {
    println!("Usage: parley-keygen [--print-private]");
    println!("  --print-private: include the private key hex in output");
    println!("Set the private key as PARLEY_PRIVATE_KEY and share the wallet with peers.");
}
