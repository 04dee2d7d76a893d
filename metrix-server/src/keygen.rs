use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
    rand_core::OsRng,
};

#[derive(Debug, Args)]
pub struct KeygenArgs {
    /// Modulus size in bits
    #[arg(short, long, default_value_t = 2048)]
    bits: usize,
    /// Directory receiving private.pem and public.pem
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,
}

pub fn keygen(args: KeygenArgs) -> anyhow::Result<()> {
    if args.bits < 1024 {
        anyhow::bail!("refusing to generate a {}-bit key", args.bits);
    }

    let (private_pem, public_pem) = generate_pem_pair(args.bits)?;
    let private_path = args.out_dir.join("private.pem");
    let public_path = args.out_dir.join("public.pem");
    write_new(&private_path, private_pem.as_bytes())?;
    write_new(&public_path, public_pem.as_bytes())?;

    println!("Private key written to {}", private_path.display());
    println!("Public key written to {}", public_path.display());
    Ok(())
}

fn generate_pem_pair(bits: usize) -> anyhow::Result<(String, String)> {
    let private = RsaPrivateKey::new(&mut OsRng, bits)?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_pem = public.to_public_key_pem(LineEnding::LF)?;
    Ok((private_pem, public_pem))
}

fn write_new(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}
