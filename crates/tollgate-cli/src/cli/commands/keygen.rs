use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ed25519_dalek::SigningKey;
use tollgate_core::crypto::signing::key_id_for;
use tollgate_core::GateError;

use super::common::report_error;
use crate::cli::args::KeygenArgs;
use crate::exit_codes;

pub fn cmd_keygen(args: KeygenArgs) -> i32 {
    match run_keygen(args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => report_error(&e, false),
    }
}

fn run_keygen(args: KeygenArgs) -> Result<()> {
    use pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let name = args.name.trim();
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(GateError::InvalidInput(format!("invalid key name: {:?}", args.name)).into());
    }
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create directory: {}", args.out.display()))?;

    let private_path = args.out.join(format!("{name}.key.pem"));
    let public_path = args.out.join(format!("{name}.pub.pem"));
    if !args.force {
        for path in [&private_path, &public_path] {
            if path.exists() {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
        }
    }

    let signing_key = SigningKey::generate(&mut rand::thread_rng());
    let verifying_key = signing_key.verifying_key();
    let private_pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("failed to encode private key as PKCS#8 PEM")?;
    let public_pem = verifying_key
        .to_public_key_pem(LineEnding::LF)
        .context("failed to encode public key as SPKI PEM")?;

    write_private(&private_path, private_pem.as_bytes())?;
    fs::write(&public_path, public_pem)
        .with_context(|| format!("failed to write public key: {}", public_path.display()))?;

    let key_id = key_id_for(&verifying_key)?;
    tracing::info!(key_id = %key_id, dir = %args.out.display(), "keypair generated");

    println!("private_key: {}", private_path.display());
    println!("public_key: {}", public_path.display());
    println!("key_id: {key_id}");
    Ok(())
}

fn write_private(path: &Path, pem: &[u8]) -> Result<()> {
    fs::write(path, pem)
        .with_context(|| format!("failed to write private key: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict permissions on {}", path.display()))?;
    }
    Ok(())
}
