use std::path::{Path, PathBuf};

use color_eyre::eyre::Context;
use russh::keys::{
    decode_secret_key,
    ssh_key::{
        private::{KeypairData, RsaKeypair},
        rand_core::OsRng,
        LineEnding,
    },
    PrivateKey,
};
use tokio::fs;
use tracing::info;

const HOST_KEY_BITS: usize = 4096;

// Loads the host private key, generating a fresh RSA keypair on first run.
pub(crate) async fn load_or_generate_host_key(path: &Path) -> color_eyre::Result<PrivateKey> {
    match fs::read_to_string(path).await {
        Ok(contents) => {
            decode_secret_key(&contents, None).with_context(|| "Error decoding host key")
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Host key not found. Generating...");
            let key = generate_host_key(path.to_path_buf()).await?;
            Ok(key)
        }
        Err(error) => Err(error).with_context(|| "Error reading host key"),
    }
}

async fn generate_host_key(path: PathBuf) -> color_eyre::Result<PrivateKey> {
    // RSA keygen takes seconds at this size; keep it off the async workers.
    let key = tokio::task::spawn_blocking(|| {
        let keypair = RsaKeypair::random(&mut OsRng, HOST_KEY_BITS)?;
        PrivateKey::new(KeypairData::Rsa(keypair), "localshow host key")
    })
    .await
    .with_context(|| "Host key generation task failed")?
    .with_context(|| "Error generating host key")?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| "Error creating host key directory")?;
        }
    }
    let encoded = key
        .to_openssh(LineEnding::LF)
        .with_context(|| "Error encoding host key")?;
    fs::write(&path, encoded.as_bytes())
        .await
        .with_context(|| "Error saving host key to filesystem")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| "Error restricting host key permissions")?;
    }
    Ok(key)
}
