use std::io::Write;
use std::path::{Path, PathBuf};
use std::{fs, io};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use super::parsing::env_optional;

/// Reads a generated secret from the data directory, creating it on first start.
///
/// Used only when the corresponding env var is unset; production config requires the env var.
pub(super) fn load_or_create_secret(file_name: &str) -> String {
    let path = secret_dir().join(file_name);

    if let Some(existing) = read_existing(&path) {
        return existing;
    }

    let generated = generate_secret();

    match write_new(&path, &generated) {
        Ok(()) => generated,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            // Another process won the race; use its value.
            read_existing(&path).unwrap_or(generated)
        }
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "Failed to persist generated secret");
            generated
        }
    }
}

fn read_existing(path: &Path) -> Option<String> {
    let value = fs::read_to_string(path).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn write_new(path: &Path, value: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(value.as_bytes())
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 48];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn secret_dir() -> PathBuf {
    env_optional("SCANBRIDGE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_is_reused() {
        let dir = std::env::temp_dir().join(format!("scanbridge-secret-{}", uuid::Uuid::new_v4()));
        let path = dir.join(".secret_key");

        assert!(read_existing(&path).is_none());
        write_new(&path, "first-value").expect("write secret");
        assert_eq!(read_existing(&path).as_deref(), Some("first-value"));

        let second = write_new(&path, "second-value").expect_err("must not overwrite");
        assert_eq!(second.kind(), io::ErrorKind::AlreadyExists);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn generated_secrets_differ() {
        assert_ne!(generate_secret(), generate_secret());
        assert_eq!(generate_secret().len(), 64);
    }
}
