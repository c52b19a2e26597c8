use sha1::Sha1;
use sha2::{Digest, Sha384};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

pub fn sha1(input: &[u8]) -> String {
    hex::encode(Sha1::digest(input))
}

pub fn sha384(input: &[u8]) -> String {
    hex::encode(Sha384::digest(input))
}

/// Signing tickets are written as `*.shsh`, `*.shsh2` and similar.
pub fn is_ticket(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.contains(".shsh"))
}

/// Lists the ticket files directly inside `dir`. A missing directory has none.
pub async fn tickets(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(ok) => ok,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut tickets = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_ticket(&path) {
            tickets.push(path);
        }
    }
    tickets.sort();
    Ok(tickets)
}

/// Moves a file, falling back to copy and remove when `to` is on another
/// filesystem than `from`.
pub async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    fs::copy(from, to).await?;
    fs::remove_file(from).await
}
