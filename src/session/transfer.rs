//! File transfer over the command channel.
//!
//! There is no side channel on a serial console, so files travel as base64
//! text inside ordinary commands: uploads append decoded heredoc chunks to
//! the target, downloads read one `dd` block per command.
use std::path::Path;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{CommandResult, Result, Session, SessionError};

/// Keeps heredoc lines well below the canonical-mode line limit of small ttys
const BASE64_LINE_WIDTH: usize = 76;

/// Upper bound on what a remote size reply may preallocate
const MAX_PREALLOC: u64 = 1 << 20;

impl Session {
    /// Copy a local file to `remote_path`, replacing it if it exists.
    pub async fn put_file(&self, local_path: impl AsRef<Path>, remote_path: &str) -> Result<()> {
        let local_path = local_path.as_ref();
        let data = tokio::fs::read(local_path).await?;
        let target = shell_quote(remote_path);
        log::info!("PUT {} TO {} ({} bytes)", local_path.display(), remote_path, data.len());

        let result = self.exec_command(&format!(": > {}", target), None).await?;
        check(&result, "create remote file")?;

        let chunks = data.chunks(self.config().transfer_chunk_size);
        let total = chunks.len();
        for (index, chunk) in chunks.enumerate() {
            let body = encode_chunk(chunk);
            let result = self
                .exec_with_input(&format!("base64 -d >> {}", target), &body, None)
                .await?;
            check(&result, &format!("write chunk {}/{}", index + 1, total))?;
        }

        let remote_size = self.remote_size(&target).await?;
        if remote_size != data.len() as u64 {
            return Err(SessionError::Transfer(format!(
                "remote file {} has {} bytes, expected {}",
                remote_path,
                remote_size,
                data.len()
            )));
        }
        Ok(())
    }

    /// Copy `remote_path` to a local file.
    pub async fn fetch_file(&self, remote_path: &str, local_path: impl AsRef<Path>) -> Result<()> {
        let local_path = local_path.as_ref();
        let source = shell_quote(remote_path);
        let size = self.remote_size(&source).await?;
        log::info!("FETCH {} TO {} ({} bytes)", remote_path, local_path.display(), size);

        let block = self.config().transfer_chunk_size as u64;
        let blocks = size.div_ceil(block);
        let mut data = Vec::with_capacity(preallocation(size));
        for index in 0..blocks {
            let command = format!(
                "dd if={} bs={} skip={} count=1 2>/dev/null | base64",
                source, block, index
            );
            let result = self.exec_command(&command, None).await?;
            check(&result, &format!("read block {}/{}", index + 1, blocks))?;
            data.extend(decode_chunk(&result.stdout)?);
        }

        if data.len() as u64 != size {
            return Err(SessionError::Transfer(format!(
                "received {} bytes of {}, expected {}",
                data.len(),
                remote_path,
                size
            )));
        }
        tokio::fs::write(local_path, &data).await?;
        Ok(())
    }

    async fn remote_size(&self, quoted_path: &str) -> Result<u64> {
        let result = self.exec_command(&format!("wc -c < {}", quoted_path), None).await?;
        check(&result, "stat remote file")?;
        let text = result.stdout_lossy();
        text.trim()
            .parse::<u64>()
            .map_err(|_| SessionError::Transfer(format!("unexpected size reply {:?}", text.trim())))
    }
}

fn check(result: &CommandResult, step: &str) -> Result<()> {
    if result.truncated {
        return Err(SessionError::Transfer(format!("{} timed out", step)));
    }
    match result.exit_code {
        Some(0) => Ok(()),
        code => {
            let detail = if result.stderr.is_empty() { result.stdout_lossy() } else { result.stderr_lossy() };
            Err(SessionError::Transfer(format!(
                "{} failed with status {:?}: {}",
                step,
                code,
                detail.trim()
            )))
        }
    }
}

fn preallocation(remote_size: u64) -> usize {
    remote_size.min(MAX_PREALLOC) as usize
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Base64 text for one chunk, wrapped into short lines
pub fn encode_chunk(chunk: &[u8]) -> String {
    let encoded = STANDARD.encode(chunk);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_WIDTH + 1);
    for (i, ch) in encoded.chars().enumerate() {
        if i > 0 && i % BASE64_LINE_WIDTH == 0 {
            wrapped.push('\n');
        }
        wrapped.push(ch);
    }
    wrapped
}

/// Decode base64 command output, ignoring line breaks the remote inserted
pub fn decode_chunk(output: &[u8]) -> Result<Vec<u8>> {
    let compact: Vec<u8> = output.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    STANDARD
        .decode(&compact)
        .map_err(|e| SessionError::Transfer(format!("bad base64 from remote: {}", e)))
}
