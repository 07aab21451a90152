//! adb process spawning and output capture.
//!
//! Every bridge primitive ends up in [`run_adb`]. The child is started with
//! `kill_on_drop(true)` so a timed-out or cancelled invocation does not leave
//! an adb process behind.

use std::fmt::Write;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::BridgeError;

/// Max output size per stream (4 MB). `/proc/net/unix` on a busy device is
/// a few hundred KB at most.
const MAX_ADB_OUTPUT: usize = 4 * 1024 * 1024;

/// Run `<binary> <args...>` and return stdout on a zero exit status.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at [`MAX_ADB_OUTPUT`] bytes.
pub async fn run_adb(binary: &str, args: &[&str], timeout_ms: u64) -> Result<String, BridgeError> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::SpawnFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| BridgeError::SpawnFailed("Failed to take stderr pipe".to_string()))?;

    let timeout = tokio::time::Duration::from_millis(timeout_ms);
    let outcome = tokio::time::timeout(timeout, async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_ADB_OUTPUT),
            read_capped(&mut stderr, MAX_ADB_OUTPUT),
        );
        drop(stdout);
        drop(stderr);
        let status = child
            .wait()
            .await
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;
        Ok::<_, BridgeError>((status, stdout_data, stderr_data))
    })
    .await;

    let (status, stdout_data, stderr_data) = match outcome {
        Ok(result) => result?,
        Err(_) => return Err(BridgeError::Timeout),
    };

    if status.success() {
        Ok(stdout_data)
    } else {
        Err(BridgeError::Failed {
            command: args.join(" "),
            exit_code: status.code().unwrap_or(-1),
            stderr: stderr_data.trim().to_string(),
        })
    }
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest. Reading continues past the cap so the child never blocks on a full
/// pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stdout_returned_on_success() {
        let out = run_adb("/bin/sh", &["-c", "echo hello"], 5000).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let err = run_adb("/bin/sh", &["-c", "echo nope >&2; exit 3"], 5000)
            .await
            .unwrap_err();
        match err {
            BridgeError::Failed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = run_adb("/bin/sh", &["-c", "sleep 5"], 50).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
    }

    #[tokio::test]
    async fn test_read_capped_truncates() {
        let data = vec![b'a'; 100];
        let mut reader = &data[..];
        let s = read_capped(&mut reader, 10).await;
        assert!(s.starts_with("aaaaaaaaaa\n[truncated: 100 bytes total"));
    }
}
