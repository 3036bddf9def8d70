//! Raw byte-stream proxy onto a VM's console socket (the other end of the
//! `-serial unix:...,server,nowait` QEMU argument).

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::ComposeError;

/// Connect to the VM's console socket and relay bytes bidirectionally
/// between it and the calling process's stdin/stdout until either side
/// closes. Terminal raw-mode handling is the caller's responsibility — this
/// is a plain byte pipe, not a terminal emulator.
pub async fn attach(socket_path: &Path) -> Result<(), ComposeError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("connecting to console socket {}", socket_path.display()),
            source: e,
        })?;

    let (mut read_half, mut write_half) = stream.into_split();

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let to_console = async {
        let mut buf = [0u8; 4096];
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            write_half.write_all(&buf[..n]).await?;
        }
        Ok::<(), std::io::Error>(())
    };

    let from_console = async {
        let mut buf = [0u8; 4096];
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).await?;
            stdout.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };

    tokio::select! {
        result = to_console => result,
        result = from_console => result,
    }
    .map_err(|e| ComposeError::Io {
        context: "relaying console bytes".into(),
        source: e,
    })
}
