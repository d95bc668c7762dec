//! Minimal pkt-line output support.
//!
//! The Git pack protocol frames each line with a 4-hex-digit length prefix
//! that covers the prefix itself plus the payload.  The gateway only ever
//! needs to *write* one kind of line: the `ERR <message>` frame sent to a
//! client that is waiting for a ref advertisement when the repository
//! cannot be served.  Anything more (flush packets, reading) belongs to the
//! pack engine, not to us.

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Largest payload a single pkt-line can carry: 65520 bytes total minus the
/// 4-byte length header.
const MAX_PAYLOAD: usize = 65516;

/// Write a single `ERR <message>` pkt-line to `out` and flush.
///
/// The emitted bytes are `{:04x}` of the total line length followed by
/// `ERR <message>\n`.  Overlong messages are truncated to fit one frame.
pub async fn write_err<W>(out: &mut W, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = format!("ERR {message}\n");
    if payload.len() > MAX_PAYLOAD {
        let mut cut = MAX_PAYLOAD - 1;
        while !payload.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.truncate(cut);
        payload.push('\n');
    }

    let line = format!("{:04x}{payload}", payload.len() + 4);
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
