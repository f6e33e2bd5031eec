//! Newline-delimited JSON transport for an [`Endpoint`].

use super::message::{ControlMessage, Envelope};
use super::Endpoint;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};
use wisp_platform::WispResult;

/// Bridges `endpoint` to JSON lines.
///
/// Messages the endpoint receives are written to `writer`, one envelope per
/// line. Lines read from `reader` are decoded and sent through the endpoint.
/// Malformed lines and unknown names are logged and skipped.
///
/// Returns when `reader` reaches end of file or the other end of the
/// endpoint is gone.
///
/// # Errors
///
/// Returns an error if reading or writing fails.
pub async fn serve_lines<In, Out, R, W>(
    endpoint: Endpoint<In, Out>,
    reader: R,
    mut writer: W,
) -> WispResult<()>
where
    In: ControlMessage,
    Out: ControlMessage,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut inbound, outbound) = endpoint.into_parts();
    let mut lines = BufReader::new(reader).lines();
    let mut inbound_open = true;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("JSON input ended");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match decode_line::<Out>(line) {
                    Ok(Some(message)) => {
                        if outbound.send(message).is_err() {
                            debug!("Endpoint closed");
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Skipping control message"),
                }
            }
            message = inbound.recv(), if inbound_open => {
                match message {
                    Some(message) => {
                        let mut line = message.to_envelope().to_json();
                        line.push('\n');
                        writer.write_all(line.as_bytes()).await?;
                        writer.flush().await?;
                    }
                    None => inbound_open = false,
                }
            }
        }
        if !inbound_open {
            break;
        }
    }

    // Deliver anything already queued before returning.
    while let Ok(message) = inbound.try_recv() {
        let mut line = message.to_envelope().to_json();
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

fn decode_line<T: ControlMessage>(line: &str) -> WispResult<Option<T>> {
    let envelope = Envelope::from_json(line)?;
    T::from_envelope(&envelope)
}
