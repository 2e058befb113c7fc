//! Newline-delimited JSON feed adapter.
//!
//! One JSON object per line:
//!
//! ```text
//! {"identity":"inj1..."}
//! {"price":25.1,"at":1700000000000}
//! {"available":1.0,"staked":5.0,"rewards":0.01,"apr":12.0}
//! {"online":false}
//! {"timeframe":"1w"}
//! {"clear_events":true}
//! {"shutdown":true}
//! ```

use common::types::{AccountSnapshot, PriceTick};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::Input;
use crate::window::Timeframe;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized feed message: {0}")]
    Unrecognized(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLine {
    Identity { identity: String },
    Price(PriceTick),
    Account(AccountSnapshot),
    Online { online: bool },
    Timeframe { timeframe: Timeframe },
    ClearEvents { clear_events: bool },
    Shutdown { shutdown: bool },
}

/// Parse one feed line. Blank lines and `false` flags yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Input>, FeedError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: serde_json::Value = serde_json::from_str(line)?;
    let raw: RawLine =
        serde_json::from_value(value).map_err(|_mismatch| FeedError::Unrecognized(line.to_string()))?;

    let input = match raw {
        RawLine::Identity { identity } => Input::Identity(identity),
        RawLine::Price(tick) => Input::Price(tick),
        RawLine::Account(snapshot) => Input::Account(snapshot),
        RawLine::Online { online } => Input::Online(online),
        RawLine::Timeframe { timeframe } => Input::Timeframe(timeframe),
        RawLine::ClearEvents { clear_events } => {
            if !clear_events {
                return Ok(None);
            }
            Input::ClearEvents
        }
        RawLine::Shutdown { shutdown } => {
            if !shutdown {
                return Ok(None);
            }
            Input::Shutdown
        }
    };
    Ok(Some(input))
}

/// Read feed lines until EOF, forwarding them to the session in file order.
/// Sends `Input::Shutdown` at EOF. Malformed lines are logged and skipped.
pub async fn pump<R>(reader: R, inputs: mpsc::Sender<Input>) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_line(&line) {
            Ok(Some(input)) => {
                let stop = input == Input::Shutdown;
                if inputs.send(input).await.is_err() || stop {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => {
                metrics::counter!("tracker_points_rejected_total", "metric" => "feed")
                    .increment(1);
                warn!(line = line_no, error = %e, "skipping feed line");
            }
        }
    }
    debug!(lines = line_no, "feed closed");
    let _ = inputs.send(Input::Shutdown).await;
    Ok(())
}
