//! Push-feed wire format: subscription requests and inbound events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Candle, Ticker};

/// Liveness probe text frame and its reply
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// One channel/instrument pair in a subscribe request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionArg {
    pub channel: String,
    #[serde(rename = "instId")]
    pub inst_id: String,
}

impl SubscriptionArg {
    pub fn new(channel: &str, inst_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            inst_id: inst_id.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    op: &'static str,
    args: &'a [SubscriptionArg],
}

/// Serialize `args` into subscribe messages of at most `batch_size` items each
pub fn subscribe_batches(
    args: &[SubscriptionArg],
    batch_size: usize,
) -> serde_json::Result<Vec<String>> {
    args.chunks(batch_size.max(1))
        .map(|chunk| {
            serde_json::to_string(&SubscribeRequest {
                op: "subscribe",
                args: chunk,
            })
        })
        .collect()
}

/// Decoded inbound feed message
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Ticker(Ticker),
    Candle(Candle),
    Subscribed { channel: String, inst_id: String },
    Error { code: String, message: String },
    Pong,
}

#[derive(Debug, Deserialize)]
struct RawPush {
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    arg: Option<SubscriptionArg>,
    data: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
}

/// Parse one text frame into zero or more events
///
/// Frames that are not understood yield an error so the caller can log them.
pub fn parse_message(text: &str, received_at: DateTime<Utc>) -> Result<Vec<FeedEvent>, String> {
    if text == PONG {
        return Ok(vec![FeedEvent::Pong]);
    }

    let raw: RawPush = serde_json::from_str(text).map_err(|e| e.to_string())?;

    match raw.event.as_deref() {
        Some("error") => {
            return Ok(vec![FeedEvent::Error {
                code: raw.code.unwrap_or_default(),
                message: raw.msg.unwrap_or_default(),
            }])
        }
        Some("subscribe") => {
            let arg = raw.arg.ok_or("subscribe event without arg")?;
            return Ok(vec![FeedEvent::Subscribed {
                channel: arg.channel,
                inst_id: arg.inst_id,
            }]);
        }
        Some(_) => return Ok(Vec::new()),
        None => {}
    }

    let arg = raw.arg.ok_or("push without arg")?;
    let data = raw.data.unwrap_or_default();

    if arg.channel == "tickers" {
        data.into_iter()
            .map(|item| parse_ticker(item, received_at))
            .collect()
    } else if arg.channel.starts_with("candle") {
        data.into_iter()
            .map(|item| parse_candle_row(&arg.inst_id, &item).map(FeedEvent::Candle))
            .collect()
    } else {
        Err(format!("unknown channel {}", arg.channel))
    }
}

fn parse_ticker(item: Value, received_at: DateTime<Utc>) -> Result<FeedEvent, String> {
    let raw: RawTicker = serde_json::from_value(item).map_err(|e| e.to_string())?;
    let last: f64 = raw.last.parse().map_err(|_| format!("bad last price {}", raw.last))?;

    Ok(FeedEvent::Ticker(Ticker {
        instrument: raw.inst_id,
        last,
        received_at,
    }))
}

/// Decode `[ts_ms, open, high, low, close, volume, ..., confirm]`
///
/// Shared by the push channel and the REST candle endpoint.
pub fn parse_candle_row(instrument: &str, row: &Value) -> Result<Candle, String> {
    let fields = row.as_array().ok_or("candle row is not an array")?;
    if fields.len() < 6 {
        return Err(format!("candle row has {} fields", fields.len()));
    }

    let num = |i: usize| -> Result<f64, String> {
        match &fields[i] {
            Value::String(s) => s.parse().map_err(|_| format!("field {} not numeric: {}", i, s)),
            Value::Number(n) => n.as_f64().ok_or_else(|| format!("field {} out of range", i)),
            other => Err(format!("field {} has type {}", i, other)),
        }
    };

    let ts_ms = num(0)? as i64;
    let timestamp =
        DateTime::from_timestamp_millis(ts_ms).ok_or_else(|| format!("bad timestamp {}", ts_ms))?;
    let confirmed = fields
        .get(8)
        .map(|v| v.as_str() == Some("1") || v.as_i64() == Some(1))
        .unwrap_or(false);

    Ok(Candle {
        instrument: instrument.to_string(),
        timestamp,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
        confirmed,
    })
}
