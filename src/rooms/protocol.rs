//! Wire protocol between subscribers and the room layer.
//!
//! Client messages are JSON objects tagged by `type`. Parsing is
//! two-phase so an unrecognized type can be named in the error reply
//! instead of collapsing into a generic parse failure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::market::types::{InstrumentSnapshot, MarketSummary};

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("invalid message format")]
    Malformed,

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
    Ping,
    GetMarketSummary,
    GetStockHistory { symbol: String, period: String },
}

const KNOWN_TYPES: [&str; 5] = [
    "subscribe",
    "unsubscribe",
    "ping",
    "get_market_summary",
    "get_stock_history",
];

/// Parses one inbound client message.
///
/// A payload that is not a JSON object with a string `type`, or whose
/// fields do not match the recognized shape, is `Malformed`; a
/// well-formed object with an unrecognized `type` is `UnknownType`.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, ParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ParseError::Malformed)?;

    let t = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::Malformed)?;

    if !KNOWN_TYPES.contains(&t) {
        return Err(ParseError::UnknownType(t.to_string()));
    }

    serde_json::from_value(value).map_err(|_| ParseError::Malformed)
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        connection_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    SubscriptionUpdated {
        subscriptions: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Pong { timestamp: DateTime<Utc> },

    #[serde(rename_all = "camelCase")]
    StockUpdate {
        symbol: String,
        data: InstrumentSnapshot,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    MarketSummary {
        summary: MarketSummary,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    PriceHistory {
        symbol: String,
        period: String,
        history: Vec<Value>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl ServerMessage {
    pub fn stock_update(snapshot: &InstrumentSnapshot) -> Self {
        ServerMessage::StockUpdate {
            symbol: snapshot.symbol.clone(),
            data: snapshot.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // ServerMessage contains no non-serializable values.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"internal serialization failure"}"#.to_string()
        })
    }
}

/// History lookback windows accepted by `get_stock_history`.
pub fn parse_period(period: &str) -> Option<Duration> {
    let secs = match period {
        "1m" => 60,
        "5m" => 5 * 60,
        "15m" => 15 * 60,
        "1h" => 60 * 60,
        "4h" => 4 * 60 * 60,
        "1d" => 24 * 60 * 60,
        "1w" => 7 * 24 * 60 * 60,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_with_symbols() {
        let msg = parse_client_message(r#"{"type":"subscribe","symbols":["AAPL","MSFT"]}"#);
        assert_eq!(
            msg.unwrap(),
            ClientMessage::Subscribe {
                symbols: vec!["AAPL".to_string(), "MSFT".to_string()]
            }
        );
    }

    #[test]
    fn parses_bare_ping() {
        assert_eq!(
            parse_client_message(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn parses_history_request() {
        let msg =
            parse_client_message(r#"{"type":"get_stock_history","symbol":"AAPL","period":"1d"}"#);
        assert_eq!(
            msg.unwrap(),
            ClientMessage::GetStockHistory {
                symbol: "AAPL".to_string(),
                period: "1d".to_string()
            }
        );
    }

    #[test]
    fn unknown_type_is_named_in_the_error() {
        let err = parse_client_message(r#"{"type":"get_coffee"}"#).unwrap_err();
        assert_eq!(err, ParseError::UnknownType("get_coffee".to_string()));
    }

    #[test]
    fn garbage_and_shape_mismatches_are_malformed() {
        assert_eq!(
            parse_client_message("not json at all").unwrap_err(),
            ParseError::Malformed
        );
        assert_eq!(parse_client_message("42").unwrap_err(), ParseError::Malformed);
        assert_eq!(
            parse_client_message(r#"{"symbols":["AAPL"]}"#).unwrap_err(),
            ParseError::Malformed
        );
        // Known type, wrong fields.
        assert_eq!(
            parse_client_message(r#"{"type":"subscribe","symbols":"AAPL"}"#).unwrap_err(),
            ParseError::Malformed
        );
    }

    #[test]
    fn server_messages_are_tagged_snake_case_with_camel_case_fields() {
        let msg = ServerMessage::ConnectionEstablished {
            connection_id: Uuid::nil(),
            timestamp: Utc::now(),
        };
        let v: Value = serde_json::from_str(&msg.to_json()).unwrap();

        assert_eq!(v["type"], "connection_established");
        assert!(v.get("connectionId").is_some());
        assert!(v.get("timestamp").is_some());
    }

    #[test]
    fn period_table_covers_documented_windows() {
        assert_eq!(parse_period("1h"), Some(Duration::from_secs(3_600)));
        assert_eq!(parse_period("1w"), Some(Duration::from_secs(604_800)));
        assert_eq!(parse_period("2y"), None);
        assert_eq!(parse_period(""), None);
    }
}
