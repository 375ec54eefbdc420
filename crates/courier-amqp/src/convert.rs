use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use courier_core::{
    Acknowledger, DeathReason, DeathRecord, Delivery, ExchangeKind, ExchangeSpec, OutboundMessage,
    QueueSpec,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;

const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";
const PERSISTENT: u8 = 2;

/// Exchange type and arguments for `exchange_declare`.
pub(crate) fn exchange_type(spec: &ExchangeSpec) -> (lapin::ExchangeKind, FieldTable) {
    let mut args = FieldTable::default();
    if spec.delayed {
        args.insert(
            ShortString::from("x-delayed-type"),
            AMQPValue::LongString(LongString::from(spec.kind.as_str())),
        );
        return (
            lapin::ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.to_string()),
            args,
        );
    }

    let kind = match spec.kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    };
    (kind, args)
}

/// Queue arguments carrying the dead-letter route and message TTL.
pub(crate) fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter {
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dlx.exchange.as_str())),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(dlx.routing_key.as_str())),
        );
    }
    if let Some(ttl) = spec.message_ttl {
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)),
        );
    }
    args
}

/// Persistent message properties, with the delay as an `x-delay` header.
pub(crate) fn publish_properties(message: &OutboundMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (name, value) in &message.headers {
        headers.insert(
            ShortString::from(name.as_str()),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }
    if let Some(delay) = message.delay {
        headers.insert(
            ShortString::from("x-delay"),
            AMQPValue::LongLongInt(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)),
        );
    }

    let mut properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(message_id) = &message.message_id {
        properties = properties.with_message_id(ShortString::from(message_id.as_str()));
    }
    properties
}

fn text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        AMQPValue::ShortUInt(n) => Some(n.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongUInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        AMQPValue::Timestamp(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn integer(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u64::from(*n)),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(u64::from(*n)),
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        _ => None,
    }
}

/// Scalar headers as text. `x-death` and other structured values are skipped.
pub(crate) fn headers_from_table(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| text(value).map(|v| (name.as_str().to_string(), v)))
        .collect()
}

/// Parse the broker-maintained `x-death` header, most recent entry first.
pub(crate) fn deaths_from_table(table: &FieldTable) -> Vec<DeathRecord> {
    let Some(AMQPValue::FieldArray(entries)) = field(table, "x-death") else {
        return Vec::new();
    };

    entries
        .as_slice()
        .iter()
        .filter_map(|entry| {
            let AMQPValue::FieldTable(entry) = entry else {
                return None;
            };
            let reason = field(entry, "reason")
                .and_then(text)
                .and_then(|r| DeathReason::parse(&r))?;
            let routing_keys = match field(entry, "routing-keys") {
                Some(AMQPValue::FieldArray(keys)) => {
                    keys.as_slice().iter().filter_map(text).collect()
                }
                _ => Vec::new(),
            };
            Some(DeathRecord {
                queue: field(entry, "queue").and_then(text).unwrap_or_default(),
                exchange: field(entry, "exchange").and_then(text).unwrap_or_default(),
                routing_keys,
                reason,
                count: field(entry, "count").and_then(integer).unwrap_or(1),
            })
        })
        .collect()
}

/// Convert a `lapin` delivery into a courier `Delivery` settled through `acker`.
pub(crate) fn into_delivery(
    message: lapin::message::Delivery,
    queue: &str,
    acker: Arc<dyn Acknowledger>,
) -> Delivery {
    let mut delivery = Delivery::new(message.delivery_tag, queue, acker);
    delivery.exchange = message.exchange.as_str().to_string();
    delivery.routing_key = message.routing_key.as_str().to_string();
    delivery.redelivered = message.redelivered;
    delivery.content_type = message
        .properties
        .content_type()
        .as_ref()
        .map(|s| s.as_str().to_string());
    delivery.message_id = message
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.as_str().to_string());
    if let Some(table) = message.properties.headers() {
        delivery.headers = headers_from_table(table);
        delivery.deaths = deaths_from_table(table);
    }
    delivery.payload = Bytes::from(message.data);
    delivery
}
