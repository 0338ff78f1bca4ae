//! Pure conversions between lapin types and transport types

use crate::transport::{ConfirmOutcome, Delivery, MessageProperties};
use lapin::message::Delivery as LapinDelivery;
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Build AMQP basic properties for an outgoing message
pub fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let delivery_mode = if properties.persistent {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    };
    let mut basic = BasicProperties::default().with_delivery_mode(delivery_mode);

    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.as_str()));
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(headers_to_field_table(&properties.headers));
    }

    basic
}

/// Read AMQP basic properties from a received message
pub fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: basic
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        message_id: basic.message_id().as_ref().map(|s| s.as_str().to_string()),
        headers: basic
            .headers()
            .as_ref()
            .map(field_table_to_headers)
            .unwrap_or_default(),
        persistent: *basic.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        priority: *basic.priority(),
        timestamp: *basic.timestamp(),
    }
}

pub fn headers_to_field_table(headers: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(ShortString::from(name.as_str()), json_to_amqp_value(value));
    }
    table
}

pub fn field_table_to_headers(table: &FieldTable) -> BTreeMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), amqp_value_to_json(value)))
        .collect()
}

fn json_to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(integer), _) => AMQPValue::LongLongInt(integer),
            (None, Some(float)) => AMQPValue::Double(float),
            _ => AMQPValue::LongString(LongString::from(number.to_string().into_bytes())),
        },
        Value::String(text) => AMQPValue::LongString(LongString::from(text.clone().into_bytes())),
        Value::Null => AMQPValue::Void,
        nested => AMQPValue::LongString(LongString::from(nested.to_string().into_bytes())),
    }
}

fn amqp_value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::ShortShortInt(v) => json!(v),
        AMQPValue::ShortShortUInt(v) => json!(v),
        AMQPValue::ShortInt(v) => json!(v),
        AMQPValue::ShortUInt(v) => json!(v),
        AMQPValue::LongInt(v) => json!(v),
        AMQPValue::LongUInt(v) => json!(v),
        AMQPValue::LongLongInt(v) => json!(v),
        AMQPValue::Float(v) => json!(v),
        AMQPValue::Double(v) => json!(v),
        AMQPValue::Timestamp(v) => json!(v),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldTable(table) => Value::Object(
            field_table_to_headers(table)
                .into_iter()
                .collect::<Map<String, Value>>(),
        ),
        AMQPValue::FieldArray(array) => {
            Value::Array(array.as_slice().iter().map(amqp_value_to_json).collect())
        }
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{other:?}")),
    }
}

/// Convert a lapin delivery; the acker is dropped because acknowledgement
/// goes through the channel by tag
pub fn to_delivery(delivery: LapinDelivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

/// Interpret a publisher confirm.
///
/// An ack that carries a returned message means the broker could not route
/// a mandatory publish, which counts as a rejection.
pub fn confirm_outcome(confirmation: Confirmation) -> ConfirmOutcome {
    match confirmation {
        Confirmation::Ack(None) => ConfirmOutcome::Confirmed,
        Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
            ConfirmOutcome::Rejected(format!(
                "message returned: {} {}",
                returned.reply_code,
                returned.reply_text.as_str()
            ))
        }
        Confirmation::Nack(None) => {
            ConfirmOutcome::Rejected("broker sent a negative acknowledgement".to_string())
        }
        Confirmation::NotRequested => {
            ConfirmOutcome::Rejected("publisher confirms are not enabled on channel".to_string())
        }
    }
}
