//! Wire form of a stored row.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use prost::Message;
use uuid::Uuid;

use crate::{
    Error,
    entity::{EntityRecord, PropertyValue},
};

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct StoredTime {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(uint32, tag = "2")]
    pub nanos: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct StoredEntity {
    #[prost(string, tag = "1")]
    pub partition_key: String,
    #[prost(string, tag = "2")]
    pub row_key: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<StoredTime>,
    #[prost(string, optional, tag = "4")]
    pub etag: Option<String>,
    #[prost(btree_map = "string, message", tag = "5")]
    pub properties: BTreeMap<String, StoredValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub(crate) struct StoredValue {
    #[prost(oneof = "stored_value::Kind", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub kind: Option<stored_value::Kind>,
}

pub(crate) mod stored_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(string, tag = "1")]
        Text(String),
        #[prost(bool, tag = "2")]
        Bool(bool),
        #[prost(int32, tag = "3")]
        Int32(i32),
        #[prost(int64, tag = "4")]
        Int64(i64),
        #[prost(double, tag = "5")]
        Double(f64),
        #[prost(message, tag = "6")]
        DateTime(super::StoredTime),
        #[prost(bytes = "vec", tag = "7")]
        Guid(Vec<u8>),
        #[prost(bytes = "vec", tag = "8")]
        Binary(Vec<u8>),
    }
}

use stored_value::Kind;

impl From<&DateTime<Utc>> for StoredTime {
    fn from(time: &DateTime<Utc>) -> Self {
        Self {
            seconds: time.timestamp(),
            nanos: time.timestamp_subsec_nanos(),
        }
    }
}

impl TryFrom<StoredTime> for DateTime<Utc> {
    type Error = Error;

    fn try_from(time: StoredTime) -> Result<Self, Error> {
        DateTime::from_timestamp(time.seconds, time.nanos).ok_or_else(|| {
            Error::CorruptRecord(format!("time {}s+{}ns out of range", time.seconds, time.nanos))
        })
    }
}

impl From<&PropertyValue> for StoredValue {
    fn from(value: &PropertyValue) -> Self {
        let kind = match value {
            PropertyValue::String(v) => Kind::Text(v.clone()),
            PropertyValue::Bool(v) => Kind::Bool(*v),
            PropertyValue::Int32(v) => Kind::Int32(*v),
            PropertyValue::Int64(v) => Kind::Int64(*v),
            PropertyValue::Double(v) => Kind::Double(*v),
            PropertyValue::DateTime(v) => Kind::DateTime(v.into()),
            PropertyValue::Guid(v) => Kind::Guid(v.as_bytes().to_vec()),
            PropertyValue::Binary(v) => Kind::Binary(v.clone()),
        };
        Self { kind: Some(kind) }
    }
}

fn property_value(name: &str, value: StoredValue) -> Result<PropertyValue, Error> {
    Ok(match value.kind {
        Some(Kind::Text(v)) => PropertyValue::String(v),
        Some(Kind::Bool(v)) => PropertyValue::Bool(v),
        Some(Kind::Int32(v)) => PropertyValue::Int32(v),
        Some(Kind::Int64(v)) => PropertyValue::Int64(v),
        Some(Kind::Double(v)) => PropertyValue::Double(v),
        Some(Kind::DateTime(v)) => PropertyValue::DateTime(v.try_into()?),
        Some(Kind::Guid(v)) => PropertyValue::Guid(
            Uuid::from_slice(&v)
                .map_err(|e| Error::CorruptRecord(format!("property {name}: {e}")))?,
        ),
        Some(Kind::Binary(v)) => PropertyValue::Binary(v),
        None => return Err(Error::CorruptRecord(format!("property {name} has no value"))),
    })
}

pub(crate) fn encode_record(record: &EntityRecord) -> Vec<u8> {
    StoredEntity {
        partition_key: record.partition_key.clone(),
        row_key: record.row_key.clone(),
        timestamp: record.timestamp.as_ref().map(StoredTime::from),
        etag: record.etag.clone(),
        properties: record
            .properties
            .iter()
            .map(|(name, value)| (name.clone(), value.into()))
            .collect(),
    }
    .encode_to_vec()
}

pub(crate) fn decode_record(data: &[u8]) -> Result<EntityRecord, Error> {
    let stored = StoredEntity::decode(data).map_err(Error::DeserializationError)?;
    let mut record = EntityRecord::new(stored.partition_key, stored.row_key);
    record.timestamp = stored.timestamp.map(DateTime::try_from).transpose()?;
    record.etag = stored.etag;
    for (name, value) in stored.properties {
        let value = property_value(&name, value)?;
        record.properties.insert(name, value);
    }
    Ok(record)
}
