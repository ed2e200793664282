use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Error;

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";
pub const TIMESTAMP: &str = "Timestamp";

/// Keys are limited to 1 KiB.
pub const MAX_KEY_LEN: usize = 1024;

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    String(String),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    Binary(Vec<u8>),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "String",
            PropertyValue::Bool(_) => "Boolean",
            PropertyValue::Int32(_) => "Int32",
            PropertyValue::Int64(_) => "Int64",
            PropertyValue::Double(_) => "Double",
            PropertyValue::DateTime(_) => "DateTime",
            PropertyValue::Guid(_) => "Guid",
            PropertyValue::Binary(_) => "Binary",
        }
    }
}

macro_rules! impl_property_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for PropertyValue {
                fn from(value: $ty) -> Self {
                    PropertyValue::$variant(value.into())
                }
            }
        )+
    };
}

impl_property_from!(
    String => String,
    &str => String,
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    f64 => Double,
    DateTime<Utc> => DateTime,
    Uuid => Guid,
    Vec<u8> => Binary,
);

/// A flat entity as the storage service sees it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityRecord {
    pub partition_key: String,
    pub row_key: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl EntityRecord {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            ..Default::default()
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Option<PropertyValue>) {
        if let Some(value) = value {
            self.properties.insert(name.into(), value);
        }
    }

    pub fn take(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Resolves a property name, including the system properties.
    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        match name {
            PARTITION_KEY => Some(PropertyValue::String(self.partition_key.clone())),
            ROW_KEY => Some(PropertyValue::String(self.row_key.clone())),
            TIMESTAMP => self.timestamp.map(PropertyValue::DateTime),
            _ => self.properties.get(name).cloned(),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.partition_key, &self.row_key)
    }

    /// A record carrying only the key, as used for deletes.
    pub fn key_only(&self) -> EntityRecord {
        EntityRecord::new(self.partition_key.clone(), self.row_key.clone())
    }
}

/// Checks a partition or row key against the service's key rules.
pub fn validate_key(kind: &str, key: &str) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::invalid(format!("{kind} must not be empty")));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::invalid(format!(
            "{kind} is {} bytes, the limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }
    if let Some(c) = key
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '#' | '?') || c.is_control())
    {
        return Err(Error::invalid(format!(
            "{kind} {key:?} contains the disallowed character {c:?}"
        )));
    }
    Ok(())
}

pub fn validate_keys(partition_key: &str, row_key: &str) -> Result<(), Error> {
    validate_key(PARTITION_KEY, partition_key)?;
    validate_key(ROW_KEY, row_key)
}

pub trait IntoProperty {
    /// `None` leaves the property out of the record.
    fn into_property(self) -> Option<PropertyValue>;
}

pub trait FromProperty: Sized {
    fn from_property(name: &str, value: Option<PropertyValue>) -> Result<Self, Error>;
}

macro_rules! impl_property_conversions {
    ($($ty:ty => $variant:ident : $expected:literal),+ $(,)?) => {
        $(
            impl IntoProperty for $ty {
                fn into_property(self) -> Option<PropertyValue> {
                    Some(PropertyValue::$variant(self))
                }
            }

            impl FromProperty for $ty {
                fn from_property(name: &str, value: Option<PropertyValue>) -> Result<Self, Error> {
                    match value {
                        Some(PropertyValue::$variant(v)) => Ok(v),
                        Some(other) => Err(Error::PropertyType {
                            property: name.to_string(),
                            expected: $expected,
                            found: other.type_name(),
                        }),
                        None => Err(Error::MissingProperty(name.to_string())),
                    }
                }
            }
        )+
    };
}

impl_property_conversions!(
    String => String: "String",
    bool => Bool: "Boolean",
    i32 => Int32: "Int32",
    f64 => Double: "Double",
    DateTime<Utc> => DateTime: "DateTime",
    Uuid => Guid: "Guid",
    Vec<u8> => Binary: "Binary",
);

impl IntoProperty for i64 {
    fn into_property(self) -> Option<PropertyValue> {
        Some(PropertyValue::Int64(self))
    }
}

// Filter literals without an `L` suffix parse as Int32, so widen on the way in.
impl FromProperty for i64 {
    fn from_property(name: &str, value: Option<PropertyValue>) -> Result<Self, Error> {
        match value {
            Some(PropertyValue::Int64(v)) => Ok(v),
            Some(PropertyValue::Int32(v)) => Ok(i64::from(v)),
            Some(other) => Err(Error::PropertyType {
                property: name.to_string(),
                expected: "Int64",
                found: other.type_name(),
            }),
            None => Err(Error::MissingProperty(name.to_string())),
        }
    }
}

impl<T: IntoProperty> IntoProperty for Option<T> {
    fn into_property(self) -> Option<PropertyValue> {
        self.and_then(IntoProperty::into_property)
    }
}

impl<T: FromProperty> FromProperty for Option<T> {
    fn from_property(name: &str, value: Option<PropertyValue>) -> Result<Self, Error> {
        match value {
            None => Ok(None),
            some => T::from_property(name, some).map(Some),
        }
    }
}

/// Capability set the repository needs from an entity type.
///
/// Usually derived with `#[derive(TableEntity)]`.
pub trait TableEntity: Sized + Send + Sync {
    /// Default table name; the struct name unless overridden.
    fn table_name() -> &'static str;

    fn partition_key(&self) -> &str;

    fn row_key(&self) -> &str;

    fn set_partition_key(&mut self, partition_key: String);

    fn set_row_key(&mut self, row_key: String);

    /// Last-modified time assigned by the service.
    fn timestamp(&self) -> Option<DateTime<Utc>>;

    /// Concurrency token assigned by the service.
    fn etag(&self) -> Option<&str>;

    fn to_record(&self) -> EntityRecord;

    fn from_record(record: EntityRecord) -> Result<Self, Error>;
}

/// Registration emitted by `#[derive(TableEntity)]`.
pub struct EntityTableMeta {
    pub type_path: &'static str,
    pub table_name: &'static str,
}

impl std::fmt::Debug for EntityTableMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EntityTableMeta {{ type_path: {}, table: {} }}",
            self.type_path, self.table_name
        )
    }
}

inventory::collect!(EntityTableMeta);

/// All entity types linked into the binary, sorted by table name.
pub fn registered_tables() -> Vec<&'static EntityTableMeta> {
    let mut tables = inventory::iter::<EntityTableMeta>().collect::<Vec<_>>();
    tables.sort_by_key(|meta| (meta.table_name, meta.type_path));
    tables
}
