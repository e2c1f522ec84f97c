//! wal2json (format version 1) change-set decoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

use super::binding::FieldBinding;
use super::types::{parse_lsn, Lsn};
use crate::{Error, Result};

/// One column (or old key) of a change record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// The JSON value as emitted; numbers keep their exact decimal text.
    pub value: Value,
}

impl DataField {
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Any other wal2json kind, e.g. `message` or `truncate`.
    Other(String),
}

impl ChangeKind {
    fn from_wire(kind: String) -> Self {
        match kind.as_str() {
            "insert" => ChangeKind::Insert,
            "update" => ChangeKind::Update,
            "delete" => ChangeKind::Delete,
            _ => ChangeKind::Other(kind),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Other(kind) => kind,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ChangeKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A single row change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    pub fields: HashMap<String, DataField>,
    /// Old key columns, present for updates and deletes.
    pub keys: HashMap<String, DataField>,
}

impl ChangeRecord {
    pub fn field(&self, name: &str) -> Option<&DataField> {
        self.fields.get(name)
    }

    pub fn key(&self, name: &str) -> Option<&DataField> {
        self.keys.get(name)
    }

    /// Copies column values into the destinations registered on `binding`.
    ///
    /// Columns without a destination are ignored, destinations without a
    /// column keep their value, and a record without columns binds nothing.
    pub fn bind_fields(&self, binding: FieldBinding<'_>) -> Result<()> {
        binding.apply(&self.fields)
    }

    /// Like [`ChangeRecord::bind_fields`], over the old key columns.
    pub fn bind_keys(&self, binding: FieldBinding<'_>) -> Result<()> {
        binding.apply(&self.keys)
    }

    /// Deserializes the columns as one JSON object keyed by column name.
    pub fn fields_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(values_object(&self.fields))?)
    }

    pub fn keys_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(values_object(&self.keys))?)
    }
}

/// The decoded body of one XLogData message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<u64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_lsn"
    )]
    pub next_lsn: Option<Lsn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub changes: Vec<ChangeRecord>,
}

impl ChangeSet {
    /// Decodes a wal2json payload.
    ///
    /// A payload without a `change` member decodes to an empty set.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let raw: RawChangeSet = serde_json::from_slice(payload)?;

        let next_lsn = raw.nextlsn.as_deref().map(parse_lsn).transpose()?;
        let changes = raw
            .change
            .into_iter()
            .map(RawChange::into_record)
            .collect::<Result<Vec<_>>>()?;

        trace!(changes = changes.len(), xid = ?raw.xid, "Decoded change set");

        Ok(Self {
            xid: raw.xid,
            next_lsn,
            timestamp: raw.timestamp,
            changes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeRecord> {
        self.changes.iter()
    }
}

impl IntoIterator for ChangeSet {
    type Item = ChangeRecord;
    type IntoIter = std::vec::IntoIter<ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a ChangeRecord;
    type IntoIter = std::slice::Iter<'a, ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[derive(Deserialize)]
struct RawChangeSet {
    #[serde(default)]
    change: Vec<RawChange>,
    #[serde(default)]
    xid: Option<u64>,
    #[serde(default)]
    nextlsn: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct RawChange {
    kind: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    table: String,
    #[serde(default)]
    columnnames: Vec<String>,
    #[serde(default)]
    columntypes: Vec<String>,
    #[serde(default)]
    columnvalues: Vec<Value>,
    #[serde(default)]
    oldkeys: RawOldKeys,
}

#[derive(Deserialize, Default)]
struct RawOldKeys {
    #[serde(default)]
    keynames: Vec<String>,
    #[serde(default)]
    keytypes: Vec<String>,
    #[serde(default)]
    keyvalues: Vec<Value>,
}

impl RawChange {
    fn into_record(self) -> Result<ChangeRecord> {
        let fields = pack("column", self.columnnames, self.columntypes, self.columnvalues)?;
        let keys = pack(
            "key",
            self.oldkeys.keynames,
            self.oldkeys.keytypes,
            self.oldkeys.keyvalues,
        )?;

        Ok(ChangeRecord {
            kind: ChangeKind::from_wire(self.kind),
            schema: self.schema,
            table: self.table,
            fields,
            keys,
        })
    }
}

fn pack(
    what: &str,
    names: Vec<String>,
    types: Vec<String>,
    values: Vec<Value>,
) -> Result<HashMap<String, DataField>> {
    if names.len() != values.len() {
        return Err(Error::Decode {
            message: format!("{0} number of supplied values do not match {0} name", what),
        });
    }
    if names.len() != types.len() {
        return Err(Error::Decode {
            message: format!("{0} number of supplied types do not match {0} name", what),
        });
    }

    Ok(names
        .into_iter()
        .zip(types)
        .zip(values)
        .map(|((name, type_name), value)| {
            (
                name.clone(),
                DataField {
                    name,
                    type_name,
                    value,
                },
            )
        })
        .collect())
}

fn values_object(fields: &HashMap<String, DataField>) -> Value {
    let object: Map<String, Value> = fields
        .iter()
        .map(|(name, field)| (name.clone(), field.value.clone()))
        .collect();
    Value::Object(object)
}

fn serialize_optional_lsn<S: Serializer>(
    lsn: &Option<Lsn>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match lsn {
        Some(lsn) => serializer.collect_str(lsn),
        None => serializer.serialize_none(),
    }
}
