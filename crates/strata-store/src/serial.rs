//! Secret-aware record serialization
//!
//! Values recurse structurally to and from JSON with two special cases:
//! a [`Value::Secret`] serializes to `{"@secret": envelope}` where the
//! envelope is produced by the scope cipher - with no cipher configured the
//! conversion fails loudly rather than falling back to plaintext - and a
//! [`Value::ScopeRef`] serializes to nothing, breaking the scope cycle;
//! scopes are reattached from context on read, never persisted inline.

use std::collections::BTreeMap;

use serde_json::{json, Map};

use strata_core::{Kind, ResourceId, StateRecord, Status, StrataError, StrataResult, Value};
use strata_crypto::SecretCipher;

/// Envelope key marking an encrypted secret.
pub const SECRET_KEY: &str = "@secret";

/// Convert an engine value to persistable JSON, sealing secrets.
pub fn to_json(value: &Value, cipher: Option<&SecretCipher>) -> StrataResult<serde_json::Value> {
    match value {
        Value::Null | Value::ScopeRef => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => Ok(serde_json::Value::Number(n.clone())),
        Value::String(s) => Ok(serde_json::Value::String(s.clone())),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_json(item, cipher)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Map(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                if key == SECRET_KEY {
                    return Err(StrataError::Serialize(format!(
                        "'{SECRET_KEY}' is a reserved key"
                    )));
                }
                // Scope back-references are omitted entirely.
                if matches!(item, Value::ScopeRef) {
                    continue;
                }
                out.insert(key.clone(), to_json(item, cipher)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::Secret(inner) => {
            let cipher = cipher.ok_or(StrataError::MissingPassword)?;
            let plaintext = serde_json::to_vec(&to_json(inner, Some(cipher))?)
                .map_err(|e| StrataError::Serialize(e.to_string()))?;
            let envelope = cipher.seal(&plaintext)?;
            Ok(json!({ SECRET_KEY: envelope }))
        }
    }
}

/// Invert [`to_json`], opening secret envelopes.
pub fn from_json(json: &serde_json::Value, cipher: Option<&SecretCipher>) -> StrataResult<Value> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => Ok(Value::Number(n.clone())),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_json(item, cipher)?);
            }
            Ok(Value::List(out))
        }
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(serde_json::Value::String(envelope)) = map.get(SECRET_KEY) {
                    let cipher = cipher.ok_or(StrataError::MissingPassword)?;
                    let plaintext = cipher.open(envelope)?;
                    let inner: serde_json::Value = serde_json::from_slice(&plaintext)
                        .map_err(|e| StrataError::Serialize(e.to_string()))?;
                    return Ok(Value::Secret(Box::new(from_json(&inner, Some(cipher))?)));
                }
            }
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), from_json(item, cipher)?);
            }
            Ok(Value::Map(out))
        }
    }
}

/// Serialize a full state record to its persisted JSON shape.
pub fn record_to_json(record: &StateRecord, cipher: Option<&SecretCipher>) -> StrataResult<serde_json::Value> {
    let mut out = Map::new();
    out.insert("status".into(), json!(record.status.as_str()));
    out.insert("kind".into(), json!(record.kind.as_str()));
    out.insert("id".into(), json!(record.id.as_str()));
    out.insert("fqn".into(), json!(record.fqn));
    out.insert("seq".into(), json!(record.seq));
    out.insert(
        "deps".into(),
        json!(record.deps.iter().map(ResourceId::as_str).collect::<Vec<_>>()),
    );
    out.insert("data".into(), to_json(&record.data, cipher)?);
    out.insert("props".into(), to_json(&record.props, cipher)?);
    if let Some(old_props) = &record.old_props {
        out.insert("oldProps".into(), to_json(old_props, cipher)?);
    }
    out.insert("output".into(), to_json(&record.output, cipher)?);
    Ok(serde_json::Value::Object(out))
}

/// Parse a persisted JSON record back into a [`StateRecord`].
pub fn record_from_json(json: &serde_json::Value, cipher: Option<&SecretCipher>) -> StrataResult<StateRecord> {
    let obj = json
        .as_object()
        .ok_or_else(|| StrataError::Serialize("state record is not an object".into()))?;

    let field = |name: &str| {
        obj.get(name)
            .ok_or_else(|| StrataError::Serialize(format!("state record missing '{name}'")))
    };
    let str_field = |name: &str| {
        field(name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StrataError::Serialize(format!("state record '{name}' is not a string")))
    };

    let status_str = str_field("status")?;
    let status = Status::parse(&status_str)
        .ok_or_else(|| StrataError::Serialize(format!("unknown status '{status_str}'")))?;

    let seq = field("seq")?
        .as_u64()
        .ok_or_else(|| StrataError::Serialize("state record 'seq' is not an integer".into()))?;

    let deps = field("deps")?
        .as_array()
        .ok_or_else(|| StrataError::Serialize("state record 'deps' is not an array".into()))?
        .iter()
        .map(|d| {
            d.as_str()
                .map(ResourceId::new)
                .ok_or_else(|| StrataError::Serialize("dependency id is not a string".into()))
        })
        .collect::<StrataResult<Vec<_>>>()?;

    let old_props = match obj.get("oldProps") {
        Some(v) => Some(from_json(v, cipher)?),
        None => None,
    };

    Ok(StateRecord {
        status,
        kind: Kind::new(str_field("kind")?),
        id: ResourceId::new(str_field("id")?),
        fqn: str_field("fqn")?,
        seq,
        deps,
        data: from_json(field("data")?, cipher)?,
        props: from_json(field("props")?, cipher)?,
        old_props,
        output: from_json(field("output")?, cipher)?,
    })
}
