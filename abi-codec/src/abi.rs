use serde::{Deserialize, Serialize};

use crate::error::{AbiError, Result};
use crate::name::{name_to_string, string_to_name};
use crate::stream::{AbiReader, AbiWriter};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub new_type_name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub ricardian_contract: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub index_type: String,
    #[serde(default)]
    pub key_names: Vec<String>,
    #[serde(default)]
    pub key_types: Vec<String>,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClausePair {
    pub id: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error_code: u64,
    pub error_msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbiExtension {
    pub tag: u16,
    /// hex encoded
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantDef {
    pub name: String,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResultDef {
    pub name: String,
    pub result_type: String,
}

/// Contract ABI definition, as published by `setabi` or pushed by the
/// history endpoint on connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbiDef {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub types: Vec<TypeDef>,
    #[serde(default)]
    pub structs: Vec<StructDef>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
    #[serde(default)]
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub ricardian_clauses: Vec<ClausePair>,
    #[serde(default)]
    pub error_messages: Vec<ErrorMessage>,
    #[serde(default)]
    pub abi_extensions: Vec<AbiExtension>,
    #[serde(default)]
    pub variants: Vec<VariantDef>,
    #[serde(default)]
    pub action_results: Vec<ActionResultDef>,
}

fn read_vec<'a, T>(
    reader: &mut AbiReader<'a>,
    mut read_item: impl FnMut(&mut AbiReader<'a>) -> Result<T>,
) -> Result<Vec<T>> {
    let len = reader.read_varuint32()? as usize;
    // every entry takes at least one byte
    if len > reader.remaining() {
        return Err(AbiError::InvalidAbi(format!(
            "vector length {len} exceeds remaining {} bytes",
            reader.remaining()
        )));
    }
    (0..len).map(|_| read_item(reader)).collect()
}

fn read_name(reader: &mut AbiReader) -> Result<String> {
    Ok(name_to_string(reader.read_u64()?))
}

impl AbiDef {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parses the packed `abi_def` layout carried by `setabi` and account rows.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = AbiReader::new(data);
        let version = reader.read_string()?;
        if !version.starts_with("eosio::abi/1.") {
            return Err(AbiError::InvalidAbi(format!("unsupported abi version {version:?}")));
        }
        let types = read_vec(&mut reader, |r| {
            Ok(TypeDef {
                new_type_name: r.read_string()?,
                type_name: r.read_string()?,
            })
        })?;
        let structs = read_vec(&mut reader, |r| {
            Ok(StructDef {
                name: r.read_string()?,
                base: r.read_string()?,
                fields: read_vec(r, |r| {
                    Ok(FieldDef {
                        name: r.read_string()?,
                        type_name: r.read_string()?,
                    })
                })?,
            })
        })?;
        let actions = read_vec(&mut reader, |r| {
            Ok(ActionDef {
                name: read_name(r)?,
                type_name: r.read_string()?,
                ricardian_contract: r.read_string()?,
            })
        })?;
        let tables = read_vec(&mut reader, |r| {
            Ok(TableDef {
                name: read_name(r)?,
                index_type: r.read_string()?,
                key_names: read_vec(r, |r| r.read_string())?,
                key_types: read_vec(r, |r| r.read_string())?,
                type_name: r.read_string()?,
            })
        })?;
        let ricardian_clauses = read_vec(&mut reader, |r| {
            Ok(ClausePair {
                id: r.read_string()?,
                body: r.read_string()?,
            })
        })?;
        let error_messages = read_vec(&mut reader, |r| {
            Ok(ErrorMessage {
                error_code: r.read_u64()?,
                error_msg: r.read_string()?,
            })
        })?;
        let abi_extensions = read_vec(&mut reader, |r| {
            Ok(AbiExtension {
                tag: r.read_u16()?,
                value: hex::encode(r.read_byte_vec()?),
            })
        })?;
        let variants = if reader.remaining() > 0 {
            read_vec(&mut reader, |r| {
                Ok(VariantDef {
                    name: r.read_string()?,
                    types: read_vec(r, |r| r.read_string())?,
                })
            })?
        } else {
            Vec::new()
        };
        let action_results = if reader.remaining() > 0 {
            read_vec(&mut reader, |r| {
                Ok(ActionResultDef {
                    name: read_name(r)?,
                    result_type: r.read_string()?,
                })
            })?
        } else {
            Vec::new()
        };
        Ok(Self {
            version,
            types,
            structs,
            actions,
            tables,
            ricardian_clauses,
            error_messages,
            abi_extensions,
            variants,
            action_results,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = AbiWriter::new();
        w.write_string(&self.version);
        w.write_varuint32(self.types.len() as u32);
        for t in &self.types {
            w.write_string(&t.new_type_name);
            w.write_string(&t.type_name);
        }
        w.write_varuint32(self.structs.len() as u32);
        for s in &self.structs {
            w.write_string(&s.name);
            w.write_string(&s.base);
            w.write_varuint32(s.fields.len() as u32);
            for f in &s.fields {
                w.write_string(&f.name);
                w.write_string(&f.type_name);
            }
        }
        w.write_varuint32(self.actions.len() as u32);
        for a in &self.actions {
            w.write_u64(string_to_name(&a.name)?);
            w.write_string(&a.type_name);
            w.write_string(&a.ricardian_contract);
        }
        w.write_varuint32(self.tables.len() as u32);
        for t in &self.tables {
            w.write_u64(string_to_name(&t.name)?);
            w.write_string(&t.index_type);
            w.write_varuint32(t.key_names.len() as u32);
            for k in &t.key_names {
                w.write_string(k);
            }
            w.write_varuint32(t.key_types.len() as u32);
            for k in &t.key_types {
                w.write_string(k);
            }
            w.write_string(&t.type_name);
        }
        w.write_varuint32(self.ricardian_clauses.len() as u32);
        for c in &self.ricardian_clauses {
            w.write_string(&c.id);
            w.write_string(&c.body);
        }
        w.write_varuint32(self.error_messages.len() as u32);
        for e in &self.error_messages {
            w.write_u64(e.error_code);
            w.write_string(&e.error_msg);
        }
        w.write_varuint32(self.abi_extensions.len() as u32);
        for ext in &self.abi_extensions {
            w.write_u16(ext.tag);
            let bytes = hex::decode(&ext.value)
                .map_err(|err| AbiError::InvalidAbi(format!("abi extension: {err}")))?;
            w.write_byte_vec(&bytes);
        }
        w.write_varuint32(self.variants.len() as u32);
        for v in &self.variants {
            w.write_string(&v.name);
            w.write_varuint32(v.types.len() as u32);
            for t in &v.types {
                w.write_string(t);
            }
        }
        if !self.action_results.is_empty() {
            w.write_varuint32(self.action_results.len() as u32);
            for r in &self.action_results {
                w.write_u64(string_to_name(&r.name)?);
                w.write_string(&r.result_type);
            }
        }
        Ok(w.into_bytes())
    }
}
