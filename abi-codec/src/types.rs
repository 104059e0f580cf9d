use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::abi::{AbiDef, StructDef, VariantDef};
use crate::builtins;
use crate::error::{AbiError, Result};
use crate::stream::{AbiReader, AbiWriter};

const MAX_DEPTH: usize = 64;

/// An ABI compiled into lookup tables, ready to encode and decode payloads.
#[derive(Debug, Clone)]
pub struct Abi {
    def: AbiDef,
    typedefs: HashMap<String, String>,
    structs: HashMap<String, StructDef>,
    variants: HashMap<String, VariantDef>,
    actions: HashMap<String, String>,
    tables: HashMap<String, String>,
}

impl Abi {
    pub fn new(def: AbiDef) -> Result<Self> {
        let typedefs = def
            .types
            .iter()
            .map(|t| (t.new_type_name.clone(), t.type_name.clone()))
            .collect();
        let structs = def
            .structs
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        let variants = def
            .variants
            .iter()
            .map(|v| (v.name.clone(), v.clone()))
            .collect();
        let actions = def
            .actions
            .iter()
            .map(|a| (a.name.clone(), a.type_name.clone()))
            .collect();
        let tables = def
            .tables
            .iter()
            .map(|t| (t.name.clone(), t.type_name.clone()))
            .collect();
        let abi = Self {
            def,
            typedefs,
            structs,
            variants,
            actions,
            tables,
        };
        abi.check_struct_bases()?;
        Ok(abi)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::new(AbiDef::from_json(json)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::new(AbiDef::from_bytes(data)?)
    }

    pub fn from_hex(data: &str) -> Result<Self> {
        let bytes = hex::decode(data).map_err(|err| AbiError::InvalidAbi(err.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn def(&self) -> &AbiDef {
        &self.def
    }

    pub fn action_type(&self, action: &str) -> Option<&str> {
        self.actions.get(action).map(String::as_str)
    }

    pub fn table_type(&self, table: &str) -> Option<&str> {
        self.tables.get(table).map(String::as_str)
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        let base = strip_suffixes(type_name);
        match self.resolve(base, 0) {
            Ok(resolved) => {
                builtins::is_builtin(resolved)
                    || self.structs.contains_key(resolved)
                    || self.variants.contains_key(resolved)
            }
            Err(_) => false,
        }
    }

    fn check_struct_bases(&self) -> Result<()> {
        for s in self.structs.values() {
            let mut depth = 0;
            let mut base = s.base.as_str();
            while !base.is_empty() {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(AbiError::InvalidAbi(format!("circular base for {}", s.name)));
                }
                let resolved = self.resolve(base, 0)?;
                base = match self.structs.get(resolved) {
                    Some(parent) => parent.base.as_str(),
                    None => {
                        return Err(AbiError::InvalidAbi(format!(
                            "base {resolved} of {} is not a struct",
                            s.name
                        )))
                    }
                };
            }
        }
        Ok(())
    }

    fn resolve<'s>(&'s self, mut type_name: &'s str, depth: usize) -> Result<&'s str> {
        let mut hops = depth;
        while let Some(target) = self.typedefs.get(type_name) {
            hops += 1;
            if hops > MAX_DEPTH {
                return Err(AbiError::DepthExceeded(type_name.to_string()));
            }
            type_name = target;
        }
        Ok(type_name)
    }

    /// Decodes `data` as `type_name`; trailing bytes are ignored.
    pub fn decode(&self, type_name: &str, data: &[u8]) -> Result<Value> {
        let mut reader = AbiReader::new(data);
        self.decode_from(type_name, &mut reader)
    }

    pub fn decode_from(&self, type_name: &str, reader: &mut AbiReader) -> Result<Value> {
        self.decode_type(type_name, reader, 0)?
            .ok_or_else(|| AbiError::invalid(type_name, "binary extension missing at top level"))
    }

    fn decode_type(&self, type_name: &str, reader: &mut AbiReader, depth: usize) -> Result<Option<Value>> {
        if depth > MAX_DEPTH {
            return Err(AbiError::DepthExceeded(type_name.to_string()));
        }
        if let Some(inner) = type_name.strip_suffix('$') {
            if reader.remaining() == 0 {
                return Ok(None);
            }
            return self.decode_type(inner, reader, depth + 1);
        }
        if let Some(inner) = type_name.strip_suffix('?') {
            return Ok(Some(if reader.read_bool()? {
                self.decode_required(inner, reader, depth + 1)?
            } else {
                Value::Null
            }));
        }
        if let Some(inner) = type_name.strip_suffix("[]") {
            let len = reader.read_varuint32()? as usize;
            let mut items = Vec::with_capacity(len.min(reader.remaining()));
            for _ in 0..len {
                items.push(self.decode_required(inner, reader, depth + 1)?);
            }
            return Ok(Some(Value::Array(items)));
        }
        let resolved = self.resolve(type_name, depth)?;
        if builtins::is_builtin(resolved) {
            return builtins::decode(resolved, reader).map(Some);
        }
        if let Some(variant) = self.variants.get(resolved) {
            let index = reader.read_varuint32()?;
            let selected = variant
                .types
                .get(index as usize)
                .ok_or_else(|| AbiError::VariantIndex {
                    variant: variant.name.clone(),
                    index,
                })?;
            let value = self.decode_required(selected, reader, depth + 1)?;
            return Ok(Some(Value::Array(vec![Value::String(selected.clone()), value])));
        }
        if self.structs.contains_key(resolved) {
            let mut object = Map::new();
            self.decode_struct_fields(resolved, reader, &mut object, depth + 1)?;
            return Ok(Some(Value::Object(object)));
        }
        Err(AbiError::UnknownType(resolved.to_string()))
    }

    fn decode_required(&self, type_name: &str, reader: &mut AbiReader, depth: usize) -> Result<Value> {
        Ok(self
            .decode_type(type_name, reader, depth)?
            .unwrap_or(Value::Null))
    }

    fn decode_struct_fields(
        &self,
        struct_name: &str,
        reader: &mut AbiReader,
        object: &mut Map<String, Value>,
        depth: usize,
    ) -> Result<()> {
        let def = self
            .structs
            .get(struct_name)
            .ok_or_else(|| AbiError::UnknownType(struct_name.to_string()))?;
        if !def.base.is_empty() {
            let base = self.resolve(&def.base, depth)?;
            self.decode_struct_fields(base, reader, object, depth + 1)?;
        }
        for field in &def.fields {
            match self.decode_type(&field.type_name, reader, depth + 1)? {
                Some(value) => {
                    object.insert(field.name.clone(), value);
                }
                // binary extensions are trailing, nothing follows a missing one
                None => break,
            }
        }
        Ok(())
    }

    pub fn encode(&self, type_name: &str, value: &Value) -> Result<Vec<u8>> {
        let mut writer = AbiWriter::new();
        self.encode_into(type_name, value, &mut writer)?;
        Ok(writer.into_bytes())
    }

    pub fn encode_into(&self, type_name: &str, value: &Value, writer: &mut AbiWriter) -> Result<()> {
        self.encode_type(type_name, value, writer, 0)
    }

    fn encode_type(&self, type_name: &str, value: &Value, writer: &mut AbiWriter, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(AbiError::DepthExceeded(type_name.to_string()));
        }
        if let Some(inner) = type_name.strip_suffix('$') {
            return self.encode_type(inner, value, writer, depth + 1);
        }
        if let Some(inner) = type_name.strip_suffix('?') {
            if value.is_null() {
                writer.write_bool(false);
                return Ok(());
            }
            writer.write_bool(true);
            return self.encode_type(inner, value, writer, depth + 1);
        }
        if let Some(inner) = type_name.strip_suffix("[]") {
            let items = value
                .as_array()
                .ok_or_else(|| AbiError::invalid(type_name, "expected array"))?;
            writer.write_varuint32(items.len() as u32);
            for item in items {
                self.encode_type(inner, item, writer, depth + 1)?;
            }
            return Ok(());
        }
        let resolved = self.resolve(type_name, depth)?;
        if builtins::is_builtin(resolved) {
            return builtins::encode(resolved, value, writer);
        }
        if let Some(variant) = self.variants.get(resolved) {
            let pair = value
                .as_array()
                .filter(|pair| pair.len() == 2)
                .ok_or_else(|| AbiError::invalid(resolved, "expected [type, value] pair"))?;
            let selected = pair[0]
                .as_str()
                .ok_or_else(|| AbiError::invalid(resolved, "variant type must be a string"))?;
            let index = variant
                .types
                .iter()
                .position(|t| t == selected)
                .ok_or_else(|| AbiError::invalid(resolved, format!("{selected} is not a member")))?;
            writer.write_varuint32(index as u32);
            return self.encode_type(selected, &pair[1], writer, depth + 1);
        }
        if self.structs.contains_key(resolved) {
            let object = value
                .as_object()
                .ok_or_else(|| AbiError::invalid(resolved, "expected object"))?;
            return self.encode_struct_fields(resolved, object, writer, depth + 1);
        }
        Err(AbiError::UnknownType(resolved.to_string()))
    }

    fn encode_struct_fields(
        &self,
        struct_name: &str,
        object: &Map<String, Value>,
        writer: &mut AbiWriter,
        depth: usize,
    ) -> Result<()> {
        let def = self
            .structs
            .get(struct_name)
            .ok_or_else(|| AbiError::UnknownType(struct_name.to_string()))?;
        if !def.base.is_empty() {
            let base = self.resolve(&def.base, depth)?;
            self.encode_struct_fields(base, object, writer, depth + 1)?;
        }
        for field in &def.fields {
            match object.get(&field.name) {
                Some(value) => self.encode_type(&field.type_name, value, writer, depth + 1)?,
                None if field.type_name.ends_with('$') => break,
                None => {
                    return Err(AbiError::invalid(
                        struct_name,
                        format!("missing field {}", field.name),
                    ))
                }
            }
        }
        Ok(())
    }
}

fn strip_suffixes(mut type_name: &str) -> &str {
    loop {
        if let Some(inner) = type_name.strip_suffix('$') {
            type_name = inner;
        } else if let Some(inner) = type_name.strip_suffix('?') {
            type_name = inner;
        } else if let Some(inner) = type_name.strip_suffix("[]") {
            type_name = inner;
        } else {
            return type_name;
        }
    }
}
