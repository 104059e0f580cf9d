use abi_codec::{Abi, AbiReader};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipError};

const BLOCKS_RESULT_FIELDS: [&str; 7] = [
    "head",
    "last_irreversible",
    "this_block",
    "prev_block",
    "block",
    "traces",
    "deltas",
];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockPosition {
    pub block_num: u32,
    pub block_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResult {
    pub head: BlockPosition,
    pub last_irreversible: BlockPosition,
    pub trace_begin_block: u32,
    pub trace_end_block: u32,
    pub chain_state_begin_block: u32,
    pub chain_state_end_block: u32,
    #[serde(default)]
    pub chain_id: Option<String>,
}

impl StatusResult {
    /// First block for which both traces and chain state are available.
    pub fn first_available_block(&self) -> u32 {
        self.chain_state_begin_block.max(self.trace_begin_block)
    }
}

/// `get_blocks_result_v0` with the payloads borrowed from the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BlocksResult<'a> {
    pub head: BlockPosition,
    pub last_irreversible: BlockPosition,
    pub this_block: Option<BlockPosition>,
    pub prev_block: Option<BlockPosition>,
    pub block: Option<&'a [u8]>,
    pub traces: Option<&'a [u8]>,
    pub deltas: Option<&'a [u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShipResult<'a> {
    Status(StatusResult),
    Blocks(BlocksResult<'a>),
    Unknown(String),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BlocksRequest {
    pub start_block_num: u32,
    pub end_block_num: u32,
    pub max_messages_in_flight: u32,
    pub have_positions: Vec<BlockPosition>,
    pub irreversible_only: bool,
    pub fetch_block: bool,
    pub fetch_traces: bool,
    pub fetch_deltas: bool,
}

impl BlocksRequest {
    pub fn new(start_block_num: u32, end_block_num: u32, max_messages_in_flight: u32) -> Self {
        Self {
            start_block_num,
            end_block_num,
            max_messages_in_flight,
            have_positions: vec![],
            irreversible_only: false,
            fetch_block: true,
            fetch_traces: true,
            fetch_deltas: true,
        }
    }

    pub fn fetch(mut self, block: bool, traces: bool, deltas: bool) -> Self {
        self.fetch_block = block;
        self.fetch_traces = traces;
        self.fetch_deltas = deltas;
        self
    }
}

/// History protocol schema pushed by the server as the first message.
#[derive(Debug)]
pub struct ShipProtocol {
    abi: Abi,
    result_types: Vec<String>,
    json: String,
}

impl ShipProtocol {
    pub fn from_json(json: &str) -> Result<Self> {
        let abi = Abi::from_json(json)?;
        let result_types = abi
            .def()
            .variants
            .iter()
            .find(|variant| variant.name == "result")
            .map(|variant| variant.types.clone())
            .ok_or_else(|| ShipError::Protocol("protocol ABI lacks the `result` variant".to_string()))?;
        if let Some(blocks) = abi
            .def()
            .structs
            .iter()
            .find(|s| s.name == "get_blocks_result_v0")
        {
            let fields: Vec<&str> = blocks.fields.iter().map(|f| f.name.as_str()).collect();
            if fields != BLOCKS_RESULT_FIELDS {
                return Err(ShipError::Protocol(format!(
                    "unsupported get_blocks_result_v0 layout: {:?}",
                    fields
                )));
            }
        }
        Ok(Self {
            abi,
            result_types,
            json: json.to_string(),
        })
    }

    pub fn abi(&self) -> &Abi {
        &self.abi
    }

    pub fn json(&self) -> &str {
        &self.json
    }

    /// Type used to decode rows of a delta table, e.g. `contract_row`.
    pub fn table_type(&self, table: &str) -> Option<&str> {
        self.abi.table_type(table)
    }

    pub fn encode_request(&self, request_type: &str, body: serde_json::Value) -> Result<Vec<u8>> {
        Ok(self
            .abi
            .encode("request", &serde_json::json!([request_type, body]))?)
    }

    pub fn status_request(&self) -> Result<Vec<u8>> {
        self.encode_request("get_status_request_v0", serde_json::json!({}))
    }

    pub fn blocks_request(&self, request: &BlocksRequest) -> Result<Vec<u8>> {
        self.encode_request("get_blocks_request_v0", serde_json::to_value(request)?)
    }

    pub fn ack_request(&self, num_messages: u32) -> Result<Vec<u8>> {
        self.encode_request(
            "get_blocks_ack_request_v0",
            serde_json::json!({ "num_messages": num_messages }),
        )
    }

    pub fn decode_result<'a>(&self, frame: &'a [u8]) -> Result<ShipResult<'a>> {
        let mut reader = AbiReader::new(frame);
        let index = reader.read_varuint32()? as usize;
        let result_type = self
            .result_types
            .get(index)
            .ok_or_else(|| ShipError::Protocol(format!("unknown result index {}", index)))?;
        match result_type.as_str() {
            "get_status_result_v0" => {
                let value = self.abi.decode_from(result_type, &mut reader)?;
                Ok(ShipResult::Status(serde_json::from_value(value)?))
            }
            // decoded by hand so the payloads stay borrowed
            "get_blocks_result_v0" => Ok(ShipResult::Blocks(read_blocks_result(&mut reader)?)),
            other => Ok(ShipResult::Unknown(other.to_string())),
        }
    }
}

fn read_position(reader: &mut AbiReader) -> Result<BlockPosition> {
    let block_num = reader.read_u32()?;
    let block_id = hex::encode(reader.read_bytes(32)?);
    Ok(BlockPosition {
        block_num,
        block_id,
    })
}

fn read_optional<'a, T>(
    reader: &mut AbiReader<'a>,
    read: impl FnOnce(&mut AbiReader<'a>) -> Result<T>,
) -> Result<Option<T>> {
    if reader.read_bool()? {
        Ok(Some(read(reader)?))
    } else {
        Ok(None)
    }
}

fn read_blocks_result<'a>(reader: &mut AbiReader<'a>) -> Result<BlocksResult<'a>> {
    Ok(BlocksResult {
        head: read_position(reader)?,
        last_irreversible: read_position(reader)?,
        this_block: read_optional(reader, read_position)?,
        prev_block: read_optional(reader, read_position)?,
        block: read_optional(reader, |r| Ok(r.read_byte_vec()?))?,
        traces: read_optional(reader, |r| Ok(r.read_byte_vec()?))?,
        deltas: read_optional(reader, |r| Ok(r.read_byte_vec()?))?,
    })
}
