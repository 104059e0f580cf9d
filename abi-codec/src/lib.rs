//! ABI-driven binary codec for the history protocol and contract payloads.

mod abi;
mod builtins;
mod error;
mod name;
mod stream;
mod types;

pub use abi::{
    AbiDef, AbiExtension, ActionDef, ActionResultDef, ClausePair, ErrorMessage, FieldDef,
    StructDef, TableDef, TypeDef, VariantDef,
};
pub use error::{AbiError, Result};
pub use name::{name_to_string, string_to_name};
pub use stream::{AbiReader, AbiWriter};
pub use types::Abi;
