//! Lunette core types: values, strings, tables, prototypes, and the
//! instruction word codec.

pub mod instruction;
pub mod proto;
pub mod string;
pub mod table;
pub mod value;
