// Copyright (c) 2022-2023 The MobileCoin Foundation

use serde::Serialize;
use serde_json::Value;

use hwlink::proto::Fields;

/// JSON object argument, parsed into message fields
#[derive(Clone, PartialEq, Debug, Default)]
pub struct JsonFields(pub Fields);

impl std::str::FromStr for JsonFields {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match serde_json::from_str(s)? {
            Value::Object(m) => Ok(JsonFields(m)),
            _ => Err(anyhow::anyhow!("fields must be a JSON object")),
        }
    }
}

/// Write a value to stdout as pretty JSON
pub fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let s = serde_json::to_string_pretty(value)?;
    println!("{s}");
    Ok(())
}
