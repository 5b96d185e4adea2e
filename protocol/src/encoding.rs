use {
    anyhow::{Context, Result, ensure},
    bincode::config::{Configuration, standard},
    serde::{Serialize, de::DeserializeOwned},
};

fn config() -> Configuration {
    standard()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).context("failed to encode value")
}

/// Decodes a value, rejecting any bytes left over after it.
pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let (value, len) =
        bincode::serde::decode_from_slice(data, config()).context("failed to decode value")?;
    ensure!(
        len == data.len(),
        "trailing data after encoded value ({} of {} bytes consumed)",
        len,
        data.len(),
    );
    Ok(value)
}
