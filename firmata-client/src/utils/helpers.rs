/// Formats bytes as a comma separated list of hex values: `0xF0, 0x79, 0xF7`.
pub fn format_as_hex(slice: &[u8]) -> String {
    slice
        .iter()
        .map(|byte| format!("0x{:02X}", byte))
        .collect::<Vec<String>>()
        .join(", ")
}
