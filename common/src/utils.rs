//! Common Utilities
//!
//! Provides utility functions used across the eNodeB implementation

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Integer ceiling division
pub fn ceil_div(num: u32, den: u32) -> u32 {
    num.div_ceil(den)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(10, 10), 1);
        assert_eq!(ceil_div(11, 10), 2);
        assert_eq!(ceil_div(0, 10), 0);
    }
}
