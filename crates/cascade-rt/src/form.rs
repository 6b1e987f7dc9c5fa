use std::collections::HashMap;

/// Percent-decodes a path segment. '+' stays literal here; that rule only
/// applies to form data.
pub fn percent_decode(input: &str) -> String {
    decode_bytes(input, false)
}

/// Decodes a query or form component, where '+' means space.
pub fn form_decode(input: &str) -> String {
    decode_bytes(input, true)
}

fn decode_bytes(input: &str, plus_as_space: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes.get(i + 1).zip(bytes.get(i + 2));
                match hex.and_then(|(a, b)| {
                    let hi = (*a as char).to_digit(16)?;
                    let lo = (*b as char).to_digit(16)?;
                    Some(((hi << 4) | lo) as u8)
                }) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Splits `a=1&b=2` into a map. The first occurrence of a repeated key wins.
pub fn parse_pairs(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = form_decode(key);
        out.entry(key).or_insert_with(|| form_decode(value));
    }
    out
}
