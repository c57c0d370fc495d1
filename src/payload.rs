// Message payload module
// This file generates correlated probe payloads and parses the embedded
// message index back out on the consumer side
//
// Numan Thabit 2025 Nov

use rand::Rng;

/// Delimiter between the prefix, the index, and the random padding.
pub const PREFIX_DELIMITER: char = '-';

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generates n random letter bytes. Random content keeps the payload
/// incompressible on the wire.
pub fn rand_letter_bytes(n: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| LETTERS[rng.gen_range(0..LETTERS.len())]).collect()
}

/// Number of bytes denoted by a size token such as `15B`, `2KB`, or `1MB`.
/// Unknown units and unparsable numbers fall back to plain bytes and zero.
pub fn num_of_bytes(size: &str) -> usize {
    let digits: String = size.chars().filter(|c| c.is_ascii_digit()).collect();
    let unit: String = size.chars().filter(|c| c.is_ascii_alphabetic()).collect();

    let bytes: usize = match digits.parse() {
        Ok(n) => n,
        Err(_) => return 0,
    };

    match unit.to_ascii_lowercase().as_str() {
        "mb" | "megabytes" | "megabyte" | "megab" => bytes * 1024 * 1024,
        "kb" | "kilobytes" | "kilobyte" | "kilob" => bytes * 1024,
        _ => bytes,
    }
}

/// Generates a payload carrying a string prefix padded with random bytes
/// up to the requested size token. If the size is smaller than the prefix,
/// the payload is the prefix alone. Returns the payload and the padded size.
pub fn gen_payload(prefix: &str, size: &str) -> (Vec<u8>, usize) {
    let total = num_of_bytes(size);
    if prefix.len() > total {
        return (prefix.as_bytes().to_vec(), total);
    }

    let padding = total - prefix.len();
    let mut payload = Vec::with_capacity(total);
    payload.extend_from_slice(prefix.as_bytes());
    payload.extend_from_slice(&rand_letter_bytes(padding));
    (payload, padding)
}

/// Generates the batch of payloads for one probe run. Each payload carries
/// the literal prefix `<prefix>-<i>-` followed by random padding sized by
/// the token at position min(i, len-1). Returns the payloads and the
/// maximum padded payload size.
pub fn all_msg_payloads(
    prefix: &str,
    payload_sizes: &[String],
    num_of_msg: usize,
) -> (Vec<Vec<u8>>, usize) {
    let specified = payload_sizes.len();
    let actual_num = specified.max(num_of_msg).max(1);

    let default_sizes = vec!["0".to_string()];
    let sizes: &[String] = if specified == 0 {
        &default_sizes
    } else {
        payload_sizes
    };

    let mut max_payload_size = prefix.len();
    let mut payloads = Vec::with_capacity(actual_num);
    for i in 0..actual_num {
        let size_index = i.min(sizes.len() - 1);
        let pre = format!("{prefix}{PREFIX_DELIMITER}{i}{PREFIX_DELIMITER}");
        let (payload, size) = gen_payload(&pre, &sizes[size_index]);
        max_payload_size = max_payload_size.max(size);
        payloads.push(payload);
    }

    (payloads, max_payload_size)
}

/// Parses the message index back out of a received payload. None when the
/// prefix does not match or the index part is not an integer.
pub fn get_message_id(prefix: &str, payload: &str) -> Option<usize> {
    let mut parts = payload.split(PREFIX_DELIMITER);
    if parts.next() != Some(prefix) {
        return None;
    }
    parts.next()?.parse().ok()
}

/// The payload the consumer side should expect. A `$`-prefixed suffix
/// appends to the produced payload, which lets a Pulsar-function test
/// expect the function's output rather than its input.
pub fn expected_message(payload: &str, expected: &str) -> String {
    match expected.strip_prefix('$') {
        Some(suffix) => format!("{payload}{suffix}"),
        None => payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_bytes_are_random_letters() {
        let a = rand_letter_bytes(8);
        let b = rand_letter_bytes(8);
        assert_eq!(a.len(), 8);
        assert!(a.iter().all(|c| c.is_ascii_alphabetic()));
        let c = rand_letter_bytes(4096);
        let d = rand_letter_bytes(4096);
        assert_ne!(c, d, "payloads are random");
    }

    #[test]
    fn size_token_units() {
        assert_eq!(num_of_bytes("15B"), 15);
        assert_eq!(num_of_bytes("20"), 20);
        assert_eq!(num_of_bytes("2KB"), 2 * 1024);
        assert_eq!(num_of_bytes("1MB"), 1024 * 1024);
        assert_eq!(num_of_bytes("junk"), 0);
    }

    #[test]
    fn gen_multiple_same_payload_size() {
        // single payload size specified with 13 messages
        let (msgs, _) = all_msg_payloads("messageid", &["20B".to_string()], 13);
        assert_eq!(msgs.len(), 13);
        for (i, msg) in msgs.iter().enumerate() {
            assert_eq!(msg.len(), 20, "individual message size");
            let text = String::from_utf8(msg.clone()).unwrap();
            assert_eq!(get_message_id("messageid", &text), Some(i));
        }
    }

    #[test]
    fn gen_more_sizes_than_messages() {
        let sizes: Vec<String> = ["20B", "400B", "25B", "2B", "1KB"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (msgs, _) = all_msg_payloads("aid", &sizes, 3);
        assert_eq!(msgs.len(), 5);
        for (i, msg) in msgs.iter().enumerate() {
            let text = String::from_utf8(msg.clone()).unwrap();
            assert_eq!(get_message_id("aid", &text), Some(i));
        }
    }

    #[test]
    fn gen_single_payload() {
        let (msgs, _) = all_msg_payloads("messageid", &["2KB".to_string()], 0);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].len(), 2 * 1024);
        let text = String::from_utf8(msgs[0].clone()).unwrap();
        assert_eq!(get_message_id("messageid", &text), Some(0));
    }

    #[test]
    fn gen_default_single_payload() {
        // neither payload sizes nor a message count
        let (msgs, _) = all_msg_payloads("yours", &[], 0);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].len(), "yours-0-".len());
        let text = String::from_utf8(msgs[0].clone()).unwrap();
        assert_eq!(get_message_id("yours", &text), Some(0));
    }

    #[test]
    fn gen_many_default_payload_size() {
        let (msgs, _) = all_msg_payloads("your", &[], 1002);
        assert_eq!(msgs.len(), 1002);
        for (i, msg) in msgs.iter().enumerate() {
            assert!(msg.len() < 12);
            let text = String::from_utf8(msg.clone()).unwrap();
            assert_eq!(get_message_id("your", &text), Some(i));
        }
    }

    #[test]
    fn message_id_rejects_foreign_payloads() {
        assert_eq!(get_message_id("messageid", "other-3-xyz"), None);
        assert_eq!(get_message_id("messageid", "messageid-x-"), None);
        assert_eq!(get_message_id("messageid", "messageid"), None);
    }

    #[test]
    fn expected_message_suffix_transform() {
        assert_eq!(expected_message("payload", ""), "payload");
        assert_eq!(expected_message("payload", "$-out"), "payload-out");
        assert_eq!(expected_message("payload", "literal"), "payload");
    }
}
