use rand::Rng;

const HEX: &[u8] = b"0123456789abcdef";
const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// `chatcmpl-` + 24 hex characters.
pub fn new_chat_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..24).map(|_| HEX[rng.gen_range(0..HEX.len())] as char).collect();
    format!("chatcmpl-{suffix}")
}

/// `call_` + 24 characters from [A-Za-z0-9].
pub fn new_call_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..24)
        .map(|_| ALNUM[rng.gen_range(0..ALNUM.len())] as char)
        .collect();
    format!("call_{suffix}")
}

/// `fp_ollama_` + the model name reduced to [a-z0-9].
pub fn system_fingerprint(model: &str) -> String {
    let sanitized: String = model
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect();
    format!("fp_ollama_{sanitized}")
}

pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_shape() {
        let id = new_chat_id();
        assert!(id.starts_with("chatcmpl-"));
        let suffix = &id["chatcmpl-".len()..];
        assert_eq!(suffix.len(), 24);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn call_id_shape() {
        let id = new_call_id();
        assert!(id.starts_with("call_"));
        let suffix = &id["call_".len()..];
        assert_eq!(suffix.len(), 24);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn fingerprint_strips_everything_but_lower_alnum() {
        assert_eq!(system_fingerprint("Llama-3.1:8B"), "fp_ollama_lama318");
        assert_eq!(system_fingerprint("qwen2"), "fp_ollama_qwen2");
    }
}
