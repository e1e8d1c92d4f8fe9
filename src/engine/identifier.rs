use rand::{thread_rng, Rng};

/// Uppercase letters and digits
pub const CARD_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default code length: 36^8 ≈ 2.8e12 identifiers
pub const DEFAULT_CODE_LENGTH: usize = 8;

/// Source of candidate card codes. Uniqueness is checked by the caller
/// against the store, so implementations may repeat themselves.
pub trait CodeGenerator: Send + Sync {
    fn next_code(&self) -> String;
}

#[derive(Debug, Clone, Copy)]
pub struct RandomCodeGenerator {
    length: usize,
}

impl RandomCodeGenerator {
    pub fn new(length: usize) -> Self {
        Self { length: length.max(4) }
    }
}

impl Default for RandomCodeGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_LENGTH)
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn next_code(&self) -> String {
        let mut rng = thread_rng();
        (0..self.length)
            .map(|_| CARD_CODE_ALPHABET[rng.gen_range(0..CARD_CODE_ALPHABET.len())] as char)
            .collect()
    }
}

/// Accepts codes as typed on a public URL: right alphabet, sane length
pub fn is_well_formed(code: &str) -> bool {
    (4..=32).contains(&code.len()) && code.bytes().all(|b| CARD_CODE_ALPHABET.contains(&b))
}
