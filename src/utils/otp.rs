// src/utils/otp.rs
use nanoid::nanoid;

const DIGITS: [char; 10] = ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];

/// Generate a numeric one-time code.
pub fn generate_numeric_otp() -> String {
    nanoid!(4, &DIGITS)
}

/// Length-aware comparison that does not short-circuit on the first mismatch.
pub fn otp_matches(expected: &str, submitted: &str) -> bool {
    let submitted = submitted.trim();
    if expected.len() != submitted.len() {
        return false;
    }
    expected
        .bytes()
        .zip(submitted.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
