use chrono::NaiveDate;
use rand::Rng;

/// Unambiguous characters: no 0/O, 1/I.
const ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
const DISAMBIGUATOR_LEN: usize = 8;

/// Produces candidate booking numbers. Uniqueness is checked by the engine, which
/// draws again on collision.
pub trait BookingNumberSource: Send + Sync {
    fn generate(&self, prefix: &str, date: NaiveDate) -> String;
}

/// `{prefix}-{YYYYMMDD}-{8 random chars}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBookingNumbers;

impl BookingNumberSource for RandomBookingNumbers {
    fn generate(&self, prefix: &str, date: NaiveDate) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..DISAMBIGUATOR_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        format!("{prefix}-{}-{suffix}", date.format("%Y%m%d"))
    }
}
