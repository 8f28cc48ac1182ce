//! Participant identifiers: ten ASCII alphanumerics.

use rand::distributions::Alphanumeric;
use rand::Rng;

pub const UID_LEN: usize = 10;

pub fn is_valid_uid(uid: &str) -> bool {
    uid.len() == UID_LEN && uid.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Draw a fresh id that does not occur in any stored destination name.
pub fn generate_uid<R: Rng + ?Sized>(rng: &mut R, destinations: &[String]) -> String {
    loop {
        let uid: String = (0..UID_LEN).map(|_| rng.sample(Alphanumeric) as char).collect();
        if !destinations.iter().any(|d| d.contains(&uid)) {
            return uid;
        }
    }
}
