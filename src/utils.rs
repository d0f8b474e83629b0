use actix_web::{http::header, HttpResponse};
use argon2::{
    password_hash::{
        rand_core::OsRng, Error as PasswordHashError, PasswordHash, PasswordHasher,
        PasswordVerifier, SaltString,
    },
    Argon2,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

pub const MIN_PASSWORD_LEN: usize = 12;
pub const MAX_PASSWORD_LEN: usize = 128;
/// Largest stock or sale quantity accepted; matches the CHECK constraints.
pub const MAX_QUANTITY: i64 = i32::MAX as i64;

// Characters left as-is in a `next` query value.
const NEXT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

lazy_static! {
    // Hash checked against when a login names an unknown user.
    static ref UNKNOWN_USER_HASH: Option<String> =
        hash_password("unknown user placeholder").ok();
}

pub fn hash_password(password: &str) -> Result<String, PasswordHashError> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

/// Checks `provided` against a PHC hash string. A mismatch is `Ok(false)`;
/// only a malformed hash is an error.
pub fn verify_password(provided: &str, stored_hash: &str) -> Result<bool, PasswordHashError> {
    let parsed = PasswordHash::new(stored_hash)?;
    match Argon2::default().verify_password(provided.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(PasswordHashError::Password) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Spends the same argon2 work as [`verify_password`] for a username that
/// does not exist. Always `false`.
pub fn verify_unknown_user(provided: &str) -> bool {
    if let Some(hash) = UNKNOWN_USER_HASH.as_deref() {
        let _ = verify_password(provided, hash);
    }
    false
}

/// Returns the user-facing reason a new password is rejected.
pub fn password_problem(password: &str, confirmation: &str) -> Option<&'static str> {
    if password != confirmation {
        return Some("Passwords do not match!");
    }
    if password.len() < MIN_PASSWORD_LEN {
        return Some("Password must be at least 12 characters long!");
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Some("Password must be at most 128 characters long!");
    }
    None
}

/// Parses a form quantity in `0..=MAX_QUANTITY`. Surrounding whitespace is
/// ignored.
pub fn parse_quantity(raw: &str) -> Option<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|q| (0..=MAX_QUANTITY).contains(q))
}

/// Only local absolute paths are followed after login.
pub fn safe_next(next: Option<&str>) -> &str {
    match next {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path
        }
        _ => "/",
    }
}

/// The login page, returning to `next` afterwards.
pub fn login_path(next: &str) -> String {
    format!("/login?next={}", utf8_percent_encode(next, NEXT_ENCODE_SET))
}

pub fn see_other(location: &str) -> HttpResponse {
    HttpResponse::SeeOther()
        .append_header((header::LOCATION, location))
        .finish()
}
